// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::config::{Config, Context, MAX_WORKERS};
use crate::error::RunError;
use crate::idle::Idle;
use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::queue::Injector;
use crate::reactor::Reactor;
use crate::task::{Batch, TaskRef};
use crate::trace::{TraceCallback, TraceEvent};
use crate::worker::{self, Worker};
use core::fmt;
use std::sync::Arc;
use std::thread;

/// Shared state of one running scheduler: the dense worker array, the global
/// injector external threads submit through, and the idle coordinator.
///
/// Built by [`run`], shared via `Arc` between the worker threads and any
/// [`Handle`]s, and torn down when `run` returns.
pub(crate) struct Scheduler {
    pub(crate) workers: Box<[Worker]>,
    pub(crate) injector: Injector,
    pub(crate) idle: Idle,
    pub(crate) task_poll_interval: u32,
    pub(crate) event_poll_interval: u32,
    pub(crate) reactor: Option<Box<dyn Reactor>>,
    /// True while some worker is blocked inside `Reactor::poll`; at most one
    /// worker drives the reactor at a time.
    pub(crate) reactor_driver: AtomicBool,
    trace_callback: Option<TraceCallback>,
    context: Option<Context>,
}

impl Scheduler {
    /// Wake one idle worker, if the coordinator picks one. The chosen worker
    /// comes back up holding the waking role.
    pub(crate) fn notify(&self, is_waking: bool) {
        if let Some(index) = self.idle.notify(is_waking) {
            let worker = &self.workers[index];
            worker.unparked.store(true, Ordering::Release);
            worker.event.set();
            return;
        }

        // Nobody was woken. If a worker is blocked driving the reactor, kick
        // it out so the new work is not stuck behind the reactor's timers.
        if self.reactor_driver.load(Ordering::Acquire) {
            if let Some(reactor) = self.reactor.as_deref() {
                reactor.notify(false);
            }
        }
    }

    /// Request shutdown. The first caller broadcasts the wakeup; everyone
    /// else is a no-op.
    pub(crate) fn shutdown(&self) {
        if self.idle.shutdown() {
            tracing::debug!("shutdown requested");
            self.broadcast_shutdown();
        }
    }

    /// Wake every worker and the reactor so the terminal state is observed.
    pub(crate) fn broadcast_shutdown(&self) {
        if let Some(reactor) = self.reactor.as_deref() {
            reactor.notify(true);
        }
        for worker in &self.workers {
            worker.event.set();
        }
    }

    /// Whether any queue anywhere holds a runnable task. O(workers); only
    /// used on the parking slow path.
    pub(crate) fn has_pending(&self) -> bool {
        // Full barrier so a worker that just published itself idle cannot
        // read queue state from before a producer's push-then-notify.
        crate::loom::sync::atomic::fence(Ordering::SeqCst);

        self.injector.pending()
            || self
                .workers
                .iter()
                .any(|worker| !worker.run_buffer.is_empty() || worker.injector.pending())
    }

    /// Push onto the calling worker's local queue.
    ///
    /// # Safety
    ///
    /// The caller must be worker `index`'s thread.
    pub(crate) unsafe fn schedule_local(&self, index: usize, task: TaskRef) {
        let worker = &self.workers[index];
        // Safety: forwarded precondition.
        unsafe {
            worker
                .run_buffer
                .push(Batch::from_task(task), &worker.injector);
        }
        self.notify(false);
    }

    /// Install `task` in the calling worker's run-next slot; a displaced
    /// occupant is demoted to the local queue.
    ///
    /// # Safety
    ///
    /// The caller must be worker `index`'s thread.
    pub(crate) unsafe fn schedule_next_local(&self, index: usize, task: TaskRef) {
        let worker = &self.workers[index];
        let prev = worker
            .run_next
            .swap(task.as_ptr().as_ptr(), Ordering::Relaxed);
        if let Some(prev) = core::ptr::NonNull::new(prev) {
            // Safety: forwarded precondition; the slot held a live task.
            unsafe {
                let displaced = TaskRef::new(prev);
                worker
                    .run_buffer
                    .push(Batch::from_task(displaced), &worker.injector);
            }
            self.notify(false);
        }
    }

    /// Submit through the global injector (external threads, or workers
    /// without a cheaper path).
    pub(crate) fn schedule_remote(&self, task: TaskRef) {
        self.injector.push(Batch::from_task(task));
        self.notify(false);
    }

    /// Submit targeted at a specific worker. `caller` is the submitting
    /// worker's own index, if the submitter is a worker.
    pub(crate) fn schedule_to(&self, caller: Option<usize>, target: usize, task: TaskRef) {
        assert!(
            target < self.workers.len(),
            "schedule_to: no worker {target} in a pool of {}",
            self.workers.len()
        );

        if caller == Some(target) {
            // Safety: `caller` is the running worker's own index, installed
            // by its thread-local guard.
            unsafe { self.schedule_local(target, task) };
            return;
        }

        let worker = &self.workers[target];
        worker.injector.push(Batch::from_task(task));
        // The event alone does not grant the wakeup (the target may not even
        // be parked); the notify decides who actually gets up.
        worker.event.set();
        self.notify(false);
    }

    pub(crate) fn trace(&self, event: TraceEvent) {
        if let Some(callback) = self.trace_callback {
            callback(&event, self.context.as_deref());
        }
    }

    pub(crate) fn context(&self) -> Option<&Context> {
        self.context.as_ref()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("workers", &self.workers.len())
            .field("idle", &self.idle)
            .finish()
    }
}

/// A cloneable reference to a running scheduler, for threads outside the
/// pool.
///
/// Obtained inside a task via [`handle`](crate::handle) and safe to send
/// anywhere; the scheduler it points at stays alive until the last handle
/// and worker are gone, though submissions after shutdown go nowhere.
#[derive(Clone, Debug)]
pub struct Handle(pub(crate) Arc<Scheduler>);

impl Handle {
    /// Enqueue `task` through the global injector and wake a worker for it.
    pub fn schedule(&self, task: TaskRef) {
        self.0.schedule_remote(task);
    }

    /// Enqueue `task` on a specific worker's overflow lane.
    ///
    /// # Panics
    ///
    /// Panics if `worker` is out of range.
    pub fn schedule_to(&self, worker: usize, task: TaskRef) {
        let caller =
            worker::with_current(|scheduler, index| Arc::ptr_eq(scheduler, &self.0).then_some(index))
                .flatten();
        self.0.schedule_to(caller, worker, task);
    }

    /// Request shutdown: wakes all workers, and no task callback starts
    /// after a worker has observed the request. Idempotent.
    pub fn shutdown(&self) {
        self.0.shutdown();
    }
}

/// Run a scheduler to completion.
///
/// Spawns the configured number of worker threads, schedules `main_task`
/// onto worker 0, and blocks until a shutdown request has stopped every
/// worker. Tasks still queued when shutdown lands are never started; they
/// remain untouched caller-owned memory.
///
/// # Errors
///
/// Configuration problems and worker spawn failures are returned before any
/// task has necessarily run; on spawn failure, already-spawned workers are
/// shut down and joined first.
///
/// # Panics
///
/// Panics when called from inside a scheduler worker. If a task callback
/// panics, the scheduler shuts down and the payload is re-raised from `run`
/// once every worker has exited.
pub fn run(config: Config, main_task: TaskRef) -> Result<(), RunError> {
    assert!(
        worker::with_current(|_, _| ()).is_none(),
        "run called from a scheduler worker"
    );

    if config.task_poll_interval == 0 || config.event_poll_interval == 0 {
        return Err(RunError::PollInterval);
    }

    let worker_count = match config.max_workers {
        Some(requested) => {
            if requested.get() > MAX_WORKERS {
                return Err(RunError::TooManyWorkers(requested.get()));
            }
            requested.get()
        }
        None => thread::available_parallelism()
            .map(core::num::NonZeroUsize::get)
            .unwrap_or(1)
            .min(MAX_WORKERS),
    };

    let scheduler = Arc::new(Scheduler {
        workers: (0..worker_count).map(Worker::new).collect(),
        injector: Injector::new(),
        idle: Idle::new(worker_count),
        task_poll_interval: config.task_poll_interval,
        event_poll_interval: config.event_poll_interval,
        reactor: config.reactor,
        reactor_driver: AtomicBool::new(false),
        trace_callback: config.trace_callback,
        context: config.context,
    });

    tracing::debug!(workers = worker_count, "starting scheduler");

    // Safety: no worker thread exists yet, so this thread stands in as
    // worker 0's owner for the seeding push.
    unsafe {
        scheduler.workers[0]
            .run_buffer
            .push(Batch::from_task(main_task), &scheduler.workers[0].injector);
    }

    let mut joins = Vec::with_capacity(worker_count);
    for index in 0..worker_count {
        let mut builder = thread::Builder::new().name(format!("forage-worker-{index}"));
        if let Some(stack_size) = config.stack_size {
            builder = builder.stack_size(stack_size.get());
        }

        let worker_scheduler = Arc::clone(&scheduler);
        match builder.spawn(move || worker::run(worker_scheduler, index)) {
            Ok(join) => joins.push(join),
            Err(err) => {
                tracing::error!(worker = index, "failed to spawn worker: {err}");
                scheduler.shutdown();
                for join in joins {
                    let _ = join.join();
                }
                return Err(RunError::Spawn(err));
            }
        }
    }

    let mut panic_payload = None;
    for join in joins {
        if let Err(payload) = join.join() {
            panic_payload.get_or_insert(payload);
        }
    }

    if let Some(payload) = panic_payload {
        std::panic::resume_unwind(payload);
    }

    Ok(())
}

#[cfg(test)]
#[cfg(not(loom))]
mod tests {
    use super::*;
    use crate::task::Task;
    use crate::loom::lazy_static;
    use core::any::Any;
    use core::num::NonZeroUsize;
    use std::sync::Mutex;
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    fn workers(n: usize) -> Config {
        Config {
            max_workers: NonZeroUsize::new(n),
            ..Config::default()
        }
    }

    #[test]
    fn single_task() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_names(true)
            .set_default();

        static EXECUTED: AtomicUsize = AtomicUsize::new(0);
        static STARTS: AtomicUsize = AtomicUsize::new(0);
        static EXECUTES: AtomicUsize = AtomicUsize::new(0);
        static STOPS: AtomicUsize = AtomicUsize::new(0);
        static MAIN: Task = Task::new(hello);

        fn hello(_task: TaskRef, worker: &Worker) {
            assert_eq!(crate::current_worker_id(), worker.index());

            let context = crate::context().expect("context was configured");
            assert_eq!(context.downcast_ref::<usize>(), Some(&42));

            EXECUTED.fetch_add(1, Ordering::Relaxed);
            crate::shutdown();
        }

        fn record(event: &TraceEvent, _context: Option<&(dyn Any + Send + Sync)>) {
            match event {
                TraceEvent::WorkerStart { .. } => STARTS.fetch_add(1, Ordering::Relaxed),
                TraceEvent::WorkerExecute { .. } => EXECUTES.fetch_add(1, Ordering::Relaxed),
                TraceEvent::WorkerStop { .. } => STOPS.fetch_add(1, Ordering::Relaxed),
                _ => 0,
            };
        }

        let config = Config {
            trace_callback: Some(record),
            context: Some(Arc::new(42_usize)),
            ..workers(2)
        };
        // Safety: `MAIN` is static and queued exactly once.
        run(config, unsafe { TaskRef::from_static(&MAIN) }).unwrap();

        assert_eq!(EXECUTED.load(Ordering::Relaxed), 1);
        assert_eq!(EXECUTES.load(Ordering::Relaxed), 1);
        assert_eq!(STARTS.load(Ordering::Relaxed), 2);
        assert_eq!(STOPS.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn fan_out() {
        const TASKS: usize = 10_000;

        static COUNT: AtomicUsize = AtomicUsize::new(0);
        static MAIN: Task = Task::new(spawn_all);
        lazy_static! {
            static ref WORK: Vec<Task> = (0..TASKS).map(|_| Task::new(work)).collect();
        }

        fn spawn_all(_task: TaskRef, _worker: &Worker) {
            for task in WORK.iter() {
                // Safety: the lazy static lives forever and each task is
                // queued exactly once.
                crate::schedule(unsafe { TaskRef::from_static(task) });
            }
        }

        fn work(_task: TaskRef, _worker: &Worker) {
            if COUNT.fetch_add(1, Ordering::Relaxed) + 1 == TASKS {
                crate::shutdown();
            }
        }

        // Safety: see above.
        run(workers(4), unsafe { TaskRef::from_static(&MAIN) }).unwrap();

        assert_eq!(COUNT.load(Ordering::Relaxed), TASKS);
    }

    #[test]
    fn single_worker_overflow() {
        // 10_000 tasks through a 256-slot ring forces the overflow lane.
        const TASKS: usize = 10_000;

        static COUNT: AtomicUsize = AtomicUsize::new(0);
        static MAIN: Task = Task::new(spawn_all);
        lazy_static! {
            static ref WORK: Vec<Task> = (0..TASKS).map(|_| Task::new(work)).collect();
        }

        fn spawn_all(_task: TaskRef, _worker: &Worker) {
            for task in WORK.iter() {
                // Safety: see `fan_out`.
                crate::schedule(unsafe { TaskRef::from_static(task) });
            }
        }

        fn work(_task: TaskRef, _worker: &Worker) {
            if COUNT.fetch_add(1, Ordering::Relaxed) + 1 == TASKS {
                crate::shutdown();
            }
        }

        // Safety: see `fan_out`.
        run(workers(1), unsafe { TaskRef::from_static(&MAIN) }).unwrap();

        assert_eq!(COUNT.load(Ordering::Relaxed), TASKS);
    }

    #[test]
    fn peer_steals_from_a_loaded_worker() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_names(true)
            .set_default();

        const TASKS: usize = 500;

        static DONE: AtomicUsize = AtomicUsize::new(0);
        static BY_PEER: AtomicUsize = AtomicUsize::new(0);
        static MAIN: Task = Task::new(seed);
        lazy_static! {
            static ref WORK: Vec<Task> = (0..TASKS).map(|_| Task::new(spin_work)).collect();
        }

        fn seed(_task: TaskRef, worker: &Worker) {
            assert_eq!(worker.index(), 0);
            for task in WORK.iter() {
                // Everything lands in worker 0's local queue; worker 1 can
                // only get tasks by stealing.
                // Safety: see `fan_out`.
                crate::schedule_to(0, unsafe { TaskRef::from_static(task) });
            }
        }

        fn spin_work(_task: TaskRef, worker: &Worker) {
            for i in 0..2_000_u64 {
                core::hint::black_box(i);
            }
            if worker.index() == 1 {
                BY_PEER.fetch_add(1, Ordering::Relaxed);
            }
            if DONE.fetch_add(1, Ordering::Relaxed) + 1 == TASKS {
                crate::shutdown();
            }
        }

        // Safety: see `fan_out`.
        run(workers(2), unsafe { TaskRef::from_static(&MAIN) }).unwrap();

        assert_eq!(DONE.load(Ordering::Relaxed), TASKS);
        assert!(
            BY_PEER.load(Ordering::Relaxed) >= 1,
            "worker 1 never stole anything"
        );
    }

    #[test]
    fn external_producer_wakes_parked_workers() {
        const TASKS: usize = 10;

        static HANDLE: OnceLock<Handle> = OnceLock::new();
        static COUNT: AtomicUsize = AtomicUsize::new(0);
        static PARKS: AtomicUsize = AtomicUsize::new(0);
        static UNPARKS: AtomicUsize = AtomicUsize::new(0);
        static MAIN: Task = Task::new(export_handle);
        lazy_static! {
            static ref WORK: Vec<Task> = (0..TASKS).map(|_| Task::new(work)).collect();
        }

        fn export_handle(_task: TaskRef, _worker: &Worker) {
            HANDLE.set(crate::handle()).expect("handle already set");
        }

        fn work(_task: TaskRef, _worker: &Worker) {
            COUNT.fetch_add(1, Ordering::Relaxed);
        }

        fn record(event: &TraceEvent, _context: Option<&(dyn Any + Send + Sync)>) {
            match event {
                TraceEvent::WorkerPark { .. } => PARKS.fetch_add(1, Ordering::Relaxed),
                TraceEvent::WorkerUnpark { .. } => UNPARKS.fetch_add(1, Ordering::Relaxed),
                _ => 0,
            };
        }

        let producer = std::thread::spawn(|| {
            let handle = loop {
                if let Some(handle) = HANDLE.get() {
                    break handle.clone();
                }
                std::thread::yield_now();
            };

            for task in WORK.iter() {
                // Slow enough that the pool goes fully idle in between.
                std::thread::sleep(Duration::from_millis(10));
                // Safety: see `fan_out`.
                handle.schedule(unsafe { TaskRef::from_static(task) });
            }

            while COUNT.load(Ordering::Relaxed) < TASKS {
                std::thread::yield_now();
            }
            handle.shutdown();
        });

        let config = Config {
            trace_callback: Some(record),
            ..workers(4)
        };
        // Safety: see `fan_out`.
        run(config, unsafe { TaskRef::from_static(&MAIN) }).unwrap();
        producer.join().unwrap();

        assert_eq!(COUNT.load(Ordering::Relaxed), TASKS);
        assert!(PARKS.load(Ordering::Relaxed) >= 1);
        assert!(UNPARKS.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn shutdown_under_load_stops_promptly() {
        const SEEDS: usize = 16;
        const LIMIT: usize = 50_000;
        const WORKERS: usize = 4;

        static TOTAL: AtomicUsize = AtomicUsize::new(0);
        static MAIN: Task = Task::new(seed_all);
        lazy_static! {
            static ref CHURN: Vec<Task> = (0..SEEDS).map(|_| Task::new(churn)).collect();
        }

        fn seed_all(_task: TaskRef, _worker: &Worker) {
            for task in CHURN.iter() {
                // Safety: see `fan_out`.
                crate::schedule(unsafe { TaskRef::from_static(task) });
            }
        }

        // Every execution requeues the task, so the load never drains on
        // its own; only shutdown ends the run.
        fn churn(task: TaskRef, _worker: &Worker) {
            let n = TOTAL.fetch_add(1, Ordering::Relaxed) + 1;
            match n.cmp(&LIMIT) {
                core::cmp::Ordering::Less => crate::schedule(task),
                core::cmp::Ordering::Equal => crate::shutdown(),
                core::cmp::Ordering::Greater => {}
            }
        }

        // Safety: see `fan_out`.
        run(workers(WORKERS), unsafe { TaskRef::from_static(&MAIN) }).unwrap();

        let total = TOTAL.load(Ordering::Relaxed);
        assert!(total >= LIMIT);
        // Each worker may finish the one task it was already committed to
        // when shutdown landed, nothing more.
        assert!(
            total <= LIMIT + 4 * WORKERS,
            "{} tasks ran after the shutdown request",
            total - LIMIT
        );
    }

    #[test]
    fn run_next_runs_before_the_local_queue() {
        static ORDER: Mutex<Vec<&'static str>> = Mutex::new(Vec::new());
        static MAIN: Task = Task::new(seed);
        static FIFO: Task = Task::new(fifo);
        static NEXT: Task = Task::new(next);

        fn seed(_task: TaskRef, _worker: &Worker) {
            // Safety: statics, each queued once.
            unsafe {
                crate::schedule(TaskRef::from_static(&FIFO));
                crate::schedule_next(TaskRef::from_static(&NEXT));
            }
        }

        fn next(_task: TaskRef, _worker: &Worker) {
            ORDER.lock().unwrap().push("next");
        }

        fn fifo(_task: TaskRef, _worker: &Worker) {
            ORDER.lock().unwrap().push("fifo");
            crate::shutdown();
        }

        // Safety: see `fan_out`.
        run(workers(1), unsafe { TaskRef::from_static(&MAIN) }).unwrap();

        assert_eq!(*ORDER.lock().unwrap(), ["next", "fifo"]);
    }

    #[test]
    fn reactor_tasks_are_polled_in() {
        use crate::reactor::{Deadline, Reactor};
        use crate::task::Batch;
        use std::sync::atomic::AtomicBool;

        static EXECUTED: AtomicBool = AtomicBool::new(false);
        static MAIN: Task = Task::new(|_task, _worker| {});
        static READY: Task = Task::new(from_reactor);

        fn from_reactor(_task: TaskRef, _worker: &Worker) {
            EXECUTED.store(true, Ordering::Relaxed);
            crate::shutdown();
        }

        struct OneShot {
            fired: AtomicBool,
        }

        impl Reactor for OneShot {
            fn poll(&self, _deadline: Deadline) -> Batch {
                if self.fired.swap(true, Ordering::Relaxed) {
                    Batch::new()
                } else {
                    // Safety: `READY` is static and handed out once.
                    Batch::from_task(unsafe { TaskRef::from_static(&READY) })
                }
            }

            fn notify(&self, _shutdown: bool) {}
        }

        let config = Config {
            reactor: Some(Box::new(OneShot {
                fired: AtomicBool::new(false),
            })),
            ..workers(2)
        };
        // Safety: see `fan_out`.
        run(config, unsafe { TaskRef::from_static(&MAIN) }).unwrap();

        assert!(EXECUTED.load(Ordering::Relaxed));
    }

    #[test]
    fn invalid_config_is_rejected() {
        static MAIN: Task = Task::new(|_task, _worker| {});

        let zero_interval = Config {
            task_poll_interval: 0,
            ..Config::default()
        };
        // Safety: `run` rejects the config before touching the task.
        let err = run(zero_interval, unsafe { TaskRef::from_static(&MAIN) });
        assert!(matches!(err, Err(RunError::PollInterval)));

        let too_many = Config {
            max_workers: NonZeroUsize::new(MAX_WORKERS + 1),
            ..Config::default()
        };
        // Safety: see above.
        let err = run(too_many, unsafe { TaskRef::from_static(&MAIN) });
        assert!(matches!(err, Err(RunError::TooManyWorkers(_))));
    }

    #[test]
    #[should_panic(expected = "worker")]
    fn schedule_off_worker_panics() {
        static TASK: Task = Task::new(|_task, _worker| {});
        // Safety: the call panics before the task is queued.
        crate::schedule(unsafe { TaskRef::from_static(&TASK) });
    }
}
