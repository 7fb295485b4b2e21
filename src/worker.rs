// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::idle::Suspend;
use crate::loom::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use crate::park::Event;
use crate::queue::{Buffer, Injector};
use crate::rand::{Rng, Sequence};
use crate::reactor::Deadline;
use crate::scheduler::Scheduler;
use crate::task::{Task, TaskRef};
use crate::trace::TraceEvent;
use core::cell::RefCell;
use core::fmt;
use core::ptr::{self, NonNull};
use std::sync::Arc;

/// One worker's slot in the scheduler: its queues, its event, and its
/// identity. The OS thread driving it lives in the worker entry point.
pub struct Worker {
    pub(crate) index: usize,
    /// Bounded local run queue; owner pushes and pops, peers steal.
    pub(crate) run_buffer: Buffer,
    /// Single-slot "run this next" hint, consumed before the local queue.
    pub(crate) run_next: AtomicPtr<Task>,
    /// Overflow lane for a full `run_buffer` and landing pad for targeted
    /// remote submissions; drained by this worker and by stealers.
    pub(crate) injector: Injector,
    /// What the worker sleeps on while parked.
    pub(crate) event: Event,
    /// Set by `Scheduler::notify` when this worker is popped off the idle
    /// stack, so it can tell a real wakeup from a stray event set.
    pub(crate) unparked: AtomicBool,
}

impl Worker {
    pub(crate) fn new(index: usize) -> Worker {
        Worker {
            index,
            run_buffer: Buffer::new(),
            run_next: AtomicPtr::new(ptr::null_mut()),
            injector: Injector::new(),
            event: Event::new(),
            unparked: AtomicBool::new(false),
        }
    }

    /// The worker's 0-based position in its scheduler.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("index", &self.index)
            .field("queued", &self.run_buffer.len())
            .finish()
    }
}

std::thread_local! {
    static CURRENT: RefCell<Option<(Arc<Scheduler>, usize)>> = const { RefCell::new(None) };
}

/// Run `f` against the scheduler the calling thread is a worker of, or
/// return `None` when called from a non-worker thread.
pub(crate) fn with_current<T>(f: impl FnOnce(&Arc<Scheduler>, usize) -> T) -> Option<T> {
    CURRENT.with(|current| {
        let current = current.borrow();
        let (scheduler, index) = current.as_ref()?;
        Some(f(scheduler, *index))
    })
}

/// Marks the calling thread as a worker for the duration of its run.
struct CurrentGuard;

impl CurrentGuard {
    fn install(scheduler: &Arc<Scheduler>, index: usize) -> CurrentGuard {
        CURRENT.with(|current| {
            let prev = current
                .borrow_mut()
                .replace((Arc::clone(scheduler), index));
            debug_assert!(prev.is_none(), "nested worker threads");
        });
        CurrentGuard
    }
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| current.borrow_mut().take());
    }
}

/// Requests scheduler shutdown if a task callback unwinds, so the remaining
/// workers stop instead of waiting forever for work that will never come.
/// `run` re-raises the payload once every worker has been joined.
struct ShutdownOnPanic<'s> {
    scheduler: &'s Scheduler,
}

impl Drop for ShutdownOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!("worker panicked, shutting the scheduler down");
            self.scheduler.shutdown();
        }
    }
}

/// The worker thread entry point.
pub(crate) fn run(scheduler: Arc<Scheduler>, index: usize) {
    let _current = CurrentGuard::install(&scheduler, index);
    let _shutdown_on_panic = ShutdownOnPanic {
        scheduler: &scheduler,
    };
    let _span = tracing::debug_span!("worker main loop", worker = index).entered();

    let me = &scheduler.workers[index];
    let mut rng = Rng::for_worker(index as u16);
    let mut tick: u32 = 0;
    let mut is_waking = false;

    scheduler.trace(TraceEvent::WorkerStart { worker: index });
    tracing::debug!("worker started");

    'run: loop {
        // Shutdown is a barrier: no task may start once it is observed.
        if scheduler.idle.is_shutdown() {
            if let Suspend::Shutdown { last } = scheduler.idle.suspend(index, is_waking) {
                if last {
                    scheduler.broadcast_shutdown();
                }
            }
            break 'run;
        }

        tick = tick.wrapping_add(1);

        // Fairness: a worker with a deep local queue must still serve the
        // global injector and the reactor every so often.
        if tick % scheduler.task_poll_interval == 0 {
            if let Some(task) = scheduler.injector.poll_one() {
                is_waking = hand_off(&scheduler, is_waking);
                execute(&scheduler, me, task);
                continue 'run;
            }
        }
        if tick % scheduler.event_poll_interval == 0 {
            poll_reactor(&scheduler, me, Deadline::Immediate);
        }

        if let Some(task) = next_task(&scheduler, me, &mut rng) {
            is_waking = hand_off(&scheduler, is_waking);
            execute(&scheduler, me, task);
            continue 'run;
        }

        // Out of work. If a reactor is configured, one worker at a time
        // blocks inside it instead of parking, so external events and
        // timers still land while the pool is idle.
        if scheduler.reactor.is_some()
            && scheduler
                .reactor_driver
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            // Blocking with the waking role held would swallow wakeups for
            // work the reactor knows nothing about; give the role up first.
            if is_waking {
                is_waking = hand_off(&scheduler, is_waking);
            }

            let polled = poll_reactor(&scheduler, me, Deadline::Never);
            scheduler.reactor_driver.store(false, Ordering::Release);
            if polled {
                continue 'run;
            }
            // An empty return means the reactor was notified: shutdown is
            // caught at the top of the loop, new work by the re-check in
            // the suspend path below.
        }

        match scheduler.idle.suspend(index, is_waking) {
            Suspend::Notified => continue 'run,
            Suspend::Shutdown { last } => {
                if last {
                    scheduler.broadcast_shutdown();
                }
                break 'run;
            }
            Suspend::Wait => {
                is_waking = false;

                // We are published as idle now. Anything that arrived while
                // we were deciding to sleep may have skipped its wakeup
                // because we still looked busy, so re-check and re-notify.
                if scheduler.has_pending() {
                    scheduler.notify(false);
                }

                scheduler.trace(TraceEvent::WorkerPark { worker: index });
                tracing::trace!("parking");

                loop {
                    me.event.wait();

                    if me.unparked.swap(false, Ordering::AcqRel) {
                        // Chosen by notify; we wake holding the waking role.
                        is_waking = true;
                        break;
                    }

                    if scheduler.idle.is_shutdown() {
                        // Woken by the shutdown broadcast while still on the
                        // idle stack; we already count as retired.
                        scheduler.trace(TraceEvent::WorkerUnpark { worker: index });
                        break 'run;
                    }

                    // A stray event set (e.g. a targeted remote submission
                    // landed in our injector); the notify that came with it
                    // decides who wakes. Sleep again.
                }

                scheduler.trace(TraceEvent::WorkerUnpark { worker: index });
                tracing::trace!("unparked");
            }
        }
    }

    scheduler.trace(TraceEvent::WorkerStop { worker: index });
    tracing::debug!("worker stopped");
}

/// Find the next task to run: the `run_next` slot, then the local queue,
/// then our own overflow, then the global injector, then peers' queues in a
/// random order.
fn next_task(scheduler: &Scheduler, me: &Worker, rng: &mut Rng) -> Option<TaskRef> {
    let next = me.run_next.swap(ptr::null_mut(), Ordering::Relaxed);
    if let Some(task) = NonNull::new(next) {
        // Safety: the slot only ever holds pointers stored from live
        // `TaskRef`s by this worker.
        return Some(unsafe { TaskRef::new(task) });
    }

    // Safety: this thread is `me`'s owning worker.
    if let Some(task) = unsafe { me.run_buffer.pop() } {
        return Some(task);
    }

    // Safety: this thread is `me`'s owning worker, and the pop above just
    // reported the buffer empty.
    if let Some(task) = unsafe { me.run_buffer.fill_from(&me.injector) } {
        return Some(task);
    }

    // Safety: as above; the buffer is still empty because the drain before
    // it came up empty-handed.
    if let Some(task) = unsafe { me.run_buffer.fill_from(&scheduler.injector) } {
        return Some(task);
    }

    let workers = scheduler.workers.len();
    if workers > 1 {
        for slot in Sequence::new(rng, (workers - 1) as u32) {
            let mut victim_index = slot as usize;
            if victim_index >= me.index {
                victim_index += 1;
            }
            let victim = &scheduler.workers[victim_index];

            // Safety: this thread is `me`'s owning worker, and every drain
            // and steal attempt so far found the buffer empty.
            if let Some(task) = unsafe { me.run_buffer.steal_from(&victim.run_buffer, rng) } {
                tracing::trace!(victim = victim_index, "stole from peer run queue");
                return Some(task);
            }
            // An idle or busy peer may still have overflow queued.
            // Safety: as above.
            if let Some(task) = unsafe { me.run_buffer.fill_from(&victim.injector) } {
                tracing::trace!(victim = victim_index, "drained peer overflow");
                return Some(task);
            }
        }
    }

    None
}

/// Pass the waking role on before running a task, so a peer can search
/// while we execute.
fn hand_off(scheduler: &Scheduler, is_waking: bool) -> bool {
    if is_waking {
        scheduler.notify(true);
    }
    false
}

fn execute(scheduler: &Scheduler, me: &Worker, task: TaskRef) {
    scheduler.trace(TraceEvent::WorkerExecute {
        worker: me.index,
        task,
    });
    tracing::trace!(?task, "executing");
    (task.callback())(task, me);
}

/// Poll the reactor and queue whatever it returns. Returns `true` if it
/// produced tasks.
fn poll_reactor(scheduler: &Scheduler, me: &Worker, deadline: Deadline) -> bool {
    let Some(reactor) = scheduler.reactor.as_deref() else {
        return false;
    };

    let batch = reactor.poll(deadline);
    if batch.is_empty() {
        return false;
    }

    tracing::trace!("reactor produced ready tasks");
    // Safety: this thread is `me`'s owning worker.
    unsafe { me.run_buffer.push(batch, &me.injector) };
    scheduler.notify(false);
    true
}
