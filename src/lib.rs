// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A compact multi-threaded, work-stealing task scheduler.
//!
//! `forage` runs caller-owned [`Task`]s (a callback plus an intrusive link,
//! no allocation on the scheduler's part) across a fixed pool of worker
//! threads. Each worker owns a bounded local run queue and an unbounded
//! overflow lane; idle workers steal half of a busy peer's queue at a time,
//! and a single packed atomic word coordinates who searches, who sleeps, and
//! when the pool shuts down — at most one worker hunts for work at any
//! moment, so a burst of submissions never stampedes the whole pool awake.
//!
//! The surface is deliberately small: [`run`] a scheduler until someone
//! calls [`shutdown`], [`schedule`] tasks from inside, and hand a [`Handle`]
//! to threads outside. Tasks run to completion on the worker that dequeued
//! them; there are no priorities, deadlines, or join handles.
//!
//! ```
//! use forage::{Config, Task, TaskRef, Worker};
//!
//! static GREET: Task = Task::new(greet);
//!
//! fn greet(_task: TaskRef, worker: &Worker) {
//!     println!("hello from worker {}", worker.index());
//!     forage::shutdown();
//! }
//!
//! // Safety: `GREET` is static and queued exactly once.
//! forage::run(Config::default(), unsafe { TaskRef::from_static(&GREET) }).unwrap();
//! ```

mod config;
mod error;
mod idle;
mod loom;
mod park;
mod queue;
mod rand;
mod reactor;
mod scheduler;
mod task;
mod trace;
mod util;
mod worker;

pub use config::{Config, Context, MAX_WORKERS};
pub use error::RunError;
pub use reactor::{Deadline, Reactor};
pub use scheduler::{Handle, run};
pub use task::{Batch, Task, TaskCallback, TaskRef};
pub use trace::{TraceCallback, TraceEvent};
pub use worker::Worker;

/// Enqueue a task from inside the runtime, onto the calling worker's own
/// local queue.
///
/// External threads go through [`Handle::schedule`] instead.
///
/// # Panics
///
/// Panics when called from a thread that is not a scheduler worker.
pub fn schedule(task: TaskRef) {
    worker::with_current(|scheduler, index| {
        // Safety: `index` is the calling thread's own worker slot.
        unsafe { scheduler.schedule_local(index, task) }
    })
    .expect("forage::schedule called from outside a scheduler worker")
}

/// Mark `task` as the very next thing the calling worker should run, ahead
/// of its local queue. A task already occupying the slot is demoted to the
/// local queue.
///
/// # Panics
///
/// Panics when called from a thread that is not a scheduler worker.
pub fn schedule_next(task: TaskRef) {
    worker::with_current(|scheduler, index| {
        // Safety: `index` is the calling thread's own worker slot.
        unsafe { scheduler.schedule_next_local(index, task) }
    })
    .expect("forage::schedule_next called from outside a scheduler worker")
}

/// Enqueue a task targeted at a specific worker.
///
/// Targeting the calling worker is the same as [`schedule`]; any other
/// worker receives the task through its overflow lane and has its event set.
///
/// # Panics
///
/// Panics when called from a thread that is not a scheduler worker, or when
/// `worker` is out of range.
pub fn schedule_to(worker: usize, task: TaskRef) {
    self::worker::with_current(|scheduler, index| {
        scheduler.schedule_to(Some(index), worker, task);
    })
    .expect("forage::schedule_to called from outside a scheduler worker")
}

/// Request shutdown of the calling worker's scheduler.
///
/// All workers are woken; no task callback starts after a worker has
/// observed the request, and [`run`] returns once every worker has stopped.
/// External threads go through [`Handle::shutdown`] instead.
///
/// # Panics
///
/// Panics when called from a thread that is not a scheduler worker.
pub fn shutdown() {
    worker::with_current(|scheduler, _index| scheduler.shutdown())
        .expect("forage::shutdown called from outside a scheduler worker")
}

/// The calling worker's 0-based index in its scheduler.
///
/// # Panics
///
/// Panics when called from a thread that is not a scheduler worker.
pub fn current_worker_id() -> usize {
    worker::with_current(|_scheduler, index| index)
        .expect("forage::current_worker_id called from outside a scheduler worker")
}

/// The user context the calling worker's scheduler was configured with.
///
/// # Panics
///
/// Panics when called from a thread that is not a scheduler worker.
pub fn context() -> Option<Context> {
    worker::with_current(|scheduler, _index| scheduler.context().cloned())
        .expect("forage::context called from outside a scheduler worker")
}

/// A [`Handle`] to the calling worker's scheduler, for handing to external
/// threads.
///
/// # Panics
///
/// Panics when called from a thread that is not a scheduler worker.
pub fn handle() -> Handle {
    worker::with_current(|scheduler, _index| Handle(std::sync::Arc::clone(scheduler)))
        .expect("forage::handle called from outside a scheduler worker")
}
