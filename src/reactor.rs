// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::task::Batch;
use std::time::Instant;

/// How long a [`Reactor::poll`] call may block.
#[derive(Clone, Copy, Debug)]
pub enum Deadline {
    /// Return immediately, even if nothing is ready.
    Immediate,
    /// Block at most until the given instant.
    At(Instant),
    /// Block until something is ready or [`Reactor::notify`] is called.
    Never,
}

/// An external event source (I/O driver, timer wheel, ...) the scheduler
/// polls for ready tasks.
///
/// The scheduler treats the reactor as entirely opaque: every
/// `event_poll_interval` ticks each worker polls it with
/// [`Deadline::Immediate`], and when the pool runs out of work one worker at
/// a time blocks inside `poll(Deadline::Never)` instead of parking, trusting
/// the reactor to bound the wait by its own nearest timer. Ready tasks are
/// injected into the polling worker's local queue.
pub trait Reactor: Send + Sync {
    /// Collect tasks whose waits have completed.
    ///
    /// A [`Deadline::Never`] poll should return only once it has ready tasks
    /// or [`Reactor::notify`] was called; an implementation that returns
    /// empty batches eagerly costs latency but nothing worse, since the
    /// polling worker then parks like any other.
    ///
    /// Must be safe to call concurrently from several workers; a reactor
    /// that cannot serve parallel polls should return an empty batch for
    /// all but one of them.
    fn poll(&self, deadline: Deadline) -> Batch;

    /// Wake the thread blocked in [`Reactor::poll`].
    ///
    /// Must be sticky the way an event is: a notification arriving while no
    /// poll is in flight has to make the *next* blocking poll return
    /// promptly. `shutdown` is true when the scheduler is terminating; after
    /// that, every pending and future `poll` must return promptly.
    fn notify(&self, shutdown: bool);
}
