// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::reactor::Reactor;
use crate::trace::TraceCallback;
use core::any::Any;
use core::fmt;
use core::num::NonZeroUsize;
use std::sync::Arc;

/// Hard cap on the worker pool size.
pub const MAX_WORKERS: usize = 255;

/// Opaque user data shared with every worker, retrievable from task
/// callbacks via [`context`](crate::context) and passed to the trace
/// callback.
pub type Context = Arc<dyn Any + Send + Sync>;

/// Scheduler configuration for [`run`](crate::run).
pub struct Config {
    /// Worker threads to spawn. Defaults to the detected CPU parallelism,
    /// capped at [`MAX_WORKERS`].
    pub max_workers: Option<NonZeroUsize>,
    /// Stack size hint for worker threads; `None` leaves the choice to the
    /// OS.
    pub stack_size: Option<NonZeroUsize>,
    /// Run-loop ticks between forced checks of the global injector, so
    /// externally submitted tasks cannot be starved by local work.
    pub task_poll_interval: u32,
    /// Run-loop ticks between non-blocking reactor polls.
    pub event_poll_interval: u32,
    /// Observer for worker lifecycle and execution events.
    pub trace_callback: Option<TraceCallback>,
    /// User data exposed through [`context`](crate::context).
    pub context: Option<Context>,
    /// External event source; see [`Reactor`].
    pub reactor: Option<Box<dyn Reactor>>,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            max_workers: None,
            stack_size: None,
            // Prime, so the two fairness ticks drift apart instead of
            // landing on the same iterations.
            task_poll_interval: 61,
            event_poll_interval: 61,
            trace_callback: None,
            context: None,
            reactor: None,
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("max_workers", &self.max_workers)
            .field("stack_size", &self.stack_size)
            .field("task_poll_interval", &self.task_poll_interval)
            .field("event_poll_interval", &self.event_poll_interval)
            .field("trace_callback", &self.trace_callback)
            .field("context", &self.context.as_ref().map(|_| ".."))
            .field("reactor", &self.reactor.as_ref().map(|_| ".."))
            .finish()
    }
}
