// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::config::MAX_WORKERS;
use core::fmt;
use std::io;

/// Errors reported by [`run`](crate::run) before or during scheduler
/// startup. Nothing that happens after the workers are up is surfaced here;
/// see the failure-semantics notes on [`run`](crate::run).
#[derive(Debug)]
pub enum RunError {
    /// A poll interval in the [`Config`](crate::Config) was zero.
    PollInterval,
    /// `max_workers` exceeded [`MAX_WORKERS`].
    TooManyWorkers(usize),
    /// Spawning a worker thread failed. Workers spawned before the failure
    /// have been shut down and joined.
    Spawn(io::Error),
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunError::PollInterval => f.write_str("poll intervals must be non-zero"),
            RunError::TooManyWorkers(requested) => {
                write!(f, "{requested} workers requested, at most {MAX_WORKERS} supported")
            }
            RunError::Spawn(err) => write!(f, "failed to spawn a worker thread: {err}"),
        }
    }
}

impl core::error::Error for RunError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            RunError::Spawn(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for RunError {
    fn from(err: io::Error) -> Self {
        RunError::Spawn(err)
    }
}
