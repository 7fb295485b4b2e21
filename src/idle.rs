// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The idle/parking coordinator.
//!
//! All sleep/wake decisions for a scheduler funnel through one atomic word so
//! that every transition is a single CAS: which workers are parked (a LIFO
//! stack of worker indices, linked through a side array), whether one worker
//! currently holds the *waking* role (at most one worker searches for work at
//! a time, which is what prevents thundering-herd wakeups), whether a wakeup
//! was requested while nobody could take it, and whether the scheduler has
//! been shut down.

use crate::loom::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use core::fmt;
use mycelium_bitfield::{bitfield, enum_from_bits};
use static_assertions::const_assert;

// The packed word needs 50 bits before the tag.
const_assert!(core::mem::size_of::<usize>() >= 8);

bitfield! {
    /// A snapshot of the coordinator word.
    #[derive(Eq, PartialEq)]
    pub(crate) struct Snapshot<usize> {
        /// The coordinator's run state.
        const STATE: State;
        /// Number of workers currently holding the waking role (0 or 1).
        const WAKING = 16;
        /// Number of parked workers.
        const IDLE = 16;
        /// Top of the idle stack as `worker index + 1`; 0 when the stack is
        /// empty. The rest of each stack link lives in `Idle::links`.
        const IDLE_HEAD = 16;
        /// Bumped on every stack push and pop so a stale `IDLE_HEAD` cannot
        /// win a CAS (ABA).
        const TAG = ..;
    }
}

enum_from_bits! {
    /// The coordinator's run state.
    #[derive(Debug, Eq, PartialEq)]
    pub(crate) enum State<u8> {
        /// Workers are running; nobody is searching.
        Pending = 0b00,
        /// One worker holds the waking role and is searching for work.
        Waking = 0b01,
        /// A wakeup was requested while nobody was parked and nobody was
        /// searching; the next worker that tries to park absorbs it and
        /// keeps running instead.
        Notified = 0b10,
        /// Terminal.
        Shutdown = 0b11,
    }
}

/// Raw increment for the `TAG` field. The tag occupies the most significant
/// bits, so a wrapping add of this both bumps it and wraps it in place.
const TAG_ONE: usize = Snapshot::TAG.first_bit();

/// What a worker that found no work should do next.
#[derive(Debug, Eq, PartialEq)]
pub(crate) enum Suspend {
    /// A queued notification was absorbed; keep running without sleeping.
    Notified,
    /// Registered on the idle stack; park on the worker's event.
    Wait,
    /// The scheduler is shutting down; exit. `last` is set for the worker
    /// whose retirement made the pool quiescent.
    Shutdown { last: bool },
}

pub(crate) struct Idle {
    word: AtomicUsize,
    /// Idle stack links, `next worker index + 1`, valid while the owning
    /// worker is on the stack.
    links: Box<[AtomicU32]>,
    workers: usize,
}

impl Idle {
    pub(crate) fn new(workers: usize) -> Idle {
        Idle {
            word: AtomicUsize::new(0),
            links: (0..workers).map(|_| AtomicU32::new(0)).collect(),
            workers,
        }
    }

    pub(crate) fn snapshot(&self) -> Snapshot {
        Snapshot::from_bits(self.word.load(Ordering::SeqCst))
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.snapshot().get(Snapshot::STATE) == State::Shutdown
    }

    /// Signal that work may be available.
    ///
    /// Returns the index of a worker to unpark, if one was chosen. Callers
    /// must set that worker's unparked flag and event; the chosen worker
    /// wakes up already holding the waking role.
    ///
    /// A worker that holds the waking role and has found a task passes the
    /// role on through `notify(true)` before executing, so a peer can search
    /// in parallel.
    pub(crate) fn notify(&self, is_waking: bool) -> Option<usize> {
        self.transition(|s| {
            if s.get(Snapshot::STATE) == State::Shutdown {
                return None;
            }

            let mut waking = s.get(Snapshot::WAKING);
            if is_waking {
                debug_assert!(waking > 0, "notify(waking) without the waking role");
                waking -= 1;
                s.set(Snapshot::WAKING, waking);
            }

            let head = s.get(Snapshot::IDLE_HEAD);
            if waking == 0 && head != 0 {
                // Wake the most recently parked worker and hand it the role.
                let worker = head - 1;
                let next = self.links[worker].load(Ordering::Relaxed) as usize;
                let idle = s.get(Snapshot::IDLE);
                s.set(Snapshot::STATE, State::Waking);
                s.set(Snapshot::WAKING, 1);
                s.set(Snapshot::IDLE, idle - 1);
                s.set(Snapshot::IDLE_HEAD, next);
                s.0 = s.0.wrapping_add(TAG_ONE);
                return Some(worker);
            }

            if waking > 0 {
                // Someone is already searching; it will find the new work.
                return None;
            }

            // Nobody parked, nobody searching: leave a note so the next
            // worker that tries to park keeps running instead.
            if s.get(Snapshot::STATE) != State::Notified {
                s.set(Snapshot::STATE, State::Notified);
            }
            None
        })
    }

    /// A worker found no work anywhere and wants to park.
    pub(crate) fn suspend(&self, worker: usize, is_waking: bool) -> Suspend {
        debug_assert!(worker < self.workers);

        self.transition(|s| {
            if s.get(Snapshot::STATE) == State::Shutdown {
                // Retire. Parked peers are already counted idle; this worker
                // adds itself and the pool is quiescent once everyone has.
                let idle = s.get(Snapshot::IDLE) + 1;
                s.set(Snapshot::IDLE, idle);
                let mut waking = s.get(Snapshot::WAKING);
                if is_waking {
                    waking -= 1;
                    s.set(Snapshot::WAKING, waking);
                }
                return Suspend::Shutdown {
                    last: idle == self.workers && waking == 0,
                };
            }

            if s.get(Snapshot::STATE) == State::Notified {
                // Absorb the pending wakeup instead of sleeping.
                debug_assert!(!is_waking, "a waking worker cannot see Notified");
                s.set(
                    Snapshot::STATE,
                    if s.get(Snapshot::WAKING) > 0 {
                        State::Waking
                    } else {
                        State::Pending
                    },
                );
                return Suspend::Notified;
            }

            // Push ourselves onto the idle stack.
            self.links[worker].store(s.get(Snapshot::IDLE_HEAD) as u32, Ordering::Relaxed);

            let mut waking = s.get(Snapshot::WAKING);
            if is_waking {
                debug_assert!(waking > 0, "suspend(waking) without the waking role");
                waking -= 1;
                s.set(Snapshot::WAKING, waking);
            }

            let idle = s.get(Snapshot::IDLE);
            s.set(Snapshot::IDLE, idle + 1);
            s.set(Snapshot::IDLE_HEAD, worker + 1);
            s.set(
                Snapshot::STATE,
                if waking > 0 { State::Waking } else { State::Pending },
            );
            s.0 = s.0.wrapping_add(TAG_ONE);
            Suspend::Wait
        })
    }

    /// Move to the terminal state. Returns `true` on the first transition so
    /// exactly one caller broadcasts the wakeup.
    pub(crate) fn shutdown(&self) -> bool {
        self.transition(|s| {
            if s.get(Snapshot::STATE) == State::Shutdown {
                return false;
            }
            s.set(Snapshot::STATE, State::Shutdown);
            true
        })
    }

    /// Run `transition` against the current word and commit the result with
    /// a CAS, retrying on contention. A transition that leaves the snapshot
    /// untouched commits nothing.
    ///
    /// `SeqCst` throughout: the parking protocol relies on a worker's
    /// suspend being totally ordered against producers' push-then-notify
    /// sequences (see the re-check in the worker loop).
    fn transition<T>(&self, mut transition: impl FnMut(&mut Snapshot) -> T) -> T {
        let mut current = Snapshot::from_bits(self.word.load(Ordering::SeqCst));
        loop {
            let mut next = current;
            let res = transition(&mut next);

            if current == next {
                return res;
            }

            match self.word.compare_exchange_weak(
                current.0,
                next.0,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return res,
                Err(actual) => current = Snapshot::from_bits(actual),
            }
        }
    }
}

impl fmt::Debug for Idle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Idle")
            .field("word", &self.snapshot())
            .field("workers", &self.workers)
            .finish()
    }
}
