// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::{Condvar, Mutex};

/// An auto-reset event: the one kernel primitive a worker is allowed to
/// block on.
///
/// `set` is sticky — setting before the waiter arrives means the next `wait`
/// returns immediately — so a wakeup can never be lost to the gap between a
/// worker deciding to sleep and actually sleeping. Each `wait` consumes one
/// `set`. There is deliberately no timed variant; timers belong to the
/// reactor, not to workers.
#[derive(Debug)]
pub(crate) struct Event {
    notified: Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub(crate) fn new() -> Event {
        Event {
            notified: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Block until the event is set, then reset it.
    pub(crate) fn wait(&self) {
        let mut notified = self.notified.lock().expect("worker event mutex poisoned");
        while !*notified {
            notified = self
                .cond
                .wait(notified)
                .expect("worker event mutex poisoned");
        }
        *notified = false;
    }

    /// Set the event, waking the waiter if there is one.
    pub(crate) fn set(&self) {
        let mut notified = self.notified.lock().expect("worker event mutex poisoned");
        *notified = true;
        self.cond.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use std::sync::Arc;

    #[test]
    fn set_before_wait_is_not_lost() {
        loom::model(|| {
            let event = Event::new();
            event.set();
            event.wait();
        });
    }

    #[test]
    fn wait_is_woken_by_remote_set() {
        loom::model(|| {
            let event = Arc::new(Event::new());

            let waiter = {
                let event = Arc::clone(&event);
                loom::thread::spawn(move || event.wait())
            };

            event.set();
            waiter.join().unwrap();
        });
    }

    // Uses real std threads and sleeps, which loom cannot model.
    #[cfg(not(loom))]
    #[test]
    fn wait_consumes_the_notification() {
        let event = Arc::new(Event::new());
        event.set();
        event.set();
        event.wait();

        // A second set while no one waits coalesces into one notification,
        // which the wait above consumed.
        let waiter = {
            let event = Arc::clone(&event);
            std::thread::spawn(move || event.wait())
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        event.set();
        waiter.join().unwrap();
    }
}
