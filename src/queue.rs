// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The two task queues every worker is built from.
//!
//! [`Buffer`] is a bounded single-producer/multi-consumer ring: the owning
//! worker pushes and pops at full speed, remote workers steal roughly half of
//! it at a time through a CAS on `head`.
//!
//! [`Injector`] is an unbounded multi-producer list threaded through the
//! tasks' own next links. Producers chain in with one swap; consumers take
//! turns through a `CONSUMING` bit in the tagged head word, in the style of
//! [Vyukov's intrusive MPSC][vyukov].
//!
//! [vyukov]: http://www.1024cores.net/home/lock-free-algorithms/queues/intrusive-mpsc-node-based-queue

use crate::loom::sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering};
use crate::rand::Rng;
use crate::task::{Batch, Task, TaskRef};
use crate::util::{CachePadded, spin_loop_hint};
use core::ptr::{self, NonNull};

/// Slots in each worker's local run buffer.
pub(crate) const BUFFER_CAPACITY: usize = 256;

/// A worker's local run queue.
///
/// `head` and `tail` are free-running `u32` indices (wrapping mod 2³²); a
/// slot `i % BUFFER_CAPACITY` holds a valid task exactly while
/// `head <= i < tail`. Only the owning worker advances `tail` or writes
/// slots; any worker may advance `head` by CAS to claim tasks.
pub(crate) struct Buffer {
    head: CachePadded<AtomicU32>,
    tail: CachePadded<AtomicU32>,
    slots: [AtomicPtr<Task>; BUFFER_CAPACITY],
}

impl Buffer {
    pub(crate) fn new() -> Buffer {
        Buffer {
            head: CachePadded(AtomicU32::new(0)),
            tail: CachePadded(AtomicU32::new(0)),
            slots: core::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }
    }

    #[inline]
    fn slot(&self, index: u32) -> &AtomicPtr<Task> {
        &self.slots[index as usize % BUFFER_CAPACITY]
    }

    #[inline]
    fn read_slot(&self, index: u32) -> TaskRef {
        let task = self.slot(index).load(Ordering::Relaxed);
        let task = NonNull::new(task).expect("null task read from a populated run buffer slot");
        // Safety: pointers in the valid window were stored from live `TaskRef`s.
        unsafe { TaskRef::new(task) }
    }

    /// Number of queued tasks. Racy when called off the owner thread.
    pub(crate) fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        tail.wrapping_sub(head) as usize
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push a batch of tasks, spilling into `overflow` if the ring fills up.
    ///
    /// When the ring is full, half of it is reclaimed with a single CAS and
    /// shipped to the overflow injector together with the rest of the batch;
    /// the reclaimed half goes in front since those tasks are older.
    ///
    /// # Safety
    ///
    /// The caller must be the buffer's owning worker.
    pub(crate) unsafe fn push(&self, mut batch: Batch, overflow: &Injector) {
        // `tail` is ours alone; `head` synchronizes with stealers.
        let mut tail = self.tail.load(Ordering::Relaxed);
        let mut head = self.head.load(Ordering::Acquire);

        while !batch.is_empty() {
            let size = tail.wrapping_sub(head);
            debug_assert!(size as usize <= BUFFER_CAPACITY, "run buffer size {size}");

            if (size as usize) < BUFFER_CAPACITY {
                let mut new_tail = tail;
                while (new_tail.wrapping_sub(head) as usize) < BUFFER_CAPACITY {
                    let Some(task) = batch.pop_front() else { break };
                    self.slot(new_tail)
                        .store(task.as_ptr().as_ptr(), Ordering::Relaxed);
                    new_tail = new_tail.wrapping_add(1);
                }

                // Publish the new tasks; pairs with the acquire loads in
                // `steal_from` so stealers see valid slot contents.
                if new_tail != tail {
                    tail = new_tail;
                    self.tail.store(new_tail, Ordering::Release);
                }

                // Stealers may have made room in the meantime.
                head = self.head.load(Ordering::Acquire);
                continue;
            }

            // Full. Reclaim half of our own ring in one CAS so future pushes
            // go back to the cheap path above.
            let migrate = (BUFFER_CAPACITY / 2) as u32;
            match self.head.compare_exchange(
                head,
                head.wrapping_add(migrate),
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    let mut migrated = Batch::new();
                    for i in 0..migrate {
                        migrated.push_back(self.read_slot(head.wrapping_add(i)));
                    }

                    // The reclaimed tasks were queued first.
                    batch.push_front_batch(migrated);
                    overflow.push(batch);
                    return;
                }
                Err(actual) => head = actual,
            }
        }
    }

    /// Pop the oldest task.
    ///
    /// # Safety
    ///
    /// The caller must be the buffer's owning worker.
    pub(crate) unsafe fn pop(&self) -> Option<TaskRef> {
        // The acquire on the increment settles the race with stealers: any
        // stealer that still claims our slot must fail its CAS against the
        // bumped head.
        let head = self.head.fetch_add(1, Ordering::Acquire);
        let tail = self.tail.load(Ordering::Relaxed);

        let size = tail.wrapping_sub(head);
        debug_assert!(size as usize <= BUFFER_CAPACITY, "run buffer size {size}");

        if size == 0 {
            self.head.store(head, Ordering::Relaxed);
            return None;
        }

        Some(self.read_slot(head))
    }

    /// Steal roughly half of `target`'s tasks into this (empty) buffer and
    /// hand one of them back to run immediately.
    ///
    /// # Safety
    ///
    /// The caller must be this buffer's owning worker, and the buffer must be
    /// empty.
    pub(crate) unsafe fn steal_from(&self, target: &Buffer, rng: &mut Rng) -> Option<TaskRef> {
        loop {
            let target_head = target.head.load(Ordering::Acquire);
            let target_tail = target.tail.load(Ordering::Acquire);

            let target_size = target_tail.wrapping_sub(target_head);
            if target_size as i32 <= 0 {
                return None;
            }

            // Take the larger half; leave the rest so other stealers and the
            // owner converge on a balanced split.
            let steal = target_size - target_size / 2;
            if steal as usize > BUFFER_CAPACITY / 2 {
                // The head and tail loads raced with the owner.
                spin_loop_hint();
                continue;
            }

            let tail = self.tail.load(Ordering::Relaxed);
            debug_assert_eq!(
                self.head.load(Ordering::Relaxed),
                tail,
                "stealing into a non-empty buffer"
            );

            // Speculatively copy before claiming; the CAS below discards the
            // copies if the window moved under us.
            for i in 0..steal {
                let task = target.read_slot(target_head.wrapping_add(i));
                self.slot(tail.wrapping_add(i))
                    .store(task.as_ptr().as_ptr(), Ordering::Relaxed);
            }

            if target
                .head
                .compare_exchange(
                    target_head,
                    target_head.wrapping_add(steal),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return Some(self.commit(tail, steal));
            }

            // Lost the race; de-synchronize from the other stealers.
            for _ in 0..rng.contention_spins() {
                spin_loop_hint();
            }
        }
    }

    /// Drain up to a buffer's worth of tasks out of `injector` into this
    /// (empty) buffer and hand one of them back to run immediately.
    ///
    /// # Safety
    ///
    /// The caller must be this buffer's owning worker, and the buffer must be
    /// empty.
    pub(crate) unsafe fn fill_from(&self, injector: &Injector) -> Option<TaskRef> {
        let mut consumer = injector.try_consume()?;

        let tail = self.tail.load(Ordering::Relaxed);
        debug_assert_eq!(
            self.head.load(Ordering::Relaxed),
            tail,
            "draining into a non-empty buffer"
        );

        let mut pushed: u32 = 0;
        while (pushed as usize) < BUFFER_CAPACITY {
            let Some(task) = consumer.pop() else { break };
            self.slot(tail.wrapping_add(pushed))
                .store(task.as_ptr().as_ptr(), Ordering::Relaxed);
            pushed += 1;
        }

        drop(consumer);

        if pushed == 0 {
            // The injector was claimed in the middle of a producer's push.
            return None;
        }

        Some(self.commit(tail, pushed))
    }

    /// Publish all but the last of `pushed` freshly written slots and return
    /// that last task for immediate execution.
    fn commit(&self, tail: u32, pushed: u32) -> TaskRef {
        debug_assert!(pushed > 0);
        let new_tail = tail.wrapping_add(pushed - 1);
        let task = self.read_slot(new_tail);

        if new_tail != tail {
            self.tail.store(new_tail, Ordering::Release);
        }

        task
    }
}

/// Set in [`Injector::head`] while a consumer holds the dequeue token.
const CONSUMING: usize = 0b01;

/// An unbounded MPSC task list.
///
/// `head` is a tagged pointer: the low bit is the consume token, the rest
/// points at the first queued task (or is zero when the list is empty or
/// fully claimed by the consumer). `tail` points at the last queued task.
/// Each worker owns one as its overflow lane and the scheduler owns one as
/// the global conduit for external submissions.
pub(crate) struct Injector {
    head: CachePadded<AtomicUsize>,
    tail: CachePadded<AtomicPtr<Task>>,
}

impl Injector {
    pub(crate) fn new() -> Injector {
        Injector {
            head: CachePadded(AtomicUsize::new(0)),
            tail: CachePadded(AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Append a batch (front..back) in FIFO position.
    ///
    /// The release on the tail swap (or the head fetch-add for the first
    /// producer) is what publishes the batch's link stores to consumers.
    pub(crate) fn push(&self, batch: Batch) {
        let Some((front, back)) = batch.into_parts() else {
            return;
        };
        debug_assert!(back.load_next(Ordering::Relaxed).is_null());

        let prev_tail = self.tail.swap(back.as_ptr().as_ptr(), Ordering::AcqRel);
        if let Some(prev_tail) = NonNull::new(prev_tail) {
            // Safety: a task stays alive while queued, and `prev_tail` is
            // queued until a consumer takes it, which it cannot do before
            // this store makes it reachable.
            unsafe { TaskRef::new(prev_tail) }.store_next(front.as_ptr().as_ptr(), Ordering::Release);
            return;
        }

        // The list was empty: seed the head. fetch-add instead of store, so
        // this cannot clobber the consume token.
        let front_bits = front.as_ptr().as_ptr() as usize;
        debug_assert_eq!(front_bits & CONSUMING, 0);
        let prev_head = self.head.fetch_add(front_bits, Ordering::Release);
        debug_assert_eq!(
            prev_head & !CONSUMING,
            0,
            "injector head non-empty while tail was null"
        );
    }

    /// Whether there are queued tasks *and* the consume token is free.
    ///
    /// Approximate, but monotone enough for a searching worker to decide
    /// whether claiming the consumer is worth trying.
    pub(crate) fn pending(&self) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        (head & !CONSUMING != 0) && (head & CONSUMING == 0)
    }

    /// Claim the exclusive consume token.
    ///
    /// Returns `None` when the list is empty or another consumer already
    /// holds the token.
    pub(crate) fn try_consume(&self) -> Option<Consumer<'_>> {
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            let cursor = (head & !CONSUMING) as *mut Task;
            if cursor.is_null() {
                return None;
            }
            if head & CONSUMING != 0 {
                return None;
            }

            match self.head.compare_exchange_weak(
                head,
                CONSUMING,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(Consumer {
                        injector: self,
                        cursor,
                    });
                }
                Err(actual) => head = actual,
            }
        }
    }

    /// Claim the token, dequeue a single task, release the token.
    pub(crate) fn poll_one(&self) -> Option<TaskRef> {
        let mut consumer = self.try_consume()?;
        consumer.pop()
    }
}

/// Exclusive dequeue access to an [`Injector`], released on drop.
///
/// Holds a private cursor into the list; the injector's head keeps only the
/// `CONSUMING` tag while the consumer is live.
pub(crate) struct Consumer<'queue> {
    injector: &'queue Injector,
    cursor: *mut Task,
}

impl Consumer<'_> {
    pub(crate) fn pop(&mut self) -> Option<TaskRef> {
        let front = match NonNull::new(self.cursor) {
            Some(front) => front,
            None => {
                // A producer may have re-seeded the head since we claimed
                // the token; move the list into our cursor.
                let head = self.injector.head.load(Ordering::Acquire);
                debug_assert_ne!(head & CONSUMING, 0);

                let front = NonNull::new((head & !CONSUMING) as *mut Task)?;
                self.cursor = front.as_ptr();
                self.injector.head.store(CONSUMING, Ordering::Relaxed);
                front
            }
        };
        // Safety: tasks stay alive while queued.
        let front = unsafe { TaskRef::new(front) };

        let mut next = front.load_next(Ordering::Acquire);
        if next.is_null() {
            // Looks like the last task; take it away from the producers by
            // clearing the tail.
            if self
                .injector
                .tail
                .compare_exchange(
                    front.as_ptr().as_ptr(),
                    ptr::null_mut(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_err()
            {
                // A producer swapped the tail but has not linked its batch
                // yet; it may have caught up by now.
                spin_loop_hint();
                next = front.load_next(Ordering::Acquire);
                if next.is_null() {
                    // Still mid-push. Keep the cursor on this task and report
                    // empty; a later pop retries once the producer has linked.
                    return None;
                }
            }
        }

        self.cursor = next;
        Some(front)
    }
}

impl Drop for Consumer<'_> {
    fn drop(&mut self) {
        if self.cursor.is_null() {
            let head = self.injector.head.fetch_sub(CONSUMING, Ordering::Release);
            debug_assert_ne!(head & CONSUMING, 0);
        } else {
            // Hand the unconsumed remainder back. While a consumer is live
            // the head holds only the token, so a plain store is enough.
            debug_assert_eq!(self.cursor as usize & CONSUMING, 0);
            self.injector
                .head
                .store(self.cursor as usize, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use crate::task::Task;
    use std::collections::HashSet;

    fn noop(_task: TaskRef, _worker: &crate::worker::Worker) {}

    fn leaked_tasks(n: usize) -> Vec<TaskRef> {
        (0..n)
            .map(|_| {
                let task = Box::leak(Box::new(Task::new(noop)));
                // Safety: leaked, lives forever.
                unsafe { TaskRef::from_static(task) }
            })
            .collect()
    }

    fn batch_of(tasks: &[TaskRef]) -> Batch {
        let mut batch = Batch::new();
        for &task in tasks {
            batch.push_back(task);
        }
        batch
    }

    #[cfg(not(loom))]
    #[test]
    fn buffer_push_pop_fifo() {
        let buffer = Buffer::new();
        let overflow = Injector::new();
        let tasks = leaked_tasks(16);

        // Safety: this thread plays the owning worker.
        unsafe {
            buffer.push(batch_of(&tasks), &overflow);
            for &task in &tasks {
                assert_eq!(buffer.pop(), Some(task));
            }
            assert_eq!(buffer.pop(), None);
        }
        assert!(!overflow.pending());
    }

    #[cfg(not(loom))]
    #[test]
    fn buffer_overflow_spills_to_injector() {
        let buffer = Buffer::new();
        let overflow = Injector::new();
        let tasks = leaked_tasks(300);

        // Safety: this thread plays the owning worker.
        unsafe { buffer.push(batch_of(&tasks), &overflow) };

        // 256 fit, the ring then reclaims half of itself, and the reclaimed
        // 128 plus the 44 stragglers go to the overflow lane.
        assert_eq!(buffer.len(), 128);
        assert!(overflow.pending());

        let mut seen = HashSet::new();
        // Safety: still the owning worker.
        while let Some(task) = unsafe { buffer.pop() } {
            assert!(seen.insert(task.as_ptr()));
        }
        let mut consumer = overflow.try_consume().unwrap();
        while let Some(task) = consumer.pop() {
            assert!(seen.insert(task.as_ptr()));
        }
        assert_eq!(seen.len(), 300);
    }

    #[cfg(not(loom))]
    #[test]
    fn steal_takes_the_larger_half() {
        let victim = Buffer::new();
        let thief = Buffer::new();
        let overflow = Injector::new();
        let tasks = leaked_tasks(100);
        let mut rng = Rng::for_worker(1);

        // Safety: single-threaded test, we play both owners in turn.
        unsafe {
            victim.push(batch_of(&tasks), &overflow);

            let stolen = thief.steal_from(&victim, &mut rng).unwrap();
            // 50 claimed: one handed back, 49 published.
            assert_eq!(stolen, tasks[49]);
            assert_eq!(thief.len(), 49);
            assert_eq!(victim.len(), 50);

            // The stolen range is the oldest half.
            for &task in &tasks[..49] {
                assert_eq!(thief.pop(), Some(task));
            }
        }
    }

    #[cfg(not(loom))]
    #[test]
    fn steal_from_empty_buffer() {
        let victim = Buffer::new();
        let thief = Buffer::new();
        let mut rng = Rng::for_worker(1);

        // Safety: single-threaded test.
        assert_eq!(unsafe { thief.steal_from(&victim, &mut rng) }, None);
    }

    #[cfg(not(loom))]
    #[test]
    fn injector_fifo_within_a_producer() {
        let injector = Injector::new();
        let tasks = leaked_tasks(8);

        injector.push(batch_of(&tasks[..4]));
        injector.push(batch_of(&tasks[4..]));

        for &task in &tasks {
            assert_eq!(injector.poll_one(), Some(task));
        }
        assert_eq!(injector.poll_one(), None);
        assert!(!injector.pending());
    }

    #[cfg(not(loom))]
    #[test]
    fn consumer_token_is_exclusive() {
        let injector = Injector::new();
        let tasks = leaked_tasks(2);
        injector.push(batch_of(&tasks));

        let consumer = injector.try_consume().unwrap();
        assert!(injector.try_consume().is_none());
        assert!(!injector.pending());
        drop(consumer);

        assert!(injector.pending());
        assert_eq!(injector.poll_one(), Some(tasks[0]));
    }

    #[cfg(not(loom))]
    #[test]
    fn fill_from_injector_hands_one_back() {
        let buffer = Buffer::new();
        let injector = Injector::new();
        let tasks = leaked_tasks(10);
        injector.push(batch_of(&tasks));

        // Safety: this thread plays the owning worker.
        let task = unsafe { buffer.fill_from(&injector) }.unwrap();
        assert_eq!(task, tasks[9]);
        assert_eq!(buffer.len(), 9);
        assert!(!injector.pending());
    }

    #[test]
    fn concurrent_producers_drain_to_one_consumer() {
        const PRODUCERS: usize = if cfg!(loom) { 2 } else { 4 };
        const PUSHES: usize = if cfg!(loom) { 2 } else { 256 };

        loom::model(|| {
            let injector: &'static Injector = Box::leak(Box::new(Injector::new()));

            let handles: Vec<_> = (0..PRODUCERS)
                .map(|_| {
                    loom::thread::spawn(move || {
                        let mut pushed = Vec::with_capacity(PUSHES);
                        for task in leaked_tasks(PUSHES) {
                            injector.push(Batch::from_task(task));
                            pushed.push(task);
                        }
                        pushed
                    })
                })
                .collect();

            let mut expected = HashSet::new();
            for handle in handles {
                expected.extend(handle.join().unwrap().into_iter().map(TaskRef::as_ptr));
            }

            let mut seen = HashSet::new();
            while seen.len() < expected.len() {
                while let Some(task) = injector.poll_one() {
                    assert!(seen.insert(task.as_ptr()), "task dequeued twice");
                }
                spin_loop_hint();
            }
            assert_eq!(seen, expected);
        });
    }
}
