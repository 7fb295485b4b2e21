// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::sync::atomic::{AtomicPtr, Ordering};
use crate::util::loom_const_fn;
use crate::worker::Worker;
use core::fmt;
use core::ptr::{self, NonNull};
use static_assertions::{assert_impl_all, const_assert};

/// The function invoked when a [`Task`] is executed.
///
/// Receives a reference to the task itself (so the callback can recover its
/// containing allocation) and the worker the task is running on. The callback
/// is free to schedule new tasks, including the one it was handed.
pub type TaskCallback = fn(TaskRef, &Worker);

/// A schedulable unit of work: a callback plus the intrusive link the
/// scheduler threads through tasks while they are queued.
///
/// Tasks are owned by the caller. Scheduling one lends it to the runtime
/// until its callback is invoked; once the callback has been entered the
/// scheduler will not touch the task again, and the callback may requeue,
/// reuse, or free it.
///
/// The type is over-aligned so the low bits of task pointers are always free
/// for tagging.
#[repr(C, align(4))]
#[derive(Debug)]
pub struct Task {
    next: AtomicPtr<Task>,
    callback: TaskCallback,
}

const_assert!(core::mem::align_of::<Task>() >= 4);

impl Task {
    loom_const_fn! {
        /// Creates a new task that will run `callback` when executed.
        pub const fn new(callback: TaskCallback) -> Task {
            Task {
                next: AtomicPtr::new(ptr::null_mut()),
                callback,
            }
        }
    }
}

/// An unowned reference to a [`Task`] that has been handed to the scheduler.
///
/// This is a plain pointer; all liveness obligations sit with whoever
/// constructed it (see [`TaskRef::new`]).
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct TaskRef(NonNull<Task>);

// Safety: a `TaskRef` is just a pointer to a `Task` whose liveness is
// guaranteed by the constructor contract, and every `Task` field is either
// immutable or atomic.
unsafe impl Send for TaskRef {}

assert_impl_all!(TaskRef: Send);

impl TaskRef {
    /// Creates a `TaskRef` from a raw task pointer.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that the task outlives its entire stay in
    /// the scheduler (from `schedule` until its callback is entered) and
    /// that it is not queued a second time while still queued.
    #[inline]
    pub unsafe fn new(task: NonNull<Task>) -> TaskRef {
        TaskRef(task)
    }

    /// Creates a `TaskRef` from a task with static storage.
    ///
    /// # Safety
    ///
    /// The task must not currently be queued.
    #[inline]
    pub unsafe fn from_static(task: &'static Task) -> TaskRef {
        TaskRef(NonNull::from(task))
    }

    #[inline]
    pub fn as_ptr(self) -> NonNull<Task> {
        self.0
    }

    pub(crate) fn callback(self) -> TaskCallback {
        // Safety: the constructor contract keeps the task alive while the
        // scheduler holds this reference.
        unsafe { self.0.as_ref() }.callback
    }

    pub(crate) fn load_next(self, ordering: Ordering) -> *mut Task {
        // Safety: see `Self::callback`.
        unsafe { self.0.as_ref() }.next.load(ordering)
    }

    pub(crate) fn store_next(self, next: *mut Task, ordering: Ordering) {
        // Safety: see `Self::callback`.
        unsafe { self.0.as_ref() }.next.store(next, ordering);
    }
}

impl fmt::Debug for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("TaskRef").field(&self.0).finish()
    }
}

/// An owned list of tasks, linked through their intrusive next pointers.
///
/// Batches are plain values for building and transferring groups of tasks in
/// O(1); they are not thread-safe and all operations are constant time.
#[derive(Debug, Default)]
pub struct Batch {
    head: Option<NonNull<Task>>,
    tail: Option<NonNull<Task>>,
}

impl Batch {
    pub const fn new() -> Batch {
        Batch {
            head: None,
            tail: None,
        }
    }

    pub fn from_task(task: TaskRef) -> Batch {
        task.store_next(ptr::null_mut(), Ordering::Relaxed);
        Batch {
            head: Some(task.as_ptr()),
            tail: Some(task.as_ptr()),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn push_back(&mut self, task: TaskRef) {
        self.push_back_batch(Batch::from_task(task));
    }

    pub fn push_front(&mut self, task: TaskRef) {
        self.push_front_batch(Batch::from_task(task));
    }

    /// Appends all of `batch` behind the tasks already in `self`.
    pub fn push_back_batch(&mut self, batch: Batch) {
        let Some(batch_head) = batch.head else { return };

        match self.tail {
            None => *self = batch,
            Some(tail) => {
                // Safety: tasks in a batch are alive per the `TaskRef`
                // contract; the batch owns their links.
                unsafe { TaskRef::new(tail) }
                    .store_next(batch_head.as_ptr(), Ordering::Relaxed);
                self.tail = batch.tail;
            }
        }
    }

    /// Prepends all of `batch` in front of the tasks already in `self`.
    pub fn push_front_batch(&mut self, batch: Batch) {
        let Some(batch_tail) = batch.tail else { return };

        match self.head {
            None => *self = batch,
            Some(head) => {
                // Safety: see `Self::push_back_batch`.
                unsafe { TaskRef::new(batch_tail) }
                    .store_next(head.as_ptr(), Ordering::Relaxed);
                self.head = batch.head;
            }
        }
    }

    pub fn pop_front(&mut self) -> Option<TaskRef> {
        let head = self.head?;

        // Safety: see `Self::push_back_batch`.
        let task = unsafe { TaskRef::new(head) };
        self.head = NonNull::new(task.load_next(Ordering::Relaxed));
        if self.head.is_none() {
            self.tail = None;
        }

        Some(task)
    }

    /// The first and last task of the batch, or `None` if it is empty.
    ///
    /// The tail's next link is guaranteed to be null.
    pub(crate) fn into_parts(self) -> Option<(TaskRef, TaskRef)> {
        let head = self.head?;
        let tail = self.tail.expect("batch with a head must have a tail");
        // Safety: see `Self::push_back_batch`.
        unsafe { Some((TaskRef::new(head), TaskRef::new(tail))) }
    }
}
