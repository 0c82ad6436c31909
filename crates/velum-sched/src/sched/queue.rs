//! Intrusive FIFO task queue

use crate::sched::task::{RawTask, TaskRef};
use crate::sync::SpinLock;
use std::ptr::NonNull;

struct LinkedList {
    head: Option<NonNull<RawTask>>,
    tail: Option<NonNull<RawTask>>,
}

// SAFETY: node pointers are owned by exactly one queue or executor at a time
unsafe impl Send for LinkedList {}

/// FIFO queue of task nodes, linked through the nodes themselves.
///
/// Push and pop are O(1) link operations under a spin lock; the queue never
/// allocates. A popped node is owned by the popping thread until it is
/// pushed again or released; a re-pushed node goes to the back of the line.
pub(crate) struct TaskQueue {
    list: SpinLock<LinkedList>,
}

impl TaskQueue {
    pub(crate) fn new() -> Self {
        Self {
            list: SpinLock::new(LinkedList {
                head: None,
                tail: None,
            }),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.list.lock().head.is_none()
    }

    pub(crate) fn push_back(&self, task: TaskRef) {
        let mut node = task.into_node();
        let mut list = self.list.lock();

        // SAFETY: the node was exclusively owned by the TaskRef and is
        // unlinked; the lock serializes all link updates
        unsafe {
            let task = node.as_mut();
            debug_assert!(task.next.is_none() && task.prev.is_none());
            task.prev = list.tail;

            match list.tail {
                Some(mut tail) => tail.as_mut().next = Some(node),
                None => list.head = Some(node),
            }
            list.tail = Some(node);
        }
    }

    pub(crate) fn pop_front(&self) -> Option<TaskRef> {
        let mut list = self.list.lock();
        let mut node = list.head?;

        // SAFETY: the head node is owned by this queue; the lock serializes
        // all link updates
        unsafe {
            let task = node.as_mut();
            list.head = task.next;

            match task.next {
                Some(mut next) => next.as_mut().prev = None,
                None => list.tail = None,
            }
            task.next = None;
            task.prev = None;

            Some(TaskRef::from_node(node))
        }
    }
}
