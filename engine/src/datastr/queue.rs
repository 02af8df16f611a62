//! The ready queue.

use crate::datastr::lock::SpinLock;
use crate::datastr::task::TaskId;
use std::cell::UnsafeCell;
use std::collections::VecDeque;

/// A spinlocked deque of ready task ids. Tasks that fail to take their
/// cell locks are pushed to the back so a worker does not immediately
/// retry the same contended locks.
///
/// The `UnsafeCell` is only ever accessed between `lock.lock()` and
/// `lock.unlock()`, which is what makes the `Sync` impl sound.
pub struct ReadyQueue {
    lock: SpinLock,
    queue: UnsafeCell<VecDeque<TaskId>>,
}

unsafe impl Send for ReadyQueue {}
unsafe impl Sync for ReadyQueue {}

impl ReadyQueue {
    pub fn new(capacity: usize) -> Self {
        ReadyQueue {
            lock: SpinLock::new(),
            queue: UnsafeCell::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn push(&self, task: TaskId) {
        self.lock.lock();
        unsafe { &mut *self.queue.get() }.push_back(task);
        self.lock.unlock();
    }

    pub fn pop(&self) -> Option<TaskId> {
        self.lock.lock();
        let task = unsafe { &mut *self.queue.get() }.pop_front();
        self.lock.unlock();
        task
    }

    pub fn len(&self) -> usize {
        self.lock.lock();
        let len = unsafe { &*self.queue.get() }.len();
        self.lock.unlock();
        len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let queue = ReadyQueue::new(4);
        queue.push(3);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.pop(), Some(3));
        // a contended task goes to the back
        queue.push(3);
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }
}
