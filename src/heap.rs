//! The timeout min-heap.
//!
//! A binary heap of `(deadline, task)` pairs ordered on absolute millisecond
//! deadlines. Each fiber's current slot index is cached on the fiber itself
//! (`Task::timeout_index`) so it can be removed in O(log n) when cancelled
//! or rescheduled, rather than requiring a linear scan.

use std::rc::Rc;

use crate::task::{Task, NO_TIMEOUT};

struct TimeoutEntry {
    when: u64,
    task: Rc<Task>,
}

/// A binary min-heap of pending timeouts.
pub struct TimeoutHeap {
    entries: Vec<TimeoutEntry>,
}

impl TimeoutHeap {
    pub fn new() -> Self {
        TimeoutHeap { entries: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The earliest deadline currently pending, if any.
    pub fn peek_deadline(&self) -> Option<u64> {
        self.entries.first().map(|e| e.when)
    }

    /// Schedules `task` to fire at `when`, replacing any timeout it already
    /// had pending.
    pub fn add(&mut self, when: u64, task: Rc<Task>) {
        if task.timeout_index.get() != NO_TIMEOUT {
            self.remove(&task);
        }
        let idx = self.entries.len();
        task.timeout_index.set(idx as isize);
        self.entries.push(TimeoutEntry { when, task });
        self.sift_up(idx);
    }

    /// Removes `task`'s pending timeout, if it has one. A no-op otherwise.
    pub fn remove(&mut self, task: &Rc<Task>) {
        let idx = task.timeout_index.get();
        if idx == NO_TIMEOUT {
            return;
        }
        self.remove_at(idx as usize);
    }

    fn remove_at(&mut self, idx: usize) {
        let last = self.entries.len() - 1;
        self.entries[idx].task.timeout_index.set(NO_TIMEOUT);
        if idx != last {
            self.entries.swap(idx, last);
            self.entries[idx].task.timeout_index.set(idx as isize);
        }
        self.entries.pop();
        if idx < self.entries.len() {
            self.sift_down(idx);
            self.sift_up(idx);
        }
    }

    /// Pops the entry with the earliest deadline, if its deadline has
    /// already passed relative to `now`. Returns `None` otherwise, leaving
    /// the heap untouched.
    pub fn pop_if_due(&mut self, now: u64) -> Option<Rc<Task>> {
        if self.entries.first()?.when > now {
            return None;
        }
        let last = self.entries.len() - 1;
        self.entries.swap(0, last);
        let entry = self.entries.pop().unwrap();
        entry.task.timeout_index.set(NO_TIMEOUT);
        if !self.entries.is_empty() {
            self.entries[0].task.timeout_index.set(0);
            self.sift_down(0);
        }
        Some(entry.task)
    }

    fn sift_up(&mut self, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.entries[parent].when <= self.entries[idx].when {
                break;
            }
            self.entries.swap(parent, idx);
            self.entries[parent].task.timeout_index.set(parent as isize);
            self.entries[idx].task.timeout_index.set(idx as isize);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * idx + 1;
            let right = 2 * idx + 2;
            let mut smallest = idx;
            if left < len && self.entries[left].when < self.entries[smallest].when {
                smallest = left;
            }
            if right < len && self.entries[right].when < self.entries[smallest].when {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.entries.swap(idx, smallest);
            self.entries[idx].task.timeout_index.set(idx as isize);
            self.entries[smallest].task.timeout_index.set(smallest as isize);
            idx = smallest;
        }
    }
}

impl Default for TimeoutHeap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_task() -> Rc<Task> {
        Task::new(async {})
    }

    #[test]
    fn pops_in_deadline_order() {
        let mut heap = TimeoutHeap::new();
        let a = dummy_task();
        let b = dummy_task();
        let c = dummy_task();
        heap.add(30, a.clone());
        heap.add(10, b.clone());
        heap.add(20, c.clone());
        assert!(Rc::ptr_eq(&heap.pop_if_due(100).unwrap(), &b));
        assert!(Rc::ptr_eq(&heap.pop_if_due(100).unwrap(), &c));
        assert!(Rc::ptr_eq(&heap.pop_if_due(100).unwrap(), &a));
    }

    #[test]
    fn pop_if_due_respects_now() {
        let mut heap = TimeoutHeap::new();
        let a = dummy_task();
        heap.add(50, a);
        assert!(heap.pop_if_due(49).is_none());
        assert!(heap.pop_if_due(50).is_some());
    }

    #[test]
    fn remove_via_task_backlink() {
        let mut heap = TimeoutHeap::new();
        let a = dummy_task();
        let b = dummy_task();
        heap.add(10, a.clone());
        heap.add(20, b.clone());
        heap.remove(&a);
        assert_eq!(a.timeout_index.get(), crate::task::NO_TIMEOUT);
        assert!(Rc::ptr_eq(&heap.pop_if_due(100).unwrap(), &b));
        assert!(heap.pop_if_due(100).is_none());
    }

    #[test]
    fn rescheduling_replaces_prior_timeout() {
        let mut heap = TimeoutHeap::new();
        let a = dummy_task();
        heap.add(100, a.clone());
        heap.add(5, a.clone());
        assert_eq!(heap.peek_deadline(), Some(5));
    }
}
