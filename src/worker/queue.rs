use std::collections::VecDeque;
use std::sync::{Mutex, Weak};

use super::WorkUnit;
use crate::tree::LsmTree;

/// One FIFO work queue with its own lock. The manager keeps three so that
/// fast operations (switches) are never stuck behind slow ones (merges):
/// each queue stays strictly FIFO instead of needing reordering.
#[derive(Default)]
pub struct WorkQueue {
    inner: Mutex<VecDeque<WorkUnit>>,
}

impl WorkQueue {
    /// Link a unit at the tail. Non-blocking apart from the queue lock.
    pub fn push(&self, unit: WorkUnit) {
        self.inner.lock().unwrap().push_back(unit);
    }

    /// Unlink the unit at the head, if any.
    pub fn pop(&self) -> Option<WorkUnit> {
        self.inner.lock().unwrap().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }

    /// Drop every queued unit, returning how many were discarded.
    pub fn clear(&self) -> usize {
        let mut queue = self.inner.lock().unwrap();
        let discarded = queue.len();
        queue.clear();
        discarded
    }

    /// Drop queued units referencing the given tree, returning how many
    /// were discarded. Units for dead trees go too.
    pub fn discard_tree(&self, tree: &Weak<LsmTree>) -> usize {
        let mut queue = self.inner.lock().unwrap();
        let before = queue.len();
        queue.retain(|unit| {
            !Weak::ptr_eq(&unit.tree, tree) && unit.tree.upgrade().is_some()
        });
        before - queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkKind;

    #[test]
    fn test_fifo_order() {
        let queue = WorkQueue::default();
        queue.push(WorkUnit::new(WorkKind::Flush, false, Weak::new()));
        queue.push(WorkUnit::new(WorkKind::Bloom, false, Weak::new()));
        queue.push(WorkUnit::new(WorkKind::Drop, true, Weak::new()));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().unwrap().kind, WorkKind::Flush);
        assert_eq!(queue.pop().unwrap().kind, WorkKind::Bloom);
        let last = queue.pop().unwrap();
        assert_eq!(last.kind, WorkKind::Drop);
        assert!(last.force);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_clear() {
        let queue = WorkQueue::default();
        queue.push(WorkUnit::new(WorkKind::Merge, false, Weak::new()));
        queue.push(WorkUnit::new(WorkKind::Merge, false, Weak::new()));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_discard_dead_trees() {
        let queue = WorkQueue::default();
        // Units whose trees are gone are discarded by any sweep.
        queue.push(WorkUnit::new(WorkKind::Flush, false, Weak::new()));
        let discarded = queue.discard_tree(&Weak::new());
        assert_eq!(discarded, 1);
        assert!(queue.is_empty());
    }
}
