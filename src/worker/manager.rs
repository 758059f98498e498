//! The LSM manager: three prioritized FIFO queues and the worker pool.
//!
//! Workers are flag-masked consumers. Each iteration a worker pops the
//! highest-priority queue its mask permits (switch, then application, then
//! manager), executes at most one unit with no queue lock held, and
//! otherwise waits on the manager's condition variable with a bounded
//! timeout so timed maintenance fires even without enqueues.
//!
//! Pool composition guarantees at least one worker services switch, flush,
//! and drop work, so merges can never consume every slot and deadlock the
//! write path.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

use super::queue::WorkQueue;
use super::{WorkKind, WorkUnit, WORK_BLOOM, WORK_DROP, WORK_FLUSH, WORK_MERGE, WORK_SWITCH};
use crate::collator::CollatorRegistry;
use crate::config::{ManagerConfig, TreeConfig};
use crate::error::{Error, Result};
use crate::stats::Stats;
use crate::tree::{self, LsmTree};

/// Give up on a unit after this many failed attempts and disable its work
/// type on the tree.
const MAX_WORK_RETRIES: u32 = 3;

pub struct LsmManager {
    config: ManagerConfig,
    collators: CollatorRegistry,

    switch_queue: WorkQueue,
    app_queue: WorkQueue,
    manager_queue: WorkQueue,

    work_mutex: Mutex<()>,
    work_cond: Condvar,

    active: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
    merge_idle: AtomicU32,
    work_push_ts: Mutex<Option<Instant>>,

    /// Open trees, consulted for speculative maintenance on idle ticks.
    trees: Mutex<Vec<Weak<LsmTree>>>,
}

impl LsmManager {
    /// Start the worker pool with the default collator registry.
    pub fn start(config: ManagerConfig) -> Result<Arc<Self>> {
        Self::start_with_collators(config, CollatorRegistry::default())
    }

    /// Start the worker pool with an injected collator registry.
    pub fn start_with_collators(
        config: ManagerConfig,
        collators: CollatorRegistry,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let manager = Arc::new(Self {
            config: config.clone(),
            collators,
            switch_queue: WorkQueue::default(),
            app_queue: WorkQueue::default(),
            manager_queue: WorkQueue::default(),
            work_mutex: Mutex::new(()),
            work_cond: Condvar::new(),
            active: AtomicBool::new(true),
            workers: Mutex::new(Vec::new()),
            merge_idle: AtomicU32::new(0),
            work_push_ts: Mutex::new(None),
            trees: Mutex::new(Vec::new()),
        });

        let general_workers = config.workers_max - config.merge_threads;
        let mut handles = Vec::with_capacity(config.workers_max);
        for id in 0..config.workers_max {
            let mask = if id < general_workers {
                WORK_SWITCH | WORK_FLUSH | WORK_BLOOM | WORK_DROP
            } else {
                WORK_MERGE | WORK_SWITCH
            };
            let manager = Arc::clone(&manager);
            handles.push(std::thread::spawn(move || manager.worker_loop(id, mask)));
        }
        *manager.workers.lock()? = handles;

        tracing::info!(
            workers = config.workers_max,
            merge_threads = config.merge_threads,
            "lsm manager started"
        );
        Ok(manager)
    }

    pub fn collators(&self) -> &CollatorRegistry {
        &self.collators
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Workers currently blocked on the condition variable with merge work
    /// enabled. Zero under merge pressure signals starvation to the
    /// throttling logic.
    pub fn merge_idle(&self) -> u32 {
        self.merge_idle.load(Ordering::SeqCst)
    }

    /// Open a tree, or return the already-open handle for its name.
    /// Exclusively-opened trees refuse sharing with `Error::Busy`.
    pub fn open_tree(self: &Arc<Self>, name: &str, config: TreeConfig) -> Result<Arc<LsmTree>> {
        let mut trees = self.trees.lock()?;
        trees.retain(|w| w.upgrade().is_some());
        for weak in trees.iter() {
            if let Some(tree) = weak.upgrade() {
                if tree.name() == name {
                    if tree.is_exclusive() {
                        return Err(Error::Busy);
                    }
                    return Ok(tree);
                }
            }
        }

        let tree = LsmTree::open(self, name, config)?;
        trees.push(Arc::downgrade(&tree));
        Ok(tree)
    }

    /// Queue a work unit on the queue its type belongs to and wake a
    /// worker. Non-blocking.
    pub fn enqueue(&self, unit: WorkUnit) {
        match unit.kind {
            WorkKind::Switch => self.switch_queue.push(unit),
            WorkKind::Flush | WorkKind::Bloom | WorkKind::Drop => self.app_queue.push(unit),
            WorkKind::Merge => self.manager_queue.push(unit),
        }
        *self.work_push_ts.lock().unwrap() = Some(Instant::now());

        let _guard = self.work_mutex.lock().unwrap();
        self.work_cond.notify_one();
    }

    /// Remove every queued unit referencing the given tree.
    pub fn discard_tree(&self, tree: &Weak<LsmTree>) -> usize {
        let discarded = self.switch_queue.discard_tree(tree)
            + self.app_queue.discard_tree(tree)
            + self.manager_queue.discard_tree(tree);
        if discarded > 0 {
            tracing::debug!(discarded, "discarded queued units for tree");
        }
        discarded
    }

    /// Total units queued across all three queues.
    pub fn pending_units(&self) -> usize {
        self.switch_queue.len() + self.app_queue.len() + self.manager_queue.len()
    }

    /// Stop the pool: clear ACTIVE, wake everyone, join every worker, and
    /// free remaining queued units unexecuted. Idempotent.
    pub fn stop(&self) -> Result<()> {
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        {
            let _guard = self.work_mutex.lock()?;
            self.work_cond.notify_all();
        }

        let handles = std::mem::take(&mut *self.workers.lock()?);
        for handle in handles {
            handle
                .join()
                .map_err(|_| Error::Io("worker thread panicked".to_string()))?;
        }

        let discarded =
            self.switch_queue.clear() + self.app_queue.clear() + self.manager_queue.clear();
        tracing::info!(discarded, "lsm manager stopped");
        Ok(())
    }

    fn next_unit(&self, mask: u32) -> Option<WorkUnit> {
        if mask & WORK_SWITCH != 0 {
            if let Some(unit) = self.switch_queue.pop() {
                return Some(unit);
            }
        }
        if mask & (WORK_BLOOM | WORK_FLUSH | WORK_DROP) != 0 {
            if let Some(unit) = self.app_queue.pop() {
                return Some(unit);
            }
        }
        if mask & WORK_MERGE != 0 {
            if let Some(unit) = self.manager_queue.pop() {
                return Some(unit);
            }
        }
        None
    }

    fn worker_loop(self: Arc<Self>, id: usize, mask: u32) {
        tracing::debug!(worker = id, mask = mask, "lsm worker started");

        while self.active.load(Ordering::SeqCst) {
            if let Some(unit) = self.next_unit(mask) {
                self.execute(unit);
                continue;
            }

            self.tick(mask);

            let guard = match self.work_mutex.lock() {
                Ok(guard) => guard,
                Err(_) => break,
            };
            if !self.active.load(Ordering::SeqCst) {
                break;
            }
            let merge_worker = mask & WORK_MERGE != 0;
            if merge_worker {
                self.merge_idle.fetch_add(1, Ordering::SeqCst);
            }
            let _ = self
                .work_cond
                .wait_timeout(guard, self.config.work_wait)
                .map(|(guard, _)| drop(guard));
            if merge_worker {
                self.merge_idle.fetch_sub(1, Ordering::SeqCst);
            }
        }

        tracing::debug!(worker = id, "lsm worker stopped");
    }

    /// Speculative maintenance when a worker finds nothing queued: look
    /// over the open trees and queue the work their state calls for.
    fn tick(&self, mask: u32) {
        let trees: Vec<Arc<LsmTree>> = {
            let trees = self.trees.lock().unwrap();
            trees.iter().filter_map(|w| w.upgrade()).collect()
        };

        for tree in trees {
            if !tree.is_active() {
                continue;
            }
            if mask & WORK_FLUSH != 0 && self.app_queue.is_empty() && tree.needs_flush() {
                tree.enqueue_work(WorkKind::Flush, false);
            }
            if mask & WORK_MERGE != 0 && self.manager_queue.is_empty() && tree.needs_merge() {
                tree.enqueue_work(WorkKind::Merge, false);
            }
        }
    }

    fn execute(&self, mut unit: WorkUnit) {
        let Some(tree) = unit.tree.upgrade() else {
            return;
        };
        if !tree.is_active() || tree.work_disabled(unit.kind) {
            Stats::incr(&tree.stats.units_discarded);
            return;
        }

        let result = match unit.kind {
            WorkKind::Switch => tree::switch::work(&tree, unit.force),
            WorkKind::Flush => tree::flush::work(&tree),
            WorkKind::Bloom => tree::bloom_work::work(&tree),
            WorkKind::Drop => tree::drop_chunks::work(&tree),
            WorkKind::Merge => tree::merge::work(&tree),
        };

        match result {
            Ok(()) => Stats::incr(&tree.stats.units_executed),
            Err(Error::Shutdown) => Stats::incr(&tree.stats.units_discarded),
            Err(e) => {
                unit.attempts += 1;
                if unit.attempts < MAX_WORK_RETRIES {
                    tracing::warn!(
                        tree = tree.name(),
                        kind = unit.kind.name(),
                        attempts = unit.attempts,
                        error = %e,
                        "work unit failed, requeueing"
                    );
                    std::thread::sleep(std::time::Duration::from_millis(
                        10u64 << unit.attempts,
                    ));
                    self.enqueue(unit);
                } else {
                    Stats::incr(&tree.stats.work_failures);
                    tree.disable_work(unit.kind);
                    tracing::error!(
                        tree = tree.name(),
                        kind = unit.kind.name(),
                        error = %e,
                        "work type disabled after repeated failures"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_start_and_stop() {
        let manager = LsmManager::start(
            ManagerConfig::default()
                .workers_max(3)
                .merge_threads(1)
                .work_wait(Duration::from_millis(10)),
        )
        .unwrap();

        assert!(manager.is_active());
        manager.stop().unwrap();
        assert!(!manager.is_active());
        assert_eq!(manager.pending_units(), 0);

        // Stopping twice is a no-op.
        manager.stop().unwrap();
    }

    #[test]
    fn test_invalid_pool_rejected() {
        let result = LsmManager::start(ManagerConfig::default().workers_max(2).merge_threads(2));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_enqueue_routes_by_kind() {
        let manager = LsmManager::start(
            ManagerConfig::default()
                .workers_max(1)
                .merge_threads(0)
                .work_wait(Duration::from_millis(10)),
        )
        .unwrap();
        // Stop the pool first so queued units stay observable.
        manager.stop().unwrap();

        manager.switch_queue.push(WorkUnit::new(WorkKind::Switch, false, Weak::new()));
        manager.app_queue.push(WorkUnit::new(WorkKind::Flush, false, Weak::new()));
        manager.manager_queue.push(WorkUnit::new(WorkKind::Merge, false, Weak::new()));

        assert_eq!(manager.switch_queue.len(), 1);
        assert_eq!(manager.app_queue.len(), 1);
        assert_eq!(manager.manager_queue.len(), 1);

        // Priority: switch first, then application, then manager.
        let mask = WORK_SWITCH | WORK_FLUSH | WORK_BLOOM | WORK_DROP | WORK_MERGE;
        assert_eq!(manager.next_unit(mask).unwrap().kind, WorkKind::Switch);
        assert_eq!(manager.next_unit(mask).unwrap().kind, WorkKind::Flush);
        assert_eq!(manager.next_unit(mask).unwrap().kind, WorkKind::Merge);
        assert!(manager.next_unit(mask).is_none());
    }

    #[test]
    fn test_mask_filters_queues() {
        let manager = LsmManager::start(
            ManagerConfig::default()
                .workers_max(1)
                .merge_threads(0)
                .work_wait(Duration::from_millis(10)),
        )
        .unwrap();
        manager.stop().unwrap();

        manager.manager_queue.push(WorkUnit::new(WorkKind::Merge, false, Weak::new()));

        // A general worker never drains the manager queue.
        let general = WORK_SWITCH | WORK_FLUSH | WORK_BLOOM | WORK_DROP;
        assert!(manager.next_unit(general).is_none());

        let merger = WORK_MERGE | WORK_SWITCH;
        assert_eq!(manager.next_unit(merger).unwrap().kind, WorkKind::Merge);
    }
}
