use std::sync::atomic::{AtomicU64, Ordering};

/// Lifecycle counters for one tree. All counters are monotonically
/// increasing; [`Stats::snapshot`] reads them into a plain struct for
/// logging and assertions.
#[derive(Debug, Default)]
pub struct Stats {
    pub(crate) switches: AtomicU64,
    pub(crate) flushes: AtomicU64,
    pub(crate) blooms_built: AtomicU64,
    pub(crate) merges: AtomicU64,
    pub(crate) chunks_dropped: AtomicU64,
    pub(crate) searches: AtomicU64,
    pub(crate) bloom_skips: AtomicU64,
    pub(crate) bloom_false_positives: AtomicU64,
    pub(crate) units_queued: AtomicU64,
    pub(crate) units_executed: AtomicU64,
    pub(crate) units_discarded: AtomicU64,
    pub(crate) work_failures: AtomicU64,
    pub(crate) conflicts: AtomicU64,
    pub(crate) busy_rejections: AtomicU64,
    pub(crate) cursor_rebuilds: AtomicU64,
}

/// A point-in-time copy of the tree's counters.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsSnapshot {
    pub switches: u64,
    pub flushes: u64,
    pub blooms_built: u64,
    pub merges: u64,
    pub chunks_dropped: u64,
    pub searches: u64,
    pub bloom_skips: u64,
    pub bloom_false_positives: u64,
    pub units_queued: u64,
    pub units_executed: u64,
    pub units_discarded: u64,
    pub work_failures: u64,
    pub conflicts: u64,
    pub busy_rejections: u64,
    pub cursor_rebuilds: u64,
}

impl Stats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            switches: self.switches.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            blooms_built: self.blooms_built.load(Ordering::Relaxed),
            merges: self.merges.load(Ordering::Relaxed),
            chunks_dropped: self.chunks_dropped.load(Ordering::Relaxed),
            searches: self.searches.load(Ordering::Relaxed),
            bloom_skips: self.bloom_skips.load(Ordering::Relaxed),
            bloom_false_positives: self.bloom_false_positives.load(Ordering::Relaxed),
            units_queued: self.units_queued.load(Ordering::Relaxed),
            units_executed: self.units_executed.load(Ordering::Relaxed),
            units_discarded: self.units_discarded.load(Ordering::Relaxed),
            work_failures: self.work_failures.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            busy_rejections: self.busy_rejections.load(Ordering::Relaxed),
            cursor_rebuilds: self.cursor_rebuilds.load(Ordering::Relaxed),
        }
    }

    /// Log the counters as one structured event.
    pub fn log(&self, tree: &str) {
        let snap = self.snapshot();
        tracing::info!(
            tree = tree,
            switches = snap.switches,
            flushes = snap.flushes,
            blooms_built = snap.blooms_built,
            merges = snap.merges,
            chunks_dropped = snap.chunks_dropped,
            searches = snap.searches,
            bloom_skips = snap.bloom_skips,
            units_executed = snap.units_executed,
            conflicts = snap.conflicts,
            "tree statistics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let stats = Stats::default();
        Stats::incr(&stats.switches);
        Stats::incr(&stats.switches);
        Stats::incr(&stats.flushes);

        let snap = stats.snapshot();
        assert_eq!(snap.switches, 2);
        assert_eq!(snap.flushes, 1);
        assert_eq!(snap.merges, 0);
    }
}
