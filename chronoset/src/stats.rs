//! Process-wide counters, collapsed to plain atomics since this crate
//! has one farm, not one pool per shard per role.
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Counters {
    pub inserts: AtomicU64,
    pub deletes: AtomicU64,
    pub scores: AtomicU64,
    pub selects: AtomicU64,
    pub repairs_queued: AtomicU64,
    pub repairs_dropped: AtomicU64,
    pub write_quorum_failures: AtomicU64,
    pub corrupted_states: AtomicU64,
}

/// Point-in-time snapshot, cheap to clone and log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub inserts: u64,
    pub deletes: u64,
    pub scores: u64,
    pub selects: u64,
    pub repairs_queued: u64,
    pub repairs_dropped: u64,
    pub write_quorum_failures: u64,
    pub corrupted_states: u64,
}

impl Counters {
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            inserts: self.inserts.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            scores: self.scores.load(Ordering::Relaxed),
            selects: self.selects.load(Ordering::Relaxed),
            repairs_queued: self.repairs_queued.load(Ordering::Relaxed),
            repairs_dropped: self.repairs_dropped.load(Ordering::Relaxed),
            write_quorum_failures: self.write_quorum_failures.load(Ordering::Relaxed),
            corrupted_states: self.corrupted_states.load(Ordering::Relaxed),
        }
    }

    pub fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_score(&self) {
        self.scores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_select(&self) {
        self.selects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_repairs_queued(&self, n: u64) {
        self.repairs_queued.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_repair_dropped(&self) {
        self.repairs_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_quorum_failure(&self) {
        self.write_quorum_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_corrupted_state(&self) {
        self.corrupted_states.fetch_add(1, Ordering::Relaxed);
    }
}

static COUNTERS: Counters = Counters {
    inserts: AtomicU64::new(0),
    deletes: AtomicU64::new(0),
    scores: AtomicU64::new(0),
    selects: AtomicU64::new(0),
    repairs_queued: AtomicU64::new(0),
    repairs_dropped: AtomicU64::new(0),
    write_quorum_failures: AtomicU64::new(0),
    corrupted_states: AtomicU64::new(0),
};

/// The process-wide counters. A single static suffices since one process
/// runs exactly one farm.
pub fn counters() -> &'static Counters {
    &COUNTERS
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_snapshot_reflects_recorded_events() {
        let counters = Counters::default();
        counters.record_insert();
        counters.record_insert();
        counters.record_delete();
        let snap = counters.snapshot();
        assert_eq!(snap.inserts, 2);
        assert_eq!(snap.deletes, 1);
        assert_eq!(snap.scores, 0);
    }
}
