// Process-wide replication health counters
// Values live in atomics and are mirrored to the `metrics` facade

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Counted replication events
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Counter {
    /// Changes applied and appended to the archive
    ChangesCommitted,
    /// Changes dropped before a change id could be allocated
    ChangesFailed,
    /// Pending changes removed after waiting too long for their content
    ChangesKilled,
    /// Change ids skipped after the gap timeout elapsed
    ChangesSkipped,
    /// Commits that had to wait on a gap in the change id sequence
    ChangesWithGap,
    /// Changes queued in front of a higher change id
    ChangesUnaligned,
    /// Quorum requests that failed to collect enough accepts
    QuorumLost,
    /// Archived changes moved out of memory
    GarbageCollected,
}

impl Counter {
    pub const ALL: [Counter; 8] = [
        Counter::ChangesCommitted,
        Counter::ChangesFailed,
        Counter::ChangesKilled,
        Counter::ChangesSkipped,
        Counter::ChangesWithGap,
        Counter::ChangesUnaligned,
        Counter::QuorumLost,
        Counter::GarbageCollected,
    ];

    pub fn metric_name(&self) -> &'static str {
        match self {
            Counter::ChangesCommitted => "strand_changes_committed_total",
            Counter::ChangesFailed => "strand_changes_failed_total",
            Counter::ChangesKilled => "strand_changes_killed_total",
            Counter::ChangesSkipped => "strand_changes_skipped_total",
            Counter::ChangesWithGap => "strand_changes_with_gap_total",
            Counter::ChangesUnaligned => "strand_changes_unaligned_total",
            Counter::QuorumLost => "strand_quorum_lost_total",
            Counter::GarbageCollected => "strand_garbage_collected_total",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Counter::ChangesCommitted => "Total number of committed changes",
            Counter::ChangesFailed => "Total number of changes that failed before allocation",
            Counter::ChangesKilled => "Total number of pending changes killed after a timeout",
            Counter::ChangesSkipped => "Total number of change ids skipped",
            Counter::ChangesWithGap => "Total number of commits that waited on a gap",
            Counter::ChangesUnaligned => "Total number of changes queued out of order",
            Counter::QuorumLost => "Total number of lost quorum requests",
            Counter::GarbageCollected => "Total number of archived changes moved to disk",
        }
    }
}

pub const CHANGE_DURATION_METRIC: &str = "strand_change_duration_seconds";

/// Counters shared by every replication component
#[derive(Debug)]
pub struct Counters {
    values: [AtomicU64; 8],
    total_change_micros: AtomicU64,
    longest_change_micros: AtomicU64,
    started_at: AtomicU64,
}

/// Point-in-time copy of all counters
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CountersSnapshot {
    pub changes_committed: u64,
    pub changes_failed: u64,
    pub changes_killed: u64,
    pub changes_skipped: u64,
    pub changes_with_gap: u64,
    pub changes_unaligned: u64,
    pub quorum_lost: u64,
    pub garbage_collected: u64,
    /// Longest duration from creation to commit, in seconds
    pub longest_change_duration: f64,
    /// Average duration from creation to commit, in seconds
    pub average_change_duration: f64,
    /// Milliseconds since the epoch at which the counters were (re)started
    pub started_at: i64,
}

impl Default for Counters {
    fn default() -> Self {
        Self::new()
    }
}

impl Counters {
    pub fn new() -> Self {
        Self {
            values: Default::default(),
            total_change_micros: AtomicU64::new(0),
            longest_change_micros: AtomicU64::new(0),
            started_at: AtomicU64::new(chrono::Utc::now().timestamp_millis() as u64),
        }
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        if n == 0 {
            return;
        }
        self.values[counter as usize].fetch_add(n, Ordering::Relaxed);
        metrics::counter!(counter.metric_name()).increment(n);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter as usize].load(Ordering::Relaxed)
    }

    /// Count a commit together with the time it took since the change was created
    pub fn record_commit(&self, duration: Duration) {
        self.incr(Counter::ChangesCommitted);

        let micros = duration.as_micros().min(u64::MAX as u128) as u64;
        self.total_change_micros.fetch_add(micros, Ordering::Relaxed);
        self.longest_change_micros
            .fetch_max(micros, Ordering::Relaxed);
        metrics::histogram!(CHANGE_DURATION_METRIC).record(duration.as_secs_f64());
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        let committed = self.get(Counter::ChangesCommitted);
        let total = self.total_change_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;

        CountersSnapshot {
            changes_committed: committed,
            changes_failed: self.get(Counter::ChangesFailed),
            changes_killed: self.get(Counter::ChangesKilled),
            changes_skipped: self.get(Counter::ChangesSkipped),
            changes_with_gap: self.get(Counter::ChangesWithGap),
            changes_unaligned: self.get(Counter::ChangesUnaligned),
            quorum_lost: self.get(Counter::QuorumLost),
            garbage_collected: self.get(Counter::GarbageCollected),
            longest_change_duration: self.longest_change_micros.load(Ordering::Relaxed) as f64
                / 1_000_000.0,
            average_change_duration: if committed > 0 {
                total / committed as f64
            } else {
                0.0
            },
            started_at: self.started_at.load(Ordering::Relaxed) as i64,
        }
    }

    /// Zero every counter and restart the clock
    pub fn reset(&self) {
        for value in &self.values {
            value.store(0, Ordering::Relaxed);
        }
        self.total_change_micros.store(0, Ordering::Relaxed);
        self.longest_change_micros.store(0, Ordering::Relaxed);
        self.started_at.store(
            chrono::Utc::now().timestamp_millis() as u64,
            Ordering::Relaxed,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_incr() {
        let counters = Counters::new();
        counters.incr(Counter::QuorumLost);
        counters.incr(Counter::QuorumLost);
        counters.add(Counter::GarbageCollected, 10);
        counters.add(Counter::ChangesSkipped, 0);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.quorum_lost, 2);
        assert_eq!(snapshot.garbage_collected, 10);
        assert_eq!(snapshot.changes_skipped, 0);
        assert!(snapshot.started_at > 0);
    }

    #[test]
    fn test_commit_durations() {
        let counters = Counters::new();
        counters.record_commit(Duration::from_millis(100));
        counters.record_commit(Duration::from_millis(300));

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.changes_committed, 2);
        assert!((snapshot.longest_change_duration - 0.3).abs() < 1e-9);
        assert!((snapshot.average_change_duration - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_reset() {
        let counters = Counters::new();
        counters.incr(Counter::ChangesKilled);
        counters.record_commit(Duration::from_secs(1));
        counters.reset();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.changes_killed, 0);
        assert_eq!(snapshot.changes_committed, 0);
        assert_eq!(snapshot.average_change_duration, 0.0);
    }

    #[test]
    fn test_metric_names_are_unique() {
        let mut names: Vec<_> = Counter::ALL.iter().map(|c| c.metric_name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), Counter::ALL.len());
    }
}
