use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::table::TableError;

/// Per-subsystem drop and delivery counters.
///
/// Handlers have no way to report failure, so this is the only trace a
/// silent return leaves. Bumped from the hot path, hence relaxed atomics.
/// End hooks with no open span are expected misses and leave no trace at
/// all, not even in `hooks`.
#[derive(Debug, Default)]
pub struct ProbeStats {
    hooks: AtomicU64,
    filtered: AtomicU64,
    unresolved_scope: AtomicU64,
    table_full: AtomicU64,
    reserved_key: AtomicU64,
    stale_span: AtomicU64,
    emitted: AtomicU64,
    dropped_events: AtomicU64,
}

impl ProbeStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_hook(&self) {
        self.hooks.fetch_add(1, Ordering::Relaxed);
    }

    /// Scope resolved but not on the allow-list.
    #[inline]
    pub fn record_filtered(&self) {
        self.filtered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_unresolved(&self) {
        self.unresolved_scope.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_table_full(&self) {
        self.table_full.fetch_add(1, Ordering::Relaxed);
    }

    /// Route a failed table write to the counter naming its cause. A key
    /// that collides with a slot marker is not a capacity problem.
    #[inline]
    pub fn record_table_error(&self, err: &TableError) {
        match err {
            TableError::Full { .. } => self.record_table_full(),
            TableError::ReservedKey => {
                self.reserved_key.fetch_add(1, Ordering::Relaxed);
            }
            TableError::Exists => self.record_stale_span(),
            TableError::NotFound => {}
        }
    }

    #[inline]
    pub fn record_stale_span(&self) {
        self.stale_span.fetch_add(1, Ordering::Relaxed);
    }

    /// Outcome of one emit attempt.
    #[inline]
    pub fn record_emit(&self, delivered: bool) {
        if delivered {
            self.emitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.dropped_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hooks: self.hooks.load(Ordering::Relaxed),
            filtered: self.filtered.load(Ordering::Relaxed),
            unresolved_scope: self.unresolved_scope.load(Ordering::Relaxed),
            table_full: self.table_full.load(Ordering::Relaxed),
            reserved_key: self.reserved_key.load(Ordering::Relaxed),
            stale_span: self.stale_span.load(Ordering::Relaxed),
            emitted: self.emitted.load(Ordering::Relaxed),
            dropped_events: self.dropped_events.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub hooks: u64,
    pub filtered: u64,
    pub unresolved_scope: u64,
    pub table_full: u64,
    pub reserved_key: u64,
    pub stale_span: u64,
    pub emitted: u64,
    pub dropped_events: u64,
}

/// Counters for every subsystem, as returned by `Probes::stats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProbesSnapshot {
    pub function: StatsSnapshot,
    pub hardware: StatsSnapshot,
    pub cache: StatsSnapshot,
    pub migration: StatsSnapshot,
    pub lifecycle: StatsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let stats = ProbeStats::new();
        stats.record_hook();
        stats.record_hook();
        stats.record_filtered();
        stats.record_emit(true);
        stats.record_emit(false);

        let snap = stats.snapshot();
        assert_eq!(snap.hooks, 2);
        assert_eq!(snap.filtered, 1);
        assert_eq!(snap.emitted, 1);
        assert_eq!(snap.dropped_events, 1);
        assert_eq!(snap.table_full, 0);
    }

    #[test]
    fn table_errors_are_counted_by_cause() {
        let stats = ProbeStats::new();
        stats.record_table_error(&TableError::Full { capacity: 4 });
        stats.record_table_error(&TableError::ReservedKey);
        stats.record_table_error(&TableError::ReservedKey);
        stats.record_table_error(&TableError::Exists);
        stats.record_table_error(&TableError::NotFound);

        let snap = stats.snapshot();
        assert_eq!(snap.table_full, 1);
        assert_eq!(snap.reserved_key, 2);
        assert_eq!(snap.stale_span, 1);
    }

    #[test]
    fn snapshot_serializes() {
        let stats = ProbeStats::new();
        stats.record_table_full();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["table_full"], 1);
        assert_eq!(json["stale_span"], 0);
    }
}
