//! Last-level cache access classification per (pid, cpu).
//!
//! Every access bumps four counters with four independent atomic adds: the
//! category reference count, the category hit or miss count, the matching
//! total hit or miss count and `total_references`. Readers can catch the
//! record between adds, so the totals agree with the categories only once
//! in-flight accesses have finished.
//!
//! Accumulators are created on first touch through the table's
//! insert-if-absent. A racing first toucher that finds the key before the
//! winner has written the zeroed record can still lose its increments to
//! that write.

use log::trace;
use scopeprobe_common::{cache_key, CacheAccess, CacheStats};

use crate::config::CacheConfig;
use crate::error::ProbeError;
use crate::filter::AllowList;
use crate::host::Host;
use crate::stats::ProbeStats;
use crate::table::FixedTable;

#[derive(Debug)]
pub struct CacheClassifier {
    allow: AllowList,
    table: FixedTable<u64, CacheStats>,
    stats: ProbeStats,
}

impl CacheClassifier {
    pub fn new(config: &CacheConfig) -> Result<Self, ProbeError> {
        Ok(Self {
            allow: AllowList::new("llc_scopes", config.allow_capacity)?,
            table: FixedTable::new("llc_stats", config.table_capacity)?,
            stats: ProbeStats::new(),
        })
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow
    }

    pub fn on_access<H: Host + ?Sized>(&self, host: &H, access: CacheAccess) {
        self.stats.record_hook();
        let Some(scope) = host.current_scope() else {
            self.stats.record_unresolved();
            return;
        };
        if !self.allow.is_monitored(scope) {
            self.stats.record_filtered();
            return;
        }

        let pid = host.current_tgid();
        let cpu = host.current_cpu();
        let entry = match self
            .table
            .get_or_insert_with(cache_key(pid, cpu), || CacheStats::new(pid, cpu, scope))
        {
            Ok(entry) => entry,
            Err(err) => {
                self.stats.record_table_error(&err);
                trace!("llc_stats: pid {} cpu {} not tracked: {}", pid, cpu, err);
                return;
            }
        };

        entry.fetch_add(access.references_offset(), 1);
        entry.fetch_add(access.outcome_offset(), 1);
        entry.fetch_add(access.total_offset(), 1);
        entry.fetch_add(CacheAccess::TOTAL_REFERENCES_OFFSET, 1);
    }

    pub fn hook(&self, access: CacheAccess) -> CacheHook<'_> {
        CacheHook {
            classifier: self,
            access,
        }
    }

    pub fn snapshot(&self, pid: u32, cpu: u32) -> Option<CacheStats> {
        self.table.get(cache_key(pid, cpu)).map(|entry| entry.load())
    }

    /// Every accumulator, for periodic polling.
    pub fn records(&self) -> Vec<CacheStats> {
        self.table.iter().map(|(_, stats)| stats).collect()
    }

    pub fn stats(&self) -> &ProbeStats {
        &self.stats
    }
}

/// [`CacheClassifier::on_access`] bound to one of the six access kinds.
#[derive(Debug, Clone, Copy)]
pub struct CacheHook<'a> {
    classifier: &'a CacheClassifier,
    access: CacheAccess,
}

impl CacheHook<'_> {
    pub fn access(&self) -> CacheAccess {
        self.access
    }

    pub fn fire<H: Host + ?Sized>(&self, host: &H) {
        self.classifier.on_access(host, self.access);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimHost, SimTask};
    use scopeprobe_common::{CacheOp, CacheOutcome};

    fn classifier() -> CacheClassifier {
        CacheClassifier::new(&CacheConfig::default()).unwrap()
    }

    #[test]
    fn classifies_each_kind() {
        let classifier = classifier();
        classifier.allow_list().allow(7).unwrap();
        let host = SimHost::new();
        let task = host.spawn(SimTask::process(42, Some(7)));
        let cpu2 = host.running(task, 2);

        for access in CacheAccess::ALL {
            classifier.hook(access).fire(&cpu2);
        }
        classifier.on_access(&cpu2, CacheAccess::new(CacheOp::Read, CacheOutcome::Miss));

        let stats = classifier.snapshot(42, 2).unwrap();
        assert_eq!((stats.pid, stats.cpu, stats.scope_id), (42, 2, 7));
        assert_eq!(stats.read_references, 3);
        assert_eq!(stats.read_misses, 2);
        assert_eq!(stats.read_hits, 1);
        assert_eq!(stats.write_references, 2);
        assert_eq!(stats.prefetch_hits, 1);
        assert_eq!(stats.total_references, 7);
        assert_eq!(stats.total_hits, 3);
        assert_eq!(stats.total_misses, 4);
    }

    #[test]
    fn separate_accumulator_per_cpu() {
        let classifier = classifier();
        classifier.allow_list().allow(1).unwrap();
        let host = SimHost::new();
        let task = host.spawn(SimTask::process(10, Some(1)));
        let hit = CacheAccess::new(CacheOp::Write, CacheOutcome::Hit);

        classifier.on_access(&host.running(task, 0), hit);
        classifier.on_access(&host.running(task, 1), hit);
        classifier.on_access(&host.running(task, 1), hit);

        assert_eq!(classifier.snapshot(10, 0).unwrap().write_hits, 1);
        assert_eq!(classifier.snapshot(10, 1).unwrap().write_hits, 2);
        assert_eq!(classifier.records().len(), 2);
    }

    #[test]
    fn unmonitored_scope_creates_nothing() {
        let classifier = classifier();
        classifier.allow_list().allow(1).unwrap();
        let host = SimHost::new();
        let outsider = host.spawn(SimTask::process(10, Some(2)));
        let orphan = host.spawn(SimTask::process(11, None));

        for access in CacheAccess::ALL {
            classifier.on_access(&host.running(outsider, 0), access);
            classifier.on_access(&host.running(orphan, 0), access);
        }
        assert!(classifier.records().is_empty());
        let snap = classifier.stats().snapshot();
        assert_eq!(snap.filtered, 6);
        assert_eq!(snap.unresolved_scope, 6);
    }

    #[test]
    fn full_table_drops_new_keys() {
        let classifier = CacheClassifier::new(&CacheConfig {
            table_capacity: 1,
            ..CacheConfig::default()
        })
        .unwrap();
        classifier.allow_list().allow(1).unwrap();
        let host = SimHost::new();
        let task = host.spawn(SimTask::process(10, Some(1)));
        let miss = CacheAccess::new(CacheOp::Prefetch, CacheOutcome::Miss);

        classifier.on_access(&host.running(task, 0), miss);
        classifier.on_access(&host.running(task, 1), miss);

        assert!(classifier.snapshot(10, 1).is_none());
        assert_eq!(classifier.snapshot(10, 0).unwrap().prefetch_misses, 1);
        assert_eq!(classifier.stats().snapshot().table_full, 1);
    }

    #[test]
    fn marker_colliding_key_is_counted_apart_from_full() {
        let classifier = classifier();
        classifier.allow_list().allow(1).unwrap();
        let host = SimHost::new();
        let task = host.spawn(SimTask::process(u32::MAX, Some(1)));

        classifier.on_access(
            &host.running(task, u32::MAX - 1),
            CacheAccess::new(CacheOp::Read, CacheOutcome::Hit),
        );

        let snap = classifier.stats().snapshot();
        assert_eq!(snap.reserved_key, 1);
        assert_eq!(snap.table_full, 0);
        assert!(classifier.records().is_empty());
    }
}
