//! Per-scope hardware counter aggregation.
//!
//! One accumulator per monitored scope, created by the collaborator through
//! [`HardwareCounters::monitor`]. Counter-overflow samples only ever look an
//! accumulator up; a scope without one is simply not monitored. Each
//! [`CounterKind`] owns exactly one field, so the generic handler is
//! registered once per kind instead of written once per kind.

use std::sync::Arc;

use log::{info, trace};
use scopeprobe_common::{CounterKind, PerfStats, ScopeId};

use crate::config::HardwareConfig;
use crate::error::ProbeError;
use crate::host::Host;
use crate::stats::ProbeStats;
use crate::table::{FixedTable, TableError};

/// Scope id -> accumulated counters. Shared with the lifecycle tracer.
pub type CounterTable = FixedTable<ScopeId, PerfStats>;

#[derive(Debug)]
pub struct HardwareCounters {
    table: Arc<CounterTable>,
    pin_name: String,
    stats: ProbeStats,
}

impl HardwareCounters {
    pub fn new(config: &HardwareConfig) -> Result<Self, ProbeError> {
        Ok(Self {
            table: Arc::new(FixedTable::new("hw_stats", config.table_capacity)?),
            pin_name: config.pin_name.clone(),
            stats: ProbeStats::new(),
        })
    }

    /// Start accumulating for `scope`. Existing counters are kept.
    pub fn monitor(&self, scope: ScopeId) -> Result<(), TableError> {
        self.table.get_or_insert_with(scope, PerfStats::default)?;
        info!("hw_stats: monitoring scope {}", scope);
        Ok(())
    }

    pub fn unmonitor(&self, scope: ScopeId) -> Result<(), TableError> {
        self.table.remove(scope)?;
        info!("hw_stats: stopped monitoring scope {}", scope);
        Ok(())
    }

    /// The generic counter-overflow handler.
    pub fn on_sample<H: Host + ?Sized>(&self, host: &H, kind: CounterKind, sample_period: u64) {
        self.stats.record_hook();
        let Some(scope) = host.current_scope() else {
            self.stats.record_unresolved();
            return;
        };
        let Some(entry) = self.table.get(scope) else {
            self.stats.record_filtered();
            return;
        };
        if entry.fetch_add(kind.field_offset(), sample_period).is_none() {
            trace!("hw_stats: {} has no field", kind.name());
        }
    }

    pub fn hook(&self, kind: CounterKind) -> CounterHook<'_> {
        CounterHook {
            counters: self,
            kind,
        }
    }

    /// One handler per counter kind, in [`CounterKind::ALL`] order.
    pub fn hooks(&self) -> impl Iterator<Item = CounterHook<'_>> + Clone + '_ {
        CounterKind::ALL.into_iter().map(|kind| self.hook(kind))
    }

    pub fn snapshot(&self, scope: ScopeId) -> Option<PerfStats> {
        self.table.get(scope).map(|entry| entry.load())
    }

    pub fn table(&self) -> &Arc<CounterTable> {
        &self.table
    }

    pub fn pin_name(&self) -> &str {
        &self.pin_name
    }

    pub fn stats(&self) -> &ProbeStats {
        &self.stats
    }
}

/// [`HardwareCounters::on_sample`] bound to one counter kind, the unit a
/// collaborator attaches to a perf event.
#[derive(Debug, Clone, Copy)]
pub struct CounterHook<'a> {
    counters: &'a HardwareCounters,
    kind: CounterKind,
}

impl CounterHook<'_> {
    pub fn kind(&self) -> CounterKind {
        self.kind
    }

    pub fn fire<H: Host + ?Sized>(&self, host: &H, sample_period: u64) {
        self.counters.on_sample(host, self.kind, sample_period);
    }
}
