//! Latency between a scheduler migration decision and the task actually
//! running again.
//!
//! MIGRATE-OUT opens a span keyed by (scope, pid) for an allow-listed task;
//! the next SWITCH-IN of that task closes it and emits one
//! [`MigrationEvent`].

use std::sync::Arc;

use log::trace;
use scopeprobe_common::{migration_key, MigrationEvent};

use crate::channel::{ChannelConsumer, EventChannel};
use crate::config::MigrationConfig;
use crate::error::ProbeError;
use crate::filter::AllowList;
use crate::host::{Host, TaskRef};
use crate::stats::ProbeStats;
use crate::table::{FixedTable, UpdateMode};

#[derive(Debug)]
pub struct MigrationTracker {
    allow: AllowList,
    spans: FixedTable<u64, MigrationEvent>,
    events: Arc<EventChannel<MigrationEvent>>,
    stats: ProbeStats,
}

impl MigrationTracker {
    pub fn new(config: &MigrationConfig) -> Result<Self, ProbeError> {
        Ok(Self {
            allow: AllowList::new("migration_scopes", config.allow_capacity)?,
            spans: FixedTable::new("migration_spans", config.span_capacity)?,
            events: Arc::new(EventChannel::with_byte_size(
                "migration_events",
                config.channel_bytes,
            )?),
            stats: ProbeStats::new(),
        })
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow
    }

    /// `task` is about to move to `dest_cpu`. A repeated migration before
    /// the task runs again restarts the span.
    pub fn on_migrate<H: Host + ?Sized>(&self, host: &H, task: TaskRef, dest_cpu: u32) {
        self.stats.record_hook();
        let Some(scope) = host.resolve_scope(task) else {
            self.stats.record_unresolved();
            return;
        };
        if !self.allow.is_monitored(scope) {
            self.stats.record_filtered();
            return;
        }
        let (Some(pid), Some(source_cpu)) = (host.task_pid(task), host.task_cpu(task)) else {
            self.stats.record_unresolved();
            return;
        };

        let span = MigrationEvent {
            timestamp_start: host.now_ns(),
            timestamp_end: 0,
            latency: 0,
            pid,
            source_cpu,
            target_cpu: dest_cpu,
            scope_id: scope,
        };
        if let Err(err) = self
            .spans
            .insert(migration_key(scope, pid), &span, UpdateMode::Any)
        {
            self.stats.record_table_error(&err);
            trace!("migration_spans: pid {} scope {} not tracked: {}", pid, scope, err);
        }
    }

    /// `next` is being switched in. Only a task with an open span does any
    /// work.
    pub fn on_switch_in<H: Host + ?Sized>(&self, host: &H, next: TaskRef) {
        let (Some(scope), Some(pid)) = (host.resolve_scope(next), host.task_pid(next)) else {
            return;
        };
        let Some(mut event) = self.spans.take(migration_key(scope, pid)) else {
            return;
        };
        self.stats.record_hook();

        event.timestamp_end = host.now_ns();
        event.latency = event.timestamp_end.saturating_sub(event.timestamp_start);
        trace!(
            "migration latency {} ns, pid {}, scope {}, cpu {} -> {}",
            event.latency,
            event.pid,
            event.scope_id,
            event.source_cpu,
            event.target_cpu
        );

        self.stats.record_emit(self.events.output(&event));
    }

    pub fn consumer(&self) -> Option<ChannelConsumer<MigrationEvent>> {
        self.events.consumer()
    }

    pub fn events(&self) -> &EventChannel<MigrationEvent> {
        &self.events
    }

    pub fn pending(&self) -> usize {
        self.spans.len()
    }

    pub fn stats(&self) -> &ProbeStats {
        &self.stats
    }
}
