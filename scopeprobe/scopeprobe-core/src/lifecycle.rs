//! Process lifetime from exec to exit.
//!
//! A span is opened at exec with insert-if-absent: a span left over from a
//! process that never reported its exit blocks the new one (counted as
//! `stale_span`). Exit always removes the span after emitting.
//!
//! When built with a counter table the exit event carries a copy of that
//! scope's hardware counters, read without synchronisation at the moment of
//! exit. The scope is the one recorded at exec.

use std::sync::Arc;

use log::trace;
use scopeprobe_common::{LifecycleEvent, PerfStats, ProcessSpan};

use crate::channel::{ChannelConsumer, EventChannel};
use crate::config::LifecycleConfig;
use crate::error::ProbeError;
use crate::filter::AllowList;
use crate::hardware::CounterTable;
use crate::host::Host;
use crate::stats::ProbeStats;
use crate::table::{FixedTable, TableError, UpdateMode};

#[derive(Debug)]
pub struct LifecycleTracer {
    allow: AllowList,
    spans: FixedTable<u32, ProcessSpan>,
    events: Arc<EventChannel<LifecycleEvent>>,
    counters: Option<Arc<CounterTable>>,
    stats: ProbeStats,
}

impl LifecycleTracer {
    /// `counters` enables the hardware snapshot on exit.
    pub fn new(
        config: &LifecycleConfig,
        counters: Option<Arc<CounterTable>>,
    ) -> Result<Self, ProbeError> {
        Ok(Self {
            allow: AllowList::new("process_scopes", config.allow_capacity)?,
            spans: FixedTable::new("process_spans", config.span_capacity)?,
            events: Arc::new(EventChannel::with_byte_size(
                "process_events",
                config.channel_bytes,
            )?),
            counters,
            stats: ProbeStats::new(),
        })
    }

    pub fn allow_list(&self) -> &AllowList {
        &self.allow
    }

    pub fn merges_counters(&self) -> bool {
        self.counters.is_some()
    }

    pub fn on_exec<H: Host + ?Sized>(&self, host: &H) {
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
        let span = ProcessSpan {
            start_timestamp: host.now_ns(),
            pid,
            scope_id: scope,
        };
        match self.spans.insert(pid, &span, UpdateMode::NoExist) {
            Ok(()) => {}
            Err(TableError::Exists) => {
                self.stats.record_stale_span();
                trace!("process_spans: pid {} already open, exec ignored", pid);
            }
            Err(err) => {
                self.stats.record_table_error(&err);
                trace!("process_spans: pid {} not tracked: {}", pid, err);
            }
        }
    }

    pub fn on_exit<H: Host + ?Sized>(&self, host: &H) {
        let pid = host.current_tgid();
        let Some(span) = self.spans.take(pid) else {
            return;
        };
        self.stats.record_hook();

        let end_timestamp = host.now_ns();
        let event = LifecycleEvent {
            pid: span.pid,
            scope_id: span.scope_id,
            start_timestamp: span.start_timestamp,
            end_timestamp,
            latency: end_timestamp.saturating_sub(span.start_timestamp),
            hw_stats: self.counter_snapshot(span.scope_id),
        };

        self.stats.record_emit(self.events.output(&event));
    }

    fn counter_snapshot(&self, scope: u32) -> PerfStats {
        self.counters
            .as_ref()
            .and_then(|table| table.get(scope))
            .map(|entry| entry.load())
            .unwrap_or_default()
    }

    pub fn consumer(&self) -> Option<ChannelConsumer<LifecycleEvent>> {
        self.events.consumer()
    }

    pub fn events(&self) -> &EventChannel<LifecycleEvent> {
        &self.events
    }

    pub fn pending(&self) -> usize {
        self.spans.len()
    }

    pub fn stats(&self) -> &ProbeStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimHost, SimTask};

    fn tracer(counters: Option<Arc<CounterTable>>) -> LifecycleTracer {
        LifecycleTracer::new(&LifecycleConfig::default(), counters).unwrap()
    }

    #[test]
    fn exec_then_exit_emits_and_clears() {
        let tracer = tracer(None);
        tracer.allow_list().allow(7).unwrap();
        let mut consumer = tracer.consumer().unwrap();
        let host = SimHost::new();
        let task = host.spawn(SimTask::process(300, Some(7)));
        let cpu = host.running(task, 0);

        host.set_time(10_000);
        tracer.on_exec(&cpu);
        host.set_time(12_500);
        tracer.on_exit(&cpu);
        tracer.on_exit(&cpu);

        let events = consumer.drain();
        assert_eq!(events.len(), 1);
        let event = events[0];
        assert_eq!((event.pid, event.scope_id), (300, 7));
        assert_eq!(event.latency, 2_500);
        assert_eq!(event.hw_stats, PerfStats::default());
        assert_eq!(tracer.pending(), 0);
    }

    #[test]
    fn stale_span_rejects_new_exec() {
        let tracer = tracer(None);
        tracer.allow_list().allow(7).unwrap();
        let mut consumer = tracer.consumer().unwrap();
        let host = SimHost::new();
        let task = host.spawn(SimTask::process(300, Some(7)));
        let cpu = host.running(task, 0);

        host.set_time(100);
        tracer.on_exec(&cpu);
        host.set_time(900);
        tracer.on_exec(&cpu);
        host.set_time(1_000);
        tracer.on_exit(&cpu);

        let event = consumer.poll().unwrap();
        assert_eq!(event.start_timestamp, 100);
        assert_eq!(event.latency, 900);
        assert_eq!(tracer.stats().snapshot().stale_span, 1);
    }

    #[test]
    fn exit_merges_counters_of_exec_scope() {
        let counters: Arc<CounterTable> = Arc::new(FixedTable::new("hw", 4).unwrap());
        let stats = PerfStats {
            cycles: 42,
            instructions: 84,
            ..PerfStats::default()
        };
        counters.insert(7, &stats, UpdateMode::Any).unwrap();

        let tracer = tracer(Some(Arc::clone(&counters)));
        tracer.allow_list().allow(7).unwrap();
        let mut consumer = tracer.consumer().unwrap();
        let host = SimHost::new();
        let task = host.spawn(SimTask::process(1, Some(7)));
        let cpu = host.running(task, 0);

        tracer.on_exec(&cpu);
        // Moved out of the scope before exiting.
        host.update(task, |t| t.scope = None);
        tracer.on_exit(&cpu);

        assert_eq!(consumer.poll().unwrap().hw_stats, stats);
        assert_eq!(counters.get(7).unwrap().load(), stats, "merge is read-only");
    }

    #[test]
    fn unmonitored_exec_is_ignored() {
        let tracer = tracer(None);
        tracer.allow_list().allow(7).unwrap();
        let host = SimHost::new();
        let task = host.spawn(SimTask::process(2, Some(8)));
        let cpu = host.running(task, 0);

        tracer.on_exec(&cpu);
        tracer.on_exit(&cpu);
        assert_eq!(tracer.pending(), 0);
        assert_eq!(tracer.events().submitted(), 0);
    }

    #[test]
    fn racing_exits_report_a_process_once() {
        const ROUNDS: u64 = 200;
        let tracer = tracer(None);
        tracer.allow_list().allow(7).unwrap();
        let mut consumer = tracer.consumer().unwrap();
        let host = SimHost::new();
        let task = host.spawn(SimTask::process(64, Some(7)));

        for round in 0..ROUNDS {
            host.set_time(round * 1_000);
            tracer.on_exec(&host.running(task, 0));
            std::thread::scope(|s| {
                for cpu in 0..4 {
                    let view = host.running(task, cpu);
                    let tracer = &tracer;
                    s.spawn(move || tracer.on_exit(&view));
                }
            });
        }

        assert_eq!(consumer.drain().len() as u64, ROUNDS);
        assert_eq!(tracer.pending(), 0);
        assert_eq!(tracer.stats().snapshot().stale_span, 0);
    }
}
