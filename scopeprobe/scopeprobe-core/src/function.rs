//! Per-thread function latency.
//!
//! ENTRY stamps the calling thread's start time, EXIT turns it into a
//! [`FunctionEvent`]. No scope filtering: the probe is attached to one
//! binary and every thread that runs it is measured.

use std::sync::Arc;

use log::trace;
use scopeprobe_common::{tgid_of, FunctionEvent};

use crate::channel::{ChannelConsumer, EventChannel};
use crate::config::FunctionConfig;
use crate::error::ProbeError;
use crate::host::Host;
use crate::stats::ProbeStats;
use crate::table::{FixedTable, UpdateMode};

#[derive(Debug)]
pub struct FunctionTracer {
    /// pid_tgid -> start timestamp.
    spans: FixedTable<u64, u64>,
    events: Arc<EventChannel<FunctionEvent>>,
    stats: ProbeStats,
}

impl FunctionTracer {
    pub fn new(config: &FunctionConfig) -> Result<Self, ProbeError> {
        Ok(Self {
            spans: FixedTable::new("function_spans", config.span_capacity)?,
            events: Arc::new(EventChannel::with_byte_size(
                "function_events",
                config.channel_bytes,
            )?),
            stats: ProbeStats::new(),
        })
    }

    /// A re-entrant call overwrites the outer call's start time.
    pub fn on_entry<H: Host + ?Sized>(&self, host: &H) {
        self.stats.record_hook();
        let id = host.current_pid_tgid();
        let start = host.now_ns();
        if let Err(err) = self.spans.insert(id, &start, UpdateMode::Any) {
            self.stats.record_table_error(&err);
            trace!("function_spans: entry of {:#x} not recorded: {}", id, err);
        }
    }

    pub fn on_exit<H: Host + ?Sized>(&self, host: &H) {
        let id = host.current_pid_tgid();
        // The span goes whether or not the event makes it out.
        let Some(start) = self.spans.take(id) else {
            return;
        };
        self.stats.record_hook();

        let event = FunctionEvent {
            pid: tgid_of(id),
            _pad: 0,
            duration_ns: host.now_ns().saturating_sub(start),
        };
        self.stats.record_emit(self.events.output(&event));
    }

    /// ENTRY now, EXIT when the guard drops.
    pub fn scoped<'a, H: Host + ?Sized>(&'a self, host: &'a H) -> CallGuard<'a, H> {
        self.on_entry(host);
        CallGuard { tracer: self, host }
    }

    pub fn consumer(&self) -> Option<ChannelConsumer<FunctionEvent>> {
        self.events.consumer()
    }

    pub fn events(&self) -> &EventChannel<FunctionEvent> {
        &self.events
    }

    pub fn pending(&self) -> usize {
        self.spans.len()
    }

    pub fn stats(&self) -> &ProbeStats {
        &self.stats
    }
}

/// Returned by [`FunctionTracer::scoped`].
#[must_use = "dropping the guard immediately records a zero-length call"]
pub struct CallGuard<'a, H: Host + ?Sized> {
    tracer: &'a FunctionTracer,
    host: &'a H,
}

impl<H: Host + ?Sized> Drop for CallGuard<'_, H> {
    fn drop(&mut self) {
        self.tracer.on_exit(self.host);
    }
}
