use std::sync::Arc;

use log::{debug, info};

use crate::cache::CacheClassifier;
use crate::config::ProbeConfig;
use crate::error::ProbeError;
use crate::function::FunctionTracer;
use crate::hardware::{CounterTable, HardwareCounters};
use crate::lifecycle::LifecycleTracer;
use crate::migration::MigrationTracker;
use crate::stats::ProbesSnapshot;

/// Owns every table and channel of the five subsystems.
///
/// Nothing is global: a collaborator creates one `Probes`, populates the
/// allow-lists through it, attaches hooks to its subsystems and finally
/// calls [`Probes::destroy`].
#[derive(Debug)]
pub struct Probes {
    function: FunctionTracer,
    hardware: HardwareCounters,
    cache: CacheClassifier,
    migration: MigrationTracker,
    lifecycle: LifecycleTracer,
}

impl Probes {
    pub fn new(config: &ProbeConfig) -> Result<Self, ProbeError> {
        config.validate()?;

        let hardware = HardwareCounters::new(&config.hardware)?;
        let shared = config
            .lifecycle
            .merge_counters
            .then(|| Arc::clone(hardware.table()));

        let probes = Self {
            function: FunctionTracer::new(&config.function)?,
            cache: CacheClassifier::new(&config.cache)?,
            migration: MigrationTracker::new(&config.migration)?,
            lifecycle: LifecycleTracer::new(&config.lifecycle, shared)?,
            hardware,
        };
        info!(
            "probes created (hw table '{}', lifecycle counter merge {})",
            probes.hardware.pin_name(),
            if probes.lifecycle.merges_counters() { "on" } else { "off" }
        );
        Ok(probes)
    }

    pub fn function(&self) -> &FunctionTracer {
        &self.function
    }

    pub fn hardware(&self) -> &HardwareCounters {
        &self.hardware
    }

    pub fn cache(&self) -> &CacheClassifier {
        &self.cache
    }

    pub fn migration(&self) -> &MigrationTracker {
        &self.migration
    }

    pub fn lifecycle(&self) -> &LifecycleTracer {
        &self.lifecycle
    }

    /// Look the shared hardware table up by its stable name.
    pub fn pinned_counters(&self, name: &str) -> Option<Arc<CounterTable>> {
        (name == self.hardware.pin_name()).then(|| Arc::clone(self.hardware.table()))
    }

    pub fn stats(&self) -> ProbesSnapshot {
        ProbesSnapshot {
            function: self.function.stats().snapshot(),
            hardware: self.hardware.stats().snapshot(),
            cache: self.cache.stats().snapshot(),
            migration: self.migration.stats().snapshot(),
            lifecycle: self.lifecycle.stats().snapshot(),
        }
    }

    /// Tear everything down and return the final counters. Tables held
    /// elsewhere through [`Probes::pinned_counters`] outlive this call.
    pub fn destroy(self) -> ProbesSnapshot {
        let stats = self.stats();
        debug!(
            "probes destroyed: {} function, {} migration, {} lifecycle spans still open",
            self.function.pending(),
            self.migration.pending(),
            self.lifecycle.pending()
        );
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimHost, SimTask};
    use scopeprobe_common::{CounterKind, HW_STATS_PIN_NAME};

    #[test]
    fn pinned_table_is_shared() {
        let probes = Probes::new(&ProbeConfig::default()).unwrap();
        let pinned = probes.pinned_counters(HW_STATS_PIN_NAME).unwrap();
        assert!(probes.pinned_counters("other").is_none());

        probes.hardware().monitor(7).unwrap();
        assert!(pinned.contains_key(7));
    }

    #[test]
    fn lifecycle_merge_follows_config() {
        let mut config = ProbeConfig::default();
        assert!(!Probes::new(&config).unwrap().lifecycle().merges_counters());
        config.lifecycle.merge_counters = true;

        let probes = Probes::new(&config).unwrap();
        assert!(probes.lifecycle().merges_counters());
        probes.hardware().monitor(7).unwrap();
        probes.lifecycle().allow_list().allow(7).unwrap();
        let mut consumer = probes.lifecycle().consumer().unwrap();

        let host = SimHost::new();
        let task = host.spawn(SimTask::process(55, Some(7)));
        let cpu = host.running(task, 1);
        probes.lifecycle().on_exec(&cpu);
        probes.hardware().on_sample(&cpu, CounterKind::Cycles, 1_000);
        probes.lifecycle().on_exit(&cpu);

        assert_eq!(consumer.poll().unwrap().hw_stats.cycles, 1_000);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = ProbeConfig::default();
        config.function.span_capacity = 0;
        assert!(Probes::new(&config).is_err());
    }

    #[test]
    fn destroy_returns_final_stats() {
        let probes = Probes::new(&ProbeConfig::default()).unwrap();
        let host = SimHost::new();
        let task = host.spawn(SimTask::process(1, Some(1)));
        probes.function().on_entry(&host.running(task, 0));

        let stats = probes.destroy();
        assert_eq!(stats.function.hooks, 1);
        assert_eq!(stats.migration, Default::default());
    }
}
