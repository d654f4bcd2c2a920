//! Scope-filtered probe engine.
//!
//! Host-side implementation of the five scopeprobe subsystems over the same
//! primitives the kernel program uses: fixed-capacity tables, bounded event
//! channels and default-deny scope allow-lists. Handlers never allocate,
//! block or lock, and never report failure; what they drop shows up only in
//! each subsystem's [`ProbeStats`].

pub mod cache;
pub mod channel;
pub mod config;
pub mod error;
pub mod filter;
pub mod function;
pub mod hardware;
pub mod host;
pub mod lifecycle;
pub mod migration;
pub mod probes;
pub mod sim;
pub mod stats;
pub mod table;

pub use cache::{CacheClassifier, CacheHook};
pub use channel::{ChannelConsumer, EventChannel, Reservation};
pub use config::ProbeConfig;
pub use error::{ProbeError, TableError};
pub use filter::AllowList;
pub use function::{CallGuard, FunctionTracer};
pub use hardware::{CounterHook, CounterTable, HardwareCounters};
#[cfg(target_os = "linux")]
pub use host::LinuxHost;
pub use host::{Host, TaskRef};
pub use lifecycle::LifecycleTracer;
pub use migration::MigrationTracker;
pub use probes::Probes;
pub use sim::{SimHost, SimTask};
pub use stats::{ProbeStats, ProbesSnapshot, StatsSnapshot};
pub use table::{Entry, FixedTable, TableKey, UpdateMode};

pub use scopeprobe_common as wire;
