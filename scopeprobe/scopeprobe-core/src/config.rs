use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use log::{debug, warn};
use scopeprobe_common::{
    FunctionEvent, LifecycleEvent, MigrationEvent, CACHE_ALLOW_CAPACITY, CACHE_TABLE_CAPACITY,
    COUNTER_TABLE_CAPACITY, FUNCTION_CHANNEL_BYTES, FUNCTION_SPAN_CAPACITY, HW_STATS_PIN_NAME,
    LIFECYCLE_ALLOW_CAPACITY, LIFECYCLE_CHANNEL_BYTES, LIFECYCLE_SPAN_CAPACITY,
    MIGRATION_ALLOW_CAPACITY, MIGRATION_CHANNEL_BYTES, MIGRATION_SPAN_CAPACITY,
};

use crate::channel::EventChannel;
use crate::error::ProbeError;

const DEFAULT_CONFIG_PATH: &str = "/etc/scopeprobe/scopeprobe.toml";
const ENV_CONFIG_PATH: &str = "SCOPEPROBE_CONFIG";

/// Table and channel sizes, fixed once at creation.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ProbeConfig {
    #[serde(default)]
    pub function: FunctionConfig,
    #[serde(default)]
    pub migration: MigrationConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub host: HostConfig,
}

impl ProbeConfig {
    /// Load configuration from file. The path can be overridden with the
    /// `SCOPEPROBE_CONFIG` environment variable. A missing file yields the
    /// defaults; an unreadable or malformed one is an error.
    pub fn load() -> Result<Self, ProbeError> {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::from_path(path)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ProbeError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(contents) => {
                debug!("loading config from {}", path.display());
                Self::parse(&contents, &path.display().to_string())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {
                warn!("config {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ProbeError::ConfigRead {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ProbeError> {
        Self::parse(contents, "<inline>")
    }

    fn parse(contents: &str, origin: &str) -> Result<Self, ProbeError> {
        let config: Self = toml::from_str(contents).map_err(|source| ProbeError::ConfigParse {
            origin: origin.to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Every table and channel must be able to hold at least one entry.
    pub fn validate(&self) -> Result<(), ProbeError> {
        let capacities = [
            ("function.span_capacity", self.function.span_capacity),
            ("function.channel_bytes", self.function.channel_bytes),
            ("migration.allow_capacity", self.migration.allow_capacity),
            ("migration.span_capacity", self.migration.span_capacity),
            ("migration.channel_bytes", self.migration.channel_bytes),
            ("hardware.table_capacity", self.hardware.table_capacity),
            ("cache.allow_capacity", self.cache.allow_capacity),
            ("cache.table_capacity", self.cache.table_capacity),
            ("lifecycle.allow_capacity", self.lifecycle.allow_capacity),
            ("lifecycle.span_capacity", self.lifecycle.span_capacity),
            ("lifecycle.channel_bytes", self.lifecycle.channel_bytes),
        ];
        if let Some(&(what, _)) = capacities.iter().find(|(_, value)| *value == 0) {
            return Err(ProbeError::ZeroCapacity { what });
        }

        let channels = [
            (
                "function.channel_bytes",
                self.function.channel_bytes,
                EventChannel::<FunctionEvent>::record_bytes(),
            ),
            (
                "migration.channel_bytes",
                self.migration.channel_bytes,
                EventChannel::<MigrationEvent>::record_bytes(),
            ),
            (
                "lifecycle.channel_bytes",
                self.lifecycle.channel_bytes,
                EventChannel::<LifecycleEvent>::record_bytes(),
            ),
        ];
        if let Some(&(what, bytes, record_bytes)) = channels
            .iter()
            .find(|(_, bytes, record_bytes)| bytes < record_bytes)
        {
            return Err(ProbeError::ChannelTooSmall {
                what,
                bytes,
                record_bytes,
            });
        }
        if self.hardware.pin_name.is_empty() {
            return Err(ProbeError::InvalidConfig(
                "hardware.pin_name must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct FunctionConfig {
    #[serde(default = "default_function_span_capacity")]
    pub span_capacity: usize,
    #[serde(default = "default_function_channel_bytes")]
    pub channel_bytes: usize,
}

impl Default for FunctionConfig {
    fn default() -> Self {
        Self {
            span_capacity: default_function_span_capacity(),
            channel_bytes: default_function_channel_bytes(),
        }
    }
}

fn default_function_span_capacity() -> usize {
    FUNCTION_SPAN_CAPACITY as usize
}
fn default_function_channel_bytes() -> usize {
    FUNCTION_CHANNEL_BYTES as usize
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct MigrationConfig {
    #[serde(default = "default_migration_allow_capacity")]
    pub allow_capacity: usize,
    #[serde(default = "default_migration_span_capacity")]
    pub span_capacity: usize,
    #[serde(default = "default_migration_channel_bytes")]
    pub channel_bytes: usize,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            allow_capacity: default_migration_allow_capacity(),
            span_capacity: default_migration_span_capacity(),
            channel_bytes: default_migration_channel_bytes(),
        }
    }
}

fn default_migration_allow_capacity() -> usize {
    MIGRATION_ALLOW_CAPACITY as usize
}
fn default_migration_span_capacity() -> usize {
    MIGRATION_SPAN_CAPACITY as usize
}
fn default_migration_channel_bytes() -> usize {
    MIGRATION_CHANNEL_BYTES as usize
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct HardwareConfig {
    #[serde(default = "default_counter_table_capacity")]
    pub table_capacity: usize,
    /// Stable name the shared counter table is published under.
    #[serde(default = "default_pin_name")]
    pub pin_name: String,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            table_capacity: default_counter_table_capacity(),
            pin_name: default_pin_name(),
        }
    }
}

fn default_counter_table_capacity() -> usize {
    COUNTER_TABLE_CAPACITY as usize
}
fn default_pin_name() -> String {
    HW_STATS_PIN_NAME.to_string()
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    #[serde(default = "default_cache_allow_capacity")]
    pub allow_capacity: usize,
    #[serde(default = "default_cache_table_capacity")]
    pub table_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            allow_capacity: default_cache_allow_capacity(),
            table_capacity: default_cache_table_capacity(),
        }
    }
}

fn default_cache_allow_capacity() -> usize {
    CACHE_ALLOW_CAPACITY as usize
}
fn default_cache_table_capacity() -> usize {
    CACHE_TABLE_CAPACITY as usize
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LifecycleConfig {
    #[serde(default = "default_lifecycle_allow_capacity")]
    pub allow_capacity: usize,
    #[serde(default = "default_lifecycle_span_capacity")]
    pub span_capacity: usize,
    #[serde(default = "default_lifecycle_channel_bytes")]
    pub channel_bytes: usize,
    /// Attach a snapshot of the scope's hardware counters to exit events.
    #[serde(default)]
    pub merge_counters: bool,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            allow_capacity: default_lifecycle_allow_capacity(),
            span_capacity: default_lifecycle_span_capacity(),
            channel_bytes: default_lifecycle_channel_bytes(),
            merge_counters: false,
        }
    }
}

fn default_lifecycle_allow_capacity() -> usize {
    LIFECYCLE_ALLOW_CAPACITY as usize
}
fn default_lifecycle_span_capacity() -> usize {
    LIFECYCLE_SPAN_CAPACITY as usize
}
fn default_lifecycle_channel_bytes() -> usize {
    LIFECYCLE_CHANNEL_BYTES as usize
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// Mount point of the unified cgroup hierarchy.
    #[serde(default = "default_cgroup_root")]
    pub cgroup_root: PathBuf,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            cgroup_root: default_cgroup_root(),
        }
    }
}

fn default_cgroup_root() -> PathBuf {
    PathBuf::from("/sys/fs/cgroup")
}
