use std::path::PathBuf;

use thiserror::Error;

pub use crate::table::TableError;

/// Construction and configuration failures. Hook handlers never produce
/// these; they degrade silently and count the drop instead.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("{what}: capacity must be non-zero")]
    ZeroCapacity { what: &'static str },

    #[error("{what}: capacity {value} is too large")]
    CapacityOverflow { what: &'static str, value: usize },

    #[error("{what}: {bytes} bytes cannot hold a single {record_bytes}-byte record")]
    ChannelTooSmall {
        what: &'static str,
        bytes: usize,
        record_bytes: usize,
    },

    #[error("failed to read config {}: {source}", path.display())]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {origin}: {source}")]
    ConfigParse {
        origin: String,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Table(#[from] TableError),
}

pub type Result<T, E = ProbeError> = std::result::Result<T, E>;
