// THEORY:
// Errors are grouped by who can act on them. Configuration errors are returned to
// whoever attempted the change and are never silently accepted. Detector and
// source errors are transient by nature: the source worker counts and logs them
// and keeps running. `MonitorError` is what the state owner reports upward,
// including the one fatal case: a detector that is unavailable at startup.

use thiserror::Error;

/// A rejected configuration change.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for `{field}`: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("zone `{0}` does not exist")]
    UnknownZone(String),
    #[error("zone `{0}` already exists")]
    DuplicateZone(String),
    #[error("zone `{zone_id}` must have a positive capacity")]
    NonPositiveCapacity { zone_id: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Failure reported by the detection adapter.
#[derive(Debug, Clone, Error)]
pub enum DetectError {
    #[error("detector unavailable: {0}")]
    Unavailable(String),
    #[error("detector timed out")]
    Timeout,
    #[error("detection failed: {0}")]
    Failed(String),
}

/// Failure reading from a frame source.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("cannot open source `{0}`")]
    Open(String),
    #[error("frame read failed: {0}")]
    Read(String),
    #[error("source disconnected")]
    Disconnected,
}

/// Failure while turning an analysis into outbound messages.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to encode frame: {0}")]
    Encode(#[from] image::ImageError),
}

/// Errors surfaced by the [`Monitor`](crate::monitor::Monitor).
#[derive(Debug, Error)]
pub enum MonitorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("detector failed to initialise: {0}")]
    Detector(#[from] DetectError),
    #[error("camera `{0}` is not being monitored")]
    UnknownCamera(String),
    #[error("failed to spawn source thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("source for camera `{0}` is still held by a detached thread")]
    SourceUnavailable(String),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}
