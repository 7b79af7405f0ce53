//! Error types for the draw scheduler.
//!
//! None of these errors ever terminate the process or a worker thread.
//! Draw failures are local to one cell and surface only through the
//! cell's `did_draw(false)` notification.

/// Recoverable failure reported by a cell's draw callback.
#[derive(Debug, thiserror::Error)]
pub enum DrawError {
    /// The callback noticed its generation went stale and stopped early.
    #[error("draw cancelled: content went stale")]
    Cancelled,

    /// Any other recoverable drawing fault.
    #[error("draw failed: {0}")]
    Failed(String),
}

impl DrawError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

/// Errors raised by the worker pool.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker count must be at least 1 (got {0})")]
    InvalidWorkerCount(usize),

    #[error("failed to spawn draw worker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("draw worker queue disconnected")]
    Disconnected,

    #[error("worker pool has been shut down")]
    ShutDown,
}

/// Errors raised while loading [`SchedulerConfig`](crate::SchedulerConfig).
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: String, value: String },
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            value: value.into(),
        }
    }
}
