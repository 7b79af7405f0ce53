//! Scheduler configuration.
//!
//! Settings come from three layers, later ones winning: built-in defaults,
//! a TOML file and environment variables.

use crate::error::ConfigError;
use crate::orchestrator::DrawMode;
use crate::pool::{DEFAULT_THREAD_NAME, DEFAULT_WORKER_COUNT};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable overriding the number of draw workers
pub const ENV_WORKERS: &str = "DANMAKU_DRAW_WORKERS";

/// Environment variable overriding the draw mode (`async` or `sync`)
pub const ENV_DRAW_MODE: &str = "DANMAKU_DRAW_MODE";

/// Configuration for the draw scheduler.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of draw worker threads
    pub worker_count: usize,
    /// Draw mode for newly created cells
    pub draw_mode: DrawMode,
    /// Prefix for worker thread names
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            draw_mode: DrawMode::Async,
            thread_name: DEFAULT_THREAD_NAME.to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_draw_mode(mut self, draw_mode: DrawMode) -> Self {
        self.draw_mode = draw_mode;
        self
    }

    pub fn with_thread_name(mut self, thread_name: impl Into<String>) -> Self {
        self.thread_name = thread_name.into();
        self
    }

    /// Returns the default config file location.
    ///
    /// - Linux: ~/.config/danmaku/scheduler.toml
    /// - macOS: ~/Library/Application Support/danmaku/scheduler.toml
    /// - Windows: %APPDATA%\danmaku\scheduler.toml
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("danmaku").join("scheduler.toml"))
    }

    /// Loads configuration from environment variables over the defaults.
    ///
    /// # Errors
    /// Returns an error if a variable holds an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format, every key optional:
    /// ```toml
    /// worker_count = 16
    /// draw_mode = "async"
    /// thread_name = "danmaku-draw"
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()
    }

    /// Defaults, then the file at [`default_path`](Self::default_path) if
    /// it exists, then the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let config = match Self::default_path() {
            Some(path) if path.is_file() => {
                tracing::debug!(path = %path.display(), "loading scheduler config");
                Self::from_file(&path)?
            }
            _ => Self::default(),
        };
        config.apply_env()
    }

    fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(val) = std::env::var(ENV_WORKERS) {
            self.worker_count = val
                .trim()
                .parse::<usize>()
                .map_err(|_| ConfigError::invalid(ENV_WORKERS, &val))?;
        }

        if let Ok(val) = std::env::var(ENV_DRAW_MODE) {
            self.draw_mode = val
                .parse::<DrawMode>()
                .map_err(|_| ConfigError::invalid(ENV_DRAW_MODE, &val))?;
        }

        self.validate()
    }

    fn validate(self) -> Result<Self, ConfigError> {
        if self.worker_count == 0 {
            return Err(ConfigError::invalid("worker_count", "0"));
        }
        Ok(self)
    }
}
