// Copyright 2024-2026 muster-core Contributors
// SPDX-License-Identifier: Apache-2.0

//! Logging setup: installs a `tracing` subscriber per `Config::log`.

use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("failed to install global tracing subscriber: {0}")]
    Init(String),
}

/// Output encoding for log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Pretty
    }
}

/// Logging configuration, loaded as part of [`crate::config::Config`].
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive string, e.g. `"info"` or `"muster_core=debug"`.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: LogFormat::default(),
        }
    }
}

/// Install a global `tracing` subscriber. Idempotent-safe to call once at
/// process startup; a second call returns `Err` rather than panicking.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    let filter = EnvFilter::try_new(&config.level)
        .map_err(|e| LogError::Init(format!("invalid log level {:?}: {e}", config.level)))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let result = match config.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.try_init(),
    };

    result.map_err(|e| LogError::Init(e.to_string()))
}
