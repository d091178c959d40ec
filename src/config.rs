//! Top-level configuration (spec.md §3, §6.1): one TOML document naming the
//! models directory, global concurrency budgets, and per-model configs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PoolError;
use crate::store::ModelConfig;
use crate::telemetry::LogConfig;

fn default_concurrency() -> usize {
    num_cpus::get().max(1)
}

fn default_prepare_concurrency() -> usize {
    2
}

/// Root configuration document, loaded once at startup and treated as
/// immutable for the process lifetime (spec.md §4.1 "Non-goals": no hot
/// reload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_models_path")]
    pub models_path: PathBuf,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_prepare_concurrency")]
    pub prepare_concurrency: usize,
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

fn default_models_path() -> PathBuf {
    PathBuf::from("./models")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            models_path: default_models_path(),
            concurrency: default_concurrency(),
            prepare_concurrency: default_prepare_concurrency(),
            models: HashMap::new(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    pub fn from_toml_str(raw: &str) -> Result<Self, PoolError> {
        let mut config: Config =
            toml::from_str(raw).map_err(|e| PoolError::Config(format!("invalid config toml: {e}")))?;
        for (id, model) in config.models.iter_mut() {
            if model.id.is_empty() {
                model.id = id.clone();
            }
            model.validate()?;
        }
        if config.concurrency == 0 {
            return Err(PoolError::Config("concurrency must be at least 1".to_string()));
        }
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, PoolError> {
        let raw = std::fs::read_to_string(path.as_ref())
            .map_err(|e| PoolError::Config(format!("cannot read {}: {e}", path.as_ref().display())))?;
        Self::from_toml_str(&raw)
    }
}
