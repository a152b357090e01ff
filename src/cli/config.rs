use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Deserialize;

use crate::engine::types::EngineConfig;

/// Configuration loaded from `arkflow.yaml`.
/// All fields are optional — missing fields fall back to CLI/env/defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ArkflowConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Directory the upload receiver assembles files in.
    pub upload_dir: Option<String>,
    /// Record store URL, e.g. `sqlite://arkflow.db?mode=rwc`.
    pub database_url: Option<String>,
    pub eager_mode: Option<bool>,
    pub propagate_exceptions: Option<bool>,
    pub default_block_size: Option<u64>,
    pub default_checksum_algorithm: Option<String>,
    /// Worker pool name → worker count.
    pub worker_pools: Option<HashMap<String, usize>>,
}

impl ArkflowConfig {
    /// Load configuration from a YAML file.
    ///
    /// An explicit `path` must exist; with `None`, an `arkflow.yaml` in the
    /// working directory is picked up when present, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let detected = Path::new("arkflow.yaml");
        path.or_else(|| detected.exists().then_some(detected))
            .map_or_else(|| Ok(Self::default()), Self::from_file)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read config file {}", path.display()))?;
        serde_yml::from_str(&contents)
            .with_context(|| format!("cannot parse config file {}", path.display()))
    }

    /// Fold the file values into an engine configuration, then apply
    /// `ARKFLOW_*` environment overrides on top.
    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default();
        if let Some(eager) = self.eager_mode {
            config.eager_mode = eager;
        }
        if let Some(propagate) = self.propagate_exceptions {
            config.propagate_exceptions = propagate;
        }
        if let Some(block_size) = self.default_block_size {
            config.default_block_size = block_size;
        }
        if let Some(ref algorithm) = self.default_checksum_algorithm {
            config.default_checksum_algorithm = algorithm.clone();
        }
        if let Some(ref pools) = self.worker_pools {
            config.worker_pools = pools.clone();
        }
        config.with_env_overrides()
    }
}
