//! YAML configuration for the daemon: cluster identity, resource filters,
//! watcher tuning and notification settings.

#![forbid(unsafe_code)]

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use argus_core::{ResourceFilter, WatchTuning};
use serde::{Deserialize, Serialize};

const DEFAULT_WEBHOOK_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotifySettings {
    /// Endpoint for webhook delivery. Absent means log-only notifications.
    pub webhook_url: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl NotifySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.unwrap_or(DEFAULT_WEBHOOK_TIMEOUT_SECS))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub cluster_name: String,
    pub resources: Vec<ResourceFilter>,
    #[serde(default)]
    pub watcher: WatchTuning,
    #[serde(default)]
    pub notify: NotifySettings,
}

impl Config {
    /// Read and validate a config file. Environment variables override the
    /// file so deployments can inject cluster identity without templating.
    pub fn load(path: &Path) -> Result<Config> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut cfg: Config = serde_yaml::from_str(&raw).context("parsing config yaml")?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    fn apply_env(&mut self) {
        if let Some(name) = env_nonempty("CLUSTER_NAME") {
            self.cluster_name = name;
        }
        if let Some(url) = env_nonempty("ARGUS_WEBHOOK_URL") {
            self.notify.webhook_url = Some(url);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            bail!("clusterName is required (or set CLUSTER_NAME)");
        }
        if self.resources.is_empty() {
            bail!("at least one resource filter is required");
        }
        for filter in &self.resources {
            if filter.kind.is_empty() {
                bail!("resource filter is missing a kind");
            }
        }
        Ok(())
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}
