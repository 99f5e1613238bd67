use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use dockscope_logs::GeneratorConfig;
use dockscope_store::{StatsConfig, StoreConfig};
use dockscope_types::{LabelFilter, STATS_HISTORY};

/// Config file read when `--config` is not given
const DEFAULT_CONFIG: &str = "dockscope.toml";

/// File configuration; every field has a default
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hosts to connect to; empty means the local daemon
    pub hosts: Vec<HostConfig>,
    pub logs: LogsConfig,
    pub store: StoreSection,
    pub stats: StatsSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    pub name: String,
    /// `unix://` socket or `tcp://` address; local defaults when absent
    pub endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    pub group_window_ms: u64,
    pub peek_timeout_ms: u64,
    pub buffer_size: usize,
    pub tail: usize,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            group_window_ms: 10,
            peek_timeout_ms: 50,
            buffer_size: 100,
            tail: 300,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    pub fetch_parallelism: usize,
    pub fetch_timeout_ms: u64,
    pub subscriber_buffer: usize,
    /// Label key to allowed values
    pub labels: BTreeMap<String, Vec<String>>,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            fetch_parallelism: 30,
            fetch_timeout_ms: 3000,
            subscriber_buffer: 64,
            labels: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StatsSection {
    pub idle_timeout_secs: u64,
    pub history: usize,
}

impl Default for StatsSection {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 6 * 60 * 60,
            history: STATS_HISTORY,
        }
    }
}

impl Config {
    /// Load from `path`, or from `dockscope.toml` if it exists, or fall back to defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path,
            None if Path::new(DEFAULT_CONFIG).exists() => Path::new(DEFAULT_CONFIG),
            None => return Ok(Self::default()),
        };

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Hosts to connect to, defaulting to the local daemon
    pub fn hosts(&self) -> Vec<HostConfig> {
        if self.hosts.is_empty() {
            return vec![HostConfig {
                name: "local".to_string(),
                endpoint: None,
            }];
        }
        self.hosts.clone()
    }

    pub fn generator_config(&self) -> GeneratorConfig {
        GeneratorConfig {
            buffer_size: self.logs.buffer_size,
            peek_timeout: Duration::from_millis(self.logs.peek_timeout_ms),
            group_window: Duration::from_millis(self.logs.group_window_ms),
        }
    }

    /// Store settings, with `extra` labels added to the configured filter
    pub fn store_config(&self, extra: &[(String, String)]) -> StoreConfig {
        let mut filter = LabelFilter::new();
        for (key, values) in &self.store.labels {
            for value in values {
                filter.insert(key.clone(), value.clone());
            }
        }
        for (key, value) in extra {
            filter.insert(key.clone(), value.clone());
        }

        StoreConfig {
            fetch_parallelism: self.store.fetch_parallelism,
            fetch_timeout: Duration::from_millis(self.store.fetch_timeout_ms),
            subscriber_buffer: self.store.subscriber_buffer,
            filter,
            stats: StatsConfig {
                idle_timeout: Duration::from_secs(self.stats.idle_timeout_secs),
                subscriber_buffer: self.store.subscriber_buffer,
                history: self.stats.history,
            },
        }
    }
}

/// Parse a `key=value` label argument
pub fn parse_label(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}
