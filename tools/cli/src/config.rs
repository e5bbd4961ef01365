//! Configuration file and environment overrides.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use catalogsync_remote::ApiSettings;
use catalogsync_sync::{DetectionStrategy, EngineConfig, ReconcileConfig, RetryConfig};

pub const DEFAULT_CONFIG_FILE: &str = "catalogsync.json";

/// Connection block of one destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub url: String,
    pub username: String,
    /// Application password or API secret. Usually supplied through the
    /// environment instead.
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// SQLite database holding the catalog.
    pub database: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub max_items: usize,
    pub pause_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_items: 100,
            pause_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub source: SourceConfig,
    /// Watermark file. Defaults to the user's data directory.
    #[serde(default)]
    pub state_file: Option<PathBuf>,
    /// Database holding the identity map. Defaults to the source database.
    #[serde(default)]
    pub identity_database: Option<PathBuf>,
    #[serde(default)]
    pub strategy: DetectionStrategy,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub woocommerce: Option<DestinationConfig>,
    #[serde(default)]
    pub wordpress: Option<DestinationConfig>,
    #[serde(default)]
    pub prices: Option<DestinationConfig>,
}

impl Config {
    /// Read the config at `path` and apply environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let mut config = Self::from_json(&raw)
            .with_context(|| format!("Invalid config {}", path.display()))?;
        config.apply_env(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Secrets from the environment win over the file.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        for (name, block) in [
            ("CATALOGSYNC_WOOCOMMERCE_SECRET", &mut self.woocommerce),
            ("CATALOGSYNC_WORDPRESS_SECRET", &mut self.wordpress),
            ("CATALOGSYNC_PRICES_SECRET", &mut self.prices),
        ] {
            if let (Some(block), Some(secret)) = (block.as_mut(), lookup(name)) {
                block.secret = Some(secret);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (name, block) in self.destinations() {
            if let Some(block) = block {
                Url::parse(&block.url)
                    .with_context(|| format!("Invalid {} url '{}'", name, block.url))?;
            }
        }
        if self.batch.max_items == 0 {
            bail!("batch.max_items must be at least 1");
        }
        Ok(())
    }

    fn destinations(&self) -> [(&'static str, &Option<DestinationConfig>); 3] {
        [
            ("woocommerce", &self.woocommerce),
            ("wordpress", &self.wordpress),
            ("prices", &self.prices),
        ]
    }

    /// Connection settings of destination `name`.
    pub fn api_settings(&self, name: &str) -> Result<ApiSettings> {
        let block = self
            .destinations()
            .into_iter()
            .find(|(n, _)| *n == name)
            .and_then(|(_, block)| block.as_ref())
            .with_context(|| format!("No '{}' block in the config", name))?;
        let secret = block.secret.clone().with_context(|| {
            format!(
                "No secret for {}; set it in the config or CATALOGSYNC_{}_SECRET",
                name,
                name.to_uppercase()
            )
        })?;
        let url = Url::parse(&block.url)?;
        Ok(ApiSettings::new(url, &block.username, secret)
            .with_timeout(Duration::from_secs(self.request_timeout_secs)))
    }

    pub fn state_path(&self) -> PathBuf {
        self.state_file.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("catalogsync")
                .join("state.json")
        })
    }

    pub fn identity_path(&self) -> &Path {
        self.identity_database
            .as_deref()
            .unwrap_or(&self.source.database)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            strategy: self.strategy,
            reconcile: ReconcileConfig {
                max_batch_items: self.batch.max_items,
                pause: Duration::from_millis(self.batch.pause_ms),
                retry: RetryConfig::new(self.retry.max_retries)
                    .with_initial_delay(Duration::from_millis(self.retry.initial_delay_ms))
                    .with_max_delay(Duration::from_millis(self.retry.max_delay_ms)),
            },
        }
    }
}
