//! TOML configuration for printdesk.
//!
//! Every section has compiled-in defaults, so an empty or partial file is
//! valid. The file is located via `--config`, then the `PRINTDESK_CONFIG`
//! environment variable, then `/etc/printdesk/printdesk.toml`.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::loadtest::{RequestWindow, DEFAULT_WINDOW_SECS};

pub const CONFIG_ENV: &str = "PRINTDESK_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/printdesk/printdesk.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub load_test: LoadTestConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve the configuration file.
    ///
    /// An explicit path must load; the environment and system locations fall
    /// back to defaults with a warning.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        Ok(Self::load_or_default())
    }

    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "PRINTDESK_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        RequestWindow::new(self.load_test.window_secs)?;
        reqwest::Url::parse(&self.api.base_url)
            .with_context(|| format!("api.base_url is not a URL: {}", self.api.base_url))?;
        if self.api.timeout_secs == 0 {
            anyhow::bail!("api.timeout_secs must be positive");
        }
        tracing_subscriber::EnvFilter::try_new(&self.logging.level)
            .with_context(|| format!("logging.level is not a valid filter: {}", self.logging.level))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

/// Where the print service lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL; `/graphql`, `/print/sse` and `/print/config` hang off it.
    pub base_url: String,
    /// Per-request timeout for GraphQL and config calls (seconds).
    pub timeout_secs: u64,
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4000".to_string(),
            timeout_secs: 30,
        }
    }
}

// ---------------------------------------------------------------------------
// Load test
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadTestConfig {
    /// Upper bound of the random delay between requests (5..=60 seconds).
    pub window_secs: u64,
    /// Wait before reconnecting the completion stream, unless the stream
    /// sends its own `retry:` hint.
    pub reconnect_delay_ms: u64,
    /// Connect timeout of the completion stream (seconds).
    pub connect_timeout_secs: u64,
}

impl LoadTestConfig {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for LoadTestConfig {
    fn default() -> Self {
        Self {
            window_secs: DEFAULT_WINDOW_SECS,
            reconnect_delay_ms: 3000,
            connect_timeout_secs: 10,
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    /// `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Text,
    Json,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
