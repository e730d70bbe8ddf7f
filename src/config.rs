//! Configuration loading.
//!
//! Generalizes a `Config::load`/`apply_env_overrides`/`save` sequence
//! (file first, then environment overrides) to the recognized options
//! table this broker defines, with `BROKER_`-prefixed env vars in place of
//! an older `BOTSTER_`-prefixed scheme.

use std::path::PathBuf;
use std::{fs, time::Duration};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const APP_NAME: &str = "landscape-broker";

/// Recognized broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Exchange endpoint URL.
    pub url: String,
    /// Ping endpoint URL.
    pub ping_url: String,
    /// PEM-encoded public key to pin the exchange TLS connection to, if any.
    #[serde(default)]
    pub ssl_public_key: Option<String>,
    /// Directory holding the broker's persisted snapshot.
    pub data_path: PathBuf,
    /// Override for the snapshot file name within `data_path`.
    #[serde(default = "default_message_store_path")]
    pub message_store_path: String,
    /// Seconds between ordinary exchanges.
    #[serde(default = "default_exchange_interval_secs")]
    pub exchange_interval_secs: u64,
    /// Seconds between urgent exchanges.
    #[serde(default = "default_urgent_exchange_interval_secs")]
    pub urgent_exchange_interval_secs: u64,
    /// Seconds between liveness pings.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// This host's display name, used at registration.
    #[serde(default)]
    pub computer_title: Option<String>,
    /// The account this host registers under.
    #[serde(default)]
    pub account_name: Option<String>,
    /// Shared secret proving the right to register under `account_name`.
    #[serde(default)]
    pub registration_password: Option<String>,
    /// HTTP proxy URL, if any.
    #[serde(default)]
    pub http_proxy: Option<String>,
    /// HTTPS proxy URL, if any.
    #[serde(default)]
    pub https_proxy: Option<String>,
}

fn default_message_store_path() -> String {
    "broker.json".to_string()
}

fn default_exchange_interval_secs() -> u64 {
    crate::exchange::DEFAULT_EXCHANGE_INTERVAL.as_secs()
}

fn default_urgent_exchange_interval_secs() -> u64 {
    crate::exchange::DEFAULT_URGENT_EXCHANGE_INTERVAL.as_secs()
}

fn default_ping_interval_secs() -> u64 {
    crate::pinger::DEFAULT_PING_INTERVAL.as_secs()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: "https://landscape.example.com/message-system".to_string(),
            ping_url: "https://landscape.example.com/ping".to_string(),
            ssl_public_key: None,
            data_path: Self::default_data_path(),
            message_store_path: default_message_store_path(),
            exchange_interval_secs: default_exchange_interval_secs(),
            urgent_exchange_interval_secs: default_urgent_exchange_interval_secs(),
            ping_interval_secs: default_ping_interval_secs(),
            computer_title: None,
            account_name: None,
            registration_password: None,
            http_proxy: None,
            https_proxy: None,
        }
    }
}

impl Config {
    fn default_data_path() -> PathBuf {
        if crate::env::is_test_mode() {
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/broker-test")
        } else {
            dirs::data_dir()
                .map(|d| d.join(APP_NAME))
                .unwrap_or_else(|| PathBuf::from("/var/lib").join(APP_NAME))
        }
    }

    /// Path to the on-disk config file, creating its parent directory if necessary.
    pub fn config_path() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("BROKER_CONFIG_DIR") {
            PathBuf::from(dir)
        } else if crate::env::is_test_mode() {
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tmp/broker-test")
        } else {
            dirs::config_dir()
                .context("could not determine config directory")?
                .join(APP_NAME)
        };
        fs::create_dir_all(&dir)?;
        Ok(dir.join("config.json"))
    }

    /// Loads configuration from file (or defaults), then applies env overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_else(|_| Self::default());
        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_path()?;
        let content = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BROKER_URL") {
            self.url = v;
        }
        if let Ok(v) = std::env::var("BROKER_PING_URL") {
            self.ping_url = v;
        }
        if let Ok(v) = std::env::var("BROKER_DATA_PATH") {
            self.data_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("BROKER_COMPUTER_TITLE") {
            self.computer_title = Some(v);
        }
        if let Ok(v) = std::env::var("BROKER_ACCOUNT_NAME") {
            self.account_name = Some(v);
        }
        if let Ok(v) = std::env::var("BROKER_REGISTRATION_PASSWORD") {
            self.registration_password = Some(v);
        }
        if let Ok(v) = std::env::var("BROKER_HTTP_PROXY") {
            self.http_proxy = Some(v);
        }
        if let Ok(v) = std::env::var("BROKER_HTTPS_PROXY") {
            self.https_proxy = Some(v);
        }
        if let Ok(v) = std::env::var("BROKER_EXCHANGE_INTERVAL") {
            if let Ok(secs) = v.parse() {
                self.exchange_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("BROKER_URGENT_EXCHANGE_INTERVAL") {
            if let Ok(secs) = v.parse() {
                self.urgent_exchange_interval_secs = secs;
            }
        }
        if let Ok(v) = std::env::var("BROKER_PING_INTERVAL") {
            if let Ok(secs) = v.parse() {
                self.ping_interval_secs = secs;
            }
        }
    }

    /// Persists the current configuration to disk with owner-only permissions.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        fs::write(&path, serde_json::to_string_pretty(self)?)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// The full path to the persisted broker snapshot.
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_path.join(&self.message_store_path)
    }

    /// Exchange interval as a `Duration`.
    #[must_use]
    pub fn exchange_interval(&self) -> Duration {
        Duration::from_secs(self.exchange_interval_secs)
    }

    /// Urgent exchange interval as a `Duration`.
    #[must_use]
    pub fn urgent_exchange_interval(&self) -> Duration {
        Duration::from_secs(self.urgent_exchange_interval_secs)
    }

    /// Ping interval as a `Duration`.
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}
