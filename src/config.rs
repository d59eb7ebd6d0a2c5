//! Configuration loading and persistence.
//!
//! The configuration lives in `config.json` inside the config directory.
//! A file that cannot be read or parsed is moved aside to
//! `config.json.old` and replaced with defaults.
//!
//! [`ConfigStore`] owns the live copy at runtime and coalesces bursts of
//! changes into a single write after a quiet period.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{CONFIG_SAVE_DEBOUNCE, DEFAULT_BACKEND, DEFAULT_BAUD_RATE};
use crate::lock_unpoisoned as lock;

const CONFIG_FILE: &str = "config.json";

/// Configuration for the relay.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// Backend base URL used for endpoint assignment.
    pub backend: String,
    /// Device token of the hub.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub device_token: String,
    /// Hub to relay for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hub_id: Option<Uuid>,
    /// Connect to the hub on start.
    pub hub_auto_connect: bool,
    /// Serial device of the RF transmitter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_port: Option<String>,
    /// Open the serial device on start.
    pub serial_auto_connect: bool,
    /// Baud rate of the serial device.
    pub baud_rate: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: DEFAULT_BACKEND.to_string(),
            device_token: String::new(),
            hub_id: None,
            hub_auto_connect: true,
            serial_port: None,
            serial_auto_connect: true,
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `LOCAL_RELAY_CONFIG_DIR` overrides the platform config directory.
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("LOCAL_RELAY_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("local-relay")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from the config directory, with environment
    /// variable overrides.
    pub fn load() -> Result<Self> {
        Self::load_from_dir(&Self::config_dir()?)
    }

    /// Loads configuration from `dir`, with environment variable overrides.
    pub fn load_from_dir(dir: &Path) -> Result<Self> {
        let mut config = Self::load_file(&dir.join(CONFIG_FILE))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Read `path`; defaults if it is missing, defaults plus a `.old`
    /// backup if it is unreadable.
    fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let parsed = fs::read_to_string(path)
            .context("Failed to read config")
            .and_then(|content| {
                serde_json::from_str::<Self>(&content).context("Failed to parse config")
            });

        match parsed {
            Ok(config) => Ok(config),
            Err(e) => {
                let backup = path.with_extension("json.old");
                log::warn!(
                    "[Config] {e:#}, moving it to {} and starting from defaults",
                    backup.display()
                );
                fs::rename(path, &backup).with_context(|| {
                    format!("Failed to move corrupt config to {}", backup.display())
                })?;
                Ok(Self::default())
            }
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(backend) = std::env::var("LOCAL_RELAY_BACKEND") {
            self.backend = backend;
        }

        // Token from env var (for headless deployments)
        if let Ok(token) = std::env::var("LOCAL_RELAY_DEVICE_TOKEN") {
            self.device_token = token;
        }

        if let Ok(port) = std::env::var("LOCAL_RELAY_SERIAL_PORT") {
            self.serial_port = Some(port);
        }

        if let Ok(baud_rate) = std::env::var("LOCAL_RELAY_BAUD_RATE") {
            match baud_rate.parse::<u32>() {
                Ok(rate) => self.baud_rate = rate,
                Err(_) => log::warn!("[Config] Ignoring invalid LOCAL_RELAY_BAUD_RATE={baud_rate}"),
            }
        }
    }

    /// Persists the configuration to `config.json` in the config directory.
    pub fn save(&self) -> Result<()> {
        self.save_to_dir(&Self::config_dir()?)
    }

    /// Persists the configuration to `config.json` in `dir`.
    pub fn save_to_dir(&self, dir: &Path) -> Result<()> {
        let path = dir.join(CONFIG_FILE);
        fs::write(&path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;

        // Owner read/write only: the file carries the device token.
        #[cfg(unix)]
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Whether a device token is configured.
    pub fn has_token(&self) -> bool {
        !self.device_token.trim().is_empty()
    }

    /// Set one field by its JSON key. An empty value clears optional fields.
    pub fn set_key(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "backend" => self.backend = value.trim_end_matches('/').to_string(),
            "device_token" => self.device_token = value.trim().to_string(),
            "hub_id" => {
                self.hub_id = if value.is_empty() {
                    None
                } else {
                    Some(value.parse().with_context(|| format!("Invalid hub id: {value}"))?)
                };
            }
            "hub_auto_connect" => {
                self.hub_auto_connect = value
                    .parse()
                    .with_context(|| format!("Expected true or false, got {value}"))?;
            }
            "serial_port" => {
                self.serial_port = (!value.is_empty()).then(|| value.to_string());
            }
            "serial_auto_connect" => {
                self.serial_auto_connect = value
                    .parse()
                    .with_context(|| format!("Expected true or false, got {value}"))?;
            }
            "baud_rate" => {
                self.baud_rate = value
                    .parse()
                    .with_context(|| format!("Invalid baud rate: {value}"))?;
            }
            other => anyhow::bail!("Unknown config key: {other}"),
        }
        Ok(())
    }

    /// Copy safe to print: the device token is masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.has_token() {
            let tail: String = copy
                .device_token
                .chars()
                .rev()
                .take(4)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            copy.device_token = format!("****{tail}");
        }
        copy
    }
}

struct StoreInner {
    dir: PathBuf,
    config: Mutex<Config>,
    /// Bumped on every save request; a delayed write only runs if it is
    /// still the latest.
    generation: AtomicU64,
    write_lock: tokio::sync::Mutex<()>,
}

/// Live configuration with debounced persistence.
#[derive(Clone)]
pub struct ConfigStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore")
            .field("dir", &self.inner.dir)
            .finish_non_exhaustive()
    }
}

impl ConfigStore {
    /// Load the configuration from the config directory.
    pub fn open() -> Result<Self> {
        Self::open_in(Config::config_dir()?)
    }

    /// Load the configuration from `dir`.
    pub fn open_in(dir: PathBuf) -> Result<Self> {
        let config = Config::load_from_dir(&dir)?;
        Ok(Self {
            inner: Arc::new(StoreInner {
                dir,
                config: Mutex::new(config),
                generation: AtomicU64::new(0),
                write_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// Copy of the current configuration.
    pub fn get(&self) -> Config {
        lock(&self.inner.config).clone()
    }

    /// Change the configuration and schedule a save.
    pub fn update(&self, change: impl FnOnce(&mut Config)) {
        change(&mut lock(&self.inner.config));
        self.request_save();
    }

    /// Schedule a save after [`CONFIG_SAVE_DEBOUNCE`]. Requests made before
    /// the delay runs out replace this one.
    pub fn request_save(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            tokio::time::sleep(CONFIG_SAVE_DEBOUNCE).await;
            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            if let Err(e) = inner.write().await {
                log::error!("[Config] Save failed: {e:#}");
            }
        });
    }

    /// Write now, superseding any pending save.
    pub async fn flush(&self) -> Result<()> {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.write().await
    }
}

impl StoreInner {
    async fn write(&self) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let snapshot = lock(&self.config).clone();
        snapshot.save_to_dir(&self.dir)?;
        log::info!("[Config] Saved to {}", self.dir.join(CONFIG_FILE).display());
        Ok(())
    }
}
