//! Configuration file support for boardlink.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (BOARDLINK_*)
//! 3. File given with `--config`, else local `./boardlink.toml`
//! 4. Global config file (e.g. ~/.config/boardlink/config.toml)

use directories::ProjectDirs;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use boardlink::LinkConfig;

/// Local configuration file name.
pub const LOCAL_CONFIG: &str = "boardlink.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyACM0" or "COM3").
    pub port: Option<String>,
    /// Baud rate for USB-UART bridges.
    pub baud: Option<u32>,
    /// Soft-reset the board after entering the raw REPL.
    pub soft_reset: Option<bool>,
    /// Port a board was last found on; probed first.
    pub last_port: Option<String>,
}

/// File transfer configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TransferConfig {
    /// Bytes per GET/PUT chunk.
    pub chunk_size: Option<usize>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    /// Connection settings.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Transfer settings.
    #[serde(default)]
    pub transfer: TransferConfig,
}

impl Config {
    /// Load configuration from the global file, then the local one.
    pub fn load() -> Self {
        let mut config = Self::default();

        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG)) {
            debug!("Loaded local config from {LOCAL_CONFIG}");
            config.merge(local_config);
        }

        config
    }

    /// Load the global file, then a specific file (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        let mut config = Self::default();
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                config.merge(global_config);
            }
        }

        match Self::load_from_file(path) {
            Some(explicit) => {
                debug!("Loaded config from {}", path.display());
                config.merge(explicit);
            },
            None => warn!(
                "Could not load config from {}, using defaults",
                path.display()
            ),
        }
        config
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "boardlink").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one; set values in `other` win.
    fn merge(&mut self, other: Self) {
        let conn = other.connection;
        if conn.port.is_some() {
            self.connection.port = conn.port;
        }
        if conn.baud.is_some() {
            self.connection.baud = conn.baud;
        }
        if conn.soft_reset.is_some() {
            self.connection.soft_reset = conn.soft_reset;
        }
        if conn.last_port.is_some() {
            self.connection.last_port = conn.last_port;
        }
        if other.transfer.chunk_size.is_some() {
            self.transfer.chunk_size = other.transfer.chunk_size;
        }
    }

    /// Library settings derived from this configuration.
    pub fn link_config(&self, soft_reset_flag: bool) -> LinkConfig {
        let mut link = LinkConfig::default()
            .with_soft_reset(soft_reset_flag || self.connection.soft_reset.unwrap_or(false));
        if let Some(chunk_size) = self.transfer.chunk_size {
            match link.clone().with_chunk_size(chunk_size) {
                Ok(sized) => link = sized,
                Err(e) => warn!("Ignoring [transfer] chunk_size: {e}"),
            }
        }
        link
    }

    /// Remember the port a board was found on, in the global config file.
    pub fn remember_last_port(&mut self, port: &str) -> anyhow::Result<()> {
        if self.connection.last_port.as_deref() == Some(port) {
            return Ok(());
        }
        self.connection.last_port = Some(port.to_string());

        let Some(dir) = Self::global_config_dir() else {
            return Ok(());
        };
        fs::create_dir_all(&dir)?;
        Self::store_last_port(&dir.join("config.toml"), port)
    }

    /// Update `last_port` in the file at `path`, keeping everything else.
    fn store_last_port(path: &Path, port: &str) -> anyhow::Result<()> {
        let mut stored = Self::load_from_file(path).unwrap_or_default();
        stored.connection.last_port = Some(port.to_string());

        let content = toml::to_string_pretty(&stored)?;
        fs::write(path, content)?;
        info!("Saved last port to {}", path.display());
        Ok(())
    }
}
