//! Application settings

use std::path::{Path, PathBuf};
use std::time::Duration;

use portbind_detect::probe::{DEFAULT_BAUD_RATES, DEFAULT_MAX_ATTEMPTS};
use portbind_detect::scanner::DEFAULT_DEVICE_GLOB;
use portbind_detect::{ProbeConfig, ResolverConfig, ScannerConfig};
use portbind_rules::store::DEFAULT_RULES_DIR;
use portbind_rules::RuleStoreConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors loading a settings file
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Baud rates to probe, fastest first
    pub baud_rates: Vec<u32>,
    /// Attempts per baud rate
    pub max_attempts: u32,
    /// Reply timeout per attempt in milliseconds
    pub read_timeout_ms: u64,
    /// Delay after opening a port, in milliseconds
    pub settle_ms: u64,
    /// Delay between failed attempts, in milliseconds
    pub retry_delay_ms: u64,
    /// Glob for candidate device nodes
    pub device_glob: String,
    /// Skip nodes whose path contains any of these
    pub skip_patterns: Vec<String>,
    /// udev rules directory
    pub rules_dir: PathBuf,
    /// Staging directory for rule files
    pub temp_dir: PathBuf,
    /// sysfs mount point
    pub sysfs_root: PathBuf,
    /// Run privileged actions through `sudo -n`
    pub use_sudo: bool,
    /// Probe all devices concurrently
    pub parallel_probe: bool,
    /// Exit non-zero when any device or rule failed
    pub strict_exit: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            baud_rates: DEFAULT_BAUD_RATES.to_vec(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            read_timeout_ms: 2000,
            settle_ms: 500,
            retry_delay_ms: 500,
            device_glob: DEFAULT_DEVICE_GLOB.to_string(),
            skip_patterns: Vec::new(),
            rules_dir: PathBuf::from(DEFAULT_RULES_DIR),
            temp_dir: std::env::temp_dir(),
            sysfs_root: PathBuf::from("/sys"),
            use_sudo: true,
            parallel_probe: false,
            strict_exit: false,
        }
    }
}

impl Settings {
    /// Get the XDG config directory for portbind
    /// Uses $XDG_CONFIG_HOME/portbind, falls back to ~/.config/portbind
    fn config_dir() -> Option<PathBuf> {
        if let Ok(xdg_config) = std::env::var("XDG_CONFIG_HOME") {
            let path = PathBuf::from(xdg_config);
            if path.is_absolute() {
                return Some(path.join("portbind"));
            }
        }

        dirs::home_dir().map(|h| h.join(".config").join("portbind"))
    }

    /// Get the settings file path
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("settings.json"))
    }

    /// Load settings from disk, falling back to defaults
    pub fn load() -> Self {
        let Some(path) = Self::settings_path() else {
            return Self::default();
        };
        if !path.exists() {
            debug!("No settings at {}, using defaults", path.display());
            return Self::default();
        }
        Self::load_from(&path).unwrap_or_else(|e| {
            warn!("{}; using defaults", e);
            Self::default()
        })
    }

    /// Load settings from a specific file
    pub fn load_from(path: &Path) -> Result<Self, SettingsError> {
        let text = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| SettingsError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            baud_rates: self.baud_rates.clone(),
            max_attempts: self.max_attempts,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            settle_delay: Duration::from_millis(self.settle_ms),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn scanner_config(&self) -> ScannerConfig {
        ScannerConfig {
            pattern: self.device_glob.clone(),
            skip_patterns: self.skip_patterns.clone(),
        }
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            sysfs_root: self.sysfs_root.clone(),
        }
    }

    pub fn rule_store_config(&self) -> RuleStoreConfig {
        RuleStoreConfig {
            rules_dir: self.rules_dir.clone(),
            temp_dir: self.temp_dir.clone(),
        }
    }
}
