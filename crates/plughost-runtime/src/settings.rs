//! Host settings
//!
//! Loaded from `appsettings.<ext>` in the project root (any format the
//! kernel's config loader understands) with `PLUGHOST__SECTION__KEY`
//! environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use plughost_kernel::config::{ConfigError, find_config_file, load_with_env};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ConnectionError;
use crate::hot_reload::{StagedRetention, WatchConfig};

/// File stem of the settings file.
pub const SETTINGS_STEM: &str = "appsettings";

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "PLUGHOST";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    pub database: DatabaseSettings,
    pub plugin: PluginSettings,
}

/// The `database` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub connection_string: String,
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            connection_string: "sqlite://plughost.db".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl DatabaseSettings {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
            ..Default::default()
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

/// The `plugin` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PluginSettings {
    /// Library name without platform prefix or suffix
    pub module: String,
    /// Plugins directory, relative to the project root
    pub directory: String,
    pub retention: StagedRetention,
    pub purge_on_startup: bool,
    pub debounce_ms: u64,
    pub react_to_writes: bool,
}

impl Default for PluginSettings {
    fn default() -> Self {
        Self {
            module: "plughost_users".to_string(),
            directory: "plugins".to_string(),
            retention: StagedRetention::KeepAll,
            purge_on_startup: false,
            debounce_ms: 500,
            react_to_writes: false,
        }
    }
}

impl PluginSettings {
    /// Platform file name of the canonical module, e.g. `libplughost_users.so`.
    pub fn canonical_file_name(&self) -> String {
        format!(
            "{}{}{}",
            std::env::consts::DLL_PREFIX,
            self.module,
            std::env::consts::DLL_SUFFIX
        )
    }

    pub fn watch_config(&self) -> WatchConfig {
        WatchConfig::default()
            .with_debounce(Duration::from_millis(self.debounce_ms))
            .with_react_to_writes(self.react_to_writes)
    }
}

/// Supplies connection settings at every (re)connection attempt.
pub trait SettingsSource: Send + Sync {
    fn database(&self) -> Result<DatabaseSettings, ConnectionError>;
}

/// Settings read from disk (and the environment) on every call.
#[derive(Debug, Clone, Default)]
pub struct FileSettings {
    path: Option<PathBuf>,
}

impl FileSettings {
    /// Use an explicit settings file.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }

    /// Use `appsettings.<ext>` in `root` if there is one, environment
    /// overrides and defaults otherwise.
    pub fn discover(root: &Path) -> Self {
        let path = find_config_file(root, SETTINGS_STEM);
        debug!("Settings file: {:?}", path);
        Self { path }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn load(&self) -> Result<HostSettings, ConfigError> {
        load_with_env(self.path.as_deref(), ENV_PREFIX)
    }
}

impl SettingsSource for FileSettings {
    fn database(&self) -> Result<DatabaseSettings, ConnectionError> {
        self.load()
            .map(|s| s.database)
            .map_err(|e| ConnectionError::Settings(e.to_string()))
    }
}

/// Fixed settings, for embedding and tests.
#[derive(Debug, Clone)]
pub struct StaticSettings(pub DatabaseSettings);

impl SettingsSource for StaticSettings {
    fn database(&self) -> Result<DatabaseSettings, ConnectionError> {
        Ok(self.0.clone())
    }
}
