use navigator_core::settings::{EngineTimings, NavigatorSettings};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Contents of a settings file: navigator settings at the top level, plus
/// an optional `timings` object.
#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    #[serde(flatten)]
    settings: NavigatorSettings,
    #[serde(default)]
    timings: EngineTimings,
}

/// Resolved daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the vault root directory
    pub vault_path: PathBuf,
    /// Name of the vault (derived from vault_path)
    pub vault_name: String,
    /// Settings file that was loaded, if any
    pub settings_path: Option<PathBuf>,
    pub settings: NavigatorSettings,
    pub timings: EngineTimings,
}

impl DaemonConfig {
    /// Resolve the vault path and load settings.
    ///
    /// `settings_path` defaults to `<vault>/.navigator/settings.json`. A
    /// missing default file means built-in settings; a missing explicit file
    /// is an error.
    pub fn load(vault: &str, settings_path: Option<&str>) -> Result<Self, ConfigError> {
        let vault_path = expand_tilde(vault);
        if !vault_path.is_dir() {
            return Err(ConfigError::VaultNotFound(vault_path));
        }

        let vault_name = vault_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("vault")
            .to_string();

        let (path, required) = match settings_path {
            Some(path) => (expand_tilde(path), true),
            None => (Self::default_settings_path(&vault_path), false),
        };

        let (file, settings_path) = if path.exists() {
            (read_settings(&path)?, Some(path))
        } else if required {
            return Err(ConfigError::SettingsNotFound(path));
        } else {
            (SettingsFile::default(), None)
        };

        Ok(Self {
            vault_path,
            vault_name,
            settings_path,
            settings: file.settings,
            timings: file.timings,
        })
    }

    pub fn default_settings_path(vault_path: &Path) -> PathBuf {
        vault_path.join(".navigator").join("settings.json")
    }

    /// Re-read the settings file. `None` when no file backs this config.
    pub fn reload_settings(&self) -> Option<Result<NavigatorSettings, ConfigError>> {
        let path = self.settings_path.as_ref()?;
        Some(read_settings(path).map(|file| file.settings))
    }
}

fn read_settings(path: &Path) -> Result<SettingsFile, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Expand ~ or ~/ prefix to the user's home directory.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("~"))
    } else if let Some(rest) = path.strip_prefix("~/") {
        dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path))
    } else {
        PathBuf::from(path)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Vault directory not found: {0:?}")]
    VaultNotFound(PathBuf),

    #[error("Settings file not found: {0:?}")]
    SettingsNotFound(PathBuf),

    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid settings in {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}
