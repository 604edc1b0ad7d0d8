//! Persisted application settings: last used folder and the recent-folder list.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Settings file, relative to the working directory
pub const CONFIG_FILE: &str = "config.json";

/// Upper bound on `recent_folders`
pub const MAX_RECENT_FOLDERS: usize = 10;

/// Errors produced while writing the settings file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error writing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("JSON serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The JSON document stored in [`CONFIG_FILE`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Configuration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_folder: Option<String>,
    /// Most recently used first, no duplicates
    #[serde(default)]
    pub recent_folders: Vec<String>,
    /// Keys written by other versions; kept so a save does not drop them
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Configuration {
    /// Moves `folder` to the front of the recent list, dropping any earlier
    /// occurrence and anything past [`MAX_RECENT_FOLDERS`].
    pub fn add_recent_folder(&mut self, folder: impl Into<String>) {
        let folder = folder.into();
        self.recent_folders.retain(|f| *f != folder);
        self.recent_folders.insert(0, folder);
        self.recent_folders.truncate(MAX_RECENT_FOLDERS);
    }

    /// Records `folder` as both the last used folder and the newest recent entry.
    pub fn remember_folder(&mut self, folder: &str) {
        self.last_folder = Some(folder.to_owned());
        self.add_recent_folder(folder);
    }

    /// Recent folders whose path contains `filter`, ignoring case.
    pub fn recent_matching<'a>(&'a self, filter: &str) -> impl Iterator<Item = &'a str> + use<'a> {
        let needle = filter.to_lowercase();
        self.recent_folders
            .iter()
            .filter(move |path| path.to_lowercase().contains(&needle))
            .map(String::as_str)
    }

    fn normalize(mut self) -> Self {
        let mut seen = Vec::with_capacity(self.recent_folders.len());
        self.recent_folders.retain(|f| {
            if seen.contains(f) {
                false
            } else {
                seen.push(f.clone());
                true
            }
        });
        self.recent_folders.truncate(MAX_RECENT_FOLDERS);
        self
    }
}

/// Reads and writes a [`Configuration`] at a fixed path.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new(CONFIG_FILE)
    }
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Never fails: a missing, unreadable or malformed file yields the default.
    pub fn load(&self) -> Configuration {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) => {
                debug!(path = %self.path.display(), error = %err, "No readable config, using defaults");
                return Configuration::default();
            }
        };
        match serde_json::from_str::<Configuration>(&raw) {
            Ok(config) => config.normalize(),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "Config is not valid, using defaults");
                Configuration::default()
            }
        }
    }

    /// Writes `config` as 4-space indented JSON, replacing the previous file.
    pub fn save(&self, config: &Configuration) -> Result<(), ConfigError> {
        let bytes = to_pretty_json(config)?;
        fs::write(&self.path, bytes).map_err(|source| ConfigError::Io {
            path: self.path.clone(),
            source,
        })?;
        debug!(path = %self.path.display(), "Config saved");
        Ok(())
    }
}

fn to_pretty_json(config: &Configuration) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    config.serialize(&mut ser)?;
    Ok(out)
}
