//! Configuration storage and data location resolution.
//!
//! Provides centralized storage for named JSON presets (sweep configurations,
//! device settings). All config is stored in ~/.acq_config/ by default.
//! Acquired data goes under an explicit save path or, failing that, $HOME.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};

fn home_dir() -> std::io::Result<PathBuf> {
    std::env::var("HOME")
        .map(PathBuf::from)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::NotFound, "HOME not set"))
}

/// Base directory for acquired data: `explicit` when given, else $HOME
pub fn resolve_save_base(explicit: Option<&Path>) -> std::io::Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => home_dir(),
    }
}

/// Configuration storage manager for named presets.
#[derive(Debug, Clone)]
pub struct ConfigStorage {
    /// Root directory for all configuration (e.g., ~/.acq_config)
    root_path: PathBuf,
}

impl ConfigStorage {
    /// Create a new config storage with default path (~/.acq_config)
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            root_path: home_dir()?.join(".acq_config"),
        })
    }

    /// Create a new config storage with custom root path
    pub fn with_path(root_path: PathBuf) -> Self {
        Self { root_path }
    }

    /// Get the root configuration path
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    fn preset_path(&self, kind: &str, name: &str) -> PathBuf {
        let name_safe = name.replace([' ', '/'], "_");
        self.root_path.join(kind).join(format!("{name_safe}.json"))
    }

    /// Load a preset of the given kind.
    ///
    /// Returns None if no such preset exists.
    /// Returns Some(Err) if the file exists but cannot be loaded.
    pub fn load_preset<T: DeserializeOwned>(
        &self,
        kind: &str,
        name: &str,
    ) -> Option<std::io::Result<T>> {
        let path = self.preset_path(kind, name);

        if !path.exists() {
            return None;
        }

        Some(load_json(&path))
    }

    /// Save a preset, creating the kind directory if needed.
    ///
    /// Returns the path where the preset was saved.
    pub fn save_preset<T: Serialize>(
        &self,
        kind: &str,
        name: &str,
        value: &T,
    ) -> std::io::Result<PathBuf> {
        let path = self.preset_path(kind, name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        save_json(&path, value)?;
        Ok(path)
    }

    /// List preset names of the given kind
    pub fn list_presets(&self, kind: &str) -> std::io::Result<Vec<String>> {
        let dir = self.root_path.join(kind);

        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) == Some("json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.push(stem.to_string());
                }
            }
        }
        names.sort();

        Ok(names)
    }
}

/// Read a JSON document from `path`
pub fn load_json<T: DeserializeOwned>(path: &Path) -> std::io::Result<T> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Write `value` to `path` as pretty-printed JSON
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    std::fs::write(path, text)
}
