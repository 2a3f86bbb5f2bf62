//! Persistent key=value configuration.
//!
//! The file format is deliberately dumb: one `KEY=VALUE` per line, UTF-8,
//! unknown keys preserved on rewrite, malformed lines skipped. The store is
//! the only writer; the process is single-instance by convention.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;

pub const VAULT_PATH: &str = "VAULT_PATH";
pub const EDITOR_PATH: &str = "EDITOR_PATH";
pub const REMOTE_URL: &str = "REMOTE_URL";
pub const SETUP_DONE: &str = "SETUP_DONE";

pub struct ConfigStore {
    path: PathBuf,
    entries: Vec<(String, String)>,
}

impl ConfigStore {
    /// Platform config file location, e.g. `~/.config/ogresync/config.txt`.
    pub fn default_path() -> Result<PathBuf> {
        let base = dirs_next::config_dir().context("Could not determine a config directory")?;
        Ok(base.join("ogresync").join("config.txt"))
    }

    pub fn open_default() -> Result<Self> {
        Self::open(Self::default_path()?)
    }

    pub fn open(path: PathBuf) -> Result<Self> {
        let mut store = ConfigStore {
            path,
            entries: Vec::new(),
        };
        store.load()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&mut self) -> Result<()> {
        self.entries.clear();
        if !self.path.exists() {
            debug!("no config file at {}", self.path.display());
            return Ok(());
        }
        let content = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read config file {}", self.path.display()))?;
        for line in content.lines() {
            let line = line.trim();
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            self.set(key, value.trim());
        }
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory {}", parent.display()))?;
        }
        let mut content = String::new();
        for (key, value) in &self.entries {
            content.push_str(key);
            content.push('=');
            content.push_str(value);
            content.push('\n');
        }
        fs::write(&self.path, content)
            .with_context(|| format!("Failed to write config file {}", self.path.display()))?;
        Ok(())
    }

    /// Missing keys read as the empty string.
    pub fn get(&self, key: &str) -> String {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.clone())
            .unwrap_or_default()
    }

    pub fn set(&mut self, key: &str, value: &str) {
        match self
            .entries
            .iter_mut()
            .find(|(existing, _)| existing == key)
        {
            Some((_, existing_value)) => *existing_value = value.to_owned(),
            None => self.entries.push((key.to_owned(), value.to_owned())),
        }
    }

    pub fn is_setup_done(&self) -> bool {
        self.get(SETUP_DONE) == "1"
    }
}
