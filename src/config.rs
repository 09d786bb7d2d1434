//! Configuration management for commitwatch
//!
//! A configuration is a list of watch targets plus pipeline settings. It is
//! read from JSON (including the legacy `config.json` layout with
//! `WatchDirs`/`Base`/`SubDirs`/`IncludeFiles`/`ExcludeFiles` keys) or TOML,
//! then adjusted from the environment and the command line.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::filter::FileFilter;

/// One watched directory and its filename rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchTarget {
    #[serde(alias = "Base")]
    pub base: PathBuf,
    /// Extra directories to subscribe to. Relative entries resolve against `base`.
    #[serde(default, alias = "SubDirs")]
    pub sub_dirs: Vec<PathBuf>,
    #[serde(default, alias = "IncludeFiles")]
    pub include: Vec<String>,
    #[serde(default, alias = "ExcludeFiles")]
    pub exclude: Vec<String>,
}

impl WatchTarget {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            sub_dirs: Vec::new(),
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }

    pub fn with_sub_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.sub_dirs.push(dir.into());
        self
    }

    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }

    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.include.push(pattern.into());
        self
    }

    pub fn filter(&self) -> FileFilter {
        FileFilter::new(self.exclude.as_slice(), self.include.as_slice())
    }

    /// Every directory this target subscribes to, base first.
    pub fn watch_paths(&self) -> Vec<PathBuf> {
        std::iter::once(self.base.clone())
            .chain(self.sub_dirs.iter().map(|dir| {
                if dir.is_absolute() {
                    dir.clone()
                } else {
                    self.base.join(dir)
                }
            }))
            .collect()
    }
}

/// Pipeline tuning shared by every target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Quiet period after the last change before a commit is made
    pub debounce_ms: u64,
    /// Capacity of each directory's accepted-change queue
    pub queue_capacity: usize,
    /// Commit subject; `{count}` and `{timestamp}` are substituted
    pub commit_message: String,
    /// List the committed files in the commit body
    pub list_files_in_body: bool,
    /// Attempts per flush before the change set is handed back
    pub max_commit_attempts: u32,
    /// Delay before the first retry, doubled on each further retry
    pub retry_backoff_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debounce_ms: 5_000,
            queue_capacity: 16,
            commit_message: "Updated".to_string(),
            list_files_in_body: true,
            max_commit_attempts: 3,
            retry_backoff_ms: 500,
        }
    }
}

impl Settings {
    pub fn debounce_duration(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn retry_backoff_duration(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitWatchConfig {
    #[serde(default)]
    pub settings: Settings,
    #[serde(alias = "WatchDirs")]
    pub watch_dirs: Vec<WatchTarget>,
}

impl CommitWatchConfig {
    /// Load a configuration file, picking the format from its extension.
    /// Anything other than `.toml` is read as JSON.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let is_toml = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        if is_toml {
            Self::from_toml_str(&text)
                .with_context(|| format!("Invalid TOML in {}", path.display()))
        } else {
            Self::from_json_str(&text)
                .with_context(|| format!("Invalid JSON in {}", path.display()))
        }
    }

    pub fn from_json_str(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Override settings with environment variables if present
    pub fn apply_env(&mut self) {
        if let Ok(val) = std::env::var("COMMITWATCH_DEBOUNCE_MS") {
            if let Ok(ms) = val.parse::<u64>() {
                self.settings.debounce_ms = ms;
            }
        }

        if let Ok(val) = std::env::var("COMMITWATCH_QUEUE_CAPACITY") {
            if let Ok(capacity) = val.parse::<usize>() {
                self.settings.queue_capacity = capacity;
            }
        }

        if let Ok(val) = std::env::var("COMMITWATCH_MAX_COMMIT_ATTEMPTS") {
            if let Ok(attempts) = val.parse::<u32>() {
                self.settings.max_commit_attempts = attempts;
            }
        }

        if let Ok(val) = std::env::var("COMMITWATCH_COMMIT_MESSAGE") {
            if !val.trim().is_empty() {
                self.settings.commit_message = val;
            }
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.watch_dirs.is_empty() {
            return Err("at least one watch directory must be configured".to_string());
        }

        if self.settings.debounce_ms == 0 {
            return Err("debounce_ms must be greater than 0".to_string());
        }

        if self.settings.queue_capacity == 0 {
            return Err("queue_capacity must be greater than 0".to_string());
        }

        if self.settings.max_commit_attempts == 0 {
            return Err("max_commit_attempts must be greater than 0".to_string());
        }

        if self.settings.commit_message.trim().is_empty() {
            return Err("commit_message must not be empty".to_string());
        }

        let mut seen = HashSet::new();
        for target in &self.watch_dirs {
            if target.base.as_os_str().is_empty() {
                return Err("watch directory base path must not be empty".to_string());
            }
            if !seen.insert(&target.base) {
                return Err(format!("duplicate watch directory: {}", target.base.display()));
            }
            if let Some(pattern) = target
                .exclude
                .iter()
                .chain(target.include.iter())
                .find(|p| p.trim().is_empty())
            {
                return Err(format!(
                    "empty filename pattern {:?} for {}",
                    pattern,
                    target.base.display()
                ));
            }
        }

        Ok(())
    }
}
