use std::path::PathBuf;
use anyhow::{Context, Result};
use clap::Parser;

use crate::config::CommitWatchConfig;

#[derive(Parser)]
#[command(name = "commitwatch")]
#[command(author = "commitwatch contributors")]
#[command(version)]
#[command(about = "Watches directories and commits recent edits to git once they settle")]
#[command(long_about = "commitwatch subscribes to a set of directories, filters changed files by name, and records a single git commit per directory once no further changes have arrived for the debounce period.")]
pub struct Cli {
    /// Configuration file (JSON or TOML)
    #[arg(short, long, value_name = "PATH", default_value = "./config.json", help = "Path to the configuration file")]
    pub config: PathBuf,

    /// Override the quiet period before committing
    #[arg(long, value_name = "MS", help = "Milliseconds without changes before committing")]
    pub debounce_ms: Option<u64>,

    /// Override the per-directory queue size
    #[arg(long, value_name = "N", help = "Accepted changes buffered per directory")]
    pub queue_capacity: Option<usize>,

    /// Log commits instead of running git
    #[arg(long, help = "Log what would be committed without touching git")]
    pub dry_run: bool,

    /// Git executable to run
    #[arg(long, value_name = "PATH", default_value = "git", help = "Git executable")]
    pub git: PathBuf,

    /// Enable verbose logging
    #[arg(short, long, help = "Log every accept/skip decision")]
    pub verbose: bool,
}

impl Cli {
    pub fn setup_logging(&self) {
        let level = if self.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::INFO
        };

        tracing_subscriber::fmt()
            .with_max_level(level)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }

    /// Load the configuration file, then apply environment and command-line
    /// overrides in that order.
    pub fn load_config(&self) -> Result<CommitWatchConfig> {
        let mut config = CommitWatchConfig::load(&self.config)?;
        config.apply_env();
        self.apply_overrides(&mut config);

        config
            .validate()
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("Invalid configuration in {}", self.config.display()))?;
        Ok(config)
    }

    pub fn apply_overrides(&self, config: &mut CommitWatchConfig) {
        if let Some(ms) = self.debounce_ms {
            config.settings.debounce_ms = ms;
        }
        if let Some(capacity) = self.queue_capacity {
            config.settings.queue_capacity = capacity;
        }
    }
}
