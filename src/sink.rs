//! Commit sinks: where a flushed change set ends up.
//!
//! [`GitSink`] records each flush as one git commit in the watched base
//! directory. [`DryRunSink`] only logs what would have been committed.

use std::path::{Path, PathBuf};
use std::time::Duration;
use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::config::Settings;
use crate::events::ChangeSet;

/// Everything a sink needs to record one flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRequest {
    pub base: PathBuf,
    pub paths: Vec<PathBuf>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    /// The files ended up identical to what was already recorded.
    NothingToCommit,
}

#[derive(Error, Debug)]
pub enum CommitError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`git {args}` failed in {dir} ({status}): {stderr}")]
    Git {
        args: String,
        dir: String,
        status: String,
        stderr: String,
    },

    #[error("commit rejected: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait CommitSink: Send + Sync {
    async fn commit(&self, request: &CommitRequest) -> Result<CommitOutcome, CommitError>;
}

/// Build the commit message for a change set.
///
/// The subject comes from `Settings::commit_message`; the body, when
/// enabled, lists each file relative to `base` with a one-letter change code.
pub fn render_message(settings: &Settings, base: &Path, changes: &ChangeSet) -> String {
    let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let subject = settings
        .commit_message
        .replace("{count}", &changes.len().to_string())
        .replace("{timestamp}", &timestamp);

    if !settings.list_files_in_body || changes.is_empty() {
        return subject;
    }

    let mut message = subject;
    message.push_str("\n\n");
    for record in changes.records() {
        let shown = record.path.strip_prefix(base).unwrap_or(&record.path);
        message.push_str(&format!("{} {}\n", record.kind.code(), shown.display()));
    }
    message
}

/// Bounded retry with exponential backoff for a single flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_attempts: settings.max_commit_attempts.max(1),
            backoff: settings.retry_backoff_duration(),
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff.saturating_mul(1 << exponent)
    }
}

/// Run `request` through `sink`, retrying failures per `policy`.
///
/// Returns the outcome, or the last error together with the number of
/// attempts made.
pub async fn commit_with_retry(
    sink: &dyn CommitSink,
    request: &CommitRequest,
    policy: RetryPolicy,
) -> Result<CommitOutcome, (CommitError, u32)> {
    let mut attempt = 1;
    loop {
        match sink.commit(request).await {
            Ok(outcome) => return Ok(outcome),
            Err(err) if attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt);
                tracing::warn!(
                    "Commit attempt {}/{} for {} failed: {}; retrying in {:?}",
                    attempt,
                    policy.max_attempts,
                    request.base.display(),
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err((err, attempt)),
        }
    }
}

/// Records commits with the `git` command line.
#[derive(Debug, Clone)]
pub struct GitSink {
    program: PathBuf,
}

impl Default for GitSink {
    fn default() -> Self {
        Self::new()
    }
}

impl GitSink {
    pub fn new() -> Self {
        Self::with_program("git")
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    async fn git(&self, dir: &Path, args: &[&str], paths: &[PathBuf]) -> Result<std::process::Output, CommitError> {
        let mut command = Command::new(&self.program);
        // File names are paths, never globs
        command.args(args).current_dir(dir).env("GIT_LITERAL_PATHSPECS", "1");
        if !paths.is_empty() {
            command.arg("--").args(paths);
        }

        command.output().await.map_err(|source| CommitError::Spawn {
            program: self.program.display().to_string(),
            source,
        })
    }

    /// Stage `paths` in one go, falling back to one path at a time when git
    /// refuses the batch. A path git will not stage (one matched by
    /// `.gitignore`, say) is skipped so the rest still get committed.
    async fn stage(&self, dir: &Path, paths: &[PathBuf]) -> Result<(), CommitError> {
        match self.run_git(dir, &["add", "-A"], paths).await {
            Err(CommitError::Git { stderr, .. }) => {
                tracing::debug!("Batch add in {} failed, staging files one by one: {}", dir.display(), stderr);
            }
            other => return other,
        }

        for path in paths {
            match self.run_git(dir, &["add", "-A"], std::slice::from_ref(path)).await {
                Err(CommitError::Git { stderr, .. }) => {
                    tracing::warn!("Not committing {}: {}", path.display(), stderr);
                }
                other => other?,
            }
        }
        Ok(())
    }

    /// `diff --quiet` exits 0 when nothing is staged and 1 when something is.
    async fn has_staged_change(&self, dir: &Path, path: &Path) -> Result<bool, CommitError> {
        let args = ["diff", "--cached", "--quiet"];
        let output = self.git(dir, &args, &[path.to_path_buf()]).await?;
        match output.status.code() {
            Some(0) => Ok(false),
            Some(1) => Ok(true),
            _ => Err(CommitError::Git {
                args: args.join(" "),
                dir: dir.display().to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    async fn run_git(&self, dir: &Path, args: &[&str], paths: &[PathBuf]) -> Result<(), CommitError> {
        let output = self.git(dir, args, paths).await?;
        if output.status.success() {
            return Ok(());
        }

        Err(CommitError::Git {
            args: args.join(" "),
            dir: dir.display().to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[async_trait]
impl CommitSink for GitSink {
    async fn commit(&self, request: &CommitRequest) -> Result<CommitOutcome, CommitError> {
        if request.message.trim().is_empty() {
            return Err(CommitError::Rejected("empty commit message".to_string()));
        }

        let base = request.base.as_path();
        let (present, missing): (Vec<PathBuf>, Vec<PathBuf>) =
            request.paths.iter().cloned().partition(|path| path.exists());

        if !present.is_empty() {
            self.stage(base, &present).await?;
        }
        if !missing.is_empty() {
            // Deleted files: drop them from the index, tolerating ones git never knew
            self.run_git(base, &["rm", "--cached", "-q", "-r", "--ignore-unmatch"], &missing)
                .await?;
        }

        // Only paths of this change set are committed, whatever else is staged
        let mut staged = Vec::new();
        for path in &request.paths {
            if self.has_staged_change(base, path).await? {
                staged.push(path.clone());
            }
        }
        if staged.is_empty() {
            return Ok(CommitOutcome::NothingToCommit);
        }

        self.run_git(base, &["commit", "-q", "-m", request.message.as_str()], &staged)
            .await?;
        Ok(CommitOutcome::Committed)
    }
}

/// Logs the commit it would make and reports success.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunSink;

#[async_trait]
impl CommitSink for DryRunSink {
    async fn commit(&self, request: &CommitRequest) -> Result<CommitOutcome, CommitError> {
        tracing::info!(
            "[dry run] would commit {} file(s) in {}: {}",
            request.paths.len(),
            request.base.display(),
            request.message.lines().next().unwrap_or_default()
        );
        for path in &request.paths {
            tracing::info!("\t{}", path.display());
        }
        Ok(CommitOutcome::Committed)
    }
}
