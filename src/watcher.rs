use std::path::{Path, PathBuf};
use std::sync::Arc;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use anyhow::{Result, Context};
use tokio::sync::mpsc;
use crate::{ChangeRecord, FileFilter, SourceEvent, WatchTarget};

/// Filters raw notifications for one target and forwards accepted paths to
/// that target's aggregator queue.
pub struct Dispatcher {
    base: PathBuf,
    filter: FileFilter,
    queue: mpsc::Sender<ChangeRecord>,
}

impl Dispatcher {
    pub fn new(target: &WatchTarget, queue: mpsc::Sender<ChangeRecord>) -> Self {
        Self {
            base: target.base.clone(),
            filter: target.filter(),
            queue,
        }
    }

    /// Turn one notification into the records that should be committed,
    /// logging every decision along the way.
    pub fn accepted(&self, event: SourceEvent) -> Vec<ChangeRecord> {
        match event {
            SourceEvent::Changed { kind, paths } => paths
                .into_iter()
                .filter(|path| self.accepts(path))
                .map(|path| ChangeRecord::new(path, kind))
                .collect(),
            SourceEvent::Accessed => Vec::new(),
            SourceEvent::Failed(reason) => {
                tracing::error!("Watch error in {}: {}", self.base.display(), reason);
                Vec::new()
            }
        }
    }

    fn accepts(&self, path: &Path) -> bool {
        let Some(file_name) = path.file_name() else {
            tracing::debug!("Ignoring change without a file name: {}", path.display());
            return false;
        };

        // Names that are not valid UTF-8 are still filtered and tracked
        let decision = self.filter.decide(&file_name.to_string_lossy());
        if decision.is_tracked() {
            tracing::debug!("Queuing commit for {}: {}", path.display(), decision);
        } else {
            tracing::debug!("Skipping {}: {}", path.display(), decision);
        }
        decision.is_tracked()
    }

    /// Forward accepted records, blocking while the queue is full.
    ///
    /// Runs on the notification thread, outside the async runtime. Returns
    /// `false` once the aggregator has gone away.
    pub fn dispatch(&self, event: SourceEvent) -> bool {
        for record in self.accepted(event) {
            if self.queue.blocking_send(record).is_err() {
                tracing::debug!("Aggregator for {} is closed; dropping notification", self.base.display());
                return false;
            }
        }
        true
    }
}

/// Filesystem subscription for one [`WatchTarget`].
///
/// Dropping it releases every subscription it holds.
pub struct DirectoryWatch {
    target: Arc<WatchTarget>,
    watcher: RecommendedWatcher,
    watched: Vec<PathBuf>,
}

impl DirectoryWatch {
    pub fn start(target: Arc<WatchTarget>, queue: mpsc::Sender<ChangeRecord>) -> Result<Self> {
        let dispatcher = Dispatcher::new(&target, queue);

        let mut watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            dispatcher.dispatch(SourceEvent::from(result));
        })
        .context("Failed to create file system watcher")?;

        let mut watched = Vec::new();
        for path in target.watch_paths() {
            watcher
                .watch(&path, RecursiveMode::NonRecursive)
                .with_context(|| format!("Failed to start watching {}", path.display()))?;
            tracing::info!("Created watcher on {}", path.display());
            watched.push(path);
        }

        Ok(Self {
            target,
            watcher,
            watched,
        })
    }

    pub fn watched_paths(&self) -> &[PathBuf] {
        &self.watched
    }

    /// Release all subscriptions explicitly, reporting any that fail.
    pub fn stop(mut self) {
        for path in self.watched.drain(..) {
            if let Err(err) = self.watcher.unwatch(&path) {
                tracing::warn!("Failed to unwatch {}: {}", path.display(), err);
            }
        }
        tracing::info!("Stopped watching {}", self.target.base.display());
    }
}
