//! Runs one independent pipeline per configured directory.

use std::sync::Arc;
use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use crate::config::{CommitWatchConfig, Settings, WatchTarget};
use crate::debounce::{spawn_pipeline, FlushFailure, PipelineTasks};
use crate::sink::CommitSink;
use crate::watcher::DirectoryWatch;

/// Cloneable trigger for a process-wide shutdown.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    /// Wake [`Supervisor::run`]. The pipelines keep accepting changes until
    /// their watches have been released.
    pub fn trigger(&self) {
        // Only fails once the supervisor itself is gone
        let _ = self.tx.send(true);
    }
}

struct Pipeline {
    watch: DirectoryWatch,
    tasks: PipelineTasks,
}

pub struct Supervisor {
    pipelines: Vec<Pipeline>,
    trigger_tx: Arc<watch::Sender<bool>>,
    trigger_rx: watch::Receiver<bool>,
    /// Stops the aggregators; sent only after every watch is released.
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    failures: Option<mpsc::UnboundedReceiver<FlushFailure>>,
}

impl Supervisor {
    /// Start a watch and aggregator for every configured directory.
    ///
    /// Startup is all-or-nothing: if any directory cannot be watched, the
    /// pipelines already started are shut down again and the error returned.
    pub async fn start(config: &CommitWatchConfig, sink: Arc<dyn CommitSink>) -> Result<Self> {
        let (trigger_tx, trigger_rx) = watch::channel(false);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();

        let mut supervisor = Self {
            pipelines: Vec::with_capacity(config.watch_dirs.len()),
            trigger_tx: Arc::new(trigger_tx),
            trigger_rx,
            stop_tx,
            stop_rx,
            failures: Some(failures_rx),
        };

        for target in &config.watch_dirs {
            let started = supervisor
                .start_pipeline(target, &config.settings, sink.clone(), failures_tx.clone())
                .await;
            if let Err(err) = started {
                error!("Failed to start watching {}: {:#}", target.base.display(), err);
                supervisor.shutdown().await;
                return Err(err);
            }
        }

        info!("Watching {} director(ies)", supervisor.pipelines.len());
        Ok(supervisor)
    }

    async fn start_pipeline(
        &mut self,
        target: &WatchTarget,
        settings: &Settings,
        sink: Arc<dyn CommitSink>,
        failures: mpsc::UnboundedSender<FlushFailure>,
    ) -> Result<()> {
        let target = Arc::new(target.clone());
        let (queue, tasks) = spawn_pipeline(target.base.clone(), settings, sink, self.stop_rx.clone(), failures);

        match DirectoryWatch::start(target, queue) {
            Ok(watch) => {
                self.pipelines.push(Pipeline { watch, tasks });
                Ok(())
            }
            Err(err) => {
                // The queue sender went down with the failed watch, so the
                // aggregator sees a closed queue and exits on its own.
                tasks.join().await;
                Err(err)
            }
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.trigger_tx.clone(),
        }
    }

    /// Operator channel for flushes that exhausted their retries. Can only be
    /// taken once.
    pub fn take_failures(&mut self) -> Option<mpsc::UnboundedReceiver<FlushFailure>> {
        self.failures.take()
    }

    pub fn directory_count(&self) -> usize {
        self.pipelines.len()
    }

    /// Block until a shutdown is triggered, then stop every pipeline.
    pub async fn run(mut self) {
        let mut shutdown = self.trigger_rx.clone();
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        self.shutdown().await;
    }

    /// Release every filesystem subscription, then stop each pipeline and
    /// wait for it to flush what it holds and finish any in-flight commit.
    ///
    /// Aggregators keep draining their queues until the watches are gone, so
    /// a change accepted during shutdown still reaches the final flush.
    pub async fn shutdown(&mut self) {
        info!("Shutting down");
        let _ = self.trigger_tx.send(true);

        let mut watches = Vec::with_capacity(self.pipelines.len());
        let mut tasks = Vec::with_capacity(self.pipelines.len());
        for pipeline in self.pipelines.drain(..) {
            watches.push(pipeline.watch);
            tasks.push(pipeline.tasks);
        }

        // Unwatching waits on the notify thread, which may itself be blocked
        // on a full queue that only the runtime can drain.
        let released = tokio::task::spawn_blocking(move || {
            for watch in watches {
                watch.stop();
            }
        })
        .await;
        if let Err(err) = released {
            error!("Releasing watches ended abnormally: {}", err);
        }

        let _ = self.stop_tx.send(true);
        for task in tasks {
            task.join().await;
        }
        info!("All pipelines stopped");
    }
}
