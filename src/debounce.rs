//! Per-directory change aggregation and debounced commits
//!
//! Each watched directory gets two tasks:
//!
//! - the aggregator, which absorbs accepted changes into a working
//!   [`ChangeSet`] and owns the quiescence timer;
//! - the committer, which turns flushed sets into commits through a
//!   [`CommitSink`].
//!
//! The working set is never shared. When the timer fires, the aggregator
//! takes it by value, leaves an empty set behind and sends the taken set to
//! the committer. Changes that arrive while a commit is running go into the
//! fresh set under a fresh timer. A set whose commit keeps failing is sent
//! back the same way and merged into whatever is pending.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tracing::{debug, error, info, warn};

use crate::config::Settings;
use crate::events::{ChangeRecord, ChangeSet};
use crate::sink::{commit_with_retry, render_message, CommitOutcome, CommitRequest, CommitSink, RetryPolicy};

/// Report sent to the operator channel when a flush runs out of retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushFailure {
    pub base: PathBuf,
    pub paths: Vec<PathBuf>,
    pub attempts: u32,
    pub error: String,
}

/// Handles to the two tasks of one directory's pipeline.
pub struct PipelineTasks {
    base: PathBuf,
    aggregator: JoinHandle<()>,
    committer: JoinHandle<()>,
}

impl PipelineTasks {
    /// Wait for both tasks to finish. The aggregator stops once shutdown is
    /// signalled or its queue closes; the committer stops after the last
    /// flush it was handed has been recorded.
    pub async fn join(self) {
        if let Err(err) = self.aggregator.await {
            error!("Aggregator for {} ended abnormally: {}", self.base.display(), err);
        }
        if let Err(err) = self.committer.await {
            error!("Committer for {} ended abnormally: {}", self.base.display(), err);
        }
    }
}

/// Start the aggregator and committer for `base`.
///
/// Returns the bounded queue that accepted changes must be sent to. Must be
/// called from within a Tokio runtime.
pub fn spawn_pipeline(
    base: PathBuf,
    settings: &Settings,
    sink: Arc<dyn CommitSink>,
    shutdown: watch::Receiver<bool>,
    failures: mpsc::UnboundedSender<FlushFailure>,
) -> (mpsc::Sender<ChangeRecord>, PipelineTasks) {
    let (queue_tx, queue_rx) = mpsc::channel(settings.queue_capacity.max(1));
    let (flush_tx, flush_rx) = mpsc::unbounded_channel();
    let (requeue_tx, requeue_rx) = mpsc::unbounded_channel();

    let aggregator = Aggregator::new(base.clone(), settings.debounce_duration());
    let aggregator = tokio::spawn(aggregator.run(queue_rx, requeue_rx, flush_tx, shutdown));

    let committer = Committer {
        base: base.clone(),
        settings: settings.clone(),
        sink,
        requeue: requeue_tx,
        failures,
    };
    let committer = tokio::spawn(committer.run(flush_rx));

    (
        queue_tx,
        PipelineTasks {
            base,
            aggregator,
            committer,
        },
    )
}

struct Aggregator {
    base: PathBuf,
    idle: Duration,
    pending: ChangeSet,
    /// Whether the quiescence timer is running. There is only ever one timer;
    /// it is reset in place rather than replaced.
    armed: bool,
}

impl Aggregator {
    fn new(base: PathBuf, idle: Duration) -> Self {
        Self {
            base,
            idle,
            pending: ChangeSet::new(),
            armed: false,
        }
    }

    async fn run(
        mut self,
        mut queue: mpsc::Receiver<ChangeRecord>,
        mut requeued: mpsc::UnboundedReceiver<ChangeSet>,
        flushes: mpsc::UnboundedSender<ChangeSet>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let timer = tokio::time::sleep(self.idle);
        tokio::pin!(timer);

        let mut stopping = *shutdown.borrow();
        while !stopping {
            tokio::select! {
                biased;

                changed = shutdown.changed() => {
                    // A dropped sender also means nobody can keep us running
                    stopping = changed.is_err() || *shutdown.borrow();
                }
                record = queue.recv() => match record {
                    Some(record) => self.absorb(record, timer.as_mut()),
                    None => stopping = true,
                },
                Some(failed) = requeued.recv() => self.take_back(failed, timer.as_mut()),
                () = &mut timer, if self.armed => self.flush(&flushes),
            }
        }

        // Nothing accepted so far may be lost: drain what is queued and
        // flush it without waiting for the timer.
        while let Ok(record) = queue.try_recv() {
            self.pending.insert(record);
        }
        while let Ok(failed) = requeued.try_recv() {
            self.pending.absorb_older(failed);
        }
        if !self.pending.is_empty() {
            info!(
                "Shutting down: flushing {} pending change(s) in {}",
                self.pending.len(),
                self.base.display()
            );
        }
        self.flush(&flushes);
        debug!("Aggregator for {} stopped", self.base.display());
    }

    fn absorb(&mut self, record: ChangeRecord, timer: Pin<&mut Sleep>) {
        let path = record.path.clone();
        let is_new = self.pending.insert(record);
        timer.reset(Instant::now() + self.idle);

        if self.armed {
            debug!(
                "Additional change to {} ({}), delaying commit of {} file(s) by {:?}",
                path.display(),
                if is_new { "new" } else { "already pending" },
                self.pending.len(),
                self.idle
            );
        } else {
            self.armed = true;
            debug!(
                "Queued {} for commit in {}, committing after {:?} without changes",
                path.display(),
                self.base.display(),
                self.idle
            );
        }
    }

    fn take_back(&mut self, failed: ChangeSet, timer: Pin<&mut Sleep>) {
        warn!(
            "Re-queuing {} uncommitted file(s) in {}",
            failed.len(),
            self.base.display()
        );
        self.pending.absorb_older(failed);
        if !self.armed {
            timer.reset(Instant::now() + self.idle);
            self.armed = true;
        }
    }

    fn flush(&mut self, flushes: &mpsc::UnboundedSender<ChangeSet>) {
        self.armed = false;
        if self.pending.is_empty() {
            return;
        }

        let batch = std::mem::take(&mut self.pending);
        debug!("Handing {} file(s) in {} to the committer", batch.len(), self.base.display());
        if let Err(mpsc::error::SendError(batch)) = flushes.send(batch) {
            error!(
                "Committer for {} is gone; keeping {} file(s) pending",
                self.base.display(),
                batch.len()
            );
            self.pending = batch;
        }
    }
}

struct Committer {
    base: PathBuf,
    settings: Settings,
    sink: Arc<dyn CommitSink>,
    requeue: mpsc::UnboundedSender<ChangeSet>,
    failures: mpsc::UnboundedSender<FlushFailure>,
}

impl Committer {
    async fn run(self, mut flushes: mpsc::UnboundedReceiver<ChangeSet>) {
        let policy = RetryPolicy::from_settings(&self.settings);

        while let Some(batch) = flushes.recv().await {
            self.commit(batch, policy).await;
        }
        debug!("Committer for {} stopped", self.base.display());
    }

    async fn commit(&self, batch: ChangeSet, policy: RetryPolicy) {
        let request = CommitRequest {
            base: self.base.clone(),
            paths: batch.paths(),
            message: render_message(&self.settings, &self.base, &batch),
        };

        info!("Committing {} file(s) in {}:", request.paths.len(), self.base.display());
        for path in &request.paths {
            info!("\t{}", path.display());
        }

        match commit_with_retry(self.sink.as_ref(), &request, policy).await {
            Ok(CommitOutcome::Committed) => {
                info!("Committed {} file(s) in {}", request.paths.len(), self.base.display());
            }
            Ok(CommitOutcome::NothingToCommit) => {
                info!("No content changes to commit in {}", self.base.display());
            }
            Err((err, attempts)) => {
                error!(
                    "Giving up on commit in {} after {} attempt(s): {}",
                    self.base.display(),
                    attempts,
                    err
                );

                let failure = FlushFailure {
                    base: self.base.clone(),
                    paths: request.paths,
                    attempts,
                    error: err.to_string(),
                };
                if self.failures.send(failure).is_err() {
                    debug!("No operator listening for commit failures");
                }

                if let Err(mpsc::error::SendError(batch)) = self.requeue.send(batch) {
                    let lost: Vec<String> = batch.paths().iter().map(|p| p.display().to_string()).collect();
                    error!(
                        "Pipeline for {} has stopped; these files remain uncommitted: {}",
                        self.base.display(),
                        lost.join(", ")
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::ChangeKind;
    use crate::sink::CommitError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Debug, Clone)]
    struct Recorded {
        at: Instant,
        paths: Vec<PathBuf>,
    }

    /// Records every request; fails the first `fail_first` calls and, when
    /// gated, holds the first call until the gate opens.
    struct RecordingSink {
        calls: Mutex<u32>,
        fail_first: u32,
        gate: Option<Arc<Notify>>,
        started: mpsc::UnboundedSender<()>,
        done: mpsc::UnboundedSender<Recorded>,
    }

    #[async_trait]
    impl CommitSink for RecordingSink {
        async fn commit(&self, request: &CommitRequest) -> Result<CommitOutcome, CommitError> {
            let call = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls
            };
            let _ = self.started.send(());

            if call == 1 {
                if let Some(gate) = &self.gate {
                    gate.notified().await;
                }
            }
            if call <= self.fail_first {
                return Err(CommitError::Rejected(format!("call {}", call)));
            }

            let _ = self.done.send(Recorded {
                at: Instant::now(),
                paths: request.paths.clone(),
            });
            Ok(CommitOutcome::Committed)
        }
    }

    struct Harness {
        queue: mpsc::Sender<ChangeRecord>,
        tasks: PipelineTasks,
        shutdown: watch::Sender<bool>,
        started: mpsc::UnboundedReceiver<()>,
        done: mpsc::UnboundedReceiver<Recorded>,
        failures: mpsc::UnboundedReceiver<FlushFailure>,
    }

    fn harness(fail_first: u32, gate: Option<Arc<Notify>>) -> Harness {
        let (started_tx, started) = mpsc::unbounded_channel();
        let (done_tx, done) = mpsc::unbounded_channel();
        let (failures_tx, failures) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let sink = Arc::new(RecordingSink {
            calls: Mutex::new(0),
            fail_first,
            gate,
            started: started_tx,
            done: done_tx,
        });
        let settings = Settings {
            max_commit_attempts: 2,
            retry_backoff_ms: 100,
            ..Settings::default()
        };

        let (queue, tasks) = spawn_pipeline(PathBuf::from("/journal"), &settings, sink, shutdown_rx, failures_tx);

        Harness {
            queue,
            tasks,
            shutdown,
            started,
            done,
            failures,
        }
    }

    fn change(name: &str) -> ChangeRecord {
        ChangeRecord::new(PathBuf::from("/journal").join(name), ChangeKind::Modified)
    }

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(|n| PathBuf::from("/journal").join(n)).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_path_commits_once() {
        let mut h = harness(0, None);

        h.queue.send(change("a.txt")).await.unwrap();
        h.queue.send(change("b.txt")).await.unwrap();
        h.queue.send(change("a.txt")).await.unwrap();

        let commit = h.done.recv().await.unwrap();
        assert_eq!(commit.paths, paths(&["a.txt", "b.txt"]));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(h.done.try_recv().is_err(), "expected exactly one commit");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_resets_on_each_change() {
        let mut h = harness(0, None);
        let start = Instant::now();

        h.queue.send(change("a.txt")).await.unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        h.queue.send(change("b.txt")).await.unwrap();

        let commit = h.done.recv().await.unwrap();
        let elapsed = commit.at - start;
        assert!(elapsed >= Duration::from_secs(9), "committed too early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(9_100), "committed too late: {:?}", elapsed);
        assert_eq!(commit.paths, paths(&["a.txt", "b.txt"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_stream_holds_off_commit() {
        let mut h = harness(0, None);
        let start = Instant::now();

        for i in 0..6 {
            h.queue.send(change(&format!("{}.md", i))).await.unwrap();
            tokio::time::sleep(Duration::from_millis(4_900)).await;
            assert!(h.done.try_recv().is_err(), "flushed while changes were still arriving");
        }

        let commit = h.done.recv().await.unwrap();
        assert_eq!(commit.paths.len(), 6);
        // Last change at 5 * 4.9s = 24.5s, quiet period ends 5s later
        let elapsed = commit.at - start;
        assert!(elapsed >= Duration::from_millis(29_500), "committed too early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(29_600), "committed too late: {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_during_commit_goes_to_next_cycle() {
        let gate = Arc::new(Notify::new());
        let mut h = harness(0, Some(gate.clone()));

        h.queue.send(change("a.txt")).await.unwrap();
        h.started.recv().await.unwrap();

        // First commit is now in flight and blocked on the gate
        h.queue.send(change("c.txt")).await.unwrap();
        gate.notify_one();

        let first = h.done.recv().await.unwrap();
        let second = h.done.recv().await.unwrap();
        assert_eq!(first.paths, paths(&["a.txt"]));
        assert_eq!(second.paths, paths(&["c.txt"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_commit_is_reported_and_requeued() {
        // Two attempts per flush; both attempts of the first flush fail
        let mut h = harness(2, None);

        h.queue.send(change("a.txt")).await.unwrap();

        let failure = h.failures.recv().await.unwrap();
        assert_eq!(failure.base, PathBuf::from("/journal"));
        assert_eq!(failure.paths, paths(&["a.txt"]));
        assert_eq!(failure.attempts, 2);
        assert!(failure.error.contains("call 2"));

        h.queue.send(change("b.txt")).await.unwrap();

        let commit = h.done.recv().await.unwrap();
        assert_eq!(commit.paths, paths(&["a.txt", "b.txt"]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_pending_changes() {
        let mut h = harness(0, None);
        let start = Instant::now();

        h.queue.send(change("a.txt")).await.unwrap();
        h.queue.send(change("b.txt")).await.unwrap();
        h.shutdown.send(true).unwrap();

        h.tasks.join().await;

        let commit = h.done.recv().await.unwrap();
        assert_eq!(commit.paths, paths(&["a.txt", "b.txt"]));
        assert!(commit.at - start < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_queue_stops_pipeline() {
        let mut h = harness(0, None);

        h.queue.send(change("a.txt")).await.unwrap();
        drop(h.queue);
        h.tasks.join().await;

        assert_eq!(h.done.recv().await.unwrap().paths, paths(&["a.txt"]));
    }
}
