//! Conversion worker: drains the task queue, retries with linear backoff,
//! heartbeats, and self-heals after repeated failures.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::converter;
use crate::error::Error;
use crate::models::{ProcessingStats, StatusUpdate, Task, TaskStatus};
use crate::security::Scanner;

/// Maximum retries per task.
pub const MAX_RETRIES: u32 = 3;

/// Consecutive terminal failures before a worker self-heals.
pub const MAX_CONSECUTIVE_FAILURES: u32 = 5;

/// Base backoff; the wait grows linearly with the attempt number.
const BACKOFF_BASE: Duration = Duration::from_millis(500);

/// Time between heartbeat checks.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// A worker is considered unresponsive after this many heartbeat
/// intervals without activity.
const HEARTBEAT_STALE_MULTIPLIER: u32 = 3;

/// Handle kept by the pool supervisor to stop a worker out-of-band.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub id: usize,
    stop: CancellationToken,
}

impl WorkerHandle {
    /// Request the worker to stop after its current task.
    pub fn stop(&self) {
        self.stop.cancel();
    }
}

/// A long-running task that drains the task queue one item at a time.
pub struct Worker {
    id: usize,
    config: Arc<Config>,
    scanner: Option<Arc<Scanner>>,
    task_rx: async_channel::Receiver<Task>,
    status_tx: mpsc::Sender<StatusUpdate>,
    pause_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
    stop: CancellationToken,
    last_activity: Arc<Mutex<Instant>>,
    consecutive_errors: u32,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        config: Arc<Config>,
        scanner: Option<Arc<Scanner>>,
        task_rx: async_channel::Receiver<Task>,
        status_tx: mpsc::Sender<StatusUpdate>,
        pause_rx: watch::Receiver<bool>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            config,
            scanner,
            task_rx,
            status_tx,
            pause_rx,
            cancel,
            stop: CancellationToken::new(),
            last_activity: Arc::new(Mutex::new(Instant::now())),
            consecutive_errors: 0,
        }
    }

    /// Out-of-band stop handle for the pool supervisor.
    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            id: self.id,
            stop: self.stop.clone(),
        }
    }

    /// Main loop. Exits on root cancellation, on the private stop signal,
    /// or when the task channel is closed and drained.
    pub async fn run(mut self) {
        debug!(worker = self.id, "worker started");
        let heartbeat = self.spawn_heartbeat();
        let mut pause_open = true;

        loop {
            // A paused worker must not consume tasks.
            if pause_open && *self.pause_rx.borrow() {
                if !self.wait_resumed().await {
                    break;
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.stop.cancelled() => {
                    debug!(worker = self.id, "worker stopping on request");
                    break;
                }
                changed = self.pause_rx.changed(), if pause_open => {
                    if changed.is_err() {
                        pause_open = false;
                    }
                    continue;
                }
                task = self.task_rx.recv() => match task {
                    Ok(task) => {
                        self.process_task(task).await;
                        *self.last_activity.lock() = Instant::now();

                        if self.consecutive_errors > MAX_CONSECUTIVE_FAILURES {
                            warn!(
                                worker = self.id,
                                failures = self.consecutive_errors,
                                "self-healing after repeated failures"
                            );
                            self.consecutive_errors = 0;
                            crate::resource::trim_memory();
                        }
                    }
                    // Channel closed and drained: the input set is finite
                    // and this worker is done.
                    Err(_) => break,
                },
            }
        }

        heartbeat.abort();
        debug!(worker = self.id, "worker exited");
    }

    /// Block until the pause state clears. Returns false if the worker
    /// should exit instead.
    async fn wait_resumed(&mut self) -> bool {
        debug!(worker = self.id, "paused by resource governor");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = self.stop.cancelled() => return false,
                changed = self.pause_rx.changed() => {
                    if changed.is_err() || !*self.pause_rx.borrow() {
                        debug!(worker = self.id, "resuming");
                        return true;
                    }
                }
            }
        }
    }

    /// Companion task that stops the worker if it stays inactive for too
    /// long, guarding against a conversion that silently hangs.
    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let last_activity = self.last_activity.clone();
        let stop = self.stop.clone();
        let cancel = self.cancel.clone();
        let id = self.id;

        tokio::spawn(async move {
            let stale_after = HEARTBEAT_INTERVAL * HEARTBEAT_STALE_MULTIPLIER;
            let mut tick = tokio::time::interval(HEARTBEAT_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = stop.cancelled() => break,
                    _ = tick.tick() => {
                        if last_activity.lock().elapsed() > stale_after {
                            warn!(worker = id, "worker unresponsive, requesting stop");
                            stop.cancel();
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Run a single task through up to `MAX_RETRIES` + 1 attempts with
    /// linear backoff.
    async fn process_task(&mut self, task: Task) {
        let started = Instant::now();
        let mut stats = ProcessingStats::begin(self.id, task.size);

        self.send_intermediate(&task.id, 0.0, "started processing", &stats);

        let mut retries: u32 = 0;
        loop {
            if self.cancel.is_cancelled() {
                Self::finalize(&mut stats, started, retries);
                self.send_terminal(
                    &task.id,
                    TaskStatus::Failed,
                    "cancelled",
                    Some(Error::Cancelled.to_string()),
                    stats,
                )
                .await;
                return;
            }

            match converter::convert_eml_to_pdf(&task.path, &self.config, self.scanner.as_deref())
                .await
            {
                Ok(result) => {
                    Self::finalize(&mut stats, started, retries);
                    self.consecutive_errors = 0;
                    self.send_terminal(
                        &task.id,
                        TaskStatus::Complete,
                        format!("conversion complete in {:.2?}", result.duration),
                        None,
                        stats,
                    )
                    .await;
                    return;
                }
                Err(err) => {
                    retries += 1;
                    self.consecutive_errors += 1;

                    if retries > MAX_RETRIES {
                        Self::finalize(&mut stats, started, MAX_RETRIES);
                        self.send_terminal(
                            &task.id,
                            TaskStatus::Failed,
                            "all retries failed",
                            Some(err.to_string()),
                            stats,
                        )
                        .await;
                        return;
                    }

                    let backoff = BACKOFF_BASE * retries;
                    stats.retries = retries;
                    self.send_intermediate(
                        &task.id,
                        0.0,
                        &format!("retrying ({retries}/{MAX_RETRIES}) after {backoff:?}: {err}"),
                        &stats,
                    );

                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            Self::finalize(&mut stats, started, retries);
                            self.send_terminal(
                                &task.id,
                                TaskStatus::Failed,
                                "cancelled during retry",
                                Some(Error::Cancelled.to_string()),
                                stats,
                            )
                            .await;
                            return;
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
            }
        }
    }

    fn finalize(stats: &mut ProcessingStats, started: Instant, retries: u32) {
        stats.ended_at = Some(Utc::now());
        stats.duration = started.elapsed();
        stats.retries = retries;
    }

    /// Best-effort send: a full status channel drops the update, the next
    /// update or the terminal one refreshes the picture.
    fn send_intermediate(&self, task_id: &str, progress: f64, message: &str, stats: &ProcessingStats) {
        let update = StatusUpdate {
            worker_id: self.id,
            task_id: task_id.to_string(),
            status: TaskStatus::Processing,
            progress,
            message: message.to_string(),
            error: None,
            stats: stats.clone(),
        };
        if self.status_tx.try_send(update).is_err() {
            debug!(worker = self.id, task = task_id, "status channel full, dropping update");
        }
    }

    /// Blocking send: terminal updates must never be dropped, the
    /// aggregate counters depend on them.
    async fn send_terminal(
        &self,
        task_id: &str,
        status: TaskStatus,
        message: impl Into<String>,
        error: Option<String>,
        stats: ProcessingStats,
    ) {
        let progress = if status == TaskStatus::Complete { 1.0 } else { 0.0 };
        let update = StatusUpdate {
            worker_id: self.id,
            task_id: task_id.to_string(),
            status,
            progress,
            message: message.into(),
            error,
            stats,
        };
        if self.status_tx.send(update).await.is_err() {
            debug!(worker = self.id, task = task_id, "manager gone, terminal update lost");
        }
    }
}
