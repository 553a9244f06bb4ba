//! Pipeline manager: discovers inputs, feeds the task queue, supervises
//! the worker pool, aggregates status updates, and reports progress.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use indicatif::{ProgressBar, ProgressStyle};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::config::Config;
use crate::error::Result;
use crate::models::{DiscoveredFile, StatusUpdate, Task, TaskStatus};
use crate::resource::{GovernorHandles, MemoryGauge, ResourceGovernor};
use crate::security::Scanner;
use crate::utils::format_bytes;

use super::worker::{Worker, WorkerHandle};

/// Capacity of the bounded task channel.
const TASK_CHANNEL_CAPACITY: usize = 100;

/// Capacity of the bounded status channel.
const STATUS_CHANNEL_CAPACITY: usize = 100;

/// Time between stuck-task sweeps.
const STUCK_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// How long a task may go without a heartbeat before it is reported
/// stuck.
const STUCK_TASK_THRESHOLD: Duration = Duration::from_secs(180);

/// Time between verbose progress lines.
const VERBOSE_UPDATE_INTERVAL: Duration = Duration::from_secs(5);

/// How many failed tasks the final report lists individually.
const FAILED_REPORT_LIMIT: usize = 10;

/// Find all `.eml` files under `dir` (extension match is
/// case-insensitive). Fails fast if the walk itself errors.
pub fn discover_eml_files(dir: &Path, recursive: bool) -> Result<Vec<DiscoveredFile>> {
    let mut walker = WalkDir::new(dir);
    if !recursive {
        walker = walker.max_depth(1);
    }

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_eml = entry
            .path()
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("eml"))
            .unwrap_or(false);
        if !is_eml {
            continue;
        }
        let size = entry.metadata()?.len();
        files.push(DiscoveredFile::new(entry.path(), size));
    }

    Ok(files)
}

/// Owns the task registry and statistics, and orchestrates the whole
/// pipeline run.
pub struct Manager {
    config: Arc<Config>,
    scanner: Option<Arc<Scanner>>,
    stats: Arc<RwLock<crate::models::Stats>>,
    tasks_by_id: Arc<Mutex<HashMap<String, Task>>>,
    stuck_tasks: Arc<Mutex<HashMap<String, Instant>>>,
    failed_tasks: Arc<Mutex<Vec<Task>>>,
    cancel: CancellationToken,
}

impl Manager {
    pub fn new(config: Config, scanner: Option<Arc<Scanner>>) -> Self {
        let initial_workers = config.worker_count.max(1);
        Self {
            config: Arc::new(config),
            scanner,
            stats: Arc::new(RwLock::new(crate::models::Stats::new(initial_workers))),
            tasks_by_id: Arc::new(Mutex::new(HashMap::new())),
            stuck_tasks: Arc::new(Mutex::new(HashMap::new())),
            failed_tasks: Arc::new(Mutex::new(Vec::new())),
            cancel: CancellationToken::new(),
        }
    }

    /// Idempotent cancellation; unblocks `start` promptly.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Snapshot of the aggregate statistics, safe to call concurrently
    /// with a running pipeline.
    pub fn stats(&self) -> crate::models::Stats {
        self.stats.read().clone()
    }

    /// Run the pipeline until the input set is drained or `stop` is
    /// called. Returns an error only for pre-pipeline failures; per-file
    /// failures are reported through the statistics instead.
    pub async fn start(&self) -> Result<()> {
        // Everything spawned for this run hangs off a child of the root
        // token, so a normal drain can tear the background tasks down
        // without consuming the root.
        let run = self.cancel.child_token();

        let files = discover_eml_files(&self.config.source_dir, self.config.recursive)?;

        let total_size: u64 = files.iter().map(|f| f.size).sum();
        {
            let mut stats = self.stats.write();
            stats.discovered = files.len();
            stats.total_file_size = total_size;
            stats.start_time = Utc::now();
        }
        info!(
            count = files.len(),
            total = %format_bytes(total_size),
            "found EML files to process"
        );

        let progress = ProgressBar::new(files.len() as u64);
        progress.set_style(
            ProgressStyle::with_template("{msg} [{bar:40}] {pos}/{len} ({elapsed})")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        progress.set_message("Converting");

        let initial_workers = self.config.worker_count.max(1);
        let max_workers = initial_workers * 2;

        let (task_tx, task_rx) = async_channel::bounded::<Task>(TASK_CHANNEL_CAPACITY);
        let (status_tx, mut status_rx) = mpsc::channel::<StatusUpdate>(STATUS_CHANNEL_CAPACITY);

        let (governor, handles) = ResourceGovernor::new(
            1,
            max_workers,
            self.config.max_memory_pct as f64,
            initial_workers,
        );
        let gauge = governor.gauge();
        let _governor_task = governor.spawn(run.child_token());

        let _watchdog = self.spawn_stuck_watchdog(run.clone());
        if self.config.verbose {
            let _verbose = self.spawn_verbose_progress(run.clone(), gauge);
        }

        let _pool = self.spawn_pool(run.clone(), initial_workers, task_rx, status_tx, handles);
        let _enqueue = self.spawn_enqueue(run.clone(), files, task_tx);

        // Aggregate until the supervisor and every worker have dropped
        // their status senders; terminal updates use blocking sends, so
        // none of them can be lost before this loop sees them.
        while let Some(update) = status_rx.recv().await {
            self.handle_status_update(update, &progress);
        }

        run.cancel();
        {
            let mut stats = self.stats.write();
            stats.end_time = Some(Utc::now());
        }
        progress.finish();

        let failed = self.failed_tasks.lock();
        if !failed.is_empty() {
            warn!(count = failed.len(), "failed to process files");
            for task in failed.iter().take(FAILED_REPORT_LIMIT) {
                warn!(
                    path = %task.path.display(),
                    error = task.error.as_deref().unwrap_or("unknown"),
                    "conversion failed"
                );
            }
            if failed.len() > FAILED_REPORT_LIMIT {
                warn!("... and {} more", failed.len() - FAILED_REPORT_LIMIT);
            }
        }

        Ok(())
    }

    /// Push all tasks in discovery order, then close the channel. Closing
    /// is the workers' only signal that the input set is finite.
    fn spawn_enqueue(
        &self,
        run: CancellationToken,
        files: Vec<DiscoveredFile>,
        task_tx: async_channel::Sender<Task>,
    ) -> JoinHandle<()> {
        let tasks_by_id = self.tasks_by_id.clone();

        tokio::spawn(async move {
            for file in files {
                let task = Task::new(file.path, file.size);
                tasks_by_id.lock().insert(task.id.clone(), task.clone());

                tokio::select! {
                    _ = run.cancelled() => break,
                    sent = task_tx.send(task) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            task_tx.close();
        })
    }

    /// Start the initial workers and the pool supervisor that reacts to
    /// governor deltas. The supervisor exits once every worker has, which
    /// in turn releases the status channel.
    fn spawn_pool(
        &self,
        run: CancellationToken,
        initial_workers: usize,
        task_rx: async_channel::Receiver<Task>,
        status_tx: mpsc::Sender<StatusUpdate>,
        handles: GovernorHandles,
    ) -> JoinHandle<()> {
        let GovernorHandles {
            mut worker_control,
            pause_control,
        } = handles;
        let config = self.config.clone();
        let scanner = self.scanner.clone();
        let stats = self.stats.clone();

        tokio::spawn(async move {
            let mut pool: BTreeMap<usize, WorkerHandle> = BTreeMap::new();
            let mut join_set: JoinSet<()> = JoinSet::new();
            let mut worker_by_task: HashMap<tokio::task::Id, usize> = HashMap::new();
            let mut next_id: usize = 0;

            let spawn_worker = |join_set: &mut JoinSet<()>,
                                    pool: &mut BTreeMap<usize, WorkerHandle>,
                                    worker_by_task: &mut HashMap<tokio::task::Id, usize>,
                                    id: usize| {
                let worker = Worker::new(
                    id,
                    config.clone(),
                    scanner.clone(),
                    task_rx.clone(),
                    status_tx.clone(),
                    pause_control.clone(),
                    run.child_token(),
                );
                pool.insert(id, worker.handle());
                let abort = join_set.spawn(worker.run());
                worker_by_task.insert(abort.id(), id);
            };

            for _ in 0..initial_workers {
                spawn_worker(&mut join_set, &mut pool, &mut worker_by_task, next_id);
                next_id += 1;
            }

            loop {
                tokio::select! {
                    _ = run.cancelled() => break,
                    delta = worker_control.recv() => match delta {
                        Some(delta) if delta > 0 => {
                            debug!(worker = next_id, "supervisor adding worker");
                            spawn_worker(&mut join_set, &mut pool, &mut worker_by_task, next_id);
                            next_id += 1;

                            let mut stats = stats.write();
                            stats.current_workers += 1;
                            if stats.current_workers > stats.max_workers {
                                stats.max_workers = stats.current_workers;
                            }
                        }
                        Some(delta) if delta < 0 => {
                            // Never drop below one remaining worker.
                            if pool.len() > 1 {
                                if let Some((&id, _)) = pool.iter().next_back() {
                                    debug!(worker = id, "supervisor retiring worker");
                                    if let Some(handle) = pool.remove(&id) {
                                        handle.stop();
                                    }

                                    let mut stats = stats.write();
                                    stats.current_workers =
                                        stats.current_workers.saturating_sub(1);
                                    if stats.current_workers < stats.min_workers {
                                        stats.min_workers = stats.current_workers;
                                    }
                                }
                            }
                        }
                        // Zero delta or a closed governor channel: nothing
                        // to apply.
                        _ => {}
                    },
                    joined = join_set.join_next_with_id() => match joined {
                        Some(Ok((task_id, ()))) => {
                            if let Some(worker_id) = worker_by_task.remove(&task_id) {
                                pool.remove(&worker_id);
                            }
                            if join_set.is_empty() {
                                break;
                            }
                        }
                        Some(Err(join_err)) => {
                            error!(error = %join_err, "worker task failed");
                            if let Some(worker_id) = worker_by_task.remove(&join_err.id()) {
                                pool.remove(&worker_id);
                            }
                            if join_set.is_empty() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }

            // Wait out any workers still finishing their current task; the
            // manager keeps draining the status channel meanwhile.
            while join_set.join_next().await.is_some() {}
            debug!("pool supervisor exited");
        })
    }

    fn handle_status_update(&self, update: StatusUpdate, progress: &ProgressBar) {
        {
            let mut tasks = self.tasks_by_id.lock();
            if let Some(task) = tasks.get_mut(&update.task_id) {
                task.status = update.status;
                task.error = update.error.clone();
                if update.status.is_terminal() {
                    task.completed_at = Some(Utc::now());
                    task.retries = update.stats.retries;
                }
            }
        }

        {
            let mut stuck = self.stuck_tasks.lock();
            match update.status {
                TaskStatus::Processing => {
                    stuck.insert(update.task_id.clone(), Instant::now());
                }
                _ => {
                    stuck.remove(&update.task_id);
                }
            }
        }

        {
            let mut stats = self.stats.write();
            match update.status {
                TaskStatus::Pending => {}
                TaskStatus::Processing => stats.processing += 1,
                TaskStatus::Complete => {
                    stats.processed += 1;
                    stats.successful += 1;
                    stats.processing = stats.processing.saturating_sub(1);
                    progress.inc(1);

                    let secs = update.stats.duration.as_secs_f64();
                    if secs > 0.0 && update.stats.file_size > 0 {
                        stats.record_speed(update.stats.file_size as f64 / secs);
                    }
                }
                TaskStatus::Failed => {
                    stats.processed += 1;
                    stats.failed += 1;
                    stats.processing = stats.processing.saturating_sub(1);
                    progress.inc(1);
                }
            }
        }

        if update.status == TaskStatus::Failed {
            let failed_task = self.tasks_by_id.lock().get(&update.task_id).cloned();
            if let Some(task) = failed_task {
                self.failed_tasks.lock().push(task);
            }
            if self.config.verbose {
                warn!(
                    task = %update.task_id,
                    error = update.error.as_deref().unwrap_or("unknown"),
                    "failed to convert"
                );
            }
        }
    }

    /// Sweep the heartbeat map for tasks whose `processing` status has
    /// gone stale. The heartbeat is pushed forward after a warning so the
    /// alert repeats at half the threshold instead of every sweep.
    fn spawn_stuck_watchdog(&self, run: CancellationToken) -> JoinHandle<()> {
        let stuck_tasks = self.stuck_tasks.clone();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(STUCK_CHECK_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = run.cancelled() => break,
                    _ = tick.tick() => {
                        let now = Instant::now();
                        let mut stuck = stuck_tasks.lock();
                        for (task_id, heartbeat) in stuck.iter_mut() {
                            if now.duration_since(*heartbeat) > STUCK_TASK_THRESHOLD {
                                warn!(
                                    task = %task_id,
                                    elapsed = ?now.duration_since(*heartbeat),
                                    "task appears to be stuck"
                                );
                                *heartbeat = now
                                    .checked_sub(STUCK_TASK_THRESHOLD / 2)
                                    .unwrap_or(now);
                            }
                        }
                    }
                }
            }
        })
    }

    fn spawn_verbose_progress(&self, run: CancellationToken, gauge: MemoryGauge) -> JoinHandle<()> {
        let stats = self.stats.clone();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(VERBOSE_UPDATE_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The immediate first tick would report an empty run.
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = run.cancelled() => break,
                    _ = tick.tick() => {
                        let snapshot = stats.read().clone();
                        if snapshot.discovered == 0 {
                            continue;
                        }

                        let elapsed = (Utc::now() - snapshot.start_time)
                            .num_milliseconds()
                            .max(0) as f64
                            / 1000.0;
                        let bytes_per_sec = if snapshot.average_speed > 0.0 {
                            snapshot.average_speed
                        } else if elapsed > 0.0 {
                            snapshot.total_file_size as f64 / elapsed
                        } else {
                            0.0
                        };

                        let remaining = snapshot.discovered.saturating_sub(snapshot.processed);
                        let eta_secs = if bytes_per_sec > 0.0 && snapshot.processed > 0 {
                            let avg_file_size =
                                snapshot.total_file_size as f64 / snapshot.discovered as f64;
                            remaining as f64 * avg_file_size / bytes_per_sec
                        } else {
                            0.0
                        };

                        info!(
                            "status: {}/{} processed ({:.1}%) | workers: {} | memory: {:.1}% | speed: {:.2} KB/s | eta: {:.0}s",
                            snapshot.processed,
                            snapshot.discovered,
                            snapshot.processed as f64 / snapshot.discovered as f64 * 100.0,
                            snapshot.current_workers,
                            gauge.usage_pct(),
                            bytes_per_sec / 1024.0,
                            eta_secs,
                        );
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_discovery_filters_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.eml"), "x").unwrap();
        fs::write(dir.path().join("b.EML"), "xy").unwrap();
        fs::write(dir.path().join("c.txt"), "z").unwrap();

        let mut files = discover_eml_files(dir.path(), true).unwrap();
        files.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path.file_name().unwrap(), "a.eml");
        assert_eq!(files[1].path.file_name().unwrap(), "b.EML");
        assert_eq!(files[1].size, 2);
    }

    #[test]
    fn test_discovery_respects_recursion_flag() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("sub");
        fs::create_dir(&nested).unwrap();
        fs::write(dir.path().join("top.eml"), "x").unwrap();
        fs::write(nested.join("deep.eml"), "x").unwrap();

        let flat = discover_eml_files(dir.path(), false).unwrap();
        assert_eq!(flat.len(), 1);

        let deep = discover_eml_files(dir.path(), true).unwrap();
        assert_eq!(deep.len(), 2);
    }

    #[test]
    fn test_discovery_fails_on_missing_directory() {
        let result = discover_eml_files(Path::new("/nonexistent/epistle-test"), true);
        assert!(result.is_err());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let manager = Manager::new(Config::default(), None);
        manager.stop();
        manager.stop();
        assert!(manager.cancel.is_cancelled());
    }
}
