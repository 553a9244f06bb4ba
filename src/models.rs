//! Task and statistics records exchanged between the manager and workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Weight of a fresh sample in the average speed calculation.
const SPEED_SMOOTHING: f64 = 0.3;

/// Status of a conversion task.
///
/// Status only advances forward along pending -> processing ->
/// (complete | failed); a retry re-enters processing from processing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl TaskStatus {
    /// Whether this status ends the task's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Complete | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Processing => write!(f, "processing"),
            TaskStatus::Complete => write!(f, "complete"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A single `.eml` file scheduled for conversion.
#[derive(Debug, Clone)]
pub struct Task {
    /// Stable identifier: the base filename of the input.
    pub id: String,
    /// Absolute path to the input file.
    pub path: PathBuf,
    /// Byte length of the input at discovery time.
    pub size: u64,
    /// Current status.
    pub status: TaskStatus,
    /// Number of retries performed.
    pub retries: u32,
    /// When the task was created.
    pub started_at: DateTime<Utc>,
    /// When the task reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last error, populated on terminal failure.
    pub error: Option<String>,
}

impl Task {
    pub fn new(path: impl Into<PathBuf>, size: u64) -> Self {
        let path = path.into();
        let id = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        Self {
            id,
            path,
            size,
            status: TaskStatus::Pending,
            retries: 0,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }
}

/// Statistics for a single processing attempt chain.
#[derive(Debug, Clone)]
pub struct ProcessingStats {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration: Duration,
    pub file_size: u64,
    pub worker_id: usize,
    pub retries: u32,
}

impl ProcessingStats {
    pub fn begin(worker_id: usize, file_size: u64) -> Self {
        Self {
            started_at: Utc::now(),
            ended_at: None,
            duration: Duration::ZERO,
            file_size,
            worker_id,
            retries: 0,
        }
    }
}

/// A message from a worker to the manager about task progress.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub worker_id: usize,
    pub task_id: String,
    pub status: TaskStatus,
    /// Progress in [0.0, 1.0].
    pub progress: f64,
    pub message: String,
    pub error: Option<String>,
    pub stats: ProcessingStats,
}

/// Aggregate counters held by the manager.
///
/// `processed == successful + failed` holds at the end of every run, and
/// `min_workers <= current_workers <= max_workers` at every observable
/// moment.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub discovered: usize,
    pub processing: usize,
    pub processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub total_file_size: u64,
    /// Exponentially weighted bytes per second.
    pub average_speed: f64,
    pub current_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Stats {
    pub fn new(initial_workers: usize) -> Self {
        Self {
            discovered: 0,
            processing: 0,
            processed: 0,
            successful: 0,
            failed: 0,
            total_file_size: 0,
            average_speed: 0.0,
            current_workers: initial_workers,
            min_workers: 1,
            max_workers: initial_workers * 2,
            start_time: Utc::now(),
            end_time: None,
        }
    }

    /// Fold a fresh bytes-per-second sample into the smoothed average.
    pub fn record_speed(&mut self, fresh: f64) {
        if self.average_speed == 0.0 {
            self.average_speed = fresh;
        } else {
            self.average_speed =
                self.average_speed * (1.0 - SPEED_SMOOTHING) + fresh * SPEED_SMOOTHING;
        }
    }
}

/// A discovered input file.
#[derive(Debug, Clone)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    pub size: u64,
}

impl DiscoveredFile {
    pub fn new(path: impl AsRef<Path>, size: u64) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_id_is_base_filename() {
        let task = Task::new("/a/b/foo.eml", 42);
        assert_eq!(task.id, "foo.eml");
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retries, 0);
    }

    #[test]
    fn test_status_terminality() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
        assert!(TaskStatus::Complete.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_display() {
        assert_eq!(TaskStatus::Processing.to_string(), "processing");
        assert_eq!(TaskStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_speed_smoothing() {
        let mut stats = Stats::new(4);
        stats.record_speed(1000.0);
        assert_eq!(stats.average_speed, 1000.0);

        stats.record_speed(2000.0);
        assert!((stats.average_speed - 1300.0).abs() < 0.001);
    }

    #[test]
    fn test_stats_worker_bounds() {
        let stats = Stats::new(4);
        assert_eq!(stats.current_workers, 4);
        assert_eq!(stats.min_workers, 1);
        assert_eq!(stats.max_workers, 8);
        assert!(stats.min_workers <= stats.current_workers);
        assert!(stats.current_workers <= stats.max_workers);
    }
}
