//! Resource governor: samples process memory and emits scale and
//! pause/resume signals for the worker pool.
//!
//! The governor publishes two out-of-band signals. `worker_control`
//! carries unit deltas consumed by the pool supervisor, one message per
//! worker to add or remove. `pause_control` is a watched boolean; every
//! worker observes every state change independently, so a single send
//! reaches the whole pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use sysinfo::{MemoryRefreshKind, Pid, ProcessesToUpdate, RefreshKind, System};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time between memory samples.
const RESOURCE_CHECK_INTERVAL: Duration = Duration::from_millis(500);

/// Minimum time after a scale-down before the pool may grow again.
/// The asymmetry prevents oscillation.
const SCALE_UP_DELAY: Duration = Duration::from_secs(30);

/// Memory percentage that triggers the critical path regardless of the
/// configured target.
const HARD_MEMORY_WATERMARK: f64 = 75.0;

/// How long the critical path waits for trimmed memory to settle before
/// re-sampling.
const CRITICAL_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Ask the allocator to return freed memory to the operating system.
pub fn trim_memory() {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    unsafe {
        libc::malloc_trim(0);
    }
}

/// Shared read side of the governor's last memory sample.
#[derive(Debug, Clone, Default)]
pub struct MemoryGauge(Arc<RwLock<f64>>);

impl MemoryGauge {
    /// Last sampled process memory usage as a percentage of total system
    /// memory.
    pub fn usage_pct(&self) -> f64 {
        *self.0.read()
    }

    fn store(&self, pct: f64) {
        *self.0.write() = pct;
    }
}

/// Receive side of the governor's signals, handed to the pool supervisor
/// and the workers.
pub struct GovernorHandles {
    /// Unit deltas: +1 adds a worker, -1 removes one.
    pub worker_control: mpsc::Receiver<i32>,
    /// Watched pause state: `true` pauses, `false` resumes.
    pub pause_control: watch::Receiver<bool>,
}

/// One sampling decision.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Adjustment {
    pause: bool,
    desired: usize,
}

/// Pure scaling policy, separated from the sampling loop.
///
/// High pressure sheds a quarter of the pool and pauses; near-target
/// sheds a tenth; clear headroom grows by one worker when no scale-down
/// happened recently.
fn plan_adjustment(
    mem_pct: f64,
    target_pct: f64,
    current: usize,
    min: usize,
    max: usize,
    can_scale_up: bool,
) -> Adjustment {
    if mem_pct > target_pct {
        let desired = ((current as f64 * 0.75) as usize).max(min);
        return Adjustment {
            pause: true,
            desired,
        };
    }

    let desired = if mem_pct > target_pct * 0.9 {
        ((current as f64 * 0.9) as usize).max(min)
    } else if mem_pct < target_pct * 0.6 && can_scale_up {
        (current + 1).min(max)
    } else {
        current
    };

    Adjustment {
        pause: false,
        desired,
    }
}

/// Samples memory on a fixed tick and drives the pool size through unit
/// deltas.
pub struct ResourceGovernor {
    min_workers: usize,
    max_workers: usize,
    target_memory_pct: f64,
    current_workers: usize,
    last_scale_down: Option<Instant>,
    gauge: MemoryGauge,
    worker_tx: mpsc::Sender<i32>,
    pause_tx: watch::Sender<bool>,
    system: System,
    pid: Option<Pid>,
}

impl ResourceGovernor {
    /// Create a governor and the signal handles the pool will consume.
    ///
    /// `initial_workers` seeds the governor's view of the pool so that the
    /// first published deltas are relative to the workers actually
    /// running.
    pub fn new(
        min_workers: usize,
        max_workers: usize,
        target_memory_pct: f64,
        initial_workers: usize,
    ) -> (Self, GovernorHandles) {
        let (worker_tx, worker_rx) = mpsc::channel(max_workers.max(1) * 2);
        let (pause_tx, pause_rx) = watch::channel(false);

        let governor = Self {
            min_workers,
            max_workers,
            target_memory_pct,
            current_workers: initial_workers.clamp(min_workers, max_workers),
            last_scale_down: None,
            gauge: MemoryGauge::default(),
            worker_tx,
            pause_tx,
            system: System::new_with_specifics(
                RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
            ),
            pid: sysinfo::get_current_pid().ok(),
        };

        (
            governor,
            GovernorHandles {
                worker_control: worker_rx,
                pause_control: pause_rx,
            },
        )
    }

    /// Shared read handle for the last memory sample.
    pub fn gauge(&self) -> MemoryGauge {
        self.gauge.clone()
    }

    /// Start the sampling loop. Runs until `cancel` fires.
    pub fn spawn(mut self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(RESOURCE_CHECK_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Consume the immediate tick so the first sample happens one
            // full interval after startup.
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("resource governor shutting down");
                        break;
                    }
                    _ = tick.tick() => {
                        self.adjust().await;
                        self.check_critical().await;
                    }
                }
            }
        })
    }

    async fn adjust(&mut self) {
        let mem = self.sample_memory();
        let can_scale_up = self
            .last_scale_down
            .map_or(true, |t| t.elapsed() >= SCALE_UP_DELAY);

        let plan = plan_adjustment(
            mem,
            self.target_memory_pct,
            self.current_workers,
            self.min_workers,
            self.max_workers,
            can_scale_up,
        );

        if plan.pause {
            trim_memory();
        }
        self.set_paused(plan.pause, mem);
        self.apply_worker_count(plan.desired).await;
    }

    /// Hard watermark guard: collapse the pool and pause if memory stays
    /// critical after a trim.
    async fn check_critical(&mut self) {
        let mem = self.sample_memory();
        if mem <= HARD_MEMORY_WATERMARK {
            return;
        }

        trim_memory();
        if self.current_workers > self.min_workers {
            warn!(
                memory_pct = format_args!("{:.1}", mem),
                "memory above hard watermark, collapsing worker pool"
            );
            self.apply_worker_count(self.min_workers).await;
        }

        tokio::time::sleep(CRITICAL_SETTLE_DELAY).await;

        let mem = self.sample_memory();
        if mem > HARD_MEMORY_WATERMARK {
            warn!(
                memory_pct = format_args!("{:.1}", mem),
                "memory still critical after trim, pausing all processing"
            );
            if !*self.pause_tx.borrow() {
                let _ = self.pause_tx.send(true);
            }
        }
    }

    /// Sample the process resident set as a percentage of total system
    /// memory and publish it through the gauge.
    fn sample_memory(&mut self) -> f64 {
        let Some(pid) = self.pid else {
            return 0.0;
        };

        self.system.refresh_memory();
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        let total = self.system.total_memory();
        let rss = self.system.process(pid).map(|p| p.memory()).unwrap_or(0);
        let pct = if total > 0 {
            rss as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        self.gauge.store(pct);
        pct
    }

    fn set_paused(&self, paused: bool, mem: f64) {
        if *self.pause_tx.borrow() == paused {
            return;
        }
        let _ = self.pause_tx.send(paused);
        if paused {
            warn!(
                memory_pct = format_args!("{:.1}", mem),
                "memory usage high, pausing processing"
            );
        } else {
            info!(
                memory_pct = format_args!("{:.1}", mem),
                "resuming processing"
            );
        }
    }

    /// Publish unit deltas until the supervisor's view matches `desired`.
    async fn apply_worker_count(&mut self, desired: usize) {
        if desired == self.current_workers {
            return;
        }

        let delta = desired as i64 - self.current_workers as i64;
        let step: i32 = if delta > 0 { 1 } else { -1 };
        for _ in 0..delta.unsigned_abs() {
            if self.worker_tx.send(step).await.is_err() {
                // Supervisor is gone; the pipeline is shutting down.
                return;
            }
        }

        if delta < 0 {
            self.last_scale_down = Some(Instant::now());
            info!(
                from = self.current_workers,
                to = desired,
                "scaling down workers"
            );
        } else {
            info!(
                from = self.current_workers,
                to = desired,
                "scaling up workers"
            );
        }
        self.current_workers = desired;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_high_pressure_sheds_quarter_and_pauses() {
        let plan = plan_adjustment(80.0, 75.0, 8, 1, 16, true);
        assert!(plan.pause);
        assert_eq!(plan.desired, 6);
    }

    #[test]
    fn test_high_pressure_respects_minimum() {
        let plan = plan_adjustment(99.0, 75.0, 1, 1, 16, true);
        assert!(plan.pause);
        assert_eq!(plan.desired, 1);
    }

    #[test]
    fn test_near_target_sheds_tenth() {
        // 70 is within (0.9 * 75, 75].
        let plan = plan_adjustment(70.0, 75.0, 10, 1, 16, true);
        assert!(!plan.pause);
        assert_eq!(plan.desired, 9);
    }

    #[test]
    fn test_headroom_grows_by_one() {
        let plan = plan_adjustment(10.0, 75.0, 4, 1, 8, true);
        assert!(!plan.pause);
        assert_eq!(plan.desired, 5);
    }

    #[test]
    fn test_headroom_capped_at_max() {
        let plan = plan_adjustment(10.0, 75.0, 8, 1, 8, true);
        assert_eq!(plan.desired, 8);
    }

    #[test]
    fn test_scale_up_gated_by_recent_scale_down() {
        let plan = plan_adjustment(10.0, 75.0, 4, 1, 8, false);
        assert!(!plan.pause);
        assert_eq!(plan.desired, 4);
    }

    #[test]
    fn test_middle_band_holds() {
        // Between 0.6 and 0.9 of target: no change either way.
        let plan = plan_adjustment(50.0, 75.0, 4, 1, 8, true);
        assert!(!plan.pause);
        assert_eq!(plan.desired, 4);
    }

    #[tokio::test]
    async fn test_governor_publishes_initial_state() {
        let (governor, handles) = ResourceGovernor::new(1, 8, 75.0, 4);
        assert_eq!(governor.current_workers, 4);
        assert!(!*handles.pause_control.borrow());
    }

    #[tokio::test]
    async fn test_apply_worker_count_publishes_unit_deltas() {
        let (mut governor, mut handles) = ResourceGovernor::new(1, 8, 75.0, 4);

        governor.apply_worker_count(6).await;
        assert_eq!(handles.worker_control.recv().await, Some(1));
        assert_eq!(handles.worker_control.recv().await, Some(1));
        assert!(governor.last_scale_down.is_none());

        governor.apply_worker_count(5).await;
        assert_eq!(handles.worker_control.recv().await, Some(-1));
        assert!(governor.last_scale_down.is_some());
    }
}
