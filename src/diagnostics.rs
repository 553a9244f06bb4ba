//! Periodic process diagnostics. Observation only; never blocks the
//! pipeline.

use std::time::{Duration, Instant};

use sysinfo::{MemoryRefreshKind, Pid, ProcessesToUpdate, RefreshKind, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::utils::format_bytes;

/// Default time between snapshot lines.
pub const DEFAULT_DIAGNOSTIC_INTERVAL: Duration = Duration::from_secs(30);

/// A point-in-time view of the process.
#[derive(Debug, Clone)]
pub struct ProcessSnapshot {
    pub pid: Option<u32>,
    /// OS thread count; only available on Linux.
    pub threads: Option<usize>,
    /// Resident set size in bytes.
    pub resident_memory: u64,
    /// Committed virtual memory in bytes.
    pub virtual_memory: u64,
    /// Process CPU usage percentage; meaningful from the second sample.
    pub cpu_usage: f32,
    pub uptime: Duration,
}

/// Collects process snapshots and renders diagnostic reports.
pub struct DiagnosticMonitor {
    started: Instant,
    system: System,
    pid: Option<Pid>,
}

impl DiagnosticMonitor {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            system: System::new_with_specifics(
                RefreshKind::nothing().with_memory(MemoryRefreshKind::everything()),
            ),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// Refresh and capture the current process state.
    pub fn snapshot(&mut self) -> ProcessSnapshot {
        let mut snapshot = ProcessSnapshot {
            pid: self.pid.map(|p| p.as_u32()),
            threads: None,
            resident_memory: 0,
            virtual_memory: 0,
            cpu_usage: 0.0,
            uptime: self.started.elapsed(),
        };

        let Some(pid) = self.pid else {
            return snapshot;
        };

        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

        if let Some(process) = self.system.process(pid) {
            snapshot.resident_memory = process.memory();
            snapshot.virtual_memory = process.virtual_memory();
            snapshot.cpu_usage = process.cpu_usage();
            #[cfg(target_os = "linux")]
            {
                snapshot.threads = process.tasks().map(|tasks| tasks.len());
            }
        }

        snapshot
    }

    /// Emit a one-shot full report.
    pub fn log_full_report(&mut self) {
        let snapshot = self.snapshot();
        info!("===== diagnostic report =====");
        info!("pid: {}", snapshot.pid.map_or_else(|| "?".to_string(), |p| p.to_string()));
        if let Some(threads) = snapshot.threads {
            info!("threads: {threads}");
        }
        info!("uptime: {:.0?}", snapshot.uptime);
        info!("resident memory: {}", format_bytes(snapshot.resident_memory));
        info!("virtual memory: {}", format_bytes(snapshot.virtual_memory));
        info!("cpu usage: {:.1}%", snapshot.cpu_usage);
        info!("=============================");
    }

    /// Start the periodic snapshot loop. Runs until `cancel` fires.
    pub fn spawn(mut self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // Skip the immediate tick; the startup report covers it.
            tick.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!("diagnostic monitor shutting down");
                        break;
                    }
                    _ = tick.tick() => {
                        let snapshot = self.snapshot();
                        info!(
                            threads = ?snapshot.threads,
                            rss = %format_bytes(snapshot.resident_memory),
                            virt = %format_bytes(snapshot.virtual_memory),
                            cpu = format_args!("{:.1}%", snapshot.cpu_usage),
                            uptime = ?snapshot.uptime,
                            "diagnostic snapshot"
                        );
                    }
                }
            }
        })
    }
}

impl Default for DiagnosticMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reports_current_process() {
        let mut monitor = DiagnosticMonitor::new();
        let snapshot = monitor.snapshot();
        assert!(snapshot.pid.is_some());
        assert!(snapshot.resident_memory > 0);
    }

    #[tokio::test]
    async fn test_monitor_stops_on_cancel() {
        let monitor = DiagnosticMonitor::new();
        let cancel = CancellationToken::new();
        let handle = monitor.spawn(Duration::from_millis(50), cancel.clone());

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor should stop promptly")
            .unwrap();
    }
}
