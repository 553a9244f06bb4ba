//! Runtime configuration assembled from the command line.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default clamd daemon address.
pub const DEFAULT_CLAMD_ADDRESS: &str = "localhost:3310";

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Source directory to scan for `.eml` files.
    pub source_dir: PathBuf,
    /// Initial number of workers.
    pub worker_count: usize,
    /// Emit periodic status lines and per-failure messages.
    pub verbose: bool,
    /// Descend into subdirectories.
    pub recursive: bool,
    /// Target memory percentage for the resource governor.
    pub max_memory_pct: u8,
    /// Whether to extract and save attachments.
    pub save_attachments: bool,
    /// Directory for attachments. `None` means a sibling of the PDF with
    /// an `_attachments` suffix.
    pub attachment_dir: Option<PathBuf>,
    /// Whether to scan attachments with clamd.
    pub scan_attachments: bool,
    /// Address of the clamd daemon.
    pub clamd_address: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            source_dir: PathBuf::from("."),
            worker_count: default_worker_count(),
            verbose: false,
            recursive: true,
            max_memory_pct: 75,
            save_attachments: true,
            attachment_dir: None,
            scan_attachments: false,
            clamd_address: DEFAULT_CLAMD_ADDRESS.to_string(),
        }
    }
}

/// Host CPU count, used as the default initial worker count.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
