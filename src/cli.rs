//! Command-line interface definitions.

use std::path::PathBuf;

use clap::Parser;

use epistle::config::{default_worker_count, Config, DEFAULT_CLAMD_ADDRESS};

#[derive(Debug, Parser)]
#[command(
    name = "epistle",
    version,
    about = "Convert directories of EML files to PDF with adaptive parallelism"
)]
pub struct Args {
    /// Source directory to scan for EML files
    #[arg(long, default_value = ".")]
    pub src: PathBuf,

    /// Initial number of worker threads
    #[arg(long, default_value_t = default_worker_count())]
    pub workers: usize,

    /// Recursively scan directories
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub recursive: bool,

    /// Enable verbose output
    #[arg(long)]
    pub verbose: bool,

    /// Emit periodic diagnostic reports
    #[arg(long)]
    pub diagnose: bool,

    /// Maximum memory usage percentage target
    #[arg(long = "max-mem", default_value_t = 75)]
    pub max_mem: u8,

    /// Convert only the first EML file found, then exit
    #[arg(long)]
    pub test: bool,

    /// Save email attachments
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub attachments: bool,

    /// Directory for saving attachments (default: alongside the PDFs)
    #[arg(long = "attachment-dir")]
    pub attachment_dir: Option<PathBuf>,

    /// Scan attachments for viruses using ClamAV
    #[arg(long)]
    pub scan: bool,

    /// ClamAV daemon address
    #[arg(long = "clamd", default_value = DEFAULT_CLAMD_ADDRESS)]
    pub clamd_address: String,
}

impl Args {
    pub fn to_config(&self) -> Config {
        Config {
            source_dir: self.src.clone(),
            worker_count: self.workers.max(1),
            verbose: self.verbose,
            recursive: self.recursive,
            max_memory_pct: self.max_mem,
            save_attachments: self.attachments,
            attachment_dir: self.attachment_dir.clone(),
            scan_attachments: self.scan,
            clamd_address: self.clamd_address.clone(),
        }
    }
}
