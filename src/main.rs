//! epistle binary: CLI front-end wiring the pipeline together.

mod cli;

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use epistle::config::Config;
use epistle::converter;
use epistle::diagnostics::{DiagnosticMonitor, DEFAULT_DIAGNOSTIC_INTERVAL};
use epistle::pipeline::{discover_eml_files, Manager};
use epistle::security::Scanner;
use epistle::utils::format_bytes;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let started = Instant::now();
    let args = cli::Args::parse();
    init_logging(args.verbose);

    let mut config = args.to_config();

    info!("epistle EML to PDF converter");

    // A misbehaving daemon is fatal when scanning was requested; an
    // unreachable one just disables scanning with a warning.
    let scanner = if config.scan_attachments {
        let scanner = Scanner::connect(&config.clamd_address).await?;
        if scanner.is_enabled() {
            info!(
                version = scanner.version().unwrap_or("unknown"),
                "virus scanning enabled"
            );
            Some(Arc::new(scanner))
        } else {
            config.scan_attachments = false;
            None
        }
    } else {
        None
    };

    if args.test {
        info!("running in test mode, converting only the first EML file found");
        return run_test_mode(&config, scanner.as_deref()).await;
    }

    info!(dir = %config.source_dir.display(), "scanning directory");
    info!(
        workers = config.worker_count,
        "initial worker count (auto-scaling enabled)"
    );
    info!(target_pct = config.max_memory_pct, "memory limit");
    info!(
        save = config.save_attachments,
        scan = config.scan_attachments,
        "attachment handling"
    );

    let diag_cancel = CancellationToken::new();
    let mut diag_task = None;
    if args.diagnose {
        let mut monitor = DiagnosticMonitor::new();
        monitor.log_full_report();
        diag_task = Some(monitor.spawn(DEFAULT_DIAGNOSTIC_INTERVAL, diag_cancel.clone()));
    }

    let manager = Arc::new(Manager::new(config, scanner));

    {
        let manager = manager.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("received shutdown signal, stopping gracefully");
            manager.stop();
        });
    }

    manager.start().await?;

    let stats = manager.stats();
    let elapsed = started.elapsed();
    let elapsed_secs = elapsed.as_secs_f64();
    let files_per_sec = if elapsed_secs > 0.0 {
        stats.processed as f64 / elapsed_secs
    } else {
        0.0
    };
    let mb_per_sec = if elapsed_secs > 0.0 {
        stats.total_file_size as f64 / elapsed_secs / (1024.0 * 1024.0)
    } else {
        0.0
    };

    println!();
    println!("Processing completed in {elapsed:.2?}");
    println!(
        "Total files processed: {} ({files_per_sec:.2} files/sec)",
        stats.processed
    );
    println!(
        "Data processed: {} ({mb_per_sec:.2} MB/sec)",
        format_bytes(stats.total_file_size)
    );
    println!("Successful: {}", stats.successful);
    println!("Failed: {}", stats.failed);
    println!(
        "Worker scaling: min={} max={}",
        stats.min_workers, stats.max_workers
    );

    if let Some(task) = diag_task {
        diag_cancel.cancel();
        let _ = task.await;
        DiagnosticMonitor::new().log_full_report();
    }

    Ok(())
}

/// Find the first EML file and convert it, skipping the pool entirely.
async fn run_test_mode(config: &Config, scanner: Option<&Scanner>) -> anyhow::Result<()> {
    let files = discover_eml_files(&config.source_dir, config.recursive)?;
    let Some(first) = files.first() else {
        anyhow::bail!("no EML files found in {}", config.source_dir.display());
    };

    println!("Found EML file: {}", first.path.display());
    println!("Converting to PDF...");

    let started = Instant::now();
    let result = converter::convert_eml_to_pdf(&first.path, config, scanner).await?;

    println!("Conversion successful in {:.2?}", started.elapsed());
    println!("PDF saved to: {}", result.output_path.display());
    let meta = tokio::fs::metadata(&result.output_path).await?;
    println!("PDF file size: {}", format_bytes(meta.len()));

    if !result.attachments.is_empty() {
        if let Some(dir) = result
            .attachments
            .first()
            .and_then(|att| att.saved_path.parent())
        {
            println!("\nAttachments saved to: {}", dir.display());
        }
        println!("Attachments found: {}", result.attachments.len());
        for (i, attachment) in result.attachments.iter().enumerate() {
            let infected = attachment
                .scan_result
                .as_ref()
                .map(|scan| scan.infected)
                .unwrap_or(false);
            if infected {
                println!(
                    "  {}. {} ({}) - SECURITY ALERT: malware detected!",
                    i + 1,
                    attachment.filename,
                    format_bytes(attachment.size)
                );
            } else {
                println!(
                    "  {}. {} ({})",
                    i + 1,
                    attachment.filename,
                    format_bytes(attachment.size)
                );
            }
        }
    }

    if !result.security_alerts.is_empty() {
        println!("\nSecurity alerts: {}", result.security_alerts.len());
        for alert in &result.security_alerts {
            println!("  - {alert}");
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("epistle=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("epistle=info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    use tracing::warn;

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(err) => {
            warn!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
