//! epistle library crate.
//!
//! Converts a directory tree of RFC 5322 `.eml` files into per-message PDF
//! artifacts, optionally extracting and virus-scanning their attachments.
//! The interesting part is not the per-file conversion but the control
//! plane around it: a bounded task pipeline whose parallelism is modulated
//! in real time by memory pressure, with self-healing workers, heartbeat
//! based hang detection, and continuous progress reporting.
//!
//! Module map:
//! - pipeline: manager, worker pool, and the records they exchange
//! - resource: memory sampling governor emitting scale and pause signals
//! - converter: EML parsing, rich HTML rendering, text PDF fallback
//! - security: clamd client for attachment scanning
//! - diagnostics: periodic process snapshots

pub mod config;
pub mod converter;
pub mod diagnostics;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod resource;
pub mod security;
pub mod utils;

pub use error::{Error, Result};
