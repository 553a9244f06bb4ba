//! Task pipeline: manager, worker pool, and the records they exchange.

pub mod manager;
pub mod worker;

pub use manager::{discover_eml_files, Manager};
