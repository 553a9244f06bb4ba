//! Attachment extraction, filename sanitization, and scanning.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::security::{ScanResult, Scanner};

use super::RawAttachment;

/// Characters replaced with `_` in attachment filenames.
pub const INVALID_FILENAME_CHARS: &[char] = &['/', '\\', ':', '*', '?', '"', '<', '>', '|'];

/// A saved (and possibly scanned) attachment.
#[derive(Debug, Clone)]
pub struct AttachmentResult {
    pub filename: String,
    pub size: u64,
    pub content_type: String,
    pub saved_path: PathBuf,
    pub scan_result: Option<ScanResult>,
}

/// Save the message's attachments into `output_dir`, scanning each one
/// when enabled.
///
/// Save failures are warnings and skip the attachment; scan failures
/// abort and fail the containing task. Infected files are renamed with an
/// `.infected` suffix.
pub(crate) async fn handle_attachments(
    parts: &[RawAttachment],
    output_dir: &Path,
    scan: bool,
    scanner: Option<&Scanner>,
) -> Result<Vec<AttachmentResult>> {
    let mut results = Vec::new();
    if parts.is_empty() {
        return Ok(results);
    }

    if let Err(err) = tokio::fs::create_dir_all(output_dir).await {
        warn!(
            dir = %output_dir.display(),
            error = %err,
            "failed to create attachment directory"
        );
        return Ok(results);
    }

    for part in parts {
        let filename = sanitize_filename(&part.filename);
        let saved_path = unique_path(&output_dir.join(&filename));

        if let Err(err) = tokio::fs::write(&saved_path, &part.data).await {
            warn!(
                file = %saved_path.display(),
                error = %err,
                "failed to save attachment"
            );
            continue;
        }
        debug!(file = %saved_path.display(), size = part.data.len(), "attachment saved");

        let mut result = AttachmentResult {
            filename: filename.clone(),
            size: part.data.len() as u64,
            content_type: part.content_type.clone(),
            saved_path: saved_path.clone(),
            scan_result: None,
        };

        if scan {
            if let Some(scanner) = scanner.filter(|s| s.is_enabled()) {
                let scan_result = scanner.scan_file(&saved_path).await?;
                if scan_result.infected {
                    let quarantined = infected_path(&saved_path);
                    tokio::fs::rename(&saved_path, &quarantined)
                        .await
                        .map_err(|e| {
                            Error::scanner(format!("failed to quarantine {filename}: {e}"))
                        })?;
                    warn!(
                        file = %quarantined.display(),
                        threats = ?scan_result.threats,
                        "infected attachment quarantined"
                    );
                    result.saved_path = quarantined;
                }
                result.scan_result = Some(scan_result);
            }
        }

        results.push(result);
    }

    Ok(results)
}

/// Replace filesystem-hostile characters with underscores.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if INVALID_FILENAME_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// Resolve a collision-free path by appending `_N` before the extension,
/// N starting at 1.
pub fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let extension = path
        .extension()
        .map(|ext| ext.to_string_lossy().into_owned());
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "attachment".to_string());

    let mut counter: u32 = 1;
    loop {
        let name = match &extension {
            Some(ext) => format!("{stem}_{counter}.{ext}"),
            None => format!("{stem}_{counter}"),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Append the quarantine suffix without touching the rest of the path.
fn infected_path(path: &Path) -> PathBuf {
    let mut os = path.to_path_buf().into_os_string();
    os.push(".infected");
    PathBuf::from(os)
}
