//! Rich HTML rendering through a headless Chromium subprocess.
//!
//! The browser may be entirely absent; that is a soft failure the caller
//! answers with the text PDF fallback.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

use crate::error::{Error, Result};

/// Deadline for one page render.
const RENDER_TIMEOUT: Duration = Duration::from_secs(30);

/// Binary names probed on PATH, most specific first.
const BROWSER_CANDIDATES: &[&str] = &[
    "chromium",
    "chromium-browser",
    "google-chrome-stable",
    "google-chrome",
    "chrome",
];

static BROWSER: OnceLock<Option<PathBuf>> = OnceLock::new();

/// Locate a headless-capable browser once per process.
fn browser_binary() -> Option<&'static Path> {
    BROWSER
        .get_or_init(|| {
            for candidate in BROWSER_CANDIDATES {
                if let Some(path) = find_on_path(candidate) {
                    debug!(browser = %path.display(), "headless browser found");
                    return Some(path);
                }
            }
            debug!("no headless browser on PATH");
            None
        })
        .as_deref()
}

fn find_on_path(name: &str) -> Option<PathBuf> {
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Render an HTML document string to a PDF file via
/// `--headless --print-to-pdf`.
pub async fn render_html_to_pdf(html: &str, output: &Path) -> Result<()> {
    let browser = browser_binary().ok_or_else(|| Error::render("no headless browser available"))?;

    let staging = tempfile::tempdir()?;
    let page = staging.path().join("email.html");
    tokio::fs::write(&page, html).await?;

    let mut child = Command::new(browser)
        .arg("--headless")
        .arg("--disable-gpu")
        .arg("--no-sandbox")
        .arg("--disable-extensions")
        .arg(format!("--print-to-pdf={}", output.display()))
        .arg(format!("file://{}", page.display()))
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::render(format!("failed to spawn {}: {e}", browser.display())))?;

    let status = match tokio::time::timeout(RENDER_TIMEOUT, child.wait()).await {
        Ok(status) => status.map_err(|e| Error::render(format!("waiting for browser: {e}")))?,
        Err(_) => {
            let _ = child.kill().await;
            return Err(Error::render("browser rendering timed out"));
        }
    };

    if !status.success() {
        return Err(Error::render(format!("browser exited with {status}")));
    }

    // The browser exits zero even for some render failures; require real
    // output bytes before declaring success.
    match tokio::fs::metadata(output).await {
        Ok(meta) if meta.len() > 0 => Ok(()),
        _ => Err(Error::render("browser produced no PDF output")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_on_path_locates_common_binary() {
        // `sh` exists on any unix PATH; absence of a made-up name must
        // come back None.
        #[cfg(unix)]
        assert!(find_on_path("sh").is_some());
        assert!(find_on_path("definitely-not-a-real-binary-epistle").is_none());
    }
}
