//! ClamAV daemon (clamd) client used for attachment scanning.
//!
//! Speaks the null-delimited command protocol over TCP: `zPING` and
//! `zVERSION` for the startup handshake, `zINSTREAM` with big-endian
//! length-framed chunks for scanning. clamd serves one command per
//! connection, so every operation dials fresh.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::DEFAULT_CLAMD_ADDRESS;
use crate::error::{Error, Result};

/// Dial timeout for the daemon.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// INSTREAM chunk size.
const CHUNK_SIZE: usize = 64 * 1024;

/// Result of scanning one payload.
#[derive(Debug, Clone, Default)]
pub struct ScanResult {
    /// Whether a scan actually ran (false when scanning is disabled).
    pub scanned: bool,
    pub infected: bool,
    /// Threat names, one per signature match.
    pub threats: Vec<String>,
}

/// Virus scanner backed by a clamd daemon.
///
/// A daemon that cannot be reached at startup yields a disabled scanner
/// with a warning; a reachable daemon that misbehaves during the
/// handshake is a hard error.
#[derive(Debug)]
pub struct Scanner {
    address: String,
    enabled: bool,
    version: Option<String>,
}

impl Scanner {
    pub async fn connect(address: &str) -> Result<Self> {
        let address = if address.is_empty() {
            DEFAULT_CLAMD_ADDRESS.to_string()
        } else {
            address.to_string()
        };

        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&address)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                warn!(%address, error = %err, "clamd unreachable, virus scanning disabled");
                return Ok(Self::disabled(address));
            }
            Err(_) => {
                warn!(%address, "clamd connection timed out, virus scanning disabled");
                return Ok(Self::disabled(address));
            }
        };

        let pong = roundtrip(stream, b"zPING\0").await?;
        if pong != "PONG" {
            return Err(Error::scanner(format!(
                "unexpected PING response from {address}: {pong:?}"
            )));
        }

        let version = command(&address, b"zVERSION\0").await?;
        if version.is_empty() {
            return Err(Error::scanner(format!(
                "empty VERSION response from {address}"
            )));
        }
        debug!(%address, %version, "connected to clamd");

        Ok(Self {
            address,
            enabled: true,
            version: Some(version),
        })
    }

    fn disabled(address: String) -> Self {
        Self {
            address,
            enabled: false,
            version: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Scan a file on disk.
    pub async fn scan_file(&self, path: &Path) -> Result<ScanResult> {
        if !self.enabled {
            return Ok(ScanResult::default());
        }
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| Error::scanner(format!("failed to read {}: {e}", path.display())))?;
        self.scan_bytes(&data).await
    }

    /// Stream a payload to the daemon and parse its verdict.
    pub async fn scan_bytes(&self, data: &[u8]) -> Result<ScanResult> {
        if !self.enabled {
            return Ok(ScanResult::default());
        }

        let mut stream = dial(&self.address).await?;
        stream
            .write_all(b"zINSTREAM\0")
            .await
            .map_err(|e| Error::scanner(format!("INSTREAM write failed: {e}")))?;

        for chunk in data.chunks(CHUNK_SIZE) {
            stream
                .write_all(&(chunk.len() as u32).to_be_bytes())
                .await
                .map_err(|e| Error::scanner(format!("chunk header write failed: {e}")))?;
            stream
                .write_all(chunk)
                .await
                .map_err(|e| Error::scanner(format!("chunk write failed: {e}")))?;
        }
        stream
            .write_all(&0u32.to_be_bytes())
            .await
            .map_err(|e| Error::scanner(format!("stream terminator write failed: {e}")))?;

        let mut reply = Vec::new();
        stream
            .read_to_end(&mut reply)
            .await
            .map_err(|e| Error::scanner(format!("scan reply read failed: {e}")))?;

        parse_scan_reply(&String::from_utf8_lossy(&reply))
    }
}

async fn dial(address: &str) -> Result<TcpStream> {
    tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(address))
        .await
        .map_err(|_| Error::scanner(format!("connection to {address} timed out")))?
        .map_err(|e| Error::scanner(format!("connect to {address} failed: {e}")))
}

async fn command(address: &str, payload: &[u8]) -> Result<String> {
    let stream = dial(address).await?;
    roundtrip(stream, payload).await
}

async fn roundtrip(mut stream: TcpStream, payload: &[u8]) -> Result<String> {
    stream
        .write_all(payload)
        .await
        .map_err(|e| Error::scanner(format!("command write failed: {e}")))?;
    let mut reply = Vec::new();
    stream
        .read_to_end(&mut reply)
        .await
        .map_err(|e| Error::scanner(format!("reply read failed: {e}")))?;
    Ok(String::from_utf8_lossy(&reply)
        .trim_end_matches('\0')
        .trim()
        .to_string())
}

/// Parse an INSTREAM verdict line.
///
/// Clean streams answer `stream: OK`; matches answer
/// `stream: <signature> FOUND`, one line per signature.
fn parse_scan_reply(reply: &str) -> Result<ScanResult> {
    let reply = reply.trim_end_matches('\0').trim();

    let mut result = ScanResult {
        scanned: true,
        infected: false,
        threats: Vec::new(),
    };

    for line in reply.lines() {
        let line = line.trim();
        if line.is_empty() || line.ends_with("OK") {
            continue;
        }
        if let Some(found) = line.strip_suffix(" FOUND") {
            let threat = found.rsplit(": ").next().unwrap_or(found);
            result.infected = true;
            result.threats.push(threat.to_string());
        } else if line.contains("ERROR") {
            return Err(Error::scanner(format!("scan failed: {line}")));
        }
    }

    Ok(result)
}
