//! End-to-end pipeline tests over real temporary directories.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use epistle::config::Config;
use epistle::converter::convert_eml_to_pdf;
use epistle::pipeline::Manager;
use epistle::security::Scanner;

fn test_config(dir: &Path) -> Config {
    Config {
        source_dir: dir.to_path_buf(),
        worker_count: 2,
        verbose: false,
        recursive: true,
        max_memory_pct: 90,
        save_attachments: true,
        attachment_dir: None,
        scan_attachments: false,
        ..Config::default()
    }
}

fn write_plain_eml(dir: &Path, name: &str, subject: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    let content = format!(
        "From: sender@example.com\r\n\
         To: recipient@example.com\r\n\
         Subject: {subject}\r\n\
         Date: Mon, 06 Jan 2025 10:00:00 +0000\r\n\
         \r\n\
         This is the body of {subject}.\r\n\
         It has a second line.\r\n"
    );
    fs::write(&path, content).unwrap();
    path
}

fn write_html_eml(dir: &Path, name: &str) -> std::path::PathBuf {
    let path = dir.join(name);
    let content = "From: sender@example.com\r\n\
         To: recipient@example.com\r\n\
         Subject: Rich message\r\n\
         Date: Mon, 06 Jan 2025 10:00:00 +0000\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: multipart/alternative; boundary=\"ALT\"\r\n\
         \r\n\
         --ALT\r\n\
         Content-Type: text/plain\r\n\
         \r\n\
         Plain alternative.\r\n\
         --ALT\r\n\
         Content-Type: text/html\r\n\
         \r\n\
         <html><body><h1>Rich</h1><p>An <b>HTML</b> body.</p></body></html>\r\n\
         --ALT--\r\n";
    fs::write(&path, content).unwrap();
    path
}

fn write_eml_with_attachments(dir: &Path, name: &str, attachments: &[(&str, &str)]) -> std::path::PathBuf {
    let path = dir.join(name);
    let mut content = String::from(
        "From: sender@example.com\r\n\
         To: recipient@example.com\r\n\
         Subject: With attachments\r\n\
         Date: Mon, 06 Jan 2025 10:00:00 +0000\r\n\
         MIME-Version: 1.0\r\n\
         Content-Type: multipart/mixed; boundary=\"BOUNDARY\"\r\n\
         \r\n\
         --BOUNDARY\r\n\
         Content-Type: text/plain\r\n\
         \r\n\
         See attached.\r\n",
    );
    for (filename, body) in attachments {
        content.push_str(&format!(
            "--BOUNDARY\r\n\
             Content-Type: application/octet-stream; name=\"{filename}\"\r\n\
             Content-Disposition: attachment; filename=\"{filename}\"\r\n\
             \r\n\
             {body}\r\n"
        ));
    }
    content.push_str("--BOUNDARY--\r\n");
    fs::write(&path, content).unwrap();
    path
}

#[tokio::test]
async fn test_converts_directory_of_text_messages() {
    let dir = tempfile::tempdir().unwrap();
    let inputs = [
        write_plain_eml(dir.path(), "one.eml", "First"),
        write_plain_eml(dir.path(), "two.eml", "Second"),
        write_plain_eml(dir.path(), "three.eml", "Third"),
    ];

    let manager = Manager::new(test_config(dir.path()), None);
    manager.start().await.unwrap();

    let stats = manager.stats();
    assert_eq!(stats.discovered, 3);
    assert_eq!(stats.successful, 3);
    assert_eq!(stats.failed, 0);
    assert_eq!(stats.processed, stats.successful + stats.failed);
    assert!(stats.end_time.is_some());

    for input in &inputs {
        let pdf = input.with_extension("pdf");
        assert!(pdf.exists(), "missing {}", pdf.display());
        assert!(fs::read(&pdf).unwrap().starts_with(b"%PDF"));
    }
}

#[tokio::test]
async fn test_html_message_converts_through_rich_path() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_html_eml(dir.path(), "rich.eml");

    let config = test_config(dir.path());
    let result = convert_eml_to_pdf(&input, &config, None).await.unwrap();

    // The HTML body selects the rich-rendering path; with no browser
    // binary discoverable the renderer fails soft and the text fallback
    // must still deliver a valid PDF.
    assert!(result.success);
    assert_eq!(result.output_path, input.with_extension("pdf"));
    let bytes = fs::read(&result.output_path).unwrap();
    assert!(bytes.starts_with(b"%PDF"));
}

#[tokio::test]
async fn test_directory_with_html_messages_converts_fully() {
    let dir = tempfile::tempdir().unwrap();
    write_html_eml(dir.path(), "a.eml");
    write_html_eml(dir.path(), "b.eml");
    write_plain_eml(dir.path(), "c.eml", "Plain");

    let manager = Manager::new(test_config(dir.path()), None);
    manager.start().await.unwrap();

    let stats = manager.stats();
    assert_eq!(stats.discovered, 3);
    assert_eq!(stats.successful, 3);
    assert_eq!(stats.failed, 0);
    for name in ["a.pdf", "b.pdf", "c.pdf"] {
        assert!(fs::read(dir.path().join(name)).unwrap().starts_with(b"%PDF"));
    }
}

#[tokio::test]
async fn test_empty_directory_completes_cleanly() {
    let dir = tempfile::tempdir().unwrap();

    let manager = Manager::new(test_config(dir.path()), None);
    manager.start().await.unwrap();

    let stats = manager.stats();
    assert_eq!(stats.discovered, 0);
    assert_eq!(stats.processed, 0);
    assert_eq!(stats.successful, 0);
    assert_eq!(stats.failed, 0);
}

#[tokio::test]
async fn test_malformed_message_is_recorded_as_failed() {
    let dir = tempfile::tempdir().unwrap();
    write_plain_eml(dir.path(), "good.eml", "Fine");
    fs::write(dir.path().join("broken.eml"), b"\x00\x01\x02 no structure here\n").unwrap();

    let manager = Manager::new(test_config(dir.path()), None);
    manager.start().await.unwrap();

    let stats = manager.stats();
    assert_eq!(stats.discovered, 2);
    assert_eq!(stats.successful, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.processed, stats.successful + stats.failed);
    assert!(!dir.path().join("broken.pdf").exists());
}

#[tokio::test]
async fn test_stop_unblocks_start() {
    let dir = tempfile::tempdir().unwrap();
    for i in 0..40 {
        write_plain_eml(dir.path(), &format!("msg{i:02}.eml"), &format!("Msg {i}"));
    }

    let manager = Arc::new(Manager::new(test_config(dir.path()), None));
    let runner = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.start().await })
    };

    tokio::time::sleep(Duration::from_millis(20)).await;
    manager.stop();
    manager.stop(); // idempotent

    tokio::time::timeout(Duration::from_secs(10), runner)
        .await
        .expect("start must unblock promptly after stop")
        .unwrap()
        .unwrap();

    let stats = manager.stats();
    assert!(stats.processed <= stats.discovered);
    assert_eq!(stats.processed, stats.successful + stats.failed);
}

#[tokio::test]
async fn test_stats_snapshots_are_stable_between_changes() {
    let dir = tempfile::tempdir().unwrap();
    write_plain_eml(dir.path(), "only.eml", "Only");

    let manager = Manager::new(test_config(dir.path()), None);
    manager.start().await.unwrap();

    let first = manager.stats();
    let second = manager.stats();
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[tokio::test]
async fn test_duplicate_attachment_names_get_suffixes() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_eml_with_attachments(
        dir.path(),
        "dup.eml",
        &[("report.pdf", "first body"), ("report.pdf", "second body")],
    );

    let config = test_config(dir.path());
    let result = convert_eml_to_pdf(&input, &config, None).await.unwrap();

    assert!(result.success);
    let attachment_dir = dir.path().join("dup_attachments");
    assert!(attachment_dir.join("report.pdf").exists());
    assert!(attachment_dir.join("report_1.pdf").exists());

    // A second run over the same input keeps avoiding collisions.
    convert_eml_to_pdf(&input, &config, None).await.unwrap();
    assert!(attachment_dir.join("report_2.pdf").exists());
    assert!(attachment_dir.join("report_3.pdf").exists());
}

/// Minimal clamd stand-in answering PING, VERSION, and INSTREAM, flagging
/// payloads that contain `EICAR`.
async fn spawn_mock_clamd() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut command = Vec::new();
                let mut byte = [0u8; 1];
                loop {
                    match socket.read_exact(&mut byte).await {
                        Ok(_) if byte[0] == 0 => break,
                        Ok(_) => command.push(byte[0]),
                        Err(_) => return,
                    }
                }

                match command.as_slice() {
                    b"zPING" => {
                        let _ = socket.write_all(b"PONG\0").await;
                    }
                    b"zVERSION" => {
                        let _ = socket.write_all(b"ClamAV 1.4.3/mock\0").await;
                    }
                    b"zINSTREAM" => {
                        let mut payload = Vec::new();
                        loop {
                            let mut len_buf = [0u8; 4];
                            if socket.read_exact(&mut len_buf).await.is_err() {
                                return;
                            }
                            let len = u32::from_be_bytes(len_buf) as usize;
                            if len == 0 {
                                break;
                            }
                            let mut chunk = vec![0u8; len];
                            if socket.read_exact(&mut chunk).await.is_err() {
                                return;
                            }
                            payload.extend_from_slice(&chunk);
                        }

                        let reply: &[u8] = if payload.windows(5).any(|w| w == b"EICAR") {
                            b"stream: Eicar-Test-Signature FOUND\0"
                        } else {
                            b"stream: OK\0"
                        };
                        let _ = socket.write_all(reply).await;
                    }
                    _ => {}
                }
            });
        }
    });

    addr
}

#[tokio::test]
async fn test_infected_attachment_is_quarantined() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_eml_with_attachments(
        dir.path(),
        "mail.eml",
        &[("eicar.txt", "EICAR test marker"), ("clean.txt", "harmless")],
    );

    let clamd = spawn_mock_clamd().await;
    let scanner = Scanner::connect(&clamd.to_string()).await.unwrap();
    assert!(scanner.is_enabled());

    let mut config = test_config(dir.path());
    config.scan_attachments = true;
    config.clamd_address = clamd.to_string();

    let result = convert_eml_to_pdf(&input, &config, Some(&scanner))
        .await
        .unwrap();

    let attachment_dir = dir.path().join("mail_attachments");
    assert!(attachment_dir.join("eicar.txt.infected").exists());
    assert!(!attachment_dir.join("eicar.txt").exists());
    assert!(attachment_dir.join("clean.txt").exists());

    assert_eq!(result.security_alerts.len(), 1);
    assert!(result.security_alerts[0].contains("Eicar-Test-Signature"));

    let infected = result
        .attachments
        .iter()
        .find(|att| att.filename == "eicar.txt")
        .unwrap();
    assert!(infected.scan_result.as_ref().unwrap().infected);
    assert!(infected
        .saved_path
        .to_string_lossy()
        .ends_with(".infected"));
}
