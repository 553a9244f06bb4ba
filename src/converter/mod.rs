//! EML to PDF conversion: rich rendering through a headless browser with
//! a text-structured PDF fallback that always succeeds on readable input.

mod attachments;
mod html;
mod pdf;

pub use attachments::{sanitize_filename, unique_path, AttachmentResult};

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use mail_parser::{Addr, Address, MessageParser, MimeHeaders};
use tracing::debug;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::security::Scanner;
use crate::utils::format_bytes;

/// Outcome of converting one message.
#[derive(Debug, Clone)]
pub struct ConversionResult {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub attachments: Vec<AttachmentResult>,
    pub security_alerts: Vec<String>,
    pub duration: Duration,
    pub success: bool,
}

/// Distilled view of a parsed message, decoupling the parser from the
/// renderers.
#[derive(Debug, Clone, Default)]
pub(crate) struct EmailContent {
    pub from: String,
    pub to: String,
    pub cc: String,
    pub subject: String,
    pub date: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<RawAttachment>,
}

/// An attachment as carried by the message, before it is saved.
#[derive(Debug, Clone)]
pub(crate) struct RawAttachment {
    pub filename: String,
    pub content_type: String,
    pub data: Vec<u8>,
}

/// Convert a single `.eml` file to a PDF next to it.
///
/// Attachments are saved (and optionally scanned) before rendering. Rich
/// HTML rendering is attempted first; any renderer failure falls back to
/// the text-structured writer.
pub async fn convert_eml_to_pdf(
    input: &Path,
    config: &Config,
    scanner: Option<&Scanner>,
) -> Result<ConversionResult> {
    let started = Instant::now();

    let raw = tokio::fs::read(input).await?;
    let email = parse_email(&raw)?;

    let pdf_path = input.with_extension("pdf");
    let attachment_dir = match &config.attachment_dir {
        Some(dir) if !dir.as_os_str().is_empty() => dir.clone(),
        _ => default_attachment_dir(&pdf_path),
    };

    let mut saved_attachments = Vec::new();
    if config.save_attachments && !email.attachments.is_empty() {
        saved_attachments = attachments::handle_attachments(
            &email.attachments,
            &attachment_dir,
            config.scan_attachments,
            scanner,
        )
        .await?;
    }

    let mut security_alerts = Vec::new();
    for attachment in &saved_attachments {
        if let Some(scan) = &attachment.scan_result {
            if scan.infected {
                for threat in &scan.threats {
                    security_alerts
                        .push(format!("security threat in {}: {threat}", attachment.filename));
                }
            }
        }
    }

    if email.html.is_some() {
        let document = build_complete_html(&email, &saved_attachments);
        match html::render_html_to_pdf(&document, &pdf_path).await {
            Ok(()) => {
                return Ok(ConversionResult {
                    input_path: input.to_path_buf(),
                    output_path: pdf_path,
                    attachments: saved_attachments,
                    security_alerts,
                    duration: started.elapsed(),
                    success: true,
                });
            }
            Err(err) => {
                debug!(
                    path = %input.display(),
                    error = %err,
                    "rich rendering failed, falling back to text PDF"
                );
            }
        }
    }

    let fallback_email = email.clone();
    let fallback_attachments = saved_attachments.clone();
    let fallback_path = pdf_path.clone();
    tokio::task::spawn_blocking(move || {
        pdf::write_fallback_pdf(&fallback_email, &fallback_attachments, &fallback_path)
    })
    .await
    .map_err(|e| Error::Other(format!("fallback PDF task failed: {e}")))??;

    Ok(ConversionResult {
        input_path: input.to_path_buf(),
        output_path: pdf_path,
        attachments: saved_attachments,
        security_alerts,
        duration: started.elapsed(),
        success: true,
    })
}

/// Parse the raw message into the distilled view.
fn parse_email(raw: &[u8]) -> Result<EmailContent> {
    let message = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| Error::parse("malformed or empty message"))?;

    // A message with no parseable headers at all is garbage, not mail.
    let has_headers = message
        .parts
        .first()
        .map(|part| !part.headers.is_empty())
        .unwrap_or(false);
    if !has_headers {
        return Err(Error::parse("no RFC 5322 headers found"));
    }

    // Only report bodies that actually exist in the message; the parser
    // would otherwise synthesize one representation from the other.
    let text = if message.text_body.is_empty() {
        None
    } else {
        message.body_text(0).map(|body| body.into_owned())
    };
    let html = if message.html_body.is_empty() {
        None
    } else {
        message.body_html(0).map(|body| body.into_owned())
    };

    let attachments = message
        .attachments()
        .map(|part| RawAttachment {
            filename: part
                .attachment_name()
                .unwrap_or("attachment")
                .to_string(),
            content_type: part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_string()),
            data: part.contents().to_vec(),
        })
        .collect();

    Ok(EmailContent {
        from: format_address(message.from()),
        to: format_address(message.to()),
        cc: format_address(message.cc()),
        subject: message.subject().unwrap_or_default().to_string(),
        date: message.date().map(|d| d.to_rfc3339()).unwrap_or_default(),
        text,
        html,
        attachments,
    })
}

fn format_address(address: Option<&Address<'_>>) -> String {
    fn format_addr(addr: &Addr<'_>) -> String {
        match (&addr.name, &addr.address) {
            (Some(name), Some(email)) => format!("{name} <{email}>"),
            (None, Some(email)) => email.to_string(),
            (Some(name), None) => name.to_string(),
            (None, None) => String::new(),
        }
    }

    match address {
        Some(Address::List(list)) => list
            .iter()
            .map(format_addr)
            .collect::<Vec<_>>()
            .join(", "),
        Some(Address::Group(groups)) => groups
            .iter()
            .flat_map(|group| group.addresses.iter())
            .map(format_addr)
            .collect::<Vec<_>>()
            .join(", "),
        None => String::new(),
    }
}

/// Default attachment directory: sibling of the PDF with an
/// `_attachments` suffix.
fn default_attachment_dir(pdf_path: &Path) -> PathBuf {
    let stem = pdf_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "message".to_string());
    pdf_path.with_file_name(format!("{stem}_attachments"))
}

/// Build a self-contained HTML document from the message parts, suitable
/// for the headless renderer.
pub(crate) fn build_complete_html(
    email: &EmailContent,
    attachments: &[AttachmentResult],
) -> String {
    let mut doc = String::with_capacity(4096);

    doc.push_str("<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"UTF-8\">\n");
    doc.push_str(&format!("<title>{}</title>\n", escape_html(&email.subject)));
    doc.push_str("<style>\n");
    doc.push_str("body { font-family: Arial, sans-serif; margin: 20px; }\n");
    doc.push_str(".email-header { margin-bottom: 20px; border-bottom: 1px solid #ccc; padding-bottom: 10px; }\n");
    doc.push_str(".header-row { margin: 5px 0; }\n");
    doc.push_str(".header-label { font-weight: bold; width: 60px; display: inline-block; }\n");
    doc.push_str(".email-body { margin-top: 20px; }\n");
    doc.push_str(".attachments { margin-top: 30px; border-top: 1px solid #eee; padding-top: 10px; }\n");
    doc.push_str(".attachment-item { margin: 5px 0; }\n");
    doc.push_str(".security-alert { color: red; font-weight: bold; }\n");
    doc.push_str("</style>\n</head>\n<body>\n");

    doc.push_str("<div class=\"email-header\">\n");
    push_header_row(&mut doc, "From", &email.from);
    push_header_row(&mut doc, "To", &email.to);
    if !email.cc.is_empty() {
        push_header_row(&mut doc, "Cc", &email.cc);
    }
    push_header_row(&mut doc, "Subject", &email.subject);
    push_header_row(&mut doc, "Date", &email.date);
    doc.push_str("</div>\n");

    doc.push_str("<div class=\"email-body\">\n");
    if let Some(html) = &email.html {
        doc.push_str(html);
    } else if let Some(text) = &email.text {
        for line in text.lines() {
            if line.is_empty() {
                doc.push_str("<br>\n");
            } else {
                doc.push_str(&escape_html(line));
                doc.push_str("<br>\n");
            }
        }
    }
    doc.push_str("</div>\n");

    if !attachments.is_empty() {
        doc.push_str("<div class=\"attachments\">\n");
        doc.push_str(&format!("<h3>Attachments ({})</h3>\n<ul>\n", attachments.len()));
        for attachment in attachments {
            doc.push_str("<li class=\"attachment-item\">");
            doc.push_str(&format!(
                "{} ({})",
                escape_html(&attachment.filename),
                format_bytes(attachment.size)
            ));
            let infected = attachment
                .scan_result
                .as_ref()
                .map(|scan| scan.infected)
                .unwrap_or(false);
            if infected {
                doc.push_str(" <span class=\"security-alert\">SECURITY THREAT DETECTED</span>");
            }
            doc.push_str("</li>\n");
        }
        doc.push_str("</ul>\n</div>\n");
    } else if !email.attachments.is_empty() {
        // Attachments exist but were not saved; list them from the
        // message itself.
        doc.push_str("<div class=\"attachments\">\n");
        doc.push_str(&format!(
            "<h3>Attachments ({})</h3>\n<ul>\n",
            email.attachments.len()
        ));
        for attachment in &email.attachments {
            doc.push_str(&format!(
                "<li class=\"attachment-item\">{} ({})</li>\n",
                escape_html(&attachment.filename),
                format_bytes(attachment.data.len() as u64)
            ));
        }
        doc.push_str("</ul>\n</div>\n");
    }

    doc.push_str("</body>\n</html>");
    doc
}

fn push_header_row(doc: &mut String, label: &str, value: &str) {
    doc.push_str(&format!(
        "<div class=\"header-row\"><span class=\"header-label\">{label}</span> {}</div>\n",
        escape_html(value)
    ));
}

/// Minimal HTML escaping for text interpolated into the document.
pub(crate) fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE_EML: &[u8] = b"From: Alice <alice@example.com>\r\n\
To: bob@example.com\r\n\
Subject: Greetings\r\n\
Date: Mon, 06 Jan 2025 10:00:00 +0000\r\n\
\r\n\
Hello there.\r\n";

    #[test]
    fn test_parse_simple_message() {
        let email = parse_email(SIMPLE_EML).unwrap();
        assert_eq!(email.from, "Alice <alice@example.com>");
        assert_eq!(email.to, "bob@example.com");
        assert_eq!(email.subject, "Greetings");
        assert!(email.text.as_deref().unwrap().contains("Hello there."));
        assert!(email.html.is_none());
        assert!(email.attachments.is_empty());
    }

    const ALTERNATIVE_EML: &[u8] = b"From: alice@example.com\r\n\
To: bob@example.com\r\n\
Subject: Rich\r\n\
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
<html><body><p>An <b>HTML</b> body.</p></body></html>\r\n\
--ALT--\r\n";

    #[test]
    fn test_parse_extracts_html_alternative() {
        let email = parse_email(ALTERNATIVE_EML).unwrap();
        assert!(email.html.as_deref().unwrap().contains("<b>HTML</b>"));
        assert!(email.text.as_deref().unwrap().contains("Plain alternative."));
    }

    #[test]
    fn test_parse_rejects_headerless_garbage() {
        let result = parse_email(b"\x00\x01\x02 just some bytes without structure\n");
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html("<b>\"Fish & Chips\"</b>"),
            "&lt;b&gt;&quot;Fish &amp; Chips&quot;&lt;/b&gt;"
        );
    }

    #[test]
    fn test_build_complete_html_escapes_headers() {
        let email = EmailContent {
            from: "a <a@example.com>".to_string(),
            subject: "1 < 2".to_string(),
            text: Some("body".to_string()),
            ..EmailContent::default()
        };
        let doc = build_complete_html(&email, &[]);
        assert!(doc.contains("1 &lt; 2"));
        assert!(doc.contains("a &lt;a@example.com&gt;"));
        assert!(doc.contains("<!DOCTYPE html>"));
    }

    #[test]
    fn test_default_attachment_dir() {
        let dir = default_attachment_dir(Path::new("/mail/foo.pdf"));
        assert_eq!(dir, Path::new("/mail/foo_attachments"));
    }
}
