//! Text-structured PDF fallback writer.
//!
//! Built on printpdf's builtin Helvetica faces only, so the output is
//! bitmap-free and the writer always succeeds on readable input.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use printpdf::{BuiltinFont, IndirectFontRef, Mm, PdfDocument, PdfDocumentReference, PdfLayerReference};

use crate::error::{Error, Result};
use crate::utils::format_bytes;

use super::{AttachmentResult, EmailContent};

const PAGE_WIDTH_MM: f64 = 210.0;
const PAGE_HEIGHT_MM: f64 = 297.0;
const MARGIN_MM: f64 = 10.0;
const LINE_HEIGHT_MM: f64 = 5.0;
const HEADER_LINE_HEIGHT_MM: f64 = 7.0;

/// Characters per body line before wrapping.
const BODY_WRAP_COLUMNS: usize = 95;

fn mm(value: f64) -> Mm {
    Mm(value as _)
}

#[derive(Clone, Copy)]
enum Face {
    Regular,
    Bold,
}

/// Cursor-based page writer with automatic pagination.
struct PageWriter {
    doc: PdfDocumentReference,
    layer: PdfLayerReference,
    regular: IndirectFontRef,
    bold: IndirectFontRef,
    y: f64,
}

impl PageWriter {
    fn new(title: &str) -> Result<Self> {
        let (doc, page, layer) =
            PdfDocument::new(title, mm(PAGE_WIDTH_MM), mm(PAGE_HEIGHT_MM), "Layer 1");
        let regular = doc
            .add_builtin_font(BuiltinFont::Helvetica)
            .map_err(|e| Error::Pdf(e.to_string()))?;
        let bold = doc
            .add_builtin_font(BuiltinFont::HelveticaBold)
            .map_err(|e| Error::Pdf(e.to_string()))?;
        let layer = doc.get_page(page).get_layer(layer);

        Ok(Self {
            doc,
            layer,
            regular,
            bold,
            y: PAGE_HEIGHT_MM - MARGIN_MM,
        })
    }

    fn font(&self, face: Face) -> &IndirectFontRef {
        match face {
            Face::Regular => &self.regular,
            Face::Bold => &self.bold,
        }
    }

    /// Move the cursor down, breaking to a fresh page at the margin.
    fn advance(&mut self, dy: f64) {
        if self.y - dy < MARGIN_MM {
            let (page, layer) = self
                .doc
                .add_page(mm(PAGE_WIDTH_MM), mm(PAGE_HEIGHT_MM), "Layer 1");
            self.layer = self.doc.get_page(page).get_layer(layer);
            self.y = PAGE_HEIGHT_MM - MARGIN_MM;
        } else {
            self.y -= dy;
        }
    }

    fn line(&mut self, text: &str, size: f64, face: Face) {
        self.advance(LINE_HEIGHT_MM);
        self.layer
            .use_text(text, size as _, mm(MARGIN_MM), mm(self.y), self.font(face));
    }

    /// Bold label with a regular value on the same line.
    fn labeled(&mut self, label: &str, value: &str) {
        self.advance(HEADER_LINE_HEIGHT_MM);
        self.layer
            .use_text(label, 12.0 as _, mm(MARGIN_MM), mm(self.y), &self.bold);
        self.layer.use_text(
            value,
            12.0 as _,
            mm(MARGIN_MM + 30.0),
            mm(self.y),
            &self.regular,
        );
    }

    fn save(self, output: &Path) -> Result<()> {
        let file = File::create(output)?;
        self.doc
            .save(&mut BufWriter::new(file))
            .map_err(|e| Error::Pdf(e.to_string()))?;
        Ok(())
    }
}

/// Write the message as a structured text PDF: header block, body,
/// attachment list with security warnings.
pub(crate) fn write_fallback_pdf(
    email: &EmailContent,
    attachments: &[AttachmentResult],
    output: &Path,
) -> Result<()> {
    let title = if email.subject.is_empty() {
        "Email"
    } else {
        email.subject.as_str()
    };
    let mut writer = PageWriter::new(title)?;

    writer.labeled("From:", &email.from);
    writer.labeled("To:", &email.to);
    if !email.cc.is_empty() {
        writer.labeled("Cc:", &email.cc);
    }
    writer.labeled("Subject:", &email.subject);
    writer.labeled("Date:", &email.date);
    writer.advance(LINE_HEIGHT_MM);

    let body = email
        .text
        .clone()
        .or_else(|| email.html.as_deref().map(strip_html_tags));
    if let Some(body) = body {
        for paragraph in body.lines() {
            if paragraph.is_empty() {
                writer.advance(LINE_HEIGHT_MM / 2.0);
                continue;
            }
            for line in wrap_text(paragraph, BODY_WRAP_COLUMNS) {
                writer.line(&line, 11.0, Face::Regular);
            }
        }
    }

    if !attachments.is_empty() {
        writer.advance(LINE_HEIGHT_MM);
        writer.line(
            &format!("Attachments ({}):", attachments.len()),
            12.0,
            Face::Bold,
        );
        for attachment in attachments {
            writer.line(
                &format!("- {} ({})", attachment.filename, format_bytes(attachment.size)),
                10.0,
                Face::Regular,
            );
            let infected = attachment
                .scan_result
                .as_ref()
                .map(|scan| scan.infected)
                .unwrap_or(false);
            if infected {
                writer.line(
                    "  SECURITY ALERT: malware detected in this attachment",
                    10.0,
                    Face::Bold,
                );
            }
        }
    } else if !email.attachments.is_empty() {
        writer.advance(LINE_HEIGHT_MM);
        writer.line(
            &format!("Attachments ({}):", email.attachments.len()),
            12.0,
            Face::Bold,
        );
        for attachment in &email.attachments {
            writer.line(
                &format!(
                    "- {} ({})",
                    attachment.filename,
                    format_bytes(attachment.data.len() as u64)
                ),
                10.0,
                Face::Regular,
            );
        }
    }

    writer.save(output)
}

/// Reduce an HTML body to plain text: block-level closers become line
/// breaks, entities are decoded, tags are dropped, blank runs collapse.
pub(crate) fn strip_html_tags(html: &str) -> String {
    let mut text = html.to_string();

    for tag in [
        "</p>", "</div>", "</h1>", "</h2>", "</h3>", "</h4>", "</h5>", "</h6>", "</li>", "</tr>",
    ] {
        text = text.replace(tag, &format!("{tag}\n"));
    }
    for br in ["<br>", "<br/>", "<br />"] {
        text = text.replace(br, "\n");
    }
    text = text.replace("<li>", "- ");

    let mut stripped = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => stripped.push(c),
            _ => {}
        }
    }

    for (entity, replacement) in [
        ("&nbsp;", " "),
        ("&lt;", "<"),
        ("&gt;", ">"),
        ("&quot;", "\""),
        ("&apos;", "'"),
        ("&#39;", "'"),
        ("&amp;", "&"),
    ] {
        stripped = stripped.replace(entity, replacement);
    }

    let lines: Vec<&str> = stripped
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    lines.join("\n")
}

/// Greedy word wrap; words longer than the width get a line of their own.
fn wrap_text(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut current = String::new();

    for word in text.split_whitespace() {
        if current.is_empty() {
            current = word.to_string();
        } else if current.len() + 1 + word.len() <= width {
            current.push(' ');
            current.push_str(word);
        } else {
            lines.push(std::mem::take(&mut current));
            current = word.to_string();
        }
    }
    if !current.is_empty() {
        lines.push(current);
    }
    if lines.is_empty() {
        lines.push(String::new());
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_html_tags() {
        let html = "<html><body><p>First &amp; foremost</p><ul><li>one</li><li>two</li></ul></body></html>";
        let text = strip_html_tags(html);
        assert_eq!(text, "First & foremost\n- one\n- two");
    }

    #[test]
    fn test_strip_html_preserves_br_breaks() {
        assert_eq!(strip_html_tags("a<br>b<br />c"), "a\nb\nc");
    }

    #[test]
    fn test_wrap_text() {
        let lines = wrap_text("alpha beta gamma delta", 11);
        assert_eq!(lines, vec!["alpha beta", "gamma delta"]);
    }

    #[test]
    fn test_wrap_text_long_word() {
        let lines = wrap_text("tiny incomprehensibilities", 10);
        assert_eq!(lines, vec!["tiny", "incomprehensibilities"]);
    }

    #[test]
    fn test_fallback_pdf_writes_valid_header() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.pdf");

        let email = EmailContent {
            from: "alice@example.com".to_string(),
            to: "bob@example.com".to_string(),
            subject: "Test".to_string(),
            date: "2025-01-06T10:00:00Z".to_string(),
            text: Some("A body line.\n\nAnother paragraph.".to_string()),
            ..EmailContent::default()
        };

        write_fallback_pdf(&email, &[], &output).unwrap();

        let bytes = std::fs::read(&output).unwrap();
        assert!(bytes.starts_with(b"%PDF"));
    }

    #[test]
    fn test_fallback_pdf_paginates_long_bodies() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("long.pdf");

        let body: String = (0..400)
            .map(|i| format!("line {i}\n"))
            .collect();
        let email = EmailContent {
            subject: "Long".to_string(),
            text: Some(body),
            ..EmailContent::default()
        };

        write_fallback_pdf(&email, &[], &output).unwrap();
        assert!(std::fs::read(&output).unwrap().starts_with(b"%PDF"));
    }
}
