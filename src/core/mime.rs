use base64::alphabet;
use base64::engine::general_purpose::GeneralPurpose;
use base64::engine::{DecodePaddingMode, GeneralPurposeConfig};
use base64::Engine;

use crate::core::models::{Attachment, Record};
use crate::core::remote::{RawMessage, RawPart};
use crate::core::reply::ReplyRules;

/// Payloads arrive URL-safe encoded, with or without padding.
const PAYLOAD_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Wide enough that html2text never re-wraps paragraphs.
const HTML_TEXT_WIDTH: usize = 1000;

/// Body candidates and attachments pulled out of a part tree.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BodyParts {
    pub text_plain: Option<String>,
    pub text_html: Option<String>,
    pub attachments: Vec<Attachment>,
    pub warnings: Vec<String>,
}

/// Normalize a fetched message into a [`Record`].
///
/// Never fails: missing or malformed fields come back empty (or zero) and
/// undecodable parts are reported in `parse_warnings`.
pub fn parse_message(raw: &RawMessage, rules: &ReplyRules) -> Record {
    let empty = RawPart::default();
    let payload = raw.payload.as_ref().unwrap_or(&empty);

    let mut parts = collect_parts(payload, &raw.id);
    let body_text = render_body(
        parts.text_plain.as_deref(),
        parts.text_html.as_deref(),
        &mut parts.warnings,
    );
    let reply_text = if body_text.is_empty() {
        None
    } else {
        Some(rules.extract_latest_reply(&body_text))
    };

    let date = payload.header("date").unwrap_or_default().to_string();
    let timestamp = raw
        .internal_date
        .as_deref()
        .and_then(|d| d.trim().parse::<i64>().ok())
        .or_else(|| parse_date_header(&date))
        .unwrap_or(0);

    Record {
        id: raw.id.clone(),
        thread_id: raw.thread_id.clone(),
        label_ids: raw.label_ids.iter().cloned().collect(),
        from: payload.header("from").unwrap_or_default().trim().to_string(),
        to: split_addresses(payload.header("to").unwrap_or_default()),
        cc: split_addresses(payload.header("cc").unwrap_or_default()),
        subject: payload.header("subject").unwrap_or_default().to_string(),
        date,
        snippet: raw.snippet.clone(),
        body_text,
        body_html: parts.text_html.unwrap_or_default(),
        reply_text,
        timestamp,
        size_estimate: raw.size_estimate.unwrap_or(0),
        attachments: parts.attachments,
        parse_warnings: parts.warnings,
    }
}

/// Depth-first walk of the part tree, in document order.
///
/// The first decodable `text/plain` leaf and the first `text/html` leaf win.
/// Anything carrying a filename or an attachment disposition is attachment
/// metadata, whatever its MIME type, and is not descended into.
pub fn collect_parts(root: &RawPart, message_id: &str) -> BodyParts {
    let mut out = BodyParts::default();
    let mut stack: Vec<(&RawPart, String)> = vec![(root, String::new())];

    while let Some((part, path)) = stack.pop() {
        if is_attachment(part) {
            out.attachments.push(Attachment {
                attachment_id: part
                    .body
                    .attachment_id
                    .clone()
                    .or_else(|| part.part_id.clone())
                    .unwrap_or_default(),
                message_id: message_id.to_string(),
                filename: part.filename.clone().unwrap_or_default(),
                mime_type: part.mime_type.clone(),
                size: part.body.size,
            });
            continue;
        }

        if !part.parts.is_empty() {
            // Reverse so the first child is popped first.
            for (idx, child) in part.parts.iter().enumerate().rev() {
                let child_path = if path.is_empty() {
                    idx.to_string()
                } else {
                    format!("{path}.{idx}")
                };
                stack.push((child, child_path));
            }
            continue;
        }

        let mime = part.mime_type.to_ascii_lowercase();
        let slot = match mime.as_str() {
            "text/plain" if out.text_plain.is_none() => &mut out.text_plain,
            "text/html" if out.text_html.is_none() => &mut out.text_html,
            _ => continue,
        };
        let Some(data) = part.body.data.as_deref() else {
            continue;
        };
        match decode_payload(data) {
            Ok(text) => *slot = Some(text),
            Err(e) => {
                let label = part.part_id.as_deref().unwrap_or(path.as_str());
                let label = if label.is_empty() { "root" } else { label };
                log::debug!("Undecodable {} part {} in {}: {}", mime, label, message_id, e);
                out.warnings
                    .push(format!("part {label} ({mime}): undecodable payload: {e}"));
            }
        }
    }

    out
}

/// Plain text wins; HTML is converted only when there is no plain part.
pub fn render_body(
    text_plain: Option<&str>,
    text_html: Option<&str>,
    warnings: &mut Vec<String>,
) -> String {
    if let Some(plain) = text_plain {
        return plain.to_string();
    }

    if let Some(html) = text_html {
        return match html_to_text(html) {
            Ok(text) => text,
            Err(e) => {
                warnings.push(format!("html conversion failed: {e}"));
                String::new()
            }
        };
    }

    String::new()
}

/// Convert an HTML body to plain text: tags stripped, block elements on
/// their own lines, entities decoded.
pub fn html_to_text(html: &str) -> Result<String, html2text::Error> {
    html2text::from_read(html.as_bytes(), HTML_TEXT_WIDTH).map(|s| s.trim_end().to_string())
}

pub fn decode_payload(data: &str) -> Result<String, base64::DecodeError> {
    let compact: String = data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = PAYLOAD_ENGINE.decode(compact)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn is_attachment(part: &RawPart) -> bool {
    if part.filename.as_deref().is_some_and(|f| !f.trim().is_empty()) {
        return true;
    }
    part.header("content-disposition")
        .map(|d| d.trim_start().to_ascii_lowercase().starts_with("attachment"))
        .unwrap_or(false)
}

/// Split an address header on commas outside quotes and angle brackets.
pub fn split_addresses(header: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut depth = 0u32;

    for c in header.chars() {
        match c {
            '"' => in_quotes = !in_quotes,
            '<' if !in_quotes => depth += 1,
            '>' if !in_quotes => depth = depth.saturating_sub(1),
            ',' if !in_quotes && depth == 0 => {
                let addr = current.trim();
                if !addr.is_empty() {
                    out.push(addr.to_string());
                }
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }

    let addr = current.trim();
    if !addr.is_empty() {
        out.push(addr.to_string());
    }
    out
}

fn parse_date_header(date: &str) -> Option<i64> {
    // Drop a trailing "(UTC)"-style comment.
    let trimmed = match date.rfind(" (") {
        Some(idx) if date.trim_end().ends_with(')') => &date[..idx],
        _ => date,
    };
    chrono::DateTime::parse_from_rfc2822(trimmed.trim())
        .ok()
        .map(|dt| dt.timestamp_millis())
}
