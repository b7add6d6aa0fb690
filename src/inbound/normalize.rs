/// Inbound email payload normalization
///
/// Providers have delivered two payload shapes over time:
/// - v1 flat: `{ messageId, fromAddress, toAddress[], ccAddress[], subject, date, ... }`
/// - v2 nested: `{ event: "email_received", data: { message_id, from, to[], ... } }`
///
/// Both map onto one canonical `InboundEmail`. Everything here is pure so shape
/// detection and mapping can be tested without a store.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    FlatV1,
    NestedV2,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum NormalizeError {
    #[error("unrecognized inbound email payload shape")]
    UnrecognizedShape,
    #[error("inbound email payload missing '{0}'")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub filename: String,
    pub content_type: String,
    pub size: u64,
}

/// Canonical inbound email record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEmail {
    pub message_id: String,
    pub subject: String,
    pub from_address: String,
    pub to_address: Vec<String>,
    pub cc_address: Vec<String>,
    /// RFC 3339, UTC, millisecond precision (or the raw value if unparseable)
    pub date: String,
    pub has_attachment: bool,
    pub attachments: Vec<Attachment>,
    pub body_text: String,
    pub body_html: String,
    pub account_id: String,
}

impl InboundEmail {
    /// Every distinct recipient, To before Cc
    pub fn recipients(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for address in self.to_address.iter().chain(self.cc_address.iter()) {
            if !address.is_empty() && !seen.contains(address) {
                seen.push(address.clone());
            }
        }
        seen
    }

    /// Largest attachment in bytes
    pub fn largest_attachment(&self) -> u64 {
        self.attachments.iter().map(|a| a.size).max().unwrap_or(0)
    }
}

pub fn detect_shape(payload: &Value) -> Option<PayloadShape> {
    if payload.get("event").and_then(|e| e.as_str()) == Some("email_received")
        && payload.get("data").map(Value::is_object).unwrap_or(false)
    {
        return Some(PayloadShape::NestedV2);
    }
    if payload.get("fromAddress").is_some() && payload.get("toAddress").is_some() {
        return Some(PayloadShape::FlatV1);
    }
    None
}

pub fn normalize(payload: &Value) -> Result<InboundEmail, NormalizeError> {
    match detect_shape(payload).ok_or(NormalizeError::UnrecognizedShape)? {
        PayloadShape::FlatV1 => normalize_v1(payload),
        PayloadShape::NestedV2 => normalize_v2(&payload["data"]),
    }
}

fn normalize_v1(p: &Value) -> Result<InboundEmail, NormalizeError> {
    let from_address = address_of(&p["fromAddress"]).ok_or(NormalizeError::MissingField("fromAddress"))?;
    let attachments = attachments_of(&p["attachments"]);
    let flagged = match &p["hasAttachment"] {
        Value::Bool(b) => *b,
        Value::String(s) => s.eq_ignore_ascii_case("true") || s == "1",
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    };

    Ok(InboundEmail {
        message_id: text_of(&p["messageId"]),
        subject: text_of(&p["subject"]),
        from_address,
        to_address: address_list(&p["toAddress"]),
        cc_address: address_list(&p["ccAddress"]),
        date: normalize_date(&p["date"]),
        has_attachment: flagged || !attachments.is_empty(),
        attachments,
        body_text: first_text(p, &["bodyText", "content", "text"]),
        body_html: first_text(p, &["bodyHtml", "html"]),
        account_id: text_of(&p["accountId"]),
    })
}

fn normalize_v2(d: &Value) -> Result<InboundEmail, NormalizeError> {
    let from_address = address_of(&d["from"]).ok_or(NormalizeError::MissingField("data.from"))?;
    let attachments = attachments_of(&d["attachments"]);
    let flagged = d["has_attachments"].as_bool().unwrap_or(false);

    Ok(InboundEmail {
        message_id: text_of(&d["message_id"]),
        subject: text_of(&d["subject"]),
        from_address,
        to_address: address_list(&d["to"]),
        cc_address: address_list(&d["cc"]),
        date: normalize_date(&d["date"]),
        has_attachment: flagged || !attachments.is_empty(),
        attachments,
        body_text: first_text(d, &["text", "body_text"]),
        body_html: first_text(d, &["html", "body_html"]),
        account_id: text_of(&d["account_id"]),
    })
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

fn first_text(obj: &Value, keys: &[&str]) -> String {
    keys.iter()
        .map(|k| text_of(&obj[*k]))
        .find(|s| !s.is_empty())
        .unwrap_or_default()
}

/// `"Jane <Jane@X.com> "` -> `"jane@x.com"`
pub fn clean_address(raw: &str) -> String {
    let inner = match (raw.find('<'), raw.rfind('>')) {
        (Some(start), Some(end)) if start < end => &raw[start + 1..end],
        _ => raw,
    };
    inner
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '<' && *c != '>')
        .collect::<String>()
        .to_lowercase()
}

fn address_of(value: &Value) -> Option<String> {
    let raw = match value {
        Value::String(s) => s.as_str(),
        Value::Object(obj) => obj.get("address").or_else(|| obj.get("email"))?.as_str()?,
        _ => return None,
    };
    let cleaned = clean_address(raw);
    (!cleaned.is_empty()).then_some(cleaned)
}

fn address_list(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().filter_map(address_of).collect(),
        Value::String(s) => s
            .split(',')
            .map(clean_address)
            .filter(|a| !a.is_empty())
            .collect(),
        other => address_of(other).into_iter().collect(),
    }
}

fn attachments_of(value: &Value) -> Vec<Attachment> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .map(|a| Attachment {
            filename: first_text(a, &["filename", "attachmentName", "name"]),
            content_type: first_text(a, &["content_type", "contentType", "mimeType"]),
            size: ["size", "attachmentSize"]
                .iter()
                .find_map(|k| match &a[*k] {
                    Value::Number(n) => n.as_u64(),
                    Value::String(s) => s.parse().ok(),
                    _ => None,
                })
                .unwrap_or(0),
        })
        .collect()
}

/// Epoch millis (number or numeric string), RFC 3339 or RFC 2822 -> RFC 3339 UTC
fn normalize_date(value: &Value) -> String {
    let parsed: Option<DateTime<Utc>> = match value {
        Value::Number(n) => n.as_i64().and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(ms) = s.parse::<i64>() {
                Utc.timestamp_millis_opt(ms).single()
            } else {
                DateTime::parse_from_rfc3339(s)
                    .or_else(|_| DateTime::parse_from_rfc2822(s))
                    .ok()
                    .map(|d| d.with_timezone(&Utc))
            }
        }
        _ => None,
    };

    match parsed {
        Some(date) => date.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => text_of(value),
    }
}

/// Recipient `{id}@{domain}` -> trigger id, for strictly alphanumeric local parts only
pub fn extract_trigger_id(address: &str, domain: &str) -> Option<String> {
    let (local, host) = address.split_once('@')?;
    let valid_local = !local.is_empty() && local.chars().all(|c| c.is_ascii_alphanumeric());
    (valid_local && host.eq_ignore_ascii_case(domain)).then(|| local.to_lowercase())
}

/// Test deliveries from the authoring UI are logged but never run a flow
pub fn is_test_email(email: &InboundEmail) -> bool {
    let subject = email.subject.to_lowercase();
    subject.contains("[test]") || subject.starts_with("test email") || email.from_address.starts_with("test@")
}

/// Generic trigger input handed to the execution endpoint
pub fn to_trigger_input(email: &InboundEmail, trigger_id: &str, received_at: DateTime<Utc>) -> Value {
    json!({
        "triggerId": trigger_id,
        "receivedAt": received_at.to_rfc3339(),
        "email": email,
    })
}
