//! Star wire format
//!
//! One JSON object per line: `{"from": ..., "text": ..., "id": ...}`. The
//! `id` is optional. Lines that are not JSON objects are still delivered,
//! as raw text from the remote endpoint.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::Result;

/// Longest record a reader accepts, excluding the newline. Longer records
/// are discarded up to their terminating newline.
pub const MAX_RECORD_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireRecord {
    pub from: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
}

impl WireRecord {
    pub fn new(from: impl Into<String>, text: impl Into<String>, id: Option<Uuid>) -> Self {
        Self {
            from: from.into(),
            text: text.into(),
            id,
        }
    }
}

/// Serialize `record` as a single newline-terminated line
pub fn encode_line(record: &WireRecord) -> Result<String> {
    let mut line = serde_json::to_string(record)?;
    line.push('\n');
    Ok(line)
}

/// Parse one received line. `fallback_sender` names the remote endpoint and
/// stands in for a missing or unparseable sender. Blank lines yield `None`.
pub fn parse_line(line: &str, fallback_sender: &str) -> Option<WireRecord> {
    let line = line.trim_end_matches(&['\r', '\n'][..]);
    if line.trim().is_empty() {
        return None;
    }

    let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(line) else {
        return Some(WireRecord::new(fallback_sender, line, None));
    };

    let from = fields
        .get("from")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .unwrap_or(fallback_sender);
    let text = match fields.get("text") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => line.to_string(),
    };
    let id = fields
        .get("id")
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok());

    Some(WireRecord::new(from, text, id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_is_one_line() {
        let line = encode_line(&WireRecord::new("X", "multi\nline", None)).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        assert!(!line.contains("\"id\""));
    }

    #[test]
    fn test_parse_full_record() {
        let id = Uuid::new_v4();
        let line = encode_line(&WireRecord::new("X", "yo", Some(id))).unwrap();
        let record = parse_line(&line, "00:11").unwrap();
        assert_eq!(record, WireRecord::new("X", "yo", Some(id)));
    }

    #[test]
    fn test_raw_text_falls_back_to_endpoint() {
        let record = parse_line("just some words\n", "10.0.0.7:4000").unwrap();
        assert_eq!(record.from, "10.0.0.7:4000");
        assert_eq!(record.text, "just some words");
        assert_eq!(record.id, None);
    }

    #[test]
    fn test_partial_records() {
        let record = parse_line(r#"{"text":"no sender"}"#, "peer").unwrap();
        assert_eq!(record.from, "peer");
        assert_eq!(record.text, "no sender");

        let record = parse_line(r#"{"from":"X","text":"hi","id":"not-a-uuid"}"#, "peer").unwrap();
        assert_eq!(record.from, "X");
        assert_eq!(record.id, None);

        // a JSON value that is not an object is raw text
        let record = parse_line("42", "peer").unwrap();
        assert_eq!(record.text, "42");
    }

    #[test]
    fn test_blank_lines_are_skipped() {
        assert!(parse_line("\n", "peer").is_none());
        assert!(parse_line("   \r\n", "peer").is_none());
    }
}
