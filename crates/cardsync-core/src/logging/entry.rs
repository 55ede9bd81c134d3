//! One JSONL log line.
//!
//! Every entry is self-contained so two peers on the same machine can append
//! to their own files without coordinating.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single structured log line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    /// RFC 3339 timestamp with milliseconds
    pub ts: String,
    /// trace, debug, info, warn or error
    pub level: String,
    /// Peer instance that wrote the line (e.g. "offer", "answer")
    pub peer: String,
    /// Module path of the event
    pub target: String,
    pub msg: String,
    /// Structured event fields
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
    /// Enclosing spans, root first, joined with " > "
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl LogLine {
    pub fn new(
        level: impl Into<String>,
        peer: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            peer: peer.into(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    /// Look up a structured field by name
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.as_ref().and_then(|fields| fields.get(name))
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_shape() {
        let line = LogLine::new("info", "offer", "cardsync_core::session", "Connected")
            .with_fields(serde_json::json!({ "remote": "abc", "is_writer": true }));

        let json = line.to_json_line().unwrap();
        assert!(json.contains("\"level\":\"info\""));
        assert!(json.contains("\"peer\":\"offer\""));
        assert!(json.contains("\"is_writer\":true"));
        assert!(!json.contains("\"span\""));

        let parsed = LogLine::from_json_line(&json).unwrap();
        assert_eq!(parsed.msg, "Connected");
        assert_eq!(parsed.field("remote"), Some(&Value::String("abc".into())));
        assert_eq!(parsed.field("missing"), None);
    }
}
