//! Change-feed wire format.
//!
//! The backend streams one JSON object per line:
//!
//! ```text
//! {"type":"SUBSCRIBED"}
//! {"type":"INSERT","table":"transactions","record":{"id":7,...}}
//! {"type":"UPDATE","table":"customers","record":{...},"old_record":{...}}
//! {"type":"DELETE","table":"gift_cards","old_record":{"id":3}}
//! {"type":"HEARTBEAT"}
//! {"type":"ERROR","message":"..."}
//! ```

use serde::Deserialize;
use serde_json::Value;

use crate::error::ChannelError;

const REDACTED: &str = "[redacted]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    pub new_row: Value,
    pub old_row: Value,
}

impl ChangeEvent {
    /// The row id used for patching. Deletes prefer `old_row.id`, other
    /// kinds prefer `new_row.id`; either falls back to the other row.
    pub fn row_id(&self) -> Option<&Value> {
        fn id(row: &Value) -> Option<&Value> {
            row.get("id").filter(|v| !v.is_null())
        }
        let (primary, fallback) = match self.kind {
            ChangeKind::Delete => (&self.old_row, &self.new_row),
            ChangeKind::Insert | ChangeKind::Update => (&self.new_row, &self.old_row),
        };
        id(primary).or_else(|| id(fallback))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Subscribed,
    Heartbeat,
    Change(ChangeEvent),
    /// Server-reported error; the channel is considered dropped.
    Error(String),
}

#[derive(Debug, Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    table: Option<String>,
    #[serde(default)]
    record: Option<Value>,
    #[serde(default)]
    old_record: Option<Value>,
    #[serde(default)]
    message: Option<String>,
}

pub fn decode_line(line: &str) -> Result<ChannelMessage, ChannelError> {
    let frame: WireFrame = serde_json::from_str(line.trim())
        .map_err(|e| ChannelError::Protocol(format!("bad frame: {e}")))?;

    let kind = match frame.frame_type.to_ascii_uppercase().as_str() {
        "SUBSCRIBED" => return Ok(ChannelMessage::Subscribed),
        "HEARTBEAT" => return Ok(ChannelMessage::Heartbeat),
        "ERROR" => {
            return Ok(ChannelMessage::Error(
                frame.message.unwrap_or_else(|| "unknown error".to_string()),
            ))
        }
        "INSERT" => ChangeKind::Insert,
        "UPDATE" => ChangeKind::Update,
        "DELETE" => ChangeKind::Delete,
        other => return Err(ChannelError::Protocol(format!("unknown frame type {other:?}"))),
    };

    let table = frame
        .table
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ChannelError::Protocol("change frame without table".to_string()))?;

    Ok(ChannelMessage::Change(ChangeEvent {
        table,
        kind,
        new_row: frame.record.unwrap_or(Value::Null),
        old_row: frame.old_record.unwrap_or(Value::Null),
    }))
}

/// Field names treated as credentials in channel payloads.
pub(crate) fn is_sensitive_key(key: &str) -> bool {
    let key = key.trim().to_ascii_lowercase();
    matches!(
        key.as_str(),
        "apikey"
            | "api_key"
            | "pos_api_key"
            | "authorization"
            | "access_token"
            | "refresh_token"
            | "service_role_key"
            | "jwt_secret"
            | "client_secret"
            | "password"
            | "pin_hash"
    ) || key.contains("service_role")
        || key.ends_with("_secret")
        || key.ends_with("_token")
}

/// Copy of `value` with credential-like fields replaced, for logging only.
pub fn redact_for_log(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let redacted = if is_sensitive_key(k) {
                        Value::String(REDACTED.to_string())
                    } else {
                        redact_for_log(v)
                    };
                    (k.clone(), redacted)
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_for_log).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_change_frames() {
        let msg = decode_line(r#"{"type":"INSERT","table":"transactions","record":{"id":7,"total":12.5}}"#)
            .unwrap();
        let ChannelMessage::Change(ev) = msg else {
            panic!("expected change");
        };
        assert_eq!(ev.kind, ChangeKind::Insert);
        assert_eq!(ev.table, "transactions");
        assert_eq!(ev.row_id(), Some(&json!(7)));

        let del = decode_line(r#"{"type":"delete","table":"gift_cards","old_record":{"id":3}}"#)
            .unwrap();
        let ChannelMessage::Change(ev) = del else {
            panic!("expected change");
        };
        assert_eq!(ev.kind, ChangeKind::Delete);
        assert_eq!(ev.row_id(), Some(&json!(3)));
    }

    #[test]
    fn test_row_id_prefers_old_row_for_deletes() {
        let mut ev = ChangeEvent {
            table: "customers".into(),
            kind: ChangeKind::Delete,
            new_row: json!({ "id": 8 }),
            old_row: json!({ "id": 5 }),
        };
        assert_eq!(ev.row_id(), Some(&json!(5)));
        ev.kind = ChangeKind::Update;
        assert_eq!(ev.row_id(), Some(&json!(8)));
        ev.new_row = json!({ "id": null });
        assert_eq!(ev.row_id(), Some(&json!(5)));
    }

    #[test]
    fn test_decode_control_frames() {
        assert_eq!(decode_line(r#"{"type":"SUBSCRIBED"}"#).unwrap(), ChannelMessage::Subscribed);
        assert_eq!(decode_line(r#"{"type":"HEARTBEAT"}"#).unwrap(), ChannelMessage::Heartbeat);
        assert_eq!(
            decode_line(r#"{"type":"ERROR","message":"quota"}"#).unwrap(),
            ChannelMessage::Error("quota".into())
        );
    }

    #[test]
    fn test_decode_rejects_malformed_frames() {
        assert!(decode_line("not json").is_err());
        assert!(decode_line(r#"{"type":"INSERT","record":{}}"#).is_err());
        assert!(decode_line(r#"{"type":"TRUNCATE","table":"x"}"#).is_err());
    }

    #[test]
    fn test_redact_for_log_scrubs_nested_credentials() {
        let payload = json!({
            "id": 1,
            "access_token": "eyJhbGci",
            "meta": { "stripe_secret": "sk_live", "note": "ok" },
            "devices": [{ "reader_token": "tok", "label": "front" }]
        });
        let redacted = redact_for_log(&payload);
        assert_eq!(redacted["id"], 1);
        assert_eq!(redacted["access_token"], REDACTED);
        assert_eq!(redacted["meta"]["stripe_secret"], REDACTED);
        assert_eq!(redacted["meta"]["note"], "ok");
        assert_eq!(redacted["devices"][0]["reader_token"], REDACTED);
        assert_eq!(redacted["devices"][0]["label"], "front");
    }
}
