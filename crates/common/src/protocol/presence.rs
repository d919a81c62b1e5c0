// JSON text messages carried next to binary sync frames.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PRESENCE_LEAVE_TYPE: &str = "presence_leave";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceKind {
    Cursor,
    Presence,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub id: String,
    pub name: String,
    pub color: String,
}

/// Cursor/identity broadcast. `slideId` is accepted as an alias of `shardId`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceMessage {
    #[serde(rename = "type")]
    pub kind: PresenceKind,
    pub client_id: String,
    #[serde(alias = "slideId")]
    pub shard_id: String,
    #[serde(default)]
    pub x: f64,
    #[serde(default)]
    pub y: f64,
    pub user: PresenceUser,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Sent by the relay when a member that announced a client id disconnects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceLeave {
    #[serde(rename = "type")]
    pub kind: String,
    pub client_id: String,
    pub shard_id: String,
    pub timestamp: i64,
}

impl PresenceLeave {
    pub fn new(client_id: impl Into<String>, shard_id: impl Into<String>, timestamp: i64) -> Self {
        Self {
            kind: PRESENCE_LEAVE_TYPE.to_string(),
            client_id: client_id.into(),
            shard_id: shard_id.into(),
            timestamp,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TextMessage {
    Presence(PresenceMessage),
    Leave(PresenceLeave),
    Other(Value),
}

#[derive(Debug, thiserror::Error)]
pub enum TextFrameError {
    #[error("text frame is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("text frame must be a JSON object with a string `type`")]
    MissingType,
}

/// Parse a text frame. Anything with a string `type` that is not a known
/// presence shape lands in `Other`.
pub fn parse_text(text: &str) -> Result<TextMessage, TextFrameError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value.get("type").and_then(Value::as_str).ok_or(TextFrameError::MissingType)?;
    let parsed = match kind {
        "cursor" | "presence" => {
            serde_json::from_value(value.clone()).map(TextMessage::Presence).ok()
        }
        PRESENCE_LEAVE_TYPE => serde_json::from_value(value.clone()).map(TextMessage::Leave).ok(),
        _ => None,
    };
    Ok(parsed.unwrap_or(TextMessage::Other(value)))
}

/// Fill in `timestamp` when the sender left it out. Frames that already
/// carry one are returned untouched.
pub fn stamp_timestamp(text: &str, now_ms: i64) -> Result<Cow<'_, str>, TextFrameError> {
    let mut value: Value = serde_json::from_str(text)?;
    let object = value.as_object_mut().ok_or(TextFrameError::MissingType)?;
    if !object.get("type").is_some_and(Value::is_string) {
        return Err(TextFrameError::MissingType);
    }
    if object.get("timestamp").is_some_and(|ts| !ts.is_null()) {
        return Ok(Cow::Borrowed(text));
    }
    object.insert("timestamp".to_string(), Value::from(now_ms));
    Ok(Cow::Owned(value.to_string()))
}

/// Client id announced by a text frame, if any.
pub fn announced_client_id(text: &str) -> Option<String> {
    match parse_text(text).ok()? {
        TextMessage::Presence(message) => Some(message.client_id),
        TextMessage::Other(value) => {
            value.get("clientId").and_then(Value::as_str).map(str::to_string)
        }
        TextMessage::Leave(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CURSOR: &str = r##"{"type":"cursor","clientId":"c1","slideId":"page-1","x":0.5,"y":0.75,"user":{"id":"u1","name":"Ada","color":"#336699"}}"##;

    #[test]
    fn parses_cursor_with_slide_alias() {
        let TextMessage::Presence(message) = parse_text(CURSOR).expect("cursor should parse")
        else {
            panic!("expected presence message");
        };
        assert_eq!(message.kind, PresenceKind::Cursor);
        assert_eq!(message.shard_id, "page-1");
        assert_eq!(message.user.name, "Ada");
        assert_eq!(message.timestamp, None);
    }

    #[test]
    fn serializes_camel_case_keys() {
        let message = PresenceMessage {
            kind: PresenceKind::Presence,
            client_id: "c2".into(),
            shard_id: "page-2".into(),
            x: 0.0,
            y: 1.0,
            user: PresenceUser { id: "u2".into(), name: "Grace".into(), color: "#000000".into() },
            timestamp: Some(42),
        };
        let json: Value = serde_json::to_value(&message).unwrap();
        assert_eq!(json["type"], "presence");
        assert_eq!(json["clientId"], "c2");
        assert_eq!(json["shardId"], "page-2");
        assert_eq!(json["timestamp"], 42);
    }

    #[test]
    fn unknown_types_are_other() {
        assert!(matches!(parse_text(r#"{"type":"hint","a":1}"#), Ok(TextMessage::Other(_))));
        assert!(matches!(parse_text(r#"{"type":"cursor"}"#), Ok(TextMessage::Other(_))));
    }

    #[test]
    fn rejects_non_messages() {
        assert!(matches!(parse_text("not json"), Err(TextFrameError::InvalidJson(_))));
        assert!(matches!(parse_text(r#"{"x":1}"#), Err(TextFrameError::MissingType)));
        assert!(matches!(parse_text("[1,2]"), Err(TextFrameError::MissingType)));
    }

    #[test]
    fn stamps_missing_timestamp() {
        let stamped = stamp_timestamp(CURSOR, 1_700_000_000_000).unwrap();
        let value: Value = serde_json::from_str(&stamped).unwrap();
        assert_eq!(value["timestamp"], 1_700_000_000_000_i64);
        assert_eq!(value["clientId"], "c1");
    }

    #[test]
    fn keeps_existing_timestamp_verbatim() {
        let text = r#"{"type":"hint","timestamp":5}"#;
        let stamped = stamp_timestamp(text, 99).unwrap();
        assert!(matches!(stamped, Cow::Borrowed(_)));
        assert_eq!(stamped, text);
    }

    #[test]
    fn leave_message_round_trips() {
        let leave = PresenceLeave::new("c1", "page-1", 10);
        let parsed = parse_text(&leave.to_json().unwrap()).unwrap();
        assert_eq!(parsed, TextMessage::Leave(leave));
    }

    #[test]
    fn leave_json_is_never_blank() {
        let leave = PresenceLeave::new("", "", 0);
        let json = leave.to_json().expect("leave notice should serialize");
        assert!(!json.is_empty());
        assert!(matches!(parse_text(&json), Ok(TextMessage::Leave(_))));
    }

    #[test]
    fn announced_client_id_from_presence_or_hint() {
        assert_eq!(announced_client_id(CURSOR).as_deref(), Some("c1"));
        assert_eq!(
            announced_client_id(r#"{"type":"hello","clientId":"c9"}"#).as_deref(),
            Some("c9")
        );
        assert_eq!(announced_client_id(r#"{"type":"hello"}"#), None);
    }
}
