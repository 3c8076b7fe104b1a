//! Event Data Structure
//!
//! This module defines `Event` - the unit of data produced by capture agents
//! and moved through the whole pipeline.
//!
//! ## What is an Event?
//! A single observation from an AI-assisted coding session:
//! - a prompt being submitted
//! - an assistant response arriving
//! - a tool or shell invocation
//! - a file edit, or a session lifecycle transition
//!
//! ## Structure
//! Each event carries:
//! - **event_id**: globally unique id assigned by the producer
//! - **enqueued_at**: producer wall-clock timestamp (RFC 3339, UTC)
//! - **platform**: originating tool family (e.g. `claude_code`, `cursor`)
//! - **external_session_id**: opaque producer-assigned session identifier
//! - **event_type**: see [`EventType`]
//! - **payload**: opaque JSON object, validated only for required keys
//! - **retry_count**: redelivery counter, starts at 0
//! - **workspace_hash**: optional workspace fingerprint from the agent
//!
//! ## Wire Form
//! On the streams, events travel as flat string field maps (the shape the
//! capture agents write). `to_fields`/`from_fields` convert between the two
//! representations; the payload rides as one serialized JSON field.
//!
//! ## Design Decisions
//! - Duplicated `event_id`s are tolerated here and deduplicated at the
//!   derived-state layer, never rejected at ingress.
//! - Validation lives on the event, not the payload: only the event type
//!   knows which keys matter.

use crate::{Error, EventType, Payload, Result, SessionKey, FILE_EDIT_OPERATIONS};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Globally unique event identifier, assigned by the producer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonically increasing id of a committed raw-store batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub i64);

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single telemetry event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: EventId,
    pub enqueued_at: DateTime<Utc>,
    pub platform: String,
    pub external_session_id: String,
    pub event_type: EventType,
    pub payload: Payload,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_hash: Option<String>,
}

impl Event {
    /// Construct an event with a generated id, stamped now. Used by tests
    /// and synthetic producers; real events arrive via `from_fields`.
    pub fn new(
        platform: impl Into<String>,
        external_session_id: impl Into<String>,
        event_type: EventType,
        payload: Payload,
    ) -> Self {
        Self {
            event_id: EventId::generate(),
            enqueued_at: Utc::now(),
            platform: platform.into(),
            external_session_id: external_session_id.into(),
            event_type,
            payload,
            retry_count: 0,
            workspace_hash: None,
        }
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey::derive(&self.platform, &self.external_session_id)
    }

    /// Validate the payload against the required keys of the event type.
    ///
    /// Unknown event types always pass: they are accepted into the raw store
    /// unchanged and ignored by the builders.
    pub fn validate(&self) -> Result<()> {
        for key in self.event_type.required_keys() {
            if !self.payload.contains_key(key) {
                return Err(Error::MissingField {
                    event_type: self.event_type.as_str().to_string(),
                    field: key,
                });
            }
        }
        if self.event_type == EventType::FileEdit {
            match self.payload.str_field("operation") {
                Some(op) if FILE_EDIT_OPERATIONS.contains(&op) => {}
                Some(op) => {
                    return Err(Error::InvalidField {
                        event_type: self.event_type.as_str().to_string(),
                        field: "operation",
                        reason: format!("'{op}' is not a file-edit operation"),
                    })
                }
                None => {
                    return Err(Error::InvalidField {
                        event_type: self.event_type.as_str().to_string(),
                        field: "operation",
                        reason: "expected a string".to_string(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Flatten to the stream wire form.
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("event_id".to_string(), self.event_id.as_str().to_string());
        fields.insert("enqueued_at".to_string(), self.enqueued_at.to_rfc3339());
        fields.insert("platform".to_string(), self.platform.clone());
        fields.insert(
            "external_session_id".to_string(),
            self.external_session_id.clone(),
        );
        fields.insert(
            "event_type".to_string(),
            self.event_type.as_str().to_string(),
        );
        fields.insert("payload".to_string(), self.payload.to_json());
        fields.insert("retry_count".to_string(), self.retry_count.to_string());
        if let Some(ref hash) = self.workspace_hash {
            fields.insert("workspace_hash".to_string(), hash.clone());
        }
        fields
    }

    /// Parse from the stream wire form.
    pub fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self> {
        let required = |key: &str| -> Result<&String> {
            fields
                .get(key)
                .ok_or_else(|| Error::MalformedEntry(format!("missing field '{key}'")))
        };

        let enqueued_at = DateTime::parse_from_rfc3339(required("enqueued_at")?)
            .map_err(|e| Error::MalformedEntry(format!("bad enqueued_at: {e}")))?
            .with_timezone(&Utc);

        let retry_count = fields
            .get("retry_count")
            .map(|v| {
                v.parse::<u32>()
                    .map_err(|e| Error::MalformedEntry(format!("bad retry_count: {e}")))
            })
            .transpose()?
            .unwrap_or(0);

        let payload = match fields.get("payload") {
            Some(raw) => Payload::from_json(raw)
                .map_err(|e| Error::MalformedEntry(format!("bad payload: {e}")))?,
            None => Payload::new(),
        };

        Ok(Self {
            event_id: EventId::from_raw(required("event_id")?.clone()),
            enqueued_at,
            platform: required("platform")?.clone(),
            external_session_id: required("external_session_id")?.clone(),
            event_type: EventType::parse(required("event_type")?),
            payload,
            retry_count,
            workspace_hash: fields.get("workspace_hash").cloned(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> Event {
        Event::new(
            "claude_code",
            "s-1",
            EventType::ToolPost,
            Payload::new()
                .with("tool_name", "Edit")
                .with("success", true)
                .with("duration_ms", 150u64)
                .with("output_size", 42u64),
        )
    }

    // ---------------------------------------------------------------
    // Validation
    // ---------------------------------------------------------------

    #[test]
    fn test_validate_complete_payload() {
        assert!(sample_event().validate().is_ok());
    }

    #[test]
    fn test_validate_missing_key() {
        let mut ev = sample_event();
        ev.payload = Payload::new().with("tool_name", "Edit");
        let err = ev.validate().unwrap_err();
        assert!(matches!(err, Error::MissingField { field: "success", .. }));
    }

    #[test]
    fn test_validate_unknown_type_always_passes() {
        let ev = Event::new(
            "cursor",
            "s-2",
            EventType::Other("FutureEvent".into()),
            Payload::new(),
        );
        assert!(ev.validate().is_ok());
    }

    #[test]
    fn test_validate_session_start_requires_nothing() {
        let ev = Event::new("cursor", "s-2", EventType::SessionStart, Payload::new());
        assert!(ev.validate().is_ok());
    }

    #[test]
    fn test_validate_file_edit_operation_values() {
        for op in FILE_EDIT_OPERATIONS {
            let ev = Event::new(
                "claude_code",
                "s-1",
                EventType::FileEdit,
                Payload::new()
                    .with("file_extension", ".rs")
                    .with("lines_added", 3u64)
                    .with("lines_removed", 1u64)
                    .with("operation", *op),
            );
            assert!(ev.validate().is_ok(), "operation '{}' should pass", op);
        }

        let bad = Event::new(
            "claude_code",
            "s-1",
            EventType::FileEdit,
            Payload::new()
                .with("file_extension", ".rs")
                .with("lines_added", 3u64)
                .with("lines_removed", 1u64)
                .with("operation", "renamed"),
        );
        assert!(matches!(
            bad.validate().unwrap_err(),
            Error::InvalidField { field: "operation", .. }
        ));
    }

    // ---------------------------------------------------------------
    // Wire form
    // ---------------------------------------------------------------

    #[test]
    fn test_fields_roundtrip() {
        let ev = sample_event();
        let back = Event::from_fields(&ev.to_fields()).unwrap();
        assert_eq!(ev, back);
    }

    #[test]
    fn test_fields_roundtrip_with_workspace_hash() {
        let mut ev = sample_event();
        ev.workspace_hash = Some("abc123".to_string());
        let back = Event::from_fields(&ev.to_fields()).unwrap();
        assert_eq!(back.workspace_hash.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_from_fields_missing_event_id() {
        let mut fields = sample_event().to_fields();
        fields.remove("event_id");
        assert!(matches!(
            Event::from_fields(&fields).unwrap_err(),
            Error::MalformedEntry(_)
        ));
    }

    #[test]
    fn test_from_fields_bad_timestamp() {
        let mut fields = sample_event().to_fields();
        fields.insert("enqueued_at".into(), "yesterday".into());
        assert!(Event::from_fields(&fields).is_err());
    }

    #[test]
    fn test_from_fields_bad_payload_json() {
        let mut fields = sample_event().to_fields();
        fields.insert("payload".into(), "{not json".into());
        assert!(Event::from_fields(&fields).is_err());
    }

    #[test]
    fn test_from_fields_defaults() {
        let mut fields = sample_event().to_fields();
        fields.remove("retry_count");
        fields.remove("payload");
        let ev = Event::from_fields(&fields).unwrap();
        assert_eq!(ev.retry_count, 0);
        assert!(ev.payload.is_empty());
    }

    #[test]
    fn test_unknown_event_type_survives_roundtrip() {
        let mut fields = sample_event().to_fields();
        fields.insert("event_type".into(), "BrandNew".into());
        let ev = Event::from_fields(&fields).unwrap();
        assert_eq!(ev.event_type, EventType::Other("BrandNew".into()));
        let again = Event::from_fields(&ev.to_fields()).unwrap();
        assert_eq!(again.event_type.as_str(), "BrandNew");
    }

    // ---------------------------------------------------------------
    // Identity
    // ---------------------------------------------------------------

    #[test]
    fn test_session_key_matches_derivation() {
        let ev = sample_event();
        assert_eq!(
            ev.session_key(),
            SessionKey::derive("claude_code", "s-1")
        );
    }

    #[test]
    fn test_generated_ids_unique() {
        assert_ne!(EventId::generate(), EventId::generate());
    }

    #[test]
    fn test_serde_json_roundtrip() {
        let ev = sample_event();
        let json = serde_json::to_string(&ev).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(ev, back);
    }
}
