//! Change-Data-Capture and Dead-Letter Record Shapes
//!
//! ## CDC Records
//!
//! After a batch commits to the raw store, the fast path appends one CDC
//! record per event. The record copies the event identity fields and either
//! carries the payload inline (small payloads) or points back into the raw
//! store as `(batch_id, index)`. The CDC entry id itself is assigned by the
//! stream at append time, so it does not appear in the wire body.
//!
//! ## Dead-Letter Records
//!
//! Events that exhaust their retry budget at any stage are shipped to the
//! DLQ with the original payload, the failing stage, and the last error.
//! The DLQ is append-only; operators drain it out-of-band.

use crate::{BatchId, Error, Event, EventType, Payload, Result, SessionKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Processing stages that can deadletter an event.
pub mod stage {
    pub const FAST_PATH: &str = "fast_path";
    pub const CONVERSATION_BUILDER: &str = "conversation_builder";
    pub const METRICS_AGGREGATOR: &str = "metrics_aggregator";
}

/// Payload carriage on a CDC record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PayloadRef {
    /// Payload small enough to ride on the CDC record itself.
    Inline { payload: Payload },
    /// Payload left in the raw store; `(batch_id, index)` locates the event.
    Stored { batch_id: BatchId, index: u32 },
}

/// Per-event notification published after a successful batch commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdcRecord {
    pub event_id: crate::EventId,
    pub enqueued_at: DateTime<Utc>,
    pub platform: String,
    pub external_session_id: String,
    pub event_type: EventType,
    pub batch_id: BatchId,
    pub payload_ref: PayloadRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_hash: Option<String>,
}

impl CdcRecord {
    /// Build the CDC record for one event of a committed batch.
    ///
    /// Payloads at or under `inline_limit` serialized bytes ride inline;
    /// larger payloads are referenced by `(batch_id, index)`.
    pub fn for_event(event: &Event, batch_id: BatchId, index: u32, inline_limit: usize) -> Self {
        let payload_ref = if event.payload.serialized_len() <= inline_limit {
            PayloadRef::Inline {
                payload: event.payload.clone(),
            }
        } else {
            PayloadRef::Stored { batch_id, index }
        };
        Self {
            event_id: event.event_id.clone(),
            enqueued_at: event.enqueued_at,
            platform: event.platform.clone(),
            external_session_id: event.external_session_id.clone(),
            event_type: event.event_type.clone(),
            batch_id,
            payload_ref,
            workspace_hash: event.workspace_hash.clone(),
        }
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey::derive(&self.platform, &self.external_session_id)
    }

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
        fields.insert("batch_id".to_string(), self.batch_id.0.to_string());
        // The payload_ref is structured, so it travels as one JSON field.
        fields.insert(
            "payload_ref".to_string(),
            serde_json::to_string(&self.payload_ref).unwrap_or_default(),
        );
        if let Some(ref hash) = self.workspace_hash {
            fields.insert("workspace_hash".to_string(), hash.clone());
        }
        fields
    }

    pub fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self> {
        let required = |key: &str| -> Result<&String> {
            fields
                .get(key)
                .ok_or_else(|| Error::MalformedEntry(format!("missing field '{key}'")))
        };

        let enqueued_at = DateTime::parse_from_rfc3339(required("enqueued_at")?)
            .map_err(|e| Error::MalformedEntry(format!("bad enqueued_at: {e}")))?
            .with_timezone(&Utc);

        let batch_id = required("batch_id")?
            .parse::<i64>()
            .map(BatchId)
            .map_err(|e| Error::MalformedEntry(format!("bad batch_id: {e}")))?;

        let payload_ref: PayloadRef = serde_json::from_str(required("payload_ref")?)
            .map_err(|e| Error::MalformedEntry(format!("bad payload_ref: {e}")))?;

        Ok(Self {
            event_id: crate::EventId::from_raw(required("event_id")?.clone()),
            enqueued_at,
            platform: required("platform")?.clone(),
            external_session_id: required("external_session_id")?.clone(),
            event_type: EventType::parse(required("event_type")?),
            batch_id,
            payload_ref,
            workspace_hash: fields.get("workspace_hash").cloned(),
        })
    }
}

/// Record deposited on the dead-letter stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqRecord {
    pub event_id: crate::EventId,
    pub platform: String,
    pub external_session_id: String,
    /// Serialized original payload, preserved for out-of-band triage.
    pub payload_json: String,
    /// Stage that gave up on the event; see [`stage`].
    pub stage: String,
    pub error_kind: String,
    pub error_message: String,
    pub recorded_at: DateTime<Utc>,
}

impl DlqRecord {
    pub fn to_fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("event_id".to_string(), self.event_id.as_str().to_string());
        fields.insert("platform".to_string(), self.platform.clone());
        fields.insert(
            "external_session_id".to_string(),
            self.external_session_id.clone(),
        );
        fields.insert("payload".to_string(), self.payload_json.clone());
        fields.insert("stage".to_string(), self.stage.clone());
        fields.insert("error_kind".to_string(), self.error_kind.clone());
        fields.insert("error_message".to_string(), self.error_message.clone());
        fields.insert("recorded_at".to_string(), self.recorded_at.to_rfc3339());
        fields
    }

    pub fn from_fields(fields: &BTreeMap<String, String>) -> Result<Self> {
        let required = |key: &str| -> Result<&String> {
            fields
                .get(key)
                .ok_or_else(|| Error::MalformedEntry(format!("missing field '{key}'")))
        };
        let recorded_at = DateTime::parse_from_rfc3339(required("recorded_at")?)
            .map_err(|e| Error::MalformedEntry(format!("bad recorded_at: {e}")))?
            .with_timezone(&Utc);
        Ok(Self {
            event_id: crate::EventId::from_raw(required("event_id")?.clone()),
            platform: required("platform")?.clone(),
            external_session_id: required("external_session_id")?.clone(),
            payload_json: required("payload")?.clone(),
            stage: required("stage")?.clone(),
            error_kind: required("error_kind")?.clone(),
            error_message: required("error_message")?.clone(),
            recorded_at,
        })
    }
}
