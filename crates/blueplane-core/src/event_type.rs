//! Event Type Enumeration
//!
//! The fixed set of event types emitted by capture agents, plus an open
//! variant for types this build does not know about yet.
//!
//! ## Extensibility
//!
//! Capture agents evolve independently of the pipeline. An unknown
//! `event_type` string round-trips through the raw store untouched as
//! `EventType::Other` and is ignored by the derived-state builders, so a
//! newer agent never poisons an older pipeline.
//!
//! ## Validation
//!
//! `required_keys` lists the payload keys that must be present for each
//! known type. Validation checks presence only (plus the closed value set of
//! `FileEdit.operation`); everything else in the payload is opaque.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Legal values for the `operation` key of a `FileEdit` payload.
pub const FILE_EDIT_OPERATIONS: &[&str] = &["created", "edited", "deleted", "accepted", "rejected"];

/// Type of a captured telemetry event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventType {
    SessionStart,
    SessionEnd,
    UserPrompt,
    AssistantResponse,
    ToolPre,
    ToolPost,
    FileEdit,
    ShellPre,
    ShellPost,
    ContextCompact,
    /// Any event type this build does not recognize. Carried verbatim.
    Other(String),
}

impl EventType {
    /// Parse from the wire string. Never fails: unknown strings map to `Other`.
    pub fn parse(s: &str) -> Self {
        match s {
            "SessionStart" => Self::SessionStart,
            "SessionEnd" => Self::SessionEnd,
            "UserPrompt" => Self::UserPrompt,
            "AssistantResponse" => Self::AssistantResponse,
            "ToolPre" => Self::ToolPre,
            "ToolPost" => Self::ToolPost,
            "FileEdit" => Self::FileEdit,
            "ShellPre" => Self::ShellPre,
            "ShellPost" => Self::ShellPost,
            "ContextCompact" => Self::ContextCompact,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::SessionStart => "SessionStart",
            Self::SessionEnd => "SessionEnd",
            Self::UserPrompt => "UserPrompt",
            Self::AssistantResponse => "AssistantResponse",
            Self::ToolPre => "ToolPre",
            Self::ToolPost => "ToolPost",
            Self::FileEdit => "FileEdit",
            Self::ShellPre => "ShellPre",
            Self::ShellPost => "ShellPost",
            Self::ContextCompact => "ContextCompact",
            Self::Other(s) => s,
        }
    }

    /// Payload keys that must be present for this event type.
    ///
    /// Unknown types have no required keys: they are accepted unchanged.
    pub fn required_keys(&self) -> &'static [&'static str] {
        match self {
            Self::SessionStart => &[],
            Self::SessionEnd => &["session_duration_ms"],
            Self::UserPrompt => &["prompt_length"],
            Self::AssistantResponse => &["response_length", "tokens_used", "model", "duration_ms"],
            Self::ToolPre => &["tool_name", "input_size"],
            Self::ToolPost => &["tool_name", "success", "duration_ms", "output_size"],
            Self::FileEdit => &["file_extension", "lines_added", "lines_removed", "operation"],
            Self::ShellPre => &["command_length"],
            Self::ShellPost => &["exit_code", "duration_ms", "output_lines"],
            Self::ContextCompact => &["tokens_before", "tokens_after"],
            Self::Other(_) => &[],
        }
    }

    /// Whether this is a type the builders know how to interpret.
    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Other(_))
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(EventType::parse(&s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_types() {
        assert_eq!(EventType::parse("SessionStart"), EventType::SessionStart);
        assert_eq!(EventType::parse("ToolPost"), EventType::ToolPost);
        assert_eq!(EventType::parse("ContextCompact"), EventType::ContextCompact);
    }

    #[test]
    fn test_parse_unknown_type_preserved() {
        let t = EventType::parse("FutureEvent");
        assert_eq!(t, EventType::Other("FutureEvent".to_string()));
        assert_eq!(t.as_str(), "FutureEvent");
        assert!(!t.is_known());
    }

    #[test]
    fn test_roundtrip_all_known() {
        for name in [
            "SessionStart",
            "SessionEnd",
            "UserPrompt",
            "AssistantResponse",
            "ToolPre",
            "ToolPost",
            "FileEdit",
            "ShellPre",
            "ShellPost",
            "ContextCompact",
        ] {
            let t = EventType::parse(name);
            assert!(t.is_known(), "{} should be known", name);
            assert_eq!(t.as_str(), name);
        }
    }

    #[test]
    fn test_required_keys() {
        assert!(EventType::SessionStart.required_keys().is_empty());
        assert_eq!(
            EventType::UserPrompt.required_keys(),
            &["prompt_length"]
        );
        assert_eq!(EventType::FileEdit.required_keys().len(), 4);
        assert!(EventType::Other("x".into()).required_keys().is_empty());
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&EventType::UserPrompt).unwrap();
        assert_eq!(json, "\"UserPrompt\"");
        let back: EventType = serde_json::from_str("\"UserPrompt\"").unwrap();
        assert_eq!(back, EventType::UserPrompt);
        let unknown: EventType = serde_json::from_str("\"Mystery\"").unwrap();
        assert_eq!(unknown, EventType::Other("Mystery".to_string()));
    }
}
