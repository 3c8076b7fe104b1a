//! Builder Seam
//!
//! Derived-state builders plug into the worker pool through this trait.
//! Builders never throw past the pool: they return a classified result, and
//! the retry policy is a pure function of that classification plus the
//! attempt count.

use async_trait::async_trait;
use blueplane_core::{CdcRecord, Payload};
use std::fmt;

/// Classified builder failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    /// Worth retrying: I/O timeouts, lock contention, references that may
    /// resolve after an in-flight commit lands.
    Transient { kind: String, message: String },
    /// Retrying cannot help: schema violations, referential integrity
    /// beyond repair. Promoted straight to the DLQ.
    Permanent { kind: String, message: String },
}

impl BuildError {
    pub fn transient(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transient {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn permanent(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Permanent {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &str {
        match self {
            Self::Transient { kind, .. } | Self::Permanent { kind, .. } => kind,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient { message, .. } | Self::Permanent { message, .. } => message,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient { kind, message } => write!(f, "transient/{kind}: {message}"),
            Self::Permanent { kind, message } => write!(f, "permanent/{kind}: {message}"),
        }
    }
}

pub type BuildResult = std::result::Result<(), BuildError>;

/// A derived-state builder driven by the worker pool.
///
/// `apply` must be idempotent per `event_id`: redelivering an
/// already-applied CDC record must leave the builder's store unchanged.
#[async_trait]
pub trait Builder: Send + Sync {
    /// Stable identity used for DLQ stages and custody counters.
    fn id(&self) -> &'static str;

    /// Apply one CDC record. The pool resolves by-reference payloads before
    /// calling, so `payload` is always the full event payload.
    async fn apply(&self, record: &CdcRecord, payload: &Payload) -> BuildResult;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_accessors() {
        let t = BuildError::transient("io", "timeout");
        assert!(t.is_transient());
        assert_eq!(t.kind(), "io");
        assert_eq!(t.message(), "timeout");

        let p = BuildError::permanent("schema", "missing key");
        assert!(!p.is_transient());
        assert_eq!(p.to_string(), "permanent/schema: missing key");
    }
}
