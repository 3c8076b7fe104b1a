//! Session Identity
//!
//! Sessions group events that share `(platform, external_session_id)`. The
//! key is a stable 16-hex-digit digest so it can serve as a compact primary
//! key in the conversation store and as a metric label without leaking the
//! producer-assigned identifier length into key sizes.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Stable digest of `(platform, external_session_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionKey(String);

impl SessionKey {
    /// Derive the key for a platform + producer-assigned session id pair.
    pub fn derive(platform: &str, external_session_id: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(platform.as_bytes());
        hasher.update(b":");
        hasher.update(external_session_id.as_bytes());
        let digest = hasher.finalize();
        let mut key = String::with_capacity(16);
        for byte in &digest[..8] {
            key.push_str(&format!("{byte:02x}"));
        }
        Self(key)
    }

    /// Wrap an already-derived key (e.g. read back from storage).
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_stable() {
        let a = SessionKey::derive("claude_code", "s-1");
        let b = SessionKey::derive("claude_code", "s-1");
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 16);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_platform_separates_keys() {
        let a = SessionKey::derive("claude_code", "s-1");
        let b = SessionKey::derive("cursor", "s-1");
        assert_ne!(a, b);
    }

    #[test]
    fn test_separator_prevents_ambiguity() {
        // "ab" + "c" must not collide with "a" + "bc"
        let a = SessionKey::derive("ab", "c");
        let b = SessionKey::derive("a", "bc");
        assert_ne!(a, b);
    }
}
