//! Load-Shedding Control Signal
//!
//! The CDC depth monitor publishes a [`ShedLevel`] that the fast path
//! observes between batches. Shedding slows CDC production without touching
//! producers: ingress retention absorbs the difference.

use std::fmt;

/// How aggressively the fast path should slow down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShedLevel {
    /// Normal operation.
    #[default]
    Normal,
    /// Shed mode: batch size halves, batch window doubles.
    Shed,
    /// Shed+pause: additionally pause between batches.
    ShedPause,
}

impl ShedLevel {
    /// Effective batch size cap under this level (never below 1).
    pub fn adjusted_batch_max(&self, base: usize) -> usize {
        match self {
            Self::Normal => base,
            Self::Shed | Self::ShedPause => (base / 2).max(1),
        }
    }

    /// Effective batch window under this level.
    pub fn adjusted_batch_window(&self, base: std::time::Duration) -> std::time::Duration {
        match self {
            Self::Normal => base,
            Self::Shed | Self::ShedPause => base * 2,
        }
    }

    /// Whether the fast path should pause between batches.
    pub fn pauses(&self) -> bool {
        matches!(self, Self::ShedPause)
    }
}

impl fmt::Display for ShedLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Shed => write!(f, "shed"),
            Self::ShedPause => write!(f, "shed+pause"),
        }
    }
}
