//! Fast-Path Configuration

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FastPathConfig {
    /// Ingress consumer group name.
    pub group: String,
    /// This consumer's name within the group.
    pub consumer_name: String,
    /// Maximum events per batch (B_MAX).
    pub batch_max: usize,
    /// Wall-clock window from first event to batch close (T_BATCH).
    pub batch_window: Duration,
    /// Block timeout on empty stream reads (T_POLL).
    pub poll_timeout: Duration,
    /// Bound on each CDC append (fire-and-forget).
    pub cdc_timeout: Duration,
    /// How often stuck ingress entries are claimed.
    pub claim_interval: Duration,
    /// Pending age beyond which an entry counts as stuck (T_STUCK).
    pub stuck_after: Duration,
    /// Commit failures per event before deadlettering (R_MAX).
    pub max_event_failures: u32,
    /// Serialized payload size at or under which CDC carries it inline.
    pub inline_payload_limit: usize,
    /// Pause between batches in shed+pause mode (T_PAUSE).
    pub shed_pause: Duration,
    /// Raw-store append attempts per batch before giving the batch back to
    /// pending-entry recovery.
    pub persist_retries: u32,
    /// Base backoff between raw-store append attempts.
    pub persist_backoff: Duration,
}

impl Default for FastPathConfig {
    fn default() -> Self {
        Self {
            group: "fastpath".to_string(),
            consumer_name: "fastpath-1".to_string(),
            batch_max: 100,
            batch_window: Duration::from_millis(100),
            poll_timeout: Duration::from_millis(100),
            cdc_timeout: Duration::from_secs(1),
            claim_interval: Duration::from_secs(30),
            stuck_after: Duration::from_secs(30),
            max_event_failures: 5,
            inline_payload_limit: 4096,
            shed_pause: Duration::from_secs(1),
            persist_retries: 5,
            persist_backoff: Duration::from_millis(100),
        }
    }
}
