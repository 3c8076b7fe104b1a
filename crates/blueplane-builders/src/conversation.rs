//! Conversation Builder
//!
//! Reconstructs sessions and prompt/response turns from CDC records.
//!
//! ## State Machine (per session)
//!
//! ```text
//!            SessionStart
//!   (none) ─────────────▶ OPEN ──────────────────────────┐
//!                          │  UserPrompt                  │
//!                          ▼                              │
//!                       TURN_OPEN ── tool events ──▶ TURN_OPEN
//!                          │  AssistantResponse           │
//!                          ▼                              │
//!                       TURN_CLOSED ── UserPrompt ──▶ TURN_OPEN
//!                          │  SessionEnd                  │
//!                          ▼                              │
//!                        CLOSED ◀─────────────────────────┘
//! ```
//!
//! Rules the tests pin down:
//! - any event before `SessionStart` implicitly creates the session open;
//!   a later `SessionStart` is absorbed without resetting anything
//! - a new `UserPrompt` while a turn is open force-closes the prior turn as
//!   incomplete, stamped with the prompt's `enqueued_at`
//! - events targeting a closed session reopen it (silent-failure agents
//!   reconnecting)
//! - `accepted` is inferred from `FileEdit` accept/reject operations after
//!   the response; absence keeps it `unknown`
//! - turns within a session are ordered by `started_at`: prompts that reach
//!   the builder behind the turn sequence (workers finish concurrently) are
//!   admitted at the session's turn watermark, and closes never precede the
//!   turn's start
//!
//! ## Concurrency and Idempotence
//!
//! Updates for one session are serialized through a session-keyed lock;
//! distinct sessions proceed in parallel. The lock gives mutual exclusion,
//! not delivery-order completion, which is why the watermark rule above is
//! enforced here rather than assumed from upstream. The store applies each
//! event's mutations transactionally behind the `applied_events` dedup
//! index, so re-applying a CDC record leaves the store byte-equivalent.

use crate::locks::SessionLockMap;
use async_trait::async_trait;
use blueplane_core::{CdcRecord, EventType, Payload};
use blueplane_storage::{
    Accepted, ConversationStore, SessionRow, SessionStatus, ToolUse, TurnRow,
};
use blueplane_workers::{BuildError, BuildResult, Builder};
use std::sync::Arc;
use tracing::debug;

pub struct ConversationBuilder {
    store: Arc<dyn ConversationStore>,
    locks: SessionLockMap,
}

impl ConversationBuilder {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self {
            store,
            locks: SessionLockMap::new(),
        }
    }

    fn classify(e: blueplane_storage::Error) -> BuildError {
        if e.is_transient() {
            BuildError::transient("io", e.to_string())
        } else {
            BuildError::permanent("storage", e.to_string())
        }
    }
}

#[async_trait]
impl Builder for ConversationBuilder {
    fn id(&self) -> &'static str {
        blueplane_core::stage::CONVERSATION_BUILDER
    }

    async fn apply(&self, record: &CdcRecord, payload: &Payload) -> BuildResult {
        let session_key = record.session_key();
        let _guard = self.locks.acquire(session_key.as_str()).await;

        let existing = self
            .store
            .session(&session_key)
            .await
            .map_err(Self::classify)?;
        let latest = self
            .store
            .latest_turn(&session_key)
            .await
            .map_err(Self::classify)?;

        let at = record.enqueued_at;
        let mut session = existing.unwrap_or_else(|| SessionRow {
            session_key: session_key.clone(),
            platform: record.platform.clone(),
            external_session_id: record.external_session_id.clone(),
            workspace_hash: record.workspace_hash.clone(),
            first_seen_at: at,
            last_seen_at: at,
            status: SessionStatus::Open,
        });
        session.last_seen_at = session.last_seen_at.max(at);
        if session.workspace_hash.is_none() {
            session.workspace_hash = record.workspace_hash.clone();
        }
        // Events after SessionEnd reopen the session; reconnecting agents
        // are indistinguishable from silently-failed ones.
        if session.status == SessionStatus::Closed && record.event_type != EventType::SessionEnd {
            session.status = SessionStatus::Open;
        }

        let mut turns: Vec<TurnRow> = Vec::new();
        match &record.event_type {
            EventType::SessionStart => {
                // Absorbed: implicit creation above already covers it.
            }
            EventType::SessionEnd => {
                session.status = SessionStatus::Closed;
                if let Some(mut turn) = latest.filter(TurnRow::is_open) {
                    // A close never precedes the turn's start.
                    turn.completed_at = Some(at.max(turn.started_at));
                    turns.push(turn);
                }
            }
            EventType::UserPrompt => {
                let next_turn_id = latest.as_ref().map(|t| t.turn_id + 1).unwrap_or(1);
                // Workers complete concurrently, so a prompt can reach the
                // builder behind the turn sequence it extends. Turn starts
                // are admitted at the session's turn watermark: started_at
                // is non-decreasing in turn_id order regardless of arrival
                // order.
                let started_at = latest.as_ref().map_or(at, |t| at.max(t.started_at));
                if let Some(mut prior) = latest.filter(TurnRow::is_open) {
                    // Force-close the prior turn as incomplete.
                    prior.completed_at = Some(started_at);
                    turns.push(prior);
                }
                turns.push(TurnRow {
                    session_key: session_key.clone(),
                    turn_id: next_turn_id,
                    prompt_event_id: record.event_id.clone(),
                    response_event_id: None,
                    started_at,
                    completed_at: None,
                    accepted: Accepted::Unknown,
                    tool_uses: Vec::new(),
                });
            }
            EventType::AssistantResponse => {
                match latest.filter(TurnRow::is_open) {
                    Some(mut turn) => {
                        turn.response_event_id = Some(record.event_id.clone());
                        turn.completed_at = Some(at.max(turn.started_at));
                        turns.push(turn);
                    }
                    None => {
                        debug!(
                            session = %session_key,
                            event_id = %record.event_id,
                            "response without an open turn, ignoring"
                        );
                    }
                }
            }
            EventType::ToolPre | EventType::ToolPost => {
                if let Some(mut turn) = latest.filter(TurnRow::is_open) {
                    turn.tool_uses.push(ToolUse {
                        event_id: record.event_id.clone(),
                        tool_name: payload.str_field("tool_name").map(str::to_string),
                        at,
                    });
                    turns.push(turn);
                }
            }
            EventType::FileEdit => {
                let signal = match payload.str_field("operation") {
                    Some("accepted") => Some(Accepted::Accepted),
                    Some("rejected") => Some(Accepted::Rejected),
                    _ => None,
                };
                if let Some(signal) = signal {
                    if let Some(mut turn) = latest.filter(|t| t.accepted == Accepted::Unknown) {
                        turn.accepted = signal;
                        turns.push(turn);
                    }
                }
            }
            // Unknown event types only refresh session liveness.
            _ => {}
        }

        self.store
            .apply_update(&record.event_id, &session, &turns)
            .await
            .map_err(Self::classify)?;
        Ok(())
    }
}
