//! Append-Only Stream with Consumer Groups
//!
//! The in-process equivalent of the message queue the capture agents write
//! to: an ordered log with monotonic entry ids, bounded retention, and
//! named consumer groups.
//!
//! ## Delivery Model
//!
//! - `append` assigns the next id and (for bounded streams) trims the oldest
//!   entries past `max_len`.
//! - `read_group` delivers each entry to exactly one consumer in the group
//!   and records it in the group's pending-entries list until acknowledged.
//! - `ack` removes entries from the pending list.
//! - `claim_stuck` re-delivers pending entries idle past a threshold to the
//!   calling consumer, incrementing their delivery count. This is how a
//!   surviving consumer takes over work from a dead one.
//!
//! Entries trimmed by retention while still pending stay claimable: the
//! pending list owns a copy of the entry.
//!
//! ## Durability
//!
//! Streams are memory-only by default; the raw store downstream is the
//! durability anchor. A stream opened with `open_journaled` (the dead-letter
//! stream) persists every append through a CRC-framed journal and replays it
//! on open.

use crate::entry::{ClaimedEntry, EntryId, StreamEntry};
use crate::error::Result;
use crate::journal::Journal;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

/// Stream configuration.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Stream name, used in logs and journal frames.
    pub name: String,
    /// Approximate retention bound; `None` means unbounded.
    pub max_len: Option<usize>,
}

struct Pending {
    entry: StreamEntry,
    delivered_at: Instant,
    delivery_count: u32,
    consumer: String,
}

#[derive(Default)]
struct Group {
    last_delivered: u64,
    pending: BTreeMap<u64, Pending>,
}

struct Inner {
    entries: VecDeque<StreamEntry>,
    next_id: u64,
    groups: HashMap<String, Group>,
    journal: Option<Journal>,
}

/// An append-only ordered log with consumer groups.
pub struct Stream {
    config: StreamConfig,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Stream {
    /// Create a memory-only stream.
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                entries: VecDeque::new(),
                next_id: 1,
                groups: HashMap::new(),
                journal: None,
            }),
            notify: Notify::new(),
        }
    }

    /// Open a journaled stream, replaying previously journaled entries.
    pub async fn open_journaled(config: StreamConfig, path: impl AsRef<Path>) -> Result<Self> {
        let (journal, recovered) = Journal::open(path).await?;
        let next_id = recovered.iter().map(|e| e.id.0).max().unwrap_or(0) + 1;
        Ok(Self {
            config,
            inner: Mutex::new(Inner {
                entries: recovered.into(),
                next_id,
                groups: HashMap::new(),
                journal: Some(journal),
            }),
            notify: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Append an entry, journaling it first when the stream is durable.
    pub async fn append(&self, fields: BTreeMap<String, String>) -> Result<EntryId> {
        let mut inner = self.inner.lock().await;
        let id = EntryId(inner.next_id);
        let entry = StreamEntry { id, fields };

        if let Some(journal) = inner.journal.as_mut() {
            journal.append(&entry).await?;
        }

        inner.next_id += 1;
        inner.entries.push_back(entry);

        if let Some(max_len) = self.config.max_len {
            while inner.entries.len() > max_len {
                inner.entries.pop_front();
            }
        }

        drop(inner);
        self.notify.notify_waiters();
        Ok(id)
    }

    /// Read up to `count` new entries for `consumer` in `group`, blocking up
    /// to `block` when the stream has nothing new. The group is created on
    /// first use.
    ///
    /// Delivered entries go onto the group's pending list until `ack`ed.
    pub async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        count: usize,
        block: Duration,
    ) -> Vec<StreamEntry> {
        let deadline = Instant::now() + block;
        loop {
            let notified = self.notify.notified();

            {
                let mut inner = self.inner.lock().await;
                let delivered = Self::deliver(&mut inner, group, consumer, count);
                if !delivered.is_empty() {
                    return delivered;
                }
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Vec::new();
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    fn deliver(inner: &mut Inner, group: &str, consumer: &str, count: usize) -> Vec<StreamEntry> {
        let first_id = match inner.entries.front() {
            Some(e) => e.id.0,
            None => return Vec::new(),
        };
        let group_state = inner.groups.entry(group.to_string()).or_default();

        let start_id = group_state.last_delivered.max(first_id - 1) + 1;
        let start_index = (start_id - first_id) as usize;
        if start_index >= inner.entries.len() {
            return Vec::new();
        }

        let now = Instant::now();
        let mut delivered = Vec::new();
        for entry in inner.entries.iter().skip(start_index).take(count) {
            group_state.pending.insert(
                entry.id.0,
                Pending {
                    entry: entry.clone(),
                    delivered_at: now,
                    delivery_count: 1,
                    consumer: consumer.to_string(),
                },
            );
            group_state.last_delivered = entry.id.0;
            delivered.push(entry.clone());
        }
        delivered
    }

    /// Acknowledge entries, removing them from the group's pending list.
    /// Returns how many were actually pending.
    pub async fn ack(&self, group: &str, ids: &[EntryId]) -> usize {
        let mut inner = self.inner.lock().await;
        let Some(group_state) = inner.groups.get_mut(group) else {
            return 0;
        };
        let mut acked = 0;
        for id in ids {
            if group_state.pending.remove(&id.0).is_some() {
                acked += 1;
            }
        }
        acked
    }

    /// Claim pending entries idle for at least `min_idle`, re-assigning them
    /// to `consumer` and bumping their delivery counts.
    pub async fn claim_stuck(
        &self,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        count: usize,
    ) -> Vec<ClaimedEntry> {
        let mut inner = self.inner.lock().await;
        let Some(group_state) = inner.groups.get_mut(group) else {
            return Vec::new();
        };

        let now = Instant::now();
        let mut claimed = Vec::new();
        let mut taken_over = 0usize;
        for pending in group_state.pending.values_mut() {
            if claimed.len() >= count {
                break;
            }
            if now.duration_since(pending.delivered_at) >= min_idle {
                pending.delivered_at = now;
                pending.delivery_count += 1;
                if pending.consumer != consumer {
                    taken_over += 1;
                    pending.consumer = consumer.to_string();
                }
                claimed.push(ClaimedEntry {
                    entry: pending.entry.clone(),
                    delivery_count: pending.delivery_count,
                });
            }
        }

        if !claimed.is_empty() {
            debug!(
                stream = %self.config.name,
                group,
                consumer,
                claimed = claimed.len(),
                taken_over,
                "claimed stuck entries"
            );
        }
        claimed
    }

    /// Entries delivered to the group but not yet acknowledged.
    pub async fn pending_depth(&self, group: &str) -> usize {
        let inner = self.inner.lock().await;
        inner
            .groups
            .get(group)
            .map(|g| g.pending.len())
            .unwrap_or(0)
    }

    /// Age of the oldest unacknowledged delivery in the group.
    pub async fn oldest_pending_age(&self, group: &str) -> Option<Duration> {
        let inner = self.inner.lock().await;
        let group_state = inner.groups.get(group)?;
        let now = Instant::now();
        group_state
            .pending
            .values()
            .map(|p| now.duration_since(p.delivered_at))
            .max()
    }

    /// Total backlog for a group: entries not yet delivered plus entries
    /// delivered but unacknowledged. This is the signal the depth monitor
    /// watches.
    pub async fn backlog(&self, group: &str) -> usize {
        let inner = self.inner.lock().await;
        let undelivered = match (inner.entries.front(), inner.entries.back()) {
            (Some(first), Some(last)) => {
                let last_delivered = inner
                    .groups
                    .get(group)
                    .map(|g| g.last_delivered)
                    .unwrap_or(0);
                let floor = last_delivered.max(first.id.0 - 1);
                (last.id.0.saturating_sub(floor)) as usize
            }
            _ => 0,
        };
        let pending = inner
            .groups
            .get(group)
            .map(|g| g.pending.len())
            .unwrap_or(0);
        undelivered + pending
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn last_id(&self) -> Option<EntryId> {
        self.inner.lock().await.entries.back().map(|e| e.id)
    }

    /// Copy of every retained entry, oldest first. Used by operator tooling
    /// and tests to drain the dead-letter stream.
    pub async fn snapshot(&self) -> Vec<StreamEntry> {
        self.inner.lock().await.entries.iter().cloned().collect()
    }
}
