//! Fast-Path Consumer and Batch Writer
//!
//! Drains the ingress stream with at-least-once semantics, micro-batches
//! events, compresses and persists them, publishes CDC, and only then
//! acknowledges ingress. Never blocks producers; never loses durability
//! once it acknowledges.
//!
//! ## Batch Lifecycle
//!
//! ```text
//! read_group(B_MAX, T_POLL)          ← blocks briefly when idle
//!     ↓ first non-empty read
//! accumulate until B_MAX | T_BATCH | cancellation
//!     ↓
//! commit protocol:
//!   1. persist   → raw store transaction, whole batch or nothing
//!   2. publish   → one CDC record per event, fire-and-forget with bound;
//!                  failures land in the cdc_unpublished fallback table
//!   3. ack       → ingress consumer-group acknowledgement
//! ```
//!
//! Step ordering is what makes the chain of custody hold: raw durability is
//! the anchor, CDC is a derivable projection, and an ack is only ever issued
//! after step 1 succeeded.
//!
//! ## Failure Handling
//!
//! - Persist failures retry the batch in full with backoff; if the store
//!   stays down the entries remain pending and pending-entry recovery picks
//!   them up later. Nothing is acknowledged.
//! - Per-event deserialization/validation failures are poison candidates:
//!   after R_MAX observations the entry goes to the DLQ and is acknowledged
//!   so the group makes progress. This is the only path that drops an event
//!   without persisting it.
//! - Only an `InvariantViolation` escapes `run`; everything else is
//!   swallowed, logged, and counted.
//!
//! ## Shed Mode
//!
//! Between batches the consumer observes the depth monitor's shed level:
//! shed halves B_MAX and doubles T_BATCH; shed+pause additionally sleeps
//! T_PAUSE between batches. Producers are unaffected.

use crate::config::FastPathConfig;
use crate::counters::FastPathCounters;
use crate::error::{Error, Result};
use blueplane_core::{stage, CdcRecord, DlqRecord, Event, EventId, ShedLevel};
use blueplane_storage::{CustodyLedger, RawStore};
use blueplane_stream::{EntryId, StreamEntry, StreamHub};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// One ingress entry flowing through the commit protocol, with how many
/// times the group has delivered it.
struct Delivery {
    entry: StreamEntry,
    delivery_count: u32,
}

pub struct FastPathConsumer {
    streams: Arc<StreamHub>,
    raw: Arc<dyn RawStore>,
    custody: CustodyLedger,
    counters: Arc<FastPathCounters>,
    config: FastPathConfig,
    shed: watch::Receiver<ShedLevel>,
}

impl FastPathConsumer {
    pub fn new(
        streams: Arc<StreamHub>,
        raw: Arc<dyn RawStore>,
        custody: CustodyLedger,
        config: FastPathConfig,
        shed: watch::Receiver<ShedLevel>,
    ) -> Self {
        Self {
            streams,
            raw,
            custody,
            counters: Arc::new(FastPathCounters::default()),
            config,
            shed,
        }
    }

    pub fn counters(&self) -> Arc<FastPathCounters> {
        Arc::clone(&self.counters)
    }

    /// Long-running consume loop. Returns on cancellation, or with an error
    /// only for invariant violations (the supervisor restarts the process
    /// and pending-entry recovery takes over).
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        info!(
            group = %self.config.group,
            consumer = %self.config.consumer_name,
            batch_max = self.config.batch_max,
            "fast path started"
        );

        // Claim immediately on startup, then on the configured cadence.
        let mut failures: HashMap<String, u32> = HashMap::new();
        let mut last_claim: Option<Instant> = None;

        loop {
            if cancel.is_cancelled() {
                break;
            }

            if last_claim.map_or(true, |at| at.elapsed() >= self.config.claim_interval) {
                last_claim = Some(Instant::now());
                self.recover_stuck(&mut failures).await?;
            }

            let shed = *self.shed.borrow();
            let batch_max = shed.adjusted_batch_max(self.config.batch_max);
            let batch_window = shed.adjusted_batch_window(self.config.batch_window);

            let first = tokio::select! {
                _ = cancel.cancelled() => break,
                entries = self.streams.ingress.read_group(
                    &self.config.group,
                    &self.config.consumer_name,
                    batch_max,
                    self.config.poll_timeout,
                ) => entries,
            };
            if first.is_empty() {
                continue;
            }

            // The batch opened on first receipt; keep filling until size,
            // window, or cancellation closes it.
            let opened = Instant::now();
            let mut batch: Vec<Delivery> = first
                .into_iter()
                .map(|entry| Delivery {
                    entry,
                    delivery_count: 1,
                })
                .collect();
            while batch.len() < batch_max && !cancel.is_cancelled() {
                let remaining = batch_window.saturating_sub(opened.elapsed());
                if remaining.is_zero() {
                    break;
                }
                let more = self
                    .streams
                    .ingress
                    .read_group(
                        &self.config.group,
                        &self.config.consumer_name,
                        batch_max - batch.len(),
                        remaining.min(self.config.poll_timeout),
                    )
                    .await;
                batch.extend(more.into_iter().map(|entry| Delivery {
                    entry,
                    delivery_count: 1,
                }));
            }

            self.commit(batch, &mut failures).await?;

            if shed.pauses() {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.shed_pause) => {}
                }
            }
        }

        info!("fast path stopped");
        Ok(())
    }

    /// Claim ingress entries stuck in other consumers' pending lists and run
    /// them through the normal commit protocol.
    async fn recover_stuck(&self, failures: &mut HashMap<String, u32>) -> Result<()> {
        let claimed = self
            .streams
            .ingress
            .claim_stuck(
                &self.config.group,
                &self.config.consumer_name,
                self.config.stuck_after,
                self.config.batch_max,
            )
            .await;
        if claimed.is_empty() {
            return Ok(());
        }
        info!(claimed = claimed.len(), "recovered stuck ingress entries");
        let batch = claimed
            .into_iter()
            .map(|c| Delivery {
                entry: c.entry,
                delivery_count: c.delivery_count,
            })
            .collect();
        self.commit(batch, failures).await
    }

    /// The three-step commit protocol for one closed batch.
    async fn commit(&self, batch: Vec<Delivery>, failures: &mut HashMap<String, u32>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        self.counters.add_events_read(batch.len() as u64);

        // Chain-of-custody counts each entry at first observation only, so
        // retries and claims do not inflate the ingress side.
        let first_observations = batch.iter().filter(|d| d.delivery_count == 1).count();
        if let Err(e) = self
            .custody
            .ingress_enqueued(first_observations as u64, Utc::now())
            .await
        {
            warn!(error = %e, "custody ingress count failed");
        }

        let mut events: Vec<Event> = Vec::with_capacity(batch.len());
        let mut entry_ids: Vec<EntryId> = Vec::with_capacity(batch.len());
        for delivery in batch {
            let parsed = Event::from_fields(&delivery.entry.fields)
                .and_then(|event| event.validate().map(|_| event));
            match parsed {
                Ok(event) => {
                    events.push(event);
                    entry_ids.push(delivery.entry.id);
                }
                Err(err) => self.poison_candidate(delivery, &err, failures).await,
            }
        }
        if events.is_empty() {
            return Ok(());
        }

        // Step 1: persist. Retried in full; the whole batch stays pending if
        // the store stays down.
        let batch_id = {
            let mut attempt: u32 = 0;
            loop {
                match self.raw.append(&events).await {
                    Ok(batch_id) => break batch_id,
                    Err(e @ blueplane_storage::Error::InvariantViolation(_)) => {
                        error!(error = %e, "raw store invariant violated, failing fast");
                        return Err(Error::Invariant(e.to_string()));
                    }
                    Err(e) => {
                        attempt += 1;
                        if attempt >= self.config.persist_retries {
                            self.counters.incr_batches_failed();
                            warn!(
                                error = %e,
                                events = events.len(),
                                "batch persist failed, leaving entries pending"
                            );
                            return Ok(());
                        }
                        let backoff = self.config.persist_backoff * attempt;
                        warn!(error = %e, attempt, backoff_ms = backoff.as_millis() as u64, "batch persist retrying");
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        };
        if let Err(e) = self.custody.raw_persisted(events.len() as u64, Utc::now()).await {
            warn!(error = %e, "custody persisted count failed");
        }

        // Step 2: publish CDC, fire-and-forget with a bound. Failures go to
        // the fallback table for the sweeper; they never block the ack.
        let mut published: u64 = 0;
        for (index, event) in events.iter().enumerate() {
            let record = CdcRecord::for_event(
                event,
                batch_id,
                index as u32,
                self.config.inline_payload_limit,
            );
            let append = tokio::time::timeout(
                self.config.cdc_timeout,
                self.streams.cdc.append(record.to_fields()),
            )
            .await;
            match append {
                Ok(Ok(_)) => published += 1,
                slow_or_failed => {
                    if let Ok(Err(e)) = slow_or_failed {
                        warn!(error = %e, batch_id = %batch_id, index, "cdc append failed");
                    } else {
                        warn!(batch_id = %batch_id, index, "cdc append timed out");
                    }
                    if let Err(e) = self.raw.record_unpublished(batch_id, index as u32).await {
                        warn!(error = %e, batch_id = %batch_id, index, "recording unpublished cdc failed");
                    }
                }
            }
        }
        self.counters.add_cdc_published(published);
        if let Err(e) = self.custody.cdc_published(published, Utc::now()).await {
            warn!(error = %e, "custody cdc count failed");
        }

        // Step 3: acknowledge. A shortfall means another consumer claimed
        // some entries meanwhile; redelivery is harmless because the
        // builders are idempotent.
        let acked = self
            .streams
            .ingress
            .ack(&self.config.group, &entry_ids)
            .await;
        if acked != entry_ids.len() {
            self.counters.incr_ack_failed();
            warn!(
                expected = entry_ids.len(),
                acked, "ingress ack incomplete"
            );
        }

        self.counters.incr_batches_committed();
        for event in &events {
            failures.remove(event.event_id.as_str());
        }
        debug!(batch_id = %batch_id, events = events.len(), published, "batch committed");
        Ok(())
    }

    /// Track a per-event commit failure; after R_MAX observations the entry
    /// is deadlettered and acknowledged so the group makes progress.
    async fn poison_candidate(
        &self,
        delivery: Delivery,
        err: &blueplane_core::Error,
        failures: &mut HashMap<String, u32>,
    ) {
        let fields = &delivery.entry.fields;
        let key = fields
            .get("event_id")
            .cloned()
            .unwrap_or_else(|| format!("entry:{}", delivery.entry.id));

        let local = failures.entry(key.clone()).or_insert(0);
        *local += 1;
        // Cross-process redeliveries arrive with a delivery count from the
        // pending list; take whichever has seen more.
        let observed = (*local).max(delivery.delivery_count);

        if observed < self.config.max_event_failures {
            debug!(
                event_id = %key,
                observed,
                error = %err,
                "commit failure, leaving entry for redelivery"
            );
            return;
        }

        let record = DlqRecord {
            event_id: EventId::from_raw(
                fields.get("event_id").cloned().unwrap_or_else(|| key.clone()),
            ),
            platform: fields.get("platform").cloned().unwrap_or_default(),
            external_session_id: fields
                .get("external_session_id")
                .cloned()
                .unwrap_or_default(),
            payload_json: fields.get("payload").cloned().unwrap_or_else(|| "{}".to_string()),
            stage: stage::FAST_PATH.to_string(),
            error_kind: "schema".to_string(),
            error_message: err.to_string(),
            recorded_at: Utc::now(),
        };

        match self.streams.dlq.append(record.to_fields()).await {
            Ok(_) => {
                self.counters.incr_dlq_written();
                if let Err(e) = self.custody.deadlettered(stage::FAST_PATH, 1, Utc::now()).await {
                    warn!(error = %e, "custody dlq count failed");
                }
                self.streams
                    .ingress
                    .ack(&self.config.group, &[delivery.entry.id])
                    .await;
                failures.remove(&key);
                warn!(event_id = %key, error = %err, "poison event deadlettered");
            }
            Err(e) => {
                // DLQ journal unavailable; keep the entry pending and try
                // again on the next redelivery.
                warn!(event_id = %key, error = %e, "dlq append failed, entry stays pending");
            }
        }
    }
}

/// Helper for tests and synthetic producers: enqueue an event onto ingress.
pub async fn enqueue_event(
    streams: &StreamHub,
    event: &Event,
) -> std::result::Result<EntryId, blueplane_stream::Error> {
    streams.ingress.append(event.to_fields()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use blueplane_core::{EventType, Payload, PayloadRef};
    use blueplane_storage::{MetricsStore, SqliteMetricsStore, SqliteRawStore};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn test_config() -> FastPathConfig {
        FastPathConfig {
            batch_window: Duration::from_millis(20),
            poll_timeout: Duration::from_millis(10),
            claim_interval: Duration::from_millis(50),
            stuck_after: Duration::from_millis(40),
            persist_backoff: Duration::from_millis(5),
            ..Default::default()
        }
    }

    async fn fixture() -> (Arc<StreamHub>, Arc<SqliteRawStore>, FastPathConsumer) {
        fixture_with_config(test_config()).await
    }

    async fn fixture_with_config(
        config: FastPathConfig,
    ) -> (Arc<StreamHub>, Arc<SqliteRawStore>, FastPathConsumer) {
        let streams = Arc::new(StreamHub::in_memory());
        let raw = Arc::new(SqliteRawStore::open_in_memory().await.unwrap());
        let metrics: Arc<dyn MetricsStore> =
            Arc::new(SqliteMetricsStore::open_in_memory().await.unwrap());
        let custody = CustodyLedger::new(metrics);
        let (_tx, rx) = watch::channel(ShedLevel::Normal);
        let consumer = FastPathConsumer::new(
            Arc::clone(&streams),
            Arc::clone(&raw) as Arc<dyn RawStore>,
            custody,
            config,
            rx,
        );
        (streams, raw, consumer)
    }

    fn valid_event(session: &str) -> Event {
        Event::new(
            "claude_code",
            session,
            EventType::UserPrompt,
            Payload::new().with("prompt_length", 12u64),
        )
    }

    async fn run_briefly(consumer: &FastPathConsumer, millis: u64) {
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            stop.cancel();
        });
        consumer.run(cancel).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_persists_publishes_and_acks() {
        let (streams, raw, consumer) = fixture().await;
        for i in 0..3 {
            enqueue_event(&streams, &valid_event(&format!("s-{i}")))
                .await
                .unwrap();
        }

        run_briefly(&consumer, 120).await;

        assert_eq!(raw.batch_count().await.unwrap(), 1);
        assert_eq!(streams.cdc.len().await, 3);
        assert_eq!(streams.ingress.pending_depth("fastpath").await, 0);

        let stats = consumer.counters().snapshot();
        assert_eq!(stats.events_read, 3);
        assert_eq!(stats.batches_committed, 1);
        assert_eq!(stats.cdc_published, 3);
        assert_eq!(stats.dlq_written, 0);
    }

    #[tokio::test]
    async fn test_batch_respects_batch_max() {
        let config = FastPathConfig {
            batch_max: 2,
            ..test_config()
        };
        let (streams, raw, consumer) = fixture_with_config(config).await;
        for _ in 0..5 {
            enqueue_event(&streams, &valid_event("s-1")).await.unwrap();
        }

        run_briefly(&consumer, 150).await;

        // 5 events in batches of at most 2: at least 3 batches.
        assert!(raw.batch_count().await.unwrap() >= 3);
        assert_eq!(streams.cdc.len().await, 5);
    }

    #[tokio::test]
    async fn test_cdc_records_resolvable() {
        let (streams, raw, consumer) = fixture().await;
        let event = valid_event("s-1");
        enqueue_event(&streams, &event).await.unwrap();

        run_briefly(&consumer, 120).await;

        let cdc_entries = streams.cdc.snapshot().await;
        assert_eq!(cdc_entries.len(), 1);
        let record = CdcRecord::from_fields(&cdc_entries[0].fields).unwrap();
        assert_eq!(record.event_id, event.event_id);
        match record.payload_ref {
            PayloadRef::Inline { payload } => {
                assert_eq!(payload.u64_field("prompt_length"), Some(12))
            }
            PayloadRef::Stored { .. } => panic!("small payload should be inline"),
        }
        // The batch it points to is readable.
        let batch = raw.read(record.batch_id).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_oversize_payload_goes_by_reference() {
        let config = FastPathConfig {
            inline_payload_limit: 64,
            ..test_config()
        };
        let (streams, raw, consumer) = fixture_with_config(config).await;
        let mut event = valid_event("s-1");
        event
            .payload
            .insert("transcript_digest", "x".repeat(500));
        enqueue_event(&streams, &event).await.unwrap();

        run_briefly(&consumer, 120).await;

        let cdc_entries = streams.cdc.snapshot().await;
        let record = CdcRecord::from_fields(&cdc_entries[0].fields).unwrap();
        let PayloadRef::Stored { batch_id, index } = record.payload_ref else {
            panic!("oversize payload should be stored by reference");
        };
        let batch = raw.read(batch_id).await.unwrap();
        assert_eq!(
            batch[index as usize].payload.str_field("transcript_digest"),
            Some("x".repeat(500).as_str())
        );
    }

    #[tokio::test]
    async fn test_poison_event_deadlettered_and_acked() {
        let config = FastPathConfig {
            max_event_failures: 2,
            ..test_config()
        };
        let (streams, raw, consumer) = fixture_with_config(config).await;

        // Schema-invalid: UserPrompt without prompt_length.
        let mut bad = Event::new("claude_code", "s-1", EventType::UserPrompt, Payload::new());
        bad.payload = Payload::new();
        enqueue_event(&streams, &bad).await.unwrap();

        // Long enough for claim cycles to re-observe it past R_MAX.
        run_briefly(&consumer, 400).await;

        assert_eq!(raw.batch_count().await.unwrap(), 0);
        assert_eq!(streams.dlq.len().await, 1);
        assert_eq!(streams.ingress.pending_depth("fastpath").await, 0);

        let dlq = streams.dlq.snapshot().await;
        let record = DlqRecord::from_fields(&dlq[0].fields).unwrap();
        assert_eq!(record.stage, stage::FAST_PATH);
        assert_eq!(record.event_id, bad.event_id);
        assert_eq!(consumer.counters().snapshot().dlq_written, 1);
    }

    #[tokio::test]
    async fn test_malformed_entry_deadlettered() {
        let config = FastPathConfig {
            max_event_failures: 1,
            ..test_config()
        };
        let (streams, _raw, consumer) = fixture_with_config(config).await;

        let mut fields = BTreeMap::new();
        fields.insert("garbage".to_string(), "1".to_string());
        streams.ingress.append(fields).await.unwrap();

        run_briefly(&consumer, 150).await;

        assert_eq!(streams.dlq.len().await, 1);
        assert_eq!(streams.ingress.pending_depth("fastpath").await, 0);
    }

    #[tokio::test]
    async fn test_poison_does_not_block_valid_events() {
        let config = FastPathConfig {
            max_event_failures: 1,
            ..test_config()
        };
        let (streams, raw, consumer) = fixture_with_config(config).await;

        let mut bad = Event::new("claude_code", "s-1", EventType::UserPrompt, Payload::new());
        bad.payload = Payload::new();
        enqueue_event(&streams, &bad).await.unwrap();
        enqueue_event(&streams, &valid_event("s-2")).await.unwrap();

        run_briefly(&consumer, 150).await;

        assert_eq!(raw.batch_count().await.unwrap(), 1);
        assert_eq!(streams.dlq.len().await, 1);
        assert_eq!(streams.cdc.len().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_events_both_persisted() {
        // The fast path does not deduplicate; derived stores do.
        let (streams, raw, consumer) = fixture().await;
        let event = valid_event("s-1");
        enqueue_event(&streams, &event).await.unwrap();
        run_briefly(&consumer, 100).await;
        enqueue_event(&streams, &event).await.unwrap();
        run_briefly(&consumer, 100).await;

        assert_eq!(raw.batch_count().await.unwrap(), 2);
        assert_eq!(streams.cdc.len().await, 2);
    }

    #[tokio::test]
    async fn test_stuck_entries_reclaimed() {
        let (streams, raw, consumer) = fixture().await;

        // Simulate a dead consumer in the same group holding two entries.
        enqueue_event(&streams, &valid_event("s-1")).await.unwrap();
        enqueue_event(&streams, &valid_event("s-1")).await.unwrap();
        let stolen = streams
            .ingress
            .read_group("fastpath", "dead-consumer", 10, Duration::ZERO)
            .await;
        assert_eq!(stolen.len(), 2);

        // stuck_after=40ms, claim_interval=50ms: reclaim within 2x T_STUCK.
        run_briefly(&consumer, 200).await;

        assert_eq!(raw.batch_count().await.unwrap(), 1);
        assert_eq!(streams.ingress.pending_depth("fastpath").await, 0);
        assert_eq!(streams.cdc.len().await, 2);
    }
}
