//! Worker Pool
//!
//! Fixed-size pool of CDC consumers driving the derived-state builders.
//!
//! ## Dispatch
//!
//! Each worker reads one CDC record at a time, resolves the payload
//! (inline, or back through the raw store for by-reference payloads),
//! dispatches to every registered builder in order, and acknowledges only
//! after all builders returned success. Transient failures retry with
//! jittered exponential backoff; exhausted or permanent failures ship the
//! record to the DLQ with the failing builder as the stage, then
//! acknowledge so the group keeps moving.
//!
//! ## Shutdown
//!
//! On cancellation each worker finishes the record in flight and exits.
//! Unacknowledged records are reclaimed by a surviving worker (or a future
//! process) through the same pending-entry recovery the fast path uses.

use crate::builder::{BuildError, Builder};
use crate::retry::RetryPolicy;
use blueplane_core::{CdcRecord, DlqRecord, Payload, PayloadRef};
use blueplane_storage::{CustodyLedger, RawStore};
use blueplane_stream::{EntryId, StreamEntry, StreamHub};
use chrono::Utc;
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// CDC consumer group name.
    pub group: String,
    /// Number of worker tasks (N_WORKERS).
    pub workers: usize,
    /// Block timeout on empty CDC reads.
    pub poll_timeout: Duration,
    /// How often each worker claims stuck CDC entries.
    pub claim_interval: Duration,
    /// Pending age beyond which a CDC entry counts as stuck.
    pub stuck_after: Duration,
    /// Transient-failure retry policy.
    pub retry: RetryPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            group: "workers".to_string(),
            workers: 4,
            poll_timeout: Duration::from_millis(100),
            claim_interval: Duration::from_secs(30),
            stuck_after: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PoolCounters {
    records_processed: AtomicU64,
    records_retried: AtomicU64,
    records_deadlettered: AtomicU64,
    records_malformed: AtomicU64,
}

/// Point-in-time copy of the pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub records_processed: u64,
    pub records_retried: u64,
    pub records_deadlettered: u64,
    pub records_malformed: u64,
}

impl PoolCounters {
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            records_processed: self.records_processed.load(Ordering::Relaxed),
            records_retried: self.records_retried.load(Ordering::Relaxed),
            records_deadlettered: self.records_deadlettered.load(Ordering::Relaxed),
            records_malformed: self.records_malformed.load(Ordering::Relaxed),
        }
    }
}

pub struct WorkerPool {
    streams: Arc<StreamHub>,
    raw: Arc<dyn RawStore>,
    builders: Vec<Arc<dyn Builder>>,
    custody: CustodyLedger,
    config: WorkerPoolConfig,
    counters: Arc<PoolCounters>,
}

impl WorkerPool {
    pub fn new(
        streams: Arc<StreamHub>,
        raw: Arc<dyn RawStore>,
        builders: Vec<Arc<dyn Builder>>,
        custody: CustodyLedger,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            streams,
            raw,
            builders,
            custody,
            config,
            counters: Arc::new(PoolCounters::default()),
        }
    }

    pub fn counters(&self) -> Arc<PoolCounters> {
        Arc::clone(&self.counters)
    }

    /// Spawn the worker tasks and run until cancellation.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(workers = self.config.workers, "worker pool started");
        let handles: Vec<_> = (0..self.config.workers)
            .map(|index| {
                let pool = Arc::clone(&self);
                let cancel = cancel.clone();
                let name = format!("worker-{index}");
                tokio::spawn(async move { pool.worker_loop(name, cancel).await })
            })
            .collect();
        join_all(handles).await;
        info!("worker pool stopped");
    }

    async fn worker_loop(&self, name: String, cancel: CancellationToken) {
        let mut last_claim = Instant::now();
        loop {
            if cancel.is_cancelled() {
                break;
            }

            if last_claim.elapsed() >= self.config.claim_interval {
                last_claim = Instant::now();
                let claimed = self
                    .streams
                    .cdc
                    .claim_stuck(&self.config.group, &name, self.config.stuck_after, 16)
                    .await;
                for claimed_entry in claimed {
                    self.process_entry(&name, claimed_entry.entry).await;
                }
            }

            let entries = tokio::select! {
                _ = cancel.cancelled() => break,
                entries = self.streams.cdc.read_group(
                    &self.config.group,
                    &name,
                    1,
                    self.config.poll_timeout,
                ) => entries,
            };

            // Finish the record in flight even if cancellation arrives
            // mid-dispatch; the ack below is what makes shutdown clean.
            for entry in entries {
                self.process_entry(&name, entry).await;
            }
        }
        debug!(worker = %name, "worker exited");
    }

    async fn process_entry(&self, worker: &str, entry: StreamEntry) {
        let record = match CdcRecord::from_fields(&entry.fields) {
            Ok(record) => record,
            Err(err) => {
                // The fast path produced this entry, so a parse failure is a
                // bug, not an event problem; dropping it is the only move
                // that keeps the group making progress.
                warn!(worker, entry = %entry.id, error = %err, "malformed cdc entry, dropping");
                self.counters.records_malformed.fetch_add(1, Ordering::Relaxed);
                self.ack(entry.id).await;
                return;
            }
        };

        let payload = match self.resolve_payload(&record).await {
            Ok(payload) => payload,
            Err(err) => {
                self.deadletter(&record, self.builders.first().map(|b| b.id()), &err)
                    .await;
                self.ack(entry.id).await;
                return;
            }
        };

        for builder in &self.builders {
            if let Err(err) = self.dispatch(builder.as_ref(), &record, &payload).await {
                self.deadletter(&record, Some(builder.id()), &err).await;
                self.ack(entry.id).await;
                return;
            }
        }

        self.ack(entry.id).await;
        self.counters.records_processed.fetch_add(1, Ordering::Relaxed);
        debug!(worker, event_id = %record.event_id, "cdc record applied");
    }

    /// Run one builder with the transient retry policy. Returns the final
    /// error after classification and budget are exhausted.
    async fn dispatch(
        &self,
        builder: &dyn Builder,
        record: &CdcRecord,
        payload: &Payload,
    ) -> Result<(), BuildError> {
        let mut attempt: u32 = 0;
        loop {
            match builder.apply(record, payload).await {
                Ok(()) => {
                    if let Err(e) = self.custody.derived_applied(builder.id(), 1, Utc::now()).await
                    {
                        warn!(error = %e, builder = builder.id(), "custody derived count failed");
                    }
                    return Ok(());
                }
                Err(err) if err.is_transient() && attempt + 1 < self.config.retry.max_attempts => {
                    self.counters.records_retried.fetch_add(1, Ordering::Relaxed);
                    let backoff = self.config.retry.jittered_backoff(attempt);
                    debug!(
                        builder = builder.id(),
                        event_id = %record.event_id,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "transient builder failure, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Resolve the record's payload, reading through the raw store for
    /// by-reference payloads. A missing batch is transient (a commit may be
    /// in flight across a restart race) until the retry budget runs out.
    async fn resolve_payload(&self, record: &CdcRecord) -> Result<Payload, BuildError> {
        let (batch_id, index) = match &record.payload_ref {
            PayloadRef::Inline { payload } => return Ok(payload.clone()),
            PayloadRef::Stored { batch_id, index } => (*batch_id, *index),
        };

        let mut attempt: u32 = 0;
        loop {
            match self.raw.read(batch_id).await {
                Ok(events) => {
                    return events.get(index as usize).map(|e| e.payload.clone()).ok_or_else(
                        || {
                            BuildError::permanent(
                                "referential",
                                format!("batch {batch_id} has no event at index {index}"),
                            )
                        },
                    )
                }
                Err(e) if e.is_transient() && attempt + 1 < self.config.retry.max_attempts => {
                    self.counters.records_retried.fetch_add(1, Ordering::Relaxed);
                    let backoff = self.config.retry.jittered_backoff(attempt);
                    debug!(
                        batch_id = %batch_id,
                        attempt,
                        error = %e,
                        "payload reference unresolved, backing off"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(BuildError::permanent(
                        "referential",
                        format!("batch {batch_id} unreadable: {e}"),
                    ))
                }
            }
        }
    }

    async fn deadletter(&self, record: &CdcRecord, stage: Option<&str>, err: &BuildError) {
        let stage = stage.unwrap_or("worker_pool").to_string();
        let payload_json = match &record.payload_ref {
            PayloadRef::Inline { payload } => payload.to_json(),
            PayloadRef::Stored { batch_id, index } => {
                format!(r#"{{"payload_ref":{{"batch_id":{},"index":{}}}}}"#, batch_id.0, index)
            }
        };
        let dlq_record = DlqRecord {
            event_id: record.event_id.clone(),
            platform: record.platform.clone(),
            external_session_id: record.external_session_id.clone(),
            payload_json,
            stage: stage.clone(),
            error_kind: err.kind().to_string(),
            error_message: err.message().to_string(),
            recorded_at: Utc::now(),
        };

        match self.streams.dlq.append(dlq_record.to_fields()).await {
            Ok(_) => {
                self.counters.records_deadlettered.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.custody.deadlettered(&stage, 1, Utc::now()).await {
                    warn!(error = %e, "custody dlq count failed");
                }
                warn!(
                    event_id = %record.event_id,
                    stage = %stage,
                    error = %err,
                    "record deadlettered"
                );
            }
            Err(e) => {
                warn!(event_id = %record.event_id, error = %e, "dlq append failed");
            }
        }
    }

    async fn ack(&self, id: EntryId) {
        self.streams.cdc.ack(&self.config.group, &[id]).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::BuildResult;
    use async_trait::async_trait;
    use blueplane_core::{Event, EventType, Payload};
    use blueplane_storage::{MetricsStore, SqliteMetricsStore, SqliteRawStore};
    use std::sync::Mutex;

    /// Builder that records what it saw and fails on command.
    struct ScriptedBuilder {
        name: &'static str,
        applied: Mutex<Vec<String>>,
        failures: Mutex<Vec<BuildError>>,
    }

    impl ScriptedBuilder {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                applied: Mutex::new(Vec::new()),
                failures: Mutex::new(Vec::new()),
            })
        }

        fn fail_next(&self, errors: Vec<BuildError>) {
            *self.failures.lock().unwrap() = errors;
        }

        fn applied(&self) -> Vec<String> {
            self.applied.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Builder for ScriptedBuilder {
        fn id(&self) -> &'static str {
            self.name
        }

        async fn apply(&self, record: &CdcRecord, _payload: &Payload) -> BuildResult {
            let next_failure = self.failures.lock().unwrap().pop();
            if let Some(err) = next_failure {
                return Err(err);
            }
            self.applied
                .lock()
                .unwrap()
                .push(record.event_id.as_str().to_string());
            Ok(())
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base: Duration::from_millis(1),
            multiplier: 2.0,
            cap: Duration::from_millis(10),
        }
    }

    async fn fixture(
        builders: Vec<Arc<dyn Builder>>,
    ) -> (Arc<StreamHub>, Arc<SqliteRawStore>, Arc<WorkerPool>) {
        let streams = Arc::new(StreamHub::in_memory());
        let raw = Arc::new(SqliteRawStore::open_in_memory().await.unwrap());
        let metrics: Arc<dyn MetricsStore> =
            Arc::new(SqliteMetricsStore::open_in_memory().await.unwrap());
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&streams),
            Arc::clone(&raw) as Arc<dyn RawStore>,
            builders,
            CustodyLedger::new(metrics),
            WorkerPoolConfig {
                workers: 2,
                poll_timeout: Duration::from_millis(10),
                claim_interval: Duration::from_millis(50),
                stuck_after: Duration::from_millis(40),
                retry: fast_retry(),
                ..Default::default()
            },
        ));
        (streams, raw, pool)
    }

    fn sample_event() -> Event {
        Event::new(
            "claude_code",
            "s-1",
            EventType::UserPrompt,
            Payload::new().with("prompt_length", 3u64),
        )
    }

    async fn publish_cdc(streams: &StreamHub, raw: &SqliteRawStore, event: &Event) -> CdcRecord {
        let batch_id = raw.append(std::slice::from_ref(event)).await.unwrap();
        let record = CdcRecord::for_event(event, batch_id, 0, 4096);
        streams.cdc.append(record.to_fields()).await.unwrap();
        record
    }

    async fn run_briefly(pool: Arc<WorkerPool>, millis: u64) {
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            stop.cancel();
        });
        pool.run(cancel).await;
    }

    #[tokio::test]
    async fn test_dispatches_to_builders_in_order_and_acks() {
        let conversation = ScriptedBuilder::new("conversation_builder");
        let metrics = ScriptedBuilder::new("metrics_aggregator");
        let (streams, raw, pool) = fixture(vec![
            Arc::clone(&conversation) as Arc<dyn Builder>,
            Arc::clone(&metrics) as Arc<dyn Builder>,
        ])
        .await;

        let event = sample_event();
        publish_cdc(&streams, &raw, &event).await;

        run_briefly(Arc::clone(&pool), 150).await;

        assert_eq!(conversation.applied(), vec![event.event_id.as_str()]);
        assert_eq!(metrics.applied(), vec![event.event_id.as_str()]);
        assert_eq!(streams.cdc.pending_depth("workers").await, 0);
        assert_eq!(pool.counters().snapshot().records_processed, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_to_success() {
        let builder = ScriptedBuilder::new("conversation_builder");
        builder.fail_next(vec![
            BuildError::transient("io", "lock contention"),
            BuildError::transient("io", "timeout"),
        ]);
        let (streams, raw, pool) = fixture(vec![Arc::clone(&builder) as Arc<dyn Builder>]).await;

        let event = sample_event();
        publish_cdc(&streams, &raw, &event).await;

        run_briefly(Arc::clone(&pool), 200).await;

        assert_eq!(builder.applied().len(), 1);
        assert_eq!(streams.dlq.len().await, 0);
        let stats = pool.counters().snapshot();
        assert_eq!(stats.records_processed, 1);
        assert_eq!(stats.records_retried, 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_deadlettered_with_stage() {
        let conversation = ScriptedBuilder::new("conversation_builder");
        conversation.fail_next(vec![BuildError::permanent("schema", "broken")]);
        let metrics = ScriptedBuilder::new("metrics_aggregator");
        let (streams, raw, pool) = fixture(vec![
            Arc::clone(&conversation) as Arc<dyn Builder>,
            Arc::clone(&metrics) as Arc<dyn Builder>,
        ])
        .await;

        let event = sample_event();
        publish_cdc(&streams, &raw, &event).await;

        run_briefly(Arc::clone(&pool), 150).await;

        // Later builders are skipped and the record is acked after DLQ.
        assert!(metrics.applied().is_empty());
        assert_eq!(streams.cdc.pending_depth("workers").await, 0);
        assert_eq!(streams.dlq.len().await, 1);

        let dlq = streams.dlq.snapshot().await;
        let dlq_record = DlqRecord::from_fields(&dlq[0].fields).unwrap();
        assert_eq!(dlq_record.stage, "conversation_builder");
        assert_eq!(dlq_record.error_kind, "schema");
        assert_eq!(pool.counters().snapshot().records_deadlettered, 1);
    }

    #[tokio::test]
    async fn test_transient_exhaustion_promotes_to_dlq() {
        let builder = ScriptedBuilder::new("metrics_aggregator");
        builder.fail_next(vec![
            BuildError::transient("io", "down"),
            BuildError::transient("io", "down"),
            BuildError::transient("io", "down"),
            BuildError::transient("io", "down"),
        ]);
        let (streams, raw, pool) = fixture(vec![Arc::clone(&builder) as Arc<dyn Builder>]).await;

        publish_cdc(&streams, &raw, &sample_event()).await;
        run_briefly(Arc::clone(&pool), 300).await;

        assert_eq!(streams.dlq.len().await, 1);
        let dlq = streams.dlq.snapshot().await;
        let dlq_record = DlqRecord::from_fields(&dlq[0].fields).unwrap();
        assert_eq!(dlq_record.stage, "metrics_aggregator");
    }

    #[tokio::test]
    async fn test_stored_payload_resolved_through_raw_store() {
        let builder = ScriptedBuilder::new("conversation_builder");
        let (streams, raw, pool) = fixture(vec![Arc::clone(&builder) as Arc<dyn Builder>]).await;

        let mut event = sample_event();
        event.payload.insert("blob", "x".repeat(500));
        let batch_id = raw.append(std::slice::from_ref(&event)).await.unwrap();
        // Tiny inline limit forces the by-reference path.
        let record = CdcRecord::for_event(&event, batch_id, 0, 16);
        assert!(matches!(record.payload_ref, PayloadRef::Stored { .. }));
        streams.cdc.append(record.to_fields()).await.unwrap();

        run_briefly(Arc::clone(&pool), 150).await;

        assert_eq!(builder.applied().len(), 1);
        assert_eq!(pool.counters().snapshot().records_processed, 1);
    }

    #[tokio::test]
    async fn test_dangling_reference_deadletters_as_referential() {
        let builder = ScriptedBuilder::new("conversation_builder");
        let (streams, _raw, pool) = fixture(vec![Arc::clone(&builder) as Arc<dyn Builder>]).await;

        // CDC record pointing at a batch that was never committed.
        let event = sample_event();
        let record = CdcRecord {
            payload_ref: PayloadRef::Stored {
                batch_id: blueplane_core::BatchId(424242),
                index: 0,
            },
            ..CdcRecord::for_event(&event, blueplane_core::BatchId(424242), 0, 4096)
        };
        streams.cdc.append(record.to_fields()).await.unwrap();

        run_briefly(Arc::clone(&pool), 400).await;

        assert!(builder.applied().is_empty());
        assert_eq!(streams.dlq.len().await, 1);
        let dlq = streams.dlq.snapshot().await;
        let dlq_record = DlqRecord::from_fields(&dlq[0].fields).unwrap();
        assert_eq!(dlq_record.error_kind, "referential");
    }

    #[tokio::test]
    async fn test_malformed_cdc_entry_dropped_with_count() {
        let builder = ScriptedBuilder::new("conversation_builder");
        let (streams, _raw, pool) = fixture(vec![Arc::clone(&builder) as Arc<dyn Builder>]).await;

        let mut fields = std::collections::BTreeMap::new();
        fields.insert("nonsense".to_string(), "1".to_string());
        streams.cdc.append(fields).await.unwrap();

        run_briefly(Arc::clone(&pool), 150).await;

        assert_eq!(streams.cdc.pending_depth("workers").await, 0);
        assert_eq!(pool.counters().snapshot().records_malformed, 1);
    }
}
