//! Metrics Aggregator
//!
//! Turns each CDC record into a delta set and applies it through the
//! metrics store's conditional `(event_id, metric_key)` path, so replays
//! and redeliveries never double-count.
//!
//! ## Emitted Metrics
//!
//! | Metric | Kind | Scope | Source |
//! |---|---|---|---|
//! | `events_total{platform,event_type}` | counter | global | every record |
//! | `suggestion_total` | counter | global + session | `AssistantResponse` |
//! | `accepted_total` / `rejected_total` | counter | global + session | `FileEdit` accept/reject |
//! | `tokens_total` | counter | session | `tokens_used` payload field |
//! | `tool_latency_ms{tool_name}` | histogram | tool | `ToolPost.duration_ms` |
//! | `lines_added_total` / `lines_removed_total` | counter | session | `FileEdit` |
//! | `sessions_active` | gauge | global | session start/end transitions |
//!
//! `acceptance_rate{scope}` is a read-side ratio of `accepted_total` over
//! `suggestion_total`; nothing stores it directly.
//!
//! Counters land in minute buckets (custody and rates read them windowed),
//! histograms in day buckets, gauges windowless. Unknown event types
//! produce only `events_total`.

use async_trait::async_trait;
use blueplane_core::{CdcRecord, EventType, Payload};
use blueplane_storage::{
    day_bucket, labels, minute_bucket, MetricDelta, MetricKey, MetricOp, MetricScope,
    MetricsStore, NO_BUCKET,
};
use blueplane_workers::{BuildError, BuildResult, Builder};
use std::sync::Arc;

pub struct MetricsAggregator {
    store: Arc<dyn MetricsStore>,
}

impl MetricsAggregator {
    pub fn new(store: Arc<dyn MetricsStore>) -> Self {
        Self { store }
    }

    /// The delta set for one record. Pure, so tests can assert the mapping
    /// without a store.
    pub fn deltas(record: &CdcRecord, payload: &Payload) -> Vec<MetricDelta> {
        let minute = minute_bucket(record.enqueued_at);
        let session_scope = MetricScope::Session(record.session_key().to_string());

        let mut deltas = vec![MetricDelta::new(
            MetricKey::new(
                MetricScope::Global,
                "events_total",
                labels(&[
                    ("platform", &record.platform),
                    ("event_type", record.event_type.as_str()),
                ]),
                minute.clone(),
            ),
            MetricOp::Incr(1),
        )];

        match &record.event_type {
            EventType::AssistantResponse => {
                if let Some(tokens) = payload.u64_field("tokens_used") {
                    deltas.push(MetricDelta::new(
                        MetricKey::new(session_scope.clone(), "tokens_total", "", minute.clone()),
                        MetricOp::Incr(tokens),
                    ));
                }
                for scope in [MetricScope::Global, session_scope] {
                    deltas.push(MetricDelta::new(
                        MetricKey::new(scope, "suggestion_total", "", minute.clone()),
                        MetricOp::Incr(1),
                    ));
                }
            }
            EventType::ToolPost => {
                if let (Some(tool), Some(duration)) = (
                    payload.str_field("tool_name"),
                    payload.u64_field("duration_ms"),
                ) {
                    deltas.push(MetricDelta::new(
                        MetricKey::new(
                            MetricScope::Tool(tool.to_string()),
                            "tool_latency_ms",
                            labels(&[("tool_name", tool)]),
                            day_bucket(record.enqueued_at),
                        ),
                        MetricOp::Observe(duration),
                    ));
                }
            }
            EventType::FileEdit => {
                if let Some(added) = payload.u64_field("lines_added") {
                    deltas.push(MetricDelta::new(
                        MetricKey::new(
                            session_scope.clone(),
                            "lines_added_total",
                            "",
                            minute.clone(),
                        ),
                        MetricOp::Incr(added),
                    ));
                }
                if let Some(removed) = payload.u64_field("lines_removed") {
                    deltas.push(MetricDelta::new(
                        MetricKey::new(
                            session_scope.clone(),
                            "lines_removed_total",
                            "",
                            minute.clone(),
                        ),
                        MetricOp::Incr(removed),
                    ));
                }
                let counter = match payload.str_field("operation") {
                    Some("accepted") => Some("accepted_total"),
                    Some("rejected") => Some("rejected_total"),
                    _ => None,
                };
                if let Some(counter) = counter {
                    for scope in [MetricScope::Global, session_scope] {
                        deltas.push(MetricDelta::new(
                            MetricKey::new(scope, counter, "", minute.clone()),
                            MetricOp::Incr(1),
                        ));
                    }
                }
            }
            EventType::SessionStart => {
                deltas.push(MetricDelta::new(
                    MetricKey::new(MetricScope::Global, "sessions_active", "", NO_BUCKET),
                    MetricOp::GaugeAdd(1.0),
                ));
            }
            EventType::SessionEnd => {
                deltas.push(MetricDelta::new(
                    MetricKey::new(MetricScope::Global, "sessions_active", "", NO_BUCKET),
                    MetricOp::GaugeAdd(-1.0),
                ));
            }
            _ => {}
        }

        deltas
    }
}

#[async_trait]
impl Builder for MetricsAggregator {
    fn id(&self) -> &'static str {
        blueplane_core::stage::METRICS_AGGREGATOR
    }

    async fn apply(&self, record: &CdcRecord, payload: &Payload) -> BuildResult {
        let deltas = Self::deltas(record, payload);
        self.store
            .apply(&record.event_id, &deltas)
            .await
            .map_err(|e| {
                if e.is_transient() {
                    BuildError::transient("io", e.to_string())
                } else {
                    BuildError::permanent("storage", e.to_string())
                }
            })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blueplane_core::{BatchId, Event};
    use blueplane_storage::SqliteMetricsStore;

    fn record(session: &str, event_type: EventType, payload: Payload) -> (CdcRecord, Payload) {
        let event = Event::new("claude_code", session, event_type, payload.clone());
        (CdcRecord::for_event(&event, BatchId(1), 0, 4096), payload)
    }

    async fn fixture() -> (Arc<SqliteMetricsStore>, MetricsAggregator) {
        let store = Arc::new(SqliteMetricsStore::open_in_memory().await.unwrap());
        let aggregator = MetricsAggregator::new(Arc::clone(&store) as Arc<dyn MetricsStore>);
        (store, aggregator)
    }

    fn response_payload(tokens: u64) -> Payload {
        Payload::new()
            .with("response_length", 45u64)
            .with("tokens_used", tokens)
            .with("model", "m1")
            .with("duration_ms", 800u64)
    }

    #[tokio::test]
    async fn test_every_record_counts_events_total() {
        let (store, aggregator) = fixture().await;
        let (rec, payload) = record("s-1", EventType::SessionStart, Payload::new());
        aggregator.apply(&rec, &payload).await.unwrap();

        let total = store
            .sum_counter(
                &MetricScope::Global,
                "events_total",
                &labels(&[("platform", "claude_code"), ("event_type", "SessionStart")]),
            )
            .await
            .unwrap();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_tokens_accumulate_per_session() {
        let (store, aggregator) = fixture().await;
        for tokens in [30u64, 12] {
            let (rec, payload) =
                record("s-1", EventType::AssistantResponse, response_payload(tokens));
            aggregator.apply(&rec, &payload).await.unwrap();
        }

        let scope =
            MetricScope::Session(blueplane_core::SessionKey::derive("claude_code", "s-1").to_string());
        assert_eq!(
            store.sum_counter(&scope, "tokens_total", "").await.unwrap(),
            42
        );
    }

    #[tokio::test]
    async fn test_duplicate_event_counted_once() {
        let (store, aggregator) = fixture().await;
        let (rec, payload) = record("s-1", EventType::AssistantResponse, response_payload(30));

        for _ in 0..10 {
            aggregator.apply(&rec, &payload).await.unwrap();
        }

        let scope =
            MetricScope::Session(blueplane_core::SessionKey::derive("claude_code", "s-1").to_string());
        assert_eq!(
            store.sum_counter(&scope, "tokens_total", "").await.unwrap(),
            30
        );
        assert_eq!(
            store.sum_counter(&scope, "suggestion_total", "").await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_rejected_edit_drives_acceptance_rate() {
        let (store, aggregator) = fixture().await;
        let (response, response_pl) =
            record("s-1", EventType::AssistantResponse, response_payload(30));
        aggregator.apply(&response, &response_pl).await.unwrap();

        let (edit, edit_pl) = record(
            "s-1",
            EventType::FileEdit,
            Payload::new()
                .with("file_extension", ".rs")
                .with("lines_added", 5u64)
                .with("lines_removed", 2u64)
                .with("operation", "rejected"),
        );
        aggregator.apply(&edit, &edit_pl).await.unwrap();

        let scope =
            MetricScope::Session(blueplane_core::SessionKey::derive("claude_code", "s-1").to_string());
        // 0 accepted / 1 suggestion.
        assert_eq!(store.acceptance_rate(&scope).await.unwrap(), Some(0.0));
        assert_eq!(
            store.sum_counter(&scope, "rejected_total", "").await.unwrap(),
            1
        );
        assert_eq!(
            store.sum_counter(&scope, "lines_added_total", "").await.unwrap(),
            5
        );
        assert_eq!(
            store.sum_counter(&scope, "lines_removed_total", "").await.unwrap(),
            2
        );
    }

    #[tokio::test]
    async fn test_accepted_edit_raises_rate() {
        let (store, aggregator) = fixture().await;
        let (response, response_pl) =
            record("s-1", EventType::AssistantResponse, response_payload(30));
        aggregator.apply(&response, &response_pl).await.unwrap();
        let (edit, edit_pl) = record(
            "s-1",
            EventType::FileEdit,
            Payload::new()
                .with("file_extension", ".rs")
                .with("lines_added", 1u64)
                .with("lines_removed", 0u64)
                .with("operation", "accepted"),
        );
        aggregator.apply(&edit, &edit_pl).await.unwrap();

        assert_eq!(
            store.acceptance_rate(&MetricScope::Global).await.unwrap(),
            Some(1.0)
        );
    }

    #[tokio::test]
    async fn test_tool_latency_histogram() {
        let (store, aggregator) = fixture().await;
        for duration in [100u64, 120, 9000] {
            let (rec, payload) = record(
                "s-1",
                EventType::ToolPost,
                Payload::new()
                    .with("tool_name", "Edit")
                    .with("success", true)
                    .with("duration_ms", duration)
                    .with("output_size", 1u64),
            );
            aggregator.apply(&rec, &payload).await.unwrap();
        }

        let buckets = store
            .histogram_buckets(
                &MetricScope::Tool("Edit".to_string()),
                "tool_latency_ms",
                &labels(&[("tool_name", "Edit")]),
            )
            .await
            .unwrap();
        assert_eq!(
            buckets,
            vec![("128".to_string(), 2), ("16384".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn test_sessions_active_gauge_transitions() {
        let (store, aggregator) = fixture().await;
        let gauge_key = MetricKey::new(MetricScope::Global, "sessions_active", "", NO_BUCKET);

        for session in ["s-1", "s-2"] {
            let (rec, payload) = record(session, EventType::SessionStart, Payload::new());
            aggregator.apply(&rec, &payload).await.unwrap();
        }
        assert_eq!(store.gauge_value(&gauge_key).await.unwrap(), Some(2.0));

        let (end, end_pl) = record(
            "s-1",
            EventType::SessionEnd,
            Payload::new().with("session_duration_ms", 5u64),
        );
        aggregator.apply(&end, &end_pl).await.unwrap();
        assert_eq!(store.gauge_value(&gauge_key).await.unwrap(), Some(1.0));

        // Redelivered end event must not drive the gauge negative.
        aggregator.apply(&end, &end_pl).await.unwrap();
        assert_eq!(store.gauge_value(&gauge_key).await.unwrap(), Some(1.0));
    }

    #[tokio::test]
    async fn test_unknown_event_type_only_counts_events_total() {
        let (rec, payload) = record(
            "s-1",
            EventType::Other("FutureEvent".to_string()),
            Payload::new().with("anything", 1u64),
        );
        let deltas = MetricsAggregator::deltas(&rec, &payload);
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].key.name, "events_total");
    }

    #[tokio::test]
    async fn test_missing_optional_fields_tolerated() {
        // A ToolPost without duration still counts events_total.
        let (rec, payload) = record(
            "s-1",
            EventType::ToolPost,
            Payload::new().with("tool_name", "Edit"),
        );
        let deltas = MetricsAggregator::deltas(&rec, &payload);
        assert_eq!(deltas.len(), 1);
    }
}
