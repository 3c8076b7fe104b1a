//! Chain-of-Custody Accounting
//!
//! Per-minute counters correlating the pipeline stages:
//!
//! - `cc_ingress_enqueued` - events first observed on the ingress stream
//! - `cc_raw_persisted` - events committed to the raw store
//! - `cc_cdc_published` - CDC records successfully appended
//! - `cc_derived_applied{builder}` - events that passed through each builder
//! - `cc_dlq_total{stage}` - events deadlettered, by failing stage
//!
//! The chain is considered broken when, over a sliding hour,
//! `cc_raw_persisted < cc_ingress_enqueued - cc_dlq_total{fast_path}`:
//! every acknowledged event must be either persisted or deadlettered.
//!
//! These are observational counters, not per-event idempotent state, so they
//! use the unconditional counter path of the metrics store.

use crate::error::Result;
use crate::metrics::{labels, minute_bucket, MetricKey, MetricScope, MetricsStore};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

pub const CC_INGRESS_ENQUEUED: &str = "cc_ingress_enqueued";
pub const CC_RAW_PERSISTED: &str = "cc_raw_persisted";
pub const CC_CDC_PUBLISHED: &str = "cc_cdc_published";
pub const CC_DERIVED_APPLIED: &str = "cc_derived_applied";
pub const CC_DLQ_TOTAL: &str = "cc_dlq_total";

/// Records stage counters into the metrics store.
#[derive(Clone)]
pub struct CustodyLedger {
    metrics: Arc<dyn MetricsStore>,
}

impl CustodyLedger {
    pub fn new(metrics: Arc<dyn MetricsStore>) -> Self {
        Self { metrics }
    }

    async fn record(&self, name: &str, label_str: String, n: u64, at: DateTime<Utc>) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let key = MetricKey::new(MetricScope::Global, name, label_str, minute_bucket(at));
        self.metrics.add_counter(&key, n).await
    }

    pub async fn ingress_enqueued(&self, n: u64, at: DateTime<Utc>) -> Result<()> {
        self.record(CC_INGRESS_ENQUEUED, String::new(), n, at).await
    }

    pub async fn raw_persisted(&self, n: u64, at: DateTime<Utc>) -> Result<()> {
        self.record(CC_RAW_PERSISTED, String::new(), n, at).await
    }

    pub async fn cdc_published(&self, n: u64, at: DateTime<Utc>) -> Result<()> {
        self.record(CC_CDC_PUBLISHED, String::new(), n, at).await
    }

    pub async fn derived_applied(&self, builder: &str, n: u64, at: DateTime<Utc>) -> Result<()> {
        self.record(CC_DERIVED_APPLIED, labels(&[("builder", builder)]), n, at)
            .await
    }

    pub async fn deadlettered(&self, stage: &str, n: u64, at: DateTime<Utc>) -> Result<()> {
        self.record(CC_DLQ_TOTAL, labels(&[("stage", stage)]), n, at)
            .await
    }

    /// Minute buckets covering the sliding hour ending at `now`.
    fn window(now: DateTime<Utc>) -> Vec<String> {
        (0..60)
            .map(|back| minute_bucket(now - Duration::minutes(back)))
            .collect()
    }

    /// Sliding-hour total for one custody counter.
    pub async fn window_total(
        &self,
        name: &str,
        label_str: &str,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.metrics
            .sum_counter_in(&MetricScope::Global, name, label_str, &Self::window(now))
            .await
    }

    /// Whether the sliding-hour custody equation is violated.
    pub async fn chain_break(&self, now: DateTime<Utc>) -> Result<bool> {
        let ingress = self.window_total(CC_INGRESS_ENQUEUED, "", now).await?;
        let persisted = self.window_total(CC_RAW_PERSISTED, "", now).await?;
        let dlq_fast_path = self
            .window_total(
                CC_DLQ_TOTAL,
                &labels(&[("stage", blueplane_core::stage::FAST_PATH)]),
                now,
            )
            .await?;
        Ok(persisted < ingress.saturating_sub(dlq_fast_path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::SqliteMetricsStore;

    async fn ledger() -> CustodyLedger {
        CustodyLedger::new(Arc::new(SqliteMetricsStore::open_in_memory().await.unwrap()))
    }

    #[tokio::test]
    async fn test_intact_chain() {
        let ledger = ledger().await;
        let now = Utc::now();
        ledger.ingress_enqueued(10, now).await.unwrap();
        ledger.raw_persisted(10, now).await.unwrap();
        assert!(!ledger.chain_break(now).await.unwrap());
    }

    #[tokio::test]
    async fn test_deadlettered_events_balance_the_chain() {
        let ledger = ledger().await;
        let now = Utc::now();
        ledger.ingress_enqueued(10, now).await.unwrap();
        ledger.raw_persisted(7, now).await.unwrap();
        ledger
            .deadlettered(blueplane_core::stage::FAST_PATH, 3, now)
            .await
            .unwrap();
        assert!(!ledger.chain_break(now).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_events_break_the_chain() {
        let ledger = ledger().await;
        let now = Utc::now();
        ledger.ingress_enqueued(10, now).await.unwrap();
        ledger.raw_persisted(8, now).await.unwrap();
        assert!(ledger.chain_break(now).await.unwrap());
    }

    #[tokio::test]
    async fn test_old_counts_age_out_of_window() {
        let ledger = ledger().await;
        let now = Utc::now();
        // A loss two hours ago is outside the sliding hour.
        ledger
            .ingress_enqueued(10, now - Duration::hours(2))
            .await
            .unwrap();
        assert!(!ledger.chain_break(now).await.unwrap());
    }

    #[tokio::test]
    async fn test_builder_counters_labeled() {
        let ledger = ledger().await;
        let now = Utc::now();
        ledger
            .derived_applied("conversation_builder", 5, now)
            .await
            .unwrap();
        ledger
            .derived_applied("metrics_aggregator", 4, now)
            .await
            .unwrap();
        assert_eq!(
            ledger
                .window_total(CC_DERIVED_APPLIED, &labels(&[("builder", "conversation_builder")]), now)
                .await
                .unwrap(),
            5
        );
        assert_eq!(
            ledger
                .window_total(CC_DERIVED_APPLIED, &labels(&[("builder", "metrics_aggregator")]), now)
                .await
                .unwrap(),
            4
        );
    }
}
