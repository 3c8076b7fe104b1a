//! CDC Sweeper
//!
//! Background task that re-publishes CDC records whose original append
//! failed or timed out. The fast path records `(batch_id, index)` pairs in
//! the `cdc_unpublished` fallback table; the sweeper drains it on a fixed
//! cadence, reading the events back from the raw store.
//!
//! The sweeper exists so that CDC publishing can stay fire-and-forget on
//! the hot path: raw durability anchors the chain of custody, and every
//! missing CDC record is eventually derivable from it.

use crate::counters::FastPathCounters;
use blueplane_core::CdcRecord;
use blueplane_storage::{CustodyLedger, RawStore};
use blueplane_stream::StreamHub;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Sweep cadence.
    pub interval: Duration,
    /// Fallback rows drained per sweep.
    pub batch_limit: u32,
    /// Inline threshold, matching the fast path's.
    pub inline_payload_limit: usize,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_limit: 256,
            inline_payload_limit: 4096,
        }
    }
}

pub struct CdcSweeper {
    streams: Arc<StreamHub>,
    raw: Arc<dyn RawStore>,
    custody: CustodyLedger,
    counters: Arc<FastPathCounters>,
    config: SweeperConfig,
}

impl CdcSweeper {
    pub fn new(
        streams: Arc<StreamHub>,
        raw: Arc<dyn RawStore>,
        custody: CustodyLedger,
        counters: Arc<FastPathCounters>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            streams,
            raw,
            custody,
            counters,
            config,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval_ms = self.config.interval.as_millis() as u64, "cdc sweeper started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
            self.sweep_once().await;
        }
        info!("cdc sweeper stopped");
    }

    /// One drain pass over the fallback table.
    pub async fn sweep_once(&self) {
        let pending = match self.raw.take_unpublished(self.config.batch_limit).await {
            Ok(pending) => pending,
            Err(e) => {
                warn!(error = %e, "reading cdc fallback table failed");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }
        debug!(rows = pending.len(), "sweeping unpublished cdc records");

        // One raw-store read per distinct batch.
        let mut batches = HashMap::new();
        let mut republished: u64 = 0;
        for (batch_id, index) in pending {
            let events = match batches.entry(batch_id) {
                std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
                std::collections::hash_map::Entry::Vacant(entry) => {
                    match self.raw.read(batch_id).await {
                        Ok(events) => entry.insert(Some(events)),
                        Err(blueplane_storage::Error::BatchNotFound(_)) => {
                            // The batch fell to retention; its CDC rows are
                            // meaningless now.
                            warn!(batch_id = %batch_id, "unpublished cdc row for pruned batch, clearing");
                            entry.insert(None)
                        }
                        Err(e) => {
                            warn!(batch_id = %batch_id, error = %e, "raw read failed, retrying next sweep");
                            continue;
                        }
                    }
                }
            };

            let Some(events) = events else {
                let _ = self.raw.clear_unpublished(batch_id, index).await;
                continue;
            };

            let Some(event) = events.get(index as usize) else {
                warn!(batch_id = %batch_id, index, "unpublished cdc index out of range, clearing");
                let _ = self.raw.clear_unpublished(batch_id, index).await;
                continue;
            };

            let record =
                CdcRecord::for_event(event, batch_id, index, self.config.inline_payload_limit);
            match self.streams.cdc.append(record.to_fields()).await {
                Ok(_) => {
                    if let Err(e) = self.raw.clear_unpublished(batch_id, index).await {
                        warn!(batch_id = %batch_id, index, error = %e, "clearing swept cdc row failed");
                    }
                    republished += 1;
                }
                Err(e) => {
                    warn!(batch_id = %batch_id, index, error = %e, "cdc republish failed, retrying next sweep");
                }
            }
        }

        if republished > 0 {
            self.counters.add_cdc_published(republished);
            if let Err(e) = self.custody.cdc_published(republished, Utc::now()).await {
                warn!(error = %e, "custody cdc count failed");
            }
            info!(republished, "swept cdc records republished");
        }
    }
}
