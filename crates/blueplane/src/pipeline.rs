//! Pipeline Assembly
//!
//! Wires the whole Layer 2 path together: streams, stores, custody ledger,
//! fast-path consumer, CDC sweeper, depth monitor, and the worker pool with
//! both builders registered. Every component is an explicit value created
//! here and shared by reference; the only process-wide entities are the
//! stream handles inside [`StreamHub`].
//!
//! ## Shutdown
//!
//! `shutdown` cancels the shared token, then waits up to the configured
//! bound for every task to finish its in-flight record. Exceeding the bound
//! is logged and tolerated: pending-entry recovery picks up whatever was
//! left unacknowledged on the next start.

use crate::error::Result;
use blueplane_builders::{ConversationBuilder, MetricsAggregator};
use blueplane_core::{Event, ShedLevel};
use blueplane_fastpath::{
    enqueue_event, CdcSweeper, FastPathConfig, FastPathConsumer, FastPathCounters, FastPathStats,
    SweeperConfig,
};
use blueplane_storage::{ConversationStore, CustodyLedger, MetricsStore, RawStore};
use blueplane_stream::{EntryId, HubConfig, StreamHub};
use blueplane_workers::{
    Builder, DepthMonitor, DepthMonitorConfig, PoolCounters, PoolStats, WorkerPool,
    WorkerPoolConfig,
};
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub hub: HubConfig,
    pub fastpath: FastPathConfig,
    pub sweeper: SweeperConfig,
    pub pool: WorkerPoolConfig,
    pub monitor: DepthMonitorConfig,
    /// Aggregate bound on graceful shutdown (T_SHUTDOWN).
    pub shutdown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            hub: HubConfig::default(),
            fastpath: FastPathConfig::default(),
            sweeper: SweeperConfig::default(),
            pool: WorkerPoolConfig::default(),
            monitor: DepthMonitorConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// The three store handles the pipeline runs against.
#[derive(Clone)]
pub struct Stores {
    pub raw: Arc<dyn RawStore>,
    pub conversations: Arc<dyn ConversationStore>,
    pub metrics: Arc<dyn MetricsStore>,
}

/// In-process health surface; the surrounding read API projects this.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    pub fastpath: FastPathStats,
    pub pool: PoolStats,
    pub shed_level: ShedLevel,
    pub ingress_backlog: usize,
    pub cdc_backlog: usize,
    pub dlq_depth: usize,
    pub chain_break: bool,
}

/// A running pipeline instance.
pub struct Pipeline {
    streams: Arc<StreamHub>,
    stores: Stores,
    custody: CustodyLedger,
    fastpath_counters: Arc<FastPathCounters>,
    pool_counters: Arc<PoolCounters>,
    shed: watch::Receiver<ShedLevel>,
    fastpath_group: String,
    pool_group: String,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl Pipeline {
    /// Build every component and spawn the long-running tasks.
    pub async fn start(config: PipelineConfig, stores: Stores) -> Result<Self> {
        let streams = Arc::new(StreamHub::open(config.hub.clone()).await?);
        Self::start_with_streams(config, stores, streams).await
    }

    /// Start against an existing stream hub. This is how a process restart
    /// looks to the pipeline: streams survive outside it, and pending-entry
    /// recovery reclaims whatever the previous instance left behind.
    pub async fn start_with_streams(
        config: PipelineConfig,
        stores: Stores,
        streams: Arc<StreamHub>,
    ) -> Result<Self> {
        let custody = CustodyLedger::new(Arc::clone(&stores.metrics));
        let cancel = CancellationToken::new();

        let monitor = DepthMonitor::new(Arc::clone(&streams.cdc), config.monitor.clone());
        let shed = monitor.subscribe();

        let fastpath = Arc::new(FastPathConsumer::new(
            Arc::clone(&streams),
            Arc::clone(&stores.raw),
            custody.clone(),
            config.fastpath.clone(),
            monitor.subscribe(),
        ));
        let fastpath_counters = fastpath.counters();

        let sweeper = CdcSweeper::new(
            Arc::clone(&streams),
            Arc::clone(&stores.raw),
            custody.clone(),
            Arc::clone(&fastpath_counters),
            config.sweeper.clone(),
        );

        let builders: Vec<Arc<dyn Builder>> = vec![
            Arc::new(ConversationBuilder::new(Arc::clone(&stores.conversations))),
            Arc::new(MetricsAggregator::new(Arc::clone(&stores.metrics))),
        ];
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&streams),
            Arc::clone(&stores.raw),
            builders,
            custody.clone(),
            config.pool.clone(),
        ));
        let pool_counters = pool.counters();

        let mut tasks = Vec::new();
        {
            let token = cancel.clone();
            let fastpath = Arc::clone(&fastpath);
            tasks.push(tokio::spawn(async move {
                if let Err(e) = fastpath.run(token.clone()).await {
                    // Invariant violations fail the whole pipeline fast so a
                    // supervisor restart triggers pending-entry recovery.
                    error!(error = %e, "fast path failed, cancelling pipeline");
                    token.cancel();
                }
            }));
        }
        {
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move { sweeper.run(token).await }));
        }
        {
            let token = cancel.clone();
            tasks.push(tokio::spawn(async move { monitor.run(token).await }));
        }
        {
            let token = cancel.clone();
            let pool = Arc::clone(&pool);
            tasks.push(tokio::spawn(async move { pool.run(token).await }));
        }

        info!("pipeline started");
        Ok(Self {
            streams,
            stores,
            custody,
            fastpath_counters,
            pool_counters,
            shed,
            fastpath_group: config.fastpath.group.clone(),
            pool_group: config.pool.group.clone(),
            cancel,
            tasks,
            shutdown_timeout: config.shutdown_timeout,
        })
    }

    pub fn streams(&self) -> Arc<StreamHub> {
        Arc::clone(&self.streams)
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn custody(&self) -> &CustodyLedger {
        &self.custody
    }

    /// Producer-side convenience: enqueue one event onto ingress.
    pub async fn enqueue(&self, event: &Event) -> Result<EntryId> {
        Ok(enqueue_event(&self.streams, event).await?)
    }

    pub async fn health(&self) -> Result<HealthSnapshot> {
        Ok(HealthSnapshot {
            fastpath: self.fastpath_counters.snapshot(),
            pool: self.pool_counters.snapshot(),
            shed_level: *self.shed.borrow(),
            ingress_backlog: self.streams.ingress.backlog(&self.fastpath_group).await,
            cdc_backlog: self.streams.cdc.backlog(&self.pool_group).await,
            dlq_depth: self.streams.dlq.len().await,
            chain_break: self.custody.chain_break(Utc::now()).await?,
        })
    }

    /// Cancel every task and wait out the shutdown bound.
    pub async fn shutdown(self) {
        info!("pipeline shutting down");
        self.cancel.cancel();
        let drained = tokio::time::timeout(self.shutdown_timeout, join_all(self.tasks)).await;
        match drained {
            Ok(_) => info!("pipeline stopped"),
            Err(_) => warn!(
                timeout_ms = self.shutdown_timeout.as_millis() as u64,
                "shutdown timeout exceeded, exiting anyway; pending-entry recovery will pick up the remainder"
            ),
        }
    }
}
