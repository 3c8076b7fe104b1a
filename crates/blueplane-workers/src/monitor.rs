//! CDC Depth Monitor
//!
//! Watches the CDC backlog and publishes a [`ShedLevel`] the fast path
//! observes between batches.
//!
//! ## Tiers
//!
//! | Backlog              | Behavior                                    |
//! |----------------------|---------------------------------------------|
//! | `< 10 000`           | normal                                      |
//! | `10 000 - 50 000`    | log warning, behavior unchanged             |
//! | `50 000 - 100 000`   | shed: fast path halves B_MAX, doubles T_BATCH |
//! | `>= 100 000`         | shed+pause: additionally pause between batches |
//!
//! Recovery is hysteretic: a tier is left only after the backlog sits below
//! the tier's recovery threshold for two consecutive probes, so the level
//! does not flap around a boundary.

use blueplane_core::ShedLevel;
use blueplane_stream::Stream;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct DepthMonitorConfig {
    /// Probe cadence (T_MON).
    pub interval: Duration,
    /// CDC consumer group whose backlog is probed.
    pub group: String,
    /// Log a warning at or above this backlog.
    pub warn_depth: usize,
    /// Enter shed mode at or above this backlog.
    pub shed_depth: usize,
    /// Enter shed+pause at or above this backlog.
    pub pause_depth: usize,
    /// Leave shed mode below this backlog.
    pub shed_recover: usize,
    /// Drop from shed+pause back to shed below this backlog.
    pub pause_recover: usize,
    /// Consecutive probes below the recovery threshold required to step down.
    pub recover_probes: u32,
}

impl Default for DepthMonitorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            group: "workers".to_string(),
            warn_depth: 10_000,
            shed_depth: 50_000,
            pause_depth: 100_000,
            shed_recover: 30_000,
            pause_recover: 60_000,
            recover_probes: 2,
        }
    }
}

/// One step of the tier state machine. Pure so the hysteresis is testable
/// without timing.
fn next_level(
    current: ShedLevel,
    below_streak: u32,
    depth: usize,
    config: &DepthMonitorConfig,
) -> (ShedLevel, u32) {
    match current {
        ShedLevel::Normal => {
            if depth >= config.pause_depth {
                (ShedLevel::ShedPause, 0)
            } else if depth >= config.shed_depth {
                (ShedLevel::Shed, 0)
            } else {
                (ShedLevel::Normal, 0)
            }
        }
        ShedLevel::Shed => {
            if depth >= config.pause_depth {
                (ShedLevel::ShedPause, 0)
            } else if depth < config.shed_recover {
                let streak = below_streak + 1;
                if streak >= config.recover_probes {
                    (ShedLevel::Normal, 0)
                } else {
                    (ShedLevel::Shed, streak)
                }
            } else {
                (ShedLevel::Shed, 0)
            }
        }
        ShedLevel::ShedPause => {
            if depth < config.pause_recover {
                let streak = below_streak + 1;
                if streak >= config.recover_probes {
                    (ShedLevel::Shed, 0)
                } else {
                    (ShedLevel::ShedPause, streak)
                }
            } else {
                (ShedLevel::ShedPause, 0)
            }
        }
    }
}

pub struct DepthMonitor {
    cdc: Arc<Stream>,
    config: DepthMonitorConfig,
    tx: watch::Sender<ShedLevel>,
}

impl DepthMonitor {
    pub fn new(cdc: Arc<Stream>, config: DepthMonitorConfig) -> Self {
        let (tx, _) = watch::channel(ShedLevel::Normal);
        Self { cdc, config, tx }
    }

    /// Receiver for the published shed level.
    pub fn subscribe(&self) -> watch::Receiver<ShedLevel> {
        self.tx.subscribe()
    }

    pub fn level(&self) -> ShedLevel {
        *self.tx.borrow()
    }

    pub async fn run(&self, cancel: CancellationToken) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            "depth monitor started"
        );
        let mut below_streak: u32 = 0;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
            self.probe(&mut below_streak).await;
        }
        info!("depth monitor stopped");
    }

    /// One probe of the CDC backlog. Exposed for tests and the health
    /// surface.
    pub async fn probe(&self, below_streak: &mut u32) {
        let depth = self.cdc.backlog(&self.config.group).await;
        let current = *self.tx.borrow();

        if depth >= self.config.warn_depth && depth < self.config.shed_depth {
            warn!(depth, "cdc backlog elevated");
        }

        let (next, streak) = next_level(current, *below_streak, depth, &self.config);
        *below_streak = streak;
        if next != current {
            info!(depth, from = %current, to = %next, "shed level changed");
            let _ = self.tx.send(next);
        }
    }
}
