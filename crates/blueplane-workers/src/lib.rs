//! Blueplane Workers
//!
//! The slow path: a bounded pool of CDC consumers dispatching records to
//! the derived-state builders, plus the depth monitor that converts CDC
//! backlog into the shed signal the fast path obeys.

mod builder;
mod monitor;
mod pool;
mod retry;

pub use builder::{BuildError, BuildResult, Builder};
pub use monitor::{DepthMonitor, DepthMonitorConfig};
pub use pool::{PoolCounters, PoolStats, WorkerPool, WorkerPoolConfig};
pub use retry::RetryPolicy;
