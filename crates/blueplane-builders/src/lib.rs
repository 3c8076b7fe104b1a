//! Blueplane Builders
//!
//! The derived-state builders driven by the worker pool: conversation
//! reconstruction and metrics aggregation. Both are strictly idempotent per
//! `event_id`, which is what lets everything upstream stay at-least-once.

mod aggregator;
mod conversation;
mod locks;

pub use aggregator::MetricsAggregator;
pub use conversation::ConversationBuilder;
pub use locks::SessionLockMap;
