//! Tessera Sentinel: background scheduler
//!
//! The Sentinel keeps the shard population moving. Operations that cannot
//! progress right now (no healthy nodes, no capacity) return immediately in
//! the core; the Sentinel retries them on its next tick.
//!
//! # The sweep
//!
//! ```text
//! ┌──────────────┐
//! │  Observe     │──> Poll node health, expire silent nodes
//! └──────┬───────┘
//!        v
//! ┌──────────────┐
//! │  Reconcile   │──> Demote shards that lost a replica
//! └──────┬───────┘
//!        v
//! ┌──────────────┐
//! │  React       │──> Process queued anomaly events
//! └──────┬───────┘
//!        v
//! ┌──────────────┐
//! │  Act         │──> Advance every shard not at rest (bounded parallelism)
//! └──────┬───────┘
//!        └────> next tick
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tessera::{Orchestrator, TesseraConfig};
//! use tessera_sentinel::{Sentinel, SentinelPolicy};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let orchestrator = Arc::new(Orchestrator::from_config(TesseraConfig::default())?);
//! let sentinel = Sentinel::new(orchestrator, SentinelPolicy::with_interval(10))?;
//!
//! let (handle, task) = sentinel.spawn();
//! // ... report anomalies through `handle` ...
//! handle.shutdown().await;
//! task.await??;
//! # Ok(())
//! # }
//! ```

pub mod daemon;
pub mod medic;
pub mod metrics;
pub mod policy;

pub use daemon::{Sentinel, SentinelHandle};
pub use medic::{Medic, MedicReport, Treatment};
pub use metrics::SweepStats;
pub use policy::SentinelPolicy;
