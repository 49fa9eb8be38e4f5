//! Tessera Fleet - node registry and capacity accounting
//!
//! Tracks the compute nodes shards can be placed on. Nodes report
//! capacity, latency, load and health through a [`NodeHealthSource`];
//! the [`NodeRegistry`] keeps the effective view and hands out
//! [`CapacityReservation`]s, which are checked and taken under the node's
//! own lock so concurrent placements cannot oversubscribe a node.
//!
//! # Example
//!
//! ```
//! use tessera_core_fleet::{FleetError, HealthReport, NodeRegistry};
//!
//! let registry = NodeRegistry::default();
//! registry.apply_report(HealthReport::healthy("node-1", 1, 5));
//!
//! let node = "node-1".into();
//! registry.reserve(&node, "shard-a", 1).unwrap().commit();
//!
//! let full = registry.reserve(&node, "shard-b", 1);
//! assert!(matches!(full, Err(FleetError::CapacityExceeded { .. })));
//! ```

pub mod error;
pub mod health;
pub mod node;
pub mod registry;

pub use error::{FleetError, Result};
pub use health::{ChannelHealthSource, HealthConfig, NodeHealthSource};
pub use node::{HealthReport, HealthStatus, NodeId, NodeSnapshot};
pub use registry::{CapacityReservation, NodeRegistry};
