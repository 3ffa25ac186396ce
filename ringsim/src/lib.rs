//! ringsim - In-process simulator for ringnode rings.
//!
//! This crate runs many ring members in one process over a simulated
//! network, without sockets or real time, so whole-ring behavior can be
//! tested deterministically.
//!
//! # Features
//!
//! - **Step-driven**: each node step handles one event; no real delays
//! - **Simulated network**: datagram endpoints, stream connections with
//!   listener backlogs, and a tracker stand-in for bootstrap
//! - **Client traffic**: inserts, lookups and removes sent from outside the ring
//! - **Scenario builder**: joins, leaves and requests in sequence
//! - **Metrics collection**: ring snapshots, traffic counters, node failures
//!
//! # Example
//!
//! ```
//! use ringsim::ScenarioBuilder;
//!
//! // Four nodes, twenty entries, then one node leaves
//! let result = ScenarioBuilder::new(4)
//!     .with_entries(0, 20)
//!     .leave(2)
//!     .run();
//!
//! assert!(result.partitioned());
//! assert_eq!(result.final_member_count(), 3);
//! ```
//!
//! # Architecture
//!
//! Nodes are real `ringnode::Node`s over a [`SimTransport`] whose `recv`
//! never blocks. The simulator steps every node that has input (or is in a
//! state that needs none) in round-robin order until no node can step. A
//! steady node with nothing to read is not stepped; heartbeats happen only
//! when a scenario asks for them.

pub mod event;
pub mod metrics;
pub mod network;
pub mod node;
pub mod scenario;
pub mod sim;

// Re-export main types
pub use event::{sample_entry, ScenarioAction};
pub use metrics::{MemberState, RingSnapshot, SimMetrics, SimulationResult};
pub use network::{NetStats, Network, SharedNetwork, TRACKER_ADDR};
pub use node::{SimNode, SimTransport};
pub use scenario::{populated_ring, ScenarioBuilder};
pub use sim::Simulator;
