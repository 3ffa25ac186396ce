//! Metrics collection for simulation analysis.

use ringnode::{HashRange, HASH_MAX, HASH_MIN};

use crate::network::NetStats;

/// One live member as seen in a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberState {
    pub node: usize,
    pub range: HashRange,
    pub entries: usize,
}

/// The ring's membership at one point in the run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RingSnapshot {
    /// Simulator step count when this snapshot was taken.
    pub step: u64,
    /// Live members ordered by range start.
    pub members: Vec<MemberState>,
}

impl RingSnapshot {
    pub fn new(step: u64) -> Self {
        Self {
            step,
            members: Vec::new(),
        }
    }

    pub fn record_member(&mut self, node: usize, range: HashRange, entries: usize) {
        self.members.push(MemberState {
            node,
            range,
            entries,
        });
        self.members.sort_by_key(|m| m.range.min());
    }

    /// Whether the members' ranges cover the hash space with no gap or
    /// overlap.
    pub fn partitions_hash_space(&self) -> bool {
        let Some(first) = self.members.first() else {
            return false;
        };
        if first.range.min() != HASH_MIN {
            return false;
        }
        let contiguous = self
            .members
            .windows(2)
            .all(|w| w[0].range.max() < HASH_MAX && w[1].range.min() == w[0].range.max() + 1);
        contiguous && self.members.last().is_some_and(|m| m.range.max() == HASH_MAX)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn total_entries(&self) -> usize {
        self.members.iter().map(|m| m.entries).sum()
    }

    /// Widest span held by any member.
    pub fn max_span(&self) -> Option<u8> {
        self.members.iter().map(|m| m.range.span()).max()
    }
}

/// Simulation metrics collected over time.
#[derive(Debug, Clone, Default)]
pub struct SimMetrics {
    /// Node steps executed.
    pub steps: u64,
    /// Nodes whose run loop returned an error.
    pub node_failures: u64,
    /// Traffic counters from the network.
    pub net: NetStats,
    /// Ring snapshots in the order taken.
    pub snapshots: Vec<RingSnapshot>,
}

impl SimMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_snapshot(&mut self, snapshot: RingSnapshot) {
        self.snapshots.push(snapshot);
    }

    pub fn latest_snapshot(&self) -> Option<&RingSnapshot> {
        self.snapshots.last()
    }

    /// Whether every snapshot taken so far shows a valid partition.
    pub fn always_partitioned(&self) -> bool {
        !self.snapshots.is_empty() && self.snapshots.iter().all(|s| s.partitions_hash_space())
    }
}

/// Result of running a simulation.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub metrics: SimMetrics,
    /// False if the step limit was hit before the ring went quiet.
    pub quiesced: bool,
}

impl SimulationResult {
    /// Whether the final snapshot shows a valid partition.
    pub fn partitioned(&self) -> bool {
        self.metrics
            .latest_snapshot()
            .is_some_and(|s| s.partitions_hash_space())
    }

    pub fn final_member_count(&self) -> usize {
        self.metrics
            .latest_snapshot()
            .map(|s| s.member_count())
            .unwrap_or(0)
    }
}
