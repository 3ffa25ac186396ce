//! Scenario actions the simulator can execute.

use ringnode::{Entry, Key};

/// Something that happens to the ring from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScenarioAction {
    /// Start a new node and let it join.
    Join,
    /// Interrupt node `node` so it leaves the ring.
    Leave { node: usize },
    /// A client sends an Insert to node `via`.
    Insert { via: usize, entry: Entry },
    /// A client sends a Lookup to node `via`.
    Lookup { via: usize, key: Key },
    /// A client sends a Remove to node `via`.
    Remove { via: usize, key: Key },
    /// One heartbeat period passes for every steady node.
    Heartbeat,
    /// Record the ring's state in the metrics.
    TakeSnapshot,
}

/// Deterministic entry number `n`: a 12-digit key, name and email derived
/// from it.
pub fn sample_entry(n: u64) -> Entry {
    let mut key = [0u8; 12];
    key.copy_from_slice(format!("{:012}", n % 1_000_000_000_000).as_bytes());
    // Both fields stay well under the length limit.
    Entry::new(key, format!("member {n}"), format!("member{n}@ring.test"))
        .unwrap_or_else(|_| Entry::empty(key))
}
