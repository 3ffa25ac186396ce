//! Scenario builder for setting up and running simulations.

use ringnode::{Entry, Key};

use crate::event::{sample_entry, ScenarioAction};
use crate::metrics::SimulationResult;
use crate::sim::{Simulator, DEFAULT_MAX_STEPS};

/// Builder for simulation scenarios.
///
/// Actions run in the order they were added. The ring starts with
/// `num_nodes` joins; everything else is appended after them.
pub struct ScenarioBuilder {
    /// Scheduled actions.
    actions: Vec<ScenarioAction>,
    /// Entries created so far by `with_entries`.
    entries_made: u64,
    /// Snapshot after every action.
    snapshot_each: bool,
    max_steps: u64,
}

impl Default for ScenarioBuilder {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ScenarioBuilder {
    /// Create a new scenario that starts `num_nodes` nodes one after another.
    pub fn new(num_nodes: usize) -> Self {
        Self {
            actions: vec![ScenarioAction::Join; num_nodes],
            entries_made: 0,
            snapshot_each: false,
            max_steps: DEFAULT_MAX_STEPS,
        }
    }

    /// Bound the steps any single quiet-down may take.
    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    /// Take a ring snapshot after every action.
    pub fn snapshot_each_action(mut self) -> Self {
        self.snapshot_each = true;
        self
    }

    /// Start one more node.
    pub fn join(mut self) -> Self {
        self.actions.push(ScenarioAction::Join);
        self
    }

    /// Have node `node` leave.
    pub fn leave(mut self, node: usize) -> Self {
        self.actions.push(ScenarioAction::Leave { node });
        self
    }

    /// Insert `count` fresh sample entries, sent to node `via`.
    pub fn with_entries(mut self, via: usize, count: u64) -> Self {
        for n in self.entries_made..self.entries_made + count {
            self.actions.push(ScenarioAction::Insert {
                via,
                entry: sample_entry(n),
            });
        }
        self.entries_made += count;
        self
    }

    pub fn insert(mut self, via: usize, entry: Entry) -> Self {
        self.actions.push(ScenarioAction::Insert { via, entry });
        self
    }

    pub fn remove(mut self, via: usize, key: Key) -> Self {
        self.actions.push(ScenarioAction::Remove { via, key });
        self
    }

    pub fn heartbeats(mut self, count: usize) -> Self {
        self.actions
            .extend(std::iter::repeat(ScenarioAction::Heartbeat).take(count));
        self
    }

    pub fn snapshot(mut self) -> Self {
        self.actions.push(ScenarioAction::TakeSnapshot);
        self
    }

    /// Build the simulator and execute every action.
    pub fn build(self) -> Simulator {
        let mut sim = Simulator::new().with_max_steps(self.max_steps);
        for action in self.actions {
            sim.execute(action);
            if self.snapshot_each {
                sim.take_snapshot();
            }
        }
        sim
    }

    /// Build, execute, and return the final metrics.
    pub fn run(self) -> SimulationResult {
        self.build().result()
    }
}

/// Ring of `num_nodes` nodes holding `entries` sample entries.
pub fn populated_ring(num_nodes: usize, entries: u64) -> ScenarioBuilder {
    ScenarioBuilder::new(num_nodes).with_entries(0, entries)
}
