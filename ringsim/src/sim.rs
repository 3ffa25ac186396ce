//! Step-driven simulator for ring networks.

use std::net::{Ipv4Addr, SocketAddrV4};

use ringnode::{hash_key, Decode, Encode, Entry, Key, NodeState, PeerAddr, Pdu};
use tracing::{debug, info, warn};

use crate::event::ScenarioAction;
use crate::metrics::{RingSnapshot, SimMetrics, SimulationResult};
use crate::network::{Network, SharedNetwork, TRACKER_ADDR};
use crate::node::SimNode;

/// Default bound on node steps per quiet-down.
pub const DEFAULT_MAX_STEPS: u64 = 100_000;

const FIRST_NODE_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 1);

/// Simulator for ring networks.
///
/// Nodes run one event per step in round-robin order. A node only steps
/// when it has something to do: input waiting, or a state that needs none.
/// The ring is quiet once no node can step. Heartbeats happen only when
/// asked for.
pub struct Simulator {
    net: SharedNetwork,
    nodes: Vec<SimNode>,
    metrics: SimMetrics,
    max_steps: u64,
    next_client_port: u16,
    quiesced: bool,
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

impl Simulator {
    pub fn new() -> Self {
        Self {
            net: Network::shared(TRACKER_ADDR),
            nodes: Vec::new(),
            metrics: SimMetrics::new(),
            max_steps: DEFAULT_MAX_STEPS,
            next_client_port: 5000,
            quiesced: true,
        }
    }

    /// Bound the number of steps one quiet-down may take.
    pub fn with_max_steps(mut self, max_steps: u64) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn network(&self) -> &SharedNetwork {
        &self.net
    }

    pub fn metrics(&self) -> &SimMetrics {
        &self.metrics
    }

    pub fn node(&self, index: usize) -> Option<&SimNode> {
        self.nodes.get(index)
    }

    pub fn node_mut(&mut self, index: usize) -> Option<&mut SimNode> {
        self.nodes.get_mut(index)
    }

    pub fn nodes(&self) -> &[SimNode] {
        &self.nodes
    }

    /// Indices of the nodes currently in the ring.
    pub fn members(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .filter(|n| n.is_member())
            .map(|n| n.index)
            .collect()
    }

    /// Create a node without running it.
    pub fn spawn_node(&mut self) -> usize {
        let index = self.nodes.len();
        let ip = Ipv4Addr::from(u32::from(FIRST_NODE_IP) + index as u32);
        self.nodes.push(SimNode::new(index, self.net.clone(), ip));
        index
    }

    /// Create a node and run until it has joined (or the ring is quiet).
    pub fn add_node(&mut self) -> usize {
        let index = self.spawn_node();
        self.run_until_quiet();
        debug!(node = index, range = ?self.nodes[index].range(), "node added");
        index
    }

    /// Step nodes until none can make progress. Returns false if the step
    /// limit was reached first.
    pub fn run_until_quiet(&mut self) -> bool {
        let mut steps = 0u64;
        loop {
            let mut progressed = false;
            for node in &mut self.nodes {
                if !node.is_ready() {
                    continue;
                }
                if steps >= self.max_steps {
                    warn!(steps, "step limit reached before the ring went quiet");
                    self.quiesced = false;
                    return false;
                }
                node.step();
                steps += 1;
                self.metrics.steps += 1;
                if node.failure().is_some() {
                    self.metrics.node_failures += 1;
                }
                progressed = true;
            }
            if !progressed {
                return true;
            }
        }
    }

    /// One heartbeat period: every steady node times out once.
    pub fn heartbeat(&mut self) {
        for node in &mut self.nodes {
            if node.state() == NodeState::Steady && !node.is_ready() {
                node.step();
                self.metrics.steps += 1;
            }
        }
        self.run_until_quiet();
    }

    /// Interrupt a node and run until the ring settles.
    pub fn leave(&mut self, index: usize) {
        let Some(node) = self.nodes.get_mut(index) else {
            return;
        };
        info!(node = index, range = ?node.range(), "node leaving");
        node.interrupt();
        self.run_until_quiet();
    }

    fn client_addr(&mut self) -> PeerAddr {
        let port = self.next_client_port;
        self.next_client_port = self.next_client_port.wrapping_add(1);
        SocketAddrV4::new(CLIENT_IP, port)
    }

    /// Send a PDU to a node's rendezvous endpoint from a fresh client address.
    fn send_from_client(&mut self, via: usize, pdu: &Pdu) -> Option<PeerAddr> {
        let to = self.nodes.get(via)?.rendezvous_addr()?;
        let client = self.client_addr();
        self.net
            .borrow_mut()
            .send_datagram(client, to, &pdu.encode_to_vec());
        Some(client)
    }

    pub fn insert(&mut self, via: usize, entry: Entry) {
        self.send_from_client(via, &Pdu::Insert(entry));
        self.run_until_quiet();
    }

    pub fn remove(&mut self, via: usize, key: Key) {
        self.send_from_client(via, &Pdu::Remove { key });
        self.run_until_quiet();
    }

    /// Look a key up through node `via`. `None` if no response came back.
    pub fn lookup(&mut self, via: usize, key: Key) -> Option<Entry> {
        let to = self.nodes.get(via)?.rendezvous_addr()?;
        let client = self.client_addr();
        let request = Pdu::Lookup {
            key,
            requester: client,
        };
        self.net
            .borrow_mut()
            .send_datagram(client, to, &request.encode_to_vec());
        self.run_until_quiet();

        let responses = self.net.borrow_mut().take_mailbox(&client);
        responses
            .iter()
            .find_map(|data| match Pdu::decode_from_slice(data) {
                Ok(Pdu::LookupResponse(entry)) => Some(entry),
                _ => None,
            })
    }

    /// The member whose range holds `key`'s hash.
    pub fn owner_of(&self, key: &Key) -> Option<usize> {
        let hash = hash_key(key);
        self.nodes
            .iter()
            .filter(|n| n.is_member())
            .find(|n| n.range().is_some_and(|r| r.contains(hash)))
            .map(|n| n.index)
    }

    /// Members in successor order, starting at the owner of hash 0.
    ///
    /// `None` if following successor links does not visit every member
    /// exactly once before returning to the start.
    pub fn ring_order(&self) -> Option<Vec<usize>> {
        let members: Vec<&SimNode> = self.nodes.iter().filter(|n| n.is_member()).collect();
        let start = members
            .iter()
            .find(|n| n.range().is_some_and(|r| r.min() == 0))?;

        let mut order = vec![start.index];
        let mut current = *start;
        loop {
            let Some(next_addr) = current.successor() else {
                return (members.len() == 1).then_some(order);
            };
            let next = members
                .iter()
                .find(|n| n.listen_addr() == Some(next_addr))?;
            if next.index == start.index {
                return (order.len() == members.len()).then_some(order);
            }
            if order.contains(&next.index) || order.len() >= members.len() {
                return None;
            }
            order.push(next.index);
            current = *next;
        }
    }

    pub fn execute(&mut self, action: ScenarioAction) {
        match action {
            ScenarioAction::Join => {
                self.add_node();
            }
            ScenarioAction::Leave { node } => self.leave(node),
            ScenarioAction::Insert { via, entry } => self.insert(via, entry),
            ScenarioAction::Lookup { via, key } => {
                let found = self.lookup(via, key);
                debug!(via, found = found.is_some(), "lookup answered");
            }
            ScenarioAction::Remove { via, key } => self.remove(via, key),
            ScenarioAction::Heartbeat => self.heartbeat(),
            ScenarioAction::TakeSnapshot => self.take_snapshot(),
        }
    }

    /// Record the ring's current membership.
    pub fn take_snapshot(&mut self) {
        let mut snapshot = RingSnapshot::new(self.metrics.steps);
        for node in self.nodes.iter().filter(|n| n.is_member()) {
            if let Some(range) = node.range() {
                snapshot.record_member(node.index, range, node.inner().store().len());
            }
        }
        self.metrics.add_snapshot(snapshot);
    }

    /// Snapshot the ring and package the metrics.
    pub fn result(&mut self) -> SimulationResult {
        self.take_snapshot();
        self.metrics.net = self.net.borrow().stats();
        SimulationResult {
            metrics: self.metrics.clone(),
            quiesced: self.quiesced,
        }
    }
}
