//! SimNode wrapper for simulated ring members.

use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::Duration;

use embassy_futures::block_on;
use ringnode::{
    Channel, DebugEmitter, DebugEvent, Entry, Error, HashRange, Inbound, Link, Node, NodeConfig,
    NodeState, PeerAddr, Transport, TransportError,
};

use crate::network::{ConnId, SharedNetwork, Side};

/// Transport for simulation.
///
/// Every endpoint lives in the shared [`crate::Network`]. `recv` never
/// waits: with nothing to read it reports a timeout at once, so the
/// simulator decides when a node may step.
pub struct SimTransport {
    net: SharedNetwork,
    ip: Ipv4Addr,
    tracker: Option<PeerAddr>,
    rendezvous: Option<PeerAddr>,
    listener: Option<PeerAddr>,
    successor: Option<ConnId>,
    predecessor: Option<ConnId>,
    interrupted: bool,
}

impl SimTransport {
    pub fn new(net: SharedNetwork, ip: Ipv4Addr) -> Self {
        net.borrow_mut().register_host(ip);
        Self {
            net,
            ip,
            tracker: None,
            rendezvous: None,
            listener: None,
            successor: None,
            predecessor: None,
            interrupted: false,
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    /// Ask the node to leave, as an operator interrupt would.
    pub fn interrupt(&mut self) {
        self.interrupted = true;
    }

    fn link(&self, link: Link) -> Option<ConnId> {
        match link {
            Link::Successor => self.successor,
            Link::Predecessor => self.predecessor,
        }
    }

    fn side(link: Link) -> Side {
        match link {
            Link::Successor => Side::Connector,
            Link::Predecessor => Side::Acceptor,
        }
    }

    /// Accept a waiting connection if no predecessor is installed.
    fn accept_pending(&mut self) {
        if self.predecessor.is_some() || self.listener.is_none() {
            return;
        }
        self.predecessor = self.net.borrow_mut().accept(self.ip);
    }

    /// Whether `recv` would return something other than a timeout.
    pub fn poll_ready(&mut self) -> bool {
        if self.interrupted {
            return true;
        }
        self.accept_pending();
        let net = self.net.borrow();
        if net.has_datagram(self.ip) {
            return true;
        }
        [Link::Predecessor, Link::Successor].into_iter().any(|link| {
            self.link(link).is_some_and(|id| {
                let side = Self::side(link);
                net.has_data(id, side) || net.peer_closed(id, side)
            })
        })
    }
}

impl Transport for SimTransport {
    async fn open_tracker(&mut self) -> Result<(), TransportError> {
        self.tracker = Some(self.net.borrow_mut().bind_datagram(self.ip, Channel::Tracker));
        Ok(())
    }

    async fn open_rendezvous(&mut self) -> Result<u16, TransportError> {
        let addr = self
            .net
            .borrow_mut()
            .bind_datagram(self.ip, Channel::Rendezvous);
        self.rendezvous = Some(addr);
        Ok(addr.port())
    }

    async fn open_listener(&mut self) -> Result<u16, TransportError> {
        let addr = self.net.borrow_mut().listen(self.ip);
        self.listener = Some(addr);
        Ok(addr.port())
    }

    async fn send_datagram(
        &mut self,
        via: Channel,
        to: PeerAddr,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let from = match via {
            Channel::Tracker => self.tracker,
            Channel::Rendezvous => self.rendezvous,
            _ => None,
        }
        .ok_or(TransportError::NotOpen(via))?;
        self.net.borrow_mut().send_datagram(from, to, data);
        Ok(())
    }

    async fn connect(&mut self, to: PeerAddr) -> Result<(), TransportError> {
        let id = self
            .net
            .borrow_mut()
            .connect(&to)
            .ok_or(TransportError::Unreachable(to))?;
        self.close(Link::Successor);
        self.successor = Some(id);
        Ok(())
    }

    async fn send(&mut self, link: Link, data: &[u8]) -> Result<(), TransportError> {
        let id = self
            .link(link)
            .ok_or(TransportError::NotOpen(link.into()))?;
        self.net.borrow_mut().write(id, Self::side(link), data);
        Ok(())
    }

    fn close(&mut self, link: Link) {
        let slot = match link {
            Link::Successor => self.successor.take(),
            Link::Predecessor => self.predecessor.take(),
        };
        if let Some(id) = slot {
            self.net.borrow_mut().close(id, Self::side(link));
        }
    }

    fn is_linked(&self, link: Link) -> bool {
        self.link(link).is_some()
    }

    async fn recv(&mut self, _timeout: Duration) -> Result<Option<Inbound>, TransportError> {
        if self.interrupted {
            self.interrupted = false;
            return Ok(Some(Inbound::Interrupted));
        }
        if let Some((channel, data)) = self.net.borrow_mut().pop_datagram(self.ip) {
            return Ok(Some(Inbound::Message { channel, data }));
        }
        self.accept_pending();

        for link in [Link::Predecessor, Link::Successor] {
            let Some(id) = self.link(link) else {
                continue;
            };
            let side = Self::side(link);
            let mut net = self.net.borrow_mut();
            if let Some(data) = net.read(id, side) {
                return Ok(Some(Inbound::Message {
                    channel: link.into(),
                    data,
                }));
            }
            if net.peer_closed(id, side) {
                drop(net);
                self.close(link);
                return Ok(Some(Inbound::Closed { link }));
            }
        }
        Ok(None)
    }

    fn shutdown(&mut self) {
        self.close(Link::Successor);
        self.close(Link::Predecessor);
        let mut net = self.net.borrow_mut();
        for addr in [self.tracker.take(), self.rendezvous.take()]
            .into_iter()
            .flatten()
        {
            net.unbind_datagram(&addr);
        }
        if let Some(addr) = self.listener.take() {
            net.unlisten(&addr);
        }
        net.clear_inbox(self.ip);
    }
}

/// Collects a node's debug events for later inspection.
struct Recorder(Rc<RefCell<Vec<DebugEvent>>>);

impl DebugEmitter for Recorder {
    fn emit(&mut self, event: DebugEvent) {
        self.0.borrow_mut().push(event);
    }
}

/// Type alias for simulated nodes.
pub type SimNodeInner = Node<SimTransport>;

/// Wrapper around a ring node for simulation.
pub struct SimNode {
    /// Position in the simulator's node list.
    pub index: usize,
    inner: SimNodeInner,
    events: Rc<RefCell<Vec<DebugEvent>>>,
    /// Why the node stopped, if its run loop failed.
    failure: Option<Error>,
}

impl SimNode {
    pub fn new(index: usize, net: SharedNetwork, ip: Ipv4Addr) -> Self {
        let tracker = net.borrow().tracker();
        let events = Rc::new(RefCell::new(Vec::new()));
        let inner = Node::new(SimTransport::new(net, ip), tracker, NodeConfig::default())
            .with_debug_emitter(Box::new(Recorder(events.clone())));
        Self {
            index,
            inner,
            events,
            failure: None,
        }
    }

    /// Get a reference to the inner node.
    pub fn inner(&self) -> &SimNodeInner {
        &self.inner
    }

    /// Get a mutable reference to the inner node.
    pub fn inner_mut(&mut self) -> &mut SimNodeInner {
        &mut self.inner
    }

    pub fn state(&self) -> NodeState {
        self.inner.state()
    }

    pub fn range(&self) -> Option<HashRange> {
        self.inner.range()
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.inner.transport().ip()
    }

    /// Address the node's predecessor connects to.
    pub fn listen_addr(&self) -> Option<PeerAddr> {
        self.inner.identity().listen_addr()
    }

    /// Address clients and joiners send datagrams to.
    pub fn rendezvous_addr(&self) -> Option<PeerAddr> {
        self.inner.identity().rendezvous_addr()
    }

    pub fn successor(&self) -> Option<PeerAddr> {
        self.inner.identity().successor
    }

    /// Stored entries, sorted by key.
    pub fn entries(&self) -> Vec<Entry> {
        let mut entries: Vec<Entry> = self.inner.store().entries().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        entries
    }

    /// Member of the ring: past bootstrap, holding a range, not stopped.
    pub fn is_member(&self) -> bool {
        self.range().is_some() && !self.is_stopped()
    }

    /// Left the ring or halted on an error.
    pub fn is_stopped(&self) -> bool {
        self.inner.is_terminal() || self.failure.is_some()
    }

    pub fn failure(&self) -> Option<&Error> {
        self.failure.as_ref()
    }

    /// Whether a step would make progress.
    pub fn is_ready(&mut self) -> bool {
        if self.is_stopped() {
            return false;
        }
        let state = self.inner.state();
        if state.is_pure() || matches!(state, NodeState::SplitDecision | NodeState::LeaveCheck) {
            return true;
        }
        // poll_ready accepts queued connections, so check a deferred leave after it.
        self.inner.pending().is_some()
            || self.inner.transport_mut().poll_ready()
            || self.inner.leave_ready()
    }

    /// Run one event through the node. A failure stops the node for good.
    pub fn step(&mut self) -> Option<NodeState> {
        if self.is_stopped() {
            return None;
        }
        match block_on(self.inner.step()) {
            Ok(state) => Some(state),
            Err(e) => {
                tracing::warn!(node = self.index, error = %e, "simulated node halted");
                self.inner.transport_mut().shutdown();
                self.failure = Some(e);
                None
            }
        }
    }

    pub fn interrupt(&mut self) {
        self.inner.transport_mut().interrupt();
    }

    /// Take all debug events recorded so far.
    pub fn take_debug_events(&self) -> Vec<DebugEvent> {
        std::mem::take(&mut *self.events.borrow_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::Network;
    use ringnode::{Encode, Pdu};

    fn node(net: &SharedNetwork, n: u8) -> SimNode {
        SimNode::new(n as usize, net.clone(), Ipv4Addr::new(10, 0, 0, n))
    }

    fn settle(node: &mut SimNode) {
        while node.is_ready() {
            node.step();
        }
    }

    #[test]
    fn test_simnode_creation() {
        let net = Network::shared(crate::TRACKER_ADDR);
        let mut n = node(&net, 1);
        assert_eq!(n.state(), NodeState::Bootstrap);
        assert!(n.is_ready());
        assert!(!n.is_member());
    }

    #[test]
    fn test_first_node_founds_ring() {
        let net = Network::shared(crate::TRACKER_ADDR);
        let mut n = node(&net, 1);
        settle(&mut n);

        assert_eq!(n.state(), NodeState::Steady);
        assert_eq!(n.range(), Some(HashRange::FULL));
        assert_eq!(n.successor(), None);
        assert_eq!(net.borrow().members(), vec![n.rendezvous_addr().unwrap()]);
        assert!(n
            .take_debug_events()
            .contains(&DebugEvent::RangeAssigned {
                range: HashRange::FULL
            }));
    }

    #[test]
    fn test_steady_node_is_not_ready_without_input() {
        let net = Network::shared(crate::TRACKER_ADDR);
        let mut n = node(&net, 1);
        settle(&mut n);
        assert!(!n.is_ready());

        let client = ringnode::types::UNSET_ADDR;
        let to = n.rendezvous_addr().unwrap();
        net.borrow_mut()
            .send_datagram(client, to, &Pdu::Remove { key: [1; 12] }.encode_to_vec());
        assert!(n.is_ready());
    }

    #[test]
    fn test_interrupt_stops_sole_node() {
        let net = Network::shared(crate::TRACKER_ADDR);
        let mut n = node(&net, 1);
        settle(&mut n);
        let stats = net.borrow().stats();

        n.interrupt();
        settle(&mut n);
        assert_eq!(n.state(), NodeState::Terminal);
        assert!(n.is_stopped());
        assert!(n.failure().is_none());
        // Nothing sent on the way out.
        assert_eq!(net.borrow().stats(), stats);
        assert!(net.borrow().members().is_empty());
    }
}
