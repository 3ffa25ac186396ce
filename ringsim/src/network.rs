//! In-process network shared by every simulated node.
//!
//! Datagram endpoints, listeners and stream connections live here, keyed by
//! the addresses nodes advertise. The tracker is a stand-in that answers
//! StunLookup and GetExistingMember and records Alive senders; it has just
//! enough behavior to let nodes bootstrap.
//!
//! A connection carries two byte queues. Writes to one direction are
//! concatenated, so a reader sees whatever was written since its last read in
//! one chunk, as it would on a real stream.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::rc::Rc;

use hashbrown::{HashMap, HashSet};
use ringnode::types::UNSET_ADDR;
use ringnode::{Channel, Decode, Encode, PeerAddr, Pdu};
use tracing::{debug, trace};

/// Network handle shared by the simulator and every [`crate::SimTransport`].
pub type SharedNetwork = Rc<RefCell<Network>>;

/// Identifies a stream connection.
pub type ConnId = u64;

/// Where the simulated tracker listens.
pub const TRACKER_ADDR: PeerAddr = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 4000);

const FIRST_EPHEMERAL_PORT: u16 = 40000;

/// One end of a stream connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The end that called connect (its successor link).
    Connector,
    /// The end that accepted (its predecessor link).
    Acceptor,
}

#[derive(Debug, Default)]
struct Conn {
    to_acceptor: Vec<u8>,
    to_connector: Vec<u8>,
    connector_closed: bool,
    acceptor_closed: bool,
}

impl Conn {
    fn inbound(&mut self, side: Side) -> &mut Vec<u8> {
        match side {
            Side::Connector => &mut self.to_connector,
            Side::Acceptor => &mut self.to_acceptor,
        }
    }

    fn outbound(&mut self, side: Side) -> &mut Vec<u8> {
        match side {
            Side::Connector => &mut self.to_acceptor,
            Side::Acceptor => &mut self.to_connector,
        }
    }

    fn is_closed(&self, side: Side) -> bool {
        match side {
            Side::Connector => self.connector_closed,
            Side::Acceptor => self.acceptor_closed,
        }
    }

    fn peer_closed(&self, side: Side) -> bool {
        match side {
            Side::Connector => self.acceptor_closed,
            Side::Acceptor => self.connector_closed,
        }
    }
}

/// Traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NetStats {
    pub datagrams_sent: u64,
    /// Datagrams addressed to an endpoint nobody holds.
    pub datagrams_dropped: u64,
    pub stream_writes: u64,
    pub stream_bytes: u64,
    pub connections_opened: u64,
}

/// Simulated network state.
pub struct Network {
    tracker: PeerAddr,
    /// Rendezvous endpoints that sent Alive, in order of first contact.
    members: Vec<PeerAddr>,
    hosts: HashSet<Ipv4Addr>,
    endpoints: HashMap<PeerAddr, (Ipv4Addr, Channel)>,
    inboxes: HashMap<Ipv4Addr, VecDeque<(Channel, Vec<u8>)>>,
    listeners: HashMap<PeerAddr, Ipv4Addr>,
    backlogs: HashMap<Ipv4Addr, VecDeque<ConnId>>,
    conns: HashMap<ConnId, Conn>,
    /// Datagrams for addresses outside the ring (clients).
    mailboxes: HashMap<PeerAddr, Vec<Vec<u8>>>,
    next_conn: ConnId,
    next_port: u16,
    stats: NetStats,
}

impl Default for Network {
    fn default() -> Self {
        Self::new(TRACKER_ADDR)
    }
}

impl Network {
    pub fn new(tracker: PeerAddr) -> Self {
        Self {
            tracker,
            members: Vec::new(),
            hosts: HashSet::new(),
            endpoints: HashMap::new(),
            inboxes: HashMap::new(),
            listeners: HashMap::new(),
            backlogs: HashMap::new(),
            conns: HashMap::new(),
            mailboxes: HashMap::new(),
            next_conn: 0,
            next_port: FIRST_EPHEMERAL_PORT,
            stats: NetStats::default(),
        }
    }

    pub fn shared(tracker: PeerAddr) -> SharedNetwork {
        Rc::new(RefCell::new(Self::new(tracker)))
    }

    pub fn tracker(&self) -> PeerAddr {
        self.tracker
    }

    pub fn stats(&self) -> NetStats {
        self.stats
    }

    /// Rendezvous endpoints the tracker would hand out, pruned of closed ones.
    pub fn members(&self) -> Vec<PeerAddr> {
        self.members
            .iter()
            .copied()
            .filter(|m| self.endpoints.contains_key(m))
            .collect()
    }

    fn allocate_port(&mut self) -> u16 {
        let port = self.next_port;
        self.next_port = self.next_port.wrapping_add(1).max(FIRST_EPHEMERAL_PORT);
        port
    }

    // Endpoints

    /// Mark `ip` as a ring host. Datagrams to its closed ports are dropped
    /// instead of being collected as client traffic.
    pub fn register_host(&mut self, ip: Ipv4Addr) {
        self.hosts.insert(ip);
    }

    pub fn bind_datagram(&mut self, ip: Ipv4Addr, channel: Channel) -> PeerAddr {
        let addr = SocketAddrV4::new(ip, self.allocate_port());
        self.endpoints.insert(addr, (ip, channel));
        addr
    }

    pub fn unbind_datagram(&mut self, addr: &PeerAddr) {
        self.endpoints.remove(addr);
    }

    pub fn listen(&mut self, ip: Ipv4Addr) -> PeerAddr {
        let addr = SocketAddrV4::new(ip, self.allocate_port());
        self.listeners.insert(addr, ip);
        addr
    }

    /// Stop listening. Connections still waiting in the backlog are refused.
    pub fn unlisten(&mut self, addr: &PeerAddr) {
        let Some(ip) = self.listeners.remove(addr) else {
            return;
        };
        for id in self.backlogs.remove(&ip).unwrap_or_default() {
            self.close(id, Side::Acceptor);
        }
    }

    /// Drop everything queued for `ip`.
    pub fn clear_inbox(&mut self, ip: Ipv4Addr) {
        self.inboxes.remove(&ip);
    }

    // Datagrams

    pub fn send_datagram(&mut self, from: PeerAddr, to: PeerAddr, data: &[u8]) {
        self.stats.datagrams_sent += 1;
        if to == self.tracker {
            self.tracker_receive(from, data);
            return;
        }
        if let Some(&(ip, channel)) = self.endpoints.get(&to) {
            trace!(%from, %to, ?channel, len = data.len(), "datagram queued");
            self.inboxes
                .entry(ip)
                .or_default()
                .push_back((channel, data.to_vec()));
            return;
        }
        if self.is_ring_address(&to) {
            debug!(%from, %to, "datagram to a closed endpoint dropped");
            self.stats.datagrams_dropped += 1;
            return;
        }
        self.mailboxes.entry(to).or_default().push(data.to_vec());
    }

    fn is_ring_address(&self, addr: &PeerAddr) -> bool {
        self.hosts.contains(addr.ip())
    }

    pub fn pop_datagram(&mut self, ip: Ipv4Addr) -> Option<(Channel, Vec<u8>)> {
        self.inboxes.get_mut(&ip)?.pop_front()
    }

    pub fn has_datagram(&self, ip: Ipv4Addr) -> bool {
        self.inboxes.get(&ip).is_some_and(|q| !q.is_empty())
    }

    /// Take every datagram delivered to an address outside the ring.
    pub fn take_mailbox(&mut self, addr: &PeerAddr) -> Vec<Vec<u8>> {
        self.mailboxes.remove(addr).unwrap_or_default()
    }

    fn tracker_receive(&mut self, from: PeerAddr, data: &[u8]) {
        let reply = match Pdu::decode_from_slice(data) {
            Ok(Pdu::StunLookup) => Pdu::StunResponse { addr: *from.ip() },
            Ok(Pdu::GetExistingMember) => Pdu::GetExistingMemberResponse {
                member: self
                    .members()
                    .first()
                    .copied()
                    .unwrap_or(UNSET_ADDR),
            },
            Ok(Pdu::Alive) => {
                if !self.members.contains(&from) {
                    debug!(member = %from, "tracker registered member");
                    self.members.push(from);
                }
                return;
            }
            Ok(other) => {
                debug!(tag = other.tag(), %from, "tracker ignored message");
                return;
            }
            Err(e) => {
                debug!(error = %e, %from, "tracker could not decode message");
                return;
            }
        };
        let tracker = self.tracker;
        self.send_datagram(tracker, from, &reply.encode_to_vec());
    }

    // Streams

    /// Open a connection to a listener. `None` if nobody listens at `to`.
    pub fn connect(&mut self, to: &PeerAddr) -> Option<ConnId> {
        let ip = *self.listeners.get(to)?;
        let id = self.next_conn;
        self.next_conn += 1;
        self.conns.insert(id, Conn::default());
        self.backlogs.entry(ip).or_default().push_back(id);
        self.stats.connections_opened += 1;
        trace!(%to, id, "connection queued for accept");
        Some(id)
    }

    /// Next connection waiting on `ip`'s listener.
    pub fn accept(&mut self, ip: Ipv4Addr) -> Option<ConnId> {
        self.backlogs.get_mut(&ip)?.pop_front()
    }

    pub fn write(&mut self, id: ConnId, side: Side, data: &[u8]) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        self.stats.stream_writes += 1;
        self.stats.stream_bytes += data.len() as u64;
        if conn.peer_closed(side) {
            trace!(id, ?side, "write to closed peer discarded");
            return;
        }
        conn.outbound(side).extend_from_slice(data);
    }

    /// Everything written towards `side` since its last read.
    pub fn read(&mut self, id: ConnId, side: Side) -> Option<Vec<u8>> {
        let conn = self.conns.get_mut(&id)?;
        let queued = conn.inbound(side);
        if queued.is_empty() {
            None
        } else {
            Some(std::mem::take(queued))
        }
    }

    pub fn has_data(&self, id: ConnId, side: Side) -> bool {
        self.conns.get(&id).is_some_and(|c| match side {
            Side::Connector => !c.to_connector.is_empty(),
            Side::Acceptor => !c.to_acceptor.is_empty(),
        })
    }

    /// Whether the other end has closed. A vanished connection counts.
    pub fn peer_closed(&self, id: ConnId, side: Side) -> bool {
        self.conns.get(&id).map_or(true, |c| c.peer_closed(side))
    }

    pub fn close(&mut self, id: ConnId, side: Side) {
        let Some(conn) = self.conns.get_mut(&id) else {
            return;
        };
        match side {
            Side::Connector => conn.connector_closed = true,
            Side::Acceptor => conn.acceptor_closed = true,
        }
        conn.inbound(side).clear();
        if conn.is_closed(Side::Connector) && conn.is_closed(Side::Acceptor) {
            self.conns.remove(&id);
        }
    }

    /// Number of connections with at least one open end.
    pub fn open_connections(&self) -> usize {
        self.conns.len()
    }
}
