//! The ring node: state, identity, and the step/run loop.
//!
//! `Node` is split across several files:
//! - this file: struct, construction, accessors, `step` and `run`
//! - `source.rs`: turning transport input into events
//! - `router.rs`: the transition table and membership actions
//! - `routing.rs`: serving and forwarding keyed requests

use std::net::{Ipv4Addr, SocketAddrV4};

use tracing::{error, info};

use crate::config::NodeConfig;
use crate::debug::DebugEmitter;
use crate::partition::JoinVerdict;
use crate::state::NodeState;
use crate::store::EntryStore;
use crate::traits::Transport;
use crate::types::{Channel, Error, HashRange, Link, PeerAddr};
use crate::wire::JoinRequest;

/// Addresses a node learns as it moves through bootstrap and join.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NodeIdentity {
    /// Tracker the node registers with.
    pub tracker: Option<PeerAddr>,
    /// Our address as the tracker sees it.
    pub public_ip: Option<Ipv4Addr>,
    pub listener_port: Option<u16>,
    pub rendezvous_port: Option<u16>,
    /// Listener address of the node our successor link points at.
    pub successor: Option<PeerAddr>,
    /// Existing member we sent our Join through.
    pub member: Option<PeerAddr>,
}

impl NodeIdentity {
    /// The address other members use to reach our listener.
    ///
    /// This is also how a node names itself in Join challenges.
    pub fn listen_addr(&self) -> Option<PeerAddr> {
        Some(SocketAddrV4::new(self.public_ip?, self.listener_port?))
    }

    pub fn rendezvous_addr(&self) -> Option<PeerAddr> {
        Some(SocketAddrV4::new(self.public_ip?, self.rendezvous_port?))
    }
}

/// Bytes left over from a read that carried more than one PDU.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingMessage {
    pub channel: Channel,
    pub data: Vec<u8>,
}

/// A Join being decided on.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PendingJoin {
    /// The Join with our challenge already applied.
    pub request: JoinRequest,
    /// Verdict reached on the record as received.
    pub verdict: JoinVerdict,
}

/// A ring member.
pub struct Node<T> {
    pub(crate) transport: T,
    pub(crate) config: NodeConfig,
    pub(crate) state: NodeState,
    pub(crate) identity: NodeIdentity,
    pub(crate) range: Option<HashRange>,
    pub(crate) store: EntryStore,
    pub(crate) pending: Option<PendingMessage>,
    /// Channel the most recent PDU was read from.
    pub(crate) last_channel: Option<Channel>,
    pub(crate) join: Option<PendingJoin>,
    /// Shutdown arrived while the predecessor link was down.
    pub(crate) leave_deferred: bool,
    pub(crate) debug: Option<Box<dyn DebugEmitter>>,
}

impl<T: Transport> Node<T> {
    /// Create a node that will register with `tracker`.
    pub fn new(transport: T, tracker: PeerAddr, config: NodeConfig) -> Self {
        Self {
            transport,
            config,
            state: NodeState::Bootstrap,
            identity: NodeIdentity {
                tracker: Some(tracker),
                ..NodeIdentity::default()
            },
            range: None,
            store: EntryStore::create(),
            pending: None,
            last_channel: None,
            join: None,
            leave_deferred: false,
            debug: None,
        }
    }

    /// Attach a debug emitter for protocol tracing.
    pub fn with_debug_emitter(mut self, emitter: Box<dyn DebugEmitter>) -> Self {
        self.debug = Some(emitter);
        self
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// The hash range this node owns, once it has one.
    pub fn range(&self) -> Option<HashRange> {
        self.range
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn store(&self) -> &EntryStore {
        &self.store
    }

    pub fn pending(&self) -> Option<&PendingMessage> {
        self.pending.as_ref()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// A deferred leave can go ahead: the predecessor link is back.
    pub fn leave_ready(&self) -> bool {
        self.leave_deferred
            && self.state == NodeState::Steady
            && self.transport.is_linked(Link::Predecessor)
    }

    pub fn is_terminal(&self) -> bool {
        self.state == NodeState::Terminal
    }

    /// Take one event and apply it. Returns the state the node is now in.
    ///
    /// Errors are fatal; the caller should stop driving the node.
    pub async fn step(&mut self) -> Result<NodeState, Error> {
        let event = self.next_event().await?;
        let next = self.transition(event).await?;
        self.state = next;
        Ok(next)
    }

    /// Drive the node until it leaves the ring or fails.
    ///
    /// On failure every endpoint is released before the error is returned.
    pub async fn run(&mut self) -> Result<(), Error> {
        info!(tracker = ?self.identity.tracker, "node starting");
        while !self.is_terminal() {
            if let Err(e) = self.step().await {
                error!(state = %self.state, error = %e, "node halted");
                self.transport.shutdown();
                return Err(e);
            }
        }
        info!("node stopped");
        Ok(())
    }

    pub(crate) fn own_range(&self) -> Result<HashRange, Error> {
        self.range.ok_or(Error::NoRange)
    }

    pub(crate) fn own_addr(&self) -> Result<PeerAddr, Error> {
        self.identity.listen_addr().ok_or(Error::NoIdentity)
    }

    pub(crate) fn tracker(&self) -> Result<PeerAddr, Error> {
        self.identity.tracker.ok_or(Error::NoIdentity)
    }
}
