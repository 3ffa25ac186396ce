//! Protocol states and the events that move a node between them.

use core::fmt;
use std::net::Ipv4Addr;

use crate::types::{Entry, HashRange, Key, PeerAddr};
use crate::wire::{DecodeError, JoinRequest, Pdu};

/// Lifecycle state of a node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Nothing opened yet.
    Bootstrap,
    /// StunLookup sent, waiting for our public address.
    AddrRequest,
    /// GetExistingMember sent, waiting for the tracker.
    MemberRequest,
    /// First node of a new ring.
    SoleOwner,
    /// Sole owner admitting its first peer.
    SoleSplit,
    Steady,
    /// Join sent to an existing member, waiting for JoinResponse.
    RendezvousJoin,
    /// JoinResponse received and successor connected.
    RendezvousAccept,
    /// A keyed request was just served or forwarded.
    Serving,
    /// Shutdown requested; checking whether any peer needs telling.
    LeaveCheck,
    /// RangeChange sent, waiting for the absorber's acknowledgement.
    AnnounceLeave,
    /// A Join arrived; the verdict is already computed.
    SplitDecision,
    SplitExecute,
    SplitForward,
    /// A leaving neighbour's range was merged into ours.
    RangeAdjust,
    /// Successor link moved to the node a leaver announced.
    PeerRejoin,
    /// Predecessor link dropped.
    PeerDisconnect,
    /// Entries handed over and neighbours told; about to stop.
    HandOver,
    Terminal,
}

impl NodeState {
    /// States that produce their next event without reading the network.
    pub fn is_pure(&self) -> bool {
        matches!(
            self,
            NodeState::Bootstrap
                | NodeState::SoleOwner
                | NodeState::SoleSplit
                | NodeState::RendezvousAccept
                | NodeState::Serving
                | NodeState::SplitExecute
                | NodeState::SplitForward
                | NodeState::RangeAdjust
                | NodeState::PeerRejoin
                | NodeState::PeerDisconnect
                | NodeState::HandOver
        )
    }

    /// Conventional q-number used in protocol traces.
    pub fn number(&self) -> u8 {
        match self {
            NodeState::Bootstrap => 1,
            NodeState::AddrRequest => 2,
            NodeState::MemberRequest => 3,
            NodeState::SoleOwner => 4,
            NodeState::SoleSplit => 5,
            NodeState::Steady => 6,
            NodeState::RendezvousJoin => 7,
            NodeState::RendezvousAccept => 8,
            NodeState::Serving => 9,
            NodeState::LeaveCheck => 10,
            NodeState::AnnounceLeave => 11,
            NodeState::SplitDecision => 12,
            NodeState::SplitExecute => 13,
            NodeState::SplitForward => 14,
            NodeState::RangeAdjust => 15,
            NodeState::PeerRejoin => 16,
            NodeState::PeerDisconnect => 17,
            NodeState::HandOver => 18,
            NodeState::Terminal => 0,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}(q{})", self, self.number())
    }
}

/// One input to the router.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    StunAddressResolved(Ipv4Addr),
    ExistingMemberFound(PeerAddr),
    NoExistingMember,
    JoinAccepted {
        successor: PeerAddr,
        range: HashRange,
    },
    InsertRequested(Entry),
    LookupRequested {
        key: Key,
        requester: PeerAddr,
    },
    RemoveRequested {
        key: Key,
    },
    ShutdownRequested,
    JoinRequested(JoinRequest),
    RangeChangeNotified(HashRange),
    PeerLeaving {
        successor: PeerAddr,
    },
    PeerClosedConnection,
    RangeChangeAcknowledged,
    PeerLinkPresent,
    PeerLinkAbsent,
    SelfIsRangeMaximum,
    SelfIsNotRangeMaximum,
    Done,
    NoOp,
    TimedOut,
    Unknown(DecodeError),
}

impl Event {
    /// Map a decoded PDU to the event it raises.
    ///
    /// PDUs a ring member never acts on (another member's Alive, tracker
    /// queries, lookup responses) become `NoOp`.
    pub fn from_pdu(pdu: Pdu) -> Event {
        match pdu {
            Pdu::StunResponse { addr } => Event::StunAddressResolved(addr),
            Pdu::GetExistingMemberResponse { member } if crate::types::is_unset(&member) => {
                Event::NoExistingMember
            }
            Pdu::GetExistingMemberResponse { member } => Event::ExistingMemberFound(member),
            Pdu::JoinResponse { successor, range } => Event::JoinAccepted { successor, range },
            Pdu::Insert(entry) => Event::InsertRequested(entry),
            Pdu::Lookup { key, requester } => Event::LookupRequested { key, requester },
            Pdu::Remove { key } => Event::RemoveRequested { key },
            Pdu::Join(join) => Event::JoinRequested(join),
            Pdu::RangeChange { range } => Event::RangeChangeNotified(range),
            Pdu::Leaving { successor } => Event::PeerLeaving { successor },
            Pdu::CloseConnection => Event::PeerClosedConnection,
            Pdu::RangeChangeResponse => Event::RangeChangeAcknowledged,
            Pdu::Alive | Pdu::GetExistingMember | Pdu::StunLookup | Pdu::LookupResponse(_) => {
                Event::NoOp
            }
        }
    }

    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Event::StunAddressResolved(_) => "StunAddressResolved",
            Event::ExistingMemberFound(_) => "ExistingMemberFound",
            Event::NoExistingMember => "NoExistingMember",
            Event::JoinAccepted { .. } => "JoinAccepted",
            Event::InsertRequested(_) => "InsertRequested",
            Event::LookupRequested { .. } => "LookupRequested",
            Event::RemoveRequested { .. } => "RemoveRequested",
            Event::ShutdownRequested => "ShutdownRequested",
            Event::JoinRequested(_) => "JoinRequested",
            Event::RangeChangeNotified(_) => "RangeChangeNotified",
            Event::PeerLeaving { .. } => "PeerLeaving",
            Event::PeerClosedConnection => "PeerClosedConnection",
            Event::RangeChangeAcknowledged => "RangeChangeAcknowledged",
            Event::PeerLinkPresent => "PeerLinkPresent",
            Event::PeerLinkAbsent => "PeerLinkAbsent",
            Event::SelfIsRangeMaximum => "SelfIsRangeMaximum",
            Event::SelfIsNotRangeMaximum => "SelfIsNotRangeMaximum",
            Event::Done => "Done",
            Event::NoOp => "NoOp",
            Event::TimedOut => "TimedOut",
            Event::Unknown(_) => "Unknown",
        }
    }
}
