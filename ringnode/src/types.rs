//! Core types and constants for the ring protocol.

use core::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use crate::wire::DecodeError;

// Wire tags (first byte of every PDU)
pub const NET_ALIVE: u8 = 0;
pub const NET_GET_NODE: u8 = 1;
pub const NET_GET_NODE_RESPONSE: u8 = 2;
pub const NET_JOIN: u8 = 3;
pub const NET_JOIN_RESPONSE: u8 = 4;
pub const NET_CLOSE_CONNECTION: u8 = 5;
pub const NET_NEW_RANGE: u8 = 6;
pub const NET_LEAVING: u8 = 7;
pub const NET_NEW_RANGE_RESPONSE: u8 = 8;
pub const VAL_INSERT: u8 = 100;
pub const VAL_REMOVE: u8 = 101;
pub const VAL_LOOKUP: u8 = 102;
pub const VAL_LOOKUP_RESPONSE: u8 = 103;
pub const STUN_LOOKUP: u8 = 200;
pub const STUN_RESPONSE: u8 = 201;

/// Length of an entry key on the wire.
pub const KEY_LEN: usize = 12;

/// Lowest hash value in the ring.
pub const HASH_MIN: u8 = 0;

/// Highest hash value in the ring.
pub const HASH_MAX: u8 = 255;

/// Longest entry name or email: the wire length prefix is one byte.
pub const MAX_FIELD_LEN: usize = u8::MAX as usize;

/// Largest PDU the codec can produce: Insert/LookupResponse with two full fields.
pub const MAX_PDU_LEN: usize = 1 + KEY_LEN + 1 + MAX_FIELD_LEN + 1 + MAX_FIELD_LEN;

/// Fixed-length entry key.
pub type Key = [u8; KEY_LEN];

/// Address of a peer endpoint (IPv4 only, as carried on the wire).
pub type PeerAddr = SocketAddrV4;

/// The "no address" marker used by the tracker and by a fresh Join.
pub const UNSET_ADDR: PeerAddr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0);

/// Returns true if `addr` is the all-zero placeholder.
pub fn is_unset(addr: &PeerAddr) -> bool {
    addr.ip().is_unspecified() && addr.port() == 0
}

/// A contiguous, inclusive range of the 8-bit hash space.
///
/// Invariant: `min <= max`. Constructors enforce it, so a `HashRange` in hand
/// is always valid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HashRange {
    min: u8,
    max: u8,
}

impl HashRange {
    /// The whole ring, owned by a single node.
    pub const FULL: HashRange = HashRange {
        min: HASH_MIN,
        max: HASH_MAX,
    };

    /// Create a range, or `None` if `min > max`.
    pub const fn new(min: u8, max: u8) -> Option<Self> {
        if min <= max {
            Some(Self { min, max })
        } else {
            None
        }
    }

    pub const fn min(&self) -> u8 {
        self.min
    }

    pub const fn max(&self) -> u8 {
        self.max
    }

    /// Width of the range as carried in a Join (`max - min`).
    pub const fn span(&self) -> u8 {
        self.max - self.min
    }

    /// Number of hash values in the range.
    pub const fn len(&self) -> usize {
        self.span() as usize + 1
    }

    pub const fn is_full(&self) -> bool {
        self.min == HASH_MIN && self.max == HASH_MAX
    }

    /// Inclusive membership test.
    pub const fn contains(&self, hash: u8) -> bool {
        self.min <= hash && hash <= self.max
    }
}

impl fmt::Display for HashRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// A stored record.
///
/// Name and email never exceed [`MAX_FIELD_LEN`] bytes; build entries with
/// [`Entry::new`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub key: Key,
    pub(crate) name: Vec<u8>,
    pub(crate) email: Vec<u8>,
}

impl Entry {
    pub fn new(
        key: Key,
        name: impl Into<Vec<u8>>,
        email: impl Into<Vec<u8>>,
    ) -> Result<Self, EntryError> {
        let (name, email) = (name.into(), email.into());
        for (field, value) in [("name", &name), ("email", &email)] {
            if value.len() > MAX_FIELD_LEN {
                return Err(EntryError::FieldTooLong {
                    field,
                    len: value.len(),
                });
            }
        }
        Ok(Self { key, name, email })
    }

    /// What a lookup miss answers with.
    pub fn empty(key: Key) -> Self {
        Self {
            key,
            name: Vec::new(),
            email: Vec::new(),
        }
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn email(&self) -> &[u8] {
        &self.email
    }
}

/// An entry that could not be built.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntryError {
    #[error("entry {field} is {len} bytes, more than 255")]
    FieldTooLong { field: &'static str, len: usize },
}

/// Which stream link a send or close applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Link {
    /// Outbound stream to the next node along the ring.
    Successor,
    /// Inbound stream accepted from the previous node.
    Predecessor,
}

/// The five logical endpoints a node reads from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Channel {
    /// Datagram socket facing the tracker.
    Tracker,
    /// Stream to the successor.
    Successor,
    /// Listening socket for the predecessor's stream.
    Listener,
    /// Stream from the predecessor.
    Predecessor,
    /// Datagram socket for joins, clients and heartbeats.
    Rendezvous,
}

impl From<Link> for Channel {
    fn from(link: Link) -> Self {
        match link {
            Link::Successor => Channel::Successor,
            Link::Predecessor => Channel::Predecessor,
        }
    }
}

/// Errors raised by a transport implementation.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0:?} endpoint is not open")]
    NotOpen(Channel),
    #[error("no peer is listening at {0}")]
    Unreachable(PeerAddr),
}

/// Error type for node operations.
///
/// Every variant is fatal to the node's run loop.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("undecodable message: {0}")]
    Decode(#[from] DecodeError),
    #[error("no {0:?} link to hand the range to")]
    NotLinked(Link),
    #[error("own address is unknown; the tracker never answered the STUN lookup")]
    NoIdentity,
    #[error("no hash range assigned yet")]
    NoRange,
}
