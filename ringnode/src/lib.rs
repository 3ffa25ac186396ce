#![forbid(unsafe_code)]
//! ringnode - Ring-structured key-value store node
//!
//! Nodes form a ring. Each owns a contiguous slice of a one-byte hash space
//! and keeps the entries whose keys hash into it. A tracker hands newcomers
//! the address of a live member; the ring then splits the widest range to
//! make room. Requests for keys outside a node's range travel around the
//! ring until they reach the owner.
//!
//! # Key Properties
//!
//! - The ranges of all members partition `[0, 255]` exactly
//! - A join is granted by the member holding the widest range
//! - A leaving member hands its range and entries to a neighbour
//! - Each node is one single-task state machine; no locks
//!
//! # Example
//!
//! ```
//! use ringnode::{Decode, Encode, HashRange, Pdu};
//!
//! let change = Pdu::RangeChange {
//!     range: HashRange::new(0, 127).unwrap(),
//! };
//! let bytes = change.encode_to_vec();
//! assert_eq!(bytes, [6, 0, 127]);
//! assert_eq!(Pdu::decode_from_slice(&bytes).unwrap(), change);
//! ```
//!
//! # Integration pattern
//!
//! ```text
//! use ringnode::{NetTransport, Node, NodeConfig};
//!
//! let config = NodeConfig::from_env();
//! let transport = NetTransport::new(config.clone());
//! let mut node = Node::new(transport, tracker_addr, config);
//! node.run().await?;
//! ```
//!
//! # Module Structure
//!
//! - [`types`] - Core types (HashRange, Entry, Link, Channel, errors)
//! - [`wire`] - Wire format serialization
//! - [`partition`] - Key hashing, range split/absorb, join arbitration
//! - [`store`] - Local entry store
//! - [`state`] - Membership states and events
//! - [`traits`] - Transport trait
//! - [`net`] - Socket transport on tokio
//! - [`node`] - Main Node struct and run loop
//! - [`config`] - Runtime configuration
//! - [`debug`] - Protocol event hooks

// Prevent test features from being used in release builds.
#[cfg(all(feature = "test-support", not(test), not(debug_assertions)))]
compile_error!(
    "The `test-support` feature must not be enabled in release builds. \
     It exposes an in-memory transport intended only for tests."
);

#[macro_use]
pub mod debug;
pub mod config;
pub mod net;
pub mod node;
pub mod partition;
mod router;
mod routing;
mod source;
pub mod state;
pub mod store;
pub mod traits;
pub mod types;
pub mod wire;

// Re-export main types at crate root
pub use config::NodeConfig;
pub use debug::{DebugEmitter, DebugEvent, TracingEmitter};
pub use net::{Interrupter, NetTransport};
pub use node::{Node, NodeIdentity};
pub use partition::hash_key;
pub use state::{Event, NodeState};
pub use store::EntryStore;
pub use traits::{Inbound, Transport};
pub use types::{
    Channel, Entry, EntryError, Error, HashRange, Key, Link, PeerAddr, TransportError,
};
pub use wire::{Decode, DecodeError, Encode, JoinRequest, Pdu};

// Re-export constants
pub use types::{
    HASH_MAX, HASH_MIN, KEY_LEN, MAX_FIELD_LEN, MAX_PDU_LEN, NET_ALIVE, NET_CLOSE_CONNECTION,
    NET_GET_NODE, NET_GET_NODE_RESPONSE, NET_JOIN, NET_JOIN_RESPONSE, NET_LEAVING, NET_NEW_RANGE,
    NET_NEW_RANGE_RESPONSE, STUN_LOOKUP, STUN_RESPONSE, VAL_INSERT, VAL_LOOKUP,
    VAL_LOOKUP_RESPONSE, VAL_REMOVE,
};

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;
    use crate::traits::test_impls::MockTransport;

    #[test]
    fn test_node_creation() {
        let tracker = SocketAddrV4::new(Ipv4Addr::new(192, 0, 2, 1), 4000);
        let node = Node::new(MockTransport::new(), tracker, NodeConfig::default());

        assert_eq!(node.state(), NodeState::Bootstrap);
        assert_eq!(node.range(), None);
        assert!(node.store().is_empty());
        assert!(!node.is_terminal());
    }

    #[test]
    fn test_tags_match_pdus() {
        let key = [0u8; KEY_LEN];
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1);
        let cases = [
            (Pdu::Alive, NET_ALIVE),
            (Pdu::GetExistingMember, NET_GET_NODE),
            (Pdu::GetExistingMemberResponse { member: addr }, NET_GET_NODE_RESPONSE),
            (Pdu::CloseConnection, NET_CLOSE_CONNECTION),
            (Pdu::RangeChange { range: HashRange::FULL }, NET_NEW_RANGE),
            (Pdu::RangeChangeResponse, NET_NEW_RANGE_RESPONSE),
            (Pdu::Leaving { successor: addr }, NET_LEAVING),
            (Pdu::Remove { key }, VAL_REMOVE),
            (Pdu::StunLookup, STUN_LOOKUP),
            (
                Pdu::StunResponse {
                    addr: Ipv4Addr::LOCALHOST,
                },
                STUN_RESPONSE,
            ),
        ];
        for (pdu, tag) in cases {
            assert_eq!(pdu.tag(), tag);
            assert_eq!(pdu.encode_to_vec()[0], tag);
        }
    }
}
