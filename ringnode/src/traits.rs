//! Transport abstraction.
//!
//! The node talks to the network only through [`Transport`], which covers the
//! five endpoints a ring member uses:
//! - tracker channel (datagram)
//! - rendezvous channel (datagram; joins, client requests, heartbeats)
//! - listener (stream; accepts the predecessor)
//! - successor link (outbound stream)
//! - predecessor link (inbound stream)
//!
//! Implementations: [`crate::net::NetTransport`] on tokio sockets, the
//! simulator's in-process transport, and [`test_impls::MockTransport`].

use std::time::Duration;

use crate::types::{Channel, Link, PeerAddr, TransportError};

/// Something the transport read for the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// Bytes from one channel.
    ///
    /// A datagram carries one PDU. Stream data is handed over in whole
    /// frames, possibly several back to back.
    Message { channel: Channel, data: Vec<u8> },
    /// The peer closed a stream link. The transport has already dropped it.
    Closed { link: Link },
    /// Operator asked the node to stop.
    Interrupted,
}

/// Transport trait for network backends.
///
/// One node owns one transport and drives it from a single task, so methods
/// take `&mut self` and futures need not be `Send`.
///
/// # Predecessor acceptance
///
/// The listener accepts a new predecessor only while no predecessor link is
/// installed. A predecessor that is being replaced therefore has its
/// CloseConnection read before the replacement's first bytes.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Open the datagram endpoint facing the tracker.
    async fn open_tracker(&mut self) -> Result<(), TransportError>;

    /// Open the rendezvous datagram endpoint. Returns its local port.
    async fn open_rendezvous(&mut self) -> Result<u16, TransportError>;

    /// Start listening for the predecessor. Returns the listening port.
    async fn open_listener(&mut self) -> Result<u16, TransportError>;

    /// Send a datagram from `via` (tracker or rendezvous channel) to `to`.
    async fn send_datagram(
        &mut self,
        via: Channel,
        to: PeerAddr,
        data: &[u8],
    ) -> Result<(), TransportError>;

    /// Open the successor link to `to`. Any existing successor link must have
    /// been closed first.
    async fn connect(&mut self, to: PeerAddr) -> Result<(), TransportError>;

    /// Write to a stream link.
    async fn send(&mut self, link: Link, data: &[u8]) -> Result<(), TransportError>;

    /// Close a stream link. Nothing further is read from it.
    fn close(&mut self, link: Link);

    /// Whether a stream link is currently installed.
    fn is_linked(&self, link: Link) -> bool;

    /// Wait up to `timeout` for the next input. `Ok(None)` means the timeout
    /// elapsed with nothing to read.
    async fn recv(&mut self, timeout: Duration) -> Result<Option<Inbound>, TransportError>;

    /// Release every endpoint.
    fn shutdown(&mut self);
}

#[cfg(any(test, feature = "test-support"))]
pub mod test_impls {
    //! Mock transport for unit tests.
    //!
    //! Available when running tests or with the `test-support` feature enabled.

    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use embassy_sync::channel::Channel as Queue;

    use super::*;
    use crate::wire::{decode_prefix, Pdu};

    /// Default inbound queue size for MockTransport.
    pub const MOCK_QUEUE_SIZE: usize = 32;

    pub const MOCK_RENDEZVOUS_PORT: u16 = 7001;
    pub const MOCK_LISTENER_PORT: u16 = 7002;

    /// Where a recorded send went.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum Destination {
        Datagram { via: Channel, to: PeerAddr },
        Link(Link),
    }

    /// One recorded send.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub struct Sent {
        pub to: Destination,
        pub data: Vec<u8>,
    }

    impl Sent {
        /// Decode every PDU in the payload.
        pub fn pdus(&self) -> Vec<Pdu> {
            let mut out = Vec::new();
            let mut rest = self.data.as_slice();
            while let Ok((pdu, used)) = decode_prefix(rest) {
                out.push(pdu);
                rest = &rest[used..];
            }
            out
        }
    }

    /// Records everything the node sends; replays injected input.
    ///
    /// `recv` never blocks: an empty queue reads as a timeout.
    pub struct MockTransport {
        inbound: Queue<NoopRawMutex, Inbound, MOCK_QUEUE_SIZE>,
        sent: Vec<Sent>,
        connects: Vec<PeerAddr>,
        opened: Vec<Channel>,
        successor: bool,
        predecessor: bool,
        fail_sends: bool,
        shut_down: bool,
    }

    impl Default for MockTransport {
        fn default() -> Self {
            Self {
                inbound: Queue::new(),
                sent: Vec::new(),
                connects: Vec::new(),
                opened: Vec::new(),
                successor: false,
                predecessor: false,
                fail_sends: false,
                shut_down: false,
            }
        }
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Queue input as if it was read from `channel`.
        pub fn inject(&self, channel: Channel, pdu: &Pdu) {
            use crate::wire::Encode;
            let _ = self.inbound.try_send(Inbound::Message {
                channel,
                data: pdu.encode_to_vec(),
            });
        }

        /// Queue raw input (for malformed-data tests).
        pub fn inject_raw(&self, inbound: Inbound) {
            let _ = self.inbound.try_send(inbound);
        }

        /// Pretend the listener accepted a predecessor.
        pub fn accept_predecessor(&mut self) {
            self.predecessor = true;
        }

        /// Make every later send fail with an I/O error.
        pub fn fail_sends(&mut self) {
            self.fail_sends = true;
        }

        /// Take all sends recorded so far, in order.
        pub fn take_sent(&mut self) -> Vec<Sent> {
            core::mem::take(&mut self.sent)
        }

        /// Take all sends and flatten them to PDUs with their destinations.
        pub fn take_pdus(&mut self) -> Vec<(Destination, Pdu)> {
            self.take_sent()
                .into_iter()
                .flat_map(|s| {
                    let to = s.to;
                    s.pdus().into_iter().map(move |p| (to, p))
                })
                .collect()
        }

        /// Successor connections made so far.
        pub fn connects(&self) -> &[PeerAddr] {
            &self.connects
        }

        pub fn is_open(&self, channel: Channel) -> bool {
            self.opened.contains(&channel)
        }

        pub fn is_shut_down(&self) -> bool {
            self.shut_down
        }

        fn record(&mut self, to: Destination, data: &[u8]) -> Result<(), TransportError> {
            if self.fail_sends {
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "mock send failure",
                )));
            }
            self.sent.push(Sent {
                to,
                data: data.to_vec(),
            });
            Ok(())
        }
    }

    impl Transport for MockTransport {
        async fn open_tracker(&mut self) -> Result<(), TransportError> {
            self.opened.push(Channel::Tracker);
            Ok(())
        }

        async fn open_rendezvous(&mut self) -> Result<u16, TransportError> {
            self.opened.push(Channel::Rendezvous);
            Ok(MOCK_RENDEZVOUS_PORT)
        }

        async fn open_listener(&mut self) -> Result<u16, TransportError> {
            self.opened.push(Channel::Listener);
            Ok(MOCK_LISTENER_PORT)
        }

        async fn send_datagram(
            &mut self,
            via: Channel,
            to: PeerAddr,
            data: &[u8],
        ) -> Result<(), TransportError> {
            if !self.opened.contains(&via) {
                return Err(TransportError::NotOpen(via));
            }
            self.record(Destination::Datagram { via, to }, data)
        }

        async fn connect(&mut self, to: PeerAddr) -> Result<(), TransportError> {
            self.connects.push(to);
            self.successor = true;
            Ok(())
        }

        async fn send(&mut self, link: Link, data: &[u8]) -> Result<(), TransportError> {
            if !self.is_linked(link) {
                return Err(TransportError::NotOpen(link.into()));
            }
            self.record(Destination::Link(link), data)
        }

        fn close(&mut self, link: Link) {
            match link {
                Link::Successor => self.successor = false,
                Link::Predecessor => self.predecessor = false,
            }
        }

        fn is_linked(&self, link: Link) -> bool {
            match link {
                Link::Successor => self.successor,
                Link::Predecessor => self.predecessor,
            }
        }

        async fn recv(&mut self, _timeout: Duration) -> Result<Option<Inbound>, TransportError> {
            let inbound = self.inbound.try_receive().ok();
            if let Some(Inbound::Closed { link }) = &inbound {
                self.close(*link);
            }
            Ok(inbound)
        }

        fn shutdown(&mut self) {
            self.successor = false;
            self.predecessor = false;
            self.opened.clear();
            self.shut_down = true;
        }
    }
}
