//! Socket transport on tokio.
//!
//! Datagram endpoints and stream links each get a reader task. Readers push
//! into one unbounded queue that [`NetTransport::recv`] drains, so the node
//! sees a single ordered feed. Stream readers reassemble frames before
//! forwarding them; the node never sees half a PDU.
//!
//! Links are numbered. Output from a reader whose link has since been closed
//! or replaced is discarded on arrival.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::NodeConfig;
use crate::traits::{Inbound, Transport};
use crate::types::{Channel, Link, PeerAddr, TransportError};
use crate::wire::complete_prefix;

enum Feed {
    Datagram { channel: Channel, data: Vec<u8> },
    Stream { link: Link, id: u64, data: Vec<u8> },
    StreamClosed { link: Link, id: u64 },
    Interrupted,
}

struct DatagramEndpoint {
    socket: Arc<UdpSocket>,
    reader: JoinHandle<()>,
}

struct StreamLink {
    id: u64,
    peer: SocketAddr,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

/// Handle that asks a running node to stop.
#[derive(Clone)]
pub struct Interrupter(mpsc::UnboundedSender<Feed>);

impl Interrupter {
    /// Deliver [`Inbound::Interrupted`] to the transport's next `recv`.
    pub fn interrupt(&self) {
        let _ = self.0.send(Feed::Interrupted);
    }
}

/// [`Transport`] over UDP sockets and TCP streams.
pub struct NetTransport {
    config: NodeConfig,
    tracker: Option<DatagramEndpoint>,
    rendezvous: Option<DatagramEndpoint>,
    listener: Option<TcpListener>,
    successor: Option<StreamLink>,
    predecessor: Option<StreamLink>,
    next_link_id: u64,
    tx: mpsc::UnboundedSender<Feed>,
    rx: mpsc::UnboundedReceiver<Feed>,
}

impl NetTransport {
    pub fn new(config: NodeConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            config,
            tracker: None,
            rendezvous: None,
            listener: None,
            successor: None,
            predecessor: None,
            next_link_id: 0,
            tx,
            rx,
        }
    }

    pub fn interrupter(&self) -> Interrupter {
        Interrupter(self.tx.clone())
    }

    async fn open_datagram(&mut self, channel: Channel) -> Result<DatagramEndpoint, io::Error> {
        let socket = Arc::new(UdpSocket::bind((self.config.bind_ip, 0)).await?);
        debug!(?channel, local = %socket.local_addr()?, "datagram endpoint open");
        let reader = spawn_datagram_reader(
            socket.clone(),
            channel,
            self.tx.clone(),
            self.config.read_buffer_len,
        );
        Ok(DatagramEndpoint { socket, reader })
    }

    fn install(&mut self, link: Link, stream: TcpStream, peer: SocketAddr) {
        self.close(link);
        let _ = stream.set_nodelay(true);
        let id = self.next_link_id;
        self.next_link_id += 1;
        let (read, writer) = stream.into_split();
        let reader = spawn_stream_reader(
            read,
            link,
            id,
            self.tx.clone(),
            self.config.read_buffer_len,
        );
        let slot = match link {
            Link::Successor => &mut self.successor,
            Link::Predecessor => &mut self.predecessor,
        };
        *slot = Some(StreamLink {
            id,
            peer,
            writer,
            reader,
        });
    }

    fn link(&self, link: Link) -> Option<&StreamLink> {
        match link {
            Link::Successor => self.successor.as_ref(),
            Link::Predecessor => self.predecessor.as_ref(),
        }
    }

    fn link_mut(&mut self, link: Link) -> Option<&mut StreamLink> {
        match link {
            Link::Successor => self.successor.as_mut(),
            Link::Predecessor => self.predecessor.as_mut(),
        }
    }

    fn is_current(&self, link: Link, id: u64) -> bool {
        self.link(link).is_some_and(|l| l.id == id)
    }

    /// Turn raw reader output into what the node sees. Stale stream output
    /// yields `None`.
    fn admit(&mut self, feed: Feed) -> Option<Inbound> {
        match feed {
            Feed::Datagram { channel, data } => Some(Inbound::Message { channel, data }),
            Feed::Stream { link, id, data } => {
                if !self.is_current(link, id) {
                    trace!(?link, id, len = data.len(), "discarding stale stream data");
                    return None;
                }
                Some(Inbound::Message {
                    channel: link.into(),
                    data,
                })
            }
            Feed::StreamClosed { link, id } => {
                if !self.is_current(link, id) {
                    return None;
                }
                info!(?link, "peer closed the link");
                self.close(link);
                Some(Inbound::Closed { link })
            }
            Feed::Interrupted => Some(Inbound::Interrupted),
        }
    }
}

impl Drop for NetTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Transport for NetTransport {
    async fn open_tracker(&mut self) -> Result<(), TransportError> {
        let endpoint = self.open_datagram(Channel::Tracker).await?;
        self.tracker = Some(endpoint);
        Ok(())
    }

    async fn open_rendezvous(&mut self) -> Result<u16, TransportError> {
        let endpoint = self.open_datagram(Channel::Rendezvous).await?;
        let port = endpoint.socket.local_addr()?.port();
        self.rendezvous = Some(endpoint);
        Ok(port)
    }

    async fn open_listener(&mut self) -> Result<u16, TransportError> {
        let listener = TcpListener::bind((self.config.bind_ip, 0)).await?;
        let port = listener.local_addr()?.port();
        debug!(port, "listening for predecessor");
        self.listener = Some(listener);
        Ok(port)
    }

    async fn send_datagram(
        &mut self,
        via: Channel,
        to: PeerAddr,
        data: &[u8],
    ) -> Result<(), TransportError> {
        let endpoint = match via {
            Channel::Tracker => self.tracker.as_ref(),
            Channel::Rendezvous => self.rendezvous.as_ref(),
            _ => None,
        }
        .ok_or(TransportError::NotOpen(via))?;
        endpoint.socket.send_to(data, SocketAddr::V4(to)).await?;
        trace!(?via, %to, len = data.len(), "datagram sent");
        Ok(())
    }

    async fn connect(&mut self, to: PeerAddr) -> Result<(), TransportError> {
        let stream = match TcpStream::connect(SocketAddr::V4(to)).await {
            Ok(stream) => stream,
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(TransportError::Unreachable(to));
            }
            Err(e) => return Err(e.into()),
        };
        debug!(%to, "successor link open");
        self.install(Link::Successor, stream, SocketAddr::V4(to));
        Ok(())
    }

    async fn send(&mut self, link: Link, data: &[u8]) -> Result<(), TransportError> {
        let stream = self
            .link_mut(link)
            .ok_or(TransportError::NotOpen(link.into()))?;
        stream.writer.write_all(data).await?;
        trace!(?link, peer = %stream.peer, len = data.len(), "stream write");
        Ok(())
    }

    fn close(&mut self, link: Link) {
        let slot = match link {
            Link::Successor => self.successor.take(),
            Link::Predecessor => self.predecessor.take(),
        };
        if let Some(stream) = slot {
            debug!(?link, peer = %stream.peer, "closing link");
            stream.reader.abort();
        }
    }

    fn is_linked(&self, link: Link) -> bool {
        self.link(link).is_some()
    }

    async fn recv(&mut self, timeout: Duration) -> Result<Option<Inbound>, TransportError> {
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            let accepting = self.predecessor.is_none() && self.listener.is_some();
            tokio::select! {
                biased;
                feed = self.rx.recv() => {
                    // The transport holds a sender, so the queue never ends.
                    let Some(feed) = feed else { return Ok(None) };
                    if let Some(inbound) = self.admit(feed) {
                        return Ok(Some(inbound));
                    }
                }
                accepted = accept_on(self.listener.as_ref()), if accepting => {
                    let (stream, from) = accepted?;
                    info!(%from, "predecessor connected");
                    self.install(Link::Predecessor, stream, from);
                }
                _ = &mut deadline => return Ok(None),
            }
        }
    }

    fn shutdown(&mut self) {
        self.close(Link::Successor);
        self.close(Link::Predecessor);
        self.listener = None;
        for endpoint in [self.tracker.take(), self.rendezvous.take()]
            .into_iter()
            .flatten()
        {
            endpoint.reader.abort();
        }
    }
}

async fn accept_on(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

fn spawn_datagram_reader(
    socket: Arc<UdpSocket>,
    channel: Channel,
    tx: mpsc::UnboundedSender<Feed>,
    buf_len: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; buf_len];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, from)) => {
                    trace!(?channel, %from, len, "datagram received");
                    let data = buf[..len].to_vec();
                    if tx.send(Feed::Datagram { channel, data }).is_err() {
                        break;
                    }
                }
                // ICMP feedback from an earlier send; the socket is still usable.
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    debug!(?channel, error = %e, "datagram peer unreachable");
                }
                Err(e) => {
                    warn!(?channel, error = %e, "datagram receive failed");
                    break;
                }
            }
        }
    })
}

fn spawn_stream_reader(
    mut read: OwnedReadHalf,
    link: Link,
    id: u64,
    tx: mpsc::UnboundedSender<Feed>,
    buf_len: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; buf_len];
        let mut partial: Vec<u8> = Vec::new();
        loop {
            let len = match read.read(&mut buf).await {
                Ok(0) => break,
                Ok(len) => len,
                Err(e) => {
                    debug!(?link, error = %e, "stream read failed");
                    break;
                }
            };
            partial.extend_from_slice(&buf[..len]);
            let complete = complete_prefix(&partial);
            if complete == 0 {
                continue;
            }
            let rest = partial.split_off(complete);
            let data = std::mem::replace(&mut partial, rest);
            if tx.send(Feed::Stream { link, id, data }).is_err() {
                return;
            }
        }
        if !partial.is_empty() {
            debug!(?link, len = partial.len(), "stream ended mid-message");
        }
        let _ = tx.send(Feed::StreamClosed { link, id });
    })
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddrV4};

    use super::*;
    use crate::types::Entry;
    use crate::wire::{Encode, Pdu};

    const WAIT: Duration = Duration::from_secs(2);

    fn loopback() -> NodeConfig {
        NodeConfig {
            bind_ip: Ipv4Addr::LOCALHOST,
            ..NodeConfig::default()
        }
    }

    fn local(port: u16) -> PeerAddr {
        SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)
    }

    async fn linked_pair() -> (NetTransport, NetTransport) {
        let mut a = NetTransport::new(loopback());
        let mut b = NetTransport::new(loopback());
        let port = b.open_listener().await.unwrap();
        a.connect(local(port)).await.unwrap();
        // Accepting happens inside recv.
        assert_eq!(b.recv(Duration::from_millis(200)).await.unwrap(), None);
        assert!(b.is_linked(Link::Predecessor));
        (a, b)
    }

    #[tokio::test]
    async fn test_recv_times_out() {
        let mut t = NetTransport::new(loopback());
        t.open_rendezvous().await.unwrap();
        let got = t.recv(Duration::from_millis(20)).await.unwrap();
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn test_datagram_between_rendezvous_endpoints() {
        let mut a = NetTransport::new(loopback());
        let mut b = NetTransport::new(loopback());
        a.open_rendezvous().await.unwrap();
        let port = b.open_rendezvous().await.unwrap();

        let alive = Pdu::Alive.encode_to_vec();
        a.send_datagram(Channel::Rendezvous, local(port), &alive)
            .await
            .unwrap();

        let got = b.recv(WAIT).await.unwrap();
        assert_eq!(
            got,
            Some(Inbound::Message {
                channel: Channel::Rendezvous,
                data: alive
            })
        );
    }

    #[tokio::test]
    async fn test_datagram_via_unopened_channel_fails() {
        let mut t = NetTransport::new(loopback());
        let err = t
            .send_datagram(Channel::Tracker, local(9), &[0])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotOpen(Channel::Tracker)));
    }

    #[tokio::test]
    async fn test_stream_delivers_whole_frames() {
        let (mut a, mut b) = linked_pair().await;

        let mut bytes = Pdu::CloseConnection.encode_to_vec();
        bytes.extend(
            Pdu::Insert(Entry {
                key: *b"abcdefghijkl",
                name: b"name".to_vec(),
                email: b"mail".to_vec(),
            })
            .encode_to_vec(),
        );
        a.send(Link::Successor, &bytes[..5]).await.unwrap();
        a.send(Link::Successor, &bytes[5..]).await.unwrap();

        let mut received = Vec::new();
        while received.len() < bytes.len() {
            match b.recv(WAIT).await.unwrap() {
                Some(Inbound::Message {
                    channel: Channel::Predecessor,
                    data,
                }) => {
                    assert_eq!(complete_prefix(&data), data.len());
                    received.extend(data);
                }
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(received, bytes);
    }

    #[tokio::test]
    async fn test_close_reported_to_peer() {
        let (mut a, mut b) = linked_pair().await;
        a.close(Link::Successor);
        assert!(!a.is_linked(Link::Successor));

        let got = b.recv(WAIT).await.unwrap();
        assert_eq!(
            got,
            Some(Inbound::Closed {
                link: Link::Predecessor
            })
        );
        assert!(!b.is_linked(Link::Predecessor));
    }

    #[tokio::test]
    async fn test_second_predecessor_waits_for_first_to_close() {
        let (mut a, mut b) = linked_pair().await;
        let port = b.listener.as_ref().unwrap().local_addr().unwrap().port();

        let mut c = NetTransport::new(loopback());
        c.connect(local(port)).await.unwrap();
        c.send(Link::Successor, &Pdu::CloseConnection.encode_to_vec())
            .await
            .unwrap();

        a.send(Link::Successor, &Pdu::RangeChangeResponse.encode_to_vec())
            .await
            .unwrap();
        let first = b.recv(WAIT).await.unwrap();
        assert_eq!(
            first,
            Some(Inbound::Message {
                channel: Channel::Predecessor,
                data: Pdu::RangeChangeResponse.encode_to_vec()
            })
        );

        a.close(Link::Successor);
        assert_eq!(
            b.recv(WAIT).await.unwrap(),
            Some(Inbound::Closed {
                link: Link::Predecessor
            })
        );

        // Only now is the waiting connection accepted.
        let next = loop {
            if let Some(inbound) = b.recv(WAIT).await.unwrap() {
                break inbound;
            }
        };
        assert_eq!(
            next,
            Inbound::Message {
                channel: Channel::Predecessor,
                data: Pdu::CloseConnection.encode_to_vec()
            }
        );
    }

    #[tokio::test]
    async fn test_connect_refused_is_unreachable() {
        let port = {
            let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut t = NetTransport::new(loopback());
        let err = t.connect(local(port)).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(addr) if addr == local(port)));
        assert!(!t.is_linked(Link::Successor));
    }

    #[tokio::test]
    async fn test_interrupter() {
        let mut t = NetTransport::new(loopback());
        t.interrupter().interrupt();
        assert_eq!(t.recv(WAIT).await.unwrap(), Some(Inbound::Interrupted));
    }

    #[tokio::test]
    async fn test_shutdown_releases_everything() {
        let (mut a, _b) = linked_pair().await;
        a.open_tracker().await.unwrap();
        a.shutdown();
        assert!(!a.is_linked(Link::Successor));
        let err = a
            .send_datagram(Channel::Tracker, local(9), &[0])
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotOpen(_)));
    }
}
