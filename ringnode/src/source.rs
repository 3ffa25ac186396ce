//! Event source: derive the next event for the router.
//!
//! States that need no input yield `Done` (or a precomputed verdict). Waiting
//! states read the pending buffer first and only then poll the transport.

use tracing::{info, trace, warn};

use crate::debug::DebugEvent;
use crate::node::{Node, PendingMessage};
use crate::partition::JoinVerdict;
use crate::state::{Event, NodeState};
use crate::traits::{Inbound, Transport};
use crate::types::{Channel, Error, Link};
use crate::wire::decode_prefix;

impl<T: Transport> Node<T> {
    pub(crate) async fn next_event(&mut self) -> Result<Event, Error> {
        match self.state {
            state if state.is_pure() => return Ok(Event::Done),
            NodeState::SplitDecision => return Ok(self.split_verdict()),
            NodeState::LeaveCheck => return Ok(self.link_presence()),
            NodeState::Terminal => return Ok(Event::NoOp),
            _ => {}
        }

        if self.leave_ready() {
            self.leave_deferred = false;
            info!("predecessor link restored, resuming leave");
            return Ok(Event::ShutdownRequested);
        }

        if let Some(PendingMessage { channel, data }) = self.pending.take() {
            return Ok(self.decode_event(channel, data));
        }

        let inbound = self.transport.recv(self.config.heartbeat_interval).await?;
        Ok(match inbound {
            None => Event::TimedOut,
            Some(Inbound::Interrupted) => Event::ShutdownRequested,
            Some(Inbound::Closed {
                link: Link::Predecessor,
            }) => Event::PeerClosedConnection,
            Some(Inbound::Closed {
                link: Link::Successor,
            }) => {
                warn!(successor = ?self.identity.successor, "successor closed its end");
                self.transport.close(Link::Successor);
                Event::NoOp
            }
            Some(Inbound::Message { channel, data }) => self.decode_event(channel, data),
        })
    }

    /// Decode the first PDU in `data`; keep any remainder for the next call.
    fn decode_event(&mut self, channel: Channel, mut data: Vec<u8>) -> Event {
        match decode_prefix(&data) {
            Ok((pdu, used)) => {
                if used < data.len() {
                    self.pending = Some(PendingMessage {
                        channel,
                        data: data.split_off(used),
                    });
                }
                trace!(?channel, tag = pdu.tag(), "received");
                self.last_channel = Some(channel);
                Event::from_pdu(pdu)
            }
            Err(e) => {
                warn!(?channel, len = data.len(), error = %e, "undecodable message");
                emit_debug!(
                    self,
                    DebugEvent::DecodeFailed {
                        data_len: data.len()
                    }
                );
                Event::Unknown(e)
            }
        }
    }

    /// Sole member of a self-loop ring: it owns the whole hash space.
    pub(crate) fn is_sole_owner(&self) -> bool {
        self.range.is_some_and(|r| r.is_full())
    }

    fn split_verdict(&self) -> Event {
        if self.is_sole_owner() || !self.transport.is_linked(Link::Successor) {
            return Event::PeerLinkAbsent;
        }
        match self.join.map(|j| j.verdict) {
            Some(JoinVerdict::Maximum) => Event::SelfIsRangeMaximum,
            Some(JoinVerdict::NotMaximum) => Event::SelfIsNotRangeMaximum,
            None => Event::PeerLinkAbsent,
        }
    }

    fn link_presence(&self) -> Event {
        if !self.is_sole_owner() && self.transport.is_linked(Link::Successor) {
            Event::PeerLinkPresent
        } else {
            Event::PeerLinkAbsent
        }
    }
}
