//! Transition table and ring membership actions.
//!
//! Every arm of [`Node::transition`] runs the action for entering its
//! destination state and names that state. Events a state has no row for are
//! logged and dropped; the node stays where it is.

use tracing::{debug, error, info, warn};

use crate::debug::DebugEvent;
use crate::node::{Node, PendingJoin};
use crate::partition::{absorb, absorber, challenge, classify, hash_key, split};
use crate::state::{Event, NodeState};
use crate::traits::Transport;
use crate::types::{Channel, Error, HashRange, Link, PeerAddr, UNSET_ADDR};
use crate::wire::{Encode, JoinRequest, Pdu, Writer};

impl<T: Transport> Node<T> {
    pub(crate) async fn transition(&mut self, event: Event) -> Result<NodeState, Error> {
        use NodeState::*;

        let from = self.state;
        let name = event.name();

        let to = match (from, event) {
            (_, Event::Unknown(e)) => return Err(Error::Decode(e)),

            // Bootstrap
            (Bootstrap, Event::Done) => {
                self.request_address().await?;
                AddrRequest
            }
            (AddrRequest, Event::StunAddressResolved(ip)) => {
                info!(%ip, "public address resolved");
                self.identity.public_ip = Some(ip);
                self.send_tracker(&Pdu::GetExistingMember).await?;
                MemberRequest
            }
            (MemberRequest, Event::ExistingMemberFound(member)) => {
                self.send_join(member).await?;
                RendezvousJoin
            }
            (MemberRequest, Event::NoExistingMember) => {
                self.found_ring().await?;
                SoleOwner
            }
            (AddrRequest | MemberRequest | RendezvousJoin, Event::ShutdownRequested) => {
                self.release();
                Terminal
            }

            // Settling back into steady state
            (
                SoleOwner | RendezvousAccept | SoleSplit | SplitExecute | SplitForward
                | RangeAdjust | PeerRejoin | PeerDisconnect,
                Event::Done,
            ) => {
                self.send_alive().await?;
                Steady
            }
            (Serving, Event::Done) => Steady,
            (Steady, Event::TimedOut) => {
                self.send_alive().await?;
                Steady
            }

            // Joining an existing ring
            (RendezvousJoin, Event::JoinAccepted { successor, range }) => {
                self.accept_join(successor, range).await?;
                RendezvousAccept
            }

            // Requests
            (Steady, Event::InsertRequested(entry)) => {
                self.handle_insert(entry).await?;
                Serving
            }
            (Steady, Event::LookupRequested { key, requester }) => {
                self.handle_lookup(key, requester).await?;
                Serving
            }
            (Steady, Event::RemoveRequested { key }) => {
                self.handle_remove(key).await?;
                Serving
            }

            // Admitting a new node
            (Steady, Event::JoinRequested(join)) => {
                self.consider_join(join)?;
                SplitDecision
            }
            (SplitDecision, Event::SelfIsRangeMaximum) => {
                self.execute_split().await?;
                SplitExecute
            }
            (SplitDecision, Event::SelfIsNotRangeMaximum) => {
                self.forward_join().await?;
                SplitForward
            }
            (SplitDecision, Event::PeerLinkAbsent) if self.is_sole_owner() => {
                self.split_sole().await?;
                SoleSplit
            }
            (SplitDecision, Event::PeerLinkAbsent) => {
                self.drop_join();
                Steady
            }

            // Neighbours changing
            (Steady, Event::RangeChangeNotified(range)) => {
                self.absorb_neighbour(range).await?;
                RangeAdjust
            }
            (Steady, Event::PeerLeaving { successor }) => {
                self.rejoin_successor(successor).await?;
                PeerRejoin
            }
            (Steady, Event::PeerClosedConnection) => {
                info!(range = ?self.range, "predecessor disconnected");
                self.transport.close(Link::Predecessor);
                PeerDisconnect
            }

            // Leaving
            (Steady, Event::ShutdownRequested) => {
                info!("shutdown requested");
                if self.defer_leave() {
                    Steady
                } else {
                    LeaveCheck
                }
            }
            (LeaveCheck, Event::PeerLinkPresent) => {
                self.announce_leave().await?;
                AnnounceLeave
            }
            (LeaveCheck, Event::PeerLinkAbsent) if self.is_sole_owner() => {
                info!("last member of the ring, stopping");
                self.release();
                Terminal
            }
            (LeaveCheck, Event::PeerLinkAbsent) => {
                error!(
                    range = ?self.range,
                    entries = self.store.len(),
                    "successor link lost, range cannot be handed over"
                );
                return Err(Error::NotLinked(Link::Successor));
            }
            (AnnounceLeave, Event::RangeChangeAcknowledged) => {
                self.hand_over().await?;
                HandOver
            }
            (HandOver, Event::Done) => {
                self.release();
                Terminal
            }

            (state, Event::TimedOut | Event::NoOp) => state,
            (state, _) => {
                warn!(%state, event = name, "event not handled in this state, dropped");
                emit_debug!(self, DebugEvent::EventDropped { state, event: name });
                state
            }
        };

        if to != from {
            debug!(%from, %to, event = name, "transition");
            emit_debug!(
                self,
                DebugEvent::StateChanged {
                    from,
                    to,
                    event: name
                }
            );
        }
        Ok(to)
    }

    async fn send_tracker(&mut self, pdu: &Pdu) -> Result<(), Error> {
        let tracker = self.tracker()?;
        self.transport
            .send_datagram(Channel::Tracker, tracker, &pdu.encode_to_vec())
            .await?;
        Ok(())
    }

    pub(crate) async fn send_link(&mut self, link: Link, pdu: &Pdu) -> Result<(), Error> {
        self.transport.send(link, &pdu.encode_to_vec()).await?;
        Ok(())
    }

    async fn request_address(&mut self) -> Result<(), Error> {
        self.transport.open_tracker().await?;
        self.send_tracker(&Pdu::StunLookup).await
    }

    /// Heartbeat from the rendezvous socket so the tracker learns where to
    /// send joiners.
    async fn send_alive(&mut self) -> Result<(), Error> {
        let tracker = self.tracker()?;
        self.transport
            .send_datagram(Channel::Rendezvous, tracker, &Pdu::Alive.encode_to_vec())
            .await?;
        Ok(())
    }

    async fn open_member_endpoints(&mut self) -> Result<(), Error> {
        self.identity.rendezvous_port = Some(self.transport.open_rendezvous().await?);
        self.identity.listener_port = Some(self.transport.open_listener().await?);
        Ok(())
    }

    async fn found_ring(&mut self) -> Result<(), Error> {
        self.open_member_endpoints().await?;
        self.store.clear();
        self.identity.successor = None;
        self.set_range(HashRange::FULL);
        info!(addr = ?self.identity.listen_addr(), "no existing member, starting a new ring");
        Ok(())
    }

    async fn send_join(&mut self, member: PeerAddr) -> Result<(), Error> {
        self.open_member_endpoints().await?;
        self.identity.member = Some(member);
        let join = Pdu::Join(JoinRequest {
            prospect: self.own_addr()?,
            max_span: 0,
            max_addr: UNSET_ADDR,
        });
        info!(%member, "joining through existing member");
        self.transport
            .send_datagram(Channel::Rendezvous, member, &join.encode_to_vec())
            .await?;
        Ok(())
    }

    async fn accept_join(&mut self, successor: PeerAddr, range: HashRange) -> Result<(), Error> {
        self.transport.connect(successor).await?;
        self.identity.successor = Some(successor);
        self.set_range(range);
        info!(%successor, %range, "joined ring");
        Ok(())
    }

    fn consider_join(&mut self, join: JoinRequest) -> Result<(), Error> {
        let own_addr = self.own_addr()?;
        let range = self.own_range()?;
        let verdict = classify(&join, own_addr, range);
        let request = challenge(join, own_addr, range);
        debug!(prospect = %join.prospect, ?verdict, max_span = request.max_span, "join received");
        self.join = Some(PendingJoin { request, verdict });
        Ok(())
    }

    /// Split our range, re-point our successor link at the prospect and hand
    /// it the upper half with its entries.
    async fn grant_split(&mut self, successor_for_prospect: PeerAddr) -> Result<(), Error> {
        let Some(PendingJoin { request, .. }) = self.join.take() else {
            return Ok(());
        };
        let range = self.own_range()?;
        let Some((kept, granted)) = split(range) else {
            warn!(prospect = %request.prospect, %range, "range too small to split, join dropped");
            emit_debug!(
                self,
                DebugEvent::JoinDropped {
                    prospect: request.prospect
                }
            );
            return Ok(());
        };

        if self.transport.is_linked(Link::Successor) {
            self.send_link(Link::Successor, &Pdu::CloseConnection).await?;
            self.transport.close(Link::Successor);
        }
        self.transport.connect(request.prospect).await?;
        self.identity.successor = Some(request.prospect);
        self.set_range(kept);

        self.send_link(
            Link::Successor,
            &Pdu::JoinResponse {
                successor: successor_for_prospect,
                range: granted,
            },
        )
        .await?;
        info!(prospect = %request.prospect, %kept, %granted, "split range for new member");
        emit_debug!(
            self,
            DebugEvent::RangeSplit {
                kept,
                granted,
                prospect: request.prospect
            }
        );

        self.transfer_entries(Link::Successor, |hash| granted.contains(hash))
            .await
    }

    async fn execute_split(&mut self) -> Result<(), Error> {
        let old_successor = match self.identity.successor {
            Some(addr) => addr,
            None => self.own_addr()?,
        };
        self.grant_split(old_successor).await
    }

    /// Sole member admitting its first peer: the prospect's successor is us.
    async fn split_sole(&mut self) -> Result<(), Error> {
        let own = self.own_addr()?;
        self.grant_split(own).await
    }

    /// Our successor link is gone, so there is nobody to pass the Join to.
    fn drop_join(&mut self) {
        if let Some(PendingJoin { request, .. }) = self.join.take() {
            warn!(prospect = %request.prospect, "no successor link, join dropped");
            emit_debug!(
                self,
                DebugEvent::JoinDropped {
                    prospect: request.prospect
                }
            );
        }
    }

    async fn forward_join(&mut self) -> Result<(), Error> {
        let Some(PendingJoin { request, .. }) = self.join.take() else {
            return Ok(());
        };
        self.send_link(Link::Successor, &Pdu::Join(request)).await?;
        debug!(prospect = %request.prospect, max_span = request.max_span, "join forwarded");
        emit_debug!(
            self,
            DebugEvent::JoinForwarded {
                max_span: request.max_span,
                max_addr: request.max_addr
            }
        );
        Ok(())
    }

    /// Send every entry whose hash satisfies `pred` to `link` as Inserts.
    pub(crate) async fn transfer_entries<F>(&mut self, link: Link, pred: F) -> Result<(), Error>
    where
        F: Fn(u8) -> bool,
    {
        let moved = self.store.drain_matching(|key| pred(hash_key(key)));
        if moved.is_empty() {
            return Ok(());
        }
        let count = moved.len();
        let mut batch = Writer::new();
        for entry in moved {
            Pdu::Insert(entry).encode(&mut batch);
        }
        self.transport.send(link, batch.as_slice()).await?;
        debug!(?link, count, "entries transferred");
        emit_debug!(self, DebugEvent::EntriesTransferred { to: link, count });
        Ok(())
    }

    /// A leaving neighbour's span arrived: merge it and acknowledge.
    async fn absorb_neighbour(&mut self, theirs: HashRange) -> Result<(), Error> {
        let own = self.own_range()?;
        let Some(merged) = absorb(own, theirs) else {
            error!(%own, %theirs, "leaving neighbour's range is not adjacent, not acknowledged");
            return Ok(());
        };
        let back = match self.last_channel {
            Some(Channel::Successor) => Link::Successor,
            Some(Channel::Predecessor) => Link::Predecessor,
            other => {
                error!(channel = ?other, "range change did not arrive on a ring link");
                return Ok(());
            }
        };
        self.set_range(merged);
        info!(%theirs, %merged, "absorbed leaving neighbour's range");
        self.send_link(back, &Pdu::RangeChangeResponse).await
    }

    /// Our successor is leaving; link to the node it names instead.
    async fn rejoin_successor(&mut self, successor: PeerAddr) -> Result<(), Error> {
        self.transport.close(Link::Successor);
        if successor == self.own_addr()? {
            info!("successor left, ring is down to this node");
            self.identity.successor = None;
            return Ok(());
        }
        self.transport.connect(successor).await?;
        self.identity.successor = Some(successor);
        info!(%successor, "successor replaced");
        Ok(())
    }

    /// Hold a leave until the predecessor link is back: the Leaving notice
    /// has to reach it.
    fn defer_leave(&mut self) -> bool {
        if self.is_sole_owner() || self.transport.is_linked(Link::Predecessor) {
            return false;
        }
        self.leave_deferred = true;
        warn!(range = ?self.range, "no predecessor link, leave deferred");
        emit_debug!(self, DebugEvent::LeaveDeferred);
        true
    }

    async fn announce_leave(&mut self) -> Result<(), Error> {
        let range = self.own_range()?;
        let link = absorber(range);
        if !self.transport.is_linked(link) {
            return Err(Error::NotLinked(link));
        }
        info!(%range, to = ?link, "announcing leave");
        self.send_link(link, &Pdu::RangeChange { range }).await
    }

    /// Entries first, then the neighbours learn about each other.
    async fn hand_over(&mut self) -> Result<(), Error> {
        let range = self.own_range()?;
        let link = absorber(range);
        self.transfer_entries(link, |_| true).await?;

        let successor = self
            .identity
            .successor
            .ok_or(Error::NotLinked(Link::Successor))?;
        if self.transport.is_linked(Link::Predecessor) {
            self.send_link(Link::Predecessor, &Pdu::Leaving { successor }).await?;
        } else {
            warn!("no predecessor link, leave notice not sent");
        }
        self.send_link(Link::Successor, &Pdu::CloseConnection).await?;

        self.transport.close(Link::Predecessor);
        self.transport.close(Link::Successor);
        self.identity.successor = None;
        self.range = None;
        info!(%range, "range handed over");
        Ok(())
    }

    fn release(&mut self) {
        self.transport.shutdown();
        self.pending = None;
    }

    pub(crate) fn set_range(&mut self, range: HashRange) {
        self.range = Some(range);
        emit_debug!(self, DebugEvent::RangeAssigned { range });
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use embassy_futures::block_on;

    use super::*;
    use crate::config::NodeConfig;
    use crate::node::tests::{own_listener, peer, sole_node, step, tracker, Recorder, OWN_IP};
    use crate::traits::test_impls::{Destination, MockTransport, MOCK_RENDEZVOUS_PORT};
    use crate::traits::Inbound;
    use crate::types::Entry;

    fn r(min: u8, max: u8) -> HashRange {
        HashRange::new(min, max).unwrap()
    }

    /// Distinct keys whose hashes fall inside `range`.
    fn keys_in(range: HashRange, n: usize) -> Vec<crate::types::Key> {
        (0u32..)
            .map(|i| {
                let mut k = *b"key-00000000";
                k[4..8].copy_from_slice(&i.to_le_bytes());
                k
            })
            .filter(|k| range.contains(hash_key(k)))
            .take(n)
            .collect()
    }

    fn entry(key: crate::types::Key) -> Entry {
        Entry {
            key,
            name: b"name".to_vec(),
            email: b"mail".to_vec(),
        }
    }

    /// A steady node owning `range` with both ring links up.
    fn linked_node(range: HashRange, successor: PeerAddr) -> Node<MockTransport> {
        let mut node = sole_node();
        node.set_range(range);
        block_on(node.transport_mut().connect(successor)).unwrap();
        node.identity.successor = Some(successor);
        node.transport_mut().accept_predecessor();
        node
    }

    fn on_link(sent: &[(Destination, Pdu)], link: Link) -> Vec<Pdu> {
        sent.iter()
            .filter(|(d, _)| *d == Destination::Link(link))
            .map(|(_, p)| p.clone())
            .collect()
    }

    #[test]
    fn test_join_through_existing_member() {
        let member = peer(9);
        let mut node = Node::new(MockTransport::new(), tracker(), NodeConfig::default());
        step(&mut node);
        node.transport().inject(Channel::Tracker, &Pdu::StunResponse { addr: OWN_IP });
        step(&mut node);
        node.transport().inject(
            Channel::Tracker,
            &Pdu::GetExistingMemberResponse { member },
        );
        node.transport_mut().take_sent();

        assert_eq!(step(&mut node), NodeState::RendezvousJoin);
        assert_eq!(node.identity().member, Some(member));
        let sent = node.transport_mut().take_pdus();
        assert_eq!(
            sent,
            vec![(
                Destination::Datagram {
                    via: Channel::Rendezvous,
                    to: member
                },
                Pdu::Join(JoinRequest {
                    prospect: own_listener(),
                    max_span: 0,
                    max_addr: UNSET_ADDR,
                })
            )]
        );

        // The splitting member connects to us and answers on that stream.
        node.transport_mut().accept_predecessor();
        node.transport().inject(
            Channel::Predecessor,
            &Pdu::JoinResponse {
                successor: peer(3),
                range: r(128, 255),
            },
        );
        assert_eq!(step(&mut node), NodeState::RendezvousAccept);
        assert_eq!(node.range(), Some(r(128, 255)));
        assert_eq!(node.transport().connects(), &[peer(3)]);
        assert_eq!(node.identity().successor, Some(peer(3)));

        assert_eq!(step(&mut node), NodeState::Steady);
        let sent = node.transport_mut().take_pdus();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, Pdu::Alive);
    }

    #[test]
    fn test_sole_owner_splits_for_first_peer() {
        let mut node = sole_node();
        let upper = keys_in(r(128, 255), 3);
        let lower = keys_in(r(0, 127), 2);
        for key in upper.iter().chain(lower.iter()) {
            node.store.insert(entry(*key));
        }

        node.transport().inject(
            Channel::Rendezvous,
            &Pdu::Join(JoinRequest {
                prospect: peer(2),
                max_span: 0,
                max_addr: UNSET_ADDR,
            }),
        );
        assert_eq!(step(&mut node), NodeState::SplitDecision);
        assert_eq!(step(&mut node), NodeState::SoleSplit);

        assert_eq!(node.range(), Some(r(0, 127)));
        assert_eq!(node.transport().connects(), &[peer(2)]);
        assert_eq!(node.store().len(), lower.len());

        let sent = node.transport_mut().take_pdus();
        let succ = on_link(&sent, Link::Successor);
        assert_eq!(
            succ[0],
            Pdu::JoinResponse {
                successor: own_listener(),
                range: r(128, 255),
            }
        );
        let moved: Vec<_> = succ[1..]
            .iter()
            .map(|p| match p {
                Pdu::Insert(e) => e.key,
                other => panic!("expected Insert, got {:?}", other),
            })
            .collect();
        assert_eq!(moved.len(), upper.len());
        assert!(moved.iter().all(|k| upper.contains(k)));
        assert!(!succ.contains(&Pdu::CloseConnection));

        assert_eq!(step(&mut node), NodeState::Steady);
    }

    #[test]
    fn test_maximum_splits_and_releases_old_successor() {
        let mut node = linked_node(r(0, 127), peer(3));
        node.transport().inject(
            Channel::Predecessor,
            &Pdu::Join(JoinRequest {
                prospect: peer(2),
                max_span: 127,
                max_addr: own_listener(),
            }),
        );
        assert_eq!(step(&mut node), NodeState::SplitDecision);
        assert_eq!(step(&mut node), NodeState::SplitExecute);

        let sent = node.transport_mut().take_pdus();
        let succ = on_link(&sent, Link::Successor);
        assert_eq!(
            succ,
            vec![
                Pdu::CloseConnection,
                Pdu::JoinResponse {
                    successor: peer(3),
                    range: r(64, 127),
                },
            ]
        );
        assert_eq!(node.transport().connects(), &[peer(3), peer(2)]);
        assert_eq!(node.identity().successor, Some(peer(2)));
        assert_eq!(node.range(), Some(r(0, 63)));
    }

    #[test]
    fn test_not_maximum_forwards_with_challenge() {
        let mut node = linked_node(r(0, 127), peer(3));

        // Carried challenger is smaller: we take over.
        node.transport().inject(
            Channel::Predecessor,
            &Pdu::Join(JoinRequest {
                prospect: peer(2),
                max_span: 10,
                max_addr: peer(4),
            }),
        );
        assert_eq!(step(&mut node), NodeState::SplitDecision);
        assert_eq!(step(&mut node), NodeState::SplitForward);
        let sent = node.transport_mut().take_pdus();
        assert_eq!(
            on_link(&sent, Link::Successor),
            vec![Pdu::Join(JoinRequest {
                prospect: peer(2),
                max_span: 127,
                max_addr: own_listener(),
            })]
        );
        assert_eq!(step(&mut node), NodeState::Steady);
        node.transport_mut().take_sent();

        // Carried challenger is equal: it keeps the claim.
        let carried = JoinRequest {
            prospect: peer(2),
            max_span: 127,
            max_addr: peer(4),
        };
        node.transport()
            .inject(Channel::Predecessor, &Pdu::Join(carried));
        step(&mut node);
        assert_eq!(step(&mut node), NodeState::SplitForward);
        let sent = node.transport_mut().take_pdus();
        assert_eq!(on_link(&sent, Link::Successor), vec![Pdu::Join(carried)]);
        assert_eq!(node.range(), Some(r(0, 127)));
    }

    #[test]
    fn test_single_value_range_drops_join() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let mut node = linked_node(r(5, 5), peer(3));
        node.debug = Some(Box::new(Recorder(events.clone())));
        node.transport().inject(
            Channel::Predecessor,
            &Pdu::Join(JoinRequest {
                prospect: peer(2),
                max_span: 0,
                max_addr: own_listener(),
            }),
        );
        step(&mut node);
        assert_eq!(step(&mut node), NodeState::SplitExecute);
        assert!(node.transport_mut().take_sent().is_empty());
        assert_eq!(node.range(), Some(r(5, 5)));
        assert!(events
            .borrow()
            .iter()
            .any(|e| matches!(e, DebugEvent::JoinDropped { .. })));
    }

    #[test]
    fn test_range_change_merged_and_acked_on_arrival_link() {
        let mut node = linked_node(r(0, 127), peer(3));
        node.transport()
            .inject(Channel::Successor, &Pdu::RangeChange { range: r(128, 255) });
        assert_eq!(step(&mut node), NodeState::RangeAdjust);
        assert_eq!(node.range(), Some(HashRange::FULL));
        let sent = node.transport_mut().take_pdus();
        assert_eq!(
            on_link(&sent, Link::Successor),
            vec![Pdu::RangeChangeResponse]
        );

        let mut node = linked_node(r(64, 127), peer(3));
        node.transport()
            .inject(Channel::Predecessor, &Pdu::RangeChange { range: r(0, 63) });
        assert_eq!(step(&mut node), NodeState::RangeAdjust);
        assert_eq!(node.range(), Some(r(0, 127)));
        let sent = node.transport_mut().take_pdus();
        assert_eq!(
            on_link(&sent, Link::Predecessor),
            vec![Pdu::RangeChangeResponse]
        );
    }

    #[test]
    fn test_non_adjacent_range_change_not_acked() {
        let mut node = linked_node(r(0, 63), peer(3));
        node.transport()
            .inject(Channel::Successor, &Pdu::RangeChange { range: r(128, 255) });
        assert_eq!(step(&mut node), NodeState::RangeAdjust);
        assert_eq!(node.range(), Some(r(0, 63)));
        assert!(node.transport_mut().take_sent().is_empty());
    }

    #[test]
    fn test_peer_leaving_repoints_successor() {
        let mut node = linked_node(r(0, 127), peer(3));
        node.transport()
            .inject(Channel::Successor, &Pdu::Leaving { successor: peer(4) });
        assert_eq!(step(&mut node), NodeState::PeerRejoin);
        assert_eq!(node.transport().connects(), &[peer(3), peer(4)]);
        assert_eq!(node.identity().successor, Some(peer(4)));
        assert!(node.transport().is_linked(Link::Successor));
    }

    #[test]
    fn test_peer_leaving_naming_self_closes_successor() {
        let mut node = linked_node(r(0, 127), peer(3));
        node.transport().inject(
            Channel::Successor,
            &Pdu::Leaving {
                successor: own_listener(),
            },
        );
        assert_eq!(step(&mut node), NodeState::PeerRejoin);
        assert_eq!(node.transport().connects(), &[peer(3)]);
        assert_eq!(node.identity().successor, None);
        assert!(!node.transport().is_linked(Link::Successor));
    }

    #[test]
    fn test_close_connection_drops_predecessor() {
        let mut node = linked_node(r(0, 127), peer(3));
        node.transport()
            .inject(Channel::Predecessor, &Pdu::CloseConnection);
        assert_eq!(step(&mut node), NodeState::PeerDisconnect);
        assert!(!node.transport().is_linked(Link::Predecessor));
        assert!(node.transport().is_linked(Link::Successor));
    }

    fn leave(node: &mut Node<MockTransport>) -> Vec<(Destination, Pdu)> {
        node.transport().inject_raw(Inbound::Interrupted);
        assert_eq!(step(node), NodeState::LeaveCheck);
        assert_eq!(step(node), NodeState::AnnounceLeave);
        let announce = node.transport_mut().take_pdus();
        assert_eq!(announce.len(), 1);

        let ack_channel = match announce[0].0 {
            Destination::Link(Link::Successor) => Channel::Successor,
            _ => Channel::Predecessor,
        };
        node.transport()
            .inject(ack_channel, &Pdu::RangeChangeResponse);
        assert_eq!(step(node), NodeState::HandOver);
        let mut sent = announce;
        sent.extend(node.transport_mut().take_pdus());
        assert_eq!(step(node), NodeState::Terminal);
        sent
    }

    fn position(sent: &[(Destination, Pdu)], pred: impl Fn(&Pdu) -> bool) -> Vec<usize> {
        sent.iter()
            .enumerate()
            .filter(|(_, (_, p))| pred(p))
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn test_leave_hands_range_up_to_successor() {
        let range = r(64, 127);
        let mut node = linked_node(range, peer(3));
        let keys = keys_in(range, 4);
        for key in &keys {
            node.store.insert(entry(*key));
        }

        let sent = leave(&mut node);
        let succ = on_link(&sent, Link::Successor);
        assert_eq!(succ[0], Pdu::RangeChange { range });
        let moved: Vec<_> = succ[1..=keys.len()]
            .iter()
            .map(|p| match p {
                Pdu::Insert(e) => e.key,
                other => panic!("expected Insert, got {:?}", other),
            })
            .collect();
        assert!(keys.iter().all(|k| moved.contains(k)));
        assert_eq!(succ.last(), Some(&Pdu::CloseConnection));
        assert_eq!(succ.len(), keys.len() + 2);
        assert_eq!(
            on_link(&sent, Link::Predecessor),
            vec![Pdu::Leaving {
                successor: peer(3)
            }]
        );
        assert!(node.store().is_empty());
        assert!(node.transport().is_shut_down());
    }

    #[test]
    fn test_successor_has_every_entry_before_leave_notice() {
        let range = r(0, 63);
        let mut node = linked_node(range, peer(3));
        for key in keys_in(range, 5) {
            node.store.insert(entry(key));
        }

        let sent = leave(&mut node);
        let inserts = position(&sent, |p| matches!(p, Pdu::Insert(_)));
        let notice = position(&sent, |p| matches!(p, Pdu::Leaving { .. }));
        assert_eq!(inserts.len(), 5);
        assert_eq!(notice.len(), 1);
        assert!(inserts.iter().all(|&i| i < notice[0]));
        assert!(inserts
            .iter()
            .all(|&i| sent[i].0 == Destination::Link(Link::Successor)));
    }

    #[test]
    fn test_leave_from_ring_top_hands_down_to_predecessor() {
        let range = r(192, 255);
        let mut node = linked_node(range, peer(3));
        let keys = keys_in(range, 3);
        for key in &keys {
            node.store.insert(entry(*key));
        }

        let sent = leave(&mut node);
        let pred = on_link(&sent, Link::Predecessor);
        assert_eq!(pred[0], Pdu::RangeChange { range });
        assert_eq!(
            pred[1..=keys.len()]
                .iter()
                .filter(|p| matches!(p, Pdu::Insert(_)))
                .count(),
            keys.len()
        );
        assert_eq!(
            pred.last(),
            Some(&Pdu::Leaving {
                successor: peer(3)
            })
        );
        assert_eq!(
            on_link(&sent, Link::Successor),
            vec![Pdu::CloseConnection]
        );
    }

    #[test]
    fn test_leave_waits_for_acknowledgement() {
        let mut node = linked_node(r(64, 127), peer(3));
        node.transport().inject_raw(Inbound::Interrupted);
        step(&mut node);
        step(&mut node);
        node.transport_mut().take_sent();
        assert_eq!(step(&mut node), NodeState::AnnounceLeave);
        assert!(node.transport_mut().take_sent().is_empty());
    }

    #[test]
    fn test_leave_deferred_until_predecessor_returns() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let range = r(64, 127);
        let mut node = linked_node(range, peer(3));
        node.debug = Some(Box::new(Recorder(events.clone())));
        node.store.insert(entry(keys_in(range, 1)[0]));
        node.transport_mut().close(Link::Predecessor);

        node.transport().inject_raw(Inbound::Interrupted);
        assert_eq!(step(&mut node), NodeState::Steady);
        assert!(node.transport_mut().take_sent().is_empty());
        assert!(events.borrow().contains(&DebugEvent::LeaveDeferred));
        assert!(!node.leave_ready());

        // Still serving while it waits.
        assert_eq!(step(&mut node), NodeState::Steady);
        assert_eq!(node.store().len(), 1);
        node.transport_mut().take_sent();

        node.transport_mut().accept_predecessor();
        assert!(node.leave_ready());
        assert_eq!(step(&mut node), NodeState::LeaveCheck);
        assert_eq!(step(&mut node), NodeState::AnnounceLeave);
        node.transport()
            .inject(Channel::Successor, &Pdu::RangeChangeResponse);
        assert_eq!(step(&mut node), NodeState::HandOver);
        assert_eq!(step(&mut node), NodeState::Terminal);
        assert!(node.store().is_empty());

        let sent = node.transport_mut().take_pdus();
        assert_eq!(
            on_link(&sent, Link::Predecessor),
            vec![Pdu::Leaving {
                successor: peer(3)
            }]
        );
    }

    #[test]
    fn test_leave_without_successor_link_fails() {
        let range = r(64, 127);
        let mut node = linked_node(range, peer(3));
        node.store.insert(entry(keys_in(range, 1)[0]));
        node.transport().inject_raw(Inbound::Closed {
            link: Link::Successor,
        });
        assert_eq!(step(&mut node), NodeState::Steady);

        node.transport().inject_raw(Inbound::Interrupted);
        assert_eq!(step(&mut node), NodeState::LeaveCheck);
        let err = block_on(node.step()).unwrap_err();
        assert!(matches!(err, Error::NotLinked(Link::Successor)));
        assert!(node.transport_mut().take_sent().is_empty());
    }

    #[test]
    fn test_join_dropped_without_successor_link() {
        let events = Rc::new(RefCell::new(Vec::new()));
        let mut node = linked_node(r(64, 127), peer(3));
        node.debug = Some(Box::new(Recorder(events.clone())));
        node.transport().inject_raw(Inbound::Closed {
            link: Link::Successor,
        });
        step(&mut node);

        node.transport().inject(
            Channel::Predecessor,
            &Pdu::Join(JoinRequest {
                prospect: peer(2),
                max_span: 63,
                max_addr: own_listener(),
            }),
        );
        assert_eq!(step(&mut node), NodeState::SplitDecision);
        assert_eq!(step(&mut node), NodeState::Steady);
        assert_eq!(node.range(), Some(r(64, 127)));
        assert_eq!(node.transport().connects(), &[peer(3)]);
        assert!(node.transport_mut().take_sent().is_empty());
        assert!(events
            .borrow()
            .iter()
            .any(|e| matches!(e, DebugEvent::JoinDropped { prospect } if *prospect == peer(2))));
    }

    #[test]
    fn test_rendezvous_port_recorded() {
        let node = sole_node();
        assert_eq!(node.identity().rendezvous_port, Some(MOCK_RENDEZVOUS_PORT));
    }
}
