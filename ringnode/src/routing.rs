//! Keyed request handling.
//!
//! A request whose key hashes into our range is served from the local store.
//! Anything else goes to the successor unmodified; it travels the ring until
//! it reaches the owner.

use tracing::{debug, warn};

use crate::debug::DebugEvent;
use crate::node::Node;
use crate::partition::{hash_key, route, Route};
use crate::traits::Transport;
use crate::types::{
    Channel, Entry, Error, Key, Link, PeerAddr, VAL_INSERT, VAL_LOOKUP, VAL_REMOVE,
};
use crate::wire::{Encode, Pdu};

impl<T: Transport> Node<T> {
    pub(crate) async fn handle_insert(&mut self, entry: Entry) -> Result<(), Error> {
        let key = entry.key;
        let pdu = match self.route_for(&key)? {
            Route::Local => {
                self.store.insert(entry);
                self.served(VAL_INSERT, &key);
                return Ok(());
            }
            Route::Forward => Pdu::Insert(entry),
        };
        self.forward(&pdu, &key).await
    }

    pub(crate) async fn handle_lookup(
        &mut self,
        key: Key,
        requester: PeerAddr,
    ) -> Result<(), Error> {
        match self.route_for(&key)? {
            Route::Local => {
                // A miss is answered with empty fields.
                let entry = self
                    .store
                    .find_by_key(&key)
                    .unwrap_or_else(|| Entry::empty(key));
                let response = Pdu::LookupResponse(entry);
                self.served(VAL_LOOKUP, &key);
                self.transport
                    .send_datagram(Channel::Rendezvous, requester, &response.encode_to_vec())
                    .await?;
                Ok(())
            }
            Route::Forward => self.forward(&Pdu::Lookup { key, requester }, &key).await,
        }
    }

    pub(crate) async fn handle_remove(&mut self, key: Key) -> Result<(), Error> {
        match self.route_for(&key)? {
            Route::Local => {
                let removed = self.store.remove_by_key(&key).is_some();
                debug!(removed, "remove served");
                self.served(VAL_REMOVE, &key);
                Ok(())
            }
            Route::Forward => self.forward(&Pdu::Remove { key }, &key).await,
        }
    }

    fn route_for(&self, key: &Key) -> Result<Route, Error> {
        Ok(route(self.own_range()?, key))
    }

    fn served(&mut self, tag: u8, key: &Key) {
        let hash = hash_key(key);
        debug!(tag, hash, "request served locally");
        emit_debug!(self, DebugEvent::RequestServed { tag, hash });
    }

    async fn forward(&mut self, pdu: &Pdu, key: &Key) -> Result<(), Error> {
        let hash = hash_key(key);
        if !self.transport.is_linked(Link::Successor) {
            warn!(tag = pdu.tag(), hash, "no successor to forward to, request dropped");
            return Ok(());
        }
        self.send_link(Link::Successor, pdu).await?;
        debug!(tag = pdu.tag(), hash, successor = ?self.identity.successor, "request forwarded");
        emit_debug!(
            self,
            DebugEvent::RequestForwarded {
                tag: pdu.tag(),
                hash
            }
        );
        Ok(())
    }
}
