//! Bidirectional connection/identity registry for one room.

use super::rate_limiter::RateLimiter;
use crate::actors::connection::ConnectionHandle;

use chrono::{DateTime, Utc};
use common::types::{ConnectionId, PeerId};
use std::collections::HashMap;
use thiserror::Error;

/// One admitted client.
#[derive(Debug)]
pub struct ConnectionEntry {
    /// Identity assigned at admission.
    pub peer_id: PeerId,
    /// Outbound queue for this connection.
    pub handle: ConnectionHandle,
    /// Private inbound rate limiter.
    pub rate_limiter: RateLimiter,
    /// Admission time.
    pub joined_at: DateTime<Utc>,
    /// Join order within the room, assigned on registration.
    sequence: u64,
}

impl ConnectionEntry {
    #[must_use]
    pub fn new(
        peer_id: PeerId,
        handle: ConnectionHandle,
        rate_limiter: RateLimiter,
        joined_at: DateTime<Utc>,
    ) -> Self {
        Self {
            peer_id,
            handle,
            rate_limiter,
            joined_at,
            sequence: 0,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.handle.connection_id()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Peer already registered: {0}")]
    DuplicatePeer(PeerId),

    #[error("Connection already registered: {0}")]
    DuplicateConnection(ConnectionId),
}

/// Identity -> entry map plus the connection -> identity reverse map.
///
/// Both maps are updated together by every mutating method, so a lookup in
/// one always agrees with the other.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    entries: HashMap<PeerId, ConnectionEntry>,
    by_connection: HashMap<ConnectionId, PeerId>,
    next_sequence: u64,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry under its connection id and identity.
    ///
    /// # Errors
    ///
    /// Fails without mutating anything if either key is already present.
    pub fn register(&mut self, mut entry: ConnectionEntry) -> Result<PeerId, RegistryError> {
        let peer_id = entry.peer_id;
        let connection_id = entry.connection_id();

        if self.entries.contains_key(&peer_id) {
            return Err(RegistryError::DuplicatePeer(peer_id));
        }
        if self.by_connection.contains_key(&connection_id) {
            return Err(RegistryError::DuplicateConnection(connection_id));
        }

        entry.sequence = self.next_sequence;
        self.next_sequence += 1;

        self.by_connection.insert(connection_id, peer_id);
        self.entries.insert(peer_id, entry);
        Ok(peer_id)
    }

    /// Remove a connection from both maps.
    pub fn unregister(&mut self, connection_id: ConnectionId) -> Option<ConnectionEntry> {
        let peer_id = self.by_connection.remove(&connection_id)?;
        self.entries.remove(&peer_id)
    }

    /// Identity assigned to a connection.
    #[must_use]
    pub fn lookup(&self, connection_id: ConnectionId) -> Option<PeerId> {
        self.by_connection.get(&connection_id).copied()
    }

    pub fn get_mut(&mut self, connection_id: ConnectionId) -> Option<&mut ConnectionEntry> {
        let peer_id = self.by_connection.get(&connection_id)?;
        self.entries.get_mut(peer_id)
    }

    #[must_use]
    pub fn get(&self, peer_id: PeerId) -> Option<&ConnectionEntry> {
        self.entries.get(&peer_id)
    }

    #[must_use]
    pub fn contains_peer(&self, peer_id: PeerId) -> bool {
        self.entries.contains_key(&peer_id)
    }

    /// All entries, in no particular order.
    pub fn all(&self) -> impl Iterator<Item = &ConnectionEntry> {
        self.entries.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered identities in join order.
    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        let mut entries: Vec<&ConnectionEntry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.sequence);
        entries.into_iter().map(|entry| entry.peer_id).collect()
    }

    /// Remove every entry, returning them in join order.
    pub fn drain(&mut self) -> Vec<ConnectionEntry> {
        self.by_connection.clear();
        let mut entries: Vec<ConnectionEntry> = self.entries.drain().map(|(_, e)| e).collect();
        entries.sort_by_key(|entry| entry.sequence);
        entries
    }

    /// Whether both maps describe exactly the same set of connections.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.entries.len() == self.by_connection.len()
            && self.by_connection.iter().all(|(connection_id, peer_id)| {
                self.entries
                    .get(peer_id)
                    .is_some_and(|entry| entry.connection_id() == *connection_id)
            })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::connection::ConnectionHandle;
    use relay_protocol::WireFormat;

    fn entry(peer_id: PeerId, connection_id: ConnectionId) -> ConnectionEntry {
        let (handle, _rx) = ConnectionHandle::new(connection_id, WireFormat::Json, 8);
        ConnectionEntry::new(peer_id, handle, RateLimiter::new(10), Utc::now())
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = ConnectionRegistry::new();
        let peer = PeerId::new();
        let conn = ConnectionId::new();

        assert_eq!(registry.register(entry(peer, conn)).unwrap(), peer);
        assert_eq!(registry.lookup(conn), Some(peer));
        assert!(registry.contains_peer(peer));
        assert_eq!(registry.len(), 1);
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_duplicate_registration_does_not_mutate() {
        let mut registry = ConnectionRegistry::new();
        let peer = PeerId::new();
        let conn = ConnectionId::new();
        registry.register(entry(peer, conn)).unwrap();

        assert_eq!(
            registry.register(entry(peer, ConnectionId::new())),
            Err(RegistryError::DuplicatePeer(peer))
        );
        assert_eq!(
            registry.register(entry(PeerId::new(), conn)),
            Err(RegistryError::DuplicateConnection(conn))
        );
        assert_eq!(registry.len(), 1);
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_unregister_removes_both_sides() {
        let mut registry = ConnectionRegistry::new();
        let peer = PeerId::new();
        let conn = ConnectionId::new();
        registry.register(entry(peer, conn)).unwrap();

        let removed = registry.unregister(conn).unwrap();
        assert_eq!(removed.peer_id, peer);
        assert_eq!(registry.lookup(conn), None);
        assert!(!registry.contains_peer(peer));
        assert!(registry.is_empty());
        assert!(registry.is_consistent());

        assert!(registry.unregister(conn).is_none());
    }

    #[test]
    fn test_peer_ids_in_join_order() {
        let mut registry = ConnectionRegistry::new();
        let peers: Vec<PeerId> = (0..5).map(|_| PeerId::new()).collect();
        let conns: Vec<ConnectionId> = (0..5).map(|_| ConnectionId::new()).collect();

        for (peer, conn) in peers.iter().zip(&conns) {
            registry.register(entry(*peer, *conn)).unwrap();
        }
        registry.unregister(*conns.get(1).unwrap());

        let expected: Vec<PeerId> = peers
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != 1)
            .map(|(_, p)| *p)
            .collect();
        assert_eq!(registry.peer_ids(), expected);

        let drained: Vec<PeerId> = registry.drain().into_iter().map(|e| e.peer_id).collect();
        assert_eq!(drained, expected);
        assert!(registry.is_empty());
        assert!(registry.is_consistent());
    }

    #[test]
    fn test_consistency_under_interleaved_operations() {
        let mut registry = ConnectionRegistry::new();
        let mut live = Vec::new();

        for round in 0..50u32 {
            let conn = ConnectionId::new();
            registry.register(entry(PeerId::new(), conn)).unwrap();
            live.push(conn);

            if round % 3 == 0 {
                let victim = live.remove(live.len() / 2);
                assert!(registry.unregister(victim).is_some());
                // Second removal of the same connection is a no-op
                assert!(registry.unregister(victim).is_none());
            }
            assert!(registry.is_consistent());
            assert_eq!(registry.len(), live.len());
        }
    }
}
