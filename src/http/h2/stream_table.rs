//! Per-connection stream registry
//!
//! The table owns the id counters and the concurrency check. It does no
//! locking of its own: it lives in the connection's private state, reachable
//! only through the connection mutex, so every operation here already runs
//! under that lock.

use super::connection::Role;
use super::error::{Error, Result};
use super::stream::{Stream, StreamId};
use super::MAX_STREAM_ID;
use std::collections::BTreeMap;

#[derive(Debug)]
pub struct StreamTable {
    role: Role,
    streams: BTreeMap<StreamId, Stream>,
    next_local_id: StreamId,
    last_peer_id: StreamId,
}

impl StreamTable {
    pub fn new(role: Role) -> Self {
        StreamTable {
            role,
            streams: BTreeMap::new(),
            next_local_id: role.first_local_id(),
            last_peer_id: 0,
        }
    }

    /// Allocate and insert the next locally-initiated stream
    ///
    /// Fails without touching the table or the counter when `limit`
    /// (the peer's SETTINGS_MAX_CONCURRENT_STREAMS) is already reached.
    pub fn try_reserve(&mut self, limit: Option<u32>, send_window: u32, recv_window: u32) -> Result<&mut Stream> {
        if let Some(limit) = limit {
            if self.streams.len() >= limit as usize {
                return Err(Error::ConcurrencyLimitExceeded {
                    active: self.streams.len(),
                    limit,
                });
            }
        }

        let id = self.next_local_id;
        if id > MAX_STREAM_ID {
            return Err(Error::RefusedStream(id));
        }
        self.next_local_id += 2;

        Ok(self.streams.entry(id).or_insert_with(|| Stream::new(id, send_window, recv_window)))
    }

    /// Admit a stream opened by the peer
    ///
    /// Peer ids must carry the peer's parity and strictly increase.
    pub fn register(&mut self, stream: Stream) -> Result<&mut Stream> {
        let id = stream.id();
        if id == 0 || self.role.is_local(id) {
            return Err(Error::Protocol(format!(
                "Peer opened stream {} with the wrong parity",
                id
            )));
        }
        if id <= self.last_peer_id {
            return Err(Error::Protocol(format!(
                "Peer stream {} does not exceed previous id {}",
                id, self.last_peer_id
            )));
        }

        self.last_peer_id = id;
        Ok(self.streams.entry(id).or_insert(stream))
    }

    /// Note a peer id that was refused, so it is never accepted later
    pub fn skip_peer_id(&mut self, id: StreamId) {
        self.last_peer_id = self.last_peer_id.max(id);
    }

    pub fn lookup(&self, id: StreamId) -> Option<&Stream> {
        self.streams.get(&id)
    }

    pub fn lookup_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        self.streams.get_mut(&id)
    }

    pub fn remove(&mut self, id: StreamId) -> Option<Stream> {
        self.streams.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Streams the peer opened that are still in the table
    pub fn peer_initiated(&self) -> usize {
        self.streams.keys().filter(|id| !self.role.is_local(**id)).count()
    }

    /// Whether `id` is a peer id the peer has not used yet
    pub fn is_new_peer_id(&self, id: StreamId) -> bool {
        id != 0 && !self.role.is_local(id) && id > self.last_peer_id
    }

    pub fn last_peer_id(&self) -> StreamId {
        self.last_peer_id
    }

    pub fn next_local_id(&self) -> StreamId {
        self.next_local_id
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Stream> {
        self.streams.values_mut()
    }

    /// Drop every stream, returning their ids
    pub fn clear(&mut self) -> Vec<StreamId> {
        let ids = self.streams.keys().copied().collect();
        self.streams.clear();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::h2::stream::StreamState;

    #[test]
    fn test_responder_allocates_even_ids() {
        let mut table = StreamTable::new(Role::Responder);
        let ids: Vec<StreamId> = (0..3)
            .map(|_| table.try_reserve(None, 65535, 65535).unwrap().id())
            .collect();
        assert_eq!(ids, [2, 4, 6]);
        assert_eq!(table.next_local_id(), 8);
    }

    #[test]
    fn test_initiator_allocates_odd_ids() {
        let mut table = StreamTable::new(Role::Initiator);
        assert_eq!(table.try_reserve(Some(10), 65535, 65535).unwrap().id(), 1);
        assert_eq!(table.try_reserve(Some(10), 65535, 65535).unwrap().id(), 3);
    }

    #[test]
    fn test_limit_rejects_without_mutation() {
        let mut table = StreamTable::new(Role::Responder);
        table.try_reserve(Some(1), 65535, 65535).unwrap();

        let err = table.try_reserve(Some(1), 65535, 65535).unwrap_err();
        assert!(matches!(err, Error::ConcurrencyLimitExceeded { active: 1, limit: 1 }));
        assert_eq!(table.len(), 1);
        assert_eq!(table.next_local_id(), 4);
    }

    #[test]
    fn test_peer_streams_count_against_limit() {
        let mut table = StreamTable::new(Role::Responder);
        table.register(Stream::new(1, 65535, 65535)).unwrap();
        table.register(Stream::new(3, 65535, 65535)).unwrap();

        assert!(table.try_reserve(Some(2), 65535, 65535).is_err());
        assert_eq!(table.peer_initiated(), 2);
    }

    #[test]
    fn test_register_enforces_parity_and_order() {
        let mut table = StreamTable::new(Role::Responder);
        table.register(Stream::new(3, 65535, 65535)).unwrap();

        assert!(matches!(table.register(Stream::new(4, 65535, 65535)), Err(Error::Protocol(_))));
        assert!(matches!(table.register(Stream::new(1, 65535, 65535)), Err(Error::Protocol(_))));
        assert!(matches!(table.register(Stream::new(3, 65535, 65535)), Err(Error::Protocol(_))));
        assert_eq!(table.last_peer_id(), 3);

        table.skip_peer_id(7);
        assert!(!table.is_new_peer_id(5));
        assert!(table.is_new_peer_id(9));
    }

    #[test]
    fn test_lookup_unknown_is_none() {
        let mut table = StreamTable::new(Role::Responder);
        assert!(table.lookup(5).is_none());

        let stream = table.register(Stream::new(5, 65535, 65535)).unwrap();
        assert_eq!(stream.state(), StreamState::Idle);

        assert!(table.remove(5).is_some());
        assert!(table.lookup(5).is_none());
        // Removal does not make the id reusable
        assert!(table.register(Stream::new(5, 65535, 65535)).is_err());
    }
}
