//! Candidate bookkeeping for iterative lookups.

use super::routing::Peer;
use crate::fingerprint::{Distance, Fingerprint};
use parking_lot::Mutex;
use std::collections::HashSet;

/// Concurrent queries per lookup.
pub const ALPHA: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Pending,
    InFlight,
    Responded,
    Failed,
}

#[derive(Debug)]
struct Candidate {
    peer: Peer,
    distance: Distance,
    state: RequestState,
}

#[derive(Debug, Default)]
struct Candidates {
    sorted: Vec<Candidate>,
    seen: HashSet<Fingerprint>,
}

impl Candidates {
    fn position(&self, fingerprint: &Fingerprint) -> Option<usize> {
        self.sorted
            .iter()
            .position(|c| c.peer.fingerprint == *fingerprint)
    }

    /// The first `width` candidates that have not failed.
    fn window(&self, width: usize) -> impl Iterator<Item = &Candidate> {
        self.sorted
            .iter()
            .filter(|c| c.state != RequestState::Failed)
            .take(width)
    }
}

/// Peers learned during a lookup, kept sorted by distance to the target.
///
/// A peer is only ever added once; peers learned again later are ignored.
#[derive(Debug)]
pub struct PeerRequestSet {
    target: Fingerprint,
    inner: Mutex<Candidates>,
}

impl PeerRequestSet {
    pub fn new(target: Fingerprint) -> Self {
        Self {
            target,
            inner: Mutex::new(Candidates::default()),
        }
    }

    pub fn target(&self) -> Fingerprint {
        self.target
    }

    /// Marks `fingerprint` as seen without making it a candidate.
    pub fn exclude(&self, fingerprint: Fingerprint) {
        self.inner.lock().seen.insert(fingerprint);
    }

    /// Adds unseen peers, returning how many were new.
    pub fn add<I>(&self, peers: I) -> usize
    where
        I: IntoIterator<Item = Peer>,
    {
        let mut inner = self.inner.lock();
        let mut added = 0;
        for peer in peers {
            if !inner.seen.insert(peer.fingerprint) {
                continue;
            }
            let distance = peer.fingerprint.distance(&self.target);
            let index = inner.sorted.partition_point(|c| c.distance < distance);
            inner.sorted.insert(
                index,
                Candidate {
                    peer,
                    distance,
                    state: RequestState::Pending,
                },
            );
            added += 1;
        }
        added
    }

    /// Claims the closest pending peer among the `width` closest live ones.
    pub fn next_pending(&self, width: usize) -> Option<Peer> {
        let mut inner = self.inner.lock();
        let fingerprint = inner
            .window(width)
            .find(|c| c.state == RequestState::Pending)
            .map(|c| c.peer.fingerprint)?;
        let index = inner.position(&fingerprint)?;
        inner.sorted[index].state = RequestState::InFlight;
        Some(inner.sorted[index].peer)
    }

    pub fn mark_responded(&self, fingerprint: &Fingerprint) {
        self.set_state(fingerprint, RequestState::Responded);
    }

    pub fn mark_failed(&self, fingerprint: &Fingerprint) {
        self.set_state(fingerprint, RequestState::Failed);
    }

    fn set_state(&self, fingerprint: &Fingerprint, state: RequestState) {
        let mut inner = self.inner.lock();
        if let Some(index) = inner.position(fingerprint) {
            inner.sorted[index].state = state;
        }
    }

    pub fn state(&self, fingerprint: &Fingerprint) -> Option<RequestState> {
        let inner = self.inner.lock();
        inner.position(fingerprint).map(|i| inner.sorted[i].state)
    }

    /// True once the `width` closest live candidates have all answered, or
    /// nothing is left to ask.
    pub fn is_finished(&self, width: usize) -> bool {
        let inner = self.inner.lock();
        let finished = inner
            .window(width)
            .all(|c| c.state == RequestState::Responded);
        finished
    }

    /// Up to `count` peers that answered, closest first.
    pub fn closest_responded(&self, count: usize) -> Vec<Peer> {
        self.inner
            .lock()
            .sorted
            .iter()
            .filter(|c| c.state == RequestState::Responded)
            .take(count)
            .map(|c| c.peer)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn peer(first: u8) -> Peer {
        let mut bytes = [0u8; 20];
        bytes[0] = first;
        Peer::new(
            Fingerprint::from_bytes(bytes),
            SocketAddr::from(([127, 0, 0, 1], first as u16 + 1000)),
        )
    }

    #[test]
    fn test_add_sorts_and_dedups() {
        let set = PeerRequestSet::new(Fingerprint::from_bytes([0u8; 20]));
        assert_eq!(set.add([peer(0x40), peer(0x01), peer(0x80)]), 3);
        assert_eq!(set.add([peer(0x01), peer(0x02)]), 1);
        assert_eq!(set.len(), 4);

        let order: Vec<u8> = std::iter::from_fn(|| set.next_pending(10))
            .map(|p| p.fingerprint.as_bytes()[0])
            .collect();
        assert_eq!(order, vec![0x01, 0x02, 0x40, 0x80]);
    }

    #[test]
    fn test_excluded_peer_is_never_queued() {
        let set = PeerRequestSet::new(Fingerprint::from_bytes([0u8; 20]));
        set.exclude(peer(0x01).fingerprint);
        assert_eq!(set.add([peer(0x01)]), 0);
        assert!(set.is_empty());
    }

    #[test]
    fn test_failed_peers_leave_the_window() {
        let set = PeerRequestSet::new(Fingerprint::from_bytes([0u8; 20]));
        set.add([peer(0x01), peer(0x02), peer(0x03)]);

        let first = set.next_pending(2).unwrap();
        let second = set.next_pending(2).unwrap();
        assert_eq!(set.next_pending(2), None);

        set.mark_failed(&first.fingerprint);
        set.mark_responded(&second.fingerprint);
        assert!(!set.is_finished(2));

        let third = set.next_pending(2).unwrap();
        assert_eq!(third, peer(0x03));
        set.mark_responded(&third.fingerprint);

        assert!(set.is_finished(2));
        assert_eq!(set.closest_responded(5), vec![peer(0x02), peer(0x03)]);
        assert_eq!(set.state(&first.fingerprint), Some(RequestState::Failed));
    }

    #[test]
    fn test_empty_set_is_finished() {
        let set = PeerRequestSet::new(Fingerprint::from_bytes([0u8; 20]));
        assert!(set.is_finished(3));
        assert_eq!(set.next_pending(3), None);
    }
}
