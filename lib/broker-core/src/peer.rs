//! Peer bookkeeping: stable identity, slot-table indexing, and the state machine each connected
//! peer walks through between accept and disconnect.

use std::fmt;

/// A stable, display-friendly identity for a peer. Never reused within a worker's lifetime, unlike
/// `PeerSlot` -- log lines and test assertions key on this, not on the slot, since the slot gets
/// recycled as soon as the peer disconnects.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct PeerId {
    worker: u32,
    seq: u64,
    fd: i32,
}

impl PeerId {
    pub fn new(worker: u32, seq: u64, fd: i32) -> PeerId {
        PeerId { worker, seq, fd }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}-{}-{}", self.worker, self.seq, self.fd)
    }
}

/// An index into the worker's peer slot table. Reused via a free list as soon as a peer reaches a
/// terminal state and is swept, so a `PeerSlot` alone is not a safe long-lived handle -- pair it
/// with the `PeerId` recorded in the slot to detect staleness.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct PeerSlot(pub usize);

/// Where a peer sits in the rendezvous lifecycle. Every state but `New` and `Complete` can also be
/// reached by a protocol violation or admission-pressure eviction, which routes through `Dead` or
/// `Victim` instead of `Complete`.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PeerState {
    /// Accepted, not yet sent a request.
    New,
    /// Sent `GET_PAIR`, waiting in the rendezvous table for a complementary peer.
    PairRequested,
    /// Matched; the paired endpoint has been handed off and this connection is done.
    Complete,
    /// Protocol violation, I/O failure, or shutdown drain deadline -- disconnect on next sweep.
    Dead,
    /// Selected by admission-pressure eviction -- disconnect on next sweep.
    Victim,
}

impl PeerState {
    /// Terminal states are swept and disconnected at the end of each tick.
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, PeerState::Complete | PeerState::Dead | PeerState::Victim)
    }
}

/// Per-peer bookkeeping the worker keeps alongside the raw connection. `key`/`mode` are only
/// populated once a `GET_PAIR` request has been validated and the peer has entered
/// `PairRequested`.
pub struct PeerRecord {
    pub id: PeerId,
    pub state: PeerState,
    pub key: Option<Vec<u8>>,
    pub mode: Option<crate::frame::Mode>,
}

impl PeerRecord {
    pub fn new(id: PeerId) -> PeerRecord {
        PeerRecord {
            id,
            state: PeerState::New,
            key: None,
            mode: None,
        }
    }

    pub fn enter_pair_requested(&mut self, key: Vec<u8>, mode: crate::frame::Mode) {
        self.key = Some(key);
        self.mode = Some(mode);
        self.state = PeerState::PairRequested;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_display() {
        let id = PeerId::new(1, 7, 42);
        assert_eq!(id.to_string(), "peer-1-7-42");
    }

    #[test]
    fn terminal_states() {
        assert!(!PeerState::New.is_terminal());
        assert!(!PeerState::PairRequested.is_terminal());
        assert!(PeerState::Complete.is_terminal());
        assert!(PeerState::Dead.is_terminal());
        assert!(PeerState::Victim.is_terminal());
    }

    #[test]
    fn record_transitions_into_pair_requested() {
        let mut record = PeerRecord::new(PeerId::new(0, 0, 3));
        assert_eq!(record.state, PeerState::New);
        record.enter_pair_requested(b"key".to_vec(), crate::frame::Mode::Client);
        assert_eq!(record.state, PeerState::PairRequested);
        assert_eq!(record.key.as_deref(), Some(&b"key"[..]));
    }
}
