//! The waiting-peer table: keys to the list of slots currently parked on that key, filtered by
//! mode complementarity at lookup time rather than at insertion time, so a `None`-mode peer can
//! still match another `None`-mode peer inserted first.

use std::collections::HashMap;

use crate::frame::Mode;
use crate::peer::PeerSlot;

struct Waiting {
    slot: PeerSlot,
    mode: Mode,
}

/// Keyed by the raw key bytes from `GET_PAIR`. A key's waiting list is removed from the map as
/// soon as it empties, so the map only ever holds keys with at least one peer still parked.
#[derive(Default)]
pub struct RendezvousTable {
    waiting: HashMap<Vec<u8>, Vec<Waiting>>,
}

impl RendezvousTable {
    pub fn new() -> RendezvousTable {
        RendezvousTable::default()
    }

    /// Looks for a waiting peer on `key` whose mode complements `mode`, excluding `slot` itself.
    /// If found, removes and returns it (the caller is responsible for completing the match); if
    /// not, inserts `(slot, mode)` into the waiting list and returns `None`.
    pub fn match_or_wait(&mut self, key: &[u8], slot: PeerSlot, mode: Mode) -> Option<PeerSlot> {
        if let Some(list) = self.waiting.get_mut(key) {
            if let Some(pos) = list.iter().position(|w| w.slot != slot && mode.complements(w.mode)) {
                let found = list.remove(pos);
                if list.is_empty() {
                    self.waiting.remove(key);
                }
                return Some(found.slot);
            }
        }

        self.waiting
            .entry(key.to_vec())
            .or_insert_with(Vec::new)
            .push(Waiting { slot, mode });
        None
    }

    /// Removes `slot` from whatever key it may be waiting on. Called when a waiting peer is
    /// evicted or disconnects before being matched.
    pub fn remove(&mut self, slot: PeerSlot) {
        self.waiting.retain(|_, list| {
            list.retain(|w| w.slot != slot);
            !list.is_empty()
        });
    }

    #[cfg(test)]
    pub fn waiting_count(&self, key: &[u8]) -> usize {
        self.waiting.get(key).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_peer_waits() {
        let mut table = RendezvousTable::new();
        let matched = table.match_or_wait(b"k", PeerSlot(0), Mode::Client);
        assert_eq!(matched, None);
        assert_eq!(table.waiting_count(b"k"), 1);
    }

    #[test]
    fn complementary_peer_matches() {
        let mut table = RendezvousTable::new();
        table.match_or_wait(b"k", PeerSlot(0), Mode::Client);
        let matched = table.match_or_wait(b"k", PeerSlot(1), Mode::Server);
        assert_eq!(matched, Some(PeerSlot(0)));
        assert_eq!(table.waiting_count(b"k"), 0);
    }

    #[test]
    fn non_complementary_peer_waits_alongside() {
        let mut table = RendezvousTable::new();
        table.match_or_wait(b"k", PeerSlot(0), Mode::Client);
        let matched = table.match_or_wait(b"k", PeerSlot(1), Mode::Client);
        assert_eq!(matched, None);
        assert_eq!(table.waiting_count(b"k"), 2);
    }

    #[test]
    fn self_never_matches_itself() {
        let mut table = RendezvousTable::new();
        table.match_or_wait(b"k", PeerSlot(0), Mode::None);
        let matched = table.match_or_wait(b"k", PeerSlot(0), Mode::None);
        assert_eq!(matched, None);
    }

    #[test]
    fn remove_clears_waiting_entry() {
        let mut table = RendezvousTable::new();
        table.match_or_wait(b"k", PeerSlot(0), Mode::Client);
        table.remove(PeerSlot(0));
        assert_eq!(table.waiting_count(b"k"), 0);
    }
}
