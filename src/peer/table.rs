use super::PeerConnectionEntry;
use crate::types::PeerId;
use std::collections::HashMap;

/// Owned collection of per-peer entries.
///
/// `insert` and `remove` are the only ways an entry enters or leaves the
/// table; a removed entry is handed back so the caller can close it.
#[derive(Debug, Default)]
pub struct PeerTable {
    entries: HashMap<PeerId, PeerConnectionEntry>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry it displaced, if any.
    pub fn insert(&mut self, entry: PeerConnectionEntry) -> Option<PeerConnectionEntry> {
        self.entries.insert(entry.peer().clone(), entry)
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<PeerConnectionEntry> {
        self.entries.remove(peer)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerConnectionEntry> {
        self.entries.get(peer)
    }

    pub fn get_mut(&mut self, peer: &PeerId) -> Option<&mut PeerConnectionEntry> {
        self.entries.get_mut(peer)
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.entries.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Peer identities in sorted order.
    pub fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<_> = self.entries.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn drain(&mut self) -> Vec<PeerConnectionEntry> {
        self.entries.drain().map(|(_, entry)| entry).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::FakePeerConnection;

    fn entry(peer: &str) -> PeerConnectionEntry {
        let (connection, _log) = FakePeerConnection::new();
        PeerConnectionEntry::new(PeerId::new(peer), Box::new(connection))
    }

    #[test]
    fn test_insert_remove() {
        let mut table = PeerTable::new();
        assert!(table.insert(entry("carol")).is_none());
        assert!(table.insert(entry("bob")).is_none());
        assert_eq!(table.peers(), vec![PeerId::new("bob"), PeerId::new("carol")]);

        let removed = table.remove(&PeerId::new("bob")).unwrap();
        assert_eq!(removed.peer().as_str(), "bob");
        assert!(!table.contains(&PeerId::new("bob")));
        assert!(table.remove(&PeerId::new("bob")).is_none());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_insert_returns_displaced_entry() {
        let mut table = PeerTable::new();
        table.insert(entry("bob"));
        assert!(table.insert(entry("bob")).is_some());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_drain_empties_table() {
        let mut table = PeerTable::new();
        table.insert(entry("bob"));
        table.insert(entry("carol"));
        assert_eq!(table.drain().len(), 2);
        assert!(table.is_empty());
    }
}
