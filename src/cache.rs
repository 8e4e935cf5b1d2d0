//! Message-seen cache.
//!
//! De-duplicates message ids within a sliding validity window and remembers,
//! per id, which peers have already sent us the message or been sent it by
//! us. Collisions on id are treated as duplicates regardless of payload; ids
//! are assumed collision-resistant by construction upstream.
//!
//! Eviction is eager at heartbeat (`evict_expired`) with a lazy check on
//! lookup, so an entry past the window is never observable even if it has
//! not been physically removed yet. Callers must treat a miss identically
//! whether the id was never seen or has aged out.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};

use crate::peer::PeerId;
use crate::rpc::MessageId;

struct CacheEntry {
    inserted: Instant,
    /// Peers that sent us this id or were sent it by us.
    peers: HashSet<PeerId>,
}

/// Sliding-window dedup cache keyed by message id.
pub struct MessageCache {
    ttl: Duration,
    entries: HashMap<MessageId, CacheEntry>,
    /// Insertion order for the eager sweep.
    order: VecDeque<(MessageId, Instant)>,
}

impl MessageCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Record an id. Returns true if it was newly inserted, false if it was
    /// already present within the validity window.
    pub fn put(&mut self, id: MessageId, now: Instant) -> bool {
        if let Some(entry) = self.entries.get_mut(&id) {
            if now.duration_since(entry.inserted) <= self.ttl {
                return false;
            }
            // Aged out but not yet swept; treat as fresh.
            entry.inserted = now;
            entry.peers.clear();
            self.order.push_back((id, now));
            return true;
        }

        self.entries.insert(
            id,
            CacheEntry {
                inserted: now,
                peers: HashSet::new(),
            },
        );
        self.order.push_back((id, now));
        true
    }

    pub fn has(&self, id: &MessageId, now: Instant) -> bool {
        self.entries
            .get(id)
            .is_some_and(|e| now.duration_since(e.inserted) <= self.ttl)
    }

    /// Associate a peer with an id (they sent it to us, or we sent it to
    /// them). No-op for unknown or expired ids.
    pub fn record_peer(&mut self, id: &MessageId, peer: PeerId, now: Instant) {
        if let Some(entry) = self.entries.get_mut(id) {
            if now.duration_since(entry.inserted) <= self.ttl {
                entry.peers.insert(peer);
            }
        }
    }

    /// Whether the peer is already known to have the message.
    pub fn peer_known(&self, id: &MessageId, peer: &PeerId, now: Instant) -> bool {
        self.entries
            .get(id)
            .is_some_and(|e| now.duration_since(e.inserted) <= self.ttl && e.peers.contains(peer))
    }

    /// Eagerly remove entries older than the validity window. Normally
    /// invoked once per heartbeat.
    pub fn evict_expired(&mut self, now: Instant) {
        while let Some((id, inserted)) = self.order.front().copied() {
            if now.duration_since(inserted) <= self.ttl {
                break;
            }
            self.order.pop_front();
            // Only drop the entry if it was not refreshed after this
            // insertion record was queued.
            if let Some(entry) = self.entries.get(&id) {
                if entry.inserted <= inserted {
                    self.entries.remove(&id);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(120);

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 32])
    }

    #[test]
    fn second_put_reports_already_present() {
        let mut cache = MessageCache::new(TTL);
        let now = Instant::now();
        assert!(cache.put([1; 32], now));
        assert!(!cache.put([1; 32], now));
        assert!(cache.has(&[1; 32], now));
    }

    #[test]
    fn entry_invisible_after_window_even_before_sweep() {
        let mut cache = MessageCache::new(TTL);
        let now = Instant::now();
        cache.put([1; 32], now);

        let later = now + TTL + Duration::from_secs(1);
        assert!(!cache.has(&[1; 32], later));
        // Fresh again without an intervening sweep.
        assert!(cache.put([1; 32], later));
    }

    #[test]
    fn eager_sweep_removes_only_expired() {
        let mut cache = MessageCache::new(TTL);
        let now = Instant::now();
        cache.put([1; 32], now);
        cache.put([2; 32], now + Duration::from_secs(60));

        cache.evict_expired(now + TTL + Duration::from_secs(1));
        assert_eq!(cache.len(), 1);
        assert!(cache.has(&[2; 32], now + TTL + Duration::from_secs(1)));
    }

    #[test]
    fn put_is_fresh_after_sweep() {
        let mut cache = MessageCache::new(TTL);
        let now = Instant::now();
        cache.put([1; 32], now);

        let later = now + TTL + Duration::from_secs(1);
        cache.evict_expired(later);
        assert!(cache.is_empty());
        assert!(cache.put([1; 32], later));
    }

    #[test]
    fn peer_tracking_per_entry() {
        let mut cache = MessageCache::new(TTL);
        let now = Instant::now();
        cache.put([1; 32], now);
        cache.record_peer(&[1; 32], peer(1), now);

        assert!(cache.peer_known(&[1; 32], &peer(1), now));
        assert!(!cache.peer_known(&[1; 32], &peer(2), now));
        // Unknown id: nothing recorded, nothing known.
        cache.record_peer(&[9; 32], peer(1), now);
        assert!(!cache.peer_known(&[9; 32], &peer(1), now));
    }

    #[test]
    fn refresh_clears_peer_set() {
        let mut cache = MessageCache::new(TTL);
        let now = Instant::now();
        cache.put([1; 32], now);
        cache.record_peer(&[1; 32], peer(1), now);

        let later = now + TTL + Duration::from_secs(1);
        assert!(cache.put([1; 32], later));
        assert!(!cache.peer_known(&[1; 32], &peer(1), later));
    }

    #[test]
    fn refreshed_entry_survives_sweep_of_old_record() {
        let mut cache = MessageCache::new(TTL);
        let now = Instant::now();
        cache.put([1; 32], now);

        let refresh_at = now + TTL + Duration::from_secs(1);
        assert!(cache.put([1; 32], refresh_at));

        // Sweep at a time where the first insertion record is expired but
        // the refreshed entry is not.
        cache.evict_expired(refresh_at + Duration::from_secs(1));
        assert!(cache.has(&[1; 32], refresh_at + Duration::from_secs(1)));
    }
}
