//! Bounded in-memory payload cache.
//!
//! Payloads live in an arena of slots; `by_id` maps queue ids to slots.
//! When full, inserting reclaims the least recently accessed slot and hands
//! its payload back to the caller, which decides whether it must be written
//! to disk.

use std::collections::HashMap;

#[derive(Debug)]
struct Slot {
    id: u64,
    payload: String,
    last_access: u64,
}

#[derive(Debug)]
pub(crate) struct PayloadCache {
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    by_id: HashMap<u64, usize>,
    capacity: usize,
    clock: u64,
}

impl PayloadCache {
    pub(crate) fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            by_id: HashMap::with_capacity(capacity),
            capacity,
            clock: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.by_id.len()
    }

    pub(crate) fn contains(&self, id: u64) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Insert a payload, returning the reclaimed `(id, payload)` if the cache was full.
    pub(crate) fn insert(&mut self, id: u64, payload: String) -> Option<(u64, String)> {
        if let Some(&slot) = self.by_id.get(&id) {
            let tick = self.tick();
            if let Some(entry) = self.slots[slot].as_mut() {
                entry.payload = payload;
                entry.last_access = tick;
            }
            return None;
        }

        let evicted = if self.len() >= self.capacity {
            self.evict_least_recent()
        } else {
            None
        };

        let tick = self.tick();
        let entry = Slot {
            id,
            payload,
            last_access: tick,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        };
        self.by_id.insert(id, slot);
        evicted
    }

    /// Read a payload and mark it as recently used.
    pub(crate) fn get(&mut self, id: u64) -> Option<&str> {
        let slot = *self.by_id.get(&id)?;
        let tick = self.tick();
        let entry = self.slots[slot].as_mut()?;
        entry.last_access = tick;
        Some(entry.payload.as_str())
    }

    /// Read a payload without touching its access time.
    pub(crate) fn peek(&self, id: u64) -> Option<&str> {
        let slot = *self.by_id.get(&id)?;
        self.slots[slot].as_ref().map(|e| e.payload.as_str())
    }

    pub(crate) fn remove(&mut self, id: u64) -> Option<String> {
        let slot = self.by_id.remove(&id)?;
        self.free.push(slot);
        self.slots[slot].take().map(|e| e.payload)
    }

    pub(crate) fn max_id(&self) -> Option<u64> {
        self.by_id.keys().copied().max()
    }

    pub(crate) fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.by_id.clear();
    }

    fn evict_least_recent(&mut self) -> Option<(u64, String)> {
        let victim = self
            .slots
            .iter()
            .flatten()
            .min_by_key(|e| e.last_access)
            .map(|e| e.id)?;
        let payload = self.remove(victim)?;
        Some((victim, payload))
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evicts_least_recently_accessed() {
        let mut cache = PayloadCache::new(2);
        assert!(cache.insert(0, "A".into()).is_none());
        assert!(cache.insert(1, "B".into()).is_none());

        // Touch A so B becomes the eviction candidate
        assert_eq!(cache.get(0), Some("A"));

        let evicted = cache.insert(2, "C".into());
        assert_eq!(evicted, Some((1, "B".to_string())));
        assert!(cache.contains(0));
        assert!(cache.contains(2));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_slots_are_reused() {
        let mut cache = PayloadCache::new(2);
        cache.insert(0, "A".into());
        cache.insert(1, "B".into());
        assert_eq!(cache.remove(0), Some("A".to_string()));
        cache.insert(2, "C".into());

        assert_eq!(cache.slots.len(), 2);
        assert_eq!(cache.peek(2), Some("C"));
        assert_eq!(cache.max_id(), Some(2));
    }

    #[test]
    fn test_zero_capacity_behaves_as_one() {
        let mut cache = PayloadCache::new(0);
        cache.insert(0, "A".into());
        assert_eq!(cache.insert(1, "B".into()), Some((0, "A".to_string())));
    }
}
