//! Per-row last-update timestamps.

use bytes::{BufMut, Bytes, BytesMut};
use fnv::{FnvHashMap, FnvHashSet};

use crate::tensor::map::{get_u32, get_u64};
use crate::tensor::Error;

/// Tracks when each sparse row was last touched by a gradient, against
/// a job-supplied clock. Rows older than `now - expire_threshold` are
/// collected by [`TsStore::expire`] and removed from every store that
/// mirrors them.
#[derive(Debug, Clone, Default)]
pub struct TsStore {
    now: u32,
    expire_threshold: u32,
    map: FnvHashMap<u64, u32>,
}

impl TsStore {
    pub fn new(now: u32, expire_threshold: u32) -> Self {
        Self {
            now,
            expire_threshold,
            map: FnvHashMap::default(),
        }
    }

    pub fn now(&self) -> u32 {
        self.now
    }

    pub fn set_now(&mut self, now: u32) {
        self.now = now;
    }

    pub fn expire_threshold(&self) -> u32 {
        self.expire_threshold
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, id: u64) -> Option<u32> {
        self.map.get(&id).copied()
    }

    /// Stamp `id` with the current clock.
    pub fn touch(&mut self, id: u64) {
        self.map.insert(id, self.now);
    }

    /// Insert a raw timestamp; used by loads and tests.
    pub fn insert(&mut self, id: u64, ts: u32) {
        self.map.insert(id, ts);
    }

    /// Remove and return every id with `last_update < now - threshold`.
    pub fn expire(&mut self) -> FnvHashSet<u64> {
        let cutoff = self.now.saturating_sub(self.expire_threshold);
        let expired: FnvHashSet<u64> = self
            .map
            .iter()
            .filter(|(_, ts)| **ts < cutoff)
            .map(|(id, _)| *id)
            .collect();
        self.map.retain(|id, _| !expired.contains(id));
        expired
    }

    pub fn remove_if(&mut self, mut pred: impl FnMut(u64) -> bool) {
        self.map.retain(|id, _| !pred(*id));
    }

    /// Absorb `other`, keeping only ids accepted by `filter`.
    pub fn merge(&mut self, other: TsStore, filter: impl Fn(u64) -> bool) {
        for (id, ts) in other.map {
            if filter(id) {
                self.map.insert(id, ts);
            }
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.map.len() as u64);
        for (id, ts) in &self.map {
            buf.put_u64_le(*id);
            buf.put_u32_le(*ts);
        }
    }

    pub fn decode(bytes: &mut Bytes, now: u32, expire_threshold: u32) -> Result<Self, Error> {
        let count = get_u64(bytes)?;
        let mut store = TsStore::new(now, expire_threshold);
        store.map.reserve(count as usize);
        for _ in 0..count {
            let id = get_u64(bytes)?;
            let ts = get_u32(bytes)?;
            store.map.insert(id, ts);
        }
        Ok(store)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_expire_boundary() {
        let mut store = TsStore::new(1000, 100);
        store.insert(1, 800); // stale
        store.insert(2, 900); // exactly at the cutoff, kept
        store.insert(3, 950);

        let expired = store.expire();
        assert_eq!(expired.len(), 1);
        assert!(expired.contains(&1));
        assert_eq!(store.len(), 2);
        assert!(store.get(2).is_some());
    }

    #[test]
    fn test_touch_uses_now() {
        let mut store = TsStore::new(500, 10);
        store.touch(7);
        assert_eq!(store.get(7), Some(500));
    }

    #[test]
    fn test_codec_round_trip() {
        let mut store = TsStore::new(42, 7);
        store.insert(1, 10);
        store.insert(2, 20);
        let mut buf = BytesMut::new();
        store.encode(&mut buf);
        let mut bytes = buf.freeze();
        let back = TsStore::decode(&mut bytes, 42, 7).unwrap();
        assert_eq!(back.get(1), Some(10));
        assert_eq!(back.get(2), Some(20));
        assert_eq!(back.len(), 2);
    }

    #[test]
    fn test_merge_filter() {
        let mut a = TsStore::new(0, 0);
        let mut b = TsStore::new(0, 0);
        b.insert(2, 5);
        b.insert(3, 6);
        a.merge(b, |id| id == 2);
        assert_eq!(a.len(), 1);
        assert_eq!(a.get(2), Some(5));
    }
}
