//! Frequency-based parameter admission.

use bytes::{BufMut, Bytes, BytesMut};
use fnv::FnvHashMap;

use crate::reader::MiniBatch;
use crate::request::PullRequest;
use crate::tensor::map::{get_u32, get_u64};
use crate::tensor::Error;

/// Lifetime access counts per feature id. An id whose count is still
/// below the threshold never materializes a row: it is dropped from
/// training pull requests and its gradients are discarded.
#[derive(Debug, Clone, Default)]
pub struct FreqStore {
    threshold: u32,
    map: FnvHashMap<u64, u32>,
}

impl FreqStore {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            map: FnvHashMap::default(),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn freq(&self, id: u64) -> u32 {
        self.map.get(&id).copied().unwrap_or(0)
    }

    /// An id is admitted once its lifetime count reaches the
    /// threshold.
    pub fn admitted(&self, id: u64) -> bool {
        self.freq(id) >= self.threshold
    }

    /// Account the batch counts carried by a training pull request,
    /// then drop not-yet-admitted ids from its sparse id sets.
    pub fn filter(&mut self, req: &mut PullRequest) {
        for (id, freq) in &req.id_freq_map {
            let entry = self.map.entry(*id).or_insert(0);
            *entry = entry.saturating_add(*freq);
        }
        for ids in req.srm_map.values_mut() {
            ids.retain(|id| self.admitted(*id));
        }
    }

    /// Per-id occurrence counts of one mini-batch; fills
    /// `PullRequest::id_freq_map` on the worker.
    pub fn id_freq_map_of(batch: &MiniBatch) -> FnvHashMap<u64, u32> {
        let mut map = FnvHashMap::default();
        for row in &batch.rows {
            for (id, _) in row {
                *map.entry(*id).or_insert(0) += 1;
            }
        }
        map
    }

    pub fn remove_if(&mut self, mut pred: impl FnMut(u64) -> bool) {
        self.map.retain(|id, _| !pred(*id));
    }

    /// Absorb `other`, keeping only ids accepted by `filter`.
    pub fn merge(&mut self, other: FreqStore, filter: impl Fn(u64) -> bool) {
        for (id, freq) in other.map {
            if filter(id) {
                let entry = self.map.entry(id).or_insert(0);
                *entry = entry.saturating_add(freq);
            }
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.map.len() as u64);
        for (id, freq) in &self.map {
            buf.put_u64_le(*id);
            buf.put_u32_le(*freq);
        }
    }

    pub fn decode(bytes: &mut Bytes, threshold: u32) -> Result<Self, Error> {
        let count = get_u64(bytes)?;
        let mut store = FreqStore::new(threshold);
        store.map.reserve(count as usize);
        for _ in 0..count {
            let id = get_u64(bytes)?;
            let freq = get_u32(bytes)?;
            store.map.insert(id, freq);
        }
        Ok(store)
    }
}
