//! Pull requests.

use bytes::{BufMut, Bytes, BytesMut};
use fnv::{FnvHashMap, FnvHashSet};

use crate::tensor::map::{get_str, get_u32, get_u64, get_u8, put_str};
use crate::tensor::Error;

/// What one mini-batch needs from the parameter servers: dense tensors
/// whole, and per sparse parameter the exact row ids the batch
/// touches. `id_freq_map` is only populated in training when the
/// frequency store is active.
#[derive(Debug, Clone, Default)]
pub struct PullRequest {
    pub is_train: bool,
    pub tsr_set: FnvHashSet<String>,
    pub srm_map: FnvHashMap<String, FnvHashSet<u64>>,
    pub id_freq_map: FnvHashMap<u64, u32>,
}

impl PullRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.tsr_set.clear();
        self.srm_map.clear();
        self.id_freq_map.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.tsr_set.is_empty() && self.srm_map.values().all(|ids| ids.is_empty())
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.is_train as u8);

        buf.put_u32_le(self.tsr_set.len() as u32);
        for name in &self.tsr_set {
            put_str(buf, name);
        }

        buf.put_u32_le(self.srm_map.len() as u32);
        for (name, ids) in &self.srm_map {
            put_str(buf, name);
            buf.put_u32_le(ids.len() as u32);
            for id in ids {
                buf.put_u64_le(*id);
            }
        }

        buf.put_u32_le(self.id_freq_map.len() as u32);
        for (id, freq) in &self.id_freq_map {
            buf.put_u64_le(*id);
            buf.put_u32_le(*freq);
        }
    }

    pub fn decode(bytes: &mut Bytes) -> Result<Self, Error> {
        let is_train = get_u8(bytes)? != 0;

        let mut tsr_set = FnvHashSet::default();
        for _ in 0..get_u32(bytes)? {
            tsr_set.insert(get_str(bytes)?);
        }

        let mut srm_map = FnvHashMap::default();
        for _ in 0..get_u32(bytes)? {
            let name = get_str(bytes)?;
            let count = get_u32(bytes)? as usize;
            let mut ids = FnvHashSet::default();
            ids.reserve(count);
            for _ in 0..count {
                ids.insert(get_u64(bytes)?);
            }
            srm_map.insert(name, ids);
        }

        let mut id_freq_map = FnvHashMap::default();
        for _ in 0..get_u32(bytes)? {
            let id = get_u64(bytes)?;
            let freq = get_u32(bytes)?;
            id_freq_map.insert(id, freq);
        }

        Ok(Self {
            is_train,
            tsr_set,
            srm_map,
            id_freq_map,
        })
    }
}
