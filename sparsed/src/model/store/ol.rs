//! Online-learning delta tracking.

use fnv::{FnvHashMap, FnvHashSet};

use crate::tensor::{Float, TensorMap};

/// Tracks rows dirtied since the last export so a streaming consumer
/// only receives what changed. A row qualifies once it has accumulated
/// `update_threshold` updates, or drifted `distance_threshold` (L2)
/// from its last exported value.
#[derive(Debug, Clone, Default)]
pub struct OlStore {
    update_threshold: u32,
    distance_threshold: f32,
    counts: FnvHashMap<u64, u32>,
    exported: FnvHashMap<u64, Box<[Float]>>,
}

impl OlStore {
    pub fn new(update_threshold: u32, distance_threshold: f32) -> Self {
        Self {
            update_threshold,
            distance_threshold,
            counts: FnvHashMap::default(),
            exported: FnvHashMap::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    /// Bump the update count for one touched id.
    pub fn touch(&mut self, id: u64) {
        *self.counts.entry(id).or_insert(0) += 1;
    }

    fn drifted(&self, id: u64, row: &[Float]) -> bool {
        match self.exported.get(&id) {
            Some(last) if last.len() == row.len() => {
                let dist2: f64 = row
                    .iter()
                    .zip(last.iter())
                    .map(|(a, b)| {
                        let d = (*a - *b) as f64;
                        d * d
                    })
                    .sum();
                dist2 > (self.distance_threshold as f64).powi(2)
            }
            // Never exported: any update counts as drift.
            _ => true,
        }
    }

    /// Ids ready for export, judged against the current parameters.
    pub fn collect(&self, param: &TensorMap) -> FnvHashSet<u64> {
        let mut out = FnvHashSet::default();
        for (id, count) in &self.counts {
            if *count < self.update_threshold {
                continue;
            }
            let mut row_of = None;
            param.iter().for_each(|(_, tensor)| {
                if let Some(srm) = tensor.as_srm() {
                    if let Some(row) = srm.get(*id) {
                        row_of = Some(row);
                    }
                }
            });
            match row_of {
                Some(row) if self.drifted(*id, row) => {
                    out.insert(*id);
                }
                _ => {}
            }
        }
        out
    }

    /// Mark collected ids as exported and reset their counters.
    pub fn commit(&mut self, param: &TensorMap, exported: &FnvHashSet<u64>) {
        for id in exported {
            self.counts.remove(id);
            for (_, tensor) in param.iter() {
                if let Some(srm) = tensor.as_srm() {
                    if let Some(row) = srm.get(*id) {
                        self.exported.insert(*id, row.into());
                    }
                }
            }
        }
    }

    pub fn remove_if(&mut self, mut pred: impl FnMut(u64) -> bool) {
        self.counts.retain(|id, _| !pred(*id));
        self.exported.retain(|id, _| !pred(*id));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tensor::{Initializer, Srm, Tensor};

    fn param_with_row(id: u64, values: &[Float]) -> TensorMap {
        let mut srm = Srm::new(values.len(), Initializer::zeros());
        srm.assign(id, values).unwrap();
        let mut map = TensorMap::new();
        map.insert("w", Tensor::Srm(srm));
        map
    }

    #[test]
    fn test_update_threshold() {
        let mut store = OlStore::new(2, 0.0);
        let param = param_with_row(1, &[1.0]);
        store.touch(1);
        assert!(store.collect(&param).is_empty());
        store.touch(1);
        assert!(store.collect(&param).contains(&1));
    }

    #[test]
    fn test_commit_resets() {
        let mut store = OlStore::new(1, 0.5);
        let param = param_with_row(1, &[1.0]);
        store.touch(1);
        let dirty = store.collect(&param);
        assert!(dirty.contains(&1));
        store.commit(&param, &dirty);
        // Same value again: inside the distance threshold, not dirty.
        store.touch(1);
        assert!(store.collect(&param).is_empty());
        // A large move crosses the threshold.
        let moved = param_with_row(1, &[2.0]);
        store.touch(1);
        assert!(store.collect(&moved).contains(&1));
    }
}
