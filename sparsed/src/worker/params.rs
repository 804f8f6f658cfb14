//! Merged view over per-shard pull responses.

use crate::shard::Shard;
use crate::tensor::{Float, TensorMap, TensorMapView};
use crate::zoo::ParamLookup;

/// Per-shard parameter slots installed after a pull fan-out. Lookups
/// route by the same shard function the split used, so a name or id
/// is found in exactly the slot its response came from.
pub struct ShardParams {
    shard: Shard,
    slots: Vec<Slot>,
}

enum Slot {
    Empty,
    Owned(TensorMap),
    View(TensorMapView),
}

impl ShardParams {
    pub fn new(shard: Shard) -> Self {
        let slots = (0..shard.size()).map(|_| Slot::Empty).collect();
        Self { shard, slots }
    }

    pub fn clear(&mut self, i: usize) {
        self.slots[i] = Slot::Empty;
    }

    pub fn set_owned(&mut self, i: usize, map: TensorMap) {
        self.slots[i] = Slot::Owned(map);
    }

    pub fn set_view(&mut self, i: usize, view: TensorMapView) {
        self.slots[i] = Slot::View(view);
    }
}

impl ParamLookup for ShardParams {
    fn tsr(&self, name: &str) -> Option<&[Float]> {
        match &self.slots[self.shard.tsr_shard_id(name)] {
            Slot::Empty => None,
            Slot::Owned(map) => map.get_tsr(name).map(|t| t.data()),
            Slot::View(view) => view.get_tsr(name).map(|t| t.data()),
        }
    }

    fn srm_row(&self, name: &str, id: u64) -> Option<&[Float]> {
        match &self.slots[self.shard.srm_shard_id(id)] {
            Slot::Empty => None,
            Slot::Owned(map) => map.get_srm(name).and_then(|s| s.get(id)),
            Slot::View(view) => view.get_srm(name).and_then(|s| s.row(id)),
        }
    }
}
