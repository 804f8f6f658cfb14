//! One shard of the model.
//!
//! A `ModelShard` is the single source of truth for its slice of the
//! parameters: the param tensors, the optimizer state, and the TS /
//! Freq / OL side stores. It serves pulls and pushes, persists and
//! reloads itself (including across differing shard counts), and hosts
//! the request-splitting helpers used on the worker side.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use fnv::FnvHashSet;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

use sparsed_config::{MiniConfig, FEATURE_KV_PROTOCOL_VERSIONS};

use super::optimizer::{new_optimizer, read_optimizer_name, Optimizer};
use super::persist::{self, Layout};
use super::push::{GradEntry, PushPayload};
use super::store::{FreqStore, OlStore, TsStore};
use super::Error;
use crate::graph::{Graph, TensorKind};
use crate::request::PullRequest;
use crate::shard::Shard;
use crate::tensor::map::TensorMapEncoder;
use crate::tensor::{Tensor, TensorMap, Tsr};

// Keeps per-shard RNG streams apart.
const SEED_STRIDE: u64 = 10099;

pub struct ModelShard {
    shard: Shard,
    shard_id: usize,
    graph: Arc<Graph>,
    rng: StdRng,
    param: TensorMap,
    optimizer: Option<Optimizer>,
    ts_store: Option<TsStore>,
    freq_store: Option<FreqStore>,
    ol_store: Option<OlStore>,
}

impl ModelShard {
    pub fn new(graph: Arc<Graph>, shard: Shard, shard_id: usize, seed: u64) -> Self {
        debug_assert!(shard_id < shard.size());
        Self {
            shard,
            shard_id,
            graph,
            rng: StdRng::seed_from_u64(seed.wrapping_add(shard_id as u64 * SEED_STRIDE)),
            param: TensorMap::new(),
            optimizer: None,
            ts_store: None,
            freq_store: None,
            ol_store: None,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn shard(&self) -> &Shard {
        &self.shard
    }

    pub fn shard_id(&self) -> usize {
        self.shard_id
    }

    pub fn param(&self) -> &TensorMap {
        &self.param
    }

    pub fn ts_store(&self) -> Option<&TsStore> {
        self.ts_store.as_ref()
    }

    pub fn freq_store(&self) -> Option<&FreqStore> {
        self.freq_store.as_ref()
    }

    pub fn has_optimizer(&self) -> bool {
        self.optimizer.is_some()
    }

    pub fn optimizer(&self) -> Option<&Optimizer> {
        self.optimizer.as_ref()
    }

    // ---- init / load / warmup ----------------------------------------

    /// Fresh parameters following each variable's initializer. Dense
    /// tensors exist only on their owning shard; sparse containers
    /// exist everywhere and fill lazily on pull.
    pub fn init_model(&mut self) {
        self.param.clear();
        let graph = self.graph.clone();
        for (name, kind, shape, initializer) in graph.variables() {
            match kind {
                TensorKind::Tsr => {
                    if self.shard.tsr_shard_id(name) == self.shard_id {
                        let mut tsr = Tsr::new(shape.clone());
                        tsr.rand_init(&mut self.rng, initializer);
                        self.param.insert(name, Tensor::Tsr(tsr));
                    }
                }
                TensorKind::Srm => {
                    let srm = crate::tensor::Srm::new(shape.col(), *initializer);
                    self.param.insert(name, Tensor::Srm(srm));
                }
            }
        }
    }

    /// Placeholder containers for every variable: shapes and kinds
    /// without storage. The worker-side local model uses this so the
    /// split helpers can consult tensor kinds.
    pub fn init_placeholder(&mut self) {
        self.param.clear();
        for (name, kind, shape, initializer) in self.graph.clone().variables() {
            match kind {
                TensorKind::Tsr => {
                    self.param
                        .insert(name, Tensor::Tsr(Tsr::placeholder(shape.clone())));
                }
                TensorKind::Srm => {
                    self.param.insert(
                        name,
                        Tensor::Srm(crate::tensor::Srm::new(shape.col(), *initializer)),
                    );
                }
            }
        }
    }

    fn shard_status(&self, dir: &Path) -> Result<(Layout, Option<Shard>), Error> {
        let layout = persist::detect_layout(dir)?;
        let remote = persist::load_shard(dir)?;
        if remote.mode() != self.shard.mode() {
            return Err(Error::ShardModeMismatch);
        }
        if remote == self.shard {
            Ok((layout, None))
        } else {
            Ok((layout, Some(remote)))
        }
    }

    /// Fill in containers a loaded file may lack and re-attach graph
    /// initializers, which are authoritative over saved ones.
    fn ensure_containers(&mut self) -> Result<(), Error> {
        for (name, kind, shape, initializer) in self.graph.clone().variables() {
            match kind {
                TensorKind::Tsr => {
                    if self.shard.tsr_shard_id(name) == self.shard_id
                        && self.param.get_tsr(name).is_none()
                    {
                        return Err(Error::MissingParam(name.into()));
                    }
                }
                TensorKind::Srm => match self.param.get_srm_mut(name) {
                    Some(srm) => srm.set_initializer(*initializer),
                    None => {
                        self.param.insert(
                            name,
                            Tensor::Srm(crate::tensor::Srm::new(shape.col(), *initializer)),
                        );
                    }
                },
            }
        }
        Ok(())
    }

    /// Load parameters saved under `dir`. When the saved shard
    /// configuration differs, every remote shard file is loaded and
    /// merged, filtered down to the rows and tensors this shard owns.
    pub fn load_model(&mut self, dir: &Path) -> Result<(), Error> {
        let (layout, remote) = self.shard_status(dir)?;
        match remote {
            None => {
                let path = persist::model_file(dir, &self.shard, self.shard_id, layout);
                let mut bytes = persist::read_payload(&path, persist::KIND_MODEL)?;
                self.param = TensorMap::decode(&mut bytes)?;
            }
            Some(remote) => {
                info!(
                    saved = remote.size(),
                    runtime = self.shard.size(),
                    "re-sharding model load"
                );
                self.init_model();
                for i in 0..remote.size() {
                    let path = persist::model_file(dir, &remote, i, layout);
                    let mut bytes = persist::read_payload(&path, persist::KIND_MODEL)?;
                    let loaded = TensorMap::decode(&mut bytes)?;
                    let (shard, shard_id) = (&self.shard, self.shard_id);
                    self.param.merge(
                        loaded,
                        |name| shard.tsr_shard_id(name) == shard_id,
                        |id| shard.srm_shard_id(id) == shard_id,
                    )?;
                }
            }
        }
        self.ensure_containers()
    }

    /// Merge a saved model on top of already-initialized state.
    pub fn warmup_model(&mut self, dir: &Path) -> Result<(), Error> {
        let (layout, remote) = self.shard_status(dir)?;
        match remote {
            None => {
                let path = persist::model_file(dir, &self.shard, self.shard_id, layout);
                let mut bytes = persist::read_payload(&path, persist::KIND_MODEL)?;
                let loaded = TensorMap::decode(&mut bytes)?;
                self.param.merge(loaded, |_| true, |_| true)?;
            }
            Some(remote) => {
                for i in 0..remote.size() {
                    let path = persist::model_file(dir, &remote, i, layout);
                    let mut bytes = persist::read_payload(&path, persist::KIND_MODEL)?;
                    let loaded = TensorMap::decode(&mut bytes)?;
                    let (shard, shard_id) = (&self.shard, self.shard_id);
                    self.param.merge(
                        loaded,
                        |name| shard.tsr_shard_id(name) == shard_id,
                        |id| shard.srm_shard_id(id) == shard_id,
                    )?;
                }
            }
        }
        Ok(())
    }

    pub fn init_optimizer(&mut self, name: &str, config: &MiniConfig) -> Result<(), Error> {
        let mut optimizer = new_optimizer(name)?;
        optimizer.init_config(config)?;
        self.optimizer = Some(optimizer);
        Ok(())
    }

    /// The optimizer rule name is read from the saved file header, so
    /// loads do not need to know which rule trained the model.
    pub fn load_optimizer(&mut self, dir: &Path, config: &MiniConfig) -> Result<(), Error> {
        let (layout, remote) = self.shard_status(dir)?;
        let mut optimizer = match remote {
            None => {
                let path = persist::optimizer_file(dir, &self.shard, self.shard_id, layout);
                let mut bytes = persist::read_payload(&path, persist::KIND_OPTIMIZER)?;
                Optimizer::decode(&mut bytes)?
            }
            Some(remote) => {
                let first = persist::optimizer_file(dir, &remote, 0, layout);
                let bytes = persist::read_payload(&first, persist::KIND_OPTIMIZER)?;
                let name = read_optimizer_name(&bytes)?;
                let mut optimizer = new_optimizer(&name)?;
                for i in 0..remote.size() {
                    let path = persist::optimizer_file(dir, &remote, i, layout);
                    let mut bytes = persist::read_payload(&path, persist::KIND_OPTIMIZER)?;
                    let loaded = Optimizer::decode(&mut bytes)?;
                    let (shard, shard_id) = (&self.shard, self.shard_id);
                    optimizer.merge(loaded, |id| shard.srm_shard_id(id) == shard_id)?;
                }
                optimizer
            }
        };
        if !config.is_empty() {
            optimizer.init_config(config)?;
        }
        self.optimizer = Some(optimizer);
        Ok(())
    }

    pub fn warmup_optimizer(&mut self, dir: &Path) -> Result<(), Error> {
        let (layout, remote) = self.shard_status(dir)?;
        let Some(optimizer) = self.optimizer.as_mut() else {
            return Ok(());
        };
        match &remote {
            None => {
                let path = persist::optimizer_file(dir, &self.shard, self.shard_id, layout);
                let mut bytes = persist::read_payload(&path, persist::KIND_OPTIMIZER)?;
                let loaded = Optimizer::decode(&mut bytes)?;
                optimizer.merge(loaded, |_| true)?;
            }
            Some(remote) => {
                for i in 0..remote.size() {
                    let path = persist::optimizer_file(dir, remote, i, layout);
                    let mut bytes = persist::read_payload(&path, persist::KIND_OPTIMIZER)?;
                    let loaded = Optimizer::decode(&mut bytes)?;
                    let shard = &self.shard;
                    let shard_id = self.shard_id;
                    optimizer.merge(loaded, move |id| shard.srm_shard_id(id) == shard_id)?;
                }
            }
        }
        Ok(())
    }

    pub fn init_ts_store(&mut self, now: u32, expire_threshold: u32) {
        self.ts_store = Some(TsStore::new(now, expire_threshold));
    }

    pub fn load_ts_store(&mut self, dir: &Path, now: u32, expire_threshold: u32) -> Result<(), Error> {
        let (layout, remote) = self.shard_status(dir)?;
        let mut store = TsStore::new(now, expire_threshold);
        match remote {
            None => {
                let path = persist::ts_store_file(dir, &self.shard, self.shard_id, layout);
                let mut bytes = persist::read_payload(&path, persist::KIND_TS_STORE)?;
                store = TsStore::decode(&mut bytes, now, expire_threshold)?;
            }
            Some(remote) => {
                for i in 0..remote.size() {
                    let path = persist::ts_store_file(dir, &remote, i, layout);
                    let mut bytes = persist::read_payload(&path, persist::KIND_TS_STORE)?;
                    let loaded = TsStore::decode(&mut bytes, now, expire_threshold)?;
                    let (shard, shard_id) = (&self.shard, self.shard_id);
                    store.merge(loaded, |id| shard.srm_shard_id(id) == shard_id);
                }
            }
        }
        self.ts_store = Some(store);
        Ok(())
    }

    pub fn warmup_ts_store(&mut self, dir: &Path) -> Result<(), Error> {
        let (layout, remote) = self.shard_status(dir)?;
        let Some(store) = self.ts_store.as_mut() else {
            return Ok(());
        };
        let (now, threshold) = (store.now(), store.expire_threshold());
        match &remote {
            None => {
                let path = persist::ts_store_file(dir, &self.shard, self.shard_id, layout);
                let mut bytes = persist::read_payload(&path, persist::KIND_TS_STORE)?;
                let loaded = TsStore::decode(&mut bytes, now, threshold)?;
                store.merge(loaded, |_| true);
            }
            Some(remote) => {
                for i in 0..remote.size() {
                    let path = persist::ts_store_file(dir, remote, i, layout);
                    let mut bytes = persist::read_payload(&path, persist::KIND_TS_STORE)?;
                    let loaded = TsStore::decode(&mut bytes, now, threshold)?;
                    let shard = &self.shard;
                    let shard_id = self.shard_id;
                    store.merge(loaded, move |id| shard.srm_shard_id(id) == shard_id);
                }
            }
        }
        Ok(())
    }

    pub fn init_freq_store(&mut self, threshold: u32) {
        self.freq_store = Some(FreqStore::new(threshold));
    }

    pub fn load_freq_store(&mut self, dir: &Path, threshold: u32) -> Result<(), Error> {
        let (layout, remote) = self.shard_status(dir)?;
        let mut store = FreqStore::new(threshold);
        match remote {
            None => {
                let path = persist::freq_store_file(dir, &self.shard, self.shard_id, layout);
                let mut bytes = persist::read_payload(&path, persist::KIND_FREQ_STORE)?;
                store = FreqStore::decode(&mut bytes, threshold)?;
            }
            Some(remote) => {
                for i in 0..remote.size() {
                    let path = persist::freq_store_file(dir, &remote, i, layout);
                    let mut bytes = persist::read_payload(&path, persist::KIND_FREQ_STORE)?;
                    let loaded = FreqStore::decode(&mut bytes, threshold)?;
                    let (shard, shard_id) = (&self.shard, self.shard_id);
                    store.merge(loaded, |id| shard.srm_shard_id(id) == shard_id);
                }
            }
        }
        self.freq_store = Some(store);
        Ok(())
    }

    pub fn warmup_freq_store(&mut self, dir: &Path) -> Result<(), Error> {
        let (layout, remote) = self.shard_status(dir)?;
        let Some(store) = self.freq_store.as_mut() else {
            return Ok(());
        };
        let threshold = store.threshold();
        match &remote {
            None => {
                let path = persist::freq_store_file(dir, &self.shard, self.shard_id, layout);
                let mut bytes = persist::read_payload(&path, persist::KIND_FREQ_STORE)?;
                let loaded = FreqStore::decode(&mut bytes, threshold)?;
                store.merge(loaded, |_| true);
            }
            Some(remote) => {
                for i in 0..remote.size() {
                    let path = persist::freq_store_file(dir, remote, i, layout);
                    let mut bytes = persist::read_payload(&path, persist::KIND_FREQ_STORE)?;
                    let loaded = FreqStore::decode(&mut bytes, threshold)?;
                    let shard = &self.shard;
                    let shard_id = self.shard_id;
                    store.merge(loaded, move |id| shard.srm_shard_id(id) == shard_id);
                }
            }
        }
        Ok(())
    }

    pub fn init_ol_store(&mut self, update_threshold: u32, distance_threshold: f32) {
        self.ol_store = Some(OlStore::new(update_threshold, distance_threshold));
    }

    // ---- serving -----------------------------------------------------

    /// Admission-filter the request and lazily create the sparse rows
    /// a training pull is about to read.
    pub fn pull_prepare(&mut self, req: &mut PullRequest) {
        if !req.is_train {
            return;
        }
        if let Some(freq) = self.freq_store.as_mut() {
            freq.filter(req);
        }
        let Self { param, rng, .. } = self;
        for (name, ids) in &req.srm_map {
            if let Some(srm) = param.get_srm_mut(name) {
                for id in ids {
                    srm.get_row(rng, *id);
                }
            }
        }
    }

    /// Serialize the pull response straight out of the stores. Rows
    /// missing on a non-training pull are omitted; the returned id set
    /// is always a subset of the requested one.
    pub fn encode_pull(&self, req: &PullRequest, buf: &mut BytesMut) {
        let mut enc = TensorMapEncoder::new(buf);
        for name in &req.tsr_set {
            if let Some(tsr) = self.param.get_tsr(name) {
                if !tsr.is_placeholder() {
                    enc.tsr(name, tsr);
                }
            }
        }
        for (name, ids) in &req.srm_map {
            if ids.is_empty() {
                continue;
            }
            if let Some(srm) = self.param.get_srm(name) {
                enc.srm_rows(
                    name,
                    srm.col(),
                    *srm.initializer(),
                    ids.iter().filter_map(|id| srm.get(*id).map(|row| (*id, row))),
                );
            }
        }
        enc.finish();
    }

    /// Owned pull for in-process trainers.
    pub fn pull(&mut self, req: &mut PullRequest) -> Result<TensorMap, Error> {
        self.pull_prepare(req);
        let mut out = TensorMap::new();
        for name in &req.tsr_set {
            if let Some(tsr) = self.param.get_tsr(name) {
                if !tsr.is_placeholder() {
                    out.insert(name, Tensor::Tsr(tsr.clone()));
                }
            }
        }
        for (name, ids) in &req.srm_map {
            if ids.is_empty() {
                continue;
            }
            if let Some(srm) = self.param.get_srm(name) {
                let mut rows = crate::tensor::Srm::new(srm.col(), *srm.initializer());
                for id in ids {
                    if let Some(row) = srm.get(*id) {
                        rows.assign(*id, row)?;
                    }
                }
                out.insert(name, Tensor::Srm(rows));
            }
        }
        Ok(out)
    }

    /// Apply one batch worth of gradients and overwrites.
    pub fn push(
        &mut self,
        grad: &PushPayload<'_>,
        overwritten: &PushPayload<'_>,
    ) -> Result<(), Error> {
        let Self {
            param,
            optimizer,
            ts_store,
            freq_store,
            ol_store,
            ..
        } = self;

        if !grad.is_empty() {
            if let Some(ol) = ol_store.as_mut() {
                grad.for_each_srm_id(|id| ol.touch(id));
            }
            let freq = freq_store.as_ref();
            let keep = move |id: u64| freq.is_none_or(|f| f.admitted(id));
            if let Some(ts) = ts_store.as_mut() {
                grad.for_each_srm_id(|id| {
                    if keep(id) {
                        ts.touch(id);
                    }
                });
            }
            let optimizer = optimizer.as_mut().ok_or(Error::NoOptimizer)?;
            optimizer.update(param, grad, keep)?;
        }

        if !overwritten.is_empty() {
            if let Some(ol) = ol_store.as_mut() {
                overwritten.for_each_srm_id(|id| ol.touch(id));
            }
            let mut result: Result<(), Error> = Ok(());
            overwritten.for_each(|name, entry| {
                if result.is_err() {
                    return;
                }
                match entry {
                    GradEntry::Dense(values) => {
                        if let Some(tsr) = param.get_tsr_mut(name) {
                            if let Err(e) = tsr.assign(values) {
                                result = Err(e.into());
                            }
                        }
                    }
                    GradEntry::Rows(rows) => {
                        if let Some(srm) = param.get_srm_mut(name) {
                            rows.for_each(|id, row| {
                                if result.is_ok() {
                                    if let Err(e) = srm.assign(id, row) {
                                        result = Err(e.into());
                                    }
                                }
                            });
                        }
                    }
                }
            });
            result?;
        }

        Ok(())
    }

    /// Drop expired rows from the parameters, the optimizer state and
    /// the frequency store.
    pub fn expire_ts_store(&mut self) {
        let Self {
            param,
            optimizer,
            ts_store,
            freq_store,
            ..
        } = self;
        let Some(ts) = ts_store.as_mut() else {
            return;
        };
        let expired: FnvHashSet<u64> = ts.expire();
        param.for_each_srm(|name, srm| {
            let before = srm.len();
            srm.remove_if(|id| expired.contains(&id));
            debug!(
                name,
                expired = before - srm.len(),
                remained = srm.len(),
                "srm expiration"
            );
        });
        if let Some(optimizer) = optimizer.as_mut() {
            optimizer.for_each_state_srm(|_, srm| srm.remove_if(|id| expired.contains(&id)));
        }
        if let Some(freq) = freq_store.as_mut() {
            freq.remove_if(|id| expired.contains(&id));
        }
    }

    /// Drop zero rows before a save.
    pub fn remove_zeros(&mut self) {
        self.param.remove_zeros_srm();
    }

    // ---- persistence -------------------------------------------------

    pub fn save_model(&self, dir: &Path) -> Result<(), Error> {
        let path = persist::model_file(dir, &self.shard, self.shard_id, Layout::Current);
        info!(path = %path.display(), "saving model");
        persist::write_payload(&path, persist::KIND_MODEL, |buf| self.param.encode(buf))
    }

    pub fn save_text_model(&self, dir: &Path) -> Result<(), Error> {
        let path = persist::text_model_file(dir, &self.shard, self.shard_id);
        info!(path = %path.display(), "saving text model");
        let mut out = String::new();
        let mut names: Vec<&str> = self.param.iter().map(|(name, _)| name).collect();
        names.sort_unstable();
        for name in names {
            match self.param.get(name) {
                Some(Tensor::Tsr(tsr)) => {
                    write!(out, "{}\ttsr\t{}", name, tsr.shape()).unwrap();
                    for v in tsr.data() {
                        write!(out, "\t{}", v).unwrap();
                    }
                    out.push('\n');
                }
                Some(Tensor::Srm(srm)) => {
                    let mut ids: Vec<u64> = srm.ids().collect();
                    ids.sort_unstable();
                    for id in ids {
                        write!(out, "{}\tsrm\t{}", name, id).unwrap();
                        for v in srm.get(id).unwrap() {
                            write!(out, "\t{}", v).unwrap();
                        }
                        out.push('\n');
                    }
                }
                None => {}
            }
        }
        fs::write(&path, out).map_err(|e| Error::io(path, e))
    }

    /// Export sparse rows in the feature-kv serving format.
    pub fn save_feature_kv_model(&self, dir: &Path, version: u32) -> Result<(), Error> {
        self.save_feature_kv_filtered(dir, version, None)
    }

    /// Export only the dirty rows tracked by the OL store.
    pub fn save_ol_feature_kv_model(&mut self, dir: &Path, version: u32) -> Result<(), Error> {
        let Some(ol) = self.ol_store.as_mut() else {
            return Ok(());
        };
        let dirty = ol.collect(&self.param);
        self.save_feature_kv_filtered(dir, version, Some(&dirty))?;
        if let Some(ol) = self.ol_store.as_mut() {
            ol.commit(&self.param, &dirty);
        }
        Ok(())
    }

    fn save_feature_kv_filtered(
        &self,
        dir: &Path,
        version: u32,
        only: Option<&FnvHashSet<u64>>,
    ) -> Result<(), Error> {
        if !FEATURE_KV_PROTOCOL_VERSIONS.contains(&version) {
            return Err(Error::FeatureKvVersion(version));
        }
        let path = persist::feature_kv_file(dir, &self.shard, self.shard_id);
        info!(path = %path.display(), version, "saving feature kv model");

        let mut buf = BytesMut::new();
        buf.put_u8(version as u8);
        for (name, tensor) in self.param.iter() {
            let Some(srm) = tensor.as_srm() else { continue };
            crate::tensor::map::put_str(&mut buf, name);
            buf.put_u32_le(srm.col() as u32);
            let rows: Vec<(u64, &[crate::tensor::Float])> = srm
                .iter()
                .filter(|(id, _)| only.is_none_or(|set| set.contains(id)))
                .collect();
            buf.put_u64_le(rows.len() as u64);
            for (id, row) in rows {
                buf.put_u64_le(id);
                if version >= 3 {
                    let freq = self.freq_store.as_ref().map_or(0, |f| f.freq(id));
                    buf.put_u32_le(freq);
                }
                buf.put_slice(bytemuck::cast_slice(row));
            }
        }
        fs::write(&path, &buf).map_err(|e| Error::io(path, e))
    }

    pub fn save_optimizer(&self, dir: &Path) -> Result<(), Error> {
        let Some(optimizer) = self.optimizer.as_ref() else {
            return Err(Error::NoOptimizer);
        };
        let path = persist::optimizer_file(dir, &self.shard, self.shard_id, Layout::Current);
        info!(path = %path.display(), rule = optimizer.name(), "saving optimizer");
        persist::write_payload(&path, persist::KIND_OPTIMIZER, |buf| optimizer.encode(buf))
    }

    pub fn save_ts_store(&self, dir: &Path) -> Result<(), Error> {
        let Some(store) = self.ts_store.as_ref() else {
            return Ok(());
        };
        let path = persist::ts_store_file(dir, &self.shard, self.shard_id, Layout::Current);
        persist::write_payload(&path, persist::KIND_TS_STORE, |buf| store.encode(buf))
    }

    pub fn save_freq_store(&self, dir: &Path) -> Result<(), Error> {
        let Some(store) = self.freq_store.as_ref() else {
            return Ok(());
        };
        let path = persist::freq_store_file(dir, &self.shard, self.shard_id, Layout::Current);
        persist::write_payload(&path, persist::KIND_FREQ_STORE, |buf| store.encode(buf))
    }

    /// Written last, only after every other artifact of this shard.
    pub fn save_success(&self, dir: &Path) -> Result<(), Error> {
        persist::write_success(dir, &self.shard, self.shard_id)
    }

    /// Shard 0 also persists the graph and the shard manifest.
    pub fn save_graph_and_shard(&self, dir: &Path) -> Result<(), Error> {
        persist::save_graph(dir, &self.graph)?;
        persist::save_shard(dir, &self.shard)
    }

    // ---- split helpers (worker side) ---------------------------------

    /// Split a combined pull request into per-shard requests.
    pub fn split_pull_request(&self, full: &PullRequest, out: &mut Vec<PullRequest>) {
        let size = self.shard.size();
        out.resize_with(size, PullRequest::new);
        for req in out.iter_mut() {
            req.clear();
            req.is_train = full.is_train;
        }

        for name in &full.tsr_set {
            out[self.shard.tsr_shard_id(name)]
                .tsr_set
                .insert(name.clone());
        }

        for (name, ids) in &full.srm_map {
            let per_shard = ids.len() / size;
            for req in out.iter_mut() {
                let set = req.srm_map.entry(name.clone()).or_default();
                set.reserve(per_shard);
            }
            for id in ids {
                out[self.shard.srm_shard_id(*id)]
                    .srm_map
                    .get_mut(name)
                    .unwrap()
                    .insert(*id);
            }
        }

        for (id, freq) in &full.id_freq_map {
            out[self.shard.srm_shard_id(*id)]
                .id_freq_map
                .insert(*id, *freq);
        }
    }

    /// Split a combined gradient map, consuming it; rows and tensors
    /// move into the per-shard maps without copying. Gradients whose
    /// name is unknown to the local parameters are dropped.
    pub fn split_grad(&self, mut full: TensorMap, out: &mut Vec<TensorMap>) -> Result<(), Error> {
        let size = self.shard.size();
        out.resize_with(size, TensorMap::new);
        for map in out.iter_mut() {
            map.clear();
        }

        for (name, tensor) in full.drain() {
            let Some(local) = self.param.get(&name) else {
                continue;
            };
            match (local, tensor) {
                (Tensor::Tsr(_), grad @ Tensor::Tsr(_)) => {
                    out[self.shard.tsr_shard_id(&name)].insert(name, grad);
                }
                (Tensor::Tsr(_), grad @ Tensor::Srm(_)) => {
                    // Row gradients against a dense table follow the
                    // table's shard.
                    out[self.shard.tsr_shard_id(&name)].insert(name, grad);
                }
                (Tensor::Srm(_), Tensor::Srm(mut grad)) => {
                    let col = grad.col();
                    let per_shard = grad.len() / size;
                    for map in out.iter_mut() {
                        map.srm_entry(&name, col, crate::tensor::Initializer::zeros())
                            .reserve(per_shard);
                    }
                    for (id, row) in grad.drain() {
                        out[self.shard.srm_shard_id(id)]
                            .get_srm_mut(&name)
                            .unwrap()
                            .insert_owned(id, row)?;
                    }
                }
                (Tensor::Srm(_), Tensor::Tsr(_)) => {
                    return Err(Error::GradShape(name));
                }
            }
        }

        for map in out.iter_mut() {
            map.remove_empty();
        }
        Ok(())
    }

    /// Split overwritten parameters; symmetric to gradients but routed
    /// by the entry's own tensor kind.
    pub fn split_param(&self, mut full: TensorMap, out: &mut Vec<TensorMap>) -> Result<(), Error> {
        let size = self.shard.size();
        out.resize_with(size, TensorMap::new);
        for map in out.iter_mut() {
            map.clear();
        }

        for (name, tensor) in full.drain() {
            match tensor {
                tsr @ Tensor::Tsr(_) => {
                    out[self.shard.tsr_shard_id(&name)].insert(name, tsr);
                }
                Tensor::Srm(mut srm) => {
                    let col = srm.col();
                    let per_shard = srm.len() / size;
                    for map in out.iter_mut() {
                        map.srm_entry(&name, col, crate::tensor::Initializer::zeros())
                            .reserve(per_shard);
                    }
                    for (id, row) in srm.drain() {
                        out[self.shard.srm_shard_id(id)]
                            .get_srm_mut(&name)
                            .unwrap()
                            .insert_owned(id, row)?;
                    }
                }
            }
        }

        for map in out.iter_mut() {
            map.remove_empty();
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::NodeKind;
    use crate::shard::DEFAULT_SHARD_FUNC;
    use crate::tensor::{Initializer, Shape, Srm};
    use fnv::FnvHashSet;

    fn lr_graph() -> Arc<Graph> {
        let mut g = Graph::new();
        g.add_node(
            "x",
            NodeKind::Instance {
                shape: Shape::new(&[-1]),
            },
        )
        .unwrap();
        g.add_node(
            "lr/w",
            NodeKind::Variable {
                kind: TensorKind::Srm,
                shape: Shape::new(&[-1, 2]),
                initializer: Initializer::randn(0.0, 0.01),
            },
        )
        .unwrap();
        g.add_node(
            "lr/b",
            NodeKind::Variable {
                kind: TensorKind::Tsr,
                shape: Shape::new(&[1]),
                initializer: Initializer::zeros(),
            },
        )
        .unwrap();
        g.compile(&[]).unwrap();
        Arc::new(g)
    }

    fn train_request(ids: &[u64]) -> PullRequest {
        let mut req = PullRequest::new();
        req.is_train = true;
        req.tsr_set.insert("lr/b".into());
        req.srm_map
            .insert("lr/w".into(), ids.iter().copied().collect());
        req
    }

    fn grad_for(ids: &[u64], value: crate::tensor::Float) -> TensorMap {
        let mut srm = Srm::new(2, Initializer::zeros());
        for id in ids {
            srm.assign(*id, &[value, value]).unwrap();
        }
        let mut map = TensorMap::new();
        map.insert("lr/w", Tensor::Srm(srm));
        map
    }

    fn shard_with_optimizer(seed: u64) -> ModelShard {
        let mut shard = ModelShard::new(lr_graph(), Shard::none(), 0, seed);
        shard.init_model();
        shard
            .init_optimizer("sgd", &MiniConfig::parse("alpha=0.5").unwrap())
            .unwrap();
        shard
    }

    #[test]
    fn test_lazy_pull_is_deterministic() {
        let pull = |seed| {
            let mut shard = shard_with_optimizer(seed);
            let mut req = train_request(&[3, 1, 2]);
            shard.pull(&mut req).unwrap()
        };
        let a = pull(9527);
        let b = pull(9527);
        let c = pull(1234);
        for id in [1u64, 2, 3] {
            let row_a = a.get_srm("lr/w").unwrap().get(id).unwrap().to_vec();
            let row_b = b.get_srm("lr/w").unwrap().get(id).unwrap().to_vec();
            assert_eq!(row_a, row_b);
        }
        // A different seed draws different rows.
        assert_ne!(
            a.get_srm("lr/w").unwrap().get(1).unwrap(),
            c.get_srm("lr/w").unwrap().get(1).unwrap()
        );
    }

    #[test]
    fn test_predict_pull_omits_unknown_rows() {
        let mut shard = shard_with_optimizer(1);
        let mut req = train_request(&[10]);
        shard.pull(&mut req).unwrap();

        let mut req = train_request(&[10, 11]);
        req.is_train = false;
        let param = shard.pull(&mut req).unwrap();
        let w = param.get_srm("lr/w").unwrap();
        assert!(w.contains(10));
        assert!(!w.contains(11));
        // The miss did not create a row.
        assert_eq!(shard.param().get_srm("lr/w").unwrap().len(), 1);
    }

    #[test]
    fn test_push_applies_gradients() {
        let mut shard = ModelShard::new(lr_graph(), Shard::none(), 0, 1);
        shard.init_model();
        shard
            .init_optimizer("sgd", &MiniConfig::parse("alpha=1").unwrap())
            .unwrap();
        // Zero-init rows for exact arithmetic.
        shard
            .param
            .get_srm_mut("lr/w")
            .unwrap()
            .set_initializer(Initializer::zeros());

        let mut req = train_request(&[7]);
        shard.pull(&mut req).unwrap();
        let grad = grad_for(&[7], 2.0);
        shard
            .push(&PushPayload::Owned(&grad), &PushPayload::Owned(&TensorMap::new()))
            .unwrap();
        assert_eq!(
            shard.param().get_srm("lr/w").unwrap().get(7).unwrap(),
            &[-2.0, -2.0]
        );
    }

    #[test]
    fn test_push_overwrite() {
        let mut shard = shard_with_optimizer(1);
        let mut over = TensorMap::new();
        let mut srm = Srm::new(2, Initializer::zeros());
        srm.assign(42, &[5.0, 6.0]).unwrap();
        over.insert("lr/w", Tensor::Srm(srm));
        shard
            .push(&PushPayload::Owned(&TensorMap::new()), &PushPayload::Owned(&over))
            .unwrap();
        assert_eq!(
            shard.param().get_srm("lr/w").unwrap().get(42).unwrap(),
            &[5.0, 6.0]
        );
    }

    #[test]
    fn test_freq_filter_blocks_rows_and_grads() {
        let mut shard = shard_with_optimizer(1);
        shard.init_freq_store(3);

        // Id 42 seen twice: no row, and its gradient must not apply.
        let mut req = train_request(&[42]);
        req.id_freq_map.insert(42, 2);
        let param = shard.pull(&mut req).unwrap();
        assert!(!param.get_srm("lr/w").is_some_and(|w| w.contains(42)));

        let grad = grad_for(&[42], 1.0);
        shard
            .push(&PushPayload::Owned(&grad), &PushPayload::Owned(&TensorMap::new()))
            .unwrap();
        assert!(!shard.param().get_srm("lr/w").unwrap().contains(42));

        // Id 7 seen five times in one batch: admitted.
        let mut req = train_request(&[7]);
        req.id_freq_map.insert(7, 5);
        let param = shard.pull(&mut req).unwrap();
        assert!(param.get_srm("lr/w").unwrap().contains(7));
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut shard = shard_with_optimizer(77);
        let mut req = train_request(&[1, 2, 3]);
        shard.pull(&mut req).unwrap();
        let grad = grad_for(&[1, 2, 3], 0.25);
        shard
            .push(&PushPayload::Owned(&grad), &PushPayload::Owned(&TensorMap::new()))
            .unwrap();

        shard.save_graph_and_shard(dir.path()).unwrap();
        shard.save_model(dir.path()).unwrap();
        shard.save_optimizer(dir.path()).unwrap();
        shard.save_success(dir.path()).unwrap();

        let mut loaded = ModelShard::new(lr_graph(), Shard::none(), 0, 77);
        loaded.load_model(dir.path()).unwrap();
        loaded
            .load_optimizer(dir.path(), &MiniConfig::default())
            .unwrap();

        let (orig, back) = (
            shard.param().get_srm("lr/w").unwrap(),
            loaded.param().get_srm("lr/w").unwrap(),
        );
        assert_eq!(orig.len(), back.len());
        for (id, row) in orig.iter() {
            assert_eq!(row, back.get(id).unwrap());
        }
        assert_eq!(
            shard.param().get_tsr("lr/b").unwrap().data(),
            loaded.param().get_tsr("lr/b").unwrap().data()
        );
        assert_eq!(loaded.optimizer().unwrap().name(), "sgd");
    }

    #[test]
    fn test_reshard_load() {
        let dir = tempfile::tempdir().unwrap();
        let two = Shard::hash(2, DEFAULT_SHARD_FUNC).unwrap();
        let ids: Vec<u64> = (0..40).collect();

        // Train under N=2: each shard creates only its own rows.
        for shard_id in 0..2 {
            let mut shard = ModelShard::new(lr_graph(), two.clone(), shard_id, 5);
            shard.init_model();
            shard
                .init_optimizer("sgd", &MiniConfig::default())
                .unwrap();
            let my_ids: Vec<u64> = ids
                .iter()
                .copied()
                .filter(|id| two.srm_shard_id(*id) == shard_id)
                .collect();
            let mut req = train_request(&my_ids);
            shard.pull(&mut req).unwrap();
            if shard_id == 0 {
                shard.save_graph_and_shard(dir.path()).unwrap();
            }
            shard.save_model(dir.path()).unwrap();
            shard.save_optimizer(dir.path()).unwrap();
            shard.save_success(dir.path()).unwrap();
        }

        // Reload under N=3: every id lands on exactly one shard, with
        // its original values.
        let three = Shard::hash(3, DEFAULT_SHARD_FUNC).unwrap();
        let mut shards = Vec::new();
        for shard_id in 0..3 {
            let mut shard = ModelShard::new(lr_graph(), three.clone(), shard_id, 5);
            shard.load_model(dir.path()).unwrap();
            shard
                .load_optimizer(dir.path(), &MiniConfig::default())
                .unwrap();
            shards.push(shard);
        }

        // Collect original values from the two saved shard files.
        let mut originals = std::collections::HashMap::new();
        for shard_id in 0..2 {
            let path = persist::model_file(dir.path(), &two, shard_id, Layout::Current);
            let mut bytes = persist::read_payload(&path, persist::KIND_MODEL).unwrap();
            let map = TensorMap::decode(&mut bytes).unwrap();
            for (id, row) in map.get_srm("lr/w").unwrap().iter() {
                originals.insert(id, row.to_vec());
            }
        }
        assert_eq!(originals.len(), ids.len());

        for id in &ids {
            let owners: Vec<usize> = (0..3)
                .filter(|i| shards[*i].param().get_srm("lr/w").unwrap().contains(*id))
                .collect();
            assert_eq!(owners, vec![three.srm_shard_id(*id)]);
            let row = shards[owners[0]]
                .param()
                .get_srm("lr/w")
                .unwrap()
                .get(*id)
                .unwrap();
            assert_eq!(row, originals[id].as_slice());
        }
    }

    #[test]
    fn test_warmup_merges_on_top() {
        let dir = tempfile::tempdir().unwrap();
        let mut saved = shard_with_optimizer(1);
        let mut req = train_request(&[100]);
        saved.pull(&mut req).unwrap();
        let warm_row = saved
            .param()
            .get_srm("lr/w")
            .unwrap()
            .get(100)
            .unwrap()
            .to_vec();
        saved.save_graph_and_shard(dir.path()).unwrap();
        saved.save_model(dir.path()).unwrap();
        saved.save_success(dir.path()).unwrap();

        let mut fresh = shard_with_optimizer(999);
        let mut req = train_request(&[200]);
        fresh.pull(&mut req).unwrap();
        fresh.warmup_model(dir.path()).unwrap();

        let w = fresh.param().get_srm("lr/w").unwrap();
        assert_eq!(w.get(100).unwrap(), warm_row.as_slice());
        assert!(w.contains(200));
    }

    #[test]
    fn test_ts_expiration() {
        let mut shard = shard_with_optimizer(1);
        shard.init_ts_store(1000, 100);
        shard.init_freq_store(0);

        let mut req = train_request(&[1, 2]);
        shard.pull(&mut req).unwrap();

        // Id 1 updated at ts 800 (stale), id 2 at 950 (fresh).
        if let Some(ts) = shard.ts_store.as_mut() {
            ts.set_now(800);
        }
        shard
            .push(&PushPayload::Owned(&grad_for(&[1], 0.1)), &PushPayload::Owned(&TensorMap::new()))
            .unwrap();
        if let Some(ts) = shard.ts_store.as_mut() {
            ts.set_now(950);
        }
        shard
            .push(&PushPayload::Owned(&grad_for(&[2], 0.1)), &PushPayload::Owned(&TensorMap::new()))
            .unwrap();

        if let Some(ts) = shard.ts_store.as_mut() {
            ts.set_now(1000);
        }
        shard.expire_ts_store();

        let w = shard.param().get_srm("lr/w").unwrap();
        assert!(!w.contains(1));
        assert!(w.contains(2));
        let mut state_ids = FnvHashSet::default();
        shard
            .optimizer
            .as_mut()
            .unwrap()
            .for_each_state_srm(|_, srm| state_ids.extend(srm.ids()));
        assert!(!state_ids.contains(&1));
    }

    #[test]
    fn test_legacy_layout_load() {
        let dir = tempfile::tempdir().unwrap();
        let shard = Shard::none();

        // A directory written by an older deployment: legacy member
        // names, legacy marker, same payload codec.
        let mut saved = shard_with_optimizer(3);
        let mut req = train_request(&[5, 6]);
        saved.pull(&mut req).unwrap();
        persist::save_shard(dir.path(), &shard).unwrap();
        let path = persist::model_file(dir.path(), &shard, 0, Layout::Legacy);
        persist::write_payload(&path, persist::KIND_MODEL, |buf| saved.param().encode(buf))
            .unwrap();
        std::fs::write(
            persist::success_file(dir.path(), &shard, 0, Layout::Legacy),
            b"",
        )
        .unwrap();

        let mut loaded = ModelShard::new(lr_graph(), Shard::none(), 0, 3);
        loaded.load_model(dir.path()).unwrap();
        let w = loaded.param().get_srm("lr/w").unwrap();
        assert_eq!(w.len(), 2);
        assert_eq!(
            w.get(5).unwrap(),
            saved.param().get_srm("lr/w").unwrap().get(5).unwrap()
        );
    }

    #[test]
    fn test_ol_store_exports_only_dirty_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut shard = shard_with_optimizer(1);
        shard.init_ol_store(2, 0.0);

        let mut req = train_request(&[1, 2]);
        shard.pull(&mut req).unwrap();
        // Row 1 gets two updates, row 2 only one.
        for ids in [&[1u64, 2][..], &[1u64][..]] {
            let grad = grad_for(ids, 0.5);
            shard
                .push(&PushPayload::Owned(&grad), &PushPayload::Owned(&TensorMap::new()))
                .unwrap();
        }

        shard.save_ol_feature_kv_model(dir.path(), 2).unwrap();
        let exported =
            std::fs::read(persist::feature_kv_file(dir.path(), &Shard::none(), 0)).unwrap();
        let mut bytes = bytes::Bytes::from(exported);
        assert_eq!(bytes.split_to(1)[0], 2, "protocol version header");
        // One section for lr/w with exactly the dirty row.
        let mut cursor = bytes;
        let name = crate::tensor::map::get_str(&mut cursor).unwrap();
        assert_eq!(name, "lr/w");
        let col = crate::tensor::map::get_u32(&mut cursor).unwrap();
        assert_eq!(col, 2);
        let rows = crate::tensor::map::get_u64(&mut cursor).unwrap();
        assert_eq!(rows, 1);
        let id = crate::tensor::map::get_u64(&mut cursor).unwrap();
        assert_eq!(id, 1);
    }

    #[test]
    fn test_split_pull_request_routes_by_shard() {
        let two = Shard::hash(2, DEFAULT_SHARD_FUNC).unwrap();
        let mut local = ModelShard::new(lr_graph(), two.clone(), 0, 1);
        local.init_placeholder();

        let mut full = train_request(&(0..32).collect::<Vec<u64>>());
        full.id_freq_map.insert(4, 2);
        let mut split = Vec::new();
        local.split_pull_request(&full, &mut split);
        assert_eq!(split.len(), 2);

        for (i, req) in split.iter().enumerate() {
            assert!(req.is_train);
            for id in &req.srm_map["lr/w"] {
                assert_eq!(two.srm_shard_id(*id), i);
            }
        }
        let total: usize = split.iter().map(|r| r.srm_map["lr/w"].len()).sum();
        assert_eq!(total, 32);
        assert!(split[two.tsr_shard_id("lr/b")].tsr_set.contains("lr/b"));
        assert!(split[two.srm_shard_id(4)].id_freq_map.contains_key(&4));
    }

    #[test]
    fn test_split_grad_moves_rows() {
        let two = Shard::hash(2, DEFAULT_SHARD_FUNC).unwrap();
        let mut local = ModelShard::new(lr_graph(), two.clone(), 0, 1);
        local.init_placeholder();

        let mut grad = grad_for(&(0..16).collect::<Vec<u64>>(), 1.0);
        let mut b = Tsr::new(Shape::new(&[1]));
        b.assign(&[0.5]).unwrap();
        grad.insert("lr/b", Tensor::Tsr(b));
        // Unknown names are dropped.
        grad.insert("ghost", Tensor::Tsr(Tsr::new(Shape::new(&[1]))));

        let mut split = Vec::new();
        local.split_grad(grad, &mut split).unwrap();

        let total: usize = split
            .iter()
            .map(|m| m.get_srm("lr/w").map_or(0, |s| s.len()))
            .sum();
        assert_eq!(total, 16);
        for (i, map) in split.iter().enumerate() {
            if let Some(srm) = map.get_srm("lr/w") {
                for (id, _) in srm.iter() {
                    assert_eq!(two.srm_shard_id(id), i);
                }
            }
            assert!(map.get("ghost").is_none());
        }
        let b_shard = two.tsr_shard_id("lr/b");
        assert!(split[b_shard].get_tsr("lr/b").is_some());
        assert!(split[1 - b_shard].get_tsr("lr/b").is_none());
    }
}
