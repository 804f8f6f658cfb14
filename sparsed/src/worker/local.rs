//! In-process trainer flavors.
//!
//! `NonShardRunner` owns a single model and applies the optimizer
//! directly. `ShardRunner` drives N in-process shard actors through
//! the same split/fan-out path the distributed worker uses, without a
//! network in between.

use std::sync::Arc;

use futures::future::try_join_all;

use sparsed_config::MiniConfig;

use super::context::BatchRunner;
use super::params::ShardParams;
use super::Error;
use crate::graph::Graph;
use crate::model::store::FreqStore;
use crate::model::{ModelShard, PushPayload, ShardHandle};
use crate::reader::MiniBatch;
use crate::request::PullRequest;
use crate::shard::{Shard, DEFAULT_SHARD_FUNC};
use crate::tensor::{Float, TensorMap};
use crate::zoo::{new_op_context, OpContext};

pub struct NonShardRunner {
    shard: ModelShard,
    op: Box<dyn OpContext>,
}

impl NonShardRunner {
    pub fn new(
        graph: Arc<Graph>,
        seed: u64,
        optimizer: &str,
        optimizer_config: &MiniConfig,
    ) -> Result<Self, Error> {
        let mut shard = ModelShard::new(graph.clone(), Shard::none(), 0, seed);
        shard.init_model();
        shard.init_optimizer(optimizer, optimizer_config)?;
        let op = new_op_context(&graph)?;
        Ok(Self { shard, op })
    }

    pub fn model_shard(&self) -> &ModelShard {
        &self.shard
    }

    pub fn model_shard_mut(&mut self) -> &mut ModelShard {
        &mut self.shard
    }
}

impl BatchRunner for NonShardRunner {
    async fn train_batch(&mut self, batch: &MiniBatch) -> Result<f64, Error> {
        let mut req = self.op.pull_request(batch);
        req.is_train = true;
        let param = self.shard.pull(&mut req)?;
        self.op.forward(batch, &param);
        let (grad, overwritten) = self.op.backward(batch, &param);
        self.shard.push(
            &PushPayload::Owned(&grad),
            &PushPayload::Owned(&overwritten),
        )?;
        Ok(self.op.loss())
    }

    async fn predict_batch(&mut self, batch: &MiniBatch) -> Result<Vec<Float>, Error> {
        let mut req = self.op.pull_request(batch);
        req.is_train = false;
        let param = self.shard.pull(&mut req)?;
        self.op.forward(batch, &param);
        Ok(self.op.predictions().to_vec())
    }
}

pub struct ShardRunner {
    is_train: bool,
    freq_filter_threshold: u32,
    local: ModelShard,
    op: Box<dyn OpContext>,
    handles: Vec<ShardHandle>,
    params: ShardParams,
    masks: Vec<bool>,
    split_reqs: Vec<PullRequest>,
    split_grads: Vec<TensorMap>,
    split_overs: Vec<TensorMap>,
}

impl ShardRunner {
    /// Build N model shards, each behind its own serial actor.
    pub fn new(
        graph: Arc<Graph>,
        shard_size: usize,
        seed: u64,
        optimizer: &str,
        optimizer_config: &MiniConfig,
        is_train: bool,
        freq_filter_threshold: u32,
    ) -> Result<(Self, Vec<tokio::task::JoinHandle<ModelShard>>), Error> {
        let shard = Shard::hash(shard_size, DEFAULT_SHARD_FUNC)?;

        let mut handles = Vec::with_capacity(shard_size);
        let mut tasks = Vec::with_capacity(shard_size);
        for shard_id in 0..shard_size {
            let mut model = ModelShard::new(graph.clone(), shard.clone(), shard_id, seed);
            model.init_model();
            model.init_optimizer(optimizer, optimizer_config)?;
            if freq_filter_threshold > 0 {
                model.init_freq_store(freq_filter_threshold);
            }
            let (handle, task) = ShardHandle::spawn(model);
            handles.push(handle);
            tasks.push(task);
        }

        let mut local = ModelShard::new(graph.clone(), shard.clone(), 0, seed);
        local.init_placeholder();
        let op = new_op_context(&graph)?;

        let runner = Self {
            is_train,
            freq_filter_threshold,
            local,
            op,
            handles,
            params: ShardParams::new(shard),
            masks: vec![false; shard_size],
            split_reqs: Vec::new(),
            split_grads: Vec::new(),
            split_overs: Vec::new(),
        };
        Ok((runner, tasks))
    }

    pub fn into_handles(self) -> Vec<ShardHandle> {
        self.handles
    }

    async fn pull(&mut self, batch: &MiniBatch, is_train: bool) -> Result<(), Error> {
        let mut req = self.op.pull_request(batch);
        req.is_train = is_train;
        if is_train && self.freq_filter_threshold > 0 {
            req.id_freq_map = FreqStore::id_freq_map_of(batch);
        }
        self.local.split_pull_request(&req, &mut self.split_reqs);

        let size = self.split_reqs.len();
        let mut pulls = Vec::new();
        for i in 0..size {
            self.masks[i] = !self.split_reqs[i].is_empty();
            if self.masks[i] {
                let req = std::mem::take(&mut self.split_reqs[i]);
                let handle = self.handles[i].clone();
                pulls.push(async move { handle.pull(req).await.map(|param| (i, param)) });
            }
        }

        for i in 0..size {
            self.params.clear(i);
        }
        for (i, param) in try_join_all(pulls).await? {
            self.params.set_owned(i, param);
        }
        Ok(())
    }

    async fn push(&mut self, grad: TensorMap, overwritten: TensorMap) -> Result<(), Error> {
        self.local.split_grad(grad, &mut self.split_grads)?;
        self.local.split_param(overwritten, &mut self.split_overs)?;

        let mut pushes = Vec::new();
        for i in 0..self.masks.len() {
            if self.masks[i] {
                let grad = std::mem::take(&mut self.split_grads[i]);
                let overwritten = std::mem::take(&mut self.split_overs[i]);
                let handle = self.handles[i].clone();
                pushes.push(async move { handle.push(grad, overwritten).await });
            }
        }
        try_join_all(pushes).await?;
        Ok(())
    }
}

impl BatchRunner for ShardRunner {
    async fn train_batch(&mut self, batch: &MiniBatch) -> Result<f64, Error> {
        debug_assert!(self.is_train);
        self.pull(batch, true).await?;
        self.op.forward(batch, &self.params);
        let (grad, overwritten) = self.op.backward(batch, &self.params);
        self.push(grad, overwritten).await?;
        Ok(self.op.loss())
    }

    async fn predict_batch(&mut self, batch: &MiniBatch) -> Result<Vec<Float>, Error> {
        self.pull(batch, false).await?;
        self.op.forward(batch, &self.params);
        Ok(self.op.predictions().to_vec())
    }
}
