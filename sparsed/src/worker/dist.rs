//! Distributed trainer: remote model shards over the wire codec.

use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::try_join_all;
use tracing::{debug, info};

use sparsed_config::JobConfig;

use super::context::{output_predict_file, BatchRunner, TrainerContext};
use super::params::ShardParams;
use super::Error;
use crate::graph::{Graph, TARGET_PREDICT, TARGET_TRAIN};
use crate::model::persist;
use crate::model::store::FreqStore;
use crate::model::ModelShard;
use crate::net::messages::{
    FileFinishAck, FileFinishNotify, FileRequest, FileResponse, FromBytes, PullRequestMsg,
    PullResponse, PushAck, PushNotify, ToBytes,
};
use crate::net::{self, Stream};
use crate::reader::MiniBatch;
use crate::request::PullRequest;
use crate::shard::{Shard, DEFAULT_SHARD_FUNC};
use crate::tensor::{Float, TensorMap};
use crate::zoo::{new_model_zoo, new_op_context, OpContext};

/// Poll period when the coordinator has no file for us yet; doubles as
/// the "other workers still finishing the epoch" gate.
const NO_FILE_SLEEP: Duration = Duration::from_secs(5);

/// One worker process: build or load the graph, connect to every PS
/// and the CS, then stream files until the job is done.
pub async fn run_worker(config: &JobConfig) -> Result<(), Error> {
    let graph = Arc::new(build_graph(config)?);
    let shard = Shard::hash(config.shard_size(), DEFAULT_SHARD_FUNC)?;

    let mut local = ModelShard::new(graph.clone(), shard.clone(), 0, config.seed);
    local.init_placeholder();

    let op = new_op_context(&graph)?;
    let target = graph.target(if config.is_train() {
        TARGET_TRAIN
    } else {
        TARGET_PREDICT
    })?;
    debug!(target, "worker target");

    let mut ps = Vec::with_capacity(config.ps_addrs.len());
    for addr in &config.ps_addrs {
        ps.push(Stream::connect_retry(addr).await?);
    }

    let context = TrainerContext::new(
        &config.instance_reader,
        &config.instance_reader_config,
        config.batch,
        config.verbose,
    )?;

    let size = shard.size();
    let runner = DistRunner {
        is_train: config.is_train(),
        freq_filter_threshold: config.freq.threshold,
        local,
        op,
        ps,
        params: ShardParams::new(shard),
        masks: vec![false; size],
        split_reqs: Vec::new(),
        split_grads: Vec::new(),
        split_overs: Vec::new(),
    };

    let mut worker = Worker {
        context,
        runner,
        cs_addr: config.cs_addr.clone(),
    };

    if config.is_train() {
        worker.train(config.epoch).await
    } else {
        let out = config
            .out_predict
            .clone()
            .ok_or(Error::MissingOption("out_predict"))?;
        worker.predict(&out).await
    }
}

fn build_graph(config: &JobConfig) -> Result<Graph, Error> {
    match (&config.in_model, config.is_train()) {
        (Some(dir), _) => Ok(persist::load_graph(dir)?),
        (None, true) => {
            let mut zoo = new_model_zoo(&config.model)?;
            zoo.init_config(&sparsed_config::MiniConfig::parse(&config.model_config)?)?;
            Ok(zoo.build_graph()?)
        }
        (None, false) => Err(Error::MissingOption("in_model")),
    }
}

struct Worker {
    context: TrainerContext,
    runner: DistRunner,
    cs_addr: String,
}

impl Worker {
    async fn train(&mut self, epochs: usize) -> Result<(), Error> {
        let mut epoch = 0usize;
        loop {
            info!(epoch = epoch + 1, "epoch begins");
            let mut cs = Stream::connect_retry(&self.cs_addr).await?;
            loop {
                let response: FileResponse = match cs.rpc(&FileRequest).await {
                    Ok(response) => response,
                    Err(err) if err.disconnect() => {
                        debug!("coordinator closed the connection");
                        break;
                    }
                    Err(err) => return Err(err.into()),
                };
                epoch = response.epoch as usize;
                if response.file.is_empty() {
                    debug!("no new file yet");
                    tokio::time::sleep(NO_FILE_SLEEP).await;
                    continue;
                }

                info!(file = %response.file, "got file");
                let (loss, loss_weight) = self
                    .context
                    .train_file(&mut self.runner, Path::new(&response.file))
                    .await?;
                let _: FileFinishAck = cs
                    .rpc(&FileFinishNotify {
                        file: response.file,
                        loss,
                        loss_weight,
                    })
                    .await?;
            }
            info!(epoch = epoch + 1, "epoch completed");
            if epoch + 1 >= epochs {
                break;
            }
        }
        Ok(())
    }

    async fn predict(&mut self, out_dir: &PathBuf) -> Result<(), Error> {
        let mut cs = Stream::connect_retry(&self.cs_addr).await?;
        loop {
            let response: FileResponse = match cs.rpc(&FileRequest).await {
                Ok(response) => response,
                Err(err) if err.disconnect() => break,
                Err(err) => return Err(err.into()),
            };
            if response.file.is_empty() {
                debug!("no new file yet");
                tokio::time::sleep(NO_FILE_SLEEP).await;
                continue;
            }

            info!(file = %response.file, "got file");
            let input = Path::new(&response.file);
            let out_file = output_predict_file(out_dir, input);
            self.context
                .predict_file(&mut self.runner, input, &out_file)
                .await?;
            let _: FileFinishAck = cs
                .rpc(&FileFinishNotify {
                    file: response.file,
                    loss: 0.0,
                    loss_weight: 0.0,
                })
                .await?;
        }
        Ok(())
    }
}

struct DistRunner {
    is_train: bool,
    freq_filter_threshold: u32,
    local: ModelShard,
    op: Box<dyn OpContext>,
    ps: Vec<Stream>,
    params: ShardParams,
    masks: Vec<bool>,
    split_reqs: Vec<PullRequest>,
    split_grads: Vec<TensorMap>,
    split_overs: Vec<TensorMap>,
}

impl DistRunner {
    /// Fan the pull out to the masked shards and install the
    /// zero-copy responses.
    async fn pull(&mut self, batch: &MiniBatch, is_train: bool) -> Result<(), Error> {
        let mut req = self.op.pull_request(batch);
        req.is_train = is_train;
        if is_train && self.freq_filter_threshold > 0 {
            req.id_freq_map = FreqStore::id_freq_map_of(batch);
        }
        self.local.split_pull_request(&req, &mut self.split_reqs);

        let size = self.split_reqs.len();
        self.masks.resize(size, false);
        let mut frames: Vec<Option<Bytes>> = vec![None; size];
        for i in 0..size {
            self.masks[i] = !self.split_reqs[i].is_empty();
            if self.masks[i] {
                let msg = PullRequestMsg::from(mem::take(&mut self.split_reqs[i]));
                frames[i] = Some(msg.to_bytes()?);
            }
        }

        let ps = &mut self.ps;
        let responses = try_join_all(ps.iter_mut().zip(frames.iter()).enumerate().filter_map(
            |(i, (conn, frame))| {
                frame.as_ref().map(|frame| async move {
                    conn.send_bytes(frame).await?;
                    conn.flush().await?;
                    let reply = conn.read().await?;
                    let response = PullResponse::from_bytes(reply.to_bytes())?;
                    Ok::<_, net::Error>((i, response))
                })
            },
        ))
        .await?;

        for i in 0..size {
            self.params.clear(i);
        }
        for (i, response) in responses {
            self.params.set_view(i, response.view()?);
        }
        Ok(())
    }

    /// Ship gradients and overwrites to the shards pulled from.
    async fn push(&mut self, grad: TensorMap, overwritten: TensorMap) -> Result<(), Error> {
        self.local.split_grad(grad, &mut self.split_grads)?;
        self.local.split_param(overwritten, &mut self.split_overs)?;

        let mut frames: Vec<Option<Bytes>> = vec![None; self.masks.len()];
        for (i, frame) in frames.iter_mut().enumerate() {
            if self.masks[i] {
                let msg = PushNotify::encode(&self.split_grads[i], &self.split_overs[i]);
                *frame = Some(msg.to_bytes()?);
            }
        }

        let ps = &mut self.ps;
        try_join_all(
            ps.iter_mut()
                .zip(frames.iter())
                .filter_map(|(conn, frame)| {
                    frame.as_ref().map(|frame| async move {
                        conn.send_bytes(frame).await?;
                        conn.flush().await?;
                        let reply = conn.read().await?;
                        PushAck::from_bytes(reply.to_bytes())?;
                        Ok::<_, net::Error>(())
                    })
                }),
        )
        .await?;
        Ok(())
    }
}

impl BatchRunner for DistRunner {
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
