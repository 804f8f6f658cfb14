//! Per-shard serial executor.
//!
//! Every model shard is owned by exactly one task; pulls, pushes and
//! saves are posted over a channel and applied in arrival order, so
//! requests queued from one connection are FIFO and the stores need no
//! locks. Callers await a oneshot completion per posted request.

use std::path::PathBuf;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

use super::push::PushBody;
use super::shard::ModelShard;
use super::Error;
use crate::request::PullRequest;
use crate::tensor::TensorMap;

/// What to persist and where, carried by a save request.
#[derive(Debug, Clone)]
pub struct SaveSpec {
    pub out_model: PathBuf,
    pub out_text_model: Option<PathBuf>,
    pub out_feature_kv: Option<(PathBuf, u32)>,
    pub remove_zeros: bool,
    pub expire_ts: bool,
    /// Shard 0 also writes `graph.bin` and `shard.bin`.
    pub save_graph_and_shard: bool,
}

enum Command {
    Pull {
        req: PullRequest,
        reply: oneshot::Sender<Result<TensorMap, Error>>,
    },
    PullEncoded {
        req: PullRequest,
        reply: oneshot::Sender<Result<Bytes, Error>>,
    },
    Push {
        grad: PushBody,
        overwritten: PushBody,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Save {
        spec: SaveSpec,
        reply: oneshot::Sender<Result<(), Error>>,
    },
}

#[derive(Clone)]
pub struct ShardHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ShardHandle {
    /// Move the shard into its executor task. The task returns the
    /// shard once every handle is dropped.
    pub fn spawn(shard: ModelShard) -> (Self, JoinHandle<ModelShard>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            let mut shard = shard;
            while let Some(command) = rx.recv().await {
                match command {
                    Command::Pull { mut req, reply } => {
                        let _ = reply.send(shard.pull(&mut req));
                    }
                    Command::PullEncoded { mut req, reply } => {
                        shard.pull_prepare(&mut req);
                        let mut buf = BytesMut::new();
                        shard.encode_pull(&req, &mut buf);
                        let _ = reply.send(Ok(buf.freeze()));
                    }
                    Command::Push {
                        grad,
                        overwritten,
                        reply,
                    } => {
                        let _ = reply.send(shard.push(&grad.payload(), &overwritten.payload()));
                    }
                    Command::Save { spec, reply } => {
                        let _ = reply.send(save(&mut shard, &spec));
                    }
                }
            }
            shard
        });
        (Self { tx }, task)
    }

    async fn post<T>(
        &self,
        command: Command,
        rx: oneshot::Receiver<Result<T, Error>>,
    ) -> Result<T, Error> {
        self.tx.send(command).map_err(|_| Error::ActorGone)?;
        rx.await.map_err(|_| Error::ActorGone)?
    }

    /// Owned pull for in-process trainers.
    pub async fn pull(&self, req: PullRequest) -> Result<TensorMap, Error> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Pull { req, reply }, rx).await
    }

    /// Pull serialized for the wire; the param server forwards the
    /// bytes as the response payload.
    pub async fn pull_encoded(&self, req: PullRequest) -> Result<Bytes, Error> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::PullEncoded { req, reply }, rx).await
    }

    pub async fn push(
        &self,
        grad: impl Into<PushBody>,
        overwritten: impl Into<PushBody>,
    ) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.post(
            Command::Push {
                grad: grad.into(),
                overwritten: overwritten.into(),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn save(&self, spec: SaveSpec) -> Result<(), Error> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Save { spec, reply }, rx).await
    }
}

fn save(shard: &mut ModelShard, spec: &SaveSpec) -> Result<(), Error> {
    info!(
        shard_id = shard.shard_id(),
        dir = %spec.out_model.display(),
        "saving shard"
    );
    if spec.save_graph_and_shard {
        shard.save_graph_and_shard(&spec.out_model)?;
    }
    if spec.remove_zeros {
        shard.remove_zeros();
    }
    if spec.expire_ts {
        shard.expire_ts_store();
    }
    shard.save_model(&spec.out_model)?;
    if let Some(dir) = &spec.out_text_model {
        shard.save_text_model(dir)?;
    }
    if let Some((dir, version)) = &spec.out_feature_kv {
        shard.save_feature_kv_model(dir, *version)?;
    }
    if shard.has_optimizer() {
        shard.save_optimizer(&spec.out_model)?;
    }
    shard.save_ts_store(&spec.out_model)?;
    shard.save_freq_store(&spec.out_model)?;
    // The marker goes last; its presence implies a complete save.
    shard.save_success(&spec.out_model)
}
