//! Param server.
//!
//! Hosts exactly one model shard behind its serial actor and routes
//! worker RPCs to it. Handlers decode tensor payloads as zero-copy
//! views into the inbound frame and forward them over the actor
//! channel; the response bytes come back already serialized.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error as ThisError;
use tokio::net::TcpListener;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use sparsed_config::{JobConfig, MiniConfig};

use crate::model::actor::{SaveSpec, ShardHandle};
use crate::model::{persist, ModelShard};
use crate::net::messages::{
    FromBytes, ModelSaveAck, PullRequestMsg, PullResponse, PushAck, PushNotify, TerminationAck,
};
use crate::net::{self, Stream};
use crate::shard::{Shard, DEFAULT_SHARD_FUNC};
use crate::zoo::new_model_zoo;

#[derive(Debug, ThisError)]
pub enum Error {
    #[error("net: {0}")]
    Net(#[from] net::Error),

    #[error("model: {0}")]
    Model(#[from] crate::model::Error),

    #[error("graph: {0}")]
    Graph(#[from] crate::graph::Error),

    #[error("zoo: {0}")]
    Zoo(#[from] crate::zoo::Error),

    #[error("shard: {0}")]
    Shard(#[from] crate::shard::Error),

    #[error("config: {0}")]
    Config(#[from] sparsed_config::Error),

    #[error("\"{0}\" option is missing")]
    MissingOption(&'static str),

    #[error("model has no sparse parameters; nothing to shard")]
    NoSparseParams,

    #[error("param server failed: {0}")]
    Failed(String),
}

/// Build the shard this param server hosts, fresh or from disk, per
/// the job configuration.
pub fn init_model_shard(config: &JobConfig) -> Result<ModelShard, Error> {
    let shard = Shard::hash(config.shard_size(), DEFAULT_SHARD_FUNC)?;

    let graph = match (&config.in_model, config.is_train()) {
        (Some(dir), _) => persist::load_graph(dir)?,
        (None, true) => {
            let mut zoo = new_model_zoo(&config.model)?;
            zoo.init_config(&MiniConfig::parse(&config.model_config)?)?;
            zoo.build_graph()?
        }
        (None, false) => return Err(Error::MissingOption("in_model")),
    };
    if !graph.has_srm() {
        return Err(Error::NoSparseParams);
    }

    let mut shard = ModelShard::new(Arc::new(graph), shard, config.ps_id, config.seed);

    if config.is_train() {
        let optimizer_config = MiniConfig::parse(&config.optimizer_config)?;
        match &config.in_model {
            None => {
                shard.init_model();
                shard.init_optimizer(&config.optimizer, &optimizer_config)?;
                if config.ts.enable {
                    shard.init_ts_store(config.ts.now, config.ts.expire_threshold);
                }
                if config.freq.enabled() {
                    shard.init_freq_store(config.freq.threshold);
                }
            }
            Some(dir) => {
                shard.load_model(dir)?;
                shard.load_optimizer(dir, &optimizer_config)?;
                if config.ts.enable {
                    // Older artifacts may predate the store; start
                    // fresh then.
                    if let Err(err) =
                        shard.load_ts_store(dir, config.ts.now, config.ts.expire_threshold)
                    {
                        warn!(%err, "no usable ts store, initializing");
                        shard.init_ts_store(config.ts.now, config.ts.expire_threshold);
                    }
                }
                if config.freq.enabled() {
                    if let Err(err) = shard.load_freq_store(dir, config.freq.threshold) {
                        warn!(%err, "no usable freq store, initializing");
                        shard.init_freq_store(config.freq.threshold);
                    }
                }
            }
        }
        if let Some(dir) = &config.warmup_model {
            shard.warmup_model(dir)?;
            shard.warmup_optimizer(dir)?;
            if config.ts.enable {
                shard.warmup_ts_store(dir)?;
            }
            if config.freq.enabled() {
                shard.warmup_freq_store(dir)?;
            }
        }
    } else {
        let dir = config
            .in_model
            .as_ref()
            .ok_or(Error::MissingOption("in_model"))?;
        shard.load_model(dir)?;
    }

    Ok(shard)
}

fn save_spec(config: &JobConfig) -> Result<SaveSpec, Error> {
    let out_model = config
        .out_model
        .clone()
        .ok_or(Error::MissingOption("out_model"))?;
    Ok(SaveSpec {
        out_model,
        out_text_model: config.out_text_model.clone(),
        out_feature_kv: config
            .out_feature_kv_model
            .clone()
            .map(|dir| (dir, config.out_feature_kv_protocol_version)),
        remove_zeros: config.out_model_remove_zeros,
        expire_ts: config.ts.enable && config.ts.expire_threshold > 0,
        save_graph_and_shard: config.ps_id == 0,
    })
}

pub async fn run_param_server(config: &JobConfig) -> Result<(), Error> {
    let shard = init_model_shard(config)?;

    let spec = if config.is_train() {
        Some(save_spec(config)?)
    } else {
        None
    };

    let (handle, actor) = ShardHandle::spawn(shard);

    let addr = &config.ps_addrs[config.ps_id];
    let listener = TcpListener::bind(addr).await.map_err(net::Error::from)?;
    info!(%addr, ps_id = config.ps_id, "param server listening");

    let shutdown = CancellationToken::new();
    let failure: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let tracker = TaskTracker::new();

    loop {
        select! {
            conn = listener.accept() => {
                let (stream, peer) = conn.map_err(net::Error::from)?;
                info!(%peer, "connection accepted");
                let session = Session {
                    handle: handle.clone(),
                    spec: spec.clone(),
                    shutdown: shutdown.clone(),
                    failure: failure.clone(),
                };
                tracker.spawn(async move {
                    session.run(Stream::new(stream)).await;
                });
            }

            _ = shutdown.cancelled() => {
                break;
            }
        }
    }

    tracker.close();
    tracker.wait().await;
    drop(handle);
    let _ = actor.await;

    let result = match failure.lock().take() {
        Some(cause) => Err(Error::Failed(cause)),
        None => Ok(()),
    };
    result
}

struct Session {
    handle: ShardHandle,
    spec: Option<SaveSpec>,
    shutdown: CancellationToken,
    failure: Arc<Mutex<Option<String>>>,
}

impl Session {
    async fn run(self, mut stream: Stream) {
        let peer = stream.peer().to_string();
        match self.serve(&mut stream).await {
            Ok(()) => info!(%peer, "connection closed"),
            Err(err) => match &err {
                Error::Net(net) if net.disconnect() => info!(%peer, "worker disconnected"),
                _ => {
                    error!(%peer, %err, "session failed");
                    *self.failure.lock() = Some(err.to_string());
                    self.shutdown.cancel();
                }
            },
        }
    }

    async fn serve(&self, stream: &mut Stream) -> Result<(), Error> {
        loop {
            let message = stream.read().await?;
            match message.code() {
                'P' => {
                    let request = PullRequestMsg::from_bytes(message.to_bytes())?;
                    let param = self.handle.pull_encoded(request.req).await?;
                    stream.send_flush(&PullResponse::new(param)).await?;
                }
                'G' => {
                    let push = PushNotify::from_bytes(message.to_bytes())?;
                    let (grad, overwritten) = push.views()?;
                    self.handle.push(grad, overwritten).await?;
                    stream.send_flush(&PushAck).await?;
                }
                'S' => {
                    let spec = self
                        .spec
                        .clone()
                        .ok_or(Error::MissingOption("out_model"))?;
                    self.handle.save(spec).await?;
                    stream.send_flush(&ModelSaveAck).await?;
                }
                'T' => {
                    stream.send_flush(&TerminationAck).await?;
                    info!("termination notify received");
                    self.shutdown.cancel();
                    return Ok(());
                }
                other => {
                    return Err(net::Error::UnexpectedMessage(other).into());
                }
            }
        }
    }
}
