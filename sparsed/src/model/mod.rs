//! The model data plane: one shard's parameters, optimizer state and
//! side stores, plus persistence and the per-shard serial actor.

pub mod actor;
pub mod optimizer;
pub mod persist;
pub mod push;
pub mod shard;
pub mod store;

pub use actor::{ShardHandle, SaveSpec};
pub use optimizer::{new_optimizer, Optimizer};
pub use push::{PushBody, PushPayload};
pub use shard::ModelShard;

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("tensor: {0}")]
    Tensor(#[from] crate::tensor::Error),

    #[error("shard: {0}")]
    Shard(#[from] crate::shard::Error),

    #[error("graph: {0}")]
    Graph(#[from] crate::graph::Error),

    #[error("config: {0}")]
    Config(#[from] sparsed_config::Error),

    #[error("I/O error on \"{path}\": {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("bad file header: {0}")]
    BadFile(PathBuf),

    #[error("no model found in \"{0}\"")]
    NoModel(PathBuf),

    #[error("saved shard mode differs from runtime shard mode")]
    ShardModeMismatch,

    #[error("unknown optimizer: {0}")]
    UnknownOptimizer(String),

    #[error("push without an optimizer")]
    NoOptimizer,

    #[error("optimizer rule mismatch: expected {expected}, found {found}")]
    OptimizerMismatch {
        expected: &'static str,
        found: String,
    },

    #[error("missing parameter: {0}")]
    MissingParam(String),

    #[error("gradient shape mismatch for {0}")]
    GradShape(String),

    #[error("row {id} out of range for dense parameter {name}")]
    RowOutOfRange { name: String, id: u64 },

    #[error("shard actor is gone")]
    ActorGone,

    #[error("feature kv protocol version {0} is not supported")]
    FeatureKvVersion(u32),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
