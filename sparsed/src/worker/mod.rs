//! Workers: stream instances, run forward/backward, exchange
//! parameters with the shard set.

pub mod context;
pub mod dist;
pub mod local;
pub mod params;

pub use context::{BatchRunner, TrainerContext};
pub use dist::run_worker;
pub use params::ShardParams;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("net: {0}")]
    Net(#[from] crate::net::Error),

    #[error("model: {0}")]
    Model(#[from] crate::model::Error),

    #[error("reader: {0}")]
    Reader(#[from] crate::reader::Error),

    #[error("zoo: {0}")]
    Zoo(#[from] crate::zoo::Error),

    #[error("graph: {0}")]
    Graph(#[from] crate::graph::Error),

    #[error("shard: {0}")]
    Shard(#[from] crate::shard::Error),

    #[error("I/O error on \"{path}\": {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("\"{0}\" option is missing")]
    MissingOption(&'static str),

    #[error("config: {0}")]
    Config(#[from] sparsed_config::Error),
}
