//! Instance readers.
//!
//! A reader turns an input file into mini-batches. The trainer
//! consumes readers through the [`InstanceReader`] trait only; new
//! formats register in [`new_instance_reader`].

pub mod libsvm;

use std::path::Path;

use thiserror::Error;

use crate::tensor::Float;
use sparsed_config::MiniConfig;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown instance reader: {0}")]
    UnknownReader(String),

    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("{file}:{line}: {message}")]
    Parse {
        file: String,
        line: usize,
        message: String,
    },

    #[error("{0}")]
    Config(#[from] sparsed_config::Error),
}

/// One mini-batch of instances. `rows[i]` holds the sparse features of
/// instance `i` as `(feature_id, value)` pairs.
#[derive(Debug, Clone, Default)]
pub struct MiniBatch {
    pub labels: Vec<Float>,
    pub rows: Vec<Vec<(u64, Float)>>,
}

impl MiniBatch {
    pub fn batch(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn clear(&mut self) {
        self.labels.clear();
        self.rows.clear();
    }
}

pub trait InstanceReader: Send {
    /// Open an input file, resetting any previous state.
    fn open(&mut self, path: &Path) -> Result<(), Error>;

    /// Next mini-batch, or `None` at end of file. The final batch may
    /// be short.
    fn next_batch(&mut self) -> Result<Option<MiniBatch>, Error>;
}

/// Explicit reader factory.
pub fn new_instance_reader(
    name: &str,
    config: &MiniConfig,
    batch: usize,
) -> Result<Box<dyn InstanceReader>, Error> {
    match name {
        "libsvm" => Ok(Box::new(libsvm::LibsvmReader::new(config, batch)?)),
        other => Err(Error::UnknownReader(other.into())),
    }
}
