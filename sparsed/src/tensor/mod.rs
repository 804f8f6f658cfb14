//! Typed tensor containers and their shared binary codec.

pub mod feature;
pub mod floats;
pub mod initializer;
pub mod map;
pub mod shape;
pub mod srm;
pub mod tsr;
pub mod view;

pub use floats::{Float, FloatBytes, FLOAT_SIZE};
pub use initializer::{InitKind, Initializer};
pub use map::{Tensor, TensorMap};
pub use shape::Shape;
pub use srm::Srm;
pub use tsr::Tsr;
pub use view::{SrmView, TensorMapView, TensorView, TsrView};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("truncated tensor payload")]
    Truncated,

    #[error("unknown tensor tag: {0}")]
    UnknownTag(u8),

    #[error("unknown initializer kind: {0}")]
    UnknownInitializer(u8),

    #[error("column mismatch: {0} vs {1}")]
    ColMismatch(usize, usize),

    #[error("shape mismatch: {0} vs {1}")]
    ShapeMismatch(String, String),

    #[error("invalid utf-8 in tensor name")]
    Name,
}
