//! Model zoo.
//!
//! A zoo model compiles the computation graph; its matching
//! [`OpContext`] implements the narrow forward/backward surface the
//! trainers consume. Models register in [`new_model_zoo`]; op contexts
//! are discovered from the graph itself (the op name of the node
//! feeding the train target), so prediction works on a loaded graph
//! without knowing which zoo entry built it.

pub mod fm;
pub mod lr;

use thiserror::Error;

use sparsed_config::MiniConfig;

use crate::graph::{Graph, NodeKind, TARGET_TRAIN};
use crate::reader::MiniBatch;
use crate::request::PullRequest;
use crate::tensor::{Float, TensorMap};

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown model: {0}")]
    UnknownModel(String),

    #[error("unknown op: {0}")]
    UnknownOp(String),

    #[error("unexpected config: {key}={value}")]
    UnexpectedConfig { key: String, value: String },

    #[error("invalid {key}: {value}")]
    InvalidConfig { key: String, value: String },

    #[error("graph: {0}")]
    Graph(#[from] crate::graph::Error),

    #[error("config: {0}")]
    Config(#[from] sparsed_config::Error),
}

/// Read access to pulled parameters, however they are stored: the
/// in-process trainers look straight into owned maps, the distributed
/// trainer into per-shard wire views.
pub trait ParamLookup {
    fn tsr(&self, name: &str) -> Option<&[Float]>;

    fn srm_row(&self, name: &str, id: u64) -> Option<&[Float]>;
}

impl ParamLookup for TensorMap {
    fn tsr(&self, name: &str) -> Option<&[Float]> {
        self.get_tsr(name).map(|t| t.data())
    }

    fn srm_row(&self, name: &str, id: u64) -> Option<&[Float]> {
        self.get_srm(name).and_then(|s| s.get(id))
    }
}

/// Forward/backward surface of one compiled model.
pub trait OpContext: Send {
    /// What this batch needs pulled.
    fn pull_request(&self, batch: &MiniBatch) -> PullRequest;

    /// Compute predictions (and, when labels are present, the batch
    /// loss) against the given parameters.
    fn forward(&mut self, batch: &MiniBatch, param: &dyn ParamLookup);

    /// Mean loss of the last forward pass.
    fn loss(&self) -> f64;

    /// Per-instance probabilities of the last forward pass.
    fn predictions(&self) -> &[Float];

    /// Gradients of the last forward pass:
    /// `(grad, overwritten_param)`.
    fn backward(&mut self, batch: &MiniBatch, param: &dyn ParamLookup) -> (TensorMap, TensorMap);
}

/// Explicit zoo factory.
pub fn new_model_zoo(name: &str) -> Result<Box<dyn ModelZoo>, Error> {
    match name {
        "lr" | "LRModel" => Ok(Box::new(lr::LrModel::default())),
        "fm" | "FMModel" => Ok(Box::new(fm::FmModel::default())),
        other => Err(Error::UnknownModel(other.into())),
    }
}

pub trait ModelZoo {
    fn init_config(&mut self, config: &MiniConfig) -> Result<(), Error>;

    fn build_graph(&self) -> Result<Graph, crate::graph::Error>;
}

/// Build the op context matching a compiled graph.
pub fn new_op_context(graph: &Graph) -> Result<Box<dyn OpContext>, Error> {
    let target = graph.target(TARGET_TRAIN)?;
    let loss_node = graph
        .node(target)
        .ok_or_else(|| Error::UnknownOp(target.into()))?;
    let NodeKind::Hidden { inputs, .. } = &loss_node.kind else {
        return Err(Error::UnknownOp(target.into()));
    };
    let logit = inputs
        .first()
        .and_then(|name| graph.node(name))
        .ok_or_else(|| Error::UnknownOp(target.into()))?;
    let NodeKind::Hidden { op, .. } = &logit.kind else {
        return Err(Error::UnknownOp(logit.name.clone()));
    };
    match op.as_str() {
        "lr_logit" => Ok(Box::new(lr::LrOp::new())),
        "fm_logit" => Ok(Box::new(fm::FmOp::from_graph(graph)?)),
        other => Err(Error::UnknownOp(other.into())),
    }
}

pub(crate) fn sigmoid(z: Float) -> Float {
    1.0 as Float / (1.0 as Float + (-z).exp())
}

/// Binary cross-entropy with the usual clamping.
pub(crate) fn bce(y: Float, p: Float) -> f64 {
    const EPS: f64 = 1e-9;
    let p = (p as f64).clamp(EPS, 1.0 - EPS);
    let y = y as f64;
    -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_factory_and_discovery() {
        let zoo = new_model_zoo("lr").unwrap();
        let graph = zoo.build_graph().unwrap();
        new_op_context(&graph).unwrap();

        let mut zoo = new_model_zoo("fm").unwrap();
        zoo.init_config(&MiniConfig::parse("k=4").unwrap()).unwrap();
        let graph = zoo.build_graph().unwrap();
        new_op_context(&graph).unwrap();

        assert!(new_model_zoo("dnn9000").is_err());
    }

    #[test]
    fn test_sigmoid_and_bce() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(20.0) > 0.999);
        assert!(bce(1.0, 0.9) < bce(1.0, 0.1));
        assert!(bce(1.0, 1.0).is_finite());
        assert!(bce(0.0, 0.0).is_finite());
    }
}
