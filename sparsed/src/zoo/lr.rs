//! Logistic regression.

use fnv::FnvHashSet;

use sparsed_config::MiniConfig;

use super::{bce, sigmoid, Error, ModelZoo, OpContext, ParamLookup};
use crate::graph::{Graph, NodeKind, TensorKind};
use crate::reader::MiniBatch;
use crate::request::PullRequest;
use crate::tensor::{Float, Initializer, Shape, Srm, Tensor, TensorMap, Tsr};

const W: &str = "lr/w";
const B: &str = "lr/b";

#[derive(Debug, Default)]
pub struct LrModel;

impl ModelZoo for LrModel {
    fn init_config(&mut self, config: &MiniConfig) -> Result<(), Error> {
        if let Some((key, value)) = config.iter().next() {
            return Err(Error::UnexpectedConfig {
                key: key.into(),
                value: value.into(),
            });
        }
        Ok(())
    }

    fn build_graph(&self) -> Result<Graph, crate::graph::Error> {
        let mut graph = Graph::new();
        graph.add_node(
            "x",
            NodeKind::Instance {
                shape: Shape::new(&[-1]),
            },
        )?;
        graph.add_node(
            "y",
            NodeKind::Instance {
                shape: Shape::new(&[-1, 1]),
            },
        )?;
        graph.add_node(
            W,
            NodeKind::Variable {
                kind: TensorKind::Srm,
                shape: Shape::new(&[-1, 1]),
                initializer: Initializer::zeros(),
            },
        )?;
        graph.add_node(
            B,
            NodeKind::Variable {
                kind: TensorKind::Tsr,
                shape: Shape::new(&[1]),
                initializer: Initializer::zeros(),
            },
        )?;
        graph.add_node(
            "lr/z",
            NodeKind::Hidden {
                op: "lr_logit".into(),
                inputs: vec!["x".into(), W.into(), B.into()],
            },
        )?;
        graph.add_node(
            "loss",
            NodeKind::Hidden {
                op: "sigmoid_bce".into(),
                inputs: vec!["lr/z".into(), "y".into()],
            },
        )?;
        graph.add_node(
            "prob",
            NodeKind::Hidden {
                op: "sigmoid".into(),
                inputs: vec!["lr/z".into()],
            },
        )?;
        graph.compile(&["loss", "prob", "prob"])?;
        Ok(graph)
    }
}

pub struct LrOp {
    probs: Vec<Float>,
    loss: f64,
}

impl LrOp {
    pub fn new() -> Self {
        Self {
            probs: Vec::new(),
            loss: 0.0,
        }
    }
}

impl Default for LrOp {
    fn default() -> Self {
        Self::new()
    }
}

impl OpContext for LrOp {
    fn pull_request(&self, batch: &MiniBatch) -> PullRequest {
        let mut req = PullRequest::new();
        req.tsr_set.insert(B.into());
        let ids: FnvHashSet<u64> = batch
            .rows
            .iter()
            .flat_map(|row| row.iter().map(|(id, _)| *id))
            .collect();
        req.srm_map.insert(W.into(), ids);
        req
    }

    fn forward(&mut self, batch: &MiniBatch, param: &dyn ParamLookup) {
        let b = param.tsr(B).map_or(0.0, |b| b[0]);
        self.probs.clear();
        let mut loss = 0.0;
        for (i, row) in batch.rows.iter().enumerate() {
            let mut z = b;
            for (id, value) in row {
                if let Some(w) = param.srm_row(W, *id) {
                    z += w[0] * value;
                }
            }
            let p = sigmoid(z);
            self.probs.push(p);
            if let Some(y) = batch.labels.get(i) {
                loss += bce(*y, p);
            }
        }
        self.loss = loss / batch.batch().max(1) as f64;
    }

    fn loss(&self) -> f64 {
        self.loss
    }

    fn predictions(&self) -> &[Float] {
        &self.probs
    }

    fn backward(&mut self, batch: &MiniBatch, _param: &dyn ParamLookup) -> (TensorMap, TensorMap) {
        let batch_size = batch.batch().max(1) as Float;
        let mut g_w = Srm::new(1, Initializer::zeros());
        let mut g_b = 0.0 as Float;

        for (i, row) in batch.rows.iter().enumerate() {
            let d = (self.probs[i] - batch.labels[i]) / batch_size;
            g_b += d;
            for (id, value) in row {
                g_w.get_row_no_init(*id)[0] += d * value;
            }
        }

        let mut grad = TensorMap::new();
        grad.insert(W, Tensor::Srm(g_w));
        let mut b = Tsr::new(Shape::new(&[1]));
        b.data_mut()[0] = g_b;
        grad.insert(B, Tensor::Tsr(b));
        (grad, TensorMap::new())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn batch() -> MiniBatch {
        MiniBatch {
            labels: vec![1.0, 0.0],
            rows: vec![vec![(1, 1.0), (2, 1.0)], vec![(2, 1.0), (3, 1.0)]],
        }
    }

    fn params() -> TensorMap {
        let mut map = TensorMap::new();
        let mut w = Srm::new(1, Initializer::zeros());
        w.assign(1, &[2.0]).unwrap();
        w.assign(2, &[0.0]).unwrap();
        w.assign(3, &[-2.0]).unwrap();
        map.insert(W, Tensor::Srm(w));
        map.insert(B, Tensor::Tsr(Tsr::new(Shape::new(&[1]))));
        map
    }

    #[test]
    fn test_pull_request_covers_batch_ids() {
        let op = LrOp::new();
        let req = op.pull_request(&batch());
        assert!(req.tsr_set.contains(B));
        let ids = &req.srm_map[W];
        assert_eq!(ids.len(), 3);
        assert!(ids.contains(&1) && ids.contains(&2) && ids.contains(&3));
    }

    #[test]
    fn test_forward_separates_classes() {
        let mut op = LrOp::new();
        op.forward(&batch(), &params());
        let probs = op.predictions();
        assert!(probs[0] > 0.8, "positive instance: {}", probs[0]);
        assert!(probs[1] < 0.2, "negative instance: {}", probs[1]);
        assert!(op.loss() > 0.0 && op.loss().is_finite());
    }

    #[test]
    fn test_backward_signs() {
        let mut op = LrOp::new();
        let params = params();
        op.forward(&batch(), &params);
        let (grad, overwritten) = op.backward(&batch(), &params);
        assert!(overwritten.is_empty());

        let g_w = grad.get_srm(W).unwrap();
        // Feature 1 only appears in the positive instance: its
        // gradient pushes the weight up (negative gradient).
        assert!(g_w.get(1).unwrap()[0] < 0.0);
        // Feature 3 only in the negative instance.
        assert!(g_w.get(3).unwrap()[0] > 0.0);
        assert!(grad.get_tsr(B).is_some());
    }

    #[test]
    fn test_gradient_descent_reduces_loss() {
        let mut op = LrOp::new();
        let mut params = params();
        let b = batch();
        op.forward(&b, &params);
        let before = op.loss();

        let (grad, _) = op.backward(&b, &params);
        let alpha = 0.5;
        let g_w = grad.get_srm(W).unwrap();
        let updates: Vec<(u64, Float)> = g_w.iter().map(|(id, g)| (id, g[0])).collect();
        for (id, g) in updates {
            let w = params.get_srm_mut(W).unwrap();
            let current = w.get(id).unwrap()[0];
            w.assign(id, &[current - alpha * g]).unwrap();
        }

        op.forward(&b, &params);
        assert!(op.loss() < before);
    }
}
