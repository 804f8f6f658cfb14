//! Factorization machine.

use fnv::FnvHashSet;

use sparsed_config::MiniConfig;

use super::{bce, sigmoid, Error, ModelZoo, OpContext, ParamLookup};
use crate::graph::{Graph, NodeKind, TensorKind};
use crate::reader::MiniBatch;
use crate::request::PullRequest;
use crate::tensor::{Float, Initializer, Shape, Srm, Tensor, TensorMap, Tsr};

const W: &str = "fm/w";
const V: &str = "fm/v";
const B: &str = "fm/b";

#[derive(Debug)]
pub struct FmModel {
    k: usize,
}

impl Default for FmModel {
    fn default() -> Self {
        Self { k: 8 }
    }
}

impl ModelZoo for FmModel {
    fn init_config(&mut self, config: &MiniConfig) -> Result<(), Error> {
        for (key, value) in config.iter() {
            match key {
                "k" => {
                    self.k = value.parse().map_err(|_| Error::InvalidConfig {
                        key: key.into(),
                        value: value.into(),
                    })?;
                    if self.k <= 1 {
                        return Err(Error::InvalidConfig {
                            key: key.into(),
                            value: value.into(),
                        });
                    }
                }
                _ => {
                    return Err(Error::UnexpectedConfig {
                        key: key.into(),
                        value: value.into(),
                    })
                }
            }
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
            V,
            NodeKind::Variable {
                kind: TensorKind::Srm,
                shape: Shape::new(&[-1, self.k as i64]),
                initializer: Initializer::randn_xavier(),
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
            "fm/z",
            NodeKind::Hidden {
                op: "fm_logit".into(),
                inputs: vec!["x".into(), W.into(), V.into(), B.into()],
            },
        )?;
        graph.add_node(
            "loss",
            NodeKind::Hidden {
                op: "sigmoid_bce".into(),
                inputs: vec!["fm/z".into(), "y".into()],
            },
        )?;
        graph.add_node(
            "prob",
            NodeKind::Hidden {
                op: "sigmoid".into(),
                inputs: vec!["fm/z".into()],
            },
        )?;
        graph.compile(&["loss", "prob", "prob"])?;
        Ok(graph)
    }
}

pub struct FmOp {
    k: usize,
    probs: Vec<Float>,
    /// Per instance: `S_f = Σ_j v_jf x_j`, cached by forward for the
    /// quadratic-term gradient.
    sums: Vec<Vec<Float>>,
    loss: f64,
}

impl FmOp {
    /// The factor width comes from the compiled graph, not from zoo
    /// config, so loaded models predict without it.
    pub fn from_graph(graph: &Graph) -> Result<Self, Error> {
        let k = graph
            .variables()
            .find(|(name, _, _, _)| *name == V)
            .map(|(_, _, shape, _)| shape.col())
            .ok_or_else(|| Error::UnknownOp(V.into()))?;
        Ok(Self {
            k,
            probs: Vec::new(),
            sums: Vec::new(),
            loss: 0.0,
        })
    }
}

impl OpContext for FmOp {
    fn pull_request(&self, batch: &MiniBatch) -> PullRequest {
        let mut req = PullRequest::new();
        req.tsr_set.insert(B.into());
        let ids: FnvHashSet<u64> = batch
            .rows
            .iter()
            .flat_map(|row| row.iter().map(|(id, _)| *id))
            .collect();
        req.srm_map.insert(W.into(), ids.clone());
        req.srm_map.insert(V.into(), ids);
        req
    }

    fn forward(&mut self, batch: &MiniBatch, param: &dyn ParamLookup) {
        let b = param.tsr(B).map_or(0.0, |b| b[0]);
        self.probs.clear();
        self.sums.clear();
        let mut loss = 0.0;

        for (i, row) in batch.rows.iter().enumerate() {
            let mut z = b;
            let mut sum = vec![0.0 as Float; self.k];
            let mut sum_sq = vec![0.0 as Float; self.k];

            for (id, x) in row {
                if let Some(w) = param.srm_row(W, *id) {
                    z += w[0] * x;
                }
                if let Some(v) = param.srm_row(V, *id) {
                    for f in 0..self.k {
                        let vx = v[f] * x;
                        sum[f] += vx;
                        sum_sq[f] += vx * vx;
                    }
                }
            }
            for f in 0..self.k {
                z += 0.5 as Float * (sum[f] * sum[f] - sum_sq[f]);
            }

            let p = sigmoid(z);
            self.probs.push(p);
            self.sums.push(sum);
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

    fn backward(&mut self, batch: &MiniBatch, param: &dyn ParamLookup) -> (TensorMap, TensorMap) {
        let batch_size = batch.batch().max(1) as Float;
        let mut g_w = Srm::new(1, Initializer::zeros());
        let mut g_v = Srm::new(self.k, Initializer::zeros());
        let mut g_b = 0.0 as Float;

        for (i, row) in batch.rows.iter().enumerate() {
            let d = (self.probs[i] - batch.labels[i]) / batch_size;
            g_b += d;
            let sum = &self.sums[i];

            for (id, x) in row {
                g_w.get_row_no_init(*id)[0] += d * x;
                let v_row = param.srm_row(V, *id);
                let g = g_v.get_row_no_init(*id);
                for f in 0..self.k {
                    let v = v_row.map_or(0.0 as Float, |v| v[f]);
                    g[f] += d * (x * sum[f] - v * x * x);
                }
            }
        }

        let mut grad = TensorMap::new();
        grad.insert(W, Tensor::Srm(g_w));
        grad.insert(V, Tensor::Srm(g_v));
        let mut b = Tsr::new(Shape::new(&[1]));
        b.data_mut()[0] = g_b;
        grad.insert(B, Tensor::Tsr(b));
        (grad, TensorMap::new())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn graph() -> Graph {
        let mut zoo = FmModel::default();
        zoo.init_config(&MiniConfig::parse("k=2").unwrap()).unwrap();
        zoo.build_graph().unwrap()
    }

    fn batch() -> MiniBatch {
        MiniBatch {
            labels: vec![1.0, 0.0],
            rows: vec![vec![(1, 1.0), (2, 1.0)], vec![(3, 1.0)]],
        }
    }

    fn params() -> TensorMap {
        let mut map = TensorMap::new();
        let mut w = Srm::new(1, Initializer::zeros());
        let mut v = Srm::new(2, Initializer::zeros());
        for id in [1u64, 2, 3] {
            w.assign(id, &[0.1]).unwrap();
            v.assign(id, &[0.5, -0.5]).unwrap();
        }
        map.insert(W, Tensor::Srm(w));
        map.insert(V, Tensor::Srm(v));
        map.insert(B, Tensor::Tsr(Tsr::new(Shape::new(&[1]))));
        map
    }

    #[test]
    fn test_k_comes_from_graph() {
        let op = FmOp::from_graph(&graph()).unwrap();
        assert_eq!(op.k, 2);
    }

    #[test]
    fn test_config_rejects_bad_k() {
        let mut zoo = FmModel::default();
        assert!(zoo.init_config(&MiniConfig::parse("k=1").unwrap()).is_err());
        assert!(zoo
            .init_config(&MiniConfig::parse("dim=10").unwrap())
            .is_err());
    }

    #[test]
    fn test_quadratic_term() {
        // One instance with two interacting features; v rows are
        // equal, so the pairwise term is v·v = 0.5*0.5 + 0.5*0.5.
        let mut op = FmOp::from_graph(&graph()).unwrap();
        let single = MiniBatch {
            labels: vec![1.0],
            rows: vec![vec![(1, 1.0), (2, 1.0)]],
        };
        op.forward(&single, &params());
        // z = w1 + w2 + <v1, v2> = 0.1 + 0.1 + 0.5 = 0.7
        let expected = sigmoid(0.7);
        assert!((op.predictions()[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_gradient_descent_reduces_loss() {
        let mut op = FmOp::from_graph(&graph()).unwrap();
        let mut params = params();
        let b = batch();
        op.forward(&b, &params);
        let before = op.loss();

        let (grad, _) = op.backward(&b, &params);
        for name in [W, V] {
            let g = grad.get_srm(name).unwrap();
            let updates: Vec<(u64, Vec<Float>)> =
                g.iter().map(|(id, row)| (id, row.to_vec())).collect();
            let p = params.get_srm_mut(name).unwrap();
            for (id, g_row) in updates {
                let mut row = p.get(id).unwrap().to_vec();
                for (w, g) in row.iter_mut().zip(g_row.iter()) {
                    *w -= 0.5 * g;
                }
                p.assign(id, &row).unwrap();
            }
        }

        op.forward(&b, &params);
        assert!(op.loss() < before);
    }
}
