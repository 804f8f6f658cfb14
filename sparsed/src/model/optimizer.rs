//! Per-parameter update rules.
//!
//! An optimizer owns state slices mirroring the parameters it has seen
//! gradients for; mirrors are created lazily the first time a gradient
//! key arrives. The rule set is a tagged variant so persistence and
//! re-shard merging need no downcasts; the saved file starts with the
//! rule name so loads can discover it.

use bytes::{BufMut, Bytes, BytesMut};

use sparsed_config::MiniConfig;

use super::push::{GradEntry, PushPayload};
use super::Error;
use crate::tensor::map::{get_f64, get_str, get_u64, get_u8, put_str};
use crate::tensor::{Float, Initializer, Srm, Tensor, TensorMap, Tsr};

#[derive(Debug, Clone)]
enum Rule {
    Sgd {
        alpha: f64,
    },
    Adagrad {
        alpha: f64,
        beta: f64,
    },
    Adam {
        alpha: f64,
        beta1: f64,
        beta2: f64,
        eps: f64,
        t: u64,
    },
}

impl Rule {
    fn state_slots(&self) -> usize {
        match self {
            Rule::Sgd { .. } => 0,
            Rule::Adagrad { .. } => 1,
            Rule::Adam { .. } => 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Optimizer {
    rule: Rule,
    state: Vec<TensorMap>,
}

/// Explicit optimizer factory.
pub fn new_optimizer(name: &str) -> Result<Optimizer, Error> {
    let rule = match name {
        "sgd" => Rule::Sgd { alpha: 0.01 },
        "adagrad" => Rule::Adagrad {
            alpha: 0.01,
            beta: 1e-6,
        },
        "adam" => Rule::Adam {
            alpha: 0.001,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            t: 0,
        },
        other => return Err(Error::UnknownOptimizer(other.into())),
    };
    let state = vec![TensorMap::new(); rule.state_slots()];
    Ok(Optimizer { rule, state })
}

impl Optimizer {
    pub fn name(&self) -> &'static str {
        match self.rule {
            Rule::Sgd { .. } => "sgd",
            Rule::Adagrad { .. } => "adagrad",
            Rule::Adam { .. } => "adam",
        }
    }

    pub fn init_config(&mut self, config: &MiniConfig) -> Result<(), Error> {
        match &mut self.rule {
            Rule::Sgd { alpha } => {
                if let Some(v) = config.get_parsed::<f64>("alpha", "optimizer_config")? {
                    *alpha = v;
                }
            }
            Rule::Adagrad { alpha, beta } => {
                if let Some(v) = config.get_parsed::<f64>("alpha", "optimizer_config")? {
                    *alpha = v;
                }
                if let Some(v) = config.get_parsed::<f64>("beta", "optimizer_config")? {
                    *beta = v;
                }
            }
            Rule::Adam {
                alpha,
                beta1,
                beta2,
                eps,
                ..
            } => {
                if let Some(v) = config.get_parsed::<f64>("alpha", "optimizer_config")? {
                    *alpha = v;
                }
                if let Some(v) = config.get_parsed::<f64>("beta1", "optimizer_config")? {
                    *beta1 = v;
                }
                if let Some(v) = config.get_parsed::<f64>("beta2", "optimizer_config")? {
                    *beta2 = v;
                }
                if let Some(v) = config.get_parsed::<f64>("eps", "optimizer_config")? {
                    *eps = v;
                }
            }
        }
        Ok(())
    }

    /// Apply one gradient payload. `keep_row` is the admission filter
    /// for sparse rows; rejected rows are skipped entirely.
    pub fn update(
        &mut self,
        param: &mut TensorMap,
        grad: &PushPayload<'_>,
        keep_row: impl Fn(u64) -> bool,
    ) -> Result<(), Error> {
        if let Rule::Adam { t, .. } = &mut self.rule {
            *t += 1;
        }

        let mut result = Ok(());
        grad.for_each(|name, entry| {
            if result.is_err() {
                return;
            }
            result = self.update_entry(param, name, entry, &keep_row);
        });
        result
    }

    fn update_entry(
        &mut self,
        param: &mut TensorMap,
        name: &str,
        entry: GradEntry<'_>,
        keep_row: &impl Fn(u64) -> bool,
    ) -> Result<(), Error> {
        // Gradients for names this shard does not own are dropped.
        let Some(target) = param.get_mut(name) else {
            return Ok(());
        };

        match (target, entry) {
            (Tensor::Tsr(w), GradEntry::Dense(g)) => {
                if w.data().len() != g.len() {
                    return Err(Error::GradShape(name.into()));
                }
                let mut state = DenseState::collect(&mut self.state, name, w.shape().clone());
                let mut rows = state.whole();
                apply(&self.rule, w.data_mut(), g, &mut rows);
                Ok(())
            }
            (Tensor::Tsr(w), GradEntry::Rows(rows)) => {
                // Sparse gradient against a dense table: each id is a
                // row index.
                let col = rows.col();
                let dim0 = (w.data().len() / col.max(1)) as u64;
                let mut state = DenseState::collect(&mut self.state, name, w.shape().clone());
                let mut result = Ok(());
                rows.for_each(|id, g| {
                    if result.is_err() || !keep_row(id) {
                        return;
                    }
                    if id >= dim0 {
                        result = Err(Error::RowOutOfRange { name: name.into(), id });
                        return;
                    }
                    let lo = id as usize * col;
                    let w_row = &mut w.data_mut()[lo..lo + col];
                    let mut row_state = state.slice(lo, col);
                    apply(&self.rule, w_row, g, &mut row_state);
                });
                result
            }
            (Tensor::Srm(w), GradEntry::Rows(rows)) => {
                if w.col() != rows.col() {
                    return Err(Error::GradShape(name.into()));
                }
                let col = w.col();
                let mut state = SparseState::collect(&mut self.state, name, col);
                let mut result = Ok(());
                rows.for_each(|id, g| {
                    if result.is_err() || !keep_row(id) {
                        return;
                    }
                    if g.len() != col {
                        result = Err(Error::GradShape(name.into()));
                        return;
                    }
                    let w_row = w.get_row_no_init(id);
                    let mut row_state = state.row(id);
                    apply(&self.rule, w_row, g, &mut row_state);
                });
                result
            }
            (Tensor::Srm(_), GradEntry::Dense(_)) => Err(Error::GradShape(name.into())),
        }
    }

    /// Visit every sparse state slice, for expiration.
    pub fn for_each_state_srm(&mut self, mut f: impl FnMut(&str, &mut Srm)) {
        for slot in &mut self.state {
            slot.for_each_srm(|name, srm| f(name, srm));
        }
    }

    /// Absorb another optimizer of the same rule, filtering sparse
    /// state rows. Used by the re-sharding load path.
    pub fn merge(&mut self, other: Optimizer, keep_row: impl Fn(u64) -> bool) -> Result<(), Error> {
        if self.name() != other.name() {
            return Err(Error::OptimizerMismatch {
                expected: self.name(),
                found: other.name().into(),
            });
        }
        for (mine, theirs) in self.state.iter_mut().zip(other.state) {
            mine.merge(theirs, |_| true, &keep_row)?;
        }
        Ok(())
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        put_str(buf, self.name());
        match &self.rule {
            Rule::Sgd { alpha } => {
                buf.put_f64_le(*alpha);
            }
            Rule::Adagrad { alpha, beta } => {
                buf.put_f64_le(*alpha);
                buf.put_f64_le(*beta);
            }
            Rule::Adam {
                alpha,
                beta1,
                beta2,
                eps,
                t,
            } => {
                buf.put_f64_le(*alpha);
                buf.put_f64_le(*beta1);
                buf.put_f64_le(*beta2);
                buf.put_f64_le(*eps);
                buf.put_u64_le(*t);
            }
        }
        buf.put_u8(self.state.len() as u8);
        for slot in &self.state {
            slot.encode(buf);
        }
    }

    pub fn decode(bytes: &mut Bytes) -> Result<Self, Error> {
        let name = get_str(bytes)?;
        let rule = match name.as_str() {
            "sgd" => Rule::Sgd {
                alpha: get_f64(bytes)?,
            },
            "adagrad" => Rule::Adagrad {
                alpha: get_f64(bytes)?,
                beta: get_f64(bytes)?,
            },
            "adam" => Rule::Adam {
                alpha: get_f64(bytes)?,
                beta1: get_f64(bytes)?,
                beta2: get_f64(bytes)?,
                eps: get_f64(bytes)?,
                t: get_u64(bytes)?,
            },
            other => return Err(Error::UnknownOptimizer(other.into())),
        };
        let slots = get_u8(bytes)? as usize;
        let mut state = Vec::with_capacity(slots);
        for _ in 0..slots {
            state.push(TensorMap::decode(bytes)?);
        }
        Ok(Optimizer { rule, state })
    }
}

/// Peek the rule name of a serialized optimizer without decoding the
/// state. Used to discover the rule before constructing the local
/// instance on load.
pub fn read_optimizer_name(bytes: &Bytes) -> Result<String, Error> {
    let mut peek = bytes.clone();
    Ok(get_str(&mut peek)?)
}

// Mutable views into the per-slot state rows for one parameter.

struct DenseState<'a> {
    slots: Vec<&'a mut Tsr>,
}

impl<'a> DenseState<'a> {
    fn collect(state: &'a mut [TensorMap], name: &str, shape: crate::tensor::Shape) -> Self {
        let slots = state
            .iter_mut()
            .map(|slot| {
                if slot.get_tsr(name).is_none() {
                    slot.insert(name, Tensor::Tsr(Tsr::new(shape.clone())));
                }
                slot.get_tsr_mut(name).unwrap()
            })
            .collect();
        Self { slots }
    }

    fn slice(&mut self, lo: usize, len: usize) -> StateRows<'_> {
        StateRows {
            rows: self
                .slots
                .iter_mut()
                .map(|t| &mut t.data_mut()[lo..lo + len])
                .collect(),
        }
    }

    fn whole(&mut self) -> StateRows<'_> {
        StateRows {
            rows: self.slots.iter_mut().map(|t| t.data_mut()).collect(),
        }
    }
}

struct SparseState<'a> {
    col: usize,
    slots: Vec<&'a mut Srm>,
}

impl<'a> SparseState<'a> {
    fn collect(state: &'a mut [TensorMap], name: &str, col: usize) -> Self {
        let slots = state
            .iter_mut()
            .map(|slot| {
                let srm = slot.srm_entry(name, col, Initializer::zeros());
                debug_assert_eq!(srm.col(), col);
                srm
            })
            .collect();
        Self { col, slots }
    }

    fn row(&mut self, id: u64) -> StateRows<'_> {
        debug_assert!(self.col > 0);
        StateRows {
            rows: self
                .slots
                .iter_mut()
                .map(|srm| srm.get_row_no_init(id))
                .collect(),
        }
    }
}

struct StateRows<'a> {
    rows: Vec<&'a mut [Float]>,
}

fn apply(rule: &Rule, w: &mut [Float], g: &[Float], state: &mut StateRows<'_>) {
    match rule {
        Rule::Sgd { alpha } => {
            let alpha = *alpha as Float;
            for (w, g) in w.iter_mut().zip(g.iter()) {
                *w -= alpha * *g;
            }
        }
        Rule::Adagrad { alpha, beta } => {
            let alpha = *alpha as Float;
            let beta = *beta as Float;
            let n = &mut state.rows[0];
            for ((w, g), n) in w.iter_mut().zip(g.iter()).zip(n.iter_mut()) {
                *n += *g * *g;
                *w -= alpha * *g / (n.sqrt() + beta);
            }
        }
        Rule::Adam {
            alpha,
            beta1,
            beta2,
            eps,
            t,
        } => {
            let t = (*t).max(1) as i32;
            let correction = alpha * (1.0 - beta2.powi(t)).sqrt() / (1.0 - beta1.powi(t));
            let (alpha_t, beta1, beta2, eps) = (
                correction as Float,
                *beta1 as Float,
                *beta2 as Float,
                *eps as Float,
            );
            let (m_rows, v_rows) = state.rows.split_at_mut(1);
            let m = &mut m_rows[0];
            let v = &mut v_rows[0];
            for (((w, g), m), v) in w
                .iter_mut()
                .zip(g.iter())
                .zip(m.iter_mut())
                .zip(v.iter_mut())
            {
                *m = beta1 * *m + (1 as Float - beta1) * *g;
                *v = beta2 * *v + (1 as Float - beta2) * *g * *g;
                *w -= alpha_t * *m / (v.sqrt() + eps);
            }
        }
    }
}
