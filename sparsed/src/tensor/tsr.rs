//! Dense tensors.

use rand::Rng;

use super::{Error, Float, Initializer, Shape};

/// A contiguous dense tensor of fixed shape.
///
/// A placeholder tensor carries a shape but no storage; worker-side
/// model placeholders use it so split helpers can consult tensor kinds
/// without allocating parameters they will never own.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tsr {
    shape: Shape,
    data: Vec<Float>,
}

impl Tsr {
    pub fn new(shape: Shape) -> Self {
        let total = shape.total_dim().unwrap_or(0);
        Self {
            shape,
            data: vec![0 as Float; total],
        }
    }

    pub fn placeholder(shape: Shape) -> Self {
        Self {
            shape,
            data: Vec::new(),
        }
    }

    pub fn from_data(shape: Shape, data: Vec<Float>) -> Result<Self, Error> {
        if let Some(total) = shape.total_dim() {
            if total != data.len() {
                return Err(Error::ShapeMismatch(
                    shape.to_string(),
                    format!("{} values", data.len()),
                ));
            }
        }
        Ok(Self { shape, data })
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn is_placeholder(&self) -> bool {
        self.data.is_empty() && self.shape.total_dim() != Some(0)
    }

    /// Reallocate for a new shape, zero-filled.
    pub fn resize(&mut self, shape: Shape) {
        let total = shape.total_dim().unwrap_or(0);
        self.shape = shape;
        self.data.clear();
        self.data.resize(total, 0 as Float);
    }

    pub fn rand_init(&mut self, rng: &mut impl Rng, initializer: &Initializer) {
        let fan_in = self.shape.col();
        initializer.fill(rng, &mut self.data, fan_in);
    }

    pub fn data(&self) -> &[Float] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [Float] {
        &mut self.data
    }

    /// Overwrite from a same-sized slice.
    pub fn assign(&mut self, values: &[Float]) -> Result<(), Error> {
        if self.data.len() != values.len() {
            return Err(Error::ShapeMismatch(
                self.shape.to_string(),
                format!("{} values", values.len()),
            ));
        }
        self.data.copy_from_slice(values);
        Ok(())
    }
}
