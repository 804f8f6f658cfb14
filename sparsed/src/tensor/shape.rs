//! Tensor shapes.

use std::fmt::{self, Display};

/// Placeholder for the batch axis, resolved at forward time.
pub const BATCH_AXIS: i64 = -1;

/// An ordered list of dimensions. Every dimension is positive except
/// for an optional leading [`BATCH_AXIS`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Shape {
    dims: Vec<i64>,
}

impl Shape {
    pub fn new(dims: &[i64]) -> Self {
        debug_assert!(dims
            .iter()
            .enumerate()
            .all(|(i, &d)| d > 0 || (d == BATCH_AXIS && i == 0)));
        Self {
            dims: dims.to_vec(),
        }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn is_rank(&self, rank: usize) -> bool {
        self.rank() == rank
    }

    pub fn dim(&self, axis: usize) -> i64 {
        self.dims[axis]
    }

    pub fn dims(&self) -> &[i64] {
        &self.dims
    }

    pub fn has_batch_axis(&self) -> bool {
        self.dims.first() == Some(&BATCH_AXIS)
    }

    /// Total number of elements. `None` while the batch axis is
    /// unresolved.
    pub fn total_dim(&self) -> Option<usize> {
        if self.has_batch_axis() {
            return None;
        }
        Some(self.dims.iter().product::<i64>() as usize)
    }

    /// Replace the batch axis with a concrete batch size.
    pub fn resolve_batch(&self, batch: usize) -> Shape {
        let mut dims = self.dims.clone();
        if let Some(first) = dims.first_mut() {
            if *first == BATCH_AXIS {
                *first = batch as i64;
            }
        }
        Shape { dims }
    }

    /// Column count: the last dimension. Used as the row width of
    /// sparse variables.
    pub fn col(&self) -> usize {
        *self.dims.last().unwrap_or(&1) as usize
    }
}

impl Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, ")")
    }
}

impl From<&[i64]> for Shape {
    fn from(dims: &[i64]) -> Self {
        Self::new(dims)
    }
}
