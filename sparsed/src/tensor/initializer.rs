//! Variable initializers.

use rand::Rng;
use rand_distr::{Distribution, Normal, Uniform};

use super::{Error, Float};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InitKind {
    Zeros = 0,
    Ones = 1,
    Constant = 2,
    Rand = 3,
    Randn = 4,
    RandnXavier = 5,
    RandLecun = 6,
}

impl TryFrom<u8> for InitKind {
    type Error = Error;

    fn try_from(v: u8) -> Result<Self, Error> {
        Ok(match v {
            0 => Self::Zeros,
            1 => Self::Ones,
            2 => Self::Constant,
            3 => Self::Rand,
            4 => Self::Randn,
            5 => Self::RandnXavier,
            6 => Self::RandLecun,
            other => return Err(Error::UnknownInitializer(other)),
        })
    }
}

/// `(kind, p1, p2)` triple attached to every variable. The parameter
/// meaning depends on the kind: `Constant(value, _)`, `Rand(lo, hi)`,
/// `Randn(mean, std)`. Xavier and Lecun derive their scale from the
/// fan-in at fill time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Initializer {
    pub kind: InitKind,
    pub p1: f64,
    pub p2: f64,
}

impl Default for Initializer {
    fn default() -> Self {
        Self::zeros()
    }
}

impl Initializer {
    pub fn new(kind: InitKind, p1: f64, p2: f64) -> Self {
        Self { kind, p1, p2 }
    }

    pub fn zeros() -> Self {
        Self::new(InitKind::Zeros, 0.0, 0.0)
    }

    pub fn ones() -> Self {
        Self::new(InitKind::Ones, 0.0, 0.0)
    }

    pub fn constant(c: f64) -> Self {
        Self::new(InitKind::Constant, c, 0.0)
    }

    pub fn rand(lo: f64, hi: f64) -> Self {
        Self::new(InitKind::Rand, lo, hi)
    }

    pub fn randn(mean: f64, std: f64) -> Self {
        Self::new(InitKind::Randn, mean, std)
    }

    pub fn randn_xavier() -> Self {
        Self::new(InitKind::RandnXavier, 0.0, 0.0)
    }

    /// Fill `out`. `fan_in` feeds the Xavier/Lecun scale; for a sparse
    /// row it is the column count, for a dense tensor the last
    /// dimension.
    pub fn fill(&self, rng: &mut impl Rng, out: &mut [Float], fan_in: usize) {
        match self.kind {
            InitKind::Zeros => out.fill(0 as Float),
            InitKind::Ones => out.fill(1 as Float),
            InitKind::Constant => out.fill(self.p1 as Float),
            InitKind::Rand => {
                let dist = Uniform::new(self.p1, self.p2).expect("invalid rand bounds");
                for v in out.iter_mut() {
                    *v = dist.sample(rng) as Float;
                }
            }
            InitKind::Randn => {
                let dist = Normal::new(self.p1, self.p2).expect("invalid randn params");
                for v in out.iter_mut() {
                    *v = dist.sample(rng) as Float;
                }
            }
            InitKind::RandnXavier => {
                let std = 1.0 / (fan_in.max(1) as f64).sqrt();
                let dist = Normal::new(0.0, std).expect("invalid xavier std");
                for v in out.iter_mut() {
                    *v = dist.sample(rng) as Float;
                }
            }
            InitKind::RandLecun => {
                let bound = (3.0 / fan_in.max(1) as f64).sqrt();
                let dist = Uniform::new(-bound, bound).expect("invalid lecun bound");
                for v in out.iter_mut() {
                    *v = dist.sample(rng) as Float;
                }
            }
        }
    }
}
