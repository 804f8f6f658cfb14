//! Sparse row matrices.

use fnv::FnvHashMap;
use rand::Rng;

use super::{Error, Float, Initializer};

/// A map from feature id to an owned row of `col()` floats, with lazy
/// row creation. Logical shape is `(∞, col)`; iteration order is
/// unspecified.
#[derive(Debug, Clone, Default)]
pub struct Srm {
    col: usize,
    initializer: Initializer,
    rows: FnvHashMap<u64, Box<[Float]>>,
}

impl Srm {
    pub fn new(col: usize, initializer: Initializer) -> Self {
        Self {
            col,
            initializer,
            rows: FnvHashMap::default(),
        }
    }

    pub fn set_col(&mut self, col: usize) {
        debug_assert!(self.rows.is_empty());
        self.col = col;
    }

    pub fn col(&self) -> usize {
        self.col
    }

    pub fn set_initializer(&mut self, initializer: Initializer) {
        self.initializer = initializer;
    }

    pub fn initializer(&self) -> &Initializer {
        &self.initializer
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn reserve(&mut self, additional: usize) {
        self.rows.reserve(additional);
    }

    pub fn contains(&self, id: u64) -> bool {
        self.rows.contains_key(&id)
    }

    pub fn get(&self, id: u64) -> Option<&[Float]> {
        self.rows.get(&id).map(|r| r.as_ref())
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut [Float]> {
        self.rows.get_mut(&id).map(|r| r.as_mut())
    }

    /// Fetch a row, lazily creating it with the initializer. The only
    /// path that runs the initializer.
    pub fn get_row(&mut self, rng: &mut impl Rng, id: u64) -> &mut [Float] {
        let col = self.col;
        let initializer = self.initializer;
        self.rows
            .entry(id)
            .or_insert_with(|| {
                let mut row = vec![0 as Float; col].into_boxed_slice();
                initializer.fill(rng, &mut row, col);
                row
            })
            .as_mut()
    }

    /// Fetch a row, inserting zeros when missing. Used for optimizer
    /// state mirrors where the initializer must not run.
    pub fn get_row_no_init(&mut self, id: u64) -> &mut [Float] {
        let col = self.col;
        self.rows
            .entry(id)
            .or_insert_with(|| vec![0 as Float; col].into_boxed_slice())
            .as_mut()
    }

    /// Insert or overwrite a row.
    pub fn assign(&mut self, id: u64, values: &[Float]) -> Result<(), Error> {
        if values.len() != self.col {
            return Err(Error::ColMismatch(self.col, values.len()));
        }
        match self.rows.get_mut(&id) {
            Some(row) => row.copy_from_slice(values),
            None => {
                self.rows.insert(id, values.into());
            }
        }
        Ok(())
    }

    pub fn insert_owned(&mut self, id: u64, row: Box<[Float]>) -> Result<(), Error> {
        if row.len() != self.col {
            return Err(Error::ColMismatch(self.col, row.len()));
        }
        self.rows.insert(id, row);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &[Float])> {
        self.rows.iter().map(|(id, row)| (*id, row.as_ref()))
    }

    pub fn ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.rows.keys().copied()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (u64, Box<[Float]>)> + '_ {
        self.rows.drain()
    }

    /// Absorb rows from `other`, keeping only ids accepted by
    /// `filter`. Later rows win on id collision.
    pub fn merge(&mut self, other: Srm, filter: impl Fn(u64) -> bool) -> Result<(), Error> {
        if other.col != self.col {
            return Err(Error::ColMismatch(self.col, other.col));
        }
        for (id, row) in other.rows {
            if filter(id) {
                self.rows.insert(id, row);
            }
        }
        Ok(())
    }

    pub fn remove_if(&mut self, mut pred: impl FnMut(u64) -> bool) {
        self.rows.retain(|id, _| !pred(*id));
    }

    /// Drop rows whose L1 norm is zero. Run before a save to keep
    /// never-updated lazily-created rows out of the artifact.
    pub fn remove_zeros(&mut self) {
        self.rows
            .retain(|_, row| row.iter().any(|v| *v != 0 as Float));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(9527)
    }

    #[test]
    fn test_lazy_init_runs_once() {
        let mut srm = Srm::new(4, Initializer::randn(0.0, 1.0));
        let first = srm.get_row(&mut rng(), 7).to_vec();
        assert!(first.iter().any(|v| *v != 0.0));
        // Same id again: the stored row is returned, not re-drawn.
        let again = srm.get_row(&mut rng(), 7).to_vec();
        assert_eq!(first, again);
        assert_eq!(srm.len(), 1);
    }

    #[test]
    fn test_lazy_init_deterministic() {
        let make = || {
            let mut srm = Srm::new(8, Initializer::randn(0.0, 0.01));
            let mut r = rng();
            for id in [3u64, 1, 2] {
                srm.get_row(&mut r, id);
            }
            srm
        };
        let a = make();
        let b = make();
        for id in [1u64, 2, 3] {
            assert_eq!(a.get(id).unwrap(), b.get(id).unwrap());
        }
    }

    #[test]
    fn test_no_init_is_zeros() {
        let mut srm = Srm::new(3, Initializer::ones());
        assert_eq!(srm.get_row_no_init(5), &[0.0; 3]);
    }

    #[test]
    fn test_merge_filter() {
        let mut a = Srm::new(1, Initializer::zeros());
        a.assign(1, &[1.0]).unwrap();
        let mut b = Srm::new(1, Initializer::zeros());
        b.assign(2, &[2.0]).unwrap();
        b.assign(3, &[3.0]).unwrap();
        a.merge(b, |id| id % 2 == 0).unwrap();
        assert_eq!(a.len(), 2);
        assert!(a.contains(2));
        assert!(!a.contains(3));
    }

    #[test]
    fn test_merge_col_mismatch() {
        let mut a = Srm::new(2, Initializer::zeros());
        let b = Srm::new(3, Initializer::zeros());
        assert!(a.merge(b, |_| true).is_err());
    }

    #[test]
    fn test_remove_zeros() {
        let mut srm = Srm::new(2, Initializer::zeros());
        srm.assign(1, &[0.0, 0.0]).unwrap();
        srm.assign(2, &[0.0, 0.5]).unwrap();
        srm.remove_zeros();
        assert_eq!(srm.len(), 1);
        assert!(srm.contains(2));
    }
}
