//! File dispatching.

use std::time::{Duration, Instant};

use fnv::FnvHashMap;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::warn;

/// Hands each input file out exactly once per epoch. Files taken by a
/// worker sit in flight until finished; with a non-zero timeout, stuck
/// files return to the pending list.
#[derive(Debug)]
pub struct FileDispatcher {
    files: Vec<String>,
    pending: Vec<String>,
    in_flight: FnvHashMap<String, Instant>,
    reverse: bool,
    shuffle: bool,
    timeout: Duration,
    rng: StdRng,
}

impl FileDispatcher {
    pub fn new(
        files: Vec<String>,
        reverse: bool,
        shuffle: bool,
        timeout: Duration,
        seed: u64,
    ) -> Self {
        Self {
            files,
            pending: Vec::new(),
            in_flight: FnvHashMap::default(),
            reverse,
            shuffle,
            timeout,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Refill the pending list for a new epoch, re-shuffling if
    /// configured.
    pub fn begin_epoch(&mut self) {
        debug_assert!(self.in_flight.is_empty());
        self.pending = self.files.clone();
        if self.shuffle {
            self.pending.shuffle(&mut self.rng);
        }
        if self.reverse {
            self.pending.reverse();
        }
        // Files pop off the back.
        self.pending.reverse();
    }

    /// Next file to hand out, if any. Reclaims timed-out files first.
    pub fn next(&mut self) -> Option<String> {
        self.reclaim();
        let file = self.pending.pop()?;
        self.in_flight.insert(file.clone(), Instant::now());
        Some(file)
    }

    /// Mark a file finished; returns false for unknown files.
    pub fn finish(&mut self, file: &str) -> bool {
        self.in_flight.remove(file).is_some()
    }

    /// The epoch is drained once nothing is pending or in flight.
    pub fn epoch_drained(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn has_in_flight(&self) -> bool {
        !self.in_flight.is_empty()
    }

    fn reclaim(&mut self) {
        if self.timeout.is_zero() {
            return;
        }
        let timeout = self.timeout;
        let mut reclaimed = Vec::new();
        self.in_flight.retain(|file, taken| {
            if taken.elapsed() > timeout {
                reclaimed.push(file.clone());
                false
            } else {
                true
            }
        });
        for file in reclaimed {
            warn!(%file, "reclaiming timed-out file");
            self.pending.push(file);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn files(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("part-{:03}", i)).collect()
    }

    #[test]
    fn test_every_file_dispatched_exactly_once() {
        let mut d = FileDispatcher::new(files(10), false, true, Duration::ZERO, 42);
        d.begin_epoch();

        let mut seen = std::collections::HashSet::new();
        while let Some(file) = d.next() {
            assert!(seen.insert(file.clone()));
            assert!(d.finish(&file));
        }
        assert_eq!(seen.len(), 10);
        assert!(d.epoch_drained());
        assert!(!d.finish("part-000"));
    }

    #[test]
    fn test_ordered_without_shuffle() {
        let mut d = FileDispatcher::new(files(3), false, false, Duration::ZERO, 0);
        d.begin_epoch();
        assert_eq!(d.next().unwrap(), "part-000");
        assert_eq!(d.next().unwrap(), "part-001");
        assert_eq!(d.next().unwrap(), "part-002");
        assert!(d.next().is_none());
        assert!(d.has_in_flight());
    }

    #[test]
    fn test_reverse() {
        let mut d = FileDispatcher::new(files(3), true, false, Duration::ZERO, 0);
        d.begin_epoch();
        assert_eq!(d.next().unwrap(), "part-002");
    }

    #[test]
    fn test_shuffle_changes_per_epoch() {
        let mut d = FileDispatcher::new(files(20), false, true, Duration::ZERO, 7);
        let mut epochs = Vec::new();
        for _ in 0..2 {
            d.begin_epoch();
            let mut order = Vec::new();
            while let Some(file) = d.next() {
                d.finish(&file);
                order.push(file);
            }
            epochs.push(order);
        }
        assert_ne!(epochs[0], epochs[1]);
        let mut sorted = epochs[0].clone();
        sorted.sort();
        assert_eq!(sorted, files(20));
    }

    #[test]
    fn test_timeout_reclaims() {
        let mut d = FileDispatcher::new(files(1), false, false, Duration::from_millis(100), 0);
        d.begin_epoch();
        let file = d.next().unwrap();
        assert!(d.next().is_none());
        std::thread::sleep(Duration::from_millis(200));
        // The stuck file comes back.
        assert_eq!(d.next().unwrap(), file);
    }
}
