//! Side indices kept next to the parameters: last-update timestamps,
//! access frequencies, and online-learning deltas.

pub mod freq;
pub mod ol;
pub mod ts;

pub use freq::FreqStore;
pub use ol::OlStore;
pub use ts::TsStore;
