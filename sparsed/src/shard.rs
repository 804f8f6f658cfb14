//! Pure sharding functions.
//!
//! A [`Shard`] maps a dense tensor name or a sparse feature id to a
//! shard index in `[0, size)`. The mapping depends only on
//! `(mode, size, func_name)` and is stable across runs; it is saved
//! with the model so a mismatched runtime configuration is detected at
//! load time and routed through the re-sharding path.

use std::hash::Hasher;

use bytes::{BufMut, Bytes, BytesMut};
use fnv::FnvHasher;
use thiserror::Error;

use crate::tensor::map::{get_str, get_u32, get_u8, put_str};

pub const DEFAULT_SHARD_FUNC: &str = "default";

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown shard func: {0}")]
    UnknownFunc(String),

    #[error("unknown shard mode: {0}")]
    UnknownMode(u8),

    #[error("malformed shard payload: {0}")]
    Payload(#[from] crate::tensor::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ShardMode {
    None = 0,
    Hash = 1,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shard {
    mode: ShardMode,
    size: usize,
    func_name: String,
}

impl Default for Shard {
    fn default() -> Self {
        Self::none()
    }
}

impl Shard {
    /// Single-shard configuration; both id functions return 0.
    pub fn none() -> Self {
        Self {
            mode: ShardMode::None,
            size: 1,
            func_name: DEFAULT_SHARD_FUNC.into(),
        }
    }

    pub fn hash(size: usize, func_name: &str) -> Result<Self, Error> {
        if func_name != DEFAULT_SHARD_FUNC {
            return Err(Error::UnknownFunc(func_name.into()));
        }
        debug_assert!(size > 0);
        Ok(Self {
            mode: ShardMode::Hash,
            size,
            func_name: func_name.into(),
        })
    }

    pub fn mode(&self) -> ShardMode {
        self.mode
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn func_name(&self) -> &str {
        &self.func_name
    }

    pub fn tsr_shard_id(&self, name: &str) -> usize {
        match self.mode {
            ShardMode::None => 0,
            ShardMode::Hash => (fnv1a(name.as_bytes()) % self.size as u64) as usize,
        }
    }

    pub fn srm_shard_id(&self, id: u64) -> usize {
        match self.mode {
            ShardMode::None => 0,
            ShardMode::Hash => (fnv1a(&id.to_le_bytes()) % self.size as u64) as usize,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.mode as u8);
        buf.put_u32_le(self.size as u32);
        put_str(buf, &self.func_name);
    }

    pub fn decode(bytes: &mut Bytes) -> Result<Self, Error> {
        let mode = match get_u8(bytes)? {
            0 => ShardMode::None,
            1 => ShardMode::Hash,
            other => return Err(Error::UnknownMode(other)),
        };
        let size = get_u32(bytes)? as usize;
        let func_name = get_str(bytes)?;
        Ok(Self {
            mode,
            size,
            func_name,
        })
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(bytes);
    hasher.finish()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_none_mode() {
        let shard = Shard::none();
        assert_eq!(shard.tsr_shard_id("anything"), 0);
        assert_eq!(shard.srm_shard_id(u64::MAX), 0);
    }

    #[test]
    fn test_stable_across_instances() {
        let a = Shard::hash(4, DEFAULT_SHARD_FUNC).unwrap();
        let b = Shard::hash(4, DEFAULT_SHARD_FUNC).unwrap();
        for id in 0..1000u64 {
            assert_eq!(a.srm_shard_id(id), b.srm_shard_id(id));
        }
        assert_eq!(a.tsr_shard_id("fm/v"), b.tsr_shard_id("fm/v"));
    }

    #[test]
    fn test_in_range_and_spread() {
        let shard = Shard::hash(3, DEFAULT_SHARD_FUNC).unwrap();
        let mut seen = [false; 3];
        for id in 0..100u64 {
            let s = shard.srm_shard_id(id);
            assert!(s < 3);
            seen[s] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn test_unknown_func_rejected() {
        assert!(Shard::hash(2, "md5").is_err());
    }

    #[test]
    fn test_codec_round_trip() {
        let shard = Shard::hash(7, DEFAULT_SHARD_FUNC).unwrap();
        let mut buf = BytesMut::new();
        shard.encode(&mut buf);
        let mut bytes = buf.freeze();
        let back = Shard::decode(&mut bytes).unwrap();
        assert_eq!(shard, back);
        assert_ne!(back, Shard::none());
    }
}
