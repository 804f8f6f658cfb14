//! Model directory layout and file primitives.
//!
//! Every shard writes its own suffixed files so `N` param servers
//! persist without coordination:
//!
//! ```text
//! graph.bin            (shard 0 only)
//! shard.bin            (shard 0 only)
//! model.bin.<i>        optimizer.bin.<i>
//! ts_store.bin.<i>     freq_store.bin.<i>
//! model.txt.<i>        model.feature_kv.<i>   (optional)
//! SUCCESS_.<i>
//! ```
//!
//! In non-sharded mode the suffix is empty. A legacy naming scheme
//! (`param.bin.<i>.<N>.-2.1`, …) is accepted on load, chosen by which
//! SUCCESS marker family is present; only the current scheme is ever
//! written.

use std::fs;
use std::path::{Path, PathBuf};

use bytes::{BufMut, Bytes, BytesMut};

use super::Error;
use crate::shard::{Shard, ShardMode};

const MAGIC: &[u8; 4] = b"SPRD";

pub const KIND_MODEL: u8 = 1;
pub const KIND_OPTIMIZER: u8 = 2;
pub const KIND_TS_STORE: u8 = 3;
pub const KIND_FREQ_STORE: u8 = 4;
pub const KIND_GRAPH: u8 = 5;
pub const KIND_SHARD: u8 = 6;

/// Which file naming scheme a model directory uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Current,
    Legacy,
}

fn suffix(shard: &Shard, shard_id: usize) -> String {
    match shard.mode() {
        ShardMode::None => String::new(),
        ShardMode::Hash => format!(".{}", shard_id),
    }
}

fn suffix_legacy(shard: &Shard, shard_id: usize) -> String {
    format!(".{}.{}.-2.1", shard_id, shard.size())
}

fn member(dir: &Path, stem: &str, shard: &Shard, shard_id: usize, layout: Layout) -> PathBuf {
    let (stem, suffix) = match layout {
        Layout::Current => (stem, suffix(shard, shard_id)),
        Layout::Legacy => (
            legacy_stem(stem),
            suffix_legacy(shard, shard_id),
        ),
    };
    dir.join(format!("{}{}", stem, suffix))
}

fn legacy_stem(stem: &str) -> &'static str {
    match stem {
        "model.bin" => "param.bin",
        "optimizer.bin" => "optimizer.bin",
        "ts_store.bin" => "ts.bin",
        "freq_store.bin" => "freq.bin",
        "SUCCESS_" => "SUCCESS_",
        _ => unreachable!("no legacy name for {stem}"),
    }
}

pub fn model_file(dir: &Path, shard: &Shard, shard_id: usize, layout: Layout) -> PathBuf {
    member(dir, "model.bin", shard, shard_id, layout)
}

pub fn optimizer_file(dir: &Path, shard: &Shard, shard_id: usize, layout: Layout) -> PathBuf {
    member(dir, "optimizer.bin", shard, shard_id, layout)
}

pub fn ts_store_file(dir: &Path, shard: &Shard, shard_id: usize, layout: Layout) -> PathBuf {
    member(dir, "ts_store.bin", shard, shard_id, layout)
}

pub fn freq_store_file(dir: &Path, shard: &Shard, shard_id: usize, layout: Layout) -> PathBuf {
    member(dir, "freq_store.bin", shard, shard_id, layout)
}

pub fn success_file(dir: &Path, shard: &Shard, shard_id: usize, layout: Layout) -> PathBuf {
    member(dir, "SUCCESS_", shard, shard_id, layout)
}

pub fn text_model_file(dir: &Path, shard: &Shard, shard_id: usize) -> PathBuf {
    dir.join(format!("model.txt{}", suffix(shard, shard_id)))
}

pub fn feature_kv_file(dir: &Path, shard: &Shard, shard_id: usize) -> PathBuf {
    dir.join(format!("model.feature_kv{}", suffix(shard, shard_id)))
}

pub fn graph_file(dir: &Path) -> PathBuf {
    dir.join("graph.bin")
}

pub fn shard_file(dir: &Path) -> PathBuf {
    dir.join("shard.bin")
}

/// Pick the naming scheme by SUCCESS marker presence. Current markers
/// are `SUCCESS_` or `SUCCESS_.<i>`; anything longer is legacy.
pub fn detect_layout(dir: &Path) -> Result<Layout, Error> {
    let entries = fs::read_dir(dir).map_err(|e| Error::io(dir, e))?;
    let mut legacy = false;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io(dir, e))?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(rest) = name.strip_prefix("SUCCESS_") {
            let is_current = rest.is_empty()
                || rest
                    .strip_prefix('.')
                    .is_some_and(|i| !i.is_empty() && i.bytes().all(|b| b.is_ascii_digit()));
            if is_current {
                return Ok(Layout::Current);
            }
            legacy = true;
        }
    }
    if legacy {
        Ok(Layout::Legacy)
    } else {
        Err(Error::NoModel(dir.to_path_buf()))
    }
}

/// Write a payload file with the shared magic + kind header.
pub fn write_payload(
    path: &Path,
    kind: u8,
    encode: impl FnOnce(&mut BytesMut),
) -> Result<(), Error> {
    let mut buf = BytesMut::new();
    buf.put_slice(MAGIC);
    buf.put_u8(kind);
    encode(&mut buf);
    fs::write(path, &buf).map_err(|e| Error::io(path, e))
}

/// Read a payload file back, validating the header.
pub fn read_payload(path: &Path, kind: u8) -> Result<Bytes, Error> {
    let raw = fs::read(path).map_err(|e| Error::io(path, e))?;
    let mut bytes = Bytes::from(raw);
    if bytes.len() < MAGIC.len() + 1 || &bytes[..4] != MAGIC || bytes[4] != kind {
        return Err(Error::BadFile(path.to_path_buf()));
    }
    let _ = bytes.split_to(MAGIC.len() + 1);
    Ok(bytes)
}

/// The SUCCESS marker is an empty file written last; its presence
/// means the whole save completed.
pub fn write_success(dir: &Path, shard: &Shard, shard_id: usize) -> Result<(), Error> {
    let path = success_file(dir, shard, shard_id, Layout::Current);
    fs::write(&path, b"").map_err(|e| Error::io(path, e))
}

pub fn save_graph(dir: &Path, graph: &crate::graph::Graph) -> Result<(), Error> {
    write_payload(&graph_file(dir), KIND_GRAPH, |buf| graph.encode(buf))
}

pub fn load_graph(dir: &Path) -> Result<crate::graph::Graph, Error> {
    let mut bytes = read_payload(&graph_file(dir), KIND_GRAPH)?;
    Ok(crate::graph::Graph::decode(&mut bytes)?)
}

pub fn save_shard(dir: &Path, shard: &Shard) -> Result<(), Error> {
    write_payload(&shard_file(dir), KIND_SHARD, |buf| shard.encode(buf))
}

pub fn load_shard(dir: &Path) -> Result<Shard, Error> {
    let mut bytes = read_payload(&shard_file(dir), KIND_SHARD)?;
    Ok(Shard::decode(&mut bytes)?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::shard::DEFAULT_SHARD_FUNC;

    fn hash2() -> Shard {
        Shard::hash(2, DEFAULT_SHARD_FUNC).unwrap()
    }

    #[test]
    fn test_file_names() {
        let dir = Path::new("/m");
        let shard = hash2();
        assert_eq!(
            model_file(dir, &shard, 1, Layout::Current),
            Path::new("/m/model.bin.1")
        );
        assert_eq!(
            model_file(dir, &shard, 1, Layout::Legacy),
            Path::new("/m/param.bin.1.2.-2.1")
        );
        assert_eq!(
            ts_store_file(dir, &shard, 0, Layout::Legacy),
            Path::new("/m/ts.bin.0.2.-2.1")
        );
        assert_eq!(
            success_file(dir, &Shard::none(), 0, Layout::Current),
            Path::new("/m/SUCCESS_")
        );
    }

    #[test]
    fn test_detect_layout() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            detect_layout(dir.path()),
            Err(Error::NoModel(_))
        ));

        fs::write(dir.path().join("SUCCESS_.0.2.-2.1"), b"").unwrap();
        assert_eq!(detect_layout(dir.path()).unwrap(), Layout::Legacy);

        // A current marker wins over legacy leftovers.
        fs::write(dir.path().join("SUCCESS_.0"), b"").unwrap();
        assert_eq!(detect_layout(dir.path()).unwrap(), Layout::Current);
    }

    #[test]
    fn test_payload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.bin.0");
        write_payload(&path, KIND_MODEL, |buf| buf.put_u32_le(7)).unwrap();

        let bytes = read_payload(&path, KIND_MODEL).unwrap();
        assert_eq!(bytes.as_ref(), 7u32.to_le_bytes());

        assert!(matches!(
            read_payload(&path, KIND_OPTIMIZER),
            Err(Error::BadFile(_))
        ));
    }
}
