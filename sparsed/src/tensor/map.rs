//! Named tensor collections and their binary codec.
//!
//! The same serialization is used on disk and on the wire so inbound
//! frames can be viewed without copy by the receiver (see
//! [`super::view`]). All integers are little-endian; float payloads are
//! raw `Float` bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use fnv::FnvHashMap;

use super::{Error, Float, FloatBytes, InitKind, Initializer, Shape, Srm, Tsr, FLOAT_SIZE};

// Float payloads are cast in place; this codec is little-endian by
// contract.
#[cfg(target_endian = "big")]
compile_error!("sparsed tensor codec requires a little-endian target");

pub(crate) const TAG_TSR: u8 = 1;
pub(crate) const TAG_SRM: u8 = 2;

#[derive(Debug, Clone)]
pub enum Tensor {
    Tsr(Tsr),
    Srm(Srm),
}

impl Tensor {
    pub fn as_tsr(&self) -> Option<&Tsr> {
        match self {
            Tensor::Tsr(t) => Some(t),
            Tensor::Srm(_) => None,
        }
    }

    pub fn as_srm(&self) -> Option<&Srm> {
        match self {
            Tensor::Srm(s) => Some(s),
            Tensor::Tsr(_) => None,
        }
    }
}

/// An unordered map `name → tensor`, used uniformly for parameters,
/// gradients, overwritten parameters and pull responses.
#[derive(Debug, Clone, Default)]
pub struct TensorMap {
    map: FnvHashMap<String, Tensor>,
}

impl TensorMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn insert(&mut self, name: impl ToString, tensor: Tensor) {
        self.map.insert(name.to_string(), tensor);
    }

    pub fn remove(&mut self, name: &str) -> Option<Tensor> {
        self.map.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.map.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Tensor> {
        self.map.get_mut(name)
    }

    pub fn get_tsr(&self, name: &str) -> Option<&Tsr> {
        self.get(name).and_then(Tensor::as_tsr)
    }

    pub fn get_tsr_mut(&mut self, name: &str) -> Option<&mut Tsr> {
        match self.map.get_mut(name) {
            Some(Tensor::Tsr(t)) => Some(t),
            _ => None,
        }
    }

    pub fn get_srm(&self, name: &str) -> Option<&Srm> {
        self.get(name).and_then(Tensor::as_srm)
    }

    pub fn get_srm_mut(&mut self, name: &str) -> Option<&mut Srm> {
        match self.map.get_mut(name) {
            Some(Tensor::Srm(s)) => Some(s),
            _ => None,
        }
    }

    /// Fetch-or-insert an SRM slot with the given column count.
    pub fn srm_entry(&mut self, name: &str, col: usize, initializer: Initializer) -> &mut Srm {
        let entry = self
            .map
            .entry(name.to_string())
            .or_insert_with(|| Tensor::Srm(Srm::new(col, initializer)));
        match entry {
            Tensor::Srm(s) => s,
            Tensor::Tsr(_) => {
                *entry = Tensor::Srm(Srm::new(col, initializer));
                match entry {
                    Tensor::Srm(s) => s,
                    Tensor::Tsr(_) => unreachable!(),
                }
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&str, &mut Tensor)> {
        self.map.iter_mut().map(|(k, v)| (k.as_str(), v))
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (String, Tensor)> + '_ {
        self.map.drain()
    }

    pub fn for_each_srm(&mut self, mut f: impl FnMut(&str, &mut Srm)) {
        for (name, tensor) in self.map.iter_mut() {
            if let Tensor::Srm(srm) = tensor {
                f(name, srm);
            }
        }
    }

    /// Drop entries with no values: empty SRMs and placeholder TSRs.
    pub fn remove_empty(&mut self) {
        self.map.retain(|_, tensor| match tensor {
            Tensor::Tsr(t) => !t.data().is_empty(),
            Tensor::Srm(s) => !s.is_empty(),
        });
    }

    /// Drop SRM rows whose L1 norm is zero.
    pub fn remove_zeros_srm(&mut self) {
        self.for_each_srm(|_, srm| srm.remove_zeros());
    }

    /// Absorb `other`. TSR entries are kept when `keep_tsr` accepts the
    /// name; SRM rows when `keep_row` accepts the id.
    pub fn merge(
        &mut self,
        other: TensorMap,
        keep_tsr: impl Fn(&str) -> bool,
        keep_row: impl Fn(u64) -> bool,
    ) -> Result<(), Error> {
        for (name, tensor) in other.map {
            match tensor {
                Tensor::Tsr(tsr) => {
                    if !keep_tsr(&name) {
                        continue;
                    }
                    match self.map.get_mut(&name) {
                        Some(Tensor::Tsr(mine)) if !mine.is_placeholder() => {
                            mine.assign(tsr.data())?;
                        }
                        _ => {
                            self.map.insert(name, Tensor::Tsr(tsr));
                        }
                    }
                }
                Tensor::Srm(srm) => match self.map.get_mut(&name) {
                    Some(Tensor::Srm(mine)) => mine.merge(srm, &keep_row)?,
                    _ => {
                        let mut fresh = Srm::new(srm.col(), *srm.initializer());
                        fresh.merge(srm, &keep_row)?;
                        self.map.insert(name, Tensor::Srm(fresh));
                    }
                },
            }
        }
        Ok(())
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let mut enc = TensorMapEncoder::new(buf);
        for (name, tensor) in self.iter() {
            match tensor {
                Tensor::Tsr(tsr) => enc.tsr(name, tsr),
                Tensor::Srm(srm) => enc.srm_rows(name, srm.col(), *srm.initializer(), srm.iter()),
            }
        }
        enc.finish();
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(bytes: &mut Bytes) -> Result<Self, Error> {
        let count = get_u32(bytes)?;
        let mut map = TensorMap::new();
        for _ in 0..count {
            let name = get_str(bytes)?;
            match get_u8(bytes)? {
                TAG_TSR => {
                    let shape = decode_shape(bytes)?;
                    let total = get_u64(bytes)? as usize;
                    let data = get_floats_owned(bytes, total)?;
                    map.insert(name, Tensor::Tsr(Tsr::from_data(shape, data)?));
                }
                TAG_SRM => {
                    let col = get_u32(bytes)? as usize;
                    let initializer = decode_initializer(bytes)?;
                    let rows = get_u64(bytes)? as usize;
                    let mut srm = Srm::new(col, initializer);
                    srm.reserve(rows);
                    for _ in 0..rows {
                        let id = get_u64(bytes)?;
                        let row = get_floats_owned(bytes, col)?;
                        srm.insert_owned(id, row.into_boxed_slice())?;
                    }
                    map.insert(name, Tensor::Srm(srm));
                }
                other => return Err(Error::UnknownTag(other)),
            }
        }
        Ok(map)
    }
}

/// Streaming encoder. Lets the param server serialize a pull response
/// straight out of its stores, without building an intermediate map.
pub struct TensorMapEncoder<'a> {
    buf: &'a mut BytesMut,
    count_pos: usize,
    count: u32,
}

impl<'a> TensorMapEncoder<'a> {
    pub fn new(buf: &'a mut BytesMut) -> Self {
        let count_pos = buf.len();
        buf.put_u32_le(0);
        Self {
            buf,
            count_pos,
            count: 0,
        }
    }

    pub fn tsr(&mut self, name: &str, tsr: &Tsr) {
        self.tsr_slice(name, tsr.shape(), tsr.data());
    }

    pub fn tsr_slice(&mut self, name: &str, shape: &Shape, data: &[Float]) {
        put_str(self.buf, name);
        self.buf.put_u8(TAG_TSR);
        encode_shape(self.buf, shape);
        self.buf.put_u64_le(data.len() as u64);
        self.buf.put_slice(bytemuck::cast_slice(data));
        self.count += 1;
    }

    /// Emit an SRM entry from an arbitrary row iterator; the row count
    /// is patched afterwards so callers can filter while streaming.
    pub fn srm_rows<'r>(
        &mut self,
        name: &str,
        col: usize,
        initializer: Initializer,
        rows: impl Iterator<Item = (u64, &'r [Float])>,
    ) {
        put_str(self.buf, name);
        self.buf.put_u8(TAG_SRM);
        self.buf.put_u32_le(col as u32);
        encode_initializer(self.buf, &initializer);
        let rows_pos = self.buf.len();
        self.buf.put_u64_le(0);
        let mut row_count: u64 = 0;
        for (id, row) in rows {
            debug_assert_eq!(row.len(), col);
            self.buf.put_u64_le(id);
            self.buf.put_slice(bytemuck::cast_slice(row));
            row_count += 1;
        }
        self.buf[rows_pos..rows_pos + 8].copy_from_slice(&row_count.to_le_bytes());
        self.count += 1;
    }

    pub fn finish(self) {
        self.buf[self.count_pos..self.count_pos + 4].copy_from_slice(&self.count.to_le_bytes());
    }
}

// Shared primitive codec helpers, also used by the view decoder and
// the persistence layer.

pub(crate) fn ensure(bytes: &Bytes, n: usize) -> Result<(), Error> {
    if bytes.remaining() < n {
        return Err(Error::Truncated);
    }
    Ok(())
}

pub(crate) fn get_u8(bytes: &mut Bytes) -> Result<u8, Error> {
    ensure(bytes, 1)?;
    Ok(bytes.get_u8())
}

pub(crate) fn get_u32(bytes: &mut Bytes) -> Result<u32, Error> {
    ensure(bytes, 4)?;
    Ok(bytes.get_u32_le())
}

pub(crate) fn get_u64(bytes: &mut Bytes) -> Result<u64, Error> {
    ensure(bytes, 8)?;
    Ok(bytes.get_u64_le())
}

pub(crate) fn get_i64(bytes: &mut Bytes) -> Result<i64, Error> {
    ensure(bytes, 8)?;
    Ok(bytes.get_i64_le())
}

pub(crate) fn get_f64(bytes: &mut Bytes) -> Result<f64, Error> {
    ensure(bytes, 8)?;
    Ok(bytes.get_f64_le())
}

pub(crate) fn put_str(buf: &mut BytesMut, s: &str) {
    debug_assert!(s.len() <= u16::MAX as usize);
    buf.put_u16_le(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

pub(crate) fn get_str(bytes: &mut Bytes) -> Result<String, Error> {
    ensure(bytes, 2)?;
    let len = bytes.get_u16_le() as usize;
    ensure(bytes, len)?;
    let raw = bytes.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| Error::Name)
}

pub(crate) fn get_float_bytes(bytes: &mut Bytes, count: usize) -> Result<FloatBytes, Error> {
    let n = count * FLOAT_SIZE;
    ensure(bytes, n)?;
    Ok(FloatBytes::new(bytes.split_to(n)))
}

pub(crate) fn get_floats_owned(bytes: &mut Bytes, count: usize) -> Result<Vec<Float>, Error> {
    Ok(get_float_bytes(bytes, count)?.to_vec())
}

pub(crate) fn encode_shape(buf: &mut BytesMut, shape: &Shape) {
    buf.put_u8(shape.rank() as u8);
    for &d in shape.dims() {
        buf.put_i64_le(d);
    }
}

pub(crate) fn decode_shape(bytes: &mut Bytes) -> Result<Shape, Error> {
    let rank = get_u8(bytes)? as usize;
    let mut dims = Vec::with_capacity(rank);
    for _ in 0..rank {
        dims.push(get_i64(bytes)?);
    }
    Ok(Shape::new(&dims))
}

pub(crate) fn encode_initializer(buf: &mut BytesMut, initializer: &Initializer) {
    buf.put_u8(initializer.kind as u8);
    buf.put_f64_le(initializer.p1);
    buf.put_f64_le(initializer.p2);
}

pub(crate) fn decode_initializer(bytes: &mut Bytes) -> Result<Initializer, Error> {
    let kind = InitKind::try_from(get_u8(bytes)?)?;
    let p1 = get_f64(bytes)?;
    let p2 = get_f64(bytes)?;
    Ok(Initializer::new(kind, p1, p2))
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_map() -> TensorMap {
        let mut map = TensorMap::new();
        let mut tsr = Tsr::new(Shape::new(&[2, 2]));
        tsr.assign(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        map.insert("dense", Tensor::Tsr(tsr));
        let mut srm = Srm::new(3, Initializer::zeros());
        srm.assign(10, &[0.1, 0.2, 0.3]).unwrap();
        srm.assign(u64::MAX, &[-1.0, 0.0, 1.0]).unwrap();
        map.insert("sparse", Tensor::Srm(srm));
        map
    }

    #[test]
    fn test_codec_round_trip() {
        let map = sample_map();
        let mut bytes = map.to_bytes();
        let back = TensorMap::decode(&mut bytes).unwrap();
        assert!(bytes.is_empty());
        assert_eq!(back.len(), 2);
        assert_eq!(
            back.get_tsr("dense").unwrap().data(),
            &[1.0, 2.0, 3.0, 4.0]
        );
        let srm = back.get_srm("sparse").unwrap();
        assert_eq!(srm.col(), 3);
        assert_eq!(srm.get(10).unwrap(), &[0.1, 0.2, 0.3]);
        assert_eq!(srm.get(u64::MAX).unwrap(), &[-1.0, 0.0, 1.0]);
    }

    #[test]
    fn test_decode_truncated() {
        let bytes = sample_map().to_bytes();
        let mut cut = bytes.slice(0..bytes.len() - 3);
        assert!(matches!(
            TensorMap::decode(&mut cut),
            Err(Error::Truncated)
        ));
    }

    #[test]
    fn test_streaming_encoder_filters_rows() {
        let mut srm = Srm::new(1, Initializer::zeros());
        for id in 0..10u64 {
            srm.assign(id, &[id as Float]).unwrap();
        }
        let mut buf = BytesMut::new();
        let mut enc = TensorMapEncoder::new(&mut buf);
        enc.srm_rows(
            "w",
            1,
            Initializer::zeros(),
            srm.iter().filter(|(id, _)| id % 2 == 0),
        );
        enc.finish();

        let mut bytes = buf.freeze();
        let back = TensorMap::decode(&mut bytes).unwrap();
        let w = back.get_srm("w").unwrap();
        assert_eq!(w.len(), 5);
        assert!(w.contains(8));
        assert!(!w.contains(7));
    }

    #[test]
    fn test_merge_filters() {
        let mut base = TensorMap::new();
        base.insert("w", Tensor::Srm(Srm::new(1, Initializer::zeros())));
        let mut incoming = TensorMap::new();
        let mut srm = Srm::new(1, Initializer::zeros());
        srm.assign(1, &[1.0]).unwrap();
        srm.assign(2, &[2.0]).unwrap();
        incoming.insert("w", Tensor::Srm(srm));
        incoming.insert("b", Tensor::Tsr(Tsr::new(Shape::new(&[1]))));

        base.merge(incoming, |_| false, |id| id == 2).unwrap();
        assert!(base.get_tsr("b").is_none());
        let w = base.get_srm("w").unwrap();
        assert!(w.contains(2) && !w.contains(1));
    }
}
