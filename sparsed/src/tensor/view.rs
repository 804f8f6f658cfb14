//! Zero-copy tensor views over wire frames.
//!
//! Decoded from the same byte layout as [`super::TensorMap`], but the
//! float payloads stay inside the inbound frame (`Bytes` slices). A
//! view is valid for as long as the caller keeps it; by protocol it is
//! dropped before the next RPC on the same connection.

use bytes::Bytes;
use fnv::FnvHashMap;

use super::map::{
    decode_initializer, decode_shape, get_float_bytes, get_str, get_u32, get_u64, get_u8, TAG_SRM,
    TAG_TSR,
};
use super::{Error, Float, FloatBytes, Initializer, Shape, Srm, Tensor, TensorMap, Tsr};

#[derive(Debug, Clone)]
pub struct TsrView {
    shape: Shape,
    data: FloatBytes,
}

impl TsrView {
    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn data(&self) -> &[Float] {
        self.data.as_slice()
    }
}

#[derive(Debug, Clone)]
pub struct SrmView {
    col: usize,
    initializer: Initializer,
    rows: FnvHashMap<u64, FloatBytes>,
}

impl SrmView {
    pub fn col(&self) -> usize {
        self.col
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn row(&self, id: u64) -> Option<&[Float]> {
        self.rows.get(&id).map(|r| r.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &[Float])> {
        self.rows.iter().map(|(id, row)| (*id, row.as_slice()))
    }
}

#[derive(Debug, Clone)]
pub enum TensorView {
    Tsr(TsrView),
    Srm(SrmView),
}

#[derive(Debug, Clone, Default)]
pub struct TensorMapView {
    map: FnvHashMap<String, TensorView>,
}

impl TensorMapView {
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&TensorView> {
        self.map.get(name)
    }

    pub fn get_tsr(&self, name: &str) -> Option<&TsrView> {
        match self.map.get(name) {
            Some(TensorView::Tsr(t)) => Some(t),
            _ => None,
        }
    }

    pub fn get_srm(&self, name: &str) -> Option<&SrmView> {
        match self.map.get(name) {
            Some(TensorView::Srm(s)) => Some(s),
            _ => None,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &TensorView)> {
        self.map.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Decode a view in place, advancing `bytes` past the map.
    pub fn decode(bytes: &mut Bytes) -> Result<Self, Error> {
        let count = get_u32(bytes)?;
        let mut map = FnvHashMap::default();
        for _ in 0..count {
            let name = get_str(bytes)?;
            match get_u8(bytes)? {
                TAG_TSR => {
                    let shape = decode_shape(bytes)?;
                    let total = get_u64(bytes)? as usize;
                    let data = get_float_bytes(bytes, total)?;
                    map.insert(name, TensorView::Tsr(TsrView { shape, data }));
                }
                TAG_SRM => {
                    let col = get_u32(bytes)? as usize;
                    let initializer = decode_initializer(bytes)?;
                    let row_count = get_u64(bytes)? as usize;
                    let mut rows = FnvHashMap::default();
                    rows.reserve(row_count);
                    for _ in 0..row_count {
                        let id = get_u64(bytes)?;
                        rows.insert(id, get_float_bytes(bytes, col)?);
                    }
                    map.insert(
                        name,
                        TensorView::Srm(SrmView {
                            col,
                            initializer,
                            rows,
                        }),
                    );
                }
                other => return Err(Error::UnknownTag(other)),
            }
        }
        Ok(Self { map })
    }

    /// Materialize an owned copy.
    pub fn to_owned_map(&self) -> Result<TensorMap, Error> {
        let mut out = TensorMap::new();
        for (name, view) in self.iter() {
            match view {
                TensorView::Tsr(t) => {
                    out.insert(
                        name,
                        Tensor::Tsr(Tsr::from_data(t.shape.clone(), t.data.to_vec())?),
                    );
                }
                TensorView::Srm(s) => {
                    let mut srm = Srm::new(s.col, s.initializer);
                    srm.reserve(s.len());
                    for (id, row) in s.iter() {
                        srm.assign(id, row)?;
                    }
                    out.insert(name, Tensor::Srm(srm));
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tensor::Initializer;

    #[test]
    fn test_view_decode_matches_owned() {
        let mut map = TensorMap::new();
        let mut srm = Srm::new(2, Initializer::zeros());
        srm.assign(5, &[1.0, -1.0]).unwrap();
        srm.assign(6, &[2.0, -2.0]).unwrap();
        map.insert("w", Tensor::Srm(srm));
        let mut tsr = Tsr::new(Shape::new(&[3]));
        tsr.assign(&[7.0, 8.0, 9.0]).unwrap();
        map.insert("b", Tensor::Tsr(tsr));

        let mut bytes = map.to_bytes();
        let view = TensorMapView::decode(&mut bytes).unwrap();
        assert!(bytes.is_empty());

        assert_eq!(view.get_tsr("b").unwrap().data(), &[7.0, 8.0, 9.0]);
        let w = view.get_srm("w").unwrap();
        assert_eq!(w.col(), 2);
        assert_eq!(w.row(5).unwrap(), &[1.0, -1.0]);
        assert_eq!(w.row(6).unwrap(), &[2.0, -2.0]);
        assert!(w.row(7).is_none());

        let owned = view.to_owned_map().unwrap();
        assert_eq!(owned.get_srm("w").unwrap().len(), 2);
    }

    #[test]
    fn test_two_maps_in_one_frame() {
        // The push payload carries the gradient map and the overwrite
        // map back to back in a single frame.
        let mut grad = TensorMap::new();
        let mut g = Srm::new(1, Initializer::zeros());
        g.assign(1, &[0.5]).unwrap();
        grad.insert("w", Tensor::Srm(g));
        let overwritten = TensorMap::new();

        let mut buf = bytes::BytesMut::new();
        grad.encode(&mut buf);
        overwritten.encode(&mut buf);
        let mut bytes = buf.freeze();

        let grad_view = TensorMapView::decode(&mut bytes).unwrap();
        let over_view = TensorMapView::decode(&mut bytes).unwrap();
        assert!(bytes.is_empty());
        assert_eq!(grad_view.len(), 1);
        assert!(over_view.is_empty());
    }
}
