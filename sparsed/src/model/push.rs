//! Push payloads.
//!
//! A push arriving over the wire is a [`TensorMapView`] into the frame
//! buffer; an in-process push is an owned [`TensorMap`]. `PushPayload`
//! lets the shard and the optimizers consume both through one shape.

use crate::tensor::{Float, Srm, SrmView, Tensor, TensorMap, TensorMapView, TensorView};

#[derive(Debug)]
pub enum PushBody {
    Owned(TensorMap),
    View(TensorMapView),
}

impl PushBody {
    pub fn empty() -> Self {
        Self::Owned(TensorMap::new())
    }

    pub fn payload(&self) -> PushPayload<'_> {
        match self {
            Self::Owned(map) => PushPayload::Owned(map),
            Self::View(view) => PushPayload::View(view),
        }
    }
}

impl From<TensorMap> for PushBody {
    fn from(map: TensorMap) -> Self {
        Self::Owned(map)
    }
}

impl From<TensorMapView> for PushBody {
    fn from(view: TensorMapView) -> Self {
        Self::View(view)
    }
}

#[derive(Clone, Copy)]
pub enum PushPayload<'a> {
    Owned(&'a TensorMap),
    View(&'a TensorMapView),
}

/// One named entry of a push payload.
pub enum GradEntry<'a> {
    Dense(&'a [Float]),
    Rows(RowsRef<'a>),
}

/// Borrowed sparse rows, owned or viewed.
#[derive(Clone, Copy)]
pub enum RowsRef<'a> {
    Owned(&'a Srm),
    View(&'a SrmView),
}

impl<'a> RowsRef<'a> {
    pub fn col(&self) -> usize {
        match self {
            Self::Owned(srm) => srm.col(),
            Self::View(view) => view.col(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Owned(srm) => srm.len(),
            Self::View(view) => view.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn for_each(&self, mut f: impl FnMut(u64, &[Float])) {
        match self {
            Self::Owned(srm) => {
                for (id, row) in srm.iter() {
                    f(id, row);
                }
            }
            Self::View(view) => {
                for (id, row) in view.iter() {
                    f(id, row);
                }
            }
        }
    }
}

impl<'a> PushPayload<'a> {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Owned(map) => map.is_empty(),
            Self::View(view) => view.is_empty(),
        }
    }

    pub fn for_each(&self, mut f: impl FnMut(&str, GradEntry<'_>)) {
        match self {
            Self::Owned(map) => {
                for (name, tensor) in map.iter() {
                    match tensor {
                        Tensor::Tsr(tsr) => f(name, GradEntry::Dense(tsr.data())),
                        Tensor::Srm(srm) => f(name, GradEntry::Rows(RowsRef::Owned(srm))),
                    }
                }
            }
            Self::View(view) => {
                for (name, tensor) in view.iter() {
                    match tensor {
                        TensorView::Tsr(tsr) => f(name, GradEntry::Dense(tsr.data())),
                        TensorView::Srm(srm) => f(name, GradEntry::Rows(RowsRef::View(srm))),
                    }
                }
            }
        }
    }

    /// Visit every sparse row id in the payload.
    pub fn for_each_srm_id(&self, mut f: impl FnMut(u64)) {
        self.for_each(|_, entry| {
            if let GradEntry::Rows(rows) = entry {
                rows.for_each(|id, _| f(id));
            }
        });
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tensor::{Initializer, Shape, Tsr};
    use bytes::BytesMut;

    fn owned_body() -> PushBody {
        let mut map = TensorMap::new();
        let mut srm = Srm::new(1, Initializer::zeros());
        srm.assign(1, &[0.5]).unwrap();
        srm.assign(2, &[1.5]).unwrap();
        map.insert("w", Tensor::Srm(srm));
        let mut b = Tsr::new(Shape::new(&[1]));
        b.assign(&[0.1]).unwrap();
        map.insert("b", Tensor::Tsr(b));
        PushBody::from(map)
    }

    #[test]
    fn test_owned_and_view_agree() {
        let owned = owned_body();

        let mut buf = BytesMut::new();
        match &owned {
            PushBody::Owned(map) => map.encode(&mut buf),
            PushBody::View(_) => unreachable!(),
        }
        let mut bytes = buf.freeze();
        let view_body = PushBody::from(TensorMapView::decode(&mut bytes).unwrap());

        for body in [&owned, &view_body] {
            let payload = body.payload();
            assert!(!payload.is_empty());
            let mut ids = Vec::new();
            payload.for_each_srm_id(|id| ids.push(id));
            ids.sort_unstable();
            assert_eq!(ids, vec![1, 2]);

            let mut dense = Vec::new();
            payload.for_each(|name, entry| {
                if let GradEntry::Dense(data) = entry {
                    dense.push((name.to_string(), data.to_vec()));
                }
            });
            assert_eq!(dense, vec![("b".to_string(), vec![0.1])]);
        }
    }
}
