//! Parameter float type and zero-copy float views over wire buffers.

use bytes::Bytes;

#[cfg(not(feature = "double"))]
pub type Float = f32;
#[cfg(feature = "double")]
pub type Float = f64;

pub const FLOAT_SIZE: usize = std::mem::size_of::<Float>();

/// A run of little-endian floats backed by a wire buffer.
///
/// The fast path keeps the inbound `Bytes` and casts in place. Frame
/// offsets are arbitrary, so a region can land misaligned for `Float`;
/// in that case the constructor copies the region once and the view
/// becomes self-owned. Either way `as_slice` is free afterwards.
#[derive(Debug, Clone)]
pub struct FloatBytes(Repr);

#[derive(Debug, Clone)]
enum Repr {
    View(Bytes),
    Owned(Vec<Float>),
}

impl FloatBytes {
    /// `bytes.len()` must be a multiple of the float size.
    pub fn new(bytes: Bytes) -> Self {
        debug_assert_eq!(bytes.len() % FLOAT_SIZE, 0);
        match bytemuck::try_cast_slice::<u8, Float>(&bytes) {
            Ok(_) => Self(Repr::View(bytes)),
            Err(_) => {
                let mut owned = vec![0 as Float; bytes.len() / FLOAT_SIZE];
                bytemuck::cast_slice_mut::<Float, u8>(&mut owned).copy_from_slice(&bytes);
                Self(Repr::Owned(owned))
            }
        }
    }

    pub fn from_owned(floats: Vec<Float>) -> Self {
        Self(Repr::Owned(floats))
    }

    pub fn as_slice(&self) -> &[Float] {
        match &self.0 {
            Repr::View(bytes) => bytemuck::cast_slice(bytes),
            Repr::Owned(floats) => floats,
        }
    }

    pub fn len(&self) -> usize {
        match &self.0 {
            Repr::View(bytes) => bytes.len() / FLOAT_SIZE,
            Repr::Owned(floats) => floats.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<Float> {
        self.as_slice().to_vec()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::{BufMut, BytesMut};

    #[test]
    fn test_view_round_trip() {
        let values: Vec<Float> = vec![1.5, -2.0, 0.0, 42.25];
        let mut buf = BytesMut::new();
        for v in &values {
            buf.put_slice(&v.to_le_bytes());
        }
        let fb = FloatBytes::new(buf.freeze());
        assert_eq!(fb.as_slice(), values.as_slice());
        assert_eq!(fb.len(), 4);
    }

    #[test]
    fn test_misaligned_falls_back_to_copy() {
        let values: Vec<Float> = vec![3.25, -7.5];
        let mut buf = BytesMut::new();
        buf.put_u8(0); // force an odd offset
        for v in &values {
            buf.put_slice(&v.to_le_bytes());
        }
        let mut bytes = buf.freeze();
        let _ = bytes.split_to(1);
        let fb = FloatBytes::new(bytes);
        assert_eq!(fb.as_slice(), values.as_slice());
    }
}
