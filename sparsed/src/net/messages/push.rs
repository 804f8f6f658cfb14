//! Push RPC messages.

use bytes::{Buf, Bytes, BytesMut};

use super::{code, Error, FromBytes, Payload, Protocol, ToBytes};
use crate::tensor::{TensorMap, TensorMapView};

/// Worker → PS: a gradient map and an overwritten-parameter map, back
/// to back in one frame. The receiver decodes both as views into the
/// frame buffer.
#[derive(Debug, Clone, Default)]
pub struct PushNotify {
    body: Bytes,
}

impl PushNotify {
    pub fn encode(grad: &TensorMap, overwritten: &TensorMap) -> Self {
        let mut buf = BytesMut::new();
        grad.encode(&mut buf);
        overwritten.encode(&mut buf);
        Self { body: buf.freeze() }
    }

    /// Zero-copy views of `(grad, overwritten_param)`.
    pub fn views(&self) -> Result<(TensorMapView, TensorMapView), Error> {
        let mut bytes = self.body.clone();
        let grad = TensorMapView::decode(&mut bytes)?;
        let overwritten = TensorMapView::decode(&mut bytes)?;
        Ok((grad, overwritten))
    }
}

impl ToBytes for PushNotify {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.buf().extend_from_slice(&self.body);
        Ok(payload.freeze())
    }
}

impl FromBytes for PushNotify {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'G');
        Ok(Self { body: bytes })
    }
}

impl Protocol for PushNotify {
    fn code(&self) -> char {
        'G'
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushAck;

impl ToBytes for PushAck {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        Ok(Payload::named(self.code()).freeze())
    }
}

impl FromBytes for PushAck {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'g');
        Ok(Self)
    }
}

impl Protocol for PushAck {
    fn code(&self) -> char {
        'g'
    }
}
