//! Pull RPC messages.

use bytes::{Buf, Bytes};

use super::{code, Error, FromBytes, Payload, Protocol, ToBytes};
use crate::request::PullRequest;
use crate::tensor::TensorMapView;

/// Worker → PS: the ids and tensors one batch needs.
#[derive(Debug, Clone, Default)]
pub struct PullRequestMsg {
    pub req: PullRequest,
}

impl From<PullRequest> for PullRequestMsg {
    fn from(req: PullRequest) -> Self {
        Self { req }
    }
}

impl ToBytes for PullRequestMsg {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        self.req.encode(payload.buf());
        Ok(payload.freeze())
    }
}

impl FromBytes for PullRequestMsg {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'P');
        Ok(Self {
            req: PullRequest::decode(&mut bytes)?,
        })
    }
}

impl Protocol for PullRequestMsg {
    fn code(&self) -> char {
        'P'
    }
}

/// PS → worker: the serialized parameter map. The payload stays inside
/// the frame buffer; [`PullResponse::view`] decodes it without copy,
/// valid until the next RPC on this connection.
#[derive(Debug, Clone, Default)]
pub struct PullResponse {
    pub param: Bytes,
}

impl PullResponse {
    /// Wrap an already-serialized parameter map.
    pub fn new(param: Bytes) -> Self {
        Self { param }
    }

    pub fn view(&self) -> Result<TensorMapView, Error> {
        let mut bytes = self.param.clone();
        Ok(TensorMapView::decode(&mut bytes)?)
    }
}

impl ToBytes for PullResponse {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.buf().extend_from_slice(&self.param);
        Ok(payload.freeze())
    }
}

impl FromBytes for PullResponse {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'p');
        Ok(Self { param: bytes })
    }
}

impl Protocol for PullResponse {
    fn code(&self) -> char {
        'p'
    }
}
