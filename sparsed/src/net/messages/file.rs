//! File dispatch messages between workers and the coordinator.

use bytes::{Buf, Bytes};

use super::{code, Error, FromBytes, Payload, Protocol, ToBytes};
use crate::tensor::map::{get_f64, get_str, get_u32};

/// Worker asks for the next input file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileRequest;

impl ToBytes for FileRequest {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        Ok(Payload::named(self.code()).freeze())
    }
}

impl FromBytes for FileRequest {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'F');
        Ok(Self)
    }
}

impl Protocol for FileRequest {
    fn code(&self) -> char {
        'F'
    }
}

/// Coordinator's answer. An empty `file` means "no file yet": either
/// the epoch is still draining on other workers, or the job is done.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileResponse {
    pub epoch: u32,
    pub file: String,
}

impl FileResponse {
    pub fn empty(epoch: u32) -> Self {
        Self {
            epoch,
            file: String::new(),
        }
    }
}

impl ToBytes for FileResponse {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.put_u32(self.epoch);
        payload.put_str(&self.file);
        Ok(payload.freeze())
    }
}

impl FromBytes for FileResponse {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'f');
        Ok(Self {
            epoch: get_u32(&mut bytes)?,
            file: get_str(&mut bytes)?,
        })
    }
}

impl Protocol for FileResponse {
    fn code(&self) -> char {
        'f'
    }
}

/// Worker reports a finished file with its accumulated loss.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileFinishNotify {
    pub file: String,
    pub loss: f64,
    pub loss_weight: f64,
}

impl ToBytes for FileFinishNotify {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        let mut payload = Payload::named(self.code());
        payload.put_str(&self.file);
        payload.put_f64(self.loss);
        payload.put_f64(self.loss_weight);
        Ok(payload.freeze())
    }
}

impl FromBytes for FileFinishNotify {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'D');
        Ok(Self {
            file: get_str(&mut bytes)?,
            loss: get_f64(&mut bytes)?,
            loss_weight: get_f64(&mut bytes)?,
        })
    }
}

impl Protocol for FileFinishNotify {
    fn code(&self) -> char {
        'D'
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileFinishAck;

impl ToBytes for FileFinishAck {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        Ok(Payload::named(self.code()).freeze())
    }
}

impl FromBytes for FileFinishAck {
    fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
        code!(bytes, 'd');
        Ok(Self)
    }
}

impl Protocol for FileFinishAck {
    fn code(&self) -> char {
        'd'
    }
}
