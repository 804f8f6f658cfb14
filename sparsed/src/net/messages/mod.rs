//! Protocol messages.
//!
//! Every frame is a 1-byte message code, a little-endian `u32` payload
//! length, and the payload. Tensor payloads reuse the on-disk
//! serialization, so receivers view them without copy for the duration
//! of the handler.

pub mod control;
pub mod file;
pub mod pull;
pub mod push;

pub use control::{ModelSaveAck, ModelSaveRequest, TerminationAck, TerminationNotify};
pub use file::{FileFinishAck, FileFinishNotify, FileRequest, FileResponse};
pub use pull::{PullRequestMsg, PullResponse};
pub use push::{PushAck, PushNotify};

use bytes::{BufMut, Bytes, BytesMut};

use super::Error;

pub const HEADER_SIZE: usize = 5;

/// Verify the frame code and skip the header.
macro_rules! code {
    ($bytes:expr, $code:expr) => {
        if $bytes.remaining() < $crate::net::messages::HEADER_SIZE {
            return Err($crate::net::Error::UnexpectedEof);
        }
        let found = $bytes.get_u8();
        if found != $code as u8 {
            return Err($crate::net::Error::UnexpectedMessage(found as char));
        }
        let _len = $bytes.get_u32_le();
    };
}

pub(crate) use code;

pub trait ToBytes {
    /// Serialize the whole frame, header included.
    fn to_bytes(&self) -> Result<Bytes, Error>;
}

pub trait FromBytes: Sized {
    /// Deserialize from a whole frame, header included.
    fn from_bytes(bytes: Bytes) -> Result<Self, Error>;
}

pub trait Protocol: ToBytes + FromBytes {
    fn code(&self) -> char;
}

/// A raw frame as read off a stream.
#[derive(Debug, Clone)]
pub struct Message {
    bytes: Bytes,
}

impl Message {
    pub fn new(bytes: Bytes) -> Self {
        debug_assert!(bytes.len() >= HEADER_SIZE);
        Self { bytes }
    }

    pub fn code(&self) -> char {
        self.bytes[0] as char
    }

    pub fn to_bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    /// The payload, past the header.
    pub fn payload(&self) -> Bytes {
        self.bytes.slice(HEADER_SIZE..)
    }
}

impl ToBytes for Message {
    fn to_bytes(&self) -> Result<Bytes, Error> {
        Ok(self.bytes.clone())
    }
}

/// Frame builder: reserves the header, tracks the payload, patches the
/// length on freeze.
pub struct Payload {
    buf: BytesMut,
}

impl Payload {
    pub fn named(code: char) -> Self {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(code as u8);
        buf.put_u32_le(0);
        Self { buf }
    }

    pub fn buf(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32_le(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64_le(v);
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.put_f64_le(v);
    }

    pub fn put_str(&mut self, s: &str) {
        crate::tensor::map::put_str(&mut self.buf, s);
    }

    pub fn freeze(mut self) -> Bytes {
        let len = (self.buf.len() - HEADER_SIZE) as u32;
        self.buf[1..HEADER_SIZE].copy_from_slice(&len.to_le_bytes());
        self.buf.freeze()
    }
}
