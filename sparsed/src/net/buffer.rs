//! Cancel-safe and memory-efficient read buffer for protocol frames.

use std::io::Cursor;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::messages::{Message, HEADER_SIZE};
use super::Error;

const BUFFER_SIZE: usize = 4096;

#[derive(Default, Debug, Clone)]
pub struct MessageBuffer {
    buffer: BytesMut,
}

impl MessageBuffer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(BUFFER_SIZE),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    fn message_size(&self) -> Option<usize> {
        if self.buffer.len() >= HEADER_SIZE {
            let mut cur = Cursor::new(&self.buffer);
            let _code = cur.get_u8();
            let len = cur.get_u32_le() as usize;
            Some(HEADER_SIZE + len)
        } else {
            None
        }
    }

    fn have_message(&self) -> bool {
        self.message_size()
            .map(|size| self.buffer.len() >= size)
            .unwrap_or(false)
    }

    // This may or may not allocate, depending on how much of the
    // previous frames' capacity can be reclaimed.
    fn ensure_capacity(&mut self, amount: usize) {
        if !self.buffer.try_reclaim(amount) {
            self.buffer.reserve(amount);
        }
    }

    /// Read one whole frame off the stream.
    ///
    /// # Cancellation safety
    ///
    /// This method is cancel-safe: partial reads stay buffered and the
    /// next call resumes where this one stopped.
    pub async fn read(
        &mut self,
        stream: &mut (impl AsyncRead + Unpin),
    ) -> Result<Message, Error> {
        loop {
            if let Some(size) = self.message_size() {
                if self.have_message() {
                    return Ok(Message::new(self.buffer.split_to(size).freeze()));
                }
                // Reserve at least enough space for the whole frame.
                self.ensure_capacity(size);
            }

            if self.buffer.capacity() == self.buffer.len() {
                self.ensure_capacity(BUFFER_SIZE);
            }

            let read = stream.read_buf(&mut self.buffer).await?;
            if read == 0 {
                return Err(Error::UnexpectedEof);
            }
        }
    }
}
