//! Wire protocol plumbing: framing, messages, streams.

pub mod buffer;
pub mod messages;
pub mod stream;

pub use buffer::MessageBuffer;
pub use messages::{FromBytes, Message, Payload, Protocol, ToBytes};
pub use stream::Stream;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed unexpectedly")]
    UnexpectedEof,

    #[error("unexpected message: {0}")]
    UnexpectedMessage(char),

    #[error("malformed payload: {0}")]
    Payload(#[from] crate::tensor::Error),

    #[error("connect to {addr} failed after {attempts} attempts: {source}")]
    ConnectRetry {
        addr: String,
        attempts: usize,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// A clean peer disconnect, as opposed to a protocol violation.
    pub fn disconnect(&self) -> bool {
        match self {
            Error::UnexpectedEof => true,
            Error::Io(err) => matches!(
                err.kind(),
                std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::BrokenPipe
            ),
            _ => false,
        }
    }
}
