//! Save and termination control messages.

use bytes::{Buf, Bytes};

use super::{code, Error, FromBytes, Payload, Protocol, ToBytes};

macro_rules! empty_message {
    ($name:ident, $code:expr) => {
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name;

        impl ToBytes for $name {
            fn to_bytes(&self) -> Result<Bytes, Error> {
                Ok(Payload::named(self.code()).freeze())
            }
        }

        impl FromBytes for $name {
            fn from_bytes(mut bytes: Bytes) -> Result<Self, Error> {
                code!(bytes, $code);
                Ok(Self)
            }
        }

        impl Protocol for $name {
            fn code(&self) -> char {
                $code
            }
        }
    };
}

empty_message!(ModelSaveRequest, 'S');
empty_message!(ModelSaveAck, 's');
empty_message!(TerminationNotify, 'T');
empty_message!(TerminationAck, 't');

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_round_trips() {
        ModelSaveRequest::from_bytes(ModelSaveRequest.to_bytes().unwrap()).unwrap();
        ModelSaveAck::from_bytes(ModelSaveAck.to_bytes().unwrap()).unwrap();
        TerminationNotify::from_bytes(TerminationNotify.to_bytes().unwrap()).unwrap();
        assert!(TerminationAck::from_bytes(TerminationNotify.to_bytes().unwrap()).is_err());
    }
}
