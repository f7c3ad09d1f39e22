//! Message payload encoding.
//!
//! Sessions move opaque byte payloads; the typed call handles encode and decode at the edges
//! with the same bincode configuration the wire frames use.
use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint, Limit},
};

use crate::Status;

/// Largest frame a connection accepts from its peer, in bytes.
pub(crate) const MAX_FRAME_SIZE: usize = 16 << 20;

/// Largest message payload that fits in one frame.
pub(crate) const MAX_MESSAGE_SIZE: usize = MAX_FRAME_SIZE - 64;

pub(crate) fn config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

/// Config for decoding frames off the wire; length prefixes beyond the limit are rejected
/// before anything is allocated.
pub(crate) fn frame_config() -> Configuration<BigEndian, Fixint, Limit<MAX_FRAME_SIZE>> {
    config().with_limit::<MAX_FRAME_SIZE>()
}

pub(crate) fn encode<T: Encode>(message: T) -> Result<Vec<u8>, Status> {
    bincode::encode_to_vec(message, config())
        .map_err(|e| Status::internal(format!("failed to encode message: {e}")))
}

pub(crate) fn decode<T: Decode<()>>(payload: &[u8]) -> Result<T, Status> {
    let (message, read) = bincode::decode_from_slice(payload, config())
        .map_err(|e| Status::internal(format!("failed to decode message: {e}")))?;
    if read != payload.len() {
        return Err(Status::internal(format!(
            "failed to decode message: {} trailing bytes",
            payload.len() - read
        )));
    }
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Code;

    #[derive(Debug, Encode, Decode, PartialEq)]
    struct Greeting {
        first_name: String,
        last_name: String,
    }

    #[test]
    fn decodes_what_was_encoded() {
        let greeting = Greeting {
            first_name: "Stephan".to_string(),
            last_name: "Maersk".to_string(),
        };
        let bytes = encode(&greeting).unwrap();

        assert_eq!(decode::<Greeting>(&bytes).unwrap(), greeting);
    }

    #[test]
    fn mismatched_payload_is_internal() {
        let bytes = encode(7u8).unwrap();
        let err = decode::<Greeting>(&bytes).unwrap_err();
        assert_eq!(err.code(), Code::Internal);
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let bytes = encode((1u32, 2u32)).unwrap();
        assert_eq!(decode::<u32>(&bytes).unwrap_err().code(), Code::Internal);
    }
}
