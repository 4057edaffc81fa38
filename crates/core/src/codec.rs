use std::io::Cursor;

use crate::message::InstructionsContainer;
use crate::payload::Payload;
use crate::{CodecError, Result};

/// Smallest well-formed container encoding (key check + empty list).
pub const MIN_CONTAINER_LEN: usize = 12;

/// Encode an instructions container to its wire form.
pub fn encode_container(container: &InstructionsContainer) -> Result<Vec<u8>> {
    bincode::serialize(container).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode an instructions container, returning it together with any
/// trailing bytes (the next onion layer's ciphertext).
pub fn decode_container(data: &[u8]) -> Result<(InstructionsContainer, Vec<u8>)> {
    if data.len() < MIN_CONTAINER_LEN {
        return Err(CodecError::TooShort(data.len()));
    }

    let mut cursor = Cursor::new(data);
    let container: InstructionsContainer =
        bincode::deserialize_from(&mut cursor).map_err(|e| CodecError::Decode(e.to_string()))?;
    let rest = data[cursor.position() as usize..].to_vec();

    Ok((container, rest))
}

/// Encode a payload frame to its wire form.
pub fn encode_payload(payload: &Payload) -> Result<Vec<u8>> {
    bincode::serialize(payload).map_err(|e| CodecError::Encode(e.to_string()))
}

/// Decode a payload frame; trailing bytes are not allowed here.
pub fn decode_payload(data: &[u8]) -> Result<Payload> {
    bincode::deserialize(data).map_err(|e| CodecError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{Instruction, RouteInstruction};
    use crate::payload::{Payload, SendOutPayload};

    #[test]
    fn test_container_roundtrip_no_trailing() {
        let container = InstructionsContainer {
            key_check: 7,
            list: vec![Instruction::Destroy],
        };
        let bytes = encode_container(&container).unwrap();
        let (decoded, rest) = decode_container(&bytes).unwrap();
        assert_eq!(decoded, container);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_container_preserves_trailing_bytes() {
        let container = InstructionsContainer {
            key_check: 1,
            list: vec![Instruction::Route(RouteInstruction { route_id: 9 })],
        };
        let mut bytes = encode_container(&container).unwrap();
        bytes.extend_from_slice(b"inner layer ciphertext");

        let (decoded, rest) = decode_container(&bytes).unwrap();
        assert_eq!(decoded, container);
        assert_eq!(rest, b"inner layer ciphertext");
    }

    #[test]
    fn test_container_too_short() {
        let err = decode_container(&[0u8; 11]).unwrap_err();
        assert!(matches!(err, CodecError::TooShort(11)));
    }

    #[test]
    fn test_empty_container_is_min_len() {
        let container = InstructionsContainer {
            key_check: 0,
            list: Vec::new(),
        };
        let bytes = encode_container(&container).unwrap();
        assert_eq!(bytes.len(), MIN_CONTAINER_LEN);
    }

    #[test]
    fn test_payload_codec() {
        let p = Payload::SendOut(SendOutPayload {
            seqno: 1,
            ip: vec![127, 0, 0, 1],
            port: 9000,
            payload: vec![0xAA; 64],
        });
        let bytes = encode_payload(&p).unwrap();
        assert_eq!(decode_payload(&bytes).unwrap(), p);
    }

    #[test]
    fn test_payload_decode_garbage() {
        assert!(decode_payload(&[0xFF; 3]).is_err());
    }
}
