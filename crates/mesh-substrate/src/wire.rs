// SPDX-License-Identifier: Apache-2.0
//! Length-prefixed CBOR framing for carrying substrate values (or any other
//! serializable payload) over a byte stream. Generalized from the teacher's
//! fixed `Packet` wire format to work over arbitrary `Serialize`/
//! `DeserializeOwned` types, since the mesh has no single wire message enum.

use serde::de::Error as DeError;

use crate::SubstrateError;

/// Encode `value` as `[u32 big-endian length][CBOR bytes]`.
///
/// # Errors
/// Returns [`SubstrateError::Serde`] if `value` cannot be CBOR-encoded.
pub fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, SubstrateError> {
    let mut body = Vec::new();
    ciborium::into_writer(value, &mut body)
        .map_err(|err| SubstrateError::Serde(serde_json::Error::custom(err.to_string())))?;
    let mut framed = Vec::with_capacity(body.len() + 4);
    #[allow(clippy::cast_possible_truncation)]
    framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

/// Decode a single `[len][CBOR bytes]` frame from the front of `buf`,
/// returning the value and the number of bytes consumed. Returns `Ok(None)`
/// if `buf` does not yet contain a complete frame.
///
/// # Errors
/// Returns [`SubstrateError::Serde`] if a complete frame fails to decode.
pub fn decode<T: serde::de::DeserializeOwned>(
    buf: &[u8],
) -> Result<Option<(T, usize)>, SubstrateError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    #[allow(clippy::unwrap_used)]
    let len = u32::from_be_bytes(buf[..4].try_into().unwrap()) as usize;
    if buf.len() < 4 + len {
        return Ok(None);
    }
    let value = ciborium::from_reader(&buf[4..4 + len])
        .map_err(|err| SubstrateError::Serde(serde_json::Error::custom(err.to_string())))?;
    Ok(Some((value, 4 + len)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
        label: String,
    }

    #[test]
    fn round_trips_a_value() {
        let ping = Ping {
            seq: 7,
            label: "hello".to_string(),
        };
        let framed = encode(&ping).expect("encode");
        let (decoded, consumed): (Ping, usize) = decode(&framed).expect("decode").expect("frame");
        assert_eq!(decoded, ping);
        assert_eq!(consumed, framed.len());
    }

    #[test]
    fn reports_incomplete_frames() {
        let ping = Ping {
            seq: 1,
            label: "x".to_string(),
        };
        let framed = encode(&ping).expect("encode");
        let partial = &framed[..framed.len() - 1];
        let result: Option<(Ping, usize)> = decode(partial).expect("decode");
        assert!(result.is_none());
    }

    #[test]
    fn decodes_multiple_frames_back_to_back() {
        let a = Ping {
            seq: 1,
            label: "a".to_string(),
        };
        let b = Ping {
            seq: 2,
            label: "b".to_string(),
        };
        let mut buf = encode(&a).expect("encode a");
        buf.extend(encode(&b).expect("encode b"));

        let (first, consumed): (Ping, usize) = decode(&buf).expect("decode a").expect("frame a");
        assert_eq!(first, a);
        let (second, _): (Ping, usize) =
            decode(&buf[consumed..]).expect("decode b").expect("frame b");
        assert_eq!(second, b);
    }
}
