//! Length-prefixed framing for envelopes placed on the bus as raw bytes.
//!
//! A bus payload is a 4-byte big-endian length prefix followed by the JSON
//! body — this keeps the boundary between "one pub/sub message" and "one
//! envelope" unambiguous even if a transport were ever to coalesce or split
//! payloads (SPEC_FULL.md §4.B / §6).

use crate::error::{Error, Result};
use crate::message::Envelope;

pub fn encode(envelope: &Envelope) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(envelope)?;
    let len = u32::try_from(body.len())
        .map_err(|_| Error::ConfigurationError("envelope too large to frame".into()))?;
    let mut framed = Vec::with_capacity(4 + body.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&body);
    Ok(framed)
}

pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    if bytes.len() < 4 {
        return Err(Error::ConfigurationError("frame shorter than length prefix".into()));
    }
    let (len_bytes, rest) = bytes.split_at(4);
    let len = u32::from_be_bytes(len_bytes.try_into().unwrap()) as usize;
    let body = rest
        .get(..len)
        .ok_or_else(|| Error::ConfigurationError("frame shorter than declared length".into()))?;
    let envelope: Envelope = serde_json::from_slice(body)?;
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::kind;

    #[test]
    fn roundtrips_an_envelope() {
        let envelope = Envelope::new(kind::PING, serde_json::json!({})).with_timestamp(1.0);
        let framed = encode(&envelope).unwrap();
        let decoded = decode(&framed).unwrap();
        assert_eq!(decoded.kind, envelope.kind);
        assert_eq!(decoded.timestamp_secs, envelope.timestamp_secs);
    }

    #[test]
    fn rejects_truncated_frame() {
        let envelope = Envelope::new(kind::PING, serde_json::json!({}));
        let mut framed = encode(&envelope).unwrap();
        framed.truncate(framed.len() - 2);
        assert!(decode(&framed).is_err());
    }
}
