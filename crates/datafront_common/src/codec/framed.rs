use codee::{Decoder, Encoder};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::CodecError;

/// Size of the little-endian length prefix in front of every frame.
pub const LENGTH_PREFIX: usize = 8;

/// Codec for the datafront wire protocol:
/// - 8-byte little-endian length prefix
/// - JSON-encoded message
///
/// A transport packet may carry several frames back to back (servers batch
/// pushes); decoding yields them in the order they were written.
///
/// ## Usage
///
/// ```rust
/// use codee::{Decoder, Encoder};
/// use datafront_common::codec::FramedJsonCodec;
/// use serde_json::{json, Value};
///
/// let bytes = FramedJsonCodec::encode(&json!({ "ok": true })).unwrap();
/// let decoded: Vec<Value> = FramedJsonCodec::decode(bytes.as_slice()).unwrap();
/// assert_eq!(decoded, vec![json!({ "ok": true })]);
/// ```
pub struct FramedJsonCodec;

impl<T: Serialize> Encoder<T> for FramedJsonCodec {
    type Error = CodecError;
    type Encoded = Vec<u8>;

    fn encode(val: &T) -> Result<Self::Encoded, Self::Error> {
        let body = serde_json::to_vec(val)?;

        let len = body.len() as u64;
        let mut buffer = Vec::with_capacity(LENGTH_PREFIX + body.len());
        buffer.extend_from_slice(&len.to_le_bytes());
        buffer.extend_from_slice(&body);

        Ok(buffer)
    }
}

impl<T: DeserializeOwned> Decoder<Vec<T>> for FramedJsonCodec {
    type Error = CodecError;
    type Encoded = [u8];

    fn decode(val: &Self::Encoded) -> Result<Vec<T>, Self::Error> {
        split_frames(val)?
            .into_iter()
            .map(|frame| serde_json::from_slice(frame).map_err(CodecError::from))
            .collect()
    }
}

/// Encode several messages into one packet.
pub fn encode_batch<T: Serialize>(messages: &[T]) -> Result<Vec<u8>, CodecError> {
    let mut buffer = Vec::new();
    for message in messages {
        buffer.extend(<FramedJsonCodec as Encoder<T>>::encode(message)?);
    }
    Ok(buffer)
}

/// Split a packet into its frame bodies without parsing them.
///
/// Fails if a length prefix or body is cut short; nothing is returned for a
/// partially valid packet.
pub fn split_frames(data: &[u8]) -> Result<Vec<&[u8]>, CodecError> {
    let mut frames = Vec::new();
    let mut offset = 0;

    while offset < data.len() {
        let available = data.len() - offset;
        if available < LENGTH_PREFIX {
            return Err(CodecError::Truncated {
                needed: LENGTH_PREFIX,
                available,
            });
        }

        let mut length_bytes = [0u8; LENGTH_PREFIX];
        length_bytes.copy_from_slice(&data[offset..offset + LENGTH_PREFIX]);
        let length = u64::from_le_bytes(length_bytes) as usize;
        offset += LENGTH_PREFIX;

        let available = data.len() - offset;
        if length > available {
            return Err(CodecError::Truncated {
                needed: length,
                available,
            });
        }

        frames.push(&data[offset..offset + length]);
        offset += length;
    }

    Ok(frames)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{InboundMessage, Push, Response};
    use crate::{EntityId, EntityKind};
    use serde_json::json;

    #[test]
    fn frame_carries_length_prefix() {
        let enc = FramedJsonCodec::encode(&json!({ "a": 1 })).unwrap();

        let length_bytes: [u8; 8] = enc[..8].try_into().unwrap();
        let length = u64::from_le_bytes(length_bytes);
        assert_eq!(length as usize, enc.len() - 8);
    }

    #[test]
    fn batched_frames_decode_in_order() {
        let messages = vec![
            InboundMessage::Push(Push::EntityUpdate {
                entity_type: EntityKind::Cities,
                id: EntityId::Int(1),
                fields: json!({ "population": 10 }).as_object().cloned().unwrap(),
            }),
            InboundMessage::Response(Response::success(2, json!([]))),
            InboundMessage::Push(Push::EntityRemoved {
                entity_type: EntityKind::Cities,
                id: EntityId::Int(1),
            }),
        ];

        let packet = encode_batch(&messages).unwrap();
        let decoded: Vec<InboundMessage> = FramedJsonCodec::decode(packet.as_slice()).unwrap();
        assert_eq!(decoded, messages);
    }

    #[test]
    fn truncated_packet_is_rejected() {
        let mut packet = FramedJsonCodec::encode(&json!({ "a": 1 })).unwrap();
        packet.pop();

        let err = split_frames(&packet).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { .. }));

        let err = split_frames(&[1, 0, 0]).unwrap_err();
        assert!(matches!(err, CodecError::Truncated { needed: 8, available: 3 }));
    }

    #[test]
    fn empty_packet_has_no_frames() {
        assert!(split_frames(&[]).unwrap().is_empty());
    }
}
