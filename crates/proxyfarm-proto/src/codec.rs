//! Codec for encoding/decoding control messages

use crate::messages::ControlMessage;
use crate::MAX_FRAME_SIZE;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Message too large: {0} bytes")]
    MessageTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Control message codec
///
/// Format: `[length: u32 big-endian][payload: JSON control message]`
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlCodec;

impl ControlCodec {
    /// Length header size
    pub const HEADER_SIZE: usize = 4;

    pub fn new() -> Self {
        Self
    }

    /// Encode a single message into a standalone frame
    pub fn encode_frame(msg: &ControlMessage) -> Result<BytesMut, CodecError> {
        let mut buf = BytesMut::new();
        ControlCodec.encode(msg.clone(), &mut buf)?;
        Ok(buf)
    }
}

impl Encoder<ControlMessage> for ControlCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: ControlMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = serde_json::to_vec(&msg)?;

        if payload.len() > MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(payload.len()));
        }

        dst.reserve(Self::HEADER_SIZE + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}

impl Decoder for ControlCodec {
    type Item = ControlMessage;
    type Error = CodecError;

    /// Returns Ok(Some(message)) if a complete frame was decoded,
    /// Ok(None) if more data is needed
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&src[..Self::HEADER_SIZE]);
        let length = u32::from_be_bytes(length_bytes) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(CodecError::MessageTooLarge(length));
        }

        if src.len() < Self::HEADER_SIZE + length {
            src.reserve(Self::HEADER_SIZE + length - src.len());
            return Ok(None);
        }

        src.advance(Self::HEADER_SIZE);
        let frame = src.split_to(length);

        let msg: ControlMessage = serde_json::from_slice(&frame)?;
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Envelope;
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::Framed;

    #[test]
    fn test_decode_incomplete() {
        let msg = ControlMessage::Init {
            nonce_agent: "0011223344556677".to_string(),
        };
        let encoded = ControlCodec::encode_frame(&msg).unwrap();

        // Only provide length header
        let mut buf = BytesMut::from(&encoded[..4]);
        assert!(ControlCodec.decode(&mut buf).unwrap().is_none());

        // Provide rest of message
        buf.extend_from_slice(&encoded[4..]);
        assert_eq!(ControlCodec.decode(&mut buf).unwrap(), Some(msg));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_multiple() {
        let msg1 = ControlMessage::Init {
            nonce_agent: "aa".to_string(),
        };
        let msg2 = ControlMessage::Encrypted(Envelope {
            iv: "iv".to_string(),
            ciphertext: "ct".to_string(),
            tag: "tag".to_string(),
        });

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&ControlCodec::encode_frame(&msg1).unwrap());
        buf.extend_from_slice(&ControlCodec::encode_frame(&msg2).unwrap());

        assert_eq!(ControlCodec.decode(&mut buf).unwrap(), Some(msg1));
        assert_eq!(ControlCodec.decode(&mut buf).unwrap(), Some(msg2));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        assert!(matches!(
            ControlCodec.decode(&mut buf),
            Err(CodecError::MessageTooLarge(_))
        ));
    }

    #[test]
    fn test_garbage_payload_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(3);
        buf.extend_from_slice(b"{x}");
        assert!(matches!(
            ControlCodec.decode(&mut buf),
            Err(CodecError::SerializationError(_))
        ));
    }

    #[tokio::test]
    async fn test_framed_over_duplex() {
        let (a, b) = tokio::io::duplex(4096);
        let mut left = Framed::new(a, ControlCodec);
        let mut right = Framed::new(b, ControlCodec);

        let msg = ControlMessage::Ack {
            nonce_controller: "cc".to_string(),
            mac: "mm".to_string(),
            agent_id: "worker_1".to_string(),
        };
        left.send(msg.clone()).await.unwrap();

        let received = right.next().await.unwrap().unwrap();
        assert_eq!(received, msg);
    }
}
