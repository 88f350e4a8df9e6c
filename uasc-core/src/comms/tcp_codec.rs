// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! The codec for the OPC UA TCP transport. Ingests bytes as they arrive and yields whole
//! transport messages; a partial message is never surfaced.

use std::io::Cursor;

use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;

use uasc_types::{BinaryDecodable, DecodingOptions, StatusCode};

use super::{
    message_chunk::MessageChunk,
    tcp_types::{
        AcknowledgeMessage, ErrorMessage, HelloMessage, MessageType, MESSAGE_HEADER_LEN,
    },
};

/// A complete transport message produced by the codec.
#[derive(Debug)]
pub enum Message {
    /// A HELLO message.
    Hello(HelloMessage),
    /// An ACKNOWLEDGE message.
    Acknowledge(AcknowledgeMessage),
    /// An ERROR message.
    Error(ErrorMessage),
    /// A MSG, OPN or CLO chunk, still secured.
    Chunk(MessageChunk),
}

/// Decoder for the transport stream. Frames are length-prefixed by their header; the codec
/// waits until a whole frame is buffered before yielding it.
pub struct TcpCodec {
    decoding_options: DecodingOptions,
}

impl TcpCodec {
    /// Create a codec with the given limits.
    pub fn new(decoding_options: DecodingOptions) -> TcpCodec {
        TcpCodec { decoding_options }
    }
}

impl Decoder for TcpCodec {
    type Item = Message;
    type Error = std::io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, std::io::Error> {
        if buf.len() < MESSAGE_HEADER_LEN {
            return Ok(None);
        }

        let message_type = MessageType::from_bytes(&buf[0..3]);
        if message_type == MessageType::Invalid {
            return Err(StatusCode::BadTcpMessageTypeInvalid.into());
        }

        let message_size = (&buf[4..8]).get_u32_le() as usize;
        if message_size < MESSAGE_HEADER_LEN {
            return Err(StatusCode::BadTcpMessageTypeInvalid.into());
        }
        if self.decoding_options.max_message_size > 0
            && message_size > self.decoding_options.max_message_size
        {
            return Err(StatusCode::BadTcpMessageTooLarge.into());
        }

        if buf.len() < message_size {
            // Not enough bytes yet; reserve what the rest of the frame needs.
            buf.reserve(message_size - buf.len());
            return Ok(None);
        }

        let frame = buf.split_to(message_size);
        let mut stream = Cursor::new(&frame[..]);
        let message = match message_type {
            MessageType::Hello => {
                Message::Hello(HelloMessage::decode(&mut stream, &self.decoding_options)?)
            }
            MessageType::Acknowledge => Message::Acknowledge(AcknowledgeMessage::decode(
                &mut stream,
                &self.decoding_options,
            )?),
            MessageType::Error => {
                Message::Error(ErrorMessage::decode(&mut stream, &self.decoding_options)?)
            }
            MessageType::Chunk => {
                Message::Chunk(MessageChunk::decode(&mut stream, &self.decoding_options)?)
            }
            MessageType::Invalid => unreachable!(),
        };
        Ok(Some(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uasc_types::BinaryEncodable;

    #[test]
    fn byte_at_a_time_ingestion() {
        // Feeding the codec one byte at a time must yield nothing until the whole frame is
        // buffered, then exactly one message.
        let hello = HelloMessage::new("opc.tcp://localhost:4840", 8192, 8192, 0, 0);
        let encoded = hello.encode_to_vec();

        let mut codec = TcpCodec::new(DecodingOptions::default());
        let mut buf = BytesMut::new();
        for (i, byte) in encoded.iter().enumerate() {
            buf.extend_from_slice(&[*byte]);
            let result = codec.decode(&mut buf).unwrap();
            if i < encoded.len() - 1 {
                assert!(result.is_none(), "yielded early at byte {i}");
            } else {
                let Some(Message::Hello(decoded)) = result else {
                    panic!("expected a hello message");
                };
                assert_eq!(decoded, hello);
            }
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn two_messages_in_one_buffer() {
        let ack = AcknowledgeMessage::new(0, 8192, 8192, 0, 0);
        let err = ErrorMessage::new(StatusCode::BadTimeout, "too slow");
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&ack.encode_to_vec());
        buf.extend_from_slice(&err.encode_to_vec());

        let mut codec = TcpCodec::new(DecodingOptions::default());
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::Acknowledge(_))
        ));
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Message::Error(_))
        ));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn invalid_message_type_is_an_error() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"XXXF\x08\x00\x00\x00");
        let mut codec = TcpCodec::new(DecodingOptions::default());
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn oversized_frame_is_an_error() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"MSGF\xff\xff\xff\x7f");
        let mut codec = TcpCodec::new(DecodingOptions::default());
        assert!(codec.decode(&mut buf).is_err());
    }
}
