// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! The types for the handshake messages of the OPC UA TCP transport: HELLO, ACKNOWLEDGE and
//! ERROR, together with the 8-byte message header every transport message starts with.

use std::io::{Read, Write};

use uasc_types::{
    encoding::constants as encoding_limits, read_u32, read_u8, write_u32, BinaryDecodable,
    BinaryEncodable, DecodingOptions, EncodingResult, Error, StatusCode, UAString,
};

/// Minimum size in bytes of the send and receive buffers either peer may offer.
pub const MIN_CHUNK_SIZE: usize = 8192;

/// Maximum length of the endpoint url in a HELLO.
pub const MAX_ENDPOINT_URL_LENGTH: usize = 4096;

/// The length of a transport message header.
pub const MESSAGE_HEADER_LEN: usize = 8;

/// "HEL", a hello message.
pub const MESSAGE_TYPE_HELLO: &[u8] = b"HEL";
/// "ACK", an acknowledge message.
pub const MESSAGE_TYPE_ACKNOWLEDGE: &[u8] = b"ACK";
/// "ERR", an error message.
pub const MESSAGE_TYPE_ERROR: &[u8] = b"ERR";
/// "MSG", a message chunk secured with symmetric keys.
pub const CHUNK_MESSAGE: &[u8] = b"MSG";
/// "OPN", an open secure channel chunk secured asymmetrically.
pub const OPEN_SECURE_CHANNEL_MESSAGE: &[u8] = b"OPN";
/// "CLO", a close secure channel chunk.
pub const CLOSE_SECURE_CHANNEL_MESSAGE: &[u8] = b"CLO";

/// 'F', the one and only or final chunk of a message.
pub const CHUNK_FINAL: u8 = b'F';
/// 'C', an intermediate chunk of a message.
pub const CHUNK_INTERMEDIATE: u8 = b'C';
/// 'A', the final chunk of a message the sender aborted.
pub const CHUNK_FINAL_ERROR: u8 = b'A';

/// The kind of transport message, from the first 3 bytes of its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// A HELLO message.
    Hello,
    /// An ACKNOWLEDGE message.
    Acknowledge,
    /// An ERROR message.
    Error,
    /// A MSG, OPN or CLO message chunk.
    Chunk,
    /// Anything else.
    Invalid,
}

/// The 8 byte header preceding every transport message: 3 ASCII bytes of message type, one
/// chunk type byte, and the total message size as a little-endian u32.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageHeader {
    /// The message type.
    pub message_type: MessageType,
    /// The total size of the message including this header.
    pub message_size: u32,
}

impl BinaryEncodable for MessageHeader {
    fn byte_len(&self) -> usize {
        MESSAGE_HEADER_LEN
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        let message_type = match self.message_type {
            MessageType::Hello => MESSAGE_TYPE_HELLO,
            MessageType::Acknowledge => MESSAGE_TYPE_ACKNOWLEDGE,
            MessageType::Error => MESSAGE_TYPE_ERROR,
            _ => {
                return Err(Error::encoding(
                    "Cannot encode a chunk or invalid message header here",
                ));
            }
        };
        uasc_types::encoding::process_encode_io_result(stream.write_all(message_type))?;
        // Handshake messages are single-chunk by definition.
        uasc_types::write_u8(stream, CHUNK_FINAL)?;
        write_u32(stream, self.message_size)
    }
}

impl BinaryDecodable for MessageHeader {
    fn decode<S: Read + ?Sized>(stream: &mut S, _: &DecodingOptions) -> EncodingResult<Self> {
        let mut message_type_code = [0u8; 3];
        uasc_types::encoding::process_decode_io_result(stream.read_exact(&mut message_type_code))?;
        let message_type = MessageType::from_bytes(&message_type_code);
        if message_type == MessageType::Invalid {
            return Err(Error::new(
                StatusCode::BadTcpMessageTypeInvalid,
                format!("Message type {message_type_code:?} is not recognized"),
            ));
        }
        let chunk_type = read_u8(stream)?;
        if !matches!(chunk_type, CHUNK_FINAL | CHUNK_INTERMEDIATE | CHUNK_FINAL_ERROR) {
            return Err(Error::new(
                StatusCode::BadTcpMessageTypeInvalid,
                format!("Chunk type {chunk_type} is not recognized"),
            ));
        }
        let message_size = read_u32(stream)?;
        Ok(MessageHeader {
            message_type,
            message_size,
        })
    }
}

impl MessageType {
    /// Classify the first three bytes of a message header.
    pub fn from_bytes(bytes: &[u8]) -> MessageType {
        match bytes {
            MESSAGE_TYPE_HELLO => MessageType::Hello,
            MESSAGE_TYPE_ACKNOWLEDGE => MessageType::Acknowledge,
            MESSAGE_TYPE_ERROR => MessageType::Error,
            CHUNK_MESSAGE | OPEN_SECURE_CHANNEL_MESSAGE | CLOSE_SECURE_CHANNEL_MESSAGE => {
                MessageType::Chunk
            }
            _ => MessageType::Invalid,
        }
    }
}

/// A HELLO message, the first thing a client sends on a fresh connection. Carries the
/// client's transport limits and the endpoint url it believes it is talking to.
#[derive(Debug, Clone, PartialEq)]
pub struct HelloMessage {
    /// The message header.
    pub message_header: MessageHeader,
    /// Version of the transport protocol, 0.
    pub protocol_version: u32,
    /// Largest chunk the sender can receive.
    pub receive_buffer_size: u32,
    /// Largest chunk the sender will send.
    pub send_buffer_size: u32,
    /// Largest whole message the sender will accept, 0 for no limit.
    pub max_message_size: u32,
    /// Most chunks per message the sender will accept, 0 for no limit.
    pub max_chunk_count: u32,
    /// The url the client used to reach this server.
    pub endpoint_url: UAString,
}

impl BinaryEncodable for HelloMessage {
    fn byte_len(&self) -> usize {
        MESSAGE_HEADER_LEN + 20 + self.endpoint_url.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.message_header.encode(stream)?;
        self.protocol_version.encode(stream)?;
        self.receive_buffer_size.encode(stream)?;
        self.send_buffer_size.encode(stream)?;
        self.max_message_size.encode(stream)?;
        self.max_chunk_count.encode(stream)?;
        self.endpoint_url.encode(stream)
    }
}

impl BinaryDecodable for HelloMessage {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(HelloMessage {
            message_header: MessageHeader::decode(stream, options)?,
            protocol_version: u32::decode(stream, options)?,
            receive_buffer_size: u32::decode(stream, options)?,
            send_buffer_size: u32::decode(stream, options)?,
            max_message_size: u32::decode(stream, options)?,
            max_chunk_count: u32::decode(stream, options)?,
            endpoint_url: UAString::decode(stream, options)?,
        })
    }
}

impl HelloMessage {
    /// Create a HELLO from the local connection configuration.
    pub fn new(
        endpoint_url: &str,
        send_buffer_size: usize,
        receive_buffer_size: usize,
        max_message_size: usize,
        max_chunk_count: usize,
    ) -> HelloMessage {
        let mut msg = HelloMessage {
            message_header: MessageHeader {
                message_type: MessageType::Hello,
                message_size: 0,
            },
            protocol_version: 0,
            receive_buffer_size: receive_buffer_size as u32,
            send_buffer_size: send_buffer_size as u32,
            max_message_size: max_message_size as u32,
            max_chunk_count: max_chunk_count as u32,
            endpoint_url: UAString::from(endpoint_url),
        };
        msg.message_header.message_size = msg.byte_len() as u32;
        msg
    }

    /// Endpoint urls in HELLO are bounded so a server cannot be made to allocate
    /// arbitrarily much before any security is in place.
    pub fn is_endpoint_url_valid(&self) -> bool {
        !self.endpoint_url.is_null()
            && self.endpoint_url.len() <= MAX_ENDPOINT_URL_LENGTH as isize
    }

    /// Both buffer sizes must be at least the spec-mandated minimum chunk size.
    pub fn is_valid_buffer_sizes(&self) -> bool {
        self.receive_buffer_size as usize >= MIN_CHUNK_SIZE
            && self.send_buffer_size as usize >= MIN_CHUNK_SIZE
    }
}

/// An ACKNOWLEDGE message, the server's answer to HELLO with the revised limits.
#[derive(Debug, Clone, PartialEq)]
pub struct AcknowledgeMessage {
    /// The message header.
    pub message_header: MessageHeader,
    /// Version of the transport protocol, 0.
    pub protocol_version: u32,
    /// Largest chunk the server can receive, at most the client's send buffer size.
    pub receive_buffer_size: u32,
    /// Largest chunk the server will send, at most the client's receive buffer size.
    pub send_buffer_size: u32,
    /// Largest whole message the server will accept, 0 for no limit.
    pub max_message_size: u32,
    /// Most chunks per message the server will accept, 0 for no limit.
    pub max_chunk_count: u32,
}

impl BinaryEncodable for AcknowledgeMessage {
    fn byte_len(&self) -> usize {
        MESSAGE_HEADER_LEN + 20
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.message_header.encode(stream)?;
        self.protocol_version.encode(stream)?;
        self.receive_buffer_size.encode(stream)?;
        self.send_buffer_size.encode(stream)?;
        self.max_message_size.encode(stream)?;
        self.max_chunk_count.encode(stream)
    }
}

impl BinaryDecodable for AcknowledgeMessage {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(AcknowledgeMessage {
            message_header: MessageHeader::decode(stream, options)?,
            protocol_version: u32::decode(stream, options)?,
            receive_buffer_size: u32::decode(stream, options)?,
            send_buffer_size: u32::decode(stream, options)?,
            max_message_size: u32::decode(stream, options)?,
            max_chunk_count: u32::decode(stream, options)?,
        })
    }
}

impl AcknowledgeMessage {
    /// Create an ACK with the revised values.
    pub fn new(
        protocol_version: u32,
        receive_buffer_size: u32,
        send_buffer_size: u32,
        max_message_size: u32,
        max_chunk_count: u32,
    ) -> AcknowledgeMessage {
        let mut ack = AcknowledgeMessage {
            message_header: MessageHeader {
                message_type: MessageType::Acknowledge,
                message_size: 0,
            },
            protocol_version,
            receive_buffer_size,
            send_buffer_size,
            max_message_size,
            max_chunk_count,
        };
        ack.message_header.message_size = ack.byte_len() as u32;
        ack
    }
}

/// An ERROR message, sent instead of an ACK or before dropping a connection that failed at
/// the transport level.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMessage {
    /// The message header.
    pub message_header: MessageHeader,
    /// The error as a status code.
    pub error: StatusCode,
    /// Human readable reason, possibly empty.
    pub reason: UAString,
}

impl BinaryEncodable for ErrorMessage {
    fn byte_len(&self) -> usize {
        MESSAGE_HEADER_LEN + self.error.byte_len() + self.reason.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.message_header.encode(stream)?;
        self.error.encode(stream)?;
        self.reason.encode(stream)
    }
}

impl BinaryDecodable for ErrorMessage {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(ErrorMessage {
            message_header: MessageHeader::decode(stream, options)?,
            error: StatusCode::decode(stream, options)?,
            reason: UAString::decode(stream, options)?,
        })
    }
}

impl ErrorMessage {
    /// Create an ERROR for the given status and reason.
    pub fn new(error: StatusCode, reason: &str) -> ErrorMessage {
        let mut msg = ErrorMessage {
            message_header: MessageHeader {
                message_type: MessageType::Error,
                message_size: 0,
            },
            error,
            reason: UAString::from(reason),
        };
        msg.message_header.message_size = msg.byte_len() as u32;
        msg
    }
}

/// Sanity limit applied to declared message sizes before limits are negotiated.
pub fn default_max_message_size() -> usize {
    encoding_limits::MAX_MESSAGE_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T: BinaryEncodable + BinaryDecodable + PartialEq + std::fmt::Debug>(value: &T) {
        let buf = value.encode_to_vec();
        assert_eq!(buf.len(), value.byte_len());
        let mut stream = std::io::Cursor::new(buf);
        let decoded = T::decode(&mut stream, &DecodingOptions::default()).unwrap();
        assert_eq!(&decoded, value);
    }

    #[test]
    fn hello_round_trip() {
        let hello = HelloMessage::new("opc.tcp://localhost:4840", 65535, 65535, 0, 0);
        assert_eq!(hello.message_header.message_size as usize, hello.byte_len());
        round_trip(&hello);
    }

    #[test]
    fn ack_round_trip() {
        round_trip(&AcknowledgeMessage::new(0, 8192, 8192, 65536, 5));
    }

    #[test]
    fn error_round_trip() {
        round_trip(&ErrorMessage::new(
            StatusCode::BadTcpEndpointUrlInvalid,
            "endpoint url rejected",
        ));
    }

    #[test]
    fn hello_validation() {
        let hello = HelloMessage::new("opc.tcp://localhost:4840", 8192, 8192, 0, 0);
        assert!(hello.is_valid_buffer_sizes());
        assert!(hello.is_endpoint_url_valid());

        let hello = HelloMessage::new("opc.tcp://localhost:4840", 100, 8192, 0, 0);
        assert!(!hello.is_valid_buffer_sizes());

        let hello = HelloMessage::new(&"x".repeat(MAX_ENDPOINT_URL_LENGTH + 1), 8192, 8192, 0, 0);
        assert!(!hello.is_endpoint_url_valid());
    }

    #[test]
    fn bad_message_type_rejected() {
        let mut buf = HelloMessage::new("opc.tcp://x", 8192, 8192, 0, 0).encode_to_vec();
        buf[0] = b'X';
        let mut stream = std::io::Cursor::new(buf);
        let err = HelloMessage::decode(&mut stream, &DecodingOptions::default()).unwrap_err();
        assert_eq!(err.status(), StatusCode::BadTcpMessageTypeInvalid);
    }
}
