// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! [ChunkInfo] breaks a chunk down into its headers and locates the message body within
//! the chunk data.

use std::{io::Cursor, ops::Range};

use uasc_types::{BinaryDecodable, EncodingResult};

use super::{
    message_chunk::{MessageChunk, MessageChunkHeader},
    secure_channel::SecureChannel,
    security_header::{SecurityHeader, SequenceHeader},
};

/// The decoded headers of a chunk and the span of its body. Only meaningful on a plaintext
/// chunk; on a still-encrypted chunk everything past the security header is ciphertext.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkInfo {
    /// The chunk's message header.
    pub message_header: MessageChunkHeader,
    /// The security header, asymmetric for OPN chunks and symmetric for everything else.
    pub security_header: SecurityHeader,
    /// The sequence header carrying the chunk's sequence number and request id.
    pub sequence_header: SequenceHeader,
    /// Where the message body lies within the chunk data.
    pub body: Range<usize>,
}

impl ChunkInfo {
    /// Read the headers off the front of `chunk`; everything that remains is the body.
    pub fn new(chunk: &MessageChunk, secure_channel: &SecureChannel) -> EncodingResult<ChunkInfo> {
        let decoding_options = secure_channel.decoding_options();
        let mut stream = Cursor::new(&chunk.data);

        let message_header = MessageChunkHeader::decode(&mut stream, &decoding_options)?;
        let security_header = SecurityHeader::decode_from_stream(
            &mut stream,
            message_header.message_type.is_open_secure_channel(),
            &decoding_options,
        )?;
        let sequence_header = SequenceHeader::decode(&mut stream, &decoding_options)?;

        let body = (stream.position() as usize)..chunk.data.len();
        Ok(ChunkInfo {
            message_header,
            security_header,
            sequence_header,
            body,
        })
    }

    /// Length in bytes of the message body.
    pub fn body_length(&self) -> usize {
        self.body.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comms::message_chunk::{MessageChunkType, MessageIsFinalType};

    #[test]
    fn locates_body_and_headers() {
        let channel = SecureChannel::new_no_certificate_store();
        let payload = [0xabu8; 40];
        let chunk = MessageChunk::new(
            12,
            7,
            MessageChunkType::Message,
            MessageIsFinalType::Final,
            &channel,
            &payload,
        )
        .unwrap();

        let info = ChunkInfo::new(&chunk, &channel).unwrap();
        assert_eq!(info.message_header.message_type, MessageChunkType::Message);
        assert_eq!(info.sequence_header.sequence_number, 12);
        assert_eq!(info.sequence_header.request_id, 7);
        assert!(matches!(info.security_header, SecurityHeader::Symmetric(_)));
        assert_eq!(info.body_length(), payload.len());
        assert_eq!(&chunk.data[info.body], &payload[..]);
    }

    #[test]
    fn opn_chunk_has_asymmetric_header() {
        let channel = SecureChannel::new_no_certificate_store();
        let chunk = MessageChunk::new(
            1,
            1,
            MessageChunkType::OpenSecureChannel,
            MessageIsFinalType::Final,
            &channel,
            &[1, 2, 3],
        )
        .unwrap();

        let info = ChunkInfo::new(&chunk, &channel).unwrap();
        assert!(matches!(
            info.security_header,
            SecurityHeader::Asymmetric(_)
        ));
        assert_eq!(info.body_length(), 3);
    }
}
