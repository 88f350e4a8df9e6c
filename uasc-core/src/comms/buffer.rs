// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! The [`SendBuffer`], the staging area between outbound messages and the socket. A message
//! is chunked on write, each chunk is secured lazily, and the resulting bytes are drained
//! into the stream by the transport poll loop.

use std::collections::VecDeque;

use bytes::{Buf, BytesMut};
use log::trace;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use uasc_types::{BinaryEncodable, Error, StatusCode};

use crate::Message;

use super::{
    chunker::Chunker, message_chunk::MessageChunk, secure_channel::SecureChannel,
    tcp_types::ErrorMessage,
};

/// Outbound staging buffer for one connection.
pub struct SendBuffer {
    /// Secured bytes ready to be written to the stream.
    buffer: BytesMut,
    /// Chunks waiting to be secured and buffered.
    chunks: VecDeque<MessageChunk>,
    /// The negotiated maximum size of a chunk.
    pub send_buffer_size: usize,
    /// The negotiated maximum size of a whole message, 0 for no limit.
    pub max_message_size: usize,
    /// The negotiated maximum number of chunks in a message, 0 for no limit.
    pub max_chunk_count: usize,
}

impl SendBuffer {
    /// Create a send buffer with the local limits. [`SendBuffer::revise`] applies the
    /// negotiated ones.
    pub fn new(send_buffer_size: usize, max_message_size: usize, max_chunk_count: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(send_buffer_size),
            chunks: VecDeque::new(),
            send_buffer_size,
            max_message_size,
            max_chunk_count,
        }
    }

    fn min_zero_infinite(own: usize, remote: usize) -> usize {
        if remote == 0 {
            own
        } else if own == 0 {
            remote
        } else {
            own.min(remote)
        }
    }

    /// Apply the limits negotiated in the HELLO / ACKNOWLEDGE handshake.
    pub fn revise(
        &mut self,
        send_buffer_size: usize,
        max_message_size: usize,
        max_chunk_count: usize,
    ) {
        if self.send_buffer_size > send_buffer_size {
            self.send_buffer_size = send_buffer_size;
        }
        self.max_message_size = Self::min_zero_infinite(self.max_message_size, max_message_size);
        self.max_chunk_count = Self::min_zero_infinite(self.max_chunk_count, max_chunk_count);
    }

    /// Chunk a message and queue the chunks for securing. Sequence numbers are assigned
    /// here, making this the linearization point for the channel's outbound ordering.
    pub fn write(
        &mut self,
        request_id: u32,
        message: impl Message,
        secure_channel: &mut SecureChannel,
    ) -> Result<(), Error> {
        trace!("Writing request to buffer, request id {request_id}");

        let starting_sequence_number = secure_channel.next_send_sequence_number();
        let chunks = Chunker::encode(
            starting_sequence_number,
            request_id,
            self.max_message_size,
            self.send_buffer_size,
            secure_channel,
            &message,
        )?;

        if self.max_chunk_count > 0 && chunks.len() > self.max_chunk_count {
            return Err(Error::new(
                StatusCode::BadTcpMessageTooLarge,
                format!(
                    "Message encoded to {} chunks, exceeding the negotiated limit of {}",
                    chunks.len(),
                    self.max_chunk_count
                ),
            )
            .with_context(Some(request_id), Some(message.request_handle())));
        }

        // The first sequence number was handed out above, the remaining chunks claim theirs
        // now so the counter matches what went on the wire.
        for _ in 1..chunks.len() {
            secure_channel.next_send_sequence_number();
        }

        self.chunks.extend(chunks);
        Ok(())
    }

    /// Queue a transport-level ERROR message. It bypasses chunking and security since it is
    /// sent on failures before or outside any secure channel.
    pub fn write_error(&mut self, message: ErrorMessage) {
        self.buffer.extend_from_slice(&message.encode_to_vec());
    }

    /// Whether there are chunks waiting to be secured.
    pub fn should_encode_chunks(&self) -> bool {
        !self.chunks.is_empty()
    }

    /// Secure the next waiting chunk and append it to the outbound bytes.
    pub fn encode_next_chunk(&mut self, secure_channel: &SecureChannel) -> Result<(), Error> {
        let Some(chunk) = self.chunks.pop_front() else {
            return Ok(());
        };
        // Signing, padding and asymmetric encryption can all grow the chunk.
        let mut dst = vec![0u8; chunk.data.len() + 4096];
        let size = secure_channel.apply_security(&chunk, &mut dst)?;
        self.buffer.extend_from_slice(&dst[..size]);
        Ok(())
    }

    /// Whether there are secured bytes waiting to be written to the stream.
    pub fn can_read(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Write the buffered bytes into the stream. Cancel safe; bytes already written are
    /// consumed from the buffer as the write progresses.
    pub async fn read_into_async<W: AsyncWrite + Unpin>(
        &mut self,
        write: &mut W,
    ) -> std::io::Result<()> {
        while self.buffer.has_remaining() {
            let n = write.write_buf(&mut self.buffer).await?;
            if n == 0 {
                return Err(std::io::ErrorKind::WriteZero.into());
            }
        }
        write.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uasc_types::{GetEndpointsRequest, NodeId, RequestHeader, UAString};

    use crate::RequestMessage;

    fn test_message(url_len: usize) -> RequestMessage {
        GetEndpointsRequest {
            request_header: RequestHeader::new(NodeId::null(), 1),
            endpoint_url: UAString::from("x".repeat(url_len).as_str()),
            locale_ids: None,
            profile_uris: None,
        }
        .into()
    }

    #[test]
    fn write_encode_drain() {
        let mut channel = SecureChannel::new_no_certificate_store();
        let mut buffer = SendBuffer::new(8192, 0, 0);

        buffer.write(1, test_message(10), &mut channel).unwrap();
        assert!(buffer.should_encode_chunks());
        assert!(!buffer.can_read());

        while buffer.should_encode_chunks() {
            buffer.encode_next_chunk(&channel).unwrap();
        }
        assert!(buffer.can_read());
    }

    #[test]
    fn chunk_count_limit_enforced() {
        let mut channel = SecureChannel::new_no_certificate_store();
        let mut buffer = SendBuffer::new(8192, 0, 2);
        // Needs more than 2 chunks at the minimum chunk size.
        let err = buffer
            .write(1, test_message(40000), &mut channel)
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BadTcpMessageTooLarge);
    }

    #[test]
    fn sequence_numbers_advance_with_chunks() {
        let mut channel = SecureChannel::new_no_certificate_store();
        let mut buffer = SendBuffer::new(8192, 0, 0);
        buffer.write(1, test_message(20000), &mut channel).unwrap();
        let sent = channel.send_sequence_number();
        assert_eq!(sent as usize, buffer.chunks.len());
    }

    #[tokio::test]
    async fn drain_into_stream() {
        let mut channel = SecureChannel::new_no_certificate_store();
        let mut buffer = SendBuffer::new(8192, 0, 0);
        buffer.write(1, test_message(10), &mut channel).unwrap();
        while buffer.should_encode_chunks() {
            buffer.encode_next_chunk(&channel).unwrap();
        }

        let mut sink = Vec::new();
        buffer.read_into_async(&mut sink).await.unwrap();
        assert!(!sink.is_empty());
        assert!(!buffer.can_read());
        // The first bytes are a MSG chunk header.
        assert_eq!(&sink[0..3], b"MSG");
    }
}
