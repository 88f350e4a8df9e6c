// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! The client transport. Owns the framed stream halves, the send buffer and the pending
//! call registry; its poll loop moves bytes both ways without ever blocking the engine.

use std::{sync::Arc, time::Duration};

use futures::{future::BoxFuture, FutureExt, StreamExt};
use log::{debug, error, trace};
use tokio::{
    io::{AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
};
use tokio_util::codec::FramedRead;

use uasc_core::{
    comms::{
        buffer::SendBuffer,
        chunker::Chunker,
        message_chunk::{MessageChunk, MessageIsFinalType},
        secure_channel::SecureChannel,
        tcp_codec::{Message as TransportMessage, TcpCodec},
        url::hostname_port_from_url,
    },
    constants::DEFAULT_OPC_UA_SERVER_PORT,
    sync::RwLock,
    trace_read_lock, trace_write_lock, Message, RequestMessage, ResponseMessage,
};
use uasc_types::{DecodingOptions, Error, StatusCode};

use super::{
    pending::{PendingCalls, ResponseReceiver},
    IoStream,
};

/// Produces the raw stream a transport runs over. The default is TCP; tests substitute
/// in-memory pipes.
pub trait Connector: Send + Sync {
    /// Open a stream to the endpoint url.
    fn connect(&self, endpoint_url: &str) -> BoxFuture<'static, Result<IoStream, StatusCode>>;
}

/// Connects over TCP.
#[derive(Debug, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&self, endpoint_url: &str) -> BoxFuture<'static, Result<IoStream, StatusCode>> {
        let endpoint_url = endpoint_url.to_string();
        async move {
            let (host, port) =
                hostname_port_from_url(&endpoint_url, DEFAULT_OPC_UA_SERVER_PORT)
                    .map_err(|e| e.status())?;
            let addr = format!("{}:{}", host, port);
            let addr = match tokio::net::lookup_host(&addr).await {
                Ok(mut addrs) => match addrs.next() {
                    Some(addr) => addr,
                    None => {
                        error!("Invalid address {addr}, does not resolve to any socket");
                        return Err(StatusCode::BadTcpEndpointUrlInvalid);
                    }
                },
                Err(e) => {
                    error!("Invalid address {addr}, cannot be resolved: {e:?}");
                    return Err(StatusCode::BadTcpEndpointUrlInvalid);
                }
            };

            debug!("Connecting to {addr} with url {endpoint_url}");
            let socket = TcpStream::connect(&addr).await.map_err(|err| {
                error!("Could not connect to host {addr}: {err:?}");
                StatusCode::BadCommunicationError
            })?;
            Ok(Box::new(socket) as IoStream)
        }
        .boxed()
    }
}

#[derive(Debug)]
/// Result of polling the transport.
pub enum TransportPollResult {
    /// An outgoing chunk was secured and buffered.
    OutgoingMessage,
    /// Buffered bytes were written to the stream.
    OutgoingMessageSent,
    /// An intermediate chunk was received and stored for reassembly.
    IncomingChunk,
    /// A whole message was received and dispatched to its pending call.
    IncomingMessage(u32),
    /// Expired pending calls were completed with `BadTimeout`.
    TimeoutSweep,
    /// Something failed for a single request without killing the connection.
    RecoverableError(StatusCode),
    /// The connection is finished, with the status that ended it.
    Closed(StatusCode),
}

/// The client side transport, once the HELLO / ACKNOWLEDGE handshake is done.
pub struct TcpTransport {
    read: FramedRead<ReadHalf<IoStream>, TcpCodec>,
    write: WriteHalf<IoStream>,
    send_buffer: SendBuffer,
    secure_channel: Arc<RwLock<SecureChannel>>,
    pending: PendingCalls,
    pending_chunks: Vec<MessageChunk>,
}

impl TcpTransport {
    /// Assemble a transport from the stream halves used for the handshake and the revised
    /// limits.
    pub fn new(
        read: FramedRead<ReadHalf<IoStream>, TcpCodec>,
        write: WriteHalf<IoStream>,
        send_buffer: SendBuffer,
        secure_channel: Arc<RwLock<SecureChannel>>,
        max_inflight_requests: usize,
    ) -> Self {
        Self {
            read,
            write,
            send_buffer,
            secure_channel,
            pending: PendingCalls::new(max_inflight_requests),
            pending_chunks: Vec::new(),
        }
    }

    /// Write a request to the channel and register it for a response. Returns the receiver
    /// the response is delivered on.
    pub fn send_request(
        &mut self,
        request: RequestMessage,
        timeout: Duration,
    ) -> Result<ResponseReceiver, StatusCode> {
        let mut secure_channel = trace_write_lock!(self.secure_channel);
        let request_id = secure_channel.next_request_id();
        let recv = self.pending.register(request_id, timeout)?;
        if let Err(e) = self
            .send_buffer
            .write(request_id, request, &mut secure_channel)
        {
            drop(secure_channel);
            let status = e.status();
            self.pending.complete(request_id, Err(status));
            return Err(status);
        }
        Ok(recv)
    }

    /// Write a request with no registered response, e.g. CloseSecureChannel.
    pub fn send_request_no_response(&mut self, request: RequestMessage) -> Result<(), StatusCode> {
        let mut secure_channel = trace_write_lock!(self.secure_channel);
        let request_id = secure_channel.next_request_id();
        self.send_buffer
            .write(request_id, request, &mut secure_channel)
            .map_err(|e| e.status())
    }

    /// Number of outstanding calls.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Drive the transport one step: secure a chunk, move bytes, ingest an inbound message,
    /// or sweep timed out calls - whichever is ready first. Cancel safe.
    pub async fn poll(&mut self) -> TransportPollResult {
        // If there's nothing in the send buffer, but there are chunks available,
        // write them to the send buffer before proceeding.
        if self.send_buffer.should_encode_chunks() {
            let secure_channel = trace_read_lock!(self.secure_channel);
            if let Err(e) = self.send_buffer.encode_next_chunk(&secure_channel) {
                return TransportPollResult::Closed(e.status());
            }
            return TransportPollResult::OutgoingMessage;
        }

        let deadline = self.pending.next_deadline();
        let timeout_fut = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                None => futures::future::pending::<()>().await,
            }
        };

        // If there is something in the send buffer, write to the stream.
        // Either way, listen to incoming messages and watch call deadlines while we do this.
        if self.send_buffer.can_read() {
            tokio::select! {
                r = self.send_buffer.read_into_async(&mut self.write) => {
                    if let Err(e) = r {
                        error!("write bytes task failed: {}", e);
                        return TransportPollResult::Closed(StatusCode::BadCommunicationError);
                    }
                    TransportPollResult::OutgoingMessageSent
                }
                incoming = self.read.next() => {
                    self.handle_incoming_message(incoming)
                }
                _ = timeout_fut => {
                    self.pending.sweep(std::time::Instant::now());
                    TransportPollResult::TimeoutSweep
                }
            }
        } else {
            tokio::select! {
                incoming = self.read.next() => {
                    self.handle_incoming_message(incoming)
                }
                _ = timeout_fut => {
                    self.pending.sweep(std::time::Instant::now());
                    TransportPollResult::TimeoutSweep
                }
            }
        }
    }

    /// Secure and write out everything queued, without waiting for anything inbound. Used
    /// for orderly teardown where the close messages must reach the wire.
    pub async fn flush_outgoing(&mut self) -> Result<(), StatusCode> {
        loop {
            if self.send_buffer.should_encode_chunks() {
                let secure_channel = trace_read_lock!(self.secure_channel);
                self.send_buffer
                    .encode_next_chunk(&secure_channel)
                    .map_err(|e| e.status())?;
                continue;
            }
            if self.send_buffer.can_read() {
                self.send_buffer
                    .read_into_async(&mut self.write)
                    .await
                    .map_err(|_| StatusCode::BadCommunicationError)?;
            } else {
                return Ok(());
            }
        }
    }

    /// Tear the transport down: every outstanding call resolves with the given status, and
    /// the write half is shut down.
    pub async fn close(&mut self, status: StatusCode) {
        self.pending.drain(status);
        self.pending_chunks.clear();
        let _ = self.write.shutdown().await;
    }

    fn handle_incoming_message(
        &mut self,
        incoming: Option<Result<TransportMessage, std::io::Error>>,
    ) -> TransportPollResult {
        let Some(incoming) = incoming else {
            return TransportPollResult::Closed(StatusCode::BadConnectionClosed);
        };
        match incoming {
            Ok(message) => self.process_message(message),
            Err(err) => {
                error!("Error reading from stream {}", err);
                TransportPollResult::Closed(StatusCode::BadConnectionClosed)
            }
        }
    }

    fn process_message(&mut self, message: TransportMessage) -> TransportPollResult {
        match message {
            TransportMessage::Error(error) => {
                error!(
                    "Server sent an ERR message, error {}, reason {}",
                    error.error, error.reason
                );
                TransportPollResult::Closed(error.error)
            }
            TransportMessage::Chunk(chunk) => match self.process_chunk(chunk) {
                Ok(r) => r,
                Err(e) => {
                    self.pending_chunks.clear();
                    if let Some(request_id) = e.request_id() {
                        let status = e.status();
                        self.pending.complete(request_id, Err(status));
                        TransportPollResult::RecoverableError(status)
                    } else {
                        TransportPollResult::Closed(e.status())
                    }
                }
            },
            unexpected => {
                error!("Received unexpected message: {:?}", unexpected);
                TransportPollResult::Closed(StatusCode::BadTcpMessageTypeInvalid)
            }
        }
    }

    fn process_chunk(&mut self, chunk: MessageChunk) -> Result<TransportPollResult, Error> {
        let mut secure_channel = trace_write_lock!(self.secure_channel);
        let decoding_options = secure_channel.decoding_options();
        let header = chunk.message_header(&decoding_options)?;

        let chunk = secure_channel.verify_and_remove_security(&chunk.data)?;

        if header.is_final == MessageIsFinalType::FinalError {
            // The sender abandoned the message. Drop the partial reassembly and fail the
            // request it belonged to.
            let request_id = chunk
                .chunk_info(&secure_channel)
                .map(|info| info.sequence_header.request_id)
                .ok();
            drop(secure_channel);
            self.pending_chunks.clear();
            if let Some(request_id) = request_id {
                self.pending
                    .complete(request_id, Err(StatusCode::BadRequestInterrupted));
                return Ok(TransportPollResult::RecoverableError(
                    StatusCode::BadRequestInterrupted,
                ));
            }
            return Ok(TransportPollResult::IncomingChunk);
        }

        if self.send_buffer.max_chunk_count > 0
            && self.pending_chunks.len() == self.send_buffer.max_chunk_count
        {
            return Err(Error::new(
                StatusCode::BadEncodingLimitsExceeded,
                format!(
                    "Message has more than {} chunks, exceeding negotiated limits",
                    self.send_buffer.max_chunk_count
                ),
            ));
        }
        self.pending_chunks.push(chunk);

        if header.is_final == MessageIsFinalType::Intermediate {
            return Ok(TransportPollResult::IncomingChunk);
        }

        // Message complete; validate the chunk run and reassemble.
        let chunk_info = self.pending_chunks[0].chunk_info(&secure_channel)?;
        let request_id = chunk_info.sequence_header.request_id;

        let starting_sequence_number = secure_channel
            .last_received_sequence_number()
            .map(|s| s.wrapping_add(1))
            .unwrap_or(0);
        // A sequence number violation is fatal for the whole channel, so no request context
        // is attached here.
        let last_sequence_number = Chunker::validate_chunks(
            starting_sequence_number,
            &secure_channel,
            &self.pending_chunks,
        )?;
        secure_channel.reset_received_sequence_number(last_sequence_number);

        let message: ResponseMessage =
            Chunker::decode(&self.pending_chunks, &secure_channel, None)
                .map_err(|e| {
                    e.with_context(Some(request_id), None)
                })?;
        drop(secure_channel);
        self.pending_chunks.clear();

        trace!(
            "Received response {} for request id {}, handle {}",
            message.type_name(),
            request_id,
            message.request_handle()
        );
        self.pending.complete(request_id, Ok(message));
        Ok(TransportPollResult::IncomingMessage(request_id))
    }
}
