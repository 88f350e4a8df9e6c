// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! The server side transport: the HELLO / ACKNOWLEDGE handshake and the per-connection
//! framing, securing and reassembly loop.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use futures::StreamExt;
use log::{error, warn};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::{codec::FramedRead, sync::CancellationToken};

use uasc_core::{
    comms::{
        buffer::SendBuffer,
        chunker::Chunker,
        message_chunk::{MessageChunk, MessageIsFinalType},
        message_chunk_info::ChunkInfo,
        secure_channel::SecureChannel,
        tcp_codec::{Message as TransportMessage, TcpCodec},
        tcp_types::{AcknowledgeMessage, ErrorMessage, HelloMessage},
    },
    sync::RwLock,
    trace_read_lock, trace_write_lock, RequestMessage, ResponseMessage,
};
use uasc_types::{
    BinaryEncodable, DecodingOptions, Error, ResponseHeader, ServiceFault, StatusCode,
};

/// The stream a server connection runs over. Boxed so tests can drive connections over
/// in-memory duplex pipes.
pub trait AsyncIo: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncIo for T {}

/// A boxed server side stream.
pub type IoStream = Box<dyn AsyncIo>;

/// Transport limits and handshake deadline of the server.
#[derive(Debug, Clone)]
pub(crate) struct TransportConfig {
    pub send_buffer_size: usize,
    pub receive_buffer_size: usize,
    pub max_message_size: usize,
    pub max_chunk_count: usize,
    pub hello_timeout: Duration,
}

/// A fully received, decoded request.
#[derive(Debug)]
pub(crate) struct Request {
    pub message: RequestMessage,
    pub chunk_info: ChunkInfo,
    pub request_id: u32,
}

#[derive(Debug)]
/// Result of polling a server transport.
pub(crate) enum TransportPollResult {
    OutgoingMessageSent,
    IncomingChunk,
    IncomingMessage(Request),
    Error(StatusCode),
    RecoverableError(StatusCode, u32, u32),
    Closed,
}

fn min_zero_infinite(server: u32, client: u32) -> u32 {
    if client == 0 {
        server
    } else if server == 0 {
        client
    } else {
        client.min(server)
    }
}

enum TransportState {
    Running,
    Closing,
}

/// Performs the HELLO / ACKNOWLEDGE handshake on a fresh connection, yielding the transport
/// on success. On failure an ERR message is sent before the stream is dropped.
pub(crate) struct Connector {
    read: FramedRead<ReadHalf<IoStream>, TcpCodec>,
    write: WriteHalf<IoStream>,
    deadline: Instant,
    config: TransportConfig,
}

impl Connector {
    pub fn new(stream: IoStream, config: TransportConfig) -> Connector {
        let (read, write) = tokio::io::split(stream);
        let read = FramedRead::new(read, TcpCodec::new(DecodingOptions::minimal()));
        Connector {
            read,
            write,
            deadline: Instant::now() + config.hello_timeout,
            config,
        }
    }

    pub async fn connect(
        mut self,
        token: CancellationToken,
    ) -> Result<(ServerTransport, u32), StatusCode> {
        let err = tokio::select! {
            _ = tokio::time::sleep_until(self.deadline.into()) => {
                ErrorMessage::new(StatusCode::BadTimeout, "Timeout waiting for HELLO")
            }
            _ = token.cancelled() => {
                ErrorMessage::new(StatusCode::BadServerHalted, "Server closed")
            }
            r = Self::connect_inner(&mut self.read, &mut self.write, &self.config) => {
                match r {
                    Ok((send_buffer, protocol_version, decoding_options)) => {
                        *self.read.decoder_mut() = TcpCodec::new(decoding_options);
                        return Ok((
                            ServerTransport::new(self.read, self.write, send_buffer),
                            protocol_version,
                        ));
                    }
                    Err(e) => e,
                }
            }
        };

        // Send an error if the handshake failed for whatever reason, but there's a good
        // chance the connection is dead, so ignore failures doing so.
        let _ = self.write.write_all(&err.encode_to_vec()).await;
        Err(err.error)
    }

    async fn connect_inner(
        read: &mut FramedRead<ReadHalf<IoStream>, TcpCodec>,
        write: &mut WriteHalf<IoStream>,
        config: &TransportConfig,
    ) -> Result<(SendBuffer, u32, DecodingOptions), ErrorMessage> {
        let hello = match read.next().await {
            Some(Ok(TransportMessage::Hello(hello))) => Ok(hello),
            Some(Ok(bad_msg)) => Err(ErrorMessage::new(
                StatusCode::BadCommunicationError,
                &format!("Expected a hello message, got {:?} instead", bad_msg),
            )),
            Some(Err(communication_err)) => Err(ErrorMessage::new(
                StatusCode::BadCommunicationError,
                &format!(
                    "Communication error while waiting for Hello message: {}",
                    communication_err
                ),
            )),
            None => Err(ErrorMessage::new(
                StatusCode::BadCommunicationError,
                "Stream closed",
            )),
        }?;

        Self::validate_hello(&hello)?;

        let mut send_buffer = SendBuffer::new(
            config.send_buffer_size,
            config.max_message_size,
            config.max_chunk_count,
        );

        // Send acknowledge
        let acknowledge = AcknowledgeMessage::new(
            0,
            (config.receive_buffer_size as u32).min(hello.send_buffer_size),
            (config.send_buffer_size as u32).min(hello.receive_buffer_size),
            min_zero_infinite(config.max_message_size as u32, hello.max_message_size),
            min_zero_infinite(config.max_chunk_count as u32, hello.max_chunk_count),
        );
        send_buffer.revise(
            acknowledge.send_buffer_size as usize,
            acknowledge.max_message_size as usize,
            acknowledge.max_chunk_count as usize,
        );

        write
            .write_all(&acknowledge.encode_to_vec())
            .await
            .map_err(|e| {
                ErrorMessage::new(
                    StatusCode::BadCommunicationError,
                    &format!("Failed to send ack: {e}"),
                )
            })?;

        let decoding_options = DecodingOptions {
            max_message_size: acknowledge.max_message_size as usize,
            max_chunk_count: acknowledge.max_chunk_count as usize,
            ..DecodingOptions::default()
        };
        Ok((send_buffer, hello.protocol_version, decoding_options))
    }

    fn validate_hello(hello: &HelloMessage) -> Result<(), ErrorMessage> {
        if !hello.is_endpoint_url_valid() {
            return Err(ErrorMessage::new(
                StatusCode::BadTcpEndpointUrlInvalid,
                "HELLO endpoint url is invalid",
            ));
        }
        if !hello.is_valid_buffer_sizes() {
            return Err(ErrorMessage::new(
                StatusCode::BadCommunicationError,
                "HELLO buffer sizes are invalid",
            ));
        }
        // Validate protocol version
        if hello.protocol_version > 0 {
            return Err(ErrorMessage::new(
                StatusCode::BadProtocolVersionUnsupported,
                "Client protocol version is unsupported.",
            ));
        }
        Ok(())
    }
}

/// Transport implementation for the server side of opc.tcp.
pub(crate) struct ServerTransport {
    read: FramedRead<ReadHalf<IoStream>, TcpCodec>,
    write: WriteHalf<IoStream>,
    send_buffer: SendBuffer,
    state: TransportState,
    pending_chunks: Vec<MessageChunk>,
}

impl ServerTransport {
    pub fn new(
        read: FramedRead<ReadHalf<IoStream>, TcpCodec>,
        write: WriteHalf<IoStream>,
        send_buffer: SendBuffer,
    ) -> Self {
        Self {
            read,
            write,
            send_buffer,
            state: TransportState::Running,
            pending_chunks: Vec::new(),
        }
    }

    /// Set the transport state to closing, once the final message is sent
    /// the connection will be closed.
    pub fn set_closing(&mut self) {
        self.state = TransportState::Closing;
    }

    pub fn is_closing(&self) -> bool {
        matches!(self.state, TransportState::Closing)
    }

    pub fn enqueue_error(&mut self, message: ErrorMessage) {
        self.send_buffer.write_error(message);
    }

    pub fn enqueue_message_for_send(
        &mut self,
        channel: &Arc<RwLock<SecureChannel>>,
        message: ResponseMessage,
        request_id: u32,
    ) -> Result<(), StatusCode> {
        let mut channel = trace_write_lock!(channel);
        match self.send_buffer.write(request_id, message, &mut channel) {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!("Failed to encode outgoing message: {e:?}");
                if let Some((request_id, request_handle)) = e.full_context() {
                    self.send_buffer.write(
                        request_id,
                        ResponseMessage::ServiceFault(Box::new(ServiceFault {
                            response_header: ResponseHeader::new_service_result(
                                request_handle,
                                e.into(),
                            ),
                        })),
                        &mut channel,
                    )
                    .map_err(|e| e.status())?;
                    Ok(())
                } else {
                    Err(e.into())
                }
            }
        }
    }

    pub async fn poll(&mut self, channel: &Arc<RwLock<SecureChannel>>) -> TransportPollResult {
        // If there's nothing in the send buffer, but there are chunks available,
        // write them to the send buffer before proceeding.
        if self.send_buffer.should_encode_chunks() {
            let locked = trace_read_lock!(channel);
            if let Err(e) = self.send_buffer.encode_next_chunk(&locked) {
                return TransportPollResult::Error(e.status());
            }
        }

        // If there is something in the send buffer, write to the stream.
        // If not, wait for incoming messages.
        if self.send_buffer.can_read() {
            tokio::select! {
                r = self.send_buffer.read_into_async(&mut self.write) => {
                    if let Err(e) = r {
                        error!("write bytes task failed: {}", e);
                        return TransportPollResult::Closed;
                    }
                    TransportPollResult::OutgoingMessageSent
                }
                incoming = self.read.next() => {
                    self.handle_incoming_message(incoming, channel)
                }
            }
        } else {
            if self.is_closing() {
                return TransportPollResult::Closed;
            }
            let incoming = self.read.next().await;
            self.handle_incoming_message(incoming, channel)
        }
    }

    fn handle_incoming_message(
        &mut self,
        incoming: Option<Result<TransportMessage, std::io::Error>>,
        channel: &Arc<RwLock<SecureChannel>>,
    ) -> TransportPollResult {
        let Some(incoming) = incoming else {
            return TransportPollResult::Closed;
        };
        match incoming {
            Ok(message) => match self.process_message(message, channel) {
                Ok(None) => TransportPollResult::IncomingChunk,
                Ok(Some(message)) => {
                    self.pending_chunks.clear();
                    TransportPollResult::IncomingMessage(message)
                }
                Err(e) => {
                    self.pending_chunks.clear();
                    if let Some((id, handle)) = e.full_context() {
                        TransportPollResult::RecoverableError(e.status(), id, handle)
                    } else {
                        TransportPollResult::Error(e.status())
                    }
                }
            },
            Err(err) => {
                error!("Error reading from stream {:?}", err);
                TransportPollResult::Error(StatusCode::BadConnectionClosed)
            }
        }
    }

    fn process_message(
        &mut self,
        message: TransportMessage,
        channel: &Arc<RwLock<SecureChannel>>,
    ) -> Result<Option<Request>, Error> {
        match message {
            TransportMessage::Chunk(chunk) => {
                let mut channel = trace_write_lock!(channel);
                let header = chunk.message_header(&channel.decoding_options())?;

                if header.is_final == MessageIsFinalType::FinalError {
                    // The client abandoned the message; the partial reassembly is void.
                    self.pending_chunks.clear();
                    Ok(None)
                } else {
                    let chunk = channel.verify_and_remove_security(&chunk.data)?;

                    if self.send_buffer.max_chunk_count > 0
                        && self.pending_chunks.len() == self.send_buffer.max_chunk_count
                    {
                        return Err(Error::new(
                            StatusCode::BadTcpMessageTooLarge,
                            format!(
                                "Message has more than {} chunks, exceeding negotiated limits",
                                self.send_buffer.max_chunk_count
                            ),
                        ));
                    }
                    self.pending_chunks.push(chunk);

                    if header.is_final == MessageIsFinalType::Intermediate {
                        return Ok(None);
                    }

                    let chunk_info = self.pending_chunks[0].chunk_info(&channel)?;

                    let starting_sequence_number = channel
                        .last_received_sequence_number()
                        .map(|s| s.wrapping_add(1))
                        .unwrap_or(0);
                    let last_sequence_number = Chunker::validate_chunks(
                        starting_sequence_number,
                        &channel,
                        &self.pending_chunks,
                    )?;
                    channel.reset_received_sequence_number(last_sequence_number);

                    let request = Chunker::decode(&self.pending_chunks, &channel, None)
                        .map_err(|e| e.with_request_id(chunk_info.sequence_header.request_id))?;
                    Ok(Some(Request {
                        request_id: chunk_info.sequence_header.request_id,
                        chunk_info,
                        message: request,
                    }))
                }
            }
            unexpected => Err(Error::new(
                StatusCode::BadTcpMessageTypeInvalid,
                format!("Received unexpected message: {:?}", unexpected),
            )),
        }
    }
}
