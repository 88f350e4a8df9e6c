// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! The client connect engine: a staged state machine that drives a fresh connection through
//! the transport handshake, the asymmetric open secure channel exchange, endpoint discovery,
//! session creation and session activation, entirely non-blocking.
//!
//! The engine is advanced by [`Client::run_iterate`]: one call waits for a single event
//! (stream ready, inbound message, response, deadline) and performs at most one state
//! advance plus whatever transport work was ready. The host loop calls it repeatedly.

use std::{sync::Arc, time::Duration};

use futures::{future::BoxFuture, StreamExt};
use log::{debug, error, info, warn};
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::codec::FramedRead;

use uasc_core::{
    comms::{
        buffer::SendBuffer,
        secure_channel::{ChannelState, Role, SecureChannel},
        tcp_codec::{Message as TransportMessage, TcpCodec},
        tcp_types::{AcknowledgeMessage, HelloMessage, MIN_CHUNK_SIZE},
    },
    sync::RwLock,
    trace_read_lock, trace_write_lock, RequestMessage, ResponseMessage,
};
use uasc_crypto::{CertificateStore, PrivateKey, SecurityPolicy, X509, SESSION_NONCE_LENGTH};
use uasc_types::{
    ActivateSessionRequest, ApplicationDescription, ApplicationType, BinaryEncodable, ByteString,
    CloseSecureChannelRequest, CloseSessionRequest, CreateSessionRequest, DateTime,
    DecodingOptions, EndpointDescription, GetEndpointsRequest, MessageSecurityMode, NodeId,
    OpenSecureChannelRequest, OpenSecureChannelResponse, RequestHeader,
    SecurityTokenRequestType, SignatureData, StatusCode, UAString, UserTokenPolicy,
    UserTokenType, PROFILE_TRANSPORT_BINARY,
};

use crate::{
    config::ClientConfig,
    transport::{
        pending::ResponseReceiver,
        tcp::{Connector, TcpConnector, TcpTransport, TransportPollResult},
        IoStream,
    },
};

/// URI of the RSA-SHA256 signature algorithm used for the client signature.
const RSA_SHA256_URI: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";

type RawRead = FramedRead<ReadHalf<IoStream>, TcpCodec>;
type RawWrite = WriteHalf<IoStream>;

/// Invoked exactly once with the final status of a connect attempt.
pub type ConnectCallback = Box<dyn FnOnce(StatusCode) + Send>;

enum ConnectState {
    /// No connection.
    Disconnected,
    /// TCP (or the substitute stream) is being established.
    Connecting(BoxFuture<'static, Result<IoStream, StatusCode>>),
    /// HEL was written, the server's ACK is due.
    WaitingForAck { read: RawRead, write: RawWrite },
    /// OPN was written, the open secure channel response is due.
    WaitingForOpn(ResponseReceiver),
    /// The channel is open. The next advance either runs discovery or creates the session.
    SecureChannel,
    /// GetEndpoints is in flight.
    WaitingForEndpoints(ResponseReceiver),
    /// CreateSession is in flight.
    WaitingForSession(ResponseReceiver),
    /// ActivateSession is in flight.
    WaitingForActivate(ResponseReceiver),
    /// The session is active and the connection is fully usable.
    SessionActive,
}

/// The externally visible stage of the connect pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No connection.
    Disconnected,
    /// Establishing the stream.
    Connecting,
    /// Waiting for the server's ACK.
    WaitingForAck,
    /// Waiting for the open secure channel response.
    WaitingForOpn,
    /// The secure channel is open.
    SecureChannel,
    /// Waiting for the GetEndpoints response.
    WaitingForEndpoints,
    /// Waiting for the CreateSession response.
    WaitingForSession,
    /// Waiting for the ActivateSession response.
    WaitingForActivate,
    /// The session is active.
    SessionActive,
}

/// What a single [`Client::run_iterate`] call did.
#[derive(Debug)]
pub enum ClientPollResult {
    /// Nothing to do; the client is disconnected.
    Idle,
    /// The transport moved bytes or swept timeouts.
    Transport(TransportPollResult),
    /// The pipeline advanced to a new stage.
    Advanced(ClientState),
    /// The pipeline completed; the session is active.
    Connected,
    /// The connection ended with the given status.
    Disconnected(StatusCode),
}

/// The single event a [`Client::run_iterate`] call waits for. The state machine is advanced
/// by feeding the event and the current state through [`Client::handle_event`].
enum Event {
    /// No event source in the current state.
    Nothing,
    /// The connector finished.
    StreamReady(Result<IoStream, StatusCode>),
    /// A raw transport message arrived during the HELLO handshake.
    HandshakeMessage(Option<Result<TransportMessage, std::io::Error>>),
    /// The transport made progress.
    Transport(TransportPollResult),
    /// The in-flight pipeline request resolved.
    Response(Result<ResponseMessage, StatusCode>),
    /// The 75% renewal deadline passed.
    RenewalDue,
    /// The in-flight renewal resolved.
    RenewalResponse(Result<ResponseMessage, StatusCode>),
}

fn flatten_response(
    result: Result<Result<ResponseMessage, StatusCode>, tokio::sync::oneshot::error::RecvError>,
) -> Result<ResponseMessage, StatusCode> {
    // The sender is dropped only when the transport dies.
    result.unwrap_or(Err(StatusCode::BadConnectionClosed))
}

/// The session the client holds once CreateSession succeeds.
#[derive(Debug, Default)]
struct SessionState {
    authentication_token: NodeId,
    session_id: NodeId,
    revised_session_timeout: f64,
    server_nonce: ByteString,
    server_certificate: ByteString,
    client_nonce: ByteString,
}

/// The OPC UA client: owns the single client secure channel and the connect pipeline
/// driving it.
pub struct Client {
    config: ClientConfig,
    certificate_store: Arc<RwLock<CertificateStore>>,
    connector: Box<dyn Connector>,
    secure_channel: Arc<RwLock<SecureChannel>>,
    state: ConnectState,
    transport: Option<TcpTransport>,
    endpoint_url: String,
    /// The selected endpoint, preconfigured or discovered.
    endpoint: Option<EndpointDescription>,
    user_token_policy: Option<UserTokenPolicy>,
    session: SessionState,
    renewal: Option<ResponseReceiver>,
    request_handle: u32,
    on_connected: Option<ConnectCallback>,
    /// Stop the pipeline once the secure channel is open, without creating a session.
    /// Used for discovery traffic like RegisterServer.
    session_less: bool,
}

impl Client {
    /// Create a client connecting over TCP.
    pub fn new(config: ClientConfig, certificate_store: Arc<RwLock<CertificateStore>>) -> Client {
        Client::new_with_connector(config, certificate_store, Box::new(TcpConnector))
    }

    /// Create a client with a custom connector, e.g. an in-memory pipe in tests.
    pub fn new_with_connector(
        config: ClientConfig,
        certificate_store: Arc<RwLock<CertificateStore>>,
        connector: Box<dyn Connector>,
    ) -> Client {
        let endpoint = config.endpoint.clone();
        Client {
            config,
            connector,
            secure_channel: Arc::new(RwLock::new(SecureChannel::new(
                &CertificateStore::default(),
                Role::Client,
                DecodingOptions::default(),
            ))),
            certificate_store,
            state: ConnectState::Disconnected,
            transport: None,
            endpoint_url: String::new(),
            endpoint,
            user_token_policy: None,
            session: SessionState::default(),
            renewal: None,
            request_handle: 0,
            on_connected: None,
            session_less: false,
        }
    }

    /// The current pipeline stage.
    pub fn state(&self) -> ClientState {
        match &self.state {
            ConnectState::Disconnected => ClientState::Disconnected,
            ConnectState::Connecting(_) => ClientState::Connecting,
            ConnectState::WaitingForAck { .. } => ClientState::WaitingForAck,
            ConnectState::WaitingForOpn(_) => ClientState::WaitingForOpn,
            ConnectState::SecureChannel => ClientState::SecureChannel,
            ConnectState::WaitingForEndpoints(_) => ClientState::WaitingForEndpoints,
            ConnectState::WaitingForSession(_) => ClientState::WaitingForSession,
            ConnectState::WaitingForActivate(_) => ClientState::WaitingForActivate,
            ConnectState::SessionActive => ClientState::SessionActive,
        }
    }

    /// The session id assigned by the server, null until a session was created.
    pub fn session_id(&self) -> &NodeId {
        &self.session.session_id
    }

    /// The endpoint the client settled on, if one was configured or discovered.
    pub fn endpoint(&self) -> Option<&EndpointDescription> {
        self.endpoint.as_ref()
    }

    /// The id of the channel's active security token, 0 before the channel opens.
    pub fn token_id(&self) -> u32 {
        trace_read_lock!(self.secure_channel).token_id()
    }

    /// The id of the secure channel, 0 before the channel opens.
    pub fn secure_channel_id(&self) -> u32 {
        trace_read_lock!(self.secure_channel).secure_channel_id()
    }

    /// Launch the connect pipeline. Returns immediately; progress happens in
    /// [`Client::run_iterate`] and the callback fires exactly once with the final status.
    /// Calling this while a handshake is already in flight is a no-op.
    pub fn connect_async(
        &mut self,
        endpoint_url: &str,
        on_connected: impl FnOnce(StatusCode) + Send + 'static,
    ) -> StatusCode {
        self.session_less = false;
        self.connect_async_inner(endpoint_url, on_connected)
    }

    /// Launch the connect pipeline but stop once the secure channel is open, without
    /// running discovery or creating a session. The callback fires when the channel opens.
    /// Session-less service calls like GetEndpoints, FindServers and RegisterServer can be
    /// issued from that point.
    pub fn connect_async_no_session(
        &mut self,
        endpoint_url: &str,
        on_connected: impl FnOnce(StatusCode) + Send + 'static,
    ) -> StatusCode {
        self.session_less = true;
        self.connect_async_inner(endpoint_url, on_connected)
    }

    fn connect_async_inner(
        &mut self,
        endpoint_url: &str,
        on_connected: impl FnOnce(StatusCode) + Send + 'static,
    ) -> StatusCode {
        if !matches!(self.state, ConnectState::Disconnected) {
            return StatusCode::Good;
        }

        let security_policy = self.config.security_policy();
        if security_policy == SecurityPolicy::Unknown {
            on_connected(StatusCode::BadSecurityPolicyRejected);
            return StatusCode::BadSecurityPolicyRejected;
        }
        // An unset mode falls back to None, like an unset policy.
        let security_mode = match self.config.security_mode() {
            MessageSecurityMode::Invalid => MessageSecurityMode::None,
            mode => mode,
        };

        // A fresh channel per attempt; the state of a channel only ever advances.
        {
            let certificate_store = trace_read_lock!(self.certificate_store);
            let mut channel = SecureChannel::new(
                &certificate_store,
                Role::Client,
                DecodingOptions::default(),
            );
            channel.set_security_policy(security_policy);
            channel.set_security_mode(security_mode);
            if let Some(ref endpoint) = self.endpoint {
                if let Err(e) =
                    channel.set_remote_cert_from_byte_string(&endpoint.server_certificate)
                {
                    let status = e.status();
                    on_connected(status);
                    return status;
                }
            }
            channel.create_random_nonce();
            *trace_write_lock!(self.secure_channel) = channel;
        }

        self.endpoint_url = endpoint_url.to_string();
        self.session = SessionState::default();
        self.request_handle = 0;
        self.renewal = None;
        self.on_connected = Some(Box::new(on_connected));
        self.state = ConnectState::Connecting(self.connector.connect(endpoint_url));
        debug!("Connect pipeline launched for {endpoint_url}");
        StatusCode::Good
    }

    /// Advance the pipeline: wait for the next event for the current state, then perform
    /// at most one state transition. The host loop calls this repeatedly.
    pub async fn run_iterate(&mut self) -> ClientPollResult {
        let event = self.next_event().await;
        self.handle_event(event).await
    }

    /// Wait for the single event the current state cares about. Only borrows the state and
    /// the transport; all mutation happens in [`Client::handle_event`].
    async fn next_event(&mut self) -> Event {
        match &mut self.state {
            ConnectState::Disconnected | ConnectState::SecureChannel => Event::Nothing,
            ConnectState::Connecting(fut) => Event::StreamReady(fut.as_mut().await),
            ConnectState::WaitingForAck { read, .. } => Event::HandshakeMessage(read.next().await),
            ConnectState::WaitingForOpn(recv)
            | ConnectState::WaitingForEndpoints(recv)
            | ConnectState::WaitingForSession(recv)
            | ConnectState::WaitingForActivate(recv) => {
                let transport = self
                    .transport
                    .as_mut()
                    .expect("transport exists while a request is in flight");
                tokio::select! {
                    r = &mut *recv => Event::Response(flatten_response(r)),
                    r = transport.poll() => Event::Transport(r),
                }
            }
            ConnectState::SessionActive => {
                let transport = self
                    .transport
                    .as_mut()
                    .expect("transport exists while the session is active");
                if let Some(renewal) = self.renewal.as_mut() {
                    tokio::select! {
                        r = &mut *renewal => Event::RenewalResponse(flatten_response(r)),
                        r = transport.poll() => Event::Transport(r),
                    }
                } else {
                    let renewal_deadline = {
                        let channel = trace_read_lock!(self.secure_channel);
                        channel.next_renewal_deadline()
                    };
                    tokio::select! {
                        _ = tokio::time::sleep_until(renewal_deadline.into()) => Event::RenewalDue,
                        r = transport.poll() => Event::Transport(r),
                    }
                }
            }
        }
    }

    /// The transition function: `(state, event) -> (state', actions)`.
    async fn handle_event(&mut self, event: Event) -> ClientPollResult {
        match event {
            Event::Nothing => match self.state {
                ConnectState::Disconnected => ClientPollResult::Idle,
                // The channel is open; fire the next pipeline request.
                ConnectState::SecureChannel => {
                    if self.session_less {
                        // The pipeline stops here; the host issues raw service calls.
                        return match self.on_connected.take() {
                            Some(callback) => {
                                callback(StatusCode::Good);
                                ClientPollResult::Connected
                            }
                            None => match self.transport.as_mut() {
                                Some(transport) => {
                                    let r = transport.poll().await;
                                    if let TransportPollResult::Closed(status) = r {
                                        warn!("Transport closed: {status}");
                                        return self.fail(status).await;
                                    }
                                    ClientPollResult::Transport(r)
                                }
                                None => ClientPollResult::Idle,
                            },
                        };
                    }
                    let next = if self.endpoint.is_none() {
                        self.request_endpoints()
                            .map(|recv| (ConnectState::WaitingForEndpoints(recv), ClientState::WaitingForEndpoints))
                    } else {
                        self.request_session()
                            .map(|recv| (ConnectState::WaitingForSession(recv), ClientState::WaitingForSession))
                    };
                    match next {
                        Ok((state, visible)) => {
                            self.state = state;
                            ClientPollResult::Advanced(visible)
                        }
                        Err(status) => self.fail(status).await,
                    }
                }
                _ => ClientPollResult::Idle,
            },
            Event::StreamReady(Ok(stream)) => match self.send_hello(stream).await {
                Ok(()) => ClientPollResult::Advanced(ClientState::WaitingForAck),
                Err(status) => self.fail(status).await,
            },
            Event::StreamReady(Err(status)) => self.fail(status).await,
            Event::HandshakeMessage(message) => match message {
                Some(Ok(TransportMessage::Acknowledge(ack))) => match self.process_ack(ack) {
                    Ok(()) => ClientPollResult::Advanced(ClientState::WaitingForOpn),
                    Err(status) => self.fail(status).await,
                },
                Some(Ok(TransportMessage::Error(e))) => {
                    error!("Server rejected HEL, error {}, reason {}", e.error, e.reason);
                    self.fail(e.error).await
                }
                Some(Ok(other)) => {
                    error!("Expected ACK, got {:?}", other);
                    self.fail(StatusCode::BadConnectionClosed).await
                }
                Some(Err(e)) => {
                    error!("Error reading ACK: {e}");
                    self.fail(StatusCode::BadCommunicationError).await
                }
                None => self.fail(StatusCode::BadConnectionClosed).await,
            },
            Event::Transport(result) => {
                if let TransportPollResult::Closed(status) = result {
                    warn!("Transport closed: {status}");
                    return self.fail(status).await;
                }
                ClientPollResult::Transport(result)
            }
            Event::Response(result) => match self.state {
                ConnectState::WaitingForOpn(_) => self.on_open_response(result).await,
                ConnectState::WaitingForEndpoints(_) => self.on_endpoints_response(result).await,
                ConnectState::WaitingForSession(_) => self.on_session_response(result).await,
                ConnectState::WaitingForActivate(_) => self.on_activate_response(result).await,
                _ => self.fail(StatusCode::BadInvalidState).await,
            },
            Event::RenewalDue => match self.begin_renew_secure_channel() {
                Ok(recv) => {
                    debug!("Channel renewal initiated");
                    self.renewal = Some(recv);
                    ClientPollResult::Advanced(ClientState::SessionActive)
                }
                Err(status) => self.fail(status).await,
            },
            Event::RenewalResponse(result) => {
                self.renewal = None;
                match expect_open_response(result) {
                    Ok(response) => {
                        let renewed = {
                            let mut channel = trace_write_lock!(self.secure_channel);
                            end_issue_or_renew(&mut channel, &response)
                                .map(|_| channel.token_id())
                        };
                        match renewed {
                            Ok(token_id) => {
                                info!("Secure channel renewed, token id {token_id}");
                                ClientPollResult::Advanced(ClientState::SessionActive)
                            }
                            Err(status) => self.fail(status).await,
                        }
                    }
                    Err(status) => self.fail(status).await,
                }
            }
        }
    }

    async fn on_open_response(
        &mut self,
        result: Result<ResponseMessage, StatusCode>,
    ) -> ClientPollResult {
        match expect_open_response(result) {
            Ok(response) => {
                let opened = {
                    let mut channel = trace_write_lock!(self.secure_channel);
                    end_issue_or_renew(&mut channel, &response)
                        .map(|_| (channel.secure_channel_id(), channel.token_id()))
                };
                match opened {
                    Ok((channel_id, token_id)) => {
                        info!("Secure channel opened, channel id {channel_id}, token id {token_id}");
                        self.state = ConnectState::SecureChannel;
                        ClientPollResult::Advanced(ClientState::SecureChannel)
                    }
                    Err(status) => self.fail(status).await,
                }
            }
            Err(status) => self.fail(status).await,
        }
    }

    async fn on_endpoints_response(
        &mut self,
        result: Result<ResponseMessage, StatusCode>,
    ) -> ClientPollResult {
        let response = match result {
            Ok(ResponseMessage::GetEndpoints(response)) => response,
            Ok(other) => {
                error!("Expected a GetEndpoints response, got {}", other.type_name());
                return self.fail(StatusCode::BadUnknownResponse).await;
            }
            Err(status) => return self.fail(status).await,
        };
        let service_result = response.response_header.service_result;
        if service_result.is_bad() {
            error!("GetEndpoints failed with {service_result}");
            return self.fail(service_result).await;
        }
        let endpoints = response.endpoints.unwrap_or_default();
        match filter_endpoints(
            &endpoints,
            &self.config.security_policy_uri,
            self.config.user_identity_token.token_type(),
        ) {
            Ok((endpoint, token_policy)) => {
                debug!("Selected endpoint {}", endpoint.endpoint_url);
                self.endpoint = Some(endpoint);
                self.user_token_policy = Some(token_policy);
                self.state = ConnectState::SecureChannel;
                ClientPollResult::Advanced(ClientState::SecureChannel)
            }
            Err(status) => self.fail(status).await,
        }
    }

    async fn on_session_response(
        &mut self,
        result: Result<ResponseMessage, StatusCode>,
    ) -> ClientPollResult {
        let response = match result {
            Ok(ResponseMessage::CreateSession(response)) => response,
            Ok(other) => {
                error!("Expected a CreateSession response, got {}", other.type_name());
                return self.fail(StatusCode::BadUnknownResponse).await;
            }
            Err(status) => return self.fail(status).await,
        };
        let service_result = response.response_header.service_result;
        if service_result.is_bad() {
            error!("CreateSession failed with {service_result}");
            return self.fail(service_result).await;
        }
        self.session.authentication_token = response.authentication_token.clone();
        self.session.session_id = response.session_id.clone();
        self.session.revised_session_timeout = response.revised_session_timeout;
        self.session.server_nonce = response.server_nonce.clone();
        self.session.server_certificate = response.server_certificate.clone();
        debug!("Session created, id {}", self.session.session_id);

        match self.request_activate_session() {
            Ok(recv) => {
                self.state = ConnectState::WaitingForActivate(recv);
                ClientPollResult::Advanced(ClientState::WaitingForActivate)
            }
            Err(status) => self.fail(status).await,
        }
    }

    async fn on_activate_response(
        &mut self,
        result: Result<ResponseMessage, StatusCode>,
    ) -> ClientPollResult {
        let response = match result {
            Ok(ResponseMessage::ActivateSession(response)) => response,
            Ok(other) => {
                error!("Expected an ActivateSession response, got {}", other.type_name());
                return self.fail(StatusCode::BadUnknownResponse).await;
            }
            Err(status) => return self.fail(status).await,
        };
        let service_result = response.response_header.service_result;
        if service_result.is_bad() {
            error!("ActivateSession failed with {service_result}");
            return self.fail(service_result).await;
        }
        self.session.server_nonce = response.server_nonce.clone();
        info!("Session is active, id {}", self.session.session_id);
        self.state = ConnectState::SessionActive;
        if let Some(callback) = self.on_connected.take() {
            callback(StatusCode::Good);
        }
        ClientPollResult::Connected
    }

    /// Initiate orderly teardown: close the session if one is active, close the secure
    /// channel, and drop the transport. Outstanding calls complete with `BadShutdown`.
    pub async fn disconnect_async(&mut self) {
        if matches!(self.state, ConnectState::SessionActive) {
            let close_session: RequestMessage = CloseSessionRequest {
                request_header: self.make_request_header(),
                delete_subscriptions: true,
            }
            .into();
            let close_channel: RequestMessage = CloseSecureChannelRequest {
                request_header: self.make_request_header(),
            }
            .into();
            if let Some(transport) = self.transport.as_mut() {
                let _ = transport.send_request_no_response(close_session);
                let _ = transport.send_request_no_response(close_channel);
                if let Err(e) = transport.flush_outgoing().await {
                    warn!("Failed to flush close messages: {e}");
                }
            }
        }
        {
            let mut channel = trace_write_lock!(self.secure_channel);
            channel.set_state(ChannelState::Closing);
        }
        let _ = self.fail(StatusCode::BadShutdown).await;
    }

    /// Issue a service call on the open channel. Valid from the moment the secure channel
    /// opens; session-bound services need the pipeline to have completed.
    pub fn send_request(
        &mut self,
        request: impl Into<RequestMessage>,
    ) -> Result<ResponseReceiver, StatusCode> {
        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let Some(transport) = self.transport.as_mut() else {
            return Err(StatusCode::BadServerNotConnected);
        };
        transport.send_request(request.into(), timeout)
    }

    /// A request header carrying the session authentication token and the next request
    /// handle.
    pub fn make_request_header(&mut self) -> RequestHeader {
        self.request_handle += 1;
        RequestHeader {
            authentication_token: self.session.authentication_token.clone(),
            timestamp: DateTime::now(),
            request_handle: self.request_handle,
            timeout_hint: self.config.request_timeout_ms.min(u32::MAX as u64) as u32,
            ..Default::default()
        }
    }

    /// Tear everything down and report the final status. The connect callback, if it has
    /// not fired yet, fires now.
    async fn fail(&mut self, status: StatusCode) -> ClientPollResult {
        if let Some(mut transport) = self.transport.take() {
            transport.close(StatusCode::BadShutdown).await;
        }
        {
            let mut channel = trace_write_lock!(self.secure_channel);
            channel.set_state(ChannelState::Closed);
        }
        self.state = ConnectState::Disconnected;
        self.renewal = None;
        if let Some(callback) = self.on_connected.take() {
            callback(status);
        }
        ClientPollResult::Disconnected(status)
    }

    /// Encode and write the HEL message, then move to waiting for the ACK.
    async fn send_hello(&mut self, stream: IoStream) -> Result<(), StatusCode> {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let read = FramedRead::new(read_half, TcpCodec::new(DecodingOptions::minimal()));

        let connection = &self.config.connection;
        let hello = HelloMessage::new(
            &self.endpoint_url,
            connection.send_buffer_size,
            connection.recv_buffer_size,
            connection.max_message_size,
            connection.max_chunk_count,
        );
        write_half
            .write_all(&hello.encode_to_vec())
            .await
            .map_err(|err| {
                error!("Cannot send hello to server, err = {err}");
                StatusCode::BadCommunicationError
            })?;
        debug!("Sent HEL message");

        self.state = ConnectState::WaitingForAck {
            read,
            write: write_half,
        };
        Ok(())
    }

    /// Validate the ACK, record the negotiated limits, build the transport and send
    /// OPN(Issue).
    fn process_ack(&mut self, ack: AcknowledgeMessage) -> Result<(), StatusCode> {
        let connection = self.config.connection.clone();

        // The server's revised sizes must not exceed what we offered, and must meet the
        // spec minimum.
        if (ack.send_buffer_size as usize) > connection.recv_buffer_size
            || (ack.receive_buffer_size as usize) > connection.send_buffer_size
            || (ack.send_buffer_size as usize) < MIN_CHUNK_SIZE
            || (ack.receive_buffer_size as usize) < MIN_CHUNK_SIZE
        {
            error!(
                "ACK revised buffer sizes are invalid: send {} receive {}",
                ack.send_buffer_size, ack.receive_buffer_size
            );
            return Err(StatusCode::BadTcpInternalError);
        }
        debug!("Received ACK: {ack:?}");

        let ConnectState::WaitingForAck { mut read, write } =
            std::mem::replace(&mut self.state, ConnectState::Disconnected)
        else {
            return Err(StatusCode::BadInvalidState);
        };

        let mut send_buffer = SendBuffer::new(
            connection.send_buffer_size,
            connection.max_message_size,
            connection.max_chunk_count,
        );
        send_buffer.revise(
            ack.receive_buffer_size as usize,
            ack.max_message_size as usize,
            ack.max_chunk_count as usize,
        );

        // The negotiated limits now bound inbound decoding too.
        let decoding_options = DecodingOptions {
            max_message_size: send_buffer.max_message_size,
            max_chunk_count: send_buffer.max_chunk_count,
            ..DecodingOptions::default()
        };
        *read.decoder_mut() = TcpCodec::new(decoding_options.clone());
        {
            let mut channel = trace_write_lock!(self.secure_channel);
            channel.set_decoding_options(decoding_options);
        }

        let mut transport = TcpTransport::new(
            read,
            write,
            send_buffer,
            self.secure_channel.clone(),
            self.config.max_inflight_requests,
        );

        // Send the OPN straight away.
        let request = self.begin_issue_or_renew(SecurityTokenRequestType::Issue);
        let recv = transport
            .send_request(request, Duration::from_millis(self.config.request_timeout_ms))?;
        {
            let mut channel = trace_write_lock!(self.secure_channel);
            channel.set_state(ChannelState::Opening);
        }
        self.transport = Some(transport);
        self.state = ConnectState::WaitingForOpn(recv);
        Ok(())
    }

    fn begin_issue_or_renew(&mut self, request_type: SecurityTokenRequestType) -> RequestMessage {
        let (security_mode, client_nonce) = {
            let mut channel = trace_write_lock!(self.secure_channel);
            channel.create_random_nonce();
            (channel.security_mode(), channel.local_nonce_as_byte_string())
        };
        debug!("Requesting to open a secure channel, {request_type:?}");
        OpenSecureChannelRequest {
            request_header: self.make_request_header(),
            client_protocol_version: 0,
            request_type,
            security_mode,
            client_nonce,
            requested_lifetime: self.config.secure_channel_lifetime_ms,
        }
        .into()
    }

    fn begin_renew_secure_channel(&mut self) -> Result<ResponseReceiver, StatusCode> {
        let request = self.begin_issue_or_renew(SecurityTokenRequestType::Renew);
        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let transport = self
            .transport
            .as_mut()
            .ok_or(StatusCode::BadServerNotConnected)?;
        transport.send_request(request, timeout)
    }

    fn request_endpoints(&mut self) -> Result<ResponseReceiver, StatusCode> {
        let request: RequestMessage = GetEndpointsRequest {
            request_header: self.make_request_header(),
            endpoint_url: UAString::from(self.endpoint_url.as_str()),
            locale_ids: None,
            profile_uris: None,
        }
        .into();
        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let transport = self
            .transport
            .as_mut()
            .ok_or(StatusCode::BadServerNotConnected)?;
        transport.send_request(request, timeout)
    }

    fn request_session(&mut self) -> Result<ResponseReceiver, StatusCode> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or(StatusCode::BadInvalidState)?
            .clone();

        // The session nonce is always exactly 32 bytes, and only sent under a real
        // security mode.
        let security_mode = {
            let channel = trace_read_lock!(self.secure_channel);
            channel.security_mode()
        };
        self.session.client_nonce = if security_mode != MessageSecurityMode::None {
            uasc_crypto::random::byte_string(SESSION_NONCE_LENGTH)
        } else {
            ByteString::null()
        };

        let client_certificate = {
            let store = trace_read_lock!(self.certificate_store);
            store
                .read_own_cert()
                .map(|cert| cert.as_byte_string())
                .unwrap_or_else(|_| ByteString::null())
        };

        let request_header = self.make_request_header();
        let request: RequestMessage = CreateSessionRequest {
            request_header,
            client_description: ApplicationDescription {
                application_uri: UAString::from(self.config.application_uri.as_str()),
                product_uri: UAString::from(self.config.product_uri.as_str()),
                application_name: UAString::from(self.config.application_name.as_str()),
                application_type: ApplicationType::Client,
                ..Default::default()
            },
            server_uri: UAString::null(),
            endpoint_url: endpoint.endpoint_url.clone(),
            session_name: UAString::from(self.config.session_name.as_str()),
            client_nonce: self.session.client_nonce.clone(),
            client_certificate,
            requested_session_timeout: self.config.requested_session_timeout_ms as f64,
            max_response_message_size: 0,
        }
        .into();
        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let transport = self
            .transport
            .as_mut()
            .ok_or(StatusCode::BadServerNotConnected)?;
        transport.send_request(request, timeout)
    }

    fn request_activate_session(&mut self) -> Result<ResponseReceiver, StatusCode> {
        let (security_policy, security_mode) = {
            let channel = trace_read_lock!(self.secure_channel);
            (channel.security_policy(), channel.security_mode())
        };

        // The user token policy was selected during discovery, or is looked up in the
        // preconfigured endpoint now. An anonymous identity against an endpoint that lists
        // no token policies gets an empty policy id.
        let token_type = self.config.user_identity_token.token_type();
        let token_policy = match self.user_token_policy.clone() {
            Some(policy) => policy,
            None => {
                let endpoint = self.endpoint.as_ref().ok_or(StatusCode::BadInvalidState)?;
                match select_user_token_policy(endpoint, token_type) {
                    Some(policy) => policy,
                    None if token_type == UserTokenType::Anonymous => UserTokenPolicy::default(),
                    None => {
                        error!("The endpoint offers no user token policy for {token_type}");
                        return Err(StatusCode::BadIdentityTokenRejected);
                    }
                }
            }
        };

        let server_certificate = if self.session.server_certificate.is_null() {
            None
        } else {
            Some(
                X509::from_byte_string(&self.session.server_certificate)
                    .map_err(|e| e.status())?,
            )
        };

        let user_identity_token = self
            .config
            .user_identity_token
            .make_user_identity_token(
                &token_policy,
                security_policy,
                server_certificate.as_ref(),
                self.session.server_nonce.as_ref(),
            )
            .map_err(|e| e.status())?;

        // The client signature covers the server certificate and the server nonce, and is
        // only produced under a real security mode.
        let client_signature = if security_mode != MessageSecurityMode::None {
            let private_key = {
                let store = trace_read_lock!(self.certificate_store);
                store.read_own_pkey().map_err(|e| e.status())?
            };
            make_signature(
                security_policy,
                &private_key,
                &self.session.server_certificate,
                &self.session.server_nonce,
            )
            .map_err(|e| e.status())?
        } else {
            SignatureData::default()
        };

        let request: RequestMessage = ActivateSessionRequest {
            request_header: self.make_request_header(),
            client_signature,
            client_software_certificates: None,
            locale_ids: None,
            user_identity_token,
            user_token_signature: SignatureData::default(),
        }
        .into();
        let timeout = Duration::from_millis(self.config.request_timeout_ms);
        let transport = self
            .transport
            .as_mut()
            .ok_or(StatusCode::BadServerNotConnected)?;
        transport.send_request(request, timeout)
    }
}

fn end_issue_or_renew(
    channel: &mut SecureChannel,
    response: &OpenSecureChannelResponse,
) -> Result<(), StatusCode> {
    channel.set_security_token_from_wire(&response.security_token);
    if channel.security_policy() != SecurityPolicy::None
        && (channel.security_mode() == MessageSecurityMode::Sign
            || channel.security_mode() == MessageSecurityMode::SignAndEncrypt)
    {
        channel
            .set_remote_nonce_from_byte_string(&response.server_nonce)
            .map_err(|e| e.status())?;
        channel.derive_keys();
    }
    channel.set_state(ChannelState::Open);
    Ok(())
}

fn expect_open_response(
    result: Result<ResponseMessage, StatusCode>,
) -> Result<Box<OpenSecureChannelResponse>, StatusCode> {
    match result? {
        ResponseMessage::OpenSecureChannel(response) => {
            let service_result = response.response_header.service_result;
            if service_result.is_bad() {
                error!("OpenSecureChannel was rejected with {service_result}");
                Err(service_result)
            } else {
                Ok(response)
            }
        }
        ResponseMessage::ServiceFault(fault) => {
            let service_result = fault.response_header.service_result;
            error!("OpenSecureChannel failed with service fault {service_result}");
            Err(service_result)
        }
        other => {
            error!(
                "Expected an OpenSecureChannel response, got {}",
                other.type_name()
            );
            Err(StatusCode::BadUnknownResponse)
        }
    }
}

/// Sign the concatenation of the server certificate and server nonce, the client signature
/// carried by ActivateSession.
pub(crate) fn make_signature(
    security_policy: SecurityPolicy,
    private_key: &PrivateKey,
    server_certificate: &ByteString,
    server_nonce: &ByteString,
) -> Result<SignatureData, uasc_types::Error> {
    use uasc_crypto::KeySize;

    let mut data = Vec::with_capacity(server_certificate.len() + server_nonce.len());
    data.extend_from_slice(server_certificate.as_ref());
    data.extend_from_slice(server_nonce.as_ref());
    let mut signature = vec![0u8; private_key.size()];
    security_policy.asymmetric_sign(private_key, &data, &mut signature)?;
    Ok(SignatureData {
        algorithm: UAString::from(RSA_SHA256_URI),
        signature: ByteString::from(signature),
    })
}

/// Pick the user token policy matching the configured identity from an endpoint.
pub(crate) fn select_user_token_policy(
    endpoint: &EndpointDescription,
    token_type: UserTokenType,
) -> Option<UserTokenPolicy> {
    endpoint
        .user_identity_tokens
        .as_ref()?
        .iter()
        .find(|policy| policy.token_type == token_type)
        .cloned()
}

/// Filter a GetEndpoints response down to the first endpoint matching the client's
/// transport profile, security policy and identity token kind.
///
/// Endpoints with an empty transport profile are accepted as binary; some servers return
/// an empty profile.
pub(crate) fn filter_endpoints(
    endpoints: &[EndpointDescription],
    security_policy_uri: &str,
    token_type: UserTokenType,
) -> Result<(EndpointDescription, UserTokenPolicy), StatusCode> {
    let mut endpoint_found = false;
    for endpoint in endpoints {
        if !endpoint.transport_profile_uri.is_empty()
            && endpoint.transport_profile_uri.as_ref() != PROFILE_TRANSPORT_BINARY
        {
            continue;
        }
        if endpoint.security_policy_uri.as_ref() != security_policy_uri {
            continue;
        }
        endpoint_found = true;

        let Some(token_policies) = endpoint.user_identity_tokens.as_ref() else {
            continue;
        };
        for token_policy in token_policies {
            // User tokens carry their own security policy; only unsecured token policies
            // are taken, matching what the channel can carry without a separate handshake.
            if !token_policy.security_policy_uri.is_empty()
                && token_policy.security_policy_uri.as_ref() != SecurityPolicy::None.to_uri()
            {
                continue;
            }
            if token_policy.token_type != token_type {
                continue;
            }
            return Ok((endpoint.clone(), token_policy.clone()));
        }
    }
    if !endpoint_found {
        error!("No suitable endpoint found");
    } else {
        error!("No suitable user token policy found for the possible endpoints");
    }
    Err(StatusCode::BadInternalError)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(
        policy_uri: &str,
        profile: &str,
        tokens: Vec<UserTokenPolicy>,
    ) -> EndpointDescription {
        EndpointDescription {
            endpoint_url: UAString::from("opc.tcp://localhost:4840"),
            security_policy_uri: UAString::from(policy_uri),
            transport_profile_uri: UAString::from(profile),
            user_identity_tokens: Some(tokens),
            ..Default::default()
        }
    }

    fn anonymous_policy() -> UserTokenPolicy {
        UserTokenPolicy {
            policy_id: UAString::from("anon"),
            token_type: UserTokenType::Anonymous,
            ..Default::default()
        }
    }

    #[test]
    fn filter_picks_first_match() {
        let none_uri = SecurityPolicy::None.to_uri();
        let endpoints = vec![
            endpoint("http://other/policy", "", vec![anonymous_policy()]),
            endpoint(none_uri, "", vec![anonymous_policy()]),
            endpoint(none_uri, "", vec![anonymous_policy()]),
        ];
        let (endpoint, policy) =
            filter_endpoints(&endpoints, none_uri, UserTokenType::Anonymous).unwrap();
        assert_eq!(endpoint.security_policy_uri.as_ref(), none_uri);
        assert_eq!(policy.policy_id, UAString::from("anon"));
    }

    #[test]
    fn filter_accepts_empty_profile_and_rejects_foreign() {
        let none_uri = SecurityPolicy::None.to_uri();
        let endpoints = vec![endpoint(
            none_uri,
            "http://opcfoundation.org/UA-Profile/Transport/soap",
            vec![anonymous_policy()],
        )];
        assert_eq!(
            filter_endpoints(&endpoints, none_uri, UserTokenType::Anonymous).unwrap_err(),
            StatusCode::BadInternalError
        );

        let endpoints = vec![endpoint(none_uri, "", vec![anonymous_policy()])];
        assert!(filter_endpoints(&endpoints, none_uri, UserTokenType::Anonymous).is_ok());

        let endpoints = vec![endpoint(
            none_uri,
            PROFILE_TRANSPORT_BINARY,
            vec![anonymous_policy()],
        )];
        assert!(filter_endpoints(&endpoints, none_uri, UserTokenType::Anonymous).is_ok());
    }

    #[test]
    fn filter_requires_matching_token_type() {
        let none_uri = SecurityPolicy::None.to_uri();
        let endpoints = vec![endpoint(
            none_uri,
            "",
            vec![UserTokenPolicy {
                policy_id: UAString::from("user_pass"),
                token_type: UserTokenType::UserName,
                ..Default::default()
            }],
        )];
        // Anonymous is configured but only user name is offered.
        assert_eq!(
            filter_endpoints(&endpoints, none_uri, UserTokenType::Anonymous).unwrap_err(),
            StatusCode::BadInternalError
        );
        assert!(filter_endpoints(&endpoints, none_uri, UserTokenType::UserName).is_ok());
    }

    #[test]
    fn filter_rejects_secured_token_policies() {
        let none_uri = SecurityPolicy::None.to_uri();
        let endpoints = vec![endpoint(
            none_uri,
            "",
            vec![UserTokenPolicy {
                policy_id: UAString::from("anon"),
                token_type: UserTokenType::Anonymous,
                security_policy_uri: UAString::from(
                    "http://opcfoundation.org/UA/SecurityPolicy#Basic256Sha256",
                ),
                ..Default::default()
            }],
        )];
        assert_eq!(
            filter_endpoints(&endpoints, none_uri, UserTokenType::Anonymous).unwrap_err(),
            StatusCode::BadInternalError
        );
    }

    #[test]
    fn signature_covers_cert_and_nonce() {
        let key = PrivateKey::new(2048).unwrap();
        let cert = X509::self_signed(&key, "server", 1).unwrap();
        let cert_bytes = cert.as_byte_string();
        let nonce = ByteString::from(vec![3u8; 32]);

        let signature =
            make_signature(SecurityPolicy::Basic256Sha256, &key, &cert_bytes, &nonce).unwrap();
        assert_eq!(signature.algorithm.as_ref(), RSA_SHA256_URI);

        let mut signed = Vec::new();
        signed.extend_from_slice(cert_bytes.as_ref());
        signed.extend_from_slice(nonce.as_ref());
        SecurityPolicy::Basic256Sha256
            .asymmetric_verify_signature(&key.public_key(), &signed, signature.signature.as_ref())
            .unwrap();
    }
}
