// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! The per-connection actor: drives one channel's transport, handles the channel-level
//! OPN / CLO messages against the channel manager, and dispatches everything else through
//! the service table.

use std::{sync::Arc, time::Instant};

use log::{debug, error, warn};
use tokio_util::sync::CancellationToken;

use uasc_core::{
    comms::{secure_channel::SecureChannel, security_header::SecurityHeader, tcp_types::ErrorMessage},
    sync::RwLock,
    trace_lock, trace_read_lock, RequestMessage, ResponseMessage,
};
use uasc_types::{
    OpenSecureChannelRequest, SecurityTokenRequestType, ServiceFault, StatusCode,
};

use crate::{
    channel_manager::DiagnosticEvent,
    server::ServerCore,
    services::{ServiceContext, ServiceTable},
    transport::{Request, ServerTransport, TransportPollResult},
};

enum RequestProcessResult {
    Ok,
    Close,
}

/// Master type managing a single connection.
pub(crate) struct Connection {
    transport: ServerTransport,
    channel: Arc<RwLock<SecureChannel>>,
    core: Arc<ServerCore>,
    services: Arc<ServiceTable>,
    token: CancellationToken,
    /// Protocol version from HELLO; the OPN must repeat it.
    client_protocol_version: u32,
    deadline: Instant,
}

impl Connection {
    pub fn new(
        transport: ServerTransport,
        channel: Arc<RwLock<SecureChannel>>,
        core: Arc<ServerCore>,
        services: Arc<ServiceTable>,
        token: CancellationToken,
        client_protocol_version: u32,
    ) -> Connection {
        let deadline = Instant::now()
            + std::time::Duration::from_millis(core.config.tcp_config.hello_timeout_ms);
        Connection {
            transport,
            channel,
            core,
            services,
            token,
            client_protocol_version,
            deadline,
        }
    }

    pub async fn run(mut self) {
        loop {
            // Biased so queued responses and errors drain before a detach tears the
            // connection down.
            tokio::select! {
                biased;
                r = self.transport.poll(&self.channel) => {
                    match r {
                        TransportPollResult::IncomingMessage(req) => {
                            if matches!(self.process_request(req), RequestProcessResult::Close) {
                                self.transport.set_closing();
                            }
                        }
                        TransportPollResult::RecoverableError(s, id, handle) => {
                            warn!("Non-fatal transport error: {s}, request id {id}, request handle {handle}");
                            let msg = ServiceFault::new_with_handle(handle, s).into();
                            if let Err(e) = self.transport.enqueue_message_for_send(&self.channel, msg, id) {
                                error!("Failed to send response: {e}");
                                self.fatal_error(e, "Encoding error");
                            }
                        }
                        TransportPollResult::Error(s) => {
                            error!("Fatal transport error: {s}");
                            self.fatal_error(s, "Transport error");
                        }
                        TransportPollResult::Closed => break,
                        _ => (),
                    }
                }
                // The channel manager detached us, e.g. a purge or the timeout sweep.
                _ = self.token.cancelled() => {
                    debug!("Connection detached");
                    break;
                }
                _ = tokio::time::sleep_until(self.deadline.into()) => {
                    warn!("Connection timed out, closing");
                    self.fatal_error(StatusCode::BadTimeout, "Connection timeout");
                }
            }
        }

        // Detach the channel if the manager hasn't already. A close that went through
        // CloseSecureChannel removed it before we get here, which makes this a no-op.
        trace_lock!(self.core.channel_manager).close(&self.channel, DiagnosticEvent::Abort);
        self.token.cancel();
    }

    fn fatal_error(&mut self, err: StatusCode, msg: &str) {
        if !self.transport.is_closing() {
            self.transport.enqueue_error(ErrorMessage::new(err, msg));
        }
        self.transport.set_closing();
    }

    fn process_request(&mut self, req: Request) -> RequestProcessResult {
        let id = req.request_id;
        match req.message {
            RequestMessage::OpenSecureChannel(r) => {
                self.open_secure_channel(&req.chunk_info.security_header, &r, id)
            }

            // The server does not send a CloseSecureChannel response.
            RequestMessage::CloseSecureChannel(_) => {
                debug!("CloseSecureChannel");
                trace_lock!(self.core.channel_manager)
                    .close(&self.channel, DiagnosticEvent::Close);
                RequestProcessResult::Close
            }

            message => {
                let Some(requires_session) = self.services.requires_session(&message) else {
                    return self.process_service_result(
                        Err::<ResponseMessage, _>(StatusCode::BadServiceUnsupported),
                        message.request_header().request_handle,
                        id,
                    );
                };

                let session = if requires_session {
                    match self.validate_session(&message) {
                        Ok(session) => Some(session),
                        Err(e) => {
                            return self.process_service_result(
                                Err::<ResponseMessage, _>(e),
                                message.request_header().request_handle,
                                id,
                            );
                        }
                    }
                } else {
                    None
                };

                let request_handle = message.request_header().request_handle;
                let mut context = ServiceContext {
                    channel: &self.channel,
                    session,
                };
                let result = self.services.dispatch(&mut context, message);
                self.process_service_result(result, request_handle, id)
            }
        }
    }

    fn validate_session(
        &self,
        message: &RequestMessage,
    ) -> Result<Arc<RwLock<crate::session_manager::Session>>, StatusCode> {
        let authentication_token = &message.request_header().authentication_token;
        let channel_id = trace_read_lock!(self.channel).secure_channel_id();
        let session = trace_read_lock!(self.core.session_manager)
            .find_by_token(authentication_token)
            .ok_or(StatusCode::BadSessionIdInvalid)?;
        {
            let mut locked = session.write();
            locked.validate_activated()?;
            locked.validate_secure_channel_id(channel_id)?;
            locked.validate_timed_out(Instant::now())?;
            locked.touch();
        }
        Ok(session)
    }

    fn process_service_result(
        &mut self,
        res: Result<impl Into<ResponseMessage>, StatusCode>,
        request_handle: u32,
        request_id: u32,
    ) -> RequestProcessResult {
        let message = match res {
            Ok(m) => m.into(),
            Err(e) => ServiceFault::new_with_handle(request_handle, e).into(),
        };
        if let Err(e) = self
            .transport
            .enqueue_message_for_send(&self.channel, message, request_id)
        {
            error!("Failed to send request response: {e}");
            RequestProcessResult::Close
        } else {
            RequestProcessResult::Ok
        }
    }

    fn open_secure_channel(
        &mut self,
        security_header: &SecurityHeader,
        request: &OpenSecureChannelRequest,
        request_id: u32,
    ) -> RequestProcessResult {
        if !matches!(security_header, SecurityHeader::Asymmetric(_)) {
            error!("Secure channel request message does not have asymmetric security header");
            self.fatal_error(StatusCode::BadSecurityChecksFailed, "Bad security header");
            return RequestProcessResult::Close;
        }

        // Must compare protocol version to the one from HELLO.
        if request.client_protocol_version != self.client_protocol_version {
            error!(
                "Client sent a different protocol version than it did in the HELLO - {} vs {}",
                request.client_protocol_version, self.client_protocol_version
            );
            return self.process_service_result(
                Err::<ResponseMessage, _>(StatusCode::BadProtocolVersionUnsupported),
                request.request_header.request_handle,
                request_id,
            );
        }

        // Under a crypto policy the sender certificate of the OPN must be verifiable.
        if let SecurityHeader::Asymmetric(header) = security_header {
            if !header.sender_certificate.is_null() {
                let verified = uasc_crypto::X509::from_byte_string(&header.sender_certificate)
                    .and_then(|certificate| {
                        let validator = trace_read_lock!(self.core.certificate_store).validator();
                        validator.verify(&certificate)
                    });
                if let Err(e) = verified {
                    error!("Client certificate was rejected: {e}");
                    let _ = self.process_service_result(
                        Err::<ResponseMessage, _>(e.status()),
                        request.request_header.request_handle,
                        request_id,
                    );
                    trace_lock!(self.core.channel_manager)
                        .close(&self.channel, DiagnosticEvent::Reject);
                    return RequestProcessResult::Close;
                }
            }
        }

        let result = {
            let mut manager = trace_lock!(self.core.channel_manager);
            manager.open_or_renew(&self.channel, request)
        };
        match result {
            Ok(response) => {
                let request_type = request.request_type;
                let r = self.process_service_result(
                    Ok::<ResponseMessage, StatusCode>(response.into()),
                    request.request_header.request_handle,
                    request_id,
                );
                // Timeouts count from handshake completion, so the creation timestamp is
                // reset only now that the response is serialized.
                {
                    let mut channel = self.channel.write();
                    match request_type {
                        SecurityTokenRequestType::Issue => channel.touch_token_created_at(),
                        SecurityTokenRequestType::Renew => channel.touch_next_token_created_at(),
                    }
                    // A staged renewal extends the connection deadline even before its
                    // token is taken into use.
                    self.deadline = channel
                        .next_token()
                        .map(|token| token.deadline())
                        .unwrap_or_else(|| channel.token().deadline());
                }
                r
            }
            Err(e) => {
                error!("OpenSecureChannel failed: {e}");
                let status = e.status();
                let _ = self.process_service_result(
                    Err::<ResponseMessage, _>(status),
                    request.request_header.request_handle,
                    request_id,
                );
                trace_lock!(self.core.channel_manager)
                    .close(&self.channel, DiagnosticEvent::Reject);
                RequestProcessResult::Close
            }
        }
    }
}
