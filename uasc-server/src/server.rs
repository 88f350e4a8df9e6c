// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! The server: owns the channel manager, the session manager, the service table and the
//! accept loop, and drives the periodic sweeps.

use std::{sync::Arc, time::Instant};

use hashbrown::HashMap;
use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use uasc_core::{
    comms::secure_channel::{Role, SecureChannel},
    sync::{Mutex, RwLock},
    trace_lock, trace_read_lock, trace_write_lock, RequestMessage, ResponseMessage,
};
use uasc_crypto::{CertificateStore, SecurityPolicy};
use uasc_types::{
    ApplicationDescription, ApplicationType, DecodingOptions, EndpointDescription, Error,
    FindServersResponse, GetEndpointsResponse, ObjectId, RegisterServerResponse,
    RegisteredServer, ResponseHeader, StatusCode, UAString, UserTokenPolicy, UserTokenType,
    PROFILE_TRANSPORT_BINARY,
};

use crate::{
    async_calls::AsyncCallManager,
    channel_manager::{ChannelManager, TransportHandle},
    config::ServerConfig,
    connection::Connection,
    discovery,
    services::{ServiceContext, ServiceTable},
    session_manager::SessionManager,
    transport::{Connector, IoStream, TransportConfig},
};

/// The server's shared state, handed to connection actors and service handlers.
pub struct ServerCore {
    /// The server configuration, read-only at runtime.
    pub config: ServerConfig,
    /// Certificate and key material.
    pub certificate_store: Arc<RwLock<CertificateStore>>,
    /// The channel registry. The mutex is the single-writer service mutex of the server.
    pub channel_manager: Arc<Mutex<ChannelManager>>,
    /// The session registry.
    pub session_manager: Arc<RwLock<SessionManager>>,
    /// Bookkeeping for worker pool results.
    pub async_calls: Arc<Mutex<AsyncCallManager>>,
    /// Servers registered with us through RegisterServer, keyed by their application URI.
    pub registered_servers: Arc<RwLock<HashMap<String, RegisteredServer>>>,
}

impl ServerCore {
    /// The description of this server, as it appears in endpoints and FindServers.
    pub fn application_description(&self) -> ApplicationDescription {
        ApplicationDescription {
            application_uri: UAString::from(self.config.application_uri.as_str()),
            product_uri: UAString::from(self.config.product_uri.as_str()),
            application_name: UAString::from(self.config.application_name.as_str()),
            application_type: ApplicationType::Server,
            gateway_server_uri: UAString::null(),
            discovery_profile_uri: UAString::null(),
            discovery_urls: Some(vec![UAString::from(
                self.config.base_endpoint_url().as_str(),
            )]),
        }
    }

    /// The endpoints the server advertises, filtered by the requested transport profiles.
    /// An empty filter accepts everything; all our endpoints speak the binary profile.
    pub fn endpoints(&self, profile_uris: &Option<Vec<UAString>>) -> Vec<EndpointDescription> {
        if let Some(profile_uris) = profile_uris {
            if !profile_uris.is_empty()
                && !profile_uris
                    .iter()
                    .any(|uri| uri.as_ref() == PROFILE_TRANSPORT_BINARY)
            {
                return Vec::new();
            }
        }

        let server_certificate = {
            let store = trace_read_lock!(self.certificate_store);
            store
                .read_own_cert()
                .map(|cert| cert.as_byte_string())
                .unwrap_or_else(|_| uasc_types::ByteString::null())
        };
        let server = self.application_description();
        let base_url = self.config.base_endpoint_url();

        self.config
            .endpoints
            .iter()
            .map(|endpoint| {
                let mut user_identity_tokens = Vec::new();
                if endpoint.anonymous {
                    user_identity_tokens.push(UserTokenPolicy {
                        policy_id: UAString::from("anonymous"),
                        token_type: UserTokenType::Anonymous,
                        ..Default::default()
                    });
                }
                if endpoint.user_name {
                    user_identity_tokens.push(UserTokenPolicy {
                        policy_id: UAString::from("user_pass"),
                        token_type: UserTokenType::UserName,
                        ..Default::default()
                    });
                }
                let security_mode = endpoint.security_mode();
                EndpointDescription {
                    endpoint_url: UAString::from(
                        format!("{}{}", base_url, endpoint.path).as_str(),
                    ),
                    server: server.clone(),
                    server_certificate: server_certificate.clone(),
                    security_mode,
                    security_policy_uri: UAString::from(endpoint.security_policy_uri.as_str()),
                    user_identity_tokens: Some(user_identity_tokens),
                    transport_profile_uri: UAString::from(PROFILE_TRANSPORT_BINARY),
                    security_level: match security_mode {
                        uasc_types::MessageSecurityMode::SignAndEncrypt => 3,
                        uasc_types::MessageSecurityMode::Sign => 2,
                        _ => 0,
                    },
                }
            })
            .collect()
    }

    /// This server as a discovery registration record.
    pub fn registered_server(&self, is_online: bool) -> RegisteredServer {
        RegisteredServer {
            server_uri: UAString::from(self.config.application_uri.as_str()),
            product_uri: UAString::from(self.config.product_uri.as_str()),
            server_names: Some(vec![UAString::from(self.config.application_name.as_str())]),
            server_type: ApplicationType::Server,
            gateway_server_uri: UAString::null(),
            discovery_urls: Some(vec![UAString::from(
                self.config.base_endpoint_url().as_str(),
            )]),
            semaphore_file_path: UAString::null(),
            is_online,
        }
    }
}

/// The OPC UA server runtime.
pub struct Server {
    core: Arc<ServerCore>,
    services: Arc<ServiceTable>,
    token: CancellationToken,
}

impl Server {
    /// Create a server from its configuration. When any endpoint uses a crypto policy a
    /// self-signed application certificate is generated; provisioned deployments use
    /// [`Server::new_with_certificate_store`].
    pub fn new(config: ServerConfig) -> Result<Server, Error> {
        let needs_pki = config
            .endpoints
            .iter()
            .any(|endpoint| endpoint.security_policy() != SecurityPolicy::None);
        let store = if needs_pki {
            CertificateStore::new_self_signed(&config.application_name)?
        } else {
            CertificateStore::default()
        };
        Server::new_with_certificate_store(config, Arc::new(RwLock::new(store)))
    }

    /// Create a server with provisioned certificate material.
    pub fn new_with_certificate_store(
        config: ServerConfig,
        certificate_store: Arc<RwLock<CertificateStore>>,
    ) -> Result<Server, Error> {
        let mut session_manager = SessionManager::new(
            certificate_store.clone(),
            config.max_sessions,
            config.session_timeout_ms,
        );
        if !config.users.is_empty() {
            let users: HashMap<String, String> = config
                .users
                .iter()
                .map(|u| (u.user.clone(), u.pass.clone()))
                .collect();
            session_manager.set_authenticator(Box::new(move |user: &str, pass: &[u8]| {
                users.get(user).map(|p| p.as_bytes() == pass).unwrap_or(false)
            }));
        }

        let core = Arc::new(ServerCore {
            channel_manager: Arc::new(Mutex::new(ChannelManager::new(
                config.max_secure_channels,
                config.max_security_token_lifetime_ms,
            ))),
            session_manager: Arc::new(RwLock::new(session_manager)),
            async_calls: Arc::new(Mutex::new(AsyncCallManager::new(
                config.async_call_timeout_ms,
            ))),
            registered_servers: Arc::new(RwLock::new(HashMap::new())),
            certificate_store,
            config,
        });
        let services = Arc::new(build_service_table(core.clone())?);
        Ok(Server {
            core,
            services,
            token: CancellationToken::new(),
        })
    }

    /// The server's shared state.
    pub fn core(&self) -> &Arc<ServerCore> {
        &self.core
    }

    /// A token that stops the server when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Bind the listener and serve until the cancel token fires.
    pub async fn run(&self) -> Result<(), Error> {
        let address = format!(
            "{}:{}",
            self.core.config.tcp_config.host, self.core.config.tcp_config.port
        );
        let listener = TcpListener::bind(&address).await.map_err(|e| {
            Error::new(
                StatusCode::BadResourceUnavailable,
                format!("Cannot bind {address}: {e}"),
            )
        })?;
        info!("Server listening on {address}");

        if let Some(discovery_url) = self.core.config.discovery_server_url.clone() {
            tokio::spawn(discovery::run_discovery_registration(
                discovery_url,
                self.core.config.discovery_register_interval_ms,
                self.core.clone(),
                self.token.clone(),
            ));
        }

        let mut sweep = tokio::time::interval(std::time::Duration::from_secs(1));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => {
                    info!("Server stopping");
                    trace_lock!(self.core.channel_manager).close_all();
                    break Ok(());
                }
                _ = sweep.tick() => {
                    self.tick(Instant::now());
                }
                r = listener.accept() => {
                    match r {
                        Ok((stream, addr)) => {
                            debug!("Accepted connection from {addr}");
                            let fut = self.connection(Box::new(stream));
                            tokio::spawn(fut);
                        }
                        Err(e) => {
                            warn!("Accept failed: {e}");
                        }
                    }
                }
            }
        }
    }

    /// One maintenance tick: sweep timed out channels, drain the delayed reclamation
    /// queue, expire idle sessions and complete async call stragglers.
    pub fn tick(&self, now: Instant) {
        {
            let mut manager = trace_lock!(self.core.channel_manager);
            manager.cleanup_timed_out(now);
            // Channels removed last tick are reclaimed now, after in-flight work finished.
            drop(manager.drain_deferred());
        }
        {
            let expired = trace_write_lock!(self.core.session_manager).sweep(now);
            for session in expired {
                // A session that never activated has channel id 0, which matches nothing
                // in the registry.
                let channel_id = trace_read_lock!(session).secure_channel_id();
                trace_lock!(self.core.channel_manager).set_session(channel_id, None);
            }
        }
        {
            let mut async_calls = trace_lock!(self.core.async_calls);
            for entry in async_calls.check_timeouts(now) {
                warn!(
                    "Async call {} for session {} expired with {} pending operations",
                    entry.request_id,
                    entry.session_id,
                    entry.results.len()
                );
            }
        }
    }

    /// Handle one connection over the given stream: handshake, channel creation, then the
    /// connection actor loop. Public so hosts and tests can drive connections over streams
    /// the listener never saw.
    pub fn connection(&self, stream: IoStream) -> impl std::future::Future<Output = ()> {
        let core = self.core.clone();
        let services = self.services.clone();
        let server_token = self.token.clone();
        async move {
            let limits = &core.config.limits;
            let connector = Connector::new(
                stream,
                TransportConfig {
                    send_buffer_size: limits.send_buffer_size,
                    receive_buffer_size: limits.receive_buffer_size,
                    max_message_size: limits.max_message_size,
                    max_chunk_count: limits.max_chunk_count,
                    hello_timeout: std::time::Duration::from_millis(
                        core.config.tcp_config.hello_timeout_ms,
                    ),
                },
            );

            let connection_token = server_token.child_token();
            let (transport, client_protocol_version) =
                match connector.connect(connection_token.clone()).await {
                    Ok(r) => r,
                    Err(e) => {
                        debug!("Connection failed during handshake: {e}");
                        return;
                    }
                };

            // Attach a fresh channel to the new transport, purging under pressure.
            let fresh = SecureChannel::new(
                &*trace_read_lock!(core.certificate_store),
                Role::Server,
                DecodingOptions::default(),
            );
            let channel = {
                let mut manager = trace_lock!(core.channel_manager);
                match manager.create_for(fresh, TransportHandle::new(connection_token.clone())) {
                    Ok(channel) => channel,
                    Err(e) => {
                        error!("Cannot create a secure channel: {e}");
                        return;
                    }
                }
            };

            Connection::new(
                transport,
                channel,
                core,
                services,
                connection_token,
                client_protocol_version,
            )
            .run()
            .await;
        }
    }
}

/// Build the per-server dispatch table with the built-in services. A new service registered
/// under an already taken request type is an error.
fn build_service_table(core: Arc<ServerCore>) -> Result<ServiceTable, Error> {
    let mut table = ServiceTable::new();

    {
        let core = core.clone();
        table.register(
            ObjectId::GetEndpointsRequest_Encoding_DefaultBinary,
            false,
            Box::new(move |_ctx: &mut ServiceContext<'_>, request: RequestMessage| {
                let RequestMessage::GetEndpoints(request) = request else {
                    return Err(StatusCode::BadInternalError);
                };
                let endpoints = core.endpoints(&request.profile_uris);
                Ok(GetEndpointsResponse {
                    response_header: ResponseHeader::new_good(&request.request_header),
                    endpoints: Some(endpoints),
                }
                .into())
            }),
        )?;
    }

    {
        let core = core.clone();
        table.register(
            ObjectId::FindServersRequest_Encoding_DefaultBinary,
            false,
            Box::new(move |_ctx: &mut ServiceContext<'_>, request: RequestMessage| {
                let RequestMessage::FindServers(request) = request else {
                    return Err(StatusCode::BadInternalError);
                };
                let mut servers = vec![core.application_description()];
                {
                    let registered = trace_read_lock!(core.registered_servers);
                    servers.extend(registered.values().map(|server| ApplicationDescription {
                        application_uri: server.server_uri.clone(),
                        product_uri: server.product_uri.clone(),
                        application_name: server
                            .server_names
                            .as_ref()
                            .and_then(|names| names.first().cloned())
                            .unwrap_or_else(UAString::null),
                        application_type: server.server_type,
                        gateway_server_uri: server.gateway_server_uri.clone(),
                        discovery_profile_uri: UAString::null(),
                        discovery_urls: server.discovery_urls.clone(),
                    }));
                }
                // Filter servers that do not have a matching application uri.
                if let Some(ref server_uris) = request.server_uris {
                    if !server_uris.is_empty() {
                        servers.retain(|server| server_uris.contains(&server.application_uri));
                    }
                }
                Ok(FindServersResponse {
                    response_header: ResponseHeader::new_good(&request.request_header),
                    servers: Some(servers),
                }
                .into())
            }),
        )?;
    }

    {
        let core = core.clone();
        table.register(
            ObjectId::RegisterServerRequest_Encoding_DefaultBinary,
            false,
            Box::new(move |_ctx: &mut ServiceContext<'_>, request: RequestMessage| {
                let RequestMessage::RegisterServer(request) = request else {
                    return Err(StatusCode::BadInternalError);
                };
                let server = &request.server;
                if server.server_uri.is_empty() {
                    return Err(StatusCode::BadInvalidArgument);
                }
                let uri = server.server_uri.as_ref().to_string();
                let mut registered = trace_write_lock!(core.registered_servers);
                if server.is_online {
                    info!("Registered server {uri}");
                    registered.insert(uri, server.clone());
                } else {
                    info!("Unregistered server {uri}");
                    registered.remove(&uri);
                }
                Ok(RegisterServerResponse {
                    response_header: ResponseHeader::new_good(&request.request_header),
                }
                .into())
            }),
        )?;
    }

    {
        let core = core.clone();
        table.register(
            ObjectId::CreateSessionRequest_Encoding_DefaultBinary,
            false,
            Box::new(move |ctx: &mut ServiceContext<'_>, request: RequestMessage| {
                let RequestMessage::CreateSession(request) = request else {
                    return Err(StatusCode::BadInternalError);
                };
                let channel = trace_read_lock!(ctx.channel);
                let response = trace_write_lock!(core.session_manager)
                    .create_session(&channel, &request)?;
                Ok(response.into())
            }),
        )?;
    }

    {
        let core = core.clone();
        table.register(
            ObjectId::ActivateSessionRequest_Encoding_DefaultBinary,
            false,
            Box::new(move |ctx: &mut ServiceContext<'_>, request: RequestMessage| {
                let RequestMessage::ActivateSession(request) = request else {
                    return Err(StatusCode::BadInternalError);
                };
                let (response, session_id, channel_id) = {
                    let channel = trace_read_lock!(ctx.channel);
                    let (response, session_id) = trace_write_lock!(core.session_manager)
                        .activate_session(&channel, &request)?;
                    (response, session_id, channel.secure_channel_id())
                };
                // Bind the session back-reference; a channel carrying a session is
                // exempt from purging.
                trace_lock!(core.channel_manager).set_session(channel_id, Some(session_id));
                Ok(response.into())
            }),
        )?;
    }

    {
        let core = core.clone();
        table.register(
            ObjectId::CloseSessionRequest_Encoding_DefaultBinary,
            true,
            Box::new(move |_ctx: &mut ServiceContext<'_>, request: RequestMessage| {
                let RequestMessage::CloseSession(request) = request else {
                    return Err(StatusCode::BadInternalError);
                };
                let channel_id = trace_write_lock!(core.session_manager)
                    .close_session(&request.request_header.authentication_token)?;
                trace_lock!(core.channel_manager).set_session(channel_id, None);
                Ok(uasc_types::CloseSessionResponse {
                    response_header: ResponseHeader::new_good(&request.request_header),
                }
                .into())
            }),
        )?;
    }

    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_server() -> Server {
        Server::new(ServerConfig::default()).unwrap()
    }

    #[test]
    fn endpoints_filtered_by_profile() {
        let server = test_server();
        let core = server.core();

        let all = core.endpoints(&None);
        assert_eq!(all.len(), 1);
        assert_eq!(
            all[0].transport_profile_uri.as_ref(),
            PROFILE_TRANSPORT_BINARY
        );

        let matching = core.endpoints(&Some(vec![UAString::from(PROFILE_TRANSPORT_BINARY)]));
        assert_eq!(matching.len(), 1);

        let none = core.endpoints(&Some(vec![UAString::from("http://other/profile")]));
        assert!(none.is_empty());
    }

    #[test]
    fn registered_server_record() {
        let server = test_server();
        let record = server.core().registered_server(true);
        assert!(record.is_online);
        assert_eq!(record.server_uri.as_ref(), "urn:uasc:server");
    }
}
