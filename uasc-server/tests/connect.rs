// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! End-to-end tests driving the real client connect pipeline against the real server over
//! in-memory duplex streams.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use futures::{future::BoxFuture, FutureExt, StreamExt};
use tokio::io::AsyncWriteExt;

use uasc_client::{
    transport::{tcp::Connector, IoStream},
    Client, ClientConfig, ClientPollResult, ClientState,
};
use uasc_server::{Server, ServerConfig};
use uasc_types::{GetEndpointsRequest, StatusCode, UAString};

const ENDPOINT_URL: &str = "opc.tcp://127.0.0.1:4840/";

/// Hands out a prepared stream instead of dialing TCP.
struct DuplexConnector {
    stream: Mutex<Option<IoStream>>,
}

impl DuplexConnector {
    fn new(stream: impl uasc_client::transport::AsyncIo + 'static) -> Self {
        DuplexConnector {
            stream: Mutex::new(Some(Box::new(stream))),
        }
    }
}

impl Connector for DuplexConnector {
    fn connect(&self, _endpoint_url: &str) -> BoxFuture<'static, Result<IoStream, StatusCode>> {
        let stream = self.stream.lock().unwrap().take();
        async move { stream.ok_or(StatusCode::BadConnectionRejected) }.boxed()
    }
}

fn connected_client(server: &Server, config: ClientConfig) -> Client {
    let (client_half, server_half) = tokio::io::duplex(1024 * 1024);
    tokio::spawn(server.connection(Box::new(server_half)));
    Client::new_with_connector(
        config,
        Arc::new(uasc_core::sync::RwLock::new(
            uasc_crypto::CertificateStore::default(),
        )),
        Box::new(DuplexConnector::new(client_half)),
    )
}

async fn drive_until_connected(client: &mut Client) -> Result<(), StatusCode> {
    loop {
        match client.run_iterate().await {
            ClientPollResult::Connected => return Ok(()),
            ClientPollResult::Disconnected(status) => return Err(status),
            ClientPollResult::Idle => return Err(StatusCode::BadConnectionClosed),
            _ => {}
        }
    }
}

#[tokio::test]
async fn happy_path_anonymous_connect() {
    // S1: policy None, anonymous identity, endpoint discovered via GetEndpoints.
    let server = Server::new(ServerConfig::default()).unwrap();
    let mut client = connected_client(&server, ClientConfig::default());

    let (status_send, status_recv) = tokio::sync::oneshot::channel();
    client.connect_async(ENDPOINT_URL, move |status| {
        let _ = status_send.send(status);
    });

    tokio::time::timeout(Duration::from_secs(10), drive_until_connected(&mut client))
        .await
        .expect("connect timed out")
        .expect("connect failed");

    // The final callback fired exactly once, with Good.
    assert_eq!(status_recv.await.unwrap(), StatusCode::Good);
    assert_eq!(client.state(), ClientState::SessionActive);
    assert!(!client.session_id().is_null());
    // Discovery picked the server's single None endpoint.
    let endpoint = client.endpoint().unwrap();
    assert_eq!(
        endpoint.security_policy_uri.as_ref(),
        uasc_crypto::SecurityPolicy::None.to_uri()
    );

    // The server sees one channel and one session.
    let core = server.core();
    assert_eq!(
        core.channel_manager.lock().statistics().current_channel_count(),
        1
    );
    assert_eq!(core.session_manager.read().len(), 1);

    client.disconnect_async().await;
    assert_eq!(client.state(), ClientState::Disconnected);
}

#[tokio::test]
async fn rejected_security_mode() {
    // S2: SignAndEncrypt on the None policy is rejected by the server and the exact
    // status reaches the connect callback.
    let server = Server::new(ServerConfig::default()).unwrap();
    let config = ClientConfig {
        security_mode: "SignAndEncrypt".to_string(),
        ..Default::default()
    };
    let mut client = connected_client(&server, config);

    let (status_send, status_recv) = tokio::sync::oneshot::channel();
    client.connect_async(ENDPOINT_URL, move |status| {
        let _ = status_send.send(status);
    });

    let result = tokio::time::timeout(Duration::from_secs(10), drive_until_connected(&mut client))
        .await
        .expect("connect timed out");
    assert_eq!(result.unwrap_err(), StatusCode::BadSecurityModeRejected);
    assert_eq!(status_recv.await.unwrap(), StatusCode::BadSecurityModeRejected);
    assert_eq!(client.state(), ClientState::Disconnected);
}

#[tokio::test]
async fn channel_purge_under_pressure() {
    // S3: with room for two channels, a third session-less connection purges the first.
    let config = ServerConfig {
        max_secure_channels: 2,
        ..Default::default()
    };
    let server = Server::new(config).unwrap();

    let mut clients = Vec::new();
    for _ in 0..3 {
        let mut client = connected_client(&server, ClientConfig::default());
        client.connect_async_no_session(ENDPOINT_URL, |_| {});
        tokio::time::timeout(Duration::from_secs(10), drive_until_connected(&mut client))
            .await
            .expect("connect timed out")
            .expect("connect failed");
        clients.push(client);
    }

    let channel_ids: Vec<u32> = clients.iter().map(|c| c.secure_channel_id()).collect();
    assert_eq!(channel_ids.len(), 3);
    assert!(channel_ids[2] != channel_ids[0]);

    let core = server.core();
    let stats = core.channel_manager.lock().statistics();
    assert_eq!(stats.channel_purge_count(), 1);
    assert_eq!(stats.current_channel_count(), 2);
    // The purged channel is the first one, in insertion order.
    assert!(core.channel_manager.lock().find(channel_ids[0]).is_none());
    assert!(core.channel_manager.lock().find(channel_ids[1]).is_some());
    assert!(core.channel_manager.lock().find(channel_ids[2]).is_some());
}

#[tokio::test]
async fn renewal_at_75_percent() {
    // S5: with a 2 second lifetime the client renews at 1.5 seconds; the token id changes
    // and the connection stays usable.
    let server = Server::new(ServerConfig::default()).unwrap();
    let config = ClientConfig {
        secure_channel_lifetime_ms: 2_000,
        ..Default::default()
    };
    let mut client = connected_client(&server, config);

    client.connect_async(ENDPOINT_URL, |_| {});
    tokio::time::timeout(Duration::from_secs(10), drive_until_connected(&mut client))
        .await
        .expect("connect timed out")
        .expect("connect failed");

    let first_token = client.token_id();
    assert_ne!(first_token, 0);
    let channel_id = client.secure_channel_id();

    // Keep driving the engine until the renewal lands.
    let renewed = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match client.run_iterate().await {
                ClientPollResult::Disconnected(status) => return Err(status),
                _ => {
                    if client.token_id() != first_token {
                        return Ok(client.token_id());
                    }
                }
            }
        }
    })
    .await
    .expect("renewal timed out")
    .expect("connection lost before renewal");

    assert_ne!(renewed, first_token);
    assert_eq!(client.state(), ClientState::SessionActive);
    assert_eq!(client.secure_channel_id(), channel_id);

    // A request after the renewal still round-trips.
    let request_header = client.make_request_header();
    let recv = client
        .send_request(GetEndpointsRequest {
            request_header,
            endpoint_url: UAString::from(ENDPOINT_URL),
            locale_ids: None,
            profile_uris: None,
        })
        .unwrap();
    tokio::pin!(recv);
    let response = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            tokio::select! {
                r = &mut recv => break r.unwrap(),
                _ = client.run_iterate() => {}
            }
        }
    })
    .await
    .expect("request timed out")
    .expect("request failed");
    assert!(matches!(
        response,
        uasc_core::ResponseMessage::GetEndpoints(_)
    ));
}

#[tokio::test]
async fn request_timeout_against_silent_server() {
    // S6: a server that completes the handshake but never answers service calls. The
    // pending call completes exactly once, with BadTimeout.
    let (client_half, server_half) = tokio::io::duplex(1024 * 1024);
    tokio::spawn(silent_server(Box::new(server_half)));

    let config = ClientConfig {
        request_timeout_ms: 500,
        ..Default::default()
    };
    let mut client = Client::new_with_connector(
        config,
        Arc::new(uasc_core::sync::RwLock::new(
            uasc_crypto::CertificateStore::default(),
        )),
        Box::new(DuplexConnector::new(client_half)),
    );

    client.connect_async_no_session(ENDPOINT_URL, |_| {});
    tokio::time::timeout(Duration::from_secs(10), drive_until_connected(&mut client))
        .await
        .expect("connect timed out")
        .expect("connect failed");

    let request_header = client.make_request_header();
    let recv = client
        .send_request(GetEndpointsRequest {
            request_header,
            endpoint_url: UAString::from(ENDPOINT_URL),
            locale_ids: None,
            profile_uris: None,
        })
        .unwrap();
    tokio::pin!(recv);

    let result = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            tokio::select! {
                r = &mut recv => break r.unwrap(),
                _ = client.run_iterate() => {}
            }
        }
    })
    .await
    .expect("timeout sweep never fired");
    assert_eq!(result.unwrap_err(), StatusCode::BadTimeout);
}

/// A hand-rolled peer that answers the transport handshake and the OPN, then goes quiet.
async fn silent_server(stream: uasc_server::IoStream) {
    use uasc_core::comms::{
        buffer::SendBuffer,
        chunker::Chunker,
        secure_channel::{ChannelState, Role, SecureChannel},
        tcp_codec::{Message, TcpCodec},
        tcp_types::AcknowledgeMessage,
    };
    use uasc_core::{RequestMessage, ResponseMessage};
    use uasc_types::{
        BinaryEncodable, DecodingOptions, OpenSecureChannelResponse, ResponseHeader,
    };

    let (read, mut write) = tokio::io::split(stream);
    let mut read =
        tokio_util::codec::FramedRead::new(read, TcpCodec::new(DecodingOptions::default()));

    // HEL -> ACK
    let Some(Ok(Message::Hello(hello))) = read.next().await else {
        return;
    };
    let ack = AcknowledgeMessage::new(
        0,
        hello.send_buffer_size,
        hello.receive_buffer_size,
        hello.max_message_size,
        hello.max_chunk_count,
    );
    write.write_all(&ack.encode_to_vec()).await.unwrap();

    // OPN -> OPN response
    let Some(Ok(Message::Chunk(chunk))) = read.next().await else {
        return;
    };
    let mut channel = SecureChannel::new(
        &uasc_crypto::CertificateStore::default(),
        Role::Server,
        DecodingOptions::default(),
    );
    let chunk = channel.verify_and_remove_security(&chunk.data).unwrap();
    let info = chunk.chunk_info(&channel).unwrap();
    let request: RequestMessage = Chunker::decode(&[chunk], &channel, None).unwrap();
    let RequestMessage::OpenSecureChannel(request) = request else {
        return;
    };
    channel.issue_token(1, 1, request.requested_lifetime.max(10_000));
    channel.set_state(ChannelState::Open);

    let response: ResponseMessage = OpenSecureChannelResponse {
        response_header: ResponseHeader::new_good(&request.request_header),
        server_protocol_version: 0,
        security_token: channel.token().make_wire_token(),
        server_nonce: channel.local_nonce_as_byte_string(),
    }
    .into();
    let mut buffer = SendBuffer::new(8192, 0, 0);
    buffer
        .write(info.sequence_header.request_id, response, &mut channel)
        .unwrap();
    while buffer.should_encode_chunks() {
        buffer.encode_next_chunk(&channel).unwrap();
    }
    buffer.read_into_async(&mut write).await.unwrap();

    // Silence. Keep the stream open so nothing fails with a closed connection.
    futures::future::pending::<()>().await;
}
