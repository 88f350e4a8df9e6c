// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Periodic registration with a discovery server. This is the one place in the stack that
//! retries: a failed registration backs off exponentially from one second, doubling up to
//! the configured registration interval, then tries again.

use std::{sync::Arc, time::Duration};

use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

use uasc_client::{Client, ClientConfig, ClientPollResult, ExponentialBackoff};
use uasc_core::{sync::RwLock, ResponseMessage};
use uasc_types::{RegisterServerRequest, RegisteredServer, StatusCode};

use crate::server::ServerCore;

/// Run the registration loop until the token is cancelled, at which point a final
/// unregistration (`is_online = false`) is attempted.
pub(crate) async fn run_discovery_registration(
    discovery_url: String,
    register_interval_ms: u64,
    core: Arc<ServerCore>,
    token: CancellationToken,
) {
    let interval = Duration::from_millis(register_interval_ms);
    let mut backoff = new_backoff(interval);

    info!("Registering with discovery server {discovery_url} every {interval:?}");
    loop {
        let record = core.registered_server(true);
        match register_once(&discovery_url, &core, record).await {
            Ok(()) => {
                debug!("Registered with discovery server");
                backoff = new_backoff(interval);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            Err(status) => {
                // Failures are retried with exponential backoff, capped at the
                // registration interval.
                let delay = backoff.next().unwrap_or(interval);
                warn!(
                    "Could not register with discovery server: {status}, retrying in {delay:?}"
                );
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    // Tell the discovery server we are going offline. Ignore failures, the server is
    // shutting down either way.
    let record = core.registered_server(false);
    if register_once(&discovery_url, &core, record).await.is_ok() {
        info!("Unregistered from discovery server");
    }
}

fn new_backoff(interval: Duration) -> ExponentialBackoff {
    ExponentialBackoff::new(interval, None, Duration::from_secs(1))
}

/// One registration attempt: open a secure channel to the discovery server, send
/// RegisterServer, and close down again. No session is needed for discovery services.
async fn register_once(
    discovery_url: &str,
    core: &Arc<ServerCore>,
    record: RegisteredServer,
) -> Result<(), StatusCode> {
    let mut client = Client::new(
        ClientConfig {
            application_name: core.config.application_name.clone(),
            application_uri: core.config.application_uri.clone(),
            product_uri: core.config.product_uri.clone(),
            ..Default::default()
        },
        Arc::new(RwLock::new(uasc_crypto::CertificateStore::default())),
    );

    client.connect_async_no_session(discovery_url, |_| {});
    loop {
        match client.run_iterate().await {
            ClientPollResult::Connected => break,
            ClientPollResult::Disconnected(status) => return Err(status),
            ClientPollResult::Idle => return Err(StatusCode::BadConnectionClosed),
            _ => {}
        }
    }

    let request = RegisterServerRequest {
        request_header: client.make_request_header(),
        server: record,
    };
    let recv = client.send_request(request)?;

    // Drive the transport until the response lands.
    let result = {
        tokio::pin!(recv);
        loop {
            tokio::select! {
                r = &mut recv => {
                    break r.unwrap_or(Err(StatusCode::BadConnectionClosed));
                }
                r = client.run_iterate() => {
                    if let ClientPollResult::Disconnected(status) = r {
                        break Err(status);
                    }
                }
            }
        }
    };
    client.disconnect_async().await;

    match result? {
        ResponseMessage::RegisterServer(response) => {
            let service_result = response.response_header.service_result;
            if service_result.is_bad() {
                Err(service_result)
            } else {
                Ok(())
            }
        }
        ResponseMessage::ServiceFault(fault) => Err(fault.response_header.service_result),
        _ => Err(StatusCode::BadUnknownResponse),
    }
}
