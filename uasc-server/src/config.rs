// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Server configuration.

use serde::{Deserialize, Serialize};

use uasc_crypto::SecurityPolicy;
use uasc_types::MessageSecurityMode;

/// TCP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TcpConfig {
    /// The address to bind.
    pub host: String,
    /// The port to bind.
    pub port: u16,
    /// How long a fresh connection gets to send its HELLO, in milliseconds.
    pub hello_timeout_ms: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            host: "127.0.0.1".to_string(),
            port: 4840,
            hello_timeout_ms: 5_000,
        }
    }
}

/// The local transport limits offered in the HELLO / ACKNOWLEDGE handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportLimits {
    /// Largest chunk this side can receive.
    pub receive_buffer_size: usize,
    /// Largest chunk this side will send.
    pub send_buffer_size: usize,
    /// Largest whole message this side accepts, 0 for no limit.
    pub max_message_size: usize,
    /// Most chunks per message this side accepts, 0 for no limit.
    pub max_chunk_count: usize,
}

impl Default for TransportLimits {
    fn default() -> Self {
        TransportLimits {
            receive_buffer_size: 65535,
            send_buffer_size: 65535,
            max_message_size: 2 * 1024 * 1024,
            max_chunk_count: 64,
        }
    }
}

/// One endpoint the server advertises.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerEndpointConfig {
    /// The path under the base url, e.g. "/".
    pub path: String,
    /// URI of the endpoint's security policy.
    pub security_policy_uri: String,
    /// The endpoint's security mode: "None", "Sign" or "SignAndEncrypt".
    pub security_mode: String,
    /// Whether anonymous identities are accepted.
    pub anonymous: bool,
    /// Whether user name / password identities are accepted.
    pub user_name: bool,
}

impl Default for ServerEndpointConfig {
    fn default() -> Self {
        ServerEndpointConfig {
            path: "/".to_string(),
            security_policy_uri: SecurityPolicy::None.to_uri().to_string(),
            security_mode: "None".to_string(),
            anonymous: true,
            user_name: false,
        }
    }
}

impl ServerEndpointConfig {
    /// The endpoint's security policy.
    pub fn security_policy(&self) -> SecurityPolicy {
        SecurityPolicy::from_uri(&self.security_policy_uri)
    }

    /// The endpoint's security mode.
    pub fn security_mode(&self) -> MessageSecurityMode {
        match self.security_mode.as_str() {
            "None" => MessageSecurityMode::None,
            "Sign" => MessageSecurityMode::Sign,
            "SignAndEncrypt" => MessageSecurityMode::SignAndEncrypt,
            _ => MessageSecurityMode::Invalid,
        }
    }
}

/// A user accepted by the user name authenticator.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerUser {
    /// The user name.
    pub user: String,
    /// The password.
    pub pass: String,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Name of the server application.
    pub application_name: String,
    /// Globally unique identifier of the server application.
    pub application_uri: String,
    /// Globally unique identifier of the product.
    pub product_uri: String,
    /// Listener settings.
    pub tcp_config: TcpConfig,
    /// Transport limits.
    pub limits: TransportLimits,
    /// Most secure channels alive at once.
    pub max_secure_channels: usize,
    /// Cap on granted security token lifetimes, in milliseconds.
    pub max_security_token_lifetime_ms: u32,
    /// Most sessions alive at once.
    pub max_sessions: usize,
    /// Cap on granted session timeouts, in milliseconds.
    pub session_timeout_ms: u64,
    /// How long an async call may wait for its worker results, in milliseconds.
    pub async_call_timeout_ms: u64,
    /// Discovery server to register with, if any.
    pub discovery_server_url: Option<String>,
    /// Interval between discovery registrations, in milliseconds. Also caps the
    /// registration retry backoff.
    pub discovery_register_interval_ms: u64,
    /// The endpoints the server advertises.
    pub endpoints: Vec<ServerEndpointConfig>,
    /// Users accepted for user name identity tokens.
    pub users: Vec<ServerUser>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            application_name: "UASC server".to_string(),
            application_uri: "urn:uasc:server".to_string(),
            product_uri: "urn:uasc".to_string(),
            tcp_config: TcpConfig::default(),
            limits: TransportLimits::default(),
            max_secure_channels: 40,
            max_security_token_lifetime_ms: 3_600_000,
            max_sessions: 100,
            session_timeout_ms: 60_000,
            async_call_timeout_ms: 120_000,
            discovery_server_url: None,
            discovery_register_interval_ms: 600_000,
            endpoints: vec![ServerEndpointConfig::default()],
            users: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// The base url of the listener, `opc.tcp://host:port`.
    pub fn base_endpoint_url(&self) -> String {
        format!("opc.tcp://{}:{}", self.tcp_config.host, self.tcp_config.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.base_endpoint_url(), "opc.tcp://127.0.0.1:4840");
        assert_eq!(config.endpoints.len(), 1);
        assert_eq!(config.endpoints[0].security_policy(), SecurityPolicy::None);
        assert_eq!(
            config.endpoints[0].security_mode(),
            MessageSecurityMode::None
        );
    }
}
