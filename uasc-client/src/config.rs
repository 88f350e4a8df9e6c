// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Client configuration.

use serde::{Deserialize, Serialize};

use uasc_crypto::SecurityPolicy;
use uasc_types::{EndpointDescription, MessageSecurityMode};

use crate::IdentityToken;

/// The local transport limits offered in the HELLO handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Largest chunk this side can receive.
    pub recv_buffer_size: usize,
    /// Largest chunk this side will send.
    pub send_buffer_size: usize,
    /// Largest whole message this side accepts, 0 for no limit.
    pub max_message_size: usize,
    /// Most chunks per message this side accepts, 0 for no limit.
    pub max_chunk_count: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            recv_buffer_size: 65535,
            send_buffer_size: 65535,
            max_message_size: 2 * 1024 * 1024,
            max_chunk_count: 64,
        }
    }
}

/// Client configuration. Hosts typically deserialize this from their own config file and
/// adjust the non-serializable parts (identity token, preselected endpoint) in code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Name of the client application.
    pub application_name: String,
    /// Globally unique identifier of the client application.
    pub application_uri: String,
    /// Globally unique identifier of the product.
    pub product_uri: String,
    /// Session name sent in CreateSession.
    pub session_name: String,
    /// Local transport limits.
    pub connection: ConnectionConfig,
    /// Requested lifetime of the secure channel token in milliseconds.
    pub secure_channel_lifetime_ms: u32,
    /// Requested session timeout in milliseconds.
    pub requested_session_timeout_ms: u32,
    /// Default timeout of a service call in milliseconds.
    pub request_timeout_ms: u64,
    /// URI of the security policy to connect under.
    pub security_policy_uri: String,
    /// The security mode to connect under: "None", "Sign" or "SignAndEncrypt".
    pub security_mode: String,
    /// Cap on the number of outstanding service calls.
    pub max_inflight_requests: usize,
    /// The identity to activate the session with.
    #[serde(skip)]
    pub user_identity_token: IdentityToken,
    /// A preselected endpoint. When absent the client runs GetEndpoints after the channel
    /// opens and picks the first matching endpoint.
    #[serde(skip)]
    pub endpoint: Option<EndpointDescription>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            application_name: "UASC client".to_string(),
            application_uri: "urn:uasc:client".to_string(),
            product_uri: "urn:uasc".to_string(),
            session_name: "UASC session".to_string(),
            connection: ConnectionConfig::default(),
            secure_channel_lifetime_ms: 60_000,
            requested_session_timeout_ms: 60_000,
            request_timeout_ms: 10_000,
            security_policy_uri: SecurityPolicy::None.to_uri().to_string(),
            security_mode: "None".to_string(),
            max_inflight_requests: 100,
            user_identity_token: IdentityToken::Anonymous,
            endpoint: None,
        }
    }
}

impl ClientConfig {
    /// The configured security policy.
    pub fn security_policy(&self) -> SecurityPolicy {
        SecurityPolicy::from_uri(&self.security_policy_uri)
    }

    /// The configured security mode. Unrecognized strings yield `Invalid`.
    pub fn security_mode(&self) -> MessageSecurityMode {
        match self.security_mode.as_str() {
            "None" => MessageSecurityMode::None,
            "Sign" => MessageSecurityMode::Sign,
            "SignAndEncrypt" => MessageSecurityMode::SignAndEncrypt,
            _ => MessageSecurityMode::Invalid,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.security_policy(), SecurityPolicy::None);
        assert_eq!(config.security_mode(), MessageSecurityMode::None);
        assert_eq!(config.connection.recv_buffer_size, 65535);
    }

    #[test]
    fn bad_mode_is_invalid() {
        let config = ClientConfig {
            security_mode: "SignMaybe".to_string(),
            ..Default::default()
        };
        assert_eq!(config.security_mode(), MessageSecurityMode::Invalid);
    }
}
