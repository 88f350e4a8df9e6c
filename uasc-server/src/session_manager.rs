// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Server side sessions: creation, activation, closing and the timeout sweep. A session is
//! the authenticated application context layered on a secure channel; it holds a weak
//! binding to its channel by id and is looked up by its authentication token on each use.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use hashbrown::HashMap;
use log::{debug, error, info, warn};

use uasc_core::{comms::secure_channel::SecureChannel, sync::RwLock, trace_read_lock};
use uasc_crypto::{CertificateStore, KeySize, SecurityPolicy, X509};
use uasc_types::{
    ActivateSessionRequest, ActivateSessionResponse, ByteString, CreateSessionRequest,
    CreateSessionResponse, MessageSecurityMode, NodeId, ObjectId, ResponseHeader,
    SignatureData, StatusCode, UAString, UserNameIdentityToken, UserTokenType,
};

/// URI of the RSA-SHA256 signature algorithm produced in server signatures.
const RSA_SHA256_URI: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";

/// The identity a session was activated with.
#[derive(Debug, Clone, PartialEq)]
pub enum UserToken {
    /// Anonymous identity.
    Anonymous,
    /// An authenticated user name.
    UserName(String),
}

/// A server side session.
#[derive(Debug)]
pub struct Session {
    session_id: NodeId,
    authentication_token: NodeId,
    /// The id of the secure channel the session is bound to. Bound at activation; a
    /// request arriving for this session on another channel is rejected.
    secure_channel_id: u32,
    activated: bool,
    timeout: Duration,
    last_activity: Instant,
    /// The nonce sent to the client in the last Create/Activate response.
    session_nonce: ByteString,
    client_certificate: ByteString,
    user_token: Option<UserToken>,
}

impl Session {
    /// The server-assigned session id.
    pub fn session_id(&self) -> &NodeId {
        &self.session_id
    }

    /// The secret authentication token the session is looked up by.
    pub fn authentication_token(&self) -> &NodeId {
        &self.authentication_token
    }

    /// The id of the channel the session is bound to, 0 until activation.
    pub fn secure_channel_id(&self) -> u32 {
        self.secure_channel_id
    }

    /// The identity the session was activated with.
    pub fn user_token(&self) -> Option<&UserToken> {
        self.user_token.as_ref()
    }

    /// Whether the session was activated.
    pub fn is_activated(&self) -> bool {
        self.activated
    }

    /// Reject use of a session that was never activated.
    pub fn validate_activated(&self) -> Result<(), StatusCode> {
        if self.activated {
            Ok(())
        } else {
            Err(StatusCode::BadSessionNotActivated)
        }
    }

    /// Reject use of a session from a channel it is not bound to.
    pub fn validate_secure_channel_id(&self, channel_id: u32) -> Result<(), StatusCode> {
        if self.secure_channel_id == channel_id {
            Ok(())
        } else {
            Err(StatusCode::BadSecureChannelIdInvalid)
        }
    }

    /// Reject use of a session that has idled past its timeout.
    pub fn validate_timed_out(&self, now: Instant) -> Result<(), StatusCode> {
        if self.last_activity + self.timeout < now {
            Err(StatusCode::BadSessionIdInvalid)
        } else {
            Ok(())
        }
    }

    /// Record session activity, postponing its timeout.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

/// Checks the user name and password of a UserName identity. The default accepts nobody.
pub type Authenticator = Box<dyn Fn(&str, &[u8]) -> bool + Send + Sync>;

/// Owns the server's sessions, keyed by their secret authentication token.
pub struct SessionManager {
    sessions: HashMap<NodeId, Arc<RwLock<Session>>>,
    certificate_store: Arc<RwLock<CertificateStore>>,
    authenticator: Option<Authenticator>,
    max_sessions: usize,
    session_timeout: Duration,
    last_session_id: u32,
}

impl SessionManager {
    /// Create a manager enforcing the given caps.
    pub fn new(
        certificate_store: Arc<RwLock<CertificateStore>>,
        max_sessions: usize,
        session_timeout_ms: u64,
    ) -> SessionManager {
        SessionManager {
            sessions: HashMap::new(),
            certificate_store,
            authenticator: None,
            max_sessions,
            session_timeout: Duration::from_millis(session_timeout_ms),
            last_session_id: 0,
        }
    }

    /// Install a user name / password check for UserName identity tokens.
    pub fn set_authenticator(&mut self, authenticator: Authenticator) {
        self.authenticator = Some(authenticator);
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Whether there are no sessions.
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Look up a session by the authentication token of a request header.
    pub fn find_by_token(&self, authentication_token: &NodeId) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(authentication_token).cloned()
    }

    /// Handle CreateSession. The session starts unactivated and unbound; activation binds
    /// it to the channel it arrives on.
    pub fn create_session(
        &mut self,
        channel: &SecureChannel,
        request: &CreateSessionRequest,
    ) -> Result<CreateSessionResponse, StatusCode> {
        if self.sessions.len() >= self.max_sessions {
            warn!("Rejecting session, max session count reached");
            return Err(StatusCode::BadTooManySessions);
        }

        // Under a crypto mode the client must have sent a 32 byte nonce.
        if channel.security_mode() != MessageSecurityMode::None
            && request.client_nonce.len() != uasc_crypto::SESSION_NONCE_LENGTH
        {
            error!("CreateSession client nonce has the wrong length");
            return Err(StatusCode::BadNonceInvalid);
        }

        self.last_session_id += 1;
        let session_id = NodeId::new_numeric(1, self.last_session_id);
        let authentication_token = NodeId::new_guid(0);
        let session_nonce = uasc_crypto::random::byte_string(uasc_crypto::SESSION_NONCE_LENGTH);

        let revised_timeout = if request.requested_session_timeout > 0.0 {
            Duration::from_millis(
                (request.requested_session_timeout as u64)
                    .min(self.session_timeout.as_millis() as u64),
            )
        } else {
            self.session_timeout
        };

        let (server_certificate, server_signature) = self.make_server_signature(
            channel.security_mode(),
            channel.security_policy(),
            &request.client_certificate,
            &request.client_nonce,
        )?;

        let session = Session {
            session_id: session_id.clone(),
            authentication_token: authentication_token.clone(),
            secure_channel_id: 0,
            activated: false,
            timeout: revised_timeout,
            last_activity: Instant::now(),
            session_nonce: session_nonce.clone(),
            client_certificate: request.client_certificate.clone(),
            user_token: None,
        };
        info!("Created session {session_id}");
        self.sessions
            .insert(authentication_token.clone(), Arc::new(RwLock::new(session)));

        Ok(CreateSessionResponse {
            response_header: ResponseHeader::new_good(&request.request_header),
            session_id,
            authentication_token,
            revised_session_timeout: revised_timeout.as_millis() as f64,
            server_nonce: session_nonce,
            server_certificate,
            server_endpoints: None,
            server_signature,
            max_request_message_size: 0,
        })
    }

    /// Handle ActivateSession: verify the client signature and the identity token, bind the
    /// session to the channel, and rotate the server nonce.
    pub fn activate_session(
        &mut self,
        channel: &SecureChannel,
        request: &ActivateSessionRequest,
    ) -> Result<(ActivateSessionResponse, NodeId), StatusCode> {
        let authentication_token = &request.request_header.authentication_token;
        let session = self
            .find_by_token(authentication_token)
            .ok_or(StatusCode::BadSessionIdInvalid)?;
        let mut session = session.write();

        session.validate_timed_out(Instant::now())?;

        if channel.security_mode() != MessageSecurityMode::None {
            self.verify_client_signature(channel, &session, &request.client_signature)?;
        }

        let user_token = self.validate_identity_token(channel, request)?;

        if session.activated {
            // A session can only be reactivated over its own channel.
            session.validate_secure_channel_id(channel.secure_channel_id())?;
        } else {
            session.secure_channel_id = channel.secure_channel_id();
            session.activated = true;
        }
        session.user_token = Some(user_token);
        session.touch();

        let session_nonce = uasc_crypto::random::byte_string(uasc_crypto::SESSION_NONCE_LENGTH);
        session.session_nonce = session_nonce.clone();
        let session_id = session.session_id.clone();
        info!("Activated session {session_id}");

        Ok((
            ActivateSessionResponse {
                response_header: ResponseHeader::new_good(&request.request_header),
                server_nonce: session_nonce,
                results: None,
                diagnostic_infos: None,
            },
            session_id,
        ))
    }

    /// Handle CloseSession. Returns the id of the channel the session was bound to.
    pub fn close_session(&mut self, authentication_token: &NodeId) -> Result<u32, StatusCode> {
        let session = self
            .sessions
            .remove(authentication_token)
            .ok_or(StatusCode::BadSessionIdInvalid)?;
        let session = trace_read_lock!(session);
        info!("Closed session {}", session.session_id);
        Ok(session.secure_channel_id)
    }

    /// Remove sessions that idled past their timeout. Returns the removed sessions so the
    /// caller can detach them from their channels.
    pub fn sweep(&mut self, now: Instant) -> Vec<Arc<RwLock<Session>>> {
        let expired: Vec<NodeId> = self
            .sessions
            .iter()
            .filter(|(_, session)| {
                let session = trace_read_lock!(session);
                session.validate_timed_out(now).is_err()
            })
            .map(|(token, _)| token.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|token| {
                let session = self.sessions.remove(&token)?;
                debug!(
                    "Session {} timed out",
                    trace_read_lock!(session).session_id
                );
                Some(session)
            })
            .collect()
    }

    fn make_server_signature(
        &self,
        security_mode: MessageSecurityMode,
        security_policy: SecurityPolicy,
        client_certificate: &ByteString,
        client_nonce: &ByteString,
    ) -> Result<(ByteString, SignatureData), StatusCode> {
        let store = trace_read_lock!(self.certificate_store);
        let server_certificate = store
            .read_own_cert()
            .map(|cert| cert.as_byte_string())
            .unwrap_or_else(|_| ByteString::null());

        if security_mode == MessageSecurityMode::None {
            return Ok((server_certificate, SignatureData::default()));
        }

        let private_key = store
            .read_own_pkey()
            .map_err(|_| StatusCode::BadInternalError)?;
        let mut data = Vec::with_capacity(client_certificate.len() + client_nonce.len());
        data.extend_from_slice(client_certificate.as_ref());
        data.extend_from_slice(client_nonce.as_ref());
        let mut signature = vec![0u8; private_key.size()];
        security_policy
            .asymmetric_sign(&private_key, &data, &mut signature)
            .map_err(|_| StatusCode::BadSecurityChecksFailed)?;
        Ok((
            server_certificate,
            SignatureData {
                algorithm: UAString::from(RSA_SHA256_URI),
                signature: ByteString::from(signature),
            },
        ))
    }

    /// The client signature covers our certificate and the nonce from the last response,
    /// produced with the client certificate's key.
    fn verify_client_signature(
        &self,
        channel: &SecureChannel,
        session: &Session,
        client_signature: &SignatureData,
    ) -> Result<(), StatusCode> {
        let client_certificate = X509::from_byte_string(&session.client_certificate)
            .map_err(|_| StatusCode::BadCertificateInvalid)?;
        let verification_key = client_certificate
            .public_key()
            .map_err(|_| StatusCode::BadCertificateInvalid)?;

        let store = trace_read_lock!(self.certificate_store);
        let server_certificate = store
            .read_own_cert()
            .map_err(|_| StatusCode::BadInternalError)?
            .as_byte_string();

        let mut data =
            Vec::with_capacity(server_certificate.len() + session.session_nonce.len());
        data.extend_from_slice(server_certificate.as_ref());
        data.extend_from_slice(session.session_nonce.as_ref());

        channel
            .security_policy()
            .asymmetric_verify_signature(
                &verification_key,
                &data,
                client_signature.signature.as_ref(),
            )
            .map_err(|_| {
                error!("Client signature did not verify");
                StatusCode::BadUserAccessDenied
            })
    }

    fn validate_identity_token(
        &self,
        channel: &SecureChannel,
        request: &ActivateSessionRequest,
    ) -> Result<UserToken, StatusCode> {
        let token = &request.user_identity_token;
        // An empty extension object is treated as anonymous.
        if token.is_null() {
            return Ok(UserToken::Anonymous);
        }
        let object_id = token
            .object_id()
            .map_err(|_| StatusCode::BadIdentityTokenInvalid)?;
        let decoding_options = channel.decoding_options();
        match object_id {
            ObjectId::AnonymousIdentityToken_Encoding_DefaultBinary => Ok(UserToken::Anonymous),
            ObjectId::UserNameIdentityToken_Encoding_DefaultBinary => {
                let token: UserNameIdentityToken = token
                    .decode_inner(&decoding_options)
                    .map_err(|_| StatusCode::BadIdentityTokenInvalid)?;
                let Some(authenticator) = self.authenticator.as_ref() else {
                    warn!("A user name token was supplied but no authenticator is configured");
                    return Err(StatusCode::BadIdentityTokenRejected);
                };
                let password = self.decrypt_password(&token)?;
                if authenticator(token.user_name.as_ref(), &password) {
                    Ok(UserToken::UserName(token.user_name.as_ref().to_string()))
                } else {
                    Err(StatusCode::BadUserAccessDenied)
                }
            }
            _ => {
                warn!("Unsupported identity token kind {:?}", object_id);
                Err(StatusCode::BadIdentityTokenRejected)
            }
        }
    }

    /// Undo the legacy secret encryption of a password: RSA-decrypt, strip the length
    /// prefix and the trailing server nonce. Plaintext passwords pass through.
    fn decrypt_password(&self, token: &UserNameIdentityToken) -> Result<Vec<u8>, StatusCode> {
        if token.encryption_algorithm.is_null() {
            return Ok(token.password.to_vec());
        }
        let store = trace_read_lock!(self.certificate_store);
        let private_key = store
            .read_own_pkey()
            .map_err(|_| StatusCode::BadInternalError)?;
        let mut plain = vec![0u8; token.password.len()];
        let size = private_key
            .decrypt(
                token.password.as_ref(),
                &mut plain,
                uasc_crypto::RsaPadding::OaepSha1,
            )
            .map_err(|_| StatusCode::BadIdentityTokenInvalid)?;
        if size < 4 {
            return Err(StatusCode::BadIdentityTokenInvalid);
        }
        let length = u32::from_le_bytes([plain[0], plain[1], plain[2], plain[3]]) as usize;
        if length + 4 > size {
            return Err(StatusCode::BadIdentityTokenInvalid);
        }
        // The secret is the prefix of the payload, the rest is the server nonce.
        let secret_len = length.saturating_sub(uasc_crypto::SESSION_NONCE_LENGTH);
        Ok(plain[4..4 + secret_len].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uasc_core::comms::secure_channel::Role;
    use uasc_types::{
        ApplicationDescription, DecodingOptions, ExtensionObject, RequestHeader,
    };

    fn store() -> Arc<RwLock<CertificateStore>> {
        Arc::new(RwLock::new(CertificateStore::default()))
    }

    fn channel() -> SecureChannel {
        let mut channel = SecureChannel::new(
            &CertificateStore::default(),
            Role::Server,
            DecodingOptions::default(),
        );
        channel.issue_token(17, 1, 60_000);
        channel
    }

    fn create_request() -> CreateSessionRequest {
        CreateSessionRequest {
            request_header: RequestHeader::default(),
            client_description: ApplicationDescription::default(),
            server_uri: UAString::null(),
            endpoint_url: UAString::from("opc.tcp://localhost:4840"),
            session_name: UAString::from("test"),
            client_nonce: ByteString::null(),
            client_certificate: ByteString::null(),
            requested_session_timeout: 0.0,
            max_response_message_size: 0,
        }
    }

    fn activate_request(authentication_token: NodeId) -> ActivateSessionRequest {
        ActivateSessionRequest {
            request_header: RequestHeader::new(authentication_token, 1),
            client_signature: SignatureData::default(),
            client_software_certificates: None,
            locale_ids: None,
            user_identity_token: ExtensionObject::null(),
            user_token_signature: SignatureData::default(),
        }
    }

    #[test]
    fn create_and_activate() {
        let mut manager = SessionManager::new(store(), 10, 60_000);
        let channel = channel();

        let response = manager.create_session(&channel, &create_request()).unwrap();
        assert!(!response.authentication_token.is_null());
        assert_eq!(manager.len(), 1);

        let session = manager
            .find_by_token(&response.authentication_token)
            .unwrap();
        assert!(!session.read().is_activated());

        let (activate, session_id) = manager
            .activate_session(&channel, &activate_request(response.authentication_token))
            .unwrap();
        assert_eq!(session_id, response.session_id);
        // The nonce rotated.
        assert_ne!(activate.server_nonce, response.server_nonce);
        let session = session.read();
        assert!(session.is_activated());
        assert!(session.validate_secure_channel_id(17).is_ok());
        assert!(session.validate_secure_channel_id(18).is_err());
        assert_eq!(session.user_token(), Some(&UserToken::Anonymous));
    }

    #[test]
    fn activation_with_unknown_token_rejected() {
        let mut manager = SessionManager::new(store(), 10, 60_000);
        let channel = channel();
        let err = manager
            .activate_session(&channel, &activate_request(NodeId::new_guid(0)))
            .unwrap_err();
        assert_eq!(err, StatusCode::BadSessionIdInvalid);
    }

    #[test]
    fn max_sessions_enforced() {
        let mut manager = SessionManager::new(store(), 1, 60_000);
        let channel = channel();
        manager.create_session(&channel, &create_request()).unwrap();
        let err = manager
            .create_session(&channel, &create_request())
            .unwrap_err();
        assert_eq!(err, StatusCode::BadTooManySessions);
    }

    #[test]
    fn close_session() {
        let mut manager = SessionManager::new(store(), 10, 60_000);
        let channel = channel();
        let response = manager.create_session(&channel, &create_request()).unwrap();
        manager
            .activate_session(&channel, &activate_request(response.authentication_token.clone()))
            .unwrap();

        let channel_id = manager
            .close_session(&response.authentication_token)
            .unwrap();
        assert_eq!(channel_id, 17);
        assert!(manager.is_empty());
        assert_eq!(
            manager
                .close_session(&response.authentication_token)
                .unwrap_err(),
            StatusCode::BadSessionIdInvalid
        );
    }

    #[test]
    fn session_timeout_sweep() {
        let mut manager = SessionManager::new(store(), 10, 1_000);
        let channel = channel();
        manager.create_session(&channel, &create_request()).unwrap();

        // Not yet expired.
        assert!(manager.sweep(Instant::now()).is_empty());
        assert_eq!(manager.len(), 1);

        let removed = manager.sweep(Instant::now() + Duration::from_millis(1_001));
        assert_eq!(removed.len(), 1);
        assert!(manager.is_empty());
    }

    #[test]
    fn username_authentication() {
        let mut manager = SessionManager::new(store(), 10, 60_000);
        manager.set_authenticator(Box::new(|user: &str, pass: &[u8]| {
            user == "alice" && pass == b"wonder"
        }));
        let channel = channel();

        let response = manager.create_session(&channel, &create_request()).unwrap();

        let token = UserNameIdentityToken {
            policy_id: UAString::from("user_pass"),
            user_name: UAString::from("alice"),
            password: ByteString::from(&b"wonder"[..]),
            encryption_algorithm: UAString::null(),
        };
        let mut request = activate_request(response.authentication_token.clone());
        request.user_identity_token = ExtensionObject::from_message(
            ObjectId::UserNameIdentityToken_Encoding_DefaultBinary,
            &token,
        );
        assert!(manager.activate_session(&channel, &request).is_ok());

        // Wrong password.
        let token = UserNameIdentityToken {
            password: ByteString::from(&b"blunder"[..]),
            ..token
        };
        let mut request = activate_request(response.authentication_token);
        request.user_identity_token = ExtensionObject::from_message(
            ObjectId::UserNameIdentityToken_Encoding_DefaultBinary,
            &token,
        );
        assert_eq!(
            manager.activate_session(&channel, &request).unwrap_err(),
            StatusCode::BadUserAccessDenied
        );
    }
}
