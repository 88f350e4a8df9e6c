// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! The secure channel handles security on an OPC UA connection: it owns the security token,
//! the nonces, the sequence numbers, and the sign / encrypt paths for both the asymmetric
//! open secure channel handshake and the symmetric message stream.

use std::{
    io::{Cursor, Write},
    ops::Range,
    time::{Duration, Instant},
};

use bytes::Buf;
use hashbrown::HashMap;
use log::{error, trace, warn};

use uasc_crypto::{
    AesKey, CertificateStore, KeySize, PrivateKey, SecurityPolicy, X509,
};
use uasc_types::{
    write_bytes, write_u32, write_u8, BinaryDecodable, ByteString, ChannelSecurityToken, DateTime,
    DecodingOptions, Error, MessageSecurityMode, StatusCode,
};

use super::{
    message_chunk::{MessageChunk, MessageChunkHeader, MessageChunkType, MESSAGE_SIZE_OFFSET},
    security_header::{AsymmetricSecurityHeader, SecurityHeader, SymmetricSecurityHeader},
};

/// A sequence number may wrap back to a small value, but only once it has passed this limit.
pub const SEQUENCE_NUMBER_WRAP_LIMIT: u32 = 4_294_966_271;
/// The first sequence number after a wrap must be below this ceiling.
pub const SEQUENCE_NUMBER_WRAP_CEILING: u32 = 1024;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
/// Role of an application in OPC UA communication.
pub enum Role {
    /// Role is unknown.
    Unknown,
    /// Role is client.
    Client,
    /// Role is server.
    Server,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
/// Lifecycle state of a secure channel. The state only ever advances.
pub enum ChannelState {
    /// Created, no token issued yet.
    Fresh,
    /// The client has sent OPN and awaits the response. Client side only.
    Opening,
    /// A token is issued and messages flow.
    Open,
    /// Teardown has begun.
    Closing,
    /// The channel is dead. Terminal.
    Closed,
}

/// A security token with its creation time pinned to the monotonic clock. The wall-clock
/// `created_at` sent on the wire is produced at the serialization boundary and never used
/// for lifetime arithmetic.
#[derive(Debug, Clone)]
pub struct SecurityToken {
    /// Id of the secure channel the token belongs to.
    pub channel_id: u32,
    /// Id of the token itself.
    pub token_id: u32,
    /// When the token was created, on the monotonic clock.
    pub created_at: Instant,
    /// The granted lifetime.
    pub revised_lifetime: Duration,
}

impl SecurityToken {
    /// A token created now.
    pub fn new(channel_id: u32, token_id: u32, revised_lifetime_ms: u32) -> SecurityToken {
        SecurityToken {
            channel_id,
            token_id,
            created_at: Instant::now(),
            revised_lifetime: Duration::from_millis(revised_lifetime_ms as u64),
        }
    }

    /// The null token carried by a fresh channel.
    pub fn null() -> SecurityToken {
        SecurityToken::new(0, 0, 0)
    }

    /// The instant the token expires.
    pub fn deadline(&self) -> Instant {
        self.created_at + self.revised_lifetime
    }

    /// Whether the token has expired as of `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline() < now
    }

    /// The granted lifetime in milliseconds, as it goes on the wire.
    pub fn revised_lifetime_ms(&self) -> u32 {
        self.revised_lifetime.as_millis().min(u32::MAX as u128) as u32
    }

    /// Produce the wire form of the token. The wall clock timestamp is minted here.
    pub fn make_wire_token(&self) -> ChannelSecurityToken {
        ChannelSecurityToken {
            channel_id: self.channel_id,
            token_id: self.token_id,
            created_at: DateTime::now(),
            revised_lifetime: self.revised_lifetime_ms(),
        }
    }
}

/// The derived symmetric keys for one token epoch, both directions.
#[derive(Debug)]
struct TokenKeys {
    /// Our (signing key, encryption key, IV) for outbound messages.
    local: (Vec<u8>, AesKey, Vec<u8>),
    /// Their (signing key, decryption key, IV) for inbound messages.
    remote: (Vec<u8>, AesKey, Vec<u8>),
}

/// Holds all of the security information related to a connection.
#[derive(Debug)]
pub struct SecureChannel {
    /// The side of the secure channel that this role belongs to, client or server
    role: Role,
    /// Lifecycle state.
    state: ChannelState,
    /// The security policy for the connection, None or Encryption/Signing settings
    security_policy: SecurityPolicy,
    /// The security mode for the connection, None, Sign, SignAndEncrypt
    security_mode: MessageSecurityMode,
    /// The active security token.
    token: SecurityToken,
    /// The token issued by a Renew that has not been taken into use yet. Server side only;
    /// promoted by the first inbound MSG secured with it.
    next_token: Option<SecurityToken>,
    /// Our certificate
    cert: Option<X509>,
    /// Our private key
    private_key: Option<PrivateKey>,
    /// Their certificate
    remote_cert: Option<X509>,
    /// Their nonce provided by open secure channel
    remote_nonce: Vec<u8>,
    /// Our nonce generated while handling open secure channel
    local_nonce: Vec<u8>,
    /// Derived keys per token id. At most the active and the next token are retained.
    keys: HashMap<u32, TokenKeys>,
    /// Sequence number of the last chunk written.
    send_sequence_number: u32,
    /// Sequence number of the last chunk read, `None` until the open secure channel
    /// handshake establishes the initial value.
    last_received_sequence_number: Option<u32>,
    /// The last request id handed out.
    last_request_id: u32,
    /// Decoding options, from the negotiated transport limits.
    decoding_options: DecodingOptions,
}

impl SecureChannel {
    /// For testing purposes only
    #[cfg(test)]
    pub fn new_no_certificate_store() -> SecureChannel {
        SecureChannel {
            role: Role::Unknown,
            state: ChannelState::Fresh,
            security_policy: SecurityPolicy::None,
            security_mode: MessageSecurityMode::None,
            token: SecurityToken::null(),
            next_token: None,
            local_nonce: Vec::new(),
            remote_nonce: Vec::new(),
            cert: None,
            private_key: None,
            remote_cert: None,
            keys: HashMap::new(),
            send_sequence_number: 0,
            last_received_sequence_number: None,
            last_request_id: 0,
            decoding_options: DecodingOptions::default(),
        }
    }

    /// Create a new secure channel with the given certificate store and role.
    pub fn new(
        certificate_store: &CertificateStore,
        role: Role,
        decoding_options: DecodingOptions,
    ) -> SecureChannel {
        let cert = match certificate_store.read_own_cert() {
            Err(e) => {
                trace!("Channel has no own certificate: {e}, crypto policies won't work");
                None
            }
            Ok(r) => Some(r),
        };
        let private_key = match certificate_store.read_own_pkey() {
            Err(e) => {
                trace!("Channel has no own private key: {e}, crypto policies won't work");
                None
            }
            Ok(r) => Some(r),
        };
        SecureChannel {
            role,
            state: ChannelState::Fresh,
            security_mode: MessageSecurityMode::None,
            security_policy: SecurityPolicy::None,
            token: SecurityToken::null(),
            next_token: None,
            local_nonce: Vec::new(),
            remote_nonce: Vec::new(),
            cert,
            private_key,
            remote_cert: None,
            keys: HashMap::new(),
            send_sequence_number: 0,
            last_received_sequence_number: None,
            last_request_id: 0,
            decoding_options,
        }
    }

    /// Return `true` if this channel is for a client.
    pub fn is_client_role(&self) -> bool {
        self.role == Role::Client
    }

    /// The lifecycle state of the channel.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Advance the channel state. The state never goes backwards; a stale transition is
    /// ignored with a warning.
    pub fn set_state(&mut self, state: ChannelState) {
        if state < self.state {
            warn!(
                "Ignoring state transition backwards from {:?} to {:?}",
                self.state, state
            );
            return;
        }
        self.state = state;
    }

    /// Whether the channel is open.
    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    /// Set the application certificate.
    pub fn set_cert(&mut self, cert: Option<X509>) {
        self.cert = cert;
    }

    /// Get the application certificate.
    pub fn cert(&self) -> Option<X509> {
        self.cert.clone()
    }

    /// Set the remote certificate.
    pub fn set_remote_cert(&mut self, remote_cert: Option<X509>) {
        self.remote_cert = remote_cert;
    }

    /// Get the remote certificate.
    pub fn remote_cert(&self) -> Option<X509> {
        self.remote_cert.clone()
    }

    /// Set the application private key.
    pub fn set_private_key(&mut self, private_key: Option<PrivateKey>) {
        self.private_key = private_key;
    }

    /// Get the application security mode.
    pub fn security_mode(&self) -> MessageSecurityMode {
        self.security_mode
    }

    /// Set the application security mode.
    pub fn set_security_mode(&mut self, security_mode: MessageSecurityMode) {
        self.security_mode = security_mode;
    }

    /// Get the application security policy.
    pub fn security_policy(&self) -> SecurityPolicy {
        self.security_policy
    }

    /// Set the application security policy.
    pub fn set_security_policy(&mut self, security_policy: SecurityPolicy) {
        self.security_policy = security_policy;
    }

    /// Clear the configured security token.
    pub fn clear_security_token(&mut self) {
        self.token = SecurityToken::null();
        self.next_token = None;
        self.keys.clear();
    }

    /// Adopt a token received off the wire. Client side; the monotonic creation time is
    /// pinned to now, the wall clock copy in the wire token is ignored for lifetimes.
    pub fn set_security_token_from_wire(&mut self, wire_token: &ChannelSecurityToken) {
        self.token = SecurityToken::new(
            wire_token.channel_id,
            wire_token.token_id,
            wire_token.revised_lifetime,
        );
        self.next_token = None;
    }

    /// Issue a fresh token. Server side, during Open.
    pub fn issue_token(&mut self, channel_id: u32, token_id: u32, revised_lifetime_ms: u32) {
        self.token = SecurityToken::new(channel_id, token_id, revised_lifetime_ms);
    }

    /// Stage the renewal token. Server side, during Renew; it becomes active when the first
    /// message secured with it arrives.
    pub fn stage_next_token(&mut self, token_id: u32, revised_lifetime_ms: u32) {
        self.next_token = Some(SecurityToken::new(
            self.token.channel_id,
            token_id,
            revised_lifetime_ms,
        ));
    }

    /// The staged renewal token, if any.
    pub fn next_token(&self) -> Option<&SecurityToken> {
        self.next_token.as_ref()
    }

    /// The active security token.
    pub fn token(&self) -> &SecurityToken {
        &self.token
    }

    /// Reset the active token's creation time to now. The server calls this after the open
    /// response is serialized so the timeout counts from handshake completion.
    pub fn touch_token_created_at(&mut self) {
        self.token.created_at = Instant::now();
    }

    /// Reset the staged token's creation time to now, after the renew response is serialized.
    pub fn touch_next_token_created_at(&mut self) {
        if let Some(ref mut next) = self.next_token {
            next.created_at = Instant::now();
        }
    }

    /// Get the ID of the secure channel, this is chosen by the server.
    pub fn secure_channel_id(&self) -> u32 {
        self.token.channel_id
    }

    /// Get the ID of the active token.
    pub fn token_id(&self) -> u32 {
        self.token.token_id
    }

    /// Set the decoding options, e.g. after transport limits were negotiated.
    pub fn set_decoding_options(&mut self, decoding_options: DecodingOptions) {
        self.decoding_options = decoding_options;
    }

    /// Get the decoding options.
    pub fn decoding_options(&self) -> DecodingOptions {
        self.decoding_options.clone()
    }

    /// Hand out the next request id, a monotonic counter that skips 0.
    pub fn next_request_id(&mut self) -> u32 {
        self.last_request_id = self.last_request_id.wrapping_add(1).max(1);
        self.last_request_id
    }

    /// Test if the secure channel token needs to be renewed. The algorithm determines it
    /// needs to be renewed if the issue period has elapsed by 75% or more.
    pub fn should_renew_security_token(&self) -> bool {
        if self.token.token_id == 0 {
            false
        } else {
            let renew_after = self.token.revised_lifetime.mul_f64(0.75);
            Instant::now() >= self.token.created_at + renew_after
        }
    }

    /// The instant at which the renewal check should fire, 75% into the token lifetime.
    pub fn next_renewal_deadline(&self) -> Instant {
        self.token.created_at + self.token.revised_lifetime.mul_f64(0.75)
    }

    /// Makes a security header according to the type of message being sent, symmetric or
    /// asymmetric.
    pub fn make_security_header(&self, message_type: MessageChunkType) -> SecurityHeader {
        match message_type {
            MessageChunkType::OpenSecureChannel => {
                let asymmetric_security_header = if self.security_policy == SecurityPolicy::None {
                    AsymmetricSecurityHeader::none()
                } else {
                    let receiver_certificate_thumbprint =
                        if let Some(ref remote_cert) = self.remote_cert {
                            remote_cert.thumbprint().as_byte_string()
                        } else {
                            ByteString::null()
                        };
                    match self.cert {
                        Some(ref cert) => AsymmetricSecurityHeader::new(
                            self.security_policy,
                            cert,
                            receiver_certificate_thumbprint,
                        ),
                        None => {
                            error!("Channel has no own certificate under a crypto policy");
                            AsymmetricSecurityHeader::none()
                        }
                    }
                };
                SecurityHeader::Asymmetric(asymmetric_security_header)
            }
            _ => SecurityHeader::Symmetric(SymmetricSecurityHeader {
                token_id: self.token.token_id,
            }),
        }
    }

    /// Creates a nonce for the connection. The nonce should be the same size as the symmetric
    /// key.
    pub fn create_random_nonce(&mut self) {
        self.local_nonce
            .resize(self.security_policy.secure_channel_nonce_length(), 0);
        uasc_crypto::random::bytes(&mut self.local_nonce);
    }

    /// Sets the remote certificate from wire bytes.
    pub fn set_remote_cert_from_byte_string(
        &mut self,
        remote_cert: &ByteString,
    ) -> Result<(), Error> {
        self.remote_cert = if remote_cert.is_null() {
            None
        } else {
            Some(X509::from_byte_string(remote_cert)?)
        };
        Ok(())
    }

    /// Obtains the remote certificate as a byte string
    pub fn remote_cert_as_byte_string(&self) -> ByteString {
        if let Some(ref remote_cert) = self.remote_cert {
            remote_cert.as_byte_string()
        } else {
            ByteString::null()
        }
    }

    /// Set their nonce, validating its length against the policy.
    pub fn set_remote_nonce_from_byte_string(
        &mut self,
        remote_nonce: &ByteString,
    ) -> Result<(), Error> {
        if let Some(ref remote_nonce) = remote_nonce.value {
            if self.security_policy != SecurityPolicy::None
                && remote_nonce.len() != self.security_policy.secure_channel_nonce_length()
            {
                Err(Error::new(
                    StatusCode::BadNonceInvalid,
                    format!(
                        "Remote nonce is invalid length {}, expecting {}",
                        remote_nonce.len(),
                        self.security_policy.secure_channel_nonce_length()
                    ),
                ))
            } else {
                self.remote_nonce = remote_nonce.to_vec();
                Ok(())
            }
        } else if self.security_policy != SecurityPolicy::None {
            Err(Error::new(
                StatusCode::BadNonceInvalid,
                "Remote nonce is null under a crypto policy",
            ))
        } else {
            Ok(())
        }
    }

    /// Get the local nonce.
    pub fn local_nonce(&self) -> &[u8] {
        &self.local_nonce
    }

    /// Set the local nonce.
    pub fn set_local_nonce(&mut self, local_nonce: &[u8]) {
        self.local_nonce.clear();
        self.local_nonce.extend_from_slice(local_nonce);
    }

    /// Get the local nonce as a byte string.
    pub fn local_nonce_as_byte_string(&self) -> ByteString {
        if self.local_nonce.is_empty() {
            ByteString::null()
        } else {
            ByteString::from(&self.local_nonce[..])
        }
    }

    /// Set the remote nonce.
    pub fn set_remote_nonce(&mut self, remote_nonce: &[u8]) {
        self.remote_nonce.clear();
        self.remote_nonce.extend_from_slice(remote_nonce);
    }

    /// Get the remote nonce.
    pub fn remote_nonce(&self) -> &[u8] {
        &self.remote_nonce
    }

    /// Get the remote nonce as a byte string.
    pub fn remote_nonce_as_byte_string(&self) -> ByteString {
        if self.remote_nonce.is_empty() {
            ByteString::null()
        } else {
            ByteString::from(&self.remote_nonce[..])
        }
    }

    /// Part 6, 6.7.5. Derive the symmetric keys for `token_id` from the current nonce pair
    /// and retain only the keys of the active and staged tokens.
    pub fn derive_keys_for_token(&mut self, token_id: u32) {
        let local = self
            .security_policy
            .make_secure_channel_keys(&self.remote_nonce, &self.local_nonce);
        let remote = self
            .security_policy
            .make_secure_channel_keys(&self.local_nonce, &self.remote_nonce);
        self.keys.insert(token_id, TokenKeys { local, remote });

        let active = self.token.token_id;
        let staged = self.next_token.as_ref().map(|t| t.token_id);
        self.keys
            .retain(|id, _| *id == token_id || *id == active || Some(*id) == staged);
    }

    /// Derive the symmetric keys for the active token.
    pub fn derive_keys(&mut self) {
        self.derive_keys_for_token(self.token.token_id);
    }

    /// Validate the token id of an inbound symmetric message. Accepts the active token, and
    /// on the server the staged renewal token, which is promoted to active by its first use.
    /// Once promoted, the previous token is rejected.
    pub fn validate_token_id(&mut self, token_id: u32) -> Result<(), Error> {
        if token_id == self.token.token_id {
            return Ok(());
        }
        if let Some(next) = self.next_token.take() {
            if next.token_id == token_id {
                trace!(
                    "Token {} promoted to active, retiring token {}",
                    token_id,
                    self.token.token_id
                );
                let old = self.token.token_id;
                self.token = next;
                self.keys.remove(&old);
                return Ok(());
            }
            self.next_token = Some(next);
        }
        Err(Error::new(
            StatusCode::BadSecureChannelTokenUnknown,
            format!(
                "Token id {} matches neither the active token {} nor a staged renewal",
                token_id, self.token.token_id
            ),
        ))
    }

    /// Hand out the sequence number for the next outgoing chunk. The number is strictly
    /// increasing and may wrap to 1 only after passing the wrap limit.
    pub fn next_send_sequence_number(&mut self) -> u32 {
        if self.send_sequence_number >= SEQUENCE_NUMBER_WRAP_LIMIT {
            self.send_sequence_number = 1;
        } else {
            self.send_sequence_number += 1;
        }
        self.send_sequence_number
    }

    /// The sequence number of the last chunk sent.
    pub fn send_sequence_number(&self) -> u32 {
        self.send_sequence_number
    }

    /// The sequence number of the last chunk received, if any was received yet.
    pub fn last_received_sequence_number(&self) -> Option<u32> {
        self.last_received_sequence_number
    }

    /// Establish the receive sequence counter from the open secure channel handshake.
    pub fn reset_received_sequence_number(&mut self, sequence_number: u32) {
        self.last_received_sequence_number = Some(sequence_number);
    }

    /// Validate the sequence number of an inbound chunk against the last received one,
    /// honoring the wrap rule, and advance the counter.
    pub fn validate_received_sequence_number(&mut self, sequence_number: u32) -> Result<(), Error> {
        let Some(last) = self.last_received_sequence_number else {
            // First chunk on the channel establishes the counter.
            self.last_received_sequence_number = Some(sequence_number);
            return Ok(());
        };
        let wrapped = last >= SEQUENCE_NUMBER_WRAP_LIMIT
            && sequence_number < SEQUENCE_NUMBER_WRAP_CEILING;
        if sequence_number == last.wrapping_add(1) || wrapped {
            self.last_received_sequence_number = Some(sequence_number);
            Ok(())
        } else {
            Err(Error::new(
                StatusCode::BadSequenceNumberInvalid,
                format!(
                    "Chunk sequence number {} does not follow {}",
                    sequence_number, last
                ),
            ))
        }
    }

    /// Calculates the signature size for a message depending on the supplied security header
    pub fn signature_size(&self, security_header: &SecurityHeader) -> usize {
        // Signature size in bytes
        match security_header {
            SecurityHeader::Asymmetric(security_header) => {
                if !security_header.sender_certificate.is_null() {
                    X509::from_byte_string(&security_header.sender_certificate)
                        .and_then(|x509| x509.public_key())
                        .map(|pk| pk.size())
                        .unwrap_or(0)
                } else {
                    0
                }
            }
            SecurityHeader::Symmetric(_) => {
                // Signature size comes from policy
                self.security_policy.symmetric_signature_size()
            }
        }
    }

    // Extra padding required for keysize > 2048 bits (256 bytes)
    fn minimum_padding(key_length: usize) -> usize {
        if key_length <= 256 {
            1
        } else {
            2
        }
    }

    /// Get the plain text block size and minimum padding for this channel.
    /// Only applies when the message is encrypted, i.e. a crypto policy with mode
    /// SignAndEncrypt, or any OPN under a crypto policy.
    pub fn get_padding_block_sizes(
        &self,
        security_header: &SecurityHeader,
        signature_size: usize,
        message_type: MessageChunkType,
    ) -> (usize, usize) {
        if self.security_policy == SecurityPolicy::None
            || self.security_mode != MessageSecurityMode::SignAndEncrypt
                && !message_type.is_open_secure_channel()
        {
            return (0, 0);
        }

        match security_header {
            SecurityHeader::Asymmetric(security_header) => {
                if security_header.sender_certificate.is_null() {
                    (0, 0)
                } else {
                    // Padding requires we look at the remote certificate and security policy
                    let padding = self.security_policy.asymmetric_encryption_padding();
                    let Some(pk) = self
                        .remote_cert
                        .as_ref()
                        .and_then(|x509| x509.public_key().ok())
                    else {
                        return (0, 0);
                    };
                    (
                        pk.plain_text_block_size(padding),
                        Self::minimum_padding(pk.size()),
                    )
                }
            }
            SecurityHeader::Symmetric(_) => {
                // Plain text block size comes from policy
                (
                    self.security_policy.plain_block_size(),
                    Self::minimum_padding(signature_size),
                )
            }
        }
    }

    /// Calculate the padding size
    ///
    /// Padding adds bytes to the body to make it a multiple of the block size so it can be
    /// encrypted.
    pub fn padding_size(
        &self,
        security_header: &SecurityHeader,
        body_size: usize,
        signature_size: usize,
        message_type: MessageChunkType,
    ) -> (usize, usize) {
        let (plain_text_block_size, minimum_padding) =
            self.get_padding_block_sizes(security_header, signature_size, message_type);

        if plain_text_block_size == 0 {
            return (0, 0);
        }

        // PaddingSize = PlainTextBlockSize – ((BytesToWrite + SignatureSize + 1) % PlainTextBlockSize);
        let encrypt_size = 8 + body_size + signature_size + minimum_padding;
        let padding_size = if encrypt_size % plain_text_block_size != 0 {
            plain_text_block_size - (encrypt_size % plain_text_block_size)
        } else {
            0
        };
        (minimum_padding + padding_size, minimum_padding)
    }

    // Takes an unpadded message chunk and adds padding as well as space to the end to
    // accommodate a signature. Also modifies the message size to include the new
    // padding/signature.
    fn add_space_for_padding_and_signature(
        &self,
        message_chunk: &MessageChunk,
    ) -> Result<Vec<u8>, Error> {
        let chunk_info = message_chunk.chunk_info(self)?;
        let data = &message_chunk.data[..];

        let body_size = chunk_info.body_length();
        let security_header = chunk_info.security_header;

        // Signature size (if required)
        let signature_size = self.signature_size(&security_header);

        let (padding_size, minimum_padding) = self.padding_size(
            &security_header,
            body_size,
            signature_size,
            chunk_info.message_header.message_type,
        );

        let buffer = Vec::with_capacity(message_chunk.data.len() + padding_size + signature_size);
        let mut stream = Cursor::new(buffer);

        // First off just write out the src to the buffer. The message header, security
        // header, sequence header and payload.
        uasc_types::encoding::process_encode_io_result(stream.write_all(data))?;

        if padding_size > 0 {
            // A number of bytes are written out equal to the padding size.
            // Each byte is the padding size. So if padding size is 15 then
            // there will be 15 bytes all with the value 15
            if minimum_padding == 1 {
                let padding_byte = ((padding_size - 1) & 0xff) as u8;
                let _ = write_bytes(&mut stream, padding_byte, padding_size)?;
            } else if minimum_padding == 2 {
                // Padding and then extra padding
                let padding_byte = ((padding_size - 2) & 0xff) as u8;
                let extra_padding_byte = ((padding_size - 2) >> 8) as u8;
                let _ = write_bytes(&mut stream, padding_byte, padding_size - 1)?;
                write_u8(&mut stream, extra_padding_byte)?;
            }
        }

        // Write zeros for the signature
        let _ = write_bytes(&mut stream, 0u8, signature_size)?;

        // Update message header to reflect size with padding + signature
        let message_size = data.len() + padding_size + signature_size;
        Self::update_message_size_and_truncate(stream.into_inner(), message_size)
    }

    fn update_message_size(data: &mut [u8], message_size: usize) -> Result<(), Error> {
        // Read and rewrite the message_size in the header
        let mut stream = Cursor::new(data);
        stream.advance(MESSAGE_SIZE_OFFSET);
        write_u32(&mut stream, message_size as u32)
    }

    /// Writes message size and truncates the message to fit.
    pub fn update_message_size_and_truncate(
        mut data: Vec<u8>,
        message_size: usize,
    ) -> Result<Vec<u8>, Error> {
        Self::update_message_size(&mut data[..], message_size)?;
        // Truncate vector to the size
        data.truncate(message_size);
        Ok(data)
    }

    fn log_crypto_data(message: &str, data: &[u8]) {
        crate::debug::log_buffer(message, data);
    }

    /// Applies security to a message chunk and yields an encrypted/signed block to be
    /// streamed.
    pub fn apply_security(
        &self,
        message_chunk: &MessageChunk,
        dst: &mut [u8],
    ) -> Result<usize, Error> {
        let size = if self.security_policy != SecurityPolicy::None
            && (self.security_mode == MessageSecurityMode::Sign
                || self.security_mode == MessageSecurityMode::SignAndEncrypt)
        {
            let encrypted_data_offset =
                message_chunk.encrypted_data_offset(&self.decoding_options)?;

            // S - Message Header
            // S - Security Header
            // S - Sequence Header - E
            // S - Body            - E
            // S - Padding         - E
            //     Signature       - E

            let mut data = self.add_space_for_padding_and_signature(message_chunk)?;
            Self::log_crypto_data("Chunk before padding", &message_chunk.data[..]);
            Self::log_crypto_data("Chunk after padding", &data[..]);

            // Encrypted range is from the sequence header to the end
            let encrypted_range = encrypted_data_offset..data.len();

            // Encrypt and sign - open secure channel
            let encrypted_size = if message_chunk.is_open_secure_channel(&self.decoding_options) {
                self.asymmetric_sign_and_encrypt(
                    self.security_policy,
                    &mut data,
                    encrypted_range,
                    dst,
                )?
            } else {
                // Symmetric encrypt and sign
                let signed_range =
                    0..(data.len() - self.security_policy.symmetric_signature_size());
                self.symmetric_sign_and_encrypt(&mut data, signed_range, encrypted_range, dst)?
            };

            Self::log_crypto_data("Chunk after encryption", &dst[..encrypted_size]);

            encrypted_size
        } else {
            let size = message_chunk.data.len();
            if size > dst.len() {
                return Err(Error::new(
                    StatusCode::BadEncodingLimitsExceeded,
                    format!(
                        "Message chunk size {} exceeds the destination buffer size {}",
                        size,
                        dst.len()
                    ),
                ));
            }
            dst[..size].copy_from_slice(&message_chunk.data[..]);
            size
        };
        Ok(size)
    }

    /// Decrypts and verifies the body data if the mode / policy requires it. For symmetric
    /// messages the token id in the security header is validated against the active and
    /// staged tokens, promoting a staged renewal token on first use.
    pub fn verify_and_remove_security(&mut self, src: &[u8]) -> Result<MessageChunk, Error> {
        // Get message & security header from data
        let decoding_options = self.decoding_options();
        let (message_header, security_header, encrypted_data_offset) = {
            let mut stream = Cursor::new(&src);
            let message_header = MessageChunkHeader::decode(&mut stream, &decoding_options)?;
            let security_header = SecurityHeader::decode_from_stream(
                &mut stream,
                message_header.message_type.is_open_secure_channel(),
                &decoding_options,
            )?;
            let encrypted_data_offset = stream.position() as usize;
            (message_header, security_header, encrypted_data_offset)
        };

        let message_size = message_header.message_size as usize;
        if message_size != src.len() {
            return Err(Error::new(
                StatusCode::BadDecodingError,
                format!(
                    "The message size {} is not the same as the supplied buffer {}",
                    message_size,
                    src.len()
                ),
            ));
        }

        // S - Message Header
        // S - Security Header
        // S - Sequence Header - E
        // S - Body            - E
        // S - Padding         - E
        //     Signature       - E
        let data = if message_header.message_type.is_open_secure_channel() {
            // The OpenSecureChannel is the first thing we receive so we must examine
            // the security policy and use it to determine if the packet must be decrypted.
            let encrypted_range = encrypted_data_offset..message_size;

            let SecurityHeader::Asymmetric(security_header) = security_header else {
                return Err(Error::new(
                    StatusCode::BadSecurityChecksFailed,
                    "OPN chunk carries a symmetric security header",
                ));
            };

            // The security policy dictates the encryption / signature algorithms used by the
            // request
            let security_policy_uri = security_header.security_policy_uri.as_ref();
            let security_policy = SecurityPolicy::from_uri(security_policy_uri);
            match security_policy {
                SecurityPolicy::Unknown => {
                    return Err(Error::new(StatusCode::BadSecurityPolicyRejected, format!(
                        "Security policy \"{}\" provided by the peer is unknown so it has been rejected", security_policy_uri
                    )));
                }
                SecurityPolicy::None => {
                    // Nothing to do
                    return Ok(MessageChunk { data: src.to_vec() });
                }
                _ => {}
            }
            self.security_policy = security_policy;

            // The OpenSecureChannel messages are always signed and encrypted if the
            // SecurityMode is not None, even when the mode is Sign rather than
            // SignAndEncrypt. Decrypt using our private key, verify the signature with the
            // sender's public key.
            if security_header.sender_certificate.is_null() {
                return Err(Error::new(
                    StatusCode::BadCertificateInvalid,
                    "Sender certificate is null",
                ));
            }

            let sender_certificate = X509::from_byte_string(&security_header.sender_certificate)?;
            let verification_key = sender_certificate.public_key()?;
            let receiver_thumbprint = security_header.receiver_certificate_thumbprint;

            let mut decrypted_data = vec![0u8; message_size];
            let decrypted_size = self.asymmetric_decrypt_and_verify(
                security_policy,
                &verification_key,
                receiver_thumbprint,
                src,
                encrypted_range,
                &mut decrypted_data,
            )?;

            Self::update_message_size_and_truncate(decrypted_data, decrypted_size)?
        } else if self.security_policy != SecurityPolicy::None
            && (self.security_mode == MessageSecurityMode::Sign
                || self.security_mode == MessageSecurityMode::SignAndEncrypt)
        {
            // Symmetric decrypt and verify
            let signature_size = self.security_policy.symmetric_signature_size();
            let encrypted_range = encrypted_data_offset..message_size;
            let signed_range = 0..(message_size - signature_size);

            let SecurityHeader::Symmetric(security_header) = security_header else {
                return Err(Error::new(
                    StatusCode::BadSecurityChecksFailed,
                    format!(
                        "Expected symmetric security header, got {:?}",
                        security_header
                    ),
                ));
            };

            self.validate_token_id(security_header.token_id)?;

            let mut decrypted_data = vec![0u8; message_size];
            let decrypted_size = self.symmetric_decrypt_and_verify(
                src,
                signed_range,
                encrypted_range,
                security_header.token_id,
                &mut decrypted_data,
            )?;

            // Value returned from symmetric_decrypt_and_verify is the end of the actual
            // decrypted data.
            Self::update_message_size_and_truncate(decrypted_data, decrypted_size)?
        } else {
            if let SecurityHeader::Symmetric(security_header) = &security_header {
                self.validate_token_id(security_header.token_id)?;
            }
            src.to_vec()
        };

        Ok(MessageChunk { data })
    }

    /// Use the security policy to asymmetric encrypt and sign the specified chunk of data.
    /// Signs the source data in place.
    fn asymmetric_sign_and_encrypt(
        &self,
        security_policy: SecurityPolicy,
        src: &mut [u8],
        encrypted_range: Range<usize>,
        dst: &mut [u8],
    ) -> Result<usize, Error> {
        let header_size = encrypted_range.start;

        let signing_key = self.private_key.as_ref().ok_or_else(|| {
            Error::new(
                StatusCode::BadSecurityChecksFailed,
                "Channel has no private key to sign with",
            )
        })?;
        let signing_key_size = signing_key.size();

        let signed_range = 0..(encrypted_range.end - signing_key_size);
        let signature_range = signed_range.end..encrypted_range.end;

        let encryption_key = self
            .remote_cert
            .as_ref()
            .ok_or_else(|| {
                Error::new(
                    StatusCode::BadSecurityChecksFailed,
                    "Channel has no remote certificate to encrypt for",
                )
            })?
            .public_key()?;

        // Encryption will change the size of the chunk. Since we sign before encrypting, we
        // need to compute that size and change the message header to be that new size.
        let cipher_text_size = {
            let padding = security_policy.asymmetric_encryption_padding();
            let plain_text_size = encrypted_range.end - encrypted_range.start;
            encryption_key.calculate_cipher_text_size(plain_text_size, padding)
        };
        Self::update_message_size(src, header_size + cipher_text_size)?;
        dst[0..encrypted_range.start].copy_from_slice(&src[0..encrypted_range.start]);

        // Sign the message header, security header, sequence header, body, padding
        let (l, r) = src.split_at_mut(signed_range.end);
        security_policy.asymmetric_sign(signing_key, l, &mut r[0..signing_key_size])?;

        debug_assert_eq!(encrypted_range.end, signature_range.end);

        // Encrypt the sequence header, payload, signature portion into dst
        let encrypted_size = security_policy.asymmetric_encrypt(
            &encryption_key,
            &src[encrypted_range.clone()],
            &mut dst[encrypted_range.start..],
        )?;

        // Validate encrypted size is right
        if encrypted_size != cipher_text_size {
            return Err(Error::new(
                StatusCode::BadUnexpectedError,
                format!(
                    "Encrypted block size {} is not the same as calculated cipher text size {}",
                    encrypted_size, cipher_text_size
                ),
            ));
        }

        Ok(header_size + encrypted_size)
    }

    fn check_padding_bytes(
        padding_bytes: &[u8],
        expected_padding_byte: u8,
        padding_range_start: usize,
    ) -> Result<(), Error> {
        for (i, b) in padding_bytes.iter().enumerate() {
            if *b != expected_padding_byte {
                return Err(Error::new(
                    StatusCode::BadSecurityChecksFailed,
                    format!(
                        "Expected padding byte {}, got {} at index {}",
                        expected_padding_byte,
                        *b,
                        padding_range_start + i
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Verify that the padding is correct. Padding is expected to be before the supplied
    /// padding end index.
    ///
    /// Function returns the padding range so caller can strip the range if it so desires.
    fn verify_padding(
        &self,
        src: &[u8],
        key_size: usize,
        padding_end: usize,
    ) -> Result<Range<usize>, Error> {
        let padding_range = if key_size > 256 {
            let padding_byte = src[padding_end - 2];
            let extra_padding_byte = src[padding_end - 1];
            let padding_size = ((extra_padding_byte as usize) << 8) + (padding_byte as usize);
            let padding_range = (padding_end - padding_size - 2)..padding_end;

            // Check padding bytes and extra padding byte
            Self::check_padding_bytes(
                &src[padding_range.start..(padding_range.end - 1)],
                padding_byte,
                padding_range.start,
            )?;
            if src[padding_range.end - 1] != extra_padding_byte {
                return Err(Error::new(
                    StatusCode::BadSecurityChecksFailed,
                    format!(
                        "Expected extra padding byte {}, at index {}",
                        extra_padding_byte, padding_range.start
                    ),
                ));
            }
            padding_range
        } else {
            let padding_byte = src[padding_end - 1];
            let padding_size = padding_byte as usize;
            let padding_range = (padding_end - padding_size - 1)..padding_end;
            // Check padding bytes
            Self::check_padding_bytes(
                &src[padding_range.clone()],
                padding_byte,
                padding_range.start,
            )?;
            padding_range
        };
        Ok(padding_range)
    }

    fn asymmetric_decrypt_and_verify(
        &self,
        security_policy: SecurityPolicy,
        verification_key: &uasc_crypto::PublicKey,
        receiver_thumbprint: ByteString,
        src: &[u8],
        encrypted_range: Range<usize>,
        dst: &mut [u8],
    ) -> Result<usize, Error> {
        if !security_policy.is_supported() {
            return Err(Error::new(
                StatusCode::BadSecurityPolicyRejected,
                format!(
                    "Security policy {security_policy} cannot decrypt and verify and has been rejected",
                ),
            ));
        }

        // The receiver certificate thumbprint identifies which of our certs was used by the
        // sender to encrypt the message.
        let our_cert = self.cert.as_ref().ok_or_else(|| {
            Error::new(
                StatusCode::BadNoValidCertificates,
                "Channel has no own certificate",
            )
        })?;
        let our_thumbprint = our_cert.thumbprint();
        if our_thumbprint.value() != receiver_thumbprint.as_ref() {
            return Err(Error::new(
                StatusCode::BadNoValidCertificates,
                "Supplied thumbprint does not match application certificate's thumbprint",
            ));
        }

        // Copy message, security header
        dst[..encrypted_range.start].copy_from_slice(&src[..encrypted_range.start]);

        // Decrypt and copy encrypted block.
        // Note that the unencrypted size can be less than the encrypted size due to removal
        // of padding, so the ranges that were supplied to this function must be offset to
        // compensate.
        let encrypted_size = encrypted_range.end - encrypted_range.start;
        let mut decrypted_tmp = vec![0u8; encrypted_size];

        let private_key = self.private_key.as_ref().ok_or_else(|| {
            Error::new(
                StatusCode::BadSecurityChecksFailed,
                "Channel has no private key to decrypt with",
            )
        })?;
        let decrypted_size = security_policy.asymmetric_decrypt(
            private_key,
            &src[encrypted_range.clone()],
            &mut decrypted_tmp,
        )?;

        let verification_key_signature_size = verification_key.size();

        // Copy the bytes to dst
        dst[encrypted_range.start..(encrypted_range.start + decrypted_size)]
            .copy_from_slice(&decrypted_tmp[0..decrypted_size]);

        // The signature range is at the end of the decrypted block for the verification
        // key's signature
        let signature_dst_offset =
            encrypted_range.start + decrypted_size - verification_key_signature_size;
        let signature_range_dst =
            signature_dst_offset..(signature_dst_offset + verification_key_signature_size);

        // The signed range is from 0 to the end of the plaintext except for key size
        let signed_range_dst = 0..signature_dst_offset;

        // Keysize for padding is our public key length if available
        let key_size = match self.cert.as_ref().and_then(|c| c.public_key().ok()) {
            Some(pk) => pk.size(),
            None => verification_key.size(),
        };
        security_policy.asymmetric_verify_signature(
            verification_key,
            &dst[signed_range_dst],
            &dst[signature_range_dst.clone()],
        )?;

        // Verify that the padding is correct
        let padding_range = self.verify_padding(dst, key_size, signature_range_dst.start)?;

        // Decrypted and verified into dst
        Ok(padding_range.start)
    }

    fn token_keys(&self, token_id: u32) -> Result<&TokenKeys, Error> {
        self.keys.get(&token_id).ok_or_else(|| {
            Error::new(
                StatusCode::BadSecureChannelTokenUnknown,
                format!("No keys derived for token {token_id}"),
            )
        })
    }

    fn local_keys(&self) -> Result<&(Vec<u8>, AesKey, Vec<u8>), Error> {
        Ok(&self.token_keys(self.token.token_id)?.local)
    }

    fn remote_keys(&self, token_id: u32) -> Result<&(Vec<u8>, AesKey, Vec<u8>), Error> {
        Ok(&self.token_keys(token_id)?.remote)
    }

    /// Encode data using security. Destination buffer is expected to be same size as src and
    /// expected to have space for a signature if a signature is to be appended
    ///
    /// Signing is done first and then encryption
    ///
    /// S - Message Header
    /// S - Security Header
    /// S - Sequence Header - E
    /// S - Body            - E
    /// S - Padding         - E
    ///     Signature       - E
    pub fn symmetric_sign_and_encrypt(
        &self,
        src: &mut [u8],
        signed_range: Range<usize>,
        encrypted_range: Range<usize>,
        dst: &mut [u8],
    ) -> Result<usize, Error> {
        match self.security_mode {
            MessageSecurityMode::None => {
                // Just copy data to out
                dst[..src.len()].copy_from_slice(src);
                Ok(src.len())
            }
            MessageSecurityMode::Sign => {
                let size = self.symmetric_sign_in_place(src, signed_range)?;
                dst[0..size].copy_from_slice(&src[0..size]);
                Ok(size)
            }
            MessageSecurityMode::SignAndEncrypt => {
                // Sign the block
                self.symmetric_sign_in_place(src, signed_range)?;

                // Encrypt the sequence header, payload, signature
                let keys = self.local_keys()?;
                let (key, iv) = (&keys.1, &keys.2);
                let encrypted_size = self.security_policy.symmetric_encrypt(
                    key,
                    iv,
                    &src[encrypted_range.clone()],
                    &mut dst[encrypted_range.start..],
                )?;
                // Copy the message header / security header
                dst[..encrypted_range.start].copy_from_slice(&src[..encrypted_range.start]);

                Ok(encrypted_range.start + encrypted_size)
            }
            MessageSecurityMode::Invalid => Err(Error::new(
                StatusCode::BadSecurityChecksFailed,
                "Message security mode is invalid",
            )),
        }
    }

    fn symmetric_sign_in_place(
        &self,
        buf: &mut [u8],
        signed_range: Range<usize>,
    ) -> Result<usize, Error> {
        let signature_size = self.security_policy.symmetric_signature_size();

        // Sign the message header, security header, sequence header, body, padding
        let keys = self.local_keys()?;
        let signing_key = &keys.0;
        let (l, r) = buf.split_at_mut(signed_range.end);
        self.security_policy
            .symmetric_sign(signing_key, l, &mut r[0..signature_size])?;

        Ok(signed_range.end + signature_size)
    }

    /// Decrypts and verifies data.
    ///
    /// Returns the size of the decrypted data
    ///
    /// S - Message Header
    /// S - Security Header
    /// S - Sequence Header - E
    /// S - Body            - E
    /// S - Padding         - E
    ///     Signature       - E
    pub fn symmetric_decrypt_and_verify(
        &self,
        src: &[u8],
        signed_range: Range<usize>,
        encrypted_range: Range<usize>,
        token_id: u32,
        dst: &mut [u8],
    ) -> Result<usize, Error> {
        match self.security_mode {
            MessageSecurityMode::None => {
                // Just copy everything from src to dst
                dst[..src.len()].copy_from_slice(src);
                Ok(src.len())
            }
            MessageSecurityMode::Sign => {
                dst[..src.len()].copy_from_slice(src);
                // Copy everything
                let signature_range = signed_range.end..src.len();
                let keys = self.remote_keys(token_id)?;
                let verification_key = &keys.0;
                self.security_policy.symmetric_verify_signature(
                    verification_key,
                    &dst[signed_range.clone()],
                    &dst[signature_range],
                )?;

                Ok(signed_range.end)
            }
            MessageSecurityMode::SignAndEncrypt => {
                let ciphertext_size = encrypted_range.end - encrypted_range.start;

                // Copy security header
                dst[..encrypted_range.start].copy_from_slice(&src[..encrypted_range.start]);

                // Decrypt encrypted portion. tmp includes +16 for the block size.
                let mut decrypted_tmp = vec![0u8; ciphertext_size + 16];
                let keys = self.remote_keys(token_id)?;
                let (key, iv) = (&keys.1, &keys.2);

                let decrypted_size = self.security_policy.symmetric_decrypt(
                    key,
                    iv,
                    &src[encrypted_range.clone()],
                    &mut decrypted_tmp[..],
                )?;

                let encrypted_range =
                    encrypted_range.start..(encrypted_range.start + decrypted_size);
                dst[encrypted_range.clone()].copy_from_slice(&decrypted_tmp[..decrypted_size]);
                Self::log_crypto_data("Decrypted buffer", &dst[..encrypted_range.end]);

                // Verify signature (after encrypted portion)
                let signature_range = (encrypted_range.end
                    - self.security_policy.symmetric_signature_size())
                    ..encrypted_range.end;
                let verification_key = &self.remote_keys(token_id)?.0;
                let signature_start = signature_range.start;
                self.security_policy.symmetric_verify_signature(
                    verification_key,
                    &dst[signed_range],
                    &dst[signature_range],
                )?;

                let key_size = key.key_length();

                // Verify that the padding is correct and get the padded range.
                let padding_range = self.verify_padding(dst, key_size, signature_start)?;

                // Decrypted range minus padding and signature.
                Ok(padding_range.start)
            }
            MessageSecurityMode::Invalid => Err(Error::new(
                StatusCode::BadSecurityChecksFailed,
                "Message security mode is invalid",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_only_advances() {
        let mut channel = SecureChannel::new_no_certificate_store();
        assert_eq!(channel.state(), ChannelState::Fresh);
        channel.set_state(ChannelState::Open);
        assert_eq!(channel.state(), ChannelState::Open);
        channel.set_state(ChannelState::Fresh);
        assert_eq!(channel.state(), ChannelState::Open);
        channel.set_state(ChannelState::Closed);
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[test]
    fn send_sequence_number_monotonic_and_wraps() {
        let mut channel = SecureChannel::new_no_certificate_store();
        let mut last = 0;
        for _ in 0..100 {
            let next = channel.next_send_sequence_number();
            assert_eq!(next, last + 1);
            last = next;
        }

        // Force the counter to the wrap region.
        channel.send_sequence_number = SEQUENCE_NUMBER_WRAP_LIMIT;
        assert_eq!(channel.next_send_sequence_number(), 1);
        assert_eq!(channel.next_send_sequence_number(), 2);
    }

    #[test]
    fn received_sequence_number_validation() {
        let mut channel = SecureChannel::new_no_certificate_store();
        // First chunk establishes the counter at any value.
        channel.validate_received_sequence_number(10).unwrap();
        channel.validate_received_sequence_number(11).unwrap();
        // Gaps and repeats are rejected.
        assert!(channel.validate_received_sequence_number(11).is_err());
        assert!(channel.validate_received_sequence_number(13).is_err());
        // Counter did not advance on failure.
        assert_eq!(channel.last_received_sequence_number(), Some(11));

        // Wrap is accepted only above the limit, to a small value.
        channel.reset_received_sequence_number(SEQUENCE_NUMBER_WRAP_LIMIT + 1);
        channel.validate_received_sequence_number(5).unwrap();
        assert_eq!(channel.last_received_sequence_number(), Some(5));

        // Below the limit a small value is a plain violation.
        channel.reset_received_sequence_number(100_000);
        assert!(channel.validate_received_sequence_number(5).is_err());
    }

    #[test]
    fn token_promotion() {
        let mut channel = SecureChannel::new_no_certificate_store();
        channel.issue_token(7, 1, 10_000);
        channel.set_local_nonce(b"aaaabbbbccccdddd");
        channel.set_remote_nonce(b"ddddccccbbbbaaaa");

        assert!(channel.validate_token_id(1).is_ok());
        assert!(channel.validate_token_id(2).is_err());

        channel.stage_next_token(2, 10_000);
        // Both tokens are valid while the renewal is staged.
        assert!(channel.validate_token_id(1).is_ok());
        // First use of the next token promotes it.
        assert!(channel.validate_token_id(2).is_ok());
        assert_eq!(channel.token_id(), 2);
        assert!(channel.next_token().is_none());
        // The previous token is rejected from now on.
        assert!(channel.validate_token_id(1).is_err());
        assert!(channel.validate_token_id(2).is_ok());
    }

    #[test]
    fn token_expiry_uses_monotonic_clock() {
        let token = SecurityToken::new(1, 1, 50);
        let now = Instant::now();
        assert!(!token.is_expired(now));
        assert!(token.is_expired(now + Duration::from_millis(51)));
        let wire = token.make_wire_token();
        assert_eq!(wire.channel_id, 1);
        assert_eq!(wire.revised_lifetime, 50);
    }
}
