// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Session service messages: CreateSession, ActivateSession, CloseSession, and the user
//! identity tokens carried by ActivateSession.

use std::io::{Read, Write};

use crate::{
    byte_string::ByteString,
    encoding::{BinaryDecodable, BinaryEncodable, DecodingOptions, EncodingResult},
    extension_object::ExtensionObject,
    node_id::NodeId,
    request_header::RequestHeader,
    response_header::ResponseHeader,
    service_types::endpoints::{ApplicationDescription, EndpointDescription},
    status_code::StatusCode,
    string::UAString,
};

/// A digital signature over data, with the algorithm that produced it.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SignatureData {
    /// URI of the signature algorithm.
    pub algorithm: UAString,
    /// The signature bytes.
    pub signature: ByteString,
}

impl BinaryEncodable for SignatureData {
    fn byte_len(&self) -> usize {
        self.algorithm.byte_len() + self.signature.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.algorithm.encode(stream)?;
        self.signature.encode(stream)
    }
}

impl BinaryDecodable for SignatureData {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(SignatureData {
            algorithm: UAString::decode(stream, options)?,
            signature: ByteString::decode(stream, options)?,
        })
    }
}

/// Asks the server to create a session on the secure channel.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateSessionRequest {
    /// Common request header.
    pub request_header: RequestHeader,
    /// Description of the client application.
    pub client_description: ApplicationDescription,
    /// URI of the server the client expects to talk to.
    pub server_uri: UAString,
    /// The URL the client used to reach the server.
    pub endpoint_url: UAString,
    /// Human readable session name.
    pub session_name: UAString,
    /// A fresh 32-byte nonce, present when the channel security mode is not None.
    pub client_nonce: ByteString,
    /// The client certificate in DER form.
    pub client_certificate: ByteString,
    /// Session timeout the client would like, in milliseconds.
    pub requested_session_timeout: f64,
    /// Largest response the client accepts.
    pub max_response_message_size: u32,
}

impl BinaryEncodable for CreateSessionRequest {
    fn byte_len(&self) -> usize {
        self.request_header.byte_len()
            + self.client_description.byte_len()
            + self.server_uri.byte_len()
            + self.endpoint_url.byte_len()
            + self.session_name.byte_len()
            + self.client_nonce.byte_len()
            + self.client_certificate.byte_len()
            + 8
            + 4
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.request_header.encode(stream)?;
        self.client_description.encode(stream)?;
        self.server_uri.encode(stream)?;
        self.endpoint_url.encode(stream)?;
        self.session_name.encode(stream)?;
        self.client_nonce.encode(stream)?;
        self.client_certificate.encode(stream)?;
        self.requested_session_timeout.encode(stream)?;
        self.max_response_message_size.encode(stream)
    }
}

impl BinaryDecodable for CreateSessionRequest {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(CreateSessionRequest {
            request_header: RequestHeader::decode(stream, options)?,
            client_description: ApplicationDescription::decode(stream, options)?,
            server_uri: UAString::decode(stream, options)?,
            endpoint_url: UAString::decode(stream, options)?,
            session_name: UAString::decode(stream, options)?,
            client_nonce: ByteString::decode(stream, options)?,
            client_certificate: ByteString::decode(stream, options)?,
            requested_session_timeout: f64::decode(stream, options)?,
            max_response_message_size: u32::decode(stream, options)?,
        })
    }
}

/// The server's answer to a [`CreateSessionRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct CreateSessionResponse {
    /// Common response header.
    pub response_header: ResponseHeader,
    /// The server-assigned session id.
    pub session_id: NodeId,
    /// The secret token identifying the session in later requests.
    pub authentication_token: NodeId,
    /// The granted session timeout in milliseconds.
    pub revised_session_timeout: f64,
    /// The server's fresh nonce.
    pub server_nonce: ByteString,
    /// The server certificate in DER form.
    pub server_certificate: ByteString,
    /// The endpoints the server offers, so the client can verify its selection.
    pub server_endpoints: Option<Vec<EndpointDescription>>,
    /// The server's signature over (client certificate | client nonce).
    pub server_signature: SignatureData,
    /// Largest request the server accepts.
    pub max_request_message_size: u32,
}

impl BinaryEncodable for CreateSessionResponse {
    fn byte_len(&self) -> usize {
        self.response_header.byte_len()
            + self.session_id.byte_len()
            + self.authentication_token.byte_len()
            + 8
            + self.server_nonce.byte_len()
            + self.server_certificate.byte_len()
            + self.server_endpoints.byte_len()
            + self.server_signature.byte_len()
            + 4
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.response_header.encode(stream)?;
        self.session_id.encode(stream)?;
        self.authentication_token.encode(stream)?;
        self.revised_session_timeout.encode(stream)?;
        self.server_nonce.encode(stream)?;
        self.server_certificate.encode(stream)?;
        self.server_endpoints.encode(stream)?;
        self.server_signature.encode(stream)?;
        self.max_request_message_size.encode(stream)
    }
}

impl BinaryDecodable for CreateSessionResponse {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(CreateSessionResponse {
            response_header: ResponseHeader::decode(stream, options)?,
            session_id: NodeId::decode(stream, options)?,
            authentication_token: NodeId::decode(stream, options)?,
            revised_session_timeout: f64::decode(stream, options)?,
            server_nonce: ByteString::decode(stream, options)?,
            server_certificate: ByteString::decode(stream, options)?,
            server_endpoints: BinaryDecodable::decode(stream, options)?,
            server_signature: SignatureData::decode(stream, options)?,
            max_request_message_size: u32::decode(stream, options)?,
        })
    }
}

/// Activates a created session, supplying the user identity.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivateSessionRequest {
    /// Common request header. The authentication token names the session to activate.
    pub request_header: RequestHeader,
    /// The client's signature over (server certificate | server nonce), present when the
    /// channel security mode is not None.
    pub client_signature: SignatureData,
    /// Software certificates, unused by this stack.
    pub client_software_certificates: Option<Vec<ExtensionObject>>,
    /// Locales in order of preference.
    pub locale_ids: Option<Vec<UAString>>,
    /// The user identity token, one of the identity token types in this module.
    pub user_identity_token: ExtensionObject,
    /// Signature provided with the user token, for Certificate tokens.
    pub user_token_signature: SignatureData,
}

impl BinaryEncodable for ActivateSessionRequest {
    fn byte_len(&self) -> usize {
        self.request_header.byte_len()
            + self.client_signature.byte_len()
            + self.client_software_certificates.byte_len()
            + self.locale_ids.byte_len()
            + self.user_identity_token.byte_len()
            + self.user_token_signature.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.request_header.encode(stream)?;
        self.client_signature.encode(stream)?;
        self.client_software_certificates.encode(stream)?;
        self.locale_ids.encode(stream)?;
        self.user_identity_token.encode(stream)?;
        self.user_token_signature.encode(stream)
    }
}

impl BinaryDecodable for ActivateSessionRequest {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(ActivateSessionRequest {
            request_header: RequestHeader::decode(stream, options)?,
            client_signature: SignatureData::decode(stream, options)?,
            client_software_certificates: BinaryDecodable::decode(stream, options)?,
            locale_ids: BinaryDecodable::decode(stream, options)?,
            user_identity_token: ExtensionObject::decode(stream, options)?,
            user_token_signature: SignatureData::decode(stream, options)?,
        })
    }
}

/// The server's answer to an [`ActivateSessionRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct ActivateSessionResponse {
    /// Common response header.
    pub response_header: ResponseHeader,
    /// The server's next fresh nonce.
    pub server_nonce: ByteString,
    /// Results for the software certificates, unused by this stack.
    pub results: Option<Vec<StatusCode>>,
    /// Diagnostics, unused by this stack.
    pub diagnostic_infos: Option<Vec<UAString>>,
}

impl BinaryEncodable for ActivateSessionResponse {
    fn byte_len(&self) -> usize {
        self.response_header.byte_len()
            + self.server_nonce.byte_len()
            + self.results.byte_len()
            + self.diagnostic_infos.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.response_header.encode(stream)?;
        self.server_nonce.encode(stream)?;
        self.results.encode(stream)?;
        self.diagnostic_infos.encode(stream)
    }
}

impl BinaryDecodable for ActivateSessionResponse {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(ActivateSessionResponse {
            response_header: ResponseHeader::decode(stream, options)?,
            server_nonce: ByteString::decode(stream, options)?,
            results: BinaryDecodable::decode(stream, options)?,
            diagnostic_infos: BinaryDecodable::decode(stream, options)?,
        })
    }
}

/// Closes a session.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseSessionRequest {
    /// Common request header.
    pub request_header: RequestHeader,
    /// Whether to delete subscriptions owned by the session. This stack has no
    /// subscriptions so the flag only travels on the wire.
    pub delete_subscriptions: bool,
}

impl BinaryEncodable for CloseSessionRequest {
    fn byte_len(&self) -> usize {
        self.request_header.byte_len() + 1
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.request_header.encode(stream)?;
        self.delete_subscriptions.encode(stream)
    }
}

impl BinaryDecodable for CloseSessionRequest {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(CloseSessionRequest {
            request_header: RequestHeader::decode(stream, options)?,
            delete_subscriptions: bool::decode(stream, options)?,
        })
    }
}

/// The server's answer to a [`CloseSessionRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct CloseSessionResponse {
    /// Common response header.
    pub response_header: ResponseHeader,
}

impl BinaryEncodable for CloseSessionResponse {
    fn byte_len(&self) -> usize {
        self.response_header.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.response_header.encode(stream)
    }
}

impl BinaryDecodable for CloseSessionResponse {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(CloseSessionResponse {
            response_header: ResponseHeader::decode(stream, options)?,
        })
    }
}

/// The anonymous identity token. Carries only the policy id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AnonymousIdentityToken {
    /// Id of the user token policy this token answers.
    pub policy_id: UAString,
}

impl BinaryEncodable for AnonymousIdentityToken {
    fn byte_len(&self) -> usize {
        self.policy_id.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.policy_id.encode(stream)
    }
}

impl BinaryDecodable for AnonymousIdentityToken {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(AnonymousIdentityToken {
            policy_id: UAString::decode(stream, options)?,
        })
    }
}

/// A user name and password identity token. The password may be encrypted with the
/// user token policy's security policy.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UserNameIdentityToken {
    /// Id of the user token policy this token answers.
    pub policy_id: UAString,
    /// The user name.
    pub user_name: UAString,
    /// The password, possibly encrypted.
    pub password: ByteString,
    /// URI of the algorithm the password is encrypted with, null for plaintext.
    pub encryption_algorithm: UAString,
}

impl BinaryEncodable for UserNameIdentityToken {
    fn byte_len(&self) -> usize {
        self.policy_id.byte_len()
            + self.user_name.byte_len()
            + self.password.byte_len()
            + self.encryption_algorithm.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.policy_id.encode(stream)?;
        self.user_name.encode(stream)?;
        self.password.encode(stream)?;
        self.encryption_algorithm.encode(stream)
    }
}

impl BinaryDecodable for UserNameIdentityToken {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(UserNameIdentityToken {
            policy_id: UAString::decode(stream, options)?,
            user_name: UAString::decode(stream, options)?,
            password: ByteString::decode(stream, options)?,
            encryption_algorithm: UAString::decode(stream, options)?,
        })
    }
}

/// An X509 certificate identity token.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct X509IdentityToken {
    /// Id of the user token policy this token answers.
    pub policy_id: UAString,
    /// The user certificate in DER form.
    pub certificate_data: ByteString,
}

impl BinaryEncodable for X509IdentityToken {
    fn byte_len(&self) -> usize {
        self.policy_id.byte_len() + self.certificate_data.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.policy_id.encode(stream)?;
        self.certificate_data.encode(stream)
    }
}

impl BinaryDecodable for X509IdentityToken {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(X509IdentityToken {
            policy_id: UAString::decode(stream, options)?,
            certificate_data: ByteString::decode(stream, options)?,
        })
    }
}

/// A token issued by an external authority.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IssuedIdentityToken {
    /// Id of the user token policy this token answers.
    pub policy_id: UAString,
    /// The issued token, possibly encrypted.
    pub token_data: ByteString,
    /// URI of the algorithm the token is encrypted with, null for plaintext.
    pub encryption_algorithm: UAString,
}

impl BinaryEncodable for IssuedIdentityToken {
    fn byte_len(&self) -> usize {
        self.policy_id.byte_len()
            + self.token_data.byte_len()
            + self.encryption_algorithm.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.policy_id.encode(stream)?;
        self.token_data.encode(stream)?;
        self.encryption_algorithm.encode(stream)
    }
}

impl BinaryDecodable for IssuedIdentityToken {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(IssuedIdentityToken {
            policy_id: UAString::decode(stream, options)?,
            token_data: ByteString::decode(stream, options)?,
            encryption_algorithm: UAString::decode(stream, options)?,
        })
    }
}
