// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Endpoint discovery types: application and endpoint descriptions, user token policies, and
//! the GetEndpoints service messages.

use std::io::{Read, Write};

use crate::{
    byte_string::ByteString,
    encoding::{BinaryDecodable, BinaryEncodable, DecodingOptions, EncodingResult},
    request_header::RequestHeader,
    response_header::ResponseHeader,
    service_types::enums::{ApplicationType, MessageSecurityMode, UserTokenType},
    string::UAString,
};

/// Describes an OPC UA application, client or server.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ApplicationDescription {
    /// Globally unique identifier for the application instance.
    pub application_uri: UAString,
    /// Globally unique identifier for the product.
    pub product_uri: UAString,
    /// Human readable name for the application.
    pub application_name: UAString,
    /// The kind of application.
    pub application_type: ApplicationType,
    /// Gateway server URI, unused by this stack.
    pub gateway_server_uri: UAString,
    /// Discovery profile URI, unused by this stack.
    pub discovery_profile_uri: UAString,
    /// URLs the application can be reached on for discovery.
    pub discovery_urls: Option<Vec<UAString>>,
}

impl BinaryEncodable for ApplicationDescription {
    fn byte_len(&self) -> usize {
        self.application_uri.byte_len()
            + self.product_uri.byte_len()
            + self.application_name.byte_len()
            + self.application_type.byte_len()
            + self.gateway_server_uri.byte_len()
            + self.discovery_profile_uri.byte_len()
            + self.discovery_urls.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.application_uri.encode(stream)?;
        self.product_uri.encode(stream)?;
        self.application_name.encode(stream)?;
        self.application_type.encode(stream)?;
        self.gateway_server_uri.encode(stream)?;
        self.discovery_profile_uri.encode(stream)?;
        self.discovery_urls.encode(stream)
    }
}

impl BinaryDecodable for ApplicationDescription {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(ApplicationDescription {
            application_uri: UAString::decode(stream, options)?,
            product_uri: UAString::decode(stream, options)?,
            application_name: UAString::decode(stream, options)?,
            application_type: ApplicationType::decode(stream, options)?,
            gateway_server_uri: UAString::decode(stream, options)?,
            discovery_profile_uri: UAString::decode(stream, options)?,
            discovery_urls: BinaryDecodable::decode(stream, options)?,
        })
    }
}

/// Describes one kind of user identity token an endpoint accepts.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UserTokenPolicy {
    /// Identifier for the policy, echoed back in identity tokens.
    pub policy_id: UAString,
    /// The kind of identity token this policy accepts.
    pub token_type: UserTokenType,
    /// Issued token type URI, for `IssuedToken` policies.
    pub issued_token_type: UAString,
    /// Endpoint of the token issuer, for `IssuedToken` policies.
    pub issuer_endpoint_url: UAString,
    /// The security policy used to encrypt the identity token. Empty means the endpoint's own
    /// security policy.
    pub security_policy_uri: UAString,
}

impl BinaryEncodable for UserTokenPolicy {
    fn byte_len(&self) -> usize {
        self.policy_id.byte_len()
            + self.token_type.byte_len()
            + self.issued_token_type.byte_len()
            + self.issuer_endpoint_url.byte_len()
            + self.security_policy_uri.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.policy_id.encode(stream)?;
        self.token_type.encode(stream)?;
        self.issued_token_type.encode(stream)?;
        self.issuer_endpoint_url.encode(stream)?;
        self.security_policy_uri.encode(stream)
    }
}

impl BinaryDecodable for UserTokenPolicy {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(UserTokenPolicy {
            policy_id: UAString::decode(stream, options)?,
            token_type: UserTokenType::decode(stream, options)?,
            issued_token_type: UAString::decode(stream, options)?,
            issuer_endpoint_url: UAString::decode(stream, options)?,
            security_policy_uri: UAString::decode(stream, options)?,
        })
    }
}

/// Describes one endpoint a server offers.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EndpointDescription {
    /// The URL clients connect to.
    pub endpoint_url: UAString,
    /// The server behind the endpoint.
    pub server: ApplicationDescription,
    /// The server's application instance certificate in DER form.
    pub server_certificate: ByteString,
    /// The security mode of the endpoint.
    pub security_mode: MessageSecurityMode,
    /// URI of the endpoint's security policy.
    pub security_policy_uri: UAString,
    /// The user identity token kinds the endpoint accepts.
    pub user_identity_tokens: Option<Vec<UserTokenPolicy>>,
    /// URI of the transport profile. An empty profile is treated as the binary profile.
    pub transport_profile_uri: UAString,
    /// Relative security level of the endpoint, higher is more secure.
    pub security_level: u8,
}

impl BinaryEncodable for EndpointDescription {
    fn byte_len(&self) -> usize {
        self.endpoint_url.byte_len()
            + self.server.byte_len()
            + self.server_certificate.byte_len()
            + self.security_mode.byte_len()
            + self.security_policy_uri.byte_len()
            + self.user_identity_tokens.byte_len()
            + self.transport_profile_uri.byte_len()
            + 1
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.endpoint_url.encode(stream)?;
        self.server.encode(stream)?;
        self.server_certificate.encode(stream)?;
        self.security_mode.encode(stream)?;
        self.security_policy_uri.encode(stream)?;
        self.user_identity_tokens.encode(stream)?;
        self.transport_profile_uri.encode(stream)?;
        self.security_level.encode(stream)
    }
}

impl BinaryDecodable for EndpointDescription {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(EndpointDescription {
            endpoint_url: UAString::decode(stream, options)?,
            server: ApplicationDescription::decode(stream, options)?,
            server_certificate: ByteString::decode(stream, options)?,
            security_mode: MessageSecurityMode::decode(stream, options)?,
            security_policy_uri: UAString::decode(stream, options)?,
            user_identity_tokens: BinaryDecodable::decode(stream, options)?,
            transport_profile_uri: UAString::decode(stream, options)?,
            security_level: u8::decode(stream, options)?,
        })
    }
}

/// Asks a server for the endpoints it offers.
#[derive(Debug, Clone, PartialEq)]
pub struct GetEndpointsRequest {
    /// Common request header.
    pub request_header: RequestHeader,
    /// The URL the client used to reach the server.
    pub endpoint_url: UAString,
    /// Locales for human readable strings, unused by this stack.
    pub locale_ids: Option<Vec<UAString>>,
    /// Restrict the response to these transport profiles. Empty means no restriction.
    pub profile_uris: Option<Vec<UAString>>,
}

impl BinaryEncodable for GetEndpointsRequest {
    fn byte_len(&self) -> usize {
        self.request_header.byte_len()
            + self.endpoint_url.byte_len()
            + self.locale_ids.byte_len()
            + self.profile_uris.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.request_header.encode(stream)?;
        self.endpoint_url.encode(stream)?;
        self.locale_ids.encode(stream)?;
        self.profile_uris.encode(stream)
    }
}

impl BinaryDecodable for GetEndpointsRequest {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(GetEndpointsRequest {
            request_header: RequestHeader::decode(stream, options)?,
            endpoint_url: UAString::decode(stream, options)?,
            locale_ids: BinaryDecodable::decode(stream, options)?,
            profile_uris: BinaryDecodable::decode(stream, options)?,
        })
    }
}

/// The server's answer to a [`GetEndpointsRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct GetEndpointsResponse {
    /// Common response header.
    pub response_header: ResponseHeader,
    /// The endpoints matching the request filters.
    pub endpoints: Option<Vec<EndpointDescription>>,
}

impl BinaryEncodable for GetEndpointsResponse {
    fn byte_len(&self) -> usize {
        self.response_header.byte_len() + self.endpoints.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.response_header.encode(stream)?;
        self.endpoints.encode(stream)
    }
}

impl BinaryDecodable for GetEndpointsResponse {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(GetEndpointsResponse {
            response_header: ResponseHeader::decode(stream, options)?,
            endpoints: BinaryDecodable::decode(stream, options)?,
        })
    }
}
