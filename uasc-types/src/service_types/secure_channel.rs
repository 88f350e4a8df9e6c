// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! OpenSecureChannel and CloseSecureChannel service messages.

use std::io::{Read, Write};

use crate::{
    byte_string::ByteString,
    date_time::DateTime,
    encoding::{BinaryDecodable, BinaryEncodable, DecodingOptions, EncodingResult},
    request_header::RequestHeader,
    response_header::ResponseHeader,
    service_types::enums::{MessageSecurityMode, SecurityTokenRequestType},
};

/// The token that secures a channel for a period of its lifetime. The `created_at` on the
/// wire is a wall-clock timestamp; receivers base their own expiry on their monotonic clock.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ChannelSecurityToken {
    /// The id of the secure channel the token belongs to.
    pub channel_id: u32,
    /// The id of the token itself, changed on every renewal.
    pub token_id: u32,
    /// When the token was created, by the server's wall clock.
    pub created_at: DateTime,
    /// The token lifetime granted by the server, in milliseconds.
    pub revised_lifetime: u32,
}

impl BinaryEncodable for ChannelSecurityToken {
    fn byte_len(&self) -> usize {
        4 + 4 + self.created_at.byte_len() + 4
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.channel_id.encode(stream)?;
        self.token_id.encode(stream)?;
        self.created_at.encode(stream)?;
        self.revised_lifetime.encode(stream)
    }
}

impl BinaryDecodable for ChannelSecurityToken {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(ChannelSecurityToken {
            channel_id: u32::decode(stream, options)?,
            token_id: u32::decode(stream, options)?,
            created_at: DateTime::decode(stream, options)?,
            revised_lifetime: u32::decode(stream, options)?,
        })
    }
}

/// Asks the server to open a new secure channel or renew the token of an existing one.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenSecureChannelRequest {
    /// Common request header.
    pub request_header: RequestHeader,
    /// The protocol version the client sent in HELLO.
    pub client_protocol_version: u32,
    /// Issue or Renew.
    pub request_type: SecurityTokenRequestType,
    /// The security mode the channel shall use.
    pub security_mode: MessageSecurityMode,
    /// A fresh nonce sized to the security policy, null under policy None.
    pub client_nonce: ByteString,
    /// The token lifetime the client would like, in milliseconds. 0 asks for the maximum.
    pub requested_lifetime: u32,
}

impl BinaryEncodable for OpenSecureChannelRequest {
    fn byte_len(&self) -> usize {
        self.request_header.byte_len()
            + 4
            + self.request_type.byte_len()
            + self.security_mode.byte_len()
            + self.client_nonce.byte_len()
            + 4
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.request_header.encode(stream)?;
        self.client_protocol_version.encode(stream)?;
        self.request_type.encode(stream)?;
        self.security_mode.encode(stream)?;
        self.client_nonce.encode(stream)?;
        self.requested_lifetime.encode(stream)
    }
}

impl BinaryDecodable for OpenSecureChannelRequest {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(OpenSecureChannelRequest {
            request_header: RequestHeader::decode(stream, options)?,
            client_protocol_version: u32::decode(stream, options)?,
            request_type: SecurityTokenRequestType::decode(stream, options)?,
            security_mode: MessageSecurityMode::decode(stream, options)?,
            client_nonce: ByteString::decode(stream, options)?,
            requested_lifetime: u32::decode(stream, options)?,
        })
    }
}

/// The server's answer to an [`OpenSecureChannelRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct OpenSecureChannelResponse {
    /// Common response header.
    pub response_header: ResponseHeader,
    /// The protocol version the server speaks.
    pub server_protocol_version: u32,
    /// The issued or renewed token.
    pub security_token: ChannelSecurityToken,
    /// The server's fresh nonce, null under policy None.
    pub server_nonce: ByteString,
}

impl BinaryEncodable for OpenSecureChannelResponse {
    fn byte_len(&self) -> usize {
        self.response_header.byte_len()
            + 4
            + self.security_token.byte_len()
            + self.server_nonce.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.response_header.encode(stream)?;
        self.server_protocol_version.encode(stream)?;
        self.security_token.encode(stream)?;
        self.server_nonce.encode(stream)
    }
}

impl BinaryDecodable for OpenSecureChannelResponse {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(OpenSecureChannelResponse {
            response_header: ResponseHeader::decode(stream, options)?,
            server_protocol_version: u32::decode(stream, options)?,
            security_token: ChannelSecurityToken::decode(stream, options)?,
            server_nonce: ByteString::decode(stream, options)?,
        })
    }
}

/// Instructs the server to close the secure channel. There is no response; the server just
/// tears the channel down.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseSecureChannelRequest {
    /// Common request header.
    pub request_header: RequestHeader,
}

impl BinaryEncodable for CloseSecureChannelRequest {
    fn byte_len(&self) -> usize {
        self.request_header.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.request_header.encode(stream)
    }
}

impl BinaryDecodable for CloseSecureChannelRequest {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(CloseSecureChannelRequest {
            request_header: RequestHeader::decode(stream, options)?,
        })
    }
}

/// Nominal response type for CloseSecureChannel. Never actually sent.
#[derive(Debug, Clone, PartialEq)]
pub struct CloseSecureChannelResponse {
    /// Common response header.
    pub response_header: ResponseHeader,
}

impl BinaryEncodable for CloseSecureChannelResponse {
    fn byte_len(&self) -> usize {
        self.response_header.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.response_header.encode(stream)
    }
}

impl BinaryDecodable for CloseSecureChannelResponse {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(CloseSecureChannelResponse {
            response_header: ResponseHeader::decode(stream, options)?,
        })
    }
}
