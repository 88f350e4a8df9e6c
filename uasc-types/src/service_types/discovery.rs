// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Discovery service messages: FindServers and RegisterServer.

use std::io::{Read, Write};

use crate::{
    encoding::{BinaryDecodable, BinaryEncodable, DecodingOptions, EncodingResult},
    request_header::RequestHeader,
    response_header::ResponseHeader,
    service_types::endpoints::ApplicationDescription,
    service_types::enums::ApplicationType,
    string::UAString,
};

/// Asks a (discovery) server for the servers it knows about.
#[derive(Debug, Clone, PartialEq)]
pub struct FindServersRequest {
    /// Common request header.
    pub request_header: RequestHeader,
    /// The URL the client used to reach the server.
    pub endpoint_url: UAString,
    /// Locales for human readable strings, unused by this stack.
    pub locale_ids: Option<Vec<UAString>>,
    /// Restrict the response to servers with these application URIs. Empty means all.
    pub server_uris: Option<Vec<UAString>>,
}

impl BinaryEncodable for FindServersRequest {
    fn byte_len(&self) -> usize {
        self.request_header.byte_len()
            + self.endpoint_url.byte_len()
            + self.locale_ids.byte_len()
            + self.server_uris.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.request_header.encode(stream)?;
        self.endpoint_url.encode(stream)?;
        self.locale_ids.encode(stream)?;
        self.server_uris.encode(stream)
    }
}

impl BinaryDecodable for FindServersRequest {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(FindServersRequest {
            request_header: RequestHeader::decode(stream, options)?,
            endpoint_url: UAString::decode(stream, options)?,
            locale_ids: BinaryDecodable::decode(stream, options)?,
            server_uris: BinaryDecodable::decode(stream, options)?,
        })
    }
}

/// The server's answer to a [`FindServersRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct FindServersResponse {
    /// Common response header.
    pub response_header: ResponseHeader,
    /// The matching servers.
    pub servers: Option<Vec<ApplicationDescription>>,
}

impl BinaryEncodable for FindServersResponse {
    fn byte_len(&self) -> usize {
        self.response_header.byte_len() + self.servers.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.response_header.encode(stream)?;
        self.servers.encode(stream)
    }
}

impl BinaryDecodable for FindServersResponse {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(FindServersResponse {
            response_header: ResponseHeader::decode(stream, options)?,
            servers: BinaryDecodable::decode(stream, options)?,
        })
    }
}

/// Describes a server registering itself with a discovery server.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegisteredServer {
    /// Globally unique identifier for the server instance.
    pub server_uri: UAString,
    /// Globally unique identifier for the product.
    pub product_uri: UAString,
    /// Human readable names for the server.
    pub server_names: Option<Vec<UAString>>,
    /// The kind of application, must not be Client.
    pub server_type: ApplicationType,
    /// Gateway server URI, unused by this stack.
    pub gateway_server_uri: UAString,
    /// URLs the server can be reached on for discovery.
    pub discovery_urls: Option<Vec<UAString>>,
    /// Path to the semaphore file, unused by this stack.
    pub semaphore_file_path: UAString,
    /// Whether the server is announcing itself (`true`) or shutting down (`false`).
    pub is_online: bool,
}

impl BinaryEncodable for RegisteredServer {
    fn byte_len(&self) -> usize {
        self.server_uri.byte_len()
            + self.product_uri.byte_len()
            + self.server_names.byte_len()
            + self.server_type.byte_len()
            + self.gateway_server_uri.byte_len()
            + self.discovery_urls.byte_len()
            + self.semaphore_file_path.byte_len()
            + 1
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.server_uri.encode(stream)?;
        self.product_uri.encode(stream)?;
        self.server_names.encode(stream)?;
        self.server_type.encode(stream)?;
        self.gateway_server_uri.encode(stream)?;
        self.discovery_urls.encode(stream)?;
        self.semaphore_file_path.encode(stream)?;
        self.is_online.encode(stream)
    }
}

impl BinaryDecodable for RegisteredServer {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(RegisteredServer {
            server_uri: UAString::decode(stream, options)?,
            product_uri: UAString::decode(stream, options)?,
            server_names: BinaryDecodable::decode(stream, options)?,
            server_type: ApplicationType::decode(stream, options)?,
            gateway_server_uri: UAString::decode(stream, options)?,
            discovery_urls: BinaryDecodable::decode(stream, options)?,
            semaphore_file_path: UAString::decode(stream, options)?,
            is_online: bool::decode(stream, options)?,
        })
    }
}

/// Registers a server with a discovery server.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterServerRequest {
    /// Common request header.
    pub request_header: RequestHeader,
    /// The server being registered.
    pub server: RegisteredServer,
}

impl BinaryEncodable for RegisterServerRequest {
    fn byte_len(&self) -> usize {
        self.request_header.byte_len() + self.server.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.request_header.encode(stream)?;
        self.server.encode(stream)
    }
}

impl BinaryDecodable for RegisterServerRequest {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(RegisterServerRequest {
            request_header: RequestHeader::decode(stream, options)?,
            server: RegisteredServer::decode(stream, options)?,
        })
    }
}

/// The discovery server's answer to a [`RegisterServerRequest`].
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterServerResponse {
    /// Common response header.
    pub response_header: ResponseHeader,
}

impl BinaryEncodable for RegisterServerResponse {
    fn byte_len(&self) -> usize {
        self.response_header.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.response_header.encode(stream)
    }
}

impl BinaryDecodable for RegisterServerResponse {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(RegisterServerResponse {
            response_header: ResponseHeader::decode(stream, options)?,
        })
    }
}
