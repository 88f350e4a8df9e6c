// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Message header for requests.

use std::io::{Read, Write};

use crate::{
    date_time::DateTime,
    encoding::{BinaryDecodable, BinaryEncodable, DecodingOptions, EncodingResult},
    extension_object::ExtensionObject,
    node_id::NodeId,
    string::UAString,
};

/// The `RequestHeader` contains information common to every request from a client to the server.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RequestHeader {
    /// The secret session identifier used to verify that the request is associated with
    /// the session.
    pub authentication_token: NodeId,
    /// The time the client sent the request, for diagnostics and logging only.
    pub timestamp: DateTime,
    /// A client-defined handle associated with the request. Returned in the response.
    pub request_handle: u32,
    /// Bit mask of requested diagnostics, unused by this stack.
    pub return_diagnostics: u32,
    /// An identifier that identifies the client's security audit log entry.
    pub audit_entry_id: UAString,
    /// A hint in milliseconds for how long the client is prepared to wait for a response.
    /// 0 means the client has no timeout in mind.
    pub timeout_hint: u32,
    /// Reserved for additional header fields.
    pub additional_header: ExtensionObject,
}

impl RequestHeader {
    /// Create a request header with the given token and handle.
    pub fn new(authentication_token: NodeId, request_handle: u32) -> RequestHeader {
        RequestHeader {
            authentication_token,
            timestamp: DateTime::now(),
            request_handle,
            ..Default::default()
        }
    }
}

impl BinaryEncodable for RequestHeader {
    fn byte_len(&self) -> usize {
        self.authentication_token.byte_len()
            + self.timestamp.byte_len()
            + 4
            + 4
            + self.audit_entry_id.byte_len()
            + 4
            + self.additional_header.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.authentication_token.encode(stream)?;
        self.timestamp.encode(stream)?;
        self.request_handle.encode(stream)?;
        self.return_diagnostics.encode(stream)?;
        self.audit_entry_id.encode(stream)?;
        self.timeout_hint.encode(stream)?;
        self.additional_header.encode(stream)
    }
}

impl BinaryDecodable for RequestHeader {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(RequestHeader {
            authentication_token: NodeId::decode(stream, options)?,
            timestamp: DateTime::decode(stream, options)?,
            request_handle: u32::decode(stream, options)?,
            return_diagnostics: u32::decode(stream, options)?,
            audit_entry_id: UAString::decode(stream, options)?,
            timeout_hint: u32::decode(stream, options)?,
            additional_header: ExtensionObject::decode(stream, options)?,
        })
    }
}
