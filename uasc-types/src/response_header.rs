// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Message header for responses.

use std::io::{Read, Write};

use crate::{
    date_time::DateTime,
    encoding::{BinaryDecodable, BinaryEncodable, DecodingOptions, EncodingResult},
    extension_object::ExtensionObject,
    request_header::RequestHeader,
    status_code::StatusCode,
    string::UAString,
};

/// The `ResponseHeader` contains information common to every response from server to client.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResponseHeader {
    /// The time the server sent the response.
    pub timestamp: DateTime,
    /// The handle given by the client to the request this response answers.
    pub request_handle: u32,
    /// The overall result of the service call.
    pub service_result: StatusCode,
    /// Bit mask of present diagnostics, unused by this stack.
    pub service_diagnostics: u8,
    /// Table of diagnostic strings, unused by this stack.
    pub string_table: Option<Vec<UAString>>,
    /// Reserved for additional header fields.
    pub additional_header: ExtensionObject,
}

impl BinaryEncodable for ResponseHeader {
    fn byte_len(&self) -> usize {
        self.timestamp.byte_len()
            + 4
            + self.service_result.byte_len()
            + 1
            + self.string_table.byte_len()
            + self.additional_header.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.timestamp.encode(stream)?;
        self.request_handle.encode(stream)?;
        self.service_result.encode(stream)?;
        self.service_diagnostics.encode(stream)?;
        self.string_table.encode(stream)?;
        self.additional_header.encode(stream)
    }
}

impl BinaryDecodable for ResponseHeader {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(ResponseHeader {
            timestamp: DateTime::decode(stream, options)?,
            request_handle: u32::decode(stream, options)?,
            service_result: StatusCode::decode(stream, options)?,
            service_diagnostics: u8::decode(stream, options)?,
            string_table: BinaryDecodable::decode(stream, options)?,
            additional_header: ExtensionObject::decode(stream, options)?,
        })
    }
}

impl ResponseHeader {
    /// A `Good` response header answering `request_header`.
    pub fn new_good(request_header: &RequestHeader) -> ResponseHeader {
        ResponseHeader::new_service_result(request_header.request_handle, StatusCode::Good)
    }

    /// A response header answering `request_handle` with the given result.
    pub fn new_service_result(request_handle: u32, service_result: StatusCode) -> ResponseHeader {
        ResponseHeader {
            timestamp: DateTime::now(),
            request_handle,
            service_result,
            ..Default::default()
        }
    }
}
