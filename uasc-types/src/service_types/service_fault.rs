// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! The [`ServiceFault`] response, sent when a service call fails as a whole.

use std::io::{Read, Write};

use crate::{
    encoding::{BinaryDecodable, BinaryEncodable, DecodingOptions, EncodingResult},
    request_header::RequestHeader,
    response_header::ResponseHeader,
    status_code::StatusCode,
};

/// The response sent when a service invocation fails before producing a service-specific
/// response.
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceFault {
    /// Common response header carrying the failure in `service_result`.
    pub response_header: ResponseHeader,
}

impl ServiceFault {
    /// A fault answering `request_header` with `service_result`.
    pub fn new(request_header: &RequestHeader, service_result: StatusCode) -> ServiceFault {
        ServiceFault {
            response_header: ResponseHeader::new_service_result(
                request_header.request_handle,
                service_result,
            ),
        }
    }

    /// A fault answering a bare request handle.
    pub fn new_with_handle(request_handle: u32, service_result: StatusCode) -> ServiceFault {
        ServiceFault {
            response_header: ResponseHeader::new_service_result(request_handle, service_result),
        }
    }
}

impl BinaryEncodable for ServiceFault {
    fn byte_len(&self) -> usize {
        self.response_header.byte_len()
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.response_header.encode(stream)
    }
}

impl BinaryDecodable for ServiceFault {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        Ok(ServiceFault {
            response_header: ResponseHeader::decode(stream, options)?,
        })
    }
}
