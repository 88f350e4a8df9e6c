// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

#![warn(missing_docs)]

//! Data types for the `uasc` OPC UA secure conversation stack: the binary encoding layer,
//! status codes, and the service messages the channel and session layers exchange.

pub mod byte_string;
pub mod date_time;
pub mod encoding;
pub mod extension_object;
pub mod guid;
pub mod node_id;
pub mod request_header;
pub mod response_header;
pub mod service_types;
pub mod status_code;
pub mod string;

pub use byte_string::ByteString;
pub use date_time::DateTime;
pub use encoding::{
    constants, read_bytes, read_i32, read_i64, read_u16, read_u32, read_u8, write_bytes,
    write_i32, write_i64, write_u16, write_u32, write_u8, BinaryDecodable, BinaryEncodable,
    DecodingOptions, EncodingResult, Error,
};
pub use extension_object::ExtensionObject;
pub use guid::Guid;
pub use node_id::{Identifier, NodeId, ObjectId};
pub use request_header::RequestHeader;
pub use response_header::ResponseHeader;
pub use service_types::*;
pub use status_code::StatusCode;
pub use string::UAString;

/// URI of the uatcp binary transport profile. Endpoints advertising an empty profile are
/// treated as using this one.
pub const PROFILE_TRANSPORT_BINARY: &str =
    "http://opcfoundation.org/UA-Profile/Transport/uatcp-uasc-uabinary";
