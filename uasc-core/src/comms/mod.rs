// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Contains all code related to sending / receiving messages from a transport
//! and turning those messages into and out of chunks.

pub mod buffer;
pub mod chunker;
pub mod message_chunk;
pub mod message_chunk_info;
pub mod secure_channel;
pub mod security_header;
pub mod tcp_codec;
pub mod tcp_types;
pub mod url;
