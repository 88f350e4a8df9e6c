// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

use std::io::{Read, Write};

use log::debug;
use uasc_types::*;

use crate::comms::message_chunk::MessageChunkType;

use super::{Message, MessageType};

macro_rules! request_enum {
    ($($name:ident: $value:ident; $enc:ident),*,) => {
        /// A request message the stack can carry, boxed to keep the enum small.
        #[derive(Debug, PartialEq, Clone)]
        pub enum RequestMessage {
            $( #[allow(missing_docs)] $name(Box<$value>), )*
        }
        $(
            impl From<$value> for RequestMessage {
                fn from(value: $value) -> Self {
                    Self::$name(Box::new(value))
                }
            }
        )*
        impl BinaryEncodable for RequestMessage {
            fn byte_len(&self) -> usize {
                match self {
                    $( Self::$name(value) => value.byte_len(), )*
                }
            }

            fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
                match self {
                    $( Self::$name(value) => value.encode(stream), )*
                }
            }
        }

        impl RequestMessage {
            /// The common request header of the message.
            pub fn request_header(&self) -> &RequestHeader {
                match self {
                    $( Self::$name(value) => &value.request_header, )*
                }
            }

            /// A short name of the message type, for logging.
            pub fn type_name(&self) -> &'static str {
                match self {
                    $( Self::$name(_) => stringify!($name), )*
                }
            }
        }

        impl Message for RequestMessage {
            fn request_handle(&self) -> u32 {
                self.request_header().request_handle
            }

            fn decode_by_object_id<S: Read>(
                stream: &mut S,
                object_id: ObjectId,
                options: &DecodingOptions
            ) -> EncodingResult<Self> {
                match object_id {
                    $( ObjectId::$enc => {
                        Ok($value::decode(stream, options)?.into())
                    }, )*
                    _ => {
                        debug!("decoding unsupported for object id {:?}", object_id);
                        Err(Error::decoding(format!(
                            "Object id {object_id:?} is not a known request type"
                        )))
                    }
                }
            }

            fn type_id(&self) -> NodeId {
                match self {
                    $( Self::$name(_) => ObjectId::$enc.into(), )*
                }
            }
        }
    };
}

impl MessageType for RequestMessage {
    fn message_type(&self) -> MessageChunkType {
        match self {
            Self::OpenSecureChannel(_) => MessageChunkType::OpenSecureChannel,
            Self::CloseSecureChannel(_) => MessageChunkType::CloseSecureChannel,
            _ => MessageChunkType::Message,
        }
    }
}

request_enum! {
    OpenSecureChannel: OpenSecureChannelRequest; OpenSecureChannelRequest_Encoding_DefaultBinary,
    CloseSecureChannel: CloseSecureChannelRequest; CloseSecureChannelRequest_Encoding_DefaultBinary,
    GetEndpoints: GetEndpointsRequest; GetEndpointsRequest_Encoding_DefaultBinary,
    FindServers: FindServersRequest; FindServersRequest_Encoding_DefaultBinary,
    RegisterServer: RegisterServerRequest; RegisterServerRequest_Encoding_DefaultBinary,
    CreateSession: CreateSessionRequest; CreateSessionRequest_Encoding_DefaultBinary,
    ActivateSession: ActivateSessionRequest; ActivateSessionRequest_Encoding_DefaultBinary,
    CloseSession: CloseSessionRequest; CloseSessionRequest_Encoding_DefaultBinary,
}
