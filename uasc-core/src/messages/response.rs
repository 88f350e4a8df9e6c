// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

use std::io::{Read, Write};

use log::debug;
use uasc_types::*;

use crate::comms::message_chunk::MessageChunkType;

use super::{Message, MessageType};

macro_rules! response_enum {
    ($($name:ident: $value:ident; $enc:ident),*,) => {
        /// A response message the stack can carry, boxed to keep the enum small.
        #[derive(Debug, PartialEq, Clone)]
        pub enum ResponseMessage {
            $( #[allow(missing_docs)] $name(Box<$value>), )*
        }
        $(
            impl From<$value> for ResponseMessage {
                fn from(value: $value) -> Self {
                    Self::$name(Box::new(value))
                }
            }
        )*
        impl BinaryEncodable for ResponseMessage {
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

        impl ResponseMessage {
            /// The common response header of the message.
            pub fn response_header(&self) -> &ResponseHeader {
                match self {
                    $( Self::$name(value) => &value.response_header, )*
                }
            }

            /// A short name of the message type, for logging.
            pub fn type_name(&self) -> &'static str {
                match self {
                    $( Self::$name(_) => stringify!($name), )*
                }
            }
        }

        impl Message for ResponseMessage {
            fn request_handle(&self) -> u32 {
                self.response_header().request_handle
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
                            "Object id {object_id:?} is not a known response type"
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

impl MessageType for ResponseMessage {
    fn message_type(&self) -> MessageChunkType {
        match self {
            Self::OpenSecureChannel(_) => MessageChunkType::OpenSecureChannel,
            Self::CloseSecureChannel(_) => MessageChunkType::CloseSecureChannel,
            _ => MessageChunkType::Message,
        }
    }
}

response_enum! {
    OpenSecureChannel: OpenSecureChannelResponse; OpenSecureChannelResponse_Encoding_DefaultBinary,
    CloseSecureChannel: CloseSecureChannelResponse; CloseSecureChannelResponse_Encoding_DefaultBinary,
    GetEndpoints: GetEndpointsResponse; GetEndpointsResponse_Encoding_DefaultBinary,
    FindServers: FindServersResponse; FindServersResponse_Encoding_DefaultBinary,
    RegisterServer: RegisterServerResponse; RegisterServerResponse_Encoding_DefaultBinary,
    CreateSession: CreateSessionResponse; CreateSessionResponse_Encoding_DefaultBinary,
    ActivateSession: ActivateSessionResponse; ActivateSessionResponse_Encoding_DefaultBinary,
    CloseSession: CloseSessionResponse; CloseSessionResponse_Encoding_DefaultBinary,
    ServiceFault: ServiceFault; ServiceFault_Encoding_DefaultBinary,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::request::RequestMessage;

    #[test]
    fn enum_size() {
        // Boxing keeps the message enums pointer-sized plus discriminant.
        use std::mem;
        assert!(mem::size_of::<ResponseMessage>() <= 16);
        assert!(mem::size_of::<RequestMessage>() <= 16);
    }
}
