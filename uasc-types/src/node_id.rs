// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Implementation of [`NodeId`] and the [`ObjectId`] table of binary encoding ids used by the
//! message layer.

use std::{
    fmt,
    io::{Read, Write},
};

use crate::{
    byte_string::ByteString,
    encoding::{
        read_u16, read_u32, read_u8, write_u16, write_u32, write_u8, BinaryDecodable,
        BinaryEncodable, DecodingOptions, EncodingResult, Error,
    },
    guid::Guid,
    string::UAString,
};

/// The kind of identifier in a [`NodeId`].
#[derive(Eq, PartialEq, Clone, Debug, Hash)]
pub enum Identifier {
    /// An unsigned integer identifier.
    Numeric(u32),
    /// A string identifier.
    String(UAString),
    /// A GUID identifier.
    Guid(Guid),
    /// An opaque identifier.
    ByteString(ByteString),
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Numeric(v) => write!(f, "i={}", v),
            Identifier::String(v) => write!(f, "s={}", v),
            Identifier::Guid(v) => write!(f, "g={}", v),
            Identifier::ByteString(v) => write!(f, "b=({} bytes)", v.len()),
        }
    }
}

/// An identifier for a node in the address space of a server, or for a binary-encoded
/// message type when used as the prefix of a message body.
#[derive(Eq, PartialEq, Clone, Debug, Hash)]
pub struct NodeId {
    /// The index for a namespace.
    pub namespace: u16,
    /// The identifier for a node in the address space of an OPC UA server.
    pub identifier: Identifier,
}

impl Default for NodeId {
    fn default() -> Self {
        NodeId::null()
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace != 0 {
            write!(f, "ns={};{}", self.namespace, self.identifier)
        } else {
            write!(f, "{}", self.identifier)
        }
    }
}

// Data encoding bytes for the wire representation.
const NODE_ID_TWO_BYTE: u8 = 0x00;
const NODE_ID_FOUR_BYTE: u8 = 0x01;
const NODE_ID_NUMERIC: u8 = 0x02;
const NODE_ID_STRING: u8 = 0x03;
const NODE_ID_GUID: u8 = 0x04;
const NODE_ID_BYTE_STRING: u8 = 0x05;

impl BinaryEncodable for NodeId {
    fn byte_len(&self) -> usize {
        match &self.identifier {
            Identifier::Numeric(value) => {
                if self.namespace == 0 && *value <= 255 {
                    2
                } else if self.namespace <= 255 && *value <= 65535 {
                    4
                } else {
                    7
                }
            }
            Identifier::String(value) => 3 + value.byte_len(),
            Identifier::Guid(value) => 3 + value.byte_len(),
            Identifier::ByteString(value) => 3 + value.byte_len(),
        }
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        match &self.identifier {
            Identifier::Numeric(value) => {
                if self.namespace == 0 && *value <= 255 {
                    write_u8(stream, NODE_ID_TWO_BYTE)?;
                    write_u8(stream, *value as u8)
                } else if self.namespace <= 255 && *value <= 65535 {
                    write_u8(stream, NODE_ID_FOUR_BYTE)?;
                    write_u8(stream, self.namespace as u8)?;
                    write_u16(stream, *value as u16)
                } else {
                    write_u8(stream, NODE_ID_NUMERIC)?;
                    write_u16(stream, self.namespace)?;
                    write_u32(stream, *value)
                }
            }
            Identifier::String(value) => {
                write_u8(stream, NODE_ID_STRING)?;
                write_u16(stream, self.namespace)?;
                value.encode(stream)
            }
            Identifier::Guid(value) => {
                write_u8(stream, NODE_ID_GUID)?;
                write_u16(stream, self.namespace)?;
                value.encode(stream)
            }
            Identifier::ByteString(value) => {
                write_u8(stream, NODE_ID_BYTE_STRING)?;
                write_u16(stream, self.namespace)?;
                value.encode(stream)
            }
        }
    }
}

impl BinaryDecodable for NodeId {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        let encoding = read_u8(stream)?;
        match encoding {
            NODE_ID_TWO_BYTE => Ok(NodeId::new_numeric(0, read_u8(stream)? as u32)),
            NODE_ID_FOUR_BYTE => {
                let namespace = read_u8(stream)? as u16;
                Ok(NodeId::new_numeric(namespace, read_u16(stream)? as u32))
            }
            NODE_ID_NUMERIC => {
                let namespace = read_u16(stream)?;
                Ok(NodeId::new_numeric(namespace, read_u32(stream)?))
            }
            NODE_ID_STRING => {
                let namespace = read_u16(stream)?;
                let value = UAString::decode(stream, options)?;
                Ok(NodeId {
                    namespace,
                    identifier: Identifier::String(value),
                })
            }
            NODE_ID_GUID => {
                let namespace = read_u16(stream)?;
                let value = Guid::decode(stream, options)?;
                Ok(NodeId {
                    namespace,
                    identifier: Identifier::Guid(value),
                })
            }
            NODE_ID_BYTE_STRING => {
                let namespace = read_u16(stream)?;
                let value = ByteString::decode(stream, options)?;
                Ok(NodeId {
                    namespace,
                    identifier: Identifier::ByteString(value),
                })
            }
            _ => Err(Error::decoding(format!(
                "Unrecognized node id data encoding {encoding}"
            ))),
        }
    }
}

impl NodeId {
    /// The null node id, `ns=0;i=0`.
    pub fn null() -> NodeId {
        NodeId::new_numeric(0, 0)
    }

    /// Create a numeric node id.
    pub fn new_numeric(namespace: u16, value: u32) -> NodeId {
        NodeId {
            namespace,
            identifier: Identifier::Numeric(value),
        }
    }

    /// Create a node id holding a random GUID, used for session and authentication tokens.
    pub fn new_guid(namespace: u16) -> NodeId {
        NodeId {
            namespace,
            identifier: Identifier::Guid(Guid::new()),
        }
    }

    /// Test if the node id is null.
    pub fn is_null(&self) -> bool {
        self.namespace == 0 && self.identifier == Identifier::Numeric(0)
    }

    /// Translate the node id into the [`ObjectId`] it names, if it names one.
    pub fn as_object_id(&self) -> std::result::Result<ObjectId, ()> {
        match (self.namespace, &self.identifier) {
            (0, Identifier::Numeric(value)) => ObjectId::from_u32(*value).ok_or(()),
            _ => Err(()),
        }
    }
}

impl From<ObjectId> for NodeId {
    fn from(value: ObjectId) -> Self {
        NodeId::new_numeric(0, value as u32)
    }
}

macro_rules! object_ids {
    ($( ($name:ident, $value:expr) ),* $(,)?) => {
        /// Binary encoding ids of the message and token types the stack handles, in
        /// namespace 0. The values are the `_Encoding_DefaultBinary` ids from the standard.
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        #[allow(non_camel_case_types)]
        #[repr(u32)]
        pub enum ObjectId {
            $( #[allow(missing_docs)] $name = $value, )*
        }

        impl ObjectId {
            /// Look up an object id from its numeric value.
            pub fn from_u32(value: u32) -> Option<ObjectId> {
                match value {
                    $( $value => Some(ObjectId::$name), )*
                    _ => None,
                }
            }
        }
    };
}

object_ids![
    (AnonymousIdentityToken_Encoding_DefaultBinary, 321),
    (UserNameIdentityToken_Encoding_DefaultBinary, 324),
    (X509IdentityToken_Encoding_DefaultBinary, 327),
    (IssuedIdentityToken_Encoding_DefaultBinary, 940),
    (ServiceFault_Encoding_DefaultBinary, 397),
    (FindServersRequest_Encoding_DefaultBinary, 422),
    (FindServersResponse_Encoding_DefaultBinary, 425),
    (GetEndpointsRequest_Encoding_DefaultBinary, 428),
    (GetEndpointsResponse_Encoding_DefaultBinary, 431),
    (RegisterServerRequest_Encoding_DefaultBinary, 437),
    (RegisterServerResponse_Encoding_DefaultBinary, 440),
    (OpenSecureChannelRequest_Encoding_DefaultBinary, 446),
    (OpenSecureChannelResponse_Encoding_DefaultBinary, 449),
    (CloseSecureChannelRequest_Encoding_DefaultBinary, 452),
    (CloseSecureChannelResponse_Encoding_DefaultBinary, 455),
    (CreateSessionRequest_Encoding_DefaultBinary, 461),
    (CreateSessionResponse_Encoding_DefaultBinary, 464),
    (ActivateSessionRequest_Encoding_DefaultBinary, 467),
    (ActivateSessionResponse_Encoding_DefaultBinary, 470),
    (CloseSessionRequest_Encoding_DefaultBinary, 473),
    (CloseSessionResponse_Encoding_DefaultBinary, 476),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_byte_form() {
        let id = NodeId::new_numeric(0, 255);
        assert_eq!(id.byte_len(), 2);
        let buf = id.encode_to_vec();
        let mut stream = std::io::Cursor::new(buf);
        assert_eq!(
            NodeId::decode(&mut stream, &DecodingOptions::default()).unwrap(),
            id
        );
    }

    #[test]
    fn four_byte_form() {
        let id = NodeId::new_numeric(4, 1024);
        assert_eq!(id.byte_len(), 4);
        let buf = id.encode_to_vec();
        let mut stream = std::io::Cursor::new(buf);
        assert_eq!(
            NodeId::decode(&mut stream, &DecodingOptions::default()).unwrap(),
            id
        );
    }

    #[test]
    fn full_forms() {
        let options = DecodingOptions::default();
        for id in [
            NodeId::new_numeric(300, 0x12345678),
            NodeId {
                namespace: 2,
                identifier: Identifier::String("some node".into()),
            },
            NodeId::new_guid(1),
            NodeId {
                namespace: 3,
                identifier: Identifier::ByteString(vec![1u8, 2, 3].into()),
            },
        ] {
            let buf = id.encode_to_vec();
            assert_eq!(buf.len(), id.byte_len());
            let mut stream = std::io::Cursor::new(buf);
            assert_eq!(NodeId::decode(&mut stream, &options).unwrap(), id);
        }
    }

    #[test]
    fn object_id_lookup() {
        let id: NodeId = ObjectId::OpenSecureChannelRequest_Encoding_DefaultBinary.into();
        assert_eq!(
            id.as_object_id().unwrap(),
            ObjectId::OpenSecureChannelRequest_Encoding_DefaultBinary
        );
        assert!(NodeId::new_numeric(0, 99999).as_object_id().is_err());
    }
}
