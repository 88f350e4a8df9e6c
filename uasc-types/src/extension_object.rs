// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Implementation of [`ExtensionObject`], the container for polymorphic values such as user
//! identity tokens.

use std::io::{Cursor, Read, Write};

use crate::{
    byte_string::ByteString,
    encoding::{
        read_u8, write_i32, write_u8, BinaryDecodable, BinaryEncodable, DecodingOptions,
        EncodingResult, Error,
    },
    node_id::{NodeId, ObjectId},
};

// Body encoding bytes.
const BODY_NONE: u8 = 0x00;
const BODY_BYTE_STRING: u8 = 0x01;

/// An extension object holds a binary-encoded structure identified by the node id of its
/// encoding. XML bodies are not supported by this stack.
#[derive(PartialEq, Debug, Clone, Default)]
pub struct ExtensionObject {
    /// The node id of the body's binary encoding, null when there is no body.
    pub node_id: NodeId,
    /// The encoded body.
    pub body: Option<Vec<u8>>,
}

impl BinaryEncodable for ExtensionObject {
    fn byte_len(&self) -> usize {
        let mut size = self.node_id.byte_len() + 1;
        if let Some(ref body) = self.body {
            size += 4 + body.len();
        }
        size
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        self.node_id.encode(stream)?;
        match self.body {
            Some(ref body) => {
                write_u8(stream, BODY_BYTE_STRING)?;
                write_i32(stream, body.len() as i32)?;
                crate::encoding::process_encode_io_result(stream.write_all(body))
            }
            None => write_u8(stream, BODY_NONE),
        }
    }
}

impl BinaryDecodable for ExtensionObject {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        let node_id = NodeId::decode(stream, options)?;
        let encoding = read_u8(stream)?;
        let body = match encoding {
            BODY_NONE => None,
            BODY_BYTE_STRING => {
                let body = ByteString::decode(stream, options)?;
                Some(body.to_vec())
            }
            _ => {
                return Err(Error::decoding(format!(
                    "Unsupported extension object encoding {encoding}"
                )));
            }
        };
        Ok(ExtensionObject { node_id, body })
    }
}

impl ExtensionObject {
    /// An extension object with no body.
    pub fn null() -> ExtensionObject {
        ExtensionObject {
            node_id: NodeId::null(),
            body: None,
        }
    }

    /// Test if the object has no body.
    pub fn is_null(&self) -> bool {
        self.body.is_none()
    }

    /// Wrap an encodable value, tagging it with the binary encoding id.
    pub fn from_message(id: ObjectId, value: &impl BinaryEncodable) -> ExtensionObject {
        ExtensionObject {
            node_id: id.into(),
            body: Some(value.encode_to_vec()),
        }
    }

    /// The object id of the body encoding, if the node id names one.
    pub fn object_id(&self) -> std::result::Result<ObjectId, ()> {
        self.node_id.as_object_id()
    }

    /// Decode the inner body into the expected type.
    pub fn decode_inner<T: BinaryDecodable>(
        &self,
        options: &DecodingOptions,
    ) -> EncodingResult<T> {
        let Some(ref body) = self.body else {
            return Err(Error::decoding("Extension object has no body"));
        };
        let mut stream = Cursor::new(body);
        T::decode(&mut stream, options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let inner = 0xcafe_f00du32;
        let obj = ExtensionObject::from_message(
            ObjectId::AnonymousIdentityToken_Encoding_DefaultBinary,
            &inner,
        );
        let buf = obj.encode_to_vec();
        assert_eq!(buf.len(), obj.byte_len());
        let mut stream = Cursor::new(buf);
        let decoded = ExtensionObject::decode(&mut stream, &DecodingOptions::default()).unwrap();
        assert_eq!(
            decoded.object_id().unwrap(),
            ObjectId::AnonymousIdentityToken_Encoding_DefaultBinary
        );
        let value: u32 = decoded.decode_inner(&DecodingOptions::default()).unwrap();
        assert_eq!(value, inner);
    }

    #[test]
    fn null_body() {
        let obj = ExtensionObject::null();
        let buf = obj.encode_to_vec();
        let mut stream = Cursor::new(buf);
        let decoded = ExtensionObject::decode(&mut stream, &DecodingOptions::default()).unwrap();
        assert!(decoded.is_null());
    }
}
