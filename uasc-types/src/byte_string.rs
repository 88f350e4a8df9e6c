// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Contains the implementation of [`ByteString`].

use std::io::{Read, Write};

use crate::encoding::{
    process_decode_io_result, process_encode_io_result, read_i32, write_i32, BinaryDecodable,
    BinaryEncodable, DecodingOptions, EncodingResult, Error,
};

/// A sequence of octets. A null byte string is distinct from an empty one.
#[derive(Eq, PartialEq, Debug, Clone, Hash, Default)]
pub struct ByteString {
    /// Raw inner byte string values as an array of bytes.
    pub value: Option<Vec<u8>>,
}

impl AsRef<[u8]> for ByteString {
    fn as_ref(&self) -> &[u8] {
        self.value.as_deref().unwrap_or(&[])
    }
}

impl BinaryEncodable for ByteString {
    fn byte_len(&self) -> usize {
        4 + match self.value {
            Some(ref value) => value.len(),
            None => 0,
        }
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        match self.value {
            Some(ref value) => {
                write_i32(stream, value.len() as i32)?;
                process_encode_io_result(stream.write_all(value))
            }
            None => write_i32(stream, -1),
        }
    }
}

impl BinaryDecodable for ByteString {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        let len = read_i32(stream)?;
        // Null bytestring?
        if len == -1 {
            return Ok(ByteString::null());
        }
        if len < -1 {
            return Err(Error::decoding(format!(
                "ByteString length is a negative number {len}"
            )));
        }
        if options.max_string_length > 0 && len as usize > options.max_string_length {
            return Err(Error::decoding(format!(
                "ByteString length {} exceeds decoding limit {}",
                len, options.max_string_length
            )));
        }
        let mut value = vec![0u8; len as usize];
        process_decode_io_result(stream.read_exact(&mut value))?;
        Ok(ByteString { value: Some(value) })
    }
}

impl From<&[u8]> for ByteString {
    fn from(value: &[u8]) -> Self {
        ByteString {
            value: Some(value.to_vec()),
        }
    }
}

impl From<Vec<u8>> for ByteString {
    fn from(value: Vec<u8>) -> Self {
        ByteString { value: Some(value) }
    }
}

impl From<&Vec<u8>> for ByteString {
    fn from(value: &Vec<u8>) -> Self {
        ByteString {
            value: Some(value.clone()),
        }
    }
}

impl ByteString {
    /// The null byte string.
    pub fn null() -> ByteString {
        ByteString { value: None }
    }

    /// Test if the byte string is null.
    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }

    /// Test if the byte string is null or empty.
    pub fn is_null_or_empty(&self) -> bool {
        self.value.as_ref().map(|v| v.is_empty()).unwrap_or(true)
    }

    /// The length of the byte string.
    pub fn len(&self) -> usize {
        self.value.as_ref().map(|v| v.len()).unwrap_or(0)
    }

    /// Test if the byte string is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy out the inner value, yielding an empty vec for null.
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_ref().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let b = ByteString::from(vec![1u8, 2, 3, 4]);
        let buf = b.encode_to_vec();
        assert_eq!(buf.len(), b.byte_len());
        let mut stream = std::io::Cursor::new(buf);
        let decoded = ByteString::decode(&mut stream, &DecodingOptions::default()).unwrap();
        assert_eq!(decoded, b);
    }

    #[test]
    fn null() {
        let b = ByteString::null();
        assert!(b.is_null());
        assert_eq!(b.as_ref(), &[] as &[u8]);
        let mut stream = std::io::Cursor::new(b.encode_to_vec());
        assert!(ByteString::decode(&mut stream, &DecodingOptions::default())
            .unwrap()
            .is_null());
    }
}
