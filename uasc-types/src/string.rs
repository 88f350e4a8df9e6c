// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Contains the implementation of [`UAString`].

use std::{
    fmt,
    io::{Read, Write},
};

use crate::encoding::{
    process_decode_io_result, process_encode_io_result, read_i32, write_i32, BinaryDecodable,
    BinaryEncodable, DecodingOptions, EncodingResult, Error,
};

/// To avoid naming conflicts with the std lib `String`, the OPC UA string type is typed
/// `UAString`. A string has a distinct null value from an empty string.
#[derive(Eq, PartialEq, Debug, Clone, Hash, Default)]
pub struct UAString {
    /// The string value. A null string is `None`.
    pub value: Option<String>,
}

impl fmt::Display for UAString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref value) = self.value {
            write!(f, "{}", value)
        } else {
            write!(f, "[null]")
        }
    }
}

impl AsRef<str> for UAString {
    fn as_ref(&self) -> &str {
        self.value.as_deref().unwrap_or("")
    }
}

impl BinaryEncodable for UAString {
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
                process_encode_io_result(stream.write_all(value.as_bytes()))
            }
            None => write_i32(stream, -1),
        }
    }
}

impl BinaryDecodable for UAString {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        let len = read_i32(stream)?;
        // Null string?
        if len == -1 {
            return Ok(UAString::null());
        }
        if len < -1 {
            return Err(Error::decoding(format!(
                "String buf length is a negative number {len}"
            )));
        }
        if options.max_string_length > 0 && len as usize > options.max_string_length {
            return Err(Error::decoding(format!(
                "String buf length {} exceeds decoding limit {}",
                len, options.max_string_length
            )));
        }
        let mut buf = vec![0u8; len as usize];
        process_decode_io_result(stream.read_exact(&mut buf))?;
        let value = String::from_utf8(buf)
            .map_err(|e| Error::decoding(format!("String buf is not valid UTF-8: {e}")))?;
        Ok(UAString::from(value))
    }
}

impl From<&str> for UAString {
    fn from(value: &str) -> Self {
        UAString {
            value: Some(value.to_string()),
        }
    }
}

impl From<String> for UAString {
    fn from(value: String) -> Self {
        UAString { value: Some(value) }
    }
}

impl PartialEq<str> for UAString {
    fn eq(&self, other: &str) -> bool {
        self.as_ref() == other
    }
}

impl UAString {
    /// The null string.
    pub fn null() -> UAString {
        UAString { value: None }
    }

    /// Test if the string is null.
    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }

    /// Test if the string is null or empty.
    pub fn is_empty(&self) -> bool {
        self.value.as_ref().map(|v| v.is_empty()).unwrap_or(true)
    }

    /// The length of the string in bytes or -1 for null.
    pub fn len(&self) -> isize {
        self.value.as_ref().map(|v| v.len() as isize).unwrap_or(-1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_and_empty_are_distinct() {
        let null = UAString::null();
        let empty = UAString::from("");
        assert_ne!(null, empty);
        assert_eq!(null.encode_to_vec(), vec![0xff, 0xff, 0xff, 0xff]);
        assert_eq!(empty.encode_to_vec(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn round_trip() {
        let s = UAString::from("opc.tcp://localhost:4840");
        let buf = s.encode_to_vec();
        assert_eq!(buf.len(), s.byte_len());
        let mut stream = std::io::Cursor::new(buf);
        let decoded = UAString::decode(&mut stream, &DecodingOptions::default()).unwrap();
        assert_eq!(decoded, s);
    }

    #[test]
    fn length_limit() {
        let s = UAString::from("this string is too long");
        let buf = s.encode_to_vec();
        let options = DecodingOptions {
            max_string_length: 4,
            ..Default::default()
        };
        let mut stream = std::io::Cursor::new(buf);
        assert!(UAString::decode(&mut stream, &options).is_err());
    }
}
