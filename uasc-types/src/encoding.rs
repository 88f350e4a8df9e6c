// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Contains the [`BinaryEncodable`] and [`BinaryDecodable`] traits and helpers for reading and
//! writing of scalar values and other primitives.

use std::{
    error::Error as StdError,
    fmt::{Debug, Display},
    io::{Read, Result, Write},
};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::status_code::StatusCode;

/// Result of an encoding or decoding operation.
pub type EncodingResult<T> = std::result::Result<T, Error>;

#[derive(Debug)]
/// General protocol error.
///
/// Contains context about the request this error occured as part of, if that is possible to
/// retrieve, as well as details about the error that caused this, and a status code.
pub struct Error {
    status: StatusCode,
    request_id: Option<u32>,
    request_handle: Option<u32>,
    context: Box<dyn StdError + Send + Sync>,
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status(), self.context)
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.context)
    }
}

impl Error {
    /// Create a new error with the specified `status` code and
    /// `context` as a dynamic error source.
    pub fn new(status: StatusCode, context: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self {
            status,
            request_handle: None,
            request_id: None,
            context: context.into(),
        }
    }

    /// Create a new error with status code `BadDecodingError` and
    /// `context` as a dynamic error source.
    pub fn decoding(context: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::new(StatusCode::BadDecodingError, context)
    }

    /// Create a new error with status code `BadEncodingError` and
    /// `context` as a dynamic error source.
    pub fn encoding(context: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::new(StatusCode::BadEncodingError, context)
    }

    /// Add request ID and request handle to this error.
    pub fn with_context(mut self, request_id: Option<u32>, request_handle: Option<u32>) -> Self {
        self.request_id = request_id;
        self.request_handle = request_handle;
        self
    }

    /// Add request ID to this error.
    pub fn with_request_id(mut self, id: u32) -> Self {
        self.request_id = Some(id);
        self
    }

    /// Add request handle to this error.
    pub fn with_request_handle(mut self, handle: u32) -> Self {
        self.request_handle = Some(handle);
        self
    }

    /// Get the inner status code of this error.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the request id this error belongs to, if known.
    pub fn request_id(&self) -> Option<u32> {
        self.request_id
    }

    /// Get the full context of this error, if both fields are present.
    pub fn full_context(&self) -> Option<(u32, u32)> {
        if let (Some(id), Some(handle)) = (self.request_id, self.request_handle) {
            Some((id, handle))
        } else {
            None
        }
    }
}

impl From<Error> for StatusCode {
    fn from(value: Error) -> Self {
        log::error!("{}", value);
        value.status()
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        value.status().into()
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::decoding(value)
    }
}

impl From<StatusCode> for Error {
    fn from(value: StatusCode) -> Self {
        Error::new(value, value.name())
    }
}

#[derive(Clone, Debug)]
/// Options used when decoding values, lifted from the negotiated transport limits.
pub struct DecodingOptions {
    /// Maximum size of a message in bytes. 0 means no limit.
    pub max_message_size: usize,
    /// Maximum number of chunks in a message. 0 means no limit.
    pub max_chunk_count: usize,
    /// Maximum length in bytes of a string. 0 means no limit.
    pub max_string_length: usize,
    /// Maximum number of array elements. 0 means no limit.
    pub max_array_length: usize,
    /// Time offset between the client and the server, only used by the client
    /// when it is configured to ignore clock skew.
    pub client_offset: chrono::Duration,
}

impl Default for DecodingOptions {
    fn default() -> Self {
        DecodingOptions {
            max_message_size: constants::MAX_MESSAGE_SIZE,
            max_chunk_count: constants::MAX_CHUNK_COUNT,
            max_string_length: constants::MAX_STRING_LENGTH,
            max_array_length: constants::MAX_ARRAY_LENGTH,
            client_offset: chrono::Duration::zero(),
        }
    }
}

impl DecodingOptions {
    /// For messages that are minimal and likely succeed in any context, e.g. the HEL/ACK
    /// handshake before limits are negotiated.
    pub fn minimal() -> Self {
        DecodingOptions {
            max_string_length: 8192,
            ..Default::default()
        }
    }
}

/// Default limits carried by [`DecodingOptions`] before anything was negotiated.
pub mod constants {
    /// Maximum size of a message in bytes.
    pub const MAX_MESSAGE_SIZE: usize = 2 * 1024 * 1024;
    /// Maximum number of chunks in a message.
    pub const MAX_CHUNK_COUNT: usize = 64;
    /// Maximum length in bytes of a string.
    pub const MAX_STRING_LENGTH: usize = 128 * 1024;
    /// Maximum number of array elements.
    pub const MAX_ARRAY_LENGTH: usize = 128 * 1024;
    /// Maximum length in bytes of a certificate.
    pub const MAX_CERTIFICATE_LENGTH: usize = 32768;
}

/// Implemented by values with a fixed binary representation on the wire.
pub trait BinaryEncodable {
    /// Returns the exact byte length of the structure as it would be if `encode` were called.
    fn byte_len(&self) -> usize;
    /// Encodes the instance to the write stream.
    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()>;

    /// Convenience method for encoding a message straight into an array of bytes.
    /// It is preferable to reuse buffers than to call this so it should be reserved for tests
    /// and trivial code.
    fn encode_to_vec(&self) -> Vec<u8>
    where
        Self: Sized,
    {
        let mut buffer = Vec::with_capacity(self.byte_len());
        let _ = self.encode(&mut buffer);
        buffer
    }
}

/// Implemented by values that can be read back from their binary representation.
pub trait BinaryDecodable: Sized {
    /// Decodes an instance from the read stream. The decoding options contain restrictions set by
    /// the server / client on the length of strings, arrays etc.
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self>;
}

/// Converts an IO encoding error (and logs when in error) into an EncodingResult
pub fn process_encode_io_result(result: Result<()>) -> EncodingResult<()> {
    result.map_err(|err| Error::encoding(err))
}

/// Converts an IO decoding error (and logs when in error) into an EncodingResult
pub fn process_decode_io_result(result: Result<()>) -> EncodingResult<()> {
    result.map_err(|err| Error::decoding(err))
}

impl<T: BinaryEncodable> BinaryEncodable for Option<Vec<T>> {
    fn byte_len(&self) -> usize {
        let mut size = 4;
        if let Some(ref values) = self {
            size += values.iter().map(|v| v.byte_len()).sum::<usize>();
        }
        size
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        if let Some(ref values) = self {
            write_i32(stream, values.len() as i32)?;
            for value in values.iter() {
                value.encode(stream)?;
            }
        } else {
            write_i32(stream, -1)?;
        }
        Ok(())
    }
}

impl<T: BinaryDecodable> BinaryDecodable for Option<Vec<T>> {
    fn decode<S: Read + ?Sized>(stream: &mut S, options: &DecodingOptions) -> EncodingResult<Self> {
        let len = read_i32(stream)?;
        if len == -1 {
            Ok(None)
        } else if len < -1 {
            Err(Error::decoding(format!(
                "Array length of {len} is invalid"
            )))
        } else if options.max_array_length > 0 && len as usize > options.max_array_length {
            Err(Error::decoding(format!(
                "Array length of {} exceeds decoding limit of {}",
                len, options.max_array_length
            )))
        } else {
            let mut values: Vec<T> = Vec::with_capacity(len as usize);
            for _ in 0..len {
                values.push(T::decode(stream, options)?);
            }
            Ok(Some(values))
        }
    }
}

impl BinaryEncodable for bool {
    fn byte_len(&self) -> usize {
        1
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        write_u8(stream, if *self { 1 } else { 0 })
    }
}

impl BinaryDecodable for bool {
    fn decode<S: Read + ?Sized>(stream: &mut S, _: &DecodingOptions) -> EncodingResult<Self> {
        Ok(read_u8(stream)? == 1)
    }
}

macro_rules! scalar_codable {
    ($t:ty, $len:expr, $write:ident, $read:ident) => {
        impl BinaryEncodable for $t {
            fn byte_len(&self) -> usize {
                $len
            }

            fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
                $write(stream, *self)
            }
        }

        impl BinaryDecodable for $t {
            fn decode<S: Read + ?Sized>(
                stream: &mut S,
                _: &DecodingOptions,
            ) -> EncodingResult<Self> {
                $read(stream)
            }
        }
    };
}

scalar_codable!(u8, 1, write_u8, read_u8);
scalar_codable!(u16, 2, write_u16, read_u16);
scalar_codable!(i32, 4, write_i32, read_i32);
scalar_codable!(u32, 4, write_u32, read_u32);
scalar_codable!(i64, 8, write_i64, read_i64);
scalar_codable!(f64, 8, write_f64, read_f64);

/// Writes a series of identical bytes to the stream
pub fn write_bytes<W: Write + ?Sized>(stream: &mut W, value: u8, count: usize) -> EncodingResult<usize> {
    for _ in 0..count {
        stream
            .write_u8(value)
            .map_err(|_| Error::encoding("Cannot write bytes"))?;
    }
    Ok(count)
}

/// Writes an unsigned byte to the stream
pub fn write_u8<W: Write + ?Sized>(stream: &mut W, value: u8) -> EncodingResult<()> {
    let buf: [u8; 1] = [value];
    process_encode_io_result(stream.write_all(&buf))
}

/// Writes an unsigned 16-bit value to the stream
pub fn write_u16<W: Write + ?Sized>(stream: &mut W, value: u16) -> EncodingResult<()> {
    let mut buf = [0u8; 2];
    LittleEndian::write_u16(&mut buf, value);
    process_encode_io_result(stream.write_all(&buf))
}

/// Writes a signed 32-bit value to the stream
pub fn write_i32<W: Write + ?Sized>(stream: &mut W, value: i32) -> EncodingResult<()> {
    let mut buf = [0u8; 4];
    LittleEndian::write_i32(&mut buf, value);
    process_encode_io_result(stream.write_all(&buf))
}

/// Writes an unsigned 32-bit value to the stream
pub fn write_u32<W: Write + ?Sized>(stream: &mut W, value: u32) -> EncodingResult<()> {
    let mut buf = [0u8; 4];
    LittleEndian::write_u32(&mut buf, value);
    process_encode_io_result(stream.write_all(&buf))
}

/// Writes a signed 64-bit value to the stream
pub fn write_i64<W: Write + ?Sized>(stream: &mut W, value: i64) -> EncodingResult<()> {
    let mut buf = [0u8; 8];
    LittleEndian::write_i64(&mut buf, value);
    process_encode_io_result(stream.write_all(&buf))
}

/// Writes a 64-bit double precision value to the stream
pub fn write_f64<W: Write + ?Sized>(stream: &mut W, value: f64) -> EncodingResult<()> {
    let mut buf = [0u8; 8];
    LittleEndian::write_f64(&mut buf, value);
    process_encode_io_result(stream.write_all(&buf))
}

/// Reads an array of bytes from the stream
pub fn read_bytes<R: Read + ?Sized>(stream: &mut R, buf: &mut [u8]) -> EncodingResult<usize> {
    process_decode_io_result(stream.read_exact(buf))?;
    Ok(buf.len())
}

/// Read an unsigned byte from the stream
pub fn read_u8<R: Read + ?Sized>(stream: &mut R) -> EncodingResult<u8> {
    let mut buf = [0u8];
    process_decode_io_result(stream.read_exact(&mut buf))?;
    Ok(buf[0])
}

/// Read an unsigned 16-bit value from the stream
pub fn read_u16<R: Read + ?Sized>(stream: &mut R) -> EncodingResult<u16> {
    let mut buf = [0u8; 2];
    process_decode_io_result(stream.read_exact(&mut buf))?;
    Ok(LittleEndian::read_u16(&buf))
}

/// Read a signed 32-bit value from the stream
pub fn read_i32<R: Read + ?Sized>(stream: &mut R) -> EncodingResult<i32> {
    let mut buf = [0u8; 4];
    process_decode_io_result(stream.read_exact(&mut buf))?;
    Ok(LittleEndian::read_i32(&buf))
}

/// Read an unsigned 32-bit value from the stream
pub fn read_u32<R: Read + ?Sized>(stream: &mut R) -> EncodingResult<u32> {
    let mut buf = [0u8; 4];
    process_decode_io_result(stream.read_exact(&mut buf))?;
    Ok(LittleEndian::read_u32(&buf))
}

/// Read a signed 64-bit value from the stream
pub fn read_i64<R: Read + ?Sized>(stream: &mut R) -> EncodingResult<i64> {
    let mut buf = [0u8; 8];
    process_decode_io_result(stream.read_exact(&mut buf))?;
    Ok(LittleEndian::read_i64(&buf))
}

/// Read a 64-bit double precision value from the stream
pub fn read_f64<R: Read + ?Sized>(stream: &mut R) -> EncodingResult<f64> {
    let mut buf = [0u8; 8];
    process_decode_io_result(stream.read_exact(&mut buf))?;
    Ok(LittleEndian::read_f64(&buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_round_trip() {
        let mut buf = Vec::new();
        0xdeadbeefu32.encode(&mut buf).unwrap();
        (-5i32).encode(&mut buf).unwrap();
        true.encode(&mut buf).unwrap();

        let options = DecodingOptions::default();
        let mut stream = std::io::Cursor::new(buf);
        assert_eq!(u32::decode(&mut stream, &options).unwrap(), 0xdeadbeef);
        assert_eq!(i32::decode(&mut stream, &options).unwrap(), -5);
        assert!(bool::decode(&mut stream, &options).unwrap());
    }

    #[test]
    fn array_null_and_limits() {
        let none: Option<Vec<u32>> = None;
        let buf = none.encode_to_vec();
        assert_eq!(buf, vec![0xff, 0xff, 0xff, 0xff]);

        let mut stream = std::io::Cursor::new(&buf);
        let decoded: Option<Vec<u32>> =
            BinaryDecodable::decode(&mut stream, &DecodingOptions::default()).unwrap();
        assert!(decoded.is_none());

        let values = Some(vec![1u32, 2, 3]);
        let buf = values.encode_to_vec();
        let restrictive = DecodingOptions {
            max_array_length: 2,
            ..Default::default()
        };
        let mut stream = std::io::Cursor::new(&buf);
        let decoded: EncodingResult<Option<Vec<u32>>> =
            BinaryDecodable::decode(&mut stream, &restrictive);
        assert!(decoded.is_err());
    }
}
