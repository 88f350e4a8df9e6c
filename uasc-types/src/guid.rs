// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Implementation of [`Guid`].

use std::{
    fmt,
    io::{Read, Write},
};

use uuid::Uuid;

use crate::encoding::{
    process_decode_io_result, process_encode_io_result, BinaryDecodable, BinaryEncodable,
    DecodingOptions, EncodingResult,
};

/// A 16-byte globally unique identifier.
#[derive(Eq, PartialEq, Clone, Hash, Default)]
pub struct Guid {
    uuid: Uuid,
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)
    }
}

impl BinaryEncodable for Guid {
    fn byte_len(&self) -> usize {
        16
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        // The GUID is serialized in the Microsoft field order, not as the raw uuid bytes.
        let (data1, data2, data3, data4) = self.uuid.as_fields();
        let mut buf = [0u8; 16];
        buf[0..4].copy_from_slice(&data1.to_le_bytes());
        buf[4..6].copy_from_slice(&data2.to_le_bytes());
        buf[6..8].copy_from_slice(&data3.to_le_bytes());
        buf[8..16].copy_from_slice(data4);
        process_encode_io_result(stream.write_all(&buf))
    }
}

impl BinaryDecodable for Guid {
    fn decode<S: Read + ?Sized>(stream: &mut S, _: &DecodingOptions) -> EncodingResult<Self> {
        let mut buf = [0u8; 16];
        process_decode_io_result(stream.read_exact(&mut buf))?;
        let data1 = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let data2 = u16::from_le_bytes([buf[4], buf[5]]);
        let data3 = u16::from_le_bytes([buf[6], buf[7]]);
        let mut data4 = [0u8; 8];
        data4.copy_from_slice(&buf[8..16]);
        Ok(Guid {
            uuid: Uuid::from_fields(data1, data2, data3, &data4),
        })
    }
}

impl Guid {
    /// Create a new random Guid.
    pub fn new() -> Guid {
        Guid {
            uuid: Uuid::new_v4(),
        }
    }

    /// The null Guid, all zeroes.
    pub fn null() -> Guid {
        Guid { uuid: Uuid::nil() }
    }

    /// Test if the Guid is null.
    pub fn is_null(&self) -> bool {
        self.uuid.is_nil()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let guid = Guid::new();
        let buf = guid.encode_to_vec();
        assert_eq!(buf.len(), 16);
        let mut stream = std::io::Cursor::new(buf);
        let decoded = Guid::decode(&mut stream, &DecodingOptions::default()).unwrap();
        assert_eq!(decoded, guid);
    }
}
