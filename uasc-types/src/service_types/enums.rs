// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Enumerations used in service messages. All are serialized as 32-bit little-endian values.

use std::{
    fmt,
    io::{Read, Write},
};

use crate::encoding::{
    read_i32, write_i32, BinaryDecodable, BinaryEncodable, DecodingOptions, EncodingResult, Error,
};

macro_rules! ua_enum {
    ($(#[$doc:meta])* $name:ident { $( $(#[$vdoc:meta])* $variant:ident = $value:expr ),* $(,)? }) => {
        $(#[$doc])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
        #[repr(i32)]
        pub enum $name {
            $( $(#[$vdoc])* $variant = $value, )*
        }

        impl BinaryEncodable for $name {
            fn byte_len(&self) -> usize {
                4
            }

            fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
                write_i32(stream, *self as i32)
            }
        }

        impl BinaryDecodable for $name {
            fn decode<S: Read + ?Sized>(
                stream: &mut S,
                _: &DecodingOptions,
            ) -> EncodingResult<Self> {
                let value = read_i32(stream)?;
                match value {
                    $( $value => Ok($name::$variant), )*
                    _ => Err(Error::decoding(format!(
                        "Value {} is not valid for enum {}", value, stringify!($name)
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:?}", self)
            }
        }
    };
}

ua_enum! {
    /// The security mode of a secure channel.
    MessageSecurityMode {
        /// Mode is unset. Not valid on an open channel.
        Invalid = 0,
        /// Messages are neither signed nor encrypted.
        None = 1,
        /// Messages are signed but not encrypted.
        Sign = 2,
        /// Messages are signed and encrypted.
        SignAndEncrypt = 3,
    }
}

impl Default for MessageSecurityMode {
    fn default() -> Self {
        MessageSecurityMode::Invalid
    }
}

ua_enum! {
    /// What an OpenSecureChannel request asks for.
    SecurityTokenRequestType {
        /// Issue a token for a new channel.
        Issue = 0,
        /// Renew the token of an existing channel.
        Renew = 1,
    }
}

impl Default for UserTokenType {
    fn default() -> Self {
        UserTokenType::Anonymous
    }
}

ua_enum! {
    /// The kind of user identity a user token policy accepts.
    UserTokenType {
        /// No identity.
        Anonymous = 0,
        /// User name and password.
        UserName = 1,
        /// An X509 certificate.
        Certificate = 2,
        /// A token issued by an external authority.
        IssuedToken = 3,
    }
}

impl Default for ApplicationType {
    fn default() -> Self {
        ApplicationType::Server
    }
}

ua_enum! {
    /// The kind of application described by an ApplicationDescription.
    ApplicationType {
        /// A server.
        Server = 0,
        /// A client.
        Client = 1,
        /// Both client and server.
        ClientAndServer = 2,
        /// A discovery server.
        DiscoveryServer = 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let buf = MessageSecurityMode::SignAndEncrypt.encode_to_vec();
        assert_eq!(buf, vec![3, 0, 0, 0]);
        let mut stream = std::io::Cursor::new(buf);
        assert_eq!(
            MessageSecurityMode::decode(&mut stream, &DecodingOptions::default()).unwrap(),
            MessageSecurityMode::SignAndEncrypt
        );
    }

    #[test]
    fn invalid_value_rejected() {
        let buf = 17i32.encode_to_vec();
        let mut stream = std::io::Cursor::new(buf);
        assert!(UserTokenType::decode(&mut stream, &DecodingOptions::default()).is_err());
    }
}
