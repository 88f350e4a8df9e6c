// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Status codes used through the stack. The values are the subset of the OPC UA status code
//! table the secure conversation layer can produce or has to recognize.

use std::{
    fmt::{Display, Formatter},
    io::{Read, Write},
};

use crate::encoding::{
    read_u32, write_u32, BinaryDecodable, BinaryEncodable, DecodingOptions, EncodingResult,
};

/// A 32-bit status code. The top two bits hold the severity, `0b10` meaning bad.
/// Unrecognized values survive a decode/encode round trip unchanged.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StatusCode(u32);

macro_rules! status_codes {
    ($( ($name:ident, $value:expr) ),* $(,)?) => {
        #[allow(non_upper_case_globals)]
        impl StatusCode {
            $( #[doc = stringify!($name)] pub const $name: StatusCode = StatusCode($value); )*

            /// The symbolic name of this status code, or `"Unknown"` for values outside
            /// the recognized set.
            pub fn name(&self) -> &'static str {
                match self.0 {
                    $( $value => stringify!($name), )*
                    _ => "Unknown",
                }
            }
        }
    };
}

status_codes![
    (Good, 0x0000_0000),
    (BadUnexpectedError, 0x8001_0000),
    (BadInternalError, 0x8002_0000),
    (BadOutOfMemory, 0x8003_0000),
    (BadResourceUnavailable, 0x8004_0000),
    (BadCommunicationError, 0x8005_0000),
    (BadEncodingError, 0x8006_0000),
    (BadDecodingError, 0x8007_0000),
    (BadEncodingLimitsExceeded, 0x8008_0000),
    (BadUnknownResponse, 0x8009_0000),
    (BadTimeout, 0x800A_0000),
    (BadServiceUnsupported, 0x800B_0000),
    (BadShutdown, 0x800C_0000),
    (BadServerNotConnected, 0x800D_0000),
    (BadServerHalted, 0x800E_0000),
    (BadNothingToDo, 0x800F_0000),
    (BadTooManyOperations, 0x8010_0000),
    (BadCertificateInvalid, 0x8012_0000),
    (BadSecurityChecksFailed, 0x8013_0000),
    (BadCertificateTimeInvalid, 0x8014_0000),
    (BadCertificateUntrusted, 0x801A_0000),
    (BadUserAccessDenied, 0x801F_0000),
    (BadIdentityTokenInvalid, 0x8020_0000),
    (BadIdentityTokenRejected, 0x8021_0000),
    (BadSecureChannelIdInvalid, 0x8022_0000),
    (BadInvalidTimestamp, 0x8023_0000),
    (BadNonceInvalid, 0x8024_0000),
    (BadSessionIdInvalid, 0x8025_0000),
    (BadSessionClosed, 0x8026_0000),
    (BadSessionNotActivated, 0x8027_0000),
    (BadRequestHeaderInvalid, 0x802A_0000),
    (BadNotSupported, 0x803D_0000),
    (BadNotFound, 0x803E_0000),
    (BadInvalidArgument, 0x8044_0000),
    (BadInvalidState, 0x8046_0000),
    (BadSecurityModeRejected, 0x8054_0000),
    (BadSecurityPolicyRejected, 0x8055_0000),
    (BadTooManySessions, 0x8056_0000),
    (BadNoValidCertificates, 0x8059_0000),
    (BadTcpServerTooBusy, 0x807D_0000),
    (BadTcpMessageTypeInvalid, 0x807E_0000),
    (BadTcpSecureChannelUnknown, 0x807F_0000),
    (BadTcpMessageTooLarge, 0x8080_0000),
    (BadTcpNotEnoughResources, 0x8081_0000),
    (BadTcpInternalError, 0x8082_0000),
    (BadTcpEndpointUrlInvalid, 0x8083_0000),
    (BadRequestInterrupted, 0x8084_0000),
    (BadRequestTimeout, 0x8085_0000),
    (BadSecureChannelClosed, 0x8086_0000),
    (BadSecureChannelTokenUnknown, 0x8087_0000),
    (BadSequenceNumberInvalid, 0x8088_0000),
    (BadConnectionRejected, 0x80AC_0000),
    (BadDisconnect, 0x80AD_0000),
    (BadConnectionClosed, 0x80AE_0000),
    (BadEndOfStream, 0x80B0_0000),
    (BadNotConnected, 0x808A_0000),
    (BadMaxConnectionsReached, 0x80B7_0000),
    (BadRequestTooLarge, 0x80B8_0000),
    (BadResponseTooLarge, 0x80B9_0000),
    (BadProtocolVersionUnsupported, 0x80BE_0000),
];

impl StatusCode {
    /// Construct a status code from raw bits, keeping unrecognized values as-is.
    pub fn from_u32(value: u32) -> StatusCode {
        StatusCode(value)
    }

    /// The raw 32-bit value of the code.
    pub fn bits(&self) -> u32 {
        self.0
    }

    /// `true` if the severity bits indicate good.
    pub fn is_good(&self) -> bool {
        self.0 & 0xC000_0000 == 0
    }

    /// `true` if the severity bits indicate bad.
    pub fn is_bad(&self) -> bool {
        self.0 & 0x8000_0000 != 0
    }
}

impl Default for StatusCode {
    fn default() -> Self {
        StatusCode::Good
    }
}

impl Display for StatusCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = self.name();
        if name == "Unknown" {
            write!(f, "StatusCode({:#010x})", self.0)
        } else {
            write!(f, "{}", name)
        }
    }
}

impl From<StatusCode> for std::io::Error {
    fn from(value: StatusCode) -> Self {
        std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("StatusCode {}", value),
        )
    }
}

impl BinaryEncodable for StatusCode {
    fn byte_len(&self) -> usize {
        4
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        write_u32(stream, self.0)
    }
}

impl BinaryDecodable for StatusCode {
    fn decode<S: Read + ?Sized>(stream: &mut S, _: &DecodingOptions) -> EncodingResult<Self> {
        Ok(StatusCode::from_u32(read_u32(stream)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity() {
        assert!(StatusCode::Good.is_good());
        assert!(!StatusCode::Good.is_bad());
        assert!(StatusCode::BadTimeout.is_bad());
        assert!(!StatusCode::BadTimeout.is_good());
    }

    #[test]
    fn unknown_round_trip() {
        let raw = StatusCode::from_u32(0x8123_4567);
        let buf = raw.encode_to_vec();
        let mut stream = std::io::Cursor::new(buf);
        let decoded = StatusCode::decode(&mut stream, &DecodingOptions::default()).unwrap();
        assert_eq!(decoded.bits(), 0x8123_4567);
        assert_eq!(decoded.name(), "Unknown");
    }

    #[test]
    fn names() {
        assert_eq!(StatusCode::BadSecurityModeRejected.name(), "BadSecurityModeRejected");
        assert_eq!(format!("{}", StatusCode::BadShutdown), "BadShutdown");
    }
}
