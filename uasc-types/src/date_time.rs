// UASC for Rust
// SPDX-License-Identifier: MPL-2.0

//! Implementation of [`DateTime`], the wall-clock timestamp sent on the wire. All lifetime
//! arithmetic in the stack uses `std::time::Instant`; this type exists only for wire
//! timestamps and diagnostics.

use std::{
    fmt,
    io::{Read, Write},
    ops::{Add, Sub},
};

use chrono::{Duration, TimeZone, Utc};

use crate::encoding::{
    read_i64, write_i64, BinaryDecodable, BinaryEncodable, DecodingOptions, EncodingResult,
};

const NANOS_PER_TICK: i64 = 100;
const TICKS_PER_SECOND: i64 = 10_000_000;

/// A date/time value, encoded as 100 nanosecond ticks since 1601-01-01 00:00:00 UTC.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DateTime {
    date_time: chrono::DateTime<Utc>,
}

impl Default for DateTime {
    fn default() -> Self {
        DateTime::null()
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.date_time.to_rfc3339())
    }
}

impl DateTime {
    /// The current wall-clock time.
    pub fn now() -> DateTime {
        DateTime {
            date_time: Utc::now(),
        }
    }

    /// The current wall-clock time shifted by `offset`, used by clients compensating for
    /// clock skew against the server.
    pub fn now_with_offset(offset: Duration) -> DateTime {
        DateTime {
            date_time: Utc::now() + offset,
        }
    }

    /// The null / zero date time, i.e. the epoch itself.
    pub fn null() -> DateTime {
        DateTime::from_ticks(0)
    }

    /// Test if this is the null date time.
    pub fn is_null(&self) -> bool {
        self.ticks() == 0
    }

    /// Construct from ticks (100 ns intervals since the 1601 epoch). Values before the
    /// epoch are clamped to it.
    pub fn from_ticks(ticks: i64) -> DateTime {
        let ticks = ticks.max(0);
        let secs = ticks / TICKS_PER_SECOND;
        let nanos = (ticks % TICKS_PER_SECOND) * NANOS_PER_TICK;
        DateTime {
            date_time: epoch() + Duration::seconds(secs) + Duration::nanoseconds(nanos),
        }
    }

    /// The number of 100 ns ticks since the 1601 epoch.
    pub fn ticks(&self) -> i64 {
        let duration = self.date_time - epoch();
        duration.num_seconds() * TICKS_PER_SECOND
            + duration.subsec_nanos() as i64 / NANOS_PER_TICK
    }

    /// The underlying chrono value.
    pub fn as_chrono(&self) -> chrono::DateTime<Utc> {
        self.date_time
    }
}

fn epoch() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(1601, 1, 1, 0, 0, 0).unwrap()
}

impl From<chrono::DateTime<Utc>> for DateTime {
    fn from(date_time: chrono::DateTime<Utc>) -> Self {
        DateTime { date_time }
    }
}

impl Sub for DateTime {
    type Output = Duration;

    fn sub(self, other: DateTime) -> Duration {
        self.date_time - other.date_time
    }
}

impl Add<Duration> for DateTime {
    type Output = DateTime;

    fn add(self, other: Duration) -> DateTime {
        DateTime {
            date_time: self.date_time + other,
        }
    }
}

impl Sub<Duration> for DateTime {
    type Output = DateTime;

    fn sub(self, other: Duration) -> DateTime {
        DateTime {
            date_time: self.date_time - other,
        }
    }
}

impl BinaryEncodable for DateTime {
    fn byte_len(&self) -> usize {
        8
    }

    fn encode<S: Write + ?Sized>(&self, stream: &mut S) -> EncodingResult<()> {
        write_i64(stream, self.ticks())
    }
}

impl BinaryDecodable for DateTime {
    fn decode<S: Read + ?Sized>(stream: &mut S, _: &DecodingOptions) -> EncodingResult<Self> {
        Ok(DateTime::from_ticks(read_i64(stream)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let now = DateTime::now();
        let buf = now.encode_to_vec();
        let mut stream = std::io::Cursor::new(buf);
        let decoded = DateTime::decode(&mut stream, &DecodingOptions::default()).unwrap();
        // Tick resolution is 100ns so the round trip loses sub-tick precision only.
        assert_eq!(decoded.ticks(), now.ticks());
    }

    #[test]
    fn null() {
        assert!(DateTime::null().is_null());
        assert!(!DateTime::now().is_null());
        assert_eq!(DateTime::from_ticks(0).ticks(), 0);
    }

    #[test]
    fn arithmetic() {
        let a = DateTime::now();
        let b = a + Duration::milliseconds(1500);
        assert_eq!((b - a).num_milliseconds(), 1500);
    }
}
