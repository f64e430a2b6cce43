use std::fmt::{Debug, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Size of a [Timestamp] on the wire
pub const TIMESTAMP_SIZE: usize = 15;

const WIRE_FORMAT_VERSION: u8 = 1;
/// zone offset marker for UTC
const UTC_OFFSET_MINUTES: i16 = -1;

/// seconds between 0001-01-01T00:00:00Z (the wire format's epoch) and the UNIX epoch
const SECONDS_UNIX_TO_WIRE: i64 = 62_135_596_800;
const NANOS_PER_SECOND: u32 = 1_000_000_000;

#[derive(Debug, Error, Eq, PartialEq)]
pub enum TimestampError {
    #[error("invalid timestamp length: expected {TIMESTAMP_SIZE} bytes, got {0}")]
    Length(usize),
    #[error("unsupported timestamp format version {0}")]
    UnsupportedVersion(u8),
    #[error("nanoseconds out of range: {0}")]
    NanosOutOfRange(i32),
    #[error("seconds out of range: {0}")]
    SecondsOutOfRange(i64),
}

/// A wall clock instant with nanosecond precision.
///
/// On the wire, a timestamp takes exactly [TIMESTAMP_SIZE] bytes: a version byte (always 1), the
///  seconds since 0001-01-01T00:00:00Z as big-endian i64, the nanoseconds within that second as
///  big-endian i32, and a big-endian i16 zone offset in minutes where -1 stands for UTC. Every node
///  of a deployment must agree on this layout.
///
/// The zero value (see [Timestamp::ZERO]) is the wire format's epoch, and it marks a timestamp
///  that was not set yet.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Timestamp {
    unix_secs: i64,
    nanos: u32,
}

impl Default for Timestamp {
    fn default() -> Self {
        Timestamp::ZERO
    }
}

impl Debug for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_zero() {
            write!(f, "Timestamp(zero)")
        }
        else {
            write!(f, "Timestamp({}.{:09})", self.unix_secs, self.nanos)
        }
    }
}

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp {
        unix_secs: -SECONDS_UNIX_TO_WIRE,
        nanos: 0,
    };

    pub fn now() -> Timestamp {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(t: SystemTime) -> Timestamp {
        match t.duration_since(UNIX_EPOCH) {
            Ok(d) => Timestamp {
                unix_secs: d.as_secs() as i64,
                nanos: d.subsec_nanos(),
            },
            Err(e) => {
                // before the UNIX epoch: borrow a second if there is a fractional part
                let d = e.duration();
                let mut unix_secs = -(d.as_secs() as i64);
                let mut nanos = d.subsec_nanos();
                if nanos > 0 {
                    unix_secs -= 1;
                    nanos = NANOS_PER_SECOND - nanos;
                }
                Timestamp { unix_secs, nanos }
            }
        }
    }

    /// Returns `None` if `nanos` is not below one second
    pub fn from_unix(unix_secs: i64, nanos: u32) -> Option<Timestamp> {
        if nanos >= NANOS_PER_SECOND {
            return None;
        }
        Some(Timestamp { unix_secs, nanos })
    }

    pub fn is_zero(&self) -> bool {
        *self == Timestamp::ZERO
    }

    /// The signed difference `self - earlier` in whole microseconds, truncated toward zero and
    ///  saturated at the bounds of i64.
    pub fn micros_since(&self, earlier: &Timestamp) -> i64 {
        let nanos = (self.unix_secs as i128 - earlier.unix_secs as i128) * NANOS_PER_SECOND as i128
            + (self.nanos as i128 - earlier.nanos as i128);
        let micros = nanos / 1000;
        micros.clamp(i64::MIN as i128, i64::MAX as i128) as i64
    }

    pub fn ser(&self, buf: &mut impl BufMut) -> Result<(), TimestampError> {
        let wire_secs = self.unix_secs.checked_add(SECONDS_UNIX_TO_WIRE)
            .ok_or(TimestampError::SecondsOutOfRange(self.unix_secs))?;

        buf.put_u8(WIRE_FORMAT_VERSION);
        buf.put_i64(wire_secs);
        buf.put_i32(self.nanos as i32);
        buf.put_i16(UTC_OFFSET_MINUTES);
        Ok(())
    }

    pub fn deser(mut buf: &[u8]) -> Result<Timestamp, TimestampError> {
        if buf.len() != TIMESTAMP_SIZE {
            return Err(TimestampError::Length(buf.len()));
        }

        let version = buf.get_u8();
        if version != WIRE_FORMAT_VERSION {
            return Err(TimestampError::UnsupportedVersion(version));
        }

        let wire_secs = buf.get_i64();
        let nanos = buf.get_i32();
        // the zone offset only affects presentation, the encoded instant is absolute
        let _offset_minutes = buf.get_i16();

        if nanos < 0 || nanos as u32 >= NANOS_PER_SECOND {
            return Err(TimestampError::NanosOutOfRange(nanos));
        }
        let unix_secs = wire_secs.checked_sub(SECONDS_UNIX_TO_WIRE)
            .ok_or(TimestampError::SecondsOutOfRange(wire_secs))?;

        Ok(Timestamp {
            unix_secs,
            nanos: nanos as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use bytes::BytesMut;
    use rstest::rstest;
    use super::*;

    fn ser_to_vec(ts: Timestamp) -> Vec<u8> {
        let mut buf = BytesMut::new();
        ts.ser(&mut buf).unwrap();
        buf.to_vec()
    }

    #[test]
    fn test_zero_wire_format() {
        assert_eq!(ser_to_vec(Timestamp::ZERO), vec![1, 0,0,0,0,0,0,0,0, 0,0,0,0, 0xff,0xff]);
        assert!(Timestamp::default().is_zero());
    }

    #[test]
    fn test_unix_epoch_wire_format() {
        let ts = Timestamp::from_unix(0, 5).unwrap();
        assert_eq!(ser_to_vec(ts), vec![1, 0,0,0,0x0e,0x77,0x91,0xf7,0x00, 0,0,0,5, 0xff,0xff]);
    }

    #[rstest]
    #[case::zero(Timestamp::ZERO)]
    #[case::epoch(Timestamp::from_unix(0, 0).unwrap())]
    #[case::recent(Timestamp::from_unix(1_735_689_600, 123_456_789).unwrap())]
    #[case::before_epoch(Timestamp::from_unix(-1, 999_999_999).unwrap())]
    fn test_ser_deser(#[case] ts: Timestamp) {
        let buf = ser_to_vec(ts);
        assert_eq!(buf.len(), TIMESTAMP_SIZE);
        assert_eq!(Timestamp::deser(&buf).unwrap(), ts);
    }

    #[test]
    fn test_deser_ignores_zone_offset() {
        let mut buf = ser_to_vec(Timestamp::from_unix(1000, 1).unwrap());
        buf[13] = 0;
        buf[14] = 120;
        assert_eq!(Timestamp::deser(&buf).unwrap(), Timestamp::from_unix(1000, 1).unwrap());
    }

    #[rstest]
    #[case::too_short(vec![1; 14], TimestampError::Length(14))]
    #[case::too_long(vec![1; 16], TimestampError::Length(16))]
    #[case::version(vec![2, 0,0,0,0,0,0,0,0, 0,0,0,0, 0xff,0xff], TimestampError::UnsupportedVersion(2))]
    #[case::nanos_too_big(vec![1, 0,0,0,0,0,0,0,0, 0x3b,0x9a,0xca,0x00, 0xff,0xff], TimestampError::NanosOutOfRange(1_000_000_000))]
    #[case::nanos_negative(vec![1, 0,0,0,0,0,0,0,0, 0xff,0xff,0xff,0xff, 0xff,0xff], TimestampError::NanosOutOfRange(-1))]
    #[case::seconds(vec![1, 0x80,0,0,0,0,0,0,0, 0,0,0,0, 0xff,0xff], TimestampError::SecondsOutOfRange(i64::MIN))]
    fn test_deser_invalid(#[case] buf: Vec<u8>, #[case] expected: TimestampError) {
        assert_eq!(Timestamp::deser(&buf), Err(expected));
    }

    #[test]
    fn test_ser_seconds_overflow() {
        let ts = Timestamp::from_unix(i64::MAX, 0).unwrap();
        let mut buf = BytesMut::new();
        assert_eq!(ts.ser(&mut buf), Err(TimestampError::SecondsOutOfRange(i64::MAX)));
    }

    #[test]
    fn test_from_unix_rejects_nanos() {
        assert!(Timestamp::from_unix(1, 1_000_000_000).is_none());
    }

    #[test]
    fn test_from_system_time_before_epoch() {
        let t = UNIX_EPOCH - Duration::from_millis(1500);
        assert_eq!(Timestamp::from_system_time(t), Timestamp::from_unix(-2, 500_000_000).unwrap());
    }

    #[rstest]
    #[case::same(0, 0, 0, 0, 0)]
    #[case::micros(10, 1_500, 10, 0, 1)]
    #[case::across_seconds(11, 200_000_000, 10, 900_000_000, 300_000)]
    #[case::across_seconds_sub_milli(11, 200_000, 10, 900_000, 999_300)]
    #[case::negative(10, 0, 10, 2_500, -2)]
    #[case::seconds(20, 0, 10, 0, 10_000_000)]
    fn test_micros_since(#[case] secs: i64, #[case] nanos: u32, #[case] earlier_secs: i64, #[case] earlier_nanos: u32, #[case] expected: i64) {
        let later = Timestamp::from_unix(secs, nanos).unwrap();
        let earlier = Timestamp::from_unix(earlier_secs, earlier_nanos).unwrap();
        assert_eq!(later.micros_since(&earlier), expected);
    }
}
