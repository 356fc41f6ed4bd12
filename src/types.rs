//! Object ids, transaction ids and the packed timestamp format.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Error};
use lazy_static::lazy_static;

/// 8-byte object identifier.
///
/// Ordered as a byte string; the big-endian integer value is used as
/// the node key in the reference graph. Object 0 is the database root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Oid(pub [u8; 8]);

impl Oid {
    pub const ZERO: Oid = Oid([0u8; 8]);

    pub fn from_int(ioid: u64) -> Self {
        Oid(ioid.to_be_bytes())
    }

    pub fn as_int(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// Lowercase hex without prefix, 16 characters.
    pub fn hex(&self) -> String {
        let mut out = String::with_capacity(16);
        for b in &self.0 {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:016x}", self.as_int())
    }
}

/// 8-byte transaction identifier.
///
/// Non-decreasing across the log. The byte-string order equals the
/// numeric order, and the value doubles as a timestamp (see
/// [`TimeStamp`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub [u8; 8]);

impl Tid {
    pub const ZERO: Tid = Tid([0u8; 8]);

    pub fn from_int(itid: u64) -> Self {
        Tid(itid.to_be_bytes())
    }

    pub fn as_int(&self) -> u64 {
        u64::from_be_bytes(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 8]
    }

    pub fn hex(&self) -> String {
        Oid(self.0).hex()
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:016x}", self.as_int())
    }
}

// Fraction-of-a-minute scale for the low 4 timestamp bytes.
const SCONV: f64 = 60.0 / 4294967296.0;

/// Packed 8-byte wall-clock timestamp.
///
/// The high 4 bytes count minutes since 1900-01-01 with months padded
/// to 31 days, the low 4 bytes hold the in-minute fraction. Comparisons
/// are raw byte compares; there is no time-zone handling, everything
/// is UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TimeStamp([u8; 8]);

impl TimeStamp {
    pub fn new(year: u32, month: u32, day: u32, hour: u32, minute: u32, second: f64) -> Self {
        let days = ((year - 1900) * 12 + (month - 1)) * 31 + (day - 1);
        let v = (days * 24 + hour) * 60 + minute;
        let frac = (second / SCONV) as u32;
        let mut raw = [0u8; 8];
        raw[..4].copy_from_slice(&v.to_be_bytes());
        raw[4..].copy_from_slice(&frac.to_be_bytes());
        TimeStamp(raw)
    }

    pub fn from_raw(raw: [u8; 8]) -> Self {
        TimeStamp(raw)
    }

    pub fn raw(&self) -> [u8; 8] {
        self.0
    }

    pub fn as_tid(&self) -> Tid {
        Tid(self.0)
    }

    /// The current UTC time.
    pub fn now() -> Self {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let secs = elapsed.as_secs() as i64;
        let (year, month, day) = civil_from_days(secs.div_euclid(86400));
        let rem = secs.rem_euclid(86400) as u32;
        let second = (rem % 60) as f64 + f64::from(elapsed.subsec_micros()) / 1e6;
        TimeStamp::new(year as u32, month, day, rem / 3600, (rem / 60) % 60, second)
    }

    /// Parse `YYYY-MM-DD`, optionally followed by `THH:MM` or
    /// `THH:MM:SS` (a space also works as the separator). Missing time
    /// components default to midnight.
    pub fn parse(text: &str) -> Result<Self, Error> {
        lazy_static! {
            static ref STAMP_RE: regex::Regex = regex::Regex::new(
                r"^(\d{4})-(\d{2})-(\d{2})(?:[T ](\d{2}):(\d{2})(?::(\d{2}))?)?$"
            )
            .unwrap();
        }
        let caps = match STAMP_RE.captures(text) {
            Some(caps) => caps,
            None => bail!("bad date-time '{}'", text),
        };
        let num = |i: usize| -> u32 {
            caps.get(i)
                .map(|m| m.as_str().parse().unwrap())
                .unwrap_or(0)
        };
        let (year, month, day) = (num(1), num(2), num(3));
        if year < 1900 || month < 1 || month > 12 || day < 1 || day > 31 {
            bail!("bad date-time '{}'", text);
        }
        let (hour, minute, second) = (num(4), num(5), num(6));
        if hour > 23 || minute > 59 || second > 59 {
            bail!("bad date-time '{}'", text);
        }
        Ok(TimeStamp::new(year, month, day, hour, minute, f64::from(second)))
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let v = u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]]);
        let frac = u32::from_be_bytes([self.0[4], self.0[5], self.0[6], self.0[7]]);
        let minute = v % 60;
        let hour = (v / 60) % 24;
        let days = v / (60 * 24);
        let second = f64::from(frac) * SCONV;
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:09.6}",
            days / (12 * 31) + 1900,
            (days / 31) % 12 + 1,
            days % 31 + 1,
            hour,
            minute,
            second
        )
    }
}

// Days since 1970-01-01 to (year, month, day), proleptic Gregorian.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719468;
    let era = z.div_euclid(146097);
    let doe = z.rem_euclid(146097);
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m as u32, d)
}
