use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::ops::Add;
use std::time::SystemTime;

/// Raw values at or above this are taken to be milliseconds rather than seconds.
///
/// `10^12` seconds is tens of thousands of years away, while `10^12` milliseconds
/// is September 2001, so the two ranges do not overlap for any realistic expiry.
pub const MILLIS_THRESHOLD: u64 = 1_000_000_000_000;

/// A Unix timestamp in whole seconds, used for credential expiry and proof `iat`.
///
/// Callers hand us expiries in either seconds or milliseconds. [`UnixTimestamp::normalized`]
/// folds both into seconds so comparisons are always made in one unit.
///
/// Serialized as a plain JSON integer.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq, Hash)]
pub struct UnixTimestamp(u64);

impl Serialize for UnixTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for UnixTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = u64::deserialize(deserializer)?;
        Ok(UnixTimestamp::normalized(raw))
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u64> for UnixTimestamp {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        UnixTimestamp(self.0.saturating_add(rhs))
    }
}

impl UnixTimestamp {
    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// Interprets `raw` as seconds or milliseconds depending on its magnitude.
    pub fn normalized(raw: u64) -> Self {
        if raw >= MILLIS_THRESHOLD {
            Self(raw / 1000)
        } else {
            Self(raw)
        }
    }

    pub fn now() -> Self {
        Self(now_millis() / 1000)
    }

    pub fn as_secs(&self) -> u64 {
        self.0
    }

    /// True once the current time has passed this timestamp.
    pub fn is_past(&self) -> bool {
        Self::now() > *self
    }
}

/// Milliseconds since the Unix epoch. A clock set before 1970 reads as zero.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
