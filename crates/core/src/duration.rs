//! Human duration strings (`"10m"`, `"1h30m"`, `"500ms"`) used in manifests.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    /// Whole minutes, truncated. This is the resolver TTL unit.
    pub fn to_minutes(&self) -> u64 { self.0.as_secs() / 60 }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid duration {0:?}")]
pub struct DurationParseError(pub String);

impl FromStr for HumanDuration {
    type Err = DurationParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || DurationParseError(s.to_string());
        let s = s.trim();
        if s == "0" { return Ok(Self::default()); }
        if s.is_empty() { return Err(err()); }
        let mut total = Duration::ZERO;
        let mut rest = s;
        while !rest.is_empty() {
            let digits = rest.find(|c: char| !c.is_ascii_digit()).ok_or_else(err)?;
            if digits == 0 { return Err(err()); }
            let n: u64 = rest[..digits].parse().map_err(|_| err())?;
            rest = &rest[digits..];
            let unit_len = rest.find(|c: char| c.is_ascii_digit()).unwrap_or(rest.len());
            let part = match &rest[..unit_len] {
                "h" => Duration::from_secs(n.checked_mul(3600).ok_or_else(err)?),
                "m" => Duration::from_secs(n.checked_mul(60).ok_or_else(err)?),
                "s" => Duration::from_secs(n),
                "ms" => Duration::from_millis(n),
                _ => return Err(err()),
            };
            total = total.checked_add(part).ok_or_else(err)?;
            rest = &rest[unit_len..];
        }
        Ok(Self(total))
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.0.as_millis();
        if ms == 0 { return f.write_str("0s"); }
        let (h, m, s, rem) = (ms / 3_600_000, (ms / 60_000) % 60, (ms / 1000) % 60, ms % 1000);
        if h > 0 { write!(f, "{}h", h)?; }
        if m > 0 { write!(f, "{}m", m)?; }
        if s > 0 { write!(f, "{}s", s)?; }
        if rem > 0 { write!(f, "{}ms", rem)?; }
        Ok(())
    }
}

impl Serialize for HumanDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw { Nanos(u64), Text(String) }
        match Raw::deserialize(deserializer)? {
            Raw::Nanos(n) => Ok(Self(Duration::from_nanos(n))),
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}
