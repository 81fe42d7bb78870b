//! Group/Version/Kind identifiers for transformer and hook implementations.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

static GVK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([^/]+)/([^:]+):(.+)$").expect("static gvk regex"));

/// Identifies one registered implementation. Renders as `group/version:kind`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gvk {
    pub group: String,
    pub version: String,
    pub kind: String,
}

impl Gvk {
    pub fn new(group: impl Into<String>, version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { group: group.into(), version: version.into(), kind: kind.into() }
    }

    /// Shorthand for the built-in `core/v1alpha` group.
    pub fn core(kind: &str) -> Self { Self::new("core", "v1alpha", kind) }
}

impl fmt::Display for Gvk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.group, self.version, self.kind)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid gvk: {0} (expect group/version:kind)")]
pub struct GvkParseError(pub String);

impl FromStr for Gvk {
    type Err = GvkParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = GVK_RE.captures(s).ok_or_else(|| GvkParseError(s.to_string()))?;
        Ok(Self::new(&caps[1], &caps[2], &caps[3]))
    }
}

impl Serialize for Gvk {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Gvk {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
