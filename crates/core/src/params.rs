//! Run-time parameters threaded through a pipeline.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as Json};

/// Well-known parameter keys seeded by the generator.
pub const PARAM_ID: &str = "id";
pub const PARAM_CONTRACT: &str = "contract";
pub const PARAM_MANIFEST_CID: &str = "manifestCID";
pub const PARAM_RESULT: &str = "result";

/// Coarse JSON type used to guard parameter overwrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonKind { Null, Bool, Number, String, Array, Object }

impl JsonKind {
    pub fn of(v: &Json) -> Self {
        match v {
            Json::Null => Self::Null,
            Json::Bool(_) => Self::Bool,
            Json::Number(_) => Self::Number,
            Json::String(_) => Self::String,
            Json::Array(_) => Self::Array,
            Json::Object(_) => Self::Object,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool => "bool",
            Self::Number => "number",
            Self::String => "string",
            Self::Array => "array",
            Self::Object => "object",
        }
    }
}

impl std::fmt::Display for JsonKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

/// Rejected overwrite: the replacement has a different JSON type than the existing value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("param {key}: cannot replace {expected} with {found}")]
pub struct ParamConflict {
    pub key: String,
    pub expected: JsonKind,
    pub found: JsonKind,
}

/// String-keyed parameter map. Serves as templating context and as the
/// side-channel through which a step overwrites existing keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Params(Map<String, Json>);

impl Params {
    pub fn new() -> Self { Self(Map::new()) }

    pub fn get(&self, key: &str) -> Option<&Json> { self.0.get(key) }
    pub fn get_str(&self, key: &str) -> Option<&str> { self.0.get(key).and_then(Json::as_str) }
    pub fn contains(&self, key: &str) -> bool { self.0.contains_key(key) }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Json>) -> Option<Json> {
        self.0.insert(key.into(), value.into())
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Json>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn as_map(&self) -> &Map<String, Json> { &self.0 }

    /// Overwrite keys that already exist in `self` with values from `updates`.
    /// Keys absent from `self` are ignored. Fails without modifying anything
    /// if any replacement changes the JSON type of an existing value.
    pub fn apply_updates(&mut self, updates: &Params) -> Result<usize, ParamConflict> {
        let mut staged = Vec::new();
        for (key, current) in self.0.iter() {
            let Some(next) = updates.0.get(key) else { continue };
            let (expected, found) = (JsonKind::of(current), JsonKind::of(next));
            if expected != found {
                return Err(ParamConflict { key: key.clone(), expected, found });
            }
            staged.push((key.clone(), next.clone()));
        }
        let n = staged.len();
        for (k, v) in staged { self.0.insert(k, v); }
        Ok(n)
    }
}

impl From<Map<String, Json>> for Params {
    fn from(m: Map<String, Json>) -> Self { Self(m) }
}

impl FromIterator<(String, Json)> for Params {
    fn from_iter<I: IntoIterator<Item = (String, Json)>>(iter: I) -> Self { Self(iter.into_iter().collect()) }
}
