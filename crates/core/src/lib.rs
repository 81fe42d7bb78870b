//! Conflux core types: GVK identifiers, params, the templater and the manifest model.

#![forbid(unsafe_code)]

pub mod clock;
pub mod duration;
pub mod gvk;
pub mod manifest;
pub mod params;
pub mod template;

pub use clock::{Clock, ManualClock, SystemClock};
pub use duration::HumanDuration;
pub use gvk::Gvk;
pub use manifest::{BaseTransformer, Hook, Manifest, ManifestConfig, ManifestInfo, Status, MANIFEST_VERSION};
pub use params::{JsonKind, ParamConflict, Params};
pub use template::{interpolate, Template, TemplateError, Templated};

/// JSON object used as the accumulated pipeline result.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Read a tunable from the environment, falling back to `default` when unset or unparsable.
pub fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse().ok()).unwrap_or(default)
}

pub mod prelude {
    pub use super::{BaseTransformer, Gvk, JsonMap, Manifest, Params, Template, Templated};
}
