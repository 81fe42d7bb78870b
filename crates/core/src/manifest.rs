//! Manifest data model: the declarative contract binding pipeline, cache and hooks.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::duration::HumanDuration;
use crate::gvk::Gvk;

/// Resource version accepted by this release.
pub const MANIFEST_VERSION: &str = "v1alpha";

/// Step-reported status entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub name: String,
    pub value: Json,
}

/// One pipeline step: which implementation to run and its opaque spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseTransformer {
    pub gvk: Gvk,
    #[serde(default)]
    pub spec: Json,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub status: Vec<Status>,
}

impl BaseTransformer {
    pub fn new(gvk: Gvk, spec: Json) -> Self { Self { gvk, spec, status: Vec::new() } }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestConfig {
    #[serde(default)]
    pub freeze: bool,
    #[serde(default)]
    pub refresh_after: HumanDuration,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alias: String,
}

/// Post-generation side effect, resolved by type against the hook registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hook {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub spec: Json,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: String,
    #[serde(default)]
    pub owner: String,
    pub contract: String,
    pub chain_id: u64,
    #[serde(default)]
    pub transformers: Vec<BaseTransformer>,
    #[serde(default)]
    pub config: ManifestConfig,
    #[serde(default)]
    pub hooks: Vec<Hook>,
}

impl Manifest {
    pub fn valid_version(&self) -> bool { self.version == MANIFEST_VERSION }

    /// Contract addresses are compared and keyed case-insensitively.
    pub fn normalized_contract(&self) -> String { self.contract.to_lowercase() }

    pub fn has_alias(&self) -> bool { !self.config.alias.is_empty() }
}

/// Generation metadata stamped on every pipeline result under `manifestInfo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestInfo {
    pub generated_at: DateTime<Utc>,
    pub transformer_count: usize,
    /// Wall-clock runtime in milliseconds.
    pub runtime: u64,
    #[serde(rename = "manifestCID")]
    pub manifest_cid: String,
}
