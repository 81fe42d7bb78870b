//! Conflux store: resolver index and content cache.
//!
//! The resolver maps keys to content ids with an optional expiry; the cache
//! moves JSON objects in and out of a content-addressed blob store.

#![forbid(unsafe_code)]

pub mod content;
pub mod resolver;

pub use content::{content_id, Cache, ContentStore, MemoryContentStore};
pub use resolver::{expiry_after, MemoryResolver, Resolved, Resolver, ResolverEntry};

/// Canonical resolver key of a manifest.
pub fn manifest_key(chain_id: u64, contract: &str) -> String {
    format!("manifest#{}#{}", chain_id, contract.to_lowercase())
}

/// Resolver key of one token's generated content.
pub fn token_key(contract: &str, token_id: &str) -> String {
    format!("{}/{}", contract.to_lowercase(), token_id)
}

/// Resolver key of a manifest alias; points at the same content id as the canonical key.
pub fn alias_key(alias: &str) -> String { format!("alias#{alias}") }
