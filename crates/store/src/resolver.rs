//! Key to content-id index with expiry.

use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use conflux_core::Clock;
use metrics::counter;
use rustc_hash::FxHashMap;
use tracing::debug;

/// Freshness classification of a resolver lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved {
    /// No expiry, or expiry in the future.
    Fresh(String),
    /// Expiry in the past. The stale content id is still returned.
    Expired(String),
    NotFound,
}

impl Resolved {
    pub fn cid(&self) -> Option<&str> {
        match self {
            Self::Fresh(c) | Self::Expired(c) => Some(c),
            Self::NotFound => None,
        }
    }

    pub fn state(&self) -> &'static str {
        match self {
            Self::Fresh(_) => "fresh",
            Self::Expired(_) => "expired",
            Self::NotFound => "not_found",
        }
    }

    pub fn is_fresh(&self) -> bool { matches!(self, Self::Fresh(_)) }
}

/// Stored entry. `expires_at = None` never expires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverEntry {
    pub value: String,
    pub expires_at: Option<DateTime<Utc>>,
}

impl ResolverEntry {
    pub fn classify(&self, now: DateTime<Utc>) -> Resolved {
        match self.expires_at {
            Some(at) if at <= now => Resolved::Expired(self.value.clone()),
            _ => Resolved::Fresh(self.value.clone()),
        }
    }
}

/// Expiry for a ttl in minutes measured from `now`; 0 means never.
/// A ttl past the representable date range also never expires.
pub fn expiry_after(now: DateTime<Utc>, ttl_minutes: u64) -> Option<DateTime<Utc>> {
    if ttl_minutes == 0 {
        return None;
    }
    let ttl = ttl_minutes.checked_mul(60).map(std::time::Duration::from_secs)?;
    let ttl = Duration::from_std(ttl).ok()?;
    let at = now.checked_add_signed(ttl);
    if at.is_none() {
        debug!(ttl_minutes, "resolver: ttl beyond date range, entry never expires");
    }
    at
}

/// Resolver contract. `set` is last-write-wins; there is no compare-and-swap.
pub trait Resolver: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Resolved>;
    fn set(&self, key: &str, cid: &str, ttl_minutes: u64) -> anyhow::Result<()>;
    fn delete(&self, key: &str) -> anyhow::Result<()>;
}

pub(crate) fn record_lookup(r: &Resolved) {
    counter!("resolver_get_total", 1u64, "state" => r.state());
}

/// In-process resolver for tests and single-node use.
pub struct MemoryResolver {
    entries: RwLock<FxHashMap<String, ResolverEntry>>,
    clock: Arc<dyn Clock>,
}

impl MemoryResolver {
    pub fn new(clock: Arc<dyn Clock>) -> Self { Self { entries: RwLock::new(FxHashMap::default()), clock } }

    pub fn len(&self) -> usize { self.entries.read().map(|m| m.len()).unwrap_or(0) }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Raw entry, without classification.
    pub fn entry(&self, key: &str) -> Option<ResolverEntry> {
        self.entries.read().ok().and_then(|m| m.get(key).cloned())
    }
}

impl Default for MemoryResolver {
    fn default() -> Self { Self::new(conflux_core::clock::system_clock()) }
}

impl Resolver for MemoryResolver {
    fn get(&self, key: &str) -> anyhow::Result<Resolved> {
        let map = self.entries.read().map_err(|_| anyhow::anyhow!("resolver lock poisoned"))?;
        let out = map.get(key).map(|e| e.classify(self.clock.now())).unwrap_or(Resolved::NotFound);
        record_lookup(&out);
        Ok(out)
    }

    fn set(&self, key: &str, cid: &str, ttl_minutes: u64) -> anyhow::Result<()> {
        let expires_at = expiry_after(self.clock.now(), ttl_minutes);
        let mut map = self.entries.write().map_err(|_| anyhow::anyhow!("resolver lock poisoned"))?;
        map.insert(key.to_string(), ResolverEntry { value: cid.to_string(), expires_at });
        debug!(key, cid, ttl_minutes, "resolver: set");
        Ok(())
    }

    fn delete(&self, key: &str) -> anyhow::Result<()> {
        let mut map = self.entries.write().map_err(|_| anyhow::anyhow!("resolver lock poisoned"))?;
        map.remove(key);
        debug!(key, "resolver: delete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use conflux_core::ManualClock;

    #[test]
    fn classify_boundary_is_expired() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let e = ResolverEntry { value: "c".into(), expires_at: Some(now) };
        assert_eq!(e.classify(now), Resolved::Expired("c".into()));
        assert_eq!(e.classify(now - Duration::seconds(1)), Resolved::Fresh("c".into()));
    }

    #[test]
    fn zero_ttl_never_expires() {
        let clock = Arc::new(ManualClock::default());
        let r = MemoryResolver::new(clock.clone());
        r.set("k", "cid1", 0).unwrap();
        clock.advance_minutes(60 * 24 * 365);
        assert_eq!(r.get("k").unwrap(), Resolved::Fresh("cid1".into()));
        assert!(r.entry("k").unwrap().expires_at.is_none());
    }

    #[test]
    fn huge_ttl_never_expires_instead_of_panicking() {
        let now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(expiry_after(now, u64::MAX), None);
        assert_eq!(expiry_after(now, i64::MAX as u64), None);
        assert_eq!(expiry_after(now, 10), Some(now + Duration::minutes(10)));

        let ttl: conflux_core::HumanDuration = serde_json::from_str("\"3000000000h\"").unwrap();
        let clock = Arc::new(ManualClock::default());
        let r = MemoryResolver::new(clock.clone());
        r.set("k", "cid", ttl.to_minutes()).unwrap();
        clock.advance_minutes(60 * 24 * 365 * 100);
        assert_eq!(r.get("k").unwrap(), Resolved::Fresh("cid".into()));
    }

    #[test]
    fn delete_then_not_found() {
        let r = MemoryResolver::default();
        r.set("k", "cid1", 5).unwrap();
        r.delete("k").unwrap();
        r.delete("k").unwrap();
        assert_eq!(r.get("k").unwrap(), Resolved::NotFound);
        assert!(r.is_empty());
    }
}
