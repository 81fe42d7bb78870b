//! Conflux persistence: SQLite-backed resolver and content store.
//! Synchronous connections behind a mutex; callers are not latency sensitive.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use conflux_core::Clock;
use conflux_store::{content_id, expiry_after, ContentStore, Resolved, Resolver, ResolverEntry};
use metrics::{counter, histogram};
use rusqlite::OptionalExtension;
use tracing::debug;

fn open_conn(path: &str) -> Result<rusqlite::Connection> {
    let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
    db.pragma_update(None, "journal_mode", &"WAL").ok();
    db.pragma_update(None, "synchronous", &"NORMAL").ok();
    Ok(db)
}

fn lock(db: &Mutex<rusqlite::Connection>) -> Result<MutexGuard<'_, rusqlite::Connection>> {
    db.lock().map_err(|_| anyhow!("sqlite connection lock poisoned"))
}

/// Path from `CONFLUX_DB_PATH`, else `~/.conflux/conflux.db`.
pub fn db_path() -> String {
    std::env::var("CONFLUX_DB_PATH").unwrap_or_else(|_| default_db_path())
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".conflux");
        let _ = std::fs::create_dir_all(&p);
        p.push("conflux.db");
        return p.to_string_lossy().to_string();
    }
    "conflux.db".to_string()
}

/// Resolver table `resolver(key, value, expires_at)`; `expires_at` is unix
/// millis or NULL for never.
pub struct SqliteResolver {
    db: Mutex<rusqlite::Connection>,
    clock: Arc<dyn Clock>,
}

impl SqliteResolver {
    pub fn open_default(clock: Arc<dyn Clock>) -> Result<Self> { Self::open(&db_path(), clock) }

    pub fn open(path: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = open_conn(path)?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS resolver (
                key        TEXT PRIMARY KEY,
                value      TEXT NOT NULL,
                expires_at INTEGER NULL
            )",
            [],
        )
        .context("creating resolver table")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db), clock })
    }

    pub fn entry(&self, key: &str) -> Result<Option<ResolverEntry>> {
        let db = lock(&self.db)?;
        let row: Option<(String, Option<i64>)> = db
            .query_row("SELECT value, expires_at FROM resolver WHERE key = ?1", [key], |r| Ok((r.get(0)?, r.get(1)?)))
            .optional()?;
        row.map(|(value, at)| {
            let expires_at = match at {
                Some(ms) => Some(DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| anyhow!("bad expiry {ms} for {key}"))?),
                None => None,
            };
            Ok::<_, anyhow::Error>(ResolverEntry { value, expires_at })
        })
        .transpose()
    }
}

impl Resolver for SqliteResolver {
    fn get(&self, key: &str) -> Result<Resolved> {
        let started = std::time::Instant::now();
        let out = self.entry(key)?.map(|e| e.classify(self.clock.now())).unwrap_or(Resolved::NotFound);
        histogram!("persist_resolver_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("resolver_get_total", 1u64, "state" => out.state());
        Ok(out)
    }

    fn set(&self, key: &str, cid: &str, ttl_minutes: u64) -> Result<()> {
        let expires_at = expiry_after(self.clock.now(), ttl_minutes).map(|t| t.timestamp_millis());
        let db = lock(&self.db)?;
        db.execute(
            "INSERT INTO resolver(key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            (key, cid, expires_at),
        )
        .with_context(|| format!("setting resolver key {key}"))?;
        counter!("persist_resolver_set_total", 1u64);
        debug!(key, cid, ttl_minutes, "persist: resolver set");
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let db = lock(&self.db)?;
        db.execute("DELETE FROM resolver WHERE key = ?1", [key])?;
        Ok(())
    }
}

/// Content table `content(cid, data)` keyed by blake3 digest of the
/// uncompressed bytes. Blobs are zstd-compressed with the `zstd` feature.
pub struct SqliteContentStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteContentStore {
    pub fn open_default() -> Result<Self> { Self::open(&db_path()) }

    pub fn open(path: &str) -> Result<Self> {
        let db = open_conn(path)?;
        db.execute(
            "CREATE TABLE IF NOT EXISTS content (
                cid  TEXT PRIMARY KEY,
                data BLOB NOT NULL
            )",
            [],
        )
        .context("creating content table")?;
        Ok(Self { db: Mutex::new(db) })
    }
}

#[async_trait::async_trait]
impl ContentStore for SqliteContentStore {
    async fn push(&self, data: Bytes) -> Result<String> {
        let started = std::time::Instant::now();
        let cid = content_id(&data);
        let blob = maybe_compress(&data);
        let db = lock(&self.db)?;
        db.execute("INSERT OR IGNORE INTO content(cid, data) VALUES (?1, ?2)", (&cid, &blob))
            .context("inserting content")?;
        histogram!("persist_content_push_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_content_push_total", 1u64);
        Ok(cid)
    }

    async fn get(&self, cid: &str) -> Result<Bytes> {
        let started = std::time::Instant::now();
        let db = lock(&self.db)?;
        let blob: Option<Vec<u8>> = db
            .query_row("SELECT data FROM content WHERE cid = ?1", [cid], |r| r.get(0))
            .optional()?;
        let blob = blob.ok_or_else(|| anyhow!("content {cid} not found"))?;
        histogram!("persist_content_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Bytes::from(maybe_decompress(blob)))
    }
}

pub fn maybe_compress(data: &[u8]) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = conflux_core::env_or("CONFLUX_ZSTD_LEVEL", 3);
        return zstd::encode_all(data, lvl).unwrap_or_else(|_| data.to_vec());
    }
    data.to_vec()
}

pub fn maybe_decompress(blob: Vec<u8>) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(&blob)) {
            return de;
        }
    }
    blob
}
