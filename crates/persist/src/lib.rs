//! Drover persistence: the release history document store.
//! The document is opaque here; callers own its format.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Ledger scope: one release name within one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    pub namespace: String,
    pub release_name: String,
}

impl ScopeKey {
    pub fn new(namespace: impl Into<String>, release_name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), release_name: release_name.into() }
    }
}

impl std::fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.release_name)
    }
}

/// A fetched document plus the token identifying the stored version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredDocument {
    pub document: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveMode {
    /// Last writer wins.
    Overwrite,
    /// Only write if the stored version still matches; `None` means the document must not exist yet.
    IfVersion(Option<String>),
}

/// Raised (inside `anyhow::Error`) when a conditional save finds a different version.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("release history for {scope} changed since it was read (expected {expected:?}, found {found:?})")]
pub struct VersionConflict {
    pub scope: String,
    pub expected: Option<String>,
    pub found: Option<String>,
}

#[async_trait::async_trait]
pub trait HistoryStore: Send + Sync {
    /// `Ok(None)` when no document exists; `Err` only when the store itself fails.
    async fn fetch(&self, key: &ScopeKey) -> Result<Option<StoredDocument>>;

    /// Replace the whole document. Returns the new version token.
    async fn save(&self, key: &ScopeKey, document: &str, mode: SaveMode) -> Result<String>;
}

fn check_version(key: &ScopeKey, mode: &SaveMode, current: Option<&str>) -> Result<()> {
    if let SaveMode::IfVersion(expected) = mode {
        if expected.as_deref() != current {
            counter!("persist_conflict_total", 1u64);
            return Err(VersionConflict {
                scope: key.to_string(),
                expected: expected.clone(),
                found: current.map(|s| s.to_string()),
            }
            .into());
        }
    }
    Ok(())
}

/// SQLite-backed store. Simple, synchronous; one row per scope.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("DROVER_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", &"WAL").ok();
        db.pragma_update(None, "synchronous", &"NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS release_history (
                namespace TEXT NOT NULL,
                release   TEXT NOT NULL,
                version   INTEGER NOT NULL,
                ts        INTEGER NOT NULL,
                document  BLOB NOT NULL,
                PRIMARY KEY (namespace, release)
            )",
            [],
        )
        .context("creating release_history table")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Self { db: Mutex::new(db) })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }
}

#[async_trait::async_trait]
impl HistoryStore for SqliteStore {
    async fn fetch(&self, key: &ScopeKey) -> Result<Option<StoredDocument>> {
        let started = std::time::Instant::now();
        let db = self.lock()?;
        let mut stmt = db.prepare("SELECT version, document FROM release_history WHERE namespace = ?1 AND release = ?2")?;
        let mut rows = stmt.query((&key.namespace, &key.release_name))?;
        let out = match rows.next()? {
            Some(row) => {
                let version: i64 = row.get(0)?;
                let blob: Vec<u8> = row.get(1)?;
                Some(StoredDocument { document: maybe_decompress(&blob), version: version.to_string() })
            }
            None => None,
        };
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    async fn save(&self, key: &ScopeKey, document: &str, mode: SaveMode) -> Result<String> {
        let started = std::time::Instant::now();
        let mut db = self.lock()?;
        let tx = db.transaction()?;
        let current: Option<i64> = {
            let mut stmt = tx.prepare("SELECT version FROM release_history WHERE namespace = ?1 AND release = ?2")?;
            let mut rows = stmt.query((&key.namespace, &key.release_name))?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };
        check_version(key, &mode, current.map(|v| v.to_string()).as_deref())?;
        let next = current.unwrap_or(0) + 1;
        tx.execute(
            "INSERT INTO release_history(namespace, release, version, ts, document) VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(namespace, release) DO UPDATE SET version = excluded.version, ts = excluded.ts, document = excluded.document",
            (&key.namespace, &key.release_name, next, now_ts(), maybe_compress(document)),
        )?;
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        debug!(scope = %key, version = next, "release history saved");
        Ok(next.to_string())
    }
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<ScopeKey, (String, u64)>>,
    saves: AtomicUsize,
    fail: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every call fails, as if the backend were unreachable.
    pub fn unreachable() -> Self {
        Self { fail: true, ..Self::default() }
    }

    /// Seed a document without counting it as a save.
    pub fn insert(&self, key: ScopeKey, document: impl Into<String>) {
        if let Ok(mut docs) = self.docs.lock() {
            let version = docs.get(&key).map(|(_, v)| v + 1).unwrap_or(1);
            docs.insert(key, (document.into(), version));
        }
    }

    pub fn document(&self, key: &ScopeKey) -> Option<String> {
        self.docs.lock().ok().and_then(|d| d.get(key).map(|(doc, _)| doc.clone()))
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl HistoryStore for MemoryStore {
    async fn fetch(&self, key: &ScopeKey) -> Result<Option<StoredDocument>> {
        if self.fail {
            return Err(anyhow!("history store unreachable"));
        }
        let docs = self.docs.lock().map_err(|_| anyhow!("memory store poisoned"))?;
        Ok(docs.get(key).map(|(doc, v)| StoredDocument { document: doc.clone(), version: v.to_string() }))
    }

    async fn save(&self, key: &ScopeKey, document: &str, mode: SaveMode) -> Result<String> {
        if self.fail {
            return Err(anyhow!("history store unreachable"));
        }
        let mut docs = self.docs.lock().map_err(|_| anyhow!("memory store poisoned"))?;
        let current = docs.get(key).map(|(_, v)| v.to_string());
        check_version(key, &mode, current.as_deref())?;
        let next = docs.get(key).map(|(_, v)| v + 1).unwrap_or(1);
        docs.insert(key.clone(), (document.to_string(), next));
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(next.to_string())
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".drover");
        let _ = std::fs::create_dir_all(&p);
        p.push("drover.db");
        return p.to_string_lossy().to_string();
    }
    // Fallback to current directory
    "drover.db".to_string()
}

pub fn now_ts() -> i64 {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_secs() as i64
}

pub fn maybe_compress(doc: &str) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("DROVER_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(doc.as_bytes(), lvl).unwrap_or_else(|_| doc.as_bytes().to_vec());
    }
    #[allow(unreachable_code)]
    doc.as_bytes().to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> String {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return String::from_utf8_lossy(&de).to_string();
        }
    }
    String::from_utf8_lossy(blob).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!(
            "drover-test-{}.db",
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
        );
        dir.join(f).to_string_lossy().to_string()
    }

    #[tokio::test]
    async fn sqlite_missing_document_is_none() {
        let s = SqliteStore::open(&temp_db()).unwrap();
        assert!(s.fetch(&ScopeKey::new("ns", "web")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sqlite_overwrites_and_bumps_version() {
        let s = SqliteStore::open(&temp_db()).unwrap();
        let key = ScopeKey::new("ns", "web");
        assert_eq!(s.save(&key, "a: 1\n", SaveMode::Overwrite).await.unwrap(), "1");
        assert_eq!(s.save(&key, "a: 2\n", SaveMode::Overwrite).await.unwrap(), "2");
        let doc = s.fetch(&key).await.unwrap().unwrap();
        assert_eq!(doc.document, "a: 2\n");
        assert_eq!(doc.version, "2");
        // other scopes are independent
        assert!(s.fetch(&ScopeKey::new("ns", "api")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sqlite_conditional_save_detects_conflict() {
        let s = SqliteStore::open(&temp_db()).unwrap();
        let key = ScopeKey::new("ns", "web");
        s.save(&key, "first", SaveMode::IfVersion(None)).await.unwrap();
        let err = s.save(&key, "second", SaveMode::IfVersion(None)).await.unwrap_err();
        let conflict = err.downcast_ref::<VersionConflict>().expect("conflict error");
        assert_eq!(conflict.found.as_deref(), Some("1"));
        s.save(&key, "second", SaveMode::IfVersion(Some("1".into()))).await.unwrap();
        assert_eq!(s.fetch(&key).await.unwrap().unwrap().document, "second");
    }

    #[tokio::test]
    async fn memory_store_counts_saves_and_fails_when_unreachable() {
        let s = MemoryStore::new();
        let key = ScopeKey::new("ns", "web");
        s.insert(key.clone(), "seed");
        assert_eq!(s.save_count(), 0);
        s.save(&key, "next", SaveMode::IfVersion(Some("1".into()))).await.unwrap();
        assert_eq!(s.save_count(), 1);
        assert_eq!(s.document(&key).as_deref(), Some("next"));

        let down = MemoryStore::unreachable();
        assert!(down.fetch(&key).await.is_err());
    }
}
