//! Two-tier read-through cache for paid extraction and judge calls.
//!
//! **L1** – [`DashMap`] in-memory map.
//! **L2** – Optional SQLite database on disk (persists across runs).
//!
//! Keys are `(document id, content hash, strategy id, stage)`. The document
//! id is the SHA-256 of the document bytes. Judge entries also carry the
//! SHA-256 of the page text and the stage names the page number, so
//! re-judging fallback output never hits a stale entry.
//!
//! Only successful results are cached. A cache failure is logged and treated
//! as a miss; the pipeline never depends on the cache for correctness.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::backend::{BoxFuture, ExtractionBackend, RemediationHint};
use crate::fallback::FallbackAction;
use crate::judge::{JudgeOracle, JudgeRequest, JudgeResponse};
use crate::llm::TokenUsage;
use crate::model::{Document, RawExtraction, RawPage, sha256_hex};
use crate::{BackendError, OracleError};

const STAGE_EXTRACT: &str = "extract";

#[derive(Hash, Eq, PartialEq, Clone, Debug)]
pub struct CacheKey {
    pub document_id: String,
    /// SHA-256 of the judged page text; empty for extraction entries.
    pub content_hash: String,
    pub strategy: String,
    pub stage: String,
}

impl CacheKey {
    pub fn extraction(document_id: &str, strategy: &str) -> Self {
        Self {
            document_id: document_id.to_string(),
            content_hash: String::new(),
            strategy: strategy.to_string(),
            stage: STAGE_EXTRACT.to_string(),
        }
    }

    pub fn judgement(judge: &str, request: &JudgeRequest<'_>) -> Self {
        Self {
            document_id: request.document_id.to_string(),
            content_hash: sha256_hex(request.text.as_bytes()),
            strategy: request.strategy.to_string(),
            stage: format!("judge:{judge}:p{}", request.page),
        }
    }
}

/// Open a SQLite connection with WAL mode and standard pragmas.
fn open_sqlite(path: &Path) -> Result<Connection, rusqlite::Error> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;
         CREATE TABLE IF NOT EXISTS artifact_entries (
             document_id  TEXT NOT NULL,
             content_hash TEXT NOT NULL,
             strategy     TEXT NOT NULL,
             stage        TEXT NOT NULL,
             payload      TEXT NOT NULL,
             inserted_at  INTEGER NOT NULL,
             PRIMARY KEY (document_id, content_hash, strategy, stage)
         );",
    )?;
    Ok(conn)
}

pub struct ArtifactCache {
    entries: DashMap<CacheKey, String>,
    sqlite: Option<Mutex<Connection>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Default for ArtifactCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl ArtifactCache {
    /// In-memory only; nothing survives the process.
    pub fn in_memory() -> Self {
        Self {
            entries: DashMap::new(),
            sqlite: None,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Open a persistent cache backed by a SQLite database at `path`.
    pub fn open(path: &Path) -> Result<Self, String> {
        let conn = open_sqlite(path)
            .map_err(|e| format!("Failed to open cache database at {}: {}", path.display(), e))?;
        Ok(Self {
            sqlite: Some(Mutex::new(conn)),
            ..Self::in_memory()
        })
    }

    pub fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<T> {
        let payload = match self.entries.get(key) {
            Some(p) => Some(p.value().clone()),
            None => self.get_disk(key).inspect(|p| {
                self.entries.insert(key.clone(), p.clone());
            }),
        };

        let value = payload.and_then(|p| match serde_json::from_str(&p) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(stage = %key.stage, error = %e, "discarding unreadable cache entry");
                None
            }
        });
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(strategy = %key.strategy, stage = %key.stage, "cache hit");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    fn get_disk(&self, key: &CacheKey) -> Option<String> {
        let conn = self.sqlite.as_ref()?.lock().ok()?;
        conn.query_row(
            "SELECT payload FROM artifact_entries
             WHERE document_id = ?1 AND content_hash = ?2 AND strategy = ?3 AND stage = ?4",
            params![key.document_id, key.content_hash, key.strategy, key.stage],
            |row| row.get(0),
        )
        .optional()
        .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "cache read failed");
            None
        })
    }

    /// Write-through insert into both tiers.
    pub fn insert<T: Serialize>(&self, key: CacheKey, value: &T) {
        let payload = match serde_json::to_string(value) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "cannot serialize cache entry");
                return;
            }
        };
        if let Some(conn) = self.sqlite.as_ref().and_then(|m| m.lock().ok()) {
            if let Err(e) = conn.execute(
                "INSERT OR REPLACE INTO artifact_entries
                 (document_id, content_hash, strategy, stage, payload, inserted_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![key.document_id, key.content_hash, key.strategy, key.stage, payload, now_epoch()],
            ) {
                tracing::warn!(error = %e, "cache write failed");
            }
        }
        self.entries.insert(key, payload);
    }

    /// Remove all entries from both tiers.
    pub fn clear(&self) {
        self.entries.clear();
        if let Some(conn) = self.sqlite.as_ref().and_then(|m| m.lock().ok()) {
            let _ = conn.execute("DELETE FROM artifact_entries", []);
            let _ = conn.execute_batch("VACUUM");
        }
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rows in the SQLite tier (0 without persistence).
    pub fn disk_len(&self) -> usize {
        self.sqlite
            .as_ref()
            .and_then(|m| m.lock().ok())
            .and_then(|conn| {
                conn.query_row("SELECT COUNT(*) FROM artifact_entries", [], |row| row.get::<_, i64>(0))
                    .ok()
            })
            .map_or(0, |n| n as usize)
    }

    pub fn has_persistence(&self) -> bool {
        self.sqlite.is_some()
    }
}

impl std::fmt::Debug for ArtifactCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArtifactCache")
            .field("l1_entries", &self.entries.len())
            .field("l2_entries", &self.disk_len())
            .field("hits", &self.hits())
            .field("misses", &self.misses())
            .field("persistent", &self.has_persistence())
            .finish()
    }
}

fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

/// Build an [`ArtifactCache`], persistent when `cache_path` is set and opens.
pub fn build_artifact_cache(cache_path: Option<&Path>) -> Arc<ArtifactCache> {
    if let Some(path) = cache_path {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match ArtifactCache::open(path) {
            Ok(cache) => {
                tracing::info!(path = %path.display(), "opened persistent cache");
                return Arc::new(cache);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to open cache, falling back to in-memory");
            }
        }
    }
    Arc::new(ArtifactCache::in_memory())
}

/// Read-through cache in front of an extraction backend. Fallback
/// reprocessing is never cached.
pub struct CachedBackend {
    inner: Arc<dyn ExtractionBackend>,
    cache: Arc<ArtifactCache>,
}

impl CachedBackend {
    pub fn new(inner: Arc<dyn ExtractionBackend>, cache: Arc<ArtifactCache>) -> Self {
        Self { inner, cache }
    }
}

impl ExtractionBackend for CachedBackend {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn extract<'a>(
        &'a self,
        document: &'a Document,
    ) -> BoxFuture<'a, Result<RawExtraction, BackendError>> {
        Box::pin(async move {
            if document.id.is_empty() {
                return self.inner.extract(document).await;
            }
            let key = CacheKey::extraction(&document.id, self.inner.name());
            if let Some(hit) = self.cache.get::<RawExtraction>(&key) {
                tracing::debug!(document = %document.name, strategy = self.inner.name(), "extraction served from cache");
                return Ok(hit);
            }
            let raw = self.inner.extract(document).await?;
            self.cache.insert(key, &raw);
            Ok(raw)
        })
    }

    fn supports(&self, action: FallbackAction) -> bool {
        self.inner.supports(action)
    }

    fn process<'a>(
        &'a self,
        pages: Vec<RawPage>,
        document: &'a Document,
        hint: RemediationHint,
    ) -> BoxFuture<'a, Result<Vec<RawPage>, BackendError>> {
        self.inner.process(pages, document, hint)
    }
}

/// Read-through cache in front of a judge. Hits cost nothing.
pub struct CachedJudge {
    inner: Arc<dyn JudgeOracle>,
    cache: Arc<ArtifactCache>,
}

impl CachedJudge {
    pub fn new(inner: Arc<dyn JudgeOracle>, cache: Arc<ArtifactCache>) -> Self {
        Self { inner, cache }
    }
}

impl JudgeOracle for CachedJudge {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn judge<'a>(
        &'a self,
        request: JudgeRequest<'a>,
    ) -> BoxFuture<'a, Result<JudgeResponse, OracleError>> {
        Box::pin(async move {
            let key = CacheKey::judgement(self.inner.name(), &request);
            if let Some(mut hit) = self.cache.get::<JudgeResponse>(&key) {
                hit.usage = TokenUsage::default();
                hit.cost_usd = 0.0;
                return Ok(hit);
            }
            let response = self.inner.judge(request).await?;
            self.cache.insert(key, &response);
            Ok(response)
        })
    }
}
