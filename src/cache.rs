//! Working-memory cache layer.
//!
//! Two pieces:
//!
//! - [`CacheBackend`] — the fixed key-value contract (set-with-TTL, get,
//!   del, prefix listing, clear, stats), matching what a remote cache
//!   service exposes. Values are JSON strings written as single
//!   whole-value `set`s, so writes are atomic at the key level.
//! - [`WorkingMemory`] — the typed wrapper the orchestrator talks to:
//!   syntax-tree snapshots, file contexts, conversation histories,
//!   session blobs, and cached query results, each under its own key
//!   namespace.
//!
//! [`InMemoryCache`] is the reference backend: per-entry TTL, a memory
//! budget with least-recently-used eviction, and best-effort hit/miss
//! counters. Time is read through the [`Clock`] trait so tests can drive
//! expiry with a simulated clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{MeshError, Result};
use crate::models::{CacheStats, ContextChunk, ConversationHistory, FileContext, Message, SyntaxTree};

// ============ Clock ============

/// Time source for TTL checks.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests.
pub struct ManualClock {
    now: RwLock<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.write().unwrap();
        *now += chrono::Duration::from_std(delta).expect("duration out of range");
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.read().unwrap()
    }
}

// ============ Backend trait ============

/// Abstract key-value cache backend.
///
/// Keys are namespaced strings; values are opaque JSON strings. Each
/// entry carries its own TTL. Backends enforce a memory budget by
/// evicting least-recently-used entries first, regardless of remaining
/// TTL.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Store a value under a key with a TTL. A single whole-value write.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Fetch a live value. Expired entries read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Delete a key. Deleting a missing key is a no-op.
    async fn del(&self, key: &str) -> Result<()>;

    /// List live keys starting with `prefix`.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Wipe everything, counters included.
    async fn clear(&self) -> Result<()>;

    /// Point-in-time statistics.
    async fn stats(&self) -> Result<CacheStats>;
}

// ============ In-memory backend ============

struct Entry {
    value: String,
    expires_at: DateTime<Utc>,
    /// Access sequence number; smallest = least recently used.
    last_access: u64,
}

impl Entry {
    fn size(&self, key: &str) -> u64 {
        (key.len() + self.value.len()) as u64
    }
}

struct CacheInner {
    entries: HashMap<String, Entry>,
    memory_used: u64,
    hits: u64,
    misses: u64,
}

/// In-memory [`CacheBackend`] with TTL, LRU eviction, and a memory budget.
pub struct InMemoryCache {
    inner: Mutex<CacheInner>,
    budget: u64,
    clock: Arc<dyn Clock>,
    access_seq: AtomicU64,
}

impl InMemoryCache {
    pub fn new(budget: u64) -> Self {
        Self::with_clock(budget, Arc::new(SystemClock))
    }

    pub fn with_clock(budget: u64, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                memory_used: 0,
                hits: 0,
                misses: 0,
            }),
            budget,
            clock,
            access_seq: AtomicU64::new(0),
        }
    }

    fn next_seq(&self) -> u64 {
        self.access_seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Evict least-recently-used entries until within budget.
    fn evict_to_budget(inner: &mut CacheInner, budget: u64) {
        while inner.memory_used > budget {
            let victim = inner
                .entries
                .iter()
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            match victim {
                Some(key) => {
                    if let Some(entry) = inner.entries.remove(&key) {
                        inner.memory_used -= entry.size(&key);
                    }
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl CacheBackend for InMemoryCache {
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let expires_at = self.clock.now()
            + chrono::Duration::from_std(ttl).map_err(|e| MeshError::Cache {
                reason: format!("ttl out of range: {e}"),
            })?;
        let entry = Entry {
            value,
            expires_at,
            last_access: self.next_seq(),
        };

        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner.entries.remove(key) {
            inner.memory_used -= old.size(key);
        }
        inner.memory_used += entry.size(key);
        inner.entries.insert(key.to_string(), entry);
        Self::evict_to_budget(&mut inner, self.budget);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        let seq = self.next_seq();
        let mut inner = self.inner.lock().unwrap();

        let expired = match inner.entries.get(key) {
            Some(entry) => entry.expires_at <= now,
            None => {
                inner.misses += 1;
                return Ok(None);
            }
        };

        if expired {
            if let Some(entry) = inner.entries.remove(key) {
                inner.memory_used -= entry.size(key);
            }
            inner.misses += 1;
            return Ok(None);
        }

        let entry = inner.entries.get_mut(key).unwrap();
        entry.last_access = seq;
        let value = entry.value.clone();
        inner.hits += 1;
        Ok(Some(value))
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.remove(key) {
            inner.memory_used -= entry.size(key);
        }
        Ok(())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let now = self.clock.now();
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .entries
            .iter()
            .filter(|(k, e)| k.starts_with(prefix) && e.expires_at > now)
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn clear(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.memory_used = 0;
        inner.hits = 0;
        inner.misses = 0;
        Ok(())
    }

    async fn stats(&self) -> Result<CacheStats> {
        let inner = self.inner.lock().unwrap();
        let lookups = inner.hits + inner.misses;
        let hit_rate = if lookups > 0 {
            inner.hits as f64 / lookups as f64
        } else {
            0.0
        };
        Ok(CacheStats {
            entries: inner.entries.len(),
            memory_used: inner.memory_used,
            memory_budget: self.budget,
            hit_rate,
        })
    }
}

// ============ Typed wrapper ============

/// A cached query result, carrying its own timestamp so callers can treat
/// an over-TTL entry as stale even before physical eviction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedQuery {
    pub chunks: Vec<ContextChunk>,
    pub cached_at: DateTime<Utc>,
}

/// Compute the query-cache key: `query:` + sha256(query | agent_type).
pub fn query_key(query: &str, agent_type: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hasher.update([0u8]);
    hasher.update(agent_type.as_bytes());
    format!("query:{}", hex::encode(&hasher.finalize()[..16]))
}

/// Typed working-memory facade over a [`CacheBackend`].
///
/// Key namespaces: `ast:` (syntax trees), `file:` (file contexts),
/// `conv:` (conversations), `session:` (session blobs), `query:`
/// (query results).
#[derive(Clone)]
pub struct WorkingMemory {
    backend: Arc<dyn CacheBackend>,
    ttl: Duration,
}

impl WorkingMemory {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self { backend, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    async fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value).map_err(|e| MeshError::Cache {
            reason: format!("serialize {key}: {e}"),
        })?;
        self.backend.set(key, json, self.ttl).await
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.backend.get(key).await? {
            Some(json) => {
                let value = serde_json::from_str(&json).map_err(|e| MeshError::Cache {
                    reason: format!("deserialize {key}: {e}"),
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    // ---- syntax trees ----

    pub async fn put_syntax_tree(&self, file_path: &str, tree: &SyntaxTree) -> Result<()> {
        self.put_json(&format!("ast:{file_path}"), tree).await
    }

    pub async fn get_syntax_tree(&self, file_path: &str) -> Result<Option<SyntaxTree>> {
        self.get_json(&format!("ast:{file_path}")).await
    }

    // ---- file contexts ----

    pub async fn put_file_context(&self, context: &FileContext) -> Result<()> {
        self.put_json(&format!("file:{}", context.file_path), context)
            .await
    }

    pub async fn get_file_context(&self, file_path: &str) -> Result<Option<FileContext>> {
        self.get_json(&format!("file:{file_path}")).await
    }

    // ---- conversations ----

    /// Append a message: read, push, write.
    ///
    /// The write is a single whole-value `set`, but concurrent appends
    /// for the same session are not serialized — last write wins. Callers
    /// needing strict ordering must serialize appends externally.
    pub async fn append_conversation(&self, session_id: &str, message: Message) -> Result<ConversationHistory> {
        let key = format!("conv:{session_id}");
        let mut history: ConversationHistory =
            self.get_json(&key).await?.unwrap_or(ConversationHistory {
                session_id: session_id.to_string(),
                messages: Vec::new(),
                last_updated: message.timestamp,
                message_count: 0,
            });

        history.last_updated = message.timestamp;
        history.messages.push(message);
        history.message_count = history.messages.len();

        self.put_json(&key, &history).await?;
        Ok(history)
    }

    pub async fn get_conversation(&self, session_id: &str) -> Result<Option<ConversationHistory>> {
        self.get_json(&format!("conv:{session_id}")).await
    }

    /// Session ids with a live conversation entry, sorted.
    pub async fn active_sessions(&self) -> Result<Vec<String>> {
        let keys = self.backend.keys_with_prefix("conv:").await?;
        let mut sessions: Vec<String> = keys
            .iter()
            .filter_map(|k| k.strip_prefix("conv:"))
            .map(str::to_string)
            .collect();
        sessions.sort();
        Ok(sessions)
    }

    // ---- session blobs ----

    pub async fn put_session_data(&self, session_id: &str, data: &serde_json::Value) -> Result<()> {
        self.put_json(&format!("session:{session_id}"), data).await
    }

    pub async fn get_session_data(&self, session_id: &str) -> Result<Option<serde_json::Value>> {
        self.get_json(&format!("session:{session_id}")).await
    }

    // ---- query results ----

    pub async fn put_query_result(
        &self,
        query: &str,
        agent_type: &str,
        chunks: &[ContextChunk],
        now: DateTime<Utc>,
    ) -> Result<()> {
        let cached = CachedQuery {
            chunks: chunks.to_vec(),
            cached_at: now,
        };
        self.put_json(&query_key(query, agent_type), &cached).await
    }

    pub async fn get_query_result(&self, query: &str, agent_type: &str) -> Result<Option<CachedQuery>> {
        self.get_json(&query_key(query, agent_type)).await
    }

    // ---- lifecycle ----

    /// Delete the syntax-tree and file-context entries for a path.
    /// Conversation and query caches are untouched.
    pub async fn invalidate(&self, file_path: &str) -> Result<()> {
        self.backend.del(&format!("ast:{file_path}")).await?;
        self.backend.del(&format!("file:{file_path}")).await?;
        Ok(())
    }

    /// Wipe all namespaces.
    pub async fn clear(&self) -> Result<()> {
        self.backend.clear().await
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        self.backend.stats().await
    }
}
