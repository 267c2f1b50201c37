//! Session lifecycle: creation, sliding-TTL lookup, eviction, global stats.
//!
//! Sessions live in a moka cache whose per-entry expiry returns the
//! session's own TTL after every create/read/update, giving each session a
//! sliding window. A companion DashMap registry, kept in sync by the
//! eviction listener, lets stats queries avoid scanning the cache backing
//! store. Evicting a session drops its documents, chunks and embeddings;
//! the process-wide embedding cache is untouched.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::sync::Cache;
use moka::{Expiry, notification::RemovalCause};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::SessionConfig;
use crate::index::VectorIndex;
use crate::types::{Document, short_hex_id};

/// Cumulative per-session counters, updated by the ingestion pipeline and
/// the query orchestrator.
#[derive(Debug, Default)]
pub struct SessionMetrics {
    chunking_time_ms: AtomicU64,
    embedding_time_ms: AtomicU64,
    retrieval_time_ms: AtomicU64,
    generation_time_ms: AtomicU64,
    total_chunks: AtomicUsize,
    chunks_retrieved: AtomicUsize,
    total_tokens_used: AtomicU64,
    queries: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetricsSnapshot {
    pub chunking_time_ms: u64,
    pub embedding_time_ms: u64,
    pub retrieval_time_ms: u64,
    pub generation_time_ms: u64,
    pub total_chunks: usize,
    pub chunks_retrieved: usize,
    pub total_tokens_used: u64,
    pub queries: u64,
}

impl SessionMetrics {
    pub fn record_ingestion(&self, chunking_ms: u64, embedding_ms: u64, chunks: usize) {
        self.chunking_time_ms.fetch_add(chunking_ms, Ordering::Relaxed);
        self.embedding_time_ms
            .fetch_add(embedding_ms, Ordering::Relaxed);
        self.total_chunks.fetch_add(chunks, Ordering::Relaxed);
    }

    pub fn record_query(
        &self,
        retrieval_ms: u64,
        generation_ms: u64,
        chunks_retrieved: usize,
        tokens_used: u64,
    ) {
        self.retrieval_time_ms
            .fetch_add(retrieval_ms, Ordering::Relaxed);
        self.generation_time_ms
            .fetch_add(generation_ms, Ordering::Relaxed);
        self.chunks_retrieved
            .fetch_add(chunks_retrieved, Ordering::Relaxed);
        self.total_tokens_used
            .fetch_add(tokens_used, Ordering::Relaxed);
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SessionMetricsSnapshot {
        SessionMetricsSnapshot {
            chunking_time_ms: self.chunking_time_ms.load(Ordering::Relaxed),
            embedding_time_ms: self.embedding_time_ms.load(Ordering::Relaxed),
            retrieval_time_ms: self.retrieval_time_ms.load(Ordering::Relaxed),
            generation_time_ms: self.generation_time_ms.load(Ordering::Relaxed),
            total_chunks: self.total_chunks.load(Ordering::Relaxed),
            chunks_retrieved: self.chunks_retrieved.load(Ordering::Relaxed),
            total_tokens_used: self.total_tokens_used.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
        }
    }
}

/// One caller's container of documents, their embeddings, and accumulated
/// metrics. Exclusively owns its documents and vector index; both are
/// released when the session is evicted.
pub struct Session {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    expires_at: RwLock<DateTime<Utc>>,
    pub config: SessionConfig,
    pub documents: RwLock<Vec<Document>>,
    pub index: VectorIndex,
    pub metrics: SessionMetrics,
}

impl Session {
    fn new(config: SessionConfig) -> Arc<Self> {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(config.session_ttl())
            .unwrap_or_else(|_| chrono::Duration::seconds(900));
        Arc::new(Self {
            session_id: format!("rag_{}", short_hex_id()),
            created_at: now,
            expires_at: RwLock::new(now + ttl),
            config,
            documents: RwLock::new(Vec::new()),
            index: VectorIndex::new(),
            metrics: SessionMetrics::default(),
        })
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        *self.expires_at.read()
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > *self.expires_at.read()
    }

    /// Slide the expiration window. Called on every access.
    pub fn touch(&self) {
        let ttl = chrono::Duration::from_std(self.config.session_ttl())
            .unwrap_or_else(|_| chrono::Duration::seconds(900));
        *self.expires_at.write() = Utc::now() + ttl;
    }

    pub fn document_count(&self) -> usize {
        self.documents.read().len()
    }

    pub fn chunk_count(&self) -> usize {
        self.index.len()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    pub active_sessions: usize,
    pub total_documents: usize,
    pub total_chunks: usize,
}

/// Sliding per-entry expiration: every create/read/update resets the entry's
/// remaining lifetime to the session's own TTL.
struct SessionExpiry;

impl Expiry<String, Arc<Session>> for SessionExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        session: &Arc<Session>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(session.config.session_ttl())
    }

    fn expire_after_read(
        &self,
        _key: &String,
        session: &Arc<Session>,
        _read_at: Instant,
        _duration_until_expiry: Option<Duration>,
        _last_modified_at: Instant,
    ) -> Option<Duration> {
        Some(session.config.session_ttl())
    }

    fn expire_after_update(
        &self,
        _key: &String,
        session: &Arc<Session>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(session.config.session_ttl())
    }
}

pub struct SessionManager {
    store: Cache<String, Arc<Session>>,
    registry: Arc<DashMap<String, Arc<Session>>>,
    defaults: SessionConfig,
}

impl SessionManager {
    pub fn new(defaults: SessionConfig) -> Self {
        let registry: Arc<DashMap<String, Arc<Session>>> = Arc::new(DashMap::new());
        let listener_registry = registry.clone();

        let store = Cache::builder()
            .expire_after(SessionExpiry)
            .eviction_listener(move |key: Arc<String>, session: Arc<Session>, cause| {
                if matches!(cause, RemovalCause::Expired) {
                    info!(
                        session_id = %key,
                        documents = session.document_count(),
                        chunks = session.chunk_count(),
                        "session expired"
                    );
                }
                listener_registry.remove(key.as_ref());
            })
            .build();

        Self {
            store,
            registry,
            defaults,
        }
    }

    /// Create a session. `config` overrides the process defaults when given.
    pub fn create(&self, config: Option<SessionConfig>) -> Arc<Session> {
        let session = Session::new(config.unwrap_or_else(|| self.defaults.clone()));
        debug!(
            session_id = %session.session_id,
            ttl_secs = session.config.session_ttl_secs,
            "session created"
        );
        self.registry
            .insert(session.session_id.clone(), session.clone());
        self.store
            .insert(session.session_id.clone(), session.clone());
        session
    }

    /// Look up a live session, sliding its TTL. Returns `None` for unknown
    /// or expired ids, with no side effects.
    pub fn get(&self, session_id: &str) -> Option<Arc<Session>> {
        let session = self.store.get(session_id)?;
        if session.is_expired() {
            self.store.invalidate(session_id);
            self.registry.remove(session_id);
            return None;
        }
        session.touch();
        Some(session)
    }

    /// Explicitly delete a session. Returns whether it existed.
    pub fn remove(&self, session_id: &str) -> bool {
        let existed = self.registry.remove(session_id).is_some();
        self.store.invalidate(session_id);
        if existed {
            debug!(session_id, "session removed");
        }
        existed
    }

    /// Sums across live sessions, via the registry rather than the cache
    /// backing store.
    pub fn global_stats(&self) -> GlobalStats {
        self.store.run_pending_tasks();

        let mut stats = GlobalStats {
            active_sessions: 0,
            total_documents: 0,
            total_chunks: 0,
        };
        for entry in self.registry.iter() {
            let session = entry.value();
            if session.is_expired() {
                continue;
            }
            stats.active_sessions += 1;
            stats.total_documents += session.document_count();
            stats.total_chunks += session.chunk_count();
        }
        stats
    }

    pub fn defaults(&self) -> &SessionConfig {
        &self.defaults
    }
}
