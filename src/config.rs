use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunker::ChunkingStrategy;
use crate::retrieval::RetrievalStrategy;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Per-session configuration, fixed at session creation. Callers may
/// override individual fields in the create-session request; everything else
/// falls back to the env-derived defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub session_ttl_secs: u64,
    pub max_documents: usize,
    pub max_file_size_bytes: usize,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
    pub min_similarity_score: f32,
    pub default_strategy: RetrievalStrategy,
    pub default_chunking_strategy: ChunkingStrategy,
    pub max_concurrent_embeddings: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: 15 * 60,
            max_documents: 2,
            max_file_size_bytes: 100 * 1024,
            chunk_size: 512,
            chunk_overlap: 50,
            top_k: 5,
            min_similarity_score: 0.3,
            default_strategy: RetrievalStrategy::Direct,
            default_chunking_strategy: ChunkingStrategy::FixedSize,
            max_concurrent_embeddings: 5,
        }
    }
}

impl SessionConfig {
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }

    fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            session_ttl_secs: env_or("RAG_SESSION_TTL_SECS", defaults.session_ttl_secs),
            max_documents: env_or("RAG_MAX_DOCUMENTS", defaults.max_documents),
            max_file_size_bytes: env_or("RAG_MAX_FILE_SIZE_BYTES", defaults.max_file_size_bytes),
            chunk_size: env_or("RAG_CHUNK_SIZE", defaults.chunk_size),
            chunk_overlap: env_or("RAG_CHUNK_OVERLAP", defaults.chunk_overlap),
            top_k: env_or("RAG_TOP_K", defaults.top_k),
            min_similarity_score: env_or("RAG_MIN_SIMILARITY", defaults.min_similarity_score),
            max_concurrent_embeddings: env_or(
                "RAG_MAX_CONCURRENT_EMBEDDINGS",
                defaults.max_concurrent_embeddings,
            ),
            ..defaults
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: String,
    pub provider_base_url: String,
    pub api_key: Option<String>,
    pub embedding_model: String,
    pub generation_model: String,
    pub embed_timeout: Duration,
    pub generation_timeout: Duration,
    pub embed_max_retries: u32,
    pub max_concurrent_requests: usize,
    pub embed_cache_minutes: u64,
    pub embed_cache_max_mb: u64,
    pub session_defaults: SessionConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let port = std::env::var("RAG_PORT").unwrap_or_else(|_| "9760".to_string());

        Self {
            listen_addr: format!("127.0.0.1:{}", port),
            provider_base_url: std::env::var("RAG_PROVIDER_BASE_URL").unwrap_or_else(|_| {
                "https://generativelanguage.googleapis.com/v1beta".to_string()
            }),
            api_key: std::env::var("GEMINI_API_KEY").ok().filter(|k| !k.is_empty()),
            embedding_model: std::env::var("RAG_EMBEDDING_MODEL")
                .unwrap_or_else(|_| "text-embedding-004".to_string()),
            generation_model: std::env::var("RAG_GENERATION_MODEL")
                .unwrap_or_else(|_| "gemini-2.0-flash".to_string()),
            embed_timeout: Duration::from_secs(env_or("RAG_EMBED_TIMEOUT_SECS", 30)),
            generation_timeout: Duration::from_secs(env_or("RAG_GENERATION_TIMEOUT_SECS", 60)),
            embed_max_retries: env_or("RAG_EMBED_MAX_RETRIES", 3),
            max_concurrent_requests: env_or("RAG_MAX_CONCURRENT_REQUESTS", 5),
            embed_cache_minutes: env_or("RAG_EMBED_CACHE_MINUTES", 30),
            embed_cache_max_mb: env_or("RAG_EMBED_CACHE_MAX_MB", 64),
            session_defaults: SessionConfig::from_env(),
        }
    }
}

#[cfg(test)]
impl AppConfig {
    /// Config for unit tests: localhost provider, tiny caches.
    pub fn for_tests() -> Self {
        Self {
            listen_addr: "127.0.0.1:0".into(),
            provider_base_url: "http://127.0.0.1:0".into(),
            api_key: Some("test-key".into()),
            embedding_model: "embed-model".into(),
            generation_model: "gen-model".into(),
            embed_timeout: Duration::from_secs(5),
            generation_timeout: Duration::from_secs(5),
            embed_max_retries: 0,
            max_concurrent_requests: 4,
            embed_cache_minutes: 5,
            embed_cache_max_mb: 4,
            session_defaults: SessionConfig::default(),
        }
    }
}
