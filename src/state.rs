use std::sync::Arc;

use crate::config::AppConfig;
use crate::embedder::EmbeddingClient;
use crate::engine::RagEngine;
use crate::provider::{GeminiProvider, ModelProvider};
use crate::session::SessionManager;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub sessions: Arc<SessionManager>,
    pub engine: Arc<RagEngine>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let provider: Arc<dyn ModelProvider> = Arc::new(GeminiProvider::new(&config));
        let embedder = Arc::new(EmbeddingClient::new(provider.clone(), &config));
        let engine = Arc::new(RagEngine::new(embedder, provider));
        let sessions = Arc::new(SessionManager::new(config.session_defaults.clone()));

        Self {
            config,
            sessions,
            engine,
        }
    }
}
