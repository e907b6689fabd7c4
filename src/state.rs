use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::commands::metrics::Metrics;
use crate::config::ServerConfig;
use crate::context_cache::ContextCache;
use crate::engine::{default_engine, ExecutionProvider, InferenceEngine};
use crate::error::ServeResult;
use crate::session::SessionManager;
use crate::tokenizer::Tokenizer;

/// Everything the command handlers share, owned by the serving loop.
pub struct ServerState {
    pub config: ServerConfig,
    pub metrics: Metrics,
    pub sessions: SessionManager,
    pub contexts: ContextCache,
    tokenizer: Mutex<Option<Arc<Tokenizer>>>,
    engine: Option<Arc<dyn InferenceEngine>>,
    providers: Vec<ExecutionProvider>,
    started: Instant,
}

impl ServerState {
    /// State backed by whichever engine this build carries.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_engine(config, default_engine())
    }

    pub fn with_engine(config: ServerConfig, engine: Option<Arc<dyn InferenceEngine>>) -> Self {
        let providers = config.execution_providers();
        let contexts = ContextCache::new(config.context_capacity);
        Self {
            config,
            metrics: Metrics::new(),
            sessions: SessionManager::new(),
            contexts,
            tokenizer: Mutex::new(None),
            engine,
            providers,
            started: Instant::now(),
        }
    }

    /// The shared tokenizer, loaded on first use. A failed load is not
    /// remembered.
    pub fn tokenizer(&self) -> ServeResult<Arc<Tokenizer>> {
        let mut slot = self.tokenizer.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tokenizer) = slot.as_ref() {
            return Ok(Arc::clone(tokenizer));
        }
        let tokenizer = Arc::new(Tokenizer::load(
            &self.config.vocab_path(),
            &self.config.merges_path(),
            self.config.eos_token_id,
        )?);
        *slot = Some(Arc::clone(&tokenizer));
        Ok(tokenizer)
    }

    /// Replace the lazily loaded tokenizer with one already built.
    #[cfg(test)]
    pub(crate) fn install_tokenizer(&self, tokenizer: Tokenizer) {
        *self.tokenizer.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(tokenizer));
    }

    pub fn engine(&self) -> Option<&dyn InferenceEngine> {
        self.engine.as_deref()
    }

    pub fn providers(&self) -> &[ExecutionProvider] {
        &self.providers
    }

    pub fn is_stub(&self) -> bool {
        self.config.stub
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}
