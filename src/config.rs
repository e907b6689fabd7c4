//! Server configuration

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::engine::ExecutionProvider;

pub const MODELS_DIR_ENV: &str = "NS_LLM_MODELS_DIR";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config {}: {source}", .path.display())]
    Toml {
        path: PathBuf,
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory all artifact file names are resolved against
    pub models_dir: PathBuf,
    pub vocab_file: String,
    pub merges_file: String,

    pub embedding_artifact: String,
    /// Model name reported by `health` and `embed`
    pub embedding_model: String,
    pub embedding_dims: usize,
    /// Inputs shorter than this many characters count as cache hits
    pub cache_hit_threshold: usize,

    pub generation_artifact: String,
    /// Preferred over `generation_artifact` when present on disk
    pub generation_quantized_artifact: String,
    pub generation_model: String,
    pub max_new_tokens: usize,
    /// Maximum number of generation contexts kept resident
    pub context_capacity: usize,
    pub eos_token_id: Option<u32>,

    /// Execution providers in priority order; CPU is always the final fallback
    pub providers: Vec<String>,
    pub stub: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            vocab_file: "vocab.json".to_string(),
            merges_file: "merges.txt".to_string(),
            embedding_artifact: "all-MiniLM-L6-v2.gguf".to_string(),
            embedding_model: "all-MiniLM-L6-v2".to_string(),
            embedding_dims: 384,
            cache_hit_threshold: 64,
            generation_artifact: "gpt2.gguf".to_string(),
            generation_quantized_artifact: "gpt2_quantized.gguf".to_string(),
            generation_model: "gpt2".to_string(),
            max_new_tokens: 20,
            context_capacity: 64,
            eos_token_id: None,
            providers: vec!["cuda".to_string(), "metal".to_string(), "cpu".to_string()],
            stub: false,
        }
    }
}

impl ServerConfig {
    /// Defaults, overlaid with the TOML file when given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Toml {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup(MODELS_DIR_ENV).filter(|d| !d.trim().is_empty()) {
            self.models_dir = PathBuf::from(dir);
        }
    }

    pub fn vocab_path(&self) -> PathBuf {
        self.models_dir.join(&self.vocab_file)
    }

    pub fn merges_path(&self) -> PathBuf {
        self.models_dir.join(&self.merges_file)
    }

    pub fn embedding_path(&self) -> PathBuf {
        self.models_dir.join(&self.embedding_artifact)
    }

    /// The quantized generation artifact if it exists, else the default one.
    pub fn generation_path(&self) -> PathBuf {
        let quantized = self.models_dir.join(&self.generation_quantized_artifact);
        if quantized.is_file() {
            quantized
        } else {
            self.models_dir.join(&self.generation_artifact)
        }
    }

    /// Configured providers in order; unknown names are logged and dropped.
    pub fn execution_providers(&self) -> Vec<ExecutionProvider> {
        let mut out = Vec::with_capacity(self.providers.len());
        for name in &self.providers {
            match ExecutionProvider::parse(name) {
                Some(p) if !out.contains(&p) => out.push(p),
                Some(_) => {}
                None => tracing::warn!(provider = %name, "ignoring unknown execution provider"),
            }
        }
        out
    }
}
