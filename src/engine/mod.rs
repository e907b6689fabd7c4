//! The numeric inference capability.
//!
//! The server never talks to a tensor library directly: it loads a
//! [`ModelGraph`] through an [`InferenceEngine`] and drives it one decode step
//! at a time. The candle GGUF backend lives in [`gguf`]; without the `gguf`
//! feature no engine is compiled in and only the stub fallbacks are available.

#[cfg(feature = "gguf")]
pub mod gguf;
#[cfg(test)]
pub(crate) mod scripted;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use candle_core::Tensor;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{0}")]
    Load(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("{0}")]
    Execution(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelRole {
    Embedding,
    Generation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionProvider {
    Cuda,
    Metal,
    Cpu,
}

impl ExecutionProvider {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "cuda" | "gpu" => Some(Self::Cuda),
            "metal" => Some(Self::Metal),
            "cpu" => Some(Self::Cpu),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Cuda => "cuda",
            Self::Metal => "metal",
            Self::Cpu => "cpu",
        }
    }
}

impl fmt::Display for ExecutionProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Metadata a loaded graph reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphInfo {
    pub architecture: String,
    pub embedding_length: Option<usize>,
    pub provider: ExecutionProvider,
}

/// Incremental decode state handed back to the graph on the next step.
pub enum PastState {
    /// Raw per-layer key/value tensors.
    KeyValues(Vec<Tensor>),
    /// A forked model instance whose internal cache already covers the prefix.
    #[cfg(feature = "gguf")]
    Forked(Box<gguf::RuntimeModel>),
}

impl fmt::Debug for PastState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::KeyValues(kv) => write!(f, "KeyValues({} tensors)", kv.len()),
            #[cfg(feature = "gguf")]
            Self::Forked(_) => f.write_str("Forked"),
        }
    }
}

pub struct StepOutput {
    /// Logits of the final input position.
    pub logits: Vec<f32>,
    /// `None` when the graph cannot resume; the caller then feeds the whole
    /// sequence on the next step.
    pub present: Option<PastState>,
}

pub trait ModelGraph: Send {
    fn info(&self) -> &GraphInfo;

    /// `input_ids` is the suffix of the sequence not covered by `past`;
    /// `attention_mask` spans the whole sequence.
    fn forward(
        &mut self,
        input_ids: &[u32],
        attention_mask: &[u32],
        past: Option<PastState>,
    ) -> Result<StepOutput, EngineError>;
}

pub trait InferenceEngine: Send + Sync {
    fn name(&self) -> &'static str;

    fn available_providers(&self) -> Vec<String>;

    fn load(
        &self,
        path: &Path,
        role: ModelRole,
        providers: &[ExecutionProvider],
    ) -> Result<Box<dyn ModelGraph>, EngineError>;
}

/// Try each provider in order, falling back to CPU. A provider that fails to
/// attach is logged and skipped; only a CPU failure is returned.
pub fn attach_first<T>(
    providers: &[ExecutionProvider],
    mut attach: impl FnMut(ExecutionProvider) -> Result<T, EngineError>,
) -> Result<(T, ExecutionProvider), EngineError> {
    for provider in providers
        .iter()
        .copied()
        .filter(|p| *p != ExecutionProvider::Cpu)
    {
        match attach(provider) {
            Ok(handle) => return Ok((handle, provider)),
            Err(err) => {
                tracing::warn!(provider = %provider, error = %err, "execution provider unavailable, trying next");
            }
        }
    }
    attach(ExecutionProvider::Cpu).map(|handle| (handle, ExecutionProvider::Cpu))
}

/// Engine compiled into this build, if any.
pub fn default_engine() -> Option<Arc<dyn InferenceEngine>> {
    #[cfg(feature = "gguf")]
    {
        Some(Arc::new(gguf::CandleEngine))
    }
    #[cfg(not(feature = "gguf"))]
    {
        None
    }
}
