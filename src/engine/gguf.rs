use std::path::Path;

use anyhow::{Error as E, Result};
use candle_core::quantized::gguf_file;
use candle_core::{DType, Device, Tensor};
use candle_transformers::models::quantized_llama;
use candle_transformers::models::quantized_qwen2;

use super::{
    attach_first, EngineError, ExecutionProvider, GraphInfo, InferenceEngine, ModelGraph,
    ModelRole, PastState, StepOutput,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    Llama,
    Qwen2,
    Unknown,
}

impl ModelFamily {
    fn from_architecture(arch: &str) -> Self {
        match arch {
            "llama" | "mistral" => Self::Llama,
            "qwen2" => Self::Qwen2,
            _ => Self::Unknown,
        }
    }

    fn from_filename(path: &Path) -> Self {
        let lowered = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if lowered.contains("llama") || lowered.contains("mistral") {
            Self::Llama
        } else if lowered.contains("qwen") {
            Self::Qwen2
        } else {
            Self::Unknown
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct GgufMetadata {
    architecture: String,
    embedding_length: Option<usize>,
    family: ModelFamily,
}

impl GgufMetadata {
    fn from_content(content: &gguf_file::Content, path: &Path) -> Self {
        let architecture = content
            .metadata
            .get("general.architecture")
            .and_then(|v| v.to_string().ok())
            .cloned()
            .unwrap_or_else(|| "unknown".to_string());

        let embedding_length = content
            .metadata
            .get(&format!("{architecture}.embedding_length"))
            .and_then(|v| {
                v.to_u32()
                    .map(|n| n as usize)
                    .or_else(|_| v.to_u64().map(|n| n as usize))
                    .ok()
            });

        let family = match ModelFamily::from_architecture(&architecture) {
            ModelFamily::Unknown => ModelFamily::from_filename(path),
            known => known,
        };

        Self {
            architecture,
            embedding_length,
            family,
        }
    }
}

pub enum RuntimeModel {
    Llama(quantized_llama::ModelWeights),
    Qwen2(quantized_qwen2::ModelWeights),
}

impl RuntimeModel {
    fn load_from_gguf(path: &Path, device: &Device) -> Result<(Self, GgufMetadata)> {
        let mut file = std::fs::File::open(path)
            .map_err(|e| E::msg(format!("failed to open model file: {}", e)))?;
        let content = gguf_file::Content::read(&mut file)?;
        let meta = GgufMetadata::from_content(&content, path);

        let model = match meta.family {
            ModelFamily::Llama => {
                Self::Llama(quantized_llama::ModelWeights::from_gguf(content, &mut file, device)?)
            }
            ModelFamily::Qwen2 => {
                match quantized_qwen2::ModelWeights::from_gguf(content, &mut file, device) {
                    Ok(model) => Self::Qwen2(model),
                    Err(e) => {
                        let msg = e.to_string();
                        if msg.contains("cannot find tensor info for output_norm.weight") {
                            return Err(E::msg(
                                "qwen2 load failed: missing 'output_norm.weight'; the GGUF looks like an incomplete split shard",
                            ));
                        }
                        return Err(E::msg(msg));
                    }
                }
            }
            ModelFamily::Unknown => {
                return Err(E::msg(format!(
                    "unsupported architecture '{}' for generation",
                    meta.architecture
                )))
            }
        };

        Ok((model, meta))
    }

    fn forward(&mut self, input: &Tensor, position: usize) -> Result<Tensor, EngineError> {
        match self {
            Self::Llama(model) => Ok(model.forward(input, position)?),
            Self::Qwen2(model) => Ok(model.forward(input, position)?),
        }
    }

    /// Llama weights are cheap to clone and each clone owns its own cache.
    fn duplicate_if_supported(&self) -> Option<Self> {
        match self {
            Self::Llama(model) => Some(Self::Llama(model.clone())),
            Self::Qwen2(_) => None,
        }
    }
}

/// Generation graph backed by a master model that is never advanced itself
/// when it can be forked.
struct GenerationGraph {
    master: RuntimeModel,
    device: Device,
    info: GraphInfo,
}

impl GenerationGraph {
    fn run(&self, model: &mut RuntimeModel, input_ids: &[u32], offset: usize) -> Result<Vec<f32>, EngineError> {
        let input = Tensor::new(input_ids, &self.device)?.unsqueeze(0)?;
        let logits = model.forward(&input, offset)?;
        Ok(logits
            .squeeze(0)?
            .to_dtype(DType::F32)?
            .flatten_all()?
            .to_vec1::<f32>()?)
    }
}

impl ModelGraph for GenerationGraph {
    fn info(&self) -> &GraphInfo {
        &self.info
    }

    fn forward(
        &mut self,
        input_ids: &[u32],
        attention_mask: &[u32],
        past: Option<PastState>,
    ) -> Result<StepOutput, EngineError> {
        if input_ids.is_empty() {
            return Err(EngineError::Execution("empty input".to_string()));
        }
        let offset = attention_mask.len().saturating_sub(input_ids.len());

        match past {
            Some(PastState::Forked(mut model)) => {
                let logits = self.run(&mut model, input_ids, offset)?;
                Ok(StepOutput {
                    logits,
                    present: Some(PastState::Forked(model)),
                })
            }
            Some(PastState::KeyValues(_)) => Err(EngineError::Unsupported(
                "raw key/value state for a gguf graph".to_string(),
            )),
            None if offset != 0 => Err(EngineError::Execution(format!(
                "{offset} positions masked in but no past state supplied"
            ))),
            None => match self.master.duplicate_if_supported() {
                Some(mut fork) => {
                    let logits = self.run(&mut fork, input_ids, 0)?;
                    Ok(StepOutput {
                        logits,
                        present: Some(PastState::Forked(Box::new(fork))),
                    })
                }
                None => {
                    // Position 0 resets the internal cache of the master.
                    let input = Tensor::new(input_ids, &self.device)?.unsqueeze(0)?;
                    let logits = self.master.forward(&input, 0)?;
                    let logits = logits
                        .squeeze(0)?
                        .to_dtype(DType::F32)?
                        .flatten_all()?
                        .to_vec1::<f32>()?;
                    Ok(StepOutput {
                        logits,
                        present: None,
                    })
                }
            },
        }
    }
}

/// Embedding artifacts are only opened and described; no pooling graph is run.
struct EmbeddingGraph {
    info: GraphInfo,
}

impl ModelGraph for EmbeddingGraph {
    fn info(&self) -> &GraphInfo {
        &self.info
    }

    fn forward(
        &mut self,
        _input_ids: &[u32],
        _attention_mask: &[u32],
        _past: Option<PastState>,
    ) -> Result<StepOutput, EngineError> {
        Err(EngineError::Unsupported(
            "decode step on an embedding graph".to_string(),
        ))
    }
}

fn device_for(provider: ExecutionProvider) -> Result<Device, EngineError> {
    match provider {
        ExecutionProvider::Cuda => Ok(Device::new_cuda(0)?),
        ExecutionProvider::Metal => Ok(Device::new_metal(0)?),
        ExecutionProvider::Cpu => Ok(Device::Cpu),
    }
}

fn read_metadata(path: &Path) -> Result<GgufMetadata> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| E::msg(format!("failed to open model file: {}", e)))?;
    let content = gguf_file::Content::read(&mut file)?;
    Ok(GgufMetadata::from_content(&content, path))
}

/// Quantized GGUF models on candle.
pub struct CandleEngine;

impl InferenceEngine for CandleEngine {
    fn name(&self) -> &'static str {
        "candle"
    }

    fn available_providers(&self) -> Vec<String> {
        let mut providers = Vec::new();
        if candle_core::utils::cuda_is_available() {
            providers.push(ExecutionProvider::Cuda.name().to_string());
        }
        if candle_core::utils::metal_is_available() {
            providers.push(ExecutionProvider::Metal.name().to_string());
        }
        providers.push(ExecutionProvider::Cpu.name().to_string());
        providers
    }

    fn load(
        &self,
        path: &Path,
        role: ModelRole,
        providers: &[ExecutionProvider],
    ) -> Result<Box<dyn ModelGraph>, EngineError> {
        let (device, provider) = attach_first(providers, device_for)?;
        tracing::info!(path = %path.display(), ?role, %provider, "loading gguf artifact");

        match role {
            ModelRole::Embedding => {
                let meta = read_metadata(path).map_err(|e| EngineError::Load(format!("{e:#}")))?;
                Ok(Box::new(EmbeddingGraph {
                    info: GraphInfo {
                        architecture: meta.architecture,
                        embedding_length: meta.embedding_length,
                        provider,
                    },
                }))
            }
            ModelRole::Generation => {
                let (master, meta) = RuntimeModel::load_from_gguf(path, &device)
                    .map_err(|e| EngineError::Load(format!("{e:#}")))?;
                if master.duplicate_if_supported().is_none() {
                    tracing::info!(
                        architecture = %meta.architecture,
                        "graph cannot fork its cache; every step replays the full sequence"
                    );
                }
                Ok(Box::new(GenerationGraph {
                    master,
                    device,
                    info: GraphInfo {
                        architecture: meta.architecture,
                        embedding_length: meta.embedding_length,
                        provider,
                    },
                }))
            }
        }
    }
}
