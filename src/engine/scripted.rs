//! In-process engine for tests: emits a fixed token script and records every
//! call it receives.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::{
    EngineError, ExecutionProvider, GraphInfo, InferenceEngine, ModelGraph, ModelRole, PastState,
    StepOutput,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StepRecord {
    pub input_len: usize,
    pub mask_len: usize,
    pub had_past: bool,
}

#[derive(Default)]
pub(crate) struct ScriptLog {
    pub loads: Vec<(PathBuf, ModelRole)>,
    pub steps: Vec<StepRecord>,
}

#[derive(Clone)]
pub(crate) struct ScriptedEngine {
    /// Token emitted at step `n` is `script[n % len]`, counted per graph.
    pub script: Vec<u32>,
    pub vocab: usize,
    pub keeps_past: bool,
    pub fail_load: bool,
    pub fail_forward: bool,
    pub embedding_length: Option<usize>,
    pub log: Arc<Mutex<ScriptLog>>,
}

impl ScriptedEngine {
    pub fn new(script: Vec<u32>) -> Self {
        Self {
            script,
            vocab: 16,
            keeps_past: true,
            fail_load: false,
            fail_forward: false,
            embedding_length: None,
            log: Arc::new(Mutex::new(ScriptLog::default())),
        }
    }

    pub fn load_count(&self) -> usize {
        self.log.lock().expect("log lock").loads.len()
    }

    pub fn steps(&self) -> Vec<StepRecord> {
        self.log.lock().expect("log lock").steps.clone()
    }
}

impl InferenceEngine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn available_providers(&self) -> Vec<String> {
        vec!["cpu".to_string()]
    }

    fn load(
        &self,
        path: &Path,
        role: ModelRole,
        _providers: &[ExecutionProvider],
    ) -> Result<Box<dyn ModelGraph>, EngineError> {
        self.log
            .lock()
            .expect("log lock")
            .loads
            .push((path.to_path_buf(), role));
        if self.fail_load {
            return Err(EngineError::Load(format!("cannot open {}", path.display())));
        }
        Ok(Box::new(ScriptedGraph {
            engine: self.clone(),
            emitted: 0,
            info: GraphInfo {
                architecture: "scripted".to_string(),
                embedding_length: self.embedding_length,
                provider: ExecutionProvider::Cpu,
            },
        }))
    }
}

struct ScriptedGraph {
    engine: ScriptedEngine,
    emitted: usize,
    info: GraphInfo,
}

impl ModelGraph for ScriptedGraph {
    fn info(&self) -> &GraphInfo {
        &self.info
    }

    fn forward(
        &mut self,
        input_ids: &[u32],
        attention_mask: &[u32],
        past: Option<PastState>,
    ) -> Result<StepOutput, EngineError> {
        self.engine
            .log
            .lock()
            .expect("log lock")
            .steps
            .push(StepRecord {
                input_len: input_ids.len(),
                mask_len: attention_mask.len(),
                had_past: past.is_some(),
            });
        if self.engine.fail_forward {
            return Err(EngineError::Execution("scripted failure".to_string()));
        }

        let target = self.engine.script[self.emitted % self.engine.script.len()];
        self.emitted += 1;

        let mut logits = vec![0.0f32; self.engine.vocab.max(target as usize + 1)];
        logits[target as usize] = 1.0;

        Ok(StepOutput {
            logits,
            present: self
                .engine
                .keeps_past
                .then(|| PastState::KeyValues(Vec::new())),
        })
    }
}
