use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::engine::{ExecutionProvider, InferenceEngine, ModelGraph, ModelRole};
use crate::error::{ServeError, ServeResult};

/// One model artifact, loaded at most once.
pub struct ModelSession {
    path: PathBuf,
    role: ModelRole,
    graph: Mutex<Option<Box<dyn ModelGraph>>>,
}

impl ModelSession {
    fn new(path: PathBuf, role: ModelRole) -> Self {
        Self {
            path,
            role,
            graph: Mutex::new(None),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.graph
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Run `f` against the loaded graph, loading it first if needed.
    ///
    /// The graph slot lock serialises concurrent loads of the same artifact;
    /// a failed load leaves the slot empty so the next call retries.
    pub fn with_graph<T>(
        &self,
        engine: &dyn InferenceEngine,
        providers: &[ExecutionProvider],
        f: impl FnOnce(&mut dyn ModelGraph) -> ServeResult<T>,
    ) -> ServeResult<T> {
        let mut slot = self.graph.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            let graph = engine
                .load(&self.path, self.role, providers)
                .map_err(|source| ServeError::LoadFailed {
                    path: self.path.clone(),
                    source,
                })?;
            tracing::info!(
                path = %self.path.display(),
                architecture = %graph.info().architecture,
                provider = %graph.info().provider,
                "model session loaded"
            );
            *slot = Some(graph);
        }

        match slot.as_deref_mut() {
            Some(graph) => f(graph),
            None => Err(ServeError::Internal("session slot empty after load".to_string())),
        }
    }
}

/// Table of model sessions keyed by artifact path.
#[derive(Default)]
pub struct SessionManager {
    sessions: Mutex<HashMap<PathBuf, Arc<ModelSession>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// The session for `path`, created unloaded if absent. The table lock is
    /// held only for the map lookup.
    pub fn acquire(&self, path: &Path, role: ModelRole) -> Arc<ModelSession> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(
            sessions
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(ModelSession::new(path.to_path_buf(), role))),
        )
    }

    /// Drop the session for `path`. Requests still holding it finish normally.
    pub fn release(&self, path: &Path) -> bool {
        let removed = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(path)
            .is_some();
        if removed {
            tracing::info!(path = %path.display(), "model session released");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn loaded_count(&self) -> usize {
        let sessions: Vec<Arc<ModelSession>> = self
            .sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        sessions.iter().filter(|s| s.is_loaded()).count()
    }
}
