//! Embedding requests.
//!
//! In stub mode a deterministic pseudo-embedding is computed in-process. With
//! a real engine the embedding model is made resident and a fixed-shape
//! descriptor is returned instead of a vector.

use ns_protocol::{response_ok, EmbedLoadedResponse, EmbedResponse};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;

use crate::engine::ModelRole;
use crate::error::{ServeError, ServeResult};
use crate::state::ServerState;

pub const STUB_EMBEDDING_MODEL: &str = "all-MiniLM-L6-v2-native-stub";

const FNV_OFFSET: u32 = 2_166_136_261;
const FNV_PRIME: u32 = 16_777_619;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
}

/// Short inputs are reported as cache hits. This stands in for a real
/// embedding cache, which the server does not keep.
pub fn classify(text: &str, threshold: usize) -> CacheOutcome {
    if text.chars().count() < threshold {
        CacheOutcome::Hit
    } else {
        CacheOutcome::Miss
    }
}

#[derive(Debug)]
pub enum Embedded {
    Vector(EmbedResponse),
    Loaded(EmbedLoadedResponse),
}

impl Embedded {
    pub fn to_line(&self) -> String {
        match self {
            Self::Vector(resp) => response_ok(resp),
            Self::Loaded(resp) => response_ok(resp),
        }
    }
}

pub fn embed(state: &ServerState, text: &str) -> ServeResult<Embedded> {
    if text.is_empty() {
        return Err(ServeError::MissingInput("text"));
    }
    let config = &state.config;
    let tokens = approx_token_count(text);

    if state.is_stub() {
        return Ok(Embedded::Vector(EmbedResponse {
            embedding: deterministic_embedding(text, config.embedding_dims),
            model: STUB_EMBEDDING_MODEL.to_string(),
            dimensions: config.embedding_dims,
            tokens,
        }));
    }

    let engine = state.engine().ok_or(ServeError::EngineUnavailable)?;
    let session = state
        .sessions
        .acquire(&config.embedding_path(), ModelRole::Embedding);
    let dimensions = session.with_graph(engine, state.providers(), |graph| {
        Ok(graph
            .info()
            .embedding_length
            .unwrap_or(config.embedding_dims))
    })?;

    Ok(Embedded::Loaded(EmbedLoadedResponse {
        model: config.embedding_model.clone(),
        loaded: true,
        dimensions,
        tokens,
    }))
}

/// Seeded from the FNV-1a hash of `text`; equal inputs give bit-identical
/// vectors. Components lie in [-1, 1) and are rounded to six decimals.
pub fn deterministic_embedding(text: &str, dims: usize) -> Vec<f64> {
    let mut rng = ChaCha20Rng::seed_from_u64(u64::from(fnv1a(text.as_bytes())));
    (0..dims)
        .map(|_| {
            let v: f64 = rng.gen_range(-1.0..1.0);
            (v * 1e6).round() / 1e6
        })
        .collect()
}

fn fnv1a(bytes: &[u8]) -> u32 {
    bytes.iter().fold(FNV_OFFSET, |hash, b| {
        (hash ^ u32::from(*b)).wrapping_mul(FNV_PRIME)
    })
}

/// Whitespace word count, at least one for non-empty text.
pub fn approx_token_count(text: &str) -> usize {
    text.split_whitespace().count().max(usize::from(!text.is_empty()))
}
