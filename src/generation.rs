use ns_protocol::GenerateResponse;

use crate::context_cache::ContextEntry;
use crate::engine::{EngineError, ModelGraph, ModelRole, PastState};
use crate::error::{ServeError, ServeResult};
use crate::state::ServerState;

pub const STUB_GENERATION_MODEL: &str = "gpt2-stub";
const STUB_TOKENS: usize = 5;

#[derive(Debug, Clone, Copy)]
pub struct GenerateRequest<'a> {
    pub text: &'a str,
    pub context_id: Option<&'a str>,
    /// Step budget, already clamped by the caller.
    pub max_tokens: usize,
}

struct Decoded {
    sequence: Vec<u32>,
    prompt_start: usize,
    generated: usize,
    past: Option<PastState>,
    past_len: usize,
}

pub fn generate(state: &ServerState, req: &GenerateRequest<'_>) -> ServeResult<GenerateResponse> {
    let config = &state.config;

    if state.is_stub() {
        return Ok(GenerateResponse {
            text: format!(" [STUB: {}]", req.text),
            model: STUB_GENERATION_MODEL.to_string(),
            tokens_generated: STUB_TOKENS.min(req.max_tokens),
        });
    }

    let empty = || GenerateResponse {
        text: String::new(),
        model: config.generation_model.clone(),
        tokens_generated: 0,
    };
    if req.text.is_empty() {
        return Ok(empty());
    }

    let tokenizer = state.tokenizer()?;
    let prompt = tokenizer.encode(req.text);
    if prompt.is_empty() {
        return Ok(empty());
    }

    let engine = state.engine().ok_or(ServeError::EngineUnavailable)?;
    let session = state
        .sessions
        .acquire(&config.generation_path(), ModelRole::Generation);

    // Checked out for the duration of the call; dropped if decoding fails.
    let prior = req.context_id.and_then(|id| state.contexts.checkout(id));
    let decoded = session.with_graph(engine, state.providers(), |graph| {
        decode_loop(graph, tokenizer.eos_id(), prior, &prompt, req.max_tokens)
    })?;

    let text = tokenizer.decode(&decoded.sequence[decoded.prompt_start..]);
    tracing::debug!(
        prompt_tokens = prompt.len(),
        generated = decoded.generated,
        context = req.context_id.unwrap_or("-"),
        "generation finished"
    );

    if let Some(id) = req.context_id {
        state.contexts.store(
            id,
            ContextEntry::new(decoded.sequence, decoded.past, decoded.past_len),
        );
    }

    Ok(GenerateResponse {
        text,
        model: config.generation_model.clone(),
        tokens_generated: decoded.generated,
    })
}

fn decode_loop(
    graph: &mut dyn ModelGraph,
    eos_id: u32,
    prior: Option<ContextEntry>,
    prompt: &[u32],
    budget: usize,
) -> ServeResult<Decoded> {
    let (mut sequence, mut past, mut past_len) = match prior {
        Some(entry) => (entry.tokens, entry.past, entry.seq_len),
        None => (Vec::new(), None, 0),
    };
    if past.is_none() {
        past_len = 0;
    }
    let prompt_start = sequence.len();
    sequence.extend_from_slice(prompt);

    let mut generated = 0;
    while generated < budget {
        let mask = vec![1u32; sequence.len()];
        let step = graph
            .forward(&sequence[past_len..], &mask, past.take())
            .map_err(ServeError::Inference)?;
        let next = argmax(&step.logits).ok_or_else(|| {
            ServeError::Inference(EngineError::Execution("graph returned no logits".to_string()))
        })?;

        past_len = if step.present.is_some() {
            sequence.len()
        } else {
            0
        };
        past = step.present;
        sequence.push(next);
        generated += 1;

        if next == eos_id {
            break;
        }
    }

    Ok(Decoded {
        sequence,
        prompt_start,
        generated,
        past,
        past_len,
    })
}

/// Index of the largest logit; the lowest index wins ties.
fn argmax(logits: &[f32]) -> Option<u32> {
    let mut best: Option<(usize, f32)> = None;
    for (idx, &value) in logits.iter().enumerate() {
        match best {
            Some((_, top)) if value <= top || value.is_nan() => {}
            _ => best = Some((idx, value)),
        }
    }
    best.and_then(|(idx, _)| u32::try_from(idx).ok())
}
