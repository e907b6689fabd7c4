use std::path::PathBuf;

use ns_protocol::Command;

use crate::config::ServerConfig;
use crate::error::{ServeError, ServeResult};

/// Step budget for a `generate` request: `max_tokens` when given, clamped to
/// `[1, ceiling]`, else the ceiling itself. A bare `null` counts as absent and
/// integral floats such as `8.0` are accepted.
pub(crate) fn parse_max_tokens(command: &Command, ceiling: usize) -> ServeResult<usize> {
    let ceiling = ceiling.max(1);
    let Some(raw) = command
        .non_empty_field("max_tokens")
        .map(str::trim)
        .filter(|v| *v != "null")
    else {
        return Ok(ceiling);
    };
    let invalid = || ServeError::InvalidField {
        field: "max_tokens",
        value: raw.to_string(),
    };

    let parsed = match raw.parse::<i64>() {
        Ok(n) => n,
        Err(_) => {
            let float: f64 = raw.parse().map_err(|_| invalid())?;
            if !float.is_finite() || float.fract() != 0.0 {
                return Err(invalid());
            }
            // `as` saturates.
            float as i64
        }
    };
    let requested = usize::try_from(parsed.max(1)).unwrap_or(ceiling);
    Ok(requested.min(ceiling))
}

/// Bare JSON booleans arrive as literals, quoted ones as strings.
pub(crate) fn parse_flag(command: &Command, name: &str) -> bool {
    command
        .field(name)
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum UnloadTarget {
    Embedding,
    Generation,
    Artifact(PathBuf),
}

impl UnloadTarget {
    pub(crate) fn parse(value: &str) -> Self {
        match value.trim() {
            "embedding" => Self::Embedding,
            "generation" => Self::Generation,
            other => Self::Artifact(PathBuf::from(other)),
        }
    }

    /// Session keys this target may be registered under.
    pub(crate) fn candidate_paths(&self, config: &ServerConfig) -> Vec<PathBuf> {
        match self {
            Self::Embedding => vec![config.embedding_path()],
            Self::Generation => vec![
                config.models_dir.join(&config.generation_quantized_artifact),
                config.models_dir.join(&config.generation_artifact),
            ],
            Self::Artifact(path) if path.is_relative() => {
                vec![path.clone(), config.models_dir.join(path)]
            }
            Self::Artifact(path) => vec![path.clone()],
        }
    }
}
