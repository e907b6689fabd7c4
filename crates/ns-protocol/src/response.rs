use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct CapabilitiesResponse {
    pub providers: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub model: String,
    pub backend: String,
    pub version: &'static str,
    pub uptime_s: u64,
    pub sessions_loaded: usize,
    pub contexts: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsResponse {
    pub requests_total: u64,
    pub requests_failed: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Embedding computed in-process (deterministic fallback).
#[derive(Debug, Serialize)]
pub struct EmbedResponse {
    pub embedding: Vec<f64>,
    pub model: String,
    pub dimensions: usize,
    pub tokens: usize,
}

/// Descriptor returned once the embedding model is resident in the engine.
#[derive(Debug, Serialize)]
pub struct EmbedLoadedResponse {
    pub model: String,
    pub loaded: bool,
    pub dimensions: usize,
    pub tokens: usize,
}

#[derive(Debug, Serialize)]
pub struct GenerateResponse {
    pub text: String,
    pub model: String,
    pub tokens_generated: usize,
}

#[derive(Debug, Serialize)]
pub struct UnloadResponse {
    pub model: String,
    pub unloaded: bool,
}

/// Serialize a success payload as one response line (without the newline).
pub fn response_ok<T: Serialize>(payload: &T) -> String {
    serde_json::to_string(payload)
        .unwrap_or_else(|e| response_err(&format!("response encoding failed: {e}")))
}

/// Error line: `{"error": msg}` and nothing else.
pub fn response_err(msg: &str) -> String {
    let body = ErrorResponse {
        error: msg.to_string(),
    };
    serde_json::to_string(&body).unwrap_or_else(|_| r#"{"error":"internal error"}"#.to_string())
}

#[cfg(test)]
mod tests {
    use super::{response_err, response_ok, GenerateResponse, MetricsResponse};

    #[test]
    fn error_line_escapes_and_stays_on_one_line() {
        let line = response_err("bad \"input\"\nsecond line");
        assert!(!line.contains('\n'));
        let parsed: serde_json::Value = serde_json::from_str(&line).expect("valid json");
        assert_eq!(parsed["error"], "bad \"input\"\nsecond line");
        assert_eq!(parsed.as_object().map(|o| o.len()), Some(1));
    }

    #[test]
    fn success_payloads_serialize_flat() {
        let line = response_ok(&GenerateResponse {
            text: "hello\tworld".to_string(),
            model: "gpt2".to_string(),
            tokens_generated: 3,
        });
        assert_eq!(
            line,
            r#"{"text":"hello\tworld","model":"gpt2","tokens_generated":3}"#
        );

        let line = response_ok(&MetricsResponse::default());
        assert_eq!(
            line,
            r#"{"requests_total":0,"requests_failed":0,"cache_hits":0,"cache_misses":0}"#
        );
    }
}
