pub mod metrics;
mod parsing;

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use ns_protocol::{
    parse_line, response_err, response_ok, CapabilitiesResponse, Command, CommandKind,
    HealthResponse, UnloadResponse,
};

use crate::embedding::{self, STUB_EMBEDDING_MODEL};
use crate::error::{ServeError, ServeResult};
use crate::generation::{self, GenerateRequest};
use crate::state::ServerState;

use self::metrics::log_event;
use self::parsing::{parse_flag, parse_max_tokens, UnloadTarget};

pub const STUB_PROVIDER: &str = "StubProvider";
pub const STUB_BACKEND: &str = "native-stub";

/// Handle one input line. Blank lines produce nothing; every other line
/// produces exactly one response line (without the trailing newline).
pub fn execute_line(state: &mut ServerState, line: &str) -> Option<String> {
    if line.trim().is_empty() {
        return None;
    }

    match parse_line(line) {
        Ok(command) => Some(execute_command(state, &command)),
        Err(e) => {
            state.metrics.record_failure();
            let err = ServeError::from(e);
            log_event("parse_error", "-", &err.to_string());
            Some(response_err(&err.to_string()))
        }
    }
}

pub fn execute_command(state: &mut ServerState, command: &Command) -> String {
    let kind = command.kind();

    if kind.is_counted() {
        state.metrics.record_request();
    }
    if *kind == CommandKind::Embed {
        if let Some(text) = command.non_empty_field("text") {
            let outcome = embedding::classify(text, state.config.cache_hit_threshold);
            state.metrics.record_cache(outcome);
        }
    }

    let shared: &ServerState = state;
    let result = panic::catch_unwind(AssertUnwindSafe(|| dispatch(shared, command)))
        .unwrap_or_else(|payload| Err(ServeError::Internal(panic_message(payload.as_ref()))));

    match result {
        Ok(line) => {
            log_event("ok", kind.as_str(), "");
            line
        }
        Err(err) => {
            let contained_panic = matches!(err, ServeError::Internal(_));
            if kind.is_counted() || contained_panic {
                state.metrics.record_failure();
            }
            tracing::warn!(cmd = kind.as_str(), error = %err, "command failed");
            response_err(&err.to_string())
        }
    }
}

fn dispatch(state: &ServerState, command: &Command) -> ServeResult<String> {
    match command.kind() {
        CommandKind::Capabilities => Ok(response_ok(&CapabilitiesResponse {
            providers: capabilities(state),
        })),
        CommandKind::Health => Ok(response_ok(&health(state))),
        CommandKind::Metrics => Ok(response_ok(&state.metrics.snapshot())),
        CommandKind::Embed => {
            let text = command
                .non_empty_field("text")
                .ok_or(ServeError::MissingInput("text"))?;
            Ok(embedding::embed(state, text)?.to_line())
        }
        CommandKind::Generate => {
            let text = command
                .non_empty_field("text")
                .ok_or(ServeError::MissingInput("text"))?;
            let max_tokens = parse_max_tokens(command, state.config.max_new_tokens)?;
            if parse_flag(command, "stream") {
                tracing::debug!("streaming requested; answering with a single line");
            }
            let request = GenerateRequest {
                text,
                context_id: command.non_empty_field("context_id"),
                max_tokens,
            };
            Ok(response_ok(&generation::generate(state, &request)?))
        }
        CommandKind::Unload => unload(state, command),
        CommandKind::Unknown(name) => Err(ServeError::UnknownCommand(name.clone())),
    }
}

fn capabilities(state: &ServerState) -> Vec<String> {
    match state.engine() {
        Some(engine) if !state.is_stub() => engine.available_providers(),
        _ => vec![STUB_PROVIDER.to_string()],
    }
}

fn health(state: &ServerState) -> HealthResponse {
    let (model, backend) = if state.is_stub() {
        (STUB_EMBEDDING_MODEL.to_string(), STUB_BACKEND.to_string())
    } else {
        (
            state.config.embedding_model.clone(),
            state
                .engine()
                .map_or_else(|| "none".to_string(), |e| e.name().to_string()),
        )
    };

    HealthResponse {
        status: "healthy",
        model,
        backend,
        version: env!("CARGO_PKG_VERSION"),
        uptime_s: state.uptime().as_secs(),
        sessions_loaded: state.sessions.loaded_count(),
        contexts: state.contexts.len(),
    }
}

fn unload(state: &ServerState, command: &Command) -> ServeResult<String> {
    let model = command
        .non_empty_field("model")
        .ok_or(ServeError::MissingInput("model"))?;
    let target = UnloadTarget::parse(model);

    let mut unloaded = false;
    for path in target.candidate_paths(&state.config) {
        unloaded |= state.sessions.release(&path);
    }

    let generation_paths = UnloadTarget::Generation.candidate_paths(&state.config);
    let touches_generation = target == UnloadTarget::Generation
        || target
            .candidate_paths(&state.config)
            .iter()
            .any(|p| generation_paths.contains(p));
    if unloaded && touches_generation {
        state.contexts.clear();
    }

    Ok(response_ok(&UnloadResponse {
        model: model.to_string(),
        unloaded,
    }))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::Value;

    use super::execute_line;
    use crate::config::ServerConfig;
    use crate::engine::scripted::ScriptedEngine;
    use crate::state::ServerState;
    use crate::tokenizer::tests::hello_tokenizer;

    fn stub_state() -> ServerState {
        ServerState::with_engine(
            ServerConfig {
                stub: true,
                ..ServerConfig::default()
            },
            None,
        )
    }

    fn engine_state(engine: &ScriptedEngine) -> ServerState {
        let state = ServerState::with_engine(ServerConfig::default(), Some(Arc::new(engine.clone())));
        state.install_tokenizer(hello_tokenizer());
        state
    }

    fn run(state: &mut ServerState, line: &str) -> Value {
        let out = execute_line(state, line).expect("one response line");
        assert!(!out.contains('\n'));
        serde_json::from_str(&out).expect("response is json")
    }

    fn counters(state: &mut ServerState) -> (u64, u64, u64, u64) {
        let m = run(state, r#"{"cmd":"metrics"}"#);
        (
            m["requests_total"].as_u64().expect("total"),
            m["requests_failed"].as_u64().expect("failed"),
            m["cache_hits"].as_u64().expect("hits"),
            m["cache_misses"].as_u64().expect("misses"),
        )
    }

    #[test]
    fn blank_lines_are_ignored() {
        let mut state = stub_state();
        assert!(execute_line(&mut state, "").is_none());
        assert!(execute_line(&mut state, "   \t").is_none());
        assert_eq!(counters(&mut state), (0, 0, 0, 0));
    }

    #[test]
    fn stub_health_and_capabilities() {
        let mut state = stub_state();
        let health = run(&mut state, r#"{"cmd":"health"}"#);
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["model"], "all-MiniLM-L6-v2-native-stub");
        assert_eq!(health["backend"], "native-stub");
        assert_eq!(health["sessions_loaded"], 0);

        let caps = run(&mut state, r#"{"cmd":"capabilities"}"#);
        assert_eq!(caps["providers"], serde_json::json!(["StubProvider"]));
    }

    #[test]
    fn embed_counts_and_classifies() {
        let mut state = stub_state();
        let resp = run(&mut state, r#"{"cmd":"embed","text":"hello"}"#);
        assert_eq!(resp["dimensions"], 384);
        assert_eq!(resp["embedding"].as_array().map(Vec::len), Some(384));

        let long = "y".repeat(64);
        run(&mut state, &format!(r#"{{"cmd":"embed","text":"{long}"}}"#));
        assert_eq!(counters(&mut state), (2, 0, 1, 1));
    }

    #[test]
    fn embed_without_text_fails_without_classification() {
        let mut state = stub_state();
        let resp = run(&mut state, r#"{"cmd":"embed","text":""}"#);
        assert_eq!(resp["error"], "missing input: text");
        let resp = run(&mut state, r#"{"cmd":"embed"}"#);
        assert_eq!(resp["error"], "missing input: text");
        assert_eq!(counters(&mut state), (2, 2, 0, 0));
    }

    #[test]
    fn identical_embeds_are_identical() {
        let mut state = stub_state();
        let a = run(&mut state, r#"{"cmd":"embed","text":"same words"}"#);
        let b = run(&mut state, r#"{"cmd":"embed","text":"same words"}"#);
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_command_changes_nothing() {
        let mut state = stub_state();
        let resp = run(&mut state, r#"{"cmd":"dance"}"#);
        assert_eq!(resp["error"], "unknown command: 'dance'");
        let resp = run(&mut state, r#"{"text":"no cmd"}"#);
        assert_eq!(resp["error"], "unknown command: ''");
        assert_eq!(counters(&mut state), (0, 0, 0, 0));
    }

    #[test]
    fn parse_errors_count_as_failures() {
        let mut state = stub_state();
        let resp = run(&mut state, "not json");
        assert_eq!(resp["error"], "parse error: expected a JSON object");
        let resp = run(&mut state, r#"{"cmd":"embed","text":"open"#);
        assert!(resp["error"]
            .as_str()
            .expect("message")
            .starts_with("parse error: unterminated string"));
        assert_eq!(counters(&mut state), (0, 2, 0, 0));
    }

    #[test]
    fn stub_generate_honours_max_tokens() {
        let mut state = stub_state();
        let resp = run(&mut state, r#"{"cmd":"generate","text":"hi","max_tokens":3}"#);
        assert_eq!(resp["text"], " [STUB: hi]");
        assert_eq!(resp["model"], "gpt2-stub");
        assert_eq!(resp["tokens_generated"], 3);

        let resp = run(&mut state, r#"{"cmd":"generate","text":"hi","stream":true}"#);
        assert_eq!(resp["tokens_generated"], 5);

        let resp = run(&mut state, r#"{"cmd":"generate","text":"hi","max_tokens":"x"}"#);
        assert_eq!(resp["error"], "invalid field max_tokens: 'x'");
        assert_eq!(counters(&mut state), (3, 1, 0, 0));
    }

    #[test]
    fn generate_without_text_is_missing_input() {
        let engine = ScriptedEngine::new(vec![7]);
        let mut state = engine_state(&engine);
        let resp = run(&mut state, r#"{"cmd":"generate","text":""}"#);
        assert_eq!(resp["error"], "missing input: text");
        assert!(state.sessions.is_empty());
        assert_eq!(counters(&mut state), (1, 1, 0, 0));
    }

    #[test]
    fn engine_generate_and_unload() {
        let engine = ScriptedEngine::new(vec![7, 10]);
        let mut state = engine_state(&engine);

        let resp = run(
            &mut state,
            r#"{"cmd":"generate","text":"hello","context_id":"c1"}"#,
        );
        assert_eq!(resp["tokens_generated"], 2);
        assert_eq!(resp["model"], "gpt2");

        let health = run(&mut state, r#"{"cmd":"health"}"#);
        assert_eq!(health["backend"], "scripted");
        assert_eq!(health["sessions_loaded"], 1);
        assert_eq!(health["contexts"], 1);

        let caps = run(&mut state, r#"{"cmd":"capabilities"}"#);
        assert_eq!(caps["providers"], serde_json::json!(["cpu"]));

        let resp = run(&mut state, r#"{"cmd":"unload","model":"generation"}"#);
        assert_eq!(resp["unloaded"], true);
        assert_eq!(resp["model"], "generation");
        assert_eq!(state.contexts.len(), 0);

        let resp = run(&mut state, r#"{"cmd":"unload","model":"generation"}"#);
        assert_eq!(resp["unloaded"], false);

        let resp = run(&mut state, r#"{"cmd":"unload"}"#);
        assert_eq!(resp["error"], "missing input: model");
        assert_eq!(counters(&mut state), (1, 0, 0, 0));
    }

    #[test]
    fn execution_errors_keep_the_session() {
        let mut engine = ScriptedEngine::new(vec![7]);
        engine.fail_forward = true;
        let mut state = engine_state(&engine);

        for _ in 0..2 {
            let resp = run(&mut state, r#"{"cmd":"generate","text":"hello"}"#);
            assert_eq!(resp["error"], "inference failed: scripted failure");
        }
        assert_eq!(engine.load_count(), 1);
        assert_eq!(state.sessions.loaded_count(), 1);
        assert_eq!(counters(&mut state), (2, 2, 0, 0));
    }

    #[test]
    fn panics_become_error_lines() {
        // An empty script makes the scripted graph divide by zero.
        let engine = ScriptedEngine::new(Vec::new());
        let mut state = engine_state(&engine);

        let resp = run(&mut state, r#"{"cmd":"generate","text":"hello"}"#);
        assert!(resp["error"]
            .as_str()
            .expect("message")
            .starts_with("internal error: "));

        let health = run(&mut state, r#"{"cmd":"health"}"#);
        assert_eq!(health["status"], "healthy");
        assert_eq!(counters(&mut state), (1, 1, 0, 0));
    }
}
