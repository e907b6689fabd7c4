use std::io;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use ns_llm_native::{serve, ServerConfig, ServerState};

const USAGE: &str = "\
usage: ns-llm-native [--stub] [--config <path>]

Reads one JSON command per line on stdin and writes one JSON response per
line on stdout. Diagnostics go to stderr (filter with RUST_LOG).

  --stub             deterministic fallbacks, no model artifacts needed
  --config <path>    TOML configuration file
  -h, --help         print this help
  -V, --version      print the version";

#[derive(Debug, Default, PartialEq, Eq)]
struct CliArgs {
    stub: bool,
    config: Option<PathBuf>,
    unknown: Vec<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum CliAction {
    Serve(CliArgs),
    Help,
    Version,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CliAction> {
    let mut parsed = CliArgs::default();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--stub" => parsed.stub = true,
            "--config" => {
                let Some(path) = args.next() else {
                    bail!("--config requires a path");
                };
                parsed.config = Some(PathBuf::from(path));
            }
            "-h" | "--help" => return Ok(CliAction::Help),
            "-V" | "--version" => return Ok(CliAction::Version),
            _ => match arg.strip_prefix("--config=") {
                Some(path) if !path.is_empty() => parsed.config = Some(PathBuf::from(path)),
                _ => parsed.unknown.push(arg),
            },
        }
    }

    Ok(CliAction::Serve(parsed))
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "ns_llm_native=info".into()),
        )
        .with(fmt::layer().with_writer(io::stderr).with_ansi(false))
        .init();
}

fn main() -> Result<()> {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(CliAction::Serve(args)) => args,
        Ok(CliAction::Help) => {
            println!("{USAGE}");
            return Ok(());
        }
        Ok(CliAction::Version) => {
            println!("ns-llm-native {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        Err(e) => {
            eprintln!("{e}\n\n{USAGE}");
            std::process::exit(2);
        }
    };

    init_tracing();
    for arg in &args.unknown {
        tracing::warn!(%arg, "ignoring unknown argument");
    }

    let mut config =
        ServerConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if args.stub {
        config.stub = true;
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        stub = config.stub,
        models_dir = %config.models_dir.display(),
        "ns-llm native server starting"
    );

    let mut state = ServerState::new(config);
    if state.engine().is_none() && !state.is_stub() {
        tracing::warn!("no inference engine compiled in; only stub answers are available");
    }

    let stdin = io::stdin();
    let stdout = io::stdout();
    serve(&mut state, stdin.lock(), stdout.lock()).context("protocol stream failed")?;

    let metrics = state.metrics.snapshot();
    tracing::info!(
        requests = metrics.requests_total,
        failed = metrics.requests_failed,
        "shutting down"
    );
    Ok(())
}
