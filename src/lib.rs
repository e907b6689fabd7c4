//! Process-resident inference server speaking a newline-delimited JSON
//! protocol on stdin/stdout.

pub mod commands;
pub mod config;
pub mod context_cache;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod generation;
pub mod session;
pub mod state;
pub mod tokenizer;
pub mod transport;

pub use config::ServerConfig;
pub use error::{ServeError, ServeResult};
pub use state::ServerState;
pub use transport::serve;
