//! Line protocol spoken by the native inference server.
//!
//! Requests are flat JSON-like objects, one per line, with a `cmd`
//! discriminator. Responses are single-line JSON objects; failures are always
//! `{"error": "..."}` with no other fields.

mod command;
mod response;

pub use command::{parse_line, Command, CommandKind, ProtocolError};
pub use response::{
    response_err, response_ok, CapabilitiesResponse, EmbedLoadedResponse, EmbedResponse,
    ErrorResponse, GenerateResponse, HealthResponse, MetricsResponse, UnloadResponse,
};
