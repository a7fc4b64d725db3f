//! Parameter structs for the MCP tool surface. Each mirrors one operation
//! named in the tool-call surface.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

fn default_command_timeout_seconds() -> f64 {
    30.0
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SessionIdParams {
    #[schemars(description = "Numeric id returned by create_session")]
    pub session_id: u64,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct UpdateSessionLabelParams {
    #[schemars(description = "Numeric id returned by create_session")]
    pub session_id: u64,
    #[schemars(description = "Short human-readable label for the session")]
    pub label: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct UpdateSessionDescriptionParams {
    #[schemars(description = "Numeric id returned by create_session")]
    pub session_id: u64,
    #[schemars(description = "Free-form description of what the session is for")]
    pub description: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ExecuteCommandParams {
    #[schemars(description = "Numeric id returned by create_session")]
    pub session_id: u64,
    #[schemars(description = "Command text to submit, as if typed and followed by Enter")]
    pub command: String,
    #[serde(default = "default_command_timeout_seconds")]
    #[schemars(description = "Seconds to wait for the shell to return to an idle prompt before reporting a timeout")]
    pub timeout_seconds: f64,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SendKeysParams {
    #[schemars(description = "Numeric id returned by create_session")]
    pub session_id: u64,
    #[schemars(description = "Raw bytes to write to the session, unframed (e.g. \"\\u0003\" for Ctrl-C)")]
    pub keys: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SnapshotParams {
    #[schemars(description = "Numeric id returned by create_session")]
    pub session_id: u64,
    #[serde(default)]
    #[schemars(description = "If true, render the entire session buffer instead of just the last command's window")]
    pub include_all: bool,
}
