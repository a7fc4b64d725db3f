//! The nine operations exposed to MCP clients. Each method just marshals
//! strings in and out; every bit of actual session logic lives in
//! `kmux_core::Registry`.

use std::sync::Arc;
use std::time::Duration;

use rmcp::model::{Implementation, ProtocolVersion, ServerCapabilities, ServerInfo};
use rmcp::{tool, ServerHandler};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::error;

use kmux_core::Registry;

use crate::params::{
    ExecuteCommandParams, SendKeysParams, SessionIdParams, SnapshotParams, UpdateSessionDescriptionParams,
    UpdateSessionLabelParams,
};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct EmptyParams {}

#[derive(Debug, Clone)]
pub struct KmuxTools {
    registry: Arc<Registry>,
}

impl KmuxTools {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }
}

#[tool(tool_box)]
impl KmuxTools {
    #[tool(description = "Creates a new zsh session under a PTY and returns its numeric id.")]
    pub async fn create_session(&self, #[tool(aggr)] _params: EmptyParams) -> String {
        match self.registry.create_session().await {
            Ok(id) => format!("New zsh session created with Session ID: {id}."),
            Err(e) => {
                error!(error = %e, "create_session failed");
                format!("Error creating session: {e}")
            }
        }
    }

    #[tool(description = "Lists every active session with its label, description, and current status.")]
    pub async fn list_sessions(&self, #[tool(aggr)] _params: EmptyParams) -> String {
        self.registry.list_sessions().await
    }

    #[tool(description = "Sets a session's short human-readable label.")]
    pub async fn update_session_label(&self, #[tool(aggr)] params: UpdateSessionLabelParams) -> String {
        match self.registry.update_session_label(params.session_id, params.label.clone()).await {
            Ok(()) => format!("Session {} label set to \"{}\".", params.session_id, params.label),
            Err(e) => format!("Error updating label: {e}"),
        }
    }

    #[tool(description = "Sets a session's free-form description.")]
    pub async fn update_session_description(&self, #[tool(aggr)] params: UpdateSessionDescriptionParams) -> String {
        match self
            .registry
            .update_session_description(params.session_id, params.description.clone())
            .await
        {
            Ok(()) => format!("Session {} description updated.", params.session_id),
            Err(e) => format!("Error updating description: {e}"),
        }
    }

    #[tool(description = "Submits a command line to the session and waits for the shell to go idle again, \
                           up to the given timeout. Reports the command's output, or that it's still \
                           awaiting input/completion.")]
    pub async fn execute_command(&self, #[tool(aggr)] params: ExecuteCommandParams) -> String {
        let timeout = Duration::from_secs_f64(params.timeout_seconds);
        match self.registry.execute_command(params.session_id, &params.command, timeout).await {
            Ok(message) => message,
            Err(e) => {
                error!(session_id = params.session_id, error = %e, "execute_command failed");
                format!("Error executing command: {e}")
            }
        }
    }

    #[tool(description = "Writes raw bytes directly to the session's PTY, unframed: use for control \
                           sequences like Ctrl-C rather than a line of input.")]
    pub async fn send_keys(&self, #[tool(aggr)] params: SendKeysParams) -> String {
        match self.registry.send_keys(params.session_id, params.keys.as_bytes()).await {
            Ok(()) => format!("Keys sent to session {}.", params.session_id),
            Err(e) => format!("Error sending keys: {e}"),
        }
    }

    #[tool(description = "Submits the configured privileged password to a session waiting on a sudo prompt.")]
    pub async fn enter_root_password(&self, #[tool(aggr)] params: SessionIdParams) -> String {
        match self.registry.enter_root_password(params.session_id).await {
            Ok(()) => format!("Password submitted to session {}.", params.session_id),
            Err(e) => format!("Error submitting password: {e}"),
        }
    }

    #[tool(description = "Renders a text snapshot of the session's terminal screen: either just the \
                           window since the previous completed command, or the entire buffer.")]
    pub async fn snapshot(&self, #[tool(aggr)] params: SnapshotParams) -> String {
        match self.registry.snapshot(params.session_id, params.include_all).await {
            Ok(message) => message,
            Err(e) => format!("Error taking snapshot: {e}"),
        }
    }

    #[tool(description = "Stops and removes a session.")]
    pub async fn delete_session(&self, #[tool(aggr)] params: SessionIdParams) -> String {
        match self.registry.delete_session(params.session_id).await {
            Ok(message) => message,
            Err(e) => format!("Error deleting session: {e}"),
        }
    }
}

#[tool(tool_box)]
impl ServerHandler for KmuxTools {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Block-structured zsh sessions. Create a session, submit commands through \
                 execute_command, and get back exactly the output of the command that just ran \
                 instead of a raw terminal dump."
                    .into(),
            ),
        }
    }
}
