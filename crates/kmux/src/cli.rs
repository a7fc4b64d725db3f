//! Command-line argument parsing using clap.

use std::time::Duration;

use clap::Parser;

/// kmux - block-structured terminal multiplexer for language-model agents, served over MCP.
#[derive(Parser, Debug, Clone)]
#[command(name = "kmux")]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Password sent by `enter_root_password`; without it the tool call fails.
    #[arg(long, env = "KMUX_ROOT_PASSWORD")]
    pub root_password: Option<String>,

    /// Path to a specific zsh binary, overriding `$SHELL` detection.
    #[arg(long, env = "KMUX_SHELL")]
    pub shell: Option<String>,

    /// Virtual screen rows used to size every session's PTY and renderer.
    #[arg(long, env = "KMUX_ROWS", default_value_t = 24)]
    pub rows: u16,

    /// Virtual screen columns used to size every session's PTY and renderer.
    #[arg(long, env = "KMUX_COLS", default_value_t = 80)]
    pub cols: u16,

    /// Seconds allowed for a newly created session's shell to finish starting.
    #[arg(long, env = "KMUX_SESSION_STARTUP_TIMEOUT_SECONDS", default_value_t = 10.0)]
    pub session_startup_timeout_seconds: f64,

    /// Seconds allowed for any non-`execute_command` tool call before it is
    /// reported as timed out with the underlying state unknown.
    #[arg(long, env = "KMUX_TOOL_CALL_TIMEOUT_SECONDS", default_value_t = 5.0)]
    pub general_tool_call_timeout_seconds: f64,

    /// Verbose console logging (debug level for the kmux crates).
    #[arg(short = 'v', long)]
    pub verbose: bool,
}

impl Args {
    pub fn session_startup_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.session_startup_timeout_seconds)
    }

    pub fn general_tool_call_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.general_tool_call_timeout_seconds)
    }
}
