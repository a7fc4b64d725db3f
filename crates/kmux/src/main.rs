//! Binary entry point: parses CLI args, stands up the session registry, and
//! serves the tool surface over MCP on stdio.

mod cli;
mod params;
mod telemetry;
mod tools;

use std::sync::Arc;

use clap::Parser;
use rmcp::transport::stdio;
use rmcp::ServiceExt;
use tracing::info;

use kmux_core::{Registry, RegistryConfig, ScreenSize};

use cli::Args;
use tools::KmuxTools;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let _telemetry = telemetry::init_tracing(args.verbose);

    let config = RegistryConfig {
        session_startup_timeout: args.session_startup_timeout(),
        general_tool_call_timeout: args.general_tool_call_timeout(),
        screen_size: ScreenSize { rows: args.rows, cols: args.cols },
        root_password: args.root_password.clone(),
        zsh_override: args.shell.clone(),
    };

    let registry = Registry::new(config);
    let _reaper = registry.spawn_reaper();

    info!(rows = args.rows, cols = args.cols, "kmux starting");

    let service = KmuxTools::new(Arc::clone(&registry)).serve(stdio()).await?;
    service.waiting().await?;

    registry.stop().await;
    Ok(())
}
