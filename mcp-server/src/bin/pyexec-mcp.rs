//! pyexec MCP server - stdio entry point.
//!
//! stdout carries protocol frames only; all logging goes to stderr.

use anyhow::{Context, Result};
use pyexec_mcp::{McpServer, ServerConfig};
use std::sync::Arc;
use supervisor::Supervisor;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServerConfig::parse_config();
    init_tracing(config.log_json);

    let manager = config.config_manager();
    let environment = manager
        .load(&config.overrides())
        .with_context(|| format!("Failed to load configuration from {}", manager.config_dir().display()))?;

    info!(
        interpreter = %environment.interpreter.display(),
        source = ?environment.interpreter_source,
        virtual_env = ?environment.virtual_env,
        fonts_dir = %environment.fonts_dir.display(),
        scratch_dir = %environment.scratch_dir.display(),
        prelude = environment.setup_prelude.is_some(),
        "Starting pyexec MCP server"
    );
    if !environment.in_virtual_env() {
        warn!("No virtual environment found, packages will be installed into the system interpreter");
    }

    let server = McpServer::from_supervisor(Arc::new(Supervisor::new(environment)));

    let interrupted = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
        info!("Interrupted, stopping running executions");
    };
    server
        .serve_until(tokio::io::stdin(), tokio::io::stdout(), interrupted)
        .await
        .context("Control channel failed")?;
    info!("Shutting down");

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr).with_ansi(false))
            .init();
    }
}
