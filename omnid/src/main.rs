//! OmniProjectSync remote agent.
//!
//! Serves project activation/deactivation, one-shot commands and
//! multiplexed interactive sessions to the mobile client and the IDE peer.

#![forbid(unsafe_code)]

mod activation;
mod auth;
mod command;
mod context;
mod events;
mod fsops;
mod http_api;
mod ledger;
mod locks;
mod peer;
mod registry;
mod sessions;
mod software;
mod studio;
mod ws;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use omni_common::config::expand_path;
use omni_common::{AgentConfig, EnvParser, LogConfig, init_logging};
use tokio::net::TcpListener;
use tracing::{info, warn};

use context::AgentContext;

#[derive(Parser)]
#[command(name = "omnid")]
#[command(author, version, about = "OmniProjectSync remote agent")]
struct Cli {
    /// Path to the TOML config file
    #[arg(short, long, env = "OMNI_CONFIG")]
    config: Option<PathBuf>,

    /// Address to bind
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory holding Local projects
    #[arg(long)]
    workspace_root: Option<String>,

    /// Directory holding Cloud projects
    #[arg(long)]
    backup_root: Option<String>,

    /// Log filter (e.g. `info`, `omnid=debug`)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Print the effective configuration (token masked) and exit
    #[arg(long)]
    print_config: bool,
}

impl Cli {
    fn apply(&self, config: &mut AgentConfig) {
        if let Some(bind) = &self.bind {
            config.server.bind_host = bind.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(root) = &self.workspace_root {
            config.paths.workspace_root = expand_path(root);
        }
        if let Some(root) = &self.backup_root {
            config.paths.backup_root = Some(expand_path(root));
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AgentConfig::load(cli.config.as_deref())?;
    config.apply_env(&mut EnvParser::new())?;
    cli.apply(&mut config);

    if cli.print_config {
        print!(
            "{}",
            toml::to_string_pretty(&config.masked()).context("rendering config")?
        );
        return Ok(());
    }

    let generated_token = config.ensure_token();

    let mut log_config = LogConfig::from_env("info")
        .with_stderr()
        .with_json(cli.json_logs)
        .with_file(config.state_dir().join("logs"));
    if let Some(level) = &cli.log_level {
        log_config = log_config.with_level(level);
    }
    let _log_guards = init_logging(&log_config)?;

    info!(version = env!("CARGO_PKG_VERSION"), "Starting OmniProjectSync agent...");
    if generated_token {
        warn!(token = %config.auth.token, "no access token configured; generated one for this run");
    }
    info!(
        workspace = %config.paths.workspace_root.display(),
        backup = ?config.paths.backup_root,
        "project roots"
    );

    let addr = format!("{}:{}", config.server.bind_host, config.server.port);
    let ctx = Arc::new(AgentContext::new(config)?);

    match ctx.registry.records() {
        Ok(records) => info!(projects = records.len(), "registry reconciled"),
        Err(e) => warn!(error = %e, "initial registry scan failed"),
    }
    info!(enabled = ctx.peer.is_enabled(), "IDE peer");
    let _presence = events::spawn_presence_log(&ctx.events);

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("Listening on {}", addr);

    axum::serve(listener, http_api::create_router(ctx))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving HTTP")?;

    info!("Agent stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
