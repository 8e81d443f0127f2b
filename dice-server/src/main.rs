//! `dice-server` binary: parse flags, install logging, and run the server
//! until Ctrl-C.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use dice_engine::MemoryEngine;
use dice_server::{server, Cli, ServerConfig, ServerError};

#[tokio::main]
async fn main() -> ExitCode {
    let config = ServerConfig::from(Cli::parse());
    init_tracing(&config.log_filter);

    info!(endpoint = %config.endpoint(), "rolling the dice");
    match serve(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("server stopped: {err:#}");
            let code = err
                .downcast_ref::<ServerError>()
                .map_or(1, ServerError::exit_code);
            ExitCode::from(code)
        }
    }
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn serve(config: ServerConfig) -> anyhow::Result<()> {
    let engine = Arc::new(MemoryEngine::new());
    let expirer = engine
        .start_expirer(config.expire_interval)
        .context("failed to start the expirer")?;

    let listener = server::bind(&config).await?;
    server::run(listener, Arc::clone(&engine), config, shutdown_signal()).await?;

    expirer.stop();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "cannot listen for Ctrl-C; running until killed");
        std::future::pending::<()>().await;
    }
}
