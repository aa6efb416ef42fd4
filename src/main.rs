use anyhow::Result;
use axum::Router;
use clap::Parser;
use std::{io::ErrorKind, path::Path};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
#[cfg(test)]
mod testing;

use config::{Args, RunConfig, ServeConfig};
use services::{
    datastream_service::DatastreamService,
    migrator::{self, MigrationError},
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    run(Args::parse()).await
}

async fn run(args: Args) -> Result<()> {
    let Some(config) = args.config.as_deref() else {
        tracing::error!("No config file given. Usage: blob-sync [--serve] <CONFIG>");
        return Ok(());
    };

    if args.serve {
        return serve(&args, config).await;
    }

    // --- Batch migration ---
    tracing::info!("Starting migration with config: {}", config.display());
    match migrator::migrate(config).await {
        Ok(stats) => {
            println!("{}", stats);
            Ok(())
        }
        Err(MigrationError::ConfigUnreadable(err)) => {
            tracing::error!("Config file is unreadable: {:#}", err);
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

/// Run the live datastream API until the process is stopped.
async fn serve(args: &Args, config: &Path) -> Result<()> {
    let cfg = match RunConfig::load(config).await {
        Ok(cfg) => cfg,
        Err(err) => {
            tracing::error!("Config file is unreadable: {:#}", err);
            return Ok(());
        }
    };
    let serve_cfg = ServeConfig::from_env_and_args(args)?;
    tracing::info!("Starting datastream service with {:?}", serve_cfg);

    // --- Ensure staging directory exists ---
    let staging_dir = &cfg.datastream.staging_dir;
    if !staging_dir.exists() {
        tokio::fs::create_dir_all(staging_dir).await?;
        tracing::info!("Created staging directory at {}", staging_dir.display());
    }

    // --- Initialize core service ---
    let service = DatastreamService::from_config(&cfg).await?;

    // --- Build router ---
    let app: Router = routes::routes::routes().with_state(service);

    // --- Start server ---
    let addr = serve_cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(serve_cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", serve_cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
