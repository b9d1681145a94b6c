// ABOUTME: Server binary wiring configuration, storage, and routes together
// ABOUTME: Starts the HTTP listener and the background sweeper
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Tidemark

//! # Tidemark Server Binary
//!
//! Starts the chat streaming backend: loads configuration, opens the
//! database, assembles the router, spawns the sweeper, and serves HTTP.

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tidemark_server::{
    auth::AuthManager,
    config::environment::ServerConfig,
    crypto::KeyVault,
    database::Database,
    logging::LoggingConfig,
    resources::ServerResources,
    routes, sweeper,
};
use tracing::info;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "tidemark-server")]
#[command(about = "Tidemark - durable AI chat streaming backend")]
struct Args {
    /// Override HTTP port
    #[arg(long)]
    http_port: Option<u16>,

    /// Print a development bearer token for the given email and exit
    #[arg(long)]
    mint_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    LoggingConfig::from_env()
        .init()
        .context("Failed to initialize logging")?;

    let mut config = ServerConfig::from_env()?;
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    let config = Arc::new(config);

    let auth_manager = AuthManager::new(config.token_secret.as_bytes(), 24);

    // Dev convenience: mint a token the way the external identity
    // provider would, then exit
    if let Some(email) = args.mint_token {
        let token = auth_manager
            .generate_token(Uuid::new_v4(), &email)
            .map_err(|e| anyhow::anyhow!("{e}"))?;
        println!("{token}");
        return Ok(());
    }

    let database = Database::new(&config.database_url)
        .await
        .map_err(|e| anyhow::anyhow!("Database init failed: {e}"))?;

    let key_vault = KeyVault::load_or_generate(config.master_key.as_deref())
        .map_err(|e| anyhow::anyhow!("Key vault init failed: {e}"))?;

    let resources = Arc::new(ServerResources::new(
        database.clone(),
        auth_manager,
        key_vault,
        Arc::clone(&config),
    ));

    sweeper::spawn(database, config.sweep_interval, config.stream_max_age);

    let app = routes::router(resources);
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.http_port));

    info!(%addr, "Tidemark server listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Server stopped");
    Ok(())
}

/// Resolve on ctrl-c or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        if let Ok(mut signal) =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            signal.recv().await;
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    info!("Shutdown signal received");
}
