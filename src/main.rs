//! Cued-drawing stimulus server: binary entrypoint.
//! Boots the Axum HTTP server with the stimulus pool, results sink, and session socket.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use cued_drawing_server::config::{ServerConfig, StoreBackend};
use cued_drawing_server::metrics::Metrics;
use cued_drawing_server::pool::memory::MemoryStore;
use cued_drawing_server::pool::mongo::{connect_with_retry, MongoStore};
use cued_drawing_server::telemetry::init_tracing;
use cued_drawing_server::{app, build_state, load_fallback};

#[derive(Parser, Debug)]
#[command(name = "cued-drawing-server", about = "Stimulus pool and results store for cued drawing experiments")]
struct Args {
    /// Port to listen on; overrides the config file and $PORT.
    #[arg(long)]
    gameport: Option<u16>,

    /// Path to the server TOML config.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let args = Args::parse();
    let mut cfg = ServerConfig::load(args.config.as_deref()).context("loading server config")?;
    if let Some(port) = args.gameport {
        cfg.server.port = port;
    }

    let fallback = load_fallback(&cfg);
    let metrics = if cfg.server.metrics {
        Some(Metrics::init().context("installing prometheus recorder")?)
    } else {
        None
    };

    let mut mongo: Option<MongoStore> = None;
    let state = match cfg.store.backend {
        StoreBackend::Memory => {
            let store = match cfg.store.seed_path.as_deref() {
                Some(p) => MemoryStore::from_seed_file(p)?,
                None => MemoryStore::new(),
            };
            info!(pools = store.pool_names().len(), "using in-memory stimulus store");
            build_state(&cfg, Arc::new(store), fallback)
        }
        StoreBackend::Mongo => {
            let store = connect_with_retry(&cfg.store.uri, cfg.store.connect_retry()).await;
            mongo = Some(store.clone());
            build_state(&cfg, Arc::new(store), fallback)
        }
    };

    let router = app(&cfg, state, metrics.as_ref());
    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.server.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, mode = ?cfg.assign.mode, "http server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    if let Some(store) = mongo {
        store.close().await;
        info!("mongodb connection closed");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
