//! FedFleet round coordinator: WebSocket endpoint, session registry and
//! round engine wiring.

use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use fedfleet_core::config::CoordinatorConfig;
use fedfleet_core::device::{DeviceDirectory, DeviceRoster};
use fedfleet_core::fanout::Fanout;
use fedfleet_core::round::RoundEngine;
use fedfleet_core::store::{MemoryStore, TrainStore};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};

mod store_sled;
mod ws;

use store_sled::SledStore;

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<CoordinatorConfig>,
    pub store: Arc<dyn TrainStore>,
    pub directory: Arc<dyn DeviceDirectory>,
    pub fanout: Arc<Fanout>,
    pub engine: Arc<RoundEngine>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cfg = CoordinatorConfig::from_env();
    info!(?cfg, "starting coordinator");

    let directory: Arc<dyn DeviceDirectory> = match &cfg.roster_file {
        Some(path) => match DeviceRoster::load(path) {
            Ok(roster) => {
                info!(path = %path.display(), devices = roster.len(), "device roster loaded");
                Arc::new(roster)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "roster load failed - starting with an empty roster");
                Arc::new(DeviceRoster::empty())
            }
        },
        None => {
            warn!("no roster configured - every credential will be rejected");
            Arc::new(DeviceRoster::empty())
        }
    };

    let store: Arc<dyn TrainStore> = match &cfg.db_path {
        Some(path) => match SledStore::open(path) {
            Ok(s) => Arc::new(s),
            Err(e) => {
                warn!(error = ?e, "sled open failed - running ephemeral");
                Arc::new(MemoryStore::new())
            }
        },
        None => {
            info!("no db path configured - sessions are in-memory only");
            Arc::new(MemoryStore::new())
        }
    };

    let fanout = Arc::new(Fanout::new());
    let engine = RoundEngine::new(store.clone(), fanout.clone(), cfg.round_timeout);
    let state = AppState {
        cfg: Arc::new(cfg.clone()),
        store,
        directory,
        fanout,
        engine,
    };

    let app = Router::new()
        .route("/ws/train_model", get(ws::upgrade))
        .route("/live", get(|| async { Json(json!({"live": true})) }))
        .route("/ready", get(|| async { Json(json!({"ready": true})) }))
        .route("/status", get(status))
        .with_state(state);

    let listener = TcpListener::bind(cfg.listen_addr).await?;
    info!(addr = %cfg.listen_addr, "coordinator listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("shutdown");
    Ok(())
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": "fedfleet-coordinator",
        "version": env!("CARGO_PKG_VERSION"),
        "active_sessions": state.engine.active_sessions(),
        "connections": state.fanout.connection_count(),
    }))
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    info!("shutdown signal received");
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
