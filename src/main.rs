//!
//! OCPP 1.6 central management station with a session engine that keeps
//! charging sessions alive across transport disconnects.
//! Reads configuration from TOML file (~/.config/ocpp-csms/config.toml).

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};

use ocpp_csms::commands::CommandRelay;
use ocpp_csms::config::{default_config_path, AppConfig};
use ocpp_csms::events::ObserverHub;
use ocpp_csms::gateway::CsmsServer;
use ocpp_csms::session::SessionRegistry;
use ocpp_csms::sim::SimulationEngine;
use ocpp_csms::storage::{InMemoryStorage, Storage};
use ocpp_csms::support::ShutdownSignal;
use ocpp_csms::tags::{InMemoryTagBridge, SharedTagBridge, TagBridge};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // ── Load configuration ─────────────────────────────────────
    let config_path = std::env::var("OCPP_CSMS_CONFIG")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| default_config_path());
    let config = match AppConfig::load(&config_path) {
        Ok(cfg) => {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.logging.level)),
                )
                .init();
            info!("Configuration loaded from {}", config_path.display());
            cfg
        }
        Err(e) => {
            tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
                .init();
            warn!("Failed to load config: {}. Using defaults.", e);
            AppConfig::default()
        }
    };

    info!("Starting OCPP central management station...");

    // ── Shared infrastructure ──────────────────────────────────
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
    let registry = SessionRegistry::shared();
    let hub = ObserverHub::shared();

    let (trigger_tx, mut trigger_rx) = tokio::sync::mpsc::unbounded_channel();
    let tags: SharedTagBridge = Arc::new(InMemoryTagBridge::new(Some(trigger_tx)));

    // tags for stations already on record
    match storage.list_stations().await {
        Ok(stations) => {
            for station in stations {
                tags.create_tags_for(&station.id).await;
            }
        }
        Err(e) => warn!("Failed to list persisted stations: {}", e),
    }

    let relay = Arc::new(CommandRelay::new(
        registry.clone(),
        storage.clone(),
        hub.clone(),
        tags.clone(),
        Duration::from_millis(config.simulation.settle_delay_ms),
    ));

    // tag writes from the integration side become operator commands
    let trigger_relay = relay.clone();
    tokio::spawn(async move {
        while let Some(trigger) = trigger_rx.recv().await {
            trigger_relay.handle_trigger(trigger).await;
        }
    });

    // ── Simulation and heartbeat loops ─────────────────────────
    let shutdown = ShutdownSignal::new();
    let engine = Arc::new(SimulationEngine::new(
        registry.clone(),
        hub.clone(),
        tags.clone(),
        config.simulation.clone(),
    ));
    tokio::spawn(engine.clone().run(shutdown.clone()));
    tokio::spawn(engine.run_heartbeat(shutdown.clone()));

    // ── Ctrl+C handling ────────────────────────────────────────
    let ctrlc_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, shutting down");
            ctrlc_shutdown.trigger();
        }
    });

    // ── Gateway ────────────────────────────────────────────────
    let server = Arc::new(CsmsServer::new(
        config,
        registry,
        storage,
        hub,
        tags,
        relay,
        shutdown.clone(),
    ));
    info!("Press Ctrl+C to shut down gracefully");
    if let Err(e) = server.run().await {
        error!("Gateway error: {}", e);
        return Err(e.into());
    }

    info!("Shutdown complete");
    Ok(())
}
