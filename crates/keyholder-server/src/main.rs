//! # keyholder-server
//!
//! Control-surface proxy for keyholder lock devices.
//!
//! This binary provides:
//! - mDNS radar sweep and BLE scanning into one device registry
//! - Health probing with strike-based eviction and a staleness backstop
//! - REST API for provisioning, device management and lock sessions
//! - Structured logging to file and stdout
//!
//! ## Running
//!
//! ```bash
//! # Development
//! cargo run --package keyholder-server
//!
//! # Production
//! KEYHOLDER__SERVER__PRODUCTION=true ./keyholder-server
//! ```

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use keyholder_core::provisioning::SERVICE_UUID;
use keyholder_core::{
    BleCentral, BleScanner, Config, HealthMonitor, MdnsListener, Provisioner, Registry,
    ScanControl, StalenessPruner, TimerSet,
};
use keyholder_server::api;
use keyholder_server::logging::{self, LogMode};
use keyholder_server::state::AppState;

/// Recurring background subsystems owned by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Subsystem {
    RadarSweep,
    BleScan,
    HealthMonitor,
    StalenessPruner,
}

fn main() -> anyhow::Result<()> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(run())
}

async fn run() -> anyhow::Result<()> {
    let config = Config::load(None)?;
    logging::init(LogMode::from_production_flag(config.server.production))?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        service_type = %config.discovery.service_type,
        "Starting keyholder-server"
    );

    let registry = Registry::new();
    let scan = ScanControl::new();
    let mut subsystems = TimerSet::new();

    if config.discovery.mdns_enabled {
        match MdnsListener::new(
            registry.clone(),
            &config.discovery.service_type,
            config.discovery.sweep_interval(),
        ) {
            Ok(listener) => subsystems.arm(Subsystem::RadarSweep, listener.run()),
            Err(e) => warn!(error = %e, "mDNS unavailable; ready devices will not be discovered"),
        }
    }

    let central = if config.discovery.ble_enabled {
        bluetooth_central().await
    } else {
        None
    };
    let provisioner = central.map(|central| {
        let scanner = BleScanner::new(
            Arc::clone(&central),
            registry.clone(),
            scan.clone(),
            SERVICE_UUID,
            config.discovery.sweep_interval(),
        );
        subsystems.arm(Subsystem::BleScan, scanner.run());
        Provisioner::new(central, registry.clone(), scan.clone())
    });

    let probe_client = reqwest::Client::builder()
        .user_agent(concat!("keyholder-server/", env!("CARGO_PKG_VERSION")))
        .build()?;
    subsystems.arm(
        Subsystem::HealthMonitor,
        HealthMonitor::new(registry.clone(), probe_client, &config.health).run(),
    );
    subsystems.arm(
        Subsystem::StalenessPruner,
        StalenessPruner::new(registry.clone(), &config.health).run(),
    );
    info!(subsystems = ?subsystems.active(), "Background subsystems running");

    let listener = TcpListener::bind(&config.server.bind).await?;
    info!(addr = %listener.local_addr()?, "Listening");

    let app = api::create_router(AppState::new(config, registry, provisioner)?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    subsystems.cancel_all();
    info!("keyholder-server stopped");
    Ok(())
}

#[cfg(feature = "bluetooth")]
async fn bluetooth_central() -> Option<Arc<dyn BleCentral>> {
    match keyholder_core::BluerCentral::new().await {
        Ok(central) => Some(Arc::new(central)),
        Err(e) => {
            warn!(error = %e, "Bluetooth unavailable; provisioning disabled");
            None
        }
    }
}

#[cfg(not(feature = "bluetooth"))]
async fn bluetooth_central() -> Option<Arc<dyn BleCentral>> {
    warn!("Built without Bluetooth support; provisioning disabled");
    None
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("Shutdown signal received");
}
