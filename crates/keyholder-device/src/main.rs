//! Keyholder reference device.
//!
//! Runs the lock session state machine behind the device-facing HTTP API and
//! announces itself as `_keyholder._tcp.local.` so the control surface can
//! find it.
//!
//! # Environment Variables
//!
//! - `KEYHOLDER_CONFIG`: Optional. Path to the TOML configuration file
//! - `KEYHOLDER__DEVICE__BIND`: Optional. Listen address (default: 0.0.0.0:8080)
//! - `KEYHOLDER__DEVICE__NAME`: Optional. Announced name (default: Keyholder)
//! - `RUST_LOG`: Optional. Logging level (default: info)

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]

use anyhow::{Context, Result};
use mdns_sd::ServiceDaemon;
use tokio::net::TcpListener;
use tracing::{info, warn};

use keyholder_core::discovery::register_service;
use keyholder_core::{Config, Storage};
use keyholder_device::{api, DeviceIdentity, DeviceRuntime};

/// Compact logs on stderr.
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("info,keyholder_device=debug,keyholder_core::session=debug")
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .compact()
                .with_target(true)
                .with_file(false)
                .with_line_number(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

/// Instance name unique on the link: the display name plus a MAC or pid suffix.
fn instance_name(name: &str, mac: Option<&str>) -> String {
    let base: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let suffix = mac.map_or_else(
        || format!("{:x}", std::process::id()),
        |mac| {
            let hex = mac.replace(':', "").to_ascii_lowercase();
            hex.get(6..).unwrap_or(&hex).to_string()
        },
    );
    format!("{base}-{suffix}")
}

fn main() -> Result<()> {
    init_logging();
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?
        .block_on(run())
}

async fn run() -> Result<()> {
    let config = Config::load(None).context("Failed to load configuration")?;
    info!(name = %config.device.name, "Keyholder device starting");

    let storage = match &config.device.data_dir {
        Some(dir) => Storage::new(dir.clone()),
        None => Storage::at_default_location().context("No data directory")?,
    };
    info!(data_dir = %storage.data_dir().display(), "Using data directory");

    let identity = DeviceIdentity {
        name: config.device.name.clone(),
        mac: config.device.mac.clone(),
    };
    let runtime = DeviceRuntime::boot(config.session.clone(), identity, Some(storage))
        .await
        .context("Failed to restore device state")?;

    let listener = TcpListener::bind(&config.device.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.device.bind))?;
    let port = listener.local_addr()?.port();
    info!(port, "Device API listening");

    let daemon = if config.device.announce {
        let daemon = ServiceDaemon::new().context("Failed to start mDNS daemon")?;
        let instance = instance_name(&config.device.name, config.device.mac.as_deref());
        register_service(
            &daemon,
            &config.discovery.service_type,
            &instance,
            port,
            &config.device.name,
            config.device.mac.as_deref(),
        )?;
        Some(daemon)
    } else {
        None
    };

    axum::serve(listener, api::router(runtime.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    runtime.shutdown().await;
    if let Some(daemon) = daemon {
        if let Err(e) = daemon.shutdown() {
            warn!(error = %e, "mDNS daemon did not shut down cleanly");
        }
    }
    info!("Keyholder device stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(mut sigint), Ok(mut sigterm)) => {
                tokio::select! {
                    _ = sigint.recv() => info!("Received SIGINT, shutting down"),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
                }
            }
            _ => {
                warn!("Signal handlers unavailable; falling back to ctrl-c");
                if tokio::signal::ctrl_c().await.is_err() {
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    }
}
