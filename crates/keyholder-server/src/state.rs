//! Application state shared across handlers.

use std::sync::Arc;

use keyholder_core::{Config, Forwarder, Provisioner, Registry};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    registry: Registry,
    forwarder: Forwarder,
    provisioner: Option<Provisioner>,
}

impl AppState {
    /// State around an existing registry.
    ///
    /// `provisioner` is `None` when this host has no Bluetooth central; the
    /// provision route then answers 503.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(
        config: Config,
        registry: Registry,
        provisioner: Option<Provisioner>,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("keyholder-server/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let forwarder = Forwarder::new(
            registry.clone(),
            client,
            config.forwarder.request_timeout(),
        );

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                registry,
                forwarder,
                provisioner,
            }),
        })
    }

    /// Loaded configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Device registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Command forwarder.
    #[must_use]
    pub fn forwarder(&self) -> &Forwarder {
        &self.inner.forwarder
    }

    /// Provisioning engine, when Bluetooth is available.
    #[must_use]
    pub fn provisioner(&self) -> Option<&Provisioner> {
        self.inner.provisioner.as_ref()
    }
}
