//! Session runtime.
//!
//! Owns the [`SessionMachine`] together with its single phase ticker. After
//! every command or tick that changes phase, the runtime cancels all timers
//! and arms exactly one 1-second ticker for the new timer kind, tagged with
//! the machine's epoch. Phase changes are appended to the event log and
//! persisted.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use keyholder_core::session::{RewardView, SessionCommand, TickOutcome, TimerKind, Transition};
use keyholder_core::storage::StorageError;
use keyholder_core::{
    AbortSource, DeviceDetails, DeviceFeatures, KeyholderError, LogLine, PersistedDevice, Phase,
    SessionError, SessionLimits, SessionMachine, SessionStatus, Storage, TimerSet,
    WifiCredentials,
};

use crate::event_log::EventLog;

const TICK: Duration = Duration::from_secs(1);

/// Static identity reported by `GET /details`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Display name, also announced over mDNS.
    pub name: String,
    /// MAC address, when configured.
    pub mac: Option<String>,
}

struct Inner {
    machine: SessionMachine,
    timers: TimerSet<TimerKind>,
    log: EventLog,
    storage: Option<Storage>,
    identity: DeviceIdentity,
    wifi_ssid: Option<String>,
}

/// Shared handle to the device's session runtime.
#[derive(Clone)]
pub struct DeviceRuntime {
    inner: Arc<Mutex<Inner>>,
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

const fn busy(action: &'static str, phase: Phase) -> SessionError {
    SessionError::WrongPhase { action, phase }
}

impl DeviceRuntime {
    /// Runtime around an already-built machine.
    #[must_use]
    pub fn new(
        machine: SessionMachine,
        identity: DeviceIdentity,
        wifi_ssid: Option<String>,
        storage: Option<Storage>,
    ) -> Self {
        let mut log = EventLog::default();
        log.push(format!(
            "boot: firmware {} in {}",
            env!("CARGO_PKG_VERSION"),
            machine.phase()
        ));
        Self {
            inner: Arc::new(Mutex::new(Inner {
                machine,
                timers: TimerSet::new(),
                log,
                storage,
                identity,
                wifi_ssid,
            })),
        }
    }

    /// Restore persisted state from `storage` (if any) and build the runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the state file exists but cannot be read, or the
    /// initial state cannot be written.
    pub async fn boot(
        limits: SessionLimits,
        identity: DeviceIdentity,
        storage: Option<Storage>,
    ) -> Result<Self, StorageError> {
        let persisted = match &storage {
            Some(storage) => storage.load()?,
            None => None,
        };
        let first_boot = persisted.is_none();
        let persisted = persisted.unwrap_or_default();

        let machine = SessionMachine::restore(
            limits,
            persisted.features,
            persisted.stats,
            persisted.rewards,
        );
        let runtime = Self::new(machine, identity, persisted.wifi_ssid, storage);

        let inner = runtime.inner.lock().await;
        if first_boot {
            info!("first boot; writing initial device state");
        }
        inner.persist()?;
        drop(inner);
        Ok(runtime)
    }

    /// Current session status.
    pub async fn status(&self) -> SessionStatus {
        self.inner.lock().await.machine.status()
    }

    /// Static details.
    pub async fn details(&self) -> DeviceDetails {
        let inner = self.inner.lock().await;
        DeviceDetails {
            name: inner.identity.name.clone(),
            firmware_version: env!("CARGO_PKG_VERSION").to_string(),
            mac: inner.identity.mac.clone(),
            wifi_ssid: inner.wifi_ssid.clone(),
            features: *inner.machine.features(),
        }
    }

    /// Recent events, oldest first.
    pub async fn log(&self) -> Vec<LogLine> {
        self.inner.lock().await.log.snapshot()
    }

    /// Reward view, hidden during an active session.
    ///
    /// # Errors
    ///
    /// [`SessionError::WrongPhase`] while armed, locked or serving a penalty.
    pub async fn reward(&self) -> Result<RewardView, SessionError> {
        self.inner.lock().await.machine.reward()
    }

    /// Apply a session command and return the resulting status.
    ///
    /// # Errors
    ///
    /// Whatever the machine rejects the command with.
    pub async fn execute(&self, command: SessionCommand) -> Result<SessionStatus, SessionError> {
        let mut inner = self.inner.lock().await;
        let label = command_label(&command);
        match inner.machine.apply(command, now()) {
            Ok(Some(transition)) => self.after_transition(&mut inner, transition),
            Ok(None) => debug!(command = label, "command accepted"),
            Err(e) => {
                debug!(command = label, error = %e, "command rejected");
                return Err(e);
            }
        }
        Ok(inner.machine.status())
    }

    /// Store new Wi-Fi credentials.
    ///
    /// # Errors
    ///
    /// `Validation` for bad credentials, `Busy` during an active session,
    /// `PersistenceError` if the change cannot be saved.
    pub async fn update_wifi(&self, credentials: WifiCredentials) -> Result<(), KeyholderError> {
        credentials
            .check()
            .map_err(|(field, message)| KeyholderError::Validation(format!("{field} {message}")))?;

        let mut inner = self.inner.lock().await;
        let phase = inner.machine.phase();
        if !matches!(phase, Phase::Ready | Phase::Completed) {
            return Err(busy("change Wi-Fi", phase).into());
        }
        info!(ssid = %credentials.ssid, "Wi-Fi credentials updated");
        inner.log.push(format!("wifi: joined {}", credentials.ssid));
        inner.wifi_ssid = Some(credentials.ssid);
        inner.persist()?;
        Ok(())
    }

    /// Replace the provisioned feature flags.
    ///
    /// # Errors
    ///
    /// `Busy` outside `ready`/`completed`, `PersistenceError` on save failure.
    pub async fn set_features(&self, features: DeviceFeatures) -> Result<(), KeyholderError> {
        let mut inner = self.inner.lock().await;
        inner.machine.set_features(features)?;
        inner.log.push("features updated");
        inner.persist()?;
        Ok(())
    }

    /// Wipe stats, rewards, features and Wi-Fi, then come back up ready.
    ///
    /// # Errors
    ///
    /// `Busy` while a session is armed, locked or serving a penalty.
    pub async fn factory_reset(&self) -> Result<(), KeyholderError> {
        let mut inner = self.inner.lock().await;
        let phase = inner.machine.phase();
        if matches!(phase, Phase::Armed | Phase::Locked | Phase::Aborted) {
            return Err(busy("factory reset", phase).into());
        }
        warn!("factory reset");
        inner.wifi_ssid = None;
        inner.log.push("factory reset");
        match inner.machine.factory_reset(now()) {
            Some(transition) => self.after_transition(&mut inner, transition),
            None => {
                if let Err(e) = inner.persist() {
                    warn!(error = %e, "failed to persist factory reset");
                }
            }
        }
        Ok(())
    }

    /// Cancel the phase ticker and write state one last time.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.timers.cancel_all();
        if let Err(e) = inner.persist() {
            warn!(error = %e, "failed to persist state at shutdown");
        }
    }

    /// Timer kind currently running, for diagnostics and tests.
    pub async fn active_timer(&self) -> Option<TimerKind> {
        self.inner.lock().await.timers.active().first().copied()
    }

    fn after_transition(&self, inner: &mut MutexGuard<'_, Inner>, transition: Transition) {
        if transition.abort_source == Some(AbortSource::Watchdog) {
            warn!(source = "watchdog", %transition, "session aborted without keepalive");
        }
        inner.log.push(transition.to_string());
        if let Err(e) = inner.persist() {
            warn!(error = %e, "failed to persist device state");
        }
        self.resync_timer(inner);
    }

    fn resync_timer(&self, inner: &mut MutexGuard<'_, Inner>) {
        let epoch = inner.machine.epoch();
        let next = inner
            .machine
            .timer()
            .map(|kind| (kind, self.clone().ticker(epoch)));
        inner.timers.switch_to(next);
    }

    fn ticker(self, epoch: u64) -> BoxFuture<'static, ()> {
        async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + TICK, TICK);
            loop {
                interval.tick().await;
                if !self.tick(epoch).await {
                    return;
                }
            }
        }
        .boxed()
    }

    /// Feed one tick. Returns whether the ticker should keep running.
    async fn tick(&self, epoch: u64) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.machine.tick(epoch, now()) {
            TickOutcome::Stale => false,
            TickOutcome::Counted => true,
            TickOutcome::Transitioned(transition) => {
                self.after_transition(&mut inner, transition);
                false
            }
        }
    }
}

impl Inner {
    fn persist(&self) -> Result<(), StorageError> {
        let Some(storage) = &self.storage else {
            return Ok(());
        };
        storage.save(&PersistedDevice {
            stats: self.machine.stats().clone(),
            features: *self.machine.features(),
            wifi_ssid: self.wifi_ssid.clone(),
            rewards: self.machine.rewards().clone(),
        })
    }
}

const fn command_label(command: &SessionCommand) -> &'static str {
    match command {
        SessionCommand::Arm(_) => "arm",
        SessionCommand::Trigger => "trigger",
        SessionCommand::StartTest => "start-test",
        SessionCommand::Abort => "abort",
        SessionCommand::Keepalive => "keepalive",
        SessionCommand::Reinitialize => "reboot",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyholder_core::{SessionConfig, TriggerStrategy};

    fn identity() -> DeviceIdentity {
        DeviceIdentity {
            name: "Hall".to_string(),
            mac: Some("AA:BB:CC:DD:EE:FF".to_string()),
        }
    }

    fn runtime() -> DeviceRuntime {
        DeviceRuntime::new(
            SessionMachine::new(SessionLimits::default(), DeviceFeatures::default()),
            identity(),
            None,
            None,
        )
    }

    fn session(strategy: TriggerStrategy, duration_secs: u32) -> SessionConfig {
        SessionConfig {
            strategy,
            duration_secs,
            penalty_secs: 30,
            hide_timer: false,
            channel_delays: [(1, 0)].into_iter().collect(),
        }
    }

    /// Move observation points half a tick away from ticker deadlines.
    async fn offset() {
        tokio::time::sleep(TICK / 2).await;
    }

    async fn advance(secs: u64) {
        tokio::time::sleep(Duration::from_secs(secs)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_auto_countdown_completes_after_duration() {
        let runtime = runtime();
        let status = runtime
            .execute(SessionCommand::Arm(session(TriggerStrategy::AutoCountdown, 10)))
            .await
            .unwrap();
        assert_eq!(status.phase, Phase::Locked);
        assert_eq!(runtime.active_timer().await, Some(TimerKind::Lock));

        offset().await;
        advance(9).await;
        assert_eq!(runtime.status().await.lock_remaining_secs, Some(1));

        advance(2).await;
        let status = runtime.status().await;
        assert_eq!(status.phase, Phase::Completed);
        assert_eq!(status.stats.completed, 1);
        assert_eq!(status.stats.locked_secs, 10);
        assert_eq!(runtime.active_timer().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_keepalive_trips_watchdog() {
        let runtime = runtime();
        runtime
            .execute(SessionCommand::Arm(session(TriggerStrategy::AutoCountdown, 600)))
            .await
            .unwrap();

        offset().await;
        advance(20).await;
        runtime.execute(SessionCommand::Keepalive).await.unwrap();
        advance(25).await;
        assert_eq!(runtime.status().await.phase, Phase::Locked);

        advance(10).await;
        let status = runtime.status().await;
        assert_eq!(status.phase, Phase::Aborted);
        assert_eq!(status.last_abort_source, Some(AbortSource::Watchdog));
        assert_eq!(status.stats.aborted, 1);
        assert_eq!(runtime.active_timer().await, Some(TimerKind::Penalty));
        assert!(runtime
            .log()
            .await
            .iter()
            .any(|line| line.message == "locked -> aborted (watchdog)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_button_trigger_times_out_to_ready() {
        let runtime = runtime();
        runtime
            .execute(SessionCommand::Arm(session(TriggerStrategy::ButtonTrigger, 60)))
            .await
            .unwrap();
        assert_eq!(runtime.active_timer().await, Some(TimerKind::ArmedTrigger));

        offset().await;
        advance(601).await;
        let status = runtime.status().await;
        assert_eq!(status.phase, Phase::Ready);
        assert_eq!(status.stats, keyholder_core::SessionStats::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_abort_replaces_the_ticker() {
        let runtime = runtime();
        runtime
            .execute(SessionCommand::Arm(session(TriggerStrategy::ButtonTrigger, 60)))
            .await
            .unwrap();
        runtime.execute(SessionCommand::Trigger).await.unwrap();
        offset().await;
        advance(3).await;
        runtime.execute(SessionCommand::Abort).await.unwrap();
        offset().await;

        let status = runtime.status().await;
        assert_eq!(status.phase, Phase::Aborted);
        assert_eq!(status.stats.locked_secs, 3);
        assert_eq!(runtime.active_timer().await, Some(TimerKind::Penalty));

        advance(30).await;
        assert_eq!(runtime.status().await.phase, Phase::Completed);
        // Exactly one penalty second per tick: no leftover lock ticker.
        assert_eq!(runtime.status().await.stats.locked_secs, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wifi_and_factory_reset_are_refused_mid_session() {
        let runtime = runtime();
        runtime
            .execute(SessionCommand::Arm(session(TriggerStrategy::AutoCountdown, 60)))
            .await
            .unwrap();

        let wifi = WifiCredentials {
            ssid: "home".to_string(),
            password: "pw".to_string(),
        };
        assert!(matches!(
            runtime.update_wifi(wifi.clone()).await,
            Err(KeyholderError::Busy(_))
        ));
        assert!(matches!(
            runtime.factory_reset().await,
            Err(KeyholderError::Busy(_))
        ));

        assert!(matches!(
            runtime.execute(SessionCommand::Reinitialize).await,
            Err(SessionError::WrongPhase { .. })
        ));

        // Served penalty is the only way out of a locked session.
        runtime.execute(SessionCommand::Abort).await.unwrap();
        offset().await;
        assert!(runtime.update_wifi(wifi.clone()).await.is_err());
        assert!(runtime.execute(SessionCommand::Reinitialize).await.is_err());
        advance(30).await;

        let status = runtime.status().await;
        assert_eq!(status.phase, Phase::Completed);
        assert_eq!(status.stats.aborted, 1);
        runtime.update_wifi(wifi).await.unwrap();
        assert_eq!(runtime.details().await.wifi_ssid.as_deref(), Some("home"));

        runtime.factory_reset().await.unwrap();
        assert_eq!(runtime.details().await.wifi_ssid, None);
    }

    #[tokio::test]
    async fn test_boot_restores_persisted_state() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path().to_path_buf());
        let limits = SessionLimits::default();

        let first = DeviceRuntime::boot(limits.clone(), identity(), Some(storage.clone()))
            .await
            .unwrap();
        first.update_wifi(WifiCredentials {
            ssid: "attic".to_string(),
            password: String::new(),
        })
        .await
        .unwrap();
        let reward = first.reward().await.unwrap().latest;
        first.shutdown().await;

        let second = DeviceRuntime::boot(limits, identity(), Some(storage))
            .await
            .unwrap();
        assert_eq!(second.details().await.wifi_ssid.as_deref(), Some("attic"));
        assert_eq!(second.reward().await.unwrap().latest, reward);
    }
}
