//! Lock session lifecycle.
//!
//! The [`SessionMachine`] is the authoritative model of a device's lock
//! phases. It is a plain synchronous value: callers feed it commands and
//! ticks together with the current [`std::time::Instant`], and read back
//! which single timer ([`TimerKind`]) should be running. A runtime such as
//! the reference device turns that into real tasks with
//! [`crate::timers::TimerSet`].
//!
//! ```text
//!            arm                 all delays 0 / trigger
//!   ready ─────────► armed ─────────────────────────► locked ──► completed
//!     ▲  ▲             │ abort / trigger timeout        │ abort       ▲
//!     │  └─────────────┘                                ▼             │
//!     │                                              aborted ─────────┘
//!     └── testing (start-test, ticks back to ready)
//! ```

mod machine;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

pub use machine::{SessionMachine, TickOutcome};

use crate::reward::Reward;

/// Session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Idle, accepts `arm` and `start-test`.
    Ready,
    /// Waiting for channel delays or the trigger button.
    Armed,
    /// Lock engaged.
    Locked,
    /// Serving the penalty after a hard abort.
    Aborted,
    /// Session over; terminal until the device is reinitialized.
    Completed,
    /// Fixed-length hardware test.
    Testing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ready => "ready",
            Self::Armed => "armed",
            Self::Locked => "locked",
            Self::Aborted => "aborted",
            Self::Completed => "completed",
            Self::Testing => "testing",
        };
        f.write_str(name)
    }
}

/// How an armed session moves to `locked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum TriggerStrategy {
    /// Lock once every channel delay has counted down.
    AutoCountdown,
    /// Lock when the physical button is pressed.
    ButtonTrigger,
}

/// What caused an abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AbortSource {
    /// Requested through the API.
    Explicit,
    /// Keepalive window expired while locked.
    Watchdog,
}

impl fmt::Display for AbortSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit => f.write_str("explicit"),
            Self::Watchdog => f.write_str("watchdog"),
        }
    }
}

/// The single phase timer that should be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Auto-countdown channel delays.
    ArmedCountdown,
    /// Button-trigger timeout.
    ArmedTrigger,
    /// Lock countdown (also evaluates the watchdog).
    Lock,
    /// Penalty countdown.
    Penalty,
    /// Test countdown.
    Test,
}

/// Parameters of one session, supplied at arm time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
#[schema(example = json!({
    "strategy": "auto_countdown",
    "duration_secs": 1800,
    "penalty_secs": 600,
    "hide_timer": false,
    "channel_delays": {"1": 0}
}))]
pub struct SessionConfig {
    /// Trigger strategy.
    pub strategy: TriggerStrategy,
    /// Requested lock duration.
    pub duration_secs: u32,
    /// Penalty served after a hard abort.
    pub penalty_secs: u32,
    /// Hide the lock countdown from status reports.
    #[serde(default)]
    pub hide_timer: bool,
    /// Per-channel delay before locking (channels 1 to 4).
    #[serde(default)]
    pub channel_delays: BTreeMap<u8, u32>,
}

/// Bounds enforced when arming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct SessionLimits {
    /// Shortest lock duration accepted.
    pub min_duration_secs: u32,
    /// Longest lock duration accepted (before payback debt).
    pub max_duration_secs: u32,
    /// Shortest penalty accepted.
    pub min_penalty_secs: u32,
    /// Longest penalty accepted.
    pub max_penalty_secs: u32,
    /// Longest per-channel delay accepted.
    pub max_channel_delay_secs: u32,
    /// How long a button-trigger session waits before returning to ready.
    pub trigger_timeout_secs: u32,
    /// Length of the test phase.
    pub test_secs: u32,
    /// Keepalive window while locked.
    pub watchdog_secs: u32,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            min_duration_secs: 10,
            max_duration_secs: 86_400,
            min_penalty_secs: 10,
            max_penalty_secs: 14_400,
            max_channel_delay_secs: 3_600,
            trigger_timeout_secs: 600,
            test_secs: 240,
            watchdog_secs: 30,
        }
    }
}

impl SessionLimits {
    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// Returns a description of the first inconsistency.
    pub fn check(&self) -> Result<(), String> {
        if self.min_duration_secs == 0 || self.min_duration_secs > self.max_duration_secs {
            return Err("duration bounds must satisfy 0 < min <= max".to_string());
        }
        if self.min_penalty_secs == 0 || self.min_penalty_secs > self.max_penalty_secs {
            return Err("penalty bounds must satisfy 0 < min <= max".to_string());
        }
        if self.trigger_timeout_secs == 0 || self.test_secs == 0 || self.watchdog_secs == 0 {
            return Err("trigger timeout, test length and watchdog must be non-zero".to_string());
        }
        Ok(())
    }
}

/// Lifetime counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(default)]
pub struct SessionStats {
    /// Consecutive completed sessions.
    pub streak: u32,
    /// Lifetime hard aborts.
    pub aborted: u32,
    /// Lifetime completed sessions.
    pub completed: u32,
    /// Lifetime seconds spent locked.
    pub locked_secs: u64,
    /// Debt added to the next session.
    pub payback_debt_secs: u32,
}

/// Snapshot of the machine for `GET /status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct SessionStatus {
    /// Current phase.
    pub phase: Phase,
    /// Strategy of the running session.
    pub strategy: Option<TriggerStrategy>,
    /// Seconds until unlock; `null` while locked with the timer hidden.
    pub lock_remaining_secs: Option<u32>,
    /// Penalty seconds left while aborted.
    pub penalty_remaining_secs: Option<u32>,
    /// Test seconds left while testing.
    pub test_remaining_secs: Option<u32>,
    /// Seconds until an untriggered button session gives up.
    pub trigger_timeout_remaining_secs: Option<u32>,
    /// Remaining per-channel delay while armed.
    pub channel_delays_remaining: BTreeMap<u8, u32>,
    /// Whether the countdown is hidden.
    pub hide_timer: bool,
    /// Source of the last hard abort of this session.
    pub last_abort_source: Option<AbortSource>,
    /// Lifetime counters.
    pub stats: SessionStats,
}

/// Reward codes visible outside an active session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct RewardView {
    /// Most recent reward.
    pub latest: Option<Reward>,
    /// Live history, most recent first.
    pub history: Vec<Reward>,
}

/// A phase change, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Transition {
    /// Phase before.
    pub from: Phase,
    /// Phase after.
    pub to: Phase,
    /// Set when the change was an abort of a locked session.
    pub abort_source: Option<AbortSource>,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)?;
        if let Some(source) = self.abort_source {
            write!(f, " ({source})")?;
        }
        Ok(())
    }
}

/// Commands accepted by the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// Start a session.
    Arm(SessionConfig),
    /// Physical button press.
    Trigger,
    /// Enter the test phase.
    StartTest,
    /// Abort the current session.
    Abort,
    /// Liveness signal from the control application.
    Keepalive,
    /// Device reboot: back to ready, stats kept. Refused mid-session.
    Reinitialize,
}

/// Errors from session commands.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    /// The command is not valid in the current phase.
    #[error("cannot {action} while {phase}")]
    WrongPhase {
        /// Command name.
        action: &'static str,
        /// Phase at the time.
        phase: Phase,
    },

    /// A numeric field is outside its bounds.
    #[error("{field} must be between {min} and {max} (got {value})")]
    OutOfRange {
        /// Field name.
        field: &'static str,
        /// Supplied value.
        value: u32,
        /// Lower bound.
        min: u32,
        /// Upper bound.
        max: u32,
    },

    /// Channel id outside 1 to 4.
    #[error("unknown channel {0}; channels are numbered 1 to 4")]
    UnknownChannel(u8),

    /// Channel exists but is not enabled on this device.
    #[error("channel {0} is not enabled on this device")]
    ChannelDisabled(u8),

    /// Trigger sent to a session that is not button-triggered.
    #[error("the armed session does not use the button trigger")]
    NotButtonTriggered,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_deserialization() {
        let json = r#"{
            "strategy": "button_trigger",
            "duration_secs": 1800,
            "penalty_secs": 300,
            "channel_delays": {"1": 5, "2": 0}
        }"#;
        let config: SessionConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.strategy, TriggerStrategy::ButtonTrigger);
        assert!(!config.hide_timer);
        assert_eq!(config.channel_delays.get(&1), Some(&5));
    }

    #[test]
    fn test_session_config_rejects_unknown_shape() {
        let json = r#"{"strategy": "sometimes", "duration_secs": 10, "penalty_secs": 10}"#;
        assert!(serde_json::from_str::<SessionConfig>(json).is_err());

        let json = r#"{"strategy": "auto_countdown", "duration_secs": 10, "penalty_secs": 10, "colour": "red"}"#;
        assert!(serde_json::from_str::<SessionConfig>(json).is_err());
    }

    #[test]
    fn test_transition_display() {
        let transition = Transition {
            from: Phase::Locked,
            to: Phase::Aborted,
            abort_source: Some(AbortSource::Watchdog),
        };
        assert_eq!(transition.to_string(), "locked -> aborted (watchdog)");
    }

    #[test]
    fn test_default_limits_are_consistent() {
        assert!(SessionLimits::default().check().is_ok());
        let broken = SessionLimits {
            min_duration_secs: 100,
            max_duration_secs: 10,
            ..SessionLimits::default()
        };
        assert!(broken.check().is_err());
    }
}
