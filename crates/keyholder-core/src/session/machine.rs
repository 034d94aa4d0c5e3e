use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use rand_core::{OsRng, RngCore};
use tracing::{info, warn};

use super::{
    AbortSource, Phase, RewardView, SessionCommand, SessionConfig, SessionError, SessionLimits,
    SessionStats, SessionStatus, TimerKind, Transition, TriggerStrategy,
};
use crate::reward::{RewardGenerator, RewardHistory};
use crate::types::{DeviceFeatures, CHANNEL_COUNT};

/// Result of feeding one tick to the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// The tick belonged to a cancelled timer and was ignored.
    Stale,
    /// Counters moved, phase unchanged.
    Counted,
    /// The tick caused a phase change.
    Transitioned(Transition),
}

#[derive(Debug, Clone, Default)]
struct Remaining {
    lock: u32,
    penalty: u32,
    test: u32,
    trigger_timeout: u32,
    channels: BTreeMap<u8, u32>,
}

/// The lock session state machine.
///
/// Every phase change goes through one private `switch` which replaces the
/// active [`TimerKind`] and bumps the timer epoch, so at most one timer is
/// ever expected and ticks from a replaced timer are rejected.
pub struct SessionMachine {
    phase: Phase,
    limits: SessionLimits,
    features: DeviceFeatures,
    stats: SessionStats,
    rewards: RewardHistory,
    generator: RewardGenerator<Box<dyn RngCore + Send>>,
    session: Option<SessionConfig>,
    remaining: Remaining,
    timer: Option<TimerKind>,
    epoch: u64,
    last_keepalive: Instant,
    last_abort: Option<AbortSource>,
}

impl std::fmt::Debug for SessionMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionMachine")
            .field("phase", &self.phase)
            .field("timer", &self.timer)
            .field("epoch", &self.epoch)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl SessionMachine {
    /// Fresh machine with zeroed stats and a seeded reward history.
    #[must_use]
    pub fn new(limits: SessionLimits, features: DeviceFeatures) -> Self {
        Self::restore(limits, features, SessionStats::default(), RewardHistory::default())
    }

    /// Machine rebuilt from persisted stats and rewards, starting in `ready`.
    #[must_use]
    pub fn restore(
        limits: SessionLimits,
        features: DeviceFeatures,
        stats: SessionStats,
        rewards: RewardHistory,
    ) -> Self {
        let mut machine = Self {
            phase: Phase::Ready,
            limits,
            features,
            stats,
            rewards,
            generator: RewardGenerator::new(Box::new(OsRng)),
            session: None,
            remaining: Remaining::default(),
            timer: None,
            epoch: 0,
            last_keepalive: Instant::now(),
            last_abort: None,
        };
        machine.seed_rewards();
        machine
    }

    /// Replace the random source used for reward codes.
    #[must_use]
    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.generator = RewardGenerator::new(Box::new(rng));
        self
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> Phase {
        self.phase
    }

    /// Lifetime counters.
    #[must_use]
    pub const fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Provisioned features.
    #[must_use]
    pub const fn features(&self) -> &DeviceFeatures {
        &self.features
    }

    /// Reward history.
    #[must_use]
    pub const fn rewards(&self) -> &RewardHistory {
        &self.rewards
    }

    /// Limits in force.
    #[must_use]
    pub const fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    /// The one timer that should be running, if any.
    #[must_use]
    pub const fn timer(&self) -> Option<TimerKind> {
        self.timer
    }

    /// Generation of the current timer; bumped on every phase change.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Status snapshot.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        let hide_timer = self.session.as_ref().is_some_and(|s| s.hide_timer);
        let in_phase = |phase: Phase, value: u32| (self.phase == phase).then_some(value);
        let lock_remaining = match self.phase {
            Phase::Armed => Some(self.remaining.lock),
            Phase::Locked if !hide_timer => Some(self.remaining.lock),
            _ => None,
        };
        let trigger_timeout = match self.session.as_ref().map(|s| s.strategy) {
            Some(TriggerStrategy::ButtonTrigger) => {
                in_phase(Phase::Armed, self.remaining.trigger_timeout)
            }
            _ => None,
        };

        SessionStatus {
            phase: self.phase,
            strategy: self.session.as_ref().map(|s| s.strategy),
            lock_remaining_secs: lock_remaining,
            penalty_remaining_secs: in_phase(Phase::Aborted, self.remaining.penalty),
            test_remaining_secs: in_phase(Phase::Testing, self.remaining.test),
            trigger_timeout_remaining_secs: trigger_timeout,
            channel_delays_remaining: if self.phase == Phase::Armed {
                self.remaining.channels.clone()
            } else {
                BTreeMap::new()
            },
            hide_timer,
            last_abort_source: self.last_abort,
            stats: self.stats.clone(),
        }
    }

    /// Rewards, hidden while a session is armed, locked or serving a penalty.
    ///
    /// # Errors
    ///
    /// [`SessionError::WrongPhase`] during an active session.
    pub fn reward(&self) -> Result<RewardView, SessionError> {
        if matches!(self.phase, Phase::Armed | Phase::Locked | Phase::Aborted) {
            return Err(self.wrong_phase("reveal the reward"));
        }
        Ok(RewardView {
            latest: self.rewards.latest().cloned(),
            history: self.rewards.iter().cloned().collect(),
        })
    }

    /// Dispatch a command. Returns the phase change it caused, if any.
    ///
    /// # Errors
    ///
    /// See the individual operations.
    pub fn apply(
        &mut self,
        command: SessionCommand,
        now: Instant,
    ) -> Result<Option<Transition>, SessionError> {
        match command {
            SessionCommand::Arm(config) => self.arm(config, now).map(Some),
            SessionCommand::Trigger => self.trigger(now).map(Some),
            SessionCommand::StartTest => self.start_test(now).map(Some),
            SessionCommand::Abort => self.abort(AbortSource::Explicit, now).map(Some),
            SessionCommand::Keepalive => {
                self.keepalive(now);
                Ok(None)
            }
            SessionCommand::Reinitialize => self.reinitialize(now),
        }
    }

    /// Arm a session from `ready`.
    ///
    /// The lock duration becomes the requested duration plus the pending
    /// payback debt. An auto-countdown session whose delays are all zero
    /// locks immediately.
    ///
    /// # Errors
    ///
    /// `WrongPhase` outside `ready`; range and channel errors for a bad config.
    pub fn arm(&mut self, config: SessionConfig, now: Instant) -> Result<Transition, SessionError> {
        if self.phase != Phase::Ready {
            return Err(self.wrong_phase("arm"));
        }
        self.validate(&config)?;

        let total = config
            .duration_secs
            .saturating_add(self.stats.payback_debt_secs);
        self.remaining = Remaining {
            lock: total,
            trigger_timeout: match config.strategy {
                TriggerStrategy::ButtonTrigger => self.limits.trigger_timeout_secs,
                TriggerStrategy::AutoCountdown => 0,
            },
            channels: config.channel_delays.clone(),
            ..Remaining::default()
        };
        let immediate = config.strategy == TriggerStrategy::AutoCountdown
            && self.remaining.channels.values().all(|&d| d == 0);
        self.session = Some(config);
        self.last_abort = None;

        info!(
            lock_secs = total,
            payback_debt_secs = self.stats.payback_debt_secs,
            "session armed"
        );
        let armed = self.switch(Phase::Armed, None, now);
        if immediate {
            let locked = self.switch(Phase::Locked, None, now);
            return Ok(Transition {
                from: armed.from,
                ..locked
            });
        }
        Ok(armed)
    }

    /// Physical button press for a button-trigger session.
    ///
    /// # Errors
    ///
    /// `WrongPhase` outside `armed`; `NotButtonTriggered` for auto sessions.
    pub fn trigger(&mut self, now: Instant) -> Result<Transition, SessionError> {
        if self.phase != Phase::Armed {
            return Err(self.wrong_phase("trigger"));
        }
        if self.strategy() != Some(TriggerStrategy::ButtonTrigger) {
            return Err(SessionError::NotButtonTriggered);
        }
        Ok(self.switch(Phase::Locked, None, now))
    }

    /// Enter the fixed-length test phase from `ready`.
    ///
    /// # Errors
    ///
    /// `WrongPhase` outside `ready`.
    pub fn start_test(&mut self, now: Instant) -> Result<Transition, SessionError> {
        if self.phase != Phase::Ready {
            return Err(self.wrong_phase("start a test"));
        }
        self.remaining = Remaining {
            test: self.limits.test_secs,
            ..Remaining::default()
        };
        Ok(self.switch(Phase::Testing, None, now))
    }

    /// Abort the current session.
    ///
    /// `armed` and `testing` return to `ready` without touching stats.
    /// `locked` is a hard abort.
    ///
    /// # Errors
    ///
    /// `WrongPhase` in `ready`, `aborted` and `completed`.
    pub fn abort(&mut self, source: AbortSource, now: Instant) -> Result<Transition, SessionError> {
        match self.phase {
            Phase::Armed | Phase::Testing => Ok(self.back_to_ready(now)),
            Phase::Locked => Ok(self.hard_abort(source, now)),
            Phase::Ready | Phase::Aborted | Phase::Completed => Err(self.wrong_phase("abort")),
        }
    }

    /// Record a keepalive from the control application.
    pub fn keepalive(&mut self, now: Instant) {
        self.last_keepalive = now;
    }

    /// Return to `ready` as after a reboot. Stats and rewards are kept.
    ///
    /// # Errors
    ///
    /// `WrongPhase` while `armed`, `locked` or `aborted`; a running session
    /// ends through `abort` or its timers.
    pub fn reinitialize(&mut self, now: Instant) -> Result<Option<Transition>, SessionError> {
        if matches!(self.phase, Phase::Armed | Phase::Locked | Phase::Aborted) {
            return Err(self.wrong_phase("reboot"));
        }
        Ok(self.reset_to_ready(now))
    }

    fn reset_to_ready(&mut self, now: Instant) -> Option<Transition> {
        self.remaining = Remaining::default();
        self.session = None;
        self.last_abort = None;
        self.seed_rewards();
        let transition = self.switch(Phase::Ready, None, now);
        (transition.from != transition.to).then_some(transition)
    }

    /// Wipe stats, rewards and features, then reinitialize.
    pub fn factory_reset(&mut self, now: Instant) -> Option<Transition> {
        self.stats = SessionStats::default();
        self.rewards = RewardHistory::default();
        self.features = DeviceFeatures::default();
        self.reset_to_ready(now)
    }

    /// Replace provisioned features.
    ///
    /// # Errors
    ///
    /// `WrongPhase` unless `ready` or `completed`.
    pub fn set_features(&mut self, features: DeviceFeatures) -> Result<(), SessionError> {
        if !matches!(self.phase, Phase::Ready | Phase::Completed) {
            return Err(self.wrong_phase("change features"));
        }
        self.features = features;
        Ok(())
    }

    /// Advance the active timer by one second.
    ///
    /// `epoch` must be the value of [`Self::epoch`] when the calling timer
    /// was armed; anything else is a leftover tick and is ignored.
    pub fn tick(&mut self, epoch: u64, now: Instant) -> TickOutcome {
        if epoch != self.epoch || self.timer.is_none() {
            return TickOutcome::Stale;
        }

        let transition = match self.phase {
            Phase::Armed => self.tick_armed(now),
            Phase::Locked => self.tick_locked(now),
            Phase::Aborted => {
                self.remaining.penalty = self.remaining.penalty.saturating_sub(1);
                (self.remaining.penalty == 0).then(|| {
                    self.session = None;
                    self.switch(Phase::Completed, None, now)
                })
            }
            Phase::Testing => {
                self.remaining.test = self.remaining.test.saturating_sub(1);
                (self.remaining.test == 0).then(|| self.back_to_ready(now))
            }
            Phase::Ready | Phase::Completed => return TickOutcome::Stale,
        };

        transition.map_or(TickOutcome::Counted, TickOutcome::Transitioned)
    }

    fn tick_armed(&mut self, now: Instant) -> Option<Transition> {
        match self.strategy()? {
            TriggerStrategy::AutoCountdown => {
                for delay in self.remaining.channels.values_mut() {
                    *delay = delay.saturating_sub(1);
                }
                self.remaining
                    .channels
                    .values()
                    .all(|&d| d == 0)
                    .then(|| self.switch(Phase::Locked, None, now))
            }
            TriggerStrategy::ButtonTrigger => {
                self.remaining.trigger_timeout = self.remaining.trigger_timeout.saturating_sub(1);
                (self.remaining.trigger_timeout == 0).then(|| {
                    info!("button trigger timed out");
                    self.back_to_ready(now)
                })
            }
        }
    }

    fn tick_locked(&mut self, now: Instant) -> Option<Transition> {
        let window = Duration::from_secs(u64::from(self.limits.watchdog_secs));
        if now.saturating_duration_since(self.last_keepalive) > window {
            warn!(source = %AbortSource::Watchdog, "keepalive window expired while locked");
            return Some(self.hard_abort(AbortSource::Watchdog, now));
        }

        self.remaining.lock = self.remaining.lock.saturating_sub(1);
        self.stats.locked_secs += 1;
        (self.remaining.lock == 0).then(|| self.complete(now))
    }

    fn complete(&mut self, now: Instant) -> Transition {
        self.stats.completed += 1;
        if self.features.streaks {
            self.stats.streak += 1;
        }
        // The debt was folded into this session's duration and is now served.
        self.stats.payback_debt_secs = 0;
        if self.features.reward_code {
            match self.generator.generate_into(&mut self.rewards) {
                Ok(reward) => info!(checksum = %reward.checksum, "new reward code issued"),
                Err(e) => warn!(error = %e, "reward history unchanged"),
            }
        }
        self.session = None;
        self.switch(Phase::Completed, None, now)
    }

    fn hard_abort(&mut self, source: AbortSource, now: Instant) -> Transition {
        self.stats.aborted += 1;
        if self.features.streaks {
            self.stats.streak = 0;
        }
        if self.features.payback {
            self.stats.payback_debt_secs = self
                .stats
                .payback_debt_secs
                .saturating_add(u32::from(self.features.payback_secs));
        }
        self.last_abort = Some(source);
        info!(source = %source, aborted = self.stats.aborted, "locked session aborted");

        if !self.features.reward_code {
            self.session = None;
            return self.switch(Phase::Completed, Some(source), now);
        }
        self.remaining.penalty = self.session.as_ref().map_or(0, |s| s.penalty_secs);
        if self.remaining.penalty == 0 {
            self.session = None;
            return self.switch(Phase::Completed, Some(source), now);
        }
        self.switch(Phase::Aborted, Some(source), now)
    }

    fn back_to_ready(&mut self, now: Instant) -> Transition {
        self.remaining = Remaining::default();
        self.session = None;
        self.switch(Phase::Ready, None, now)
    }

    fn switch(&mut self, to: Phase, abort_source: Option<AbortSource>, now: Instant) -> Transition {
        let from = self.phase;
        self.phase = to;
        self.timer = self.timer_for(to);
        self.epoch += 1;
        if to == Phase::Locked {
            self.last_keepalive = now;
        }
        let transition = Transition {
            from,
            to,
            abort_source,
        };
        info!(%transition, epoch = self.epoch, timer = ?self.timer, "phase changed");
        transition
    }

    fn timer_for(&self, phase: Phase) -> Option<TimerKind> {
        match phase {
            Phase::Armed => match self.strategy() {
                Some(TriggerStrategy::ButtonTrigger) => Some(TimerKind::ArmedTrigger),
                _ => Some(TimerKind::ArmedCountdown),
            },
            Phase::Locked => Some(TimerKind::Lock),
            Phase::Aborted => Some(TimerKind::Penalty),
            Phase::Testing => Some(TimerKind::Test),
            Phase::Ready | Phase::Completed => None,
        }
    }

    fn strategy(&self) -> Option<TriggerStrategy> {
        self.session.as_ref().map(|s| s.strategy)
    }

    fn seed_rewards(&mut self) {
        if self.rewards.is_empty() {
            if let Err(e) = self.generator.generate_into(&mut self.rewards) {
                warn!(error = %e, "could not seed reward history");
            }
        }
    }

    const fn wrong_phase(&self, action: &'static str) -> SessionError {
        SessionError::WrongPhase {
            action,
            phase: self.phase,
        }
    }

    fn validate(&self, config: &SessionConfig) -> Result<(), SessionError> {
        let limits = &self.limits;
        check_range(
            "duration_secs",
            config.duration_secs,
            limits.min_duration_secs,
            limits.max_duration_secs,
        )?;
        check_range(
            "penalty_secs",
            config.penalty_secs,
            limits.min_penalty_secs,
            limits.max_penalty_secs,
        )?;
        for (&channel, &delay) in &config.channel_delays {
            if channel == 0 || channel > CHANNEL_COUNT {
                return Err(SessionError::UnknownChannel(channel));
            }
            if !self.features.channel_enabled(channel) {
                return Err(SessionError::ChannelDisabled(channel));
            }
            check_range("channel_delay_secs", delay, 0, limits.max_channel_delay_secs)?;
        }
        Ok(())
    }
}

const fn check_range(field: &'static str, value: u32, min: u32, max: u32) -> Result<(), SessionError> {
    if value < min || value > max {
        return Err(SessionError::OutOfRange {
            field,
            value,
            min,
            max,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features() -> DeviceFeatures {
        DeviceFeatures {
            streaks: true,
            reward_code: true,
            payback: true,
            channels: [true, true, false, false],
            payback_secs: 600,
        }
    }

    fn machine() -> SessionMachine {
        SessionMachine::new(SessionLimits::default(), features())
    }

    fn auto(duration: u32, delays: &[(u8, u32)]) -> SessionConfig {
        SessionConfig {
            strategy: TriggerStrategy::AutoCountdown,
            duration_secs: duration,
            penalty_secs: 60,
            hide_timer: false,
            channel_delays: delays.iter().copied().collect(),
        }
    }

    fn button(duration: u32) -> SessionConfig {
        SessionConfig {
            strategy: TriggerStrategy::ButtonTrigger,
            ..auto(duration, &[(1, 0)])
        }
    }

    /// Tick `n` times with a keepalive before each tick.
    fn run(machine: &mut SessionMachine, n: u32, now: Instant) -> Vec<TickOutcome> {
        (0..n)
            .map(|_| {
                machine.keepalive(now);
                machine.tick(machine.epoch(), now)
            })
            .collect()
    }

    #[test]
    fn test_auto_countdown_with_zero_delays_locks_immediately_then_completes() {
        let mut m = machine();
        let now = Instant::now();
        let streak_before = m.stats().streak;

        let t = m.arm(auto(10, &[(1, 0), (2, 0)]), now).unwrap();
        assert_eq!((t.from, t.to), (Phase::Ready, Phase::Locked));
        assert_eq!(m.status().lock_remaining_secs, Some(10));
        assert_eq!(m.timer(), Some(TimerKind::Lock));

        let outcomes = run(&mut m, 9, now);
        assert!(outcomes.iter().all(|o| *o == TickOutcome::Counted));
        assert_eq!(m.phase(), Phase::Locked);

        let last = m.tick(m.epoch(), now);
        assert!(matches!(last, TickOutcome::Transitioned(t) if t.to == Phase::Completed));
        assert_eq!(m.phase(), Phase::Completed);
        assert_eq!(m.stats().streak, streak_before + 1);
        assert_eq!(m.stats().completed, 1);
        assert_eq!(m.stats().locked_secs, 10);
        assert_eq!(m.timer(), None);
    }

    #[test]
    fn test_remaining_one_completes_on_next_tick_only() {
        let mut m = machine();
        let now = Instant::now();
        m.arm(auto(10, &[]), now).unwrap();
        run(&mut m, 9, now);

        assert_eq!(m.status().lock_remaining_secs, Some(1));
        assert_eq!(m.phase(), Phase::Locked);
        m.tick(m.epoch(), now);
        assert_eq!(m.phase(), Phase::Completed);
    }

    #[test]
    fn test_channel_delays_count_down_before_lock() {
        let mut m = machine();
        let now = Instant::now();
        m.arm(auto(30, &[(1, 2), (2, 3)]), now).unwrap();
        assert_eq!(m.phase(), Phase::Armed);
        assert_eq!(m.timer(), Some(TimerKind::ArmedCountdown));

        run(&mut m, 2, now);
        assert_eq!(m.phase(), Phase::Armed);
        assert_eq!(m.status().channel_delays_remaining.get(&1), Some(&0));
        assert_eq!(m.status().channel_delays_remaining.get(&2), Some(&1));

        run(&mut m, 1, now);
        assert_eq!(m.phase(), Phase::Locked);
        assert_eq!(m.status().lock_remaining_secs, Some(30));
    }

    #[test]
    fn test_arm_rejected_outside_ready() {
        let now = Instant::now();

        let mut m = machine();
        m.arm(auto(30, &[(1, 5)]), now).unwrap();
        assert!(matches!(
            m.arm(auto(30, &[]), now),
            Err(SessionError::WrongPhase { phase: Phase::Armed, .. })
        ));

        let mut m = machine();
        m.start_test(now).unwrap();
        assert!(matches!(m.arm(auto(30, &[]), now), Err(SessionError::WrongPhase { .. })));

        let mut m = machine();
        m.arm(auto(10, &[]), now).unwrap();
        assert!(matches!(m.arm(auto(30, &[]), now), Err(SessionError::WrongPhase { .. })));
        m.abort(AbortSource::Explicit, now).unwrap();
        assert!(matches!(m.arm(auto(30, &[]), now), Err(SessionError::WrongPhase { .. })));
    }

    #[test]
    fn test_arm_validates_bounds_and_channels() {
        let now = Instant::now();
        let mut m = machine();

        assert!(matches!(
            m.arm(auto(5, &[]), now),
            Err(SessionError::OutOfRange { field: "duration_secs", .. })
        ));
        let mut config = auto(30, &[]);
        config.penalty_secs = 1;
        assert!(matches!(
            m.arm(config, now),
            Err(SessionError::OutOfRange { field: "penalty_secs", .. })
        ));
        assert_eq!(m.arm(auto(30, &[(5, 0)]), now), Err(SessionError::UnknownChannel(5)));
        assert_eq!(m.arm(auto(30, &[(3, 0)]), now), Err(SessionError::ChannelDisabled(3)));
        assert_eq!(m.phase(), Phase::Ready);
    }

    #[test]
    fn test_aborting_armed_changes_nothing() {
        let now = Instant::now();
        let mut m = machine();
        let before = m.stats().clone();

        m.arm(auto(30, &[(1, 10)]), now).unwrap();
        let t = m.abort(AbortSource::Explicit, now).unwrap();
        assert_eq!((t.from, t.to), (Phase::Armed, Phase::Ready));
        assert_eq!(m.stats(), &before);
        assert_eq!(m.timer(), None);
    }

    #[test]
    fn test_hard_abort_with_penalty_phase() {
        let now = Instant::now();
        let mut m = machine();
        m.stats.streak = 4;

        m.arm(auto(100, &[]), now).unwrap();
        run(&mut m, 3, now);
        let t = m.abort(AbortSource::Explicit, now).unwrap();

        assert_eq!(t.to, Phase::Aborted);
        assert_eq!(t.abort_source, Some(AbortSource::Explicit));
        assert_eq!(m.stats().aborted, 1);
        assert_eq!(m.stats().streak, 0);
        assert_eq!(m.stats().payback_debt_secs, 600);
        assert_eq!(m.status().penalty_remaining_secs, Some(60));
        assert_eq!(m.timer(), Some(TimerKind::Penalty));

        run(&mut m, 60, now);
        assert_eq!(m.phase(), Phase::Completed);
        assert_eq!(m.stats().completed, 0);
    }

    #[test]
    fn test_hard_abort_without_reward_code_skips_penalty() {
        let now = Instant::now();
        let mut m = SessionMachine::new(
            SessionLimits::default(),
            DeviceFeatures {
                reward_code: false,
                ..features()
            },
        );
        m.arm(auto(100, &[]), now).unwrap();
        let t = m.abort(AbortSource::Explicit, now).unwrap();

        assert_eq!((t.from, t.to), (Phase::Locked, Phase::Completed));
        assert_eq!(m.stats().aborted, 1);
        assert_eq!(m.timer(), None);
    }

    #[test]
    fn test_watchdog_matches_explicit_abort() {
        let start = Instant::now();

        let mut explicit = machine();
        explicit.arm(auto(100, &[]), start).unwrap();
        explicit.abort(AbortSource::Explicit, start).unwrap();

        let mut watched = machine();
        watched.arm(auto(100, &[]), start).unwrap();
        let late = start + Duration::from_secs(31);
        let outcome = watched.tick(watched.epoch(), late);

        let TickOutcome::Transitioned(t) = outcome else {
            panic!("expected a transition, got {outcome:?}");
        };
        assert_eq!(t.to, Phase::Aborted);
        assert_eq!(t.abort_source, Some(AbortSource::Watchdog));
        assert_eq!(watched.phase(), explicit.phase());
        assert_eq!(watched.stats(), explicit.stats());
        assert_eq!(
            watched.status().penalty_remaining_secs,
            explicit.status().penalty_remaining_secs
        );
        assert_eq!(watched.status().last_abort_source, Some(AbortSource::Watchdog));
    }

    #[test]
    fn test_watchdog_window_is_exclusive() {
        let start = Instant::now();
        let mut m = machine();
        m.arm(auto(100, &[]), start).unwrap();

        let at_edge = start + Duration::from_secs(30);
        assert_eq!(m.tick(m.epoch(), at_edge), TickOutcome::Counted);
        assert_eq!(m.phase(), Phase::Locked);
    }

    #[test]
    fn test_button_trigger_timeout_returns_to_ready() {
        let now = Instant::now();
        let mut m = machine();
        let before = m.stats().clone();

        m.arm(button(60), now).unwrap();
        assert_eq!(m.timer(), Some(TimerKind::ArmedTrigger));
        run(&mut m, 599, now);
        assert_eq!(m.phase(), Phase::Armed);
        assert_eq!(m.status().trigger_timeout_remaining_secs, Some(1));

        run(&mut m, 1, now);
        assert_eq!(m.phase(), Phase::Ready);
        assert_eq!(m.stats(), &before);
    }

    #[test]
    fn test_button_trigger_locks() {
        let now = Instant::now();
        let mut m = machine();
        m.arm(button(60), now).unwrap();
        let t = m.trigger(now).unwrap();
        assert_eq!(t.to, Phase::Locked);
        assert_eq!(m.status().lock_remaining_secs, Some(60));

        let mut auto_session = machine();
        auto_session.arm(auto(60, &[(1, 5)]), now).unwrap();
        assert_eq!(auto_session.trigger(now), Err(SessionError::NotButtonTriggered));
    }

    #[test]
    fn test_payback_debt_added_to_next_arm_and_cleared_on_completion() {
        let now = Instant::now();
        let mut m = machine();
        m.stats.payback_debt_secs = 600;

        m.arm(auto(1800, &[]), now).unwrap();
        assert_eq!(m.status().lock_remaining_secs, Some(2400));

        run(&mut m, 2400, now);
        assert_eq!(m.phase(), Phase::Completed);
        assert_eq!(m.stats().payback_debt_secs, 0);
    }

    #[test]
    fn test_stale_epoch_is_ignored() {
        let now = Instant::now();
        let mut m = machine();
        m.arm(auto(30, &[(1, 3)]), now).unwrap();
        let armed_epoch = m.epoch();

        m.abort(AbortSource::Explicit, now).unwrap();
        m.arm(auto(30, &[]), now).unwrap();
        assert_eq!(m.tick(armed_epoch, now), TickOutcome::Stale);
        assert_eq!(m.status().lock_remaining_secs, Some(30));
    }

    #[test]
    fn test_testing_phase_ticks_back_to_ready() {
        let now = Instant::now();
        let mut m = machine();
        m.start_test(now).unwrap();
        assert_eq!(m.timer(), Some(TimerKind::Test));

        // No keepalive at all: the watchdog is never armed in testing.
        let late = now + Duration::from_secs(3_600);
        for _ in 0..239 {
            assert_eq!(m.tick(m.epoch(), late), TickOutcome::Counted);
        }
        assert!(matches!(m.tick(m.epoch(), late), TickOutcome::Transitioned(_)));
        assert_eq!(m.phase(), Phase::Ready);
    }

    #[test]
    fn test_completion_issues_unique_reward() {
        let now = Instant::now();
        let mut m = machine();
        let seeded = m.rewards().len();
        assert_eq!(seeded, 1);

        m.arm(auto(10, &[]), now).unwrap();
        assert!(m.reward().is_err());
        run(&mut m, 10, now);

        let view = m.reward().unwrap();
        assert_eq!(view.history.len(), 2);
        assert_ne!(view.history[0].checksum, view.history[1].checksum);
    }

    #[test]
    fn test_completed_is_terminal_until_reinitialize() {
        let now = Instant::now();
        let mut m = machine();
        m.arm(auto(10, &[]), now).unwrap();
        run(&mut m, 10, now);

        assert!(m.arm(auto(10, &[]), now).is_err());
        assert!(m.abort(AbortSource::Explicit, now).is_err());
        assert_eq!(m.tick(m.epoch(), now), TickOutcome::Stale);

        let t = m.reinitialize(now).unwrap().unwrap();
        assert_eq!(t.to, Phase::Ready);
        assert!(m.arm(auto(10, &[]), now).is_ok());
    }

    #[test]
    fn test_reinitialize_refused_during_a_session() {
        let now = Instant::now();
        let mut m = machine();
        m.arm(auto(600, &[]), now).unwrap();
        assert_eq!(m.phase(), Phase::Locked);

        assert!(matches!(
            m.reinitialize(now),
            Err(SessionError::WrongPhase { phase: Phase::Locked, .. })
        ));
        assert!(matches!(
            m.apply(SessionCommand::Reinitialize, now),
            Err(SessionError::WrongPhase { .. })
        ));
        assert_eq!(m.phase(), Phase::Locked);
        assert_eq!(m.stats().aborted, 0);

        m.abort(AbortSource::Explicit, now).unwrap();
        assert_eq!(m.phase(), Phase::Aborted);
        assert!(m.reinitialize(now).is_err());
        assert_eq!(m.stats().aborted, 1);
        assert_eq!(m.status().penalty_remaining_secs, Some(60));

        // Idle phases reboot quietly.
        let mut idle = machine();
        assert_eq!(idle.reinitialize(now).unwrap(), None);
    }

    #[test]
    fn test_hidden_timer_is_not_reported_while_locked() {
        let now = Instant::now();
        let mut m = machine();
        let mut config = auto(30, &[]);
        config.hide_timer = true;
        m.arm(config, now).unwrap();

        let status = m.status();
        assert_eq!(status.phase, Phase::Locked);
        assert!(status.hide_timer);
        assert_eq!(status.lock_remaining_secs, None);
    }

    #[test]
    fn test_apply_dispatches_commands() {
        let now = Instant::now();
        let mut m = machine();
        assert_eq!(m.apply(SessionCommand::Keepalive, now), Ok(None));
        let t = m.apply(SessionCommand::StartTest, now).unwrap().unwrap();
        assert_eq!(t.to, Phase::Testing);
        let t = m.apply(SessionCommand::Abort, now).unwrap().unwrap();
        assert_eq!(t.to, Phase::Ready);
    }
}
