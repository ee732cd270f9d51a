//! Timer records - scheduled and periodic rule triggers

use serde::{Deserialize, Serialize};

use crate::keys::{ActorKey, RuleId};

/// Whose timer this is: tab-global or bound to a specific actor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKey {
    Global,
    Actor(ActorKey),
}

impl TimerKey {
    pub fn actor(&self) -> Option<&ActorKey> {
        match self {
            TimerKey::Global => None,
            TimerKey::Actor(key) => Some(key),
        }
    }
}

/// Which clock the countdown follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockSource {
    /// Wall-clock time, decremented by the real-time heartbeat
    Real,
    /// Simulated game time, decremented as the game clock advances
    Game,
}

/// An active countdown bound to a rule.
///
/// On expiry the bound rule is dispatched through the rule engine in the
/// timer phase. Periodic timers re-arm; one-shot timers are removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timer {
    pub rule: RuleId,
    pub key: TimerKey,
    pub interval_ms: u64,
    pub remaining_ms: u64,
    pub periodic: bool,
    /// Re-arm with randomized jitter around the interval
    pub jitter: bool,
    pub clock: ClockSource,
}

impl Timer {
    pub fn one_shot(rule: impl Into<RuleId>, key: TimerKey, interval_ms: u64) -> Self {
        Self {
            rule: rule.into(),
            key,
            interval_ms,
            remaining_ms: interval_ms,
            periodic: false,
            jitter: false,
            clock: ClockSource::Real,
        }
    }

    pub fn periodic(rule: impl Into<RuleId>, key: TimerKey, interval_ms: u64) -> Self {
        Self {
            rule: rule.into(),
            key,
            interval_ms,
            remaining_ms: interval_ms,
            periodic: true,
            jitter: false,
            clock: ClockSource::Real,
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    pub fn on_game_clock(mut self) -> Self {
        self.clock = ClockSource::Game;
        self
    }

    /// Count down by elapsed milliseconds; returns true when expired.
    pub fn advance(&mut self, elapsed_ms: u64) -> bool {
        self.remaining_ms = self.remaining_ms.saturating_sub(elapsed_ms);
        self.remaining_ms == 0
    }

    /// Re-arm a periodic timer. `jitter_ms` is the signed offset the engine
    /// drew when the jitter flag is set (zero otherwise).
    pub fn rearm(&mut self, jitter_ms: i64) {
        let base = self.interval_ms as i64 + jitter_ms;
        self.remaining_ms = base.max(1) as u64;
    }
}
