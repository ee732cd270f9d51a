//! Timer subsystem - countdowns that dispatch rules between turns
//!
//! The set ticks on two signals: turn boundaries (game-clock advance) and a
//! coarse real-time heartbeat owned by the tab task. Expired timers are
//! handed back so the pipeline can dispatch the bound rules at a safe point;
//! they never interleave with an in-progress turn step.

use std::time::Duration;

use rand::Rng;

use taleweaver_domain::{ClockSource, RuleId, Timer, TimerKey};

/// Heartbeat period for the real-time tick task.
pub const HEARTBEAT: Duration = Duration::from_secs(1);

/// Jitter drawn on re-arm when a timer's jitter flag is set, as a fraction
/// of the interval.
const JITTER_FRACTION: f64 = 0.25;

/// The active timers of one tab.
#[derive(Debug, Clone, Default)]
pub struct TimerSet {
    timers: Vec<Timer>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_timers(timers: Vec<Timer>) -> Self {
        Self { timers }
    }

    pub fn timers(&self) -> &[Timer] {
        &self.timers
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Arm a timer, replacing any existing one bound to the same rule and
    /// key.
    pub fn start(&mut self, timer: Timer) {
        self.cancel(&timer.rule, &timer.key);
        tracing::debug!(rule = %timer.rule, interval_ms = timer.interval_ms, "timer started");
        self.timers.push(timer);
    }

    pub fn cancel(&mut self, rule: &RuleId, key: &TimerKey) -> bool {
        let before = self.timers.len();
        self.timers.retain(|t| !(&t.rule == rule && &t.key == key));
        before != self.timers.len()
    }

    /// Advance all countdowns and collect the expired ones.
    ///
    /// `real_elapsed_ms` drives wall-clock timers; `game_elapsed_ms` drives
    /// game-clock timers. Periodic timers re-arm (with jitter when flagged);
    /// one-shot timers are removed.
    pub fn tick(&mut self, real_elapsed_ms: u64, game_elapsed_ms: u64) -> Vec<Timer> {
        let mut expired = Vec::new();
        let mut keep = Vec::with_capacity(self.timers.len());

        for mut timer in std::mem::take(&mut self.timers) {
            let elapsed = match timer.clock {
                ClockSource::Real => real_elapsed_ms,
                ClockSource::Game => game_elapsed_ms,
            };
            if timer.advance(elapsed) {
                expired.push(timer.clone());
                if timer.periodic {
                    let jitter_ms = if timer.jitter {
                        draw_jitter(timer.interval_ms)
                    } else {
                        0
                    };
                    timer.rearm(jitter_ms);
                    keep.push(timer);
                }
            } else {
                keep.push(timer);
            }
        }

        self.timers = keep;
        expired
    }
}

fn draw_jitter(interval_ms: u64) -> i64 {
    let span = (interval_ms as f64 * JITTER_FRACTION) as i64;
    if span == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(-span..=span)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_one_shot_expires_and_is_removed() {
        let mut set = TimerSet::new();
        set.start(Timer::one_shot("midnight_ghost", TimerKey::Global, 1500));

        assert!(set.tick(1000, 0).is_empty());
        let expired = set.tick(1000, 0);
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].rule.as_str(), "midnight_ghost");
        assert!(set.is_empty());
    }

    #[test]
    fn test_periodic_rearms() {
        let mut set = TimerSet::new();
        set.start(Timer::periodic("patrol", TimerKey::Global, 1000));

        let expired = set.tick(1000, 0);
        assert_eq!(expired.len(), 1);
        assert_eq!(set.timers().len(), 1);
        assert_eq!(set.timers()[0].remaining_ms, 1000);
    }

    #[test]
    fn test_game_clock_timers_ignore_real_time() {
        let mut set = TimerSet::new();
        set.start(Timer::one_shot("dawn", TimerKey::Global, 500).on_game_clock());

        assert!(set.tick(10_000, 0).is_empty());
        let expired = set.tick(0, 500);
        assert_eq!(expired.len(), 1);
    }

    #[test]
    fn test_start_replaces_same_binding() {
        let mut set = TimerSet::new();
        set.start(Timer::one_shot("patrol", TimerKey::Global, 1000));
        set.start(Timer::one_shot("patrol", TimerKey::Global, 9000));
        assert_eq!(set.timers().len(), 1);
        assert_eq!(set.timers()[0].remaining_ms, 9000);
    }

    #[test]
    fn test_cancel() {
        let mut set = TimerSet::new();
        set.start(Timer::one_shot("patrol", TimerKey::Global, 1000));
        assert!(set.cancel(&RuleId::new("patrol"), &TimerKey::Global));
        assert!(!set.cancel(&RuleId::new("patrol"), &TimerKey::Global));
        assert!(set.is_empty());
    }

    #[test]
    fn test_jittered_rearm_stays_positive() {
        let mut set = TimerSet::new();
        set.start(Timer::periodic("patrol", TimerKey::Global, 4).with_jitter());
        for _ in 0..20 {
            set.tick(4, 0);
            assert!(set.timers()[0].remaining_ms >= 1);
        }
    }
}
