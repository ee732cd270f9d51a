use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeOfDay {
    Morning,
    Afternoon,
    Evening,
    Night,
}

impl TimeOfDay {
    pub fn display_name(&self) -> &'static str {
        match self {
            TimeOfDay::Morning => "Morning",
            TimeOfDay::Afternoon => "Afternoon",
            TimeOfDay::Evening => "Evening",
            TimeOfDay::Night => "Night",
        }
    }
}

impl std::fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// How the game clock advances relative to real time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockMode {
    /// Mirror the wall clock on every tick.
    SyncToWallClock,
    /// Frozen; only explicit set_time moves it.
    Static,
    /// Advance by real elapsed time times a multiplier.
    RealTimeScaled { multiplier: f64 },
    /// Advanced only by rule actions and explicit set_time.
    Manual,
}

impl Default for ClockMode {
    fn default() -> Self {
        ClockMode::Static
    }
}

/// The simulated game clock for one tab.
///
/// Holds a virtual timestamp advanced by the turn pipeline according to the
/// configured mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameClock {
    mode: ClockMode,
    current: DateTime<Utc>,
}

impl Default for GameClock {
    fn default() -> Self {
        Self::new()
    }
}

impl GameClock {
    pub fn new() -> Self {
        Self {
            mode: ClockMode::default(),
            current: Utc::now(),
        }
    }

    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            mode: ClockMode::default(),
            current: start,
        }
    }

    pub fn with_mode(mut self, mode: ClockMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: ClockMode) {
        self.mode = mode;
    }

    pub fn current(&self) -> DateTime<Utc> {
        self.current
    }

    pub fn set_time(&mut self, new_time: DateTime<Utc>) {
        self.current = new_time;
    }

    pub fn advance(&mut self, duration: Duration) {
        self.current += duration;
    }

    pub fn advance_minutes(&mut self, minutes: i64) {
        self.advance(Duration::minutes(minutes));
    }

    /// Advance the clock for one pipeline tick given real elapsed time.
    pub fn tick(&mut self, real_elapsed: Duration, wall_now: DateTime<Utc>) {
        match self.mode {
            ClockMode::SyncToWallClock => self.current = wall_now,
            ClockMode::Static | ClockMode::Manual => {}
            ClockMode::RealTimeScaled { multiplier } => {
                let scaled_ms = (real_elapsed.num_milliseconds() as f64 * multiplier) as i64;
                self.current += Duration::milliseconds(scaled_ms);
            }
        }
    }

    /// Minutes since midnight of the virtual timestamp.
    pub fn minute_of_day(&self) -> u16 {
        (self.current.hour() * 60 + self.current.minute()) as u16
    }

    pub fn time_of_day(&self) -> TimeOfDay {
        match self.current.hour() {
            5..=11 => TimeOfDay::Morning,
            12..=17 => TimeOfDay::Afternoon,
            18..=21 => TimeOfDay::Evening,
            _ => TimeOfDay::Night,
        }
    }

    pub fn display_time(&self) -> String {
        let hour = self.current.hour();
        let minute = self.current.minute();

        let period = if hour >= 12 { "PM" } else { "AM" };
        let display_hour = if hour == 0 {
            12
        } else if hour > 12 {
            hour - 12
        } else {
            hour
        };

        format!("{}:{:02} {}", display_hour, minute, period)
    }
}

/// A daily time window in minutes since midnight.
///
/// The start is inclusive and the end exclusive. Windows wrapping midnight
/// (start > end) are treated as the two half-windows either side of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start_minute: u16,
    pub end_minute: u16,
}

impl TimeWindow {
    pub fn new(start_minute: u16, end_minute: u16) -> Self {
        Self {
            start_minute,
            end_minute,
        }
    }

    /// Window covering exactly one minute (e.g. "at 00:00").
    pub fn at(minute: u16) -> Self {
        Self {
            start_minute: minute,
            end_minute: (minute + 1) % (24 * 60),
        }
    }

    pub fn contains(&self, minute_of_day: u16) -> bool {
        if self.start_minute == self.end_minute {
            // Degenerate full-day window
            return true;
        }
        if self.start_minute < self.end_minute {
            minute_of_day >= self.start_minute && minute_of_day < self.end_minute
        } else {
            // Wraps midnight: [start, 1440) plus [0, end)
            minute_of_day >= self.start_minute || minute_of_day < self.end_minute
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 10, hour, minute, 0)
            .single()
            .expect("valid timestamp")
    }

    #[test]
    fn test_time_of_day_bands() {
        assert_eq!(GameClock::starting_at(at(6, 0)).time_of_day(), TimeOfDay::Morning);
        assert_eq!(GameClock::starting_at(at(13, 0)).time_of_day(), TimeOfDay::Afternoon);
        assert_eq!(GameClock::starting_at(at(19, 0)).time_of_day(), TimeOfDay::Evening);
        assert_eq!(GameClock::starting_at(at(2, 0)).time_of_day(), TimeOfDay::Night);
    }

    #[test]
    fn test_static_mode_ignores_tick() {
        let mut clock = GameClock::starting_at(at(9, 30));
        clock.tick(Duration::minutes(45), at(23, 0));
        assert_eq!(clock.current(), at(9, 30));
    }

    #[test]
    fn test_sync_mode_follows_wall_clock() {
        let mut clock = GameClock::starting_at(at(9, 30)).with_mode(ClockMode::SyncToWallClock);
        clock.tick(Duration::seconds(1), at(23, 15));
        assert_eq!(clock.current(), at(23, 15));
    }

    #[test]
    fn test_scaled_mode_multiplies_elapsed() {
        let mut clock = GameClock::starting_at(at(9, 0))
            .with_mode(ClockMode::RealTimeScaled { multiplier: 60.0 });
        clock.tick(Duration::minutes(1), at(9, 1));
        assert_eq!(clock.current(), at(10, 0));
    }

    #[test]
    fn test_window_inclusive_start_exclusive_end() {
        let window = TimeWindow::new(9 * 60, 17 * 60);
        assert!(window.contains(9 * 60));
        assert!(window.contains(16 * 60 + 59));
        assert!(!window.contains(17 * 60));
        assert!(!window.contains(8 * 60 + 59));
    }

    #[test]
    fn test_window_wrapping_midnight_is_split() {
        let window = TimeWindow::new(22 * 60, 2 * 60);
        assert!(window.contains(23 * 60));
        assert!(window.contains(0));
        assert!(window.contains(1 * 60 + 59));
        assert!(!window.contains(2 * 60));
        assert!(!window.contains(12 * 60));
    }

    #[test]
    fn test_midnight_minute_window() {
        let window = TimeWindow::at(0);
        assert!(window.contains(0));
        assert!(!window.contains(1));
        let clock = GameClock::starting_at(at(0, 0));
        assert!(window.contains(clock.minute_of_day()));
    }

    #[test]
    fn test_display_time() {
        assert_eq!(GameClock::starting_at(at(0, 5)).display_time(), "12:05 AM");
        assert_eq!(GameClock::starting_at(at(14, 30)).display_time(), "2:30 PM");
    }
}
