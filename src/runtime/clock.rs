//! Per-host clocks backing `Date` inside every realm.

use crate::runtime::config::ClockConfig;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Clock variants selectable per agent. All values are whole milliseconds
/// since the Unix epoch.
#[derive(Debug, Clone)]
pub enum Clock {
    Deterministic { next: i64, interval: i64 },
    Microtask { base: Option<(i64, Instant)>, frozen: i64 },
    Realtime { epoch: i64, started: Instant },
    System,
}

impl Clock {
    pub fn from_config(config: &ClockConfig) -> Self {
        match *config {
            ClockConfig::Deterministic { epoch, interval } => Clock::Deterministic {
                next: epoch,
                interval,
            },
            ClockConfig::Microtask { epoch } => {
                let base = epoch.map(|epoch| (epoch, Instant::now()));
                Clock::Microtask {
                    frozen: microtask_time(base),
                    base,
                }
            }
            ClockConfig::Realtime { epoch } => Clock::Realtime {
                epoch,
                started: Instant::now(),
            },
            ClockConfig::System => Clock::System,
        }
    }

    /// Called at the start of every scheduled task.
    pub fn begin_tick(&mut self) {
        if let Clock::Microtask { base, frozen } = self {
            *frozen = microtask_time(*base);
        }
    }

    pub fn clock_time_ms(&mut self) -> i64 {
        match self {
            Clock::Deterministic { next, interval } => {
                let now = *next;
                *next = next.saturating_add(*interval);
                now
            }
            Clock::Microtask { frozen, .. } => *frozen,
            Clock::Realtime { epoch, started } => epoch.saturating_add(elapsed_ms(*started)),
            Clock::System => system_time_ms(),
        }
    }
}

fn microtask_time(base: Option<(i64, Instant)>) -> i64 {
    match base {
        Some((epoch, started)) => epoch.saturating_add(elapsed_ms(started)),
        None => system_time_ms(),
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

fn system_time_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(since) => i64::try_from(since.as_millis()).unwrap_or(i64::MAX),
        Err(before) => -i64::try_from(before.duration().as_millis()).unwrap_or(i64::MAX),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_deterministic_clock_advances_per_query() {
        let mut clock = Clock::from_config(&ClockConfig::Deterministic {
            epoch: 1_000,
            interval: 250,
        });
        assert_eq!(clock.clock_time_ms(), 1_000);
        assert_eq!(clock.clock_time_ms(), 1_250);
        clock.begin_tick();
        assert_eq!(clock.clock_time_ms(), 1_500);
    }

    #[test]
    fn test_microtask_clock_frozen_within_tick() {
        let mut clock = Clock::from_config(&ClockConfig::Microtask { epoch: Some(0) });
        let first = clock.clock_time_ms();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(clock.clock_time_ms(), first);

        clock.begin_tick();
        assert!(clock.clock_time_ms() >= first + 20);
    }

    #[test]
    fn test_realtime_clock_starts_at_epoch() {
        let epoch = 946_684_800_000;
        let mut clock = Clock::from_config(&ClockConfig::Realtime { epoch });
        let now = clock.clock_time_ms();
        assert!(now >= epoch);
        assert!(now < epoch + 60_000);
    }

    #[test]
    fn test_system_clock_tracks_wall_time() {
        let mut clock = Clock::from_config(&ClockConfig::System);
        let expected = system_time_ms();
        let now = clock.clock_time_ms();
        assert!((now - expected).abs() < 5_000);
    }
}
