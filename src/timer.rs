//! Countdown clock shared by the lobby and battle sessions.
//!
//! The value ticks down locally once per second and is overwritten whenever
//! the server pushes an authoritative value. A cached value from a previous
//! page load may seed the clock, but only until the first authoritative value
//! arrives.

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimerSync {
    remaining: Option<u64>,
    authoritative: bool,
}

/// Result of one local tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    /// No value to tick, or already at zero.
    Idle,
    Running(u64),
    /// Zero was reached on this tick.
    Expired,
}

impl TimerSync {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock seeded with an authoritative value.
    pub fn starting_at(seconds: u64) -> Self {
        let mut timer = Self::new();
        timer.resync(seconds);
        timer
    }

    pub fn remaining(&self) -> Option<u64> {
        self.remaining
    }

    pub fn is_authoritative(&self) -> bool {
        self.authoritative
    }

    pub fn is_expired(&self) -> bool {
        self.remaining == Some(0)
    }

    /// Apply a server value. Always wins over the local value.
    pub fn resync(&mut self, seconds: u64) {
        self.remaining = Some(seconds);
        self.authoritative = true;
    }

    /// Seed from a non-authoritative source. Ignored once any value is set.
    pub fn hydrate(&mut self, seconds: u64) -> bool {
        if self.remaining.is_some() {
            return false;
        }
        self.remaining = Some(seconds);
        true
    }

    pub fn tick(&mut self) -> Tick {
        match self.remaining {
            None | Some(0) => Tick::Idle,
            Some(1) => {
                self.remaining = Some(0);
                Tick::Expired
            }
            Some(n) => {
                self.remaining = Some(n - 1);
                Tick::Running(n - 1)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_down_and_expires_once() {
        let mut timer = TimerSync::starting_at(3);
        assert_eq!(timer.tick(), Tick::Running(2));
        assert_eq!(timer.tick(), Tick::Running(1));
        assert_eq!(timer.tick(), Tick::Expired);
        assert_eq!(timer.tick(), Tick::Idle);
        assert_eq!(timer.tick(), Tick::Idle);
        assert!(timer.is_expired());
    }

    #[test]
    fn resync_discards_local_ticks() {
        let mut timer = TimerSync::starting_at(1800);
        for _ in 0..10 {
            timer.tick();
        }
        assert_eq!(timer.remaining(), Some(1790));
        timer.resync(1750);
        assert_eq!(timer.remaining(), Some(1750));
    }

    #[test]
    fn hydrate_never_overrides_authoritative_value() {
        let mut timer = TimerSync::new();
        assert!(timer.hydrate(600));
        assert!(!timer.is_authoritative());

        timer.resync(1200);
        assert!(!timer.hydrate(30));
        assert_eq!(timer.remaining(), Some(1200));
        assert!(timer.is_authoritative());
    }

    #[test]
    fn unset_clock_does_not_tick() {
        let mut timer = TimerSync::new();
        assert_eq!(timer.tick(), Tick::Idle);
        assert_eq!(timer.remaining(), None);
    }
}
