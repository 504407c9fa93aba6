//! Frame timing utilities

use std::time::Instant;

/// Tracks the orchestration frame number and wall-clock seconds since
/// startup. Cache entries stamp both on touch, and eviction compares both;
/// carrying seconds as a plain f64 keeps the eviction math testable without
/// faking `Instant`.
pub struct FrameClock {
    start: Instant,
    frame: u32,
}

impl FrameClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            frame: 0,
        }
    }

    /// Call once per orchestration tick.
    pub fn tick(&mut self) {
        self.frame = self.frame.wrapping_add(1);
    }

    /// Current frame number.
    pub fn frame(&self) -> u32 {
        self.frame
    }

    /// Seconds since the clock was created.
    pub fn now_seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_advance() {
        let mut clock = FrameClock::new();
        assert_eq!(clock.frame(), 0);
        clock.tick();
        clock.tick();
        assert_eq!(clock.frame(), 2);
    }

    #[test]
    fn test_now_monotonic() {
        let clock = FrameClock::new();
        let a = clock.now_seconds();
        let b = clock.now_seconds();
        assert!(b >= a);
    }
}
