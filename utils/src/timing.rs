// Wall clock helpers for logging and frame profiling

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the unix epoch.
///
/// Used to stamp log lines, so it has to be cheap and infallible.
pub fn get_current_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

/// A basic stopwatch for timing sections of code
pub struct StopWatch {
    sw_start: u128,
    sw_end: u128,
}

impl StopWatch {
    pub fn new() -> Self {
        Self {
            sw_start: 0,
            sw_end: 0,
        }
    }

    pub fn start(&mut self) {
        self.sw_start = get_current_millis();
    }

    pub fn end(&mut self) {
        self.sw_end = get_current_millis();
    }

    /// Elapsed time between start and end, in milliseconds
    pub fn get_duration(&self) -> u128 {
        self.sw_end.saturating_sub(self.sw_start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopwatch_duration_is_monotonic() {
        let mut sw = StopWatch::new();
        sw.start();
        sw.end();
        // end >= start, so the duration can never underflow
        assert!(sw.get_duration() < 1000);
    }
}
