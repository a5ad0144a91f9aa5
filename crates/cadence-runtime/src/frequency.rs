//! Fixed-rate pacing and loop frequency measurement.

use std::time::{Duration, Instant};

use cadence_types::CadenceError;
use spin_sleep::{SpinSleeper, SpinStrategy};

// ────────────────────────────────────────────────────────────────────────────
// FrequencyManager
// ────────────────────────────────────────────────────────────────────────────

/// Paces a loop at a fixed frequency.
///
/// Deadlines are scheduled from the previous deadline, not from the moment
/// [`wait`](FrequencyManager::wait) is called, so short overruns are caught
/// up over the following iterations.
#[derive(Debug)]
pub struct FrequencyManager {
    period: Duration,
    sleeper: SpinSleeper,
    next_deadline: Instant,
}

impl FrequencyManager {
    /// # Errors
    ///
    /// [`CadenceError::Config`] unless `frequency_hz` is finite and positive.
    pub fn new(frequency_hz: f64) -> Result<Self, CadenceError> {
        let period = period_of(frequency_hz)?;
        Ok(Self {
            period,
            sleeper: SpinSleeper::new(100_000).with_spin_strategy(SpinStrategy::YieldThread),
            next_deadline: Instant::now() + period,
        })
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Sleep until the next deadline. Returns `false` if the deadline had
    /// already passed.
    pub fn wait(&mut self) -> bool {
        let now = Instant::now();
        let on_time = now < self.next_deadline;
        if on_time {
            self.sleeper.sleep(self.next_deadline - now);
        }
        self.next_deadline += self.period;
        on_time
    }

    /// Restart the schedule from now, dropping any accumulated lateness.
    pub fn reset(&mut self) {
        self.next_deadline = Instant::now() + self.period;
    }
}

/// Period of a loop running at `frequency_hz`.
pub fn period_of(frequency_hz: f64) -> Result<Duration, CadenceError> {
    if !frequency_hz.is_finite() || frequency_hz <= 0.0 {
        return Err(CadenceError::Config(format!(
            "frequency must be positive, got {frequency_hz}"
        )));
    }
    Ok(Duration::from_secs_f64(1.0 / frequency_hz))
}

// ────────────────────────────────────────────────────────────────────────────
// FrequencyMeasure
// ────────────────────────────────────────────────────────────────────────────

/// Measures the rate at which [`tick`](FrequencyMeasure::tick) is called.
#[derive(Debug)]
pub struct FrequencyMeasure {
    previous: Instant,
}

impl Default for FrequencyMeasure {
    fn default() -> Self {
        Self::new()
    }
}

impl FrequencyMeasure {
    pub fn new() -> Self {
        Self {
            previous: Instant::now(),
        }
    }

    /// Frequency in Hz derived from the time since the previous tick (or
    /// since construction). Returns `-1.0` when no time could be measured.
    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.previous).as_secs_f64();
        self.previous = now;
        if elapsed > 0.0 { 1.0 / elapsed } else { -1.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_frequencies_are_rejected() {
        assert!(matches!(FrequencyManager::new(0.0), Err(CadenceError::Config(_))));
        assert!(matches!(FrequencyManager::new(-5.0), Err(CadenceError::Config(_))));
        assert!(matches!(FrequencyManager::new(f64::NAN), Err(CadenceError::Config(_))));
    }

    #[test]
    fn period_matches_frequency() -> Result<(), Box<dyn std::error::Error>> {
        assert_eq!(period_of(1_000.0)?, Duration::from_millis(1));
        assert_eq!(FrequencyManager::new(500.0)?.period(), Duration::from_millis(2));
        Ok(())
    }

    #[test]
    fn paced_loop_takes_at_least_its_periods() -> Result<(), Box<dyn std::error::Error>> {
        let mut manager = FrequencyManager::new(200.0)?;
        let start = Instant::now();
        for _ in 0..5 {
            manager.wait();
        }
        assert!(start.elapsed() >= Duration::from_millis(20));
        Ok(())
    }

    #[test]
    fn measure_reports_positive_frequency() {
        let mut measure = FrequencyMeasure::new();
        std::thread::sleep(Duration::from_millis(10));
        let hz = measure.tick();
        assert!(hz > 0.0 && hz <= 100.0);
    }
}
