//! Cadence estimation from cumulative crank revolution samples.
//!
//! Both counters wrap at 16 bits. Event time ticks at 1024 Hz, so one full wrap of
//! the event timer is 64 seconds.

use crate::sensors::decoder::CrankSample;
use crate::sensors::protocol::CRANK_EVENT_TICKS_PER_SECOND;
use std::time::{Duration, Instant};

/// Default silence window after which cadence is forced to zero.
pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(3);

/// Counters carried between notifications of one connection.
///
/// `last_crank_event_time == 0` means no crank sample has been seen since the
/// last reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DecoderState {
    pub last_crank_revolutions: u16,
    pub last_crank_event_time: u16,
    /// When cadence was last computed (or the counters were first seeded)
    pub last_calculation: Option<Instant>,
}

impl DecoderState {
    /// Whether a prior crank sample exists to diff against.
    pub fn has_prior_sample(&self) -> bool {
        self.last_crank_event_time != 0
    }
}

/// Outcome of feeding one notification to the estimator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CadenceUpdate {
    /// First sample after reset; counters seeded, nothing computed
    Seeded,
    /// New cadence in RPM
    Computed(u32),
    /// No movement or no crank data; keep the current value
    Hold,
    /// Nothing computed within the staleness window; cadence should be zero
    Stale,
}

/// Difference between two readings of a 16-bit wrapping counter.
pub fn wrapping_delta(previous: u16, current: u16) -> u32 {
    u32::from(current.wrapping_sub(previous))
}

/// Cadence in RPM for a revolution count over a time delta in 1/1024 s.
///
/// Returns `None` for a zero time delta.
pub fn cadence_rpm(revolution_delta: u32, time_delta: u32) -> Option<u32> {
    if time_delta == 0 {
        return None;
    }
    let rpm = f64::from(revolution_delta) * f64::from(CRANK_EVENT_TICKS_PER_SECOND) * 60.0
        / f64::from(time_delta);
    Some(rpm.round() as u32)
}

/// Rollover-aware cadence estimator.
#[derive(Debug, Clone)]
pub struct CadenceEstimator {
    state: DecoderState,
    stale_after: Duration,
}

impl Default for CadenceEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER)
    }
}

impl CadenceEstimator {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            state: DecoderState::default(),
            stale_after,
        }
    }

    pub fn state(&self) -> &DecoderState {
        &self.state
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub fn reset(&mut self) {
        self.state = DecoderState::default();
    }

    /// Feed a crank sample received at `now`.
    pub fn update(&mut self, sample: CrankSample, now: Instant) -> CadenceUpdate {
        if !self.state.has_prior_sample() {
            self.state.last_crank_revolutions = sample.revolutions;
            self.state.last_crank_event_time = sample.event_time;
            self.state.last_calculation = Some(now);
            return CadenceUpdate::Seeded;
        }

        let revolution_delta =
            wrapping_delta(self.state.last_crank_revolutions, sample.revolutions);
        let time_delta = wrapping_delta(self.state.last_crank_event_time, sample.event_time);

        self.state.last_crank_revolutions = sample.revolutions;
        self.state.last_crank_event_time = sample.event_time;

        if revolution_delta > 0 && time_delta > 0 {
            if let Some(rpm) = cadence_rpm(revolution_delta, time_delta) {
                self.state.last_calculation = Some(now);
                return CadenceUpdate::Computed(rpm);
            }
        }

        self.check_stale(now)
    }

    /// Staleness check for a notification that computed nothing.
    pub fn check_stale(&self, now: Instant) -> CadenceUpdate {
        match self.state.last_calculation {
            Some(last) if now.saturating_duration_since(last) > self.stale_after => {
                CadenceUpdate::Stale
            }
            _ => CadenceUpdate::Hold,
        }
    }
}
