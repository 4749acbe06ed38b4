//! Measurement decoding for Cycling Power and CSC notifications.
//!
//! Cycling Power Measurement (0x2A63) layout as read here:
//! - Byte 0: flags (bit 5 = crank revolution data present)
//! - Bytes 2-3: instantaneous power, signed 16-bit little-endian
//! - Bytes 4-5: cumulative crank revolutions, unsigned 16-bit little-endian
//! - Bytes 6-7: last crank event time (1/1024 s), unsigned 16-bit little-endian
//!
//! CSC Measurement (0x2A5B) is walked by its flags (bit 0 wheel, bit 1 crank).

use crate::sensors::cadence::{CadenceEstimator, CadenceUpdate, DecoderState, DEFAULT_STALE_AFTER};
use crate::sensors::protocol::MeasurementKind;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Minimum payload length holding the power field.
pub const MIN_POWER_PAYLOAD_LEN: usize = 4;

/// Minimum payload length holding power and crank fields.
pub const MIN_CRANK_PAYLOAD_LEN: usize = 8;

/// Crank Revolution Data Present (flags bit 5)
const CPM_CRANK_DATA_PRESENT: u8 = 0x20;

/// Wheel Revolution Data Present (CSC flags bit 0)
const CSC_WHEEL_DATA_PRESENT: u8 = 0x01;

/// Crank Revolution Data Present (CSC flags bit 1)
const CSC_CRANK_DATA_PRESENT: u8 = 0x02;

/// Decoding errors. Never surfaced past the session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed payload: {len} bytes, need at least {required}")]
    MalformedPayload { len: usize, required: usize },
}

/// One crank revolution sample as reported by the sensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrankSample {
    /// Cumulative crank revolutions (wraps at 16 bits)
    pub revolutions: u16,
    /// Last crank event time in 1/1024 s (wraps at 16 bits)
    pub event_time: u16,
}

/// One wheel revolution sample (CSC only).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WheelSample {
    /// Cumulative wheel revolutions
    pub revolutions: u32,
    /// Last wheel event time in 1/1024 s
    pub event_time: u16,
}

/// Parsed Cycling Power Measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclingPowerData {
    /// Instantaneous power in watts
    pub power_watts: i16,
    /// Crank revolution data (if flagged and long enough)
    pub crank: Option<CrankSample>,
}

/// Parsed CSC Measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CscData {
    pub wheel: Option<WheelSample>,
    pub crank: Option<CrankSample>,
}

/// Parse a Cycling Power Measurement notification.
///
/// Crank data is read only when flags bit 5 is set and the payload is at least
/// [`MIN_CRANK_PAYLOAD_LEN`] bytes; a shorter flagged payload still yields power.
pub fn parse_cycling_power_measurement(data: &[u8]) -> Result<CyclingPowerData, DecodeError> {
    if data.len() < MIN_POWER_PAYLOAD_LEN {
        return Err(DecodeError::MalformedPayload {
            len: data.len(),
            required: MIN_POWER_PAYLOAD_LEN,
        });
    }

    let flags = data[0];
    let power_watts = i16::from_le_bytes([data[2], data[3]]);

    let crank = if (flags & CPM_CRANK_DATA_PRESENT) != 0 && data.len() >= MIN_CRANK_PAYLOAD_LEN {
        Some(CrankSample {
            revolutions: u16::from_le_bytes([data[4], data[5]]),
            event_time: u16::from_le_bytes([data[6], data[7]]),
        })
    } else {
        None
    };

    Ok(CyclingPowerData { power_watts, crank })
}

/// Parse a CSC Measurement notification.
pub fn parse_csc_measurement(data: &[u8]) -> Result<CscData, DecodeError> {
    let Some(&flags) = data.first() else {
        return Err(DecodeError::MalformedPayload { len: 0, required: 1 });
    };

    let mut result = CscData::default();
    let mut offset = 1usize;

    if (flags & CSC_WHEEL_DATA_PRESENT) != 0 {
        if offset + 6 > data.len() {
            return Err(DecodeError::MalformedPayload {
                len: data.len(),
                required: offset + 6,
            });
        }
        result.wheel = Some(WheelSample {
            revolutions: u32::from_le_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]),
            event_time: u16::from_le_bytes([data[offset + 4], data[offset + 5]]),
        });
        offset += 6;
    }

    if (flags & CSC_CRANK_DATA_PRESENT) != 0 {
        if offset + 4 > data.len() {
            return Err(DecodeError::MalformedPayload {
                len: data.len(),
                required: offset + 4,
            });
        }
        result.crank = Some(CrankSample {
            revolutions: u16::from_le_bytes([data[offset], data[offset + 1]]),
            event_time: u16::from_le_bytes([data[offset + 2], data[offset + 3]]),
        });
    }

    Ok(result)
}

/// Result of decoding one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    /// Power in watts, when the measurement carries it
    pub power_watts: Option<i16>,
    /// What the cadence estimator decided for this notification
    pub cadence: CadenceUpdate,
}

/// Per-connection decoder: parses payloads and drives the cadence estimators.
///
/// Cycling Power and CSC crank pairs are separate counters, so each source keeps
/// its own estimator. Staleness is judged against the latest calculation from
/// either source.
#[derive(Debug, Clone)]
pub struct MeasurementDecoder {
    cycling_power: CadenceEstimator,
    speed_cadence: CadenceEstimator,
}

impl Default for MeasurementDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_STALE_AFTER)
    }
}

impl MeasurementDecoder {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            cycling_power: CadenceEstimator::new(stale_after),
            speed_cadence: CadenceEstimator::new(stale_after),
        }
    }

    /// Crank counters carried for one measurement source.
    pub fn state(&self, kind: MeasurementKind) -> &DecoderState {
        self.estimator(kind).state()
    }

    /// Clear counters back to the "no prior sample" state.
    pub fn reset(&mut self) {
        self.cycling_power.reset();
        self.speed_cadence.reset();
    }

    fn estimator(&self, kind: MeasurementKind) -> &CadenceEstimator {
        match kind {
            MeasurementKind::CyclingPower => &self.cycling_power,
            MeasurementKind::SpeedCadence => &self.speed_cadence,
        }
    }

    fn estimator_mut(&mut self, kind: MeasurementKind) -> &mut CadenceEstimator {
        match kind {
            MeasurementKind::CyclingPower => &mut self.cycling_power,
            MeasurementKind::SpeedCadence => &mut self.speed_cadence,
        }
    }

    fn check_stale(&self, now: Instant) -> CadenceUpdate {
        let last = self
            .cycling_power
            .state()
            .last_calculation
            .max(self.speed_cadence.state().last_calculation);

        let window = self.cycling_power.stale_after();
        match last {
            Some(last) if now.saturating_duration_since(last) > window => CadenceUpdate::Stale,
            _ => CadenceUpdate::Hold,
        }
    }

    /// Decode a `kind` notification payload received at `now`.
    ///
    /// On error the decoder state is left untouched.
    pub fn decode(
        &mut self,
        kind: MeasurementKind,
        data: &[u8],
        now: Instant,
    ) -> Result<Reading, DecodeError> {
        let (power_watts, crank) = match kind {
            MeasurementKind::CyclingPower => {
                let parsed = parse_cycling_power_measurement(data)?;
                (Some(parsed.power_watts), parsed.crank)
            }
            MeasurementKind::SpeedCadence => (None, parse_csc_measurement(data)?.crank),
        };

        let cadence = match crank.map(|sample| self.estimator_mut(kind).update(sample, now)) {
            Some(update @ (CadenceUpdate::Seeded | CadenceUpdate::Computed(_))) => update,
            _ => self.check_stale(now),
        };

        Ok(Reading {
            power_watts,
            cadence,
        })
    }
}
