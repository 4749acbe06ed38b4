//! Bluetooth SIG identifiers used by the cycling power session.
//!
//! All values are the 16-bit assigned numbers expanded onto the Bluetooth base UUID.

use uuid::Uuid;

/// Cycling Power Service UUID (0x1818)
pub const CYCLING_POWER_SERVICE_UUID: Uuid =
    Uuid::from_u128(0x0000_1818_0000_1000_8000_0080_5f9b_34fb);

/// Cycling Power Measurement UUID (0x2A63)
pub const CYCLING_POWER_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a63_0000_1000_8000_0080_5f9b_34fb);

/// Cycling Speed and Cadence Service UUID (0x1816)
pub const CSC_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_1816_0000_1000_8000_0080_5f9b_34fb);

/// CSC Measurement UUID (0x2A5B)
pub const CSC_MEASUREMENT_UUID: Uuid =
    Uuid::from_u128(0x0000_2a5b_0000_1000_8000_0080_5f9b_34fb);

/// Services a reconnect lookup or scan filters on.
pub const SUPPORTED_SERVICES: [Uuid; 2] = [CYCLING_POWER_SERVICE_UUID, CSC_SERVICE_UUID];

/// Crank event time resolution (ticks per second).
pub const CRANK_EVENT_TICKS_PER_SECOND: u32 = 1024;

/// Which measurement characteristic a session streams from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementKind {
    /// Cycling Power Measurement (power + optional crank data)
    CyclingPower,
    /// CSC Measurement (wheel and/or crank data, no power)
    SpeedCadence,
}

impl MeasurementKind {
    /// Service that carries this measurement.
    pub fn service_uuid(&self) -> Uuid {
        match self {
            MeasurementKind::CyclingPower => CYCLING_POWER_SERVICE_UUID,
            MeasurementKind::SpeedCadence => CSC_SERVICE_UUID,
        }
    }

    /// Characteristic that notifies this measurement.
    pub fn characteristic_uuid(&self) -> Uuid {
        match self {
            MeasurementKind::CyclingPower => CYCLING_POWER_MEASUREMENT_UUID,
            MeasurementKind::SpeedCadence => CSC_MEASUREMENT_UUID,
        }
    }
}

impl std::fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeasurementKind::CyclingPower => write!(f, "Cycling Power"),
            MeasurementKind::SpeedCadence => write!(f, "Cycling Speed/Cadence"),
        }
    }
}
