//! Unit tests for measurement decoding.

use cpsense::sensors::cadence::{CadenceUpdate, DecoderState};
use cpsense::sensors::decoder::{
    parse_csc_measurement, parse_cycling_power_measurement, DecodeError, MeasurementDecoder,
};
use cpsense::sensors::protocol::MeasurementKind;
use std::time::{Duration, Instant};

const POWER: MeasurementKind = MeasurementKind::CyclingPower;
const CSC: MeasurementKind = MeasurementKind::SpeedCadence;

/// Build a Cycling Power Measurement payload.
fn cpm(power: i16, crank: Option<(u16, u16)>) -> Vec<u8> {
    let flags: u8 = if crank.is_some() { 0x20 } else { 0x00 };
    let mut data = vec![flags, 0x00];
    data.extend_from_slice(&power.to_le_bytes());
    if let Some((revs, time)) = crank {
        data.extend_from_slice(&revs.to_le_bytes());
        data.extend_from_slice(&time.to_le_bytes());
    }
    data
}

#[test]
fn test_power_read_from_offset_two() {
    for power in [0i16, 1, 150, 250, 999, 2000, i16::MAX, -1, -300, i16::MIN] {
        let plain = parse_cycling_power_measurement(&cpm(power, None)).unwrap();
        let with_crank = parse_cycling_power_measurement(&cpm(power, Some((7, 3000)))).unwrap();

        assert_eq!(plain.power_watts, power);
        assert_eq!(with_crank.power_watts, power);
    }
}

#[test]
fn test_power_ignores_trailing_bytes() {
    // Flags without crank bit, power 180W, then unrelated optional fields
    let data = [0x01, 0x00, 0xB4, 0x00, 0x64, 0x00, 0x12, 0x34, 0x56];
    let result = parse_cycling_power_measurement(&data).unwrap();

    assert_eq!(result.power_watts, 180);
    assert!(result.crank.is_none());
}

#[test]
fn test_crank_flag_with_short_payload() {
    // Crank bit set but only 6 bytes: power still decodes, crank is skipped
    let data = [0x20, 0x00, 0x2C, 0x01, 0x05, 0x00];
    let result = parse_cycling_power_measurement(&data).unwrap();

    assert_eq!(result.power_watts, 300);
    assert!(result.crank.is_none());
}

#[test]
fn test_short_payloads_are_malformed() {
    for len in 0..4 {
        let data = vec![0u8; len];
        assert_eq!(
            parse_cycling_power_measurement(&data),
            Err(DecodeError::MalformedPayload { len, required: 4 })
        );
    }
}

#[test]
fn test_malformed_payload_leaves_state_unchanged() {
    let mut decoder = MeasurementDecoder::default();
    let start = Instant::now();

    decoder.decode(POWER, &cpm(200, Some((10, 1024))), start).unwrap();
    let before = *decoder.state(POWER);

    for len in 0..4 {
        let result = decoder.decode(POWER, &vec![0x20; len], start + Duration::from_secs(1));
        assert!(result.is_err());
        assert_eq!(*decoder.state(POWER), before);
    }
}

#[test]
fn test_malformed_on_fresh_decoder() {
    let mut decoder = MeasurementDecoder::default();
    assert!(decoder.decode(POWER, &[0x00, 0x00], Instant::now()).is_err());
    assert_eq!(*decoder.state(POWER), DecoderState::default());
}

#[test]
fn test_decode_sequence() {
    let mut decoder = MeasurementDecoder::default();
    let start = Instant::now();

    let first = decoder.decode(POWER, &cpm(210, Some((100, 10_240))), start).unwrap();
    assert_eq!(first.power_watts, Some(210));
    assert_eq!(first.cadence, CadenceUpdate::Seeded);

    // 3 revolutions in 2 seconds = 90 RPM
    let second = decoder
        .decode(
            POWER,
            &cpm(220, Some((103, 12_288))),
            start + Duration::from_secs(2),
        )
        .unwrap();
    assert_eq!(second.power_watts, Some(220));
    assert_eq!(second.cadence, CadenceUpdate::Computed(90));

    let third = decoder
        .decode(POWER, &cpm(230, None), start + Duration::from_millis(2500))
        .unwrap();
    assert_eq!(third.power_watts, Some(230));
    assert_eq!(third.cadence, CadenceUpdate::Hold);
}

#[test]
fn test_reset_restores_sentinel() {
    let mut decoder = MeasurementDecoder::default();
    decoder.decode(POWER, &cpm(0, Some((1, 500))), Instant::now()).unwrap();
    assert!(decoder.state(POWER).has_prior_sample());

    decoder.reset();
    assert!(!decoder.state(POWER).has_prior_sample());
    assert_eq!(*decoder.state(POWER), DecoderState::default());
}

#[test]
fn test_parse_csc_crank_only() {
    // Flags: 0x02, Crank revs: 42, Event time: 4096
    let data = [0x02, 0x2A, 0x00, 0x00, 0x10];
    let result = parse_csc_measurement(&data).unwrap();

    assert!(result.wheel.is_none());
    let crank = result.crank.unwrap();
    assert_eq!(crank.revolutions, 42);
    assert_eq!(crank.event_time, 4096);
}

#[test]
fn test_parse_csc_wheel_and_crank() {
    // Flags: 0x03, Wheel revs: 1000, Wheel time: 2048, Crank revs: 7, Crank time: 1024
    let data = [
        0x03, 0xE8, 0x03, 0x00, 0x00, 0x00, 0x08, 0x07, 0x00, 0x00, 0x04,
    ];
    let result = parse_csc_measurement(&data).unwrap();

    let wheel = result.wheel.unwrap();
    assert_eq!(wheel.revolutions, 1000);
    assert_eq!(wheel.event_time, 2048);

    let crank = result.crank.unwrap();
    assert_eq!(crank.revolutions, 7);
    assert_eq!(crank.event_time, 1024);
}

#[test]
fn test_parse_csc_truncated() {
    assert!(parse_csc_measurement(&[]).is_err());
    assert!(parse_csc_measurement(&[0x02, 0x01, 0x00]).is_err());
    assert!(parse_csc_measurement(&[0x01, 0x00, 0x00, 0x00]).is_err());
}

#[test]
fn test_csc_decoder_reports_no_power() {
    let mut decoder = MeasurementDecoder::default();
    let start = Instant::now();

    let first = decoder.decode(CSC, &[0x02, 0x0A, 0x00, 0x00, 0x04], start).unwrap();
    assert_eq!(first.power_watts, None);
    assert_eq!(first.cadence, CadenceUpdate::Seeded);

    // 1 revolution in 0.75 s = 80 RPM
    let second = decoder
        .decode(
            CSC,
            &[0x02, 0x0B, 0x00, 0x00, 0x07],
            start + Duration::from_millis(750),
        )
        .unwrap();
    assert_eq!(second.cadence, CadenceUpdate::Computed(80));
}
