use tokio::time::{Duration, Instant};

use crate::device::constants::{BATTERY_REFRESH_INTERVAL, PRESSURE_DEAD_BAND, PRESSURE_RESOLUTION};
use crate::device::protocol::{decode, NotificationCounter, TemperatureReading};
use crate::error::ProtocolDecodeError;

/// A successfully decoded notification, calibrated with the current zero offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reading {
    pub raw_pressure: i16,
    pub pressure: i32,
    pub temperature: Option<TemperatureReading>,
    pub misaligned: bool,
}

/**
 * Calibration and cadence state for one bound device. Outlives any single connection: only the
 * notification counter is reset when a new link is established.
 */
#[derive(Debug, Default)]
pub struct SessionState {
    zero_offset: i32,
    counter: NotificationCounter,
    last_raw_pressure: Option<i16>,
    last_reported_pressure: Option<i32>,
    battery: Option<u8>,
    last_battery_read: Option<Instant>,
    decode_errors: u64,
    misaligned_notifications: u64,
    misalignment_warned: bool,
}

/// Round to the nearest PRESSURE_RESOLUTION, ties to even.
fn round_pressure(value: i32) -> i32 {
    let quotient = value.div_euclid(PRESSURE_RESOLUTION);
    let remainder = value.rem_euclid(PRESSURE_RESOLUTION) * 2;

    let round_up = remainder > PRESSURE_RESOLUTION
        || (remainder == PRESSURE_RESOLUTION && quotient.rem_euclid(2) == 1);

    if round_up {
        (quotient + 1) * PRESSURE_RESOLUTION
    } else {
        quotient * PRESSURE_RESOLUTION
    }
}

impl SessionState {
    pub fn new() -> Self {
        SessionState::default()
    }

    pub fn zero_offset(&self) -> i32 {
        self.zero_offset
    }

    pub fn counter(&self) -> NotificationCounter {
        self.counter
    }

    pub fn last_raw_pressure(&self) -> Option<i16> {
        self.last_raw_pressure
    }

    pub fn battery(&self) -> Option<u8> {
        self.battery
    }

    pub fn last_battery_read(&self) -> Option<Instant> {
        self.last_battery_read
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors
    }

    pub fn misaligned_notifications(&self) -> u64 {
        self.misaligned_notifications
    }

    /// True for the first misaligned notification since the last (re)connect.
    pub fn should_warn_misalignment(&mut self) -> bool {
        !std::mem::replace(&mut self.misalignment_warned, true)
    }

    pub fn apply_zero(&self, raw_pressure: i16) -> i32 {
        i32::from(raw_pressure) - self.zero_offset
    }

    pub fn set_zero(&mut self, raw_pressure: i16) {
        self.zero_offset = i32::from(raw_pressure);
    }

    pub fn reset_counter_on_new_connection(&mut self) {
        self.counter = NotificationCounter::default();
        self.misalignment_warned = false;
    }

    /// Decode a notification and advance the counter. A payload without a readable pressure field
    /// leaves the counter where it was.
    pub fn ingest(&mut self, data: &[u8]) -> Result<Reading, ProtocolDecodeError> {
        match decode(data, self.counter) {
            Ok(decoded) => {
                self.counter = decoded.next_counter;
                self.last_raw_pressure = Some(decoded.pressure);
                if decoded.misaligned {
                    self.misaligned_notifications += 1;
                }

                Ok(Reading {
                    raw_pressure: decoded.pressure,
                    pressure: self.apply_zero(decoded.pressure),
                    temperature: decoded.temperature,
                    misaligned: decoded.misaligned,
                })
            },
            Err(err) => {
                self.decode_errors += 1;
                if err.pressure_parsed() {
                    self.counter = self.counter.next();
                }
                Err(err)
            },
        }
    }

    /// Round the calibrated pressure and apply the dead-band. Returns the value to report, if any.
    pub fn filter_pressure(&mut self, calibrated: i32) -> Option<i32> {
        let rounded = round_pressure(calibrated);

        match self.last_reported_pressure {
            Some(previous) if (rounded - previous).abs() <= PRESSURE_DEAD_BAND => None,
            _ => {
                self.last_reported_pressure = Some(rounded);
                Some(rounded)
            },
        }
    }

    pub fn set_battery(&mut self, level: u8, now: Instant) {
        self.battery = Some(level.min(100));
        self.last_battery_read = Some(now);
    }

    pub fn battery_due_for_refresh(&self, now: Instant) -> bool {
        match self.last_battery_read {
            None => true,
            Some(last) => now.saturating_duration_since(last) > Duration::from_millis(BATTERY_REFRESH_INTERVAL),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_offset_calibrates_subsequent_readings() {
        let mut session = SessionState::new();
        assert_eq!(session.apply_zero(500), 500);

        session.set_zero(500);
        assert_eq!(session.apply_zero(500), 0);
        assert_eq!(session.apply_zero(700), 200);
    }

    #[test]
    fn repeated_zero_has_no_drift() {
        let mut session = SessionState::new();
        let reading = session.ingest(&[0x03, 0xE8]).unwrap();

        session.set_zero(reading.raw_pressure);
        let first = session.apply_zero(reading.raw_pressure);
        session.set_zero(reading.raw_pressure);
        let second = session.apply_zero(reading.raw_pressure);

        assert_eq!(first - second, 0);
        assert_eq!(first, 0);
    }

    #[test]
    fn zero_does_not_rewrite_earlier_readings() {
        let mut session = SessionState::new();
        let before = session.ingest(&[0x01, 0xF4]).unwrap();
        session.set_zero(500);
        let after = session.ingest(&[0x01, 0xF4]).unwrap();

        assert_eq!(before.pressure, 500);
        assert_eq!(after.pressure, 0);
    }

    #[test]
    fn ingest_calibrates_and_advances_counter() {
        let mut session = SessionState::new();
        session.set_zero(100);

        let reading = session.ingest(&[0x00, 0xC8, 0x00, 0x5A]).unwrap();
        assert_eq!(reading.raw_pressure, 200);
        assert_eq!(reading.pressure, 100);
        assert_eq!(reading.temperature, Some(TemperatureReading(90)));
        assert_eq!(session.counter().value(), 1);
        assert_eq!(session.last_raw_pressure(), Some(200));
    }

    #[test]
    fn malformed_payload_leaves_counter_unchanged() {
        let mut session = SessionState::new();
        session.ingest(&[0x00, 0x01]).unwrap();
        session.ingest(&[0x00, 0x01]).unwrap();

        assert!(session.ingest(&[]).is_err());
        assert_eq!(session.counter().value(), 2);
        assert_eq!(session.decode_errors(), 1);
        assert_eq!(session.last_raw_pressure(), Some(1));
    }

    #[test]
    fn truncated_temperature_advances_counter() {
        let mut session = SessionState::new();
        assert!(session.ingest(&[0x00, 0x01, 0x00]).is_err());
        assert_eq!(session.counter().value(), 1);
        assert_eq!(session.decode_errors(), 1);
    }

    #[test]
    fn reset_counter_returns_to_phase_zero() {
        let mut session = SessionState::new();
        for _ in 0..7 {
            session.ingest(&[0x00, 0x01]).unwrap();
        }
        assert_eq!(session.counter().value(), 7);

        session.set_zero(1);
        session.reset_counter_on_new_connection();
        assert_eq!(session.counter().value(), 0);
        assert_eq!(session.zero_offset(), 1);
    }

    #[test]
    fn misalignment_is_counted_and_warned_once_per_connection() {
        let mut session = SessionState::new();
        assert!(!session.ingest(&[0x00, 0x01, 0x00, 0x5A]).unwrap().misaligned);

        let reading = session.ingest(&[0x00, 0x01, 0x00, 0x5A]).unwrap();
        assert!(reading.misaligned);
        assert_eq!(reading.temperature, None);
        assert!(session.should_warn_misalignment());

        session.ingest(&[0x00, 0x01, 0x00, 0x5A]).unwrap();
        assert!(!session.should_warn_misalignment());
        assert_eq!(session.misaligned_notifications(), 2);

        session.reset_counter_on_new_connection();
        assert!(session.should_warn_misalignment());
        assert_eq!(session.misaligned_notifications(), 2);
    }

    #[test]
    fn rounding_ties_to_even() {
        assert_eq!(round_pressure(1004), 1000);
        assert_eq!(round_pressure(1005), 1000);
        assert_eq!(round_pressure(1015), 1020);
        assert_eq!(round_pressure(1006), 1010);
        assert_eq!(round_pressure(-6), -10);
        assert_eq!(round_pressure(-15), -20);
        assert_eq!(round_pressure(-16), -20);
        assert_eq!(round_pressure(4), 0);
    }

    #[test]
    fn dead_band_filters_noise() {
        let mut session = SessionState::new();
        assert_eq!(session.filter_pressure(1000), Some(1000));
        assert_eq!(session.filter_pressure(1004), None);
        assert_eq!(session.filter_pressure(1005), None);
        assert_eq!(session.filter_pressure(1006), None);
        assert_eq!(session.filter_pressure(1016), Some(1020));
    }

    #[test]
    fn dead_band_around_zero() {
        let mut session = SessionState::new();
        assert_eq!(session.filter_pressure(4), Some(0));
        assert_eq!(session.filter_pressure(-6), None);
        assert_eq!(session.filter_pressure(-16), Some(-20));
        assert_eq!(session.filter_pressure(16), Some(20));
    }

    #[test]
    fn battery_refresh_cadence() {
        let mut session = SessionState::new();
        let now = Instant::now();
        assert!(session.battery_due_for_refresh(now));

        session.set_battery(42, now);
        assert_eq!(session.battery(), Some(42));
        assert!(!session.battery_due_for_refresh(now + Duration::from_secs(23 * 3600)));
        assert!(session.battery_due_for_refresh(now + Duration::from_secs(24 * 3600 + 1)));
    }

    #[test]
    fn battery_reading_is_clamped() {
        let mut session = SessionState::new();
        session.set_battery(255, Instant::now());
        assert_eq!(session.battery(), Some(100));
    }
}
