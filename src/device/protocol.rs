use serde::Serialize;

use crate::device::constants::TEMPERATURE_CADENCE;
use crate::error::ProtocolDecodeError;

/**
 * Position of a notification within the temperature cadence, counted since the last subscription.
 * Wraps modulo TEMPERATURE_CADENCE.
 */
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NotificationCounter(u8);

impl NotificationCounter {
    pub fn new(value: u8) -> Self {
        NotificationCounter(value % TEMPERATURE_CADENCE)
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn next(&self) -> Self {
        NotificationCounter::new(self.0 + 1)
    }

    pub fn is_temperature_phase(&self) -> bool {
        self.0 == 0
    }
}

/// Temperature in tenths of a degree Celsius, as sent by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TemperatureReading(pub i16);

impl TemperatureReading {
    pub fn celsius(&self) -> f32 {
        f32::from(self.0) / 10.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub pressure: i16, // millibar, not calibrated
    pub temperature: Option<TemperatureReading>,
    pub next_counter: NotificationCounter,
    /// The payload shape disagrees with the counter: a trailing field outside the temperature
    /// phase, or no temperature field at it.
    pub misaligned: bool,
}

fn read_i16(data: &[u8], offset: usize) -> Option<i16> {
    let bytes = data.get(offset..offset + 2)?;
    Some(i16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Decode one pressure notification.
///
/// Bytes 0..2 are the pressure (i16 big-endian, millibar). When `counter` is at the temperature
/// phase, bytes 2..4 are the temperature (i16 big-endian, tenths of a degree); trailing bytes at
/// any other phase are not decoded. Either mismatch sets `misaligned`. On error,
/// `ProtocolDecodeError::pressure_parsed` tells whether the counter should still advance.
pub fn decode(data: &[u8], counter: NotificationCounter) -> Result<Decoded, ProtocolDecodeError> {
    let pressure = read_i16(data, 0).ok_or(ProtocolDecodeError::TooShort { len: data.len() })?;

    let has_trailing = data.len() > 2;
    let temperature = if counter.is_temperature_phase() && has_trailing {
        let raw = read_i16(data, 2).ok_or(ProtocolDecodeError::TruncatedTemperature { len: data.len() })?;
        Some(TemperatureReading(raw))
    } else {
        None
    };

    Ok(Decoded {
        pressure,
        temperature,
        next_counter: counter.next(),
        misaligned: counter.is_temperature_phase() != has_trailing,
    })
}
