use btleplug::api::bleuuid::uuid_from_u16;
use uuid::Uuid;

/**
 * How long (milliseconds) a single connect + subscribe attempt may take before it counts as failed.
 */
pub const CONNECT_TIMEOUT: u64 = 20_000;

/**
 * How long (milliseconds) without any advertisement before the manager attempts a connection anyway.
 */
pub const FALLBACK_POLL_INTERVAL: u64 = 5 * 60 * 1000;

/**
 * Delay (milliseconds) before the first retry after a failed connect or a lost link.
 * Doubles for each consecutive failure.
 */
pub const RETRY_BASE_DELAY: u64 = 15_000;

/**
 * Number of consecutive failed attempts after which retries stop until the next advertisement
 * or fallback poll.
 */
pub const MAX_CONNECT_RETRIES: u32 = 5;

/**
 * How often (milliseconds) to attempt to restart a scan that ended or failed.
 */
pub const SCAN_RESTART_DELAY: u64 = 1000;

/**
 * How long (milliseconds) a write to / read from a characteristic may take.
 */
pub const WRITE_DEADLINE: u64 = 2000;

/**
 * How old (milliseconds) the last successful battery read may be before it is refreshed.
 */
pub const BATTERY_REFRESH_INTERVAL: u64 = 24 * 60 * 60 * 1000;

/**
 * How often (milliseconds) the session checks whether the battery is due for a refresh. A due check
 * while disconnected starts a connect attempt.
 */
pub const BATTERY_CHECK_TICK: u64 = 60 * 60 * 1000;

/**
 * How often (milliseconds) a connected session asks the adapter whether the link is still up.
 */
pub const LIVENESS_CHECK_INTERVAL: u64 = 10_000;

/**
 * How long (milliseconds) the adapter may take to answer a liveness check.
 */
pub const IS_CONNECTED_DEADLINE: u64 = 2000;

/**
 * Notifications carry a temperature field once every this many notifications since subscribing.
 */
pub const TEMPERATURE_CADENCE: u8 = 16;

/**
 * Calibrated pressure is reported rounded to this many millibar.
 */
pub const PRESSURE_RESOLUTION: i32 = 10;

/**
 * A rounded pressure is only reported when it moved more than this many millibar.
 */
pub const PRESSURE_DEAD_BAND: i32 = 10;

/**
 * Advertised names of supported devices start with this prefix.
 */
pub const DEVICE_NAME_PREFIX: &str = "PRS";

/**
 * The UUID of the Bluetooth BLE service carrying pressure notifications and the zero command
 */
pub const PRESSURE_SERVICE: &str = "873ae82a-4c5a-4342-b539-9d900bf7ebd0";

pub const BATTERY_SERVICE: u16 = 0x180F;
pub const BATTERY_LEVEL_CHARACTERISTIC: u16 = 0x2A19;

pub const COMMAND_ZERO_PRESSURE: [u8; 1] = [0x00];

pub fn make_pressure_service_uuid() -> Uuid {
    Uuid::from_u128(0x873ae82a_4c5a_4342_b539_9d900bf7ebd0)
}

pub fn make_battery_service_uuid() -> Uuid {
    uuid_from_u16(BATTERY_SERVICE)
}

pub fn make_battery_level_uuid() -> Uuid {
    uuid_from_u16(BATTERY_LEVEL_CHARACTERISTIC)
}
