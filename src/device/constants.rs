use uuid::Uuid;

/**
 * The advertised local name of the inhaler sensor.
 */
pub const DEVICE_NAME: &str = "Nano33IoT";

/**
 * How long (milliseconds) a discovery scan may take before the device is considered not found.
 */
pub const SCAN_TIMEOUT: u64 = 5000;

/**
 * How often (milliseconds) the keep-alive loop checks the stop flag and the connection status.
 * Also used as the interval in which discovered peripherals are inspected while scanning.
 */
pub const POLL_DELAY: u64 = 100;

/**
 * How long (milliseconds) establishing a link may take.
 */
pub const CONNECT_DEADLINE: u64 = 10000;

/**
 * How long (milliseconds) a write to a characteristic may take.
 */
pub const WRITE_DEADLINE: u64 = 2000;

/**
 * How long (milliseconds) checking if the peripheral is still connected may take
 */
pub const IS_CONNECTED_DEADLINE: u64 = 2000;

/**
 * How many events may be queued for a single subscriber before new events are dropped for it.
 */
pub const EVENT_BUFFER: usize = 64;

/**
 * The UUID of the characteristic that streams sensor readings as utf-8 text, one reading per
 * notification.
 */
pub const INHALER_STRING_CHARACTERISTIC: &str = "3b0d6406-ad62-49a0-aec3-ea8a17cc25fe";

pub const COMMAND_START: &[u8] = b"START";

pub fn make_inhaler_string_uuid() -> Uuid {
    Uuid::from_u128(0x3b0d6406_ad62_49a0_aec3_ea8a17cc25fe)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_uuid_matches_constant() {
        assert_eq!(make_inhaler_string_uuid(), Uuid::parse_str(INHALER_STRING_CHARACTERISTIC).unwrap());
    }
}
