use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::constants::{
    make_inhaler_string_uuid, CONNECT_DEADLINE, DEVICE_NAME, EVENT_BUFFER, POLL_DELAY, SCAN_TIMEOUT, WRITE_DEADLINE,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub device_name: String,
    pub scan_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub connect_timeout_ms: u64,
    pub write_timeout_ms: u64,
    pub data_characteristic: Uuid,
    // the peripheral accepts "START" on the data characteristic too
    pub control_characteristic: Uuid,
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device_name: DEVICE_NAME.to_string(),
            scan_timeout_ms: SCAN_TIMEOUT,
            poll_interval_ms: POLL_DELAY,
            connect_timeout_ms: CONNECT_DEADLINE,
            write_timeout_ms: WRITE_DEADLINE,
            data_characteristic: make_inhaler_string_uuid(),
            control_characteristic: make_inhaler_string_uuid(),
            event_buffer: EVENT_BUFFER,
        }
    }
}
