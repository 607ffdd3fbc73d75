use std::time::Duration;

use crate::constants::{
    DEFAULT_PAGE_SIZE, DEFAULT_RELAY_URL, METADATA_DEBOUNCE_MS, RECONNECT_DELAY_MS,
};

#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub read_relays: Vec<String>,
    pub write_relays: Vec<String>,
    pub page_size: usize,
    pub metadata_debounce: Duration,
    pub reconnect_delay: Duration,
}

impl CoreConfig {
    pub fn new(read_relays: Vec<String>, write_relays: Vec<String>) -> Self {
        Self {
            read_relays,
            write_relays,
            ..Self::default()
        }
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            read_relays: vec![DEFAULT_RELAY_URL.to_string()],
            write_relays: vec![DEFAULT_RELAY_URL.to_string()],
            page_size: DEFAULT_PAGE_SIZE,
            metadata_debounce: Duration::from_millis(METADATA_DEBOUNCE_MS),
            reconnect_delay: Duration::from_millis(RECONNECT_DELAY_MS),
        }
    }
}
