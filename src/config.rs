// Centralize all configuration constants
use crate::drivers::servo::codec::ByteOrder;

pub const DEFAULT_BAUDRATE: u32 = 1_000_000;

/// Fixed per-transaction latency allowance (adapter + servo return delay), in ms.
pub const LATENCY_TIMER_MS: u64 = 16;

/// Wait slice handed to the transport while a status frame is still incomplete.
pub const RX_POLL_INTERVAL_US: u64 = 500;

/// Input purge before a transmit: stop after the line has been idle this long,
/// or after the whole window, whichever comes first.
pub const FLUSH_IDLE_US: u64 = 500;
pub const FLUSH_WINDOW_MS: u64 = 5;

// Queue / table sizes
pub const COMMAND_QUEUE_DEPTH: usize = 8;
pub const MAX_SERVOS: usize = 32; // power of two, FnvIndexMap capacity
pub const SCAN_MAX_ID: u8 = 253;

/// Everything `connect` needs to bring a bus up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkConfig {
    pub baud_rate: u32,
    pub byte_order: ByteOrder,
    pub latency_timer_ms: u64,
}

impl LinkConfig {
    pub const fn new(baud_rate: u32, byte_order: ByteOrder) -> Self {
        Self {
            baud_rate,
            byte_order,
            latency_timer_ms: LATENCY_TIMER_MS,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BAUDRATE, ByteOrder::LittleEndian)
    }
}
