// SCServo / Feetech STS protocol constants + register list.

/* ───── Packet anatomy ──────────────────────────────────────────────── */
pub const HDR_BYTE: u8 = 0xFF; // sync byte
pub const HEADER: [u8; 2] = [HDR_BYTE, HDR_BYTE];

/// Indexes within every transmitted / received frame
pub mod idx {
    pub const ID: usize = 2; // servo ID
    pub const LENGTH: usize = 3; // bytes after this field incl. ERR/INST
    pub const INSTRUCTION: usize = 4; // only in tx packet
    pub const ERROR: usize = 4; // only in status packet
    pub const PARAM_0: usize = 5; // first parameter / data byte
}

/// Absolute packet size limits enforced by the legacy firmware
pub const TXPACKET_MAX_LEN: usize = 250;
pub const RXPACKET_MAX_LEN: usize = 250;

/// FF FF ID LEN ERR CHK: the smallest status frame, and the overhead of every frame.
pub const STATUS_MIN_LEN: usize = 6;
/// Largest data block one frame can carry.
pub const MAX_DATA_LEN: usize = RXPACKET_MAX_LEN - STATUS_MIN_LEN;

/* ────────────────── Basic IDs ─────────────────── */
pub const BROADCAST_ID: u8 = 0xFE; // 254
pub const MAX_ID: u8 = 0xFC; // 252
pub const MAX_STATUS_ID: u8 = 0xFD; // 0xFE / 0xFF never answer

/* ────────────────── Instructions ──────────────── */
pub const INST_PING: u8 = 1;
pub const INST_READ: u8 = 2;
pub const INST_WRITE: u8 = 3;
pub const INST_REG_WRITE: u8 = 4;
pub const INST_ACTION: u8 = 5;
pub const INST_SYNC_WRITE: u8 = 0x83;
pub const INST_SYNC_READ: u8 = 0x82;

/* ────────────────── Error bits in status packet ─ */
pub const ERRBIT_VOLTAGE: u8 = 1 << 0;
pub const ERRBIT_ANGLE: u8 = 1 << 1;
pub const ERRBIT_OVERHEAT: u8 = 1 << 2;
pub const ERRBIT_OVERELE: u8 = 1 << 3;
pub const ERRBIT_OVERLOAD: u8 = 1 << 5;

/* ────────────────── Baud‑rate codes ───────────── */
pub const BAUD_1M: u8 = 0;
pub const BAUD_500K: u8 = 1;
pub const BAUD_250K: u8 = 2;
pub const BAUD_128K: u8 = 3;
pub const BAUD_115K2: u8 = 4;
pub const BAUD_76K8: u8 = 5;
pub const BAUD_57K6: u8 = 6;
pub const BAUD_38K4: u8 = 7;

/// Baud rate selected by a `REG_BAUD_RATE` code.
pub const fn baud_for_code(code: u8) -> Option<u32> {
    match code {
        BAUD_1M => Some(1_000_000),
        BAUD_500K => Some(500_000),
        BAUD_250K => Some(250_000),
        BAUD_128K => Some(128_000),
        BAUD_115K2 => Some(115_200),
        BAUD_76K8 => Some(76_800),
        BAUD_57K6 => Some(57_600),
        BAUD_38K4 => Some(38_400),
        _ => None,
    }
}

/* ────────────────── Register addresses ────────── */
/* EEPROM */
pub const REG_MODEL: u8 = 3;
pub const REG_ID: u8 = 5;
pub const REG_BAUD_RATE: u8 = 6;
/* SRAM */
pub const REG_MODE: u8 = 33;
pub const REG_TORQUE_ENABLE: u8 = 40;
pub const REG_ACC: u8 = 41;
pub const REG_GOAL_POSITION_L: u8 = 42;
pub const REG_GOAL_SPEED_L: u8 = 46;
pub const REG_LOCK: u8 = 55;
pub const REG_PRESENT_POSITION_L: u8 = 56;

/// EEPROM write protection values for `REG_LOCK`.
pub const LOCK_OFF: u8 = 0;
pub const LOCK_ON: u8 = 1;

/// Highest goal position a 12‑bit encoder accepts.
pub const POSITION_MAX: u16 = 4095;
/// Direction flag of sign‑magnitude speed words.
pub const SPEED_SIGN_BIT: u16 = 1 << 15;
