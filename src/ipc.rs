//! Messages that travel through the servo hub's command queue.

use crate::config::LinkConfig;
use crate::drivers::servo::driver::{ServoIds, ServoMode, Width};

pub use crate::drivers::servo::driver::ServoMap;

/// One queued operation. The worker runs them strictly in arrival order.
pub enum Request {
    Connect(LinkConfig),
    Disconnect,
    Ping { id: u8 },
    Scan { first: u8, last: u8 },
    ReadRegister { id: u8, address: u8, width: Width },
    WriteRegister { id: u8, address: u8, width: Width, value: u32 },
    ReadPosition { id: u8 },
    WritePosition { id: u8, position: u16 },
    SetTorque { id: u8, enable: bool },
    ReadMode { id: u8 },
    WriteMode { id: u8, mode: ServoMode },
    SetAcceleration { id: u8, acceleration: u8 },
    WriteWheelSpeed { id: u8, speed: i16 },
    SetServoId { id: u8, new_id: u8 },
    SetBaudCode { id: u8, code: u8 },
    SyncReadPositions { ids: ServoIds },
    SyncWritePositions { targets: ServoMap<u16> },
    SyncWriteSpeeds { targets: ServoMap<i16> },
}

impl Request {
    /// Operation name as it appears in errors and logs.
    pub fn op(&self) -> &'static str {
        match self {
            Request::Connect(_) => "connect",
            Request::Disconnect => "disconnect",
            Request::Ping { .. } => "ping",
            Request::Scan { .. } => "scan",
            Request::ReadRegister { .. } => "read_register",
            Request::WriteRegister { .. } => "write_register",
            Request::ReadPosition { .. } => "read_position",
            Request::WritePosition { .. } => "write_position",
            Request::SetTorque { .. } => "set_torque",
            Request::ReadMode { .. } => "read_mode",
            Request::WriteMode { .. } => "write_mode",
            Request::SetAcceleration { .. } => "set_acceleration",
            Request::WriteWheelSpeed { .. } => "write_wheel_speed",
            Request::SetServoId { .. } => "set_servo_id",
            Request::SetBaudCode { .. } => "set_baud_code",
            Request::SyncReadPositions { .. } => "sync_read_positions",
            Request::SyncWritePositions { .. } => "sync_write_positions",
            Request::SyncWriteSpeeds { .. } => "sync_write_speeds",
        }
    }

    /// The single servo addressed, if any.
    pub fn target(&self) -> Option<u8> {
        match *self {
            Request::Ping { id }
            | Request::ReadRegister { id, .. }
            | Request::WriteRegister { id, .. }
            | Request::ReadPosition { id }
            | Request::WritePosition { id, .. }
            | Request::SetTorque { id, .. }
            | Request::ReadMode { id }
            | Request::WriteMode { id, .. }
            | Request::SetAcceleration { id, .. }
            | Request::WriteWheelSpeed { id, .. }
            | Request::SetServoId { id, .. }
            | Request::SetBaudCode { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Connect and disconnect run in any link state; everything else needs a live bus.
    pub fn is_lifecycle(&self) -> bool {
        matches!(self, Request::Connect(_) | Request::Disconnect)
    }
}

pub enum Reply {
    Done,
    Model(u16),
    Value(u32),
    Position(u16),
    Mode(ServoMode),
    Ids(ServoIds),
    Positions(ServoMap<u16>),
}

/// A request plus the index of the reply slot its caller is parked on.
pub struct Command {
    pub request: Request,
    pub slot: u8,
}
