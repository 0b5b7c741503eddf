use core::fmt;

use super::protocol as p;

/* ------------------------------------------------------------------------- */
/*  Transport / protocol failures                                            */
/* ------------------------------------------------------------------------- */
/// Outcome of one failed transaction attempt. Never retried by the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CommError {
    /// Another transaction holds the port.
    PortBusy,
    /// The transport accepted fewer bytes than the frame length.
    TxFail,
    /// The frame could not be encoded (too large or reply-only instruction).
    TxError,
    /// Nothing arrived before the deadline.
    RxTimeout,
    /// Bytes arrived but failed header, length, checksum or id validation.
    RxCorrupt,
    /// The operation makes no sense for this target (e.g. reading from broadcast).
    NotAvailable,
}

impl CommError {
    pub const fn as_str(self) -> &'static str {
        match self {
            CommError::PortBusy => "port is in use",
            CommError::TxFail => "failed to transmit instruction packet",
            CommError::TxError => "incorrect instruction packet",
            CommError::RxTimeout => "no status packet received",
            CommError::RxCorrupt => "incorrect status packet",
            CommError::NotAvailable => "protocol does not support this function",
        }
    }
}

impl fmt::Display for CommError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/* ------------------------------------------------------------------------- */
/*  Device fault bits                                                        */
/* ------------------------------------------------------------------------- */
/// Error byte of a status packet. Reported next to a successful result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatusError(pub u8);

impl StatusError {
    pub const NONE: Self = Self(0);

    const NAMES: [(u8, &'static str); 5] = [
        (p::ERRBIT_VOLTAGE, "input voltage"),
        (p::ERRBIT_ANGLE, "angle sensor"),
        (p::ERRBIT_OVERHEAT, "overheat"),
        (p::ERRBIT_OVERELE, "overcurrent"),
        (p::ERRBIT_OVERLOAD, "overload"),
    ];

    pub const fn bits(self) -> u8 {
        self.0
    }
    pub const fn is_ok(self) -> bool {
        self.0 == 0
    }
    pub const fn voltage(self) -> bool {
        self.0 & p::ERRBIT_VOLTAGE != 0
    }
    pub const fn angle_sensor(self) -> bool {
        self.0 & p::ERRBIT_ANGLE != 0
    }
    pub const fn overheat(self) -> bool {
        self.0 & p::ERRBIT_OVERHEAT != 0
    }
    pub const fn overcurrent(self) -> bool {
        self.0 & p::ERRBIT_OVERELE != 0
    }
    pub const fn overload(self) -> bool {
        self.0 & p::ERRBIT_OVERLOAD != 0
    }
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ok() {
            return f.write_str("no fault");
        }
        let mut first = true;
        for (bit, name) in Self::NAMES {
            if self.0 & bit != 0 {
                if !first {
                    f.write_str(", ")?;
                }
                write!(f, "{name} error")?;
                first = false;
            }
        }
        if first {
            write!(f, "unknown fault 0x{:02X}", self.0)?;
        }
        Ok(())
    }
}

/* ------------------------------------------------------------------------- */
/*  Facade error                                                             */
/* ------------------------------------------------------------------------- */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ErrorKind {
    Comm(CommError),
    NotConnected,
    AlreadyConnected,
    OpenFailed,
    InvalidArgument,
    UnexpectedReply,
}

impl From<CommError> for ErrorKind {
    fn from(e: CommError) -> Self {
        Self::Comm(e)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Comm(e) => write!(f, "{e} ({e:?})"),
            ErrorKind::NotConnected => f.write_str("bus is not connected"),
            ErrorKind::AlreadyConnected => f.write_str("bus is already connected"),
            ErrorKind::OpenFailed => f.write_str("transport refused to open"),
            ErrorKind::InvalidArgument => f.write_str("argument out of range"),
            ErrorKind::UnexpectedReply => f.write_str("worker returned an unexpected reply"),
        }
    }
}

/// What a caller of the command API sees: which servo, which operation, why.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ServoError {
    pub id: Option<u8>,
    pub op: &'static str,
    pub kind: ErrorKind,
}

impl ServoError {
    pub fn new(id: Option<u8>, op: &'static str, kind: impl Into<ErrorKind>) -> Self {
        Self {
            id,
            op,
            kind: kind.into(),
        }
    }

    pub fn comm(&self) -> Option<CommError> {
        match self.kind {
            ErrorKind::Comm(e) => Some(e),
            _ => None,
        }
    }
}

impl fmt::Display for ServoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.id {
            Some(id) => write!(f, "servo {id}: {} failed: {}", self.op, self.kind),
            None => write!(f, "bus: {} failed: {}", self.op, self.kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::ToString;

    #[test]
    fn status_error_lists_active_faults() {
        let e = StatusError(p::ERRBIT_OVERHEAT | p::ERRBIT_OVERLOAD);
        assert!(e.overheat() && e.overload());
        assert!(!e.voltage());
        assert_eq!(e.to_string(), "overheat error, overload error");
        assert_eq!(StatusError::NONE.to_string(), "no fault");
    }

    #[test]
    fn servo_error_names_device_and_operation() {
        let e = ServoError::new(Some(3), "read_position", CommError::RxTimeout);
        assert_eq!(
            e.to_string(),
            "servo 3: read_position failed: no status packet received (RxTimeout)"
        );
        assert_eq!(e.comm(), Some(CommError::RxTimeout));

        let e = ServoError::new(None, "connect", ErrorKind::OpenFailed);
        assert_eq!(e.to_string(), "bus: connect failed: transport refused to open");
    }
}
