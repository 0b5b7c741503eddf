//! Feetech SCS/STS serial-bus servos: frame codec, packet transactor,
//! sync-read/sync-write coordinators and the named-operation driver.

pub mod bus;
pub mod codec;
pub mod driver;
pub mod error;
pub mod group_read;
pub mod group_write;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod protocol;
pub mod transport;

pub use bus::{packet_timeout, PortSession, ServoBus};
pub use codec::{ByteOrder, Instruction, StatusPacket};
pub use driver::{FeetechServo, ServoIds, ServoMap, ServoMode, Width};
pub use error::{CommError, ErrorKind, ServoError, StatusError};
pub use group_read::GroupSyncRead;
pub use group_write::GroupSyncWrite;
#[cfg(any(test, feature = "mock"))]
pub use mock::MockTransport;
pub use transport::{Transport, UartTransport};
