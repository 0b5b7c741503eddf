#![no_std]
#![allow(async_fn_in_trait)]

#[cfg(test)]
extern crate std;

// must come first so the logging macros are visible to every module below
#[macro_use]
mod fmt;

pub mod config;
pub mod drivers;
pub mod ipc;
pub mod tasks;

pub use config::LinkConfig;
pub use drivers::servo::{
    ByteOrder, CommError, ErrorKind, FeetechServo, GroupSyncRead, GroupSyncWrite, ServoBus,
    ServoError, ServoMap, ServoMode, StatusError, Transport, UartTransport, Width,
};
pub use tasks::{LinkState, ServoHub};
