pub mod servo;

pub use servo::{FeetechServo, ServoBus, ServoError, Transport};
