pub mod servo;

pub use servo::{LinkState, ServoHub};
