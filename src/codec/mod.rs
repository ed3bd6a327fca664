//! Wire framing, command codes, and typed payloads (§4.1).

pub mod command;
pub mod frame;
pub mod payload;

pub use command::{Command, LockAction};
