//! Crate-wide error hierarchy.
//!
//! Each concern gets its own `thiserror` enum, the way the teacher crate keeps
//! `StorageManagerError`, `CryptoError`, etc. separate instead of one grab-bag.
//! [`BridgeError`] is the type returned across the core API in §6; the narrower
//! errors convert into it via `#[from]`.

use thiserror::Error;

use crate::device::DeviceId;

/// Errors raised while framing, unframing, or authenticating a wire message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame shorter than the minimum {min} bytes (got {got})")]
    ShortFrame { min: usize, got: usize },
    #[error("CRC-16/XMODEM mismatch: expected {expected:04x}, computed {computed:04x}")]
    CrcMismatch { expected: u16, computed: u16 },
    #[error("AEAD authentication failed")]
    AeadFailure,
    #[error("unknown command code {0:#06x}")]
    UnknownCommand(u16),
    #[error("payload truncated for command {command:#06x}: need {need} bytes, have {have}")]
    TruncatedPayload {
        command: u16,
        need: usize,
        have: usize,
    },
    #[error("unrecognized status byte {0:#04x} in STATUS reply")]
    UnknownStatus(u8),
}

/// Errors raised by the pairing and command-dispatch state machine.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("command timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("lock reported error {code}, offending command {command:#06x}")]
    ErrorReport { code: i8, command: u16 },
    #[error("pairing aborted: lock is not in pairing mode")]
    NotPairing,
    #[error("pairing aborted: {0}")]
    PairingAborted(String),
    #[error("received {got:#06x} while awaiting {expected:#06x}; dropped")]
    UnexpectedCommand { expected: u16, got: u16 },
    #[error("retries exhausted ({0}) talking to the device")]
    RetriesExhausted(u32),
}

/// Errors raised by the configuration persistence port.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error reading/writing the device store: {0}")]
    Io(String),
    #[error("malformed device record: {0}")]
    Malformed(String),
}

/// The error type returned by [`crate::bridge::NukiBridge`]'s public API.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no device with id {0}")]
    NotFound(DeviceId),
    #[error("device {0} is unreachable after exhausting retries")]
    DeviceUnreachable(String),
    #[error("device {0} rejected our credentials")]
    Unauthorized(String),
    #[error("scan failed after exhausting backoff attempts: {0}")]
    ScanFailed(String),
}
