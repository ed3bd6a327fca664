//! Per-device protocol state machine (§4.3, §4.3b): pairing and normal
//! command dispatch. Both drive a borrowed [`crate::device::Device`] and
//! [`crate::ble::Connection`] through one exchange at a time; the tagged
//! states below replace the "ad-hoc challenge tracking" the source used
//! (§9 design note), making stray-reply handling total instead of a
//! mutable enum field checked by convention.

pub mod dispatch;
pub mod pairing;

use crate::codec::Command;

/// What the session is currently waiting to receive. `None` means idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedReply {
    AwaitingPublicKey,
    AwaitingChallenge(Command),
    AwaitingStatus(Command),
    AwaitingKeyturner,
    AwaitingConfig,
}

/// Drains notifications on a characteristic into an `mpsc` channel so the
/// pairing/dispatch state machines can `.await` one reply at a time instead
/// of juggling a callback, the same shape the teacher's `oneshot` approval
/// signal gives `submit_pair_request`/`signal_approval` in `pairing.rs`.
pub(crate) fn notify_channel() -> (
    Box<dyn FnMut(uuid::Uuid, Vec<u8>) + Send>,
    tokio::sync::mpsc::UnboundedReceiver<(uuid::Uuid, Vec<u8>)>,
) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let handler = Box::new(move |uuid, bytes| {
        let _ = tx.send((uuid, bytes));
    });
    (handler, rx)
}
