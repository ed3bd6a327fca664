//! Normal command dispatch (§4.3b): `update_state`, `get_config`, and
//! `lock_action`, all framed encrypted over the service characteristic and
//! keyed by the device's `shared_key`/`auth_id`. The retry/backoff shape
//! mirrors the HMAC-over-device-state retry loop in AstroBox's
//! `auth.rs` (`AuthSystem::start_auth`), generalized to any one exchange.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::ble::Connection;
use crate::codec::command::{Command, LockAction};
use crate::codec::{frame, payload};
use crate::crypto;
use crate::device::{Config, Device, LockStateSnapshot, TaggedLockState};
use crate::error::SessionError;

async fn await_frame(
    rx: &mut UnboundedReceiver<(Uuid, Vec<u8>)>,
    shared_key: &[u8; 32],
    budget: Duration,
) -> Result<(u16, Vec<u8>), SessionError> {
    let (_char, bytes) = timeout(budget, rx.recv())
        .await
        .map_err(|_| SessionError::Timeout(budget))?
        .ok_or_else(|| SessionError::Transport("notification channel closed".into()))?;
    let (_auth_id, cmd, payload) = frame::decode_encrypted(shared_key, &bytes)?;
    Ok((cmd, payload))
}

/// Writes `cmd`/`payload` to `char_uuid`, retrying up to `device.timeouts.retries`
/// times with a 200 ms backoff between attempts (§4.3b `_send_data`).
async fn send_with_retry(
    conn: &dyn Connection,
    char_uuid: Uuid,
    device: &Device,
    cmd: Command,
    payload: &[u8],
) -> Result<(), SessionError> {
    let shared_key = device.shared_key.expect("shared_key derived before dispatch");
    let auth_id = device.auth_id.expect("auth_id assigned at pairing");
    let frame = frame::encode_encrypted(&shared_key, auth_id, cmd.code(), payload);

    let mut attempts = 0;
    loop {
        match conn.write(char_uuid, &frame).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                attempts += 1;
                warn!(%err, attempts, "write failed, retrying");
                if attempts >= device.timeouts.retries {
                    return Err(SessionError::RetriesExhausted(device.timeouts.retries));
                }
                sleep(Duration::from_millis(200)).await;
            }
        }
    }
}

/// Applies the §4.3b reception rules for one decrypted reply. Returns the
/// updated snapshot/config pieces so the caller can decide whether to notify
/// observers and whether a `get_config` chain is needed.
pub enum Reception {
    State(LockStateSnapshot),
    Config(Config),
    Status(payload::Status),
    ErrorReport(payload::ErrorReport),
    Unexpected(u16),
}

pub fn classify_reply(device: &Device, cmd: u16, body: &[u8]) -> Result<Reception, SessionError> {
    if cmd == Command::KeyturnerStates.code() {
        return Ok(Reception::State(payload::parse_keyturner_states(
            device.kind,
            body,
        )?));
    }
    if cmd == Command::Config.code() {
        return Ok(Reception::Config(payload::parse_config(device.kind, body)?));
    }
    if cmd == Command::Status.code() {
        return Ok(Reception::Status(payload::parse_status(body)?));
    }
    if cmd == Command::ErrorReport.code() {
        return Ok(Reception::ErrorReport(payload::parse_error_report(body)?));
    }
    Ok(Reception::Unexpected(cmd))
}

/// `update_state` (§4.3b): request `KEYTURNER_STATES`, no intermediate challenge.
pub async fn update_state(
    conn: &dyn Connection,
    char_uuid: Uuid,
    device: &Device,
) -> Result<LockStateSnapshot, SessionError> {
    let (handler, mut rx) = super::notify_channel();
    conn.subscribe(char_uuid, handler).await?;

    debug!(address = %device.address, "update_state: requesting KEYTURNER_STATES");
    send_with_retry(
        conn,
        char_uuid,
        device,
        Command::RequestData,
        &payload::encode_request_data(Command::KeyturnerStates.code()),
    )
    .await?;

    let shared_key = device.shared_key.expect("shared_key derived before dispatch");
    loop {
        let (cmd, body) = await_frame(&mut rx, &shared_key, device.timeouts.command).await?;
        match classify_reply(device, cmd, &body)? {
            Reception::State(snapshot) => return Ok(snapshot),
            Reception::ErrorReport(report) => {
                return Err(SessionError::ErrorReport {
                    code: report.code,
                    command: report.offending_command,
                })
            }
            _ => warn!(got = format!("{cmd:#06x}"), "dropping unexpected reply during update_state"),
        }
    }
}

/// `get_config` (§4.3b): `REQUEST_DATA(CHALLENGE)` then `REQUEST_CONFIG(n)`.
pub async fn get_config(
    conn: &dyn Connection,
    char_uuid: Uuid,
    device: &Device,
) -> Result<Config, SessionError> {
    let (handler, mut rx) = super::notify_channel();
    conn.subscribe(char_uuid, handler).await?;
    let shared_key = device.shared_key.expect("shared_key derived before dispatch");

    debug!(address = %device.address, "get_config: requesting challenge");
    send_with_retry(
        conn,
        char_uuid,
        device,
        Command::RequestData,
        &payload::encode_request_data(Command::Challenge.code()),
    )
    .await?;

    let nonce = loop {
        let (cmd, body) = await_frame(&mut rx, &shared_key, device.timeouts.command).await?;
        if cmd == Command::Challenge.code() {
            break payload::parse_challenge(&body)?;
        }
        warn!(got = format!("{cmd:#06x}"), "dropping unexpected reply while awaiting challenge");
    };

    send_with_retry(
        conn,
        char_uuid,
        device,
        Command::RequestConfig,
        &payload::encode_request_config(&nonce),
    )
    .await?;

    loop {
        let (cmd, body) = await_frame(&mut rx, &shared_key, device.timeouts.command).await?;
        match classify_reply(device, cmd, &body)? {
            Reception::Config(config) => return Ok(config),
            Reception::ErrorReport(report) => {
                return Err(SessionError::ErrorReport {
                    code: report.code,
                    command: report.offending_command,
                })
            }
            _ => warn!(got = format!("{cmd:#06x}"), "dropping unexpected reply during get_config"),
        }
    }
}

/// The optimistic local state `lock_action` sets immediately (§4.3b).
pub fn optimistic_state(action: LockAction) -> Option<TaggedLockState> {
    use crate::device::LockState;
    match action {
        LockAction::Lock | LockAction::FullLock => {
            Some(TaggedLockState::Lock(LockState::Locking))
        }
        LockAction::Unlock => Some(TaggedLockState::Lock(LockState::Unlocking)),
        LockAction::Unlatch | LockAction::LockNGoUnlatch => {
            Some(TaggedLockState::Lock(LockState::Unlatching))
        }
        LockAction::LockNGo => Some(TaggedLockState::Lock(LockState::Locking)),
        LockAction::FobAction1 | LockAction::FobAction2 | LockAction::FobAction3 => None,
    }
}

/// `lock_action` (§4.3b): `REQUEST_DATA(CHALLENGE)` then `LOCK_ACTION`. Calls
/// `on_issued` the moment the `LOCK_ACTION` write succeeds, so the caller can
/// apply the optimistic local state (§4.3b, testable property 8) before
/// `STATUS` comes back; the lock's own state update arrives later as an
/// unsolicited `KEYTURNER_STATES` the caller observes separately.
pub async fn lock_action<F, Fut>(
    conn: &dyn Connection,
    char_uuid: Uuid,
    device: &Device,
    action: LockAction,
    app_id: u32,
    on_issued: F,
) -> Result<payload::Status, SessionError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let (handler, mut rx) = super::notify_channel();
    conn.subscribe(char_uuid, handler).await?;
    let shared_key = device.shared_key.expect("shared_key derived before dispatch");

    send_with_retry(
        conn,
        char_uuid,
        device,
        Command::RequestData,
        &payload::encode_request_data(Command::Challenge.code()),
    )
    .await?;

    let nonce = loop {
        let (cmd, body) = await_frame(&mut rx, &shared_key, device.timeouts.command).await?;
        if cmd == Command::Challenge.code() {
            break payload::parse_challenge(&body)?;
        }
        warn!(got = format!("{cmd:#06x}"), "dropping unexpected reply while awaiting challenge");
    };

    send_with_retry(
        conn,
        char_uuid,
        device,
        Command::LockAction,
        &payload::encode_lock_action(action, app_id, 0, &nonce),
    )
    .await?;
    on_issued().await;

    loop {
        let (cmd, body) = await_frame(&mut rx, &shared_key, device.timeouts.command).await?;
        match classify_reply(device, cmd, &body)? {
            Reception::Status(status) => return Ok(status),
            Reception::ErrorReport(report) => {
                return Err(SessionError::ErrorReport {
                    code: report.code,
                    command: report.offending_command,
                })
            }
            _ => warn!(got = format!("{cmd:#06x}"), "dropping unexpected reply during lock_action"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[test]
    fn optimistic_state_matches_action() {
        use crate::device::LockState;
        assert_eq!(
            optimistic_state(LockAction::Lock),
            Some(TaggedLockState::Lock(LockState::Locking))
        );
        assert_eq!(
            optimistic_state(LockAction::Unlock),
            Some(TaggedLockState::Lock(LockState::Unlocking))
        );
        assert_eq!(
            optimistic_state(LockAction::Unlatch),
            Some(TaggedLockState::Lock(LockState::Unlatching))
        );
    }

    /// A connection whose `write` fails a fixed number of times before
    /// succeeding, for exercising `send_with_retry`'s S3 retry-success path.
    struct FlakyConnection {
        failures_left: AtomicUsize,
        writes: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl Connection for FlakyConnection {
        async fn disconnect(&self) -> Result<(), SessionError> {
            Ok(())
        }
        fn is_connected(&self) -> bool {
            true
        }
        async fn services(&self) -> Result<Vec<Uuid>, SessionError> {
            Ok(vec![])
        }
        async fn write(&self, _characteristic: Uuid, bytes: &[u8]) -> Result<(), SessionError> {
            if self.failures_left.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n > 0).then_some(n - 1)
            }).is_ok()
            {
                return Err(SessionError::Transport("simulated write failure".into()));
            }
            self.writes.lock().unwrap().push(bytes.to_vec());
            Ok(())
        }
        async fn subscribe(&self, _characteristic: Uuid, _handler: crate::ble::NotifyHandler) -> Result<(), SessionError> {
            Ok(())
        }
    }

    fn device_for_retry() -> Device {
        use crate::device::{Address, DeviceKind, DeviceTimeouts};
        Device {
            address: Address::new("aa:bb:cc:dd:ee:ff"),
            kind: DeviceKind::Smartlock3,
            auth_id: Some([1, 2, 3, 4]),
            lock_public_key: [0; 32],
            bridge_public_key: [0; 32],
            bridge_secret_key: [0; 32],
            shared_key: Some([9; 32]),
            rssi: None,
            last_state: None,
            config: None,
            timeouts: DeviceTimeouts::default(),
        }
    }

    /// S3 Retry within budget (§8): two failed writes followed by a third
    /// that succeeds still completes, within the default retry budget of 3.
    #[test_log::test(tokio::test)]
    async fn send_with_retry_succeeds_after_transient_failures() {
        let conn = FlakyConnection {
            failures_left: AtomicUsize::new(2),
            writes: Mutex::new(Vec::new()),
        };
        let device = device_for_retry();

        send_with_retry(
            &conn,
            crate::ble::SMARTLOCK_SERVICE_CHAR,
            &device,
            Command::RequestData,
            &payload::encode_request_data(Command::KeyturnerStates.code()),
        )
        .await
        .unwrap();

        assert_eq!(conn.writes.lock().unwrap().len(), 1);
    }

    /// S3's failure edge: exhausting the retry budget surfaces `RetriesExhausted`.
    #[test_log::test(tokio::test)]
    async fn send_with_retry_gives_up_after_exhausting_budget() {
        let conn = FlakyConnection {
            failures_left: AtomicUsize::new(10),
            writes: Mutex::new(Vec::new()),
        };
        let device = device_for_retry();

        let err = send_with_retry(
            &conn,
            crate::ble::SMARTLOCK_SERVICE_CHAR,
            &device,
            Command::RequestData,
            &payload::encode_request_data(Command::KeyturnerStates.code()),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, SessionError::RetriesExhausted(3)));
    }

    /// S2 Unlock happy path (§8): `lock_action` completes once the scripted
    /// lock replies `CHALLENGE` then `STATUS(Completed)`.
    #[test_log::test(tokio::test)]
    async fn lock_action_completes_against_scripted_lock() {
        use crate::ble::test::{FakeAdapter, FakeConnection};
        use crate::ble::{BlePort, SMARTLOCK_SERVICE_CHAR};
        use crate::device::Address;
        use std::sync::Arc;
        use std::time::Duration as StdDuration;

        let shared_key = [7u8; 32];
        let auth_id = [1u8, 2, 3, 4];
        let mut device = device_for_retry();
        device.shared_key = Some(shared_key);
        device.auth_id = Some(auth_id);

        let adapter = FakeAdapter::default();
        let conn_handle = adapter.connection.clone();
        let conn = adapter
            .connect(&Address::new("aa:bb:cc:dd:ee:ff"), StdDuration::from_secs(1))
            .await
            .unwrap();

        let char_uuid = SMARTLOCK_SERVICE_CHAR;
        async fn next_write(conn: &FakeConnection, seen: &mut usize) -> Vec<u8> {
            loop {
                if let Some((_, bytes)) = conn.writes.lock().await.get(*seen).cloned() {
                    *seen += 1;
                    return bytes;
                }
                tokio::time::sleep(StdDuration::from_millis(1)).await;
            }
        }

        let script_conn: Arc<FakeConnection> = conn_handle;
        let lock_script = tokio::spawn(async move {
            let mut seen = 0usize;

            // REQUEST_DATA(CHALLENGE)
            let _ = next_write(&script_conn, &mut seen).await;
            let n = crypto::random_nonce32();
            script_conn
                .push_notification(
                    char_uuid,
                    frame::encode_encrypted(&shared_key, auth_id, Command::Challenge.code(), &n),
                )
                .await;

            // LOCK_ACTION
            let _ = next_write(&script_conn, &mut seen).await;
            script_conn
                .push_notification(
                    char_uuid,
                    frame::encode_encrypted(&shared_key, auth_id, Command::Status.code(), &[0]),
                )
                .await;
        });

        let issued = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let issued_flag = issued.clone();
        let status = lock_action(&*conn, char_uuid, &device, LockAction::Unlock, 1, move || {
            let issued_flag = issued_flag.clone();
            async move {
                issued_flag.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        })
        .await
        .unwrap();
        lock_script.await.unwrap();

        assert!(issued.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(status, payload::Status::Completed);
    }
}
