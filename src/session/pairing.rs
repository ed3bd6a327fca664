//! The §4.3 pairing state machine, grounded on `pairing.rs`'s
//! `PairingManager`: an X25519 keypair, a challenge/response exchange keyed
//! by a derived shared secret, and a terminal state that yields a
//! persistable credential record. Unlike the teacher, the handshake here
//! runs over unencrypted framed BLE writes/notifications rather than a
//! Tauri IPC channel, and the AEAD is NaCl secretbox rather than AES-GCM.

use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::ble::Connection;
use crate::codec::command::Command;
use crate::codec::{frame, payload};
use crate::crypto;
use crate::device::{BridgeIdentity, DeviceKind};
use crate::error::SessionError;

/// The credential record produced by a completed pairing (§3, §4.3 step 6).
#[derive(Debug, Clone)]
pub struct PairedDevice {
    pub kind: DeviceKind,
    pub lock_public_key: [u8; 32],
    pub bridge_public_key: [u8; 32],
    pub bridge_secret_key: [u8; 32],
    pub shared_key: [u8; 32],
    pub auth_id: [u8; 4],
}

/// Whether to verify the lock's authenticator inside `AUTH_ID` (§9 Open
/// Questions: the original skips this; this implementation verifies by
/// default, with permissive mode kept for faithful-reimplementation
/// compatibility against locks with buggy firmware).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthIdVerification {
    Verify,
    Permissive,
}

impl Default for AuthIdVerification {
    fn default() -> Self {
        AuthIdVerification::Verify
    }
}

const PAIRING_STEP_TIMEOUT: Duration = Duration::from_secs(10);

async fn await_frame(
    rx: &mut UnboundedReceiver<(Uuid, Vec<u8>)>,
) -> Result<(u16, Vec<u8>), SessionError> {
    let (_char, bytes) = timeout(PAIRING_STEP_TIMEOUT, rx.recv())
        .await
        .map_err(|_| SessionError::Timeout(PAIRING_STEP_TIMEOUT))?
        .ok_or_else(|| SessionError::Transport("notification channel closed".into()))?;
    let (cmd, payload) = frame::decode_unencrypted(&bytes)?;
    Ok((cmd, payload.to_vec()))
}

/// Reads frames until one matches `expected`, surfacing a fatal pairing abort
/// on `ERROR_REPORT(NOT_PAIRING)` and dropping anything else (§4.3).
async fn await_expected(
    rx: &mut UnboundedReceiver<(Uuid, Vec<u8>)>,
    expected: Command,
) -> Result<Vec<u8>, SessionError> {
    loop {
        let (cmd, body) = await_frame(rx).await?;
        if cmd == Command::ErrorReport.code() {
            let report = payload::parse_error_report(&body)?;
            if report.code == payload::ERROR_NOT_PAIRING {
                return Err(SessionError::NotPairing);
            }
            return Err(SessionError::PairingAborted(format!(
                "lock reported error {}",
                report.code
            )));
        }
        if cmd == expected.code() {
            return Ok(body);
        }
        warn!(got = format!("{cmd:#06x}"), expected = format!("{:#06x}", expected.code()), "dropping unexpected pairing reply");
    }
}

/// Runs the full pairing handshake over `conn`'s pairing characteristic,
/// returning a [`PairedDevice`] once `STATUS(COMPLETED)` arrives.
pub async fn pair(
    conn: &dyn Connection,
    pairing_char: Uuid,
    kind: DeviceKind,
    identity: &BridgeIdentity,
    verification: AuthIdVerification,
) -> Result<PairedDevice, SessionError> {
    let (handler, mut rx) = super::notify_channel();
    conn.subscribe(pairing_char, handler).await?;

    let (bridge_pk, bridge_sk) = crypto::generate_keypair();

    debug!("pairing: requesting lock public key");
    conn.write(
        pairing_char,
        &frame::encode_unencrypted(
            Command::RequestData.code(),
            &payload::encode_request_data(Command::PublicKey.code()),
        ),
    )
    .await?;
    let body = await_expected(&mut rx, Command::PublicKey).await?;
    let lock_pk = payload::parse_public_key(&body)?;
    let shared_key = crypto::shared_key(&lock_pk, &bridge_sk);

    debug!("pairing: sending bridge public key");
    conn.write(
        pairing_char,
        &frame::encode_unencrypted(Command::PublicKey.code(), &payload::encode_public_key(&bridge_pk)),
    )
    .await?;

    let n1 = payload::parse_challenge(&await_expected(&mut rx, Command::Challenge).await?)?;
    let mut authenticator_input = Vec::with_capacity(96);
    authenticator_input.extend_from_slice(&bridge_pk);
    authenticator_input.extend_from_slice(&lock_pk);
    authenticator_input.extend_from_slice(&n1);
    let authenticator = crypto::hmac_sha256(&shared_key, &authenticator_input);

    debug!("pairing: sending authenticator");
    conn.write(
        pairing_char,
        &frame::encode_unencrypted(
            Command::AuthAuthenticator.code(),
            &payload::encode_auth_authenticator(&authenticator),
        ),
    )
    .await?;

    let n2 = payload::parse_challenge(&await_expected(&mut rx, Command::Challenge).await?)?;
    let n3 = crypto::random_nonce32();
    let auth_body = payload::AuthDataBody {
        client_type: crate::device::CLIENT_TYPE_BRIDGE,
        app_id: identity.app_id(),
        name: *identity.name_bytes(),
        nonce: n3,
    };
    let r_bytes = auth_body.to_bytes();
    let mut hmac_input = Vec::with_capacity(r_bytes.len() + 32);
    hmac_input.extend_from_slice(&r_bytes);
    hmac_input.extend_from_slice(&n2);
    let auth_data_hmac = crypto::hmac_sha256(&shared_key, &hmac_input);

    debug!("pairing: sending auth data");
    conn.write(
        pairing_char,
        &frame::encode_unencrypted(
            Command::AuthData.code(),
            &payload::encode_auth_data(
                &auth_data_hmac,
                auth_body.client_type,
                auth_body.app_id,
                &auth_body.name,
                &auth_body.nonce,
            ),
        ),
    )
    .await?;

    let auth_id_reply = payload::parse_auth_id(&await_expected(&mut rx, Command::AuthId).await?)?;

    if verification == AuthIdVerification::Verify {
        let mut verify_input = Vec::with_capacity(4 + 16 + 32 + 32);
        verify_input.extend_from_slice(&auth_id_reply.auth_id);
        verify_input.extend_from_slice(&auth_id_reply.uuid);
        verify_input.extend_from_slice(&auth_id_reply.nonce);
        verify_input.extend_from_slice(&n3);
        if !crypto::hmac_verify(&shared_key, &verify_input, &auth_id_reply.auth) {
            return Err(SessionError::PairingAborted(
                "lock authenticator in AUTH_ID did not verify".into(),
            ));
        }
    }

    let mut confirm_input = Vec::with_capacity(4 + 32);
    confirm_input.extend_from_slice(&auth_id_reply.auth_id);
    confirm_input.extend_from_slice(&auth_id_reply.nonce);
    let confirm_hmac = crypto::hmac_sha256(&shared_key, &confirm_input);

    debug!("pairing: confirming auth id");
    conn.write(
        pairing_char,
        &frame::encode_unencrypted(
            Command::AuthIdConfirm.code(),
            &payload::encode_auth_id_confirm(&confirm_hmac, auth_id_reply.auth_id),
        ),
    )
    .await?;

    let status_body = await_expected(&mut rx, Command::Status).await?;
    match payload::parse_status(&status_body)? {
        payload::Status::Completed => {
            info!(auth_id = ?auth_id_reply.auth_id, "pairing completed");
            Ok(PairedDevice {
                kind,
                lock_public_key: lock_pk,
                bridge_public_key: bridge_pk,
                bridge_secret_key: bridge_sk,
                shared_key,
                auth_id: auth_id_reply.auth_id,
            })
        }
        payload::Status::Accepted => Err(SessionError::PairingAborted(
            "lock accepted but did not complete pairing".into(),
        )),
    }
}
