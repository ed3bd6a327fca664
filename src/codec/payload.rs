//! Typed payload encode/decode per command (§3, §4.1). Dynamic
//! dictionary-style parsing is deliberately avoided (§9 design note): every
//! command gets its own function returning a concrete type.

use crate::codec::command::LockAction;
use crate::device::{
    BatteryFlags, Config, ConfigKindSpecific, DeviceKind, LockState, LockStateSnapshot,
    OpenerState, TaggedLockState,
};
use crate::error::CodecError;

fn need(payload: &[u8], len: usize, command: u16) -> Result<(), CodecError> {
    if payload.len() < len {
        return Err(CodecError::TruncatedPayload {
            command,
            need: len,
            have: payload.len(),
        });
    }
    Ok(())
}

/// `REQUEST_DATA` payload: the 2-byte code of the command being requested.
pub fn encode_request_data(requested: u16) -> Vec<u8> {
    requested.to_le_bytes().to_vec()
}

/// `PUBLIC_KEY` payload: a bare 32-byte key.
pub fn encode_public_key(key: &[u8; 32]) -> Vec<u8> {
    key.to_vec()
}

pub fn parse_public_key(payload: &[u8]) -> Result<[u8; 32], CodecError> {
    need(payload, 32, 0x0003)?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&payload[..32]);
    Ok(key)
}

/// `CHALLENGE` payload: a bare 32-byte nonce.
pub fn parse_challenge(payload: &[u8]) -> Result<[u8; 32], CodecError> {
    need(payload, 32, 0x0004)?;
    let mut nonce = [0u8; 32];
    nonce.copy_from_slice(&payload[..32]);
    Ok(nonce)
}

/// `AUTH_AUTHENTICATOR` payload: a bare 32-byte HMAC.
pub fn encode_auth_authenticator(hmac: &[u8; 32]) -> Vec<u8> {
    hmac.to_vec()
}

/// `AUTH_DATA` payload: `HMAC(32) || type(1) || app_id(4 LE) || name(32) || nonce(32)`.
pub fn encode_auth_data(
    hmac: &[u8; 32],
    client_type: u8,
    app_id: u32,
    name: &[u8; 32],
    nonce: &[u8; 32],
) -> Vec<u8> {
    let mut buf = Vec::with_capacity(32 + 1 + 4 + 32 + 32);
    buf.extend_from_slice(hmac);
    buf.push(client_type);
    buf.extend_from_slice(&app_id.to_le_bytes());
    buf.extend_from_slice(name);
    buf.extend_from_slice(nonce);
    buf
}

/// The bridge-identity fields sent in `AUTH_DATA`, absent the HMAC, so the
/// session can recompute `R` for the HMAC input without re-threading args.
pub struct AuthDataBody {
    pub client_type: u8,
    pub app_id: u32,
    pub name: [u8; 32],
    pub nonce: [u8; 32],
}

impl AuthDataBody {
    /// `type(1) || app_id(4 LE) || name(32) || nonce(32)`, the `R` of §4.3 step 4.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 4 + 32 + 32);
        buf.push(self.client_type);
        buf.extend_from_slice(&self.app_id.to_le_bytes());
        buf.extend_from_slice(&self.name);
        buf.extend_from_slice(&self.nonce);
        buf
    }
}

/// `AUTH_ID` reply: `auth(32) || auth_id(4) || uuid(16) || nonce(32)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthId {
    pub auth: [u8; 32],
    pub auth_id: [u8; 4],
    pub uuid: [u8; 16],
    pub nonce: [u8; 32],
}

pub fn parse_auth_id(payload: &[u8]) -> Result<AuthId, CodecError> {
    need(payload, 32 + 4 + 16 + 32, 0x0007)?;
    let mut auth = [0u8; 32];
    auth.copy_from_slice(&payload[0..32]);
    let mut auth_id = [0u8; 4];
    auth_id.copy_from_slice(&payload[32..36]);
    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&payload[36..52]);
    let mut nonce = [0u8; 32];
    nonce.copy_from_slice(&payload[52..84]);
    Ok(AuthId {
        auth,
        auth_id,
        uuid,
        nonce,
    })
}

/// `AUTH_ID_CONFIRM` payload: `HMAC(32) || auth_id(4)`.
pub fn encode_auth_id_confirm(hmac: &[u8; 32], auth_id: [u8; 4]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(36);
    buf.extend_from_slice(hmac);
    buf.extend_from_slice(&auth_id);
    buf
}

/// `LOCK_ACTION` payload: `action(1) || app_id(4 LE) || flags(1) || nonce(32)`.
pub fn encode_lock_action(action: LockAction, app_id: u32, flags: u8, nonce: &[u8; 32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + 4 + 1 + 32);
    buf.push(action.byte());
    buf.extend_from_slice(&app_id.to_le_bytes());
    buf.push(flags);
    buf.extend_from_slice(nonce);
    buf
}

/// `REQUEST_CONFIG` payload: a bare 32-byte nonce.
pub fn encode_request_config(nonce: &[u8; 32]) -> Vec<u8> {
    nonce.to_vec()
}

/// `STATUS` reply, 1 byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Completed,
    Accepted,
}

pub fn parse_status(payload: &[u8]) -> Result<Status, CodecError> {
    need(payload, 1, 0x000E)?;
    match payload[0] {
        0 => Ok(Status::Completed),
        1 => Ok(Status::Accepted),
        other => Err(CodecError::UnknownStatus(other)),
    }
}

/// `ERROR_REPORT` reply: `code(1, signed) || offending_cmd(2 LE)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorReport {
    pub code: i8,
    pub offending_command: u16,
}

/// The lock's fixed `NOT_PAIRING` error code, fatal during pairing (§4.3).
pub const ERROR_NOT_PAIRING: i8 = 0x10;

pub fn parse_error_report(payload: &[u8]) -> Result<ErrorReport, CodecError> {
    need(payload, 3, 0x0012)?;
    Ok(ErrorReport {
        code: payload[0] as i8,
        offending_command: u16::from_le_bytes([payload[1], payload[2]]),
    })
}

/// Parses a `KEYTURNER_STATES` reply, selecting the lock-state variant by
/// `kind` (§4.1: struct layouts differ by device kind only in which
/// `TaggedLockState` arm is produced — the remaining fields share wire
/// position across families).
pub fn parse_keyturner_states(kind: DeviceKind, payload: &[u8]) -> Result<LockStateSnapshot, CodecError> {
    need(payload, 16, 0x000C)?;
    let nuki_mode = payload[0];
    let lock_state_byte = payload[1];
    let lock_state = if kind.is_opener() {
        TaggedLockState::Opener(OpenerState::from_byte(lock_state_byte))
    } else {
        TaggedLockState::Lock(LockState::from_byte(lock_state_byte))
    };
    let trigger = payload[2];
    let mut current_time = [0u8; 7];
    current_time.copy_from_slice(&payload[3..10]);
    let timezone_offset = i16::from_le_bytes([payload[10], payload[11]]);
    let critical_battery_state = BatteryFlags(payload[12]);
    let current_update_count = payload[13];
    let lock_n_go_or_ring_to_open_timer = payload[14];
    let last_lock_action = payload[15];

    need(payload, 20, 0x000C)?;
    let last_lock_action_trigger = payload[16];
    let last_lock_action_completion_status = payload[17];
    let door_sensor_state = payload[18];
    let nightmode_active = payload[19] != 0;

    Ok(LockStateSnapshot {
        nuki_mode,
        lock_state,
        trigger,
        current_time,
        timezone_offset,
        critical_battery_state,
        current_update_count,
        lock_n_go_or_ring_to_open_timer,
        last_lock_action,
        last_lock_action_trigger,
        last_lock_action_completion_status,
        door_sensor_state,
        nightmode_active,
    })
}

/// Parses a `CONFIG` reply, selecting the lock/opener layout by `kind`.
pub fn parse_config(kind: DeviceKind, payload: &[u8]) -> Result<Config, CodecError> {
    need(payload, 4 + 32 + 4 + 4 + 1 + 3 + 2 + 2, 0x0015)?;
    let mut offset = 0;
    let id = u32::from_le_bytes(payload[offset..offset + 4].try_into().unwrap());
    offset += 4;
    let name_bytes = &payload[offset..offset + 32];
    let name = String::from_utf8_lossy(name_bytes)
        .trim_end_matches('\0')
        .to_string();
    offset += 32;
    let latitude = f32::from_le_bytes(payload[offset..offset + 4].try_into().unwrap());
    offset += 4;
    let longitude = f32::from_le_bytes(payload[offset..offset + 4].try_into().unwrap());
    offset += 4;
    let flags = payload[offset];
    offset += 1;
    let firmware_version = (payload[offset], payload[offset + 1], payload[offset + 2]);
    offset += 3;
    let hardware_version = (payload[offset], payload[offset + 1]);
    offset += 2;
    let timezone_id = u16::from_le_bytes(payload[offset..offset + 2].try_into().unwrap());
    offset += 2;

    let kind_specific = if kind.is_opener() {
        need(payload, offset + 1, 0x0015)?;
        ConfigKindSpecific::Opener {
            operating_mode: payload[offset],
        }
    } else {
        need(payload, offset + 3, 0x0015)?;
        ConfigKindSpecific::Lock {
            led_brightness: payload[offset],
            single_lock: payload[offset + 1] != 0,
            homekit_status: payload[offset + 2],
        }
    };

    Ok(Config {
        id,
        name,
        latitude,
        longitude,
        flags,
        firmware_version,
        hardware_version,
        timezone_id,
        kind_specific,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_roundtrip() {
        let key = [7u8; 32];
        let encoded = encode_public_key(&key);
        assert_eq!(parse_public_key(&encoded).unwrap(), key);
    }

    #[test]
    fn challenge_requires_32_bytes() {
        assert!(matches!(
            parse_challenge(&[0u8; 10]),
            Err(CodecError::TruncatedPayload { .. })
        ));
    }

    #[test]
    fn auth_id_roundtrip_fields() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[1u8; 32]);
        payload.extend_from_slice(&[2, 0, 0, 4]);
        payload.extend_from_slice(&[3u8; 16]);
        payload.extend_from_slice(&[4u8; 32]);
        let parsed = parse_auth_id(&payload).unwrap();
        assert_eq!(parsed.auth_id, [2, 0, 0, 4]);
        assert_eq!(parsed.uuid, [3u8; 16]);
    }

    #[test]
    fn status_parses_completed_and_accepted() {
        assert_eq!(parse_status(&[0]).unwrap(), Status::Completed);
        assert_eq!(parse_status(&[1]).unwrap(), Status::Accepted);
    }

    #[test]
    fn error_report_parses_not_pairing() {
        let payload = [ERROR_NOT_PAIRING as u8, 0x01, 0x00];
        let report = parse_error_report(&payload).unwrap();
        assert_eq!(report.code, ERROR_NOT_PAIRING);
        assert_eq!(report.offending_command, 0x0001);
    }

    #[test]
    fn keyturner_states_lock_vs_opener_variant() {
        let mut payload = vec![0u8; 20];
        payload[1] = 0x03; // LOCKED for lock family, RTO_ACTIVE-ish slot for opener
        payload[12] = 0b0101_1001;

        let lock = parse_keyturner_states(DeviceKind::Smartlock3, &payload).unwrap();
        assert_eq!(lock.lock_state, TaggedLockState::Lock(LockState::Unlocked));
        assert!(lock.critical_battery_state.is_critical());
        assert_eq!(lock.critical_battery_state.percentage(), 44);

        let opener = parse_keyturner_states(DeviceKind::Opener, &payload).unwrap();
        assert_eq!(
            opener.lock_state,
            TaggedLockState::Opener(OpenerState::RtoActive)
        );
    }

    #[test]
    fn config_parses_lock_and_opener_layouts() {
        let mut payload = vec![0u8; 4 + 32 + 4 + 4 + 1 + 3 + 2 + 2 + 3];
        payload[0..4].copy_from_slice(&42u32.to_le_bytes());
        payload[4..10].copy_from_slice(b"Front ");

        let lock_cfg = parse_config(DeviceKind::Smartlock3, &payload).unwrap();
        assert_eq!(lock_cfg.id, 42);
        assert_eq!(lock_cfg.name, "Front");
        assert!(matches!(
            lock_cfg.kind_specific,
            ConfigKindSpecific::Lock { .. }
        ));

        let mut opener_payload = payload.clone();
        opener_payload.truncate(opener_payload.len() - 2);
        let opener_cfg = parse_config(DeviceKind::Opener, &opener_payload).unwrap();
        assert!(matches!(
            opener_cfg.kind_specific,
            ConfigKindSpecific::Opener { .. }
        ));
    }
}
