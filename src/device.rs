//! The device record, its identity types, and the state/config snapshots
//! produced by the lock over the wire (§3).

use std::fmt;

use serde::{Deserialize, Serialize};

/// A BLE MAC address, always stored lowercase with colons (`aa:bb:cc:dd:ee:ff`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().to_ascii_lowercase())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The `nukiId` exposed to callers, taken from `Config::id` once known.
pub type DeviceId = u32;

/// The physical product family. Determines GATT UUIDs, KEYTURNER_STATES/CONFIG
/// layout, and which `LockState` enum applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Smartlock1_2,
    Opener,
    Smartdoor,
    Smartlock3,
}

impl DeviceKind {
    pub fn is_opener(self) -> bool {
        matches!(self, DeviceKind::Opener)
    }
}

/// Lock-family `lock_state`, shared by SMARTLOCK_1_2, SMARTDOOR, SMARTLOCK_3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum LockState {
    Uncalibrated = 0x00,
    Locked = 0x01,
    Unlocking = 0x02,
    Unlocked = 0x03,
    Locking = 0x04,
    Unlatched = 0x05,
    UnlockedLngo = 0x06,
    Unlatching = 0x07,
    BootRun = 0xF0,
    MotorBlocked = 0xFE,
    Undefined = 0xFF,
}

impl LockState {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => Self::Uncalibrated,
            0x01 => Self::Locked,
            0x02 => Self::Unlocking,
            0x03 => Self::Unlocked,
            0x04 => Self::Locking,
            0x05 => Self::Unlatched,
            0x06 => Self::UnlockedLngo,
            0x07 => Self::Unlatching,
            0xF0 => Self::BootRun,
            0xFE => Self::MotorBlocked,
            _ => Self::Undefined,
        }
    }
}

/// Opener-family `lock_state`. Per the §9 Open Question resolution, the opener
/// gets its own enum rather than reusing the lock's bit layout, since only this
/// mapping is consistent for non-zero values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum OpenerState {
    Untrained = 0x00,
    Online = 0x01,
    RtoActive = 0x03,
    Open = 0x05,
    Opening = 0x07,
    BootRun = 0xF0,
    Undefined = 0xFF,
}

impl OpenerState {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => Self::Untrained,
            0x01 => Self::Online,
            0x03 => Self::RtoActive,
            0x05 => Self::Open,
            0x07 => Self::Opening,
            0xF0 => Self::BootRun,
            _ => Self::Undefined,
        }
    }
}

/// A device-kind-tagged `lock_state`, so callers can match exhaustively without
/// knowing up front which family a device belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaggedLockState {
    Lock(LockState),
    Opener(OpenerState),
}

/// Battery flags decoded from `critical_battery_state` (§3): bit0 critical,
/// bit1 charging, bits2-7 percentage/2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryFlags(pub u8);

impl BatteryFlags {
    pub fn is_critical(self) -> bool {
        self.0 & 0b0000_0001 != 0
    }

    pub fn is_charging(self) -> bool {
        self.0 & 0b0000_0010 != 0
    }

    pub fn percentage(self) -> u8 {
        (self.0 >> 2) * 2
    }
}

/// A `KEYTURNER_STATES` reply (§3), covering both lock and opener families. The
/// opener's timer field is semantically `ring_to_open_timer`; the lock's is
/// `lock_n_go_timer`. They share a wire position so one field carries both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockStateSnapshot {
    pub nuki_mode: u8,
    pub lock_state: TaggedLockState,
    pub trigger: u8,
    pub current_time: [u8; 7],
    pub timezone_offset: i16,
    pub critical_battery_state: BatteryFlags,
    pub current_update_count: u8,
    pub lock_n_go_or_ring_to_open_timer: u8,
    pub last_lock_action: u8,
    pub last_lock_action_trigger: u8,
    pub last_lock_action_completion_status: u8,
    pub door_sensor_state: u8,
    pub nightmode_active: bool,
}

/// A `CONFIG` reply (§3). The opener variant omits `led_brightness`,
/// `single_lock`, and `homekit_status`, renames the timer field, and adds
/// `operating_mode`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub id: DeviceId,
    pub name: String,
    pub latitude: f32,
    pub longitude: f32,
    pub flags: u8,
    pub firmware_version: (u8, u8, u8),
    pub hardware_version: (u8, u8),
    pub timezone_id: u16,
    pub kind_specific: ConfigKindSpecific,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigKindSpecific {
    Lock {
        led_brightness: u8,
        single_lock: bool,
        homekit_status: u8,
    },
    Opener {
        operating_mode: u8,
    },
}

/// Per-device timeout/retry policy (§5). Defaults match the spec's defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTimeouts {
    pub connection: std::time::Duration,
    pub command: std::time::Duration,
    pub retries: u32,
}

impl Default for DeviceTimeouts {
    fn default() -> Self {
        Self {
            connection: std::time::Duration::from_secs(10),
            command: std::time::Duration::from_secs(30),
            retries: 3,
        }
    }
}

/// One paired physical device. Owned by the [`crate::manager::Manager`]; the
/// session borrows it plus the adapter for one exchange (§3 Ownership).
#[derive(Debug, Clone)]
pub struct Device {
    pub address: Address,
    pub kind: DeviceKind,
    pub auth_id: Option<[u8; 4]>,
    pub lock_public_key: [u8; 32],
    pub bridge_public_key: [u8; 32],
    pub bridge_secret_key: [u8; 32],
    pub shared_key: Option<[u8; 32]>,
    pub rssi: Option<i16>,
    pub last_state: Option<LockStateSnapshot>,
    pub config: Option<Config>,
    pub timeouts: DeviceTimeouts,
}

impl Device {
    /// Derives and caches the shared key once, per the §3 invariant that it is
    /// derived exactly once per device. Subsequent calls are no-ops returning
    /// the cached value.
    pub fn shared_key(&mut self) -> [u8; 32] {
        if self.shared_key.is_none() {
            self.shared_key = Some(crate::crypto::shared_key(
                &self.lock_public_key,
                &self.bridge_secret_key,
            ));
        }
        self.shared_key.expect("just set")
    }

    pub fn is_battery_critical(&self) -> bool {
        self.last_state
            .as_ref()
            .map(|s| s.critical_battery_state.is_critical())
            .unwrap_or(false)
    }

    pub fn is_battery_charging(&self) -> bool {
        self.last_state
            .as_ref()
            .map(|s| s.critical_battery_state.is_charging())
            .unwrap_or(false)
    }

    pub fn battery_percentage(&self) -> Option<u8> {
        self.last_state
            .as_ref()
            .map(|s| s.critical_battery_state.percentage())
    }
}

/// The bridge's own identity, used in `AUTH_DATA` and `LOCK_ACTION` payloads.
/// Process-wide and immutable after construction (§3).
#[derive(Debug, Clone, Copy)]
pub struct BridgeIdentity {
    name: [u8; 32],
    app_id: u32,
}

/// Client type tag, fixed to `BRIDGE` per §3.
pub const CLIENT_TYPE_BRIDGE: u8 = 0x02;

impl BridgeIdentity {
    /// `name` is NUL-padded/truncated to 32 bytes.
    pub fn new(name: &str, app_id: u32) -> Self {
        let mut buf = [0u8; 32];
        let bytes = name.as_bytes();
        let n = bytes.len().min(32);
        buf[..n].copy_from_slice(&bytes[..n]);
        Self { name: buf, app_id }
    }

    pub fn name_bytes(&self) -> &[u8; 32] {
        &self.name
    }

    pub fn app_id(&self) -> u32 {
        self.app_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn battery_decoding_matches_spec_example() {
        // critical_battery_state = 0b01011001: critical = true, charging = false, percentage = 44.
        let flags = BatteryFlags(0b0101_1001);
        assert!(flags.is_critical());
        assert!(!flags.is_charging());
        assert_eq!(flags.percentage(), 44);
    }

    #[test]
    fn address_is_lowercased() {
        let addr = Address::new("AA:BB:CC:DD:EE:FF");
        assert_eq!(addr.0, "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn bridge_identity_pads_short_names() {
        let id = BridgeIdentity::new("bridge", 42);
        assert_eq!(&id.name_bytes()[..6], b"bridge");
        assert!(id.name_bytes()[6..].iter().all(|&b| b == 0));
        assert_eq!(id.app_id(), 42);
    }
}
