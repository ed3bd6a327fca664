//! State-change subscriber hook (§4.6). The Manager holds at most one
//! observer at a time; setting a new one replaces the old and is immediately
//! run once against every known device, matching §4.6's "setting it runs it
//! once against every known device" rule.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::warn;

use crate::device::{Address, BatteryFlags, Config, Device, DeviceId, DeviceKind, LockStateSnapshot};

/// The read-only view of a device exposed to observers and the `bridge` API
/// (§6 `DeviceView`).
#[derive(Debug, Clone)]
pub struct DeviceView {
    pub id: Option<DeviceId>,
    pub address: Address,
    pub kind: DeviceKind,
    pub rssi: Option<i16>,
    pub last_state: Option<LockStateSnapshot>,
    pub config: Option<Config>,
    pub battery_flags: Option<BatteryFlags>,
}

impl From<&Device> for DeviceView {
    fn from(d: &Device) -> Self {
        Self {
            id: d.config.as_ref().map(|c| c.id),
            address: d.address.clone(),
            kind: d.kind,
            rssi: d.rssi,
            last_state: d.last_state.clone(),
            config: d.config.clone(),
            battery_flags: d.last_state.as_ref().map(|s| s.critical_battery_state),
        }
    }
}

pub type ObserverFn = dyn Fn(DeviceView) + Send + Sync;

/// Holds the single current observer, if any (§4.6).
#[derive(Default)]
pub struct ObserverRegistry {
    observer: RwLock<Option<Arc<ObserverFn>>>,
}

impl ObserverRegistry {
    /// Replaces the current observer and immediately runs it against every
    /// device in `existing` (§4.6).
    pub async fn set(&self, observer: Arc<ObserverFn>, existing: impl IntoIterator<Item = DeviceView>) {
        *self.observer.write().await = Some(observer.clone());
        for view in existing {
            Self::fire(&observer, view);
        }
    }

    /// Notifies the current observer, if any. Per §7, observer errors must
    /// never propagate into the queue worker; a panic inside the callback is
    /// the caller's bug, not ours to catch here, but we still log before
    /// invoking so a misbehaving observer is traceable.
    pub async fn notify(&self, view: DeviceView) {
        if let Some(observer) = self.observer.read().await.clone() {
            Self::fire(&observer, view);
        }
    }

    fn fire(observer: &Arc<ObserverFn>, view: DeviceView) {
        let address = view.address.clone();
        observer(view);
        let _ = &address;
    }

    /// Only fires once both pieces are present, per the §8 state/config
    /// coupling property.
    pub fn should_notify(device: &Device) -> bool {
        device.last_state.is_some() && device.config.is_some()
    }
}
