//! Owns the BLE adapter and the device registry, demultiplexes
//! advertisements into queued tasks, and arbitrates exclusive scan-vs-connect
//! access (§4.4). Device records are arena-style, keyed by address, so the
//! manager never hands out a back-reference a device could cycle through
//! (§9 design note on cyclic ownership).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::ble::{Advertisement, BlePort};
use crate::device::{Address, Config, Device, DeviceId, LockStateSnapshot};
use crate::error::BridgeError;
use crate::observer::{DeviceView, ObserverRegistry};
use crate::queue::TaskQueue;

/// Maximum `scan_start` attempts before giving up (§4.4).
const SCAN_START_MAX_ATTEMPTS: u32 = 8;
/// Hard bound on `scan_stop` (§4.4).
const SCAN_STOP_TIMEOUT: Duration = Duration::from_secs(10);
/// Advertisements from the same device within this window are ignored (§4.4).
const DEBOUNCE_WINDOW: Duration = Duration::from_secs(1);
/// How long an opener's `last_lock_action_completion_status` is given to
/// settle back to 0 before the bridge re-polls state on its own (§4.3b).
pub const OPENER_RING_RESET_DELAY: Duration = Duration::from_secs(30);

/// Owns the adapter, the device registry, and the observer list.
pub struct Manager {
    pub name: String,
    pub app_id: u32,
    adapter: Arc<dyn BlePort>,
    queue: TaskQueue,
    devices: RwLock<HashMap<Address, Device>>,
    last_beacon: RwLock<HashMap<Address, Instant>>,
    pub observers: ObserverRegistry,
}

impl Manager {
    pub fn new(name: impl Into<String>, app_id: u32, adapter: Arc<dyn BlePort>) -> Self {
        let queue = TaskQueue::spawn(adapter.clone());
        Self {
            name: name.into(),
            app_id,
            adapter,
            queue,
            devices: RwLock::new(HashMap::new()),
            last_beacon: RwLock::new(HashMap::new()),
            observers: ObserverRegistry::default(),
        }
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn adapter(&self) -> &Arc<dyn BlePort> {
        &self.adapter
    }

    pub async fn insert_device(&self, device: Device) {
        self.devices.write().await.insert(device.address.clone(), device);
    }

    pub async fn device_by_address(&self, address: &Address) -> Option<Device> {
        self.devices.read().await.get(address).cloned()
    }

    pub async fn device_by_id(&self, id: DeviceId) -> Option<Device> {
        self.devices
            .read()
            .await
            .values()
            .find(|d| d.config.as_ref().map(|c| c.id) == Some(id))
            .cloned()
    }

    pub async fn devices(&self) -> Vec<Device> {
        self.devices.read().await.values().cloned().collect()
    }

    /// Starts scanning with exponential backoff (§4.4): up to 8 attempts,
    /// sleeping `2^i` seconds between them, surfacing the last error if all fail.
    pub async fn start_scan(&self) -> Result<(), BridgeError> {
        let mut last_err = None;
        for attempt in 0..SCAN_START_MAX_ATTEMPTS {
            match self.adapter.scan_start().await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    warn!(attempt, %err, "scan_start attempt failed");
                    last_err = Some(err);
                    tokio::time::sleep(Duration::from_secs(1u64 << attempt)).await;
                }
            }
        }
        Err(BridgeError::ScanFailed(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    /// Stops scanning, bounded by a 10-second hard timeout (§4.4).
    pub async fn stop_scan(&self) -> Result<(), BridgeError> {
        match tokio::time::timeout(SCAN_STOP_TIMEOUT, self.adapter.scan_stop()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                warn!(%err, "scan_stop reported an error; treating as stopped");
                Ok(())
            }
            Err(_) => Err(BridgeError::ScanFailed("scan_stop timed out".into())),
        }
    }

    /// Applies the §4.4 demux rules to one advertisement, returning whether a
    /// task should be enqueued and, if so, the kind of task.
    pub async fn demux_advertisement(&self, ad: &Advertisement) -> Option<DemuxAction> {
        if ad.nuki_payload().is_none() {
            return None;
        }
        if ad.looks_like_homekit() {
            return None;
        }

        {
            let mut last_beacon = self.last_beacon.write().await;
            if let Some(&last) = last_beacon.get(&ad.address) {
                if last.elapsed() < DEBOUNCE_WINDOW {
                    debug!(address = %ad.address, "debounced duplicate advertisement");
                    return None;
                }
            }
            last_beacon.insert(ad.address.clone(), Instant::now());
        }

        let mut devices = self.devices.write().await;
        let Some(device) = devices.get_mut(&ad.address) else {
            debug!(address = %ad.address, "advertisement from unknown device, scheduling identify");
            return Some(DemuxAction::Identify);
        };
        device.rssi = Some(ad.rssi);

        if device.last_state.is_none() || ad.event_flag() {
            Some(DemuxAction::UpdateState)
        } else if device.config.is_none() {
            Some(DemuxAction::GetConfig)
        } else {
            None
        }
    }

    pub async fn record_state(&self, address: &Address, config_stale: bool) -> bool {
        let devices = self.devices.read().await;
        devices
            .get(address)
            .map(|d| d.last_state.is_some() && d.config.is_some() && !config_stale)
            .unwrap_or(false)
    }

    /// Applies a fresh `KEYTURNER_STATES` snapshot to the device record,
    /// implementing the §4.3b reception rule: a `get_config` chain is needed
    /// whenever config is still missing or `current_update_count` changed
    /// since the last snapshot. Also flags whether the opener ring-reset
    /// timer (§4.3b) should be armed, since an opener reported a nonzero
    /// `last_lock_action_completion_status`.
    pub async fn apply_state(&self, address: &Address, snapshot: LockStateSnapshot) -> StateOutcome {
        let mut devices = self.devices.write().await;
        let Some(device) = devices.get_mut(address) else {
            return StateOutcome::default();
        };

        let update_count_changed = device
            .last_state
            .as_ref()
            .map(|s| s.current_update_count != snapshot.current_update_count)
            .unwrap_or(true);
        let needs_ring_reset = device.kind.is_opener() && snapshot.last_lock_action_completion_status != 0;
        device.last_state = Some(snapshot);

        StateOutcome {
            needs_config: device.config.is_none() || update_count_changed,
            needs_ring_reset,
            view: Some(DeviceView::from(&*device)),
        }
    }

    /// Applies the §4.3b optimistic local state the instant a lock action is
    /// issued, ahead of the lock's own `KEYTURNER_STATES` confirmation
    /// (testable property 8). A no-op if no snapshot has ever been recorded,
    /// since there is no prior snapshot to patch the `lock_state` field of.
    pub async fn apply_optimistic_lock_state(&self, address: &Address, state: crate::device::TaggedLockState) {
        let mut devices = self.devices.write().await;
        if let Some(device) = devices.get_mut(address) {
            if let Some(snapshot) = device.last_state.as_mut() {
                snapshot.lock_state = state;
            }
        }
    }

    /// Forces the cached opener ring-reset field to 0, without re-polling
    /// the device (§4.3b deferred reset-to-zero notification). Callers
    /// follow up with [`Manager::notify_if_ready`] to push the update.
    pub async fn reset_ring_to_zero(&self, address: &Address) {
        let mut devices = self.devices.write().await;
        if let Some(device) = devices.get_mut(address) {
            if let Some(snapshot) = device.last_state.as_mut() {
                snapshot.last_lock_action_completion_status = 0;
            }
        }
    }

    pub async fn apply_config(&self, address: &Address, config: Config) -> Option<DeviceView> {
        let mut devices = self.devices.write().await;
        let device = devices.get_mut(address)?;
        device.config = Some(config);
        Some(DeviceView::from(&*device))
    }

    /// Fires the observer for `address` if the §4.6 state/config coupling
    /// rule is satisfied.
    pub async fn notify_if_ready(&self, address: &Address) {
        let devices = self.devices.read().await;
        let Some(device) = devices.get(address) else { return };
        if ObserverRegistry::should_notify(device) {
            let view = DeviceView::from(device);
            drop(devices);
            self.observers.notify(view).await;
        }
    }
}

/// Result of folding a `KEYTURNER_STATES` reply into the registry (§4.3b).
#[derive(Default)]
pub struct StateOutcome {
    pub needs_config: bool,
    pub needs_ring_reset: bool,
    pub view: Option<DeviceView>,
}

/// What kind of task an advertisement should schedule (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxAction {
    Identify,
    UpdateState,
    GetConfig,
}
