//! `NukiBridge`: the core API facade consumed by the (out-of-scope) HTTP
//! front-end (§6). Enumerates devices, submits lock actions, runs pairing,
//! and wires observer registration through to the [`crate::manager::Manager`].

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::ble::{BlePort, Connection};
use crate::codec::command::LockAction;
use crate::device::{Address, BridgeIdentity, Device, DeviceId, DeviceTimeouts};
use crate::error::BridgeError;
use crate::manager::{Manager, DemuxAction, OPENER_RING_RESET_DELAY};
use crate::observer::{DeviceView, ObserverFn};
use crate::session::pairing::{self, AuthIdVerification};
use crate::store::{DeviceStore, PersistedDevice};

/// The core API facade. Construction loads persisted devices from `store`
/// and begins scanning immediately via the [`crate::queue::TaskQueue`].
pub struct NukiBridge {
    manager: Arc<Manager>,
    identity: BridgeIdentity,
    store: Arc<dyn DeviceStore>,
}

impl NukiBridge {
    /// Builds a bridge over `adapter`, loading any devices `store` already
    /// has on disk (§4.7) in the order `load()` returned them (§9 device
    /// selection ordering).
    pub async fn new(
        name: &str,
        app_id: u32,
        adapter: Arc<dyn BlePort>,
        store: Arc<dyn DeviceStore>,
    ) -> Result<Self, BridgeError> {
        let manager = Arc::new(Manager::new(name, app_id, adapter));
        let identity = BridgeIdentity::new(name, app_id);

        for persisted in store.load().await? {
            manager.insert_device(persisted_into_device(persisted)).await;
        }
        manager.start_scan().await?;
        spawn_advertisement_loop(manager.clone());

        info!(%name, app_id, "bridge started");
        Ok(Self {
            manager,
            identity,
            store,
        })
    }

    pub async fn devices(&self) -> Vec<DeviceView> {
        self.manager.devices().await.iter().map(DeviceView::from).collect()
    }

    pub async fn device_by_id(&self, id: DeviceId) -> Result<DeviceView, BridgeError> {
        self.manager
            .device_by_id(id)
            .await
            .map(|d| DeviceView::from(&d))
            .ok_or(BridgeError::NotFound(id))
    }

    /// Replaces the state observer, running it once against every known
    /// device (§4.6).
    pub async fn set_state_observer(&self, observer: Arc<ObserverFn>) {
        let existing: Vec<DeviceView> = self.manager.devices().await.iter().map(DeviceView::from).collect();
        self.manager.observers.set(observer, existing).await;
    }

    pub async fn lock(&self, id: DeviceId) -> Result<(), BridgeError> {
        self.lock_action(id, LockAction::Lock).await
    }

    pub async fn unlock(&self, id: DeviceId) -> Result<(), BridgeError> {
        self.lock_action(id, LockAction::Unlock).await
    }

    pub async fn unlatch(&self, id: DeviceId) -> Result<(), BridgeError> {
        self.lock_action(id, LockAction::Unlatch).await
    }

    /// Submits a lock action, completing when the lock's `STATUS` reply
    /// arrives (§6). Runs on the manager's [`crate::queue::TaskQueue`] so it
    /// never overlaps another exchange on the same adapter.
    pub async fn lock_action(&self, id: DeviceId, action: LockAction) -> Result<(), BridgeError> {
        let device = self
            .manager
            .device_by_id(id)
            .await
            .ok_or(BridgeError::NotFound(id))?;

        let adapter = self.manager.adapter().clone();
        let app_id = self.manager.app_id;
        let manager = self.manager.clone();
        let char_uuid = if device.kind.is_opener() {
            crate::ble::OPENER_SERVICE_CHAR
        } else {
            crate::ble::SMARTLOCK_SERVICE_CHAR
        };

        self.manager
            .queue()
            .add_task(move || -> crate::queue::BoxedTaskFuture {
                Box::pin(async move {
                    let conn = adapter
                        .connect(&device.address, device.timeouts.connection)
                        .await
                        .map_err(|_| BridgeError::DeviceUnreachable(device.address.to_string()))?;

                    let optimistic_manager = manager.clone();
                    let optimistic_address = device.address.clone();
                    crate::session::dispatch::lock_action(&*conn, char_uuid, &device, action, app_id, move || {
                        let manager = optimistic_manager.clone();
                        let address = optimistic_address.clone();
                        async move {
                            // Apply the optimistic local state the instant the
                            // write succeeds, ahead of STATUS (§4.3b, property 8).
                            if let Some(state) = crate::session::dispatch::optimistic_state(action) {
                                manager.apply_optimistic_lock_state(&address, state).await;
                                manager.notify_if_ready(&address).await;
                            }
                        }
                    })
                    .await
                    .map_err(BridgeError::from)?;

                    // The lock pushes its own updated KEYTURNER_STATES as an
                    // unsolicited notification; request it directly rather
                    // than wait for a fresh advertisement (§4.3b).
                    refresh_state(&manager, &*conn, char_uuid, &device.address, &device).await?;

                    let _ = conn.disconnect().await;
                    Ok(())
                })
            })
            .await
    }

    /// Runs the §4.3 pairing handshake against `address`, persisting the
    /// resulting credentials, registering the device with the manager, and
    /// invoking `on_complete` with the filled device record (§6).
    pub async fn pair(
        &self,
        address: Address,
        on_complete: impl FnOnce(DeviceView) + Send + 'static,
    ) -> Result<(), BridgeError> {
        let adapter = self.manager.adapter().clone();
        let identity = self.identity.clone();
        let store = self.store.clone();
        let manager = self.manager.clone();

        let paired = adapter
            .connect(&address, Duration::from_secs(10))
            .await
            .map_err(|_| BridgeError::DeviceUnreachable(address.to_string()))?;

        let kind = crate::ble::detect_kind(&*paired).await?;
        let pairing_char = if kind.is_opener() {
            crate::ble::OPENER_PAIRING_CHAR
        } else {
            crate::ble::SMARTLOCK_PAIRING_CHAR
        };
        let result = pairing::pair(&*paired, pairing_char, kind, &identity, AuthIdVerification::Verify)
            .await
            .map_err(BridgeError::from)?;

        let device = Device {
            address: address.clone(),
            kind: result.kind,
            auth_id: Some(result.auth_id),
            lock_public_key: result.lock_public_key,
            bridge_public_key: result.bridge_public_key,
            bridge_secret_key: result.bridge_secret_key,
            shared_key: Some(result.shared_key),
            rssi: None,
            last_state: None,
            config: None,
            timeouts: DeviceTimeouts::default(),
        };

        store
            .upsert(PersistedDevice {
                address: address.clone(),
                kind: result.kind,
                auth_id: result.auth_id,
                lock_public_key: result.lock_public_key,
                bridge_public_key: result.bridge_public_key,
                bridge_secret_key: result.bridge_secret_key,
                nuki_id: None,
                name: None,
            })
            .await?;

        let view = DeviceView::from(&device);
        manager.insert_device(device).await;
        on_complete(view);
        Ok(())
    }
}

/// Runs `update_state`, applies the §4.3b reception rules (chaining a
/// `get_config` when config is missing or `current_update_count` changed),
/// notifies the observer once both pieces are present, and arms the opener
/// ring-reset timer (§4.3b) when needed.
async fn refresh_state(
    manager: &Arc<Manager>,
    conn: &dyn Connection,
    char_uuid: uuid::Uuid,
    address: &Address,
    device: &Device,
) -> Result<(), BridgeError> {
    let snapshot = crate::session::dispatch::update_state(conn, char_uuid, device)
        .await
        .map_err(BridgeError::from)?;
    let outcome = manager.apply_state(address, snapshot).await;

    if outcome.needs_config {
        let config = crate::session::dispatch::get_config(conn, char_uuid, device)
            .await
            .map_err(BridgeError::from)?;
        manager.apply_config(address, config).await;
    }
    manager.notify_if_ready(address).await;

    if outcome.needs_ring_reset {
        arm_ring_reset(manager.clone(), address.clone());
    }
    Ok(())
}

/// Deferred "reset to 0" notification (§4.3b): after
/// [`OPENER_RING_RESET_DELAY`], force the cached
/// `last_lock_action_completion_status` to 0 and notify. No reconnect: the
/// field is a local bookkeeping reset, not a fact to re-poll the device for.
fn arm_ring_reset(manager: Arc<Manager>, address: Address) {
    tokio::spawn(async move {
        tokio::time::sleep(OPENER_RING_RESET_DELAY).await;
        manager.reset_ring_to_zero(&address).await;
        manager.notify_if_ready(&address).await;
    });
}

/// Drains advertisements from the adapter for the lifetime of the bridge,
/// enqueueing the task each one calls for per the §4.4 demux rules. Unknown
/// devices (`DemuxAction::Identify`) are logged but not otherwise acted on:
/// discovering not-yet-paired locks is a UI-level concern this core leaves
/// to the embedding application's own scan listing.
fn spawn_advertisement_loop(manager: Arc<Manager>) {
    tokio::spawn(async move {
        loop {
            let Some(ad) = manager.adapter().next_advertisement().await else {
                break;
            };
            let Some(action) = manager.demux_advertisement(&ad).await else {
                continue;
            };
            let Some(device) = manager.device_by_address(&ad.address).await else {
                continue;
            };
            let char_uuid = if device.kind.is_opener() {
                crate::ble::OPENER_SERVICE_CHAR
            } else {
                crate::ble::SMARTLOCK_SERVICE_CHAR
            };

            match action {
                DemuxAction::Identify => {
                    info!(address = %ad.address, "advertisement from unpaired device");
                }
                DemuxAction::UpdateState | DemuxAction::GetConfig => {
                    let manager = manager.clone();
                    let adapter = manager.adapter().clone();
                    let address = ad.address.clone();
                    let _ = manager
                        .queue()
                        .add_task(move || -> crate::queue::BoxedTaskFuture {
                            Box::pin(async move {
                                let Some(device) = manager.device_by_address(&address).await else {
                                    return Ok(());
                                };
                                let conn = adapter
                                    .connect(&address, device.timeouts.connection)
                                    .await
                                    .map_err(|_| BridgeError::DeviceUnreachable(address.to_string()))?;
                                let result = if matches!(action, DemuxAction::GetConfig) {
                                    let config = crate::session::dispatch::get_config(&*conn, char_uuid, &device)
                                        .await
                                        .map_err(BridgeError::from)?;
                                    manager.apply_config(&address, config).await;
                                    manager.notify_if_ready(&address).await;
                                    Ok(())
                                } else {
                                    refresh_state(&manager, &*conn, char_uuid, &address, &device).await
                                };
                                let _ = conn.disconnect().await;
                                result
                            })
                        })
                        .await;
                }
            }
        }
    });
}

fn persisted_into_device(p: PersistedDevice) -> Device {
    Device {
        address: p.address,
        kind: p.kind,
        auth_id: Some(p.auth_id),
        lock_public_key: p.lock_public_key,
        bridge_public_key: p.bridge_public_key,
        bridge_secret_key: p.bridge_secret_key,
        shared_key: None,
        rssi: None,
        last_state: None,
        config: None,
        timeouts: DeviceTimeouts::default(),
    }
}
