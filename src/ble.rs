//! Abstract BLE port consumed by the core (§6). Production code implements
//! [`BlePort`] against a real adapter; tests implement it as a scripted
//! `FakeAdapter` the way the teacher scripts `DummyStorage` behind
//! `StorageManagerInterface`.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::device::Address;
use crate::error::SessionError;

/// Smartlock pairing service/characteristics.
pub const SMARTLOCK_PAIRING_SERVICE: Uuid = uuid::uuid!("a92ee100-5501-11e4-916c-0800200c9a66");
pub const SMARTLOCK_PAIRING_CHAR: Uuid = uuid::uuid!("a92ee101-5501-11e4-916c-0800200c9a66");
pub const SMARTLOCK_SERVICE_CHAR: Uuid = uuid::uuid!("a92ee202-5501-11e4-916c-0800200c9a66");

/// Opener pairing service/characteristics.
pub const OPENER_PAIRING_SERVICE: Uuid = uuid::uuid!("a92ae100-5501-11e4-916c-0800200c9a66");
pub const OPENER_PAIRING_CHAR: Uuid = uuid::uuid!("a92ae101-5501-11e4-916c-0800200c9a66");
pub const OPENER_SERVICE_CHAR: Uuid = uuid::uuid!("a92ae202-5501-11e4-916c-0800200c9a66");

/// Apple's Bluetooth SIG company identifier, used to filter non-Nuki beacons.
pub const APPLE_MANUFACTURER_ID: u16 = 76;

/// One advertisement/beacon delivered by the port (§6).
#[derive(Debug, Clone)]
pub struct Advertisement {
    pub address: Address,
    pub rssi: i16,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
}

impl Advertisement {
    pub fn nuki_payload(&self) -> Option<&[u8]> {
        self.manufacturer_data.get(&APPLE_MANUFACTURER_ID).map(Vec::as_slice)
    }

    /// The advertisement's "event" flag: last byte, bit 0 (§4.4).
    pub fn event_flag(&self) -> bool {
        self.nuki_payload()
            .and_then(|p| p.last())
            .map(|b| b & 0x01 != 0)
            .unwrap_or(false)
    }

    /// HomeKit advertisements have a first byte other than `0x02`; non-Nuki
    /// noise without Apple manufacturer data is already filtered upstream.
    pub fn looks_like_homekit(&self) -> bool {
        self.nuki_payload()
            .and_then(|p| p.first())
            .map(|&b| b != 0x02)
            .unwrap_or(true)
    }
}

/// A characteristic notification delivered to a subscribed handler.
pub type NotifyHandler = Box<dyn FnMut(Uuid, Vec<u8>) + Send>;

/// An open connection to one device.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn disconnect(&self) -> Result<(), SessionError>;
    fn is_connected(&self) -> bool;
    async fn services(&self) -> Result<Vec<Uuid>, SessionError>;
    async fn write(&self, characteristic: Uuid, bytes: &[u8]) -> Result<(), SessionError>;
    async fn subscribe(&self, characteristic: Uuid, handler: NotifyHandler) -> Result<(), SessionError>;
}

/// Device-kind detection (§6): after connect, if the opener pairing
/// characteristic exists, the device is an opener; otherwise a smartlock.
pub async fn detect_kind(conn: &dyn Connection) -> Result<crate::device::DeviceKind, SessionError> {
    let services = conn.services().await?;
    Ok(if services.contains(&OPENER_PAIRING_CHAR) {
        crate::device::DeviceKind::Opener
    } else {
        crate::device::DeviceKind::Smartlock1_2
    })
}

/// The port the core drives all radio operations through (§6).
#[async_trait]
pub trait BlePort: Send + Sync {
    async fn scan_start(&self) -> Result<(), SessionError>;
    async fn scan_stop(&self) -> Result<(), SessionError>;

    /// Pulls the next advertisement, or `None` if scanning has stopped and
    /// no more will arrive.
    async fn next_advertisement(&self) -> Option<Advertisement>;

    async fn connect(
        &self,
        address: &Address,
        timeout: Duration,
    ) -> Result<Box<dyn Connection>, SessionError>;
}

#[cfg(test)]
pub mod test {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    /// A scripted BLE adapter for the S1-S6 scenarios (§8): advertisements
    /// are queued up front, writes are recorded for assertions, and a test
    /// can push notifications to whatever handler the code under test
    /// subscribed, playing the same role as the teacher's `DummyStorage`
    /// fake behind a trait object.
    #[derive(Default)]
    pub struct FakeAdapter {
        pub advertisements: Mutex<VecDeque<Advertisement>>,
        pub scanning: Mutex<bool>,
        pub connection: std::sync::Arc<FakeConnection>,
    }

    #[async_trait]
    impl BlePort for FakeAdapter {
        async fn scan_start(&self) -> Result<(), SessionError> {
            *self.scanning.lock().await = true;
            Ok(())
        }

        async fn scan_stop(&self) -> Result<(), SessionError> {
            *self.scanning.lock().await = false;
            Ok(())
        }

        async fn next_advertisement(&self) -> Option<Advertisement> {
            self.advertisements.lock().await.pop_front()
        }

        async fn connect(
            &self,
            _address: &Address,
            _timeout: Duration,
        ) -> Result<Box<dyn Connection>, SessionError> {
            Ok(Box::new(self.connection.clone()))
        }
    }

    type NotifyHook = Mutex<Option<Box<dyn FnMut(Uuid, Vec<u8>) + Send>>>;

    #[derive(Default)]
    pub struct FakeConnection {
        pub writes: Mutex<Vec<(Uuid, Vec<u8>)>>,
        handler: NotifyHook,
        disconnected: std::sync::atomic::AtomicBool,
    }

    impl FakeConnection {
        /// Invokes whatever handler was registered via `subscribe`, as if a
        /// notification arrived from the scripted lock.
        pub async fn push_notification(&self, characteristic: Uuid, bytes: Vec<u8>) {
            if let Some(handler) = self.handler.lock().await.as_mut() {
                handler(characteristic, bytes);
            }
        }

        pub async fn last_write(&self) -> Option<(Uuid, Vec<u8>)> {
            self.writes.lock().await.last().cloned()
        }
    }

    #[async_trait]
    impl Connection for std::sync::Arc<FakeConnection> {
        async fn disconnect(&self) -> Result<(), SessionError> {
            self.disconnected.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            !self.disconnected.load(std::sync::atomic::Ordering::SeqCst)
        }

        async fn services(&self) -> Result<Vec<Uuid>, SessionError> {
            Ok(vec![SMARTLOCK_SERVICE_CHAR])
        }

        async fn write(&self, characteristic: Uuid, bytes: &[u8]) -> Result<(), SessionError> {
            self.writes.lock().await.push((characteristic, bytes.to_vec()));
            Ok(())
        }

        async fn subscribe(&self, _characteristic: Uuid, handler: NotifyHandler) -> Result<(), SessionError> {
            *self.handler.lock().await = Some(handler);
            Ok(())
        }
    }

    #[test]
    fn homekit_advertisement_is_filtered() {
        let mut data = HashMap::new();
        data.insert(APPLE_MANUFACTURER_ID, vec![0x01, 0x00]);
        let ad = Advertisement {
            address: Address::new("aa:bb:cc:dd:ee:ff"),
            rssi: -50,
            manufacturer_data: data,
        };
        assert!(ad.looks_like_homekit());
    }

    #[test]
    fn event_flag_reads_last_byte_bit0() {
        let mut data = HashMap::new();
        data.insert(APPLE_MANUFACTURER_ID, vec![0x02, 0x01]);
        let ad = Advertisement {
            address: Address::new("aa:bb:cc:dd:ee:ff"),
            rssi: -50,
            manufacturer_data: data,
        };
        assert!(!ad.looks_like_homekit());
        assert!(ad.event_flag());
    }
}
