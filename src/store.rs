//! Configuration persistence port (§4.7), adapted from the teacher's
//! `StorageManagerInterface`/`DummyStorage` pattern: an `async_trait` port the
//! host app implements, a JSON-file-backed default, and an in-memory double
//! for tests.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::device::{Address, DeviceKind};
use crate::error::StoreError;

/// Everything needed to reconnect to and re-authenticate with a paired device
/// without repeating the pairing handshake, the durable half of a
/// [`crate::device::Device`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PersistedDevice {
    pub address: Address,
    pub kind: DeviceKind,
    pub auth_id: [u8; 4],
    pub lock_public_key: [u8; 32],
    pub bridge_public_key: [u8; 32],
    pub bridge_secret_key: [u8; 32],
    pub nuki_id: Option<u32>,
    pub name: Option<String>,
}

/// Port the host application implements to persist paired devices across
/// restarts. Mirrors the teacher's `StorageManagerInterface` shape (async,
/// `Send + Sync + Debug`) but keyed by device identity rather than a generic
/// string key, since the bridge only ever stores one record type.
#[async_trait]
pub trait DeviceStore: Send + Sync + std::fmt::Debug {
    /// Loads every persisted device. Order is not guaranteed to be preserved.
    async fn load(&self) -> Result<Vec<PersistedDevice>, StoreError>;

    /// Inserts or replaces the record for `device.address`.
    async fn upsert(&self, device: PersistedDevice) -> Result<(), StoreError>;

    /// Removes the record for `address`, if any. Idempotent: removing an
    /// address with no record is not an error.
    async fn remove(&self, address: &Address) -> Result<(), StoreError>;
}

/// Default [`DeviceStore`] backed by a single JSON file, rewritten atomically
/// (write to a temp file, then rename) on every mutation.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    cache: RwLock<HashMap<Address, PersistedDevice>>,
}

impl JsonFileStore {
    /// Opens (or lazily creates on first write) the store at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let cache = if path.exists() {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| StoreError::Io(e.to_string()))?;
            let records: Vec<PersistedDevice> = serde_json::from_slice(&bytes)
                .map_err(|e| StoreError::Malformed(e.to_string()))?;
            records.into_iter().map(|r| (r.address.clone(), r)).collect()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            cache: RwLock::new(cache),
        })
    }

    async fn flush(&self, records: &HashMap<Address, PersistedDevice>) -> Result<(), StoreError> {
        let values: Vec<&PersistedDevice> = records.values().collect();
        let json =
            serde_json::to_vec_pretty(&values).map_err(|e| StoreError::Malformed(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl DeviceStore for JsonFileStore {
    async fn load(&self) -> Result<Vec<PersistedDevice>, StoreError> {
        Ok(self.cache.read().await.values().cloned().collect())
    }

    async fn upsert(&self, device: PersistedDevice) -> Result<(), StoreError> {
        let mut guard = self.cache.write().await;
        guard.insert(device.address.clone(), device);
        self.flush(&guard).await
    }

    async fn remove(&self, address: &Address) -> Result<(), StoreError> {
        let mut guard = self.cache.write().await;
        guard.remove(address);
        self.flush(&guard).await
    }
}
