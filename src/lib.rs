pub mod ble;
pub mod bridge;
pub mod codec;
pub mod crypto;
pub mod device;
pub mod error;
pub mod logging;
pub mod manager;
pub mod observer;
pub mod queue;
pub mod session;
pub mod store;

pub use bridge::NukiBridge;
pub use device::{Device, DeviceId, DeviceKind};
pub use error::BridgeError;
pub use observer::DeviceView;
