//! Device geometry and the error taxonomy shared by every layer.

pub mod device;
pub mod error;

pub use device::get_device_info;
pub use error::{
    DeviceIoError, DiscoveryError, EngineError, SaveError, ScanError, ValidationError,
};
