//! Discovered SDR devices and the shared registry

mod record;
mod registry;

pub use record::{pad_location, DeviceHealth, DeviceRecord, SupportedDevice, SUPPORTED_DEVICES};
pub use registry::{DeviceMap, DeviceRegistry};
