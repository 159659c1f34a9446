//! Device data types

use std::fmt;

/// Nuand USB vendor ID
pub const NUAND_VENDOR_ID: &str = "2cf0";

/// bladeRF 2.0 micro product ID
pub const BLADERF2_PRODUCT_ID: &str = "5250";

/// Vendor/product pairs accepted by the scanner
pub const SUPPORTED_DEVICES: &[SupportedDevice] = &[SupportedDevice {
    vendor_id: NUAND_VENDOR_ID,
    product_id: BLADERF2_PRODUCT_ID,
    name: "BladeRF 2.0",
}];

/// A vendor/product identity the plugin advertises
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupportedDevice {
    pub vendor_id: &'static str,
    pub product_id: &'static str,
    /// Product label given to matching devices
    pub name: &'static str,
}

impl SupportedDevice {
    /// Hex IDs are compared case-insensitively
    pub fn matches(&self, vendor_id: &str, product_id: &str) -> bool {
        self.vendor_id.eq_ignore_ascii_case(vendor_id)
            && self.product_id.eq_ignore_ascii_case(product_id)
    }
}

/// Device health as reported to the kubelet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceHealth {
    #[default]
    Healthy,
    // Part of the wire contract; presence is the only health signal probed today
    #[allow(dead_code)]
    Unhealthy,
}

impl DeviceHealth {
    /// Wire value used by the device plugin API
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "Healthy",
            Self::Unhealthy => "Unhealthy",
        }
    }
}

impl fmt::Display for DeviceHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One discovered physical device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRecord {
    /// USB vendor ID (hex)
    pub vendor_id: String,

    /// USB product ID (hex)
    pub product_id: String,

    /// Product label from the matching rule
    pub display_name: &'static str,

    /// Bus number, zero-padded to 3 characters
    pub bus_location: String,

    /// Device number on the bus, zero-padded to 3 characters
    pub device_location: String,

    /// Serial number; registry key and the ID exchanged with the kubelet
    pub id: String,

    pub health: DeviceHealth,
}

impl DeviceRecord {
    /// Host device node, e.g. `/dev/bus/usb/003/007`
    pub fn dev_node(&self) -> String {
        format!("/dev/bus/usb/{}/{}", self.bus_location, self.device_location)
    }
}

/// Left-pad a bus or device number with zeros to the width used by `/dev/bus/usb`
pub fn pad_location(raw: &str) -> String {
    format!("{:0>3}", raw)
}
