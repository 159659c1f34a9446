//! Sysfs scanner
//!
//! Walks the immediate children of the USB device directory, skips interface
//! nodes (`3-1:1.0`), and keeps every device whose vendor/product pair is in
//! the supported table. A pass either produces a complete map or an error;
//! the published registry is only touched after a successful pass.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::device::{
    pad_location, DeviceHealth, DeviceMap, DeviceRecord, DeviceRegistry, SupportedDevice,
};

const VENDOR_FILE: &str = "idVendor";
const PRODUCT_FILE: &str = "idProduct";
const BUSNUM_FILE: &str = "busnum";
const DEVNUM_FILE: &str = "devnum";
const SERIAL_FILE: &str = "serial";

/// Scan errors; any of them aborts the whole pass
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("can't read device directory {path}: {source}")]
    ReadRoot { path: PathBuf, source: io::Error },

    #[error("can't read attribute file {path}: {source}")]
    ReadAttribute { path: PathBuf, source: io::Error },
}

impl ScanError {
    /// Only a missing or unreadable device root is fatal at startup
    pub fn is_fatal_at_startup(&self) -> bool {
        matches!(self, Self::ReadRoot { .. })
    }
}

/// Scanner for one device directory and a set of accepted devices
#[derive(Debug, Clone)]
pub struct UsbScanner {
    root: PathBuf,
    supported: &'static [SupportedDevice],
}

impl UsbScanner {
    pub fn new(root: impl Into<PathBuf>, supported: &'static [SupportedDevice]) -> Self {
        Self {
            root: root.into(),
            supported,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Run one discovery pass
    pub fn scan(&self) -> Result<DeviceMap, ScanError> {
        let entries = fs::read_dir(&self.root).map_err(|source| ScanError::ReadRoot {
            path: self.root.clone(),
            source,
        })?;

        let mut devices = DeviceMap::new();

        for entry in entries {
            let entry = entry.map_err(|source| ScanError::ReadRoot {
                path: self.root.clone(),
                source,
            })?;
            let name = entry.file_name();
            let name = name.to_string_lossy();

            // Interfaces are sub-nodes of a device, never devices themselves
            if name.contains(':') {
                continue;
            }

            let node = entry.path();
            let vendor_id = read_attribute(&node, VENDOR_FILE)?;
            let product_id = read_attribute(&node, PRODUCT_FILE)?;

            let Some(model) = self
                .supported
                .iter()
                .find(|s| s.matches(&vendor_id, &product_id))
            else {
                continue;
            };

            let bus = read_attribute(&node, BUSNUM_FILE)?;
            let dev = read_attribute(&node, DEVNUM_FILE)?;
            let serial = read_attribute(&node, SERIAL_FILE)?;

            debug!("Found {} at {} (serial {})", model.name, name, serial);

            devices.insert(
                serial.clone(),
                DeviceRecord {
                    vendor_id,
                    product_id,
                    display_name: model.name,
                    bus_location: pad_location(&bus),
                    device_location: pad_location(&dev),
                    id: serial,
                    health: DeviceHealth::Healthy,
                },
            );
        }

        Ok(devices)
    }

    /// Scan and publish the result; on failure the registry keeps its last good snapshot
    pub async fn refresh(&self, registry: &DeviceRegistry) -> Result<usize, ScanError> {
        match self.scan() {
            Ok(devices) => {
                let count = devices.len();
                debug!("Discovered devices: {:?}", devices.keys().collect::<Vec<_>>());
                registry.replace(devices).await;
                Ok(count)
            }
            Err(e) => {
                warn!("Device scan failed, keeping previous device list: {}", e);
                Err(e)
            }
        }
    }
}

fn read_attribute(node: &Path, file: &str) -> Result<String, ScanError> {
    let path = node.join(file);
    fs::read_to_string(&path)
        .map(|content| content.trim().to_string())
        .map_err(|source| ScanError::ReadAttribute { path, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::SUPPORTED_DEVICES;
    use tempfile::TempDir;

    fn write_node(root: &Path, name: &str, attrs: &[(&str, &str)]) {
        let node = root.join(name);
        fs::create_dir_all(&node).unwrap();
        for (file, value) in attrs {
            fs::write(node.join(file), format!("{}\n", value)).unwrap();
        }
    }

    fn bladerf(root: &Path, name: &str, bus: &str, dev: &str, serial: &str) {
        write_node(
            root,
            name,
            &[
                (VENDOR_FILE, "2cf0"),
                (PRODUCT_FILE, "5250"),
                (BUSNUM_FILE, bus),
                (DEVNUM_FILE, dev),
                (SERIAL_FILE, serial),
            ],
        );
    }

    fn scanner(dir: &TempDir) -> UsbScanner {
        UsbScanner::new(dir.path(), SUPPORTED_DEVICES)
    }

    #[test]
    fn test_scan_single_device() {
        let dir = tempfile::tempdir().unwrap();
        bladerf(dir.path(), "3-1", "3", "7", "ABC123");

        let devices = scanner(&dir).scan().unwrap();
        assert_eq!(devices.len(), 1);

        let device = &devices["ABC123"];
        assert_eq!(device.bus_location, "003");
        assert_eq!(device.device_location, "007");
        assert_eq!(device.display_name, "BladeRF 2.0");
        assert_eq!(device.health, DeviceHealth::Healthy);
    }

    #[test]
    fn test_scan_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        bladerf(dir.path(), "3-1", "3", "7", "ABC123");
        bladerf(dir.path(), "1-4", "1", "12", "DEF456");
        write_node(dir.path(), "usb1", &[(VENDOR_FILE, "1d6b"), (PRODUCT_FILE, "0002")]);

        let scanner = scanner(&dir);
        assert_eq!(scanner.scan().unwrap(), scanner.scan().unwrap());
    }

    #[test]
    fn test_interfaces_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        // Matching attributes, but the name marks it as an interface
        bladerf(dir.path(), "3-1:1.0", "3", "7", "IFACE");
        // Interface without any attribute files must not abort the pass either
        fs::create_dir_all(dir.path().join("3-1:1.1")).unwrap();

        let devices = scanner(&dir).scan().unwrap();
        assert!(devices.is_empty());
    }

    #[test]
    fn test_non_matching_devices_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        // bladeRF x40 is not in the supported table
        write_node(
            dir.path(),
            "2-1",
            &[(VENDOR_FILE, "2cf0"), (PRODUCT_FILE, "5246")],
        );
        // Root hub, no serial file needed since it never matches
        write_node(dir.path(), "usb2", &[(VENDOR_FILE, "1d6b"), (PRODUCT_FILE, "0003")]);
        bladerf(dir.path(), "3-1", "3", "7", "ABC123");

        let devices = scanner(&dir).scan().unwrap();
        assert_eq!(devices.keys().collect::<Vec<_>>(), vec!["ABC123"]);
    }

    #[test]
    fn test_identity_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        write_node(
            dir.path(),
            "3-2",
            &[
                (VENDOR_FILE, "2CF0"),
                (PRODUCT_FILE, "5250"),
                (BUSNUM_FILE, "3"),
                (DEVNUM_FILE, "9"),
                (SERIAL_FILE, "UPPER"),
            ],
        );

        let devices = scanner(&dir).scan().unwrap();
        assert!(devices.contains_key("UPPER"));
    }

    #[test]
    fn test_missing_root_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let scanner = UsbScanner::new(dir.path().join("missing"), SUPPORTED_DEVICES);

        let err = scanner.scan().unwrap_err();
        assert!(matches!(err, ScanError::ReadRoot { .. }));
        assert!(err.is_fatal_at_startup());
    }

    #[test]
    fn test_missing_attribute_aborts_pass() {
        let dir = tempfile::tempdir().unwrap();
        bladerf(dir.path(), "3-1", "3", "7", "ABC123");
        write_node(
            dir.path(),
            "3-2",
            &[(VENDOR_FILE, "2cf0"), (PRODUCT_FILE, "5250"), (BUSNUM_FILE, "3")],
        );

        let err = scanner(&dir).scan().unwrap_err();
        assert!(matches!(err, ScanError::ReadAttribute { .. }));
        assert!(!err.is_fatal_at_startup());
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_last_good_registry() {
        let dir = tempfile::tempdir().unwrap();
        bladerf(dir.path(), "3-1", "3", "7", "ABC123");

        let scanner = scanner(&dir);
        let registry = DeviceRegistry::new();
        assert_eq!(scanner.refresh(&registry).await.unwrap(), 1);

        // A matching node without a serial breaks the next pass
        write_node(
            dir.path(),
            "3-2",
            &[
                (VENDOR_FILE, "2cf0"),
                (PRODUCT_FILE, "5250"),
                (BUSNUM_FILE, "3"),
                (DEVNUM_FILE, "8"),
            ],
        );
        assert!(scanner.refresh(&registry).await.is_err());

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key("ABC123"));
    }
}
