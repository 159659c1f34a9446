//! Configuration loaded from environment variables

use std::path::PathBuf;
use std::time::Duration;

use crate::device::{SupportedDevice, SUPPORTED_DEVICES};

/// Default kubelet device plugin directory
pub const DEFAULT_DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins";

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of the USB device-information tree
    pub sysfs_root: PathBuf,

    /// Directory shared with the kubelet where plugin sockets live
    pub device_plugin_dir: PathBuf,

    /// Kubelet registration socket
    pub kubelet_socket: PathBuf,

    /// Extended resource name devices are accounted under
    pub resource_name: String,

    /// Prefix of this plugin's socket file name
    pub socket_prefix: String,

    /// ListAndWatch rescan interval
    pub scan_interval: Duration,

    /// Host directory with vendor runtime files, mounted read-only into containers
    pub support_dir: PathBuf,

    /// Block startup until at least one device is present
    pub wait_for_devices: bool,

    /// Accepted vendor/product pairs
    pub supported: &'static [SupportedDevice],
}

impl Default for Config {
    fn default() -> Self {
        let device_plugin_dir = PathBuf::from(DEFAULT_DEVICE_PLUGIN_PATH);
        Self {
            sysfs_root: PathBuf::from("/sys/bus/usb/devices"),
            kubelet_socket: device_plugin_dir.join("kubelet.sock"),
            device_plugin_dir,
            resource_name: "nuand.com/bladerf".to_string(),
            socket_prefix: "nuandBladeRF".to_string(),
            scan_interval: Duration::from_secs(5),
            support_dir: PathBuf::from("/usr/share/nuand/bladerf/"),
            wait_for_devices: true,
            supported: SUPPORTED_DEVICES,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let device_plugin_dir = lookup("DEVICE_PLUGIN_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.device_plugin_dir);

        Self {
            sysfs_root: lookup("SYSFS_USB_DEVICES")
                .map(PathBuf::from)
                .unwrap_or(defaults.sysfs_root),

            kubelet_socket: lookup("KUBELET_SOCKET")
                .map(PathBuf::from)
                .unwrap_or_else(|| device_plugin_dir.join("kubelet.sock")),

            device_plugin_dir,

            resource_name: lookup("RESOURCE_NAME").unwrap_or(defaults.resource_name),

            socket_prefix: lookup("SOCKET_PREFIX").unwrap_or(defaults.socket_prefix),

            scan_interval: lookup("SCAN_INTERVAL_SECS")
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.scan_interval),

            support_dir: lookup("SUPPORT_FILES_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.support_dir),

            wait_for_devices: lookup("WAIT_FOR_DEVICES")
                .and_then(|s| parse_bool(&s))
                .unwrap_or(defaults.wait_for_devices),

            supported: defaults.supported,
        }
    }

    /// Socket file name for a plugin started at `timestamp` (Unix seconds)
    pub fn socket_name(&self, timestamp: i64) -> String {
        format!("{}-{}.sock", self.socket_prefix, timestamp)
    }

    /// Full path of a socket inside the device plugin directory
    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.device_plugin_dir.join(name)
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(|_| None);
        assert_eq!(config.sysfs_root, PathBuf::from("/sys/bus/usb/devices"));
        assert_eq!(
            config.kubelet_socket,
            PathBuf::from("/var/lib/kubelet/device-plugins/kubelet.sock")
        );
        assert_eq!(config.resource_name, "nuand.com/bladerf");
        assert_eq!(config.scan_interval, Duration::from_secs(5));
        assert!(config.wait_for_devices);
        assert_eq!(config.supported.len(), 1);
    }

    #[test]
    fn test_kubelet_socket_follows_plugin_dir() {
        let config = Config::from_lookup(lookup_from(&[("DEVICE_PLUGIN_PATH", "/tmp/dp")]));
        assert_eq!(config.kubelet_socket, PathBuf::from("/tmp/dp/kubelet.sock"));
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = Config::from_lookup(lookup_from(&[
            ("SCAN_INTERVAL_SECS", "0"),
            ("WAIT_FOR_DEVICES", "maybe"),
        ]));
        assert_eq!(config.scan_interval, Duration::from_secs(5));
        assert!(config.wait_for_devices);

        let config = Config::from_lookup(lookup_from(&[
            ("SCAN_INTERVAL_SECS", "12"),
            ("WAIT_FOR_DEVICES", "false"),
        ]));
        assert_eq!(config.scan_interval, Duration::from_secs(12));
        assert!(!config.wait_for_devices);
    }

    #[test]
    fn test_socket_name() {
        let config = Config::from_lookup(lookup_from(&[("DEVICE_PLUGIN_PATH", "/tmp/dp")]));
        let name = config.socket_name(1700000000);
        assert_eq!(name, "nuandBladeRF-1700000000.sock");
        assert_eq!(
            config.socket_path(&name),
            PathBuf::from("/tmp/dp/nuandBladeRF-1700000000.sock")
        );
    }
}
