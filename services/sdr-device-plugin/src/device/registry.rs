//! Shared registry of currently present devices
//!
//! The registry holds an immutable snapshot behind a lock. Writers build a
//! complete map off to the side and swap the pointer; readers clone the
//! pointer and work on a map that can no longer change underneath them.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::record::DeviceRecord;

/// Devices keyed by serial number
pub type DeviceMap = HashMap<String, DeviceRecord>;

/// Cloneable handle to the current device snapshot
#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    current: Arc<RwLock<Arc<DeviceMap>>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot; stays valid and unchanged after later replacements
    pub async fn snapshot(&self) -> Arc<DeviceMap> {
        self.current.read().await.clone()
    }

    /// Publish a freshly scanned map, returning the previous snapshot
    pub async fn replace(&self, devices: DeviceMap) -> Arc<DeviceMap> {
        let next = Arc::new(devices);
        let mut guard = self.current.write().await;
        std::mem::replace(&mut *guard, next)
    }

    pub async fn len(&self) -> usize {
        self.current.read().await.len()
    }
}
