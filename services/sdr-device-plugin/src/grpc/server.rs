//! DevicePlugin service implementation - serves the kubelet

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use super::v1beta1::{
    device_plugin_server::DevicePlugin, AllocateRequest, AllocateResponse,
    ContainerAllocateResponse, Device, DevicePluginOptions, DeviceSpec, Empty,
    ListAndWatchResponse, Mount, PreStartContainerRequest, PreStartContainerResponse,
    PreferredAllocationRequest, PreferredAllocationResponse,
};
use crate::config::Config;
use crate::device::{DeviceMap, DeviceRegistry};
use crate::discovery::UsbScanner;
use crate::shutdown::Shutdown;

/// cgroup permissions granted on the device node
const DEVICE_PERMISSIONS: &str = "mrw";

/// Capabilities declared to the kubelet; both optional hooks are off
pub fn plugin_options() -> DevicePluginOptions {
    DevicePluginOptions {
        pre_start_required: false,
        get_preferred_allocation_available: false,
    }
}

/// DevicePlugin service backed by the shared device registry
pub struct DevicePluginService {
    registry: DeviceRegistry,
    scanner: UsbScanner,
    support_dir: PathBuf,
    scan_interval: Duration,
    shutdown: Shutdown,
}

impl DevicePluginService {
    pub fn new(config: &Config, registry: DeviceRegistry, shutdown: Shutdown) -> Self {
        Self {
            registry,
            scanner: UsbScanner::new(&config.sysfs_root, config.supported),
            support_dir: config.support_dir.clone(),
            scan_interval: config.scan_interval,
            shutdown,
        }
    }

    /// Translate requested IDs into device nodes; unknown IDs are left out
    fn allocate_container(
        &self,
        devices: &DeviceMap,
        ids: &[String],
    ) -> ContainerAllocateResponse {
        let mut response = ContainerAllocateResponse::default();

        for id in ids {
            match devices.get(id) {
                Some(device) => {
                    let node = device.dev_node();
                    info!(
                        "Allocated {} ({}:{}) {} at {}",
                        device.display_name, device.vendor_id, device.product_id, id, node
                    );
                    response.devices.push(DeviceSpec {
                        container_path: node.clone(),
                        host_path: node,
                        permissions: DEVICE_PERMISSIONS.to_string(),
                    });
                }
                None => {
                    warn!("Allocate: device {} is not present, skipping", id);
                }
            }
        }

        // One mount per container, shared by every allocated device
        if !response.devices.is_empty() {
            let support_dir = self.support_dir.to_string_lossy().into_owned();
            response.mounts.push(Mount {
                container_path: support_dir.clone(),
                host_path: support_dir,
                read_only: true,
            });
        }

        response
    }
}

/// Build the device list pushed on ListAndWatch
fn device_list(devices: &DeviceMap) -> ListAndWatchResponse {
    let mut devices: Vec<Device> = devices
        .values()
        .map(|d| Device {
            id: d.id.clone(),
            health: d.health.as_str().to_string(),
            topology: None,
        })
        .collect();
    devices.sort_by(|a, b| a.id.cmp(&b.id));
    ListAndWatchResponse { devices }
}

#[tonic::async_trait]
impl DevicePlugin for DevicePluginService {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DevicePluginOptions>, Status> {
        debug!("GetDevicePluginOptions: returning empty options");
        Ok(Response::new(plugin_options()))
    }

    type ListAndWatchStream = ReceiverStream<Result<ListAndWatchResponse, Status>>;

    /// Rescan on every tick and push the full device list
    async fn list_and_watch(
        &self,
        request: Request<Empty>,
    ) -> Result<Response<Self::ListAndWatchStream>, Status> {
        let peer = request
            .remote_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "kubelet".to_string());
        info!("ListAndWatch started for {}", peer);

        let (tx, rx) = mpsc::channel(4);
        let registry = self.registry.clone();
        let scanner = self.scanner.clone();
        let mut shutdown = self.shutdown.clone();
        let mut ticker = tokio::time::interval(self.scan_interval);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.wait() => {
                        info!("ListAndWatch stopping for shutdown");
                        break;
                    }
                }

                // A failed pass is logged by refresh and the last good list is pushed again
                let _ = scanner.refresh(&registry).await;

                let snapshot = registry.snapshot().await;
                let response = device_list(&snapshot);
                debug!("Pushing {} device(s) to {}", response.devices.len(), peer);

                if let Err(e) = tx.send(Ok(response)).await {
                    warn!("Failed to push device list to {}: {}", peer, e);
                    break;
                }
            }
            info!("ListAndWatch ended for {}", peer);
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn get_preferred_allocation(
        &self,
        _request: Request<PreferredAllocationRequest>,
    ) -> Result<Response<PreferredAllocationResponse>, Status> {
        debug!("GetPreferredAllocation: deferring to kubelet defaults");
        Ok(Response::new(PreferredAllocationResponse::default()))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> Result<Response<AllocateResponse>, Status> {
        let request = request.into_inner();
        info!(
            "Allocate: {} container request(s)",
            request.container_requests.len()
        );

        // One snapshot for the whole call
        let devices = self.registry.snapshot().await;
        let container_responses = request
            .container_requests
            .iter()
            .map(|c| self.allocate_container(&devices, &c.devices_ids))
            .collect();

        Ok(Response::new(AllocateResponse {
            container_responses,
        }))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> Result<Response<PreStartContainerResponse>, Status> {
        warn!("PreStartContainer() should not be called, pre_start_required is false");
        Err(Status::unimplemented("PreStartContainer() is not supported"))
    }
}
