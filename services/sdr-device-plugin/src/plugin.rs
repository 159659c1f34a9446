//! Device plugin lifecycle - discovery, socket, gRPC server and kubelet registration

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::net::UnixListener;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::device::DeviceRegistry;
use crate::discovery::UsbScanner;
use crate::grpc::v1beta1::device_plugin_server::DevicePluginServer;
use crate::grpc::{register, DevicePluginService};
use crate::shutdown::Shutdown;

/// How long in-flight calls get to finish after shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Unregistered,
    Serving,
}

type ServerHandle = JoinHandle<Result<(), tonic::transport::Error>>;

/// Runs one device plugin instance from discovery to shutdown
pub struct SdrPlugin {
    config: Config,
    registry: DeviceRegistry,
    shutdown: Shutdown,
    state: PluginState,
    socket_path: Option<PathBuf>,
    server: Option<ServerHandle>,
}

impl SdrPlugin {
    pub fn new(config: Config, shutdown: Shutdown) -> Self {
        Self {
            config,
            registry: DeviceRegistry::new(),
            shutdown,
            state: PluginState::Unregistered,
            socket_path: None,
            server: None,
        }
    }

    pub fn state(&self) -> PluginState {
        self.state
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    /// Endpoint socket, once bound
    pub fn socket_path(&self) -> Option<&Path> {
        self.socket_path.as_deref()
    }

    /// Discover devices, serve the DevicePlugin API and register with the kubelet.
    ///
    /// Returns with the plugin still `Unregistered` only if shutdown was requested
    /// while waiting for the first device.
    pub async fn start(&mut self) -> Result<()> {
        if !self.discover_initial().await? {
            info!("Shutdown requested before any device was found");
            return Ok(());
        }

        let socket_name = self.config.socket_name(chrono::Utc::now().timestamp());
        let socket_path = self.config.socket_path(&socket_name);
        let listener = bind_socket(&socket_path)?;
        info!("Listening on {}", socket_path.display());

        let service = DevicePluginService::new(
            &self.config,
            self.registry.clone(),
            self.shutdown.clone(),
        );
        let mut shutdown = self.shutdown.clone();
        let server = tokio::spawn(
            Server::builder()
                .add_service(DevicePluginServer::new(service))
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), async move {
                    shutdown.wait().await
                }),
        );

        if let Err(e) = register(
            &self.config.kubelet_socket,
            &socket_name,
            &self.config.resource_name,
        )
        .await
        {
            server.abort();
            remove_socket(&socket_path);
            return Err(e).context("failed to register the device plugin");
        }

        info!(
            "Registered {} with kubelet as {}",
            self.config.resource_name, socket_name
        );
        self.socket_path = Some(socket_path);
        self.server = Some(server);
        self.state = PluginState::Serving;
        Ok(())
    }

    /// Scan until a device shows up. `Ok(false)` means shutdown came first.
    async fn discover_initial(&mut self) -> Result<bool> {
        let scanner = UsbScanner::new(&self.config.sysfs_root, self.config.supported);
        let mut ticker = tokio::time::interval(self.config.scan_interval);
        info!("Discovering devices under {}", scanner.root().display());

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.wait() => return Ok(false),
            }

            match scanner.refresh(&self.registry).await {
                Ok(0) if self.config.wait_for_devices => {
                    warn!(
                        "No supported devices detected. Retrying in {:?}...",
                        self.config.scan_interval
                    );
                }
                Ok(count) => {
                    info!("Discovered {} device(s)", count);
                    return Ok(true);
                }
                Err(e) if e.is_fatal_at_startup() => {
                    return Err(e).context("device discovery failed");
                }
                // Transient, already logged by refresh
                Err(_) => {}
            }
        }
    }

    /// Serve until shutdown. Errors when the server dies or the socket is removed,
    /// which happens when the kubelet restarts and wipes the plugin directory.
    pub async fn run_until_shutdown(mut self) -> Result<()> {
        let (Some(mut server), Some(socket_path)) = (self.server.take(), self.socket_path.take())
        else {
            return Ok(());
        };

        let mut ticker = tokio::time::interval(self.config.scan_interval);

        let result = loop {
            tokio::select! {
                _ = self.shutdown.wait() => {
                    info!("Shutting down device plugin");
                    match tokio::time::timeout(DRAIN_TIMEOUT, &mut server).await {
                        Ok(Ok(Ok(()))) => debug!("gRPC server stopped"),
                        Ok(Ok(Err(e))) => warn!("gRPC server stopped with error: {}", e),
                        Ok(Err(e)) => warn!("gRPC server task failed: {}", e),
                        Err(_) => {
                            warn!("gRPC server did not drain in {:?}, aborting", DRAIN_TIMEOUT);
                            server.abort();
                        }
                    }
                    break Ok(());
                }
                joined = &mut server => {
                    break match joined {
                        Ok(Ok(())) => Err(anyhow!("gRPC server exited unexpectedly")),
                        Ok(Err(e)) => Err(e).context("gRPC server failed"),
                        Err(e) => Err(e).context("gRPC server task failed"),
                    };
                }
                _ = ticker.tick() => {
                    if !socket_path.exists() {
                        error!("Plugin socket {} was removed", socket_path.display());
                        server.abort();
                        break Err(anyhow!(
                            "plugin socket {} removed, kubelet probably restarted",
                            socket_path.display()
                        ));
                    }
                }
            }
        };

        remove_socket(&socket_path);
        result
    }
}

/// Bind the plugin socket, replacing a stale file of the same name
fn bind_socket(path: &Path) -> Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed stale socket {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to remove stale socket {}", path.display()))
        }
    }

    UnixListener::bind(path)
        .with_context(|| format!("failed to listen on the plugin endpoint {}", path.display()))
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Failed to remove socket {}: {}", path.display(), e);
        }
    }
}
