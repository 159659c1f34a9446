//! SDR Device Plugin - advertises USB software-defined radios to the kubelet
//!
//! Scans sysfs for supported radios, serves the kubelet device plugin API on a
//! Unix socket, and registers the extended resource with the kubelet.

mod config;
mod device;
mod discovery;
mod grpc;
mod plugin;
mod shutdown;

use std::future::Future;

use anyhow::Result;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::Config;
use plugin::SdrPlugin;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sdr_device_plugin=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    info!("===========================================");
    info!("   SDR Device Plugin - bladeRF");
    info!("===========================================");

    // Load configuration
    let config = Config::from_env();

    info!("Configuration:");
    info!("  Resource name: {}", config.resource_name);
    info!("  Sysfs root: {}", config.sysfs_root.display());
    info!("  Plugin directory: {}", config.device_plugin_dir.display());
    info!("  Kubelet socket: {}", config.kubelet_socket.display());
    info!("  Scan interval: {:?}", config.scan_interval);
    info!("  Support files: {}", config.support_dir.display());
    for model in config.supported {
        info!("  Supported: {} ({}:{})", model.name, model.vendor_id, model.product_id);
    }

    let (trigger, shutdown) = shutdown::channel();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Signal received, shutting down");
        trigger.trigger();
    });

    let mut plugin = SdrPlugin::new(config, shutdown);
    if let Err(e) = plugin.start().await {
        error!("Failed to start device plugin: {:#}", e);
        return Err(e);
    }
    match plugin.socket_path() {
        Some(socket) => info!(
            "Plugin {:?} on {}, advertising {} device(s)",
            plugin.state(),
            socket.display(),
            plugin.registry().len().await
        ),
        None => info!("Plugin {:?}, never started serving", plugin.state()),
    }

    if let Err(e) = plugin.run_until_shutdown().await {
        error!("Device plugin stopped: {:#}", e);
        return Err(e);
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            ctrl_c().await;
        }
    }
}

/// Resolve on Ctrl+C; if the handler can't be installed, never resolve
async fn ctrl_c() {
    signal_or_pending("Ctrl+C", tokio::signal::ctrl_c()).await
}

/// A signal listener that failed to install must not look like a delivered signal
async fn signal_or_pending<F>(name: &str, listener: F)
where
    F: Future<Output = std::io::Result<()>>,
{
    if let Err(e) = listener.await {
        warn!("Failed to listen for {}: {}", name, e);
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;

    #[tokio::test]
    async fn test_delivered_signal_resolves() {
        let waited = tokio::time::timeout(
            Duration::from_millis(100),
            signal_or_pending("test", async { Ok(()) }),
        )
        .await;
        assert!(waited.is_ok());
    }

    #[tokio::test]
    async fn test_failed_listener_never_resolves() {
        let waited = tokio::time::timeout(
            Duration::from_millis(100),
            signal_or_pending("test", async {
                Err(io::Error::new(io::ErrorKind::Other, "no signal driver"))
            }),
        )
        .await;
        assert!(waited.is_err());
    }
}
