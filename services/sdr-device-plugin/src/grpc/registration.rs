//! Kubelet registration client

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tokio::net::UnixStream;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::info;

use super::server::plugin_options;
use super::v1beta1::{registration_client::RegistrationClient, RegisterRequest};

/// Device plugin API version announced to the kubelet
pub const API_VERSION: &str = "v1beta1";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("cannot connect to kubelet service at {path}: {source}")]
    Connect {
        path: PathBuf,
        source: tonic::transport::Error,
    },

    #[error("cannot register to kubelet service: {0}")]
    Rejected(#[from] tonic::Status),
}

/// Open a gRPC channel over a Unix domain socket
pub async fn connect_unix(path: &Path) -> Result<Channel, tonic::transport::Error> {
    let path = path.to_path_buf();
    // The URI is ignored by the connector, every request goes to the socket
    Endpoint::from_static("http://[::]:50051")
        .connect_timeout(CONNECT_TIMEOUT)
        .connect_with_connector(service_fn(move |_: Uri| UnixStream::connect(path.clone())))
        .await
}

/// Announce this plugin's socket and resource name to the kubelet. No retry.
pub async fn register(
    kubelet_socket: &Path,
    endpoint: &str,
    resource_name: &str,
) -> Result<(), RegistrationError> {
    info!(
        "Registering {} at {} with kubelet ({})",
        resource_name,
        endpoint,
        kubelet_socket.display()
    );

    let channel = connect_unix(kubelet_socket)
        .await
        .map_err(|source| RegistrationError::Connect {
            path: kubelet_socket.to_path_buf(),
            source,
        })?;

    let mut client = RegistrationClient::new(channel);
    client
        .register(RegisterRequest {
            version: API_VERSION.to_string(),
            endpoint: endpoint.to_string(),
            resource_name: resource_name.to_string(),
            options: Some(plugin_options()),
        })
        .await?;

    Ok(())
}
