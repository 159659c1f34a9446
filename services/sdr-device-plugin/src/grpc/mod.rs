//! Device plugin gRPC surface: the DevicePlugin server and the kubelet registration client

mod registration;
mod server;

pub use registration::register;
pub use server::DevicePluginService;

#[cfg(test)]
pub(crate) use registration::{connect_unix, tests::FakeKubelet};

// Re-export protobuf types
pub mod v1beta1 {
    tonic::include_proto!("v1beta1");
}
