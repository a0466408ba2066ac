//! # Network Backend
//!
//! Interface and port allocation for containers in private (bridge)
//! network mode. Host, container and disabled modes never reach the
//! backend.
//!
//! ```text
//! allocate_interface(id) ─► InterfaceAllocation { ip, mac, gateway, ... }
//! allocate_port(id, ..)  ─► HostBinding { host_ip, host_port }   (0..n times)
//! release_interface(id)  ─► frees the address and every port of `id`
//! ```
//!
//! [`bridge::BridgeNetwork`] is an in-memory implementation suitable for
//! embedding and tests.

pub mod bridge;

pub use bridge::BridgeNetwork;

use crate::error::Result;
use async_trait::async_trait;

/// Interface request for a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceRequest {
    /// MAC address to use instead of a generated one.
    pub requested_mac: Option<String>,
    /// IPv4 address to reclaim, used when restoring after a restart.
    pub requested_ip: Option<String>,
}

/// Interface handed to a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InterfaceAllocation {
    pub bridge: String,
    pub ip_address: String,
    pub ip_prefix_len: u8,
    pub mac_address: String,
    pub gateway: String,
}

/// Host port request for one container port.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortRequest {
    /// Host address to bind, empty for all addresses.
    pub host_ip: String,
    /// Host port, 0 lets the backend choose.
    pub host_port: u16,
    pub proto: String,
    pub container_port: u16,
}

/// Host side of an allocated port mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostBinding {
    pub host_ip: String,
    pub host_port: u16,
}

/// Allocator of container interfaces and host ports.
#[async_trait]
pub trait NetworkBackend: Send + Sync {
    /// Allocates an interface for container `id`.
    async fn allocate_interface(
        &self,
        id: &str,
        request: InterfaceRequest,
    ) -> Result<InterfaceAllocation>;

    /// Releases the interface and every port held by `id`.
    async fn release_interface(&self, id: &str) -> Result<()>;

    /// Maps a host port to a port of container `id`.
    async fn allocate_port(&self, id: &str, request: PortRequest) -> Result<HostBinding>;

    /// Releases everything, at daemon shutdown.
    async fn release_all(&self) -> Result<()>;
}
