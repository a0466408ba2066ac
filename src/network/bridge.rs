//! In-memory bridge allocator.
//!
//! Hands out addresses from `172.17.0.0/16` (gateway `172.17.42.1`) and
//! host ports from the dynamic range `49153..=65535`. MAC addresses are
//! derived from the IPv4 address as `02:42:a:b:c:d` unless requested.

use super::{HostBinding, InterfaceAllocation, InterfaceRequest, NetworkBackend, PortRequest};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::net::Ipv4Addr;
use std::sync::Mutex;
use tracing::debug;

const BRIDGE_NAME: &str = "magik0";
const BRIDGE_NETWORK: Ipv4Addr = Ipv4Addr::new(172, 17, 0, 0);
const BRIDGE_GATEWAY: Ipv4Addr = Ipv4Addr::new(172, 17, 42, 1);
const BRIDGE_PREFIX_LEN: u8 = 16;
const PORT_RANGE_START: u16 = 49153;
const PORT_RANGE_END: u16 = 65535;

/// Key of an allocated host port.
type PortKey = (String, String, u16);

#[derive(Debug, Default)]
struct Allocations {
    /// Container ID to its address.
    addresses: HashMap<String, Ipv4Addr>,
    /// Container ID to the host ports it holds.
    ports: HashMap<String, Vec<PortKey>>,
    in_use: BTreeSet<PortKey>,
    next_ip: u32,
    next_port: u16,
}

/// In-memory [`NetworkBackend`].
#[derive(Debug, Default)]
pub struct BridgeNetwork {
    state: Mutex<Allocations>,
}

/// Derives `02:42:` plus the four address bytes.
pub fn mac_for_ip(ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format!("02:42:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d)
}

fn net_err(id: &str, reason: impl Into<String>) -> Error {
    Error::NetworkAllocation {
        id: id.to_string(),
        reason: reason.into(),
    }
}

fn in_subnet(ip: Ipv4Addr) -> bool {
    let mask = u32::MAX << (32 - BRIDGE_PREFIX_LEN);
    u32::from(ip) & mask == u32::from(BRIDGE_NETWORK)
}

impl BridgeNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Allocations>> {
        self.state
            .lock()
            .map_err(|e| Error::Internal(format!("lock poisoned: {}", e)))
    }

    /// Number of containers holding an address.
    pub fn allocated(&self) -> usize {
        self.lock().map(|s| s.addresses.len()).unwrap_or(0)
    }
}

impl Allocations {
    fn ip_taken(&self, ip: Ipv4Addr) -> bool {
        ip == BRIDGE_GATEWAY || self.addresses.values().any(|a| *a == ip)
    }

    fn next_free_ip(&mut self) -> Option<Ipv4Addr> {
        let base = u32::from(BRIDGE_NETWORK);
        let hosts = (1u32 << (32 - BRIDGE_PREFIX_LEN)) - 2;
        for _ in 0..hosts {
            self.next_ip = self.next_ip % hosts + 1;
            let ip = Ipv4Addr::from(base + self.next_ip);
            if !self.ip_taken(ip) {
                return Some(ip);
            }
        }
        None
    }

    fn next_free_port(&mut self, host_ip: &str, proto: &str) -> Option<u16> {
        let span = PORT_RANGE_END - PORT_RANGE_START + 1;
        for _ in 0..span {
            let offset = self.next_port % span;
            self.next_port = self.next_port.wrapping_add(1) % span;
            let port = PORT_RANGE_START + offset;
            if !self
                .in_use
                .contains(&(host_ip.to_string(), proto.to_string(), port))
            {
                return Some(port);
            }
        }
        None
    }

    fn release(&mut self, id: &str) {
        self.addresses.remove(id);
        for key in self.ports.remove(id).unwrap_or_default() {
            self.in_use.remove(&key);
        }
    }
}

#[async_trait]
impl NetworkBackend for BridgeNetwork {
    async fn allocate_interface(
        &self,
        id: &str,
        request: InterfaceRequest,
    ) -> Result<InterfaceAllocation> {
        let mut state = self.lock()?;
        if state.addresses.contains_key(id) {
            return Err(net_err(id, "interface already allocated"));
        }

        let ip = match request.requested_ip.as_deref().filter(|s| !s.is_empty()) {
            Some(requested) => {
                let ip: Ipv4Addr = requested
                    .parse()
                    .map_err(|_| net_err(id, format!("invalid address {}", requested)))?;
                if !in_subnet(ip) {
                    return Err(net_err(id, format!("{} is outside the bridge network", ip)));
                }
                if state.ip_taken(ip) {
                    return Err(net_err(id, format!("address {} already in use", ip)));
                }
                ip
            }
            None => state
                .next_free_ip()
                .ok_or_else(|| net_err(id, "no addresses left in the bridge network"))?,
        };
        state.addresses.insert(id.to_string(), ip);

        let mac_address = request
            .requested_mac
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| mac_for_ip(ip));
        debug!("allocated {} ({}) to {}", ip, mac_address, id);

        Ok(InterfaceAllocation {
            bridge: BRIDGE_NAME.to_string(),
            ip_address: ip.to_string(),
            ip_prefix_len: BRIDGE_PREFIX_LEN,
            mac_address,
            gateway: BRIDGE_GATEWAY.to_string(),
        })
    }

    async fn release_interface(&self, id: &str) -> Result<()> {
        self.lock()?.release(id);
        debug!("released network of {}", id);
        Ok(())
    }

    async fn allocate_port(&self, id: &str, request: PortRequest) -> Result<HostBinding> {
        let mut state = self.lock()?;
        if !state.addresses.contains_key(id) {
            return Err(net_err(id, "no interface allocated"));
        }
        let proto = if request.proto.is_empty() {
            "tcp".to_string()
        } else {
            request.proto.to_lowercase()
        };

        let host_port = if request.host_port == 0 {
            state
                .next_free_port(&request.host_ip, &proto)
                .ok_or_else(|| net_err(id, "no host ports left"))?
        } else {
            let key = (request.host_ip.clone(), proto.clone(), request.host_port);
            if state.in_use.contains(&key) {
                return Err(net_err(
                    id,
                    format!("port {}/{} is already allocated", request.host_port, proto),
                ));
            }
            request.host_port
        };

        let key = (request.host_ip.clone(), proto, host_port);
        state.in_use.insert(key.clone());
        state.ports.entry(id.to_string()).or_default().push(key);
        debug!(
            "mapped {}:{} to {}:{}",
            request.host_ip, host_port, id, request.container_port
        );

        Ok(HostBinding {
            host_ip: request.host_ip,
            host_port,
        })
    }

    async fn release_all(&self) -> Result<()> {
        let mut state = self.lock()?;
        *state = Allocations::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(host_port: u16) -> PortRequest {
        PortRequest {
            host_ip: String::new(),
            host_port,
            proto: "tcp".to_string(),
            container_port: 80,
        }
    }

    #[tokio::test]
    async fn test_allocate_distinct_addresses() {
        let net = BridgeNetwork::new();
        let a = net
            .allocate_interface("a", InterfaceRequest::default())
            .await
            .unwrap();
        let b = net
            .allocate_interface("b", InterfaceRequest::default())
            .await
            .unwrap();
        assert_ne!(a.ip_address, b.ip_address);
        assert_eq!(a.gateway, "172.17.42.1");
        assert_eq!(
            a.mac_address,
            mac_for_ip(a.ip_address.parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_requested_ip_and_mac() {
        let net = BridgeNetwork::new();
        let request = InterfaceRequest {
            requested_mac: Some("02:42:de:ad:be:ef".to_string()),
            requested_ip: Some("172.17.0.9".to_string()),
        };
        let alloc = net.allocate_interface("a", request.clone()).await.unwrap();
        assert_eq!(alloc.ip_address, "172.17.0.9");
        assert_eq!(alloc.mac_address, "02:42:de:ad:be:ef");

        assert!(net.allocate_interface("b", request).await.is_err());
        let outside = InterfaceRequest {
            requested_ip: Some("10.0.0.1".to_string()),
            ..Default::default()
        };
        assert!(net.allocate_interface("c", outside).await.is_err());
    }

    #[tokio::test]
    async fn test_ports() {
        let net = BridgeNetwork::new();
        net.allocate_interface("a", InterfaceRequest::default())
            .await
            .unwrap();

        let chosen = net.allocate_port("a", port(0)).await.unwrap();
        assert!(chosen.host_port >= PORT_RANGE_START);
        assert_eq!(net.allocate_port("a", port(8080)).await.unwrap().host_port, 8080);
        assert!(net.allocate_port("a", port(8080)).await.is_err());
        assert!(net.allocate_port("missing", port(0)).await.is_err());

        net.release_interface("a").await.unwrap();
        assert_eq!(net.allocated(), 0);
        net.allocate_interface("b", InterfaceRequest::default())
            .await
            .unwrap();
        assert_eq!(net.allocate_port("b", port(8080)).await.unwrap().host_port, 8080);
    }
}
