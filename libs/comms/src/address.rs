//! Node Addressing and Endpoint Resolution
//!
//! Every node advertises itself as `host:port`, and every endpoint on every
//! node is reachable through a deterministic path rendered from the runtime
//! system name, the node address, and a well-known endpoint name. The
//! resolution functions here are pure: no I/O, no lookups, same inputs same
//! path. The naming scheme is a cluster-wide convention: all nodes must
//! register their endpoints under identical names or cross-node resolution
//! silently points at nothing.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::CommsError;

/// URI scheme of rendered endpoint paths.
pub const SCHEME: &str = "taskgrid";

/// Runtime system name used by scheduler nodes.
pub const SERVER_SYSTEM: &str = "taskgrid-server";

/// Runtime system name used by worker nodes.
pub const WORKER_SYSTEM: &str = "taskgrid-worker";

/// A node's reachable network location, advertised cluster-wide as
/// `"host:port"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for NodeAddress {
    type Err = CommsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| CommsError::transport(format!("invalid node address '{s}'")))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| CommsError::transport(format!("invalid port in node address '{s}'")))?;
        if host.is_empty() {
            return Err(CommsError::transport(format!(
                "empty host in node address '{s}'"
            )));
        }
        Ok(Self::new(host, port))
    }
}

/// Well-known endpoint names shared by convention between every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Inbound-request endpoint on a scheduler node. Pooled.
    Ingress,
    /// Peer-to-peer exchange endpoint between scheduler nodes.
    Peer,
    /// Fault-observation endpoint receiving undeliverable messages.
    Faults,
    /// A worker's processing endpoint.
    WorkerProcessor,
    /// A worker's inbound-request endpoint.
    WorkerIngress,
}

impl Endpoint {
    /// Wire name of the endpoint.
    pub fn name(&self) -> &'static str {
        match self {
            Endpoint::Ingress => "server",
            Endpoint::Peer => "peer",
            Endpoint::Faults => "faults",
            Endpoint::WorkerProcessor => "processor",
            Endpoint::WorkerIngress => "worker",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Fully-qualified address of one endpoint on one node.
///
/// Renders as `taskgrid://<system>@<host:port>/user/<endpoint>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointPath {
    pub system: String,
    pub address: NodeAddress,
    pub endpoint: Endpoint,
}

impl EndpointPath {
    /// Render the path string.
    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for EndpointPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{SCHEME}://{}@{}/user/{}",
            self.system,
            self.address,
            self.endpoint.name()
        )
    }
}

/// Construct the path of `endpoint` on the node at `address` in the given
/// runtime system.
pub fn resolve(system: impl Into<String>, address: &NodeAddress, endpoint: Endpoint) -> EndpointPath {
    EndpointPath {
        system: system.into(),
        address: address.clone(),
        endpoint,
    }
}

/// Path of the peer-exchange endpoint on another scheduler node.
pub fn peer_exchange_path(address: &NodeAddress) -> EndpointPath {
    resolve(SERVER_SYSTEM, address, Endpoint::Peer)
}

/// Path of a worker's processing endpoint.
pub fn worker_processor_path(address: &NodeAddress) -> EndpointPath {
    resolve(WORKER_SYSTEM, address, Endpoint::WorkerProcessor)
}

/// Path of a worker's inbound-request endpoint.
pub fn worker_ingress_path(address: &NodeAddress) -> EndpointPath {
    resolve(WORKER_SYSTEM, address, Endpoint::WorkerIngress)
}

/// Best-effort discovery of the host's outbound IP address.
///
/// Opens a UDP socket toward a public address to learn which local interface
/// the kernel would route through; no datagram is actually sent. Falls back
/// to loopback when the host has no route.
pub fn discover_local_host() -> String {
    let probe = || -> std::io::Result<String> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.connect("8.8.8.8:80")?;
        Ok(socket.local_addr()?.ip().to_string())
    };

    match probe() {
        Ok(ip) => ip,
        Err(e) => {
            warn!(error = %e, "local address discovery failed, falling back to loopback");
            "127.0.0.1".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_address_renders_and_parses() {
        let addr = NodeAddress::new("10.1.2.3", 10086);
        assert_eq!(addr.to_string(), "10.1.2.3:10086");

        let parsed: NodeAddress = "10.1.2.3:10086".parse().unwrap();
        assert_eq!(parsed, addr);
    }

    #[test]
    fn malformed_addresses_are_rejected() {
        assert!("10.1.2.3".parse::<NodeAddress>().is_err());
        assert!("10.1.2.3:notaport".parse::<NodeAddress>().is_err());
        assert!(":10086".parse::<NodeAddress>().is_err());
    }

    #[test]
    fn resolution_is_deterministic() {
        let addr = NodeAddress::new("10.1.2.3", 10086);

        let first = resolve(SERVER_SYSTEM, &addr, Endpoint::Peer);
        let second = resolve(SERVER_SYSTEM, &addr, Endpoint::Peer);

        assert_eq!(first, second);
        assert_eq!(first.render(), second.render());
    }

    #[test]
    fn peer_exchange_path_renders_exactly() {
        let addr = NodeAddress::new("10.1.2.3", 10086);
        assert_eq!(
            peer_exchange_path(&addr).render(),
            "taskgrid://taskgrid-server@10.1.2.3:10086/user/peer"
        );
    }

    #[test]
    fn worker_paths_use_the_worker_system() {
        let addr = NodeAddress::new("192.168.0.7", 27777);

        assert_eq!(
            worker_processor_path(&addr).render(),
            "taskgrid://taskgrid-worker@192.168.0.7:27777/user/processor"
        );
        assert_eq!(
            worker_ingress_path(&addr).render(),
            "taskgrid://taskgrid-worker@192.168.0.7:27777/user/worker"
        );
    }

    #[test]
    fn endpoint_names_are_stable() {
        assert_eq!(Endpoint::Ingress.name(), "server");
        assert_eq!(Endpoint::Peer.name(), "peer");
        assert_eq!(Endpoint::Faults.name(), "faults");
        assert_eq!(Endpoint::WorkerProcessor.name(), "processor");
        assert_eq!(Endpoint::WorkerIngress.name(), "worker");
    }
}
