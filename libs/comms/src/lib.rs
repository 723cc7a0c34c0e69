//! Inter-Node Messaging for Taskgrid
//!
//! Bootstrap and communication facade for one node of the taskgrid job
//! scheduling cluster. One process-wide messaging runtime comes up at
//! startup, well-known endpoints are installed on it, and everything a node
//! says to another node flows through the ask gateway.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────┐      ┌────────────────────────┐
//! │      ClusterNode       │      │    MessagingRuntime    │
//! │                        │      │                        │
//! │  settings profile ─────┼──────┼─▶ TCP listener         │
//! │  endpoint set ─────────┼──────┼─▶ ingress pool (n×4)   │
//! │  fault observer ───────┼──────┼─▶ peer exchange        │
//! │                        │      │   fault endpoint       │
//! └────────────────────────┘      │   dead-letter stream   │
//!                                 └────────────────────────┘
//!              ask_peer("host:port", request)
//!                         │
//!                         ▼
//!      taskgrid://taskgrid-server@host:port/user/peer
//! ```
//!
//! Endpoint names and the path scheme are a cluster-wide convention: every
//! node registers the same names, so a path rendered here resolves on any
//! remote node.

pub mod address;
pub mod endpoint;
pub mod error;
pub mod fault;
pub mod gateway;
pub mod node;
pub mod runtime;
pub mod wire;

pub use address::{
    discover_local_host, peer_exchange_path, resolve, worker_ingress_path, worker_processor_path,
    Endpoint, EndpointPath, NodeAddress, SCHEME, SERVER_SYSTEM, WORKER_SYSTEM,
};
pub use endpoint::{
    default_ingress_pool_size, EndpointHandler, InboundRequest, IngressEndpoint, PeerExchange,
    PeerMessage,
};
pub use error::{CommsError, Result};
pub use fault::{spawn_fault_observer, DeadLetter, FaultEndpoint};
pub use gateway::DEFAULT_ASK_TIMEOUT;
pub use node::{ask_peer, init, local_address, ClusterNode, EndpointSet};
pub use runtime::{MessagingRuntime, RuntimeMetrics, RuntimeSettings, RuntimeStats};
pub use wire::{AskResponse, WireEnvelope};
