//! Cluster Node Bootstrap
//!
//! Ties the pieces together: loads the node's settings profile, brings up the
//! messaging runtime, installs the well-known endpoints, and subscribes the
//! fault observer. `ClusterNode::bootstrap` is the explicit, injectable form;
//! `init` is the process-wide entry point that publishes a single node handle
//! for the lifetime of the process.
//!
//! Initialization policy: a second `init` call fails with a bootstrap error.
//! The claim flag is taken before any work starts, so concurrent callers
//! cannot race two runtimes into existence; and since a failed bootstrap is
//! fatal for the process, the flag is never released.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use once_cell::sync::OnceCell;
use serde_json::Value;
use tracing::info;

use crate::address::{self, Endpoint, NodeAddress, SERVER_SYSTEM};
use crate::endpoint::{
    default_ingress_pool_size, EndpointHandler, IngressEndpoint, PeerExchange,
};
use crate::error::{CommsError, Result};
use crate::fault::{spawn_fault_observer, FaultEndpoint};
use crate::runtime::{MessagingRuntime, RuntimeSettings};

/// Environment variable naming the settings profile to load.
pub const PROFILE_ENV: &str = "TASKGRID_PROFILE";

/// Profile used when [`PROFILE_ENV`] is unset.
pub const DEFAULT_PROFILE: &str = "server";

static INIT_CLAIMED: AtomicBool = AtomicBool::new(false);
static NODE: OnceCell<Arc<ClusterNode>> = OnceCell::new();

/// The handlers installed on a node at bootstrap.
pub struct EndpointSet {
    /// Replication factor of the inbound-request pool.
    pub ingress_pool_size: usize,
    /// Factory producing one handler per pool instance.
    pub ingress: Box<dyn Fn() -> Box<dyn EndpointHandler> + Send + Sync>,
    /// Peer-to-peer exchange handler. Single instance.
    pub peer: Box<dyn EndpointHandler>,
    /// Fault-observation handler. Single instance.
    pub faults: Box<dyn EndpointHandler>,
}

impl EndpointSet {
    /// The stock handler set: acknowledging ingress, ping-answering peer
    /// exchange, logging fault endpoint.
    pub fn defaults() -> Self {
        Self {
            ingress_pool_size: default_ingress_pool_size(),
            ingress: Box::new(|| Box::new(IngressEndpoint::default()) as Box<dyn EndpointHandler>),
            peer: Box::new(PeerExchange),
            faults: Box::new(FaultEndpoint::default()),
        }
    }
}

/// One bootstrapped node: the runtime handle plus its installed endpoints.
pub struct ClusterNode {
    runtime: Arc<MessagingRuntime>,
}

impl ClusterNode {
    /// Bring up a node from explicit settings and handlers.
    pub async fn bootstrap(settings: RuntimeSettings, endpoints: EndpointSet) -> Result<Arc<Self>> {
        let started = Instant::now();

        let runtime = MessagingRuntime::bootstrap(settings).await?;

        runtime
            .register_pool(
                Endpoint::Ingress,
                endpoints.ingress_pool_size,
                endpoints.ingress.as_ref(),
            )
            .await?;
        runtime.register(Endpoint::Peer, endpoints.peer).await?;
        runtime.register(Endpoint::Faults, endpoints.faults).await?;

        let letters = runtime
            .subscribe_dead_letters()
            .ok_or_else(|| CommsError::bootstrap("dead letter stream already claimed"))?;
        spawn_fault_observer(Arc::clone(&runtime), letters);

        info!(
            address = %runtime.local_address(),
            ingress_instances = endpoints.ingress_pool_size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "cluster node bootstrap complete"
        );
        Ok(Arc::new(Self { runtime }))
    }

    pub fn runtime(&self) -> &Arc<MessagingRuntime> {
        &self.runtime
    }

    /// The `host:port` identity this node advertises.
    pub fn local_address(&self) -> &NodeAddress {
        self.runtime.local_address()
    }

    /// Ask another scheduler node's peer-exchange endpoint.
    pub async fn ask_peer(&self, address: &NodeAddress, request: Value) -> Result<String> {
        self.runtime.ask_peer(address, request).await
    }
}

/// Bring up the process-wide node from process-level settings.
///
/// Reads the profile named by `TASKGRID_PROFILE` (default `"server"`),
/// discovers the local host when the profile does not pin one, and installs
/// the default endpoint set. Must be called exactly once per process; any
/// later call fails with a bootstrap error.
pub async fn init() -> Result<()> {
    if INIT_CLAIMED.swap(true, Ordering::SeqCst) {
        return Err(CommsError::bootstrap(
            "messaging runtime is already initialized",
        ));
    }

    let profile =
        std::env::var(PROFILE_ENV).unwrap_or_else(|_| DEFAULT_PROFILE.to_string());
    info!(profile = %profile, "bootstrapping process-wide cluster node");

    let settings = node_config::load_profile(&profile, &HashMap::new()).map_err(|e| {
        CommsError::bootstrap(format!(
            "failed to load configuration profile '{profile}': {e:#}"
        ))
    })?;

    let host = settings
        .host
        .clone()
        .unwrap_or_else(address::discover_local_host);
    let node = ClusterNode::bootstrap(
        RuntimeSettings {
            system: SERVER_SYSTEM.to_string(),
            host,
            port: settings.port,
        },
        EndpointSet::defaults(),
    )
    .await?;

    NODE.set(node)
        .map_err(|_| CommsError::bootstrap("messaging runtime is already initialized"))
}

/// The advertised identity of the process-wide node, once `init` has run.
pub fn local_address() -> Option<NodeAddress> {
    NODE.get().map(|node| node.local_address().clone())
}

/// Ask a peer through the process-wide node.
pub async fn ask_peer(address: &NodeAddress, request: Value) -> Result<String> {
    let node = NODE
        .get()
        .ok_or_else(|| CommsError::bootstrap("messaging runtime is not initialized"))?;
    node.ask_peer(address, request).await
}
