//! Endpoint Handlers and Dispatch
//!
//! An endpoint is an independently addressable message-handling unit bound to
//! a well-known name on the local runtime. A registration is either a single
//! instance (one mailbox, one task) or a fixed-size pool of homogeneous
//! instances behind round-robin rotation. The pool is the scaling mechanism
//! for the inbound-request endpoint, trading memory for parallel handling
//! capacity.
//!
//! Handler failures stay inside the owning instance: the error is logged and
//! turned into a failure reply for the waiting caller, and the instance keeps
//! consuming its mailbox.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::runtime::RuntimeMetrics;
use crate::wire::{AskResponse, WireEnvelope};

/// Mailbox capacity of a single endpoint instance.
pub(crate) const MAILBOX_CAPACITY: usize = 1000;

/// Replication factor of the inbound-request pool, fixed at bootstrap.
pub fn default_ingress_pool_size() -> usize {
    num_cpus::get() * 4
}

/// A request delivered to an endpoint instance.
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub correlation: Uuid,
    /// `host:port` identity of the sending node.
    pub sender: String,
    pub payload: Value,
}

impl From<WireEnvelope> for InboundRequest {
    fn from(envelope: WireEnvelope) -> Self {
        Self {
            correlation: envelope.correlation,
            sender: envelope.sender,
            payload: envelope.payload,
        }
    }
}

/// Behavior bound to a well-known endpoint name.
///
/// Returning `Ok(None)` means the request gets no reply (fire-and-forget
/// deliveries such as dead-letter notifications).
#[async_trait]
pub trait EndpointHandler: Send + 'static {
    async fn handle(&mut self, request: InboundRequest) -> Result<Option<AskResponse>>;
}

/// Work item queued into an instance mailbox.
pub(crate) struct EndpointJob {
    pub envelope: WireEnvelope,
    pub reply: Option<oneshot::Sender<AskResponse>>,
}

/// Routing entry for one registered endpoint name.
pub(crate) enum Dispatcher {
    Single(mpsc::Sender<EndpointJob>),
    Pool {
        lanes: Vec<mpsc::Sender<EndpointJob>>,
        cursor: AtomicUsize,
    },
}

impl Dispatcher {
    /// Pick the mailbox the next delivery goes to.
    pub(crate) fn pick(&self) -> mpsc::Sender<EndpointJob> {
        match self {
            Dispatcher::Single(lane) => lane.clone(),
            Dispatcher::Pool { lanes, cursor } => {
                let index = cursor.fetch_add(1, Ordering::Relaxed) % lanes.len();
                lanes[index].clone()
            }
        }
    }

    pub(crate) fn instances(&self) -> usize {
        match self {
            Dispatcher::Single(_) => 1,
            Dispatcher::Pool { lanes, .. } => lanes.len(),
        }
    }
}

/// Run one endpoint instance until its mailbox closes.
pub(crate) fn spawn_instance(
    endpoint: &str,
    index: usize,
    mut handler: Box<dyn EndpointHandler>,
    mut mailbox: mpsc::Receiver<EndpointJob>,
    metrics: Arc<RuntimeMetrics>,
) -> JoinHandle<()> {
    let endpoint = endpoint.to_string();
    tokio::spawn(async move {
        debug!(endpoint = %endpoint, instance = index, "endpoint instance started");

        while let Some(job) = mailbox.recv().await {
            let started = Instant::now();
            let reply = job.reply;

            match handler.handle(InboundRequest::from(job.envelope)).await {
                Ok(Some(response)) => {
                    if let Some(tx) = reply {
                        let _ = tx.send(response);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        endpoint = %endpoint,
                        instance = index,
                        error = %e,
                        error_category = e.category(),
                        "endpoint handler failed"
                    );
                    if let Some(tx) = reply {
                        let _ = tx.send(AskResponse::fail(e.to_string()));
                    }
                }
            }

            metrics.record_handled(started.elapsed());
        }

        debug!(endpoint = %endpoint, instance = index, "endpoint instance stopped");
    })
}

/// Messages understood by the peer-exchange endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PeerMessage {
    /// Liveness probe between scheduler nodes.
    Ping { from: String },
}

/// Default peer-to-peer exchange endpoint. Single instance, so probe ordering
/// between two nodes stays stable.
#[derive(Debug, Default)]
pub struct PeerExchange;

#[async_trait]
impl EndpointHandler for PeerExchange {
    async fn handle(&mut self, request: InboundRequest) -> Result<Option<AskResponse>> {
        match serde_json::from_value::<PeerMessage>(request.payload.clone()) {
            Ok(PeerMessage::Ping { from }) => {
                debug!(from = %from, "peer ping received");
                Ok(Some(AskResponse::succeed(Value::String("pong".into()))))
            }
            Err(_) => Ok(Some(AskResponse::fail(format!(
                "unsupported peer request: {}",
                request.payload
            )))),
        }
    }
}

/// Default inbound-request endpoint instance. Acknowledges worker traffic;
/// scheduling decisions happen above this layer.
#[derive(Debug, Default)]
pub struct IngressEndpoint {
    handled: u64,
}

#[async_trait]
impl EndpointHandler for IngressEndpoint {
    async fn handle(&mut self, request: InboundRequest) -> Result<Option<AskResponse>> {
        self.handled += 1;
        debug!(
            sender = %request.sender,
            handled = self.handled,
            "ingress request accepted"
        );
        Ok(Some(AskResponse::succeed(Value::Null)))
    }
}
