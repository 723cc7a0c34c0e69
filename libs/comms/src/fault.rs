//! Fault Observer
//!
//! Undeliverable messages never surface to any caller; they land on the
//! runtime's dead-letter stream, and the observer spawned here forwards each
//! one asynchronously to the fault-observation endpoint for diagnostic
//! handling. This path is strictly observational: a forwarding failure is
//! logged and swallowed, never propagated.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::address::Endpoint;
use crate::endpoint::{EndpointHandler, InboundRequest};
use crate::error::Result;
use crate::runtime::MessagingRuntime;
use crate::wire::AskResponse;

/// A message the runtime could not route to any live endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    /// Endpoint name the message was addressed to.
    pub endpoint: String,
    /// `host:port` identity of the original sender.
    pub sender: String,
    /// Why delivery failed.
    pub reason: &'static str,
    pub correlation: Uuid,
    pub payload: Value,
}

/// Forward the dead-letter stream into the fault-observation endpoint.
pub fn spawn_fault_observer(
    runtime: Arc<MessagingRuntime>,
    mut letters: mpsc::UnboundedReceiver<DeadLetter>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(letter) = letters.recv().await {
            let payload = match serde_json::to_value(&letter) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "could not encode dead letter for forwarding");
                    continue;
                }
            };
            if let Err(e) = runtime.deliver_local(Endpoint::Faults, payload).await {
                warn!(
                    endpoint = %letter.endpoint,
                    error = %e,
                    "could not forward dead letter to fault endpoint"
                );
            }
        }
        debug!("dead letter stream ended");
    })
}

/// Default fault-observation endpoint: records each dead letter and moves on.
/// Recovery heuristics live above this layer.
#[derive(Debug, Default)]
pub struct FaultEndpoint {
    observed: u64,
}

#[async_trait]
impl EndpointHandler for FaultEndpoint {
    async fn handle(&mut self, request: InboundRequest) -> Result<Option<AskResponse>> {
        self.observed += 1;
        warn!(
            observed = self.observed,
            letter = %request.payload,
            "dead letter observed"
        );
        Ok(None)
    }
}
