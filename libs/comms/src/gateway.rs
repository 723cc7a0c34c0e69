//! Remote Call Gateway
//!
//! The ask pattern: a request/response call built on one-way envelope sends,
//! where the caller suspends on a future until a correlated reply arrives or
//! the deadline elapses. This is the only synchronous-looking boundary over
//! the network, and every failure mode is a distinct typed condition:
//! timeout, transport fault, or an explicit failure reported by the remote
//! peer. Retry policy belongs to the caller, never to this layer.

use std::time::Duration;

use serde_json::Value;
use tokio::net::TcpStream;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::address::{peer_exchange_path, EndpointPath, NodeAddress};
use crate::error::{CommsError, Result};
use crate::runtime::MessagingRuntime;
use crate::wire::{self, AskResponse, WireEnvelope};

/// Default ask deadline, identical on every node in the cluster.
pub const DEFAULT_ASK_TIMEOUT: Duration = Duration::from_millis(5_000);

impl MessagingRuntime {
    /// Ask another scheduler node's peer-exchange endpoint and return the
    /// reply payload as a UTF-8 string.
    pub async fn ask_peer(&self, address: &NodeAddress, request: Value) -> Result<String> {
        self.ask(peer_exchange_path(address), request).await
    }

    /// Ask any resolvable endpoint, bounded by [`DEFAULT_ASK_TIMEOUT`].
    pub async fn ask(&self, path: EndpointPath, request: Value) -> Result<String> {
        use std::sync::atomic::Ordering;

        let metrics = self.metrics();
        metrics.asks_sent.fetch_add(1, Ordering::Relaxed);

        let correlation = Uuid::new_v4();
        let envelope = WireEnvelope::request(correlation, &path, self.local_address(), request);
        debug!(path = %path, correlation = %correlation, "sending ask");

        let reply = match tokio::time::timeout(DEFAULT_ASK_TIMEOUT, exchange(&path, &envelope)).await
        {
            Err(_) => {
                metrics.ask_timeouts.fetch_add(1, Ordering::Relaxed);
                warn!(path = %path, correlation = %correlation, "ask timed out");
                return Err(CommsError::timeout(
                    format!("ask {path}"),
                    DEFAULT_ASK_TIMEOUT.as_millis() as u64,
                ));
            }
            Ok(Err(e)) => {
                metrics.ask_failures.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
            Ok(Ok(reply)) => reply,
        };

        if reply.correlation != correlation {
            metrics.ask_failures.fetch_add(1, Ordering::Relaxed);
            return Err(CommsError::transport(format!(
                "reply correlation {} does not match request {correlation}",
                reply.correlation
            )));
        }

        let response: AskResponse = serde_json::from_value(reply.payload)?;
        if response.success {
            Ok(response.data_as_string())
        } else {
            metrics.ask_failures.fetch_add(1, Ordering::Relaxed);
            Err(CommsError::remote(
                response
                    .message
                    .unwrap_or_else(|| "remote endpoint reported failure".to_string()),
            ))
        }
    }
}

/// One connect-send-await round trip. The surrounding deadline in `ask`
/// bounds the whole exchange.
async fn exchange(path: &EndpointPath, envelope: &WireEnvelope) -> Result<WireEnvelope> {
    let target = path.address.to_string();

    let mut stream = TcpStream::connect(&target)
        .await
        .map_err(|e| CommsError::transport_with_source(format!("failed to connect to {target}"), e))?;
    if let Err(e) = stream.set_nodelay(true) {
        warn!(target = %target, error = %e, "failed to set TCP_NODELAY");
    }

    wire::write_frame(&mut stream, &envelope.encode()?).await?;

    match wire::read_frame(&mut stream).await? {
        Some(frame) => WireEnvelope::decode(&frame),
        None => Err(CommsError::transport(format!(
            "connection to {target} closed before a reply arrived"
        ))),
    }
}
