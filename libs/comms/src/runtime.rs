//! Messaging Runtime
//!
//! The process-wide message-passing engine. `bootstrap` binds the node's TCP
//! listener, reads the bound address back so the advertised identity always
//! equals the listener address, and starts the accept loop. Each accepted
//! connection gets its own task that reads length-prefixed envelopes and
//! routes them to the registered endpoint dispatchers; when a handler
//! produces a reply it is written back on the same connection.
//!
//! Envelopes that cannot reach any live handler (wrong system name, unknown
//! endpoint, closed mailbox) are pushed onto the dead-letter stream and are
//! never an error for the serving task; the remote caller simply times out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info, warn};

use crate::address::{Endpoint, NodeAddress};
use crate::endpoint::{self, Dispatcher, EndpointHandler, EndpointJob, MAILBOX_CAPACITY};
use crate::error::{CommsError, Result};
use crate::fault::DeadLetter;
use crate::wire::{self, AskResponse, WireEnvelope};

/// Listener settings for one messaging runtime.
#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    /// Runtime system name this node answers to.
    pub system: String,
    /// Host to bind and advertise.
    pub host: String,
    /// Port to bind. Port 0 asks the kernel for one; the advertised address
    /// reflects whatever was actually bound.
    pub port: u16,
}

/// Runtime counters, updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    pub messages_dispatched: AtomicU64,
    pub messages_handled: AtomicU64,
    pub total_processing_ns: AtomicU64,
    pub replies_sent: AtomicU64,
    pub dead_letters: AtomicU64,
    pub asks_sent: AtomicU64,
    pub ask_timeouts: AtomicU64,
    pub ask_failures: AtomicU64,
}

impl RuntimeMetrics {
    pub(crate) fn record_handled(&self, elapsed: Duration) {
        self.messages_handled.fetch_add(1, Ordering::Relaxed);
        self.total_processing_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn avg_processing_ns(&self) -> f64 {
        let handled = self.messages_handled.load(Ordering::Relaxed);
        if handled == 0 {
            return 0.0;
        }
        self.total_processing_ns.load(Ordering::Relaxed) as f64 / handled as f64
    }

    /// Snapshot the counters for logging or reporting.
    pub fn snapshot(&self) -> RuntimeStats {
        RuntimeStats {
            messages_dispatched: self.messages_dispatched.load(Ordering::Relaxed),
            messages_handled: self.messages_handled.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
            asks_sent: self.asks_sent.load(Ordering::Relaxed),
            ask_timeouts: self.ask_timeouts.load(Ordering::Relaxed),
            ask_failures: self.ask_failures.load(Ordering::Relaxed),
            avg_processing_ns: self.avg_processing_ns(),
        }
    }
}

/// Counter snapshot.
#[derive(Debug, Clone)]
pub struct RuntimeStats {
    pub messages_dispatched: u64,
    pub messages_handled: u64,
    pub replies_sent: u64,
    pub dead_letters: u64,
    pub asks_sent: u64,
    pub ask_timeouts: u64,
    pub ask_failures: u64,
    pub avg_processing_ns: f64,
}

/// The process-wide concurrent message-passing engine.
///
/// Created once at bootstrap and held behind an `Arc` for the remainder of
/// process lifetime; never mutated after construction, so readers share it
/// without any locking discipline around the handle itself.
pub struct MessagingRuntime {
    system: String,
    local_address: NodeAddress,
    endpoints: RwLock<HashMap<String, Dispatcher>>,
    dead_letters: mpsc::UnboundedSender<DeadLetter>,
    dead_letter_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<DeadLetter>>>,
    metrics: Arc<RuntimeMetrics>,
}

impl MessagingRuntime {
    /// Bind the listener and start serving inbound traffic.
    pub async fn bootstrap(settings: RuntimeSettings) -> Result<Arc<Self>> {
        let listener = TcpListener::bind((settings.host.as_str(), settings.port))
            .await
            .map_err(|e| {
                CommsError::bootstrap(format!(
                    "failed to bind listener on {}:{}: {e}",
                    settings.host, settings.port
                ))
            })?;
        let bound = listener.local_addr().map_err(|e| {
            CommsError::bootstrap(format!("failed to read back bound listener address: {e}"))
        })?;

        // The advertised identity and the bound listener must never drift.
        let local_address = NodeAddress::new(settings.host, bound.port());

        let (dead_letter_tx, dead_letter_rx) = mpsc::unbounded_channel();
        let runtime = Arc::new(Self {
            system: settings.system,
            local_address,
            endpoints: RwLock::new(HashMap::new()),
            dead_letters: dead_letter_tx,
            dead_letter_rx: parking_lot::Mutex::new(Some(dead_letter_rx)),
            metrics: Arc::new(RuntimeMetrics::default()),
        });

        tokio::spawn(accept_loop(listener, Arc::clone(&runtime)));

        info!(
            system = %runtime.system,
            address = %runtime.local_address,
            "messaging runtime listening"
        );
        Ok(runtime)
    }

    /// Runtime system name this node answers to.
    pub fn system(&self) -> &str {
        &self.system
    }

    /// The `host:port` identity advertised to the rest of the cluster.
    pub fn local_address(&self) -> &NodeAddress {
        &self.local_address
    }

    pub fn metrics(&self) -> Arc<RuntimeMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Hand out the dead-letter stream. There is exactly one receiver;
    /// subsequent calls get `None`.
    pub fn subscribe_dead_letters(&self) -> Option<mpsc::UnboundedReceiver<DeadLetter>> {
        self.dead_letter_rx.lock().take()
    }

    /// Register a single-instance endpoint under a well-known name.
    pub async fn register(&self, endpoint: Endpoint, handler: Box<dyn EndpointHandler>) -> Result<()> {
        let mut endpoints = self.endpoints.write().await;
        if endpoints.contains_key(endpoint.name()) {
            return Err(CommsError::bootstrap(format!(
                "endpoint '{endpoint}' is already registered"
            )));
        }

        let (lane, mailbox) = mpsc::channel(MAILBOX_CAPACITY);
        endpoint::spawn_instance(endpoint.name(), 0, handler, mailbox, Arc::clone(&self.metrics));
        endpoints.insert(endpoint.name().to_string(), Dispatcher::Single(lane));

        debug!(endpoint = %endpoint, "endpoint registered");
        Ok(())
    }

    /// Register a fixed-size pool of homogeneous instances behind round-robin
    /// rotation.
    pub async fn register_pool<F>(&self, endpoint: Endpoint, size: usize, factory: F) -> Result<()>
    where
        F: Fn() -> Box<dyn EndpointHandler>,
    {
        if size == 0 {
            return Err(CommsError::bootstrap(format!(
                "endpoint pool '{endpoint}' must have at least one instance"
            )));
        }

        let mut endpoints = self.endpoints.write().await;
        if endpoints.contains_key(endpoint.name()) {
            return Err(CommsError::bootstrap(format!(
                "endpoint '{endpoint}' is already registered"
            )));
        }

        let mut lanes = Vec::with_capacity(size);
        for index in 0..size {
            let (lane, mailbox) = mpsc::channel(MAILBOX_CAPACITY);
            endpoint::spawn_instance(
                endpoint.name(),
                index,
                factory(),
                mailbox,
                Arc::clone(&self.metrics),
            );
            lanes.push(lane);
        }
        endpoints.insert(
            endpoint.name().to_string(),
            Dispatcher::Pool {
                lanes,
                cursor: std::sync::atomic::AtomicUsize::new(0),
            },
        );

        info!(endpoint = %endpoint, instances = size, "endpoint pool registered");
        Ok(())
    }

    /// Number of live instances behind a registered name.
    pub async fn instance_count(&self, endpoint: Endpoint) -> usize {
        self.endpoints
            .read()
            .await
            .get(endpoint.name())
            .map(Dispatcher::instances)
            .unwrap_or(0)
    }

    /// Route an inbound envelope to its endpoint. Returns the reply channel,
    /// or `None` when the envelope was dead-lettered.
    pub(crate) async fn dispatch(
        &self,
        envelope: WireEnvelope,
    ) -> Option<oneshot::Receiver<AskResponse>> {
        if envelope.system != self.system {
            self.dead_letter(envelope, "system name mismatch");
            return None;
        }

        let lane = {
            let endpoints = self.endpoints.read().await;
            endpoints.get(&envelope.endpoint).map(Dispatcher::pick)
        };
        let Some(lane) = lane else {
            self.dead_letter(envelope, "no such endpoint");
            return None;
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        match lane
            .send(EndpointJob {
                envelope,
                reply: Some(reply_tx),
            })
            .await
        {
            Ok(()) => {
                self.metrics.messages_dispatched.fetch_add(1, Ordering::Relaxed);
                Some(reply_rx)
            }
            Err(returned) => {
                self.dead_letter(returned.0.envelope, "endpoint mailbox closed");
                None
            }
        }
    }

    /// Deliver a payload straight into a local endpoint's mailbox, without a
    /// reply. Used for on-node notifications such as dead-letter forwarding;
    /// a missing endpoint here is reported to the caller instead of being
    /// dead-lettered again.
    pub(crate) async fn deliver_local(&self, endpoint: Endpoint, payload: serde_json::Value) -> Result<()> {
        let lane = {
            let endpoints = self.endpoints.read().await;
            endpoints.get(endpoint.name()).map(Dispatcher::pick)
        };
        let lane = lane.ok_or_else(|| {
            CommsError::transport(format!("endpoint '{endpoint}' is not registered"))
        })?;

        let envelope = WireEnvelope {
            correlation: uuid::Uuid::new_v4(),
            system: self.system.clone(),
            endpoint: endpoint.name().to_string(),
            sender: self.local_address.to_string(),
            payload,
        };
        lane.send(EndpointJob {
            envelope,
            reply: None,
        })
        .await
        .map_err(|_| CommsError::transport(format!("endpoint '{endpoint}' mailbox is closed")))
    }

    fn dead_letter(&self, envelope: WireEnvelope, reason: &'static str) {
        self.metrics.dead_letters.fetch_add(1, Ordering::Relaxed);
        warn!(
            endpoint = %envelope.endpoint,
            sender = %envelope.sender,
            reason,
            "undeliverable message"
        );

        let letter = DeadLetter {
            endpoint: envelope.endpoint,
            sender: envelope.sender,
            reason,
            correlation: envelope.correlation,
            payload: envelope.payload,
        };
        if self.dead_letters.send(letter).is_err() {
            debug!("dead letter stream receiver dropped");
        }
    }
}

async fn accept_loop(listener: TcpListener, runtime: Arc<MessagingRuntime>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
                }
                tokio::spawn(serve_connection(stream, peer, Arc::clone(&runtime)));
            }
            Err(e) => {
                warn!(error = %e, "failed to accept connection");
            }
        }
    }
}

/// Serve one inbound connection: read envelopes, dispatch, write replies.
/// Any failure terminates this connection only.
async fn serve_connection(
    mut stream: TcpStream,
    peer: std::net::SocketAddr,
    runtime: Arc<MessagingRuntime>,
) {
    loop {
        let frame = match wire::read_frame(&mut stream).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                debug!(peer = %peer, "connection closed by peer");
                break;
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "failed to read inbound frame");
                break;
            }
        };

        let envelope = match WireEnvelope::decode(&frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(peer = %peer, error = %e, "failed to decode inbound envelope");
                break;
            }
        };
        let correlation = envelope.correlation;

        let Some(reply_rx) = runtime.dispatch(envelope).await else {
            // Dead-lettered; the remote caller's deadline handles the rest.
            continue;
        };

        // The handler dropped the reply sender when it had nothing to say.
        let Ok(response) = reply_rx.await else {
            continue;
        };

        let written = WireEnvelope::reply(
            correlation,
            runtime.system(),
            runtime.local_address(),
            &response,
        )
        .and_then(|reply| reply.encode());
        match written {
            Ok(bytes) => {
                if let Err(e) = wire::write_frame(&mut stream, &bytes).await {
                    warn!(peer = %peer, error = %e, "failed to write reply");
                    break;
                }
                runtime.metrics.replies_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(peer = %peer, error = %e, "failed to encode reply");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::IngressEndpoint;
    use uuid::Uuid;

    fn test_settings() -> RuntimeSettings {
        RuntimeSettings {
            system: crate::address::SERVER_SYSTEM.to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
        }
    }

    fn envelope_for(runtime: &MessagingRuntime, endpoint: &str) -> WireEnvelope {
        WireEnvelope {
            correlation: Uuid::new_v4(),
            system: runtime.system().to_string(),
            endpoint: endpoint.to_string(),
            sender: "127.0.0.1:1".to_string(),
            payload: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn advertised_address_matches_bound_listener() {
        let runtime = MessagingRuntime::bootstrap(test_settings()).await.unwrap();

        let advertised = runtime.local_address();
        assert_eq!(advertised.host, "127.0.0.1");
        assert_ne!(advertised.port, 0);

        // The advertised port really is the listening socket.
        TcpStream::connect(advertised.to_string()).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_registration_is_a_bootstrap_error() {
        let runtime = MessagingRuntime::bootstrap(test_settings()).await.unwrap();

        runtime
            .register(Endpoint::Peer, Box::new(IngressEndpoint::default()))
            .await
            .unwrap();
        let err = runtime
            .register(Endpoint::Peer, Box::new(IngressEndpoint::default()))
            .await
            .unwrap_err();

        assert_eq!(err.category(), "bootstrap");
    }

    #[tokio::test]
    async fn dead_letter_stream_has_a_single_subscriber() {
        let runtime = MessagingRuntime::bootstrap(test_settings()).await.unwrap();

        assert!(runtime.subscribe_dead_letters().is_some());
        assert!(runtime.subscribe_dead_letters().is_none());
    }

    #[tokio::test]
    async fn unknown_endpoint_is_dead_lettered() {
        let runtime = MessagingRuntime::bootstrap(test_settings()).await.unwrap();
        let mut letters = runtime.subscribe_dead_letters().unwrap();

        let envelope = envelope_for(&runtime, "nonexistent");
        assert!(runtime.dispatch(envelope).await.is_none());

        let letter = letters.recv().await.unwrap();
        assert_eq!(letter.endpoint, "nonexistent");
        assert_eq!(letter.reason, "no such endpoint");
        assert_eq!(runtime.metrics().snapshot().dead_letters, 1);
    }

    #[tokio::test]
    async fn foreign_system_envelopes_are_dead_lettered() {
        let runtime = MessagingRuntime::bootstrap(test_settings()).await.unwrap();
        let mut letters = runtime.subscribe_dead_letters().unwrap();

        let mut envelope = envelope_for(&runtime, "peer");
        envelope.system = crate::address::WORKER_SYSTEM.to_string();
        assert!(runtime.dispatch(envelope).await.is_none());

        let letter = letters.recv().await.unwrap();
        assert_eq!(letter.reason, "system name mismatch");
    }

    #[tokio::test]
    async fn pool_registration_reports_instance_count() {
        let runtime = MessagingRuntime::bootstrap(test_settings()).await.unwrap();

        runtime
            .register_pool(Endpoint::Ingress, 8, || {
                Box::new(IngressEndpoint::default()) as Box<dyn EndpointHandler>
            })
            .await
            .unwrap();

        assert_eq!(runtime.instance_count(Endpoint::Ingress).await, 8);
        assert_eq!(runtime.instance_count(Endpoint::Peer).await, 0);
    }
}
