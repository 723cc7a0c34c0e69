//! Bootstrap and lifecycle behavior of whole cluster nodes.

use async_trait::async_trait;
use node_comms::{
    default_ingress_pool_size, AskResponse, ClusterNode, CommsError, Endpoint, EndpointHandler,
    EndpointSet, InboundRequest, RuntimeSettings, SERVER_SYSTEM,
};
use serde_json::{json, Value};

fn loopback_settings() -> RuntimeSettings {
    RuntimeSettings {
        system: SERVER_SYSTEM.to_string(),
        host: "127.0.0.1".to_string(),
        port: 0,
    }
}

#[tokio::test]
async fn two_nodes_reach_each_other_over_advertised_addresses() {
    let first = ClusterNode::bootstrap(loopback_settings(), EndpointSet::defaults())
        .await
        .unwrap();
    let second = ClusterNode::bootstrap(loopback_settings(), EndpointSet::defaults())
        .await
        .unwrap();

    // The advertised identity is exactly what the listener bound, so the
    // stock peer exchange answers a ping sent to it.
    let pong = first
        .ask_peer(
            second.local_address(),
            json!({"kind": "ping", "from": first.local_address().to_string()}),
        )
        .await
        .unwrap();

    assert_eq!(pong, "pong");
    assert_ne!(second.local_address().port, 0);
}

#[tokio::test]
async fn stock_ingress_pool_is_sized_from_logical_cores() {
    let node = ClusterNode::bootstrap(loopback_settings(), EndpointSet::defaults())
        .await
        .unwrap();

    assert_eq!(
        node.runtime().instance_count(Endpoint::Ingress).await,
        default_ingress_pool_size()
    );
    assert_eq!(default_ingress_pool_size(), num_cpus::get() * 4);
}

/// Peer handler that fails its first request and recovers afterwards.
struct FlakyPeer {
    calls: u32,
}

#[async_trait]
impl EndpointHandler for FlakyPeer {
    async fn handle(&mut self, _request: InboundRequest) -> node_comms::Result<Option<AskResponse>> {
        self.calls += 1;
        if self.calls == 1 {
            return Err(CommsError::transport("backing store unavailable"));
        }
        Ok(Some(AskResponse::succeed(Value::String("recovered".into()))))
    }
}

#[tokio::test]
async fn handler_errors_become_failure_replies_and_leave_the_instance_alive() {
    let responder = ClusterNode::bootstrap(
        loopback_settings(),
        EndpointSet {
            peer: Box::new(FlakyPeer { calls: 0 }),
            ..EndpointSet::defaults()
        },
    )
    .await
    .unwrap();
    let caller = ClusterNode::bootstrap(loopback_settings(), EndpointSet::defaults())
        .await
        .unwrap();
    let target = responder.local_address().clone();

    let err = caller
        .ask_peer(&target, json!({"kind": "ping", "from": "test"}))
        .await
        .unwrap_err();
    match err {
        CommsError::RemoteProcessing { message } => {
            assert!(message.contains("backing store unavailable"))
        }
        other => panic!("expected RemoteProcessing, got {other:?}"),
    }

    // The same instance answers the next request.
    let payload = caller
        .ask_peer(&target, json!({"kind": "ping", "from": "test"}))
        .await
        .unwrap();
    assert_eq!(payload, "recovered");
}

#[tokio::test]
async fn duplicate_endpoint_registration_fails_at_bootstrap() {
    let node = ClusterNode::bootstrap(loopback_settings(), EndpointSet::defaults())
        .await
        .unwrap();

    let err = node
        .runtime()
        .register(Endpoint::Peer, Box::new(FlakyPeer { calls: 0 }))
        .await
        .unwrap_err();

    assert!(matches!(err, CommsError::Bootstrap { .. }));
}

#[tokio::test]
async fn process_wide_init_claims_exactly_once() {
    // Point the process-wide bootstrap at a profile that cannot exist.
    std::env::set_var("TASKGRID_PROFILE", "no-such-profile-for-tests");

    let first = node_comms::init().await.unwrap_err();
    match first {
        CommsError::Bootstrap { message } => {
            assert!(message.contains("no-such-profile-for-tests"))
        }
        other => panic!("expected Bootstrap, got {other:?}"),
    }

    // The claim flag was taken by the first call; later calls fail fast.
    let second = node_comms::init().await.unwrap_err();
    match second {
        CommsError::Bootstrap { message } => assert!(message.contains("already initialized")),
        other => panic!("expected Bootstrap, got {other:?}"),
    }

    assert!(node_comms::local_address().is_none());

    let orphan = node_comms::ask_peer(
        &node_comms::NodeAddress::new("127.0.0.1", 1),
        Value::Null,
    )
    .await
    .unwrap_err();
    assert!(matches!(orphan, CommsError::Bootstrap { .. }));
}
