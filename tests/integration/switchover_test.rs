// tests/integration/switchover_test.rs

//! Integration tests for planned switchover
//! Tests: lag gate, fencing, handoff, demotion, rollback on a failed handoff

use super::test_helpers::{
    FakePeer, MAIN_IP, PEER_IP, SECONDARY_IP, TestContext, cluster_config, node,
};
use failoverd::core::ClusterError;
use failoverd::core::cluster::protocol::PromoteEvent;
use failoverd::core::cluster::state::{
    ApiRole, EventType, NodeStatus, RadiusRole, ServerRole, Severity,
};
use failoverd::core::replication::MemoryDriver;
use failoverd::core::replication::memory::DriverRole;
use failoverd::server::routes;
use tokio::net::TcpListener;

/// The main's view: node 1 is this node, node 2 a secondary served by a fake
/// peer, node 3 a reporting replica.
async fn main_context() -> (TestContext, FakePeer) {
    let peer = FakePeer::bind(SECONDARY_IP, 0).await;
    let config = cluster_config(MAIN_IP, "hw-1", ServerRole::Main, MAIN_IP, peer.port());
    let nodes = vec![
        node(1, MAIN_IP, ServerRole::Main, NodeStatus::Online),
        node(2, SECONDARY_IP, ServerRole::Secondary, NodeStatus::Online),
        node(3, PEER_IP, ServerRole::Server3, NodeStatus::Online),
    ];
    let ctx = TestContext::new(Some(config), nodes, MemoryDriver::primary());
    (ctx, peer)
}

#[tokio::test]
async fn test_switchover_hands_over_main_role() {
    let (ctx, peer) = main_context().await;

    ctx.controller.switchover_to_secondary(2).await.unwrap();

    // The target was asked to promote itself as part of a switchover.
    let promotions = peer.promotions();
    assert_eq!(promotions.len(), 1);
    assert_eq!(promotions[0].event, PromoteEvent::Switchover);
    assert_eq!(promotions[0].current_main, MAIN_IP);

    // Lag checked, then fenced, then demoted to follow the target.
    assert_eq!(ctx.driver.operations(), vec!["lag_bytes", "fence", "demote"]);
    assert_eq!(
        ctx.driver.role(),
        DriverRole::Replica {
            primary_host: SECONDARY_IP.to_string(),
            slot: "replica_hw_1".to_string(),
        }
    );

    let config = ctx.config().await;
    assert_eq!(config.server_role, ServerRole::Secondary);
    assert_eq!(config.main_server_ip, SECONDARY_IP);
    assert_eq!(config.api_role, ApiRole::Standby);
    assert_eq!(config.radius_role, RadiusRole::Backup);

    assert_eq!(
        ctx.event_types().await,
        vec![EventType::SwitchoverStarted, EventType::SwitchoverCompleted]
    );
    assert!(!ctx.controller.failover_state().is_in_progress());
}

#[tokio::test]
async fn test_switchover_rejected_when_lag_too_high() {
    let (ctx, peer) = main_context().await;
    ctx.driver.set_lag_bytes(5 * 1024 * 1024);

    let err = ctx.controller.switchover_to_secondary(2).await.unwrap_err();

    match err {
        ClusterError::ReplicationLagTooHigh {
            lag_bytes,
            max_bytes,
        } => {
            assert_eq!(lag_bytes, 5 * 1024 * 1024);
            assert_eq!(max_bytes, 1024 * 1024);
        }
        other => panic!("Expected ReplicationLagTooHigh, got {other:?}"),
    }

    // No side effects: not fenced, target never contacted, role unchanged.
    assert_eq!(ctx.driver.count("fence"), 0);
    assert!(!ctx.driver.is_read_only());
    assert!(peer.promotions().is_empty());
    assert_eq!(ctx.config().await.server_role, ServerRole::Main);
    assert!(ctx.events().await.is_empty());
    assert!(!ctx.controller.failover_state().is_in_progress());
}

#[tokio::test]
async fn test_switchover_lifts_fence_when_handoff_fails() {
    let (ctx, peer) = main_context().await;
    peer.reject_promotions();

    let err = ctx.controller.switchover_to_secondary(2).await.unwrap_err();

    assert!(matches!(err, ClusterError::PeerRequestFailed(_)));
    assert_eq!(
        ctx.driver.operations(),
        vec!["lag_bytes", "fence", "unfence"]
    );
    assert!(!ctx.driver.is_read_only());
    assert_eq!(ctx.driver.role(), DriverRole::Primary);

    let config = ctx.config().await;
    assert_eq!(config.server_role, ServerRole::Main);
    assert_eq!(config.main_server_ip, MAIN_IP);

    let events = ctx.events().await;
    assert_eq!(events.last().unwrap().event_type, EventType::SwitchoverFailed);
    assert_eq!(events.last().unwrap().severity, Severity::Critical);
}

#[tokio::test]
async fn test_switchover_aborts_when_fencing_fails() {
    let (ctx, peer) = main_context().await;
    ctx.driver.fail_fence(true);

    let err = ctx.controller.switchover_to_secondary(2).await.unwrap_err();

    assert!(matches!(err, ClusterError::FencingFailed(_)));
    assert!(peer.promotions().is_empty());
    assert_eq!(ctx.config().await.server_role, ServerRole::Main);
}

#[tokio::test]
async fn test_switchover_demotion_failure_is_reported() {
    let (ctx, peer) = main_context().await;
    ctx.driver.fail_demote(true);

    let err = ctx.controller.switchover_to_secondary(2).await.unwrap_err();

    assert!(matches!(err, ClusterError::DemotionFailed(_)));
    assert_eq!(peer.promotions().len(), 1);
    assert!(
        ctx.event_types()
            .await
            .contains(&EventType::SwitchoverFailed)
    );
}

#[tokio::test]
async fn test_switchover_requires_main_role() {
    let peer = FakePeer::bind(PEER_IP, 0).await;
    let config = cluster_config(SECONDARY_IP, "hw-2", ServerRole::Secondary, MAIN_IP, peer.port());
    let nodes = vec![
        node(1, MAIN_IP, ServerRole::Main, NodeStatus::Online),
        node(2, SECONDARY_IP, ServerRole::Secondary, NodeStatus::Online),
        node(3, PEER_IP, ServerRole::Secondary, NodeStatus::Online),
    ];
    let ctx = TestContext::new(Some(config), nodes, MemoryDriver::replica(MAIN_IP));

    let err = ctx.controller.switchover_to_secondary(3).await.unwrap_err();

    assert_eq!(
        err.to_string(),
        "can only initiate switchover from main server"
    );
    assert!(peer.promotions().is_empty());
}

#[tokio::test]
async fn test_switchover_target_must_be_secondary() {
    let (ctx, _peer) = main_context().await;

    let err = ctx.controller.switchover_to_secondary(3).await.unwrap_err();
    assert!(matches!(err, ClusterError::InvalidRequest(_)));

    let err = ctx.controller.switchover_to_secondary(1).await.unwrap_err();
    assert!(matches!(err, ClusterError::InvalidRequest(_)));

    let err = ctx.controller.switchover_to_secondary(9).await.unwrap_err();
    assert!(matches!(err, ClusterError::NodeNotFound(9)));

    assert!(ctx.driver.operations().is_empty());
}

#[tokio::test]
async fn test_switchover_rejected_while_failover_in_progress() {
    let (ctx, peer) = main_context().await;
    let _permit = ctx.controller.failover_state().try_begin().unwrap();

    let err = ctx.controller.switchover_to_secondary(2).await.unwrap_err();

    assert!(matches!(err, ClusterError::FailoverInProgress));
    assert!(peer.promotions().is_empty());
    assert!(ctx.driver.operations().is_empty());
}

#[tokio::test]
async fn test_switchover_rolls_back_when_target_is_busy() {
    // A real secondary, served by the controller's own router, that is
    // already running a failover of its own.
    let listener = TcpListener::bind(format!("{SECONDARY_IP}:0")).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let nodes = vec![
        node(1, MAIN_IP, ServerRole::Main, NodeStatus::Online),
        node(2, SECONDARY_IP, ServerRole::Secondary, NodeStatus::Online),
    ];
    let target = TestContext::new(
        Some(cluster_config(SECONDARY_IP, "hw-2", ServerRole::Secondary, MAIN_IP, port)),
        nodes.clone(),
        MemoryDriver::replica(MAIN_IP),
    );
    let _busy = target.controller.failover_state().try_begin().unwrap();
    let app = routes::router(target.controller.clone(), false);
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let main = TestContext::new(
        Some(cluster_config(MAIN_IP, "hw-1", ServerRole::Main, MAIN_IP, port)),
        nodes,
        MemoryDriver::primary(),
    );

    let err = main.controller.switchover_to_secondary(2).await.unwrap_err();

    match err {
        ClusterError::PeerRequestFailed(msg) => assert!(msg.contains("409"), "{msg}"),
        other => panic!("Expected PeerRequestFailed, got {other:?}"),
    }
    // The main stays writable and keeps its role; the target never promoted.
    assert_eq!(main.driver.operations(), vec!["lag_bytes", "fence", "unfence"]);
    assert_eq!(main.driver.role(), DriverRole::Primary);
    assert!(!main.driver.is_read_only());
    assert_eq!(main.config().await.server_role, ServerRole::Main);
    assert_eq!(target.driver.count("promote"), 0);
    assert_eq!(target.config().await.server_role, ServerRole::Secondary);

    server.abort();
}
