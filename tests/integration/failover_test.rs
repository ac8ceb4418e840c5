// tests/integration/failover_test.rs

//! Integration tests for the failover orchestrator
//! Tests: promotion pipeline, fatal vs non-fatal steps, in-progress guard, reports

use super::test_helpers::{
    FakePeer, MAIN_IP, PEER_IP, SECONDARY_IP, TestContext, cluster_config, fast_settings, node,
};
use failoverd::core::ClusterError;
use failoverd::core::cluster::ControllerSettings;
use failoverd::core::cluster::protocol::NotifyEvent;
use failoverd::core::cluster::state::{
    ApiRole, EventType, FailoverOutcome, FailoverTrigger, NodeStatus, RadiusRole, ServerRole,
    Severity,
};
use failoverd::core::replication::MemoryDriver;
use failoverd::core::replication::memory::DriverRole;

/// A three-node cluster seen from the secondary: node 1 is the (dead) main at
/// `MAIN_IP`, node 2 is this node, node 3 is a live peer.
async fn secondary_context() -> (TestContext, FakePeer) {
    let peer = FakePeer::bind(PEER_IP, 0).await;
    let config = cluster_config(SECONDARY_IP, "hw-2", ServerRole::Secondary, MAIN_IP, peer.port());
    let nodes = vec![
        node(1, MAIN_IP, ServerRole::Main, NodeStatus::Online),
        node(2, SECONDARY_IP, ServerRole::Secondary, NodeStatus::Online),
        node(3, PEER_IP, ServerRole::Secondary, NodeStatus::Online),
    ];
    let ctx = TestContext::new(Some(config), nodes, MemoryDriver::replica(MAIN_IP));
    (ctx, peer)
}

// ===== Successful Failover =====

#[tokio::test]
async fn test_failover_promotes_local_node() {
    let (ctx, peer) = secondary_context().await;

    let handle = ctx
        .controller
        .trigger_failover(FailoverTrigger::Monitor)
        .expect("failover should start");
    let outcome = handle.await.unwrap();
    assert!(outcome.is_completed(), "unexpected outcome: {outcome:?}");

    // Local config now describes a main.
    let config = ctx.config().await;
    assert_eq!(config.server_role, ServerRole::Main);
    assert_eq!(config.api_role, ApiRole::Active);
    assert_eq!(config.radius_role, RadiusRole::Primary);
    assert_eq!(config.main_server_ip, SECONDARY_IP);
    assert!(config.last_heartbeat.is_some());

    // Data store promoted, cache link detached.
    assert_eq!(ctx.driver.role(), DriverRole::Primary);
    assert_eq!(ctx.driver.count("promote"), 1);
    assert!(!ctx.driver.is_link_active());

    // Roster reflects the new topology.
    let local = ctx.node(2).await;
    assert_eq!(local.server_role, ServerRole::Main);
    assert_eq!(local.status, NodeStatus::Online);
    assert_eq!(ctx.node(1).await.status, NodeStatus::Offline);
    assert_eq!(ctx.node(3).await.server_role, ServerRole::Secondary);

    // The live peer heard about the new main.
    let notifications = peer.notifications();
    assert_eq!(notifications.len(), 1);
    assert_eq!(notifications[0].event, NotifyEvent::NewMain);
    assert_eq!(notifications[0].new_main_ip, SECONDARY_IP);
    assert_eq!(notifications[0].cluster_id, config.cluster_id);

    assert_eq!(ctx.services.restarts(), 1);
    assert_eq!(
        ctx.event_types().await,
        vec![EventType::FailoverStarted, EventType::FailoverCompleted]
    );
    assert!(!ctx.controller.failover_state().is_in_progress());
}

#[tokio::test]
async fn test_failover_steps_run_in_order() {
    let (ctx, _peer) = secondary_context().await;

    let outcome = ctx
        .controller
        .trigger_failover(FailoverTrigger::Monitor)
        .unwrap()
        .await
        .unwrap();
    assert!(outcome.is_completed());

    assert_eq!(
        ctx.driver.operations(),
        vec!["lag_seconds", "promote", "stop_link"]
    );
}

#[tokio::test]
async fn test_failover_publishes_report() {
    let (ctx, _peer) = secondary_context().await;
    let mut reports = ctx.controller.subscribe_reports();

    ctx.controller
        .trigger_failover(FailoverTrigger::Monitor)
        .unwrap()
        .await
        .unwrap();

    let report = reports.recv().await.unwrap();
    assert_eq!(report.trigger, FailoverTrigger::Monitor);
    assert!(report.outcome.is_completed());
    assert!(report.finished_at >= report.started_at);
}

#[tokio::test]
async fn test_failover_with_high_lag_still_promotes() {
    let (ctx, _peer) = secondary_context().await;
    ctx.driver.set_lag_seconds(Some(600.0));

    let outcome = ctx
        .controller
        .trigger_failover(FailoverTrigger::Monitor)
        .unwrap()
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert_eq!(ctx.config().await.server_role, ServerRole::Main);
}

#[tokio::test]
async fn test_switchover_trigger_keeps_former_main_as_secondary() {
    let (ctx, _peer) = secondary_context().await;

    let outcome = ctx
        .controller
        .trigger_failover(FailoverTrigger::Switchover {
            current_main: MAIN_IP.to_string(),
        })
        .unwrap()
        .await
        .unwrap();
    assert!(outcome.is_completed());

    let former_main = ctx.node(1).await;
    assert_eq!(former_main.server_role, ServerRole::Secondary);
    assert_eq!(former_main.status, NodeStatus::Syncing);
}

// ===== Fatal and Non-Fatal Failures =====

#[tokio::test]
async fn test_promotion_failure_aborts_failover() {
    let (ctx, peer) = secondary_context().await;
    ctx.driver.fail_promote(true);

    let outcome = ctx
        .controller
        .trigger_failover(FailoverTrigger::Monitor)
        .unwrap()
        .await
        .unwrap();

    match outcome {
        FailoverOutcome::Failed(ClusterError::PromotionFailed(_)) => {}
        other => panic!("Expected PromotionFailed, got {other:?}"),
    }

    // Nothing after the promotion step ran.
    let config = ctx.config().await;
    assert_eq!(config.server_role, ServerRole::Secondary);
    assert_eq!(config.main_server_ip, MAIN_IP);
    assert_eq!(ctx.node(1).await.status, NodeStatus::Online);
    assert!(peer.notifications().is_empty());
    assert_eq!(ctx.services.restarts(), 0);
    assert_eq!(ctx.driver.count("stop_link"), 0);

    let events = ctx.events().await;
    let failed = events
        .iter()
        .find(|e| e.event_type == EventType::FailoverFailed)
        .expect("failover_failed event should be recorded");
    assert_eq!(failed.severity, Severity::Critical);
    assert!(!events.iter().any(|e| e.event_type == EventType::FailoverCompleted));

    // The guard is released so a later attempt can run.
    assert!(!ctx.controller.failover_state().is_in_progress());
}

#[tokio::test]
async fn test_unreachable_peers_do_not_fail_failover() {
    // No fake peer: every notification is refused.
    let config = cluster_config(SECONDARY_IP, "hw-2", ServerRole::Secondary, MAIN_IP, 1);
    let nodes = vec![
        node(1, MAIN_IP, ServerRole::Main, NodeStatus::Online),
        node(2, SECONDARY_IP, ServerRole::Secondary, NodeStatus::Online),
        node(3, PEER_IP, ServerRole::Secondary, NodeStatus::Online),
    ];
    let ctx = TestContext::new(Some(config), nodes, MemoryDriver::replica(MAIN_IP));

    let outcome = ctx
        .controller
        .trigger_failover(FailoverTrigger::Monitor)
        .unwrap()
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert_eq!(ctx.config().await.server_role, ServerRole::Main);
    assert_eq!(ctx.services.restarts(), 1);
}

#[tokio::test]
async fn test_service_restart_failure_is_not_fatal() {
    let (ctx, _peer) = secondary_context().await;
    ctx.services.fail(true);

    let outcome = ctx
        .controller
        .trigger_failover(FailoverTrigger::Monitor)
        .unwrap()
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert_eq!(ctx.services.restarts(), 1);
    assert!(
        ctx.event_types()
            .await
            .contains(&EventType::FailoverCompleted)
    );
}

#[tokio::test]
async fn test_missing_roster_entry_is_not_fatal() {
    let config = cluster_config(SECONDARY_IP, "hw-2", ServerRole::Secondary, MAIN_IP, 1);
    let ctx = TestContext::new(Some(config), Vec::new(), MemoryDriver::replica(MAIN_IP));

    let outcome = ctx
        .controller
        .trigger_failover(FailoverTrigger::Monitor)
        .unwrap()
        .await
        .unwrap();

    assert!(outcome.is_completed());
    assert_eq!(ctx.config().await.server_role, ServerRole::Main);
}

#[tokio::test]
async fn test_failover_without_cluster_config_fails() {
    let ctx = TestContext::new(None, Vec::new(), MemoryDriver::replica(MAIN_IP));

    let outcome = ctx
        .controller
        .trigger_failover(FailoverTrigger::Monitor)
        .unwrap()
        .await
        .unwrap();

    assert!(matches!(
        outcome,
        FailoverOutcome::Failed(ClusterError::NotConfigured)
    ));
    assert_eq!(ctx.driver.count("promote"), 0);
}

// ===== In-Progress Guard =====

#[tokio::test]
async fn test_trigger_is_noop_while_in_progress() {
    let (ctx, _peer) = secondary_context().await;

    let permit = ctx.controller.failover_state().try_begin().unwrap();
    assert!(
        ctx.controller
            .trigger_failover(FailoverTrigger::Monitor)
            .is_none()
    );
    assert_eq!(ctx.driver.count("promote"), 0);

    drop(permit);
    let handle = ctx.controller.trigger_failover(FailoverTrigger::Monitor);
    assert!(handle.is_some());
    assert!(handle.unwrap().await.unwrap().is_completed());
}

#[tokio::test]
async fn test_concurrent_triggers_promote_once() {
    let (ctx, _peer) = secondary_context().await;

    let first = ctx.controller.trigger_failover(FailoverTrigger::Monitor);
    let second = ctx.controller.trigger_failover(FailoverTrigger::PeerRequest {
        current_main: MAIN_IP.to_string(),
    });

    assert!(first.is_some());
    assert!(second.is_none());
    first.unwrap().await.unwrap();
    assert_eq!(ctx.driver.count("promote"), 1);
}

// ===== Peer Quorum =====

#[tokio::test]
async fn test_peer_quorum_blocks_promotion_when_witnesses_unreachable() {
    let peer = FakePeer::bind(PEER_IP, 0).await;
    let config = cluster_config(SECONDARY_IP, "hw-2", ServerRole::Secondary, MAIN_IP, peer.port());
    let nodes = vec![
        node(1, MAIN_IP, ServerRole::Main, NodeStatus::Online),
        node(2, SECONDARY_IP, ServerRole::Secondary, NodeStatus::Online),
        node(3, PEER_IP, ServerRole::Secondary, NodeStatus::Online),
    ];
    let settings = ControllerSettings {
        require_peer_quorum: true,
        ..fast_settings()
    };
    let ctx = TestContext::with_settings(
        Some(config),
        nodes,
        MemoryDriver::replica(MAIN_IP),
        settings,
    );
    ctx.probe.set_healthy(false);

    let outcome = ctx
        .controller
        .trigger_failover(FailoverTrigger::Monitor)
        .unwrap()
        .await
        .unwrap();

    match outcome {
        FailoverOutcome::Failed(ClusterError::QuorumNotReached {
            reachable,
            required,
        }) => {
            assert_eq!(reachable, 0);
            assert_eq!(required, 1);
        }
        other => panic!("Expected QuorumNotReached, got {other:?}"),
    }
    assert_eq!(ctx.driver.count("promote"), 0);
    assert_eq!(ctx.config().await.server_role, ServerRole::Secondary);
}

#[tokio::test]
async fn test_peer_quorum_allows_promotion_when_witnesses_reachable() {
    let peer = FakePeer::bind(PEER_IP, 0).await;
    let config = cluster_config(SECONDARY_IP, "hw-2", ServerRole::Secondary, MAIN_IP, peer.port());
    let nodes = vec![
        node(1, MAIN_IP, ServerRole::Main, NodeStatus::Online),
        node(2, SECONDARY_IP, ServerRole::Secondary, NodeStatus::Online),
        node(3, PEER_IP, ServerRole::Secondary, NodeStatus::Online),
    ];
    let settings = ControllerSettings {
        require_peer_quorum: true,
        ..fast_settings()
    };
    let ctx = TestContext::with_settings(
        Some(config),
        nodes,
        MemoryDriver::replica(MAIN_IP),
        settings,
    );

    let outcome = ctx
        .controller
        .trigger_failover(FailoverTrigger::Monitor)
        .unwrap()
        .await
        .unwrap();

    assert!(outcome.is_completed());
    // Only the witness (node 3) is probed; the former main is excluded.
    assert_eq!(ctx.probe.checks(), 1);
    assert_eq!(peer.notifications().len(), 1);
}
