// tests/integration/peer_handler_test.rs

//! Integration tests for inbound peer messages
//! Tests: promote requests, new-main notifications, authentication, split brain

use super::test_helpers::{
    FakePeer, MAIN_IP, PEER_IP, SECONDARY_IP, TestContext, cluster_config, node,
};
use failoverd::core::ClusterError;
use failoverd::core::cluster::ClusterController;
use failoverd::core::cluster::failover::PromoteAck;
use failoverd::core::cluster::protocol::{
    self, NotifyMessage, PeerAuthenticator, PromoteEvent, PromoteRequest,
};
use failoverd::core::cluster::state::{
    ClusterConfig, EventType, FailoverTrigger, NodeStatus, ServerRole, Severity,
};
use failoverd::core::cluster::store::{ClusterStore, MemoryStore};
use failoverd::core::replication::MemoryDriver;
use std::sync::Arc;
use std::time::Duration;

fn main_config(port: u16) -> ClusterConfig {
    cluster_config(MAIN_IP, "hw-1", ServerRole::Main, MAIN_IP, port)
}

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

// ===== Promote Requests =====

#[tokio::test]
async fn test_promote_request_starts_failover() {
    let (ctx, peer) = secondary_context().await;
    let mut reports = ctx.controller.subscribe_reports();
    let request = PromoteRequest::new(PromoteEvent::PromoteToMain, &main_config(peer.port()));

    let ack = ctx.controller.handle_promote_request(&request).await.unwrap();
    assert_eq!(ack, PromoteAck::Accepted);

    let report = reports.recv().await.unwrap();
    assert_eq!(
        report.trigger,
        FailoverTrigger::PeerRequest {
            current_main: MAIN_IP.to_string()
        }
    );
    assert!(report.outcome.is_completed());
    assert_eq!(ctx.config().await.server_role, ServerRole::Main);
    assert_eq!(ctx.node(1).await.status, NodeStatus::Offline);
}

#[tokio::test]
async fn test_switchover_request_marks_former_main_syncing() {
    let (ctx, peer) = secondary_context().await;
    let mut reports = ctx.controller.subscribe_reports();
    let request = PromoteRequest::new(PromoteEvent::Switchover, &main_config(peer.port()));

    ctx.controller.handle_promote_request(&request).await.unwrap();

    let report = reports.recv().await.unwrap();
    assert!(matches!(report.trigger, FailoverTrigger::Switchover { .. }));
    let former_main = ctx.node(1).await;
    assert_eq!(former_main.server_role, ServerRole::Secondary);
    assert_eq!(former_main.status, NodeStatus::Syncing);
}

#[tokio::test]
async fn test_promote_request_with_wrong_secret_is_rejected() {
    let (ctx, peer) = secondary_context().await;
    let mut request = PromoteRequest::new(PromoteEvent::PromoteToMain, &main_config(peer.port()));
    request.cluster_secret = "guess".to_string();

    let err = ctx
        .controller
        .handle_promote_request(&request)
        .await
        .unwrap_err();

    assert!(matches!(err, ClusterError::AuthenticationFailed(_)));
    assert!(!ctx.controller.failover_state().is_in_progress());
    assert_eq!(ctx.driver.count("promote"), 0);
}

#[tokio::test]
async fn test_promote_request_for_other_cluster_is_rejected() {
    let (ctx, peer) = secondary_context().await;
    let mut request = PromoteRequest::new(PromoteEvent::PromoteToMain, &main_config(peer.port()));
    request.cluster_id = "other-cluster".to_string();

    let err = ctx
        .controller
        .handle_promote_request(&request)
        .await
        .unwrap_err();

    assert!(matches!(err, ClusterError::AuthenticationFailed(_)));
}

#[tokio::test]
async fn test_promote_request_on_main_is_rejected() {
    let config = main_config(1);
    let ctx = TestContext::new(
        Some(config.clone()),
        vec![node(1, MAIN_IP, ServerRole::Main, NodeStatus::Online)],
        MemoryDriver::primary(),
    );
    let request = PromoteRequest::new(PromoteEvent::PromoteToMain, &config);

    let err = ctx
        .controller
        .handle_promote_request(&request)
        .await
        .unwrap_err();

    assert!(matches!(err, ClusterError::WrongRole(_)));
    assert_eq!(ctx.driver.count("promote"), 0);
}

#[tokio::test]
async fn test_promote_request_on_server3_is_rejected() {
    let config = cluster_config(PEER_IP, "hw-3", ServerRole::Server3, MAIN_IP, 1);
    let ctx = TestContext::new(Some(config), Vec::new(), MemoryDriver::replica(MAIN_IP));
    let request = PromoteRequest::new(PromoteEvent::PromoteToMain, &main_config(1));

    let err = ctx
        .controller
        .handle_promote_request(&request)
        .await
        .unwrap_err();

    assert!(matches!(err, ClusterError::WrongRole(_)));
}

#[tokio::test]
async fn test_promote_request_while_in_progress_is_acknowledged() {
    let (ctx, peer) = secondary_context().await;
    let _permit = ctx.controller.failover_state().try_begin().unwrap();
    let request = PromoteRequest::new(PromoteEvent::PromoteToMain, &main_config(peer.port()));

    let ack = ctx.controller.handle_promote_request(&request).await.unwrap();

    assert_eq!(ack, PromoteAck::AlreadyInProgress);
    assert_eq!(ctx.driver.count("promote"), 0);
}

#[tokio::test]
async fn test_switchover_request_while_in_progress_is_refused() {
    let (ctx, peer) = secondary_context().await;
    let _permit = ctx.controller.failover_state().try_begin().unwrap();
    let request = PromoteRequest::new(PromoteEvent::Switchover, &main_config(peer.port()));

    let err = ctx.controller.handle_promote_request(&request).await.unwrap_err();

    assert!(matches!(err, ClusterError::FailoverInProgress));
    assert_eq!(ctx.driver.count("promote"), 0);
}

// ===== New-Main Notifications =====

#[tokio::test]
async fn test_new_main_updates_local_config() {
    let (ctx, _peer) = secondary_context().await;
    let announcer = cluster_config(PEER_IP, "hw-3", ServerRole::Main, PEER_IP, 1);

    ctx.controller
        .handle_new_main(&NotifyMessage::new_main(&announcer, PEER_IP))
        .await
        .unwrap();

    let config = ctx.config().await;
    assert_eq!(config.main_server_ip, PEER_IP);
    assert_eq!(config.server_role, ServerRole::Secondary);
    assert!(config.last_heartbeat.is_some());
}

#[tokio::test]
async fn test_new_main_with_wrong_secret_is_rejected() {
    let (ctx, _peer) = secondary_context().await;
    let announcer = cluster_config(PEER_IP, "hw-3", ServerRole::Main, PEER_IP, 1);
    let mut message = NotifyMessage::new_main(&announcer, PEER_IP);
    message.cluster_secret = "wrong".to_string();

    let err = ctx.controller.handle_new_main(&message).await.unwrap_err();

    assert!(matches!(err, ClusterError::AuthenticationFailed(_)));
    assert_eq!(ctx.config().await.main_server_ip, MAIN_IP);
}

#[tokio::test]
async fn test_new_main_naming_this_node_is_ignored() {
    let (ctx, _peer) = secondary_context().await;
    let before = ctx.config().await;

    ctx.controller
        .handle_new_main(&NotifyMessage::new_main(&before, SECONDARY_IP))
        .await
        .unwrap();

    assert_eq!(ctx.config().await, before);
}

#[tokio::test]
async fn test_foreign_new_main_on_main_records_split_brain() {
    let config = main_config(1);
    let ctx = TestContext::new(Some(config.clone()), Vec::new(), MemoryDriver::primary());

    ctx.controller
        .handle_new_main(&NotifyMessage::new_main(&config, PEER_IP))
        .await
        .unwrap();

    // The main keeps its role; an operator has to resolve the conflict.
    let after = ctx.config().await;
    assert_eq!(after.server_role, ServerRole::Main);
    assert_eq!(after.main_server_ip, MAIN_IP);

    let events = ctx.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].event_type, EventType::SplitBrainSuspected);
    assert_eq!(events[0].severity, Severity::Critical);
}

#[tokio::test]
async fn test_new_main_during_handover_is_not_split_brain() {
    let config = main_config(1);
    let ctx = TestContext::new(Some(config.clone()), Vec::new(), MemoryDriver::primary());
    let _permit = ctx.controller.failover_state().try_begin().unwrap();

    ctx.controller
        .handle_new_main(&NotifyMessage::new_main(&config, SECONDARY_IP))
        .await
        .unwrap();

    assert!(ctx.events().await.is_empty());
    assert_eq!(ctx.config().await.server_role, ServerRole::Main);
}

// ===== Signed Messages =====

fn signed_controller(config: ClusterConfig) -> Arc<ClusterController> {
    let store: Arc<dyn ClusterStore> = Arc::new(MemoryStore::with_state(Some(config), Vec::new()));
    ClusterController::builder(store, Arc::new(MemoryDriver::replica(MAIN_IP)))
        .authenticator(PeerAuthenticator::new(true, Duration::from_secs(300)))
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_signed_notification_is_accepted_once() {
    let local = cluster_config(SECONDARY_IP, "hw-2", ServerRole::Secondary, MAIN_IP, 1);
    let controller = signed_controller(local.clone());

    let mut message = NotifyMessage::new_main(&local, PEER_IP);
    protocol::sign(&mut message).unwrap();

    controller.handle_new_main(&message).await.unwrap();
    let config = controller.store().require_config().await.unwrap();
    assert_eq!(config.main_server_ip, PEER_IP);

    // Replaying the same message is rejected.
    let err = controller.handle_new_main(&message).await.unwrap_err();
    assert!(matches!(err, ClusterError::AuthenticationFailed(_)));
}

#[tokio::test]
async fn test_unsigned_notification_is_rejected_when_signing_required() {
    let local = cluster_config(SECONDARY_IP, "hw-2", ServerRole::Secondary, MAIN_IP, 1);
    let controller = signed_controller(local.clone());

    let err = controller
        .handle_new_main(&NotifyMessage::new_main(&local, PEER_IP))
        .await
        .unwrap_err();

    assert!(matches!(err, ClusterError::AuthenticationFailed(_)));
    let config = controller.store().require_config().await.unwrap();
    assert_eq!(config.main_server_ip, MAIN_IP);
}
