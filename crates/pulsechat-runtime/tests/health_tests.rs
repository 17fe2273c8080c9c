//! Health classification and ensure-connected orchestration

mod common;

use std::time::Duration;

use common::*;
use pulsechat_runtime::{
    ConnectOutcome, ConnectionState, EventType, Health, Role, Runtime, RuntimeBuilder,
    RuntimeSettings, Session, Topic,
};
use tokio_test::assert_ok;

fn build() -> Runtime {
    let mut settings = RuntimeSettings::testing();
    settings.defaults.auto_login = false;
    RuntimeBuilder::new().with_settings(settings).build().unwrap()
}

async fn wait_health(runtime: &Runtime, account: &pulsechat_runtime::AccountId, health: Health) {
    eventually(&format!("health {health}"), || async { runtime.health(account) == health }).await;
}

#[tokio::test]
async fn test_ensure_connected_is_idempotent() {
    init_tracing();
    let server = MockServer::start().await;
    let runtime = build();
    let acc = account("acc1");
    let mut connected = runtime.bus().subscriber();
    connected.subscribe(Topic::new(acc.clone(), EventType::Connected));

    assert_eq!(runtime.health(&acc), Health::NotFound);
    assert_ok!(
        runtime
            .ensure_connected(&acc, credentials(), session(&server.url()))
            .await
    );
    assert_eq!(runtime.health(&acc), Health::Ok);

    let second = assert_ok!(
        runtime
            .ensure_connected(&acc, credentials(), session(&server.url()))
            .await
    );
    assert_eq!(second.user_id, "1000");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(connected.drain().len(), 1);
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn test_ensure_connected_keeps_stored_session() {
    init_tracing();
    let server = MockServer::start().await;
    let runtime = build();
    let acc = account("acc1");
    runtime
        .ensure_connected(&acc, credentials(), session(&server.url()))
        .await
        .unwrap();

    let stale = Session {
        user_id: "2000".into(),
        ..session(&server.url())
    };
    let current = assert_ok!(runtime.ensure_connected(&acc, credentials(), stale).await);
    assert_eq!(current.user_id, "1000");

    let stored = runtime.session_manager(&acc).unwrap().session().await.unwrap();
    assert_eq!(stored.map(|s| s.user_id), Some("1000".to_string()));
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn test_dead_transport_is_restarted() {
    init_tracing();
    let server = MockServer::start().await;
    let runtime = build();
    let acc = account("acc1");
    runtime
        .ensure_connected(&acc, credentials(), session(&server.url()))
        .await
        .unwrap();

    assert!(runtime.kill_role(&acc, Role::Transport));
    wait_health(&runtime, &acc, Health::TransportDead).await;

    assert_ok!(
        runtime
            .ensure_connected(&acc, credentials(), session(&server.url()))
            .await
    );
    assert_eq!(runtime.health(&acc), Health::Ok);
    let status = runtime.transport(&acc).unwrap().status().await.unwrap();
    assert!(status.state.is_connected());
    assert_eq!(server.connections(), 2);
}

#[tokio::test]
async fn test_dead_components_reported_in_order() {
    init_tracing();
    let runtime = build();
    let acc = account("acc1");
    runtime.start_account(acc.clone(), credentials(), None).unwrap();
    assert_eq!(runtime.health(&acc), Health::Ok);

    runtime.kill_role(&acc, Role::Transport);
    wait_health(&runtime, &acc, Health::TransportDead).await;

    runtime.kill_role(&acc, Role::SessionManager);
    wait_health(&runtime, &acc, Health::ManagerDead).await;

    runtime.kill_role(&acc, Role::CookieStore);
    wait_health(&runtime, &acc, Health::CookieStoreDead).await;
}

#[tokio::test]
async fn test_reset_is_idempotent() {
    init_tracing();
    let runtime = build();
    let acc = account("acc1");
    runtime.start_account(acc.clone(), credentials(), None).unwrap();
    assert!(runtime.start_account(acc.clone(), credentials(), None).is_err());

    runtime.reset(&acc);
    runtime.reset(&acc);
    assert_eq!(runtime.health(&acc), Health::NotFound);
    assert!(runtime.accounts().is_empty());

    runtime.start_account(acc.clone(), credentials(), None).unwrap();
    assert_eq!(runtime.health(&acc), Health::Ok);
}

#[tokio::test]
async fn test_ensure_ws_connected_reuses_live_connection() {
    init_tracing();
    let server = MockServer::start().await;
    let runtime = build();
    let acc = account("acc1");
    runtime.start_account(acc.clone(), credentials(), None).unwrap();

    let first = runtime
        .ensure_ws_connected(&acc, session(&server.url()))
        .await
        .unwrap();
    assert_eq!(first, ConnectOutcome::Connected);
    let second = runtime
        .ensure_ws_connected(&acc, session(&server.url()))
        .await
        .unwrap();
    assert_eq!(second, ConnectOutcome::AlreadyConnected);

    let transport = runtime.transport(&acc).unwrap();
    eventually("ready", || async {
        transport.status().await.unwrap().state == ConnectionState::Ready
    })
    .await;

    runtime.shutdown().await;
    assert!(runtime.accounts().is_empty());
    assert_eq!(runtime.health(&acc), Health::NotFound);
}
