//! Secondary failures: inline replication reports them, the async backlog rides them out

mod common;

use common::{dead_addr, eventually, local, FakeEngine, RunningNode};
use kvrelay::common::{LogSyncPolicy, NodeSettings, ReplicationMode};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

const ERR_REPLICATION_FAILED: &str =
    "ERROR: Write succeeded locally but failed to replicate to secondary.";

fn async_primary(engine: &FakeEngine, secondary: String, dir: &TempDir) -> NodeSettings {
    let mut settings = NodeSettings::primary(local(), secondary);
    settings.engine.socket_path = engine.path.clone();
    settings.replication.mode = ReplicationMode::Async;
    settings.replication.log_path = dir.path().join("backlog").join("replication.log");
    settings.replication.sync_policy = LogSyncPolicy::Never;
    settings.replication.connect_timeout_ms = 200;
    settings.replication.confirm_timeout_ms = 200;
    settings.replication.initial_backoff_ms = 20;
    settings.replication.max_backoff_ms = 100;
    settings
}

fn secondary_settings(engine: &FakeEngine, addr: std::net::SocketAddr) -> NodeSettings {
    let mut settings = NodeSettings::secondary(addr, vec!["127.0.0.1".parse().unwrap()]);
    settings.engine.socket_path = engine.path.clone();
    settings
}

#[tokio::test]
async fn test_secondary_never_confirms() {
    let dir = TempDir::new().unwrap();
    let engine = FakeEngine::spawn(dir.path(), "primary");

    // accepts connections but never answers
    let silent = TcpListener::bind(local()).await.unwrap();
    let silent_addr = silent.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            held.push(stream);
        }
    });

    let mut settings = NodeSettings::primary(local(), silent_addr.to_string());
    settings.engine.socket_path = engine.path.clone();
    settings.replication.confirm_timeout_ms = 200;
    let primary = RunningNode::start(settings).await;

    let mut client = primary.client().await;
    assert_eq!(client.send("PUT a 1").await.unwrap(), ERR_REPLICATION_FAILED);
    assert_eq!(engine.get("a").as_deref(), Some("1"));
}

#[tokio::test]
async fn test_async_mode_catches_up_when_secondary_returns() {
    let dir = TempDir::new().unwrap();
    let primary_engine = FakeEngine::spawn(dir.path(), "primary");
    let secondary_engine = FakeEngine::spawn(dir.path(), "secondary");
    let secondary_addr = dead_addr().await;

    let primary = RunningNode::start(async_primary(
        &primary_engine,
        secondary_addr.to_string(),
        &dir,
    ))
    .await;

    let mut client = primary.client().await;
    for i in 0..3 {
        // the secondary is down, yet the client sees the engine's answer
        assert_eq!(client.send(&format!("PUT k{} {}", i, i)).await.unwrap(), "OK");
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(secondary_engine.calls(), 0);

    let _secondary = RunningNode::start(secondary_settings(&secondary_engine, secondary_addr)).await;

    assert!(eventually(|| secondary_engine.calls() == 3).await);
    for i in 0..3 {
        assert_eq!(secondary_engine.get(&format!("k{}", i)), Some(i.to_string()));
    }
}

#[tokio::test]
async fn test_async_backlog_survives_restart() {
    let dir = TempDir::new().unwrap();
    let primary_engine = FakeEngine::spawn(dir.path(), "primary");
    let secondary_engine = FakeEngine::spawn(dir.path(), "secondary");
    let secondary_addr = dead_addr().await;

    let primary = RunningNode::start(async_primary(
        &primary_engine,
        secondary_addr.to_string(),
        &dir,
    ))
    .await;
    {
        let mut client = primary.client().await;
        assert_eq!(client.send("PUT before-restart 1").await.unwrap(), "OK");
    }
    primary.stop().await;

    let _secondary = RunningNode::start(secondary_settings(&secondary_engine, secondary_addr)).await;
    let _primary = RunningNode::start(async_primary(
        &primary_engine,
        secondary_addr.to_string(),
        &dir,
    ))
    .await;

    assert!(eventually(|| secondary_engine.get("before-restart").is_some()).await);
    assert_eq!(secondary_engine.get("before-restart").as_deref(), Some("1"));
}

#[tokio::test]
async fn test_async_reads_are_not_queued() {
    let dir = TempDir::new().unwrap();
    let primary_engine = FakeEngine::spawn(dir.path(), "primary");
    let secondary_engine = FakeEngine::spawn(dir.path(), "secondary");

    let secondary_node = RunningNode::start(secondary_settings(&secondary_engine, local())).await;
    let primary = RunningNode::start(async_primary(
        &primary_engine,
        secondary_node.addr.to_string(),
        &dir,
    ))
    .await;

    let mut client = primary.client().await;
    assert_eq!(client.send("GET a").await.unwrap(), "NOT_FOUND: a");
    assert_eq!(client.send("PUT a 1").await.unwrap(), "OK");
    assert_eq!(client.send("GET a").await.unwrap(), "OK 1");

    assert!(eventually(|| secondary_engine.calls() == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(secondary_engine.calls(), 1);
}
