//! SDK 门面：后台消费者、离线加载、导出与多设备在线状态

use std::sync::Arc;
use std::time::Duration;

use flowsync_sdk::config::{PresenceConfig, SyncConfig};
use flowsync_sdk::storage::queue::Mutation;
use flowsync_sdk::utils::time::now_millis;
use flowsync_sdk::{DeviceHeartbeat, FlowSyncConfig, FlowSyncSDK, MemoryTransport, SyncEvent};
use tempfile::TempDir;
use tokio::time::timeout;

fn config(dir: &TempDir, auto_drain: bool) -> FlowSyncConfig {
    FlowSyncConfig::builder()
        .data_dir(dir.path())
        .user_id("u1")
        .device_id("laptop")
        .sync(SyncConfig {
            auto_drain,
            drain_poll_interval_ms: 20,
            ..SyncConfig::default()
        })
        .presence(PresenceConfig {
            enabled: false,
            ..PresenceConfig::default()
        })
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_background_consumer_syncs_enqueued_mutation() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let sdk = FlowSyncSDK::initialize(config(&dir, true), transport.clone())
        .await
        .unwrap();
    let mut rx = sdk.subscribe_events();

    let action_id = sdk
        .enqueue_mutation(
            "p1",
            Mutation::RenameProject {
                name: "Roadmap".into(),
                updated_at: now_millis(),
            },
        )
        .await
        .ok()
        .unwrap();

    let acked = timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(SyncEvent::ActionSucceeded { action_id: id, .. }) if id == action_id => break,
                Ok(_) => continue,
                Err(e) => panic!("event stream closed: {}", e),
            }
        }
    })
    .await;
    assert!(acked.is_ok(), "action was not synced in time");
    assert_eq!(transport.project("p1").unwrap().name, "Roadmap");

    let stats = sdk.stats().await;
    assert_eq!(stats.queue.pending, 0);
    assert_eq!(stats.queue.succeeded_total, 1);
    assert_eq!(stats.pending_conflicts, 0);

    sdk.shutdown().await.unwrap();
    // 重复关闭无副作用
    sdk.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_offline_load_and_export() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    transport.set_reachable(false);
    let sdk = FlowSyncSDK::initialize(config(&dir, false), transport)
        .await
        .unwrap();

    sdk.enqueue_mutation(
        "p1",
        Mutation::RenameProject {
            name: "Offline".into(),
            updated_at: now_millis(),
        },
    )
    .await
    .ok()
    .unwrap();

    let loaded = sdk.load_projects().await.ok().unwrap();
    assert!(loaded.offline);
    assert_eq!(loaded.projects[0].name, "Offline");

    let exported = sdk.export_data().await.ok().unwrap();
    let doc: serde_json::Value = serde_json::from_str(&exported).unwrap();
    assert_eq!(doc["projects"][0]["name"], "Offline");
    assert_eq!(doc["pending_actions"].as_array().unwrap().len(), 1);
    assert_eq!(doc["sdk"]["sdk_version"], flowsync_sdk::SDK_VERSION);

    sdk.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_presence_tracks_other_devices_only() {
    let dir = TempDir::new().unwrap();
    let sdk = FlowSyncSDK::initialize(config(&dir, false), Arc::new(MemoryTransport::new()))
        .await
        .unwrap();

    assert!(!sdk.receive_heartbeat(DeviceHeartbeat::now("laptop")).await);
    assert!(sdk.receive_heartbeat(DeviceHeartbeat::now("phone")).await);
    let devices: Vec<String> = sdk
        .active_devices()
        .await
        .into_iter()
        .map(|d| d.device_id)
        .collect();
    assert_eq!(devices, vec!["phone".to_string()]);

    sdk.shutdown().await.unwrap();
}
