//! 端到端同步场景：重试成功、冲突、陈旧撤销、重连合并

mod common;

use std::sync::Arc;

use common::{build_with_transport, drain_events, edit_title, harness, open_storage, rename};
use flowsync_sdk::config::BreakerConfig;
use flowsync_sdk::error::FlowSyncError;
use flowsync_sdk::events::SyncEvent;
use flowsync_sdk::storage::entities::{ConflictStrategy, Project, Task};
use flowsync_sdk::storage::queue::Mutation;
use flowsync_sdk::sync::{MemoryTransport, PushOutcome};
use flowsync_sdk::utils::time::now_millis;
use tempfile::TempDir;

#[tokio::test]
async fn test_create_task_succeeds_after_two_timeouts() {
    let h = harness();
    let c = &h.coordinator;
    let mut rx = h.events.subscribe();

    let action_id = c
        .apply_mutation("p1", Mutation::UpsertTask(Task::new("t1", "Draft", 0, now_millis())), false)
        .await
        .unwrap();
    assert_eq!(c.snapshots().len(), 1);

    h.transport.fail_next(FlowSyncError::Timeout("apply_action".into()));
    h.transport.fail_next(FlowSyncError::Timeout("apply_action".into()));
    for _ in 0..3 {
        c.drain_once().await;
    }

    assert_eq!(h.transport.apply_calls(), 3);
    assert_eq!(h.queue.total_pending(), 0);
    assert!(c.dead_letters().is_empty());
    assert!(c.snapshots().is_empty());
    assert_eq!(h.transport.project("p1").unwrap().tasks.len(), 1);

    let events = drain_events(&mut rx);
    let retries = events
        .iter()
        .filter(|e| matches!(e, SyncEvent::ActionRetryScheduled { .. }))
        .count();
    assert_eq!(retries, 2);
    let succeeded: Vec<(String, u32)> = events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::ActionSucceeded { action_id, attempts, .. } => Some((action_id.clone(), *attempts)),
            _ => None,
        })
        .collect();
    assert_eq!(succeeded, vec![(action_id, 3)]);
}

#[tokio::test]
async fn test_remote_push_beyond_threshold_raises_conflict() {
    let h = harness();
    let c = &h.coordinator;
    let mut rx = h.events.subscribe();

    let mut synced = Project::new("p1", "Roadmap", 1_000);
    synced.version = 5;
    synced.tasks.push(Task::new("t1", "Draft", 0, 1_000));
    assert_eq!(c.handle_remote_push(synced.clone()).await.unwrap(), PushOutcome::Applied);
    assert_eq!(c.baseline("p1").unwrap().version, 5);

    c.apply_mutation("p1", edit_title("t1", "Local draft", 2_000), true)
        .await
        .unwrap();
    c.apply_mutation("p1", Mutation::UpsertTask(Task::new("t2", "Local task", 1, 2_100)), false)
        .await
        .unwrap();
    assert_eq!(h.queue.pending_count("p1"), 2);
    let local_before = c.project("p1").unwrap();

    let mut remote = synced.clone();
    remote.version = 9;
    remote.name = "Renamed elsewhere".into();
    remote.updated_at = 3_000;
    remote.tasks.push(Task::new("t3", "Remote task", 2, 3_000));
    assert_eq!(
        c.handle_remote_push(remote).await.unwrap(),
        PushOutcome::ConflictRaised
    );

    // 解决之前：本地状态不变、不发起推送
    assert_eq!(c.project("p1").unwrap(), local_before);
    assert_eq!(c.drain_once().await, 0);
    assert_eq!(h.transport.apply_calls(), 0);
    let pending = c.pending_conflicts();
    assert_eq!(pending.len(), 1);
    assert_eq!((pending[0].local_version, pending[0].remote_version), (5, 9));
    assert_eq!(pending[0].pending_actions, 2);
    assert!(drain_events(&mut rx)
        .iter()
        .any(|e| e.event_type() == "conflict_raised"));

    let merged = c.resolve_conflict("p1", ConflictStrategy::Merge).await.unwrap();
    assert_eq!(merged.name, "Renamed elsewhere");
    assert_eq!(merged.task("t1").unwrap().title, "Local draft");
    assert!(merged.task("t2").is_some());
    assert!(merged.task("t3").is_some());
    assert!(!c.has_conflict("p1"));

    let history = c.conflict_history(10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].resolution, ConflictStrategy::Merge);
    assert_eq!((history[0].local_version, history[0].remote_version), (5, 9));

    // 同一冲突只能解决一次
    assert!(c.resolve_conflict("p1", ConflictStrategy::Local).await.is_err());

    assert_eq!(c.drain_once().await, 1);
    assert_eq!(h.transport.project("p1").unwrap().tasks.len(), 3);
}

#[tokio::test]
async fn test_unresolved_conflict_blocks_sync_after_restart() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    {
        let storage = open_storage(dir.path(), "u1").await;
        let h = build_with_transport(transport.clone(), BreakerConfig::default(), Some(storage.clone()));
        let c = &h.coordinator;
        c.apply_mutation("p1", rename("Synced", 1_000), false).await.unwrap();
        assert_eq!(c.drain_once().await, 1);
        c.apply_mutation("p1", rename("Local", 2_000), false).await.unwrap();

        let mut remote = transport.project("p1").unwrap();
        remote.version = 9;
        remote.name = "Remote".into();
        assert_eq!(c.handle_remote_push(remote).await.unwrap(), PushOutcome::ConflictRaised);
        c.checkpoint_now().await.unwrap();
        storage.flush().await.unwrap();
    }

    let storage = open_storage(dir.path(), "u1").await;
    let h = build_with_transport(transport.clone(), BreakerConfig::default(), Some(storage));
    let c = &h.coordinator;
    c.restore_local().await.unwrap();

    assert!(c.has_conflict("p1"));
    assert_eq!(c.pending_conflicts()[0].remote_version, 9);
    assert_eq!(h.queue.pending_count("p1"), 1);
    // 冲突未解决前不推送本地动作
    assert_eq!(c.drain_once().await, 0);
    assert_eq!(transport.project("p1").unwrap().name, "Synced");

    let resolved = c.resolve_conflict("p1", ConflictStrategy::Remote).await.unwrap();
    assert_eq!(resolved.name, "Remote");
    assert_eq!(h.queue.total_pending(), 0);
    assert!(c.pending_conflicts().is_empty());
}

#[tokio::test]
async fn test_local_resolution_replays_pending_work() {
    let h = harness();
    let c = &h.coordinator;

    let mut synced = Project::new("p1", "Roadmap", 1_000);
    synced.version = 2;
    c.handle_remote_push(synced.clone()).await.unwrap();
    c.apply_mutation("p1", rename("Mine", 2_000), false).await.unwrap();

    let mut remote = synced;
    remote.version = 4;
    remote.name = "Theirs".into();
    assert_eq!(c.handle_remote_push(remote).await.unwrap(), PushOutcome::ConflictRaised);

    let kept = c.resolve_conflict("p1", ConflictStrategy::Local).await.unwrap();
    assert_eq!(kept.name, "Mine");
    assert!(kept.version >= 4);
    assert!(h.queue.pending_count("p1") >= 1);

    while c.drain_once().await > 0 {}
    assert_eq!(h.transport.project("p1").unwrap().name, "Mine");
}

#[tokio::test]
async fn test_undo_rejected_once_remote_advanced_too_far() {
    let h = harness();
    let c = &h.coordinator;

    c.apply_mutation("p1", rename("Before", 1_000), false).await.unwrap();
    c.drain_once().await;
    c.apply_mutation("p1", rename("After", 2_000), false).await.unwrap();
    c.drain_once().await;
    assert_eq!(c.baseline("p1").unwrap().version, 2);

    // 其他设备连续推进 6 个版本（容忍度 5）
    for version in 3..=8 {
        let mut remote = c.project("p1").unwrap();
        remote.version = version;
        remote.updated_at = 2_000 + version;
        assert_eq!(c.handle_remote_push(remote).await.unwrap(), PushOutcome::Applied);
    }

    let before = c.project("p1").unwrap();
    let err = c.undo("p1").await.unwrap_err();
    assert!(matches!(err, FlowSyncError::StaleUndo { advanced: 6, tolerance: 5 }));
    assert_eq!(c.project("p1").unwrap(), before);
    assert_eq!(h.queue.total_pending(), 0);
    assert!(c.can_undo("p1"));
}

#[tokio::test]
async fn test_undo_rejected_after_single_large_version_jump() {
    let h = harness();
    let c = &h.coordinator;

    c.apply_mutation("p1", rename("A", 1_000), false).await.unwrap();
    c.drain_once().await;
    c.apply_mutation("p1", rename("B", 2_000), false).await.unwrap();
    c.drain_once().await;
    let baseline = c.baseline("p1").unwrap().version;

    // 一次推送直接跳过 20 个版本
    let mut remote = c.project("p1").unwrap();
    remote.version = baseline + 20;
    remote.description = "Written on another device".into();
    remote.updated_at = 3_000;
    assert_eq!(c.handle_remote_push(remote).await.unwrap(), PushOutcome::Applied);

    let err = c.undo("p1").await.unwrap_err();
    assert!(matches!(err, FlowSyncError::StaleUndo { advanced: 20, tolerance: 5 }));
    let project = c.project("p1").unwrap();
    assert_eq!(project.name, "B");
    assert_eq!(project.description, "Written on another device");
    assert_eq!(h.queue.total_pending(), 0);
}

#[tokio::test]
async fn test_undo_and_redo_go_through_the_queue() {
    let h = harness();
    let c = &h.coordinator;
    let mut rx = h.events.subscribe();

    c.apply_mutation("p1", rename("Before", 1_000), false).await.unwrap();
    c.drain_once().await;
    c.apply_mutation("p1", rename("After", 2_000), false).await.unwrap();
    c.drain_once().await;

    let mut remote = c.project("p1").unwrap();
    remote.version += 1;
    c.handle_remote_push(remote).await.unwrap();

    let undone = c.undo("p1").await.unwrap();
    assert_eq!(undone.name, "Before");
    assert_eq!(h.queue.pending_count("p1"), 1);
    assert!(c.can_redo("p1"));

    let redone = c.redo("p1").await.unwrap();
    assert_eq!(redone.name, "After");

    while c.drain_once().await > 0 {}
    assert_eq!(h.transport.project("p1").unwrap().name, "After");

    let kinds: Vec<&str> = drain_events(&mut rx).iter().map(|e| e.event_type()).collect();
    assert!(kinds.contains(&"undo_applied"));
    assert!(kinds.contains(&"redo_applied"));
}

#[tokio::test]
async fn test_reconnect_merge_keeps_pending_work_and_is_idempotent() {
    let h = harness();
    let c = &h.coordinator;

    // 离线期间的本地修改
    c.apply_mutation("p1", rename("Offline name", now_millis()), false)
        .await
        .unwrap();

    let mut server_p1 = Project::new("p1", "Server name", 500);
    server_p1.version = 3;
    server_p1.tasks.push(Task::new("t9", "Added elsewhere", 0, 500));
    h.transport.put_project(server_p1);
    let mut server_p2 = Project::new("p2", "Second", 600);
    server_p2.version = 1;
    h.transport.put_project(server_p2);

    let first = c.reconnect_merge("u1").await.unwrap();
    let second = c.reconnect_merge("u1").await.unwrap();
    assert_eq!(first, second);

    assert_eq!(first.len(), 2);
    let p1 = c.project("p1").unwrap();
    assert_eq!(p1.name, "Offline name");
    assert!(p1.task("t9").is_some());
    assert_eq!(p1.version, 3);
    assert_eq!(h.queue.pending_count("p1"), 1);
    assert!(c.pending_conflicts().is_empty());

    while c.drain_once().await > 0 {}
    let remote = h.transport.project("p1").unwrap();
    assert_eq!(remote.name, "Offline name");
    assert!(remote.task("t9").is_some());
}

#[tokio::test]
async fn test_load_falls_back_to_local_when_remote_unreachable() {
    let h = harness();
    let c = &h.coordinator;
    let mut rx = h.events.subscribe();

    c.apply_mutation("p1", rename("Local only", now_millis()), false)
        .await
        .unwrap();
    h.transport.set_reachable(false);

    let result = c.load("u1").await.unwrap();
    assert!(result.offline);
    assert_eq!(result.projects.len(), 1);
    assert_eq!(result.projects[0].name, "Local only");
    assert!(drain_events(&mut rx)
        .iter()
        .any(|e| e.event_type() == "working_offline"));
}
