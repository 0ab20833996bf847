//! 队列性质：项目内 FIFO、每个动作恰好一次终态、重复投递幂等、重启后恢复

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use common::{build, build_with_transport, drain_events, harness, open_storage, rename};
use flowsync_sdk::config::BreakerConfig;
use flowsync_sdk::error::FlowSyncError;
use flowsync_sdk::events::SyncEvent;
use flowsync_sdk::storage::entities::{Project, Task};
use flowsync_sdk::storage::queue::{ActionQueue, Mutation, QueuedAction, RetryPolicy};
use flowsync_sdk::sync::{MemoryTransport, RemoteTransport};
use flowsync_sdk::utils::time::now_millis;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

fn upsert(task_id: &str, order: i64) -> Mutation {
    Mutation::UpsertTask(Task::new(task_id, task_id.to_uppercase(), order, now_millis()))
}

#[tokio::test]
async fn test_fifo_per_project_and_single_terminal_state() {
    let h = harness();
    let c = &h.coordinator;
    let mut rx = h.events.subscribe();

    let mut enqueued: HashMap<String, Vec<String>> = HashMap::new();
    for (project_id, tasks) in [("p1", ["a", "b", "c", "d"]), ("p2", ["w", "x", "y", "z"])] {
        for (order, task_id) in tasks.iter().enumerate() {
            let id = assert_ok!(c.apply_mutation(project_id, upsert(task_id, order as i64), false).await);
            enqueued.entry(project_id.to_string()).or_default().push(id);
        }
    }

    // 交替注入可重试与不可重试失败
    h.transport.fail_next(FlowSyncError::Timeout("apply_action".into()));
    c.drain_once().await;
    h.transport.fail_next(FlowSyncError::remote(503, "unavailable"));
    c.drain_once().await;
    h.transport.fail_next(FlowSyncError::remote(422, "rejected"));
    for _ in 0..20 {
        if h.queue.total_pending() == 0 {
            break;
        }
        c.drain_once().await;
    }
    assert_eq!(h.queue.total_pending(), 0);

    let mut succeeded: HashMap<String, Vec<String>> = HashMap::new();
    let mut dead: Vec<String> = Vec::new();
    for event in drain_events(&mut rx) {
        match event {
            SyncEvent::ActionSucceeded { project_id, action_id, .. } => {
                succeeded.entry(project_id).or_default().push(action_id)
            }
            SyncEvent::ActionDeadLettered { action_id, .. } => dead.push(action_id),
            _ => {}
        }
    }

    assert_eq!(dead.len(), 1);
    assert_eq!(c.dead_letters().len(), 1);
    for (project_id, ids) in &enqueued {
        // 去掉死信后的顺序与入队顺序一致
        let expected: Vec<&String> = ids.iter().filter(|id| !dead.contains(id)).collect();
        let actual: Vec<&String> = succeeded
            .get(project_id)
            .map(|v| v.iter().collect())
            .unwrap_or_default();
        assert_eq!(actual, expected, "project {}", project_id);
    }
    let terminal = succeeded.values().map(|v| v.len()).sum::<usize>() + dead.len();
    assert_eq!(terminal, 8);
}

#[tokio::test]
async fn test_dead_letter_manual_retry_and_discard() {
    let h = harness();
    let c = &h.coordinator;

    c.apply_mutation("p1", rename("Roadmap", 1_000), false).await.unwrap();
    h.transport.fail_next(FlowSyncError::remote(400, "bad request"));
    c.drain_once().await;

    let dead = c.dead_letters();
    assert_eq!(dead.len(), 1);
    assert!(dead[0].dead_letter);

    let retried = assert_ok!(c.retry_dead_letter(&dead[0].id).await);
    assert_eq!(retried.attempt, 0);
    assert!(c.dead_letters().is_empty());
    assert_eq!(c.project("p1").unwrap().name, "Roadmap");
    c.drain_once().await;
    assert_eq!(h.transport.project("p1").unwrap().name, "Roadmap");

    c.apply_mutation("p1", rename("Second", 2_000), false).await.unwrap();
    h.transport.fail_next(FlowSyncError::remote(422, "nope"));
    c.drain_once().await;
    let dead = c.dead_letters();
    assert_ok!(c.discard_dead_letter(&dead[0].id).await);
    assert!(c.dead_letters().is_empty());
    assert_err!(c.discard_dead_letter(&dead[0].id).await);
}

#[tokio::test]
async fn test_duplicate_delivery_is_idempotent() {
    let transport = MemoryTransport::new();
    let action = QueuedAction::new("p1", upsert("t1", 0));

    let once = {
        let replica = MemoryTransport::new();
        replica.apply_action(&action).await.unwrap();
        replica.project("p1").unwrap()
    };

    let first = transport.apply_action(&action).await.unwrap();
    let second = transport.apply_action(&action).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(transport.project("p1").unwrap(), once);

    // 本地重复入队同一 ID：原位替换，不产生第二个动作
    let queue = ActionQueue::new(RetryPolicy::default(), None);
    let first = queue.enqueue(action.clone()).await.unwrap();
    let replay = queue.enqueue(action.clone()).await.unwrap();
    assert!(!first.replaced);
    assert!(replay.replaced);
    assert_eq!(replay.action_id, action.id);
    assert_eq!(queue.pending_count("p1"), 1);

    // 本地应用同一变更两次结果不变
    let mut project = Project::new("p1", "Roadmap", 1);
    action.payload.apply(&mut project).unwrap();
    let applied_once = project.clone();
    action.payload.apply(&mut project).unwrap();
    assert_eq!(project, applied_once);
}

#[tokio::test]
async fn test_coalescible_edits_collapse_into_tail() {
    let h = harness();
    let c = &h.coordinator;

    c.apply_mutation("p1", upsert("t1", 0), false).await.unwrap();
    let first = c
        .apply_mutation("p1", common::edit_title("t1", "D", 10), true)
        .await
        .unwrap();
    let second = c
        .apply_mutation("p1", common::edit_title("t1", "Do", 11), true)
        .await
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(h.queue.pending_count("p1"), 2);
    // 被合并动作的快照同步丢弃
    assert_eq!(c.snapshots().len(), 2);

    // 结构性操作不参与合并
    c.apply_mutation("p1", Mutation::DeleteTask { task_id: "t1".into(), deleted_at: 12 }, false)
        .await
        .unwrap();
    c.apply_mutation("p1", upsert("t1", 0), false).await.unwrap();
    assert_eq!(h.queue.pending_count("p1"), 4);
}

#[tokio::test]
async fn test_queue_survives_restart() {
    let dir = TempDir::new().unwrap();
    let transport = Arc::new(MemoryTransport::new());
    let ids = {
        let storage = open_storage(dir.path(), "u1").await;
        let h = build_with_transport(transport.clone(), BreakerConfig::default(), Some(storage.clone()));
        let a = h
            .coordinator
            .apply_mutation("p1", upsert("t1", 0), false)
            .await
            .unwrap();
        let b = h
            .coordinator
            .apply_mutation("p1", rename("Roadmap", now_millis()), false)
            .await
            .unwrap();
        assert_eq!(h.coordinator.checkpoint_now().await.unwrap(), 1);
        storage.flush().await.unwrap();
        vec![a, b]
    };

    let storage = open_storage(dir.path(), "u1").await;
    let h = build_with_transport(transport.clone(), BreakerConfig::default(), Some(storage));
    let c = &h.coordinator;
    assert_eq!(c.restore_local().await.unwrap(), 1);

    let pending: Vec<String> = h.queue.pending_actions("p1").into_iter().map(|a| a.id).collect();
    assert_eq!(pending, ids);
    assert_eq!(c.snapshots().len(), 2);
    let project = c.project("p1").unwrap();
    assert_eq!(project.name, "Roadmap");
    assert!(project.task("t1").is_some());

    while c.drain_once().await > 0 {}
    assert_eq!(h.queue.total_pending(), 0);
    assert!(c.snapshots().is_empty());
    assert_eq!(transport.project("p1").unwrap().name, "Roadmap");
}

#[tokio::test]
async fn test_stall_detected_without_consumer() {
    let h = build(BreakerConfig::default(), None);
    h.coordinator
        .apply_mutation("p1", rename("Roadmap", 1), false)
        .await
        .unwrap();

    assert_eq!(h.queue.check_stalled(std::time::Duration::ZERO), Some(1));
    // 同一次停滞只报告一次
    assert_eq!(h.queue.check_stalled(std::time::Duration::ZERO), None);

    h.queue.attach_consumer();
    assert!(!h.queue.is_stalled());
    assert_eq!(h.queue.check_stalled(std::time::Duration::ZERO), None);
}
