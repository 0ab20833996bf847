//! 项目合并
//!
//! - `merge_projects`：逐实体后写优先（按 updated_at），时间相同按实体整体排序取较大者，
//!   因此 merge(a, b) == merge(b, a)，且对自身幂等
//! - `rebase`：在远端状态上重放本地待同步变更
//! - `reconcile_project`：云端加载/重连后，单个项目的本地与远端对账

use std::collections::BTreeMap;
use tracing::debug;

use crate::storage::entities::{Project, Task, TaskConnection};
use crate::storage::queue::Mutation;

fn pick<'a, T: Ord>(a: &'a T, b: &'a T, ts: impl Fn(&T) -> i64) -> &'a T {
    match ts(a).cmp(&ts(b)) {
        std::cmp::Ordering::Greater => a,
        std::cmp::Ordering::Less => b,
        std::cmp::Ordering::Equal => a.max(b),
    }
}

fn merge_entities<T, F>(local: &[T], remote: &[T], id: F, ts: fn(&T) -> i64) -> Vec<T>
where
    T: Ord + Clone,
    F: Fn(&T) -> &str,
{
    let mut merged: BTreeMap<String, T> = BTreeMap::new();
    for entity in local.iter().chain(remote.iter()) {
        let key = id(entity).to_string();
        let winner = match merged.get(&key) {
            Some(existing) => pick(existing, entity, ts).clone(),
            None => entity.clone(),
        };
        merged.insert(key, winner);
    }
    merged.into_values().collect()
}

/// 合并两个版本的同一项目
pub fn merge_projects(local: &Project, remote: &Project) -> Project {
    let meta = |p: &Project| (p.updated_at, p.name.clone(), p.description.clone(), p.deleted);
    let winner = if meta(local) >= meta(remote) { local } else { remote };

    let mut tasks = merge_entities(&local.tasks, &remote.tasks, |t: &Task| t.id.as_str(), |t| t.updated_at);
    tasks.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
    let connections = merge_entities(
        &local.connections,
        &remote.connections,
        |c: &TaskConnection| c.id.as_str(),
        |c| c.updated_at,
    );

    Project {
        id: local.id.clone(),
        name: winner.name.clone(),
        description: winner.description.clone(),
        tasks,
        connections,
        version: local.version.max(remote.version),
        updated_at: local.updated_at.max(remote.updated_at),
        deleted: winner.deleted,
    }
}

/// 在远端状态上重放待同步变更，无法应用的变更跳过
pub fn rebase<'a>(remote: &Project, pending: impl IntoIterator<Item = &'a Mutation>) -> Project {
    let mut project = remote.clone();
    for mutation in pending {
        if let Err(e) = mutation.apply(&mut project) {
            debug!("变基时跳过无法应用的变更 [{}]: {}", mutation.kind(), e);
        }
    }
    project.advance_version(remote.version);
    project
}

/// 单个项目的对账
///
/// - 有待同步变更且远端存在：在远端上重放
/// - 有待同步变更但远端不存在：保留本地（新建尚未上传）
/// - 没有待同步变更：取版本较高者，版本相同以远端为准
/// - 只存在于本地且没有待同步变更：视为远端已删除
pub fn reconcile_project(
    local: Option<&Project>,
    remote: Option<&Project>,
    pending: Option<&[Mutation]>,
) -> Option<Project> {
    let pending = pending.filter(|p| !p.is_empty());
    match (local, remote, pending) {
        (_, Some(remote), Some(pending)) => {
            let mut rebased = rebase(remote, pending.iter());
            if let Some(local) = local {
                rebased.advance_version(local.version);
            }
            Some(rebased)
        }
        (Some(local), None, Some(_)) => Some(local.clone()),
        (Some(local), Some(remote), None) => {
            if local.version > remote.version {
                Some(local.clone())
            } else {
                Some(remote.clone())
            }
        }
        (None, Some(remote), None) => Some(remote.clone()),
        (Some(_), None, None) | (None, None, _) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::queue::TextField;

    fn base() -> Project {
        let mut project = Project::new("p1", "Roadmap", 10);
        project.tasks.push(Task::new("t1", "Draft", 0, 10));
        project.tasks.push(Task::new("t2", "Review", 1, 10));
        project.version = 3;
        project
    }

    #[test]
    fn test_merge_is_commutative_and_idempotent() {
        let mut local = base();
        local.tasks[0].title = "Draft v2".into();
        local.tasks[0].updated_at = 20;
        local.tasks.push(Task::new("t3", "Local only", 2, 20));

        let mut remote = base();
        remote.tasks[1].title = "Review (remote)".into();
        remote.tasks[1].updated_at = 25;
        remote.name = "Roadmap 2027".into();
        remote.updated_at = 25;
        remote.version = 7;

        let ab = merge_projects(&local, &remote);
        let ba = merge_projects(&remote, &local);
        assert_eq!(ab, ba);
        assert_eq!(merge_projects(&ab, &ab), ab);

        assert_eq!(ab.task("t1").unwrap().title, "Draft v2");
        assert_eq!(ab.task("t2").unwrap().title, "Review (remote)");
        assert!(ab.task("t3").is_some());
        assert_eq!(ab.name, "Roadmap 2027");
        assert_eq!(ab.version, 7);
    }

    #[test]
    fn test_merge_tie_is_deterministic() {
        let mut local = base();
        local.tasks[0].title = "A".into();
        let mut remote = base();
        remote.tasks[0].title = "B".into();

        let ab = merge_projects(&local, &remote);
        let ba = merge_projects(&remote, &local);
        assert_eq!(ab.task("t1").unwrap().title, ba.task("t1").unwrap().title);
    }

    #[test]
    fn test_deletion_propagates() {
        let local = base();
        let mut remote = base();
        remote.tasks[0].deleted = true;
        remote.tasks[0].updated_at = 30;

        let merged = merge_projects(&local, &remote);
        assert!(merged.task("t1").unwrap().deleted);
        assert_eq!(merged.live_tasks().len(), 1);
    }

    #[test]
    fn test_rebase_replays_pending() {
        let mut remote = base();
        remote.version = 9;
        let pending = vec![
            Mutation::EditTaskText {
                task_id: "t1".into(),
                field: TextField::Title,
                text: "Edited offline".into(),
                updated_at: 40,
            },
            Mutation::DeleteTask { task_id: "missing".into(), deleted_at: 41 },
        ];
        let rebased = rebase(&remote, pending.iter());
        assert_eq!(rebased.task("t1").unwrap().title, "Edited offline");
        assert_eq!(rebased.version, 9);
    }
}
