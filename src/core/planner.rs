//! 计划计算 - 把两侧清单归并成逐环境的同步动作

use super::inventory::{LocalEnv, RemoteEnv};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// 同步动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    /// 本地较新（或仅本地存在）：导出并上传
    Push,
    /// 远端较新（或仅远端存在）：下载并导入
    Pull,
    /// 无事可做
    Skip,
}

/// 计划条目
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    pub name: String,
    pub action: SyncAction,
}

/// 动作统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanSummary {
    pub push: usize,
    pub pull: usize,
    pub skip: usize,
}

/// 计算同步计划
///
/// 名称按字典序处理，相同输入总是产出相同的有序计划。
/// 最近者胜：时间严格更新的一侧覆盖另一侧；时间相等不做任何传输，
/// 这正是重复运行幂等的根据。两侧都存在但有一侧时间缺失时同样跳过：
/// 缺失代表"未知，视为已同步"，而不是"无限旧"，否则会产生无谓的传输。
pub fn plan(
    local: &BTreeMap<String, LocalEnv>,
    remote: &BTreeMap<String, RemoteEnv>,
) -> Vec<PlanEntry> {
    let names: BTreeSet<&String> = local.keys().chain(remote.keys()).collect();

    let mut entries = Vec::with_capacity(names.len());
    for name in names {
        let action = match (local.get(name), remote.get(name)) {
            // 仅本地存在
            (Some(_), None) => SyncAction::Push,
            // 仅远端存在
            (None, Some(_)) => SyncAction::Pull,
            // 两侧都存在，比较修改时间
            (Some(l), Some(r)) => match (l.last_modified, r.last_modified) {
                (Some(lt), Some(rt)) if lt > rt => SyncAction::Push,
                (Some(lt), Some(rt)) if lt < rt => SyncAction::Pull,
                _ => SyncAction::Skip,
            },
            (None, None) => continue,
        };

        entries.push(PlanEntry {
            name: name.clone(),
            action,
        });
    }

    entries
}

/// 统计计划中各类动作的数量
pub fn summarize(entries: &[PlanEntry]) -> PlanSummary {
    let mut summary = PlanSummary::default();
    for entry in entries {
        match entry.action {
            SyncAction::Push => summary.push += 1,
            SyncAction::Pull => summary.pull += 1,
            SyncAction::Skip => summary.skip += 1,
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use std::path::PathBuf;

    fn instant(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).expect("timestamp")
    }

    fn local(name: &str, t: Option<i64>) -> (String, LocalEnv) {
        (
            name.to_string(),
            LocalEnv {
                name: name.to_string(),
                prefix: PathBuf::from(format!("/envs/{name}")),
                last_modified: t.map(instant),
            },
        )
    }

    fn remote(name: &str, t: Option<i64>) -> (String, RemoteEnv) {
        (
            name.to_string(),
            RemoteEnv {
                name: name.to_string(),
                key: format!("{name}.yml"),
                last_modified: t.map(instant),
            },
        )
    }

    #[test]
    fn newer_side_wins() {
        let l = BTreeMap::from([local("a", Some(100))]);
        let r = BTreeMap::from([remote("a", Some(50))]);
        assert_eq!(plan(&l, &r)[0].action, SyncAction::Push);

        let l = BTreeMap::from([local("a", Some(50))]);
        let r = BTreeMap::from([remote("a", Some(100))]);
        assert_eq!(plan(&l, &r)[0].action, SyncAction::Pull);
    }

    #[test]
    fn equal_instants_skip() {
        let l = BTreeMap::from([local("a", Some(42))]);
        let r = BTreeMap::from([remote("a", Some(42))]);
        assert_eq!(plan(&l, &r)[0].action, SyncAction::Skip);
    }

    #[test]
    fn one_sided_envs_transfer_regardless_of_instant() {
        let l = BTreeMap::from([local("only-local", None)]);
        let r = BTreeMap::from([remote("only-remote", None)]);
        let entries = plan(&l, &r);
        assert_eq!(
            entries,
            vec![
                PlanEntry {
                    name: "only-local".to_string(),
                    action: SyncAction::Push
                },
                PlanEntry {
                    name: "only-remote".to_string(),
                    action: SyncAction::Pull
                },
            ]
        );
    }

    #[test]
    fn absent_instant_on_either_side_means_skip() {
        let l = BTreeMap::from([local("a", None)]);
        let r = BTreeMap::from([remote("a", Some(100))]);
        assert_eq!(plan(&l, &r)[0].action, SyncAction::Skip);

        let l = BTreeMap::from([local("a", Some(100))]);
        let r = BTreeMap::from([remote("a", None)]);
        assert_eq!(plan(&l, &r)[0].action, SyncAction::Skip);

        let l = BTreeMap::from([local("a", None)]);
        let r = BTreeMap::from([remote("a", None)]);
        assert_eq!(plan(&l, &r)[0].action, SyncAction::Skip);
    }

    #[test]
    fn plan_is_ordered_and_deterministic() {
        let l = BTreeMap::from([
            local("analysis", Some(100)),
            local("scratch", Some(5)),
        ]);
        let r = BTreeMap::from([
            remote("analysis", Some(50)),
            remote("reporting", Some(10)),
        ]);

        let first = plan(&l, &r);
        let names: Vec<&str> = first.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["analysis", "reporting", "scratch"]);
        assert_eq!(first[0].action, SyncAction::Push);
        assert_eq!(first[1].action, SyncAction::Pull);
        assert_eq!(first[2].action, SyncAction::Push);

        // 相同输入再次计算，结果完全一致
        assert_eq!(plan(&l, &r), first);
    }

    #[test]
    fn summarize_counts_actions() {
        let l = BTreeMap::from([local("a", Some(100)), local("b", Some(1))]);
        let r = BTreeMap::from([remote("a", Some(50)), remote("b", Some(1))]);
        let summary = summarize(&plan(&l, &r));
        assert_eq!(
            summary,
            PlanSummary {
                push: 1,
                pull: 0,
                skip: 1
            }
        );
    }
}
