//! 同步引擎 - 清单、计划、并行执行与报告

use super::executor::{ExecutorConfig, TransferExecutor};
use super::inventory::{build_inventories, InventoryFilter};
use super::planner::{plan, summarize, SyncAction};
use crate::conda::EnvManager;
use crate::storage::ObjectStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{error, info};

/// 同步配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 同时处理的环境数上限
    pub max_concurrent: usize,
    /// 只计算计划，不执行传输
    pub dry_run: bool,
    /// 单个环境传输的重试配置
    pub executor: ExecutorConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            dry_run: false,
            executor: ExecutorConfig::default(),
        }
    }
}

/// 单个环境的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// 传输完成
    Done,
    /// 无事可做
    Skipped,
    /// 探测或传输失败
    Failed,
    /// 仅计划（dry-run）
    Planned,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvOutcome {
    pub name: String,
    /// 探测失败的环境没有可判定的动作
    pub action: Option<SyncAction>,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// 运行报告，条目始终按环境名排序
#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub dry_run: bool,
    pub pushed: u32,
    pub pulled: u32,
    pub skipped: u32,
    pub failed: u32,
    pub outcomes: Vec<EnvOutcome>,
}

impl SyncReport {
    pub fn success(&self) -> bool {
        self.failed == 0
    }
}

/// 同步引擎
pub struct SyncEngine {
    manager: Arc<dyn EnvManager>,
    store: Arc<dyn ObjectStore>,
    filter: InventoryFilter,
    config: SyncConfig,
}

impl SyncEngine {
    pub fn new(
        manager: Arc<dyn EnvManager>,
        store: Arc<dyn ObjectStore>,
        filter: InventoryFilter,
        config: SyncConfig,
    ) -> Self {
        Self {
            manager,
            store,
            filter,
            config,
        }
    }

    /// 执行一次完整的同步运行
    ///
    /// 清单每次运行重新计算，两次运行之间不持久化任何计划状态；
    /// 唯一的持久状态是每侧每环境的修改时间。
    pub async fn run(&self) -> Result<SyncReport> {
        let started_at = Utc::now();
        info!("开始同步: {}", self.store.name());

        let inventories =
            build_inventories(self.manager.as_ref(), self.store.as_ref(), &self.filter).await?;
        let entries = plan(&inventories.local, &inventories.remote);
        let summary = summarize(&entries);

        info!(
            "计划完成: 推送 {}, 拉取 {}, 跳过 {}, 探测失败 {}",
            summary.push,
            summary.pull,
            summary.skip,
            inventories.errored.len()
        );

        let mut outcomes: Vec<EnvOutcome> = Vec::with_capacity(entries.len());

        if self.config.dry_run {
            for entry in &entries {
                let status = match entry.action {
                    SyncAction::Skip => OutcomeStatus::Skipped,
                    _ => OutcomeStatus::Planned,
                };
                info!("[dry-run] {} -> {:?}", entry.name, entry.action);
                outcomes.push(EnvOutcome {
                    name: entry.name.clone(),
                    action: Some(entry.action),
                    status,
                    error: None,
                });
            }
        } else {
            let executor = Arc::new(TransferExecutor::new(
                self.manager.clone(),
                self.store.clone(),
                self.config.executor.clone(),
            ));
            let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
            let mut handles = Vec::new();

            for entry in &entries {
                if entry.action == SyncAction::Skip {
                    outcomes.push(EnvOutcome {
                        name: entry.name.clone(),
                        action: Some(SyncAction::Skip),
                        status: OutcomeStatus::Skipped,
                        error: None,
                    });
                    continue;
                }

                let name = entry.name.clone();
                let action = entry.action;
                let executor = executor.clone();
                let semaphore = semaphore.clone();
                let local = inventories.local.get(&name).cloned();
                let remote = inventories.remote.get(&name).cloned();

                handles.push(tokio::spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            return (name, action, Err(anyhow::anyhow!("并发信号量已关闭")));
                        }
                    };

                    let result = match (action, local, remote) {
                        (SyncAction::Push, Some(env), _) => executor.push(&env).await,
                        (SyncAction::Pull, _, Some(env)) => executor.pull(&env).await,
                        // 计划里的动作总有对应的清单条目，这个分支不可达
                        _ => Err(anyhow::anyhow!("计划与清单不一致")),
                    };

                    (name, action, result)
                }));
            }

            // 一个环境的失败只记录该环境，其余照常收集
            for handle in handles {
                let (name, action, result) = match handle.await {
                    Ok(v) => v,
                    Err(e) => {
                        error!("同步任务异常终止: {e}");
                        continue;
                    }
                };
                match result {
                    Ok(()) => outcomes.push(EnvOutcome {
                        name,
                        action: Some(action),
                        status: OutcomeStatus::Done,
                        error: None,
                    }),
                    Err(e) => {
                        error!("环境 {} 同步失败: {e:#}", name);
                        outcomes.push(EnvOutcome {
                            name,
                            action: Some(action),
                            status: OutcomeStatus::Failed,
                            error: Some(format!("{e:#}")),
                        });
                    }
                }
            }
        }

        // 探测失败的环境也计入报告
        for (name, message) in &inventories.errored {
            outcomes.push(EnvOutcome {
                name: name.clone(),
                action: None,
                status: OutcomeStatus::Failed,
                error: Some(message.clone()),
            });
        }

        // 完成顺序不定，报告按名称排序保证可复现
        outcomes.sort_by(|a, b| a.name.cmp(&b.name));

        let mut report = SyncReport {
            started_at,
            finished_at: Utc::now(),
            dry_run: self.config.dry_run,
            pushed: 0,
            pulled: 0,
            skipped: 0,
            failed: 0,
            outcomes,
        };

        for outcome in &report.outcomes {
            match (outcome.status, outcome.action) {
                (OutcomeStatus::Done, Some(SyncAction::Push)) => report.pushed += 1,
                (OutcomeStatus::Done, Some(SyncAction::Pull)) => report.pulled += 1,
                (OutcomeStatus::Skipped, _) => report.skipped += 1,
                (OutcomeStatus::Failed, _) => report.failed += 1,
                _ => {}
            }
        }

        info!(
            "同步结束: 推送 {}, 拉取 {}, 跳过 {}, 失败 {}",
            report.pushed, report.pulled, report.skipped, report.failed
        );

        Ok(report)
    }
}
