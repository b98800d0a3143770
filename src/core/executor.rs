//! 传输执行 - 单个环境的推送与拉取，带重试

use super::inventory::{key_for_env_name, LocalEnv, RemoteEnv};
use crate::conda::EnvManager;
use crate::storage::ObjectStore;
use anyhow::{anyhow, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// 重试配置
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// 最大重试次数
    pub max_retries: u32,
    /// 重试基础延迟（毫秒），按尝试次数指数退避
    pub retry_base_delay_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 1000,
        }
    }
}

/// 传输执行器
///
/// 每个动作独立执行、独立失败；这里不做任何回滚，
/// 半途失败留下的不一致由下一次运行的计划自愈。
pub struct TransferExecutor {
    manager: Arc<dyn EnvManager>,
    store: Arc<dyn ObjectStore>,
    config: ExecutorConfig,
}

impl TransferExecutor {
    pub fn new(
        manager: Arc<dyn EnvManager>,
        store: Arc<dyn ObjectStore>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            manager,
            store,
            config,
        }
    }

    /// 推送：导出本地环境并上传
    ///
    /// 上传时记录的修改时间是清单枚举时捕获的值，而不是导出或上传
    /// 完成的时刻，导出期间发生的本地修改不会被悄悄吞掉。
    /// 本地没有标记时远端也不记录时间：缺失在两侧都读作"未知"，
    /// 下次运行按未知视为已同步处理，不会触发反向的误拉取。
    pub async fn push(&self, env: &LocalEnv) -> Result<()> {
        if env.last_modified.is_none() {
            warn!("环境 {} 没有本地修改时间标记，远端不记录修改时间", env.name);
        }
        let key = key_for_env_name(&env.name);

        self.with_retry(&env.name, "推送", || async {
            let payload = self.manager.export(&env.prefix).await?;
            self.store.put(&key, payload, env.last_modified).await?;
            Ok(())
        })
        .await?;

        info!("已推送环境 {} 至 {}", env.name, self.store.name());
        Ok(())
    }

    /// 拉取：下载环境描述并导入
    pub async fn pull(&self, env: &RemoteEnv) -> Result<()> {
        self.with_retry(&env.name, "拉取", || async {
            let (payload, instant) = self.store.get(&env.key).await?;
            let prefix = self.manager.import(&env.name, &payload).await?;

            // 显式把标记时间写回成源头的修改时间。依赖 conda 自己的写入
            // 时间会让本地永远显得比远端旧，从而反复触发无谓的拉取。
            if let Some(instant) = instant.or(env.last_modified) {
                self.manager.set_last_modified(&prefix, instant).await?;
            }
            Ok(())
        })
        .await?;

        info!("已从 {} 拉取环境 {}", self.store.name(), env.name);
        Ok(())
    }

    /// 带指数退避的重试
    async fn with_retry<F, Fut>(&self, name: &str, what: &str, op: F) -> Result<()>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut last_error = None;

        for attempt in 0..=self.config.max_retries {
            match op().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if attempt < self.config.max_retries {
                        let delay = self.config.retry_base_delay_ms * 2u64.pow(attempt);
                        warn!(
                            "{}环境 {} 失败，{}ms 后重试 ({}/{}): {:#}",
                            what,
                            name,
                            delay,
                            attempt + 1,
                            self.config.max_retries,
                            e
                        );
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("{}环境 {} 失败", what, name)))
    }
}
