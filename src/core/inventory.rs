//! 清单构建 - 枚举两侧的环境并捕获各自的修改时间

use crate::conda::{EnvManager, BASE_ENV_NAME};
use crate::storage::ObjectStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::debug;

/// 本地清单条目，修改时间在枚举时捕获（导出开始之前）
#[derive(Debug, Clone)]
pub struct LocalEnv {
    pub name: String,
    pub prefix: PathBuf,
    pub last_modified: Option<DateTime<Utc>>,
}

/// 远端清单条目
#[derive(Debug, Clone)]
pub struct RemoteEnv {
    pub name: String,
    pub key: String,
    pub last_modified: Option<DateTime<Utc>>,
}

/// 两侧清单与探测失败记录
#[derive(Debug, Default)]
pub struct Inventories {
    pub local: BTreeMap<String, LocalEnv>,
    pub remote: BTreeMap<String, RemoteEnv>,
    /// 修改时间探测失败的环境：名称 -> 错误描述。
    /// 这些名称已从两侧清单中剔除，不参与计划。
    pub errored: BTreeMap<String, String>,
}

/// 名称过滤策略，必须对两侧一视同仁：
/// 在一侧被排除的环境绝不能在另一侧被当作"缺失"。
#[derive(Debug, Clone)]
pub struct InventoryFilter {
    filter: Option<Regex>,
    include_base: bool,
}

impl InventoryFilter {
    pub fn new(filter: Option<Regex>, include_base: bool) -> Self {
        Self {
            filter,
            include_base,
        }
    }

    pub fn accepts(&self, name: &str) -> bool {
        if name == BASE_ENV_NAME && !self.include_base {
            return false;
        }
        self.filter.as_ref().map_or(true, |re| re.is_match(name))
    }
}

/// 远端键 -> 环境名称。只认前缀直接子级的 .yml/.yaml 对象：
/// 嵌套键会和同名的根级对象折叠成一个名称，悄悄遮蔽彼此，所以一律忽略。
pub fn env_name_for_key(key: &str) -> Option<String> {
    if key.contains('/') {
        return None;
    }
    let (stem, ext) = key.rsplit_once('.')?;
    if stem.is_empty() || !matches!(ext, "yml" | "yaml") {
        return None;
    }
    Some(stem.to_string())
}

/// 环境名称 -> 远端键
pub fn key_for_env_name(name: &str) -> String {
    format!("{name}.yml")
}

/// 构建两侧清单
///
/// 任一侧整体枚举失败是致命错误：缺了一侧清单就无法构造安全的计划。
/// 单个环境的修改时间探测失败只降级该环境，其余照常。
pub async fn build_inventories(
    manager: &dyn EnvManager,
    store: &dyn ObjectStore,
    filter: &InventoryFilter,
) -> Result<Inventories> {
    let local_envs = manager.list_envs().await.context("枚举本地环境失败")?;
    let remote_keys = store.list_keys().await.context("枚举远端对象失败")?;

    let mut inventories = Inventories::default();

    for (name, prefix) in local_envs {
        if !filter.accepts(&name) {
            debug!("本地环境 {} 被过滤规则排除", name);
            continue;
        }
        match manager.last_modified(&prefix).await {
            Ok(last_modified) => {
                inventories.local.insert(
                    name.clone(),
                    LocalEnv {
                        name,
                        prefix,
                        last_modified,
                    },
                );
            }
            Err(e) => {
                inventories
                    .errored
                    .insert(name, format!("读取本地修改时间失败: {e:#}"));
            }
        }
    }

    for key in remote_keys {
        let Some(name) = env_name_for_key(&key) else {
            debug!("远端对象 {} 不是环境描述文件，忽略", key);
            continue;
        };
        if !filter.accepts(&name) {
            debug!("远端环境 {} 被过滤规则排除", name);
            continue;
        }
        match store.last_modified(&key).await {
            Ok(last_modified) => {
                inventories.remote.insert(
                    name.clone(),
                    RemoteEnv {
                        name,
                        key,
                        last_modified,
                    },
                );
            }
            Err(e) => {
                inventories
                    .errored
                    .insert(name, format!("读取远端修改时间失败: {e:#}"));
            }
        }
    }

    // 探测失败的名称从两侧剔除，避免被误判成单侧环境
    for name in inventories.errored.keys() {
        inventories.local.remove(name);
        inventories.remote.remove(name);
    }

    Ok(inventories)
}
