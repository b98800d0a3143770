//! conda 命令行封装 - 本地环境的枚举、导出与导入

use crate::storage::truncate_to_micros;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use filetime::FileTime;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// base 环境名称（conda 的根环境）
pub const BASE_ENV_NAME: &str = "base";

/// conda 子进程超时（秒）- 环境安装可能需要解算依赖，给足余量
const CONDA_TIMEOUT_SECS: u64 = 900;

/// 同时运行的 conda 子进程上限
///
/// conda 自身不是为并发调用设计的，把进程数收在一个小池子里，
/// 上层引擎的并发只在存储 IO 上展开。
const MAX_CONDA_PROCS: usize = 2;

/// conda 调用的失败分类
#[derive(Debug, Error)]
pub enum CondaError {
    #[error("conda 进程启动失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("conda 命令超时（{0} 秒）")]
    Timeout(u64),

    #[error("conda 命令失败: {message}")]
    Failed { message: String },

    /// 安装失败且 conda 报告了具体的坏依赖，可以尝试放宽版本约束后重试
    #[error("依赖无法安装: {}", bad_deps.join(", "))]
    BadDependencies { bad_deps: Vec<String> },
}

/// 本地环境管理器接口
///
/// 引擎只通过这个接口访问本地环境，测试里用内存实现替换。
#[async_trait]
pub trait EnvManager: Send + Sync {
    /// 枚举本地环境（含 base），返回 名称 -> 前缀路径
    async fn list_envs(&self) -> Result<BTreeMap<String, PathBuf>>;

    /// 读取环境标记文件的修改时间；环境或标记缺失时返回 None
    async fn last_modified(&self, prefix: &Path) -> Result<Option<DateTime<Utc>>>;

    /// 导出环境描述
    async fn export(&self, prefix: &Path) -> Result<Vec<u8>>;

    /// 以描述内容创建或更新环境，返回环境前缀路径
    async fn import(&self, name: &str, payload: &[u8]) -> Result<PathBuf>;

    /// 把环境标记文件的修改时间设置为给定时间
    async fn set_last_modified(&self, prefix: &Path, instant: DateTime<Utc>) -> Result<()>;
}

/// `conda info --json` 输出中用到的字段
#[derive(Debug, Deserialize)]
struct CondaInfo {
    envs: Vec<PathBuf>,
    root_prefix: PathBuf,
}

pub struct CondaCli {
    conda_bin: PathBuf,
    permits: Semaphore,
}

impl CondaCli {
    pub fn new(conda_bin: impl Into<PathBuf>) -> Self {
        Self {
            conda_bin: conda_bin.into(),
            permits: Semaphore::new(MAX_CONDA_PROCS),
        }
    }

    /// 执行一条 conda 命令并等待结束，受进程池和超时约束
    async fn run(&self, args: &[String]) -> Result<std::process::Output, CondaError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| CondaError::Failed {
                message: "进程池已关闭".to_string(),
            })?;

        debug!("运行 conda: {:?} {:?}", self.conda_bin, args);

        let future = Command::new(&self.conda_bin)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        match tokio::time::timeout(Duration::from_secs(CONDA_TIMEOUT_SECS), future).await {
            Ok(output) => Ok(output?),
            Err(_) => Err(CondaError::Timeout(CONDA_TIMEOUT_SECS)),
        }
    }

    async fn info(&self) -> Result<CondaInfo> {
        let args = vec!["info".to_string(), "--json".to_string()];
        let output = self.run(&args).await?;
        if !output.status.success() {
            return Err(CondaError::Failed {
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    /// 查找指定环境的前缀路径
    async fn env_prefix(&self, name: &str) -> Result<Option<PathBuf>> {
        Ok(self.list_envs().await?.remove(name))
    }

    /// 创建或更新一个环境
    ///
    /// 已存在的环境用 `env update -p` 原地更新，否则 `env create -n` 新建。
    async fn provision(
        &self,
        name: &str,
        env_file: &Path,
        prefix: Option<&Path>,
    ) -> Result<(), CondaError> {
        let mut args = vec![
            "env".to_string(),
            if prefix.is_some() { "update" } else { "create" }.to_string(),
            "--json".to_string(),
            "-f".to_string(),
            env_file.to_string_lossy().into_owned(),
        ];
        match prefix {
            Some(p) => {
                args.push("-p".to_string());
                args.push(p.to_string_lossy().into_owned());
            }
            None => {
                args.push("-n".to_string());
                args.push(name.to_string());
            }
        }

        let output = self.run(&args).await?;
        if output.status.success() {
            return Ok(());
        }

        // conda 在 --json 模式下把错误详情写到 stdout
        if let Ok(data) = serde_json::from_slice::<serde_json::Value>(&output.stdout) {
            let bad_deps = extract_bad_deps(&data);
            if !bad_deps.is_empty() {
                return Err(CondaError::BadDependencies { bad_deps });
            }
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let detail = if stderr.trim().is_empty() {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        } else {
            stderr.trim().to_string()
        };
        Err(CondaError::Failed { message: detail })
    }

    /// 安装失败报告坏依赖时，放宽对应的版本约束后重试。
    /// 同一个依赖第二次失败就放弃，避免死循环。
    async fn provision_with_retry(
        &self,
        name: &str,
        env_file: &Path,
        prefix: Option<&Path>,
    ) -> Result<()> {
        let mut relaxed: HashSet<String> = HashSet::new();

        loop {
            match self.provision(name, env_file, prefix).await {
                Ok(()) => return Ok(()),
                Err(CondaError::BadDependencies { bad_deps }) => {
                    warn!("环境 {} 安装失败，尝试放宽坏依赖的版本约束: {:?}", name, bad_deps);

                    let content = tokio::fs::read_to_string(env_file).await?;
                    let mut doc: serde_yaml::Value = serde_yaml::from_str(&content)?;

                    for dep in &bad_deps {
                        let dep_name = dep.split('=').next().unwrap_or(dep.as_str()).to_string();
                        if !relaxed.insert(dep_name.clone()) {
                            return Err(CondaError::BadDependencies {
                                bad_deps: bad_deps.clone(),
                            }
                            .into());
                        }
                        doc = relax_dependency(doc, &dep_name);
                    }

                    tokio::fs::write(env_file, serde_yaml::to_string(&doc)?).await?;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn marker_path(prefix: &Path) -> PathBuf {
        prefix.join("conda-meta").join("history")
    }
}

#[async_trait]
impl EnvManager for CondaCli {
    async fn list_envs(&self) -> Result<BTreeMap<String, PathBuf>> {
        let info = self.info().await?;
        let mut envs = BTreeMap::new();

        for path in info.envs {
            if path == info.root_prefix {
                continue;
            }
            let Some(name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
                continue;
            };
            debug!("发现本地环境 {} 于 {}", name, path.display());
            envs.insert(name, path);
        }

        envs.insert(BASE_ENV_NAME.to_string(), info.root_prefix);
        Ok(envs)
    }

    async fn last_modified(&self, prefix: &Path) -> Result<Option<DateTime<Utc>>> {
        let marker = Self::marker_path(prefix);
        match tokio::fs::metadata(&marker).await {
            Ok(meta) => {
                let mtime: DateTime<Utc> = meta.modified()?.into();
                Ok(Some(truncate_to_micros(mtime)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn export(&self, prefix: &Path) -> Result<Vec<u8>> {
        let args = vec![
            "env".to_string(),
            "export".to_string(),
            "-p".to_string(),
            prefix.to_string_lossy().into_owned(),
        ];
        let output = self.run(&args).await?;
        if !output.status.success() {
            return Err(CondaError::Failed {
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(output.stdout)
    }

    async fn import(&self, name: &str, payload: &[u8]) -> Result<PathBuf> {
        let staging = tempfile::tempdir()?;
        let env_file = staging.path().join(format!("{name}.yml"));
        tokio::fs::write(&env_file, payload).await?;

        let existing = self.env_prefix(name).await?;
        self.provision_with_retry(name, &env_file, existing.as_deref())
            .await?;

        // 新建的环境要重新查询一次才能拿到前缀
        match existing {
            Some(prefix) => Ok(prefix),
            None => self
                .env_prefix(name)
                .await?
                .ok_or_else(|| anyhow!("环境 {} 导入后仍未出现在 conda 清单中", name)),
        }
    }

    async fn set_last_modified(&self, prefix: &Path, instant: DateTime<Utc>) -> Result<()> {
        let marker = Self::marker_path(prefix);
        let mtime = FileTime::from_unix_time(instant.timestamp(), instant.timestamp_subsec_nanos());
        tokio::task::spawn_blocking(move || filetime::set_file_mtime(&marker, mtime)).await??;
        Ok(())
    }
}

/// 从 conda 的 JSON 错误输出里提取坏依赖列表
///
/// 不同版本的 conda 把 bad_deps 报成字符串列表或嵌套列表，两种都接受。
fn extract_bad_deps(data: &serde_json::Value) -> Vec<String> {
    let Some(items) = data.get("bad_deps").and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    let mut deps = Vec::new();
    for item in items {
        match item {
            serde_json::Value::String(s) => deps.push(s.clone()),
            serde_json::Value::Array(inner) => {
                deps.extend(inner.iter().filter_map(|v| v.as_str().map(String::from)));
            }
            _ => {}
        }
    }
    deps
}

/// 把描述文件里对某个依赖的版本约束替换成裸依赖名
fn relax_dependency(value: serde_yaml::Value, dep_name: &str) -> serde_yaml::Value {
    match value {
        serde_yaml::Value::Mapping(map) => serde_yaml::Value::Mapping(
            map.into_iter()
                .map(|(k, v)| (k, relax_dependency(v, dep_name)))
                .collect(),
        ),
        serde_yaml::Value::Sequence(seq) => serde_yaml::Value::Sequence(
            seq.into_iter()
                .map(|v| relax_dependency(v, dep_name))
                .collect(),
        ),
        serde_yaml::Value::String(s) if s.starts_with(&format!("{dep_name}=")) => {
            serde_yaml::Value::String(dep_name.to_string())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relax_dependency_strips_version_pin() {
        let doc: serde_yaml::Value = serde_yaml::from_str(
            "name: demo\ndependencies:\n  - numpy=1.26.4\n  - pandas=2.2\n  - pip:\n      - requests==2.31\n",
        )
        .expect("yaml");

        let relaxed = relax_dependency(doc, "numpy");
        let text = serde_yaml::to_string(&relaxed).expect("to yaml");
        assert!(text.contains("- numpy\n"));
        assert!(text.contains("pandas=2.2"));
    }

    #[test]
    fn relax_dependency_keeps_unrelated_names() {
        let doc: serde_yaml::Value =
            serde_yaml::from_str("dependencies:\n  - numpy-base=1.0\n").expect("yaml");
        let relaxed = relax_dependency(doc, "numpy");
        let text = serde_yaml::to_string(&relaxed).expect("to yaml");
        assert!(text.contains("numpy-base=1.0"));
    }

    #[test]
    fn extract_bad_deps_accepts_flat_and_nested() {
        let flat: serde_json::Value =
            serde_json::json!({ "bad_deps": ["numpy=1.2", "scipy=0.9"] });
        assert_eq!(extract_bad_deps(&flat), vec!["numpy=1.2", "scipy=0.9"]);

        let nested: serde_json::Value = serde_json::json!({ "bad_deps": [["numpy=1.2"]] });
        assert_eq!(extract_bad_deps(&nested), vec!["numpy=1.2"]);

        let missing: serde_json::Value = serde_json::json!({ "error": "boom" });
        assert!(extract_bad_deps(&missing).is_empty());
    }

    #[tokio::test]
    async fn marker_mtime_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let prefix = dir.path().join("demo");
        std::fs::create_dir_all(prefix.join("conda-meta")).expect("mkdir");
        std::fs::write(CondaCli::marker_path(&prefix), "==> history <==\n").expect("write");

        let cli = CondaCli::new("conda");
        let instant = DateTime::from_timestamp(1_700_000_000, 123_456_000).expect("ts");

        cli.set_last_modified(&prefix, instant).await.expect("set");
        let read = cli.last_modified(&prefix).await.expect("get");
        assert_eq!(read, Some(instant));
    }

    #[tokio::test]
    async fn missing_marker_is_absent_not_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cli = CondaCli::new("conda");
        let read = cli
            .last_modified(&dir.path().join("nope"))
            .await
            .expect("get");
        assert_eq!(read, None);
    }
}
