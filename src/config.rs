//! 配置入口 - 命令行参数与 S3 位置解析

use anyhow::{ensure, Result};
use clap::Parser;
use std::path::PathBuf;

/// 在本地 conda 与 S3 之间双向同步环境定义
#[derive(Parser, Debug)]
#[command(name = "conda-s3-sync", version, about)]
pub struct Args {
    /// 同步目标的 S3 位置，格式 BUCKET[/PATH]
    #[arg(value_name = "BUCKET[/PATH]")]
    pub s3_location: String,

    /// 仅同步名称匹配该正则的环境（两侧同样生效）
    #[arg(long, value_name = "REGEX", env = "CONDA_S3_SYNC_FILTER")]
    pub path_filter: Option<String>,

    /// conda 可执行文件路径
    #[arg(long, value_name = "PATH", default_value = "conda", env = "CONDA_S3_SYNC_CONDA_BIN")]
    pub conda_bin: PathBuf,

    /// 把 base 环境也纳入同步
    #[arg(long)]
    pub include_base_env: bool,

    /// S3 区域
    #[arg(long, env = "AWS_REGION")]
    pub region: Option<String>,

    /// 自定义 S3 端点（MinIO 等兼容服务）
    #[arg(long, env = "CONDA_S3_SYNC_ENDPOINT")]
    pub endpoint: Option<String>,

    /// 并发处理的环境数
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// 只输出同步计划，不执行任何传输
    #[arg(long)]
    pub dry_run: bool,

    /// 以 JSON 形式输出运行报告
    #[arg(long)]
    pub json: bool,

    /// 日志级别: error/warn/info/debug/trace
    #[arg(long, default_value = "info", env = "CONDA_S3_SYNC_LOG")]
    pub log_level: String,

    /// 追加写入的日志文件
    #[arg(long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,
}

/// 解析后的 S3 位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Location {
    pub bucket: String,
    pub path: Option<String>,
}

/// 解析 BUCKET[/PATH] 形式的位置，可带 s3:// 前缀
pub fn parse_s3_location(location: &str) -> Result<S3Location> {
    let stripped = location.strip_prefix("s3://").unwrap_or(location);
    let trimmed = stripped.trim_end_matches('/');

    let (bucket, path) = match trimmed.split_once('/') {
        Some((bucket, path)) => (bucket, Some(path.to_string()).filter(|p| !p.is_empty())),
        None => (trimmed, None),
    };

    ensure!(!bucket.is_empty(), "S3 位置缺少 bucket: {location:?}");

    Ok(S3Location {
        bucket: bucket.to_string(),
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bucket_only() {
        let loc = parse_s3_location("my-bucket").expect("parse");
        assert_eq!(loc.bucket, "my-bucket");
        assert_eq!(loc.path, None);
    }

    #[test]
    fn parses_bucket_with_path_and_scheme() {
        let loc = parse_s3_location("s3://my-bucket/team/envs/").expect("parse");
        assert_eq!(loc.bucket, "my-bucket");
        assert_eq!(loc.path, Some("team/envs".to_string()));
    }

    #[test]
    fn trailing_slash_only_means_no_path() {
        let loc = parse_s3_location("my-bucket/").expect("parse");
        assert_eq!(loc.path, None);
    }

    #[test]
    fn empty_bucket_is_rejected() {
        assert!(parse_s3_location("").is_err());
        assert!(parse_s3_location("s3:///path").is_err());
    }
}
