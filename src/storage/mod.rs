pub mod s3;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};

pub use s3::S3Store;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- list, stat 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- get, put 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 对象自定义元数据中记录环境修改时间的字段名。
/// 对象存储本身的写入时间反映的是传输完成时间而不是环境的修改时间，
/// 所以修改时间必须作为数据显式存储。
pub const LAST_MODIFIED_META_KEY: &str = "env-last-modified";

/// 对象存储抽象接口
///
/// 每个环境对应一个对象，对象内容是环境描述文件，
/// 修改时间记录在自定义元数据中。
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// 列出配置前缀下的所有对象键
    async fn list_keys(&self) -> Result<Vec<String>>;

    /// 读取对象元数据中的修改时间；对象或字段缺失时返回 None
    async fn last_modified(&self, key: &str) -> Result<Option<DateTime<Utc>>>;

    /// 读取对象内容与修改时间
    async fn get(&self, key: &str) -> Result<(Vec<u8>, Option<DateTime<Utc>>)>;

    /// 写入对象内容，并把修改时间记入自定义元数据。
    /// 源侧没有修改时间就不写该字段，远端同样读出"缺失"；
    /// 这里绝不能用写入时刻顶替，否则远端会凭空显得比本地新。
    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        last_modified: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 把修改时间序列化为元数据字段值（RFC 3339，微秒精度）
pub fn format_instant(instant: &DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// 解析元数据字段中的修改时间，无法解析时返回 None
pub fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// 把时间截断到微秒
///
/// 本地 mtime 带纳秒精度，而元数据字段只保留微秒，
/// 统一截断后 mtime -> 元数据 -> mtime 的往返比较才会相等。
pub fn truncate_to_micros(instant: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp(
        instant.timestamp(),
        instant.timestamp_subsec_micros() * 1_000,
    )
    .unwrap_or(instant)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_roundtrip_is_lossless_at_micros() {
        let t = truncate_to_micros(Utc::now());
        let parsed = parse_instant(&format_instant(&t)).expect("parse");
        assert_eq!(parsed, t);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(parse_instant("not-a-timestamp").is_none());
        assert!(parse_instant("").is_none());
    }

    #[test]
    fn truncation_drops_nanos_only() {
        let t = DateTime::from_timestamp(1_700_000_000, 123_456_789).expect("ts");
        let truncated = truncate_to_micros(t);
        assert_eq!(truncated.timestamp(), 1_700_000_000);
        assert_eq!(truncated.timestamp_subsec_nanos(), 123_456_000);
    }
}
