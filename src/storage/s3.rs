use super::{
    format_instant, parse_instant, ObjectStore, IO_TIMEOUT_SECS, LAST_MODIFIED_META_KEY,
    OP_TIMEOUT_SECS,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use opendal::{layers::TimeoutLayer, Operator};
use std::collections::HashMap;
use std::time::Duration;

pub struct S3Store {
    operator: Operator,
    name: String,
}

impl S3Store {
    /// 创建 S3 存储实例
    ///
    /// 凭证走 opendal 的默认解析链（环境变量 / profile / IMDS 角色），
    /// 这里只配置 bucket、区域和可选端点。
    pub fn new(
        bucket: &str,
        region: Option<String>,
        endpoint: Option<String>,
        prefix: Option<String>,
    ) -> Result<Self> {
        use opendal::services::S3;

        let mut builder = S3::default().bucket(bucket);

        if let Some(ref r) = region {
            builder = builder.region(r);
        }

        if let Some(ref ep) = endpoint {
            builder = builder.endpoint(ep);
        }

        if let Some(ref p) = prefix {
            builder = builder.root(p);
        }

        // 添加超时层
        let operator = Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        let name = format!(
            "s3://{}{}",
            bucket,
            prefix
                .as_deref()
                .map(|p| format!("/{}", p.trim_matches('/')))
                .unwrap_or_default()
        );

        Ok(Self { operator, name })
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();

        let mut lister = self.operator.lister_with("").recursive(true).await?;

        while let Some(entry) = lister.try_next().await? {
            let path = entry.path().to_string();

            // 跳过根和目录占位对象
            if path.is_empty() || path.ends_with('/') {
                continue;
            }

            keys.push(path.trim_start_matches('/').to_string());
        }

        Ok(keys)
    }

    async fn last_modified(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        match self.operator.stat(key).await {
            Ok(meta) => Ok(meta
                .user_metadata()
                .and_then(|m| m.get(LAST_MODIFIED_META_KEY))
                .and_then(|v| parse_instant(v))),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, key: &str) -> Result<(Vec<u8>, Option<DateTime<Utc>>)> {
        let data = self.operator.read(key).await?;
        let last_modified = self.last_modified(key).await?;
        Ok((data.to_vec(), last_modified))
    }

    async fn put(
        &self,
        key: &str,
        data: Vec<u8>,
        last_modified: Option<DateTime<Utc>>,
    ) -> Result<()> {
        // 内容和元数据在同一个请求里写入，不存在两者之间的不一致窗口
        let mut write = self.operator.write_with(key, data);

        if let Some(instant) = last_modified {
            let metadata = HashMap::from([(
                LAST_MODIFIED_META_KEY.to_string(),
                format_instant(&instant),
            )]);
            write = write.user_metadata(metadata);
        }

        write.await?;
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
