//! 在本地 conda 安装与 S3 对象存储之间双向同步环境定义。
//!
//! 每个环境独立对账：比较两侧记录的修改时间，较新的一侧覆盖另一侧
//! （最近者胜）。对象存储没有可写的原生修改时间，所以远端的修改时间
//! 作为自定义元数据显式存储；本地则以环境目录里 conda-meta/history
//! 的 mtime 为准。传输成功后目的侧记录的时间等于源侧的时间而不是
//! "现在"，因此没有外部变化时重复运行不会产生任何传输。

pub mod conda;
pub mod config;
pub mod core;
pub mod logging;
pub mod storage;

pub use conda::{CondaCli, CondaError, EnvManager, BASE_ENV_NAME};
pub use core::{InventoryFilter, SyncAction, SyncConfig, SyncEngine, SyncReport};
pub use storage::{ObjectStore, S3Store};
