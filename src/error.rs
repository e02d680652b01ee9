//! 错误类型

use std::path::PathBuf;
use thiserror::Error;

/// 热重载链路上的领域错误
#[derive(Debug, Error)]
pub enum HotpushError {
    /// 带路径上下文的 IO 错误
    #[error("IO 错误 ({path}): {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("压缩包错误: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("清单解析失败: {0}")]
    Manifest(#[from] serde_json::Error),

    /// 压缩包缺少 `_delta_metadata.json`
    #[error("压缩包缺少清单文件")]
    MissingManifest,

    /// 压缩包成员路径越出项目根目录
    #[error("非法的压缩包成员路径: {0}")]
    UnsafeEntry(String),

    #[error("连接设备失败 ({addr}): {reason}")]
    Connect { addr: String, reason: String },

    #[error("传输中断 ({addr}): {source}")]
    Transport {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// 数据已发送但设备没有确认
    #[error("设备 {0} 未确认更新")]
    NoAck(String),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("后台任务异常退出: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl HotpushError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        HotpushError::Io {
            path: path.into(),
            source,
        }
    }

    /// 传输层错误（连接、中断、未确认）都可以在下一次变更时重试
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            HotpushError::Connect { .. } | HotpushError::Transport { .. } | HotpushError::NoAck(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, HotpushError>;
