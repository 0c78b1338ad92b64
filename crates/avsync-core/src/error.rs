//! 统一错误类型定义.
//!
//! 解码器协作方与同步引擎共用的错误类型. 区分可恢复的瞬时错误与
//! 导致流终止的致命错误.

use thiserror::Error;

/// avsync 统一错误类型
#[derive(Debug, Error)]
pub enum SyncError {
    /// 无效参数 (配置值越界等)
    #[error("无效参数: {0}")]
    InvalidArgument(String),

    /// 不支持的操作
    #[error("不支持的操作: {0}")]
    Unsupported(String),

    /// 单帧解码失败, 跳过该帧即可继续
    #[error("解码错误: {0}")]
    Decode(String),

    /// 底层流句柄已失效, 该流无法继续解码
    #[error("流已失效: {0}")]
    StreamInvalid(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 已到达流末尾
    #[error("已到达流末尾")]
    Eof,

    /// 既没有可用的视频流也没有可用的音频流
    #[error("没有找到可播放的音视频流")]
    NoPlayableStream,

    /// 配置文件解析失败
    #[error("配置错误: {0}")]
    Config(String),

    /// 内部错误 (不应发生)
    #[error("内部错误: {0}")]
    Internal(String),
}

impl SyncError {
    /// 是否为致命错误
    ///
    /// 致命错误使当前流转入 Stopped 状态; 其余错误只跳过当前帧.
    /// `Eof` 不属于错误路径, 由调用方单独处理.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::StreamInvalid(_) | Self::Io(_))
    }
}

/// avsync 统一 Result 类型
pub type SyncResult<T> = Result<T, SyncError>;
