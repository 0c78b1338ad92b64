//! # avsync
//!
//! 纯 Rust 实现的音视频同步与缓冲引擎.
//!
//! 位于解码器与呈现层之间, 负责:
//! - **时钟**: 以单一播放时钟驱动音视频呈现, 支持暂停/恢复/seek
//! - **缓冲**: 音频环形缓冲区与视频帧池
//! - **节奏**: 解码超前时等待, 落后过多时跳过
//! - **Seek**: 停止解码线程, 清空缓冲, 重新定位后恢复
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use avsync::core::Rational;
//! use avsync::engine::{AvSyncEngine, MediaSource, SyncConfig, SyntheticStream};
//!
//! let mut engine = AvSyncEngine::new(SyncConfig::default()).unwrap();
//! let source = MediaSource::new()
//!     .with_video(SyntheticStream::video(320, 240, Rational::new(30, 1), 10.0))
//!     .with_audio(SyntheticStream::audio(48000, 2, 10.0));
//! engine.play(source).unwrap();
//! ```
//!
//! # Crate 结构
//!
//! | Crate | 功能 |
//! |-------|------|
//! | `avsync-core` | 核心类型与错误 |
//! | `avsync-engine` | 同步与缓冲引擎 |

/// 核心类型与工具
pub use avsync_core as core;

/// 同步与缓冲引擎
pub use avsync_engine as engine;
