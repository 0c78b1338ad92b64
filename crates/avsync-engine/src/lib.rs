//! # avsync-engine
//!
//! 音视频同步与缓冲引擎.
//!
//! 位于解码器与呈现层之间: 按播放时钟决定每一帧何时显示/播放,
//! 提前缓冲以免呈现卡顿, 在解码与播放出现偏差时跳帧或等待,
//! 并支持暂停、恢复与 seek.
//!
//! 组件 (由底向上):
//! - [`clock::PlaybackClock`]: 唯一的流时间来源
//! - [`ring_buffer::RingBuffer`] / [`ring_buffer::AudioRing`]: 音频 PCM 缓冲
//! - [`frame_pool::FramePool`]: 视频帧缓冲池
//! - [`pacing::PacingController`]: 解码节奏判断
//! - [`scheduler::DecodeScheduler`]: 每条流一个解码线程
//! - [`seek::SeekCoordinator`]: seek 流程
//! - [`engine::AvSyncEngine`]: 对外接口

pub mod clock;
pub mod config;
pub mod engine;
pub mod events;
pub mod frame;
pub mod frame_pool;
pub mod metrics;
pub mod pacing;
pub mod ring_buffer;
pub mod scheduler;
pub mod seek;
pub mod source;
pub mod synthetic;

pub use clock::{HostTime, MonotonicTime, PlaybackClock, TimeSource};
pub use config::SyncConfig;
pub use engine::AvSyncEngine;
pub use events::{EndScope, EngineEvent, VideoSink};
pub use frame::{AudioFormat, AudioPayload, DecodedFrame, FramePayload, VideoPayload};
pub use frame_pool::{AcquirePolicy, FramePool, PresentedFrame, WritingSlot};
pub use metrics::{MetricsSnapshot, SyncMetrics};
pub use pacing::{PacingController, PacingDecision, PacingThresholds};
pub use ring_buffer::{AudioPull, AudioRing, OverrunPolicy, RingBuffer};
pub use scheduler::WorkerState;
pub use source::{MediaSource, StreamInfo, StreamSource};
pub use synthetic::SyntheticStream;
