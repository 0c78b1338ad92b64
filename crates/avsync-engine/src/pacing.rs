//! 解码节奏控制.
//!
//! 在解码前根据包的时间戳与时钟的差值决定: 解码、推迟或直接丢弃.
//! 音频与视频使用各自独立的阈值.

use avsync_core::MediaType;

use crate::config::SyncConfig;

/// 节奏判断结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacingDecision {
    /// 解码并缓冲
    Accept,
    /// 超前太多, 暂缓解码
    DeferDecode,
    /// 落后太多, 不解码直接丢弃
    SkipUndecoded,
}

/// 单条流的阈值 (秒)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacingThresholds {
    /// 最多提前时钟多少秒解码
    pub time_budget: f64,
    /// 落后时钟超过多少秒丢弃
    pub skip_threshold: f64,
}

impl PacingThresholds {
    pub const fn new(time_budget: f64, skip_threshold: f64) -> Self {
        Self {
            time_budget,
            skip_threshold,
        }
    }

    /// 判断时间戳为 `pts` 的包在时钟 `t` 时应如何处理
    ///
    /// 边界值归入 Accept.
    pub fn decide(&self, t: f64, pts: f64) -> PacingDecision {
        if pts - t > self.time_budget {
            PacingDecision::DeferDecode
        } else if t - pts > self.skip_threshold {
            PacingDecision::SkipUndecoded
        } else {
            PacingDecision::Accept
        }
    }
}

/// 音视频节奏控制
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacingController {
    video: PacingThresholds,
    audio: PacingThresholds,
}

impl PacingController {
    pub const fn new(video: PacingThresholds, audio: PacingThresholds) -> Self {
        Self { video, audio }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            PacingThresholds::new(
                config.video_buffer_ahead_seconds,
                config.video_skip_threshold_seconds,
            ),
            PacingThresholds::new(
                config.audio_buffer_ahead_seconds,
                config.audio_skip_threshold_seconds,
            ),
        )
    }

    pub fn thresholds(&self, kind: MediaType) -> PacingThresholds {
        match kind {
            MediaType::Video => self.video,
            MediaType::Audio => self.audio,
        }
    }

    pub fn decide(&self, kind: MediaType, t: f64, pts: f64) -> PacingDecision {
        self.thresholds(kind).decide(t, pts)
    }
}

/// 在按发布顺序排列的时间戳中选出 `pts <= t` 的最新一帧
///
/// 返回其下标; 下标之前的帧都已过期, 由调用方释放.
pub fn select_latest_due(pts: &[f64], t: f64) -> Option<usize> {
    pts.iter().rposition(|&p| p <= t)
}
