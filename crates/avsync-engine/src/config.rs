//! 引擎配置.
//!
//! 所有字段都有默认值, 可以只在 JSON 中写需要覆盖的项.

use std::path::Path;
use std::time::Duration;

use avsync_core::{MediaType, SyncError, SyncResult};
use serde::{Deserialize, Serialize};

/// 同步引擎配置
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// 视频最多提前时钟多少秒解码
    pub video_buffer_ahead_seconds: f64,
    /// 视频落后时钟超过多少秒直接丢弃 (不解码)
    pub video_skip_threshold_seconds: f64,
    /// 音频最多提前时钟多少秒解码
    pub audio_buffer_ahead_seconds: f64,
    /// 音频落后时钟超过多少秒直接丢弃
    pub audio_skip_threshold_seconds: f64,
    /// 音频环形缓冲区时长 (秒), 容量 = 采样率 × 声道数 × 该值
    pub ring_buffer_delay_seconds: f64,
    /// 帧池容量上限
    pub frame_queue_capacity: usize,
    /// 视频相对主时钟的呈现偏移 (秒)
    pub video_offset_seconds: f64,
    /// 音频相对主时钟的呈现偏移 (秒)
    pub audio_offset_seconds: f64,
    /// 新建环形缓冲区时预留的静音引导时长 (秒)
    pub audio_lead_seconds: f64,
    /// 写入帧池时是否上下翻转 (仅打包像素格式)
    pub flip_vertical: bool,
    /// 初始音量 (0.0 ~ 1.0)
    pub volume: f32,
    /// 等待解码线程退出的上限 (毫秒)
    pub join_timeout_ms: u64,
    /// 音频回调获取环形缓冲区锁的最长等待 (微秒)
    pub audio_lock_timeout_us: u64,
    /// 帧池无空闲项时等待释放的时长 (毫秒), 0 表示直接复用最旧的待显示帧
    pub acquire_wait_ms: u64,
    /// 连续多少次未被推迟的迭代后让出一次 CPU
    pub burst_limit: u32,
    /// 流起始时间超过该值 (秒) 视为直播流, 禁止 seek
    pub live_start_threshold_seconds: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            video_buffer_ahead_seconds: 0.5,
            video_skip_threshold_seconds: 0.15,
            audio_buffer_ahead_seconds: 0.5,
            audio_skip_threshold_seconds: 0.15,
            ring_buffer_delay_seconds: 1.0,
            frame_queue_capacity: 32,
            video_offset_seconds: 0.0,
            audio_offset_seconds: 0.0,
            audio_lead_seconds: 0.0,
            flip_vertical: false,
            volume: 1.0,
            join_timeout_ms: 200,
            audio_lock_timeout_us: 500,
            acquire_wait_ms: 0,
            burst_limit: 600,
            live_start_threshold_seconds: 5.0,
        }
    }
}

impl SyncConfig {
    /// 从 JSON 字符串解析并校验
    pub fn from_json_str(text: &str) -> SyncResult<Self> {
        let config: Self = serde_json::from_str(text)
            .map_err(|e| SyncError::Config(format!("解析 JSON 失败: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// 从 JSON 文件加载并校验
    pub fn from_json_file(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
            .map_err(|e| SyncError::Config(format!("{}: {e}", path.display())))
    }

    /// 校验取值范围
    pub fn validate(&self) -> SyncResult<()> {
        let non_negative = [
            ("video_buffer_ahead_seconds", self.video_buffer_ahead_seconds),
            ("video_skip_threshold_seconds", self.video_skip_threshold_seconds),
            ("audio_buffer_ahead_seconds", self.audio_buffer_ahead_seconds),
            ("audio_skip_threshold_seconds", self.audio_skip_threshold_seconds),
            ("audio_lead_seconds", self.audio_lead_seconds),
            ("live_start_threshold_seconds", self.live_start_threshold_seconds),
        ];
        for (name, value) in non_negative {
            if !value.is_finite() || value < 0.0 {
                return Err(SyncError::InvalidArgument(format!(
                    "{name} 必须为非负数, 实际为 {value}"
                )));
            }
        }
        if !self.ring_buffer_delay_seconds.is_finite() || self.ring_buffer_delay_seconds <= 0.0 {
            return Err(SyncError::InvalidArgument(format!(
                "ring_buffer_delay_seconds 必须为正数, 实际为 {}",
                self.ring_buffer_delay_seconds
            )));
        }
        if self.audio_lead_seconds >= self.ring_buffer_delay_seconds {
            return Err(SyncError::InvalidArgument(
                "audio_lead_seconds 必须小于 ring_buffer_delay_seconds".into(),
            ));
        }
        if self.frame_queue_capacity == 0 {
            return Err(SyncError::InvalidArgument(
                "frame_queue_capacity 不能为 0".into(),
            ));
        }
        if !self.video_offset_seconds.is_finite() || !self.audio_offset_seconds.is_finite() {
            return Err(SyncError::InvalidArgument("呈现偏移必须为有限值".into()));
        }
        if !(0.0..=1.0).contains(&self.volume) {
            return Err(SyncError::InvalidArgument(format!(
                "volume 必须在 0.0 ~ 1.0 之间, 实际为 {}",
                self.volume
            )));
        }
        Ok(())
    }

    /// 指定流的呈现偏移
    pub fn offset_for(&self, kind: MediaType) -> f64 {
        match kind {
            MediaType::Video => self.video_offset_seconds,
            MediaType::Audio => self.audio_offset_seconds,
        }
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    pub fn audio_lock_timeout(&self) -> Duration {
        Duration::from_micros(self.audio_lock_timeout_us)
    }
}
