//! 解码器边界.
//!
//! 引擎不关心解封装与解码细节, 只通过 [`StreamSource`] 按包拉取帧.
//! 每条流由一个解码线程独占, 所以实现只需要 `Send`.

use avsync_core::{MediaType, Rational, SyncResult};

use crate::frame::DecodedFrame;

/// 流信息
#[derive(Debug, Clone)]
pub struct StreamInfo {
    /// 流索引
    pub index: usize,
    pub media_type: MediaType,
    /// 时间基
    pub time_base: Rational,
    /// 时长 (秒), 未知时为 None
    pub duration: Option<f64>,
    /// 起始时间 (秒)
    pub start_time: f64,
    /// 帧率 (视频)
    pub frame_rate: Rational,
    /// 采样率 (音频)
    pub sample_rate: u32,
    /// 声道数 (音频)
    pub channels: u16,
    /// 宽度 (视频)
    pub width: u32,
    /// 高度 (视频)
    pub height: u32,
}

impl StreamInfo {
    /// 流结束时间 (秒)
    pub fn end_time(&self) -> Option<f64> {
        self.duration.map(|d| self.start_time + d)
    }
}

/// 单条流的解码器
///
/// 调用顺序:
/// 1. `next_pts()` 查询下一个包的时间, 交给节奏控制判断
/// 2. 根据判断结果调用 `decode_next()` 或 `skip_packet()`
/// 3. 流结束时 `next_pts()`/`decode_next()` 返回 `Err(SyncError::Eof)`
pub trait StreamSource: Send {
    /// 流信息
    fn info(&self) -> &StreamInfo;

    /// 是否还有未读取的数据
    fn has_more_data(&self) -> bool;

    /// 下一个包的显示时间 (秒)
    ///
    /// `Ok(None)` 表示暂时没有可解码的包 (数据未到达), 稍后重试.
    fn next_pts(&mut self) -> SyncResult<Option<f64>>;

    /// 丢弃下一个包, 不解码
    fn skip_packet(&mut self) -> SyncResult<()>;

    /// 解码下一个包
    fn decode_next(&mut self) -> SyncResult<DecodedFrame>;

    /// 定位到不晚于 `target` 的关键帧
    fn seek(&mut self, target: f64) -> SyncResult<()>;
}

/// 一个媒体的全部可播放流
#[derive(Default)]
pub struct MediaSource {
    pub video: Option<Box<dyn StreamSource>>,
    pub audio: Option<Box<dyn StreamSource>>,
}

impl MediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_video(mut self, stream: impl StreamSource + 'static) -> Self {
        self.video = Some(Box::new(stream));
        self
    }

    pub fn with_audio(mut self, stream: impl StreamSource + 'static) -> Self {
        self.audio = Some(Box::new(stream));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.video.is_none() && self.audio.is_none()
    }

    /// 媒体时长: 优先取视频流, 没有视频时取音频流
    pub fn duration(&self) -> Option<f64> {
        self.video
            .as_ref()
            .and_then(|s| s.info().duration)
            .or_else(|| self.audio.as_ref().and_then(|s| s.info().duration))
    }

    /// 媒体起始时间: 各流起始时间的最小值
    pub fn start_time(&self) -> f64 {
        [self.video.as_ref(), self.audio.as_ref()]
            .into_iter()
            .flatten()
            .map(|s| s.info().start_time)
            .reduce(f64::min)
            .unwrap_or(0.0)
    }
}
