//! 合成测试流.
//!
//! 不依赖任何容器或编解码器, 按固定规律生成视频测试图案与正弦音频,
//! 供测试、基准和演示程序驱动引擎.

use std::collections::{HashMap, HashSet};
use std::f64::consts::TAU;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use avsync_core::{
    MediaType, PixelFormat, Rational, SampleFormat, SyncError, SyncResult, Timestamp,
};
use log::debug;

use crate::frame::{AudioFormat, AudioPayload, DecodedFrame, FramePayload, VideoPayload};
use crate::source::{StreamInfo, StreamSource};

/// 合成流的解码统计 (克隆共享)
#[derive(Debug, Clone, Default)]
pub struct SyntheticStats {
    decoded: Arc<AtomicU64>,
    skipped: Arc<AtomicU64>,
    seeks: Arc<AtomicU64>,
}

impl SyntheticStats {
    pub fn decoded(&self) -> u64 {
        self.decoded.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn seeks(&self) -> u64 {
        self.seeks.load(Ordering::Relaxed)
    }
}

enum Kind {
    Video {
        gop_size: u64,
        pixel_format: PixelFormat,
    },
    Audio {
        samples_per_frame: u32,
        frequency: f64,
        /// 包索引 -> 从该包开始使用的新格式
        format_changes: Vec<(u64, AudioFormat)>,
    },
}

/// 合成测试流
pub struct SyntheticStream {
    info: StreamInfo,
    kind: Kind,
    total_packets: u64,
    /// 首包的刻度 (time_base 单位)
    start_ticks: i64,
    cursor: u64,
    /// 解码失败一次的包索引
    decode_failures: HashSet<u64>,
    /// 解码到该包时流失效
    invalid_from: Option<u64>,
    /// 包索引 -> 剩余的 "数据未到达" 次数
    stalls: HashMap<u64, u32>,
    stats: SyntheticStats,
}

impl SyntheticStream {
    /// 创建视频测试流
    ///
    /// 每 `gop_size` 帧一个关键帧, 像素格式为 RGBA.
    pub fn video(width: u32, height: u32, fps: Rational, duration: f64) -> Self {
        let frame_rate = fps.reduce();
        let time_base = frame_rate.invert();
        let total_packets = (duration.max(0.0) * frame_rate.to_f64()).round() as u64;
        Self {
            info: StreamInfo {
                index: 0,
                media_type: MediaType::Video,
                time_base,
                duration: Some(duration.max(0.0)),
                start_time: 0.0,
                frame_rate,
                sample_rate: 0,
                channels: 0,
                width,
                height,
            },
            kind: Kind::Video {
                gop_size: 30,
                pixel_format: PixelFormat::Rgba,
            },
            total_packets,
            start_ticks: 0,
            cursor: 0,
            decode_failures: HashSet::new(),
            invalid_from: None,
            stalls: HashMap::new(),
            stats: SyntheticStats::default(),
        }
    }

    /// 创建正弦音频测试流 (S16 交错, 440 Hz, 每包 1024 采样)
    pub fn audio(sample_rate: u32, channels: u16, duration: f64) -> Self {
        let samples_per_frame = 1024u32;
        let total_samples = (duration.max(0.0) * f64::from(sample_rate)).round() as u64;
        let total_packets = total_samples.div_ceil(u64::from(samples_per_frame));
        let sample_rate_i32 = i32::try_from(sample_rate).unwrap_or(i32::MAX);
        Self {
            info: StreamInfo {
                index: 1,
                media_type: MediaType::Audio,
                time_base: Rational::new(1, sample_rate_i32),
                duration: Some(duration.max(0.0)),
                start_time: 0.0,
                frame_rate: Rational::UNDEFINED,
                sample_rate,
                channels,
                width: 0,
                height: 0,
            },
            kind: Kind::Audio {
                samples_per_frame,
                frequency: 440.0,
                format_changes: Vec::new(),
            },
            total_packets,
            start_ticks: 0,
            cursor: 0,
            decode_failures: HashSet::new(),
            invalid_from: None,
            stalls: HashMap::new(),
            stats: SyntheticStats::default(),
        }
    }

    /// 设置关键帧间隔 (视频)
    pub fn with_gop_size(mut self, gop: u64) -> Self {
        if let Kind::Video { gop_size, .. } = &mut self.kind {
            *gop_size = gop.max(1);
        }
        self
    }

    /// 设置像素格式 (视频)
    pub fn with_pixel_format(mut self, format: PixelFormat) -> Self {
        if let Kind::Video { pixel_format, .. } = &mut self.kind {
            *pixel_format = format;
        }
        self
    }

    /// 设置流起始时间 (秒), 用于模拟直播流
    ///
    /// 起始时间向下对齐到时间基刻度.
    pub fn with_start_time(mut self, start: f64) -> Self {
        let ts = Timestamp::from_seconds(start, self.info.time_base);
        if ts.is_valid() {
            self.start_ticks = ts.pts;
            self.info.start_time = ts.to_seconds();
        } else {
            self.start_ticks = 0;
            self.info.start_time = start;
        }
        self
    }

    /// 设置流索引
    pub fn with_index(mut self, index: usize) -> Self {
        self.info.index = index;
        self
    }

    /// 第 `packet` 个包首次解码时返回瞬时错误
    pub fn with_decode_failure(mut self, packet: u64) -> Self {
        self.decode_failures.insert(packet);
        self
    }

    /// 解码到第 `packet` 个包时流句柄失效
    pub fn with_invalid_from(mut self, packet: u64) -> Self {
        self.invalid_from = Some(packet);
        self
    }

    /// 第 `packet` 个包在到达前先报告 `count` 次 "暂无数据"
    pub fn with_stall(mut self, packet: u64, count: u32) -> Self {
        self.stalls.insert(packet, count);
        self
    }

    /// 从第 `packet` 个包开始切换音频格式 (音频)
    pub fn with_format_change(mut self, packet: u64, format: AudioFormat) -> Self {
        if let Kind::Audio { format_changes, .. } = &mut self.kind {
            format_changes.push((packet, format));
            format_changes.sort_by_key(|(p, _)| *p);
        }
        self
    }

    /// 解码统计句柄
    pub fn stats(&self) -> SyntheticStats {
        self.stats.clone()
    }

    /// 单个包的时长 (刻度)
    fn packet_ticks(&self) -> i64 {
        match &self.kind {
            Kind::Video { .. } => 1,
            Kind::Audio {
                samples_per_frame, ..
            } => i64::from(*samples_per_frame),
        }
    }

    fn packet_timestamp(&self, packet: u64) -> Timestamp {
        let ticks = self.start_ticks + packet as i64 * self.packet_ticks();
        Timestamp::new(ticks, self.info.time_base)
    }

    fn packet_pts(&self, packet: u64) -> f64 {
        let ts = self.packet_timestamp(packet);
        if ts.is_valid() {
            ts.to_seconds()
        } else {
            self.info.start_time
        }
    }

    fn audio_format_at(&self, packet: u64) -> AudioFormat {
        let base = AudioFormat::new(self.info.sample_rate, self.info.channels);
        match &self.kind {
            Kind::Audio { format_changes, .. } => format_changes
                .iter()
                .rev()
                .find(|(p, _)| *p <= packet)
                .map_or(base, |(_, f)| *f),
            Kind::Video { .. } => base,
        }
    }

    fn build_frame(&self, packet: u64) -> DecodedFrame {
        let pts = self.packet_timestamp(packet).pts;
        let duration = self.packet_ticks();
        let time_base = self.info.time_base;
        match &self.kind {
            Kind::Video {
                gop_size,
                pixel_format,
            } => {
                let width = self.info.width;
                let height = self.info.height;
                let mut data = vec![0u8; pixel_format.frame_size(width, height)];
                let row_bytes = pixel_format
                    .packed_bytes_per_pixel()
                    .map_or(width as usize, |bpp| bpp * width as usize);
                // 每行亮度 = 帧号 + 行号, 方便校验帧序号与翻转
                for (row, chunk) in data.chunks_mut(row_bytes.max(1)).enumerate() {
                    chunk.fill((packet as usize + row) as u8);
                }
                DecodedFrame::from_timestamp(
                    pts,
                    duration,
                    time_base,
                    packet % gop_size == 0,
                    FramePayload::Video(VideoPayload {
                        data,
                        width,
                        height,
                        pixel_format: *pixel_format,
                    }),
                )
            }
            Kind::Audio {
                samples_per_frame,
                frequency,
                ..
            } => {
                let format = self.audio_format_at(packet);
                let first_sample = packet * u64::from(*samples_per_frame);
                let channels = usize::from(format.channels);
                let mut data = Vec::with_capacity(*samples_per_frame as usize * channels * 2);
                for i in 0..u64::from(*samples_per_frame) {
                    let t = (first_sample + i) as f64 / f64::from(format.sample_rate.max(1));
                    let value = ((t * frequency * TAU).sin() * 0.25 * 32767.0) as i16;
                    for _ in 0..channels {
                        data.extend_from_slice(&value.to_le_bytes());
                    }
                }
                DecodedFrame::from_timestamp(
                    pts,
                    duration,
                    time_base,
                    true,
                    FramePayload::Audio(AudioPayload {
                        data: vec![data],
                        nb_samples: *samples_per_frame,
                        channels: format.channels,
                        sample_rate: format.sample_rate,
                        sample_format: SampleFormat::S16,
                    }),
                )
            }
        }
    }
}

impl StreamSource for SyntheticStream {
    fn info(&self) -> &StreamInfo {
        &self.info
    }

    fn has_more_data(&self) -> bool {
        self.cursor < self.total_packets
    }

    fn next_pts(&mut self) -> SyncResult<Option<f64>> {
        if self.cursor >= self.total_packets {
            return Err(SyncError::Eof);
        }
        if let Some(remaining) = self.stalls.get_mut(&self.cursor) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(None);
            }
        }
        Ok(Some(self.packet_pts(self.cursor)))
    }

    fn skip_packet(&mut self) -> SyncResult<()> {
        if self.cursor >= self.total_packets {
            return Err(SyncError::Eof);
        }
        self.cursor += 1;
        self.stats.skipped.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn decode_next(&mut self) -> SyncResult<DecodedFrame> {
        if self.cursor >= self.total_packets {
            return Err(SyncError::Eof);
        }
        let packet = self.cursor;
        if self.invalid_from.is_some_and(|p| packet >= p) {
            return Err(SyncError::StreamInvalid(format!("合成流在包 {packet} 处失效")));
        }
        self.cursor += 1;
        if self.decode_failures.remove(&packet) {
            return Err(SyncError::Decode(format!("合成流包 {packet} 解码失败")));
        }
        self.stats.decoded.fetch_add(1, Ordering::Relaxed);
        Ok(self.build_frame(packet))
    }

    fn seek(&mut self, target: f64) -> SyncResult<()> {
        if !target.is_finite() {
            return Err(SyncError::InvalidArgument(format!("非法的 seek 目标: {target}")));
        }
        let ts = Timestamp::from_seconds(target, self.info.time_base);
        if !ts.is_valid() {
            return Err(SyncError::InvalidArgument(format!(
                "时间基 {} 无法定位到 {target}",
                self.info.time_base
            )));
        }
        let relative = (ts.pts - self.start_ticks).max(0);
        let packet = ((relative / self.packet_ticks()) as u64).min(self.total_packets);
        debug!("合成流 #{} seek 到 {ts}, 包 {packet}", self.info.index);
        self.cursor = match &self.kind {
            Kind::Video { gop_size, .. } => packet - packet % gop_size,
            Kind::Audio { .. } => packet,
        };
        self.stats.seeks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
