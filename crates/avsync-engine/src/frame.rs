//! 解码后的帧数据.
//!
//! 解码器交给调度线程的统一帧表示. 时间戳已换算为秒,
//! 调度与节奏判断只关心秒数.

use avsync_core::{MediaType, PixelFormat, Rational, SampleFormat, Timestamp};

/// 音频输出格式 (环形缓冲区按此计算容量)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AudioFormat {
    /// 采样率 (Hz)
    pub sample_rate: u32,
    /// 声道数
    pub channels: u16,
}

impl AudioFormat {
    pub const fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    /// 指定时长对应的交错采样总数
    pub fn samples_for(&self, seconds: f64) -> usize {
        let per_second = f64::from(self.sample_rate) * f64::from(self.channels);
        (per_second * seconds.max(0.0)).round() as usize
    }

    /// 交错采样数对应的时长 (秒)
    pub fn seconds_for(&self, samples: usize) -> f64 {
        let per_second = f64::from(self.sample_rate) * f64::from(self.channels);
        if per_second <= 0.0 {
            return 0.0;
        }
        samples as f64 / per_second
    }
}

/// 视频负载
#[derive(Debug, Clone)]
pub struct VideoPayload {
    /// 像素数据 (多平面格式按平面顺序连续存放)
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
}

/// 音频负载
///
/// 平面格式: data 中每个 Vec 对应一个声道.
/// 交错格式: data 中只有一个 Vec, 所有声道交替排列.
#[derive(Debug, Clone)]
pub struct AudioPayload {
    pub data: Vec<Vec<u8>>,
    /// 每声道采样数
    pub nb_samples: u32,
    pub channels: u16,
    pub sample_rate: u32,
    pub sample_format: SampleFormat,
}

impl AudioPayload {
    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.channels)
    }

    /// 转换为 F32 交错采样并追加到 `out`
    ///
    /// 返回追加的采样数. 数据不足的声道按静音补齐.
    pub fn append_interleaved_f32(&self, out: &mut Vec<f32>) -> usize {
        let bps = self.sample_format.bytes_per_sample();
        let channels = usize::from(self.channels);
        let frames = self.nb_samples as usize;
        if bps == 0 || channels == 0 {
            return 0;
        }
        let start = out.len();
        out.reserve(frames * channels);
        for i in 0..frames {
            for ch in 0..channels {
                let (plane, offset) = if self.sample_format.is_planar() {
                    (self.data.get(ch), i * bps)
                } else {
                    (self.data.first(), (i * channels + ch) * bps)
                };
                let sample = plane
                    .and_then(|p| p.get(offset..offset + bps))
                    .map_or(0.0, |bytes| self.sample_format.decode_sample(bytes));
                out.push(sample);
            }
        }
        out.len() - start
    }
}

/// 帧负载
#[derive(Debug, Clone)]
pub enum FramePayload {
    Video(VideoPayload),
    Audio(AudioPayload),
}

/// 解码后的帧
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    /// 显示时间 (秒)
    pub pts: f64,
    /// 帧时长 (秒)
    pub duration: f64,
    pub is_keyframe: bool,
    pub payload: FramePayload,
}

impl DecodedFrame {
    /// 用整数时间戳和时间基构造
    pub fn from_timestamp(
        pts: i64,
        duration: i64,
        time_base: Rational,
        is_keyframe: bool,
        payload: FramePayload,
    ) -> Self {
        let seconds = Timestamp::new(pts, time_base).to_seconds();
        let duration = Timestamp::new(duration, time_base).to_seconds();
        Self {
            pts: if seconds.is_nan() { 0.0 } else { seconds },
            duration: if duration.is_nan() { 0.0 } else { duration },
            is_keyframe,
            payload,
        }
    }

    pub fn kind(&self) -> MediaType {
        match self.payload {
            FramePayload::Video(_) => MediaType::Video,
            FramePayload::Audio(_) => MediaType::Audio,
        }
    }

    /// 帧结束时间 (秒)
    pub fn end_time(&self) -> f64 {
        self.pts + self.duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s16_payload(data: Vec<Vec<u8>>, format: SampleFormat, nb_samples: u32) -> AudioPayload {
        AudioPayload {
            data,
            nb_samples,
            channels: 2,
            sample_rate: 48000,
            sample_format: format,
        }
    }

    #[test]
    fn test_交错_s16_转_f32() {
        let mut bytes = Vec::new();
        for v in [16384i16, -16384, 0, 32767] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        let payload = s16_payload(vec![bytes], SampleFormat::S16, 2);
        let mut out = Vec::new();
        assert_eq!(payload.append_interleaved_f32(&mut out), 4);
        assert!((out[0] - 0.5).abs() < 1e-4);
        assert!((out[1] + 0.5).abs() < 1e-4);
        assert_eq!(out[2], 0.0);
    }

    #[test]
    fn test_平面格式交错输出() {
        let left: Vec<u8> = [1.0f32, 2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let right: Vec<u8> = [-1.0f32, -2.0].iter().flat_map(|v| v.to_le_bytes()).collect();
        let payload = s16_payload(vec![left, right], SampleFormat::F32p, 2);
        let mut out = Vec::new();
        payload.append_interleaved_f32(&mut out);
        assert_eq!(out, vec![1.0, -1.0, 2.0, -2.0]);
    }

    #[test]
    fn test_数据不足补静音() {
        let payload = s16_payload(vec![vec![0xff, 0x7f]], SampleFormat::S16, 2);
        let mut out = Vec::new();
        assert_eq!(payload.append_interleaved_f32(&mut out), 4);
        assert_eq!(&out[1..], &[0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_时间戳换算() {
        let frame = DecodedFrame::from_timestamp(
            90,
            3,
            Rational::new(1, 30),
            true,
            FramePayload::Video(VideoPayload {
                data: Vec::new(),
                width: 0,
                height: 0,
                pixel_format: PixelFormat::Rgba,
            }),
        );
        assert!((frame.pts - 3.0).abs() < 1e-9);
        assert!((frame.end_time() - 3.1).abs() < 1e-9);
        assert_eq!(frame.kind(), MediaType::Video);
    }

    #[test]
    fn test_音频格式时长换算() {
        let format = AudioFormat::new(48000, 2);
        assert_eq!(format.samples_for(1.0), 96000);
        assert!((format.seconds_for(9600) - 0.1).abs() < 1e-9);
    }
}
