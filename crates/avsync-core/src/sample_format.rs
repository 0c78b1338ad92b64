//! 音频采样格式定义.
//!
//! 环形缓冲区统一存放 F32 交错采样, 其余格式在入队前转换.
//! - 交错 (Interleaved): 所有声道的采样点交替排列, 如 LRLRLR...
//! - 平面 (Planar): 每个声道独立存储, 如 LLL...RRR...

use std::fmt;

/// 音频采样格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SampleFormat {
    /// 未指定
    None,
    /// 无符号 8 位整数, 交错
    U8,
    /// 有符号 16 位整数, 交错
    S16,
    /// 有符号 32 位整数, 交错
    S32,
    /// 32 位浮点, 交错
    F32,
    /// 有符号 16 位整数, 平面
    S16p,
    /// 32 位浮点, 平面
    F32p,
}

impl SampleFormat {
    /// 每个采样点占用的字节数
    pub const fn bytes_per_sample(&self) -> usize {
        match self {
            Self::None => 0,
            Self::U8 => 1,
            Self::S16 | Self::S16p => 2,
            Self::S32 | Self::F32 | Self::F32p => 4,
        }
    }

    /// 是否为平面格式
    pub const fn is_planar(&self) -> bool {
        matches!(self, Self::S16p | Self::F32p)
    }

    /// 把单个采样点的小端字节解码为 [-1.0, 1.0] 范围的 f32
    ///
    /// `bytes` 长度必须等于 `bytes_per_sample()`.
    pub fn decode_sample(&self, bytes: &[u8]) -> f32 {
        match self {
            Self::None => 0.0,
            Self::U8 => (f32::from(bytes[0]) - 128.0) / 128.0,
            Self::S16 | Self::S16p => f32::from(i16::from_le_bytes([bytes[0], bytes[1]])) / 32768.0,
            Self::S32 => {
                let value = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
                value as f32 / 2_147_483_648.0
            }
            Self::F32 | Self::F32p => f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]),
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::U8 => "u8",
            Self::S16 => "s16",
            Self::S32 => "s32",
            Self::F32 => "flt",
            Self::S16p => "s16p",
            Self::F32p => "fltp",
        };
        write!(f, "{name}")
    }
}
