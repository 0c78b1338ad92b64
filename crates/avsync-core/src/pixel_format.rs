//! 像素格式定义.
//!
//! 引擎不做色彩空间转换, 只需要知道每种格式一帧占多少字节,
//! 以及是否为可按行翻转的打包格式.

use std::fmt;

/// 像素格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum PixelFormat {
    /// 未指定
    None,
    /// YUV 4:2:0 平面格式, 8 位
    Yuv420p,
    /// NV12: Y 平面 + UV 交错, 4:2:0, 8 位
    Nv12,
    /// RGB 各 8 位, 打包
    Rgb24,
    /// RGBA 各 8 位, 打包
    Rgba,
    /// BGRA 各 8 位, 打包
    Bgra,
    /// 灰度 8 位
    Gray8,
}

impl PixelFormat {
    /// 打包格式每像素字节数, 平面格式返回 `None`
    pub const fn packed_bytes_per_pixel(&self) -> Option<usize> {
        match self {
            Self::Rgb24 => Some(3),
            Self::Rgba | Self::Bgra => Some(4),
            Self::Gray8 => Some(1),
            Self::None | Self::Yuv420p | Self::Nv12 => None,
        }
    }

    /// 计算一帧图像所需的字节数
    ///
    /// 4:2:0 格式的色度平面按向上取整的半宽半高计算.
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let w = width as usize;
        let h = height as usize;
        match self {
            Self::None => 0,
            Self::Yuv420p | Self::Nv12 => {
                let cw = w.div_ceil(2);
                let ch = h.div_ceil(2);
                w * h + 2 * cw * ch
            }
            Self::Rgb24 | Self::Rgba | Self::Bgra | Self::Gray8 => {
                w * h * self.packed_bytes_per_pixel().unwrap_or(0)
            }
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::None => "none",
            Self::Yuv420p => "yuv420p",
            Self::Nv12 => "nv12",
            Self::Rgb24 => "rgb24",
            Self::Rgba => "rgba",
            Self::Bgra => "bgra",
            Self::Gray8 => "gray",
        };
        write!(f, "{name}")
    }
}
