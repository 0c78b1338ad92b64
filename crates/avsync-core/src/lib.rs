//! # avsync-core
//!
//! avsync 核心库, 提供基础类型定义、错误处理和时间换算工具.
//!
//! 解码器协作方与同步引擎之间传递的所有基础类型都定义在这里,
//! 两侧只需依赖本 crate 即可对接.

pub mod error;
pub mod media_type;
pub mod pixel_format;
pub mod rational;
pub mod sample_format;
pub mod timestamp;

// 重导出常用类型
pub use error::{SyncError, SyncResult};
pub use media_type::MediaType;
pub use pixel_format::PixelFormat;
pub use rational::Rational;
pub use sample_format::SampleFormat;
pub use timestamp::Timestamp;
