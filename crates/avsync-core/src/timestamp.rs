//! 解码器时间刻度与秒之间的换算.
//!
//! 解码器以 `time_base` 为单位给出整数 PTS, 引擎内部统一使用秒.
//! seek 目标则反过来由秒换算成刻度, 交给解码器定位.

use crate::rational::Rational;
use std::fmt;

/// 未定义的刻度值
pub const NOPTS_VALUE: i64 = i64::MIN;

/// 秒换算为刻度时允许的浮点误差 (刻度)
const TICK_TOLERANCE: f64 = 1e-6;

/// 以时间基计的时间点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub pts: i64,
    pub time_base: Rational,
}

impl Timestamp {
    pub const fn new(pts: i64, time_base: Rational) -> Self {
        Self { pts, time_base }
    }

    pub const fn none() -> Self {
        Self {
            pts: NOPTS_VALUE,
            time_base: Rational::UNDEFINED,
        }
    }

    /// 由秒数换算, 落在两个刻度之间时取前一个刻度
    ///
    /// 时间基无效或秒数非有限值时返回未定义的时间戳.
    pub fn from_seconds(seconds: f64, time_base: Rational) -> Self {
        if !time_base.is_valid() || time_base.num == 0 || !seconds.is_finite() {
            return Self::none();
        }
        let ticks = seconds * f64::from(time_base.den) / f64::from(time_base.num);
        Self {
            pts: (ticks + TICK_TOLERANCE).floor() as i64,
            time_base,
        }
    }

    pub const fn is_valid(&self) -> bool {
        self.pts != NOPTS_VALUE && self.time_base.is_valid()
    }

    /// 转换为秒, 无效时返回 `f64::NAN`
    pub fn to_seconds(&self) -> f64 {
        if !self.is_valid() {
            return f64::NAN;
        }
        self.pts as f64 * self.time_base.to_f64()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{}@{} ({:.6}s)", self.pts, self.time_base, self.to_seconds())
        } else {
            write!(f, "NOPTS")
        }
    }
}
