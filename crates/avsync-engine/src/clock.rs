//! 播放时钟模块.
//!
//! 提供 A/V 同步所需的唯一时间参考. 时钟本身不读取系统时间,
//! 而是从 [`TimeSource`] 取墙钟读数, 宿主循环可以在 `tick` 时推进它.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// 墙钟来源
pub trait TimeSource: Send + Sync {
    /// 当前单调时间 (自任意起点)
    fn now(&self) -> Duration;

    /// 宿主在每次 tick 时报告的时间, 宿主驱动的时间源据此推进
    fn observe(&self, _host_now: Duration) {}
}

/// 基于 `Instant` 的单调时间源
pub struct MonotonicTime {
    epoch: Instant,
}

impl MonotonicTime {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for MonotonicTime {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTime {
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

/// 宿主驱动的时间源
///
/// 只在宿主调用 `tick(now)` 时前进, 解码线程读到的是最近一次 tick 的时间.
/// 倒退的读数被忽略, 保证时钟单调.
#[derive(Default)]
pub struct HostTime {
    micros: AtomicU64,
}

impl HostTime {
    pub fn new() -> Self {
        Self::default()
    }

    /// 直接推进到指定时间 (测试与离线渲染使用)
    pub fn advance_to(&self, now: Duration) {
        let us = u64::try_from(now.as_micros()).unwrap_or(u64::MAX);
        self.micros.fetch_max(us, Ordering::AcqRel);
    }
}

impl TimeSource for HostTime {
    fn now(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::Acquire))
    }

    fn observe(&self, host_now: Duration) {
        self.advance_to(host_now);
    }
}

/// 播放时钟 (线程安全, 克隆共享同一状态)
#[derive(Clone)]
pub struct PlaybackClock {
    inner: Arc<ClockInner>,
}

struct ClockInner {
    source: Arc<dyn TimeSource>,
    state: Mutex<ClockState>,
}

struct ClockState {
    /// 最近一次 (重新) 启动时的墙钟读数
    wall_clock_origin: Duration,
    /// 从墙钟经过时间中扣除的流时间偏移
    accumulated_offset: f64,
    paused: bool,
    /// 暂停时冻结的流时间
    paused_at: f64,
    /// 最近一次报告的流时间, 用于保证单调
    last_reported: f64,
}

impl PlaybackClock {
    /// 创建时钟, 初始为暂停状态, 时间为 0
    pub fn new(source: Arc<dyn TimeSource>) -> Self {
        let origin = source.now();
        Self {
            inner: Arc::new(ClockInner {
                source,
                state: Mutex::new(ClockState {
                    wall_clock_origin: origin,
                    accumulated_offset: 0.0,
                    paused: true,
                    paused_at: 0.0,
                    last_reported: 0.0,
                }),
            }),
        }
    }

    /// 时钟使用的时间源
    pub fn time_source(&self) -> &Arc<dyn TimeSource> {
        &self.inner.source
    }

    /// 从 `initial_offset` 开始计时
    pub fn start(&self, initial_offset: f64) {
        let now = self.inner.source.now();
        let mut state = self.inner.state.lock();
        state.wall_clock_origin = now;
        state.accumulated_offset = -initial_offset;
        state.paused = false;
        state.paused_at = initial_offset;
        state.last_reported = initial_offset;
    }

    /// 暂停 (幂等)
    pub fn pause(&self) {
        let now = self.inner.source.now();
        let mut state = self.inner.state.lock();
        if state.paused {
            return;
        }
        let t = running_time(&state, now);
        state.paused_at = t;
        state.last_reported = t;
        state.paused = true;
    }

    /// 恢复 (幂等), 从 `paused_at` 无缝继续
    pub fn resume(&self) {
        let now = self.inner.source.now();
        let mut state = self.inner.state.lock();
        if !state.paused {
            return;
        }
        state.wall_clock_origin = now;
        state.accumulated_offset = -state.paused_at;
        state.last_reported = state.paused_at;
        state.paused = false;
    }

    /// 跳转到 `target`, 不改变暂停状态
    pub fn seek(&self, target: f64) {
        let now = self.inner.source.now();
        let mut state = self.inner.state.lock();
        state.wall_clock_origin = now;
        state.accumulated_offset = -target;
        state.paused_at = target;
        state.last_reported = target;
    }

    /// 当前流时间 (秒)
    pub fn current_time(&self) -> f64 {
        let now = self.inner.source.now();
        let mut state = self.inner.state.lock();
        if state.paused {
            return state.paused_at;
        }
        let t = running_time(&state, now).max(state.last_reported);
        state.last_reported = t;
        t
    }

    /// 带呈现偏移的流时间
    pub fn stream_time(&self, offset: f64) -> f64 {
        self.current_time() + offset
    }

    /// 是否已暂停
    pub fn is_paused(&self) -> bool {
        self.inner.state.lock().paused
    }
}

fn running_time(state: &ClockState, now: Duration) -> f64 {
    let elapsed = now.saturating_sub(state.wall_clock_origin).as_secs_f64();
    elapsed - state.accumulated_offset
}
