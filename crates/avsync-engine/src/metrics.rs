//! 同步统计.
//!
//! 解码线程、音频回调与控制线程都会写入, 全部使用原子计数.
//! [`SyncMetrics::snapshot`] 生成可序列化的快照.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use avsync_core::MediaType;
use serde::Serialize;

/// 画面与时钟的偏差超过该值 (微秒) 记为不同步
pub const DRIFT_THRESHOLD_US: i64 = 100_000;

/// 同步统计
#[derive(Debug, Default)]
pub struct SyncMetrics {
    video_decoded: AtomicU64,
    audio_decoded: AtomicU64,
    video_presented: AtomicU64,
    /// 已缓冲但未显示就被释放的帧
    video_dropped: AtomicU64,
    video_skipped: AtomicU64,
    audio_skipped: AtomicU64,
    deferred: AtomicU64,
    decode_errors: AtomicU64,
    audio_samples_played: AtomicU64,
    audio_underruns: AtomicU64,
    audio_underrun_samples: AtomicU64,
    audio_overrun_samples: AtomicU64,
    audio_lock_misses: AtomicU64,
    seeks: AtomicU64,
    slow_joins: AtomicU64,
    current_drift_us: AtomicI64,
    max_abs_drift_us: AtomicI64,
    out_of_sync: AtomicU64,
}

/// 统计快照
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub video_decoded: u64,
    pub audio_decoded: u64,
    pub video_presented: u64,
    pub video_dropped: u64,
    pub video_skipped: u64,
    pub audio_skipped: u64,
    pub deferred: u64,
    pub decode_errors: u64,
    pub audio_samples_played: u64,
    pub audio_underruns: u64,
    pub audio_underrun_samples: u64,
    pub audio_overrun_samples: u64,
    pub audio_lock_misses: u64,
    pub seeks: u64,
    pub slow_joins: u64,
    /// 最近一次显示时画面相对时钟的偏差 (毫秒, 正数表示画面超前)
    pub current_drift_ms: f64,
    pub max_abs_drift_ms: f64,
    pub out_of_sync: u64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_decoded(&self, kind: MediaType) {
        match kind {
            MediaType::Video => self.video_decoded.fetch_add(1, Ordering::Relaxed),
            MediaType::Audio => self.audio_decoded.fetch_add(1, Ordering::Relaxed),
        };
    }

    /// 未解码直接跳过的包
    pub fn record_skipped(&self, kind: MediaType) {
        match kind {
            MediaType::Video => self.video_skipped.fetch_add(1, Ordering::Relaxed),
            MediaType::Audio => self.audio_skipped.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_deferred(&self) {
        self.deferred.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录一次显示, `pts - clock` 为画面偏差 (秒)
    pub fn record_presented(&self, pts: f64, clock: f64) {
        self.video_presented.fetch_add(1, Ordering::Relaxed);
        let drift_us = ((pts - clock) * 1_000_000.0) as i64;
        self.current_drift_us.store(drift_us, Ordering::Relaxed);
        self.max_abs_drift_us
            .fetch_max(drift_us.abs(), Ordering::Relaxed);
        if drift_us.abs() > DRIFT_THRESHOLD_US {
            self.out_of_sync.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_dropped(&self, count: u64) {
        if count > 0 {
            self.video_dropped.fetch_add(count, Ordering::Relaxed);
        }
    }

    pub fn record_audio_played(&self, samples: u64) {
        self.audio_samples_played
            .fetch_add(samples, Ordering::Relaxed);
    }

    pub fn record_audio_underrun(&self, missing: u64) {
        self.audio_underruns.fetch_add(1, Ordering::Relaxed);
        self.audio_underrun_samples
            .fetch_add(missing, Ordering::Relaxed);
    }

    pub fn record_audio_overrun(&self, dropped: u64) {
        self.audio_overrun_samples
            .fetch_add(dropped, Ordering::Relaxed);
    }

    pub fn record_audio_lock_miss(&self) {
        self.audio_lock_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_seek(&self) {
        self.seeks.fetch_add(1, Ordering::Relaxed);
    }

    /// 解码线程未能在超时内退出
    pub fn record_slow_join(&self) {
        self.slow_joins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);
        MetricsSnapshot {
            video_decoded: load(&self.video_decoded),
            audio_decoded: load(&self.audio_decoded),
            video_presented: load(&self.video_presented),
            video_dropped: load(&self.video_dropped),
            video_skipped: load(&self.video_skipped),
            audio_skipped: load(&self.audio_skipped),
            deferred: load(&self.deferred),
            decode_errors: load(&self.decode_errors),
            audio_samples_played: load(&self.audio_samples_played),
            audio_underruns: load(&self.audio_underruns),
            audio_underrun_samples: load(&self.audio_underrun_samples),
            audio_overrun_samples: load(&self.audio_overrun_samples),
            audio_lock_misses: load(&self.audio_lock_misses),
            seeks: load(&self.seeks),
            slow_joins: load(&self.slow_joins),
            current_drift_ms: self.current_drift_us.load(Ordering::Relaxed) as f64 / 1000.0,
            max_abs_drift_ms: self.max_abs_drift_us.load(Ordering::Relaxed) as f64 / 1000.0,
            out_of_sync: load(&self.out_of_sync),
        }
    }
}
