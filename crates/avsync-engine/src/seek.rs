//! Seek 协调.
//!
//! 流程: Seeking (停止解码线程) -> Flushing (清空帧池与环形缓冲区) ->
//! Repositioning (解码器定位并解码到目标帧) -> Resuming (设置时钟, 未暂停时重启线程).
//! 解码线程全部退出之前不触碰任何缓冲区. 同一时间只保留一个待执行目标,
//! 新请求覆盖旧请求.

use std::time::Duration;

use avsync_core::{SyncError, SyncResult};
use log::{debug, info, warn};

use crate::frame::FramePayload;
use crate::scheduler::{DecodeScheduler, SchedulerShared, WorkerReport};
use crate::source::StreamSource;

/// 判断帧是否到达目标时的容差 (秒)
const PTS_EPSILON: f64 = 1e-6;

/// Seek 阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekPhase {
    Idle,
    Seeking,
    Flushing,
    Repositioning,
    Resuming,
}

/// Seek 协调器
#[derive(Debug)]
pub struct SeekCoordinator {
    phase: SeekPhase,
    pending: Option<f64>,
    target: f64,
}

impl Default for SeekCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl SeekCoordinator {
    pub fn new() -> Self {
        Self {
            phase: SeekPhase::Idle,
            pending: None,
            target: 0.0,
        }
    }

    pub fn phase(&self) -> SeekPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase != SeekPhase::Idle
    }

    pub fn pending_target(&self) -> Option<f64> {
        self.pending
    }

    /// 提交 seek 目标, 覆盖尚未执行的目标
    pub fn request(&mut self, target: f64) {
        if let Some(old) = self.pending.replace(target) {
            debug!("seek 目标 {old:.3}s 被 {target:.3}s 覆盖");
        }
        if self.phase == SeekPhase::Idle {
            self.phase = SeekPhase::Seeking;
        }
    }

    /// 推进 seek 流程
    ///
    /// 解码线程未能在 `join_timeout` 内退出时停留在 Seeking 并返回 `Ok(None)`,
    /// 下次调用重试. 完成时返回最终目标. `paused` 时线程保持停止, 由恢复播放时启动.
    pub fn step(
        &mut self,
        scheduler: &mut DecodeScheduler,
        join_timeout: Duration,
        paused: bool,
    ) -> SyncResult<Option<f64>> {
        loop {
            match self.phase {
                SeekPhase::Idle => return Ok(None),
                SeekPhase::Seeking => {
                    scheduler.request_stop();
                    if !scheduler.join(join_timeout) {
                        return Ok(None);
                    }
                    self.phase = SeekPhase::Flushing;
                }
                SeekPhase::Flushing => {
                    scheduler.discard_backlog();
                    let shared = scheduler.shared();
                    let dropped = shared.pool.flush();
                    shared.ring.reset();
                    debug!("seek 清空缓冲: 释放 {dropped} 个待显示帧");
                    self.phase = SeekPhase::Repositioning;
                }
                SeekPhase::Repositioning => {
                    self.target = self.pending.take().unwrap_or(self.target);
                    let target = self.target;
                    let shared = scheduler.shared().clone();
                    let mut failed = Vec::new();
                    for source in scheduler.parked_sources_mut() {
                        if let Err(e) = reposition(source.as_mut(), target, &shared) {
                            let kind = source.info().media_type;
                            warn!("{kind} 流定位到 {target:.3}s 失败: {e}");
                            if e.is_fatal() {
                                let _ = shared.reports.send(WorkerReport::Fatal {
                                    kind,
                                    message: e.to_string(),
                                });
                                failed.push(kind);
                            }
                        }
                    }
                    for kind in failed {
                        scheduler.mark_failed(kind);
                    }
                    self.phase = SeekPhase::Resuming;
                }
                SeekPhase::Resuming => {
                    scheduler.shared().clock.seek(self.target);
                    if !paused {
                        scheduler.start()?;
                    }
                    self.phase = SeekPhase::Idle;
                    info!("seek 完成: {:.3}s", self.target);
                    return Ok(Some(self.target));
                }
            }
        }
    }
}

/// 定位解码器并解码到第一个不早于 `target` 的帧
///
/// 视频帧写入帧池; 音频帧裁掉目标之前的采样后写入环形缓冲区.
pub fn reposition(
    source: &mut dyn StreamSource,
    target: f64,
    shared: &SchedulerShared,
) -> SyncResult<()> {
    source.seek(target)?;
    let kind = source.info().media_type;
    let mut discarded = 0u32;
    loop {
        let frame = match source.decode_next() {
            Ok(frame) => frame,
            Err(SyncError::Eof) => {
                debug!("{kind} 定位后到达流末尾");
                return Ok(());
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("{kind} 定位时解码失败, 跳过: {e}");
                shared.metrics.record_decode_error();
                continue;
            }
        };
        shared.metrics.record_decoded(kind);
        match frame.payload {
            FramePayload::Video(video) => {
                if frame.pts + PTS_EPSILON < target {
                    discarded += 1;
                    continue;
                }
                let Some(mut slot) = shared.pool.acquire() else {
                    return Err(SyncError::Internal("seek 时帧池没有可用条目".into()));
                };
                slot.write_frame(&video, shared.flip_vertical);
                shared.pool.publish(slot, frame.pts);
                debug!(
                    "视频定位到 pts={:.3}, 丢弃了 {discarded} 个前置帧",
                    frame.pts
                );
                return Ok(());
            }
            FramePayload::Audio(audio) => {
                if frame.pts + frame.duration <= target + PTS_EPSILON {
                    discarded += 1;
                    continue;
                }
                let format = audio.format();
                if format != shared.ring.format() {
                    shared.ring.recreate(format);
                    let _ = shared.reports.send(WorkerReport::AudioFormatChanged(format));
                }
                let mut samples = Vec::new();
                audio.append_interleaved_f32(&mut samples);
                let lead = (target - frame.pts).max(0.0);
                let lead_frames = (lead * f64::from(format.sample_rate)).round() as usize;
                let trim = (lead_frames * usize::from(format.channels)).min(samples.len());
                shared.ring.write_some(&samples[trim..]);
                debug!(
                    "音频定位到 pts={:.3}, 裁掉 {trim} 个采样, 丢弃了 {discarded} 个前置帧",
                    frame.pts
                );
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{HostTime, PlaybackClock};
    use crate::frame::{AudioFormat, DecodedFrame};
    use crate::frame_pool::{AcquirePolicy, FramePool};
    use crate::metrics::SyncMetrics;
    use crate::pacing::{PacingController, PacingThresholds};
    use crate::ring_buffer::AudioRing;
    use crate::source::StreamInfo;
    use crate::synthetic::SyntheticStream;
    use avsync_core::Rational;
    use crossbeam_channel::unbounded;
    use std::sync::Arc;

    fn shared() -> SchedulerShared {
        let host = Arc::new(HostTime::new());
        let metrics = Arc::new(SyncMetrics::new());
        let (tx, _rx) = unbounded();
        SchedulerShared {
            clock: PlaybackClock::new(host),
            pacing: PacingController::new(
                PacingThresholds::new(0.5, 0.15),
                PacingThresholds::new(0.5, 0.15),
            ),
            pool: Arc::new(FramePool::new(32, AcquirePolicy::Grow, metrics.clone())),
            ring: AudioRing::new(
                AudioFormat::new(48000, 2),
                1.0,
                0.0,
                Duration::from_micros(500),
                metrics.clone(),
            ),
            metrics,
            reports: tx,
            video_offset: 0.0,
            audio_offset: 0.0,
            flip_vertical: false,
            burst_limit: 600,
        }
    }

    #[test]
    fn test_暂停状态下_seek_发布目标帧() {
        let shared = shared();
        shared.clock.start(0.0);
        shared.clock.pause();
        let mut sched = DecodeScheduler::new(shared.clone());
        sched.add(Box::new(
            SyntheticStream::video(2, 2, Rational::new(30, 1), 60.0).with_gop_size(30),
        ));
        sched.start().unwrap();

        let mut seek = SeekCoordinator::new();
        seek.request(30.02);
        assert_eq!(seek.phase(), SeekPhase::Seeking);
        let done = seek.step(&mut sched, Duration::from_millis(500), true).unwrap();
        assert_eq!(done, Some(30.02));
        assert_eq!(seek.phase(), SeekPhase::Idle);

        assert!((shared.clock.current_time() - 30.02).abs() < 1e-9);
        assert!(shared.clock.is_paused());
        // 暂停时 seek 不重启解码线程
        assert!(!sched.is_running());
        let first = shared.pool.ready_pts()[0];
        assert!(first >= 30.02);
        assert!((first - 901.0 / 30.0).abs() < 1e-6);
        sched.shutdown(Duration::from_millis(500));
    }

    #[test]
    fn test_最后一次_seek_生效() {
        let shared = shared();
        shared.clock.start(0.0);
        let mut sched = DecodeScheduler::new(shared.clone());
        sched.add(Box::new(SyntheticStream::video(2, 2, Rational::new(30, 1), 60.0)));

        let mut seek = SeekCoordinator::new();
        seek.request(10.0);
        seek.request(20.0);
        assert_eq!(seek.pending_target(), Some(20.0));
        let done = seek.step(&mut sched, Duration::from_millis(500), true).unwrap();
        assert_eq!(done, Some(20.0));
        assert_eq!(seek.pending_target(), None);
        // 空闲时 step 不做任何事
        assert_eq!(seek.step(&mut sched, Duration::from_millis(10), true).unwrap(), None);
        sched.shutdown(Duration::from_millis(500));
    }

    #[test]
    fn test_音频裁掉目标之前的采样() {
        let shared = shared();
        let mut source = SyntheticStream::audio(48000, 2, 10.0);
        // 每包 1024 采样, 1.0 秒位于第 46 包 (起点 0.98133s) 内
        reposition(&mut source, 1.0, &shared).unwrap();
        let packet_start = 46.0 * 1024.0 / 48000.0;
        let trimmed = ((1.0 - packet_start) * 48000.0f64).round() as usize;
        assert_eq!(shared.ring.available(), (1024 - trimmed) * 2);
    }

    /// 每次查询包时间都很慢的解码器
    struct SlowSource {
        info: StreamInfo,
        delay: Duration,
    }

    impl StreamSource for SlowSource {
        fn info(&self) -> &StreamInfo {
            &self.info
        }

        fn has_more_data(&self) -> bool {
            true
        }

        fn next_pts(&mut self) -> SyncResult<Option<f64>> {
            std::thread::sleep(self.delay);
            Ok(None)
        }

        fn skip_packet(&mut self) -> SyncResult<()> {
            Ok(())
        }

        fn decode_next(&mut self) -> SyncResult<DecodedFrame> {
            Err(SyncError::Eof)
        }

        fn seek(&mut self, _target: f64) -> SyncResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_线程退出超时后重试() {
        let shared = shared();
        shared.clock.start(0.0);
        let info = SyntheticStream::video(2, 2, Rational::new(30, 1), 1.0).info().clone();
        let mut sched = DecodeScheduler::new(shared.clone());
        sched.add(Box::new(SlowSource {
            info,
            delay: Duration::from_millis(150),
        }));
        sched.start().unwrap();
        std::thread::sleep(Duration::from_millis(20));

        let mut seek = SeekCoordinator::new();
        seek.request(0.5);
        let first = seek.step(&mut sched, Duration::from_millis(1), false).unwrap();
        assert_eq!(first, None);
        assert_eq!(seek.phase(), SeekPhase::Seeking);
        assert_eq!(shared.metrics.snapshot().slow_joins, 1);

        let second = seek.step(&mut sched, Duration::from_millis(1000), false).unwrap();
        assert_eq!(second, Some(0.5));
        assert!(sched.is_running());
        sched.shutdown(Duration::from_millis(1000));
    }
}
