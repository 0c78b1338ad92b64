//! 同步引擎.
//!
//! 宿主循环每帧调用一次 [`AvSyncEngine::tick`], 引擎在其中处理解码线程的
//! 上报、推进 seek、挑选到期的视频帧交给 [`VideoSink`] 并检测播放结束.
//! 音频由输出设备通过 [`AudioPull`](crate::ring_buffer::AudioPull) 从
//! [`AvSyncEngine::audio_output`] 拉取.

use std::sync::Arc;
use std::time::Duration;

use avsync_core::{MediaType, SyncError, SyncResult};
use crossbeam_channel::{Receiver, Sender, unbounded};
use log::{debug, error, info, warn};

use crate::clock::{MonotonicTime, PlaybackClock, TimeSource};
use crate::config::SyncConfig;
use crate::events::{EndScope, EngineEvent, EventBus, VideoSink};
use crate::frame::AudioFormat;
use crate::frame_pool::{AcquirePolicy, FramePool, PresentedFrame};
use crate::metrics::{MetricsSnapshot, SyncMetrics};
use crate::pacing::PacingController;
use crate::ring_buffer::AudioRing;
use crate::scheduler::{DecodeScheduler, SchedulerShared, WorkerReport, WorkerState};
use crate::seek::SeekCoordinator;
use crate::source::MediaSource;

/// 创建引擎时音频缓冲区的默认格式, 加载媒体后按音频流重建
const DEFAULT_AUDIO_FORMAT: AudioFormat = AudioFormat::new(48000, 2);

/// 单条流的结束状态
#[derive(Debug)]
struct StreamEnd {
    kind: MediaType,
    /// 解码线程上报的结束时间
    end_time: Option<f64>,
    failed: bool,
    reported: bool,
}

/// 当前媒体的状态
#[derive(Debug)]
struct MediaState {
    duration: Option<f64>,
    start_time: f64,
    live: bool,
    streams: Vec<StreamEnd>,
    all_ended: bool,
}

/// 音视频同步引擎
pub struct AvSyncEngine {
    config: SyncConfig,
    clock: PlaybackClock,
    metrics: Arc<SyncMetrics>,
    pool: Arc<FramePool>,
    ring: AudioRing,
    events: EventBus,
    reports_tx: Sender<WorkerReport>,
    reports_rx: Receiver<WorkerReport>,
    scheduler: Option<DecodeScheduler>,
    seek: SeekCoordinator,
    sink: Option<Box<dyn VideoSink>>,
    current_frame: Option<PresentedFrame>,
    media: Option<MediaState>,
    paused: bool,
    /// seek 完成后暂停状态下也显示一帧
    present_after_seek: bool,
}

impl AvSyncEngine {
    /// 使用系统单调时钟创建引擎
    pub fn new(config: SyncConfig) -> SyncResult<Self> {
        Self::with_time_source(config, Arc::new(MonotonicTime::new()))
    }

    /// 使用指定时间源创建引擎
    pub fn with_time_source(config: SyncConfig, source: Arc<dyn TimeSource>) -> SyncResult<Self> {
        config.validate()?;
        let metrics = Arc::new(SyncMetrics::new());
        let policy = match config.acquire_wait_ms {
            0 => AcquirePolicy::Grow,
            ms => AcquirePolicy::Wait(Duration::from_millis(ms)),
        };
        let pool = Arc::new(FramePool::new(
            config.frame_queue_capacity,
            policy,
            metrics.clone(),
        ));
        let ring = AudioRing::new(
            DEFAULT_AUDIO_FORMAT,
            config.ring_buffer_delay_seconds,
            config.audio_lead_seconds,
            config.audio_lock_timeout(),
            metrics.clone(),
        );
        ring.set_volume(config.volume);
        let (reports_tx, reports_rx) = unbounded();
        Ok(Self {
            clock: PlaybackClock::new(source),
            config,
            metrics,
            pool,
            ring,
            events: EventBus::new(),
            reports_tx,
            reports_rx,
            scheduler: None,
            seek: SeekCoordinator::new(),
            sink: None,
            current_frame: None,
            media: None,
            paused: true,
            present_after_seek: false,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// 订阅引擎事件
    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// 设置视频呈现目标
    pub fn set_video_sink(&mut self, sink: impl VideoSink + 'static) {
        self.sink = Some(Box::new(sink));
    }

    /// 音频输出句柄, 交给音频设备回调使用
    pub fn audio_output(&self) -> AudioRing {
        self.ring.clone()
    }

    /// 加载并开始播放
    ///
    /// 没有任何可播放的流时发出 `Error` 事件, 引擎保持暂停.
    pub fn play(&mut self, source: MediaSource) -> SyncResult<()> {
        self.stop();
        if source.is_empty() {
            let err = SyncError::NoPlayableStream;
            error!("{err}");
            self.events.emit(EngineEvent::Error(err.to_string()));
            return Err(err);
        }

        let duration = source.duration();
        let start_time = source.start_time();
        let live = start_time > self.config.live_start_threshold_seconds;
        if live {
            info!("起始时间 {start_time:.3}s 超过阈值, 按直播流处理");
        }

        if let Some(audio) = &source.audio {
            let info = audio.info();
            if info.sample_rate > 0 && info.channels > 0 {
                self.ring
                    .recreate(AudioFormat::new(info.sample_rate, info.channels));
            }
        }
        self.ring.reset();
        self.pool.flush();
        // 丢弃上一个媒体残留的上报
        while self.reports_rx.try_recv().is_ok() {}

        let mut scheduler = DecodeScheduler::new(self.shared());
        let mut streams = Vec::new();
        for stream in [source.video, source.audio].into_iter().flatten() {
            let info = stream.info();
            debug!(
                "添加{}流 #{}: 时长 {:?}, 起始 {:.3}s",
                info.media_type, info.index, info.duration, info.start_time
            );
            streams.push(StreamEnd {
                kind: info.media_type,
                end_time: None,
                failed: false,
                reported: false,
            });
            scheduler.add(stream);
        }

        self.clock.start(start_time);
        self.paused = false;
        self.ring.set_paused(false);
        scheduler.start()?;
        self.scheduler = Some(scheduler);
        self.media = Some(MediaState {
            duration,
            start_time,
            live,
            streams,
            all_ended: false,
        });
        info!("开始播放: 时长 {duration:?}, 起始 {start_time:.3}s");
        self.events.emit(EngineEvent::MediaReady { duration });
        Ok(())
    }

    fn shared(&self) -> SchedulerShared {
        SchedulerShared {
            clock: self.clock.clone(),
            pacing: PacingController::from_config(&self.config),
            pool: self.pool.clone(),
            ring: self.ring.clone(),
            metrics: self.metrics.clone(),
            reports: self.reports_tx.clone(),
            video_offset: self.config.video_offset_seconds,
            audio_offset: self.config.audio_offset_seconds,
            flip_vertical: self.config.flip_vertical,
            burst_limit: self.config.burst_limit.max(1),
        }
    }

    /// 暂停 (幂等)
    ///
    /// 返回时所有解码线程都已退出 (最多等待 `join_timeout_ms`),
    /// 已缓冲的帧和采样保留到恢复播放.
    pub fn pause(&mut self) {
        if self.paused || self.media.is_none() {
            return;
        }
        self.paused = true;
        self.clock.pause();
        self.ring.set_paused(true);
        self.stop_workers();
        debug!("暂停于 {:.3}s", self.clock.current_time());
    }

    /// 恢复 (幂等)
    ///
    /// seek 进行中时解码线程由 seek 完成后启动.
    pub fn resume(&mut self) {
        if !self.paused || self.media.is_none() {
            return;
        }
        self.paused = false;
        self.clock.resume();
        if !self.seek.is_active() {
            self.ring.set_paused(false);
            self.start_workers();
        }
        debug!("从 {:.3}s 恢复", self.clock.current_time());
    }

    fn stop_workers(&mut self) {
        let timeout = self.config.join_timeout();
        let Some(scheduler) = self.scheduler.as_mut() else {
            return;
        };
        scheduler.request_stop();
        if !scheduler.join(timeout) {
            warn!("部分解码线程未能在 {timeout:?} 内退出");
        }
    }

    fn start_workers(&mut self) {
        let timeout = self.config.join_timeout();
        let Some(scheduler) = self.scheduler.as_mut() else {
            return;
        };
        // 暂停时超时未退出的线程
        if scheduler.is_running() && !scheduler.join(timeout) {
            warn!("仍有解码线程未退出, 这些流不会重新启动");
        }
        if let Err(e) = scheduler.start() {
            error!("重新启动解码线程失败: {e}");
            self.events.emit(EngineEvent::Error(e.to_string()));
        }
    }

    /// 跳转到 `target` 秒
    ///
    /// 目标被钳制到媒体时间范围内, 时钟立即生效; 缓冲区的清空与解码器定位
    /// 在随后的 `tick` 中完成. 直播流不支持 seek.
    pub fn seek(&mut self, target: f64) -> SyncResult<()> {
        let Some(media) = self.media.as_mut() else {
            return Err(SyncError::Unsupported("未加载媒体".into()));
        };
        if media.live {
            warn!("直播流不支持 seek, 忽略目标 {target:.3}s");
            return Err(SyncError::Unsupported("直播流不支持 seek".into()));
        }
        if !target.is_finite() {
            return Err(SyncError::InvalidArgument(format!("非法的 seek 目标: {target}")));
        }
        let end = media
            .duration
            .map_or(f64::INFINITY, |d| media.start_time + d);
        let clamped = target.clamp(media.start_time, end.max(media.start_time));
        if clamped != target {
            debug!("seek 目标 {target:.3}s 钳制为 {clamped:.3}s");
        }

        for stream in &mut media.streams {
            stream.end_time = None;
            stream.reported = false;
        }
        media.all_ended = false;

        self.clock.seek(clamped);
        self.ring.set_paused(true);
        self.seek.request(clamped);
        self.metrics.record_seek();
        Ok(())
    }

    /// 宿主每帧调用一次, `now` 为宿主的单调时间
    pub fn tick(&mut self, now: Duration) {
        self.clock.time_source().observe(now);
        self.drain_reports();
        if self.seek.is_active() {
            self.advance_seek();
        }
        if self.seek.is_active() || self.media.is_none() {
            return;
        }
        self.present_video();
        self.check_end();
    }

    fn advance_seek(&mut self) {
        let Some(scheduler) = self.scheduler.as_mut() else {
            return;
        };
        match self
            .seek
            .step(scheduler, self.config.join_timeout(), self.paused)
        {
            Ok(Some(position)) => {
                self.ring.set_paused(self.paused);
                self.present_after_seek = true;
                self.events.emit(EngineEvent::Seeked { position });
                // 定位阶段可能产生新的上报
                self.drain_reports();
            }
            Ok(None) => {}
            Err(e) => {
                error!("seek 失败: {e}");
                self.events.emit(EngineEvent::Error(e.to_string()));
            }
        }
    }

    fn drain_reports(&mut self) {
        let epoch = self.scheduler.as_ref().map_or(0, DecodeScheduler::epoch);
        while let Ok(report) = self.reports_rx.try_recv() {
            match report {
                WorkerReport::EndOfStream {
                    kind,
                    end_time,
                    epoch: report_epoch,
                } => {
                    // seek 前的线程发出的结束消息已过时
                    if report_epoch != epoch || self.seek.is_active() {
                        continue;
                    }
                    if let Some(stream) = self.stream_mut(kind) {
                        stream.end_time = Some(end_time);
                    }
                }
                WorkerReport::Fatal { kind, message } => {
                    if let Some(stream) = self.stream_mut(kind) {
                        stream.failed = true;
                    }
                    self.events
                        .emit(EngineEvent::Error(format!("{kind}流已停止: {message}")));
                }
                WorkerReport::AudioFormatChanged(format) => {
                    self.events.emit(EngineEvent::AudioFormatChanged(format));
                }
            }
        }
    }

    fn stream_mut(&mut self, kind: MediaType) -> Option<&mut StreamEnd> {
        self.media
            .as_mut()
            .and_then(|m| m.streams.iter_mut().find(|s| s.kind == kind))
    }

    fn present_video(&mut self) {
        let t = self.clock.stream_time(self.config.video_offset_seconds);
        let mut frame = self.pool.take_latest_due(t);
        if frame.is_none() && self.paused && self.present_after_seek {
            frame = self.pool.take_next();
        }
        let Some(frame) = frame else {
            return;
        };
        self.present_after_seek = false;
        self.metrics.record_presented(frame.pts(), t);
        if let Some(sink) = self.sink.as_mut() {
            sink.present(&frame);
        }
        if let Some(previous) = self.current_frame.replace(frame) {
            self.pool.release(previous);
        }
    }

    fn check_end(&mut self) {
        let Some(media) = self.media.as_mut() else {
            return;
        };
        if media.all_ended {
            return;
        }
        if media.streams.iter().all(|s| s.failed) {
            media.all_ended = true;
            let err = SyncError::NoPlayableStream;
            error!("所有流都已失效: {err}");
            self.events.emit(EngineEvent::Error(err.to_string()));
            self.pause();
            return;
        }
        for stream in &mut media.streams {
            if stream.reported {
                continue;
            }
            if stream.failed {
                stream.reported = true;
                continue;
            }
            let Some(end) = stream.end_time else {
                continue;
            };
            if self.clock.stream_time(self.config.offset_for(stream.kind)) >= end {
                stream.reported = true;
                info!("{}流播放结束", stream.kind);
                let scope = match stream.kind {
                    MediaType::Video => EndScope::Video,
                    MediaType::Audio => EndScope::Audio,
                };
                self.events.emit(EngineEvent::EndReached(scope));
            }
        }
        if media.streams.iter().all(|s| s.reported) {
            media.all_ended = true;
            info!("所有流播放结束");
            self.events.emit(EngineEvent::EndReached(EndScope::All));
            self.pause();
        }
    }

    /// 媒体时长: 优先取视频流, 没有视频时取音频流
    pub fn length(&self) -> Option<f64> {
        self.media.as_ref().and_then(|m| m.duration)
    }

    /// 当前播放时间 (秒)
    pub fn playback_time(&self) -> f64 {
        self.clock.current_time()
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// 是否有 seek 正在进行
    pub fn is_seeking(&self) -> bool {
        self.seek.is_active()
    }

    /// 指定流解码线程的状态, 没有该流时返回 None
    pub fn worker_state(&self, kind: MediaType) -> Option<WorkerState> {
        self.scheduler.as_ref().and_then(|s| s.worker_state(kind))
    }

    pub fn set_volume(&self, volume: f32) {
        self.ring.set_volume(volume);
    }

    pub fn volume(&self) -> f32 {
        self.ring.volume()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// 停止播放并释放解码器
    pub fn stop(&mut self) {
        if let Some(mut scheduler) = self.scheduler.take() {
            scheduler.shutdown(self.config.join_timeout());
        }
        if let Some(frame) = self.current_frame.take() {
            self.pool.release(frame);
        }
        self.pool.flush();
        self.ring.set_paused(true);
        self.ring.reset();
        self.clock.pause();
        self.seek = SeekCoordinator::new();
        self.present_after_seek = false;
        self.paused = true;
        if self.media.take().is_some() {
            debug!("播放已停止");
        }
    }
}

impl Drop for AvSyncEngine {
    fn drop(&mut self) {
        self.stop();
    }
}
