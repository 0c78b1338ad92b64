//! 解码调度.
//!
//! 每条流一个解码线程, 循环执行: 查询下一个包的时间 -> 节奏判断 ->
//! 解码 -> 写入帧池或环形缓冲区. 线程通过条件变量等待, 停止请求会立即
//! 唤醒它; 线程退出时把解码器和尚未写出的数据交还给调度器, 供暂停或 seek
//! 之后重新启动.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use avsync_core::{MediaType, SyncError, SyncResult};
use crossbeam_channel::Sender;
use log::{debug, error, info, trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::clock::PlaybackClock;
use crate::frame::{AudioFormat, DecodedFrame, FramePayload, VideoPayload};
use crate::frame_pool::FramePool;
use crate::metrics::SyncMetrics;
use crate::pacing::{PacingController, PacingDecision, PacingThresholds};
use crate::ring_buffer::AudioRing;
use crate::source::{StreamInfo, StreamSource};

/// 单次等待的上限
pub const MAX_WAIT: Duration = Duration::from_millis(40);

/// 音频流的等待间隔
const AUDIO_WAIT: Duration = Duration::from_millis(10);

/// 解码线程状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    /// 已到达流末尾, 等待停止
    Paused,
    Stopped,
}

/// 解码线程上报给引擎的消息
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerReport {
    /// 流已读完, 携带流的结束时间 (秒)
    ///
    /// `epoch` 为线程启动时调度器的代数, seek 之前的线程发出的消息可据此丢弃.
    EndOfStream {
        kind: MediaType,
        end_time: f64,
        epoch: u64,
    },
    /// 致命错误, 该流已停止
    Fatal { kind: MediaType, message: String },
    /// 音频格式变化, 环形缓冲区已重建
    AudioFormatChanged(AudioFormat),
}

/// 解码线程共享的资源
#[derive(Clone)]
pub struct SchedulerShared {
    pub clock: PlaybackClock,
    pub pacing: PacingController,
    pub pool: Arc<FramePool>,
    pub ring: AudioRing,
    pub metrics: Arc<SyncMetrics>,
    pub reports: Sender<WorkerReport>,
    pub video_offset: f64,
    pub audio_offset: f64,
    pub flip_vertical: bool,
    pub burst_limit: u32,
}

impl SchedulerShared {
    fn offset_for(&self, kind: MediaType) -> f64 {
        match kind {
            MediaType::Video => self.video_offset,
            MediaType::Audio => self.audio_offset,
        }
    }
}

struct ControlState {
    stop: bool,
    failed: bool,
    exited: bool,
    state: WorkerState,
}

/// 控制线程与解码线程之间的握手
struct WorkerControl {
    state: Mutex<ControlState>,
    wake: Condvar,
}

impl WorkerControl {
    fn new() -> Self {
        Self {
            state: Mutex::new(ControlState {
                stop: false,
                failed: false,
                exited: false,
                state: WorkerState::Running,
            }),
            wake: Condvar::new(),
        }
    }

    fn stop_requested(&self) -> bool {
        self.state.lock().stop
    }

    fn request_stop(&self) {
        self.state.lock().stop = true;
        self.wake.notify_all();
    }

    fn set_state(&self, state: WorkerState) {
        self.state.lock().state = state;
    }

    fn mark_failed(&self) {
        let mut guard = self.state.lock();
        guard.failed = true;
        guard.state = WorkerState::Stopped;
    }

    /// 最多等待 `timeout`, 收到停止请求时提前返回
    fn wait(&self, timeout: Duration) {
        let mut guard = self.state.lock();
        if guard.stop {
            return;
        }
        self.wake.wait_for(&mut guard, timeout);
    }

    /// 等待线程退出, 超时返回 false
    fn wait_exited(&self, deadline: Instant) -> bool {
        let mut guard = self.state.lock();
        while !guard.exited {
            if self.wake.wait_until(&mut guard, deadline).timed_out() {
                return guard.exited;
            }
        }
        true
    }
}

/// 线程退出 (包括 panic) 时标记已退出
struct ExitGuard(Arc<WorkerControl>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        {
            let mut guard = self.0.state.lock();
            guard.exited = true;
            guard.state = WorkerState::Stopped;
        }
        self.0.wake.notify_all();
    }
}

/// 线程停止时尚未写入共享缓冲的数据, 下次启动时接着写
pub struct Backlog {
    /// 尚未写入环形缓冲区的 F32 采样
    staging: Vec<f32>,
    /// 帧池暂时无可用条目时保留的视频帧
    pending_video: Option<(VideoPayload, f64)>,
    /// 已解码数据的结束时间 (秒)
    last_end: f64,
}

impl Backlog {
    fn new(start_time: f64) -> Self {
        Self {
            staging: Vec::new(),
            pending_video: None,
            last_end: start_time,
        }
    }

    /// 积压的音频采样数
    pub fn staged_samples(&self) -> usize {
        self.staging.len()
    }

    pub fn has_pending_video(&self) -> bool {
        self.pending_video.is_some()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "未知 panic".to_string()
    }
}

enum Step {
    /// 立即进行下一轮
    Continue,
    /// 等待一个间隔
    Wait,
}

/// 解码线程的循环体, 所有临时缓冲都归线程自己所有
struct DecodeLoop {
    kind: MediaType,
    shared: SchedulerShared,
    control: Arc<WorkerControl>,
    thresholds: PacingThresholds,
    offset: f64,
    interval: Duration,
    backlog: Backlog,
    eos: bool,
    burst: u32,
    epoch: u64,
}

impl DecodeLoop {
    fn run(mut self, mut source: Box<dyn StreamSource>) -> (Box<dyn StreamSource>, Backlog) {
        let _exit = ExitGuard(self.control.clone());
        debug!("{} 解码线程启动", self.kind);
        loop {
            if self.control.stop_requested() {
                break;
            }
            // 积压的数据写不进去时不再解码
            if !self.flush_pending() {
                self.control.wait(self.interval);
                continue;
            }
            if self.eos {
                self.control.set_state(WorkerState::Paused);
                self.control.wait(self.interval);
                continue;
            }
            self.control.set_state(WorkerState::Running);
            let result = panic::catch_unwind(AssertUnwindSafe(|| self.step(source.as_mut())));
            let result = match result {
                Ok(result) => result,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    self.fail(format!("解码器 panic: {message}"));
                    break;
                }
            };
            match result {
                Ok(Step::Continue) => {
                    self.burst += 1;
                    if self.burst >= self.shared.burst_limit {
                        debug!("{} 连续处理 {} 个包, 让出 CPU", self.kind, self.burst);
                        self.burst = 0;
                        thread::yield_now();
                    }
                }
                Ok(Step::Wait) => {
                    self.burst = 0;
                    self.control.wait(self.interval);
                }
                Err(e) => {
                    self.fail(e.to_string());
                    break;
                }
            }
        }
        // 停止前尽量把积压数据写出去, 写不完的留给下次启动
        self.flush_pending();
        debug!("{} 解码线程退出", self.kind);
        (source, self.backlog)
    }

    fn fail(&self, message: String) {
        error!("{} 流发生致命错误, 停止解码: {message}", self.kind);
        self.control.mark_failed();
        let _ = self.shared.reports.send(WorkerReport::Fatal {
            kind: self.kind,
            message,
        });
    }

    fn step(&mut self, source: &mut dyn StreamSource) -> SyncResult<Step> {
        if !source.has_more_data() {
            return Ok(self.finish(source));
        }
        let pts = match source.next_pts() {
            Ok(Some(pts)) => pts,
            Ok(None) => return Ok(Step::Wait),
            Err(SyncError::Eof) => return Ok(self.finish(source)),
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("{} 读取包失败, 跳过: {e}", self.kind);
                self.shared.metrics.record_decode_error();
                return self.skip(source);
            }
        };

        let t = self.shared.clock.stream_time(self.offset);
        match self.thresholds.decide(t, pts) {
            PacingDecision::DeferDecode => {
                self.shared.metrics.record_deferred();
                Ok(Step::Wait)
            }
            PacingDecision::SkipUndecoded => {
                trace!("{} 包 pts={pts:.3} 落后时钟 {t:.3}, 跳过", self.kind);
                self.shared.metrics.record_skipped(self.kind);
                self.skip(source)
            }
            PacingDecision::Accept => match source.decode_next() {
                Ok(frame) => {
                    self.shared.metrics.record_decoded(self.kind);
                    self.accept(frame);
                    Ok(Step::Continue)
                }
                Err(SyncError::Eof) => Ok(self.finish(source)),
                Err(e) if e.is_fatal() => Err(e),
                Err(e) => {
                    warn!("{} 解码失败, 跳过该帧: {e}", self.kind);
                    self.shared.metrics.record_decode_error();
                    Ok(Step::Continue)
                }
            },
        }
    }

    fn skip(&mut self, source: &mut dyn StreamSource) -> SyncResult<Step> {
        match source.skip_packet() {
            Ok(()) => Ok(Step::Continue),
            Err(SyncError::Eof) => Ok(self.finish(source)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("{} 跳过包失败: {e}", self.kind);
                Ok(Step::Wait)
            }
        }
    }

    fn accept(&mut self, frame: DecodedFrame) {
        self.backlog.last_end = self.backlog.last_end.max(frame.end_time());
        match frame.payload {
            FramePayload::Video(video) => {
                self.backlog.pending_video = Some((video, frame.pts));
            }
            FramePayload::Audio(audio) => {
                let format = audio.format();
                if format != self.shared.ring.format() {
                    if !self.backlog.staging.is_empty() {
                        let stale = self.backlog.staging.len();
                        debug!("音频格式变化, 丢弃 {stale} 个旧格式采样");
                        self.backlog.staging.clear();
                    }
                    self.shared.ring.recreate(format);
                    let _ = self
                        .shared
                        .reports
                        .send(WorkerReport::AudioFormatChanged(format));
                }
                audio.append_interleaved_f32(&mut self.backlog.staging);
            }
        }
        self.flush_pending();
    }

    /// 把积压数据写入共享缓冲, 全部写完返回 true
    fn flush_pending(&mut self) -> bool {
        if let Some((video, pts)) = self.backlog.pending_video.take() {
            match self.shared.pool.acquire() {
                Some(mut slot) => {
                    slot.write_frame(&video, self.shared.flip_vertical);
                    self.shared.pool.publish(slot, pts);
                }
                None => {
                    self.backlog.pending_video = Some((video, pts));
                    return false;
                }
            }
        }
        let staging = &mut self.backlog.staging;
        if !staging.is_empty() {
            let written = self.shared.ring.write_some(staging);
            staging.drain(..written);
        }
        staging.is_empty()
    }

    fn finish(&mut self, source: &mut dyn StreamSource) -> Step {
        if !self.eos {
            self.eos = true;
            let end_time = source.info().end_time().unwrap_or(self.backlog.last_end);
            info!("{} 流读取完毕, 结束时间 {end_time:.3}s", self.kind);
            let _ = self.shared.reports.send(WorkerReport::EndOfStream {
                kind: self.kind,
                end_time,
                epoch: self.epoch,
            });
        }
        Step::Wait
    }
}

/// 等待解码线程退出的结果
pub enum JoinOutcome {
    /// 线程正常退出, 交还解码器与积压数据; `failed` 表示流已因致命错误停止
    Joined {
        source: Box<dyn StreamSource>,
        backlog: Backlog,
        failed: bool,
    },
    /// 线程 panic, 解码器丢失
    Panicked,
    /// 超时, 线程仍在运行
    TimedOut(StreamWorker),
}

/// 单条流的解码线程句柄
pub struct StreamWorker {
    kind: MediaType,
    control: Arc<WorkerControl>,
    handle: Option<JoinHandle<(Box<dyn StreamSource>, Backlog)>>,
}

impl StreamWorker {
    /// 启动解码线程, 先写出上次停止时留下的 `backlog`
    pub fn spawn(
        source: Box<dyn StreamSource>,
        backlog: Backlog,
        shared: &SchedulerShared,
        epoch: u64,
    ) -> SyncResult<Self> {
        let info = source.info();
        let kind = info.media_type;
        let interval = match kind {
            MediaType::Video => info
                .frame_rate
                .frame_interval()
                .map_or(MAX_WAIT, |d| d.min(MAX_WAIT)),
            MediaType::Audio => AUDIO_WAIT,
        };
        let control = Arc::new(WorkerControl::new());
        let body = DecodeLoop {
            kind,
            shared: shared.clone(),
            control: control.clone(),
            thresholds: shared.pacing.thresholds(kind),
            offset: shared.offset_for(kind),
            interval,
            backlog,
            eos: false,
            burst: 0,
            epoch,
        };
        let handle = thread::Builder::new()
            .name(format!("avsync-{}", kind.short_name()))
            .spawn(move || body.run(source))?;
        Ok(Self {
            kind,
            control,
            handle: Some(handle),
        })
    }

    pub fn kind(&self) -> MediaType {
        self.kind
    }

    pub fn state(&self) -> WorkerState {
        self.control.state.lock().state
    }

    /// 请求停止, 线程在当前迭代结束后退出
    pub fn request_stop(&self) {
        self.control.request_stop();
    }

    /// 等待线程退出, 最多等待到 `deadline`
    pub fn join_until(mut self, deadline: Instant) -> JoinOutcome {
        if !self.control.wait_exited(deadline) {
            return JoinOutcome::TimedOut(self);
        }
        let failed = self.control.state.lock().failed;
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok((source, backlog))) => JoinOutcome::Joined {
                source,
                backlog,
                failed,
            },
            Some(Err(_)) | None => {
                error!("{} 解码线程 panic", self.kind);
                JoinOutcome::Panicked
            }
        }
    }
}

enum SlotState {
    /// 线程未运行, 解码器与积压数据由调度器持有
    Parked(Box<dyn StreamSource>, Backlog),
    Running(StreamWorker),
    /// 流已失效
    Failed,
}

struct StreamSlot {
    info: StreamInfo,
    state: SlotState,
}

/// 解码调度器, 管理所有流的解码线程
pub struct DecodeScheduler {
    shared: SchedulerShared,
    slots: Vec<StreamSlot>,
    epoch: u64,
}

impl DecodeScheduler {
    pub fn new(shared: SchedulerShared) -> Self {
        Self {
            shared,
            slots: Vec::new(),
            epoch: 0,
        }
    }

    pub fn shared(&self) -> &SchedulerShared {
        &self.shared
    }

    /// 添加一条流 (线程尚未启动)
    pub fn add(&mut self, source: Box<dyn StreamSource>) {
        let info = source.info().clone();
        let backlog = Backlog::new(info.start_time);
        self.slots.push(StreamSlot {
            info,
            state: SlotState::Parked(source, backlog),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// 当前代数, 每次 `start` 加一
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn stream_infos(&self) -> impl Iterator<Item = &StreamInfo> {
        self.slots.iter().map(|s| &s.info)
    }

    /// 启动所有未运行且未失效的流
    pub fn start(&mut self) -> SyncResult<()> {
        self.epoch += 1;
        for slot in &mut self.slots {
            let state = std::mem::replace(&mut slot.state, SlotState::Failed);
            slot.state = match state {
                SlotState::Parked(source, backlog) => {
                    let worker = StreamWorker::spawn(source, backlog, &self.shared, self.epoch)?;
                    SlotState::Running(worker)
                }
                other => other,
            };
        }
        Ok(())
    }

    /// 是否有线程处于运行状态
    pub fn is_running(&self) -> bool {
        self.slots
            .iter()
            .any(|s| matches!(s.state, SlotState::Running(_)))
    }

    pub fn request_stop(&self) {
        for slot in &self.slots {
            if let SlotState::Running(worker) = &slot.state {
                worker.request_stop();
            }
        }
    }

    /// 等待所有线程退出, 全部退出返回 true
    ///
    /// 超时的线程保持运行状态, 之后可以再次调用重试.
    pub fn join(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut all_joined = true;
        for slot in &mut self.slots {
            let state = std::mem::replace(&mut slot.state, SlotState::Failed);
            slot.state = match state {
                SlotState::Running(worker) => match worker.join_until(deadline) {
                    JoinOutcome::Joined {
                        failed: false,
                        source,
                        backlog,
                    } => SlotState::Parked(source, backlog),
                    JoinOutcome::Joined { failed: true, .. } | JoinOutcome::Panicked => {
                        SlotState::Failed
                    }
                    JoinOutcome::TimedOut(worker) => {
                        warn!(
                            "{} 解码线程未能在 {timeout:?} 内退出, 稍后重试",
                            worker.kind()
                        );
                        self.shared.metrics.record_slow_join();
                        all_joined = false;
                        SlotState::Running(worker)
                    }
                },
                other => other,
            };
        }
        all_joined
    }

    /// 线程状态; 未运行的流返回 Idle, 失效的流返回 Stopped
    pub fn worker_state(&self, kind: MediaType) -> Option<WorkerState> {
        self.slots
            .iter()
            .find(|s| s.info.media_type == kind)
            .map(|s| match &s.state {
                SlotState::Parked(..) => WorkerState::Idle,
                SlotState::Running(worker) => worker.state(),
                SlotState::Failed => WorkerState::Stopped,
            })
    }

    pub fn is_failed(&self, kind: MediaType) -> bool {
        self.slots
            .iter()
            .any(|s| s.info.media_type == kind && matches!(s.state, SlotState::Failed))
    }

    /// 所有线程都未运行时, 逐个访问被持有的解码器
    pub fn parked_sources_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn StreamSource>> {
        self.slots.iter_mut().filter_map(|s| match &mut s.state {
            SlotState::Parked(source, _) => Some(source),
            _ => None,
        })
    }

    /// 丢弃未运行流的积压数据 (seek 清空缓冲时调用)
    pub fn discard_backlog(&mut self) {
        for slot in &mut self.slots {
            if let SlotState::Parked(_, backlog) = &mut slot.state {
                *backlog = Backlog::new(slot.info.start_time);
            }
        }
    }

    /// 未运行流的积压数据
    pub fn backlog(&self, kind: MediaType) -> Option<&Backlog> {
        self.slots.iter().find_map(|s| match &s.state {
            SlotState::Parked(_, backlog) if s.info.media_type == kind => Some(backlog),
            _ => None,
        })
    }

    /// 把指定流标记为失效, 丢弃其解码器
    pub fn mark_failed(&mut self, kind: MediaType) {
        for slot in &mut self.slots {
            if slot.info.media_type == kind && matches!(slot.state, SlotState::Parked(..)) {
                slot.state = SlotState::Failed;
            }
        }
    }

    /// 停止所有线程并移除所有流
    ///
    /// 超时未退出的线程被分离, 它们会在下一次迭代时自行退出.
    pub fn shutdown(&mut self, timeout: Duration) {
        self.request_stop();
        if !self.join(timeout) {
            warn!("部分解码线程未退出, 已分离");
        }
        self.slots.clear();
    }
}

impl Drop for DecodeScheduler {
    fn drop(&mut self) {
        if !self.slots.is_empty() {
            self.shutdown(Duration::from_millis(200));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::HostTime;
    use crate::frame_pool::AcquirePolicy;
    use crate::ring_buffer::AudioPull;
    use crate::synthetic::SyntheticStream;
    use avsync_core::Rational;
    use crossbeam_channel::{Receiver, unbounded};

    struct Fixture {
        host: Arc<HostTime>,
        shared: SchedulerShared,
        reports: Receiver<WorkerReport>,
    }

    fn fixture() -> Fixture {
        let host = Arc::new(HostTime::new());
        let clock = PlaybackClock::new(host.clone());
        let metrics = Arc::new(SyncMetrics::new());
        let (tx, rx) = unbounded();
        let shared = SchedulerShared {
            clock,
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
        };
        Fixture {
            host,
            shared,
            reports: rx,
        }
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn test_视频只缓冲预算内的帧() {
        let f = fixture();
        f.shared.clock.start(0.0);
        let mut sched = DecodeScheduler::new(f.shared.clone());
        sched.add(Box::new(SyntheticStream::video(4, 4, Rational::new(30, 1), 60.0)));
        sched.start().unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            sched.shared().metrics.snapshot().deferred > 0
        }));
        // 0.5 秒内共 16 帧 (含边界)
        assert_eq!(f.shared.pool.ready_len(), 16);
        assert_eq!(sched.worker_state(MediaType::Video), Some(WorkerState::Running));

        sched.request_stop();
        assert!(sched.join(Duration::from_millis(500)));
        assert_eq!(sched.worker_state(MediaType::Video), Some(WorkerState::Idle));
        assert_eq!(sched.parked_sources_mut().count(), 1);
    }

    #[test]
    fn test_落后的包不解码直接跳过() {
        let f = fixture();
        f.shared.clock.start(10.0);
        let stream = SyntheticStream::video(2, 2, Rational::new(30, 1), 60.0);
        let stats = stream.stats();
        let mut sched = DecodeScheduler::new(f.shared.clone());
        sched.add(Box::new(stream));
        sched.start().unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            sched.shared().metrics.snapshot().deferred > 0
        }));
        assert_eq!(stats.skipped(), 296);
        assert_eq!(stats.decoded(), 20);
        let first = f.shared.pool.ready_pts()[0];
        assert!(first >= 10.0 - 0.15);
        sched.shutdown(Duration::from_millis(500));
    }

    #[test]
    fn test_流结束上报() {
        let f = fixture();
        f.shared.clock.start(0.0);
        let mut sched = DecodeScheduler::new(f.shared.clone());
        sched.add(Box::new(SyntheticStream::video(2, 2, Rational::new(10, 1), 0.2)));
        sched.start().unwrap();

        let report = f.reports.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(
            report,
            WorkerReport::EndOfStream {
                kind: MediaType::Video,
                end_time: 0.2,
                epoch: 1,
            }
        );
        assert!(wait_until(Duration::from_secs(1), || {
            sched.worker_state(MediaType::Video) == Some(WorkerState::Paused)
        }));
        sched.shutdown(Duration::from_millis(500));
    }

    #[test]
    fn test_瞬时错误跳过致命错误停止() {
        let f = fixture();
        f.shared.clock.start(0.0);
        let stream = SyntheticStream::video(2, 2, Rational::new(30, 1), 10.0)
            .with_decode_failure(1)
            .with_invalid_from(5);
        let mut sched = DecodeScheduler::new(f.shared.clone());
        sched.add(Box::new(stream));
        sched.start().unwrap();

        let report = f.reports.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(matches!(report, WorkerReport::Fatal { kind: MediaType::Video, .. }));
        assert!(wait_until(Duration::from_secs(1), || {
            sched.worker_state(MediaType::Video) == Some(WorkerState::Stopped)
        }));
        // 包 0, 2, 3, 4 解码成功, 包 1 失败
        assert_eq!(f.shared.pool.ready_len(), 4);
        assert_eq!(f.shared.metrics.snapshot().decode_errors, 1);

        assert!(sched.join(Duration::from_millis(500)));
        assert!(sched.is_failed(MediaType::Video));
        // 失效的流不会被重新启动
        sched.start().unwrap();
        assert_eq!(sched.worker_state(MediaType::Video), Some(WorkerState::Stopped));
    }

    #[test]
    fn test_音频写入环形缓冲区并处理格式变化() {
        let f = fixture();
        f.shared.clock.start(0.0);
        let stream = SyntheticStream::audio(48000, 2, 10.0)
            .with_format_change(3, AudioFormat::new(44100, 1));
        let mut sched = DecodeScheduler::new(f.shared.clone());
        sched.add(Box::new(stream));
        sched.start().unwrap();

        let report = f.reports.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(
            report,
            WorkerReport::AudioFormatChanged(AudioFormat::new(44100, 1))
        );
        assert!(wait_until(Duration::from_secs(2), || {
            sched.shared().metrics.snapshot().deferred > 0
        }));
        assert_eq!(f.shared.ring.format(), AudioFormat::new(44100, 1));
        assert_eq!(f.shared.ring.capacity(), 44100);
        assert!(f.shared.ring.available() > 0);
        sched.shutdown(Duration::from_millis(500));
    }

    #[test]
    fn test_停止后重新启动继续解码() {
        let f = fixture();
        f.shared.clock.start(0.0);
        let mut sched = DecodeScheduler::new(f.shared.clone());
        sched.add(Box::new(SyntheticStream::video(2, 2, Rational::new(30, 1), 60.0)));
        sched.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || f.shared.pool.ready_len() == 16));

        sched.request_stop();
        assert!(sched.join(Duration::from_millis(500)));
        assert!(!sched.is_running());
        assert_eq!(sched.worker_state(MediaType::Video), Some(WorkerState::Idle));
        assert_eq!(f.shared.pool.ready_len(), 16);

        // 时钟前进后重新启动, 从上次停下的位置继续
        f.host.advance_to(Duration::from_secs(1));
        sched.start().unwrap();
        assert!(sched.is_running());
        assert!(wait_until(Duration::from_secs(2), || {
            f.shared.pool.ready_pts().last().is_some_and(|&p| p > 1.4)
        }));
        let pts = f.shared.pool.ready_pts();
        assert!(pts.windows(2).all(|w| w[0] < w[1]));
        sched.shutdown(Duration::from_millis(500));
    }

    #[test]
    fn test_停止时保留积压的音频采样() {
        let f = fixture();
        f.shared.clock.start(0.0);
        let mut shared = f.shared.clone();
        shared.pacing = PacingController::new(
            PacingThresholds::new(0.5, 0.15),
            PacingThresholds::new(5.0, 0.15),
        );
        let stream = SyntheticStream::audio(48000, 2, 10.0);
        let stats = stream.stats();
        let mut sched = DecodeScheduler::new(shared);
        sched.add(Box::new(stream));
        sched.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            f.shared.ring.available_capacity() == 0
        }));

        sched.request_stop();
        assert!(sched.join(Duration::from_millis(500)));
        // 96000 不是 2048 的整数倍, 最后一个包只写进去一部分
        let staged = sched.backlog(MediaType::Audio).unwrap().staged_samples();
        assert!(staged > 0);
        assert_eq!(stats.decoded() as usize * 2048, 96000 + staged);

        f.shared.ring.set_paused(false);
        let mut block = vec![0.0f32; 4096];
        f.shared.ring.fill_audio_buffer(&mut block);
        assert_eq!(f.shared.ring.available(), 96000 - 4096);

        sched.start().unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            f.shared.ring.available_capacity() == 0
        }));
        sched.request_stop();
        assert!(sched.join(Duration::from_millis(500)));
        let staged = sched.backlog(MediaType::Audio).unwrap().staged_samples();
        assert_eq!(stats.decoded() as usize * 2048, 96000 + 4096 + staged);
        assert_eq!(f.shared.metrics.snapshot().audio_overrun_samples, 0);

        // seek 清空缓冲时积压数据一并丢弃
        sched.discard_backlog();
        assert_eq!(sched.backlog(MediaType::Audio).unwrap().staged_samples(), 0);
        sched.shutdown(Duration::from_millis(500));
    }

    /// 解码时 panic 的解码器
    struct PanickingSource {
        info: StreamInfo,
    }

    impl StreamSource for PanickingSource {
        fn info(&self) -> &StreamInfo {
            &self.info
        }

        fn has_more_data(&self) -> bool {
            true
        }

        fn next_pts(&mut self) -> SyncResult<Option<f64>> {
            Ok(Some(0.0))
        }

        fn skip_packet(&mut self) -> SyncResult<()> {
            Ok(())
        }

        fn decode_next(&mut self) -> SyncResult<DecodedFrame> {
            panic!("坏数据");
        }

        fn seek(&mut self, _target: f64) -> SyncResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_解码器_panic_上报致命错误() {
        let f = fixture();
        f.shared.clock.start(0.0);
        let info = SyntheticStream::video(2, 2, Rational::new(30, 1), 1.0).info().clone();
        let mut sched = DecodeScheduler::new(f.shared.clone());
        sched.add(Box::new(PanickingSource { info }));
        sched.start().unwrap();

        let report = f.reports.recv_timeout(Duration::from_secs(2)).unwrap();
        let WorkerReport::Fatal { kind, message } = report else {
            panic!("应为致命错误");
        };
        assert_eq!(kind, MediaType::Video);
        assert!(message.contains("坏数据"));
        assert!(sched.join(Duration::from_millis(500)));
        assert!(sched.is_failed(MediaType::Video));
        assert_eq!(sched.worker_state(MediaType::Video), Some(WorkerState::Stopped));
    }

    /// 已没有数据, 但继续读取会出错的解码器
    struct DrainedSource {
        info: StreamInfo,
    }

    impl StreamSource for DrainedSource {
        fn info(&self) -> &StreamInfo {
            &self.info
        }

        fn has_more_data(&self) -> bool {
            false
        }

        fn next_pts(&mut self) -> SyncResult<Option<f64>> {
            Err(SyncError::StreamInvalid("读取越界".into()))
        }

        fn skip_packet(&mut self) -> SyncResult<()> {
            Err(SyncError::StreamInvalid("读取越界".into()))
        }

        fn decode_next(&mut self) -> SyncResult<DecodedFrame> {
            Err(SyncError::StreamInvalid("读取越界".into()))
        }

        fn seek(&mut self, _target: f64) -> SyncResult<()> {
            Ok(())
        }
    }

    #[test]
    fn test_没有更多数据时直接结束() {
        let f = fixture();
        f.shared.clock.start(0.0);
        let info = SyntheticStream::audio(48000, 2, 1.5).info().clone();
        let mut sched = DecodeScheduler::new(f.shared.clone());
        sched.add(Box::new(DrainedSource { info }));
        sched.start().unwrap();

        let report = f.reports.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(
            report,
            WorkerReport::EndOfStream {
                kind: MediaType::Audio,
                end_time: 1.5,
                epoch: 1,
            }
        );
        assert!(!sched.is_failed(MediaType::Audio));
        sched.shutdown(Duration::from_millis(500));
    }

    #[test]
    fn test_音频背压不丢采样() {
        let f = fixture();
        f.shared.clock.start(0.0);
        // 预算足够大, 环形缓冲区 (1 秒) 成为瓶颈
        let mut shared = f.shared.clone();
        shared.pacing = PacingController::new(
            PacingThresholds::new(0.5, 0.15),
            PacingThresholds::new(5.0, 0.15),
        );
        let mut sched = DecodeScheduler::new(shared);
        sched.add(Box::new(SyntheticStream::audio(48000, 2, 10.0)));
        sched.start().unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            f.shared.ring.available_capacity() == 0
        }));
        assert_eq!(f.shared.metrics.snapshot().audio_overrun_samples, 0);
        sched.shutdown(Duration::from_millis(500));
    }
}
