//! 视频帧缓冲池.
//!
//! 呈现侧的像素缓冲区在这里复用, 每个条目的状态流转:
//! Free -> Writing -> Ready -> Presenting -> Free.
//! Writing 与 Presenting 状态下缓冲区分别由 [`WritingSlot`] 和
//! [`PresentedFrame`] 持有, 池内不可能复用正在显示的缓冲区.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use avsync_core::PixelFormat;
use log::{trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::frame::VideoPayload;
use crate::metrics::SyncMetrics;

/// 条目状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Free,
    Writing,
    Ready,
    Presenting,
}

/// 无空闲条目时的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquirePolicy {
    /// 达到上限后直接复用最旧的待显示帧
    Grow,
    /// 达到上限后先等待释放, 超时再复用最旧的待显示帧
    Wait(Duration),
}

/// 正在写入的条目
#[derive(Debug)]
pub struct WritingSlot {
    id: usize,
    buffer: Vec<u8>,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

impl WritingSlot {
    pub fn id(&self) -> usize {
        self.id
    }

    /// 直接访问缓冲区
    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }

    /// 复制一帧像素数据
    ///
    /// `flip_vertical` 仅对打包像素格式生效.
    pub fn write_frame(&mut self, frame: &VideoPayload, flip_vertical: bool) {
        self.width = frame.width;
        self.height = frame.height;
        self.pixel_format = frame.pixel_format;
        self.buffer.clear();

        let row_bytes = frame
            .pixel_format
            .packed_bytes_per_pixel()
            .map(|bpp| bpp * frame.width as usize)
            .filter(|&row| row > 0 && frame.data.len() % row == 0);
        match row_bytes {
            Some(row) if flip_vertical => {
                for line in frame.data.chunks_exact(row).rev() {
                    self.buffer.extend_from_slice(line);
                }
            }
            _ => self.buffer.extend_from_slice(&frame.data),
        }
    }
}

/// 正在显示的帧
#[derive(Debug)]
pub struct PresentedFrame {
    id: usize,
    data: Vec<u8>,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
    pts: f64,
}

impl PresentedFrame {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixel_format(&self) -> PixelFormat {
        self.pixel_format
    }

    pub fn pts(&self) -> f64 {
        self.pts
    }
}

#[derive(Debug)]
struct ReadyEntry {
    id: usize,
    pts: f64,
    buffer: Vec<u8>,
    width: u32,
    height: u32,
    pixel_format: PixelFormat,
}

impl ReadyEntry {
    fn into_presented(self) -> PresentedFrame {
        PresentedFrame {
            id: self.id,
            data: self.buffer,
            width: self.width,
            height: self.height,
            pixel_format: self.pixel_format,
            pts: self.pts,
        }
    }
}

#[derive(Debug, Default)]
struct PoolInner {
    states: Vec<EntryState>,
    free: Vec<(usize, Vec<u8>)>,
    ready: VecDeque<ReadyEntry>,
}

impl PoolInner {
    fn writing(&mut self, id: usize, buffer: Vec<u8>) -> WritingSlot {
        self.states[id] = EntryState::Writing;
        WritingSlot {
            id,
            buffer,
            width: 0,
            height: 0,
            pixel_format: PixelFormat::None,
        }
    }

    fn free_ready(&mut self, entry: ReadyEntry) {
        self.states[entry.id] = EntryState::Free;
        self.free.push((entry.id, entry.buffer));
    }
}

/// 视频帧缓冲池
pub struct FramePool {
    inner: Mutex<PoolInner>,
    released: Condvar,
    ceiling: usize,
    policy: AcquirePolicy,
    metrics: Arc<SyncMetrics>,
}

impl FramePool {
    /// 创建缓冲池, `ceiling` 为条目数上限
    pub fn new(ceiling: usize, policy: AcquirePolicy, metrics: Arc<SyncMetrics>) -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            released: Condvar::new(),
            ceiling: ceiling.max(1),
            policy,
            metrics,
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// 已分配的条目数
    pub fn entry_count(&self) -> usize {
        self.inner.lock().states.len()
    }

    /// 待显示帧数
    pub fn ready_len(&self) -> usize {
        self.inner.lock().ready.len()
    }

    /// 待显示帧的时间戳 (按发布顺序)
    pub fn ready_pts(&self) -> Vec<f64> {
        self.inner.lock().ready.iter().map(|e| e.pts).collect()
    }

    /// 各状态的条目数 (Free, Writing, Ready, Presenting)
    pub fn state_counts(&self) -> [usize; 4] {
        let inner = self.inner.lock();
        let mut counts = [0usize; 4];
        for state in &inner.states {
            let idx = match state {
                EntryState::Free => 0,
                EntryState::Writing => 1,
                EntryState::Ready => 2,
                EntryState::Presenting => 3,
            };
            counts[idx] += 1;
        }
        counts
    }

    /// 获取一个可写条目
    ///
    /// 依次尝试: 空闲条目, 扩容 (不超过上限), 按策略等待释放,
    /// 复用最旧的待显示帧 (计为丢帧). 所有条目都在写入或显示中时返回 None.
    pub fn acquire(&self) -> Option<WritingSlot> {
        let deadline = match self.policy {
            AcquirePolicy::Grow => None,
            AcquirePolicy::Wait(d) => Some(Instant::now() + d),
        };
        let mut inner = self.inner.lock();
        loop {
            if let Some((id, buffer)) = inner.free.pop() {
                return Some(inner.writing(id, buffer));
            }
            if inner.states.len() < self.ceiling {
                let id = inner.states.len();
                inner.states.push(EntryState::Writing);
                trace!("帧池扩容到 {} 个条目", id + 1);
                return Some(inner.writing(id, Vec::new()));
            }
            match deadline {
                Some(deadline) if Instant::now() < deadline => {
                    self.released.wait_until(&mut inner, deadline);
                }
                _ => break,
            }
        }
        let oldest = inner.ready.pop_front()?;
        self.metrics.record_dropped(1);
        trace!("帧池已满, 复用最旧的待显示帧 pts={:.3}", oldest.pts);
        Some(inner.writing(oldest.id, oldest.buffer))
    }

    /// 发布写好的帧 (Writing -> Ready)
    pub fn publish(&self, slot: WritingSlot, pts: f64) {
        let mut inner = self.inner.lock();
        inner.states[slot.id] = EntryState::Ready;
        inner.ready.push_back(ReadyEntry {
            id: slot.id,
            pts,
            buffer: slot.buffer,
            width: slot.width,
            height: slot.height,
            pixel_format: slot.pixel_format,
        });
    }

    /// 放弃写入 (Writing -> Free)
    pub fn discard(&self, slot: WritingSlot) {
        let mut inner = self.inner.lock();
        inner.states[slot.id] = EntryState::Free;
        inner.free.push((slot.id, slot.buffer));
        self.released.notify_one();
    }

    /// 取出最早发布的待显示帧 (Ready -> Presenting)
    pub fn take_next(&self) -> Option<PresentedFrame> {
        let mut inner = self.inner.lock();
        let entry = inner.ready.pop_front()?;
        inner.states[entry.id] = EntryState::Presenting;
        Some(entry.into_presented())
    }

    /// 取出 `pts <= t` 的最新待显示帧, 更早的待显示帧全部释放
    pub fn take_latest_due(&self, t: f64) -> Option<PresentedFrame> {
        let mut inner = self.inner.lock();
        let pts: Vec<f64> = inner.ready.iter().map(|e| e.pts).collect();
        let index = crate::pacing::select_latest_due(&pts, t)?;
        for _ in 0..index {
            if let Some(stale) = inner.ready.pop_front() {
                inner.free_ready(stale);
            }
        }
        self.metrics.record_dropped(index as u64);
        if index > 0 {
            self.released.notify_all();
        }
        let entry = inner.ready.pop_front()?;
        inner.states[entry.id] = EntryState::Presenting;
        Some(entry.into_presented())
    }

    /// 显示完毕, 归还缓冲区 (Presenting -> Free)
    pub fn release(&self, frame: PresentedFrame) {
        let mut inner = self.inner.lock();
        match inner.states.get(frame.id) {
            Some(EntryState::Presenting) => {
                inner.states[frame.id] = EntryState::Free;
                inner.free.push((frame.id, frame.data));
                self.released.notify_one();
            }
            state => warn!("归还的帧 {} 状态异常: {:?}, 忽略", frame.id, state),
        }
    }

    /// 清空所有待显示帧 (seek 时调用), 返回释放的数量
    pub fn flush(&self) -> usize {
        let mut inner = self.inner.lock();
        let count = inner.ready.len();
        while let Some(entry) = inner.ready.pop_front() {
            inner.free_ready(entry);
        }
        self.released.notify_all();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(ceiling: usize, policy: AcquirePolicy) -> FramePool {
        FramePool::new(ceiling, policy, Arc::new(SyncMetrics::new()))
    }

    fn publish(pool: &FramePool, pts: f64) {
        let slot = pool.acquire().expect("应能获取条目");
        pool.publish(slot, pts);
    }

    #[test]
    fn test_条目数不超过上限() {
        let pool = pool(3, AcquirePolicy::Grow);
        for i in 0..10 {
            publish(&pool, f64::from(i));
            assert!(pool.entry_count() <= 3);
        }
        // 最旧的帧被复用
        assert_eq!(pool.ready_pts(), vec![7.0, 8.0, 9.0]);
        assert_eq!(pool.metrics.snapshot().video_dropped, 7);
    }

    #[test]
    fn test_显示中的条目不被复用() {
        let pool = pool(2, AcquirePolicy::Grow);
        publish(&pool, 0.0);
        publish(&pool, 1.0);
        let shown = pool.take_next().unwrap();
        let other = pool.take_next().unwrap();
        assert_eq!(pool.state_counts(), [0, 0, 0, 2]);
        assert!(pool.acquire().is_none());

        pool.release(other);
        let slot = pool.acquire().unwrap();
        assert_ne!(slot.id(), shown.id());
        pool.discard(slot);
        pool.release(shown);
        assert_eq!(pool.state_counts(), [2, 0, 0, 0]);
    }

    #[test]
    fn test_取最新到期帧并释放更早的帧() {
        let pool = pool(8, AcquirePolicy::Grow);
        for pts in [1.0, 1.1, 1.2, 1.3] {
            publish(&pool, pts);
        }
        let frame = pool.take_latest_due(1.25).unwrap();
        assert!((frame.pts() - 1.2).abs() < 1e-9);
        assert_eq!(pool.ready_pts(), vec![1.3]);
        assert_eq!(pool.state_counts(), [2, 0, 1, 1]);
        pool.release(frame);

        assert!(pool.take_latest_due(1.29).is_none());
        assert_eq!(pool.ready_len(), 1);
    }

    #[test]
    fn test_flush() {
        let pool = pool(4, AcquirePolicy::Grow);
        publish(&pool, 0.0);
        publish(&pool, 0.1);
        let shown = pool.take_next().unwrap();
        assert_eq!(pool.flush(), 1);
        assert_eq!(pool.ready_len(), 0);
        // 正在显示的帧不受影响
        assert_eq!(pool.state_counts(), [1, 0, 0, 1]);
        pool.release(shown);
    }

    #[test]
    fn test_等待释放() {
        let pool = Arc::new(pool(1, AcquirePolicy::Wait(Duration::from_secs(2))));
        publish(&pool, 0.0);
        let shown = pool.take_next().unwrap();
        let releaser = {
            let pool = pool.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                pool.release(shown);
            })
        };
        let slot = pool.acquire();
        assert!(slot.is_some());
        releaser.join().unwrap();
    }

    #[test]
    fn test_等待超时后复用最旧帧() {
        let pool = pool(1, AcquirePolicy::Wait(Duration::from_millis(5)));
        publish(&pool, 0.0);
        let slot = pool.acquire().unwrap();
        assert_eq!(pool.ready_len(), 0);
        pool.publish(slot, 1.0);
        assert_eq!(pool.ready_pts(), vec![1.0]);
    }

    #[test]
    fn test_写入时上下翻转() {
        let pool = pool(1, AcquirePolicy::Grow);
        let payload = VideoPayload {
            data: vec![1, 1, 1, 2, 2, 2],
            width: 1,
            height: 2,
            pixel_format: PixelFormat::Rgb24,
        };
        let mut slot = pool.acquire().unwrap();
        slot.write_frame(&payload, true);
        pool.publish(slot, 0.0);
        let frame = pool.take_next().unwrap();
        assert_eq!(frame.data(), &[2, 2, 2, 1, 1, 1]);
        assert_eq!(frame.width(), 1);
        assert_eq!(frame.pixel_format(), PixelFormat::Rgb24);

        // 平面格式不翻转
        pool.release(frame);
        let mut slot = pool.acquire().unwrap();
        let yuv = VideoPayload {
            data: vec![1, 2, 3, 4, 5, 6],
            width: 2,
            height: 2,
            pixel_format: PixelFormat::Yuv420p,
        };
        slot.write_frame(&yuv, true);
        assert_eq!(slot.data_mut().as_slice(), &[1, 2, 3, 4, 5, 6]);
    }
}
