//! 环形缓冲区.
//!
//! [`RingBuffer`] 是固定容量的循环缓冲区, 读写游标单调递增,
//! 槽位 = 游标 % 容量. 本身不加锁, 由 [`AudioRing`] 包一层互斥锁后
//! 在解码线程与音频回调之间共享.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::frame::AudioFormat;
use crate::metrics::SyncMetrics;

/// 写满时的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverrunPolicy {
    /// 丢弃放不下的新数据
    #[default]
    Reject,
    /// 覆盖最旧的未读数据, 读游标随之前移
    Overwrite,
}

/// 固定容量的环形缓冲区
///
/// 不变量: `read <= write` 且 `write - read <= capacity`.
#[derive(Debug)]
pub struct RingBuffer<T> {
    buffer: Vec<T>,
    write_cursor: u64,
    read_cursor: u64,
    policy: OverrunPolicy,
}

impl<T: Copy + Default> RingBuffer<T> {
    /// 创建指定容量的缓冲区 (容量至少为 1)
    pub fn new(capacity: usize) -> Self {
        Self::with_policy(capacity, OverrunPolicy::Reject)
    }

    pub fn with_policy(capacity: usize, policy: OverrunPolicy) -> Self {
        Self {
            buffer: vec![T::default(); capacity.max(1)],
            write_cursor: 0,
            read_cursor: 0,
            policy,
        }
    }

    /// 创建缓冲区并预写 `lead` 个默认值, 形成初始播放延迟
    pub fn with_lead(capacity: usize, lead: usize) -> Self {
        let mut ring = Self::new(capacity);
        ring.apply_lead(lead);
        ring
    }

    fn apply_lead(&mut self, lead: usize) {
        let lead = lead.min(self.capacity());
        let start = self.read_cursor;
        self.write_cursor = start + lead as u64;
        // reset 后槽位里可能残留旧数据
        for i in 0..lead as u64 {
            let slot = self.slot(start + i);
            self.buffer[slot] = T::default();
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn policy(&self) -> OverrunPolicy {
        self.policy
    }

    /// 可读元素数
    pub fn available(&self) -> usize {
        (self.write_cursor - self.read_cursor) as usize
    }

    /// 剩余可写空间
    pub fn available_capacity(&self) -> usize {
        self.capacity() - self.available()
    }

    pub fn write_cursor(&self) -> u64 {
        self.write_cursor
    }

    pub fn read_cursor(&self) -> u64 {
        self.read_cursor
    }

    fn slot(&self, cursor: u64) -> usize {
        (cursor % self.capacity() as u64) as usize
    }

    /// 写入数据, 返回实际写入的元素数
    ///
    /// `Reject` 策略下最多写入 `available_capacity()` 个, 其余丢弃;
    /// `Overwrite` 策略下全部写入, 最旧的未读数据被覆盖.
    pub fn write(&mut self, span: &[T]) -> usize {
        let capacity = self.capacity();
        let (data, written) = match self.policy {
            OverrunPolicy::Reject => {
                let n = span.len().min(self.available_capacity());
                (&span[..n], n)
            }
            OverrunPolicy::Overwrite => {
                // 超过容量的部分只保留最新的 capacity 个
                let skip = span.len().saturating_sub(capacity);
                self.write_cursor += skip as u64;
                (&span[skip..], span.len())
            }
        };
        self.copy_in(data);
        self.write_cursor += data.len() as u64;
        if self.write_cursor - self.read_cursor > capacity as u64 {
            self.read_cursor = self.write_cursor - capacity as u64;
        }
        written
    }

    fn copy_in(&mut self, data: &[T]) {
        if data.is_empty() {
            return;
        }
        let start = self.slot(self.write_cursor);
        let first = data.len().min(self.capacity() - start);
        self.buffer[start..start + first].copy_from_slice(&data[..first]);
        let rest = data.len() - first;
        self.buffer[..rest].copy_from_slice(&data[first..]);
    }

    /// 读取到 `dest`, 返回有效数据个数
    ///
    /// 不足部分填默认值 (静音), 读游标总是前进 `dest.len()`.
    /// 欠载时写游标跟进到读游标, 静音视为已消费.
    pub fn read(&mut self, dest: &mut [T]) -> usize {
        let filled = dest.len().min(self.available());
        if filled > 0 {
            let start = self.slot(self.read_cursor);
            let first = filled.min(self.capacity() - start);
            dest[..first].copy_from_slice(&self.buffer[start..start + first]);
            dest[first..filled].copy_from_slice(&self.buffer[..filled - first]);
        }
        dest[filled..].fill(T::default());
        self.read_cursor += dest.len() as u64;
        if self.read_cursor > self.write_cursor {
            self.write_cursor = self.read_cursor;
        }
        filled
    }

    /// 游标归零
    pub fn reset(&mut self) {
        self.write_cursor = 0;
        self.read_cursor = 0;
    }
}

/// 音频拉取接口 (音频输出设备回调调用)
pub trait AudioPull: Send + Sync {
    /// 填充 `dest` (F32 交错), 返回写入的采样数
    ///
    /// 不阻塞; 数据不足时以静音补齐, 返回值总是 `dest.len()`.
    fn fill_audio_buffer(&self, dest: &mut [f32]) -> usize;
}

struct RingState {
    ring: RingBuffer<f32>,
    format: AudioFormat,
}

struct AudioRingShared {
    state: Mutex<RingState>,
    delay_seconds: f64,
    lead_seconds: f64,
    lock_timeout: Duration,
    paused: AtomicBool,
    /// f32 位模式
    volume: AtomicU32,
    metrics: Arc<SyncMetrics>,
}

/// 解码线程与音频回调共享的 PCM 环形缓冲区
#[derive(Clone)]
pub struct AudioRing {
    shared: Arc<AudioRingShared>,
}

impl AudioRing {
    /// 按音频格式创建, 容量 = 采样率 × 声道数 × `delay_seconds`
    pub fn new(
        format: AudioFormat,
        delay_seconds: f64,
        lead_seconds: f64,
        lock_timeout: Duration,
        metrics: Arc<SyncMetrics>,
    ) -> Self {
        let ring = build_ring(format, delay_seconds, lead_seconds);
        Self {
            shared: Arc::new(AudioRingShared {
                state: Mutex::new(RingState { ring, format }),
                delay_seconds,
                lead_seconds,
                lock_timeout,
                paused: AtomicBool::new(true),
                volume: AtomicU32::new(1.0f32.to_bits()),
                metrics,
            }),
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.shared.state.lock().format
    }

    pub fn capacity(&self) -> usize {
        self.shared.state.lock().ring.capacity()
    }

    pub fn available(&self) -> usize {
        self.shared.state.lock().ring.available()
    }

    pub fn available_capacity(&self) -> usize {
        self.shared.state.lock().ring.available_capacity()
    }

    /// 写入 F32 交错采样, 返回实际写入数 (解码线程调用, 可阻塞)
    pub fn write(&self, samples: &[f32]) -> usize {
        let written = self.shared.state.lock().ring.write(samples);
        if written < samples.len() {
            self.shared
                .metrics
                .record_audio_overrun((samples.len() - written) as u64);
        }
        written
    }

    /// 写入放得下的部分, 余下的留给调用方稍后重试 (不计入溢出)
    pub fn write_some(&self, samples: &[f32]) -> usize {
        let mut state = self.shared.state.lock();
        let n = samples.len().min(state.ring.available_capacity());
        state.ring.write(&samples[..n])
    }

    /// 清空缓冲区 (seek 时调用, 调用前解码线程必须已停止)
    pub fn reset(&self) {
        let mut state = self.shared.state.lock();
        let lead = state.format.samples_for(self.shared.lead_seconds);
        state.ring.reset();
        state.ring.apply_lead(lead);
    }

    /// 按新格式重建缓冲区, 未播放的数据丢弃
    pub fn recreate(&self, format: AudioFormat) {
        let mut state = self.shared.state.lock();
        if state.format == format {
            return;
        }
        debug!(
            "音频格式变化: {}Hz/{}ch -> {}Hz/{}ch, 重建环形缓冲区",
            state.format.sample_rate, state.format.channels, format.sample_rate, format.channels
        );
        state.ring = build_ring(format, self.shared.delay_seconds, self.shared.lead_seconds);
        state.format = format;
    }

    /// 暂停时回调只输出静音, 不消费数据
    pub fn set_paused(&self, paused: bool) {
        self.shared.paused.store(paused, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// 设置音量, 钳制到 [0, 1]
    pub fn set_volume(&self, volume: f32) {
        let volume = if volume.is_nan() { 0.0 } else { volume.clamp(0.0, 1.0) };
        self.shared.volume.store(volume.to_bits(), Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.shared.volume.load(Ordering::Relaxed))
    }
}

impl AudioPull for AudioRing {
    fn fill_audio_buffer(&self, dest: &mut [f32]) -> usize {
        if self.is_paused() {
            dest.fill(0.0);
            return dest.len();
        }
        let Some(mut state) = self.shared.state.try_lock_for(self.shared.lock_timeout) else {
            dest.fill(0.0);
            self.shared.metrics.record_audio_lock_miss();
            return dest.len();
        };
        let filled = state.ring.read(dest);
        drop(state);

        if filled < dest.len() {
            self.shared
                .metrics
                .record_audio_underrun((dest.len() - filled) as u64);
        }
        let volume = self.volume();
        if volume < 1.0 {
            for sample in &mut dest[..filled] {
                *sample *= volume;
            }
        }
        self.shared.metrics.record_audio_played(filled as u64);
        dest.len()
    }
}

fn build_ring(format: AudioFormat, delay_seconds: f64, lead_seconds: f64) -> RingBuffer<f32> {
    let capacity = format.samples_for(delay_seconds).max(1);
    let lead = format.samples_for(lead_seconds);
    if lead >= capacity {
        warn!("音频引导时长 {lead_seconds}s 不小于缓冲区时长 {delay_seconds}s, 忽略引导");
        return RingBuffer::new(capacity);
    }
    RingBuffer::with_lead(capacity, lead)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(format: AudioFormat) -> AudioRing {
        AudioRing::new(
            format,
            1.0,
            0.0,
            Duration::from_micros(500),
            Arc::new(SyncMetrics::new()),
        )
    }

    #[test]
    fn test_空读返回静音() {
        let mut rb: RingBuffer<f32> = RingBuffer::new(8);
        let mut dest = [1.0f32; 4];
        assert_eq!(rb.read(&mut dest), 0);
        assert_eq!(dest, [0.0; 4]);
        assert_eq!(rb.read_cursor(), 4);
        assert!(rb.read_cursor() <= rb.write_cursor());
    }

    #[test]
    fn test_写满拒绝新数据() {
        let mut rb: RingBuffer<i32> = RingBuffer::new(4);
        assert_eq!(rb.write(&[1, 2, 3]), 3);
        assert_eq!(rb.write(&[4, 5, 6]), 1);
        assert_eq!(rb.available(), 4);
        let mut dest = [0; 4];
        assert_eq!(rb.read(&mut dest), 4);
        assert_eq!(dest, [1, 2, 3, 4]);
    }

    #[test]
    fn test_覆盖策略保留最新数据() {
        let mut rb: RingBuffer<i32> = RingBuffer::with_policy(4, OverrunPolicy::Overwrite);
        rb.write(&[1, 2, 3]);
        assert_eq!(rb.write(&[4, 5, 6]), 3);
        assert_eq!(rb.available(), 4);
        let mut dest = [0; 4];
        rb.read(&mut dest);
        assert_eq!(dest, [3, 4, 5, 6]);

        assert_eq!(rb.write(&[7, 8, 9, 10, 11, 12]), 6);
        rb.read(&mut dest);
        assert_eq!(dest, [9, 10, 11, 12]);
    }

    #[test]
    fn test_回绕读写() {
        let mut rb: RingBuffer<i32> = RingBuffer::new(5);
        let mut dest = [0; 3];
        for round in 0..10 {
            let base = round * 3;
            assert_eq!(rb.write(&[base, base + 1, base + 2]), 3);
            assert_eq!(rb.read(&mut dest), 3);
            assert_eq!(dest, [base, base + 1, base + 2]);
        }
        assert_eq!(rb.write_cursor(), 30);
    }

    #[test]
    fn test_游标不变量() {
        let mut rb: RingBuffer<i32> = RingBuffer::new(7);
        let mut dest = vec![0; 5];
        for step in 0..50usize {
            let span: Vec<i32> = (0..(step % 9) as i32).collect();
            rb.write(&span);
            assert!(rb.read_cursor() <= rb.write_cursor());
            assert!(rb.write_cursor() - rb.read_cursor() <= rb.capacity() as u64);
            if step % 2 == 0 {
                rb.read(&mut dest);
                assert!(rb.read_cursor() <= rb.write_cursor());
            }
        }
    }

    #[test]
    fn test_欠载部分填充() {
        let mut rb: RingBuffer<f32> = RingBuffer::new(8);
        rb.write(&[0.5, 0.5]);
        let mut dest = [1.0f32; 4];
        assert_eq!(rb.read(&mut dest), 2);
        assert_eq!(dest, [0.5, 0.5, 0.0, 0.0]);
        // 静音视为已消费, 之后写入的数据紧接其后
        rb.write(&[0.25]);
        assert_eq!(rb.available(), 1);
    }

    #[test]
    fn test_引导静音() {
        let mut rb: RingBuffer<f32> = RingBuffer::with_lead(8, 3);
        assert_eq!(rb.available(), 3);
        rb.write(&[1.0]);
        let mut dest = [9.0f32; 4];
        assert_eq!(rb.read(&mut dest), 4);
        assert_eq!(dest, [0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_饥饿时输出静音不阻塞() {
        let audio = ring(AudioFormat::new(48000, 2));
        audio.set_paused(false);
        let mut dest = vec![1.0f32; 512];
        assert_eq!(audio.fill_audio_buffer(&mut dest), 512);
        assert!(dest.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_暂停时不消费() {
        let audio = ring(AudioFormat::new(8000, 1));
        audio.write(&[0.5; 16]);
        let mut dest = [1.0f32; 8];
        audio.fill_audio_buffer(&mut dest);
        assert_eq!(dest, [0.0; 8]);
        assert_eq!(audio.available(), 16);

        audio.set_paused(false);
        audio.fill_audio_buffer(&mut dest);
        assert_eq!(dest, [0.5; 8]);
        assert_eq!(audio.available(), 8);
    }

    #[test]
    fn test_锁被占用时返回静音() {
        let audio = ring(AudioFormat::new(8000, 1));
        audio.set_paused(false);
        audio.write(&[0.5; 16]);
        let guard = audio.shared.state.lock();
        let mut dest = [1.0f32; 8];
        assert_eq!(audio.fill_audio_buffer(&mut dest), 8);
        assert_eq!(dest, [0.0; 8]);
        drop(guard);
        assert_eq!(audio.shared.metrics.snapshot().audio_lock_misses, 1);
    }

    #[test]
    fn test_音量() {
        let audio = ring(AudioFormat::new(8000, 1));
        audio.set_paused(false);
        audio.set_volume(2.0);
        assert_eq!(audio.volume(), 1.0);
        audio.set_volume(0.5);
        audio.write(&[0.8; 4]);
        let mut dest = [0.0f32; 4];
        audio.fill_audio_buffer(&mut dest);
        assert!(dest.iter().all(|s| (*s - 0.4).abs() < 1e-6));
    }

    #[test]
    fn test_格式变化重建() {
        let audio = ring(AudioFormat::new(48000, 2));
        assert_eq!(audio.capacity(), 96000);
        audio.write(&[0.1; 100]);
        audio.recreate(AudioFormat::new(44100, 1));
        assert_eq!(audio.capacity(), 44100);
        assert_eq!(audio.available(), 0);
        assert_eq!(audio.format(), AudioFormat::new(44100, 1));
    }
}
