//! 引擎事件与呈现接口.

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;

use crate::frame::AudioFormat;
use crate::frame_pool::PresentedFrame;

/// 结束范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndScope {
    Video,
    Audio,
    /// 所有流都已结束
    All,
}

/// 引擎事件
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// 媒体已就绪, 携带时长 (秒)
    MediaReady { duration: Option<f64> },
    /// 播放到达结尾
    EndReached(EndScope),
    /// 错误 (流已停止或无可播放流)
    Error(String),
    /// 音频输出格式变化
    AudioFormatChanged(AudioFormat),
    /// seek 完成
    Seeked { position: f64 },
}

/// 视频呈现接口, 每次 tick 最多调用一次
pub trait VideoSink: Send {
    fn present(&mut self, frame: &PresentedFrame);
}

impl<F> VideoSink for F
where
    F: FnMut(&PresentedFrame) + Send,
{
    fn present(&mut self, frame: &PresentedFrame) {
        self(frame)
    }
}

/// 事件广播 (每个订阅者一个通道)
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Sender<EngineEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<EngineEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    /// 发送事件, 已断开的订阅者被移除
    pub fn emit(&self, event: EngineEvent) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}
