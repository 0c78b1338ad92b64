//! # avsync-play
//!
//! 用合成测试流实时驱动同步引擎.
//!
//! - 主线程约 60Hz 调用 `tick`, 相当于显示刷新
//! - 独立线程模拟音频设备, 每 10ms 拉取一块 PCM
//! - 可在指定时刻发起一次 seek
//! - 退出时以 JSON 输出统计快照

mod logging;

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use avsync_core::Rational;
use avsync_engine::{
    AudioPull, AvSyncEngine, EndScope, EngineEvent, MediaSource, PresentedFrame, SyncConfig,
    SyntheticStream,
};
use clap::Parser;
use log::{debug, info, warn};

/// 显示刷新间隔
const TICK_INTERVAL: Duration = Duration::from_micros(16_667);

/// 音频设备每次拉取的时长
const AUDIO_BLOCK: Duration = Duration::from_millis(10);

/// avsync 演示播放器
#[derive(Parser, Debug)]
#[command(name = "avsync-play", about = "用合成测试流演示音视频同步引擎")]
struct Args {
    /// 测试流时长 (秒)
    #[arg(long, default_value_t = 10.0)]
    duration: f64,

    /// 视频帧率
    #[arg(long, default_value_t = 30)]
    fps: i32,

    /// 视频尺寸, 形如 320x240
    #[arg(long, default_value = "320x240")]
    size: String,

    /// 音频采样率
    #[arg(long, default_value_t = 48000)]
    sample_rate: u32,

    /// 音频声道数
    #[arg(long, default_value_t = 2)]
    channels: u16,

    /// 在播放到该时刻 (秒) 时发起 seek
    #[arg(long, requires = "seek_to")]
    seek_at: Option<f64>,

    /// seek 目标 (秒)
    #[arg(long, requires = "seek_at")]
    seek_to: Option<f64>,

    /// 引擎配置文件 (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// 音量 (0-100)
    #[arg(long)]
    volume: Option<u32>,

    #[arg(long = "novideo", help = "禁用视频流")]
    no_video: bool,

    #[arg(long = "noaudio", help = "禁用音频流")]
    no_audio: bool,

    /// 不写日志文件
    #[arg(long)]
    no_log_file: bool,

    /// 日志详细程度 (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_size(text: &str) -> anyhow::Result<(u32, u32)> {
    let (w, h) = text
        .split_once(['x', 'X'])
        .with_context(|| format!("无效的尺寸: {text}"))?;
    let width: u32 = w.trim().parse().with_context(|| format!("无效的宽度: {w}"))?;
    let height: u32 = h.trim().parse().with_context(|| format!("无效的高度: {h}"))?;
    if width == 0 || height == 0 {
        bail!("尺寸不能为 0: {text}");
    }
    Ok((width, height))
}

fn load_config(args: &Args) -> anyhow::Result<SyncConfig> {
    let mut config = match &args.config {
        Some(path) => SyncConfig::from_json_file(path)
            .with_context(|| format!("读取配置文件 {} 失败", path.display()))?,
        None => SyncConfig::default(),
    };
    if let Some(volume) = args.volume {
        config.volume = volume.min(100) as f32 / 100.0;
    }
    Ok(config)
}

fn build_source(args: &Args) -> anyhow::Result<MediaSource> {
    if !(args.duration.is_finite() && args.duration > 0.0) {
        bail!("时长必须为正数: {}", args.duration);
    }
    let mut source = MediaSource::new();
    if !args.no_video {
        let (width, height) = parse_size(&args.size)?;
        if args.fps <= 0 {
            bail!("帧率必须为正数: {}", args.fps);
        }
        let fps = Rational::new(args.fps, 1);
        source = source.with_video(SyntheticStream::video(width, height, fps, args.duration));
    }
    if !args.no_audio {
        source = source.with_audio(
            SyntheticStream::audio(args.sample_rate, args.channels, args.duration).with_index(1),
        );
    }
    Ok(source)
}

/// 模拟音频设备: 按真实时间节奏拉取 PCM
fn spawn_audio_device(
    engine: &AvSyncEngine,
    running: Arc<AtomicBool>,
    pulled: Arc<AtomicU64>,
) -> anyhow::Result<thread::JoinHandle<()>> {
    let output = engine.audio_output();
    thread::Builder::new()
        .name("avsync-audio-device".into())
        .spawn(move || {
            let mut block = Vec::new();
            let mut next = Instant::now();
            while running.load(Ordering::Acquire) {
                let format = output.format();
                block.resize(format.samples_for(AUDIO_BLOCK.as_secs_f64()), 0.0);
                let n = output.fill_audio_buffer(&mut block);
                pulled.fetch_add(n as u64, Ordering::Relaxed);
                next += AUDIO_BLOCK;
                let now = Instant::now();
                if next > now {
                    thread::sleep(next - now);
                } else {
                    next = now;
                }
            }
        })
        .context("启动音频设备线程失败")
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    logging::init("avsync-play", args.verbose, args.no_log_file)?;

    let config = load_config(&args)?;
    let source = build_source(&args)?;
    let mut engine = AvSyncEngine::new(config).context("创建引擎失败")?;
    let events = engine.subscribe();

    let presented = Arc::new(AtomicU64::new(0));
    let counter = presented.clone();
    engine.set_video_sink(move |frame: &PresentedFrame| {
        counter.fetch_add(1, Ordering::Relaxed);
        log::trace!("显示帧 #{} pts={:.3}", frame.id(), frame.pts());
    });

    let running = Arc::new(AtomicBool::new(true));
    let pulled = Arc::new(AtomicU64::new(0));
    let audio = spawn_audio_device(&engine, running.clone(), pulled.clone())?;

    let started = Instant::now();
    engine.play(source).context("开始播放失败")?;
    info!(
        "开始播放合成流: 时长 {:?}s, 视频 {}, 音频 {}",
        engine.length(),
        !args.no_video,
        !args.no_audio
    );

    let mut seek_pending = args.seek_at.zip(args.seek_to);
    // 防止媒体从未结束时无限运行
    let deadline = started + Duration::from_secs_f64(args.duration * 2.0 + 5.0);
    let mut next_tick = Instant::now();
    let mut finished = false;
    while !finished {
        engine.tick(started.elapsed());

        for event in events.try_iter() {
            match event {
                EngineEvent::MediaReady { duration } => info!("媒体就绪, 时长 {duration:?}"),
                EngineEvent::AudioFormatChanged(format) => {
                    info!("音频格式变为 {}Hz/{}ch", format.sample_rate, format.channels)
                }
                EngineEvent::Seeked { position } => info!("seek 完成 -> {position:.3}s"),
                EngineEvent::EndReached(EndScope::All) => {
                    info!("全部流播放结束");
                    finished = true;
                }
                EngineEvent::EndReached(scope) => info!("{scope:?} 流播放结束"),
                EngineEvent::Error(message) => warn!("引擎错误: {message}"),
            }
        }

        if let Some((at, to)) = seek_pending {
            if engine.playback_time() >= at {
                info!("在 {:.3}s 发起 seek -> {to:.3}s", engine.playback_time());
                if let Err(e) = engine.seek(to) {
                    warn!("seek 失败: {e}");
                }
                seek_pending = None;
            }
        }

        if Instant::now() >= deadline {
            warn!("超过最长运行时间, 停止播放");
            break;
        }

        next_tick += TICK_INTERVAL;
        let now = Instant::now();
        if next_tick > now {
            thread::sleep(next_tick - now);
        } else {
            debug!("tick 落后 {:?}", now - next_tick);
            next_tick = now;
        }
    }

    engine.stop();
    running.store(false, Ordering::Release);
    if audio.join().is_err() {
        warn!("音频设备线程异常退出");
    }

    info!(
        "共显示 {} 帧, 音频设备拉取 {} 个采样",
        presented.load(Ordering::Relaxed),
        pulled.load(Ordering::Relaxed)
    );
    let snapshot = engine.metrics();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}
