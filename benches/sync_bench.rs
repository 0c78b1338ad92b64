//! 同步引擎热路径基准测试.
//!
//! 覆盖环形缓冲区读写、帧池流转、节奏判断与到期帧选择.

use std::sync::Arc;
use std::time::Duration;

use avsync::engine::pacing::select_latest_due;
use avsync::engine::{
    AcquirePolicy, AudioFormat, AudioPull, AudioRing, FramePool, OverrunPolicy,
    PacingThresholds, RingBuffer, SyncMetrics,
};
use criterion::{Criterion, black_box, criterion_group, criterion_main};

fn bench_ring_write_read(c: &mut Criterion) {
    c.bench_function("ring_write_read_1024_f32", |b| {
        let mut ring = RingBuffer::<f32>::new(48000 * 2);
        let input: Vec<f32> = (0..1024).map(|i| (i as f32 * 0.01).sin()).collect();
        let mut output = vec![0.0f32; 1024];
        b.iter(|| {
            ring.write(black_box(&input));
            ring.read(&mut output);
            black_box(&output);
        });
    });

    c.bench_function("ring_overwrite_4096_f32", |b| {
        let mut ring = RingBuffer::<f32>::with_policy(2048, OverrunPolicy::Overwrite);
        let input = vec![0.5f32; 4096];
        b.iter(|| {
            ring.write(black_box(&input));
        });
    });
}

fn bench_audio_pull(c: &mut Criterion) {
    c.bench_function("audio_ring_fill_480x2", |b| {
        let ring = AudioRing::new(
            AudioFormat::new(48000, 2),
            1.0,
            0.0,
            Duration::from_micros(500),
            Arc::new(SyncMetrics::new()),
        );
        ring.set_paused(false);
        ring.set_volume(0.8);
        let block = vec![0.25f32; 960];
        let mut dest = vec![0.0f32; 960];
        b.iter(|| {
            ring.write_some(&block);
            ring.fill_audio_buffer(black_box(&mut dest));
        });
    });
}

fn bench_frame_pool_cycle(c: &mut Criterion) {
    c.bench_function("frame_pool_cycle_640x360_rgba", |b| {
        let pool = FramePool::new(32, AcquirePolicy::Grow, Arc::new(SyncMetrics::new()));
        let frame_bytes = 640 * 360 * 4;
        let mut pts = 0.0f64;
        b.iter(|| {
            if let Some(mut slot) = pool.acquire() {
                slot.data_mut().resize(frame_bytes, 0x80);
                pool.publish(slot, pts);
            }
            if let Some(frame) = pool.take_latest_due(pts) {
                pool.release(frame);
            }
            pts += 1.0 / 30.0;
        });
    });
}

fn bench_pacing(c: &mut Criterion) {
    c.bench_function("pacing_decide_1000", |b| {
        let thresholds = PacingThresholds::new(0.5, 0.15);
        b.iter(|| {
            for i in 0..1000 {
                let pts = i as f64 * 0.001;
                black_box(thresholds.decide(black_box(0.5), pts));
            }
        });
    });

    c.bench_function("select_latest_due_32", |b| {
        let ready: Vec<f64> = (0..32).map(|i| i as f64 / 30.0).collect();
        b.iter(|| black_box(select_latest_due(black_box(&ready), 0.5)));
    });
}

criterion_group!(
    benches,
    bench_ring_write_read,
    bench_audio_pull,
    bench_frame_pool_cycle,
    bench_pacing
);
criterion_main!(benches);
