//! Hot-path benchmarks: resampling, spectral transform, CPU reconstruction.
//!
//! Run with: cargo bench --bench reconstruction_bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use rust_oct::angle::RotaryAverager;
use rust_oct::config::ReconstructionConfig;
use rust_oct::data::ReconstructedFrame;
use rust_oct::device::DeviceGeometry;
use rust_oct::dsp::{RescaleTable, Resampler, SpectralTransform};
use rust_oct::reconstruction::{CpuBackend, ReconstructionParams, ReconstructionPipeline, SpectralBatch};

fn chirped_positions(len: usize) -> Vec<f64> {
    // Mild quadratic stretch, like a real spectrometer calibration.
    (0..len)
        .map(|i| {
            let x = i as f64 / len as f64;
            (x + 0.05 * x * (1.0 - x)) * (len - 2) as f64
        })
        .collect()
}

fn record(len: usize) -> Vec<u16> {
    (0..len)
        .map(|i| (32_768.0 + 4_000.0 * (i as f32 * 0.37).sin()) as u16)
        .collect()
}

fn bench_resample(c: &mut Criterion) {
    let mut group = c.benchmark_group("resample");
    for len in [1024usize, 2048, 4096] {
        let resampler = Resampler::new(RescaleTable::from_positions(&chirped_positions(len)), 32_768.0);
        let input = record(len);
        let mut output = vec![0.0f32; len];
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::new("record", len), &len, |b, _| {
            b.iter(|| resampler.resample_record(black_box(&input), &mut output))
        });
    }
    group.finish();
}

fn bench_spectral(c: &mut Criterion) {
    let mut group = c.benchmark_group("spectral_transform");
    for len in [1024usize, 2048] {
        let mut transform = SpectralTransform::new(len, len / 4);
        let input: Vec<f32> = record(len).iter().map(|&s| f32::from(s) - 32_768.0).collect();
        let mut real = vec![0.0f32; len / 4];
        let mut imag = vec![0.0f32; len / 4];
        group.bench_with_input(BenchmarkId::new("record", len), &len, |b, _| {
            b.iter(|| transform.transform(black_box(&input), &mut real, &mut imag))
        });
    }
    group.finish();
}

fn bench_cpu_reconstruction(c: &mut Criterion) {
    let mut group = c.benchmark_group("cpu_reconstruction");
    group.measurement_time(Duration::from_secs(5));
    group.sample_size(20);

    for sector in [256u32, 512] {
        let geometry = DeviceGeometry::default();
        let config = ReconstructionConfig {
            sector_size: sector,
            ..ReconstructionConfig::default()
        };
        let params = ReconstructionParams::from_settings(&config, &geometry);
        let shape = params.shape();
        let mut pipeline = ReconstructionPipeline::new(Box::new(CpuBackend::new(shape)), params);
        let mut batch = SpectralBatch::new(shape.lines, shape.depth);
        for (i, value) in batch.real.iter_mut().enumerate() {
            *value = ((i % 97) as f32) * 50.0;
        }
        let mut frame = ReconstructedFrame::with_shape(shape);

        group.throughput(Throughput::Elements((sector * sector) as u64));
        group.bench_with_input(BenchmarkId::new("revolution", sector), &sector, |b, _| {
            b.iter(|| pipeline.reconstruct(black_box(&batch), &mut frame))
        });
    }
    group.finish();
}

fn bench_rotary_averager(c: &mut Criterion) {
    let mut averager = RotaryAverager::new(8, 1024.0);
    let mut position = 0.0f64;
    c.bench_function("rotary_averager_next_value", |b| {
        b.iter(|| {
            position = (position + 3.5) % 1024.0;
            averager.next_value(black_box(position))
        })
    });
}

criterion_group!(
    benches,
    bench_resample,
    bench_spectral,
    bench_cpu_reconstruction,
    bench_rotary_averager
);
criterion_main!(benches);
