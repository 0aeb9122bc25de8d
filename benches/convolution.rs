use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use rustverb::buffer::AudioBuffer;
use rustverb::engine::{Convolution, DEFAULT_SPIN_LIMIT, KernelSpectra, Response};
use rustverb::ir::SoundBuffer;

const BIN_SIZE: usize = 64;

pub fn engine_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("Convolution");

    for &len in &[4_096usize, 32_768, 131_072] {
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, &len| {
            let mut engine = create_engine(len);
            let src = AudioBuffer::new(1, BIN_SIZE);
            let mut dst = AudioBuffer::new(1, BIN_SIZE);

            // Warm the pipeline past the initial zero frames.
            for _ in 0..1024 {
                engine.process(&mut dst, &src, BIN_SIZE);
            }

            b.iter(|| {
                engine.process(black_box(&mut dst), black_box(&src), BIN_SIZE);
            });
        });
    }

    group.finish();
}

pub fn mac_loop_benchmark(c: &mut Criterion) {
    use rustverb::dsp;

    let n = 2048;
    let a: Vec<f32> = (0..n).map(|i| (i as f32 * 0.37).sin()).collect();
    let b_buf: Vec<f32> = (0..n).map(|i| (i as f32 * 0.11).cos()).collect();

    c.bench_function("MAC Loop", |b| {
        let mut acc = vec![0.0f32; n];
        b.iter(|| {
            dsp::cmac_hc(black_box(&mut acc), black_box(&a), black_box(&b_buf));
        });
    });
}

fn create_engine(ir_length: usize) -> Convolution {
    let response = Response::new(1, ir_length, BIN_SIZE, 8192).unwrap();
    let mut engine = Convolution::new(response, 0, false, DEFAULT_SPIN_LIMIT).unwrap();

    let ir: Vec<f32> = (0..ir_length)
        .map(|i| (i as f32 * 0.013).sin() / (i + 1) as f32)
        .collect();
    let kernel =
        KernelSpectra::compute(engine.response(), &SoundBuffer::new(ir, 1), 0, 0).unwrap();

    let mut retired = Vec::new();
    let _ = engine.set_kernel(&kernel, None, &mut retired);

    engine
}

criterion_group!(benches, engine_benchmarks, mac_loop_benchmark);
criterion_main!(benches);
