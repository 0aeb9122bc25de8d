use std::sync::Arc;

use anyhow::Result;
use rustverb::buffer::AudioBuffer;
use rustverb::engine::{Convolution, DEFAULT_SPIN_LIMIT, KernelSpectra, Response};
use rustverb::ir::SoundBuffer;

/// Deterministic noise in [-0.5, 0.5) so failures reproduce.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> f32 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        ((self.0 >> 33) as f32 / (1u64 << 31) as f32) - 0.5
    }
}

fn noise(seed: u64, len: usize, scale: f32) -> Vec<f32> {
    let mut lcg = Lcg(seed);
    (0..len).map(|_| lcg.next() * scale).collect()
}

/// Naive O(N*L) reference convolution, accumulated in f64.
fn direct_convolve(x: &[f32], h: &[f32], out_len: usize) -> Vec<f32> {
    let mut y = vec![0.0f32; out_len];
    for (n, out) in y.iter_mut().enumerate() {
        let mut acc = 0.0f64;
        let k_max = h.len().min(n + 1);
        for k in 0..k_max {
            acc += f64::from(h[k]) * f64::from(*x.get(n - k).unwrap_or(&0.0));
        }
        *out = acc as f32;
    }
    y
}

fn interleave(channels: &[Vec<f32>]) -> SoundBuffer {
    let frames = channels[0].len();
    let mut data = Vec::with_capacity(frames * channels.len());
    for frame in 0..frames {
        for ch in channels {
            data.push(ch[frame]);
        }
    }
    SoundBuffer::new(data, channels.len())
}

fn install_kernel(engine: &mut Convolution, ir: &SoundBuffer) -> Result<()> {
    let kernel = KernelSpectra::compute(engine.response(), ir, 0, 0)?;
    let num_rt = engine.num_rt_convolvers();
    let worker_part = (num_rt < kernel.num_modules()).then(|| {
        (num_rt..kernel.num_modules())
            .map(|i| Arc::clone(kernel.module(i)))
            .collect()
    });

    let mut retired = Vec::new();
    assert!(engine.set_kernel(&kernel, worker_part, &mut retired).is_none());
    Ok(())
}

/// Stream `input` through the engine block by block and collect at least
/// `out_len` output samples per channel.
fn run_engine(engine: &mut Convolution, input: &[Vec<f32>], out_len: usize) -> Vec<Vec<f32>> {
    let channels = engine.num_channels();
    let bin = engine.bin_size();
    let mut src = AudioBuffer::new(channels, bin);
    let mut dst = AudioBuffer::new(channels, bin);
    let mut out = vec![Vec::with_capacity(out_len); channels];

    let blocks = out_len.div_ceil(bin);
    for b in 0..blocks {
        src.clear();
        let start = b * bin;
        for ch in 0..channels {
            if start < input[ch].len() {
                let n = bin.min(input[ch].len() - start);
                src.channel_mut(ch)[..n].copy_from_slice(&input[ch][start..start + n]);
            }
        }

        engine.process(&mut dst, &src, bin);
        for ch in 0..channels {
            out[ch].extend_from_slice(dst.channel(ch));
        }
    }
    out
}

fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .fold(0.0f32, |m, (x, y)| m.max((x - y).abs()))
}

#[test]
fn unit_impulse_comes_out_at_the_engine_latency() -> Result<()> {
    // Smallest configuration: one module, one partition.
    let response = Response::new(1, 64, 64, 64)?;
    let mut engine = Convolution::new(response, 0, true, DEFAULT_SPIN_LIMIT)?;

    let mut h = vec![0.0f32; 64];
    h[0] = 1.0;
    install_kernel(&mut engine, &SoundBuffer::new(h, 1))?;

    let mut x = vec![0.0f32; 256];
    x[0] = 1.0;
    let out = run_engine(&mut engine, &[x], 256);

    let latency = engine.latency();
    assert_eq!(latency, 64);
    for (i, &y) in out[0].iter().enumerate() {
        if i == latency {
            assert!((y - 1.0).abs() < 1e-5, "expected unit peak at {i}, got {y}");
        } else {
            assert!(y.abs() < 1e-5, "unexpected energy at {i}: {y}");
        }
    }
    Ok(())
}

#[test]
fn step_response_ramps_and_plateaus() -> Result<()> {
    // Two partition sizes; all-ones kernel against an all-ones input
    // integrates to a ramp, a plateau, then a symmetric decay.
    let response = Response::new(1, 192, 64, 128)?;
    let mut engine = Convolution::new(response, 0, true, DEFAULT_SPIN_LIMIT)?;

    let h = vec![1.0f32; 192];
    install_kernel(&mut engine, &SoundBuffer::new(h.clone(), 1))?;

    let x = vec![1.0f32; 256];
    let latency = engine.latency();
    let out_len = 512 + latency;
    let out = run_engine(&mut engine, &[x.clone()], out_len);

    let reference = direct_convolve(&x, &h, 512);
    let diff = max_abs_diff(&out[0][latency..latency + 512], &reference);
    assert!(diff < 1e-3, "max abs error {diff}");

    // Spot-check the shape.
    assert!((out[0][latency] - 1.0).abs() < 1e-3);
    assert!((out[0][latency + 191] - 192.0).abs() < 1e-2);
    assert!((out[0][latency + 230] - 192.0).abs() < 1e-2);
    Ok(())
}

#[test]
fn stereo_engine_matches_direct_convolution() -> Result<()> {
    let response = Response::new(2, 2048, 64, 512)?;
    let mut engine = Convolution::new(response, 0, true, DEFAULT_SPIN_LIMIT)?;

    let h: Vec<Vec<f32>> = (0..2).map(|ch| noise(100 + ch, 2048, 0.1)).collect();
    install_kernel(&mut engine, &interleave(&h))?;

    let x: Vec<Vec<f32>> = (0..2).map(|ch| noise(200 + ch, 16_384, 0.1)).collect();

    let latency = engine.latency();
    let check = 16_384;
    let out = run_engine(&mut engine, &x, check + latency);

    for ch in 0..2 {
        let reference = direct_convolve(&x[ch], &h[ch], check);
        let diff = max_abs_diff(&out[ch][latency..latency + check], &reference);
        assert!(diff < 1e-4, "channel {ch}: max abs error {diff}");
    }
    Ok(())
}

#[test]
fn convolution_is_linear() -> Result<()> {
    let h = noise(7, 512, 0.2);
    let x1 = noise(8, 4096, 0.2);
    let x2 = noise(9, 4096, 0.2);

    let build = || -> Result<Convolution> {
        let response = Response::new(1, 512, 64, 128)?;
        Ok(Convolution::new(response, 0, true, DEFAULT_SPIN_LIMIT)?)
    };

    let ir = SoundBuffer::new(h, 1);
    let out_len = 4608;

    let mut e1 = build()?;
    install_kernel(&mut e1, &ir)?;
    let y1 = run_engine(&mut e1, &[x1.clone()], out_len);

    let mut e2 = build()?;
    install_kernel(&mut e2, &ir)?;
    let y2 = run_engine(&mut e2, &[x2.clone()], out_len);

    let mixed: Vec<f32> = x1
        .iter()
        .zip(&x2)
        .map(|(a, b)| 2.0 * a + 3.0 * b)
        .collect();
    let mut e3 = build()?;
    install_kernel(&mut e3, &ir)?;
    let y3 = run_engine(&mut e3, &[mixed], out_len);

    for i in 0..out_len {
        let expect = 2.0 * y1[0][i] + 3.0 * y2[0][i];
        assert!(
            (y3[0][i] - expect).abs() < 1e-4,
            "sample {i}: {} vs {expect}",
            y3[0][i]
        );
    }
    Ok(())
}

#[test]
fn zero_kernel_yields_silence() -> Result<()> {
    let response = Response::new(1, 1024, 64, 256)?;
    let mut engine = Convolution::new(response, 0, true, DEFAULT_SPIN_LIMIT)?;
    install_kernel(&mut engine, &SoundBuffer::new(vec![0.0f32; 1024], 1))?;

    let x = noise(3, 8192, 0.5);
    let out = run_engine(&mut engine, &[x], 8192);
    assert!(out[0].iter().all(|&y| y == 0.0));
    Ok(())
}

#[test]
fn worker_split_matches_the_offline_engine() -> Result<()> {
    // One module on the audio thread, three on the worker. The worker
    // path must produce the same signal the all-inline engine does.
    let h = noise(42, 4096, 0.1);
    let ir = SoundBuffer::new(h, 1);
    let blocks = 10_000usize;
    let x = noise(43, blocks * 64, 0.1);
    let out_len = blocks * 64;

    let offline = {
        let response = Response::new(1, 4096, 64, 512)?;
        let mut engine = Convolution::new(response, 0, false, DEFAULT_SPIN_LIMIT)?;
        assert!(!engine.has_worker());
        install_kernel(&mut engine, &ir)?;
        run_engine(&mut engine, &[x.clone()], out_len)
    };

    let threaded = {
        let response = Response::new(1, 4096, 64, 512)?;
        // Generous spin bound: a loaded test machine must not starve the
        // comparison into zero-filled blocks.
        let mut engine = Convolution::new(response, 1, true, 100_000_000)?;
        assert!(engine.has_worker());
        assert_eq!(engine.num_rt_convolvers(), 1);
        install_kernel(&mut engine, &ir)?;
        let out = run_engine(&mut engine, &[x.clone()], out_len);
        assert_eq!(engine.starvation_counter().load(std::sync::atomic::Ordering::Relaxed), 0);
        out
    };

    // Same computation, different summation order across the FIFO.
    let diff = max_abs_diff(&offline[0], &threaded[0]);
    assert!(diff < 1e-5, "worker and offline outputs diverge by {diff}");

    // And both match the direct reference over the head of the signal.
    let check = 20_000;
    let h_again = noise(42, 4096, 0.1);
    let reference = direct_convolve(&x, &h_again, check);
    let latency = 64;
    let diff = max_abs_diff(&offline[0][latency..latency + check], &reference);
    assert!(diff < 1e-4, "engine vs direct reference: {diff}");
    Ok(())
}

#[test]
fn short_final_blocks_flush_the_tail() -> Result<()> {
    // Input shorter than the partitioned length still produces the full
    // convolution tail as zeros stream in.
    let response = Response::new(1, 256, 64, 128)?;
    let mut engine = Convolution::new(response, 0, true, DEFAULT_SPIN_LIMIT)?;

    let h = noise(5, 256, 0.3);
    install_kernel(&mut engine, &SoundBuffer::new(h.clone(), 1))?;

    let x = noise(6, 100, 0.3); // not a multiple of the bin size
    let latency = engine.latency();
    let out_len = 512 + latency;
    let out = run_engine(&mut engine, &[x.clone()], out_len);

    let reference = direct_convolve(&x, &h, 512);
    let diff = max_abs_diff(&out[0][latency..latency + 512], &reference);
    assert!(diff < 1e-4, "max abs error {diff}");
    Ok(())
}
