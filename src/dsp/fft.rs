use std::sync::{Arc, LazyLock, Mutex};

use anyhow::{Result, anyhow};
use realfft::{ComplexToReal, RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex;

/// Largest supported plan log-size; partitions top out at `2^MAX_LOG_SIZE`.
pub const MAX_LOG_SIZE: usize = 16;

/// Process-wide plan cache, indexed by log-size. Populated lazily on the
/// control thread and never freed.
static PLAN_CACHE: LazyLock<Mutex<[Option<Arc<Fft>>; MAX_LOG_SIZE + 1]>> =
    LazyLock::new(|| Mutex::new(std::array::from_fn(|_| None)));

/// Real <-> half-complex transform pair for one partition size.
///
/// A plan of log-size `s` transforms `padded_size = 2 * 2^s` reals: one
/// partition of input plus its zero pad. The spectral side uses the
/// FFTW-style half-complex float layout (DC at 0, Nyquist at `N/2`, the
/// imaginary part of bin `k` at `N - k`), so spectra live in plain `f32`
/// buffers the MAC kernels can chew through.
///
/// The forward/backward pair is unnormalised; `norm()` is applied once at
/// IR-load time.
pub struct Fft {
    log_size: usize,
    size: usize,
    padded_size: usize,
    norm: f32,
    r2c: Arc<dyn RealToComplex<f32>>,
    c2r: Arc<dyn ComplexToReal<f32>>,
}

/// Caller-owned scratch for the complex leg of a transform, so shared
/// `Fft` instances stay immutable.
pub struct FftScratch {
    freq: Vec<Complex<f32>>,
    work: Vec<Complex<f32>>,
}

impl Fft {
    /// Fetch the shared plan for `log_size`, creating it on first use.
    ///
    /// Planning allocates; call this from the control thread (engine
    /// construction), never from the audio callback.
    pub fn get(log_size: usize) -> Result<Arc<Fft>> {
        if log_size > MAX_LOG_SIZE {
            return Err(anyhow!(
                "fft log size {log_size} exceeds maximum {MAX_LOG_SIZE}"
            ));
        }

        let mut cache = PLAN_CACHE.lock().expect("fft plan cache poisoned");
        if let Some(fft) = &cache[log_size] {
            return Ok(Arc::clone(fft));
        }

        let fft = Arc::new(Fft::new(log_size));
        cache[log_size] = Some(Arc::clone(&fft));
        Ok(fft)
    }

    fn new(log_size: usize) -> Self {
        let size = 1usize << log_size;
        let padded_size = size << 1;

        let mut planner = RealFftPlanner::<f32>::new();
        let r2c = planner.plan_fft_forward(padded_size);
        let c2r = planner.plan_fft_inverse(padded_size);

        Self {
            log_size,
            size,
            padded_size,
            norm: 1.0 / padded_size as f32,
            r2c,
            c2r,
        }
    }

    pub fn log_size(&self) -> usize {
        self.log_size
    }

    /// Partition size this plan serves (`2^log_size`).
    pub fn size(&self) -> usize {
        self.size
    }

    /// Transform length (`2 * size`): partition plus zero pad.
    pub fn padded_size(&self) -> usize {
        self.padded_size
    }

    /// `1 / padded_size`, the one-time scaling for a unity round trip.
    pub fn norm(&self) -> f32 {
        self.norm
    }

    pub fn make_scratch(&self) -> FftScratch {
        let complex_len = self.padded_size / 2 + 1;
        let work_len = self
            .r2c
            .get_scratch_len()
            .max(self.c2r.get_scratch_len());

        FftScratch {
            freq: vec![Complex::default(); complex_len],
            work: vec![Complex::default(); work_len],
        }
    }

    /// Forward transform in place: `io` holds `padded_size` reals on entry
    /// and the half-complex spectrum on exit.
    pub fn forward_hc(&self, io: &mut [f32], scratch: &mut FftScratch) {
        debug_assert_eq!(io.len(), self.padded_size);

        if self
            .r2c
            .process_with_scratch(io, &mut scratch.freq, &mut scratch.work)
            .is_err()
        {
            scratch.freq.fill(Complex::default());
        }
        pack_hc(io, &scratch.freq);
    }

    /// Backward transform in place: half-complex spectrum in, reals out.
    /// Unnormalised, like the forward side.
    pub fn backward_hc(&self, io: &mut [f32], scratch: &mut FftScratch) {
        debug_assert_eq!(io.len(), self.padded_size);

        unpack_hc(&mut scratch.freq, io);
        if self
            .c2r
            .process_with_scratch(&mut scratch.freq, io, &mut scratch.work)
            .is_err()
        {
            io.fill(0.0);
        }
    }
}

fn pack_hc(dst: &mut [f32], freq: &[Complex<f32>]) {
    let n = dst.len();
    let half = n >> 1;

    dst[0] = freq[0].re;
    dst[half] = freq[half].re;
    for k in 1..half {
        dst[k] = freq[k].re;
        dst[n - k] = freq[k].im;
    }
}

fn unpack_hc(freq: &mut [Complex<f32>], src: &[f32]) {
    let n = src.len();
    let half = n >> 1;

    // DC and Nyquist carry no imaginary part in the half-complex layout.
    freq[0] = Complex::new(src[0], 0.0);
    freq[half] = Complex::new(src[half], 0.0);
    for k in 1..half {
        freq[k] = Complex::new(src[k], src[n - k]);
    }
}

/// Re-group a half-complex spectrum for the SIMD MAC: each group of four
/// real coefficients is followed by its four imaginary partners, with DC
/// and Nyquist co-located in the first group.
///
/// `src.len()` must be a power of two >= 8.
pub fn shuffle_hc(dst: &mut [f32], src: &[f32]) {
    let n = src.len();
    debug_assert_eq!(dst.len(), n);
    debug_assert!(n >= 8 && n.is_power_of_two());

    let half = n >> 1;

    dst[0] = src[0];
    dst[1] = src[1];
    dst[2] = src[2];
    dst[3] = src[3];

    dst[4] = src[half];
    dst[5] = src[n - 1];
    dst[6] = src[n - 2];
    dst[7] = src[n - 3];

    let mut di = 8;
    let mut si = 4;
    while si < half {
        dst[di] = src[si];
        dst[di + 1] = src[si + 1];
        dst[di + 2] = src[si + 2];
        dst[di + 3] = src[si + 3];

        dst[di + 4] = src[n - si];
        dst[di + 5] = src[n - si - 1];
        dst[di + 6] = src[n - si - 2];
        dst[di + 7] = src[n - si - 3];

        di += 8;
        si += 4;
    }
}

/// Exact inverse of [`shuffle_hc`].
pub fn unshuffle_hc(dst: &mut [f32], src: &[f32]) {
    let n = src.len();
    debug_assert_eq!(dst.len(), n);
    debug_assert!(n >= 8 && n.is_power_of_two());

    let half = n >> 1;

    dst[0] = src[0];
    dst[1] = src[1];
    dst[2] = src[2];
    dst[3] = src[3];

    dst[half] = src[4];
    dst[n - 1] = src[5];
    dst[n - 2] = src[6];
    dst[n - 3] = src[7];

    let mut di = 4;
    let mut si = 8;
    while di < half {
        dst[di] = src[si];
        dst[di + 1] = src[si + 1];
        dst[di + 2] = src[si + 2];
        dst[di + 3] = src[si + 3];

        dst[n - di] = src[si + 4];
        dst[n - di - 1] = src[si + 5];
        dst[n - di - 2] = src[si + 6];
        dst[n - di - 3] = src[si + 7];

        di += 4;
        si += 8;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_cache_shares_instances() -> Result<()> {
        let a = Fft::get(6)?;
        let b = Fft::get(6)?;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.size(), 64);
        assert_eq!(a.padded_size(), 128);
        Ok(())
    }

    #[test]
    fn rejects_oversized_plan() {
        assert!(Fft::get(MAX_LOG_SIZE + 1).is_err());
    }

    #[test]
    fn forward_backward_round_trip() -> Result<()> {
        let fft = Fft::get(5)?;
        let mut scratch = fft.make_scratch();
        let n = fft.padded_size();

        let original: Vec<f32> = (0..n).map(|i| (i as f32 * 0.173).sin()).collect();
        let mut io = original.clone();

        fft.forward_hc(&mut io, &mut scratch);
        fft.backward_hc(&mut io, &mut scratch);

        for (x, y) in io.iter().zip(&original) {
            assert!((x * fft.norm() - y).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn impulse_has_flat_spectrum() -> Result<()> {
        let fft = Fft::get(4)?;
        let mut scratch = fft.make_scratch();
        let n = fft.padded_size();

        let mut io = vec![0.0f32; n];
        io[0] = 1.0;
        fft.forward_hc(&mut io, &mut scratch);

        // All real coefficients 1, all imaginary coefficients 0.
        for k in 0..=n / 2 {
            assert!((io[k] - 1.0).abs() < 1e-5, "re bin {k}");
        }
        for k in 1..n / 2 {
            assert!(io[n - k].abs() < 1e-5, "im bin {k}");
        }
        Ok(())
    }

    #[test]
    fn shuffle_round_trip_is_bit_exact() {
        for n in [8usize, 16, 64, 4096] {
            let src: Vec<f32> = (0..n).map(|i| (i as f32 * 12.9898).sin() * 43758.5453).collect();
            let mut shuffled = vec![0.0f32; n];
            let mut back = vec![0.0f32; n];

            shuffle_hc(&mut shuffled, &src);
            unshuffle_hc(&mut back, &shuffled);

            for (a, b) in src.iter().zip(&back) {
                assert_eq!(a.to_bits(), b.to_bits(), "n = {n}");
            }
        }
    }

    #[test]
    fn shuffle_groups_dc_and_nyquist() {
        let n = 16;
        let src: Vec<f32> = (0..n).map(|i| i as f32).collect();
        let mut dst = vec![0.0f32; n];
        shuffle_hc(&mut dst, &src);

        assert_eq!(dst[0], 0.0); // DC
        assert_eq!(dst[4], 8.0); // Nyquist
        assert_eq!(dst[5], 15.0); // im of bin 1
    }
}
