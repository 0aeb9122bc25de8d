pub mod fft;

/// Accumulate `src` into `dst` sample by sample.
#[inline]
pub fn mix(dst: &mut [f32], src: &[f32]) {
    debug_assert_eq!(dst.len(), src.len());

    #[cfg(target_arch = "x86_64")]
    unsafe {
        sse::mix(dst, src);
    }

    #[cfg(not(target_arch = "x86_64"))]
    mix_scalar(dst, src);
}

/// Complex multiply-accumulate over the shuffled half-complex layout.
///
/// Each 8-lane group holds four real parts followed by the four matching
/// imaginary parts. The first group co-locates DC (lane 0) and Nyquist
/// (lane 4); both are purely real, so their lanes are recomputed after the
/// vector pass as plain real products.
#[inline]
pub fn cmac_hc(dst: &mut [f32], a: &[f32], b: &[f32]) {
    debug_assert_eq!(dst.len(), a.len());
    debug_assert_eq!(dst.len(), b.len());
    debug_assert!(dst.len() >= 8 && dst.len() % 8 == 0);

    #[cfg(target_arch = "x86_64")]
    unsafe {
        sse::cmac_hc(dst, a, b);
    }

    #[cfg(not(target_arch = "x86_64"))]
    cmac_hc_scalar(dst, a, b);
}

#[allow(dead_code)]
#[inline]
fn mix_scalar(dst: &mut [f32], src: &[f32]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d += *s;
    }
}

#[allow(dead_code)]
fn cmac_hc_scalar(dst: &mut [f32], a: &[f32], b: &[f32]) {
    let n = dst.len();

    // DC and Nyquist are real-only lanes; capture their corrected values
    // before the pair-wise pass tramples them.
    let d0 = dst[0] + a[0] * b[0];
    let d4 = dst[4] + a[4] * b[4];

    let mut i = 0;
    while i < n {
        dst[i] += a[i] * b[i] - a[i + 4] * b[i + 4];
        dst[i + 1] += a[i + 1] * b[i + 1] - a[i + 5] * b[i + 5];
        dst[i + 2] += a[i + 2] * b[i + 2] - a[i + 6] * b[i + 6];
        dst[i + 3] += a[i + 3] * b[i + 3] - a[i + 7] * b[i + 7];

        dst[i + 4] += a[i] * b[i + 4] + a[i + 4] * b[i];
        dst[i + 5] += a[i + 1] * b[i + 5] + a[i + 5] * b[i + 1];
        dst[i + 6] += a[i + 2] * b[i + 6] + a[i + 6] * b[i + 2];
        dst[i + 7] += a[i + 3] * b[i + 7] + a[i + 7] * b[i + 3];

        i += 8;
    }

    dst[0] = d0;
    dst[4] = d4;
}

#[cfg(target_arch = "x86_64")]
mod sse {
    use core::arch::x86_64::{
        _mm_add_ps, _mm_loadu_ps, _mm_mul_ps, _mm_storeu_ps, _mm_sub_ps,
    };

    pub unsafe fn mix(dst: &mut [f32], src: &[f32]) {
        let n = dst.len();
        let chunks = n / 4;

        unsafe {
            let mut d = dst.as_mut_ptr();
            let mut s = src.as_ptr();
            for _ in 0..chunks {
                let sum = _mm_add_ps(_mm_loadu_ps(d), _mm_loadu_ps(s));
                _mm_storeu_ps(d, sum);
                d = d.add(4);
                s = s.add(4);
            }
        }

        for i in chunks * 4..n {
            dst[i] += src[i];
        }
    }

    pub unsafe fn cmac_hc(dst: &mut [f32], a: &[f32], b: &[f32]) {
        let n = dst.len();

        let d0 = dst[0] + a[0] * b[0];
        let d4 = dst[4] + a[4] * b[4];

        unsafe {
            let dp = dst.as_mut_ptr();
            let ap = a.as_ptr();
            let bp = b.as_ptr();

            let mut i = 0;
            while i < n {
                let a_re = _mm_loadu_ps(ap.add(i));
                let a_im = _mm_loadu_ps(ap.add(i + 4));
                let b_re = _mm_loadu_ps(bp.add(i));
                let b_im = _mm_loadu_ps(bp.add(i + 4));
                let d_re = _mm_loadu_ps(dp.add(i));
                let d_im = _mm_loadu_ps(dp.add(i + 4));

                let re = _mm_sub_ps(_mm_mul_ps(a_re, b_re), _mm_mul_ps(a_im, b_im));
                let im = _mm_add_ps(_mm_mul_ps(a_re, b_im), _mm_mul_ps(a_im, b_re));

                _mm_storeu_ps(dp.add(i), _mm_add_ps(d_re, re));
                _mm_storeu_ps(dp.add(i + 4), _mm_add_ps(d_im, im));

                i += 8;
            }
        }

        dst[0] = d0;
        dst[4] = d4;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mix_accumulates() {
        let mut dst = vec![1.0f32; 19];
        let src: Vec<f32> = (0..19).map(|i| i as f32).collect();
        mix(&mut dst, &src);

        for (i, &d) in dst.iter().enumerate() {
            assert!((d - (1.0 + i as f32)).abs() < 1e-6);
        }
    }

    #[test]
    fn cmac_matches_complex_arithmetic() {
        const N: usize = 32;

        let a: Vec<f32> = (0..N).map(|i| (i as f32 * 0.37).sin()).collect();
        let b: Vec<f32> = (0..N).map(|i| (i as f32 * 0.11).cos()).collect();
        let before: Vec<f32> = (0..N).map(|i| i as f32 * 0.01).collect();

        let mut dst = before.clone();
        cmac_hc(&mut dst, &a, &b);

        for g in (0..N).step_by(8) {
            for k in 0..4 {
                let (re, im) = (g + k, g + k + 4);
                if g == 0 && k == 0 {
                    // DC lane 0 and Nyquist lane 4: real products only
                    assert!((dst[0] - (before[0] + a[0] * b[0])).abs() < 1e-5);
                    assert!((dst[4] - (before[4] + a[4] * b[4])).abs() < 1e-5);
                    continue;
                }
                let exp_re = before[re] + a[re] * b[re] - a[im] * b[im];
                let exp_im = before[im] + a[re] * b[im] + a[im] * b[re];
                assert!((dst[re] - exp_re).abs() < 1e-5, "re lane {re}");
                assert!((dst[im] - exp_im).abs() < 1e-5, "im lane {im}");
            }
        }
    }

    #[test]
    fn cmac_scalar_and_dispatch_agree() {
        const N: usize = 64;

        let a: Vec<f32> = (0..N).map(|i| (i as f32 * 0.7).sin()).collect();
        let b: Vec<f32> = (0..N).map(|i| (i as f32 * 1.3).sin()).collect();

        let mut d1 = vec![0.25f32; N];
        let mut d2 = d1.clone();
        cmac_hc(&mut d1, &a, &b);
        cmac_hc_scalar(&mut d2, &a, &b);

        for (x, y) in d1.iter().zip(&d2) {
            assert!((x - y).abs() < 1e-6);
        }
    }
}
