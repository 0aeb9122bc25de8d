use std::sync::Arc;

use anyhow::{Result, ensure};

use crate::dsp::fft::shuffle_hc;
use crate::engine::response::Response;
use crate::ir::SoundBuffer;

/// Frequency-domain snapshot of one module's slice of the impulse
/// response: `count` shuffled half-complex partitions per channel.
///
/// Snapshots are immutable once computed; convolvers swap whole `Arc`s at
/// block boundaries, so the audio thread never observes a partially
/// written kernel.
pub struct ModuleSpectra {
    /// Per channel, `count * padded_size` floats.
    data: Vec<Vec<f32>>,
    padded_size: usize,
    count: usize,
}

impl ModuleSpectra {
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn padded_size(&self) -> usize {
        self.padded_size
    }

    /// Shuffled spectrum of partition `p` on `channel`.
    #[inline]
    pub fn partition(&self, channel: usize, p: usize) -> &[f32] {
        let start = p * self.padded_size;
        &self.data[channel][start..start + self.padded_size]
    }
}

/// One spectrum snapshot per module of a [`Response`].
pub struct KernelSpectra {
    modules: Vec<Arc<ModuleSpectra>>,
}

impl KernelSpectra {
    /// Partition, scale and transform `frames` frames of `source`
    /// (starting at `offset`) against the layout of `response`.
    ///
    /// Runs on the control thread: it allocates and burns CPU freely.
    /// Response channels beyond the source channel count come out zero;
    /// source frames beyond the partitioned length are ignored. Passing
    /// `frames == 0` takes everything from `offset` to the end.
    pub fn compute(
        response: &Response,
        source: &SoundBuffer,
        offset: usize,
        frames: usize,
    ) -> Result<Self> {
        ensure!(
            source.channels > 0 && source.frames > 0,
            "kernel source buffer is empty"
        );
        ensure!(
            offset < source.frames,
            "kernel offset {offset} outside source of {} frames",
            source.frames
        );

        let avail = source.frames - offset;
        let frames = if frames == 0 { avail } else { frames.min(avail) };

        let num_channels = response.num_channels();
        let mut modules = Vec::with_capacity(response.num_modules());

        for module in response.modules() {
            let padded = module.fft.padded_size();
            let norm = module.fft.norm();
            let mut scratch = module.fft.make_scratch();
            let mut time = vec![0.0f32; padded];

            let mut data = Vec::with_capacity(num_channels);
            for ch in 0..num_channels {
                let mut spectra = vec![0.0f32; module.count * padded];

                if ch < source.channels {
                    for p in 0..module.count {
                        let start = module.offset + p * module.size;
                        if start >= frames {
                            break;
                        }
                        let n = module.size.min(frames - start);

                        // Deinterleave and fold the round-trip scaling in
                        // here, once per kernel load.
                        for (i, t) in time[..n].iter_mut().enumerate() {
                            *t = source.sample(ch, offset + start + i) * norm;
                        }
                        time[n..].fill(0.0);

                        module.fft.forward_hc(&mut time, &mut scratch);
                        let slot = &mut spectra[p * padded..(p + 1) * padded];
                        shuffle_hc(slot, &time);
                    }
                }

                data.push(spectra);
            }

            modules.push(Arc::new(ModuleSpectra {
                data,
                padded_size: padded,
                count: module.count,
            }));
        }

        Ok(Self { modules })
    }

    pub fn num_modules(&self) -> usize {
        self.modules.len()
    }

    pub fn module(&self, i: usize) -> &Arc<ModuleSpectra> {
        &self.modules[i]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn impulse_kernel_has_flat_first_partition() -> Result<()> {
        let response = Response::new(1, 128, 64, 64)?;
        let mut data = vec![0.0f32; 128];
        data[0] = 1.0;
        let source = SoundBuffer::new(data, 1);

        let kernel = KernelSpectra::compute(&response, &source, 0, 0)?;
        assert_eq!(kernel.num_modules(), 1);

        let spectra = kernel.module(0);
        assert_eq!(spectra.count(), 2);

        // delta scaled by 1/N transforms to a constant 1/N real spectrum.
        let norm = 1.0 / 128.0;
        let p0 = spectra.partition(0, 0);
        assert!((p0[0] - norm).abs() < 1e-7);
        assert!((p0[4] - norm).abs() < 1e-7);
        // Second partition is past the impulse: all zero.
        assert!(spectra.partition(0, 1).iter().all(|&x| x == 0.0));
        Ok(())
    }

    #[test]
    fn channels_beyond_source_are_silent() -> Result<()> {
        let response = Response::new(2, 64, 64, 64)?;
        let source = SoundBuffer::new(vec![0.5f32; 64], 1);

        let kernel = KernelSpectra::compute(&response, &source, 0, 0)?;
        let spectra = kernel.module(0);
        assert!(spectra.partition(0, 0).iter().any(|&x| x != 0.0));
        assert!(spectra.partition(1, 0).iter().all(|&x| x == 0.0));
        Ok(())
    }

    #[test]
    fn offset_slices_into_the_source() -> Result<()> {
        let response = Response::new(1, 64, 64, 64)?;
        let mut data = vec![0.0f32; 128];
        data[64] = 1.0;
        let source = SoundBuffer::new(data, 1);

        // Starting at the impulse gives the same spectra as an impulse at 0.
        let kernel = KernelSpectra::compute(&response, &source, 64, 0)?;
        let p0 = kernel.module(0).partition(0, 0);
        let norm = 1.0 / 128.0;
        assert!((p0[0] - norm).abs() < 1e-7);
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_offset() -> Result<()> {
        let response = Response::new(1, 64, 64, 64)?;
        let source = SoundBuffer::new(vec![0.0f32; 32], 1);
        assert!(KernelSpectra::compute(&response, &source, 32, 0).is_err());
        Ok(())
    }
}
