use std::sync::Arc;

use crate::buffer::{AudioBuffer, AudioRingBuffer};
use crate::dsp;
use crate::dsp::fft::{Fft, FftScratch, shuffle_hc, unshuffle_hc};
use crate::engine::kernel::ModuleSpectra;
use crate::engine::response::Module;

/// Uniform-partitioned frequency-domain convolution for one partition
/// size.
///
/// The convolver consumes `bin_size` frames per call and completes one
/// FFT frame of `2 * part_size` samples every `num_bins` calls. The heavy
/// work is split into two stages (forward transform plus the first half
/// of the MACs, then the second half plus the inverse transform), and the
/// stages fire on bins spread across the partition period so every module
/// of a composite loads the callback evenly.
///
/// The input ring starts with its write cursor a whole FFT frame ahead of
/// the read cursor: the first transform consumes a zero frame, frame `k`
/// is transformed during period `k + 1`, and the stage's output emerges
/// exactly `bin_size` samples late. Delayed modules fold that pipeline
/// delay into their output-ring pre-advance so every stage of a composite
/// lands on the same timeline.
pub struct Convolver {
    num_channels: usize,
    bin_size: usize,
    part_size: usize,
    padded_size: usize,
    num_bins: usize,
    count: usize,
    ir_offset: usize,

    fft: Arc<Fft>,
    scratch: FftScratch,
    /// FFT work frame, `padded_size` long.
    time: Vec<f32>,

    /// Incoming samples plus zero padding, two FFT frames deep.
    input: AudioRingBuffer,
    /// Spectral history: `count` shuffled spectra per channel.
    spectra: Vec<Vec<f32>>,
    spec_size: usize,
    /// Float index of the most recent spectrum.
    spec_pos: usize,

    kernel: Option<Arc<ModuleSpectra>>,

    /// MAC accumulator per channel, cleared at the start of each stage-0.
    acc: Vec<Vec<f32>>,
    /// Second half of the previous inverse transform, per channel.
    overlap: Vec<Vec<f32>>,
    output: AudioRingBuffer,

    stage: usize,
}

impl Convolver {
    pub fn new(
        num_channels: usize,
        bin_size: usize,
        module: &Module,
        external_delay: usize,
    ) -> Self {
        let part_size = module.size;
        let padded_size = part_size * 2;
        debug_assert!(part_size % bin_size == 0);
        debug_assert_eq!(module.fft.padded_size(), padded_size);

        let mut input = AudioRingBuffer::new(num_channels, 4 * part_size);
        input.write_advance(padded_size);

        let mut output = AudioRingBuffer::new(num_channels, module.offset + part_size);
        if module.offset > 0 {
            debug_assert!(module.offset + external_delay >= part_size);
            output.write_advance(module.offset - (part_size - external_delay));
        }

        let spec_size = module.count * padded_size;

        Self {
            num_channels,
            bin_size,
            part_size,
            padded_size,
            num_bins: part_size / bin_size,
            count: module.count,
            ir_offset: module.offset,
            scratch: module.fft.make_scratch(),
            fft: Arc::clone(&module.fft),
            time: vec![0.0; padded_size],
            input,
            spectra: vec![vec![0.0; spec_size]; num_channels],
            spec_size,
            spec_pos: spec_size - padded_size,
            kernel: None,
            acc: vec![vec![0.0; padded_size]; num_channels],
            overlap: vec![vec![0.0; part_size]; num_channels],
            output,
            stage: 0,
        }
    }

    pub fn part_size(&self) -> usize {
        self.part_size
    }

    pub fn num_bins(&self) -> usize {
        self.num_bins
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn ir_offset(&self) -> usize {
        self.ir_offset
    }

    /// Install a new spectrum snapshot, returning the displaced one so the
    /// caller can free it off the audio thread. `None` silences the stage
    /// while keeping its input pipeline warm.
    pub fn set_kernel(
        &mut self,
        kernel: Option<Arc<ModuleSpectra>>,
    ) -> Option<Arc<ModuleSpectra>> {
        if let Some(k) = &kernel {
            debug_assert_eq!(k.count(), self.count);
            debug_assert_eq!(k.padded_size(), self.padded_size);
        }
        std::mem::replace(&mut self.kernel, kernel)
    }

    /// Append one `bin_size` block of input. When the block completes a
    /// partition, the zero pad for the second transform half goes in
    /// right behind it.
    pub fn push(&mut self, src: &AudioBuffer) {
        for ch in 0..self.num_channels {
            self.input.write_vector(ch)[..self.bin_size]
                .copy_from_slice(&src.channel(ch)[..self.bin_size]);
        }
        self.input.write_advance(self.bin_size);

        if self.input.write_pos() % self.part_size == 0 {
            for ch in 0..self.num_channels {
                self.input.write_vector(ch)[..self.part_size].fill(0.0);
            }
            self.input.write_advance(self.part_size);
        }
    }

    /// Run whatever stage work is due at `bin_index`.
    ///
    /// The two stages fire at bin offsets `num_bins / 4` and
    /// `3 * num_bins / 4` within each partition period, staggering the
    /// heavy calls of differently sized modules. A single-bin convolver
    /// runs its whole pipeline every call.
    pub fn compute(&mut self, bin_index: usize) {
        if self.num_bins == 1 {
            self.compute_input();
            self.compute_mac(0, self.count);
            self.compute_output();
            return;
        }

        let half = self.num_bins / 2;
        let quarter = self.num_bins / 4;
        if (bin_index + self.num_bins - quarter) % half != 0 {
            return;
        }

        if self.stage == 0 {
            self.compute_input();
            self.compute_mac(0, self.count / 2);
            self.stage = 1;
        } else {
            self.compute_mac(self.count / 2, self.count);
            self.compute_output();
            self.stage = 0;
        }
    }

    /// Read `frames` output samples. The first module owns the output
    /// buffer and assigns; delayed modules accumulate into it.
    pub fn pull(&mut self, dst: &mut AudioBuffer, frames: usize) {
        let frames = frames.min(self.bin_size);
        for ch in 0..self.num_channels {
            let out = &self.output.read_vector(ch)[..frames];
            let dst = &mut dst.channel_mut(ch)[..frames];
            if self.ir_offset == 0 {
                dst.copy_from_slice(out);
            } else {
                dsp::mix(dst, out);
            }
        }
        self.output.read_advance(self.bin_size);
    }

    /// Forward-transform the oldest FFT frame into the spectral history
    /// and reset the accumulator for the new period.
    fn compute_input(&mut self) {
        self.spec_pos = (self.spec_pos + self.padded_size) % self.spec_size;

        for ch in 0..self.num_channels {
            self.time
                .copy_from_slice(&self.input.read_vector(ch)[..self.padded_size]);
            self.fft.forward_hc(&mut self.time, &mut self.scratch);

            let slot = &mut self.spectra[ch][self.spec_pos..self.spec_pos + self.padded_size];
            shuffle_hc(slot, &self.time);
        }
        self.input.read_advance(self.padded_size);

        for acc in &mut self.acc {
            acc.fill(0.0);
        }
    }

    /// Multiply-accumulate partitions `[from, to)`: partition `p` pairs
    /// the IR slice `p` with the input spectrum recorded `p` frames ago.
    fn compute_mac(&mut self, from: usize, to: usize) {
        let Some(kernel) = &self.kernel else {
            return;
        };

        for p in from..to {
            let off = (self.spec_pos + self.spec_size - p * self.padded_size) % self.spec_size;
            for ch in 0..self.num_channels {
                dsp::cmac_hc(
                    &mut self.acc[ch],
                    &self.spectra[ch][off..off + self.padded_size],
                    kernel.partition(ch, p),
                );
            }
        }
    }

    /// Inverse-transform the accumulator and overlap-add one partition of
    /// output into the ring.
    fn compute_output(&mut self) {
        for ch in 0..self.num_channels {
            unshuffle_hc(&mut self.time, &self.acc[ch]);
            self.fft.backward_hc(&mut self.time, &mut self.scratch);

            let overlap = &mut self.overlap[ch];
            for i in 0..self.part_size {
                self.time[i] += overlap[i];
            }
            overlap.copy_from_slice(&self.time[self.part_size..]);

            self.output.write_at(ch, &self.time[..self.part_size]);
        }
        self.output.write_advance(self.part_size);
    }
}
