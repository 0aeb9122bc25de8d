use std::sync::Arc;

use anyhow::{Result, ensure};

use crate::dsp::fft::{Fft, MAX_LOG_SIZE};

/// Smallest partition the engine supports; the spectral shuffle needs an
/// FFT frame of at least 16 coefficients.
pub const MIN_PART_SIZE: usize = 8;

/// One run of equally sized partitions sharing an FFT plan.
#[derive(Clone)]
pub struct Module {
    /// Start of this module's IR slice, in IR samples. Equals the output
    /// delay its convolver must impose.
    pub offset: usize,
    /// Partition size in frames.
    pub size: usize,
    /// Number of partitions of this size.
    pub count: usize,
    /// Shared transform plan for `2 * size` frames.
    pub fft: Arc<Fft>,
}

/// Non-uniform partitioning of an impulse response.
///
/// Partition sizes double from `min_part_size` up to `max_part_size`: the
/// first module runs up to four partitions, intermediate modules up to
/// two, and the final module absorbs whatever remains. Small partitions
/// keep the head of the response low-latency; large ones keep long tails
/// tractable.
#[derive(Clone)]
pub struct Response {
    num_channels: usize,
    num_frames: usize,
    min_part_size: usize,
    max_part_size: usize,
    modules: Vec<Module>,
}

impl Response {
    pub fn new(
        num_channels: usize,
        num_frames: usize,
        min_part_size: usize,
        max_part_size: usize,
    ) -> Result<Self> {
        ensure!(num_channels > 0, "response needs at least one channel");
        ensure!(num_frames > 0, "response needs at least one frame");
        ensure!(
            min_part_size.is_power_of_two() && max_part_size.is_power_of_two(),
            "partition sizes must be powers of two, got {min_part_size}/{max_part_size}"
        );
        ensure!(
            min_part_size >= MIN_PART_SIZE,
            "minimum partition size {min_part_size} below supported minimum {MIN_PART_SIZE}"
        );
        ensure!(
            min_part_size <= max_part_size,
            "minimum partition size {min_part_size} exceeds maximum {max_part_size}"
        );
        ensure!(
            max_part_size <= 1 << MAX_LOG_SIZE,
            "maximum partition size {max_part_size} exceeds {}",
            1usize << MAX_LOG_SIZE
        );

        let mut modules = Vec::new();
        let mut part_size = min_part_size;
        let mut rest = num_frames;
        let mut offset = 0;

        while rest > 0 {
            let max_count = if part_size >= max_part_size {
                usize::MAX
            } else if modules.is_empty() {
                4
            } else {
                2
            };
            let count = max_count.min(rest.div_ceil(part_size));

            modules.push(Module {
                offset,
                size: part_size,
                count,
                fft: Fft::get(part_size.trailing_zeros() as usize)?,
            });

            let covered = part_size * count;
            offset += covered;
            rest -= rest.min(covered);
            part_size *= 2;
        }

        Ok(Self {
            num_channels,
            num_frames,
            min_part_size,
            max_part_size,
            modules,
        })
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// IR length this partitioning was built for.
    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    pub fn min_part_size(&self) -> usize {
        self.min_part_size
    }

    pub fn max_part_size(&self) -> usize {
        self.max_part_size
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn num_modules(&self) -> usize {
        self.modules.len()
    }

    /// Total frames covered by all partitions; at least `num_frames`, the
    /// tail of the last partition being zero padding.
    pub fn size(&self) -> usize {
        self.modules.iter().map(|m| m.size * m.count).sum()
    }
}
