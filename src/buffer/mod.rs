pub mod fifo;

/// Fixed-size multichannel float buffer; one backing array per channel.
pub struct AudioBuffer {
    data: Vec<Vec<f32>>,
    num_frames: usize,
}

impl AudioBuffer {
    pub fn new(num_channels: usize, num_frames: usize) -> Self {
        Self {
            data: vec![vec![0.0; num_frames]; num_channels],
            num_frames,
        }
    }

    pub fn num_channels(&self) -> usize {
        self.data.len()
    }

    pub fn num_frames(&self) -> usize {
        self.num_frames
    }

    pub fn channel(&self, ch: usize) -> &[f32] {
        &self.data[ch]
    }

    pub fn channel_mut(&mut self, ch: usize) -> &mut [f32] {
        &mut self.data[ch]
    }

    pub fn clear(&mut self) {
        for ch in &mut self.data {
            ch.fill(0.0);
        }
    }
}

/// Multichannel ring buffer for single-threaded use inside a convolver.
///
/// `read_space` and `write_space` report the *continuous* span to the end
/// of the backing array, so callers can work on flat slices without wrap
/// logic; consuming a wrap-around takes two advances. When the write
/// cursor trails the read cursor, `write_space` keeps one slot empty as
/// the full/empty discriminator.
///
/// The convolver drives both cursors on a fixed cadence and never relies
/// on the space queries for correctness, only the alignment of its
/// advances.
pub struct AudioRingBuffer {
    data: Vec<Vec<f32>>,
    size: usize,
    read_pos: usize,
    write_pos: usize,
}

impl AudioRingBuffer {
    pub fn new(num_channels: usize, num_frames: usize) -> Self {
        Self {
            data: vec![vec![0.0; num_frames]; num_channels],
            size: num_frames,
            read_pos: 0,
            write_pos: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn num_channels(&self) -> usize {
        self.data.len()
    }

    pub fn read_pos(&self) -> usize {
        self.read_pos
    }

    pub fn write_pos(&self) -> usize {
        self.write_pos
    }

    /// Continuous readable span from the read cursor.
    pub fn read_space(&self) -> usize {
        if self.read_pos <= self.write_pos {
            self.write_pos - self.read_pos
        } else {
            self.size - self.read_pos
        }
    }

    /// Continuous writable span from the write cursor.
    pub fn write_space(&self) -> usize {
        if self.write_pos < self.read_pos {
            self.read_pos - self.write_pos - 1
        } else {
            self.size - self.write_pos
        }
    }

    /// Flat slice starting at the read cursor, running to the end of the
    /// backing array.
    pub fn read_vector(&self, ch: usize) -> &[f32] {
        &self.data[ch][self.read_pos..]
    }

    /// Flat mutable slice starting at the write cursor.
    pub fn write_vector(&mut self, ch: usize) -> &mut [f32] {
        let pos = self.write_pos;
        &mut self.data[ch][pos..]
    }

    /// Copy `src` into channel `ch` at the write cursor, wrapping past the
    /// end of the backing array. Does not advance; one `write_advance`
    /// covers all channels of a frame.
    pub fn write_at(&mut self, ch: usize, src: &[f32]) {
        let first = src.len().min(self.size - self.write_pos);
        let data = &mut self.data[ch];
        data[self.write_pos..self.write_pos + first].copy_from_slice(&src[..first]);
        data[..src.len() - first].copy_from_slice(&src[first..]);
    }

    pub fn read_advance(&mut self, n: usize) {
        self.read_pos = (self.read_pos + n) % self.size;
    }

    pub fn write_advance(&mut self, n: usize) {
        self.write_pos = (self.write_pos + n) % self.size;
    }
}
