pub mod loader;

/// An impulse response held the way the host hands buffers to the engine:
/// interleaved samples plus shape.
#[derive(Clone)]
pub struct SoundBuffer {
    /// Interleaved samples, `frames * channels` long.
    pub data: Vec<f32>,
    pub channels: usize,
    pub frames: usize,
}

impl SoundBuffer {
    pub fn new(data: Vec<f32>, channels: usize) -> Self {
        debug_assert!(channels > 0);
        let frames = data.len() / channels;
        Self {
            data,
            channels,
            frames,
        }
    }

    /// Sample at `frame` on `channel`.
    #[inline]
    pub fn sample(&self, channel: usize, frame: usize) -> f32 {
        self.data[frame * self.channels + channel]
    }
}
