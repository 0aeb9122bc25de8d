use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::buffer::AudioBuffer;
use crate::dsp;

/// Create a single-producer single-consumer multichannel FIFO holding
/// `num_frames` frames per channel.
///
/// The two halves may live on different threads; cursor hand-off is
/// release/acquire, so a block published by one side is fully visible to
/// the other before the cursor moves. One slot always stays empty as the
/// full/empty discriminator.
pub fn channel(num_channels: usize, num_frames: usize) -> (FifoProducer, FifoConsumer) {
    let shared = Arc::new(Shared {
        data: (0..num_channels)
            .map(|_| UnsafeCell::new(vec![0.0f32; num_frames].into_boxed_slice()))
            .collect(),
        size: num_frames,
        read_pos: AtomicUsize::new(0),
        write_pos: AtomicUsize::new(0),
    });

    (
        FifoProducer {
            shared: Arc::clone(&shared),
        },
        FifoConsumer { shared },
    )
}

struct Shared {
    data: Vec<UnsafeCell<Box<[f32]>>>,
    size: usize,
    read_pos: AtomicUsize,
    write_pos: AtomicUsize,
}

// SAFETY: the producer only writes frames in `[write_pos, write_pos + n)`
// before publishing them with a release store, and the consumer only reads
// frames in `[read_pos, read_pos + n)` after an acquire load of the write
// cursor. The regions never overlap while both sides hold their half, so
// the interior mutability is exclusive per frame.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

/// Write half of the FIFO.
pub struct FifoProducer {
    shared: Arc<Shared>,
}

/// Read half of the FIFO.
pub struct FifoConsumer {
    shared: Arc<Shared>,
}

impl FifoProducer {
    /// Total writable frames (not just the span to the array end).
    pub fn write_space(&self) -> usize {
        let w = self.shared.write_pos.load(Ordering::Relaxed);
        let r = self.shared.read_pos.load(Ordering::Acquire);
        (r + self.shared.size - w - 1) % self.shared.size
    }

    /// Copy `frames` frames from `src` into the FIFO. Returns `false`
    /// without writing anything when the space is insufficient.
    pub fn write(&self, src: &AudioBuffer, frames: usize) -> bool {
        let size = self.shared.size;
        let w = self.shared.write_pos.load(Ordering::Relaxed);
        let r = self.shared.read_pos.load(Ordering::Acquire);

        if (r + size - w - 1) % size < frames {
            return false;
        }

        let first = frames.min(size - w);
        for ch in 0..self.shared.data.len() {
            // SAFETY: producer-exclusive region, see `Shared`.
            let data = unsafe { &mut *self.shared.data[ch].get() };
            let src = src.channel(ch);
            data[w..w + first].copy_from_slice(&src[..first]);
            data[..frames - first].copy_from_slice(&src[first..frames]);
        }

        self.shared
            .write_pos
            .store((w + frames) % size, Ordering::Release);
        true
    }
}

impl FifoConsumer {
    /// Total readable frames.
    pub fn read_space(&self) -> usize {
        let r = self.shared.read_pos.load(Ordering::Relaxed);
        let w = self.shared.write_pos.load(Ordering::Acquire);
        (w + self.shared.size - r) % self.shared.size
    }

    /// Copy `frames` frames out of the FIFO into `dst`, either overwriting
    /// or accumulating. Returns `false` without consuming anything when
    /// fewer frames are buffered.
    pub fn read(&self, dst: &mut AudioBuffer, frames: usize, accumulate: bool) -> bool {
        let size = self.shared.size;
        let r = self.shared.read_pos.load(Ordering::Relaxed);
        let w = self.shared.write_pos.load(Ordering::Acquire);

        if (w + size - r) % size < frames {
            return false;
        }

        let first = frames.min(size - r);
        for ch in 0..self.shared.data.len() {
            // SAFETY: consumer-exclusive region, see `Shared`.
            let data = unsafe { &*self.shared.data[ch].get() };
            let dst = dst.channel_mut(ch);
            if accumulate {
                dsp::mix(&mut dst[..first], &data[r..r + first]);
                dsp::mix(&mut dst[first..frames], &data[..frames - first]);
            } else {
                dst[..first].copy_from_slice(&data[r..r + first]);
                dst[first..frames].copy_from_slice(&data[..frames - first]);
            }
        }

        self.shared
            .read_pos
            .store((r + frames) % size, Ordering::Release);
        true
    }

    /// Drop `frames` frames without copying them out. Used to realign the
    /// stream after a starved block.
    pub fn discard(&self, frames: usize) -> bool {
        let size = self.shared.size;
        let r = self.shared.read_pos.load(Ordering::Relaxed);
        let w = self.shared.write_pos.load(Ordering::Acquire);

        if (w + size - r) % size < frames {
            return false;
        }

        self.shared
            .read_pos
            .store((r + frames) % size, Ordering::Release);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(num_channels: usize, frames: usize, fill: impl Fn(usize, usize) -> f32) -> AudioBuffer {
        let mut buf = AudioBuffer::new(num_channels, frames);
        for ch in 0..num_channels {
            for (i, s) in buf.channel_mut(ch).iter_mut().enumerate() {
                *s = fill(ch, i);
            }
        }
        buf
    }

    #[test]
    fn write_then_read_round_trips() {
        let (tx, rx) = channel(2, 64);
        let src = block(2, 16, |ch, i| (ch * 100 + i) as f32);

        assert!(tx.write(&src, 16));
        assert_eq!(rx.read_space(), 16);

        let mut dst = AudioBuffer::new(2, 16);
        assert!(rx.read(&mut dst, 16, false));
        assert_eq!(dst.channel(1)[5], 105.0);
        assert_eq!(rx.read_space(), 0);
    }

    #[test]
    fn read_can_accumulate() {
        let (tx, rx) = channel(1, 32);
        let src = block(1, 8, |_, i| i as f32);
        assert!(tx.write(&src, 8));

        let mut dst = block(1, 8, |_, _| 1.0);
        assert!(rx.read(&mut dst, 8, true));
        assert_eq!(dst.channel(0)[3], 4.0);
    }

    #[test]
    fn rejects_oversized_transfers() {
        let (tx, rx) = channel(1, 16);
        let src = block(1, 16, |_, i| i as f32);

        // One slot stays empty: 16 frames never fit in a 16-frame FIFO.
        assert!(!tx.write(&src, 16));
        assert!(tx.write(&src, 15));
        assert!(!tx.write(&src, 1));

        let mut dst = AudioBuffer::new(1, 16);
        assert!(!rx.read(&mut dst, 16, false));
        assert!(rx.read(&mut dst, 15, false));
    }

    #[test]
    fn wraps_across_the_array_end() {
        let (tx, rx) = channel(1, 12);
        let mut dst = AudioBuffer::new(1, 8);

        let a = block(1, 8, |_, i| i as f32);
        assert!(tx.write(&a, 8));
        assert!(rx.read(&mut dst, 8, false));

        // Second block spans the wrap point.
        let b = block(1, 8, |_, i| 100.0 + i as f32);
        assert!(tx.write(&b, 8));
        assert!(rx.read(&mut dst, 8, false));
        for i in 0..8 {
            assert_eq!(dst.channel(0)[i], 100.0 + i as f32);
        }
    }

    #[test]
    fn discard_consumes_without_copying() {
        let (tx, rx) = channel(1, 32);
        let src = block(1, 8, |_, i| i as f32);
        assert!(tx.write(&src, 8));
        assert!(tx.write(&src, 8));

        assert!(rx.discard(8));
        let mut dst = AudioBuffer::new(1, 8);
        assert!(rx.read(&mut dst, 8, false));
        assert_eq!(rx.read_space(), 0);
    }

    #[test]
    fn spsc_blocks_survive_thread_hand_off() {
        let (tx, rx) = channel(1, 256);
        const BLOCKS: usize = 2000;
        const FRAMES: usize = 16;

        let producer = std::thread::spawn(move || {
            let mut src = AudioBuffer::new(1, FRAMES);
            for b in 0..BLOCKS {
                for (i, s) in src.channel_mut(0).iter_mut().enumerate() {
                    *s = (b * FRAMES + i) as f32;
                }
                while !tx.write(&src, FRAMES) {
                    std::hint::spin_loop();
                }
            }
        });

        let mut dst = AudioBuffer::new(1, FRAMES);
        let mut expected = 0.0f32;
        for _ in 0..BLOCKS {
            while !rx.read(&mut dst, FRAMES, false) {
                std::hint::spin_loop();
            }
            for &s in dst.channel(0) {
                assert_eq!(s, expected);
                expected += 1.0;
            }
        }

        producer.join().unwrap();
    }
}
