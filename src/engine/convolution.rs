use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Result, ensure};
use crossbeam::channel::{Sender, bounded};
use crossbeam::sync::Unparker;

use crate::buffer::AudioBuffer;
use crate::buffer::fifo::{self, FifoConsumer, FifoProducer};
use crate::engine::convolver::Convolver;
use crate::engine::kernel::{KernelSpectra, ModuleSpectra};
use crate::engine::response::Response;
use crate::engine::worker::{Worker, WorkerCommand};

/// Bounded retries before a late worker block is written off as silence.
pub const DEFAULT_SPIN_LIMIT: usize = 65_536;

/// Per-module timing callback; receives the RT module index and the time
/// its push/compute/pull slice took this block.
pub type TraceHook = Box<dyn FnMut(usize, Duration) + Send>;

/// Number of modules that run on the audio thread for a given
/// configuration. Zero requests and offline rendering both mean "all of
/// them".
pub fn resolve_rt_split(num_modules: usize, num_rt_procs: usize, realtime: bool) -> usize {
    if !realtime || num_rt_procs == 0 {
        num_modules
    } else {
        num_rt_procs.min(num_modules)
    }
}

/// The composite convolution engine: one [`Convolver`] per module of a
/// [`Response`], the small partitions running inside the audio callback
/// and the rest on a background [`Worker`] coupled through a pair of
/// SPSC FIFOs.
pub struct Convolution {
    response: Response,
    num_channels: usize,
    bin_size: usize,
    bin_index: usize,
    /// Wrap mask for the bin counter: largest module's bin count minus 1.
    bin_period: usize,
    rt: Vec<Convolver>,
    worker: Option<WorkerLink>,
    starved: Arc<AtomicU64>,
    trace: Option<TraceHook>,
}

/// Audio-thread half of the worker coupling.
struct WorkerLink {
    in_tx: FifoProducer,
    out_rx: FifoConsumer,
    cmd_tx: Sender<WorkerCommand>,
    unparker: Unparker,
    _worker: Worker,
    spin_limit: usize,
    /// Blocks written to the input FIFO whose output has not been
    /// consumed yet; normally 1 between write and read, more after a
    /// starved block.
    pending: usize,
}

impl Convolution {
    /// Build the engine. Modules `[0, num_rt_procs)` run on the audio
    /// thread; the rest move into a worker thread. `num_rt_procs == 0`
    /// puts everything on the audio thread, and `realtime == false`
    /// (offline rendering) forces the same.
    pub fn new(
        response: Response,
        num_rt_procs: usize,
        realtime: bool,
        spin_limit: usize,
    ) -> Result<Self> {
        let num_modules = response.num_modules();
        ensure!(num_modules > 0, "response has no modules");

        let num_channels = response.num_channels();
        let bin_size = response.min_part_size();

        let num_rt = resolve_rt_split(num_modules, num_rt_procs, realtime);

        let largest_size = response.modules().last().map_or(bin_size, |m| m.size);
        let bin_period = largest_size / bin_size - 1;
        ensure!(
            (bin_period + 1).is_power_of_two(),
            "bin period {bin_period} is not a power of two minus one"
        );

        let mut convolvers: Vec<Convolver> = response
            .modules()
            .iter()
            .map(|m| Convolver::new(num_channels, bin_size, m, bin_size))
            .collect();

        let tail = convolvers.split_off(num_rt);
        let starved = Arc::new(AtomicU64::new(0));

        let worker = if tail.is_empty() {
            None
        } else {
            let ir_offset = response.modules()[num_rt].offset;
            let capacity = 4 * ir_offset;

            let (in_tx, in_rx) = fifo::channel(num_channels, capacity);
            let (out_tx, out_rx) = fifo::channel(num_channels, capacity);
            let (cmd_tx, cmd_rx) = bounded(8);

            let worker = Worker::spawn(
                tail,
                in_rx,
                out_tx,
                cmd_rx,
                num_channels,
                bin_size,
                bin_period,
            )?;

            Some(WorkerLink {
                in_tx,
                out_rx,
                cmd_tx,
                unparker: worker.unparker(),
                _worker: worker,
                spin_limit,
                pending: 0,
            })
        };

        Ok(Self {
            response,
            num_channels,
            bin_size,
            bin_index: 0,
            bin_period,
            rt: convolvers,
            worker,
            starved,
            trace: None,
        })
    }

    pub fn response(&self) -> &Response {
        &self.response
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    pub fn bin_size(&self) -> usize {
        self.bin_size
    }

    /// Output delay relative to the input, in samples.
    pub fn latency(&self) -> usize {
        self.bin_size
    }

    pub fn num_rt_convolvers(&self) -> usize {
        self.rt.len()
    }

    pub fn has_worker(&self) -> bool {
        self.worker.is_some()
    }

    /// Shared starvation counter: blocks whose worker contribution was
    /// replaced by silence because a FIFO spin timed out.
    pub fn starvation_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.starved)
    }

    pub fn set_trace_hook(&mut self, hook: Option<TraceHook>) {
        self.trace = hook;
    }

    /// Install a kernel snapshot at a block boundary.
    ///
    /// RT-side convolvers swap in their spectra directly (refcount bumps
    /// only); `worker_part` travels to the worker over its command
    /// channel. Displaced snapshots are pushed into `retired`, which the
    /// caller routes off the audio thread before dropping. Returns the
    /// worker part back if the command channel was full so the caller can
    /// retry or dispose of it elsewhere.
    pub fn set_kernel(
        &mut self,
        kernel: &KernelSpectra,
        worker_part: Option<Vec<Arc<ModuleSpectra>>>,
        retired: &mut Vec<Arc<ModuleSpectra>>,
    ) -> Option<Vec<Arc<ModuleSpectra>>> {
        for (i, conv) in self.rt.iter_mut().enumerate() {
            if let Some(old) = conv.set_kernel(Some(Arc::clone(kernel.module(i)))) {
                retired.push(old);
            }
        }

        if let Some(link) = &self.worker {
            if let Some(part) = worker_part {
                if let Err(err) = link.cmd_tx.try_send(WorkerCommand::SetKernel(part)) {
                    let WorkerCommand::SetKernel(part) = err.into_inner();
                    return Some(part);
                }
                link.unparker.unpark();
            }
        }
        None
    }

    /// Process one block of at most `bin_size` frames. `src` must be
    /// padded with zeros up to `bin_size`; the engine advances one bin per
    /// call regardless of `frames`.
    pub fn process(&mut self, dst: &mut AudioBuffer, src: &AudioBuffer, frames: usize) {
        debug_assert!(frames <= self.bin_size);

        if let Some(link) = &mut self.worker {
            link.write_input(src, self.bin_size, &self.starved);
        }

        let trace = &mut self.trace;
        for (i, conv) in self.rt.iter_mut().enumerate() {
            let start = trace.as_ref().map(|_| Instant::now());

            conv.push(src);
            conv.compute(self.bin_index);
            conv.pull(dst, frames);

            if let (Some(hook), Some(start)) = (trace.as_mut(), start) {
                hook(i, start.elapsed());
            }
        }
        self.bin_index = (self.bin_index + 1) & self.bin_period;

        if let Some(link) = &mut self.worker {
            link.read_output(dst, frames, self.bin_size, &self.starved);
        }
    }
}

impl WorkerLink {
    fn write_input(&mut self, src: &AudioBuffer, bin_size: usize, starved: &AtomicU64) {
        let mut spins = 0;
        while !self.in_tx.write(src, bin_size) {
            if spins >= self.spin_limit {
                // Worker is stalled and its FIFO is full; the block is
                // lost for the tail stream.
                starved.fetch_add(1, Ordering::Relaxed);
                return;
            }
            spins += 1;
            std::hint::spin_loop();
        }

        self.pending += 1;
        self.unparker.unpark();
    }

    fn read_output(
        &mut self,
        dst: &mut AudioBuffer,
        frames: usize,
        bin_size: usize,
        starved: &AtomicU64,
    ) {
        if self.pending == 0 {
            return;
        }

        // Blocks left over from starved calls are stale; drop them so the
        // stream realigns on the newest block. Until the backlog clears,
        // keep emitting silence rather than mixing a time-shifted block.
        while self.pending > 1 && self.out_rx.discard(bin_size) {
            self.pending -= 1;
        }
        if self.pending > 1 {
            starved.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut spins = 0;
        while self.out_rx.read_space() < bin_size {
            if spins >= self.spin_limit {
                starved.fetch_add(1, Ordering::Relaxed);
                return;
            }
            spins += 1;
            std::hint::spin_loop();
        }

        self.out_rx.read(dst, frames, true);
        if bin_size > frames {
            self.out_rx.discard(bin_size - frames);
        }
        self.pending -= 1;
    }
}
