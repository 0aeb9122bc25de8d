use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result};
use crossbeam::channel::{Receiver, bounded};
use crossbeam::sync::{Parker, Unparker};
use log::{debug, info, warn};

use crate::buffer::AudioBuffer;
use crate::buffer::fifo::{FifoConsumer, FifoProducer};
use crate::engine::convolver::Convolver;
use crate::engine::kernel::ModuleSpectra;

/// Environment override for the worker's scheduling priority on Linux.
pub const SCHED_PRIO_ENV: &str = "RUSTVERB_SCHED_PRIO";
const DEFAULT_SCHED_PRIO: i32 = 5;

/// Control messages applied by the worker between blocks.
pub enum WorkerCommand {
    /// New spectrum snapshots for the worker-side convolvers, in module
    /// order.
    SetKernel(Vec<Arc<ModuleSpectra>>),
}

/// Background thread running the large-partition convolvers.
///
/// The audio thread feeds it through one SPSC FIFO and drains its
/// contribution from another; an unpark after each input block is the
/// only wake-up. The thread owns its convolvers outright, so nothing on
/// the audio side ever touches their state.
pub struct Worker {
    thread: Option<thread::JoinHandle<()>>,
    should_run: Arc<AtomicBool>,
    unparker: Unparker,
}

impl Worker {
    /// Spawn the worker and wait for it to finish setting itself up;
    /// the FIFOs may be used once this returns.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        convolvers: Vec<Convolver>,
        in_rx: FifoConsumer,
        out_tx: FifoProducer,
        cmd_rx: Receiver<WorkerCommand>,
        num_channels: usize,
        bin_size: usize,
        bin_period: usize,
    ) -> Result<Self> {
        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        let should_run = Arc::new(AtomicBool::new(true));
        let run_flag = Arc::clone(&should_run);

        let (ready_tx, ready_rx) = bounded::<()>(1);

        let thread = thread::Builder::new()
            .name("convolution-worker".into())
            .spawn(move || {
                set_realtime_priority();
                let _ = ready_tx.send(());
                run(
                    convolvers,
                    &in_rx,
                    &out_tx,
                    &cmd_rx,
                    &parker,
                    &run_flag,
                    num_channels,
                    bin_size,
                    bin_period,
                );
            })
            .context("failed to spawn convolution worker thread")?;

        ready_rx
            .recv()
            .context("convolution worker died during startup")?;

        Ok(Self {
            thread: Some(thread),
            should_run,
            unparker,
        })
    }

    /// Wake handle for the audio thread; `unpark` is wait-free.
    pub fn unparker(&self) -> Unparker {
        self.unparker.clone()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.should_run.store(false, Ordering::Release);
        self.unparker.unpark();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run(
    mut convolvers: Vec<Convolver>,
    in_rx: &FifoConsumer,
    out_tx: &FifoProducer,
    cmd_rx: &Receiver<WorkerCommand>,
    parker: &Parker,
    should_run: &AtomicBool,
    num_channels: usize,
    bin_size: usize,
    bin_period: usize,
) {
    let mut input = AudioBuffer::new(num_channels, bin_size);
    let mut output = AudioBuffer::new(num_channels, bin_size);
    let mut bin_index = 0usize;

    while should_run.load(Ordering::Acquire) {
        parker.park();

        while let Ok(cmd) = cmd_rx.try_recv() {
            match cmd {
                WorkerCommand::SetKernel(spectra) => {
                    for (conv, s) in convolvers.iter_mut().zip(spectra) {
                        conv.set_kernel(Some(s));
                    }
                }
            }
        }

        // Drain everything buffered: one block in, one block out, in
        // lockstep with the audio thread's bin counter.
        while in_rx.read_space() >= bin_size && out_tx.write_space() >= bin_size {
            in_rx.read(&mut input, bin_size, false);

            output.clear();
            for conv in &mut convolvers {
                conv.push(&input);
                conv.compute(bin_index);
                conv.pull(&mut output, bin_size);
            }
            bin_index = (bin_index + 1) & bin_period;

            out_tx.write(&output, bin_size);
        }
    }

    debug!("convolution worker exiting");
}

#[cfg(target_os = "linux")]
fn set_realtime_priority() {
    let requested = std::env::var(SCHED_PRIO_ENV)
        .ok()
        .and_then(|v| v.parse::<i32>().ok())
        .unwrap_or(DEFAULT_SCHED_PRIO);

    // SAFETY: queries scheduler limits and adjusts only the calling thread.
    unsafe {
        let min = libc::sched_get_priority_min(libc::SCHED_FIFO);
        let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
        let priority = requested.clamp(min, max);
        let param = libc::sched_param {
            sched_priority: priority,
        };

        if libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) == 0 {
            info!("convolution worker running at SCHED_FIFO priority {priority}");
        } else {
            warn!(
                "could not raise worker to SCHED_FIFO priority {priority}; \
                 continuing at normal priority"
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn set_realtime_priority() {
    debug!("worker thread priority elevation not implemented on this platform");
}
