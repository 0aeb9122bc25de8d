pub mod jack;
pub mod ports;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result, anyhow};
use crossbeam::channel::{Receiver, Sender, bounded};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::buffer::AudioBuffer;
use crate::engine::{
    Convolution, DEFAULT_SPIN_LIMIT, KernelSpectra, ModuleSpectra, Response, resolve_rt_split,
};
use crate::ir::SoundBuffer;

/// Per-instance engine parameters, read once at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineParams {
    pub num_channels: usize,
    /// Longest kernel the instance must accommodate; the partitioning is
    /// laid out for this length, shorter kernels leave the tail silent.
    pub kernel_max_size: usize,
    pub min_part_size: usize,
    pub max_part_size: usize,
    /// Modules `[0, num_rt_procs)` run in the callback; 0 means all.
    pub num_rt_procs: usize,
    pub spin_limit: usize,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            num_channels: 2,
            kernel_max_size: 1 << 17,
            min_part_size: 64,
            max_part_size: 8192,
            num_rt_procs: 1,
            spin_limit: DEFAULT_SPIN_LIMIT,
        }
    }
}

/// Host-side registry of sound buffers the engine can read kernels from.
#[derive(Default)]
pub struct SoundBufferStore {
    buffers: HashMap<u32, Arc<SoundBuffer>>,
}

impl SoundBufferStore {
    pub fn insert(&mut self, id: u32, buffer: SoundBuffer) {
        self.buffers.insert(id, Arc::new(buffer));
    }

    pub fn get(&self, id: u32) -> Option<Arc<SoundBuffer>> {
        self.buffers.get(&id).cloned()
    }

    pub fn remove(&mut self, id: u32) {
        self.buffers.remove(&id);
    }
}

/// Commands travelling from the control thread into the callback. All
/// allocation happens before the send; the callback only moves values.
enum UnitCommand {
    Install {
        engine: Box<Convolution>,
    },
    SetKernel {
        kernel: Arc<KernelSpectra>,
        worker_part: Option<Vec<Arc<ModuleSpectra>>>,
        /// Pre-sized scratch the callback fills with displaced snapshots.
        retired: Vec<Arc<ModuleSpectra>>,
    },
    Release,
}

/// Everything the callback discards goes back to the control thread to be
/// freed there.
enum Retired {
    Engine(Box<Convolution>),
    Kernel {
        kernel: Arc<KernelSpectra>,
        retired: Vec<Arc<ModuleSpectra>>,
        /// Worker part that could not be delivered, if any.
        unapplied: Option<Vec<Arc<ModuleSpectra>>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UnitState {
    Uninitialised,
    Ready,
    Dead,
}

/// Create a controller/unit pair wired through bounded channels. The unit
/// moves into the audio callback; the controller stays with the host.
pub fn create_unit(params: EngineParams) -> (UnitController, ConvolutionUnit) {
    let (tx_commands, rx_commands) = bounded(16);
    let (tx_retired, rx_retired) = bounded(32);

    let unit = ConvolutionUnit {
        input: AudioBuffer::new(params.num_channels, params.min_part_size),
        output: AudioBuffer::new(params.num_channels, params.min_part_size),
        engine: None,
        state: UnitState::Uninitialised,
        rx_commands,
        tx_retired,
        stalled_retirement: None,
    };

    let controller = UnitController {
        params,
        store: SoundBufferStore::default(),
        tx_commands,
        rx_retired,
        response: None,
        num_rt: 0,
        starved: None,
        pending_kernel: None,
    };

    (controller, unit)
}

/// Audio-thread endpoint: a state machine around the installed engine.
/// Emits silence while uninitialised or released.
pub struct ConvolutionUnit {
    input: AudioBuffer,
    output: AudioBuffer,
    engine: Option<Box<Convolution>>,
    state: UnitState,
    rx_commands: Receiver<UnitCommand>,
    tx_retired: Sender<Retired>,
    /// Retirement that did not fit in the channel; flushed before any new
    /// command is taken so the callback never frees or blocks.
    stalled_retirement: Option<Retired>,
}

impl ConvolutionUnit {
    pub fn bin_size(&self) -> usize {
        self.input.num_frames()
    }

    pub fn num_channels(&self) -> usize {
        self.input.num_channels()
    }

    /// Copy one channel of host input into the block scratch, zero-padding
    /// to the bin size.
    pub fn write_input(&mut self, ch: usize, samples: &[f32]) {
        let dst = self.input.channel_mut(ch);
        let n = samples.len().min(dst.len());
        dst[..n].copy_from_slice(&samples[..n]);
        dst[n..].fill(0.0);
    }

    pub fn output(&self) -> &AudioBuffer {
        &self.output
    }

    /// Process one block of `frames <= bin_size` frames from the input
    /// scratch into the output scratch. Applies at most one pending
    /// command first.
    pub fn process(&mut self, frames: usize) {
        self.handle_command();

        if let Some(engine) = self.engine.as_mut() {
            engine.process(&mut self.output, &self.input, frames);
        } else {
            self.output.clear();
        }
    }

    fn handle_command(&mut self) {
        // Never free on this thread: a retirement that found the channel
        // full waits here, and no new command lands until it is through.
        if let Some(stalled) = self.stalled_retirement.take() {
            if let Err(err) = self.tx_retired.try_send(stalled) {
                self.stalled_retirement = Some(err.into_inner());
                return;
            }
        }

        let Ok(command) = self.rx_commands.try_recv() else {
            return;
        };

        match command {
            UnitCommand::Install { engine } => {
                if self.state == UnitState::Dead {
                    // Released units stay dead; bounce the engine back.
                    self.retire(Retired::Engine(engine));
                    return;
                }
                if let Some(old) = self.engine.replace(engine) {
                    self.retire(Retired::Engine(old));
                }
                self.state = UnitState::Ready;
            }
            UnitCommand::SetKernel {
                kernel,
                worker_part,
                mut retired,
            } => {
                let unapplied = match self.engine.as_mut() {
                    Some(engine) => engine.set_kernel(&kernel, worker_part, &mut retired),
                    None => worker_part,
                };
                self.retire(Retired::Kernel {
                    kernel,
                    retired,
                    unapplied,
                });
            }
            UnitCommand::Release => {
                if let Some(old) = self.engine.take() {
                    self.retire(Retired::Engine(old));
                }
                self.state = UnitState::Dead;
            }
        }
    }

    fn retire(&mut self, retired: Retired) {
        if let Err(err) = self.tx_retired.try_send(retired) {
            self.stalled_retirement = Some(err.into_inner());
        }
    }
}

/// Control-thread endpoint: builds engines and kernels off the audio
/// thread, routes them through the command channel, and frees whatever
/// the callback discards.
pub struct UnitController {
    params: EngineParams,
    store: SoundBufferStore,
    tx_commands: Sender<UnitCommand>,
    rx_retired: Receiver<Retired>,
    /// Controller's own copy of the partitioning, for kernel computation.
    response: Option<Response>,
    num_rt: usize,
    starved: Option<Arc<AtomicU64>>,
    /// One kernel request queued while uninitialised.
    pending_kernel: Option<(u32, usize, usize)>,
}

impl UnitController {
    pub fn params(&self) -> &EngineParams {
        &self.params
    }

    pub fn buffers_mut(&mut self) -> &mut SoundBufferStore {
        &mut self.store
    }

    /// Build and install the engine. Heavy lifting (partitioning, FFT
    /// planning, worker spawn) happens here on the control thread; the
    /// callback just swaps a pointer.
    pub fn init(&mut self, realtime: bool) -> Result<()> {
        let p = &self.params;
        let response = Response::new(
            p.num_channels,
            p.kernel_max_size,
            p.min_part_size,
            p.max_part_size,
        )
        .context("invalid engine parameters")?;

        self.num_rt = resolve_rt_split(response.num_modules(), p.num_rt_procs, realtime);

        // The engine takes the partitioning; a clone (module records share
        // their FFT plans) stays here for kernel computation.
        let engine = Convolution::new(response.clone(), p.num_rt_procs, realtime, p.spin_limit)
            .context("failed to build convolution engine")?;

        info!(
            "convolution engine ready: {} modules ({} realtime), {} frames partitioned {}..{}",
            response.num_modules(),
            self.num_rt,
            response.size(),
            p.min_part_size,
            p.max_part_size,
        );

        self.starved = Some(engine.starvation_counter());
        self.response = Some(response);
        self.tx_commands
            .try_send(UnitCommand::Install {
                engine: Box::new(engine),
            })
            .map_err(|_| anyhow!("engine command queue unavailable"))?;

        if let Some((id, offset, frames)) = self.pending_kernel.take() {
            debug!("applying deferred kernel from buffer {id}");
            self.set_kernel(id, offset, frames)?;
        }
        Ok(())
    }

    /// Load buffer `id` as the kernel. Deferred (one deep) while the
    /// engine is not yet initialised.
    pub fn set_kernel(&mut self, id: u32, offset: usize, frames: usize) -> Result<()> {
        let Some(response) = &self.response else {
            debug!("engine not initialised, deferring kernel from buffer {id}");
            self.pending_kernel = Some((id, offset, frames));
            return Ok(());
        };

        let source = self
            .store
            .get(id)
            .ok_or_else(|| anyhow!("no sound buffer with id {id}"))?;

        let kernel = KernelSpectra::compute(response, &source, offset, frames)
            .context("failed to partition kernel")?;

        let worker_part = if self.num_rt < kernel.num_modules() {
            Some(
                (self.num_rt..kernel.num_modules())
                    .map(|i| Arc::clone(kernel.module(i)))
                    .collect(),
            )
        } else {
            None
        };

        self.tx_commands
            .try_send(UnitCommand::SetKernel {
                kernel: Arc::new(kernel),
                worker_part,
                retired: Vec::with_capacity(self.num_rt),
            })
            .map_err(|_| anyhow!("engine command queue unavailable"))?;

        info!("kernel from buffer {id} queued ({offset}+{frames})");
        Ok(())
    }

    /// Tear the engine down; it is freed here once the callback lets go.
    pub fn release(&mut self) -> Result<()> {
        self.response = None;
        self.pending_kernel = None;
        self.tx_commands
            .try_send(UnitCommand::Release)
            .map_err(|_| anyhow!("engine command queue unavailable"))?;
        Ok(())
    }

    /// Free everything the callback has discarded. Call this from the
    /// host's idle loop; dropping a retired engine also joins its worker.
    pub fn drain_retired(&mut self) {
        while let Ok(retired) = self.rx_retired.try_recv() {
            match retired {
                Retired::Engine(_) => debug!("retired engine freed"),
                Retired::Kernel { unapplied, .. } => {
                    if unapplied.is_some() {
                        warn!("worker kernel swap was not delivered; kernel dropped");
                    }
                }
            }
        }
    }

    /// Blocks whose worker contribution was replaced by silence so far.
    pub fn starved_blocks(&self) -> u64 {
        self.starved
            .as_ref()
            .map_or(0, |counter| counter.load(Ordering::Relaxed))
    }
}
