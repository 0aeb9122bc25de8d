pub mod convolution;
pub mod convolver;
pub mod kernel;
pub mod response;
pub mod worker;

pub use convolution::{Convolution, DEFAULT_SPIN_LIMIT, TraceHook, resolve_rt_split};
pub use convolver::Convolver;
pub use kernel::{KernelSpectra, ModuleSpectra};
pub use response::{Module, Response};
pub use worker::{SCHED_PRIO_ENV, Worker, WorkerCommand};
