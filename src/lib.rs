//! A Tokio-based bounded worker pool and cancellable pipeline toolkit:
//! producers, transform stages, fan-out and fan-in, and a stream
//! multiplexer, all unwinding cooperatively on a shared `CancellationToken`.

pub mod cancel;
mod counter;
mod error;
mod multiplex;
mod observer;
mod parallel;
mod pipeline;
mod pool;
mod stage;
pub mod stream;
mod task;
mod wait_group;

pub use counter::Counter;
pub use error::{PipelineError, PoolError, TaskError};
pub use multiplex::{concatenate, multiplex, Multiplexer};
pub use observer::{EngineEvent, ExitReason, Observer, StageState};
pub use parallel::process_items;
pub use pipeline::Pipeline;
pub use pool::{PoolConfig, ResultCapacity, WorkerPool};
pub use stage::StageOptions;
pub use task::{Task, TaskResult, TaskStatus};
pub use wait_group::{WaitGroup, WaitGuard};

pub use tokio_util::sync::CancellationToken;
