#[macro_use]
mod log_macros;

pub mod checkpoint;
pub mod context;
pub mod error;
pub mod metrics;
mod scheduler;
pub mod signal;
pub mod tracing_init;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub use context::{ContextState, StreamingContext};
pub use error::{RuntimeError, RuntimeReason, RuntimeResult};
pub use metrics::{MetricsSnapshot, SchedulerMetrics};
pub use signal::stop_on_signal;
pub use tracing_init::init_tracing;
