pub mod batch;
pub mod checkpoint;
pub mod compute;
pub mod dstream;
pub mod error;
pub mod func;
pub mod graph;
pub mod source;
pub(crate) mod state;
pub mod time;
pub mod value;
pub mod window;

pub use batch::{Batch, JoinKind};
pub use checkpoint::{CheckpointRecord, NodeSnapshot};
pub use compute::ComputeContext;
pub use dstream::DStream;
pub use error::{CoreError, CoreReason, CoreResult};
pub use graph::{NodeFailure, OutputJob, SharedGraph, StreamGraph, TickPlan};
pub use source::{QueueSource, ReceiverBuffer, Source};
pub use state::StateEntry;
pub use time::Time;
pub use value::Value;
