pub mod logging;
pub mod metrics;
pub mod streaming;
pub mod types;
mod validate;

pub use logging::{LogFormat, LoggingConfig};
pub use metrics::MetricsConfig;
pub use streaming::{CheckpointConfig, StateConfig, StreamingConfig};
pub use types::{FailurePolicy, HumanDuration, StateKeyPolicy};
