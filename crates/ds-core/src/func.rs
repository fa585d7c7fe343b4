//! Shared closure types carried by graph nodes.
//!
//! Element-level functions are infallible; a panic inside one is caught at
//! the node boundary and reported as a transformation error. Batch-level
//! callbacks return `anyhow::Result` so callers can fail with context.

use std::sync::Arc;

use crate::batch::Batch;
use crate::time::Time;
use crate::value::Value;

pub type MapFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
pub type FlatMapFn = Arc<dyn Fn(&Value) -> Vec<Value> + Send + Sync>;
pub type FilterFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
pub type PartitionFn = Arc<dyn Fn(&[Value]) -> Vec<Value> + Send + Sync>;
pub type ReduceFn = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;

/// `(new values for the key, previous state) -> next state`; `None` deletes the key.
pub type UpdateFn = Arc<dyn Fn(&[Value], Option<&Value>) -> Option<Value> + Send + Sync>;

/// Batch-to-batch function over one or more parent batches at the same time.
pub type TransformFn = Arc<dyn Fn(Time, &[Batch]) -> anyhow::Result<Batch> + Send + Sync>;

/// Output action invoked once per tick for a terminal stream.
pub type OutputFn = Arc<dyn Fn(Time, &Batch) -> anyhow::Result<()> + Send + Sync>;

/// Render a caught panic payload as text.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
