use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use orion_error::prelude::*;

use crate::batch::Batch;
use crate::error::{CoreReason, CoreResult};
use crate::value::Value;

/// Handle to the batch-compute side of the engine.
///
/// Streaming contexts share it; it stays usable after a streaming context
/// stops unless that stop asked for the compute side to stop too.
#[derive(Debug, Clone)]
pub struct ComputeContext {
    inner: Arc<ComputeInner>,
}

#[derive(Debug)]
struct ComputeInner {
    default_parallelism: usize,
    stopped: AtomicBool,
}

impl ComputeContext {
    pub fn new(default_parallelism: usize) -> Self {
        Self {
            inner: Arc::new(ComputeInner {
                default_parallelism: default_parallelism.max(1),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    pub fn default_parallelism(&self) -> usize {
        self.inner.default_parallelism
    }

    /// Build a batch from local values.
    pub fn parallelize<V: Into<Value>>(
        &self,
        values: impl IntoIterator<Item = V>,
        partitions: Option<usize>,
    ) -> CoreResult<Batch> {
        if self.is_stopped() {
            return StructError::from(CoreReason::Graph)
                .with_detail("compute context has been stopped")
                .err();
        }
        let values = values.into_iter().map(Into::into).collect();
        Ok(Batch::from_values(
            values,
            partitions.unwrap_or(self.inner.default_parallelism),
        ))
    }

    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parallelize_uses_default_parallelism() {
        let cc = ComputeContext::new(3);
        let b = cc.parallelize([1, 2, 3, 4, 5, 6], None).unwrap();
        assert_eq!(b.num_partitions(), 3);
        assert_eq!(b.count(), 6);
    }

    #[test]
    fn stopped_context_rejects_work() {
        let cc = ComputeContext::new(1);
        let clone = cc.clone();
        cc.stop();
        assert!(clone.is_stopped());
        assert!(clone.parallelize([1], None).is_err());
    }
}
