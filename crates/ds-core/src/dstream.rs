use std::sync::{Arc, MutexGuard};
use std::time::Duration;

use orion_error::prelude::*;

use crate::batch::{Batch, JoinKind};
use crate::error::{CoreReason, CoreResult};
use crate::func::{FilterFn, OutputFn, ReduceFn, TransformFn};
use crate::graph::{NodeId, Op, SharedGraph, StreamGraph};
use crate::source::Source;
use crate::time::Time;
use crate::value::Value;
use crate::window::{ReducedWindow, WindowSpec};

/// Handle to one node of a stream graph.
///
/// Every transformation adds a node to the shared graph and returns a handle
/// to it; nothing is evaluated until the owning context starts. Handles are
/// cheap to clone and compare by node identity.
#[derive(Clone)]
pub struct DStream {
    graph: SharedGraph,
    id: NodeId,
}

impl std::fmt::Debug for DStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DStream").field("id", &self.id).finish()
    }
}

impl PartialEq for DStream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && Arc::ptr_eq(&self.graph, &other.graph)
    }
}

impl DStream {
    /// Register an input source and return the stream it feeds.
    pub fn from_source(graph: &SharedGraph, source: impl Source + 'static) -> DStream {
        let id = lock(graph).add_source(Box::new(source));
        DStream {
            graph: Arc::clone(graph),
            id,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Interval at which this stream produces batches.
    pub fn slide(&self) -> Duration {
        self.graph().slide(self.id)
    }

    pub fn graph_handle(&self) -> &SharedGraph {
        &self.graph
    }

    fn graph(&self) -> MutexGuard<'_, StreamGraph> {
        lock(&self.graph)
    }

    fn child(&self, id: NodeId) -> DStream {
        DStream {
            graph: Arc::clone(&self.graph),
            id,
        }
    }

    fn unary(&self, op: Op) -> DStream {
        let id = self.graph().add_unary(op, self.id);
        self.child(id)
    }

    fn partitions(&self, partitions: Option<usize>) -> usize {
        partitions.unwrap_or_else(|| self.graph().default_partitions())
    }

    fn window_spec(&self, window: Duration, slide: Option<Duration>) -> CoreResult<WindowSpec> {
        let parent = self.slide();
        WindowSpec::new(window, slide.unwrap_or(parent), parent)
    }

    // -- element-wise ------------------------------------------------------

    pub fn map(&self, f: impl Fn(&Value) -> Value + Send + Sync + 'static) -> DStream {
        self.unary(Op::Map(Arc::new(f)))
    }

    pub fn flat_map(&self, f: impl Fn(&Value) -> Vec<Value> + Send + Sync + 'static) -> DStream {
        self.unary(Op::FlatMap(Arc::new(f)))
    }

    pub fn filter(&self, f: impl Fn(&Value) -> bool + Send + Sync + 'static) -> DStream {
        self.unary(Op::Filter(Arc::new(f)))
    }

    pub fn map_partitions(
        &self,
        f: impl Fn(&[Value]) -> Vec<Value> + Send + Sync + 'static,
    ) -> DStream {
        self.unary(Op::MapPartitions(Arc::new(f)))
    }

    /// One list per partition.
    pub fn glom(&self) -> DStream {
        self.unary(Op::Glom)
    }

    pub fn map_values(&self, f: impl Fn(&Value) -> Value + Send + Sync + 'static) -> DStream {
        self.unary(Op::MapValues(Arc::new(f)))
    }

    pub fn flat_map_values(
        &self,
        f: impl Fn(&Value) -> Vec<Value> + Send + Sync + 'static,
    ) -> DStream {
        self.unary(Op::FlatMapValues(Arc::new(f)))
    }

    pub fn repartition(&self, partitions: usize) -> DStream {
        self.unary(Op::Repartition(partitions.max(1)))
    }

    pub fn partition_by(&self, partitions: Option<usize>) -> DStream {
        let n = self.partitions(partitions);
        self.unary(Op::PartitionBy(n))
    }

    // -- per-batch aggregation --------------------------------------------

    /// Record count of each batch as a one-element batch.
    pub fn count(&self) -> DStream {
        self.unary(Op::Count)
    }

    pub fn reduce(&self, f: impl Fn(&Value, &Value) -> Value + Send + Sync + 'static) -> DStream {
        self.unary(Op::Reduce(Arc::new(f)))
    }

    /// `(value, count)` pairs for each distinct value.
    pub fn count_by_value(&self) -> DStream {
        let n = self.partitions(None);
        self.unary(Op::CountByValue(n))
    }

    pub fn reduce_by_key(
        &self,
        f: impl Fn(&Value, &Value) -> Value + Send + Sync + 'static,
        partitions: Option<usize>,
    ) -> DStream {
        let n = self.partitions(partitions);
        self.unary(Op::ReduceByKey(Arc::new(f), n))
    }

    pub fn group_by_key(&self, partitions: Option<usize>) -> DStream {
        let n = self.partitions(partitions);
        self.unary(Op::GroupByKey(n))
    }

    pub fn combine_by_key(
        &self,
        create: impl Fn(&Value) -> Value + Send + Sync + 'static,
        merge_value: impl Fn(&Value, &Value) -> Value + Send + Sync + 'static,
        merge_combiners: impl Fn(&Value, &Value) -> Value + Send + Sync + 'static,
        partitions: Option<usize>,
    ) -> DStream {
        let n = self.partitions(partitions);
        self.unary(Op::CombineByKey {
            create: Arc::new(create),
            merge_value: Arc::new(merge_value),
            merge_combiners: Arc::new(merge_combiners),
            partitions: n,
        })
    }

    // -- multi-parent ------------------------------------------------------

    pub fn union(&self, other: &DStream) -> CoreResult<DStream> {
        DStream::union_all(&[self.clone(), other.clone()])
    }

    /// `(key, ([values from self], [values from other]))`.
    pub fn cogroup(&self, other: &DStream, partitions: Option<usize>) -> CoreResult<DStream> {
        let n = self.partitions(partitions);
        self.binary(Op::Cogroup(n), other)
    }

    pub fn join(&self, other: &DStream, partitions: Option<usize>) -> CoreResult<DStream> {
        self.join_kind(other, JoinKind::Inner, partitions)
    }

    pub fn left_outer_join(
        &self,
        other: &DStream,
        partitions: Option<usize>,
    ) -> CoreResult<DStream> {
        self.join_kind(other, JoinKind::LeftOuter, partitions)
    }

    pub fn right_outer_join(
        &self,
        other: &DStream,
        partitions: Option<usize>,
    ) -> CoreResult<DStream> {
        self.join_kind(other, JoinKind::RightOuter, partitions)
    }

    pub fn full_outer_join(
        &self,
        other: &DStream,
        partitions: Option<usize>,
    ) -> CoreResult<DStream> {
        self.join_kind(other, JoinKind::FullOuter, partitions)
    }

    fn join_kind(
        &self,
        other: &DStream,
        kind: JoinKind,
        partitions: Option<usize>,
    ) -> CoreResult<DStream> {
        let n = self.partitions(partitions);
        let op = Op::Join {
            kind,
            partitions: n,
        };
        self.binary(op, other)
    }

    fn binary(&self, op: Op, other: &DStream) -> CoreResult<DStream> {
        same_graph(self, other)?;
        let id = self.graph().add_nary(op, vec![self.id, other.id])?;
        Ok(self.child(id))
    }

    /// Apply a batch-level function at every tick.
    pub fn transform(
        &self,
        f: impl Fn(Time, &Batch) -> anyhow::Result<Batch> + Send + Sync + 'static,
    ) -> DStream {
        let wrapped: TransformFn = Arc::new(move |t, batches: &[Batch]| f(t, &batches[0]));
        self.unary(Op::Transform(wrapped))
    }

    /// Combine this stream's batch with `other`'s at every tick.
    pub fn transform_with(
        &self,
        other: &DStream,
        f: impl Fn(Time, &Batch, &Batch) -> anyhow::Result<Batch> + Send + Sync + 'static,
    ) -> CoreResult<DStream> {
        let wrapped: TransformFn =
            Arc::new(move |t, batches: &[Batch]| f(t, &batches[0], &batches[1]));
        self.binary(Op::Transform(wrapped), other)
    }

    /// Concatenate the batches of several streams sharing one graph and slide.
    pub fn union_all(streams: &[DStream]) -> CoreResult<DStream> {
        DStream::transform_all_op(streams, Op::Union)
    }

    /// Apply `f` to the batches of several streams at every tick, in the
    /// order the streams are given.
    pub fn transform_all(streams: &[DStream], f: TransformFn) -> CoreResult<DStream> {
        DStream::transform_all_op(streams, Op::Transform(f))
    }

    fn transform_all_op(streams: &[DStream], op: Op) -> CoreResult<DStream> {
        let Some(first) = streams.first() else {
            return StructError::from(CoreReason::Configuration)
                .with_detail(format!("{} needs at least one stream", op.name()))
                .err();
        };
        for other in &streams[1..] {
            same_graph(first, other)?;
        }
        let parents = streams.iter().map(|s| s.id).collect();
        let id = first.graph().add_nary(op, parents)?;
        Ok(first.child(id))
    }

    // -- windows -----------------------------------------------------------

    /// Union of this stream's batches over the last `window`, every `slide`
    /// (defaults to this stream's slide).
    pub fn window(&self, window: Duration, slide: Option<Duration>) -> CoreResult<DStream> {
        let spec = self.window_spec(window, slide)?;
        Ok(self.unary(Op::Window(spec)))
    }

    /// Number of records in each window.
    pub fn count_by_window(&self, window: Duration, slide: Duration) -> CoreResult<DStream> {
        self.map(|_| Value::Int(1)).reduce_by_window(
            add_values,
            Some(sub_values),
            window,
            Some(slide),
        )
    }

    /// Reduce each window to one value. With an inverse function the window
    /// is maintained incrementally.
    pub fn reduce_by_window(
        &self,
        f: impl Fn(&Value, &Value) -> Value + Send + Sync + 'static,
        inverse: Option<impl Fn(&Value, &Value) -> Value + Send + Sync + 'static>,
        window: Duration,
        slide: Option<Duration>,
    ) -> CoreResult<DStream> {
        let f: ReduceFn = Arc::new(f);
        match inverse {
            None => {
                let per_batch = self.reduce(call2(&f));
                Ok(per_batch.window(window, slide)?.reduce(call2(&f)))
            }
            Some(inverse) => {
                let keyed = self.map(|v| Value::pair(1, v.clone()));
                let reduced = keyed.reduce_by_key_and_window(
                    call2(&f),
                    Some(inverse),
                    window,
                    slide,
                    Some(1),
                    None::<fn(&Value) -> bool>,
                )?;
                Ok(reduced.map(|kv| kv.as_pair().map_or(Value::Null, |(_, v)| v.clone())))
            }
        }
    }

    /// `(value, count)` for each distinct value in the window; values whose
    /// count drops to zero are dropped.
    pub fn count_by_value_and_window(
        &self,
        window: Duration,
        slide: Option<Duration>,
        partitions: Option<usize>,
    ) -> CoreResult<DStream> {
        let keyed = self.map(|v| Value::pair(v.clone(), 1));
        keyed.reduce_by_key_and_window(
            add_values,
            Some(sub_values),
            window,
            slide,
            partitions,
            Some(positive_count),
        )
    }

    /// `(key, [values])` over the window, values in batch-time order.
    pub fn group_by_key_and_window(
        &self,
        window: Duration,
        slide: Option<Duration>,
        partitions: Option<usize>,
    ) -> CoreResult<DStream> {
        Ok(self.window(window, slide)?.group_by_key(partitions))
    }

    /// Per-key reduction over a sliding window.
    ///
    /// With `inverse`, each window is derived from the previous one by
    /// removing what left and adding what entered; `filter` then prunes
    /// keys from the carried result (for example, zero counts). Without it,
    /// every window is reduced from scratch.
    pub fn reduce_by_key_and_window(
        &self,
        f: impl Fn(&Value, &Value) -> Value + Send + Sync + 'static,
        inverse: Option<impl Fn(&Value, &Value) -> Value + Send + Sync + 'static>,
        window: Duration,
        slide: Option<Duration>,
        partitions: Option<usize>,
        filter: Option<impl Fn(&Value) -> bool + Send + Sync + 'static>,
    ) -> CoreResult<DStream> {
        let spec = self.window_spec(window, slide)?;
        let n = self.partitions(partitions);
        let f: ReduceFn = Arc::new(f);
        let filter: Option<FilterFn> = filter.map(|g| Arc::new(g) as FilterFn);
        let reduced = self.reduce_by_key(call2(&f), Some(n));
        match inverse {
            Some(inverse) => {
                let rw = ReducedWindow::new(spec, f, Arc::new(inverse), filter, n);
                Ok(reduced.unary(Op::ReducedWindow(rw)))
            }
            None => {
                let windowed = reduced
                    .unary(Op::Window(spec))
                    .reduce_by_key(call2(&f), Some(n));
                Ok(match filter {
                    Some(g) => windowed.filter(move |kv| g(kv)),
                    None => windowed,
                })
            }
        }
    }

    // -- state -------------------------------------------------------------

    /// Fold each key's new values into its state at every tick.
    ///
    /// `update(new_values, previous)` returns the next state, or `None` to
    /// drop the key. Which idle keys are revisited follows the configured
    /// state key policy.
    pub fn update_state_by_key(
        &self,
        update: impl Fn(&[Value], Option<&Value>) -> Option<Value> + Send + Sync + 'static,
    ) -> DStream {
        let mut graph = self.graph();
        let store = graph.state_store(Arc::new(update));
        let id = graph.add_unary(Op::UpdateState(store), self.id);
        drop(graph);
        self.child(id)
    }

    // -- outputs -----------------------------------------------------------

    /// Run `f` on every batch this stream produces.
    pub fn foreach_batch(
        &self,
        f: impl Fn(Time, &Batch) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> CoreResult<()> {
        let action: OutputFn = Arc::new(f);
        self.graph().add_output(self.id, action)
    }

    /// Print the first `n` records of every batch.
    pub fn print(&self, n: usize) -> CoreResult<()> {
        self.foreach_batch(move |time, batch| {
            println!("-------------------------------------------");
            println!("Time: {time}");
            println!("-------------------------------------------");
            for record in batch.take(n) {
                println!("{record}");
            }
            if batch.len() > n {
                println!("...");
            }
            println!();
            Ok(())
        })
    }

    /// Keep generated batches for at least `duration`. Fails once the
    /// context has started.
    pub fn remember(&self, duration: Duration) -> CoreResult<DStream> {
        self.graph().set_remember(self.id, duration)?;
        Ok(self.clone())
    }
}

fn lock(graph: &SharedGraph) -> MutexGuard<'_, StreamGraph> {
    graph.lock().expect("stream graph lock poisoned")
}

fn same_graph(a: &DStream, b: &DStream) -> CoreResult<()> {
    if Arc::ptr_eq(&a.graph, &b.graph) {
        return Ok(());
    }
    StructError::from(CoreReason::Configuration)
        .with_detail("streams belong to different streaming contexts")
        .err()
}

fn call2(f: &ReduceFn) -> impl Fn(&Value, &Value) -> Value + Send + Sync + 'static {
    let f = Arc::clone(f);
    move |a, b| f(a, b)
}

fn add_values(a: &Value, b: &Value) -> Value {
    a.checked_add(b).unwrap_or(Value::Null)
}

fn sub_values(a: &Value, b: &Value) -> Value {
    a.checked_sub(b).unwrap_or(Value::Null)
}

fn positive_count(kv: &Value) -> bool {
    kv.as_pair().and_then(|(_, v)| v.as_int()).is_some_and(|c| c > 0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
