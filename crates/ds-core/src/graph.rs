use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, anyhow};
use ds_config::{StateKeyPolicy, StreamingConfig};
use orion_error::prelude::*;
use orion_error::ErrorOweBase;

use crate::batch::{Batch, JoinKind};
use crate::checkpoint::{BatchSnapshot, CHECKPOINT_VERSION, CheckpointRecord, NodeSnapshot};
use crate::error::{CoreError, CoreReason, CoreResult};
use crate::func::{
    FilterFn, FlatMapFn, MapFn, OutputFn, PartitionFn, ReduceFn, TransformFn, panic_message,
};
use crate::source::Source;
use crate::state::StateStore;
use crate::time::{Time, duration_millis};
use crate::window::{ReducedWindow, WindowSpec, slice};

pub type NodeId = usize;

/// Graph shared between the stream handles that build it and the scheduler
/// that evaluates it.
pub type SharedGraph = Arc<Mutex<StreamGraph>>;

// ---------------------------------------------------------------------------
// Op — closed set of node kinds
// ---------------------------------------------------------------------------

pub(crate) enum Op {
    Input {
        source: usize,
    },
    Map(MapFn),
    FlatMap(FlatMapFn),
    Filter(FilterFn),
    MapPartitions(PartitionFn),
    Glom,
    Repartition(usize),
    PartitionBy(usize),
    MapValues(MapFn),
    FlatMapValues(FlatMapFn),
    Count,
    Reduce(ReduceFn),
    CountByValue(usize),
    ReduceByKey(ReduceFn, usize),
    GroupByKey(usize),
    CombineByKey {
        create: MapFn,
        merge_value: ReduceFn,
        merge_combiners: ReduceFn,
        partitions: usize,
    },
    Union,
    Cogroup(usize),
    Join {
        kind: JoinKind,
        partitions: usize,
    },
    Transform(TransformFn),
    Window(WindowSpec),
    ReducedWindow(ReducedWindow),
    UpdateState(StateStore),
}

impl Op {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Op::Input { .. } => "input",
            Op::Map(_) => "map",
            Op::FlatMap(_) => "flat_map",
            Op::Filter(_) => "filter",
            Op::MapPartitions(_) => "map_partitions",
            Op::Glom => "glom",
            Op::Repartition(_) => "repartition",
            Op::PartitionBy(_) => "partition_by",
            Op::MapValues(_) => "map_values",
            Op::FlatMapValues(_) => "flat_map_values",
            Op::Count => "count",
            Op::Reduce(_) => "reduce",
            Op::CountByValue(_) => "count_by_value",
            Op::ReduceByKey(..) => "reduce_by_key",
            Op::GroupByKey(_) => "group_by_key",
            Op::CombineByKey { .. } => "combine_by_key",
            Op::Union => "union",
            Op::Cogroup(_) => "cogroup",
            Op::Join { kind, .. } => kind.label(),
            Op::Transform(_) => "transform",
            Op::Window(_) => "window",
            Op::ReducedWindow(_) => "reduced_window",
            Op::UpdateState(_) => "update_state_by_key",
        }
    }

    /// Name plus the parameters that change what a checkpoint means.
    fn describe(&self) -> String {
        let ms = duration_millis;
        match self {
            Op::Window(spec) => format!(
                "window({}ms,{}ms)",
                ms(spec.window()),
                ms(spec.slide())
            ),
            Op::ReducedWindow(rw) => format!(
                "reduced_window({}ms,{}ms)",
                ms(rw.spec.window()),
                ms(rw.spec.slide())
            ),
            Op::Repartition(n)
            | Op::PartitionBy(n)
            | Op::CountByValue(n)
            | Op::ReduceByKey(_, n)
            | Op::GroupByKey(n)
            | Op::Cogroup(n)
            | Op::CombineByKey { partitions: n, .. }
            | Op::Join { partitions: n, .. } => format!("{}({n})", self.name()),
            _ => self.name().to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

pub(crate) struct Node {
    op: Op,
    parents: Vec<NodeId>,
    slide: Duration,
    remember: Duration,
    /// How long generated batches are kept; set by `prepare`.
    retention: Duration,
    active: bool,
    generated: BTreeMap<Time, Batch>,
}

impl Node {
    fn new(op: Op, parents: Vec<NodeId>, slide: Duration) -> Self {
        Self {
            op,
            parents,
            slide,
            remember: Duration::ZERO,
            retention: slide,
            active: false,
            generated: BTreeMap::new(),
        }
    }

    /// Whether the node's history outlives the tick that produced it.
    fn keeps_history(&self) -> bool {
        self.retention > self.slide || matches!(self.op, Op::ReducedWindow(_))
    }

    fn evaluate(
        &mut self,
        earlier: &[Node],
        sources: &mut [Box<dyn Source>],
        time: Time,
    ) -> anyhow::Result<Batch> {
        let parent_at = |idx: usize| -> anyhow::Result<&Batch> {
            let id = self.parents[idx];
            earlier[id]
                .generated
                .get(&time)
                .ok_or_else(|| anyhow!("node {id} has no batch at {time}"))
        };
        let batch = match &mut self.op {
            Op::Input { source } => {
                let src = &mut sources[*source];
                src.poll(time)
                    .with_context(|| format!("{} source poll failed", src.kind()))?
            }
            Op::Map(f) => parent_at(0)?.map(|v| f(v)),
            Op::FlatMap(f) => parent_at(0)?.flat_map(|v| f(v)),
            Op::Filter(f) => parent_at(0)?.filter(|v| f(v)),
            Op::MapPartitions(f) => parent_at(0)?.map_partitions(|p| f(p)),
            Op::Glom => parent_at(0)?.glom(),
            Op::Repartition(n) => parent_at(0)?.repartition(*n),
            Op::PartitionBy(n) => parent_at(0)?.partition_by(*n),
            Op::MapValues(f) => parent_at(0)?.map_values(|v| f(v)),
            Op::FlatMapValues(f) => parent_at(0)?.flat_map_values(|v| f(v)),
            Op::Count => Batch::single(parent_at(0)?.count()),
            Op::Reduce(f) => match parent_at(0)?.reduce(|a, b| f(a, b)) {
                Some(v) => Batch::single(v),
                None => Batch::empty(),
            },
            Op::CountByValue(n) => parent_at(0)?.count_by_value(*n),
            Op::ReduceByKey(f, n) => parent_at(0)?.reduce_by_key(|a, b| f(a, b), *n),
            Op::GroupByKey(n) => parent_at(0)?.group_by_key(*n),
            Op::CombineByKey {
                create,
                merge_value,
                merge_combiners,
                partitions,
            } => parent_at(0)?.combine_by_key(
                |v| create(v),
                |a, b| merge_value(a, b),
                |a, b| merge_combiners(a, b),
                *partitions,
            ),
            Op::Union => {
                let parents = (0..self.parents.len())
                    .map(parent_at)
                    .collect::<anyhow::Result<Vec<_>>>()?;
                Batch::union_all(parents)
            }
            Op::Cogroup(n) => {
                let first = parent_at(0)?;
                let rest = (1..self.parents.len())
                    .map(|i| parent_at(i).cloned())
                    .collect::<anyhow::Result<Vec<_>>>()?;
                first.cogroup(&rest, *n)
            }
            Op::Join { kind, partitions } => {
                parent_at(0)?.join(parent_at(1)?, *kind, *partitions)
            }
            Op::Transform(f) => {
                let inputs = (0..self.parents.len())
                    .map(|i| parent_at(i).cloned())
                    .collect::<anyhow::Result<Vec<_>>>()?;
                f(time, &inputs)?
            }
            Op::Window(spec) => {
                let parent = &earlier[self.parents[0]].generated;
                slice(parent, spec.start(time), time)
            }
            Op::ReducedWindow(rw) => {
                let parent = &earlier[self.parents[0]].generated;
                let previous = self.generated.get(&(time - rw.spec.slide()));
                rw.compute(time, parent, previous)
            }
            Op::UpdateState(store) => {
                let id = self.parents[0];
                let input = earlier[id]
                    .generated
                    .get(&time)
                    .ok_or_else(|| anyhow!("node {id} has no batch at {time}"))?;
                store.apply(time, input)
            }
        };
        Ok(batch)
    }
}

// ---------------------------------------------------------------------------
// Tick plan
// ---------------------------------------------------------------------------

/// A node whose evaluation failed during a tick.
#[derive(Debug)]
pub struct NodeFailure {
    pub node: NodeId,
    pub op: &'static str,
    pub error: CoreError,
}

/// One output action bound to the batch it consumes.
pub struct OutputJob {
    index: usize,
    node: NodeId,
    time: Time,
    batch: Batch,
    action: OutputFn,
}

impl OutputJob {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn time(&self) -> Time {
        self.time
    }

    /// Run the action; a returned error or a panic becomes a transformation error.
    pub fn run(&self) -> CoreResult<()> {
        match panic::catch_unwind(AssertUnwindSafe(|| (self.action)(self.time, &self.batch))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => StructError::from(CoreReason::Transformation)
                .with_detail(format!("output {} at {}: {e:#}", self.index, self.time))
                .err(),
            Err(payload) => StructError::from(CoreReason::Transformation)
                .with_detail(format!(
                    "output {} at {} panicked: {}",
                    self.index,
                    self.time,
                    panic_message(payload.as_ref())
                ))
                .err(),
        }
    }
}

/// Everything `generate` produced for one tick.
pub struct TickPlan {
    pub time: Time,
    pub jobs: Vec<OutputJob>,
    pub failures: Vec<NodeFailure>,
    /// Outputs not run because an upstream node failed.
    pub skipped_outputs: usize,
    pub records_ingested: usize,
    pub nodes_computed: usize,
}

// ---------------------------------------------------------------------------
// StreamGraph
// ---------------------------------------------------------------------------

struct Output {
    node: NodeId,
    action: OutputFn,
}

/// Arena of stream nodes plus their sources and output actions.
///
/// Nodes only reference parents created before them, so arena order is a
/// topological order. The scheduler is the only caller of the tick methods.
pub struct StreamGraph {
    batch_duration: Duration,
    default_partitions: usize,
    state_policy: StateKeyPolicy,
    state_partitions: usize,
    remember: Duration,
    nodes: Vec<Node>,
    sources: Vec<Box<dyn Source>>,
    outputs: Vec<Output>,
    prepared: bool,
}

impl StreamGraph {
    pub fn new(config: &StreamingConfig) -> Self {
        Self {
            batch_duration: config.batch_duration,
            default_partitions: config.default_parallelism.max(1),
            state_policy: config.state.key_policy,
            state_partitions: config.state_partitions().max(1),
            remember: config.remember,
            nodes: Vec::new(),
            sources: Vec::new(),
            outputs: Vec::new(),
            prepared: false,
        }
    }

    pub fn shared(self) -> SharedGraph {
        Arc::new(Mutex::new(self))
    }

    pub fn batch_duration(&self) -> Duration {
        self.batch_duration
    }

    pub fn default_partitions(&self) -> usize {
        self.default_partitions
    }

    pub(crate) fn state_store(&self, update: crate::func::UpdateFn) -> StateStore {
        StateStore::new(update, self.state_policy, self.state_partitions)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn output_count(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_prepared(&self) -> bool {
        self.prepared
    }

    // -- construction ------------------------------------------------------

    pub(crate) fn add_source(&mut self, source: Box<dyn Source>) -> NodeId {
        let idx = self.sources.len();
        self.sources.push(source);
        self.push(Node::new(
            Op::Input { source: idx },
            Vec::new(),
            self.batch_duration,
        ))
    }

    /// Add a node with one parent; it ticks at the parent's slide unless
    /// the op carries its own.
    pub(crate) fn add_unary(&mut self, op: Op, parent: NodeId) -> NodeId {
        let slide = match &op {
            Op::Window(spec) => spec.slide(),
            Op::ReducedWindow(rw) => rw.spec.slide(),
            _ => self.nodes[parent].slide,
        };
        self.push(Node::new(op, vec![parent], slide))
    }

    /// Add a node over several parents, which must share one slide.
    pub(crate) fn add_nary(&mut self, op: Op, parents: Vec<NodeId>) -> CoreResult<NodeId> {
        let Some(&first) = parents.first() else {
            return StructError::from(CoreReason::Configuration)
                .with_detail(format!("{} needs at least one parent stream", op.name()))
                .err();
        };
        let slide = self.nodes[first].slide;
        if let Some(&other) = parents.iter().find(|p| self.nodes[**p].slide != slide) {
            return StructError::from(CoreReason::Configuration)
                .with_detail(format!(
                    "{} over streams with different slides ({:?} vs {:?})",
                    op.name(),
                    slide,
                    self.nodes[other].slide
                ))
                .err();
        }
        Ok(self.push(Node::new(op, parents, slide)))
    }

    fn push(&mut self, node: Node) -> NodeId {
        self.nodes.push(node);
        self.nodes.len() - 1
    }

    pub(crate) fn slide(&self, id: NodeId) -> Duration {
        self.nodes[id].slide
    }

    pub(crate) fn set_remember(&mut self, id: NodeId, remember: Duration) -> CoreResult<()> {
        self.ensure_unprepared("remember durations")?;
        self.nodes[id].remember = remember;
        Ok(())
    }

    /// Keep every node's history for at least `remember`.
    pub fn remember(&mut self, remember: Duration) -> CoreResult<()> {
        self.ensure_unprepared("remember durations")?;
        self.remember = remember;
        Ok(())
    }

    pub(crate) fn add_output(&mut self, node: NodeId, action: OutputFn) -> CoreResult<()> {
        self.ensure_unprepared("output operations")?;
        self.outputs.push(Output { node, action });
        Ok(())
    }

    /// Retention and outputs are fixed once `prepare` has run.
    fn ensure_unprepared(&self, what: &str) -> CoreResult<()> {
        if self.prepared {
            return StructError::from(CoreReason::Graph)
                .with_detail(format!("{what} cannot be changed after the context has started"))
                .err();
        }
        Ok(())
    }

    /// Identifies the graph shape; a checkpoint only restores onto a graph
    /// with the same fingerprint.
    pub fn fingerprint(&self) -> String {
        let mut out = String::new();
        for (id, node) in self.nodes.iter().enumerate() {
            let _ = write!(out, "{id}:{}", node.op.describe());
            if let Op::Input { source } = node.op {
                let _ = write!(out, "[{}]", self.sources[source].kind());
            }
            let _ = write!(out, "{:?};", node.parents);
        }
        for out_node in &self.outputs {
            let _ = write!(out, "out:{};", out_node.node);
        }
        out
    }

    /// Freeze the graph: mark nodes reachable from outputs and work out how
    /// long each one keeps its generated batches.
    pub fn prepare(&mut self) -> CoreResult<()> {
        if self.outputs.is_empty() {
            return StructError::from(CoreReason::Graph)
                .with_detail("no output operations registered, so nothing to execute")
                .err();
        }
        for node in &mut self.nodes {
            node.active = false;
            node.retention = Duration::ZERO;
        }
        for out in &self.outputs {
            self.nodes[out.node].active = true;
        }
        for id in (0..self.nodes.len()).rev() {
            let node = &mut self.nodes[id];
            if !node.active {
                continue;
            }
            node.retention = node
                .retention
                .max(node.slide)
                .max(node.remember)
                .max(self.remember);
            let needed = match &node.op {
                Op::Window(spec) => spec.window(),
                Op::ReducedWindow(rw) => rw.parent_retention(),
                _ => node.slide,
            };
            for p in node.parents.clone() {
                let parent = &mut self.nodes[p];
                parent.active = true;
                parent.retention = parent.retention.max(needed);
            }
        }
        let active = self.nodes.iter().filter(|n| n.active).count();
        log::debug!(
            "stream graph prepared: {active}/{} nodes active, {} outputs",
            self.nodes.len(),
            self.outputs.len()
        );
        self.prepared = true;
        Ok(())
    }

    // -- per tick ----------------------------------------------------------

    /// Evaluate every active node due at `time` and bind output jobs.
    ///
    /// A failing node does not abort the tick: its descendants are skipped
    /// and the failure is reported in the plan.
    pub fn generate(&mut self, time: Time) -> CoreResult<TickPlan> {
        if !self.prepared {
            return StructError::from(CoreReason::Graph)
                .with_detail("graph has not been prepared")
                .err();
        }
        let mut plan = TickPlan {
            time,
            jobs: Vec::new(),
            failures: Vec::new(),
            skipped_outputs: 0,
            records_ingested: 0,
            nodes_computed: 0,
        };
        let mut failed: BTreeSet<NodeId> = BTreeSet::new();

        for id in 0..self.nodes.len() {
            let (earlier, rest) = self.nodes.split_at_mut(id);
            let node = &mut rest[0];
            if !node.active || !time.is_boundary(node.slide) {
                continue;
            }
            if node.parents.iter().any(|p| failed.contains(p)) {
                failed.insert(id);
                continue;
            }
            let sources = &mut self.sources;
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| node.evaluate(earlier, sources, time)));
            let detail = match outcome {
                Ok(Ok(batch)) => {
                    if matches!(node.op, Op::Input { .. }) {
                        plan.records_ingested += batch.len();
                    }
                    node.generated.insert(time, batch);
                    plan.nodes_computed += 1;
                    continue;
                }
                Ok(Err(e)) => format!("{e:#}"),
                Err(payload) => format!("panicked: {}", panic_message(payload.as_ref())),
            };
            failed.insert(id);
            plan.failures.push(NodeFailure {
                node: id,
                op: node.op.name(),
                error: StructError::from(CoreReason::Transformation)
                    .with_detail(format!("{} node {id} at {time}: {detail}", node.op.name())),
            });
        }

        for (index, out) in self.outputs.iter().enumerate() {
            let node = &self.nodes[out.node];
            if !time.is_boundary(node.slide) {
                continue;
            }
            match node.generated.get(&time) {
                Some(batch) if !failed.contains(&out.node) => plan.jobs.push(OutputJob {
                    index,
                    node: out.node,
                    time,
                    batch: batch.clone(),
                    action: out.action.clone(),
                }),
                _ => plan.skipped_outputs += 1,
            }
        }
        Ok(plan)
    }

    /// Drop generated batches that no consumer can ask for after `time`.
    pub fn clear_metadata(&mut self, time: Time) {
        for node in &mut self.nodes {
            let retention = node.retention;
            node.generated.retain(|t, _| *t + retention > time);
        }
    }

    /// Tell every source that input up to `time` needs no replay.
    pub fn commit_sources(&mut self, time: Time) {
        for source in &mut self.sources {
            source.commit(time);
        }
    }

    pub fn has_pending_input(&self) -> bool {
        self.sources.iter().any(|s| s.has_pending())
    }

    /// Number of keys held across all stateful nodes.
    pub fn state_key_count(&self) -> usize {
        self.nodes
            .iter()
            .map(|n| match &n.op {
                Op::UpdateState(store) => store.len(),
                _ => 0,
            })
            .sum()
    }

    // -- checkpointing -----------------------------------------------------

    /// Capture window histories, state and source positions after `time`.
    pub fn snapshot(&self, time: Time) -> CheckpointRecord {
        let nodes = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.active)
            .filter_map(|(id, n)| {
                let state = match &n.op {
                    Op::UpdateState(store) => Some(
                        store
                            .entries()
                            .iter()
                            .map(|(k, e)| (k.clone(), e.clone()))
                            .collect::<Vec<_>>(),
                    ),
                    _ => None,
                };
                let history: Vec<BatchSnapshot> = if n.keeps_history() {
                    n.generated
                        .iter()
                        .map(|(t, b)| BatchSnapshot::capture(*t, b))
                        .collect()
                } else {
                    Vec::new()
                };
                if history.is_empty() && state.is_none() {
                    return None;
                }
                Some(NodeSnapshot {
                    node: id,
                    op: n.op.name().to_string(),
                    history,
                    state,
                })
            })
            .collect();

        CheckpointRecord {
            version: CHECKPOINT_VERSION,
            time,
            batch_duration_ms: duration_millis(self.batch_duration),
            fingerprint: self.fingerprint(),
            nodes,
            sources: self.sources.iter().map(|s| s.position()).collect(),
        }
    }

    /// Load a checkpoint taken from a graph with the same shape. Returns the
    /// checkpoint's time; the next tick is one batch duration later.
    pub fn restore(&mut self, record: &CheckpointRecord) -> CoreResult<Time> {
        if record.batch_duration_ms != duration_millis(self.batch_duration) {
            return recovery_err(format!(
                "checkpoint batch duration {}ms differs from configured {}ms",
                record.batch_duration_ms,
                duration_millis(self.batch_duration)
            ));
        }
        let fingerprint = self.fingerprint();
        if record.fingerprint != fingerprint {
            return recovery_err(format!(
                "checkpoint was taken from a different pipeline (expected `{fingerprint}`, found `{}`)",
                record.fingerprint
            ));
        }
        if record.sources.len() != self.sources.len() {
            return recovery_err(format!(
                "checkpoint has {} source positions, pipeline has {} sources",
                record.sources.len(),
                self.sources.len()
            ));
        }
        for snap in &record.nodes {
            let Some(node) = self.nodes.get_mut(snap.node) else {
                return recovery_err(format!("checkpoint names unknown node {}", snap.node));
            };
            if node.op.name() != snap.op {
                return recovery_err(format!(
                    "node {} is `{}` but the checkpoint recorded `{}`",
                    snap.node,
                    node.op.name(),
                    snap.op
                ));
            }
            node.generated = snap
                .history
                .iter()
                .cloned()
                .map(BatchSnapshot::into_batch)
                .collect();
            match (&mut node.op, &snap.state) {
                (Op::UpdateState(store), Some(entries)) => store.restore(entries.clone()),
                (_, None) => {}
                (_, Some(_)) => {
                    return recovery_err(format!(
                        "checkpoint holds state for stateless node {}",
                        snap.node
                    ));
                }
            }
        }
        for (source, pos) in self.sources.iter_mut().zip(&record.sources) {
            source
                .restore(pos, record.time)
                .owe(CoreReason::Recovery)?;
        }
        log::info!(
            "restored {} node snapshots and {} source positions at {}",
            record.nodes.len(),
            record.sources.len(),
            record.time
        );
        Ok(record.time)
    }
}

fn recovery_err<T>(detail: String) -> CoreResult<T> {
    StructError::from(CoreReason::Recovery)
        .with_detail(detail)
        .err()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
