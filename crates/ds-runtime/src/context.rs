use orion_error::ErrorOweBase;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use orion_error::op_context;
use orion_error::prelude::*;
use tokio::net::TcpListener;
use tokio::sync::watch;

use ds_config::StreamingConfig;
use ds_core::{
    Batch, ComputeContext, CoreReason, DStream, QueueSource, ReceiverBuffer, SharedGraph, Source,
    StreamGraph, Time, Value,
};

use crate::checkpoint::{CheckpointManager, CheckpointStore, FileCheckpointStore};
use crate::error::{RuntimeReason, RuntimeResult};
use crate::metrics::{SchedulerMetrics, run_metrics_task};
use crate::scheduler::{Scheduler, StopSignal};

/// Lifecycle of a [`StreamingContext`]. A stopped context never restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Initialized,
    Active,
    Stopped,
}

/// State shared with the task that supervises the scheduler.
struct Lifecycle {
    state: Mutex<ContextState>,
    stop: Arc<StopSignal>,
    done: watch::Sender<bool>,
    failure: Mutex<Option<String>>,
}

impl Lifecycle {
    fn state(&self) -> MutexGuard<'_, ContextState> {
        self.state.lock().expect("context state lock poisoned")
    }

    fn finish(&self, outcome: RuntimeResult<()>) {
        if let Err(e) = outcome {
            ds_error!(sys, error = %e, "streaming context terminated with error");
            *self.failure.lock().expect("context failure lock poisoned") = Some(e.to_string());
        }
        *self.state() = ContextState::Stopped;
        self.stop.request(false);
        self.done.send_replace(true);
    }

    async fn wait_done(&self) {
        let mut rx = self.done.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }
}

// ---------------------------------------------------------------------------
// StreamingContext
// ---------------------------------------------------------------------------

/// Entry point of a streaming application.
///
/// Build streams with the constructors, register outputs on them, then
/// [`start`](Self::start). All methods take `&self` so the context can be
/// shared (for example with a signal handler) once started.
pub struct StreamingContext {
    config: StreamingConfig,
    compute: ComputeContext,
    graph: SharedGraph,
    metrics: Arc<SchedulerMetrics>,
    store: Mutex<Option<Arc<dyn CheckpointStore>>>,
    resume_from: Mutex<Option<Time>>,
    lifecycle: Arc<Lifecycle>,
}

impl StreamingContext {
    /// Validate `config` and create a context with its own compute context.
    /// A `[checkpoint] dir` in the config attaches a file checkpoint store.
    pub fn new(config: StreamingConfig) -> RuntimeResult<Self> {
        let compute = ComputeContext::new(config.default_parallelism);
        Self::with_compute(config, compute)
    }

    /// Create a context on top of an existing compute context.
    pub fn with_compute(config: StreamingConfig, compute: ComputeContext) -> RuntimeResult<Self> {
        config
            .validate()
            .owe(RuntimeReason::Core(CoreReason::Configuration))?;
        let store = config.checkpoint.dir.as_ref().map(|dir| {
            Arc::new(FileCheckpointStore::new(dir, config.checkpoint.retain))
                as Arc<dyn CheckpointStore>
        });
        let (done, _) = watch::channel(false);
        Ok(Self {
            graph: StreamGraph::new(&config).shared(),
            config,
            compute,
            metrics: Arc::new(SchedulerMetrics::new()),
            store: Mutex::new(store),
            resume_from: Mutex::new(None),
            lifecycle: Arc::new(Lifecycle {
                state: Mutex::new(ContextState::Initialized),
                stop: Arc::new(StopSignal::default()),
                done,
                failure: Mutex::new(None),
            }),
        })
    }

    /// Recover a pipeline from the newest checkpoint in `store`, or build a
    /// fresh one.
    ///
    /// `recipe` runs on both paths; closures cannot be persisted, so the
    /// pipeline is always rebuilt and only data is restored on top of it. A
    /// newest checkpoint that is unreadable or was taken from a different
    /// pipeline is a `Recovery` error.
    #[tracing::instrument(name = "streaming.get_or_create", skip_all, fields(store = %store.location()))]
    pub async fn get_or_create(
        store: Arc<dyn CheckpointStore>,
        recipe: impl FnOnce() -> RuntimeResult<StreamingContext>,
    ) -> RuntimeResult<StreamingContext> {
        let mut op = op_context!("checkpoint-recover").with_auto_log();
        op.record("store", store.location().as_str());

        let latest = store.read_latest().await?;
        let ctx = recipe()?;
        ctx.checkpoint(Arc::clone(&store));
        let Some(record) = latest else {
            ds_info!(ckpt, store = %store.location(), "no checkpoint found, starting a fresh pipeline");
            op.mark_suc();
            return Ok(ctx);
        };

        let resumed = {
            let mut graph = ctx.lock_graph();
            graph.prepare().err_conv()?;
            graph.restore(&record).err_conv()?
        };
        *ctx
            .resume_from
            .lock()
            .expect("context resume lock poisoned") = Some(resumed);
        ds_info!(
            ckpt,
            batch_time = resumed.millis(),
            nodes = record.nodes.len(),
            "pipeline recovered from checkpoint"
        );
        op.mark_suc();
        Ok(ctx)
    }

    // -- accessors -----------------------------------------------------------

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn compute(&self) -> &ComputeContext {
        &self.compute
    }

    pub fn graph(&self) -> &SharedGraph {
        &self.graph
    }

    pub fn metrics(&self) -> Arc<SchedulerMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn state(&self) -> ContextState {
        *self.lifecycle.state()
    }

    /// Time the scheduler resumes after, when recovered from a checkpoint.
    pub fn resumed_from(&self) -> Option<Time> {
        *self
            .resume_from
            .lock()
            .expect("context resume lock poisoned")
    }

    // -- configuration -------------------------------------------------------

    /// Write checkpoints to `store` every `checkpoint_interval`.
    pub fn checkpoint(&self, store: Arc<dyn CheckpointStore>) {
        *self.store.lock().expect("context store lock poisoned") = Some(store);
    }

    /// Keep every stream's generated batches for at least `duration`.
    /// Fails once the context has started.
    pub fn remember(&self, duration: Duration) -> RuntimeResult<()> {
        self.lock_graph().remember(duration).err_conv()
    }

    // -- stream constructors -------------------------------------------------

    /// One batch per tick from `batches`, each spread over the default
    /// parallelism.
    pub fn queue_stream<V: Into<Value>>(
        &self,
        batches: impl IntoIterator<Item = Vec<V>>,
    ) -> RuntimeResult<DStream> {
        let batches = batches
            .into_iter()
            .map(|values| self.compute.parallelize(values, None))
            .collect::<Result<Vec<_>, _>>()
            .err_conv()?;
        Ok(self.source_stream(QueueSource::new(batches)))
    }

    /// Queue stream over pre-built batches. With `one_at_a_time = false` the
    /// whole queue is consumed on the first tick; `default` is returned once
    /// the queue is empty.
    pub fn queue_stream_with(
        &self,
        batches: Vec<Batch>,
        one_at_a_time: bool,
        default: Option<Batch>,
    ) -> DStream {
        let mut source = QueueSource::new(batches);
        if !one_at_a_time {
            source = source.all_at_once();
        }
        if let Some(batch) = default {
            source = source.with_default(batch);
        }
        self.source_stream(source)
    }

    /// Stream of whatever external receivers push into `buffer`.
    pub fn receiver_stream(&self, buffer: &ReceiverBuffer) -> DStream {
        self.source_stream(buffer.clone())
    }

    pub fn source_stream(&self, source: impl Source + 'static) -> DStream {
        DStream::from_source(&self.graph, source)
    }

    /// Union of streams sharing one slide duration.
    pub fn union(&self, streams: &[DStream]) -> RuntimeResult<DStream> {
        DStream::union_all(streams).err_conv()
    }

    /// Combine the batches of several streams at each time with `f`.
    pub fn transform(
        &self,
        streams: &[DStream],
        f: impl Fn(Time, &[Batch]) -> anyhow::Result<Batch> + Send + Sync + 'static,
    ) -> RuntimeResult<DStream> {
        DStream::transform_all(streams, Arc::new(f)).err_conv()
    }

    // -- lifecycle -----------------------------------------------------------

    /// Freeze the graph and start ticking on the current tokio runtime.
    #[tracing::instrument(name = "streaming.start", skip_all, fields(batch_ms = self.config.batch_duration.as_millis() as u64))]
    pub async fn start(&self) -> RuntimeResult<()> {
        let mut op = op_context!("streaming-start").with_auto_log();
        op.record("batch_ms", self.config.batch_duration.as_millis().to_string().as_str());

        let (nodes, outputs) = {
            let mut state = self.lifecycle.state();
            match *state {
                ContextState::Active => {
                    return StructError::from(RuntimeReason::AlreadyStarted)
                        .with_detail("streaming context has already been started")
                        .err();
                }
                ContextState::Stopped => {
                    return StructError::from(RuntimeReason::Stopped)
                        .with_detail("a stopped streaming context cannot be restarted")
                        .err();
                }
                ContextState::Initialized => {}
            }
            if self.compute.is_stopped() {
                return StructError::from(RuntimeReason::Stopped)
                    .with_detail("compute context has been stopped")
                    .err();
            }
            let mut graph = self.lock_graph();
            if !graph.is_prepared() {
                graph.prepare().err_conv()?;
            }
            *state = ContextState::Active;
            (graph.node_count(), graph.output_count())
        };

        let store = self
            .store
            .lock()
            .expect("context store lock poisoned")
            .clone();
        let checkpoints = store
            .map(|store| CheckpointManager::new(store, self.config.checkpoint_interval));
        let resume_from = self.resumed_from();
        let scheduler = Scheduler::new(
            Arc::clone(&self.graph),
            &self.config,
            checkpoints,
            Arc::clone(&self.metrics),
            Arc::clone(&self.lifecycle.stop),
            resume_from.unwrap_or(Time::ZERO),
        );

        if self.config.metrics.enabled {
            self.spawn_metrics_exporter().await;
        }

        let scheduler_task = tokio::spawn(scheduler.run());
        let lifecycle = Arc::clone(&self.lifecycle);
        tokio::spawn(async move {
            let outcome = match scheduler_task.await {
                Ok(result) => result,
                Err(e) => StructError::from(RuntimeReason::Scheduler)
                    .with_detail(format!("scheduler task join error: {e}"))
                    .err(),
            };
            lifecycle.finish(outcome);
        });

        ds_info!(
            sys,
            nodes,
            outputs,
            resumed_from = ?resume_from.map(Time::millis),
            "streaming context started"
        );
        op.mark_suc();
        Ok(())
    }

    async fn spawn_metrics_exporter(&self) {
        let config = self.config.metrics.clone();
        match TcpListener::bind(&config.prometheus_listen).await {
            Ok(listener) => {
                let metrics = Arc::clone(&self.metrics);
                let cancel = self.lifecycle.stop.token().child_token();
                tokio::spawn(async move {
                    if let Err(e) = run_metrics_task(metrics, config, listener, cancel).await {
                        ds_warn!(res, error = %e, "metrics exporter stopped");
                    }
                });
            }
            Err(e) => {
                ds_warn!(res, listen = %config.prometheus_listen, error = %e, "metrics exporter disabled, bind failed");
            }
        }
    }

    /// Stop ticking. Idempotent.
    ///
    /// `graceful` first drains input the sources still buffer. Returns once
    /// the scheduler has exited. The compute context stays usable unless
    /// `stop_compute` is set.
    pub async fn stop(&self, graceful: bool, stop_compute: bool) {
        let previous = {
            let mut state = self.lifecycle.state();
            std::mem::replace(&mut *state, ContextState::Stopped)
        };
        match previous {
            ContextState::Initialized => {
                self.lifecycle.done.send_replace(true);
                ds_info!(sys, "streaming context stopped before it was started");
            }
            ContextState::Active => {
                ds_info!(sys, graceful, "stopping streaming context");
                self.lifecycle.stop.request(graceful);
                self.lifecycle.wait_done().await;
                ds_info!(sys, "streaming context stopped");
            }
            ContextState::Stopped => {
                ds_debug!(sys, "streaming context already stopped");
            }
        }
        if stop_compute {
            self.compute.stop();
        }
    }

    /// Wait until the context stops. Reports a scheduler failure (for
    /// example a halt after a failed transformation).
    pub async fn await_termination(&self) -> RuntimeResult<()> {
        self.lifecycle.wait_done().await;
        self.termination_outcome()
    }

    /// Like [`await_termination`](Self::await_termination) with a bound.
    /// `Ok(false)` means the context is still running.
    pub async fn await_termination_timeout(&self, limit: Duration) -> RuntimeResult<bool> {
        match tokio::time::timeout(limit, self.lifecycle.wait_done()).await {
            Ok(()) => self.termination_outcome().map(|()| true),
            Err(_) => Ok(false),
        }
    }

    fn termination_outcome(&self) -> RuntimeResult<()> {
        let failure = self
            .lifecycle
            .failure
            .lock()
            .expect("context failure lock poisoned")
            .clone();
        match failure {
            Some(detail) => StructError::from(RuntimeReason::Scheduler)
                .with_detail(detail)
                .err(),
            None => Ok(()),
        }
    }

    fn lock_graph(&self) -> MutexGuard<'_, StreamGraph> {
        self.graph.lock().expect("stream graph lock poisoned")
    }
}
