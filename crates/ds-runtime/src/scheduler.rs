use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, MutexGuard};
use std::time::Duration;

use orion_error::prelude::*;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use ds_config::{FailurePolicy, StreamingConfig};
use ds_core::{CoreReason, SharedGraph, StreamGraph, TickPlan, Time};

use crate::checkpoint::CheckpointManager;
use crate::error::{RuntimeError, RuntimeReason, RuntimeResult};
use crate::metrics::SchedulerMetrics;

// ---------------------------------------------------------------------------
// StopSignal — shared between the context and the control loop
// ---------------------------------------------------------------------------

/// One-shot stop request. `graceful` is set before the token is cancelled.
#[derive(Default)]
pub(crate) struct StopSignal {
    cancel: CancellationToken,
    graceful: AtomicBool,
}

impl StopSignal {
    pub(crate) fn request(&self, graceful: bool) {
        self.graceful.store(graceful, Ordering::Release);
        self.cancel.cancel();
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    fn is_graceful(&self) -> bool {
        self.graceful.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Scheduler — the job generator control loop
// ---------------------------------------------------------------------------

/// Timer-driven loop that processes one batch time per tick.
///
/// A tick generates every due node (on the blocking pool), runs the bound
/// output jobs with at most `job_parallelism` in flight, trims node history
/// and checkpoints on interval boundaries. The next tick starts only after
/// all of that finished; a slow tick delays later ones instead of
/// overlapping them, and missed ticks are replayed back to back.
pub(crate) struct Scheduler {
    graph: SharedGraph,
    batch_duration: Duration,
    failure_policy: FailurePolicy,
    graceful_stop_timeout: Duration,
    job_slots: Arc<Semaphore>,
    checkpoints: Option<CheckpointManager>,
    metrics: Arc<SchedulerMetrics>,
    stop: Arc<StopSignal>,
    next_time: Time,
    last_completed: Option<Time>,
}

impl Scheduler {
    pub(crate) fn new(
        graph: SharedGraph,
        config: &StreamingConfig,
        checkpoints: Option<CheckpointManager>,
        metrics: Arc<SchedulerMetrics>,
        stop: Arc<StopSignal>,
        resume_from: Time,
    ) -> Self {
        Self {
            graph,
            batch_duration: config.batch_duration,
            failure_policy: config.failure_policy,
            graceful_stop_timeout: config.graceful_stop_timeout,
            job_slots: Arc::new(Semaphore::new(config.job_parallelism.max(1))),
            checkpoints,
            metrics,
            stop,
            next_time: resume_from + config.batch_duration,
            last_completed: None,
        }
    }

    /// Tick until stopped or halted by a failure.
    ///
    /// A graceful stop keeps ticking while sources hold buffered input (up
    /// to `graceful_stop_timeout`). Every clean exit ends with a checkpoint
    /// of the last completed time when a store is configured.
    #[tracing::instrument(name = "scheduler", skip_all, fields(batch_ms = self.batch_duration.as_millis() as u64))]
    pub(crate) async fn run(mut self) -> RuntimeResult<()> {
        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.batch_duration, self.batch_duration);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
        ds_debug!(sched, first_time = %self.next_time, "scheduler loop started");

        loop {
            tokio::select! {
                biased;
                _ = self.stop.token().cancelled() => break,
                planned = ticker.tick() => self.tick(planned).await?,
            }
        }

        if self.stop.is_graceful() {
            self.drain(&mut ticker).await?;
        }
        if let Some(time) = self.last_completed {
            let written = self.checkpoints.as_ref().and_then(|m| m.last());
            if self.checkpoints.is_some() && written != Some(time) {
                self.checkpoint(time).await;
            }
        }
        ds_debug!(sched, last_time = ?self.last_completed.map(Time::millis), "scheduler loop finished");
        Ok(())
    }

    async fn drain(&mut self, ticker: &mut Interval) -> RuntimeResult<()> {
        let limit = self.graceful_stop_timeout;
        let drained = tokio::time::timeout(limit, async {
            loop {
                let pending = self.lock_graph().has_pending_input();
                if !pending {
                    break;
                }
                let planned = ticker.tick().await;
                self.tick(planned).await?;
            }
            Ok::<(), RuntimeError>(())
        })
        .await;
        match drained {
            Ok(result) => result,
            Err(_) => {
                ds_warn!(
                    sched,
                    timeout_ms = limit.as_millis() as u64,
                    "graceful stop timed out with input still buffered"
                );
                Ok(())
            }
        }
    }

    async fn tick(&mut self, planned: Instant) -> RuntimeResult<()> {
        let time = self.next_time;
        self.next_time = time + self.batch_duration;
        let started = Instant::now();
        let delay = started.saturating_duration_since(planned);
        if self.metrics.observe_scheduling_delay(delay, self.batch_duration) {
            ds_warn!(
                sched,
                batch_time = time.millis(),
                delay_ms = delay.as_millis() as u64,
                "tick started late, processing is falling behind"
            );
        }

        let graph = Arc::clone(&self.graph);
        let plan = tokio::task::spawn_blocking(move || {
            graph
                .lock()
                .expect("stream graph lock poisoned")
                .generate(time)
        })
        .await
        .map_err(|e| {
            StructError::from(RuntimeReason::Scheduler)
                .with_detail(format!("generate task join error: {e}"))
        })?
        .err_conv()?;
        let TickPlan {
            jobs,
            failures,
            skipped_outputs,
            records_ingested,
            nodes_computed,
            ..
        } = plan;

        self.metrics.add_tick_failures(failures.len());
        self.metrics.add_skipped_outputs(skipped_outputs);
        for failure in failures {
            ds_warn!(
                sched,
                batch_time = time.millis(),
                node = failure.node,
                op = failure.op,
                error = %failure.error,
                "transformation failed, downstream outputs skipped"
            );
            if self.failure_policy == FailurePolicy::Halt {
                return Err::<(), _>(failure.error).err_conv();
            }
        }

        let job_count = jobs.len();
        self.metrics.add_jobs(job_count);
        let mut running = JoinSet::new();
        for job in jobs {
            let permit = Arc::clone(&self.job_slots)
                .acquire_owned()
                .await
                .map_err(|e| {
                    StructError::from(RuntimeReason::Scheduler)
                        .with_detail(format!("job slots closed: {e}"))
                })?;
            running.spawn_blocking(move || {
                let _permit = permit;
                (job.index(), job.run())
            });
        }
        let mut halt: Option<RuntimeError> = None;
        while let Some(joined) = running.join_next().await {
            let error: RuntimeError = match joined {
                Ok((_, Ok(()))) => continue,
                Ok((index, Err(e))) => {
                    ds_warn!(sched, batch_time = time.millis(), output = index, error = %e, "output action failed");
                    StructError::from(RuntimeReason::Core(CoreReason::Transformation))
                        .with_detail(e.to_string())
                }
                Err(e) => {
                    ds_error!(sched, batch_time = time.millis(), error = %e, "output job join error");
                    StructError::from(RuntimeReason::Scheduler)
                        .with_detail(format!("output job join error: {e}"))
                }
            };
            self.metrics.inc_job_failure();
            if self.failure_policy == FailurePolicy::Halt && halt.is_none() {
                halt = Some(error);
            }
        }
        if let Some(error) = halt {
            return Err(error);
        }

        let state_keys = {
            let mut graph = self.lock_graph();
            graph.clear_metadata(time);
            graph.state_key_count()
        };
        self.metrics.set_state_keys(state_keys);

        match self.checkpoints.as_ref().map(|m| m.is_due(time)) {
            Some(true) => self.checkpoint(time).await,
            Some(false) => {}
            None => {
                self.lock_graph().commit_sources(time);
            }
        }

        self.last_completed = Some(time);
        let elapsed = started.elapsed();
        self.metrics.complete_tick(time, elapsed, records_ingested);
        ds_debug!(
            sched,
            batch_time = time.millis(),
            nodes = nodes_computed,
            jobs = job_count,
            records = records_ingested,
            elapsed_us = elapsed.as_micros() as u64,
            "tick complete"
        );
        Ok(())
    }

    /// Write a checkpoint for `time`; sources are committed only once it is
    /// durable, so a failed write leaves their input buffered for replay.
    async fn checkpoint(&mut self, time: Time) {
        let Some(manager) = self.checkpoints.as_mut() else {
            return;
        };
        match manager.checkpoint(&self.graph, time).await {
            Ok(elapsed) => {
                self.metrics.observe_checkpoint(elapsed);
                self.lock_graph().commit_sources(time);
                ds_debug!(
                    ckpt,
                    batch_time = time.millis(),
                    elapsed_us = elapsed.as_micros() as u64,
                    "checkpoint complete"
                );
            }
            Err(e) => {
                self.metrics.inc_checkpoint_failure();
                ds_warn!(ckpt, batch_time = time.millis(), error = %e, "checkpoint failed");
            }
        }
    }

    fn lock_graph(&self) -> MutexGuard<'_, StreamGraph> {
        self.graph.lock().expect("stream graph lock poisoned")
    }
}
