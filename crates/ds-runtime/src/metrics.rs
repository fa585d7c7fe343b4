use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use ds_config::MetricsConfig;
use ds_core::Time;

const DEFAULT_HISTOGRAM_BUCKETS_SECONDS: &[f64] = &[
    0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0,
];

/// Lock-free histogram with fixed buckets.
///
/// Each observation increments exactly one bucket (non-cumulative storage).
struct Histogram {
    upper_bounds_nanos: Vec<u64>,
    bucket_counts: Vec<AtomicU64>,
    sum_nanos: AtomicU64,
}

impl Histogram {
    fn from_seconds_bounds(bounds: &[f64]) -> Self {
        let upper_bounds_nanos = bounds
            .iter()
            .map(|sec| (*sec * 1_000_000_000.0) as u64)
            .collect::<Vec<_>>();
        let bucket_counts = (0..=upper_bounds_nanos.len())
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>();
        Self {
            upper_bounds_nanos,
            bucket_counts,
            sum_nanos: AtomicU64::new(0),
        }
    }

    fn observe_duration(&self, elapsed: Duration) {
        let nanos = elapsed.as_nanos().min(u64::MAX as u128) as u64;
        self.sum_nanos.fetch_add(nanos, Ordering::Relaxed);
        let idx = self
            .upper_bounds_nanos
            .iter()
            .position(|bound| nanos <= *bound)
            .unwrap_or(self.upper_bounds_nanos.len());
        self.bucket_counts[idx].fetch_add(1, Ordering::Relaxed);
    }

    fn count(&self) -> u64 {
        self.bucket_counts
            .iter()
            .map(|v| v.load(Ordering::Relaxed))
            .sum()
    }
}

/// Point-in-time copy of the scheduler counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub ticks_total: u64,
    pub tick_failures_total: u64,
    pub jobs_total: u64,
    pub job_failures_total: u64,
    pub skipped_outputs_total: u64,
    pub checkpoints_total: u64,
    pub checkpoint_failures_total: u64,
    pub records_ingested_total: u64,
    pub overrun_ticks_total: u64,
    pub state_keys: u64,
    pub last_batch_time_ms: u64,
}

/// Scheduler metrics.
///
/// Always collected; `[metrics] enabled` only controls the exporter and the
/// periodic summary line. Scheduling delay is the gap between a tick's
/// planned instant and the moment its processing started. A growing
/// `ds_total_scheduling_delay_seconds` means processing cannot keep up with
/// the batch interval.
pub struct SchedulerMetrics {
    ticks_total: AtomicU64,
    tick_failures_total: AtomicU64,
    jobs_total: AtomicU64,
    job_failures_total: AtomicU64,
    skipped_outputs_total: AtomicU64,
    checkpoints_total: AtomicU64,
    checkpoint_failures_total: AtomicU64,
    records_ingested_total: AtomicU64,
    overrun_ticks_total: AtomicU64,

    scheduling_delay_nanos: AtomicU64,
    total_scheduling_delay_nanos: AtomicU64,
    state_keys: AtomicU64,
    last_batch_time_ms: AtomicU64,

    processing_seconds: Histogram,
    checkpoint_write_seconds: Histogram,
}

impl Default for SchedulerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerMetrics {
    pub fn new() -> Self {
        Self {
            ticks_total: AtomicU64::new(0),
            tick_failures_total: AtomicU64::new(0),
            jobs_total: AtomicU64::new(0),
            job_failures_total: AtomicU64::new(0),
            skipped_outputs_total: AtomicU64::new(0),
            checkpoints_total: AtomicU64::new(0),
            checkpoint_failures_total: AtomicU64::new(0),
            records_ingested_total: AtomicU64::new(0),
            overrun_ticks_total: AtomicU64::new(0),
            scheduling_delay_nanos: AtomicU64::new(0),
            total_scheduling_delay_nanos: AtomicU64::new(0),
            state_keys: AtomicU64::new(0),
            last_batch_time_ms: AtomicU64::new(0),
            processing_seconds: Histogram::from_seconds_bounds(DEFAULT_HISTOGRAM_BUCKETS_SECONDS),
            checkpoint_write_seconds: Histogram::from_seconds_bounds(
                DEFAULT_HISTOGRAM_BUCKETS_SECONDS,
            ),
        }
    }

    // -- hot path ------------------------------------------------------------

    /// Record when a tick started relative to its planned instant.
    /// Returns true when the delay exceeded one batch interval.
    pub fn observe_scheduling_delay(&self, delay: Duration, batch_duration: Duration) -> bool {
        let nanos = delay.as_nanos().min(u64::MAX as u128) as u64;
        self.scheduling_delay_nanos.store(nanos, Ordering::Relaxed);
        self.total_scheduling_delay_nanos
            .fetch_add(nanos, Ordering::Relaxed);
        let overrun = delay > batch_duration;
        if overrun {
            self.overrun_ticks_total.fetch_add(1, Ordering::Relaxed);
        }
        overrun
    }

    pub fn complete_tick(&self, time: Time, elapsed: Duration, records: usize) {
        self.ticks_total.fetch_add(1, Ordering::Relaxed);
        self.records_ingested_total
            .fetch_add(records as u64, Ordering::Relaxed);
        self.last_batch_time_ms
            .store(time.millis(), Ordering::Relaxed);
        self.processing_seconds.observe_duration(elapsed);
    }

    pub fn add_tick_failures(&self, n: usize) {
        self.tick_failures_total
            .fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn add_jobs(&self, n: usize) {
        self.jobs_total.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn inc_job_failure(&self) {
        self.job_failures_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_skipped_outputs(&self, n: usize) {
        self.skipped_outputs_total
            .fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn observe_checkpoint(&self, elapsed: Duration) {
        self.checkpoints_total.fetch_add(1, Ordering::Relaxed);
        self.checkpoint_write_seconds.observe_duration(elapsed);
    }

    pub fn inc_checkpoint_failure(&self) {
        self.checkpoint_failures_total
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_state_keys(&self, n: usize) {
        self.state_keys.store(n as u64, Ordering::Relaxed);
    }

    // -- read side -----------------------------------------------------------

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |v: &AtomicU64| v.load(Ordering::Relaxed);
        MetricsSnapshot {
            ticks_total: load(&self.ticks_total),
            tick_failures_total: load(&self.tick_failures_total),
            jobs_total: load(&self.jobs_total),
            job_failures_total: load(&self.job_failures_total),
            skipped_outputs_total: load(&self.skipped_outputs_total),
            checkpoints_total: load(&self.checkpoints_total),
            checkpoint_failures_total: load(&self.checkpoint_failures_total),
            records_ingested_total: load(&self.records_ingested_total),
            overrun_ticks_total: load(&self.overrun_ticks_total),
            state_keys: load(&self.state_keys),
            last_batch_time_ms: load(&self.last_batch_time_ms),
        }
    }

    /// Sum of all scheduling delays so far.
    pub fn total_scheduling_delay(&self) -> Duration {
        Duration::from_nanos(self.total_scheduling_delay_nanos.load(Ordering::Relaxed))
    }

    /// Prometheus text exposition format.
    pub fn render_prometheus(&self) -> String {
        let s = self.snapshot();
        let mut out = String::new();
        let mut rendered_types = BTreeSet::new();

        let counters = [
            ("ds_ticks_total", s.ticks_total),
            ("ds_tick_failures_total", s.tick_failures_total),
            ("ds_jobs_total", s.jobs_total),
            ("ds_job_failures_total", s.job_failures_total),
            ("ds_skipped_outputs_total", s.skipped_outputs_total),
            ("ds_checkpoints_total", s.checkpoints_total),
            ("ds_checkpoint_failures_total", s.checkpoint_failures_total),
            ("ds_records_ingested_total", s.records_ingested_total),
            ("ds_overrun_ticks_total", s.overrun_ticks_total),
        ];
        for (name, value) in counters {
            render_type_once(&mut out, &mut rendered_types, name, "counter");
            let _ = writeln!(out, "{name} {value}");
        }

        render_type_once(&mut out, &mut rendered_types, "ds_total_scheduling_delay_seconds", "counter");
        let _ = writeln!(
            out,
            "ds_total_scheduling_delay_seconds {}",
            self.total_scheduling_delay().as_secs_f64()
        );

        let delay = Duration::from_nanos(self.scheduling_delay_nanos.load(Ordering::Relaxed));
        let gauges = [
            ("ds_scheduling_delay_seconds", delay.as_secs_f64()),
            ("ds_state_keys", s.state_keys as f64),
            (
                "ds_last_batch_time_seconds",
                s.last_batch_time_ms as f64 / 1000.0,
            ),
        ];
        for (name, value) in gauges {
            render_type_once(&mut out, &mut rendered_types, name, "gauge");
            let _ = writeln!(out, "{name} {value}");
        }

        render_histogram(
            &mut out,
            &mut rendered_types,
            "ds_processing_seconds",
            &self.processing_seconds,
        );
        render_histogram(
            &mut out,
            &mut rendered_types,
            "ds_checkpoint_write_seconds",
            &self.checkpoint_write_seconds,
        );
        out
    }

    fn summary_line(&self) -> String {
        let s = self.snapshot();
        format!(
            "ticks={} records={} jobs={} job_failures={} checkpoints={} overruns={} state_keys={} total_delay_ms={}",
            s.ticks_total,
            s.records_ingested_total,
            s.jobs_total,
            s.job_failures_total,
            s.checkpoints_total,
            s.overrun_ticks_total,
            s.state_keys,
            self.total_scheduling_delay().as_millis(),
        )
    }
}

fn render_histogram(
    out: &mut String,
    rendered_types: &mut BTreeSet<String>,
    name: &str,
    histogram: &Histogram,
) {
    render_type_once(out, rendered_types, name, "histogram");
    let mut cumulative = 0u64;
    for (idx, upper_bound_nanos) in histogram.upper_bounds_nanos.iter().enumerate() {
        cumulative = cumulative
            .saturating_add(histogram.bucket_counts[idx].load(Ordering::Relaxed));
        let le = *upper_bound_nanos as f64 / 1_000_000_000.0;
        let _ = writeln!(out, "{name}_bucket{{le=\"{le:.6}\"}} {cumulative}");
    }
    let total = histogram.count();
    let sum = histogram.sum_nanos.load(Ordering::Relaxed) as f64 / 1_000_000_000.0;
    let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {total}");
    let _ = writeln!(out, "{name}_sum {sum}");
    let _ = writeln!(out, "{name}_count {total}");
}

fn render_type_once(
    out: &mut String,
    rendered_types: &mut BTreeSet<String>,
    name: &str,
    kind: &str,
) {
    if rendered_types.insert(name.to_string()) {
        let _ = writeln!(out, "# TYPE {name} {kind}");
    }
}

/// Serve `GET /metrics` and log a summary line every `report_interval`
/// until cancelled.
pub async fn run_metrics_task(
    metrics: Arc<SchedulerMetrics>,
    config: MetricsConfig,
    listener: TcpListener,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    ds_info!(
        res,
        listen = %config.prometheus_listen,
        interval = %config.report_interval,
        "metrics exporter started"
    );

    let mut tick = tokio::time::interval(config.report_interval.as_duration());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {
                ds_info!(res, summary = %metrics.summary_line(), "metrics snapshot");
            }
            result = listener.accept() => {
                let (stream, _) = result?;
                let metrics = Arc::clone(&metrics);
                tokio::spawn(async move {
                    if let Err(e) = serve_metrics_connection(stream, metrics).await {
                        ds_debug!(res, error = %e, "metrics connection handling failed");
                    }
                });
            }
        }
    }
    Ok(())
}

async fn serve_metrics_connection(
    mut stream: TcpStream,
    metrics: Arc<SchedulerMetrics>,
) -> anyhow::Result<()> {
    let mut req_buf = [0u8; 512];
    let req_n = match timeout(Duration::from_secs(2), stream.read(&mut req_buf)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Ok(()),
    };
    let is_metrics = req_n > 0
        && std::str::from_utf8(&req_buf[..req_n])
            .unwrap_or("")
            .starts_with("GET /metrics");

    if is_metrics {
        let body = metrics.render_prometheus();
        let header = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        timeout(Duration::from_secs(2), stream.write_all(header.as_bytes())).await??;
        timeout(Duration::from_secs(2), stream.write_all(body.as_bytes())).await??;
    } else {
        timeout(
            Duration::from_secs(2),
            stream.write_all(
                b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            ),
        )
        .await??;
    }
    let _ = timeout(Duration::from_secs(1), stream.shutdown()).await;
    Ok(())
}
