use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use orion_error::prelude::*;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};

use ds_config::{HumanDuration, StreamingConfig};
use ds_core::{ReceiverBuffer, Value};
use ds_runtime::tracing_init::init_tracing;
use ds_runtime::{CheckpointStore, FileCheckpointStore, StreamingContext, stop_on_signal};

#[derive(Parser)]
#[command(name = "dstream", about = "Micro-batch stream processing demo")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Count words read line by line: a running total plus a sliding window
    Run {
        /// Path to streaming.toml config file
        #[arg(short, long)]
        config: PathBuf,
        /// Read lines from this file instead of stdin
        #[arg(short, long)]
        input: Option<PathBuf>,
        /// Window length (defaults to three batches)
        #[arg(long)]
        window: Option<HumanDuration>,
        /// Window slide (defaults to one batch)
        #[arg(long)]
        slide: Option<HumanDuration>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            input,
            window,
            slide,
        } => {
            let config_path = config
                .canonicalize()
                .map_err(|e| anyhow::anyhow!("config path '{}': {e}", config.display()))?;
            let streaming_config = StreamingConfig::load(&config_path)?;
            let base_dir = config_path
                .parent()
                .ok_or_else(|| anyhow::anyhow!("config path has no parent directory"))?;
            let _guard = init_tracing(&streaming_config.logging, base_dir)?;

            let batch = streaming_config.batch_duration;
            let window = window.map_or(batch * 3, |w| w.as_duration());
            let slide = slide.map_or(batch, |s| s.as_duration());
            let buffer =
                ReceiverBuffer::new().with_partitions(streaming_config.default_parallelism);

            let recipe = {
                let config = streaming_config.clone();
                let buffer = buffer.clone();
                move || word_count(config, &buffer, window, slide)
            };
            let ctx = match streaming_config.checkpoint.dir.clone() {
                Some(dir) => {
                    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::new(
                        dir,
                        streaming_config.checkpoint.retain,
                    ));
                    StreamingContext::get_or_create(store, recipe).await
                }
                None => recipe(),
            }
            .map_err(|e| anyhow::anyhow!("{e}"))?;

            ctx.start().await.map_err(|e| anyhow::anyhow!("{e}"))?;
            tracing::info!(domain = "sys", batch_ms = batch.as_millis() as u64, "dstream word count started");

            let reader = tokio::spawn(feed_lines(input, buffer));
            tokio::select! {
                r = stop_on_signal(&ctx) => r?,
                r = reader => {
                    let lines = r??;
                    tracing::info!(domain = "sys", lines, "input exhausted, stopping");
                    ctx.stop(true, true).await;
                }
            }
            ctx.await_termination()
                .await
                .map_err(|e| anyhow::anyhow!("{e}"))?;
        }
    }

    Ok(())
}

/// Running word totals and windowed word counts over `buffer`, printed
/// every batch.
fn word_count(
    config: StreamingConfig,
    buffer: &ReceiverBuffer,
    window: Duration,
    slide: Duration,
) -> ds_runtime::RuntimeResult<StreamingContext> {
    let ctx = StreamingContext::new(config)?;
    let words = ctx.receiver_stream(buffer).flat_map(|line: &Value| {
        line.as_str()
            .map(|s| s.split_whitespace().map(Value::from).collect::<Vec<_>>())
            .unwrap_or_default()
    });

    let totals = words
        .map(|w: &Value| Value::pair(w.clone(), 1))
        .update_state_by_key(|new: &[Value], prev: Option<&Value>| {
            let base = prev.and_then(Value::as_int).unwrap_or(0);
            Some(Value::Int(base + new.len() as i64))
        });
    let windowed = words
        .count_by_value_and_window(window, Some(slide), None)
        .err_conv()?;

    totals.print(20).err_conv()?;
    windowed.print(20).err_conv()?;
    Ok(ctx)
}

async fn feed_lines(input: Option<PathBuf>, buffer: ReceiverBuffer) -> Result<usize> {
    match input {
        Some(path) => {
            let file = open(&path).await?;
            push_lines(BufReader::new(file), &buffer).await
        }
        None => push_lines(BufReader::new(tokio::io::stdin()), &buffer).await,
    }
}

async fn open(path: &Path) -> Result<tokio::fs::File> {
    tokio::fs::File::open(path)
        .await
        .map_err(|e| anyhow::anyhow!("input '{}': {e}", path.display()))
}

async fn push_lines(reader: impl AsyncBufRead + Unpin, buffer: &ReceiverBuffer) -> Result<usize> {
    let mut lines = reader.lines();
    let mut count = 0;
    while let Some(line) = lines.next_line().await? {
        buffer.push(line);
        count += 1;
    }
    Ok(count)
}
