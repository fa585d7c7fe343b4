use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::logging::LoggingConfig;
use crate::metrics::MetricsConfig;
use crate::types::{FailurePolicy, HumanDuration, StateKeyPolicy};
use crate::validate;

// ---------------------------------------------------------------------------
// Raw TOML structure (intermediate representation)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct StreamingConfigRaw {
    streaming: StreamingSection,
    #[serde(default)]
    state: StateSection,
    #[serde(default)]
    checkpoint: CheckpointSection,
    #[serde(default)]
    logging: LoggingConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

#[derive(Debug, Deserialize)]
struct StreamingSection {
    batch_duration: HumanDuration,
    #[serde(default)]
    checkpoint_interval: Option<HumanDuration>,
    #[serde(default = "default_parallelism")]
    default_parallelism: usize,
    #[serde(default = "default_parallelism")]
    job_parallelism: usize,
    #[serde(default)]
    failure_policy: FailurePolicy,
    #[serde(default = "zero_duration")]
    remember: HumanDuration,
    #[serde(default = "default_graceful_stop_timeout")]
    graceful_stop_timeout: HumanDuration,
}

#[derive(Debug, Default, Deserialize)]
struct StateSection {
    #[serde(default)]
    key_policy: KeyPolicyKind,
    #[serde(default)]
    idle_timeout: Option<HumanDuration>,
    #[serde(default)]
    partitions: Option<usize>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum KeyPolicyKind {
    #[default]
    AllKnown,
    Touched,
    Recent,
}

#[derive(Debug, Deserialize)]
struct CheckpointSection {
    #[serde(default)]
    dir: Option<PathBuf>,
    #[serde(default = "default_retain")]
    retain: usize,
}

impl Default for CheckpointSection {
    fn default() -> Self {
        Self {
            dir: None,
            retain: default_retain(),
        }
    }
}

fn default_parallelism() -> usize {
    1
}

fn default_retain() -> usize {
    3
}

fn zero_duration() -> HumanDuration {
    HumanDuration::from_millis(0)
}

fn default_graceful_stop_timeout() -> HumanDuration {
    HumanDuration::from_millis(10_000)
}

// ---------------------------------------------------------------------------
// StreamingConfig (resolved, validated)
// ---------------------------------------------------------------------------

/// State-store settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateConfig {
    pub key_policy: StateKeyPolicy,
    /// Partition count for state output; `None` means `default_parallelism`.
    pub partitions: Option<usize>,
}

/// Where and how many checkpoints are kept on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointConfig {
    pub dir: Option<PathBuf>,
    pub retain: usize,
}

#[derive(Debug, Clone)]
pub struct StreamingConfig {
    /// Base tick interval.
    pub batch_duration: Duration,
    /// Checkpoint cadence; a multiple of `batch_duration`.
    pub checkpoint_interval: Duration,
    /// Partition count used by shuffles when none is given explicitly.
    pub default_parallelism: usize,
    /// Output jobs allowed to run concurrently within one tick.
    pub job_parallelism: usize,
    pub failure_policy: FailurePolicy,
    /// Extra history every stream keeps beyond what its consumers need.
    pub remember: Duration,
    /// Upper bound on draining pending input during a graceful stop.
    pub graceful_stop_timeout: Duration,
    pub state: StateConfig,
    pub checkpoint: CheckpointConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

impl StreamingConfig {
    /// Default configuration for the given tick interval.
    pub fn new(batch_duration: Duration) -> Self {
        Self {
            batch_duration,
            checkpoint_interval: batch_duration,
            default_parallelism: default_parallelism(),
            job_parallelism: default_parallelism(),
            failure_policy: FailurePolicy::default(),
            remember: Duration::ZERO,
            graceful_stop_timeout: default_graceful_stop_timeout().as_duration(),
            state: StateConfig {
                key_policy: StateKeyPolicy::default(),
                partitions: None,
            },
            checkpoint: CheckpointConfig {
                dir: None,
                retain: default_retain(),
            },
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }

    pub fn with_checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    pub fn with_default_parallelism(mut self, n: usize) -> Self {
        self.default_parallelism = n;
        self
    }

    pub fn with_job_parallelism(mut self, n: usize) -> Self {
        self.job_parallelism = n;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_state_key_policy(mut self, policy: StateKeyPolicy) -> Self {
        self.state.key_policy = policy;
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint.dir = Some(dir.into());
        self
    }

    /// Partition count for state-store output.
    pub fn state_partitions(&self) -> usize {
        self.state.partitions.unwrap_or(self.default_parallelism)
    }

    /// Check cross-field invariants. Called by `from_str`/`load`; call it
    /// explicitly after building a config in code.
    pub fn validate(&self) -> anyhow::Result<()> {
        validate::validate(self)
    }

    /// Read and parse a `streaming.toml` file. A relative checkpoint or log
    /// path is resolved against the file's parent directory.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
        let mut config: StreamingConfig = content.parse()?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        if let Some(dir) = config.checkpoint.dir.take() {
            config.checkpoint.dir = Some(if dir.is_relative() {
                base_dir.join(dir)
            } else {
                dir
            });
        }
        Ok(config)
    }
}

impl FromStr for StreamingConfig {
    type Err = anyhow::Error;

    /// Parse a TOML string into a resolved, validated [`StreamingConfig`].
    fn from_str(toml_str: &str) -> anyhow::Result<Self> {
        let raw: StreamingConfigRaw = toml::from_str(toml_str)?;
        let s = raw.streaming;

        let key_policy = match (raw.state.key_policy, raw.state.idle_timeout) {
            (KeyPolicyKind::AllKnown, _) => StateKeyPolicy::AllKnown,
            (KeyPolicyKind::Touched, _) => StateKeyPolicy::Touched,
            (KeyPolicyKind::Recent, Some(within)) => StateKeyPolicy::Recent {
                within: within.as_duration(),
            },
            (KeyPolicyKind::Recent, None) => {
                anyhow::bail!("state.key_policy = \"recent\" requires state.idle_timeout")
            }
        };

        let config = StreamingConfig {
            batch_duration: s.batch_duration.as_duration(),
            checkpoint_interval: s
                .checkpoint_interval
                .unwrap_or(s.batch_duration)
                .as_duration(),
            default_parallelism: s.default_parallelism,
            job_parallelism: s.job_parallelism,
            failure_policy: s.failure_policy,
            remember: s.remember.as_duration(),
            graceful_stop_timeout: s.graceful_stop_timeout.as_duration(),
            state: StateConfig {
                key_policy,
                partitions: raw.state.partitions,
            },
            checkpoint: CheckpointConfig {
                dir: raw.checkpoint.dir,
                retain: raw.checkpoint.retain,
            },
            logging: raw.logging,
            metrics: raw.metrics,
        };

        config.validate()?;
        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
