use std::time::Duration;

use crate::streaming::StreamingConfig;
use crate::types::StateKeyPolicy;

/// Internal validation, called automatically during `StreamingConfig::from_str` / `load`.
pub(crate) fn validate(config: &StreamingConfig) -> anyhow::Result<()> {
    let batch_ms = millis(config.batch_duration);
    if batch_ms == 0 {
        anyhow::bail!("streaming.batch_duration must be > 0 (millisecond resolution)");
    }
    if config.batch_duration.subsec_nanos() % 1_000_000 != 0 {
        anyhow::bail!(
            "streaming.batch_duration must be a whole number of milliseconds, got {:?}",
            config.batch_duration,
        );
    }

    if config.checkpoint_interval.subsec_nanos() % 1_000_000 != 0 {
        anyhow::bail!(
            "streaming.checkpoint_interval must be a whole number of milliseconds, got {:?}",
            config.checkpoint_interval,
        );
    }
    // Checkpointing more often than once per tick has nothing to snapshot.
    let ckpt_ms = millis(config.checkpoint_interval);
    if ckpt_ms < batch_ms {
        anyhow::bail!(
            "streaming.checkpoint_interval ({:?}) must be >= batch_duration ({:?})",
            config.checkpoint_interval,
            config.batch_duration,
        );
    }
    if !ckpt_ms.is_multiple_of(batch_ms) {
        anyhow::bail!(
            "streaming.checkpoint_interval ({:?}) must be a multiple of batch_duration ({:?})",
            config.checkpoint_interval,
            config.batch_duration,
        );
    }

    if config.default_parallelism == 0 {
        anyhow::bail!("streaming.default_parallelism must be > 0");
    }
    if config.job_parallelism == 0 {
        anyhow::bail!("streaming.job_parallelism must be > 0");
    }
    if config.state.partitions == Some(0) {
        anyhow::bail!("state.partitions must be > 0");
    }
    if let StateKeyPolicy::Recent { within } = config.state.key_policy {
        if within.is_zero() {
            anyhow::bail!("state.idle_timeout must be > 0");
        }
    }
    if config.checkpoint.retain == 0 {
        anyhow::bail!("checkpoint.retain must be > 0");
    }

    Ok(())
}

fn millis(d: Duration) -> u64 {
    d.as_millis().min(u64::MAX as u128) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> StreamingConfig {
        StreamingConfig::new(Duration::from_millis(500))
    }

    #[test]
    fn accepts_defaults() {
        assert!(validate(&base()).is_ok());
    }

    #[test]
    fn rejects_zero_batch_duration() {
        assert!(validate(&StreamingConfig::new(Duration::ZERO)).is_err());
    }

    #[test]
    fn rejects_sub_millisecond_batch_duration() {
        assert!(validate(&StreamingConfig::new(Duration::from_micros(1500))).is_err());
    }

    #[test]
    fn rejects_checkpoint_interval_below_batch() {
        let cfg = base().with_checkpoint_interval(Duration::from_millis(250));
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_checkpoint_interval_not_multiple() {
        let cfg = base().with_checkpoint_interval(Duration::from_millis(1200));
        assert!(validate(&cfg).is_err());
        let cfg = base().with_checkpoint_interval(Duration::from_millis(1500));
        assert!(validate(&cfg).is_ok());
    }

    #[test]
    fn rejects_fractional_checkpoint_interval() {
        let cfg = StreamingConfig::new(Duration::from_secs(1))
            .with_checkpoint_interval(Duration::from_micros(1_000_500));
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_zero_parallelism() {
        assert!(validate(&base().with_default_parallelism(0)).is_err());
        assert!(validate(&base().with_job_parallelism(0)).is_err());
    }

    #[test]
    fn rejects_zero_idle_timeout() {
        let cfg = base().with_state_key_policy(StateKeyPolicy::Recent {
            within: Duration::ZERO,
        });
        assert!(validate(&cfg).is_err());
    }
}
