use crate::context::StreamingContext;

/// Wait for Ctrl-C (SIGINT) or SIGTERM, then stop `ctx` gracefully so
/// buffered input is drained and a final checkpoint is written.
pub async fn stop_on_signal(ctx: &StreamingContext) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => {
                r?;
                ds_info!(sys, signal = "SIGINT", "received signal, stopping gracefully");
            }
            _ = sigterm.recv() => {
                ds_info!(sys, signal = "SIGTERM", "received signal, stopping gracefully");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        ds_info!(sys, "received shutdown signal, stopping gracefully");
    }
    ctx.stop(true, true).await;
    Ok(())
}
