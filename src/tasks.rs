use crate::engine::CallEngine;
use crate::error::handle_error;
use crate::recording::{Downloader, RecordingJob};

use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Task that dispatches due scheduled calls every `interval`.
pub async fn dispatch_scheduled_calls(engine: Arc<CallEngine>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match engine.run_due(OffsetDateTime::now_utc(), None).await {
            Ok(report) => debug!(
                total_due = report.total_due,
                executed = report.executed,
                failed = report.failed,
                "dispatch tick"
            ),
            Err(e) => handle_error(e),
        }
    }
}

/// Task that polls the platform for calls whose webhooks may have been lost.
pub async fn refresh_open_calls(engine: Arc<CallEngine>, interval: Duration, window: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // the first tick fires immediately; give webhooks a head start
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match engine
            .refresh_open_calls(OffsetDateTime::now_utc(), window)
            .await
        {
            Ok(report) if report.checked > 0 => info!(
                checked = report.checked,
                refreshed = report.refreshed,
                failed = report.failed,
                "refresh sweep"
            ),
            Ok(_) => {}
            Err(e) => handle_error(e),
        }
    }
}

/// Task that downloads recordings queued by the engine and attaches them to their calls.
pub async fn download_recordings(
    engine: Arc<CallEngine>,
    downloader: Downloader,
    mut jobs: mpsc::UnboundedReceiver<RecordingJob>,
) {
    while let Some(job) = jobs.recv().await {
        let path = match downloader.download(&job, OffsetDateTime::now_utc()).await {
            Ok(path) => path,
            Err(e) => {
                warn!(call_id = %job.external_call_id, error = %e, "recording download failed");
                continue;
            }
        };
        match engine.attach_recording(&job, &path).await {
            Ok(true) => {}
            Ok(false) => {
                // lost the race to an earlier download
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    handle_error(e);
                }
            }
            Err(e) => handle_error(e),
        }
    }
    info!("recording queue closed");
}
