//! Retention janitor: removes executions past the configured horizon,
//! rows first, blob directories right after.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

pub fn spawn(state: AppState, retention_days: u32, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tick.tick() => sweep(&state, retention_days),
            }
        }
    });
}

fn sweep(state: &AppState, retention_days: u32) {
    let cutoff = Utc::now() - chrono::Duration::days(i64::from(retention_days));
    match state.executions().cleanup_older_than(cutoff) {
        Ok(removed) => {
            for &execution_id in &removed {
                if let Err(err) = state.files.delete_execution(execution_id) {
                    tracing::warn!(
                        execution_id,
                        error = %err,
                        "could not delete execution files"
                    );
                }
            }
            if !removed.is_empty() {
                tracing::info!(count = removed.len(), "cleaned up old executions");
            }
        }
        Err(err) => {
            tracing::error!(error = %err, "execution cleanup failed");
        }
    }
}
