use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::aggregator::AnalyticsAggregator;

/// Handle to stop and join the bucket sweeper.
#[derive(Debug)]
pub struct BucketSweeperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl BucketSweeperHandle {
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Closes buckets whose window has elapsed, even for entities that stop
/// receiving readings, and retries deferred snapshot writes.
#[derive(Debug)]
pub struct BucketSweeper;

impl BucketSweeper {
    pub fn spawn(aggregator: Arc<AnalyticsAggregator>, interval: Duration) -> std::io::Result<BucketSweeperHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name("bucket-sweeper".to_string())
            .spawn(move || sweep_loop(&aggregator, interval, shutdown_rx))?;

        Ok(BucketSweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn sweep_loop(aggregator: &AnalyticsAggregator, interval: Duration, shutdown_rx: mpsc::Receiver<()>) {
    loop {
        match shutdown_rx.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                // Final pass so buckets that closed during shutdown are not lost.
                if let Err(e) = aggregator.close_elapsed(Utc::now()) {
                    warn!(error = %e, "final bucket sweep incomplete");
                }
                info!("bucket sweeper stopping");
                return;
            }
            Err(RecvTimeoutError::Timeout) => match aggregator.close_elapsed(Utc::now()) {
                Ok(0) => {}
                Ok(saved) => debug!(saved, "closed elapsed buckets"),
                Err(e) => warn!(
                    error = %e,
                    pending = aggregator.pending_writes(),
                    "bucket sweep incomplete; will retry"
                ),
            },
        }
    }
}
