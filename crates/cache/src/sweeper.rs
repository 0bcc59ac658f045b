use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::manager::CacheManager;

/// Handle to stop and join the background sweeper.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl SweeperHandle {
    /// Request shutdown and wait for the sweeper thread to exit.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// Periodically drops expired entries so memory is reclaimed even for keys
/// that are never read again.
#[derive(Debug)]
pub struct CacheSweeper;

impl CacheSweeper {
    pub fn spawn(cache: Arc<CacheManager>, interval: Duration) -> std::io::Result<SweeperHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let join = thread::Builder::new()
            .name("cache-sweeper".to_string())
            .spawn(move || sweep_loop(&cache, interval, shutdown_rx))?;

        Ok(SweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }
}

fn sweep_loop(cache: &CacheManager, interval: Duration, shutdown_rx: mpsc::Receiver<()>) {
    loop {
        match shutdown_rx.recv_timeout(interval) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                info!("cache sweeper stopping");
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                let purged = cache.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = cache.len(), "purged expired cache entries");
                }
            }
        }
    }
}
