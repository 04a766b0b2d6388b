//! Retention manager for pruning old scan results.

use crate::db::Store;

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

/// How often the retention pass runs.
pub const RETENTION_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

/// Deletes scan results older than the configured number of days, once at
/// start and then once per [`RETENTION_PERIOD`].
pub struct RetentionManager {
    store: Arc<Store>,
    days_to_keep: u32,
    stop: Mutex<Option<broadcast::Sender<()>>>,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, days_to_keep: u32) -> Self {
        Self {
            store,
            days_to_keep,
            stop: Mutex::new(None),
        }
    }

    /// Start the retention manager background task.
    pub fn start(&self) {
        let mut stop = self.stop.lock().unwrap_or_else(|p| p.into_inner());
        if stop.is_some() {
            return;
        }

        let (tx, mut rx) = broadcast::channel(1);
        *stop = Some(tx);

        let store = self.store.clone();
        let days = self.days_to_keep;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RETENTION_PERIOD);

            loop {
                tokio::select! {
                    _ = rx.recv() => break,
                    _ = interval.tick() => {
                        process_retention(&store, days);
                    }
                }
            }
        });
        tracing::info!("RetentionManager: keeping {} days of results", days);
    }

    /// Stop the retention manager.
    pub fn stop(&self) {
        let mut stop = self.stop.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(tx) = stop.take() {
            let _ = tx.send(());
        }
    }
}

fn process_retention(store: &Store, days: u32) {
    match store.retention_prune(days) {
        Ok(0) => tracing::debug!("RetentionManager: nothing to prune"),
        Ok(n) => tracing::info!("RetentionManager: pruned {} results older than {} days", n, days),
        Err(e) => tracing::error!("RetentionManager: prune failed: {}", e),
    }
}
