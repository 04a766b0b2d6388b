//! Batch scanning: one probe per port, run concurrently under a worker budget.

use crate::db::{ScanBatch, ScanResult};
use crate::probe::probe;

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Concurrent probes per batch unless configured otherwise.
pub const DEFAULT_MAX_WORKERS: usize = 10;

/// Runs batches of probes against one host.
///
/// The worker pool lives only for the duration of [`ScanOrchestrator::scan_batch`]:
/// every probe task is joined (or aborted, if the batch future is dropped) before
/// the call returns.
#[derive(Debug, Clone)]
pub struct ScanOrchestrator {
    max_workers: usize,
    timeout: Duration,
}

impl Default for ScanOrchestrator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WORKERS, Duration::from_secs(10))
    }
}

impl ScanOrchestrator {
    pub fn new(max_workers: usize, timeout: Duration) -> Self {
        Self {
            max_workers: max_workers.max(1),
            timeout,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Probe every port in `ports` and return the results ascending by port.
    ///
    /// Duplicate ports are probed once. A probe task that fails outside the
    /// prober's own handling yields an ERROR result for its port.
    pub async fn scan_batch(&self, host: &str, ports: &[u16]) -> ScanBatch {
        self.scan_batch_with(host, ports, |host, port, timeout| async move {
            probe(&host, port, timeout).await
        })
        .await
    }

    /// [`scan_batch`](Self::scan_batch) with a caller-supplied probe function.
    pub async fn scan_batch_with<F, Fut>(&self, host: &str, ports: &[u16], probe_fn: F) -> ScanBatch
    where
        F: Fn(String, u16, Duration) -> Fut,
        Fut: Future<Output = ScanResult> + Send + 'static,
    {
        let requested: BTreeSet<u16> = ports.iter().copied().collect();
        let sem = Arc::new(Semaphore::new(self.max_workers));
        let mut set = JoinSet::new();

        for &port in &requested {
            let sem = sem.clone();
            let probe = probe_fn(host.to_string(), port, self.timeout);
            set.spawn(async move {
                let _permit = sem.acquire_owned().await; // held until the probe completes
                probe.await
            });
        }

        let mut results: BTreeMap<u16, ScanResult> = BTreeMap::new();
        let mut failures: Vec<String> = Vec::new();

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) if requested.contains(&result.port) => {
                    results.insert(result.port, result);
                }
                Ok(result) => {
                    tracing::warn!("Discarding result for unrequested port {}", result.port);
                }
                Err(e) => {
                    tracing::error!("Probe task for {} failed: {}", host, e);
                    failures.push(e.to_string());
                }
            }
        }

        for &port in &requested {
            results.entry(port).or_insert_with(|| {
                let reason = if failures.is_empty() {
                    "probe task did not complete".to_string()
                } else {
                    failures.join("; ")
                };
                ScanResult::error(host, port, format!("Scanning error: {}", reason))
            });
        }

        ScanBatch::new(host, results.into_values().collect())
    }
}
