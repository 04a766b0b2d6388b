//! Scheduler module for recurring port scans.
//!
//! One [`Scheduler`] owns the monitoring state machine (STOPPED / RUNNING), its
//! background loop, and the handlers that receive batches and status text.

mod retention;

pub use retention::*;

use crate::analyzer::analyze;
use crate::config::{ConfigError, MonitorConfig};
use crate::db::{DbError, HistorySummary, ScanBatch, Store};
use crate::probe::resolve_host;
use crate::scanner::ScanOrchestrator;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

/// How often the background loop checks for due work.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Upper bound on how long `stop()` waits for background work.
pub const STOP_WAIT: Duration = Duration::from_secs(5);

/// Minutes either side of the nominal interval a firing may land on.
pub const JITTER_MINUTES: u32 = 5;

/// Receives every completed batch.
pub type ResultHandler = Arc<dyn Fn(&ScanBatch) + Send + Sync>;

/// Receives one-line status and advisory messages.
pub type StatusHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Scheduler error types.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("store error: {0}")]
    Db(#[from] DbError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Live state owned by the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitoringState {
    pub is_running: bool,
    pub next_scan: Option<DateTime<Utc>>,
    pub max_workers: usize,
}

/// Snapshot for status displays.
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringStatus {
    pub is_running: bool,
    pub target_host: String,
    pub scan_interval: u32,
    pub ports: Vec<u16>,
    pub ports_count: usize,
    pub next_scan: Option<DateTime<Utc>>,
    pub last_scan: Option<DateTime<Utc>>,
    pub max_workers: usize,
}

/// Smallest and largest minutes a firing may be scheduled after the previous one.
pub fn jitter_bounds(interval_minutes: u32) -> (u32, u32) {
    (
        interval_minutes.saturating_sub(JITTER_MINUTES).max(1),
        interval_minutes.saturating_add(JITTER_MINUTES),
    )
}

/// Draw the delay until the next firing, uniform over the jitter bounds.
pub fn sample_interval(interval_minutes: u32) -> Duration {
    let (lo, hi) = jitter_bounds(interval_minutes);
    let secs = rand::thread_rng().gen_range(lo as u64 * 60..=hi as u64 * 60);
    Duration::from_secs(secs)
}

/// The next due time, in both clocks.
#[derive(Debug, Clone, Copy)]
struct NextRun {
    due: Instant,
    at: DateTime<Utc>,
}

/// State shared between the scheduler, its loop, and out-of-band cycles.
struct Shared {
    store: Arc<Store>,
    orchestrator: ScanOrchestrator,
    config: RwLock<MonitorConfig>,
    result_handlers: RwLock<Vec<ResultHandler>>,
    status_handlers: RwLock<Vec<StatusHandler>>,
    next_run: Mutex<Option<NextRun>>,
}

struct RunningLoop {
    stop_tx: broadcast::Sender<()>,
    handle: JoinHandle<()>,
}

/// The recurring-scan state machine.
pub struct Scheduler {
    shared: Arc<Shared>,
    running: AtomicBool,
    control: tokio::sync::Mutex<Option<RunningLoop>>,
    out_of_band: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create a stopped scheduler, loading the monitoring configuration from the store.
    pub fn new(store: Arc<Store>, orchestrator: ScanOrchestrator) -> Result<Self, SchedulerError> {
        let config = MonitorConfig::from_record(&store.get_configuration()?);
        tracing::info!(
            "Scheduler configured for {} every {} min on {} ports",
            config.host,
            config.scan_interval,
            config.ports.len()
        );

        Ok(Self {
            shared: Arc::new(Shared {
                store,
                orchestrator,
                config: RwLock::new(config),
                result_handlers: RwLock::new(Vec::new()),
                status_handlers: RwLock::new(Vec::new()),
                next_run: Mutex::new(None),
            }),
            running: AtomicBool::new(false),
            control: tokio::sync::Mutex::new(None),
            out_of_band: Mutex::new(Vec::new()),
        })
    }

    /// Register a handler for completed batches.
    pub fn on_result<F>(&self, handler: F)
    where
        F: Fn(&ScanBatch) + Send + Sync + 'static,
    {
        write(&self.shared.result_handlers).push(Arc::new(handler));
    }

    /// Register a handler for status text.
    pub fn on_status<F>(&self, handler: F)
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        write(&self.shared.status_handlers).push(Arc::new(handler));
    }

    /// STOPPED -> RUNNING. Runs one scan cycle before returning, then leaves the
    /// background loop armed. No-op when already running.
    pub async fn start(&self) {
        let mut control = self.control.lock().await;
        if control.is_some() {
            tracing::debug!("Scheduler: start ignored, already running");
            return;
        }

        let interval = self.shared.config().scan_interval;
        self.shared.schedule_next(interval);

        let (stop_tx, stop_rx) = broadcast::channel(1);
        let handle = tokio::spawn(run_schedule_loop(self.shared.clone(), stop_rx));
        *control = Some(RunningLoop { stop_tx, handle });
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Scheduler: monitoring started");

        self.shared.run_guarded_cycle().await;
        self.shared.notify_status("Monitoring started");
    }

    /// RUNNING -> STOPPED. Waits up to [`STOP_WAIT`] for the loop and any
    /// out-of-band cycles, aborting whatever is left. No-op when already stopped.
    pub async fn stop(&self) {
        let mut control = self.control.lock().await;
        let Some(running) = control.take() else {
            tracing::debug!("Scheduler: stop ignored, not running");
            return;
        };

        self.running.store(false, Ordering::SeqCst);
        let _ = running.stop_tx.send(());

        let deadline = Instant::now() + STOP_WAIT;
        let mut handles = vec![running.handle];
        handles.extend(lock(&self.out_of_band).drain(..));

        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => tracing::error!("Scheduler: background task failed: {}", e),
                Err(_) => {
                    tracing::warn!("Scheduler: background task still busy after {:?}, aborting", STOP_WAIT);
                    handle.abort();
                }
            }
        }

        *lock(&self.shared.next_run) = None;
        tracing::info!("Scheduler: monitoring stopped");
        self.shared.notify_status("Monitoring stopped");
    }

    /// Run one scan cycle outside the schedule.
    ///
    /// When stopped the cycle completes before this returns; when running it is
    /// spawned alongside the loop and the cadence is left untouched.
    pub async fn run_now(&self) {
        // Held while spawning so stop() cannot drain the pending list in between.
        let control = self.control.lock().await;
        if control.is_some() {
            let shared = self.shared.clone();
            let handle = tokio::spawn(async move { shared.run_guarded_cycle().await });
            let mut pending = lock(&self.out_of_band);
            pending.retain(|h| !h.is_finished());
            pending.push(handle);
            return;
        }
        drop(control);

        self.shared.run_guarded_cycle().await;
    }

    /// Update and persist the monitoring configuration. A running schedule is
    /// restarted so the change takes effect.
    pub async fn update_configuration(
        &self,
        host: Option<String>,
        interval: Option<u32>,
        ports: Option<Vec<u16>>,
    ) -> Result<(), SchedulerError> {
        let mut next = self.shared.config();
        if let Some(host) = host {
            next.host = host.trim().to_string();
        }
        if let Some(interval) = interval {
            next.scan_interval = interval;
        }
        if let Some(ports) = ports {
            next.ports = ports;
        }
        next.validate()?;

        self.shared.store.save_configuration(&next.to_record())?;
        *write(&self.shared.config) = next;
        tracing::info!("Scheduler: configuration updated");

        if self.is_running() {
            self.stop().await;
            self.start().await;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> MonitorConfig {
        self.shared.config()
    }

    pub fn state(&self) -> MonitoringState {
        MonitoringState {
            is_running: self.is_running(),
            next_scan: self.get_next_scan_time(),
            max_workers: self.shared.orchestrator.max_workers(),
        }
    }

    /// When the loop will fire next, if running.
    pub fn get_next_scan_time(&self) -> Option<DateTime<Utc>> {
        lock(&self.shared.next_run).map(|next| next.at)
    }

    /// Capture time of the latest stored result for the configured host.
    pub fn get_last_scan_time(&self) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        let host = self.shared.config().host;
        let latest = self.shared.store.recent(1, Some(&host), None)?;
        Ok(latest.first().map(|r| r.result.timestamp))
    }

    pub fn get_monitoring_status(&self) -> Result<MonitoringStatus, SchedulerError> {
        let config = self.shared.config();
        Ok(MonitoringStatus {
            is_running: self.is_running(),
            ports_count: config.ports.len(),
            target_host: config.host,
            scan_interval: config.scan_interval,
            ports: config.ports,
            next_scan: self.get_next_scan_time(),
            last_scan: self.get_last_scan_time()?,
            max_workers: self.shared.orchestrator.max_workers(),
        })
    }

    pub fn get_scan_history_summary(&self, hours: u32) -> Result<HistorySummary, SchedulerError> {
        let host = self.shared.config().host;
        Ok(self.shared.store.history_summary(hours, &host)?)
    }

    /// Write the evidence report for the configured host to `path`.
    pub fn export_evidence_report<P: AsRef<Path>>(&self, path: P, days: u32) -> Result<(), SchedulerError> {
        let host = self.shared.config().host;
        let report = self.shared.store.evidence_report(&host, days)?;
        std::fs::write(path.as_ref(), report)?;
        tracing::info!("Evidence report written to {}", path.as_ref().display());
        Ok(())
    }
}

impl Shared {
    fn config(&self) -> MonitorConfig {
        read(&self.config).clone()
    }

    fn schedule_next(&self, interval_minutes: u32) {
        let delay = sample_interval(interval_minutes);
        let at = Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        *lock(&self.next_run) = Some(NextRun {
            due: Instant::now() + delay,
            at,
        });
        tracing::debug!("Scheduler: next scan at {}", at);
    }

    fn notify_status(&self, message: &str) {
        let handlers = read(&self.status_handlers).clone();
        for handler in handlers {
            handler(message);
        }
    }

    fn notify_result(&self, batch: &ScanBatch) {
        let handlers = read(&self.result_handlers).clone();
        for handler in handlers {
            handler(batch);
        }
    }

    /// Run one cycle in its own task so that a panic is reported instead of
    /// tearing down the caller.
    async fn run_guarded_cycle(self: &Arc<Self>) {
        let mut cycle = JoinSet::new();
        let shared = self.clone();
        cycle.spawn(async move { shared.perform_scan().await });

        match cycle.join_next().await {
            Some(Ok(Ok(()))) | None => {}
            Some(Ok(Err(e))) => {
                tracing::error!("Scan failed: {}", e);
                self.notify_status(&format!("Scan failed: {}", e));
            }
            Some(Err(e)) => {
                tracing::error!("Scan cycle aborted: {}", e);
                self.notify_status(&format!("Scan failed: {}", e));
            }
        }
    }

    async fn perform_scan(&self) -> Result<(), SchedulerError> {
        let config = self.config();
        self.notify_status(&format!("Scanning {}...", config.host));

        if let Err(e) = resolve_host(&config.host, self.orchestrator.timeout()).await {
            tracing::warn!("Cannot resolve host {}: {}", config.host, e);
            self.notify_status(&format!("Cannot resolve host: {}", config.host));
            return Ok(());
        }

        let batch = self.orchestrator.scan_batch(&config.host, &config.ports).await;
        self.store.append(&batch)?;
        let advisory = analyze(&batch);

        let summary = format!(
            "Scan completed at {}: {}/{} ports open",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            batch.open_count(),
            batch.len()
        );
        tracing::info!("{}", summary);

        self.notify_result(&batch);
        self.notify_status(&summary);

        if let Some(advisory) = advisory {
            tracing::warn!("{}", advisory);
            self.notify_status(&advisory);
        }

        Ok(())
    }
}

/// Background loop: poll for due work, run at most one cycle per firing.
async fn run_schedule_loop(shared: Arc<Shared>, mut stop_rx: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(POLL_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = stop_rx.recv() => break,
            _ = ticker.tick() => {
                let due = match *lock(&shared.next_run) {
                    Some(next) => next.due,
                    None => continue,
                };
                if Instant::now() < due {
                    continue;
                }
                if stop_requested(&mut stop_rx) {
                    break;
                }

                shared.run_guarded_cycle().await;

                if stop_requested(&mut stop_rx) {
                    break;
                }
                let interval = shared.config().scan_interval;
                shared.schedule_next(interval);
            }
        }
    }

    tracing::debug!("Scheduler: loop exited");
}

fn stop_requested(stop_rx: &mut broadcast::Receiver<()>) -> bool {
    !matches!(stop_rx.try_recv(), Err(broadcast::error::TryRecvError::Empty))
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(l: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(l: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ScanStatus;
    use tempfile::NamedTempFile;
    use tokio::net::TcpListener;

    struct Harness {
        _tmp: NamedTempFile,
        _listeners: Vec<TcpListener>,
        store: Arc<Store>,
        scheduler: Scheduler,
        ports: Vec<u16>,
        statuses: Arc<Mutex<Vec<String>>>,
        batches: Arc<Mutex<Vec<ScanBatch>>>,
    }

    impl Harness {
        fn status_count(&self, needle: &str) -> usize {
            lock(&self.statuses).iter().filter(|s| s.contains(needle)).count()
        }

        fn stored_rows(&self) -> usize {
            self.store.recent(1000, None, None).unwrap().len()
        }
    }

    /// A scheduler pointed at two local listeners and one refused port.
    async fn harness(interval: u32) -> Harness {
        let tmp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(tmp.path()).unwrap());

        let mut listeners = Vec::new();
        let mut ports = Vec::new();
        for _ in 0..2 {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            ports.push(listener.local_addr().unwrap().port());
            listeners.push(listener);
        }
        let refused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        ports.push(refused.local_addr().unwrap().port());
        drop(refused);

        let config = MonitorConfig {
            host: "127.0.0.1".to_string(),
            scan_interval: interval,
            ports: ports.clone(),
        };
        store.save_configuration(&config.to_record()).unwrap();

        let scheduler = Scheduler::new(store.clone(), ScanOrchestrator::new(4, Duration::from_secs(2))).unwrap();
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let batches = Arc::new(Mutex::new(Vec::new()));
        let s = statuses.clone();
        scheduler.on_status(move |msg| lock(&s).push(msg.to_string()));
        let b = batches.clone();
        scheduler.on_result(move |batch| lock(&b).push(batch.clone()));

        Harness {
            _tmp: tmp,
            _listeners: listeners,
            store,
            scheduler,
            ports,
            statuses,
            batches,
        }
    }

    #[test]
    fn test_jitter_bounds() {
        assert_eq!(jitter_bounds(60), (55, 65));
        assert_eq!(jitter_bounds(3), (1, 8));
        assert_eq!(jitter_bounds(1), (1, 6));

        for _ in 0..200 {
            let d = sample_interval(60);
            assert!(d >= Duration::from_secs(55 * 60) && d <= Duration::from_secs(65 * 60));
            let d = sample_interval(2);
            assert!(d >= Duration::from_secs(60) && d <= Duration::from_secs(7 * 60));
        }
    }

    #[tokio::test]
    async fn test_loads_configuration_from_store() {
        let h = harness(45).await;
        let config = h.scheduler.config();
        assert_eq!(config.scan_interval, 45);
        assert_eq!(config.ports, h.ports);
        assert!(!h.scheduler.is_running());
        assert_eq!(h.scheduler.get_next_scan_time(), None);
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let h = harness(60).await;

        h.scheduler.start().await;
        let first = h.scheduler.state();
        assert!(first.is_running);
        assert!(first.next_scan.is_some());
        assert_eq!(first.max_workers, 4);
        assert_eq!(h.stored_rows(), h.ports.len());

        h.scheduler.start().await;
        assert_eq!(h.scheduler.state(), first);
        assert_eq!(h.stored_rows(), h.ports.len());
        assert_eq!(h.status_count("Monitoring started"), 1);

        h.scheduler.stop().await;
        let stopped = h.scheduler.state();
        assert!(!stopped.is_running);
        assert_eq!(stopped.next_scan, None);

        h.scheduler.stop().await;
        assert_eq!(h.scheduler.state(), stopped);
        assert_eq!(h.status_count("Monitoring stopped"), 1);
    }

    #[tokio::test]
    async fn test_run_now_when_stopped_completes_inline() {
        let h = harness(60).await;
        h.scheduler.run_now().await;

        assert_eq!(h.stored_rows(), h.ports.len());
        let batches = lock(&h.batches);
        assert_eq!(batches.len(), 1);
        let mut expected = h.ports.clone();
        expected.sort_unstable();
        assert_eq!(batches[0].ports(), expected);
        assert_eq!(batches[0].open_count(), 2);
        drop(batches);

        assert_eq!(h.status_count("2/3 ports open"), 1);
        assert!(h.scheduler.get_last_scan_time().unwrap().is_some());
        assert!(!h.scheduler.is_running());
    }

    #[tokio::test]
    async fn test_run_now_while_running_keeps_schedule() {
        let h = harness(60).await;
        h.scheduler.start().await;
        let next = h.scheduler.get_next_scan_time();
        assert!(next.is_some());

        h.scheduler.run_now().await;
        tokio::time::timeout(Duration::from_secs(5), async {
            while lock(&h.batches).len() < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        assert_eq!(h.scheduler.get_next_scan_time(), next);
        assert!(h.scheduler.is_running());
        assert_eq!(h.stored_rows(), 2 * h.ports.len());

        h.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_run_now_racing_stop_does_not_outlive_it() {
        let h = harness(60).await;
        h.scheduler.start().await;

        tokio::join!(h.scheduler.run_now(), h.scheduler.stop());
        assert!(!h.scheduler.is_running());

        let rows = h.stored_rows();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.stored_rows(), rows);
        assert!(lock(&h.scheduler.out_of_band).iter().all(|handle| handle.is_finished()));
    }

    #[tokio::test]
    async fn test_unresolvable_host_skips_cycle() {
        let h = harness(60).await;
        h.scheduler
            .update_configuration(Some("no-such-host.invalid".to_string()), None, None)
            .await
            .unwrap();

        h.scheduler.run_now().await;

        assert_eq!(h.stored_rows(), 0);
        assert!(lock(&h.batches).is_empty());
        assert_eq!(h.status_count("Cannot resolve host: no-such-host.invalid"), 1);
    }

    #[tokio::test]
    async fn test_update_configuration_persists_and_validates() {
        let h = harness(60).await;
        h.scheduler
            .update_configuration(None, Some(15), Some(vec![25, 587]))
            .await
            .unwrap();

        let stored = MonitorConfig::from_record(&h.store.get_configuration().unwrap());
        assert_eq!(stored.scan_interval, 15);
        assert_eq!(stored.ports, vec![25, 587]);
        assert_eq!(stored.host, "127.0.0.1");

        let err = h.scheduler.update_configuration(None, Some(0), None).await;
        assert!(matches!(err, Err(SchedulerError::Config(ConfigError::InvalidInterval(0)))));
        let err = h.scheduler.update_configuration(Some(" ".to_string()), None, None).await;
        assert!(matches!(err, Err(SchedulerError::Config(ConfigError::EmptyHost))));
        assert_eq!(h.scheduler.config().scan_interval, 15);
    }

    #[tokio::test]
    async fn test_reconfigure_while_running_restarts() {
        let h = harness(60).await;
        h.scheduler.start().await;
        h.scheduler
            .update_configuration(None, Some(30), None)
            .await
            .unwrap();

        assert!(h.scheduler.is_running());
        assert_eq!(h.status_count("Monitoring stopped"), 1);
        assert_eq!(h.status_count("Monitoring started"), 2);
        let next = h.scheduler.get_next_scan_time().unwrap();
        assert!(next <= Utc::now() + chrono::Duration::minutes(36));

        h.scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_break_scheduler() {
        let h = harness(60).await;
        let calls = Arc::new(Mutex::new(0usize));
        let c = calls.clone();
        h.scheduler.on_result(move |_| {
            let mut n = lock(&c);
            *n += 1;
            if *n == 1 {
                panic!("display went away");
            }
        });

        h.scheduler.run_now().await;
        assert_eq!(h.status_count("Scan failed"), 1);

        h.scheduler.run_now().await;
        assert_eq!(*lock(&calls), 2);
        assert_eq!(h.stored_rows(), 2 * h.ports.len());
    }

    #[tokio::test]
    async fn test_monitoring_status_and_history() {
        let h = harness(60).await;
        h.scheduler.run_now().await;

        let status = h.scheduler.get_monitoring_status().unwrap();
        assert!(!status.is_running);
        assert_eq!(status.target_host, "127.0.0.1");
        assert_eq!(status.ports_count, 3);
        assert!(status.last_scan.is_some());
        assert_eq!(status.next_scan, None);

        let summary = h.scheduler.get_scan_history_summary(1).unwrap();
        assert_eq!(summary.total_scans, 3);
        assert!(summary.unique_scan_sessions >= 1);
        assert_eq!(summary.blocked_ports.len(), 1);
    }

    #[tokio::test]
    async fn test_export_evidence_report() {
        let h = harness(60).await;
        h.scheduler.run_now().await;

        let out = NamedTempFile::new().unwrap();
        h.scheduler.export_evidence_report(out.path(), 7).unwrap();
        let text = std::fs::read_to_string(out.path()).unwrap();
        assert!(text.contains("SUMMARY:"));
        assert!(text.contains("PORT ANALYSIS:"));
        assert!(text.contains("TIME-BASED BLOCKING ANALYSIS:"));
        assert!(text.contains("Total Scans: 3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_loop_fires_on_schedule() {
        let h = harness(1).await;
        h.scheduler.start().await;
        assert_eq!(h.stored_rows(), h.ports.len());

        // Longest possible first delay is 6 minutes.
        tokio::time::sleep(Duration::from_secs(7 * 60)).await;
        h.scheduler.stop().await;

        let rows = h.store.recent(1000, None, None).unwrap();
        assert!(rows.len() >= 2 * h.ports.len());
        assert!(rows.iter().all(|r| r.result.status != ScanStatus::Unknown));
    }
}
