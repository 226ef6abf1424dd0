//! Scan job orchestration.
//!
//! [`Orchestrator::enqueue`] creates or reuses a job row and hands a
//! [`ScanTask`] to the configured [`TaskSubmitter`]. The scan body lives in
//! [`ScanRunner::run_once`]; submitters decide where it runs and retry it with
//! a [`RetryPolicy`].

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{error, info, warn};

use crate::config::QueueConfig;
use crate::connectors::{ConnectorError, ConnectorRegistry};
use crate::models::{utc_now, JobStatus, NewScanJob, ScanJob};
use crate::store::{CatalogConn, CatalogStore, StoreError, StoreResult};
use crate::upsert::{upsert_discovery, UpsertReport};

/// One scan execution request handed to a submitter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanTask {
    pub source: String,
    pub job_id: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("unknown connector source: {0}")]
    UnknownSource(String),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ScanError {
    /// Re-running cannot fix an unregistered source.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ScanError::UnknownSource(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("scan queue closed")]
    QueueClosed,
}

/// Fixed-delay retry of a whole scan body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            delay: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            delay: config.retry_delay(),
        }
    }

    /// Delay before the next attempt, or `None` when the failure is final.
    pub fn next_delay(&self, err: &ScanError, retries_done: u32) -> Option<Duration> {
        (err.is_retryable() && retries_done < self.max_retries).then_some(self.delay)
    }
}

/// Executes scan bodies against a store.
pub struct ScanRunner<S> {
    store: Arc<S>,
    registry: Arc<ConnectorRegistry>,
}

impl<S: CatalogStore> ScanRunner<S> {
    pub fn new(store: Arc<S>, registry: Arc<ConnectorRegistry>) -> Self {
        Self { store, registry }
    }

    /// One attempt: discover, harvest, then upsert and finish the job together.
    ///
    /// The job is marked `running` (and its attempt counted) in its own commit
    /// first. The store keeps the later of the stored and harvested cursors, so
    /// an overlapping run of the same job cannot move it backward. On failure
    /// the job is marked `failed` with its cursor untouched.
    pub fn run_once(&self, task: &ScanTask) -> Result<UpsertReport, ScanError> {
        let job = self
            .store
            .transaction(|conn| conn.mark_job_running(task.job_id, utc_now()))?;

        match self.execute(task, &job) {
            Ok(report) => Ok(report),
            Err(e) => {
                let marked = self.store.transaction(|conn| {
                    conn.finish_job(task.job_id, JobStatus::Failed, None, utc_now())
                });
                if let Err(mark_err) = marked {
                    error!("job {}: failed to record failure: {}", task.job_id, mark_err);
                }
                Err(e)
            }
        }
    }

    fn execute(&self, task: &ScanTask, job: &ScanJob) -> Result<UpsertReport, ScanError> {
        let connector = self
            .registry
            .get(&task.source)
            .ok_or_else(|| ScanError::UnknownSource(task.source.clone()))?;

        let cursor = job.last_seen_at;
        let discovered = connector.discover(cursor)?;
        let harvested = connector.harvest(cursor)?;

        let report = self.store.transaction(|conn| {
            let report = upsert_discovery(conn, &task.source, &discovered, &harvested)?;
            let now = utc_now();
            let next = harvested.advanced_cursor.unwrap_or(now);
            conn.finish_job(task.job_id, JobStatus::Success, Some(next), now)?;
            Ok(report)
        })?;
        Ok(report)
    }

    /// Runs the body until it succeeds or `policy` gives up, sleeping with `sleep`.
    pub fn run_with_retry(
        &self,
        task: &ScanTask,
        policy: &RetryPolicy,
        sleep: impl Fn(Duration),
    ) -> Result<UpsertReport, ScanError> {
        let mut retries = 0;
        loop {
            match self.run_once(task) {
                Ok(report) => return Ok(report),
                Err(e) => match policy.next_delay(&e, retries) {
                    Some(delay) => {
                        warn!(
                            "job {} ({}): attempt {} failed, retrying in {:?}: {}",
                            task.job_id,
                            task.source,
                            retries + 1,
                            delay,
                            e
                        );
                        retries += 1;
                        sleep(delay);
                    }
                    None => return Err(e),
                },
            }
        }
    }
}

/// Where scan tasks go once their job row exists.
pub trait TaskSubmitter: Send + Sync {
    fn submit(&self, task: ScanTask) -> Result<(), EnqueueError>;
}

/// Runs each scan on the submitting thread before returning.
pub struct InlineSubmitter<S> {
    runner: Arc<ScanRunner<S>>,
    policy: RetryPolicy,
}

impl<S: CatalogStore> InlineSubmitter<S> {
    pub fn new(runner: Arc<ScanRunner<S>>, policy: RetryPolicy) -> Self {
        Self { runner, policy }
    }
}

impl<S: CatalogStore> TaskSubmitter for InlineSubmitter<S> {
    fn submit(&self, task: ScanTask) -> Result<(), EnqueueError> {
        match self
            .runner
            .run_with_retry(&task, &self.policy, std::thread::sleep)
        {
            Ok(report) => info!("job {} ({}) succeeded: {:?}", task.job_id, task.source, report),
            Err(e) => error!("job {} ({}) failed: {}", task.job_id, task.source, e),
        }
        Ok(())
    }
}

/// Hands tasks to a background worker over an unbounded channel.
#[derive(Clone)]
pub struct QueueSubmitter {
    tx: UnboundedSender<ScanTask>,
}

impl QueueSubmitter {
    pub fn channel() -> (Self, UnboundedReceiver<ScanTask>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl TaskSubmitter for QueueSubmitter {
    fn submit(&self, task: ScanTask) -> Result<(), EnqueueError> {
        self.tx.send(task).map_err(|_| EnqueueError::QueueClosed)
    }
}

/// Drains the scan queue until every sender is dropped.
///
/// Each task gets its own tokio task; the scan body runs on the blocking pool.
pub async fn run_queue_worker<S: CatalogStore>(
    mut rx: UnboundedReceiver<ScanTask>,
    runner: Arc<ScanRunner<S>>,
    policy: RetryPolicy,
) {
    info!("scan queue worker started");
    while let Some(task) = rx.recv().await {
        tokio::spawn(process_task(runner.clone(), policy, task));
    }
    info!("scan queue worker stopped");
}

async fn process_task<S: CatalogStore>(
    runner: Arc<ScanRunner<S>>,
    policy: RetryPolicy,
    task: ScanTask,
) {
    let mut retries = 0;
    loop {
        let attempt_runner = runner.clone();
        let attempt_task = task.clone();
        let outcome =
            tokio::task::spawn_blocking(move || attempt_runner.run_once(&attempt_task)).await;

        let err = match outcome {
            Ok(Ok(report)) => {
                info!("job {} ({}) succeeded: {:?}", task.job_id, task.source, report);
                return;
            }
            Ok(Err(e)) => e,
            Err(join_err) => {
                error!("job {} ({}): scan task panicked: {}", task.job_id, task.source, join_err);
                return;
            }
        };

        match policy.next_delay(&err, retries) {
            Some(delay) => {
                warn!(
                    "job {} ({}): attempt {} failed, retrying in {:?}: {}",
                    task.job_id,
                    task.source,
                    retries + 1,
                    delay,
                    err
                );
                retries += 1;
                tokio::time::sleep(delay).await;
            }
            None => {
                error!("job {} ({}) failed: {}", task.job_id, task.source, err);
                return;
            }
        }
    }
}

/// Job lifecycle entry points used by the HTTP layer.
pub struct Orchestrator<S> {
    store: Arc<S>,
    submitter: Arc<dyn TaskSubmitter>,
}

impl<S> Clone for Orchestrator<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            submitter: self.submitter.clone(),
        }
    }
}

impl<S: CatalogStore> Orchestrator<S> {
    pub fn new(store: Arc<S>, submitter: Arc<dyn TaskSubmitter>) -> Self {
        Self { store, submitter }
    }

    /// Creates a pending job, or reuses the newest job with the same
    /// `(source, idempotency_key)`, and submits it for execution.
    ///
    /// Reuse does not stop a re-run: the reused job is dispatched again.
    pub fn enqueue(&self, source: &str, idempotency_key: Option<&str>) -> Result<i32, EnqueueError> {
        let job_id = self.store.transaction(|conn| {
            if let Some(key) = idempotency_key {
                if let Some(existing) = conn.find_job_by_key(source, key)? {
                    return Ok(existing.id);
                }
            }
            let now = utc_now();
            let job = conn.insert_job(NewScanJob {
                source: source.to_string(),
                idempotency_key: idempotency_key.map(str::to_string),
                status: JobStatus::Pending,
                attempts: 0,
                created_at: now,
                updated_at: now,
            })?;
            Ok(job.id)
        })?;

        info!("enqueued scan job {} for source {}", job_id, source);
        self.submitter.submit(ScanTask {
            source: source.to_string(),
            job_id,
        })?;
        Ok(job_id)
    }

    pub fn get_job(&self, id: i32) -> StoreResult<Option<ScanJob>> {
        self.store.transaction(|conn| conn.job(id))
    }

    pub fn list_jobs(&self, source: Option<&str>, limit: i64, offset: i64) -> StoreResult<Vec<ScanJob>> {
        self.store
            .transaction(|conn| conn.list_jobs(source, limit, offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::{
        Connector, ConnectorResult, DiscoverResult, DiscoveredAsset, HarvestResult, S3Connector,
    };
    use crate::store::MemoryStore;
    use anyhow::Result;
    use chrono::{NaiveDate, NaiveDateTime};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn ts(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 1, day)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    /// Connector whose harvest cursors and failures are scripted by the test.
    struct ScriptedConnector {
        cursors: Mutex<Vec<Option<NaiveDateTime>>>,
        failing: AtomicBool,
    }

    impl ScriptedConnector {
        fn new(cursors: Vec<Option<NaiveDateTime>>) -> Self {
            Self {
                cursors: Mutex::new(cursors),
                failing: AtomicBool::new(false),
            }
        }
    }

    impl Connector for ScriptedConnector {
        fn key(&self) -> &str {
            "scripted"
        }

        fn discover(&self, _cursor: Option<NaiveDateTime>) -> ConnectorResult<DiscoverResult> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ConnectorError::Source("source offline".to_string()));
            }
            Ok(DiscoverResult {
                assets: vec![DiscoveredAsset {
                    system: Some("scripted".to_string()),
                    name: "t".to_string(),
                    description: None,
                    kind: None,
                }],
                columns: Vec::new(),
            })
        }

        fn harvest(&self, _since: Option<NaiveDateTime>) -> ConnectorResult<HarvestResult> {
            let next = self.cursors.lock().unwrap().pop().flatten();
            Ok(HarvestResult {
                payload: serde_json::json!({"type": "scripted"}),
                advanced_cursor: next,
            })
        }
    }

    /// Connector whose first harvest waits for the test to release it.
    struct GatedConnector {
        calls: AtomicUsize,
        entered: Mutex<std::sync::mpsc::Sender<()>>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
    }

    impl Connector for GatedConnector {
        fn key(&self) -> &str {
            "gated"
        }

        fn discover(&self, _cursor: Option<NaiveDateTime>) -> ConnectorResult<DiscoverResult> {
            Ok(DiscoverResult::default())
        }

        fn harvest(&self, _since: Option<NaiveDateTime>) -> ConnectorResult<HarvestResult> {
            let cursor = if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                let _ = self.entered.lock().unwrap().send(());
                let _ = self.release.lock().unwrap().recv();
                ts(5)
            } else {
                ts(10)
            };
            Ok(HarvestResult {
                payload: serde_json::json!({"type": "gated"}),
                advanced_cursor: Some(cursor),
            })
        }
    }

    fn no_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 0,
            delay: Duration::ZERO,
        }
    }

    fn inline_orchestrator(
        connector: Arc<dyn Connector>,
        policy: RetryPolicy,
    ) -> (Arc<MemoryStore>, Orchestrator<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let mut registry = ConnectorRegistry::new();
        registry.register(connector);
        let runner = Arc::new(ScanRunner::new(store.clone(), Arc::new(registry)));
        let submitter = Arc::new(InlineSubmitter::new(runner, policy));
        (store.clone(), Orchestrator::new(store, submitter))
    }

    #[test]
    fn test_enqueue_reuses_job_for_same_key() -> Result<()> {
        let (store, orchestrator) =
            inline_orchestrator(Arc::new(S3Connector::new("bucket", "prefix/")), no_retry());
        let first = orchestrator.enqueue("s3", Some("nightly"))?;
        let second = orchestrator.enqueue("s3", Some("nightly"))?;
        let other = orchestrator.enqueue("s3", Some("hourly"))?;
        let unkeyed = orchestrator.enqueue("s3", None)?;

        assert_eq!(first, second);
        assert_ne!(first, other);
        assert_ne!(other, unkeyed);

        let job = orchestrator.get_job(first)?.unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.attempts, 2);
        assert_eq!(store.snapshot()?.jobs().len(), 3);
        Ok(())
    }

    #[test]
    fn test_cursor_never_moves_backward() -> Result<()> {
        // Popped from the back: day 10 first, then day 3.
        let connector = Arc::new(ScriptedConnector::new(vec![Some(ts(3)), Some(ts(10))]));
        let (_, orchestrator) = inline_orchestrator(connector, no_retry());

        let id = orchestrator.enqueue("scripted", Some("k"))?;
        assert_eq!(orchestrator.get_job(id)?.unwrap().last_seen_at, Some(ts(10)));

        orchestrator.enqueue("scripted", Some("k"))?;
        let job = orchestrator.get_job(id)?.unwrap();
        assert_eq!(job.last_seen_at, Some(ts(10)));
        assert_eq!(job.status, JobStatus::Success);
        Ok(())
    }

    #[test]
    fn test_overlapping_runs_keep_latest_cursor() -> Result<()> {
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let connector = Arc::new(GatedConnector {
            calls: AtomicUsize::new(0),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let store = Arc::new(MemoryStore::new());
        let mut registry = ConnectorRegistry::new();
        registry.register(connector);
        let runner = Arc::new(ScanRunner::new(store.clone(), Arc::new(registry)));

        let job_id = store.transaction(|conn| {
            let now = utc_now();
            Ok(conn
                .insert_job(NewScanJob {
                    source: "gated".to_string(),
                    idempotency_key: Some("k".to_string()),
                    status: JobStatus::Pending,
                    attempts: 0,
                    created_at: now,
                    updated_at: now,
                })?
                .id)
        })?;
        let task = ScanTask {
            source: "gated".to_string(),
            job_id,
        };

        // The first run stalls inside harvest with an older cursor.
        let slow = {
            let runner = runner.clone();
            let task = task.clone();
            std::thread::spawn(move || runner.run_once(&task).map(|_| ()))
        };
        entered_rx.recv()?;

        runner.run_once(&task)?;
        assert_eq!(store.snapshot()?.jobs()[0].last_seen_at, Some(ts(10)));

        release_tx.send(())?;
        slow.join().expect("stalled run panicked")?;

        let job = store.snapshot()?.jobs()[0].clone();
        assert_eq!(job.last_seen_at, Some(ts(10)));
        assert_eq!(job.status, JobStatus::Success);
        assert_eq!(job.attempts, 2);
        Ok(())
    }

    #[test]
    fn test_missing_advanced_cursor_uses_now() -> Result<()> {
        let (_, orchestrator) =
            inline_orchestrator(Arc::new(S3Connector::new("bucket", "prefix/")), no_retry());
        let before = utc_now();
        let id = orchestrator.enqueue("s3", None)?;
        let cursor = orchestrator.get_job(id)?.unwrap().last_seen_at.unwrap();
        assert!(cursor >= before);
        Ok(())
    }

    #[test]
    fn test_failed_job_keeps_cursor_and_counts_attempts() -> Result<()> {
        let connector = Arc::new(ScriptedConnector::new(vec![Some(ts(5))]));
        let policy = RetryPolicy {
            max_retries: 2,
            delay: Duration::ZERO,
        };
        let (store, orchestrator) = inline_orchestrator(connector.clone(), policy);

        let id = orchestrator.enqueue("scripted", Some("k"))?;
        assert_eq!(orchestrator.get_job(id)?.unwrap().attempts, 1);

        connector.failing.store(true, Ordering::SeqCst);
        let artifacts_before = store.snapshot()?.artifacts().len();
        orchestrator.enqueue("scripted", Some("k"))?;

        let job = orchestrator.get_job(id)?.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1 + 3);
        assert_eq!(job.last_seen_at, Some(ts(5)));
        assert_eq!(store.snapshot()?.artifacts().len(), artifacts_before);
        Ok(())
    }

    #[test]
    fn test_unknown_source_is_not_retried() -> Result<()> {
        let policy = RetryPolicy {
            max_retries: 5,
            delay: Duration::ZERO,
        };
        let (_, orchestrator) =
            inline_orchestrator(Arc::new(S3Connector::new("bucket", "prefix/")), policy);
        let id = orchestrator.enqueue("oracle", None)?;
        let job = orchestrator.get_job(id)?.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        Ok(())
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy::default();
        let transient = ScanError::Connector(ConnectorError::Source("down".to_string()));
        assert_eq!(policy.next_delay(&transient, 0), Some(Duration::from_secs(10)));
        assert_eq!(policy.next_delay(&transient, 4), Some(Duration::from_secs(10)));
        assert_eq!(policy.next_delay(&transient, 5), None);
        let unknown = ScanError::UnknownSource("x".to_string());
        assert_eq!(policy.next_delay(&unknown, 0), None);
    }

    #[test]
    fn test_list_jobs_filters_by_source() -> Result<()> {
        let (_, orchestrator) =
            inline_orchestrator(Arc::new(S3Connector::new("bucket", "prefix/")), no_retry());
        orchestrator.enqueue("s3", None)?;
        orchestrator.enqueue("oracle", None)?;
        orchestrator.enqueue("s3", None)?;
        let s3 = orchestrator.list_jobs(Some("s3"), 200, 0)?;
        assert_eq!(s3.len(), 2);
        assert!(s3[0].id > s3[1].id);
        assert_eq!(orchestrator.list_jobs(None, 1, 0)?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_queue_worker_runs_submitted_scans() -> Result<()> {
        let store = Arc::new(MemoryStore::new());
        let mut registry = ConnectorRegistry::new();
        registry.register(Arc::new(S3Connector::new("bucket", "prefix/")));
        let runner = Arc::new(ScanRunner::new(store.clone(), Arc::new(registry)));
        let (submitter, rx) = QueueSubmitter::channel();
        let worker = tokio::spawn(run_queue_worker(rx, runner, no_retry()));

        let orchestrator = Orchestrator::new(store.clone(), Arc::new(submitter));
        let id = orchestrator.enqueue("s3", None)?;

        let mut status = JobStatus::Pending;
        for _ in 0..100 {
            status = orchestrator.get_job(id)?.unwrap().status;
            if status == JobStatus::Success {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, JobStatus::Success);

        drop(orchestrator);
        worker.await?;
        Ok(())
    }
}
