use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::connector::{Connector, Pipeline};
use super::watch::{Watch, WatchStore};
use crate::config::{ConfigSource, EnvConfig, QueueConfig, SchedulerConfig, keys};
use crate::error::{Error, Result};
use crate::metrics::{self, SharedMetrics};
use crate::queue::{IngestJob, JobQueue, JobResult, JobStatus};
use crate::storage::Database;

/// What one `worker_run_once` call did
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerReport {
    pub job_id: i64,
    pub tenant: String,
    pub workspace: String,
    pub external_id: String,
    /// Status after completion: done, pending (retry) or failed
    pub status: JobStatus,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Drives watches into the queue and jobs through the pipeline
pub struct Scheduler {
    queue: JobQueue,
    watches: WatchStore,
    connectors: HashMap<String, Arc<dyn Connector>>,
    pipeline: Option<Arc<dyn Pipeline>>,
    metrics: SharedMetrics,
    config: Arc<dyn ConfigSource>,
}

impl Scheduler {
    pub fn new(db: &Database, queue: JobQueue) -> Self {
        Self {
            queue,
            watches: WatchStore::new(db.pool().clone()),
            connectors: HashMap::new(),
            pipeline: None,
            metrics: metrics::noop(),
            config: Arc::new(EnvConfig::default()),
        }
    }

    /// Route watches of `connector.source_type()` to this connector
    pub fn register_connector(&mut self, connector: Arc<dyn Connector>) {
        let source_type = connector.source_type().to_string();
        debug!(source_type = %source_type, "Registered connector");
        self.connectors.insert(source_type, connector);
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.register_connector(connector);
        self
    }

    pub fn with_pipeline(mut self, pipeline: Arc<dyn Pipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    pub fn with_metrics(mut self, metrics: SharedMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_config(mut self, config: Arc<dyn ConfigSource>) -> Self {
        self.config = config;
        self
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn watches(&self) -> &WatchStore {
        &self.watches
    }

    /// Connector registered for `source_type`
    pub fn connector(&self, source_type: &str) -> Result<&Arc<dyn Connector>> {
        self.connectors
            .get(source_type)
            .ok_or_else(|| Error::ConnectorNotFound(source_type.to_string()))
    }

    fn lease_duration(&self) -> Duration {
        let secs = self
            .config
            .get_usize(keys::LEASE_SECS)
            .filter(|s| *s > 0)
            .map(|s| s as u64)
            .unwrap_or(QueueConfig::default().lease_secs);
        Duration::from_secs(secs)
    }

    fn watch_interval_secs(&self) -> u64 {
        self.config
            .get_usize(keys::WATCH_INTERVAL_SECS)
            .filter(|s| *s > 0)
            .map(|s| s as u64)
            .unwrap_or(SchedulerConfig::default().watch_interval_secs)
    }

    /// Register a watch with the configured default interval
    pub async fn add_watch(
        &self,
        tenant: &str,
        workspace: &str,
        source_type: &str,
        handle: &str,
    ) -> Result<Watch> {
        self.add_watch_with_interval(tenant, workspace, source_type, handle, self.watch_interval_secs())
            .await
    }

    pub async fn add_watch_with_interval(
        &self,
        tenant: &str,
        workspace: &str,
        source_type: &str,
        handle: &str,
        interval_secs: u64,
    ) -> Result<Watch> {
        if !self.connectors.contains_key(source_type) {
            warn!(source_type = %source_type, "Adding watch with no registered connector");
        }
        self.watches
            .add(tenant, workspace, source_type, handle, interval_secs)
            .await
    }

    pub async fn disable_watch(&self, id: i64) -> Result<()> {
        self.watches.set_enabled(id, false).await?;
        info!(watch_id = id, "Disabled watch");
        Ok(())
    }

    /// Poll every due watch once. Returns the number of newly enqueued jobs.
    pub async fn tick(&self) -> Result<usize> {
        let now = Utc::now();
        let due = self.watches.due(now).await?;
        let mut enqueued = 0;

        for watch in &due {
            let connector = match self.connector(&watch.source_type) {
                Ok(connector) => connector,
                Err(e) => {
                    warn!(watch_id = watch.id, error = %e, "No connector for watch, skipping");
                    continue;
                }
            };

            let Some(next_due) = i64::try_from(watch.interval_secs)
                .ok()
                .and_then(chrono::TimeDelta::try_seconds)
                .and_then(|interval| now.checked_add_signed(interval))
            else {
                warn!(
                    watch_id = watch.id,
                    interval_secs = watch.interval_secs,
                    "Watch interval out of range, skipping"
                );
                continue;
            };
            let source_labels = [("source_type", watch.source_type.as_str())];

            let discovery = match connector.discover(watch, watch.cursor.as_ref()).await {
                Ok(discovery) => discovery,
                Err(e) => {
                    warn!(
                        watch_id = watch.id,
                        handle = %watch.handle,
                        error = %e,
                        "Discovery failed, cursor left unchanged"
                    );
                    self.metrics
                        .increment("scheduler.connector_errors", &source_labels, 1);
                    self.watches.mark_polled(watch.id, next_due).await?;
                    continue;
                }
            };

            self.metrics.increment(
                "scheduler.discovered",
                &source_labels,
                discovery.items.len() as u64,
            );

            let mut inserted = 0;
            for item in &discovery.items {
                if self.queue.enqueue(&item.to_job(watch)).await?.inserted {
                    inserted += 1;
                }
            }

            match &discovery.next_cursor {
                Some(cursor) => self.watches.advance(watch.id, cursor, next_due).await?,
                None => self.watches.mark_polled(watch.id, next_due).await?,
            }

            if inserted > 0 {
                self.metrics.increment(
                    "queue.enqueued",
                    &[
                        ("tenant", watch.tenant.as_str()),
                        ("workspace", watch.workspace.as_str()),
                    ],
                    inserted as u64,
                );
                self.refresh_backlog(&watch.tenant, &watch.workspace).await;
            }

            debug!(
                watch_id = watch.id,
                discovered = discovery.items.len(),
                enqueued = inserted,
                "Polled watch"
            );
            enqueued += inserted;
        }

        if !due.is_empty() {
            info!(watches = due.len(), enqueued = enqueued, "Scheduler tick");
        }
        Ok(enqueued)
    }

    /// Lease one job, process it, and record the outcome.
    /// Returns `None` when nothing is claimable.
    pub async fn worker_run_once(&self, worker_id: &str) -> Result<Option<WorkerReport>> {
        let Some(job) = self
            .queue
            .dequeue_lease(worker_id, self.lease_duration())
            .await?
        else {
            return Ok(None);
        };

        let started = Instant::now();
        let result = self.process(&job).await;
        let status = self.queue.complete(&job, result).await?;
        let elapsed = started.elapsed();

        self.metrics
            .increment("queue.completed", &[("status", status.as_str())], 1);
        self.refresh_backlog(&job.tenant, &job.workspace).await;

        info!(
            job_id = job.id,
            worker_id = %worker_id,
            status = %status,
            elapsed_ms = elapsed.as_millis() as u64,
            "Worker finished job"
        );

        Ok(Some(WorkerReport {
            job_id: job.id,
            tenant: job.tenant,
            workspace: job.workspace,
            external_id: job.external_id,
            status,
            attempts: job.attempts,
            elapsed,
        }))
    }

    async fn process(&self, job: &IngestJob) -> JobResult {
        let Some(pipeline) = &self.pipeline else {
            warn!(job_id = job.id, "No pipeline configured");
            return JobResult::failure("no pipeline configured");
        };
        match pipeline.process(job).await {
            Ok(()) => JobResult::Success,
            Err(e) => {
                warn!(job_id = job.id, error = %e, code = e.code(), "Pipeline failed");
                JobResult::failure(e.to_string())
            }
        }
    }

    /// Backlog gauges are best effort
    async fn refresh_backlog(&self, tenant: &str, workspace: &str) {
        match self.queue.backlog_count(tenant, workspace).await {
            Ok(count) => self.metrics.set_gauge(
                "queue.backlog",
                &[("tenant", tenant), ("workspace", workspace)],
                count as f64,
            ),
            Err(e) => warn!(tenant = %tenant, workspace = %workspace, error = %e, "Failed to read backlog"),
        }
    }

    /// Tick and drain the queue every `poll_interval` until cancelled
    pub async fn run(
        &self,
        worker_id: &str,
        poll_interval: Duration,
        cancel: CancellationToken,
    ) -> Result<()> {
        if poll_interval.is_zero() {
            return Err(Error::InvalidArgument("poll interval must be positive".to_string()));
        }
        info!(worker_id = %worker_id, interval_ms = poll_interval.as_millis() as u64, "Scheduler started");

        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    info!(worker_id = %worker_id, "Scheduler shutting down (cancelled)");
                    break;
                }

                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "Scheduler tick failed");
                    }
                    self.drain(worker_id, &cancel).await;
                }
            }
        }
        Ok(())
    }

    async fn drain(&self, worker_id: &str, cancel: &CancellationToken) {
        while !cancel.is_cancelled() {
            match self.worker_run_once(worker_id).await {
                Ok(Some(_)) => continue,
                Ok(None) => break,
                Err(e) => {
                    warn!(worker_id = %worker_id, error = %e, "Worker iteration failed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MemoryConfig;
    use crate::metrics::InMemoryMetrics;
    use crate::scheduler::{Discovery, DiscoveryItem};
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Returns a fixed item list for any cursor; emits a cursor once seen
    struct StaticConnector {
        items: Vec<&'static str>,
    }

    #[async_trait]
    impl Connector for StaticConnector {
        fn source_type(&self) -> &str {
            "static"
        }

        async fn discover(&self, _watch: &Watch, _cursor: Option<&serde_json::Value>) -> Result<Discovery> {
            Ok(Discovery {
                items: self.items.iter().map(|id| DiscoveryItem::new(*id)).collect(),
                next_cursor: Some(serde_json::json!({ "seen": self.items.len() })),
            })
        }
    }

    struct FailingConnector;

    #[async_trait]
    impl Connector for FailingConnector {
        fn source_type(&self) -> &str {
            "broken"
        }

        async fn discover(&self, _watch: &Watch, _cursor: Option<&serde_json::Value>) -> Result<Discovery> {
            Err(Error::Connector("upstream unavailable".to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingPipeline {
        seen: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl Pipeline for RecordingPipeline {
        async fn process(&self, job: &IngestJob) -> Result<()> {
            self.seen.lock().unwrap().push(job.external_id.clone());
            if self.fail_on == Some(job.external_id.as_str()) {
                return Err(Error::Pipeline("bad document".to_string()));
            }
            Ok(())
        }
    }

    async fn scheduler() -> (Database, Scheduler, Arc<InMemoryMetrics>) {
        let db = Database::in_memory().await.unwrap();
        let metrics = Arc::new(InMemoryMetrics::new());
        let scheduler = Scheduler::new(&db, JobQueue::new(db.pool().clone()))
            .with_config(Arc::new(MemoryConfig::new()))
            .with_metrics(metrics.clone())
            .with_connector(Arc::new(StaticConnector {
                items: vec!["doc-1", "doc-2", "doc-3"],
            }))
            .with_connector(Arc::new(FailingConnector));
        (db, scheduler, metrics)
    }

    #[tokio::test]
    async fn test_tick_enqueues_and_is_idempotent() {
        let (_db, scheduler, metrics) = scheduler().await;
        let watch = scheduler
            .add_watch_with_interval("t", "w", "static", "feed", 3600)
            .await
            .unwrap();

        assert_eq!(scheduler.tick().await.unwrap(), 3);
        assert_eq!(scheduler.queue().backlog_count("t", "w").await.unwrap(), 3);
        assert_eq!(
            metrics.gauge("queue.backlog", &[("tenant", "t"), ("workspace", "w")]),
            Some(3.0)
        );

        // Not due again yet
        assert_eq!(scheduler.tick().await.unwrap(), 0);

        // Due again, same items: nothing new
        scheduler
            .watches()
            .mark_polled(watch.id, Utc::now() - chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(scheduler.tick().await.unwrap(), 0);
        assert_eq!(
            metrics.counter("scheduler.discovered", &[("source_type", "static")]),
            6
        );
        assert_eq!(
            scheduler.watches().get(watch.id).await.unwrap().cursor,
            Some(serde_json::json!({ "seen": 3 }))
        );
    }

    #[tokio::test]
    async fn test_connector_error_leaves_cursor() {
        let (_db, scheduler, metrics) = scheduler().await;
        let watch = scheduler.add_watch("t", "w", "broken", "x").await.unwrap();

        assert_eq!(scheduler.tick().await.unwrap(), 0);
        let stored = scheduler.watches().get(watch.id).await.unwrap();
        assert!(stored.cursor.is_none());
        assert!(stored.last_polled_at.is_some());
        assert_eq!(
            metrics.counter("scheduler.connector_errors", &[("source_type", "broken")]),
            1
        );
    }

    #[tokio::test]
    async fn test_missing_connector_is_skipped() {
        let (_db, scheduler, _) = scheduler().await;
        let watch = scheduler.add_watch("t", "w", "rss", "feed").await.unwrap();
        assert_eq!(scheduler.tick().await.unwrap(), 0);
        assert!(scheduler.watches().get(watch.id).await.unwrap().last_polled_at.is_none());
        assert!(matches!(
            scheduler.connector("rss"),
            Err(Error::ConnectorNotFound(s)) if s == "rss"
        ));
        assert!(scheduler.connector("static").is_ok());
    }

    #[tokio::test]
    async fn test_out_of_range_interval_is_skipped_not_fatal() {
        let (db, scheduler, _) = scheduler().await;
        let huge = scheduler
            .add_watch_with_interval("t", "w", "static", "huge", 60)
            .await
            .unwrap();
        // Rows written before the interval bound existed
        sqlx::query("UPDATE watches SET interval_secs = ? WHERE id = ?")
            .bind(10_000_000_000_000_i64)
            .bind(huge.id)
            .execute(db.pool())
            .await
            .unwrap();
        scheduler
            .add_watch_with_interval("t", "w2", "static", "ok", 60)
            .await
            .unwrap();

        assert_eq!(scheduler.tick().await.unwrap(), 3);
        assert_eq!(scheduler.queue().backlog_count("t", "w").await.unwrap(), 0);
        assert_eq!(scheduler.queue().backlog_count("t", "w2").await.unwrap(), 3);

        // Still due, and later ticks keep working
        let stored = scheduler.watches().get(huge.id).await.unwrap();
        assert!(stored.last_polled_at.is_none());
        assert_eq!(scheduler.tick().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_disabled_watch_is_not_polled() {
        let (_db, scheduler, _) = scheduler().await;
        let watch = scheduler.add_watch("t", "w", "static", "feed").await.unwrap();
        scheduler.disable_watch(watch.id).await.unwrap();
        assert_eq!(scheduler.tick().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_worker_processes_and_updates_backlog() {
        let (_db, scheduler, metrics) = scheduler().await;
        let pipeline = Arc::new(RecordingPipeline::default());
        let scheduler = scheduler.with_pipeline(pipeline.clone());
        scheduler.add_watch("t", "w", "static", "feed").await.unwrap();
        scheduler.tick().await.unwrap();

        let report = scheduler.worker_run_once("w1").await.unwrap().unwrap();
        assert_eq!(report.status, JobStatus::Done);
        assert_eq!(report.external_id, "doc-1");
        assert_eq!(scheduler.queue().backlog_count("t", "w").await.unwrap(), 2);
        assert_eq!(
            metrics.gauge("queue.backlog", &[("tenant", "t"), ("workspace", "w")]),
            Some(2.0)
        );
        assert_eq!(metrics.counter("queue.completed", &[("status", "done")]), 1);
        assert_eq!(pipeline.seen.lock().unwrap().as_slice(), ["doc-1"]);
    }

    #[tokio::test]
    async fn test_pipeline_failure_requeues() {
        let (_db, scheduler, _) = scheduler().await;
        let scheduler = scheduler.with_pipeline(Arc::new(RecordingPipeline {
            fail_on: Some("doc-1"),
            ..Default::default()
        }));
        scheduler.add_watch("t", "w", "static", "feed").await.unwrap();
        scheduler.tick().await.unwrap();

        let report = scheduler.worker_run_once("w1").await.unwrap().unwrap();
        assert_eq!(report.status, JobStatus::Pending);
        let job = scheduler.queue().get(report.job_id).await.unwrap();
        assert!(job.last_error.unwrap().contains("bad document"));
    }

    #[tokio::test]
    async fn test_no_pipeline_fails_job() {
        let (_db, scheduler, _) = scheduler().await;
        scheduler.add_watch("t", "w", "static", "feed").await.unwrap();
        scheduler.tick().await.unwrap();

        let report = scheduler.worker_run_once("w1").await.unwrap().unwrap();
        let job = scheduler.queue().get(report.job_id).await.unwrap();
        assert_eq!(job.last_error.as_deref(), Some("no pipeline configured"));
    }

    #[tokio::test]
    async fn test_empty_queue_returns_none() {
        let (_db, scheduler, _) = scheduler().await;
        assert!(scheduler.worker_run_once("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_drains_until_cancelled() {
        let (_db, scheduler, _) = scheduler().await;
        let scheduler = Arc::new(scheduler.with_pipeline(Arc::new(RecordingPipeline::default())));
        scheduler.add_watch("t", "w", "static", "feed").await.unwrap();

        let cancel = CancellationToken::new();
        let handle = {
            let scheduler = scheduler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                scheduler
                    .run("w1", Duration::from_millis(10), cancel)
                    .await
            })
        };

        for _ in 0..200 {
            let counts = scheduler.queue().status_counts("t", "w").await.unwrap();
            if counts.done == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cancel.cancel();
        handle.await.unwrap().unwrap();

        let counts = scheduler.queue().status_counts("t", "w").await.unwrap();
        assert_eq!(counts.done, 3);
    }

    #[tokio::test]
    async fn test_run_rejects_zero_interval() {
        let (_db, scheduler, _) = scheduler().await;
        let result = scheduler
            .run("w1", Duration::ZERO, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }
}
