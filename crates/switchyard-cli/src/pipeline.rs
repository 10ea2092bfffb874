//! Built-in processing pipeline for `worker run-once`

use async_trait::async_trait;
use switchyard_core::queue::IngestJob;
use switchyard_core::scheduler::{DirectoryConnector, Pipeline};
use switchyard_core::{Error, Result};
use tracing::info;

/// Logs each processed job. Jobs from the `fs` connector fail when their file
/// has disappeared since discovery.
#[derive(Debug, Default)]
pub struct LogPipeline;

#[async_trait]
impl Pipeline for LogPipeline {
    async fn process(&self, job: &IngestJob) -> Result<()> {
        if job.source_type == DirectoryConnector::SOURCE_TYPE {
            if let Some(path) = job.url.as_deref().and_then(|u| u.strip_prefix("file://")) {
                if !tokio::fs::try_exists(path).await? {
                    return Err(Error::Pipeline(format!("{} no longer exists", path)));
                }
            }
        }

        info!(
            job_id = job.id,
            tenant = %job.tenant,
            workspace = %job.workspace,
            source_type = %job.source_type,
            external_id = %job.external_id,
            attempt = job.attempts,
            "Processed job"
        );
        Ok(())
    }
}
