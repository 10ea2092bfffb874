//! Collaborator traits for discovery and processing

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::watch::Watch;
use crate::error::Result;
use crate::queue::{IngestJob, NewJob};

/// One item found by a connector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryItem {
    pub external_id: String,
    pub url: Option<String>,
    pub priority: i64,
    pub metadata: Option<serde_json::Value>,
}

impl DiscoveryItem {
    pub fn new(external_id: impl Into<String>) -> Self {
        Self {
            external_id: external_id.into(),
            url: None,
            priority: 0,
            metadata: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Job for this item, scoped to the watch's tenant and workspace
    pub fn to_job(&self, watch: &Watch) -> NewJob {
        NewJob {
            tenant: watch.tenant.clone(),
            workspace: watch.workspace.clone(),
            source_type: watch.source_type.clone(),
            external_id: self.external_id.clone(),
            url: self.url.clone(),
            priority: self.priority,
            metadata: self.metadata.clone(),
        }
    }
}

/// Result of one discovery call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Discovery {
    pub items: Vec<DiscoveryItem>,
    /// New cursor; `None` keeps the stored one
    pub next_cursor: Option<serde_json::Value>,
}

impl Discovery {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Finds new items for a watch
///
/// Discovery must be a pure function of the watch and its cursor: calling it
/// twice with the same cursor yields the same items.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Source type this connector serves (`fs`, `rss`, ...)
    fn source_type(&self) -> &str;

    async fn discover(&self, watch: &Watch, cursor: Option<&serde_json::Value>) -> Result<Discovery>;
}

/// Processes a leased job. An error marks the attempt failed.
#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn process(&self, job: &IngestJob) -> Result<()>;
}
