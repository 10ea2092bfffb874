//! Built-in `fs` connector: files under a directory

use async_trait::async_trait;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use super::connector::{Connector, Discovery, DiscoveryItem};
use super::watch::Watch;
use crate::error::{Error, Result};

/// Discovers regular files under the watch handle, recursively.
///
/// The cursor is `{"mtime_ms": <newest modification time seen>}`. Files
/// modified at or after the cursor are reported again; the queue's identity
/// constraint keeps them from being enqueued twice.
#[derive(Debug, Clone, Default)]
pub struct DirectoryConnector {
    include_hidden: bool,
}

impl DirectoryConnector {
    pub const SOURCE_TYPE: &'static str = "fs";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn include_hidden(mut self, include: bool) -> Self {
        self.include_hidden = include;
        self
    }

    fn relative_id(root: &Path, path: &Path) -> String {
        path.strip_prefix(root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }
}

#[async_trait]
impl Connector for DirectoryConnector {
    fn source_type(&self) -> &str {
        Self::SOURCE_TYPE
    }

    async fn discover(&self, watch: &Watch, cursor: Option<&serde_json::Value>) -> Result<Discovery> {
        let root = PathBuf::from(&watch.handle);
        let since = cursor
            .and_then(|c| c.get("mtime_ms"))
            .and_then(serde_json::Value::as_i64);

        let mut items = Vec::new();
        let mut newest: Option<i64> = None;
        let mut pending = vec![root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| Error::Connector(format!("cannot read {}: {}", dir.display(), e)))?;

            while let Some(entry) = entries.next_entry().await? {
                if !self.include_hidden && entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let meta = entry.metadata().await?;
                if meta.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                if !meta.is_file() {
                    continue;
                }

                let mtime_ms = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as i64)
                    .unwrap_or(0);
                if since.is_some_and(|s| mtime_ms < s) {
                    continue;
                }

                let path = entry.path();
                items.push(
                    DiscoveryItem::new(Self::relative_id(&root, &path))
                        .with_url(format!("file://{}", path.display()))
                        .with_metadata(json!({ "size": meta.len(), "mtime_ms": mtime_ms })),
                );
                newest = Some(newest.map_or(mtime_ms, |n| n.max(mtime_ms)));
            }
        }

        items.sort_by(|a, b| a.external_id.cmp(&b.external_id));
        Ok(Discovery {
            items,
            next_cursor: newest.map(|m| json!({ "mtime_ms": m })),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn watch(handle: &Path) -> Watch {
        Watch {
            id: 1,
            tenant: "t".to_string(),
            workspace: "w".to_string(),
            source_type: "fs".to_string(),
            handle: handle.to_string_lossy().to_string(),
            cursor: None,
            enabled: true,
            interval_secs: 60,
            next_due_at: Utc::now(),
            last_polled_at: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_discovers_nested_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b.txt"), "bb").unwrap();
        std::fs::write(dir.path().join(".hidden"), "x").unwrap();

        let discovery = DirectoryConnector::new()
            .discover(&watch(dir.path()), None)
            .await
            .unwrap();
        let ids: Vec<_> = discovery.items.iter().map(|i| i.external_id.as_str()).collect();
        assert_eq!(ids, vec!["a.txt", "sub/b.txt"]);
        assert!(discovery.next_cursor.is_some());
        assert_eq!(discovery.items[1].metadata.as_ref().unwrap()["size"], 2);
    }

    #[tokio::test]
    async fn test_cursor_skips_older_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();

        let cursor = json!({ "mtime_ms": i64::MAX });
        let discovery = DirectoryConnector::new()
            .discover(&watch(dir.path()), Some(&cursor))
            .await
            .unwrap();
        assert!(discovery.items.is_empty());
        assert!(discovery.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_missing_directory_is_connector_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let err = DirectoryConnector::new()
            .discover(&watch(&missing), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Connector(_)));
    }
}
