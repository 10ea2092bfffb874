//! Policy snapshots as standalone JSON files
//!
//! Writes go to a sibling temp file first and are renamed into place, so a
//! reader never observes a half-written snapshot.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::bandit::PolicySnapshot;
use crate::error::Result;

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "snapshot".into());
    name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    path.with_file_name(name)
}

/// Atomically write `snapshot` to `path`, creating parent directories
pub fn write_snapshot(path: &Path, snapshot: &PolicySnapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let json = serde_json::to_vec_pretty(snapshot)?;
    write_atomic(path, &json, stage_file)?;

    debug!(
        path = %path.display(),
        kind = %snapshot.kind(),
        arms = snapshot.arm_count(),
        "Wrote policy snapshot"
    );
    Ok(())
}

fn stage_file(tmp: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(tmp)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Stage `bytes` in a temp file and rename it over `path`. The temp file is
/// removed on any failure.
fn write_atomic(
    path: &Path,
    bytes: &[u8],
    stage: impl FnOnce(&Path, &[u8]) -> io::Result<()>,
) -> io::Result<()> {
    let tmp = temp_path(path);
    let result = stage(&tmp, bytes).and_then(|()| fs::rename(&tmp, path));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Read a snapshot previously written by [`write_snapshot`]
pub fn read_snapshot(path: &Path) -> Result<PolicySnapshot> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bandit::ValueArmState;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("policy.json");
        let snap = PolicySnapshot::EpsilonGreedy {
            epsilon: 0.0,
            arms: vec![ValueArmState::new("a")],
        };

        write_snapshot(&path, &snap).unwrap();
        assert!(path.exists());
        assert_eq!(read_snapshot(&path).unwrap(), snap);

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty(), "temp files left behind: {}", leftovers.len());
    }

    #[test]
    fn test_read_missing_is_io_error() {
        let dir = TempDir::new().unwrap();
        let err = read_snapshot(&dir.path().join("absent.json")).unwrap_err();
        assert!(matches!(err, crate::error::Error::Io(_)));
    }

    fn temp_files(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count()
    }

    #[test]
    fn test_failed_write_removes_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("policy.json");

        let err = write_atomic(&path, b"{}", |tmp, bytes| {
            let mut file = fs::File::create(tmp)?;
            file.write_all(&bytes[..1])?;
            Err(io::Error::other("disk full"))
        })
        .unwrap_err();

        assert_eq!(err.to_string(), "disk full");
        assert!(!path.exists());
        assert_eq!(temp_files(dir.path()), 0);
    }

    #[test]
    fn test_failed_rename_removes_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("policy.json");
        // A non-empty directory in the way makes the rename fail
        fs::create_dir_all(path.join("occupied")).unwrap();
        let snap = PolicySnapshot::Ucb1 { arms: vec![] };

        assert!(write_snapshot(&path, &snap).is_err());
        assert_eq!(temp_files(dir.path()), 0);
    }
}
