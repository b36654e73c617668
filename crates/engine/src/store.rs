//! SegmentStore: the filesystem layout for produced segments.
//!
//! One directory per source, shared by every quality's Stream, holding
//! files named `<quality>-<000000>.ts` or `.mp4`.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::EngineError;

const EXTENSIONS: [&str; 2] = ["ts", "mp4"];

#[derive(Debug, Clone)]
pub struct SegmentStore {
    root: PathBuf,
}

impl SegmentStore {
    /// Create the source's directory empty. Called once at supervisor
    /// birth (§4.3).
    pub fn create(root: PathBuf) -> Result<Self, EngineError> {
        std::fs::create_dir_all(&root).map_err(EngineError::store_io)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn candidate(&self, quality: &str, id: u64, ext: &str) -> PathBuf {
        self.root.join(format!("{quality}-{id:06}.{ext}"))
    }

    /// Returns the file path for `(quality, id)` when it exists, preferring
    /// whichever of `.ts`/`.mp4` is present. A single directory read
    /// settles both candidates at once (§4.3.1).
    pub fn path_for_chunk(&self, quality: &str, id: u64) -> Option<PathBuf> {
        let prefix = format!("{quality}-{id:06}.");
        let entries = std::fs::read_dir(&self.root).ok()?;
        let mut found: Option<PathBuf> = None;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(ext) = name.strip_prefix(&prefix)
                && EXTENSIONS.contains(&ext)
            {
                let path = entry.path();
                // Prefer `.ts` if both happen to exist.
                if ext == "ts" || found.is_none() {
                    found = Some(path);
                }
            }
        }
        found
    }

    /// Delete the segment file for `(quality, id)`; absence is not an
    /// error (§4.3).
    pub fn remove_chunk(&self, quality: &str, id: u64) {
        for ext in EXTENSIONS {
            let path = self.candidate(quality, id, ext);
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(?path, "pruned segment"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => debug!(?path, %err, "failed to prune segment"),
            }
        }
    }

    /// Remove the whole source directory. Called at supervisor destroy.
    pub fn destroy(&self) {
        if let Err(err) = std::fs::remove_dir_all(&self.root)
            && err.kind() != std::io::ErrorKind::NotFound
        {
            debug!(root = ?self.root, %err, "failed to remove segment store directory");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_for_chunk_prefers_ts_when_both_exist() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::create(dir.path().to_path_buf()).unwrap();
        std::fs::write(dir.path().join("720p-000001.mp4"), b"mp4").unwrap();
        std::fs::write(dir.path().join("720p-000001.ts"), b"ts").unwrap();

        let path = store.path_for_chunk("720p", 1).unwrap();
        assert_eq!(path.extension().unwrap(), "ts");
    }

    #[test]
    fn path_for_chunk_missing_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::create(dir.path().to_path_buf()).unwrap();
        assert!(store.path_for_chunk("720p", 0).is_none());
    }

    #[test]
    fn remove_chunk_is_not_an_error_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::create(dir.path().to_path_buf()).unwrap();
        store.remove_chunk("720p", 0);
    }

    #[test]
    fn destroy_removes_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("source-1");
        let store = SegmentStore::create(root.clone()).unwrap();
        store.destroy();
        assert!(!root.exists());
    }
}
