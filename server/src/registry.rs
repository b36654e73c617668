//! SourceRegistry: the outer registry `StreamSupervisor::on_close` reports
//! to (SPEC addition, §3). Owns the concurrent map from source id to
//! supervisor, probing new sources lazily and reaping closed ones.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use engine::{ArgvBuilderFactory, EngineConfig, EngineError, Prober, StreamSupervisor};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::collaborators::build_ladder;

struct RegistryInner {
    sources: DashMap<String, StreamSupervisor>,
    store_root: PathBuf,
    binary_path: String,
    prober: Arc<dyn Prober>,
    argv_builder_factory: Arc<dyn ArgvBuilderFactory>,
    compatible_codec: String,
    config: EngineConfig,
}

#[derive(Clone)]
pub struct SourceRegistry(Arc<RegistryInner>);

impl SourceRegistry {
    pub fn new(
        store_root: PathBuf,
        binary_path: String,
        prober: Arc<dyn Prober>,
        argv_builder_factory: Arc<dyn ArgvBuilderFactory>,
        compatible_codec: String,
        config: EngineConfig,
    ) -> Self {
        Self(Arc::new(RegistryInner {
            sources: DashMap::new(),
            store_root,
            binary_path,
            prober,
            argv_builder_factory,
            compatible_codec,
            config,
        }))
    }

    /// Opaque, filesystem-safe id for a resolved source path: a hex SHA-256
    /// digest, so two different source paths never collide on disk and the
    /// id is stable across requests for the same path.
    pub fn source_id_for(source_path: &Path) -> String {
        let mut hasher = Sha256::new();
        hasher.update(source_path.to_string_lossy().as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Returns the existing supervisor for `source_id`, or probes
    /// `source_path` and builds one.
    pub async fn get_or_create(
        &self,
        source_id: &str,
        source_path: &Path,
    ) -> Result<StreamSupervisor, EngineError> {
        if let Some(existing) = self.0.sources.get(source_id) {
            return Ok(existing.clone());
        }

        let probe = self.0.prober.probe(source_path).await?;
        let ladder = build_ladder(&probe);
        let source_root = self.0.store_root.join(source_id);

        let supervisor = StreamSupervisor::create(
            source_id.to_string(),
            source_path.to_path_buf(),
            source_root,
            probe,
            self.0.config.clone(),
            self.0.binary_path.clone(),
            self.0.argv_builder_factory.clone(),
            self.0.compatible_codec.clone(),
            ladder,
        )?;

        // Another request may have raced us; prefer whichever landed first
        // so two supervisors never own the same SegmentStore directory.
        let supervisor = match self.0.sources.entry(source_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(entry) => {
                supervisor.destroy();
                entry.get().clone()
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(supervisor.clone());
                supervisor
            }
        };

        self.spawn_reaper(source_id.to_string(), supervisor.clone());
        Ok(supervisor)
    }

    fn spawn_reaper(&self, source_id: String, supervisor: StreamSupervisor) {
        let registry = self.clone();
        tokio::spawn(async move {
            supervisor.on_close().await;
            registry.0.sources.remove(&source_id);
            info!(source_id = %source_id, "reaped idle source from registry");
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_id_is_stable_for_the_same_path() {
        let a = SourceRegistry::source_id_for(Path::new("/videos/one.mp4"));
        let b = SourceRegistry::source_id_for(Path::new("/videos/one.mp4"));
        let c = SourceRegistry::source_id_for(Path::new("/videos/two.mp4"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
