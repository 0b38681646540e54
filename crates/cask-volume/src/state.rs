//! Persisted container volume records.
//!
//! Each container's resolved volumes are serialized to
//! `<root>/containers/<id>/volumes.json` with stable keys, consumed again on
//! restart and by volumes-from resolution.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use cask_common::{CaskError, CaskPaths, CaskResult};

/// A container's on-disk volume record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerVolumes {
    /// Destination path inside the container to host source identity.
    #[serde(rename = "Volumes")]
    pub volumes: BTreeMap<String, String>,

    /// Destination path to writability.
    #[serde(rename = "VolumesRW")]
    pub volumes_rw: BTreeMap<String, bool>,

    /// Destination path to mapped block device; empty for non-block volumes.
    #[serde(rename = "VolumesCephDevice")]
    pub volumes_ceph_device: BTreeMap<String, String>,

    /// Source containers whose volumes-from entries were already merged.
    #[serde(rename = "AppliedVolumesFrom")]
    pub applied_volumes_from: BTreeSet<String>,
}

impl ContainerVolumes {
    /// Record a resolved mount.
    pub fn record(&mut self, destination: &str, source: &str, writable: bool, ceph_device: &str) {
        self.volumes
            .insert(destination.to_string(), source.to_string());
        self.volumes_rw.insert(destination.to_string(), writable);
        self.volumes_ceph_device
            .insert(destination.to_string(), ceph_device.to_string());
    }

    /// Forget a destination.
    pub fn remove(&mut self, destination: &str) {
        self.volumes.remove(destination);
        self.volumes_rw.remove(destination);
        self.volumes_ceph_device.remove(destination);
    }

    /// Destinations in lexicographic order, so parent mounts install before
    /// children (`/etc` before `/etc/resolv.conf`).
    #[must_use]
    pub fn sorted_destinations(&self) -> Vec<&str> {
        self.volumes.keys().map(String::as_str).collect()
    }
}

/// Loads and saves container volume records.
#[derive(Debug, Clone)]
pub struct ContainerStore {
    paths: CaskPaths,
}

impl ContainerStore {
    /// Create a store over the given paths.
    #[must_use]
    pub fn new(paths: CaskPaths) -> Self {
        Self { paths }
    }

    /// Save a container's record.
    pub fn save(&self, container_id: &str, record: &ContainerVolumes) -> CaskResult<()> {
        let path = self.paths.container_volumes(container_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(record)?;
        std::fs::write(&path, json)?;

        tracing::debug!(
            container_id,
            path = %path.display(),
            "Saved container volume record"
        );
        Ok(())
    }

    /// Load a container's record.
    ///
    /// # Errors
    ///
    /// Fails when the container has no record on disk.
    pub fn load(&self, container_id: &str) -> CaskResult<ContainerVolumes> {
        let path = self.paths.container_volumes(container_id);
        if !path.exists() {
            return Err(CaskError::Internal {
                message: format!("No volume record for container {}", container_id),
            });
        }
        let json = std::fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Load a container's record, or an empty one if none exists yet.
    pub fn load_or_default(&self, container_id: &str) -> CaskResult<ContainerVolumes> {
        let path = self.paths.container_volumes(container_id);
        if !path.exists() {
            return Ok(ContainerVolumes::default());
        }
        self.load(container_id)
    }

    /// Whether a record exists for the container.
    #[must_use]
    pub fn exists(&self, container_id: &str) -> bool {
        self.paths.container_volumes(container_id).exists()
    }

    /// Delete a container's record.
    pub fn delete(&self, container_id: &str) -> CaskResult<()> {
        let path = self.paths.container_volumes(container_id);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }
}
