//! Standard filesystem paths for cask.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for cask data.
pub static CASK_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("CASK_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/cask"))
});

/// Mode for the NFS mounts directory.
pub const NFS_MOUNTS_MODE: u32 = 0o755;

/// Standard paths used by the volume subsystem.
#[derive(Debug, Clone)]
pub struct CaskPaths {
    /// Root data directory (default: /var/lib/cask).
    pub root: PathBuf,
}

impl CaskPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory for named volumes.
    #[must_use]
    pub fn volumes(&self) -> PathBuf {
        self.root.join("volumes")
    }

    /// Directory for a named volume.
    #[must_use]
    pub fn volume(&self, name: &str) -> PathBuf {
        self.volumes().join(name)
    }

    /// Data directory of a named volume (what containers actually mount).
    #[must_use]
    pub fn volume_data(&self, name: &str) -> PathBuf {
        self.volume(name).join("_data")
    }

    /// Directory holding the temporary NFS mountpoints.
    #[must_use]
    pub fn nfs_mounts(&self) -> PathBuf {
        self.root.join("nfs_mounts")
    }

    /// Directory for container records.
    #[must_use]
    pub fn containers(&self) -> PathBuf {
        self.root.join("containers")
    }

    /// Directory for a specific container.
    #[must_use]
    pub fn container(&self, id: &str) -> PathBuf {
        self.containers().join(id)
    }

    /// A container's persisted volume record.
    #[must_use]
    pub fn container_volumes(&self, id: &str) -> PathBuf {
        self.container(id).join("volumes.json")
    }

    /// Create the directories the subsystem expects to exist.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(self.volumes())?;
        std::fs::create_dir_all(self.containers())?;
        Ok(())
    }
}

impl Default for CaskPaths {
    fn default() -> Self {
        Self {
            root: CASK_ROOT.clone(),
        }
    }
}
