//! Volume driver contracts.
//!
//! Every storage backend implements [`VolumeDriver`] (registry operations)
//! and hands out [`Volume`] objects (per-volume attach/detach). Drivers own
//! their volumes' private state; the rest of the daemon only sees these two
//! traits.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use cask_common::CaskResult;

/// Name of the default driver used when a caller supplies none.
pub const DEFAULT_DRIVER: &str = "local";

/// Whether a driver's volumes are visible beyond this daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    /// Volumes exist only on this host.
    Local,
    /// Volumes are addressable from any daemon (network-backed).
    Global,
}

impl Scope {
    /// Stable string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Global => "global",
        }
    }
}

/// Driver selection recorded on a mount point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    /// Anonymous or named volume under the daemon's volume root.
    #[default]
    Local,
    /// User-supplied host path exposed as-is.
    Bind,
    /// RBD image mapped as a block device.
    Ceph,
    /// NFS export mounted under a temp directory.
    Nfs,
}

impl DriverKind {
    /// Stable string form, used for the exec-driver hand-off hint.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Bind => "bind",
            Self::Ceph => "ceph",
            Self::Nfs => "nfs",
        }
    }

    /// Name of the registered driver that owns volumes of this kind.
    ///
    /// Bind mounts are represented by the local driver.
    #[must_use]
    pub fn driver_name(&self) -> &'static str {
        match self {
            Self::Local | Self::Bind => "local",
            Self::Ceph => "ceph",
            Self::Nfs => "nfs",
        }
    }
}

/// A storage backend.
pub trait VolumeDriver: Send + Sync {
    /// Driver name as used in the driver registry.
    fn name(&self) -> &str;

    /// Create (or return the existing) volume with the given name.
    fn create(&self, name: &str, opts: &HashMap<String, String>) -> CaskResult<Arc<dyn Volume>>;

    /// Look up a volume by name.
    fn get(&self, name: &str) -> CaskResult<Arc<dyn Volume>>;

    /// All volumes this driver currently knows.
    fn list(&self) -> Vec<Arc<dyn Volume>>;

    /// Remove a volume. Fails with `VolumeInUse` while it has attachments.
    fn remove(&self, volume: &dyn Volume) -> CaskResult<()>;

    /// Visibility of this driver's volumes.
    fn scope(&self) -> Scope {
        Scope::Local
    }
}

impl std::fmt::Debug for dyn VolumeDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeDriver").field("name", &self.name()).finish()
    }
}

/// A single volume.
pub trait Volume: Send + Sync {
    /// Unique name within the driver's namespace.
    fn name(&self) -> &str;

    /// Name of the driver that owns this volume.
    fn driver_name(&self) -> &str;

    /// Current host path of the volume's data; empty for block volumes.
    fn path(&self) -> PathBuf;

    /// Attach the volume for a container, returning the host source to mount.
    fn mount(&self, container_id: &str) -> CaskResult<String>;

    /// Detach the volume for a container.
    ///
    /// Must be idempotent over partial state: the runtime calls it for every
    /// destination `mount` was attempted on, successful or not.
    fn unmount(&self, container_id: &str) -> CaskResult<()>;

    /// Driver-specific status for introspection.
    fn status(&self) -> HashMap<String, String> {
        HashMap::new()
    }

    /// Number of live attachments.
    fn ref_count(&self) -> usize;

    /// Whether the volume's backing data belongs to the daemon and goes
    /// away with its last reference.
    ///
    /// True for local volumes under the daemon's volume root; false for
    /// bind mounts and remote-backed volumes.
    fn is_anonymous(&self) -> bool {
        false
    }

    /// The identity recorded in container state for this volume.
    ///
    /// Host-path-backed volumes are identified by their data path; remote
    /// volumes (RBD images, NFS exports) by their source name, which is
    /// stable across restarts while device paths and temp dirs are not.
    fn source_id(&self) -> String {
        let path = self.path();
        if path.as_os_str().is_empty() {
            self.name().to_string()
        } else {
            path.to_string_lossy().into_owned()
        }
    }
}
