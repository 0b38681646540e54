//! NFS volumes.
//!
//! Each attach mounts the export onto a fresh temporary directory under the
//! daemon's `nfs_mounts` directory. Detach unmounts lazily and removes the
//! directory. Like ceph, a volume serves one container at a time.

use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use cask_common::paths::NFS_MOUNTS_MODE;
use cask_common::{CaskError, CaskPaths, CaskResult, CommandRunner};

use crate::driver::{Scope, Volume, VolumeDriver};
use crate::events::{EventBus, VolumeEvent};
use crate::exec::VolumeOp;

/// Rewrite an export spec from the bind-mount grammar to a mount source.
///
/// The bind grammar cannot carry `:` inside a field, so exports are written
/// `host//export`; the mount command wants `host://export`.
#[must_use]
pub fn rewrite_nfs_source(source: &str) -> String {
    source.replacen("//", "://", 1)
}

/// NFS volume driver.
pub struct NfsDriver {
    runner: Arc<dyn CommandRunner>,
    mounts_dir: PathBuf,
    volumes: Mutex<HashMap<String, Arc<NfsVolume>>>,
    events: EventBus,
}

impl NfsDriver {
    /// Create the driver.
    pub fn new(runner: Arc<dyn CommandRunner>, paths: &CaskPaths) -> Self {
        Self {
            runner,
            mounts_dir: paths.nfs_mounts(),
            volumes: Mutex::new(HashMap::new()),
            events: EventBus::new(),
        }
    }

    /// Use an existing event bus instead of a private one.
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }
}

impl VolumeDriver for NfsDriver {
    fn name(&self) -> &str {
        "nfs"
    }

    fn create(&self, name: &str, _opts: &HashMap<String, String>) -> CaskResult<Arc<dyn Volume>> {
        if let Some(existing) = self.volumes.lock().get(name) {
            return Ok(existing.clone());
        }

        let volume = Arc::new(NfsVolume {
            name: name.to_string(),
            runner: self.runner.clone(),
            mounts_dir: self.mounts_dir.clone(),
            state: Mutex::new(NfsState::default()),
        });
        self.volumes.lock().insert(name.to_string(), volume.clone());
        self.events.publish(VolumeEvent::Created {
            volume: name.to_string(),
            driver: "nfs".to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        });
        Ok(volume)
    }

    fn get(&self, name: &str) -> CaskResult<Arc<dyn Volume>> {
        self.volumes
            .lock()
            .get(name)
            .cloned()
            .map(|v| v as Arc<dyn Volume>)
            .ok_or_else(|| CaskError::VolumeNotFound {
                name: name.to_string(),
            })
    }

    fn list(&self) -> Vec<Arc<dyn Volume>> {
        self.volumes
            .lock()
            .values()
            .cloned()
            .map(|v| v as Arc<dyn Volume>)
            .collect()
    }

    fn remove(&self, volume: &dyn Volume) -> CaskResult<()> {
        let refs = volume.ref_count();
        if refs > 0 {
            return Err(CaskError::VolumeInUse {
                name: volume.name().to_string(),
                ref_count: refs,
            });
        }
        // Nothing on disk to clean up; the export belongs to the server.
        self.volumes.lock().remove(volume.name());
        Ok(())
    }

    fn scope(&self) -> Scope {
        Scope::Global
    }
}

#[derive(Debug, Default)]
struct NfsState {
    attached_to: Option<String>,
    /// Temporary host directory the export is mounted on.
    host_dir: Option<PathBuf>,
}

/// An NFS-backed volume.
pub struct NfsVolume {
    name: String,
    runner: Arc<dyn CommandRunner>,
    mounts_dir: PathBuf,
    state: Mutex<NfsState>,
}

impl Volume for NfsVolume {
    fn name(&self) -> &str {
        &self.name
    }

    fn driver_name(&self) -> &str {
        "nfs"
    }

    fn path(&self) -> PathBuf {
        self.state.lock().host_dir.clone().unwrap_or_default()
    }

    fn mount(&self, container_id: &str) -> CaskResult<String> {
        let mut state = self.state.lock();

        match state.attached_to.as_deref() {
            Some(existing) if existing != container_id => {
                return Err(CaskError::VolumeBusy {
                    name: self.name.clone(),
                    attached_to: existing.to_string(),
                });
            }
            Some(_) => {
                if let Some(dir) = &state.host_dir {
                    return Ok(dir.to_string_lossy().into_owned());
                }
            }
            None => {}
        }

        fs::create_dir_all(&self.mounts_dir)?;
        fs::set_permissions(&self.mounts_dir, fs::Permissions::from_mode(NFS_MOUNTS_MODE))?;

        let host_dir = tempfile::Builder::new()
            .tempdir_in(&self.mounts_dir)?
            .into_path();
        let target = host_dir.to_string_lossy().into_owned();
        let source = rewrite_nfs_source(&self.name);

        let out = VolumeOp::MountNfs {
            source: source.clone(),
            target: target.clone(),
        }
        .run(self.runner.as_ref(), None)?;

        if !out.success() {
            let _ = fs::remove_dir(&host_dir);
            return Err(CaskError::MountFailed {
                mount_source: source,
                target,
                code: out.code,
                stderr: out.stderr_trimmed(),
            });
        }

        tracing::info!(volume = %self.name, target = %target, "Mounted NFS export");
        state.attached_to = Some(container_id.to_string());
        state.host_dir = Some(host_dir);
        Ok(target)
    }

    fn unmount(&self, _container_id: &str) -> CaskResult<()> {
        let mut state = self.state.lock();
        state.attached_to = None;

        let Some(host_dir) = state.host_dir.take() else {
            return Ok(());
        };
        let target = host_dir.to_string_lossy().into_owned();

        let out = VolumeOp::UmountLazy {
            target: target.clone(),
        }
        .run(self.runner.as_ref(), None)?;

        if !out.success() {
            // Not fatal: the daemon stays usable, the lazy unmount detaches
            // the export once the kernel lets go of it.
            let err = CaskError::UnmountFailed {
                target: target.clone(),
                code: out.code,
                stderr: out.stderr_trimmed(),
            };
            tracing::error!(volume = %self.name, error = %err, "Failed to unmount NFS export");
        }

        if let Err(err) = fs::remove_dir(&host_dir) {
            tracing::error!(
                volume = %self.name,
                target = %target,
                error = %err,
                "Failed to remove NFS mountpoint"
            );
        }

        Ok(())
    }

    fn status(&self) -> HashMap<String, String> {
        let state = self.state.lock();
        let mut status = HashMap::new();
        status.insert(
            "host_dir".to_string(),
            state
                .host_dir
                .as_ref()
                .map(|d| d.to_string_lossy().into_owned())
                .unwrap_or_default(),
        );
        status.insert(
            "attached_to".to_string(),
            state.attached_to.clone().unwrap_or_default(),
        );
        status
    }

    fn ref_count(&self) -> usize {
        usize::from(self.state.lock().attached_to.is_some())
    }
}
