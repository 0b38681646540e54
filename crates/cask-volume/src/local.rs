//! Anonymous, named and bind volumes on the host filesystem.
//!
//! Named volumes live under `<root>/volumes/<name>/_data`. Bind volumes are
//! represented by the same driver with the user-supplied host path as their
//! source; for those no directory is created (the path must already exist or
//! the kernel mount will fail) and removal never touches the filesystem.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use cask_common::{CaskError, CaskPaths, CaskResult};

use crate::driver::{Scope, Volume, VolumeDriver};
use crate::events::{EventBus, VolumeEvent};

/// Option key marking a created volume as a bind mount.
pub const OPT_BIND: &str = "bind";

/// Host-filesystem volume driver.
pub struct LocalDriver {
    paths: CaskPaths,
    volumes: Mutex<HashMap<String, Arc<LocalVolume>>>,
    events: EventBus,
}

impl LocalDriver {
    /// Create the driver, ensuring the volume root exists.
    pub fn new(paths: CaskPaths) -> CaskResult<Self> {
        std::fs::create_dir_all(paths.volumes())?;
        Ok(Self {
            paths,
            volumes: Mutex::new(HashMap::new()),
            events: EventBus::new(),
        })
    }

    /// Use an existing event bus instead of a private one.
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }
}

impl VolumeDriver for LocalDriver {
    fn name(&self) -> &str {
        "local"
    }

    fn create(&self, name: &str, opts: &HashMap<String, String>) -> CaskResult<Arc<dyn Volume>> {
        if let Some(existing) = self.volumes.lock().get(name) {
            return Ok(existing.clone());
        }

        let is_bind = opts.get(OPT_BIND).map(String::as_str) == Some("true")
            // Re-registered data dirs from an older daemon's record come in
            // by path; recognize our own volume root so removal still cleans
            // them up.
            && !name.starts_with(&*self.paths.volumes().to_string_lossy());

        let data_path = if is_bind || name.starts_with('/') {
            PathBuf::from(name)
        } else {
            let data = self.paths.volume_data(name);
            std::fs::create_dir_all(&data)?;
            data
        };

        let volume = Arc::new(LocalVolume {
            name: name.to_string(),
            data_path,
            is_bind,
            attachments: Mutex::new(HashSet::new()),
        });

        tracing::info!(volume = %name, bind = is_bind, "Volume created");
        self.volumes.lock().insert(name.to_string(), volume.clone());
        self.events.publish(VolumeEvent::Created {
            volume: name.to_string(),
            driver: "local".to_string(),
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

        let removed = self.volumes.lock().remove(volume.name());
        if let Some(v) = removed {
            if !v.is_bind {
                // Remove the <root>/volumes/<name> directory, not just _data.
                let dir = v
                    .data_path
                    .parent()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| v.data_path.clone());
                if dir.exists() {
                    std::fs::remove_dir_all(&dir)?;
                }
            }
            tracing::info!(volume = %v.name, "Volume removed");
        }
        Ok(())
    }

    fn scope(&self) -> Scope {
        Scope::Local
    }
}

/// A host-filesystem volume.
pub struct LocalVolume {
    name: String,
    data_path: PathBuf,
    is_bind: bool,
    /// IDs of containers currently attached.
    attachments: Mutex<HashSet<String>>,
}

impl Volume for LocalVolume {
    fn name(&self) -> &str {
        &self.name
    }

    fn driver_name(&self) -> &str {
        "local"
    }

    fn path(&self) -> PathBuf {
        self.data_path.clone()
    }

    fn mount(&self, container_id: &str) -> CaskResult<String> {
        self.attachments.lock().insert(container_id.to_string());
        Ok(self.data_path.to_string_lossy().into_owned())
    }

    fn unmount(&self, container_id: &str) -> CaskResult<()> {
        if !self.attachments.lock().remove(container_id) {
            tracing::debug!(
                volume = %self.name,
                container = container_id,
                "Detach for a container that was not attached"
            );
        }
        Ok(())
    }

    fn status(&self) -> HashMap<String, String> {
        let mut status = HashMap::new();
        status.insert("ref_count".to_string(), self.ref_count().to_string());
        status.insert("bind".to_string(), self.is_bind.to_string());
        status
    }

    fn ref_count(&self) -> usize {
        self.attachments.lock().len()
    }

    fn is_anonymous(&self) -> bool {
        !self.is_bind
    }
}

impl LocalVolume {
    /// Whether this volume is a bind mount of a user-supplied host path.
    #[must_use]
    pub fn is_bind(&self) -> bool {
        self.is_bind
    }
}
