//! Driver and volume registries.
//!
//! [`DriverRegistry`] maps driver names to driver instances; registration is
//! one-shot at daemon startup. [`VolumeRegistry`] is the process-wide map
//! from `(driver, source)` to live volumes. Its mutex guards only the map;
//! drivers are never called while it is held, so a driver's own locking can
//! block without stalling unrelated lookups.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use cask_common::id::random_hex;
use cask_common::{CaskError, CaskResult};

use crate::binds::clean_path;
use crate::driver::{DriverKind, Volume, VolumeDriver, DEFAULT_DRIVER};
use crate::local::OPT_BIND;

/// Maps driver name to driver instance.
#[derive(Default)]
pub struct DriverRegistry {
    drivers: Mutex<HashMap<String, Arc<dyn VolumeDriver>>>,
}

impl DriverRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver. Each name may be registered exactly once.
    pub fn register(&self, driver: Arc<dyn VolumeDriver>) -> CaskResult<()> {
        let name = driver.name().to_string();
        let mut drivers = self.drivers.lock();
        if drivers.contains_key(&name) {
            return Err(CaskError::Internal {
                message: format!("Volume driver {} registered twice", name),
            });
        }
        drivers.insert(name, driver);
        Ok(())
    }

    /// Look up a driver by name.
    pub fn get(&self, name: &str) -> CaskResult<Arc<dyn VolumeDriver>> {
        self.drivers
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| CaskError::DriverNotFound {
                name: name.to_string(),
            })
    }

    /// Look up a driver, falling back to the default (`local`).
    pub fn get_or_default(&self, name: Option<&str>) -> CaskResult<Arc<dyn VolumeDriver>> {
        self.get(name.unwrap_or(DEFAULT_DRIVER))
    }
}

/// Process-wide volume registry.
pub struct VolumeRegistry {
    drivers: Arc<DriverRegistry>,
    volumes: Mutex<HashMap<(String, String), Arc<dyn Volume>>>,
}

impl VolumeRegistry {
    /// Create a registry over the given drivers.
    #[must_use]
    pub fn new(drivers: Arc<DriverRegistry>) -> Self {
        Self {
            drivers,
            volumes: Mutex::new(HashMap::new()),
        }
    }

    /// The driver registry this volume registry resolves against.
    #[must_use]
    pub fn drivers(&self) -> &DriverRegistry {
        &self.drivers
    }

    /// Resolve or create the volume for a mount source.
    ///
    /// An empty source always allocates a fresh anonymous local volume.
    /// The attach refcount is not touched; callers attach explicitly.
    pub fn find_or_create_volume(
        &self,
        source: &str,
        writable: bool,
        kind: DriverKind,
    ) -> CaskResult<Arc<dyn Volume>> {
        if source.is_empty() {
            let name = random_hex(32);
            let driver = self.drivers.get(DriverKind::Local.driver_name())?;
            let volume = driver.create(&name, &HashMap::new())?;
            self.volumes
                .lock()
                .insert((driver.name().to_string(), name), volume.clone());
            return Ok(volume);
        }

        let normalized = match kind {
            DriverKind::Bind => clean_path(source),
            _ => source.to_string(),
        };
        let key = (kind.driver_name().to_string(), normalized.clone());

        if let Some(volume) = self.volumes.lock().get(&key) {
            return Ok(volume.clone());
        }

        // Create outside the registry lock; the driver's create is
        // idempotent, so a concurrent caller at worst duplicates the work.
        let driver = self.drivers.get(kind.driver_name())?;
        let mut opts = HashMap::new();
        if kind == DriverKind::Bind {
            opts.insert(OPT_BIND.to_string(), "true".to_string());
        }
        if kind == DriverKind::Ceph && !writable {
            opts.insert(
                crate::ceph::OPT_WRITABLE.to_string(),
                "false".to_string(),
            );
        }
        let volume = driver.create(&normalized, &opts)?;

        let mut volumes = self.volumes.lock();
        let entry = volumes.entry(key).or_insert(volume);
        Ok(entry.clone())
    }

    /// Look up a registered volume by kind and source.
    #[must_use]
    pub fn get(&self, kind: DriverKind, source: &str) -> Option<Arc<dyn Volume>> {
        let normalized = match kind {
            DriverKind::Bind => clean_path(source),
            _ => source.to_string(),
        };
        self.volumes
            .lock()
            .get(&(kind.driver_name().to_string(), normalized))
            .cloned()
    }

    /// Look up a registered volume by the identity recorded in container
    /// state: its source key or its current data path.
    #[must_use]
    pub fn lookup_source(&self, source: &str) -> Option<Arc<dyn Volume>> {
        let volumes = self.volumes.lock();
        for ((_, key_source), volume) in volumes.iter() {
            if key_source == source || volume.source_id() == source {
                return Some(volume.clone());
            }
        }
        None
    }

    /// Drop one container's hold on a volume, removing the registration
    /// when nothing references it anymore.
    ///
    /// `always_remove` removes a zero-reference volume regardless of how it
    /// was created (used when a restart replaces a destination's source);
    /// otherwise only anonymous volumes are garbage-collected.
    pub fn release(&self, volume: &Arc<dyn Volume>, container_id: &str, always_remove: bool) {
        if let Err(err) = volume.unmount(container_id) {
            tracing::error!(
                volume = %volume.name(),
                container = container_id,
                error = %err,
                "Failed to detach volume during release"
            );
        }
        if volume.ref_count() > 0 {
            return;
        }

        let removable = {
            let mut volumes = self.volumes.lock();
            let key = volumes
                .iter()
                .find(|(_, registered)| Arc::ptr_eq(registered, volume))
                .map(|(key, _)| key.clone());
            match key {
                Some(key) if always_remove || volume.is_anonymous() => {
                    volumes.remove(&key);
                    true
                }
                _ => false,
            }
        };

        if removable {
            match self.drivers.get(volume.driver_name()) {
                Ok(driver) => {
                    if let Err(err) = driver.remove(volume.as_ref()) {
                        tracing::error!(
                            volume = %volume.name(),
                            error = %err,
                            "Failed to remove released volume"
                        );
                    }
                }
                Err(err) => {
                    tracing::error!(volume = %volume.name(), error = %err, "Driver vanished");
                }
            }
        }
    }

    /// Explicitly remove a volume. Fails while it has attachments.
    pub fn remove(&self, volume: &Arc<dyn Volume>) -> CaskResult<()> {
        let driver = self.drivers.get(volume.driver_name())?;
        driver.remove(volume.as_ref())?;
        let mut volumes = self.volumes.lock();
        volumes.retain(|_, registered| !Arc::ptr_eq(registered, volume));
        Ok(())
    }
}
