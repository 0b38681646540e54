//! Ceph/RBD block volumes.
//!
//! Attach runs a linear pipeline: create the image if absent, map it, open
//! LUKS when the device is encrypted, format when blank, then `fsck`. The
//! volume records how far the pipeline got so a detach after a failed attach
//! tears down exactly the side effects that happened. The underlying block
//! device cannot be shared, so only one container may hold an attachment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use cask_common::{CaskError, CaskResult, CommandRunner};

use crate::driver::{Scope, Volume, VolumeDriver};
use crate::events::{EventBus, VolumeEvent};
use crate::exec::{probe_filesystem, VolumeOp, CRYPTO_LUKS_FS_TYPE};

/// Default RBD image size passed to `rbd create`, in MB (1 TiB).
pub const CEPH_IMAGE_SIZE_MB: u64 = 1024 * 1024;

/// Directory device-mapper nodes appear under.
const LUKS_DEV_MAPPER_PATH: &str = "/dev/mapper";

/// Option key overriding the image size for `rbd create`.
pub const OPT_SIZE_MB: &str = "size_mb";

/// Option key marking the volume read-only (`rbd map --options ro`).
pub const OPT_WRITABLE: &str = "writable";

/// Derive the device-mapper node name for a volume.
///
/// `/` is not a valid device-mapper name character, so a pool-prefixed image
/// name has it replaced with `--`.
#[must_use]
pub fn luks_mapper_name(name: &str) -> String {
    name.replace('/', "--")
}

/// The image name without its pool prefix, as it appears in rbd's stderr.
fn image_basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

/// Supplies the LUKS passphrase for an encrypted volume.
///
/// The default derivation uses the volume name itself.
pub type LuksKeyFn = Box<dyn Fn(&str) -> String + Send + Sync>;

/// RBD-backed volume driver.
pub struct CephDriver {
    runner: Arc<dyn CommandRunner>,
    volumes: Mutex<HashMap<String, Arc<CephVolume>>>,
    luks_key: Arc<LuksKeyFn>,
    events: EventBus,
}

impl CephDriver {
    /// Create the driver with the default key derivation.
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            volumes: Mutex::new(HashMap::new()),
            luks_key: Arc::new(Box::new(|name: &str| name.to_string())),
            events: EventBus::new(),
        }
    }

    /// Replace the LUKS key derivation.
    #[must_use]
    pub fn with_luks_key(mut self, key: impl Fn(&str) -> String + Send + Sync + 'static) -> Self {
        self.luks_key = Arc::new(Box::new(key));
        self
    }

    /// Use an existing event bus instead of a private one.
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }
}

impl VolumeDriver for CephDriver {
    fn name(&self) -> &str {
        "ceph"
    }

    fn create(&self, name: &str, opts: &HashMap<String, String>) -> CaskResult<Arc<dyn Volume>> {
        if let Some(existing) = self.volumes.lock().get(name) {
            return Ok(existing.clone());
        }

        let size_mb = opts
            .get(OPT_SIZE_MB)
            .and_then(|s| s.parse().ok())
            .unwrap_or(CEPH_IMAGE_SIZE_MB);
        let writable = opts.get(OPT_WRITABLE).map(String::as_str) != Some("false");

        let volume = Arc::new(CephVolume {
            name: name.to_string(),
            runner: self.runner.clone(),
            luks_key: self.luks_key.clone(),
            size_mb,
            writable,
            state: Mutex::new(CephState::default()),
        });

        self.volumes.lock().insert(name.to_string(), volume.clone());
        self.events.publish(VolumeEvent::Created {
            volume: name.to_string(),
            driver: "ceph".to_string(),
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
        // The RBD image itself is left in the cluster.
        self.volumes.lock().remove(volume.name());
        Ok(())
    }

    fn scope(&self) -> Scope {
        Scope::Global
    }
}

/// Furthest checkpoint the attach pipeline has reached.
///
/// Detach rolls the volume back from whatever checkpoint is recorded, so a
/// failed attach leaves exactly the steps that happened to undo.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
enum AttachStep {
    /// No kernel state exists for this volume.
    #[default]
    Unmapped,
    /// `rbd map` succeeded.
    Mapped {
        /// Mapped device path (`/dev/rbdN`).
        device: String,
    },
    /// `cryptsetup luksOpen` succeeded on the mapped device.
    LuksOpened {
        /// Mapped device path (`/dev/rbdN`).
        device: String,
        /// Device-mapper node path the filesystem lives on.
        mapper_path: String,
    },
}

/// Driver-private volume state, mutated under the volume's own mutex.
#[derive(Debug, Default)]
struct CephState {
    /// Container currently holding the attachment.
    attached_to: Option<String>,
    /// How far the attach pipeline has progressed.
    step: AttachStep,
}

/// An RBD-backed volume.
pub struct CephVolume {
    name: String,
    runner: Arc<dyn CommandRunner>,
    luks_key: Arc<LuksKeyFn>,
    size_mb: u64,
    writable: bool,
    state: Mutex<CephState>,
}

impl CephVolume {
    /// Create the backing image, tolerating an image that already exists.
    fn create_image(&self) -> CaskResult<()> {
        let out = VolumeOp::RbdCreate {
            image: self.name.clone(),
            size_mb: self.size_mb,
        }
        .run(self.runner.as_ref(), None)?;

        if out.success() {
            tracing::info!(volume = %self.name, "Created RBD image");
            return Ok(());
        }

        let exists_msg = format!("rbd image {} already exists", image_basename(&self.name));
        if out.code == 17 || out.stderr.contains(&exists_msg) {
            tracing::info!(volume = %self.name, "Found existing RBD image");
            return Ok(());
        }

        Err(CaskError::CreateFailed {
            name: self.name.clone(),
            code: out.code,
            stderr: out.stderr_trimmed(),
        })
    }

    /// Map the image, returning the device path from rbd's stdout.
    fn map(&self) -> CaskResult<String> {
        let out = VolumeOp::RbdMap {
            image: self.name.clone(),
            writable: self.writable,
        }
        .run(self.runner.as_ref(), None)?;

        if !out.success() {
            return Err(CaskError::MapFailed {
                name: self.name.clone(),
                code: out.code,
                stderr: out.stderr_trimmed(),
            });
        }

        let device = out.stdout.trim_end_matches('\n').to_string();
        tracing::info!(volume = %self.name, device = %device, "Mapped RBD image");
        Ok(device)
    }

    /// Open the LUKS container on `device`, returning the mapper path.
    fn luks_open(&self, device: &str) -> CaskResult<String> {
        let mapper = luks_mapper_name(&self.name);
        let key = (self.luks_key.as_ref())(&self.name);
        let out = VolumeOp::LuksOpen {
            device: device.to_string(),
            mapper: mapper.clone(),
        }
        .run(self.runner.as_ref(), Some(key.as_bytes()))?;

        if !out.success() {
            return Err(CaskError::LuksFailed {
                device: device.to_string(),
                code: out.code,
                stderr: out.stderr_trimmed(),
            });
        }

        let mapper_path = format!("{}/{}", LUKS_DEV_MAPPER_PATH, mapper);
        tracing::info!(volume = %self.name, device = %mapper_path, "Opened LUKS container");
        Ok(mapper_path)
    }
}

impl Volume for CephVolume {
    fn name(&self) -> &str {
        &self.name
    }

    fn driver_name(&self) -> &str {
        "ceph"
    }

    fn path(&self) -> PathBuf {
        // Block volumes have no host directory.
        PathBuf::new()
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
                // Same container re-attaching; hand back the live device.
                let device = match &state.step {
                    AttachStep::Unmapped => String::new(),
                    AttachStep::Mapped { device } => device.clone(),
                    AttachStep::LuksOpened { mapper_path, .. } => mapper_path.clone(),
                };
                return Ok(device);
            }
            None => {}
        }

        self.create_image()?;
        let mapped = self.map()?;
        state.step = AttachStep::Mapped {
            device: mapped.clone(),
        };

        let mut device = mapped.clone();
        let mut fs_type = probe_filesystem(self.runner.as_ref(), &device)?;

        if fs_type == CRYPTO_LUKS_FS_TYPE {
            let mapper_path = self.luks_open(&device)?;
            state.step = AttachStep::LuksOpened {
                device: mapped,
                mapper_path: mapper_path.clone(),
            };
            device = mapper_path;
            fs_type = probe_filesystem(self.runner.as_ref(), &device)?;
        }

        if fs_type.is_empty() {
            tracing::info!(volume = %self.name, device = %device, "Creating ext4 filesystem");
            let out = VolumeOp::MkfsExt4 {
                device: device.clone(),
            }
            .run(self.runner.as_ref(), None)?;
            if !out.success() {
                return Err(CaskError::MkfsFailed {
                    device,
                    code: out.code,
                    stderr: out.stderr_trimmed(),
                });
            }
        }

        let out = VolumeOp::Fsck {
            device: device.clone(),
        }
        .run(self.runner.as_ref(), None)?;
        if !out.success() {
            return Err(CaskError::FsckFailed {
                device,
                code: out.code,
                stderr: out.stderr_trimmed(),
            });
        }
        tracing::info!(volume = %self.name, device = %device, output = %out.stdout.trim(), "Checked filesystem");

        state.attached_to = Some(container_id.to_string());
        Ok(device)
    }

    fn unmount(&self, _container_id: &str) -> CaskResult<()> {
        let mut state = self.state.lock();

        // Roll back from the recorded checkpoint.
        let (device, mapper_path) = match &state.step {
            AttachStep::Unmapped => {
                // Nothing was mapped; attach failed before the map step or
                // a previous detach already cleaned up.
                state.attached_to = None;
                return Ok(());
            }
            AttachStep::Mapped { device } => (device.clone(), None),
            AttachStep::LuksOpened {
                device,
                mapper_path,
            } => (device.clone(), Some(mapper_path.clone())),
        };

        // Re-probe the outer device; on probe failure fall back to the
        // recorded checkpoint so a vanished device cannot strand the mapper.
        let fs_type = probe_filesystem(self.runner.as_ref(), &device).unwrap_or_else(|err| {
            tracing::warn!(volume = %self.name, error = %err, "Filesystem re-probe failed on detach");
            if mapper_path.is_some() {
                CRYPTO_LUKS_FS_TYPE.to_string()
            } else {
                String::new()
            }
        });

        if let Some(mapper_path) = mapper_path {
            if fs_type == CRYPTO_LUKS_FS_TYPE {
                let mapper = luks_mapper_name(&self.name);
                let out = VolumeOp::LuksClose { mapper }.run(self.runner.as_ref(), None)?;
                if !out.success() {
                    let err = CaskError::LuksFailed {
                        device: mapper_path,
                        code: out.code,
                        stderr: out.stderr_trimmed(),
                    };
                    tracing::error!(volume = %self.name, error = %err, "Failed to close LUKS container");
                    return Err(err);
                }
            }
            state.step = AttachStep::Mapped {
                device: device.clone(),
            };
        }

        let out = VolumeOp::RbdUnmap {
            device: device.clone(),
        }
        .run(self.runner.as_ref(), None)?;
        if out.success() {
            tracing::info!(volume = %self.name, device = %device, "Unmapped RBD image");
        } else {
            // Not fatal: the daemon stays usable, the kernel keeps the map.
            let err = CaskError::UnmapFailed {
                device: device.clone(),
                code: out.code,
                stderr: out.stderr_trimmed(),
            };
            tracing::error!(volume = %self.name, error = %err, "Failed to unmap RBD image");
        }

        state.step = AttachStep::Unmapped;
        state.attached_to = None;
        Ok(())
    }

    fn status(&self) -> HashMap<String, String> {
        let state = self.state.lock();
        let (mapped_device, luks_device) = match &state.step {
            AttachStep::Unmapped => (String::new(), String::new()),
            AttachStep::Mapped { device } => (device.clone(), String::new()),
            AttachStep::LuksOpened {
                device,
                mapper_path,
            } => (device.clone(), mapper_path.clone()),
        };
        let mut status = HashMap::new();
        status.insert("mapped_device".to_string(), mapped_device);
        status.insert("luks_device".to_string(), luks_device);
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
