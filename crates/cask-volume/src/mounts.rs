//! Per-container mount resolution.
//!
//! Reconciles three volume sources — user bind specs, image-declared
//! volumes, and volumes-from inheritance — into one ordered mount list,
//! attaches every resolved volume, and hands the list to the execution
//! driver. A failed attach triggers a detach pass over every destination
//! already attempted.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use cask_common::{CaskError, CaskResult};

use crate::binds::{self, clean_path};
use crate::driver::{DriverKind, Volume};
use crate::events::{EventBus, VolumeEvent};
use crate::nfs::rewrite_nfs_source;
use crate::registry::VolumeRegistry;
use crate::state::{ContainerStore, ContainerVolumes};

/// Mount propagation flag handed to the execution driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Propagation {
    /// No propagation in either direction.
    #[default]
    Private,
    /// Recursively private.
    RPrivate,
    /// Propagate in both directions.
    Shared,
    /// Recursively shared.
    RShared,
    /// Receive events from the host only.
    Slave,
    /// Recursively slave.
    RSlave,
}

impl Propagation {
    /// Stable string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::RPrivate => "rprivate",
            Self::Shared => "shared",
            Self::RShared => "rshared",
            Self::Slave => "slave",
            Self::RSlave => "rslave",
        }
    }
}

/// Per-container input to mount resolution.
#[derive(Debug, Clone, Default)]
pub struct MountConfig {
    /// The container being started.
    pub container_id: String,
    /// Root of the container's filesystem, for image-volume checks and
    /// first-attach data seeding.
    pub rootfs: PathBuf,
    /// `host:container[:options]` bind specifications.
    pub binds: Vec<String>,
    /// `container_id[:mode]` volumes-from specifications.
    pub volumes_from: Vec<String>,
    /// Volume destinations declared by the image.
    pub image_volumes: BTreeSet<String>,
}

/// A per-container binding of a destination path to a volume.
pub struct MountPoint {
    /// Cleaned absolute destination inside the container.
    pub destination: String,
    /// Whether the mount is writable.
    pub writable: bool,
    /// Which driver serves the mount.
    pub driver: DriverKind,
    /// Mount propagation flag.
    pub propagation: Propagation,
    /// Seed the volume with the image's contents on first attach.
    pub copy_data: bool,
    /// Source container when inherited via volumes-from.
    pub from_container: Option<String>,
    volume: Arc<dyn Volume>,
    attached_source: Option<String>,
}

impl MountPoint {
    /// The volume backing this mount point.
    #[must_use]
    pub fn volume(&self) -> &Arc<dyn Volume> {
        &self.volume
    }

    /// The host source returned by attach, if attach has run.
    #[must_use]
    pub fn attached_source(&self) -> Option<&str> {
        self.attached_source.as_deref()
    }
}

/// Hand-off entry consumed by the execution driver.
///
/// `data` carries the driver hint: NFS sources contain `://` and are treated
/// as NFS mount specs, ceph sources are block devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecMount {
    /// Host-side source: directory, block device or NFS spec.
    pub source: String,
    /// Destination inside the container.
    pub destination: String,
    /// Whether the mount is writable.
    pub writable: bool,
    /// Mount propagation flag.
    pub propagation: Propagation,
    /// Driver hint: `"nfs"`, `"ceph"` or empty.
    pub data: String,
}

/// Resolves and orchestrates a container's mounts.
pub struct MountResolver {
    registry: Arc<VolumeRegistry>,
    store: ContainerStore,
    events: EventBus,
}

impl MountResolver {
    /// Create a resolver over the given registry and record store.
    #[must_use]
    pub fn new(registry: Arc<VolumeRegistry>, store: ContainerStore) -> Self {
        Self {
            registry,
            store,
            events: EventBus::new(),
        }
    }

    /// Use an existing event bus instead of a private one.
    #[must_use]
    pub fn with_events(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    /// The event bus mount/unmount events are published on.
    #[must_use]
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The container record store.
    #[must_use]
    pub fn store(&self) -> &ContainerStore {
        &self.store
    }

    /// Resolve and attach all of a container's mounts for a start.
    ///
    /// Returns the ordered mount list for the execution driver. On failure
    /// every mount that attach was attempted on has been detached again and
    /// the persisted record is untouched.
    pub fn setup_container(&self, config: &MountConfig) -> CaskResult<Vec<ExecMount>> {
        let mut record = self.store.load_or_default(&config.container_id)?;
        let mut mounts = self.resolve(config, &record)?;

        let mut attempted = 0;
        let result: CaskResult<()> = (|| {
            for mount in mounts.iter_mut() {
                attempted += 1;
                self.initialize(config, &mut record, mount)?;
            }
            Ok(())
        })();

        if let Err(err) = result {
            // The runtime contract: detach everything attach was attempted
            // on, whether or not it succeeded, in reverse order.
            for mount in mounts[..attempted].iter().rev() {
                self.registry
                    .release(&mount.volume, &config.container_id, false);
            }
            return Err(err);
        }

        // Every referenced source container counts as applied, including
        // those whose destinations were all shadowed locally.
        for spec in &config.volumes_from {
            let from = binds::parse_volumes_from_spec(spec)?;
            record.applied_volumes_from.insert(from.container_id);
        }
        self.store.save(&config.container_id, &record)?;

        Ok(build_exec_mounts(&mounts))
    }

    /// Detach all of a container's recorded mounts, in reverse order.
    ///
    /// Detach errors are logged; iteration continues so one stuck volume
    /// cannot block container cleanup.
    pub fn teardown_container(&self, container_id: &str) -> CaskResult<()> {
        let record = self.store.load_or_default(container_id)?;

        for destination in record.sorted_destinations().iter().rev() {
            let source = &record.volumes[*destination];
            let Some(volume) = self.registry.lookup_source(source) else {
                tracing::debug!(
                    source = %source,
                    "Volume was not found and could not be detached"
                );
                continue;
            };
            match volume.unmount(container_id) {
                Ok(()) => self.events.publish(VolumeEvent::Unmounted {
                    volume: volume.name().to_string(),
                    driver: volume.driver_name().to_string(),
                    container: container_id.to_string(),
                    timestamp: chrono::Utc::now().timestamp(),
                }),
                Err(err) => {
                    tracing::error!(
                        volume = %volume.name(),
                        container = container_id,
                        error = %err,
                        "Failed to detach volume"
                    );
                }
            }
        }
        Ok(())
    }

    /// Drop a deleted container's volume references and its record.
    ///
    /// Anonymous volumes whose last reference goes away are removed.
    pub fn remove_container(&self, container_id: &str) -> CaskResult<()> {
        let record = self.store.load_or_default(container_id)?;

        for source in record.volumes.values() {
            let Some(volume) = self.registry.lookup_source(source) else {
                tracing::debug!(
                    source = %source,
                    "Volume was not found and could not be dereferenced"
                );
                continue;
            };
            let (name, driver) = (
                volume.name().to_string(),
                volume.driver_name().to_string(),
            );
            self.registry.release(&volume, container_id, false);
            if self.registry.lookup_source(source).is_none() {
                self.events.publish(VolumeEvent::Removed {
                    volume: name,
                    driver,
                    timestamp: chrono::Utc::now().timestamp(),
                });
            }
        }

        self.store.delete(container_id)
    }

    /// Re-register a container's persisted volumes after a daemon restart.
    ///
    /// Records written by an older daemon may reference volumes the registry
    /// has never seen; writability and the driver are inferred from the
    /// persisted maps. Registration failures are logged, not fatal.
    pub fn register_container(&self, container_id: &str) -> CaskResult<()> {
        let record = self.store.load_or_default(container_id)?;

        for (destination, source) in &record.volumes {
            if self.registry.lookup_source(source).is_some() {
                continue;
            }
            let writable = *record.volumes_rw.get(destination).unwrap_or(&true);
            let kind = infer_kind(&record, destination, source);
            if let Err(err) = self.registry.find_or_create_volume(source, writable, kind) {
                tracing::debug!(source = %source, error = %err, "Error registering volume");
            }
        }
        Ok(())
    }

    /// Reconcile binds, image volumes and volumes-from into an ordered,
    /// destination-unique mount list. Pure resolution: nothing is attached.
    fn resolve(
        &self,
        config: &MountConfig,
        record: &ContainerVolumes,
    ) -> CaskResult<Vec<MountPoint>> {
        let mut mounts: BTreeMap<String, MountPoint> = BTreeMap::new();

        // Bind specs come first; duplicates among them fail the start.
        for spec in &config.binds {
            let bind = binds::parse_bind_spec(spec)?;
            if let Some(existing) = mounts.get(&bind.destination) {
                return Err(CaskError::DuplicateMount {
                    destination: bind.destination.clone(),
                    existing: existing.volume.source_id(),
                });
            }
            let volume =
                self.registry
                    .find_or_create_volume(&bind.source, bind.writable, bind.driver)?;
            mounts.insert(
                bind.destination.clone(),
                MountPoint {
                    destination: bind.destination,
                    writable: bind.writable,
                    driver: bind.driver,
                    propagation: Propagation::default(),
                    copy_data: false,
                    from_container: None,
                    volume,
                    attached_source: None,
                },
            );
        }

        // Image-declared volumes: anonymous, writable, seeded on first
        // attach. Destinations claimed by binds or recorded from a previous
        // start are skipped.
        for declared in &config.image_volumes {
            let destination = clean_path(declared);
            if mounts.contains_key(&destination) || record.volumes.contains_key(&destination) {
                continue;
            }

            let in_image = join_rootfs(&config.rootfs, &destination);
            if in_image.exists() && !in_image.is_dir() {
                return Err(CaskError::NotADirectory { path: destination });
            }

            let volume = self
                .registry
                .find_or_create_volume("", true, DriverKind::Local)?;
            mounts.insert(
                destination.clone(),
                MountPoint {
                    destination,
                    writable: true,
                    driver: DriverKind::Local,
                    propagation: Propagation::default(),
                    copy_data: true,
                    from_container: None,
                    volume,
                    attached_source: None,
                },
            );
        }

        // Volumes-from is applied last and never takes a destination that
        // is already present locally.
        for spec in &config.volumes_from {
            let from = binds::parse_volumes_from_spec(spec)?;
            if record.applied_volumes_from.contains(&from.container_id) {
                continue;
            }
            let source_record = self.store.load(&from.container_id)?;

            for (destination, source) in &source_record.volumes {
                if mounts.contains_key(destination) {
                    continue;
                }
                let source_writable =
                    *source_record.volumes_rw.get(destination).unwrap_or(&true);
                let writable =
                    source_writable && from.mode == binds::VolumesFromMode::ReadWrite;
                let kind = infer_kind(&source_record, destination, source);
                let volume = match self.registry.lookup_source(source) {
                    Some(volume) => volume,
                    None => self.registry.find_or_create_volume(source, writable, kind)?,
                };
                mounts.insert(
                    destination.clone(),
                    MountPoint {
                        destination: destination.clone(),
                        writable,
                        driver: kind,
                        propagation: Propagation::default(),
                        copy_data: false,
                        from_container: Some(from.container_id.clone()),
                        volume,
                        attached_source: None,
                    },
                );
            }
        }

        // Destinations recorded from previous runs that this start did not
        // re-specify are carried forward, so a restart keeps its volumes.
        for (destination, source) in &record.volumes {
            if mounts.contains_key(destination) {
                continue;
            }
            let writable = *record.volumes_rw.get(destination).unwrap_or(&true);
            let kind = infer_kind(record, destination, source);
            let volume = match self.registry.lookup_source(source) {
                Some(volume) => volume,
                None => self.registry.find_or_create_volume(source, writable, kind)?,
            };
            mounts.insert(
                destination.clone(),
                MountPoint {
                    destination: destination.clone(),
                    writable,
                    driver: kind,
                    propagation: Propagation::default(),
                    copy_data: false,
                    from_container: None,
                    volume,
                    attached_source: None,
                },
            );
        }

        Ok(mounts.into_values().collect())
    }

    /// Attach one resolved mount and record it in the container state.
    fn initialize(
        &self,
        config: &MountConfig,
        record: &mut ContainerVolumes,
        mount: &mut MountPoint,
    ) -> CaskResult<()> {
        let source_id = mount.volume.source_id();

        // Restart shadowing: a bind or inherited mount targeting a recorded
        // destination with a different source dereferences the old volume
        // before the new mapping is recorded.
        if let Some(existing) = record.volumes.get(&mount.destination).cloned() {
            let replaces = mount.driver != DriverKind::Local || mount.from_container.is_some();
            if replaces && existing != source_id {
                match self.registry.lookup_source(&existing) {
                    Some(old) => self.registry.release(&old, &config.container_id, true),
                    None => tracing::debug!(
                        source = %existing,
                        "Replaced volume was not registered"
                    ),
                }
                record.remove(&mount.destination);
            }
        }

        let host_source = mount.volume.mount(&config.container_id)?;
        mount.attached_source = Some(host_source.clone());

        let ceph_device = if mount.driver == DriverKind::Ceph {
            host_source.as_str()
        } else {
            ""
        };
        record.record(&mount.destination, &source_id, mount.writable, ceph_device);

        self.events.publish(VolumeEvent::Mounted {
            volume: mount.volume.name().to_string(),
            driver: mount.volume.driver_name().to_string(),
            container: config.container_id.clone(),
            destination: mount.destination.clone(),
            writable: mount.writable,
            timestamp: chrono::Utc::now().timestamp(),
        });

        if mount.writable && mount.copy_data {
            let in_image = join_rootfs(&config.rootfs, &mount.destination);
            let volume_path = mount.volume.path();
            if in_image.is_dir() && volume_path.is_dir() {
                copy_existing_contents(&in_image, &volume_path)?;
            }
        }

        Ok(())
    }
}

/// Build the ordered exec-driver hand-off list from attached mounts.
fn build_exec_mounts(mounts: &[MountPoint]) -> Vec<ExecMount> {
    let mut list: Vec<ExecMount> = mounts
        .iter()
        .map(|mount| {
            let data = match mount.driver {
                DriverKind::Ceph => "ceph",
                DriverKind::Nfs => "nfs",
                _ => "",
            }
            .to_string();
            // NFS entries carry the share URI; everything else the host
            // source attach returned (a directory or a block device).
            let source = if mount.driver == DriverKind::Nfs {
                rewrite_nfs_source(mount.volume.name())
            } else {
                mount
                    .attached_source
                    .clone()
                    .unwrap_or_else(|| mount.volume.source_id())
            };
            ExecMount {
                source,
                destination: mount.destination.clone(),
                writable: mount.writable,
                propagation: mount.propagation,
                data,
            }
        })
        .collect();

    // Parent mounts must install before children (/etc before
    // /etc/resolv.conf).
    list.sort_by(|a, b| a.destination.cmp(&b.destination));
    list
}

/// Infer the driver kind of a recorded source.
fn infer_kind(record: &ContainerVolumes, destination: &str, source: &str) -> DriverKind {
    if record
        .volumes_ceph_device
        .get(destination)
        .is_some_and(|device| !device.is_empty())
    {
        DriverKind::Ceph
    } else if source.contains("//") {
        DriverKind::Nfs
    } else {
        DriverKind::Bind
    }
}

/// Join a container-absolute destination onto the rootfs path.
fn join_rootfs(rootfs: &Path, destination: &str) -> PathBuf {
    rootfs.join(destination.trim_start_matches('/'))
}

/// Seed a volume with the image's contents at its destination.
///
/// Copies only when the image path has entries and the volume is still
/// empty, then replicates the source's owner and mode onto the volume root.
fn copy_existing_contents(source: &Path, destination: &Path) -> CaskResult<()> {
    let has_content = source.read_dir()?.next().is_some();
    let volume_empty = destination.read_dir()?.next().is_none();
    if has_content && volume_empty {
        copy_recursive(source, destination)?;
    }
    copy_ownership(source, destination)
}

fn copy_recursive(source: &Path, destination: &Path) -> CaskResult<()> {
    for entry in source.read_dir()? {
        let entry = entry?;
        let target = destination.join(entry.file_name());
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            std::fs::create_dir(&target)?;
            copy_recursive(&entry.path(), &target)?;
            copy_ownership(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = std::fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
            copy_ownership(&entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Replicate `source`'s uid:gid and permissions onto `destination`.
fn copy_ownership(source: &Path, destination: &Path) -> CaskResult<()> {
    use std::os::unix::fs::MetadataExt;
    use std::os::unix::fs::PermissionsExt;

    let meta = std::fs::metadata(source)?;
    std::os::unix::fs::chown(destination, Some(meta.uid()), Some(meta.gid()))?;
    std::fs::set_permissions(destination, std::fs::Permissions::from_mode(meta.mode()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ceph::CephDriver;
    use crate::local::LocalDriver;
    use crate::nfs::NfsDriver;
    use crate::registry::DriverRegistry;
    use cask_common::{CaskPaths, ScriptedRunner, ToolOutput};

    struct Env {
        _temp: tempfile::TempDir,
        rootfs: PathBuf,
        runner: Arc<ScriptedRunner>,
        resolver: MountResolver,
    }

    fn env() -> Env {
        let temp = tempfile::tempdir().unwrap();
        let paths = CaskPaths::with_root(temp.path().join("root"));
        paths.create_dirs().unwrap();
        let rootfs = temp.path().join("rootfs");
        std::fs::create_dir_all(&rootfs).unwrap();

        let runner = Arc::new(ScriptedRunner::new());
        let drivers = Arc::new(DriverRegistry::new());
        drivers
            .register(Arc::new(LocalDriver::new(paths.clone()).unwrap()))
            .unwrap();
        drivers
            .register(Arc::new(CephDriver::new(runner.clone())))
            .unwrap();
        drivers
            .register(Arc::new(NfsDriver::new(runner.clone(), &paths)))
            .unwrap();

        let registry = Arc::new(VolumeRegistry::new(drivers));
        let resolver = MountResolver::new(registry, ContainerStore::new(paths));
        Env {
            _temp: temp,
            rootfs,
            runner,
            resolver,
        }
    }

    fn config(env: &Env, id: &str) -> MountConfig {
        MountConfig {
            container_id: id.to_string(),
            rootfs: env.rootfs.clone(),
            ..MountConfig::default()
        }
    }

    #[test]
    fn binds_and_image_volumes_resolve_sorted() {
        let env = env();
        let mut config = config(&env, "ctr-1");
        config.binds = vec![
            "/host/data:/data:ro".to_string(),
            "/host/log:/var/log".to_string(),
        ];
        config.image_volumes =
            BTreeSet::from(["/data".to_string(), "/tmp".to_string()]);

        let mounts = env.resolver.setup_container(&config).unwrap();
        assert_eq!(mounts.len(), 3);

        // Sorted by destination.
        assert_eq!(mounts[0].destination, "/data");
        assert_eq!(mounts[1].destination, "/tmp");
        assert_eq!(mounts[2].destination, "/var/log");

        // The bind shadows the image-declared volume at /data.
        assert_eq!(mounts[0].source, "/host/data");
        assert!(!mounts[0].writable);

        // /tmp became a fresh writable anonymous volume.
        assert!(mounts[1].writable);
        assert!(mounts[1].source.ends_with("/_data"));
        assert!(PathBuf::from(&mounts[1].source).is_dir());

        // /var/log is a plain writable bind.
        assert_eq!(mounts[2].source, "/host/log");
        assert!(mounts[2].writable);
        assert!(mounts[2].data.is_empty());
    }

    #[test]
    fn mount_list_is_lexicographically_ordered() {
        let env = env();
        let mut config = config(&env, "ctr-1");
        config.binds = vec![
            "/h/a:/etc/resolv.conf".to_string(),
            "/h/b:/etc".to_string(),
            "/h/c:/a".to_string(),
            "/h/d:/etc/hosts".to_string(),
        ];

        let mounts = env.resolver.setup_container(&config).unwrap();
        let destinations: Vec<&str> =
            mounts.iter().map(|m| m.destination.as_str()).collect();
        assert_eq!(destinations, vec!["/a", "/etc", "/etc/hosts", "/etc/resolv.conf"]);
        for window in mounts.windows(2) {
            assert!(window[0].destination < window[1].destination);
        }
    }

    #[test]
    fn duplicate_destinations_fail() {
        let env = env();
        let mut config = config(&env, "ctr-1");
        config.binds = vec!["/h1:/c".to_string(), "/h2:/c".to_string()];

        let err = env.resolver.setup_container(&config).unwrap_err();
        assert!(matches!(err, CaskError::DuplicateMount { .. }));
    }

    #[test]
    fn image_volume_over_file_fails() {
        let env = env();
        std::fs::write(env.rootfs.join("notadir"), b"file").unwrap();

        let mut config = config(&env, "ctr-1");
        config.image_volumes = BTreeSet::from(["/notadir".to_string()]);

        let err = env.resolver.setup_container(&config).unwrap_err();
        assert!(matches!(err, CaskError::NotADirectory { .. }));
    }

    #[test]
    fn anonymous_volume_is_seeded_once() {
        let env = env();
        let seed_dir = env.rootfs.join("seed");
        std::fs::create_dir_all(seed_dir.join("nested")).unwrap();
        std::fs::write(seed_dir.join("keep.txt"), b"payload").unwrap();
        std::fs::write(seed_dir.join("nested/inner.txt"), b"deep").unwrap();

        let mut config = config(&env, "ctr-1");
        config.image_volumes = BTreeSet::from(["/seed".to_string()]);

        let mounts = env.resolver.setup_container(&config).unwrap();
        let volume_dir = PathBuf::from(&mounts[0].source);
        assert_eq!(
            std::fs::read_to_string(volume_dir.join("keep.txt")).unwrap(),
            "payload"
        );
        assert_eq!(
            std::fs::read_to_string(volume_dir.join("nested/inner.txt")).unwrap(),
            "deep"
        );

        // A restart after the volume was repopulated must not re-seed.
        std::fs::remove_file(volume_dir.join("keep.txt")).unwrap();
        env.resolver.teardown_container("ctr-1").unwrap();
        env.resolver.setup_container(&config).unwrap();
        assert!(!volume_dir.join("keep.txt").exists());
    }

    #[test]
    fn volumes_from_downgrades_writability() {
        let env = env();

        // Source container with one rw mount.
        let mut source_config = config(&env, "ctr-src");
        source_config.binds = vec!["/host/shared:/shared".to_string()];
        env.resolver.setup_container(&source_config).unwrap();
        env.resolver.teardown_container("ctr-src").unwrap();

        let mut config = config(&env, "ctr-dst");
        config.volumes_from = vec!["ctr-src:ro".to_string()];
        let mounts = env.resolver.setup_container(&config).unwrap();

        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].destination, "/shared");
        assert_eq!(mounts[0].source, "/host/shared");
        assert!(!mounts[0].writable);

        // The merge is tracked so a restart does not re-apply it.
        let record = env.resolver.store().load("ctr-dst").unwrap();
        assert!(record.applied_volumes_from.contains("ctr-src"));
    }

    #[test]
    fn local_destinations_win_over_volumes_from() {
        let env = env();

        let mut source_config = config(&env, "ctr-src");
        source_config.binds = vec!["/host/theirs:/shared".to_string()];
        env.resolver.setup_container(&source_config).unwrap();
        env.resolver.teardown_container("ctr-src").unwrap();

        let mut config = config(&env, "ctr-dst");
        config.binds = vec!["/host/mine:/shared".to_string()];
        config.volumes_from = vec!["ctr-src".to_string()];
        let mounts = env.resolver.setup_container(&config).unwrap();

        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].source, "/host/mine");
    }

    #[test]
    fn invalid_volumes_from_mode_is_rejected() {
        let env = env();
        let mut config = config(&env, "ctr-1");
        config.volumes_from = vec!["other:rx".to_string()];
        let err = env.resolver.setup_container(&config).unwrap_err();
        assert!(matches!(err, CaskError::InvalidSpec { .. }));
    }

    #[test]
    fn restart_with_new_bind_replaces_old_source() {
        let env = env();

        let mut config = config(&env, "ctr-1");
        config.binds = vec!["/host/old:/data".to_string()];
        env.resolver.setup_container(&config).unwrap();
        env.resolver.teardown_container("ctr-1").unwrap();

        let mut config = self::config(&env, "ctr-1");
        config.binds = vec!["/host/new:/data".to_string()];
        let mounts = env.resolver.setup_container(&config).unwrap();

        assert_eq!(mounts[0].source, "/host/new");
        let record = env.resolver.store().load("ctr-1").unwrap();
        assert_eq!(record.volumes["/data"], "/host/new");
        // The replaced bind's registration is gone.
        assert!(env
            .resolver
            .registry
            .lookup_source("/host/old")
            .is_none());
    }

    #[test]
    fn ceph_mount_carries_device_and_hint() {
        let env = env();
        env.runner.push(ToolOutput::ok("")); // rbd create
        env.runner.push(ToolOutput::ok("/dev/rbd0\n")); // rbd map
        env.runner.push(ToolOutput::ok("ext4\n")); // probe
        env.runner.push(ToolOutput::ok("")); // fsck

        let mut config = config(&env, "ctr-1");
        config.binds = vec!["pool/img:/blocks:rw,ceph".to_string()];
        let mounts = env.resolver.setup_container(&config).unwrap();

        assert_eq!(mounts[0].source, "/dev/rbd0");
        assert_eq!(mounts[0].data, "ceph");

        let record = env.resolver.store().load("ctr-1").unwrap();
        assert_eq!(record.volumes["/blocks"], "pool/img");
        assert_eq!(record.volumes_ceph_device["/blocks"], "/dev/rbd0");
    }

    #[test]
    fn nfs_mount_hands_off_share_uri() {
        let env = env();

        let mut config = config(&env, "ctr-1");
        config.binds = vec!["nfs.example//export:/data:rw,nfs".to_string()];
        let mounts = env.resolver.setup_container(&config).unwrap();

        assert_eq!(mounts[0].source, "nfs.example://export");
        assert_eq!(mounts[0].data, "nfs");

        // The record keeps the export so restarts can re-resolve it.
        let record = env.resolver.store().load("ctr-1").unwrap();
        assert_eq!(record.volumes["/data"], "nfs.example//export");
    }

    #[test]
    fn failed_attach_detaches_earlier_mounts() {
        let env = env();
        // /zpool sorts after /data, so the local mount attaches first and
        // must be detached again when the ceph map fails.
        env.runner.push(ToolOutput::ok("")); // rbd create
        env.runner.push(ToolOutput::fail(2, "rbd: sysfs write failed")); // rbd map

        let mut config = config(&env, "ctr-1");
        config.binds = vec![
            "/host/data:/data".to_string(),
            "pool/img:/zpool:rw,ceph".to_string(),
        ];

        let err = env.resolver.setup_container(&config).unwrap_err();
        assert!(matches!(err, CaskError::MapFailed { .. }));

        let bind = env.resolver.registry.lookup_source("/host/data").unwrap();
        assert_eq!(bind.ref_count(), 0);
        // Nothing was persisted.
        assert!(!env.resolver.store().exists("ctr-1"));
    }

    #[test]
    fn teardown_releases_attachments() {
        let env = env();
        let mut config = config(&env, "ctr-1");
        config.binds = vec!["/host/data:/data".to_string()];
        config.image_volumes = BTreeSet::from(["/cache".to_string()]);
        env.resolver.setup_container(&config).unwrap();

        let bind = env.resolver.registry.lookup_source("/host/data").unwrap();
        assert_eq!(bind.ref_count(), 1);

        env.resolver.teardown_container("ctr-1").unwrap();
        assert_eq!(bind.ref_count(), 0);

        // Teardown is idempotent.
        env.resolver.teardown_container("ctr-1").unwrap();
    }

    #[test]
    fn remove_container_collects_anonymous_volumes() {
        let env = env();
        let mut config = config(&env, "ctr-1");
        config.image_volumes = BTreeSet::from(["/cache".to_string()]);
        let mounts = env.resolver.setup_container(&config).unwrap();
        let volume_dir = PathBuf::from(&mounts[0].source);
        assert!(volume_dir.is_dir());

        env.resolver.teardown_container("ctr-1").unwrap();
        env.resolver.remove_container("ctr-1").unwrap();

        assert!(!volume_dir.exists());
        assert!(!env.resolver.store().exists("ctr-1"));
    }

    #[test]
    fn register_container_rebuilds_registry_entries() {
        let env = env();

        // Simulate a record written by a previous daemon instance.
        let mut record = ContainerVolumes::default();
        record.record("/data", "/host/data", false, "");
        env.resolver.store().save("ctr-1", &record).unwrap();

        env.resolver.register_container("ctr-1").unwrap();
        let volume = env.resolver.registry.lookup_source("/host/data").unwrap();
        assert_eq!(volume.driver_name(), "local");
    }

    #[test]
    fn mount_events_are_published() {
        let env = env();
        let mut receiver = env.resolver.events().subscribe();

        let mut config = config(&env, "ctr-1");
        config.binds = vec!["/host/data:/data".to_string()];
        env.resolver.setup_container(&config).unwrap();

        match receiver.try_recv().unwrap() {
            VolumeEvent::Mounted {
                container,
                destination,
                writable,
                ..
            } => {
                assert_eq!(container, "ctr-1");
                assert_eq!(destination, "/data");
                assert!(writable);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
