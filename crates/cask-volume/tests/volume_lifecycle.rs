//! Integration tests for the volume subsystem across container lifecycles.

use std::collections::BTreeSet;
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use cask_common::{CaskPaths, ScriptedRunner, ToolOutput};
use cask_volume::ceph::CephDriver;
use cask_volume::local::LocalDriver;
use cask_volume::nfs::NfsDriver;
use cask_volume::{ContainerStore, DriverRegistry, MountConfig, MountResolver, VolumeRegistry};
use tempfile::TempDir;

struct Daemon {
    paths: CaskPaths,
    runner: Arc<ScriptedRunner>,
    resolver: MountResolver,
}

/// Build a resolver the way the daemon would at startup: register the three
/// drivers once, then hand the registry to the resolver.
fn daemon(root: &std::path::Path) -> Daemon {
    let paths = CaskPaths::with_root(root);
    paths.create_dirs().unwrap();

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
    let resolver = MountResolver::new(registry, ContainerStore::new(paths.clone()));
    Daemon {
        paths,
        runner,
        resolver,
    }
}

#[test]
fn start_stop_restart_keeps_volumes() -> Result<(), Box<dyn Error>> {
    let temp = TempDir::new()?;
    let rootfs = temp.path().join("rootfs");
    std::fs::create_dir_all(&rootfs)?;
    let daemon = daemon(&temp.path().join("cask-root"));

    let config = MountConfig {
        container_id: "web-1".to_string(),
        rootfs: rootfs.clone(),
        binds: vec!["/host/static:/srv/static:ro".to_string()],
        volumes_from: vec![],
        image_volumes: BTreeSet::from(["/var/cache".to_string()]),
    };

    let mounts = daemon.resolver.setup_container(&config)?;
    assert_eq!(mounts.len(), 2);
    assert_eq!(mounts[0].destination, "/srv/static");
    assert!(!mounts[0].writable);
    assert_eq!(mounts[1].destination, "/var/cache");
    let cache_dir = PathBuf::from(&mounts[1].source);
    assert!(cache_dir.is_dir());

    daemon.resolver.teardown_container("web-1")?;

    // Simulate a daemon restart: fresh registries, record re-registered
    // from disk, then the same container starts again.
    let restarted = self::daemon(&daemon.paths.root);
    restarted.resolver.register_container("web-1")?;

    let mounts = restarted.resolver.setup_container(&config)?;
    assert_eq!(mounts.len(), 2);
    // The anonymous volume kept its backing directory across the restart.
    assert_eq!(PathBuf::from(&mounts[1].source), cache_dir);

    restarted.resolver.teardown_container("web-1")?;
    restarted.resolver.remove_container("web-1")?;
    assert!(!cache_dir.exists());
    assert!(!restarted.resolver.store().exists("web-1"));

    // The scripted runner was never touched: local volumes shell out to
    // nothing.
    assert!(restarted.runner.command_lines().is_empty());
    Ok(())
}

#[test]
fn volumes_from_chain_inherits_and_tracks() -> Result<(), Box<dyn Error>> {
    let temp = TempDir::new()?;
    let rootfs = temp.path().join("rootfs");
    std::fs::create_dir_all(&rootfs)?;
    let daemon = daemon(&temp.path().join("cask-root"));

    let data_config = MountConfig {
        container_id: "data".to_string(),
        rootfs: rootfs.clone(),
        binds: vec![
            "/host/db:/var/lib/db".to_string(),
            "/host/conf:/etc/app:ro".to_string(),
        ],
        ..MountConfig::default()
    };
    daemon.resolver.setup_container(&data_config)?;
    daemon.resolver.teardown_container("data")?;

    let app_config = MountConfig {
        container_id: "app".to_string(),
        rootfs,
        volumes_from: vec!["data:ro".to_string()],
        ..MountConfig::default()
    };
    let mounts = daemon.resolver.setup_container(&app_config)?;

    assert_eq!(mounts.len(), 2);
    // Inherited with mode ro: the rw mount is downgraded, the ro one stays.
    assert!(mounts.iter().all(|m| !m.writable));
    assert_eq!(mounts[0].destination, "/etc/app");
    assert_eq!(mounts[1].destination, "/var/lib/db");

    // Both containers now reference the shared bind.
    let db = daemon
        .resolver
        .store()
        .load("app")?;
    assert_eq!(db.volumes["/var/lib/db"], "/host/db");
    assert!(db.applied_volumes_from.contains("data"));
    Ok(())
}

#[test]
fn ceph_and_nfs_mounts_reach_the_exec_driver() -> Result<(), Box<dyn Error>> {
    let temp = TempDir::new()?;
    let rootfs = temp.path().join("rootfs");
    std::fs::create_dir_all(&rootfs)?;
    let daemon = daemon(&temp.path().join("cask-root"));

    // Ceph attach: create (exists), map, probe ext4, fsck.
    daemon
        .runner
        .push(ToolOutput::fail(17, "rbd image img already exists"));
    daemon.runner.push(ToolOutput::ok("/dev/rbd0\n"));
    daemon.runner.push(ToolOutput::ok("ext4\n"));
    daemon.runner.push(ToolOutput::ok(""));
    // NFS attach succeeds with the scripted default.

    let config = MountConfig {
        container_id: "mixed".to_string(),
        rootfs,
        binds: vec![
            "pool/img:/blocks:rw,ceph".to_string(),
            "nfs.example//export:/shared:rw,nfs".to_string(),
        ],
        ..MountConfig::default()
    };
    let mounts = daemon.resolver.setup_container(&config)?;

    assert_eq!(mounts[0].destination, "/blocks");
    assert_eq!(mounts[0].source, "/dev/rbd0");
    assert_eq!(mounts[0].data, "ceph");

    assert_eq!(mounts[1].destination, "/shared");
    assert_eq!(mounts[1].source, "nfs.example://export");
    assert_eq!(mounts[1].data, "nfs");

    // Stop walks destinations in reverse: the nfs unmount comes first,
    // then ceph re-probes and unmaps.
    daemon.runner.push(ToolOutput::ok("")); // umount -l
    daemon.runner.push(ToolOutput::ok("ext4\n")); // re-probe
    daemon.runner.push(ToolOutput::ok("")); // rbd unmap
    daemon.resolver.teardown_container("mixed")?;

    let lines = daemon.runner.command_lines();
    assert!(lines.iter().any(|l| l == "rbd unmap /dev/rbd0"));
    assert!(lines.iter().any(|l| l.starts_with("umount -l ")));
    Ok(())
}
