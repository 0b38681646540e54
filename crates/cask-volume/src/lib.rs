//! # cask-volume
//!
//! The container volume subsystem: preparing, attaching, tracking and
//! detaching persistent storage for containers.
//!
//! ## Module overview
//!
//! | Module | Purpose |
//! |---|---|
//! | [`driver`] | The [`VolumeDriver`]/[`Volume`] contracts shared by all drivers. |
//! | [`registry`] | Driver registry and the process-wide volume registry. |
//! | [`local`] | Anonymous, named and bind volumes on the host filesystem. |
//! | [`ceph`] | RBD-backed block volumes: map, LUKS open, mkfs, fsck. |
//! | [`nfs`] | Network filesystem volumes mounted under a temp directory. |
//! | [`exec`] | Typed external tool operations (`rbd`, `mount`, `cryptsetup`, ...). |
//! | [`binds`] | Bind-mount and volumes-from specification grammars. |
//! | [`mounts`] | Per-container mount resolution and attach/detach orchestration. |
//! | [`state`] | The persisted container volume record. |
//! | [`events`] | Volume lifecycle event bus. |

#![warn(missing_docs)]

pub mod binds;
pub mod ceph;
pub mod driver;
pub mod events;
pub mod exec;
pub mod local;
pub mod mounts;
pub mod nfs;
pub mod registry;
pub mod state;

pub use driver::{DriverKind, Scope, Volume, VolumeDriver};
pub use events::{EventBus, VolumeEvent};
pub use mounts::{ExecMount, MountConfig, MountPoint, MountResolver, Propagation};
pub use registry::{DriverRegistry, VolumeRegistry};
pub use state::{ContainerStore, ContainerVolumes};
