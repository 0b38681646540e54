//! Common error types for the cask ecosystem.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`CaskError`].
pub type CaskResult<T> = Result<T, CaskError>;

/// Common errors across the cask ecosystem.
///
/// Subprocess-backed variants carry the tool's exit code and a trimmed
/// stderr tail so callers can surface the underlying failure verbatim.
#[derive(Error, Diagnostic, Debug)]
pub enum CaskError {
    /// Unknown volume driver name.
    #[error("Volume driver not found: {name}")]
    #[diagnostic(code(cask::driver::not_found))]
    DriverNotFound {
        /// The driver name that was requested.
        name: String,
    },

    /// Two mount specifications target the same container destination.
    #[error("Duplicate mount point: {destination} already mounted from {existing}")]
    #[diagnostic(code(cask::mount::duplicate))]
    DuplicateMount {
        /// The container destination claimed twice.
        destination: String,
        /// Host source already occupying the destination.
        existing: String,
    },

    /// Malformed bind or volumes-from specification.
    #[error("Invalid volume specification: {spec}")]
    #[diagnostic(
        code(cask::mount::invalid_spec),
        help("Bind specs are host:container[:options] with options drawn from ro,rw,z,Z,ceph,nfs")
    )]
    InvalidSpec {
        /// The offending specification string.
        spec: String,
    },

    /// An exclusive-use driver refused a second attachment.
    #[error("Volume {name} is busy: attached to container {attached_to}")]
    #[diagnostic(code(cask::volume::busy))]
    VolumeBusy {
        /// Volume name.
        name: String,
        /// Container currently holding the attachment.
        attached_to: String,
    },

    /// Removal was requested for a volume that still has attachments.
    #[error("Volume {name} is in use by {ref_count} container(s)")]
    #[diagnostic(code(cask::volume::in_use))]
    VolumeInUse {
        /// Volume name.
        name: String,
        /// Number of live attachments.
        ref_count: usize,
    },

    /// Volume lookup failed.
    #[error("Volume not found: {name}")]
    #[diagnostic(code(cask::volume::not_found))]
    VolumeNotFound {
        /// The volume name that was requested.
        name: String,
    },

    /// Backing image creation failed.
    #[error("Failed to create volume {name}: {stderr} (exit code {code})")]
    #[diagnostic(code(cask::volume::create_failed))]
    CreateFailed {
        /// Volume name.
        name: String,
        /// Tool exit code.
        code: i32,
        /// Trimmed stderr tail.
        stderr: String,
    },

    /// `rbd map` failed.
    #[error("Failed to map volume {name}: {stderr} (exit code {code})")]
    #[diagnostic(code(cask::volume::map_failed))]
    MapFailed {
        /// Volume name.
        name: String,
        /// Tool exit code.
        code: i32,
        /// Trimmed stderr tail.
        stderr: String,
    },

    /// A mount command failed.
    #[error("Failed to mount {mount_source} at {target}: {stderr} (exit code {code})")]
    #[diagnostic(code(cask::volume::mount_failed))]
    MountFailed {
        /// Mount source.
        mount_source: String,
        /// Mount target.
        target: String,
        /// Tool exit code.
        code: i32,
        /// Trimmed stderr tail.
        stderr: String,
    },

    /// Filesystem check failed on a volume's block device.
    #[error("Filesystem check failed on {device}: {stderr} (exit code {code})")]
    #[diagnostic(code(cask::volume::fsck_failed))]
    FsckFailed {
        /// Device path that was checked.
        device: String,
        /// Tool exit code.
        code: i32,
        /// Trimmed stderr tail.
        stderr: String,
    },

    /// Filesystem creation failed on a volume's block device.
    #[error("Failed to create filesystem on {device}: {stderr} (exit code {code})")]
    #[diagnostic(code(cask::volume::mkfs_failed))]
    MkfsFailed {
        /// Device path.
        device: String,
        /// Tool exit code.
        code: i32,
        /// Trimmed stderr tail.
        stderr: String,
    },

    /// A LUKS open/close operation failed.
    #[error("LUKS operation failed on {device}: {stderr} (exit code {code})")]
    #[diagnostic(code(cask::volume::luks_failed))]
    LuksFailed {
        /// Device (or mapper node) involved.
        device: String,
        /// Tool exit code.
        code: i32,
        /// Trimmed stderr tail.
        stderr: String,
    },

    /// `rbd unmap` failed. Logged and tolerated on detach.
    #[error("Failed to unmap device {device}: {stderr} (exit code {code})")]
    #[diagnostic(code(cask::volume::unmap_failed))]
    UnmapFailed {
        /// Mapped device path.
        device: String,
        /// Tool exit code.
        code: i32,
        /// Trimmed stderr tail.
        stderr: String,
    },

    /// An unmount command failed. Logged and tolerated on detach.
    #[error("Failed to unmount {target}: {stderr} (exit code {code})")]
    #[diagnostic(code(cask::volume::unmount_failed))]
    UnmountFailed {
        /// Mount target.
        target: String,
        /// Tool exit code.
        code: i32,
        /// Trimmed stderr tail.
        stderr: String,
    },

    /// An image declared a volume at a path occupied by a regular file.
    #[error("File exists at {path}, cannot create volume there")]
    #[diagnostic(code(cask::mount::not_a_directory))]
    NotADirectory {
        /// The in-image path.
        path: String,
    },

    /// Network operation failed.
    #[error("Network operation failed: {message}")]
    #[diagnostic(code(cask::network))]
    Network {
        /// The error message.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(cask::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(cask::serialization))]
    Serialization(String),

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(cask::internal),
        help("This is a bug, please report it at https://github.com/cask-containers/cask/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl From<serde_json::Error> for CaskError {
    fn from(err: serde_json::Error) -> Self {
        CaskError::Serialization(err.to_string())
    }
}
