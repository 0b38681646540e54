//! Typed external tool operations.
//!
//! Each kernel-facing step of the volume drivers is a [`VolumeOp`] that knows
//! the exact command line it runs. Drivers execute ops through the
//! [`CommandRunner`] seam so tests can substitute a scripted runner.

use cask_common::{CaskError, CaskResult, CommandRunner, ToolOutput};

/// Filesystem type reported for LUKS-encrypted devices.
pub const CRYPTO_LUKS_FS_TYPE: &str = "crypto_LUKS";

/// An external tool invocation used by the volume drivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeOp {
    /// `rbd create <image> --size <size_mb>`
    RbdCreate {
        /// Image name, optionally pool-prefixed (`pool/image`).
        image: String,
        /// Image size in megabytes.
        size_mb: u64,
    },
    /// `rbd map <image> --options rw|ro`
    RbdMap {
        /// Image name.
        image: String,
        /// Whether to request a writable mapping.
        writable: bool,
    },
    /// `rbd unmap <device>`
    RbdUnmap {
        /// Mapped device path (e.g. `/dev/rbd0`).
        device: String,
    },
    /// `blkid -o value -s TYPE <device>` — detect the filesystem type.
    ProbeFilesystem {
        /// Device path to probe.
        device: String,
    },
    /// `cryptsetup luksOpen --allow-discards --key-file=- <device> <mapper>`
    LuksOpen {
        /// Encrypted device path.
        device: String,
        /// Device-mapper node name to open into.
        mapper: String,
    },
    /// `cryptsetup luksClose <mapper>`
    LuksClose {
        /// Device-mapper node name.
        mapper: String,
    },
    /// `mkfs.ext4` with the flags the subsystem formats fresh volumes with.
    MkfsExt4 {
        /// Device path to format.
        device: String,
    },
    /// `fsck -a <device>`
    Fsck {
        /// Device path to check.
        device: String,
    },
    /// `mount <source> <target> -o retry=0,timeo=30`
    ///
    /// No retries and an aggressive timeout: a failing NFS server must not
    /// wedge the daemon.
    MountNfs {
        /// NFS mount spec (`host://export`).
        source: String,
        /// Host directory to mount onto.
        target: String,
    },
    /// `umount -l <target>`
    UmountLazy {
        /// Mounted host directory.
        target: String,
    },
}

impl VolumeOp {
    /// The program this operation invokes.
    #[must_use]
    pub fn program(&self) -> &'static str {
        match self {
            Self::RbdCreate { .. } | Self::RbdMap { .. } | Self::RbdUnmap { .. } => "rbd",
            Self::ProbeFilesystem { .. } => "blkid",
            Self::LuksOpen { .. } | Self::LuksClose { .. } => "cryptsetup",
            Self::MkfsExt4 { .. } => "mkfs.ext4",
            Self::Fsck { .. } => "fsck",
            Self::MountNfs { .. } => "mount",
            Self::UmountLazy { .. } => "umount",
        }
    }

    /// The argument vector this operation invokes the program with.
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        fn strings(parts: &[&str]) -> Vec<String> {
            parts.iter().map(|s| (*s).to_string()).collect()
        }

        match self {
            Self::RbdCreate { image, size_mb } => {
                strings(&["create", image, "--size", &size_mb.to_string()])
            }
            Self::RbdMap { image, writable } => {
                let mode = if *writable { "rw" } else { "ro" };
                strings(&["map", image, "--options", mode])
            }
            Self::RbdUnmap { device } => strings(&["unmap", device]),
            Self::ProbeFilesystem { device } => strings(&["-o", "value", "-s", "TYPE", device]),
            Self::LuksOpen { device, mapper } => strings(&[
                "luksOpen",
                "--allow-discards",
                "--key-file=-",
                device,
                mapper,
            ]),
            Self::LuksClose { mapper } => strings(&["luksClose", mapper]),
            Self::MkfsExt4 { device } => strings(&[
                "-m0",
                "-E",
                "nodiscard,lazy_itable_init=0,lazy_journal_init=0,packed_meta_blocks=1",
                device,
            ]),
            Self::Fsck { device } => strings(&["-a", device]),
            Self::MountNfs { source, target } => {
                strings(&[source, target, "-o", "retry=0,timeo=30"])
            }
            Self::UmountLazy { target } => strings(&["-l", target]),
        }
    }

    /// Run the operation, optionally piping bytes to the tool's stdin.
    pub fn run(
        &self,
        runner: &dyn CommandRunner,
        stdin: Option<&[u8]>,
    ) -> CaskResult<ToolOutput> {
        runner.run(self.program(), &self.args(), stdin)
    }
}

/// Detect the filesystem type on a block device.
///
/// Returns the type string (`"ext4"`, `"crypto_LUKS"`, ...) or an empty
/// string for an unformatted device (`blkid` exits 2 with no output there).
pub fn probe_filesystem(runner: &dyn CommandRunner, device: &str) -> CaskResult<String> {
    let op = VolumeOp::ProbeFilesystem {
        device: device.to_string(),
    };
    let out = op.run(runner, None)?;
    if out.success() {
        return Ok(out.stdout.trim().to_string());
    }
    if out.code == 2 && out.stdout.trim().is_empty() {
        return Ok(String::new());
    }
    Err(CaskError::Internal {
        message: format!(
            "Failed to probe filesystem on {}: {} (exit code {})",
            device,
            out.stderr_trimmed(),
            out.code
        ),
    })
}
