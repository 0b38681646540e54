//! Bind-mount and volumes-from specification grammars.
//!
//! ```text
//! spec      := host ":" ctr [":" options]
//! options   := opt ("," opt)*
//! opt       := "ro" | "rw" | "z" | "Z" | "ceph" | "nfs"
//! ```
//!
//! At most one of `ro`/`rw`, at most one sharing label, at most one driver
//! name. Volumes-from specs are `container_id[:("rw"|"ro")]`.

use cask_common::{CaskError, CaskResult};

use crate::driver::DriverKind;

/// SELinux-style sharing label on a bind spec.
///
/// Parsed and validated, but not propagated into the exec-driver hand-off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingLabel {
    /// `z` — content shared among containers.
    Shared,
    /// `Z` — content private to the container.
    Private,
}

impl SharingLabel {
    /// Stable string form.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Shared => "z",
            Self::Private => "Z",
        }
    }
}

/// A parsed bind-mount specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindSpec {
    /// Host path, RBD image name or NFS export, depending on the driver.
    pub source: String,
    /// Cleaned destination path inside the container.
    pub destination: String,
    /// Whether the mount is writable.
    pub writable: bool,
    /// Which driver serves the source.
    pub driver: DriverKind,
    /// Optional sharing label.
    pub label: Option<SharingLabel>,
}

/// Writability adjustment applied to inherited mounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumesFromMode {
    /// Leave each inherited mount's writability unchanged.
    ReadWrite,
    /// Downgrade every inherited mount to read-only.
    ReadOnly,
}

/// A parsed volumes-from specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumesFromSpec {
    /// The container whose mounts are inherited.
    pub container_id: String,
    /// Writability adjustment.
    pub mode: VolumesFromMode,
}

/// Parse a bind-mount specification string.
///
/// # Errors
///
/// Returns `InvalidSpec` for malformed specs: wrong field count, unknown or
/// conflicting options, or a relative host path on a plain bind.
pub fn parse_bind_spec(spec: &str) -> CaskResult<BindSpec> {
    let invalid = || CaskError::InvalidSpec {
        spec: spec.to_string(),
    };

    let fields: Vec<&str> = spec.split(':').collect();
    let (source, destination, options) = match fields.as_slice() {
        [source, destination] => (*source, *destination, None),
        [source, destination, options] => (*source, *destination, Some(*options)),
        _ => return Err(invalid()),
    };

    if source.is_empty() || destination.is_empty() || !destination.starts_with('/') {
        return Err(invalid());
    }

    let (writable, driver, label) = match options {
        // Two-field form: writable by default, plain bind.
        None => (true, None, None),
        Some(options) => parse_mount_options(spec, options)?,
    };

    let driver = driver.unwrap_or(DriverKind::Bind);
    let source = if driver == DriverKind::Bind {
        // Plain binds must name an absolute host path; remote sources are
        // interpreted by their driver.
        if !source.starts_with('/') {
            return Err(invalid());
        }
        clean_path(source)
    } else {
        source.to_string()
    };

    Ok(BindSpec {
        source,
        destination: clean_path(destination),
        writable,
        driver,
        label,
    })
}

/// Parse the options field of a bind spec.
///
/// Returns `(writable, driver, label)`. In the options form the mount is
/// read-only unless `rw` is given.
fn parse_mount_options(
    spec: &str,
    options: &str,
) -> CaskResult<(bool, Option<DriverKind>, Option<SharingLabel>)> {
    let invalid = || CaskError::InvalidSpec {
        spec: spec.to_string(),
    };

    let mut writable = false;
    let mut rw_specified = false;
    let mut label: Option<SharingLabel> = None;
    let mut driver: Option<DriverKind> = None;

    for option in options.split(',') {
        match option {
            "rw" | "ro" => {
                if rw_specified {
                    return Err(invalid());
                }
                writable = option == "rw";
                rw_specified = true;
            }
            "z" | "Z" => {
                if label.is_some() {
                    return Err(invalid());
                }
                label = Some(if option == "z" {
                    SharingLabel::Shared
                } else {
                    SharingLabel::Private
                });
            }
            "ceph" | "nfs" => {
                if driver.is_some() {
                    return Err(invalid());
                }
                driver = Some(if option == "ceph" {
                    DriverKind::Ceph
                } else {
                    DriverKind::Nfs
                });
            }
            _ => return Err(invalid()),
        }
    }

    Ok((writable, driver, label))
}

/// Parse a volumes-from specification string.
///
/// # Errors
///
/// Returns `InvalidSpec` for an empty container ID or a mode other than
/// `rw`/`ro`.
pub fn parse_volumes_from_spec(spec: &str) -> CaskResult<VolumesFromSpec> {
    let invalid = || CaskError::InvalidSpec {
        spec: spec.to_string(),
    };

    let mut parts = spec.splitn(2, ':');
    let container_id = parts.next().filter(|id| !id.is_empty()).ok_or_else(invalid)?;
    let mode = match parts.next() {
        None | Some("rw") => VolumesFromMode::ReadWrite,
        Some("ro") => VolumesFromMode::ReadOnly,
        Some(_) => return Err(invalid()),
    };

    Ok(VolumesFromSpec {
        container_id: container_id.to_string(),
        mode,
    })
}

/// Lexically clean an absolute path: collapse `//` and `.` segments, resolve
/// `..` without consulting the filesystem, and drop any trailing slash.
#[must_use]
pub fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_field_spec_is_writable() {
        let spec = parse_bind_spec("/host/data:/data").unwrap();
        assert_eq!(spec.source, "/host/data");
        assert_eq!(spec.destination, "/data");
        assert!(spec.writable);
        assert_eq!(spec.driver, DriverKind::Bind);
        assert!(spec.label.is_none());
    }

    #[test]
    fn ro_ceph_round_trip() {
        let spec = parse_bind_spec("/h:/c:ro,ceph").unwrap();
        assert_eq!(spec.source, "/h");
        assert_eq!(spec.destination, "/c");
        assert!(!spec.writable);
        assert_eq!(spec.driver, DriverKind::Ceph);
    }

    #[test]
    fn ceph_source_may_be_pool_prefixed() {
        let spec = parse_bind_spec("pool/img:/data:rw,ceph").unwrap();
        assert_eq!(spec.source, "pool/img");
        assert!(spec.writable);
    }

    #[test]
    fn nfs_source_is_not_path_checked() {
        let spec = parse_bind_spec("1.2.3.4//export:/data:nfs").unwrap();
        assert_eq!(spec.source, "1.2.3.4//export");
        assert_eq!(spec.driver, DriverKind::Nfs);
        assert!(!spec.writable);
    }

    #[test]
    fn relative_bind_path_is_rejected() {
        assert!(parse_bind_spec("data:/data").is_err());
        assert!(parse_bind_spec("./data:/data:rw").is_err());
    }

    #[test]
    fn conflicting_and_unknown_options() {
        assert!(parse_bind_spec("/h:/c:ro,rw").is_err());
        assert!(parse_bind_spec("/h:/c:z,Z").is_err());
        assert!(parse_bind_spec("/h:/c:ceph,nfs").is_err());
        assert!(parse_bind_spec("/h:/c:bogus").is_err());
        assert!(parse_bind_spec("/h:/c:rw,extra:field").is_err());
    }

    #[test]
    fn sharing_labels_parse() {
        let spec = parse_bind_spec("/h:/c:rw,Z").unwrap();
        assert_eq!(spec.label, Some(SharingLabel::Private));
        assert_eq!(spec.label.unwrap().as_str(), "Z");
    }

    #[test]
    fn volumes_from_modes() {
        let spec = parse_volumes_from_spec("abc123").unwrap();
        assert_eq!(spec.container_id, "abc123");
        assert_eq!(spec.mode, VolumesFromMode::ReadWrite);

        let spec = parse_volumes_from_spec("abc123:ro").unwrap();
        assert_eq!(spec.mode, VolumesFromMode::ReadOnly);

        assert!(parse_volumes_from_spec("abc123:rx").is_err());
        assert!(parse_volumes_from_spec(":ro").is_err());
    }

    #[test]
    fn path_cleaning() {
        assert_eq!(clean_path("/data/"), "/data");
        assert_eq!(clean_path("/a//b/./c"), "/a/b/c");
        assert_eq!(clean_path("/a/b/../c"), "/a/c");
        assert_eq!(clean_path("/"), "/");
    }
}
