//! Filesystem collaborators for unarchiving.

use std::io::Read;
use std::path::Path;

use tracing::warn;

use crate::decoder::{UntarFilesystem, UntarOptions};
use crate::error::ArchiveError;
use crate::format::NodeAttrs;

/// Materializes archive nodes on the local filesystem with their real
/// metadata: permissions, ownership, timestamps, and extended
/// attributes, subject to the untar options.
#[derive(Debug, Default)]
pub struct LocalFs;

impl UntarFilesystem for LocalFs {
    fn create_dir(
        &mut self,
        path: &Path,
        attrs: &NodeAttrs,
        opts: &UntarOptions,
    ) -> Result<(), ArchiveError> {
        match std::fs::create_dir(path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
        apply_attrs(path, attrs, opts, false)
    }

    fn create_file(
        &mut self,
        path: &Path,
        attrs: &NodeAttrs,
        size: u64,
        data: &mut dyn Read,
        opts: &UntarOptions,
    ) -> Result<(), ArchiveError> {
        let mut file = std::fs::File::create(path)?;
        let copied = std::io::copy(data, &mut file)?;
        if copied != size {
            return Err(ArchiveError::InvalidArchive(format!(
                "payload for {} truncated at {copied} of {size} bytes",
                path.display()
            )));
        }
        drop(file);
        apply_attrs(path, attrs, opts, false)
    }

    fn create_symlink(
        &mut self,
        path: &Path,
        attrs: &NodeAttrs,
        target: &str,
        opts: &UntarOptions,
    ) -> Result<(), ArchiveError> {
        #[cfg(unix)]
        {
            match std::os::unix::fs::symlink(target, path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    std::fs::remove_file(path)?;
                    std::os::unix::fs::symlink(target, path)?;
                }
                Err(e) => return Err(e.into()),
            }
            apply_attrs(path, attrs, opts, true)
        }
        #[cfg(not(unix))]
        {
            let _ = (attrs, opts, target);
            Err(ArchiveError::UnsupportedNode(format!(
                "symlink {} not supported on this platform",
                path.display()
            )))
        }
    }

    fn create_device(
        &mut self,
        path: &Path,
        attrs: &NodeAttrs,
        major: u64,
        minor: u64,
        opts: &UntarOptions,
    ) -> Result<(), ArchiveError> {
        #[cfg(unix)]
        {
            mknod(path, attrs.mode, major, minor)?;
            apply_attrs(path, attrs, opts, false)
        }
        #[cfg(not(unix))]
        {
            let _ = (attrs, major, minor, opts);
            Err(ArchiveError::UnsupportedNode(format!(
                "device node {} not supported on this platform",
                path.display()
            )))
        }
    }
}

#[cfg(unix)]
fn apply_attrs(
    path: &Path,
    attrs: &NodeAttrs,
    opts: &UntarOptions,
    is_symlink: bool,
) -> Result<(), ArchiveError> {
    use std::os::unix::fs::PermissionsExt;

    // Symlink permissions are ignored by the kernel; skip them.
    if !opts.no_same_permissions && !is_symlink {
        std::fs::set_permissions(
            path,
            std::fs::Permissions::from_mode(attrs.permissions() as u32),
        )?;
    }

    if !opts.no_same_owner
        && let Err(e) = lchown(path, attrs.uid as u32, attrs.gid as u32)
    {
        // Unprivileged extraction cannot restore ownership.
        if e.raw_os_error() == Some(libc::EPERM) {
            warn!(path = %path.display(), error = %e, "cannot restore ownership");
        } else {
            return Err(e.into());
        }
    }

    for (name, value) in &attrs.xattrs {
        if let Err(e) = set_xattr(path, name, value) {
            warn!(path = %path.display(), xattr = name, error = %e, "cannot restore xattr");
        }
    }

    set_mtime(path, attrs.mtime_nsec)?;
    Ok(())
}

#[cfg(not(unix))]
fn apply_attrs(
    path: &Path,
    attrs: &NodeAttrs,
    opts: &UntarOptions,
    _is_symlink: bool,
) -> Result<(), ArchiveError> {
    let _ = opts;
    let file = std::fs::File::options().write(true).open(path);
    if let Ok(file) = file {
        let mtime = std::time::UNIX_EPOCH + std::time::Duration::from_nanos(attrs.mtime_nsec);
        let _ = file.set_times(std::fs::FileTimes::new().set_modified(mtime));
    }
    warn!(path = %path.display(), "ownership and mode bits not supported on this platform");
    Ok(())
}

#[cfg(unix)]
fn c_path(path: &Path) -> std::io::Result<std::ffi::CString> {
    use std::os::unix::ffi::OsStrExt;
    std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
}

#[cfg(unix)]
fn lchown(path: &Path, uid: u32, gid: u32) -> std::io::Result<()> {
    let c_path = c_path(path)?;
    // SAFETY: the path is a valid NUL-terminated string for the
    // duration of the call.
    if unsafe { libc::lchown(c_path.as_ptr(), uid, gid) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
fn set_mtime(path: &Path, mtime_nsec: u64) -> std::io::Result<()> {
    let c_path = c_path(path)?;
    let times = [
        // atime untouched
        libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        },
        libc::timespec {
            tv_sec: (mtime_nsec / 1_000_000_000) as libc::time_t,
            tv_nsec: (mtime_nsec % 1_000_000_000) as _,
        },
    ];
    // SAFETY: path and times are valid for the duration of the call;
    // AT_SYMLINK_NOFOLLOW sets the time on the link itself.
    let rc = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_path.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(unix)]
fn mknod(path: &Path, node_mode: u64, major: u64, minor: u64) -> std::io::Result<()> {
    let c_path = c_path(path)?;
    let dev = libc::makedev(major as _, minor as _);
    // SAFETY: the path is a valid NUL-terminated string; mode and dev
    // are plain values.
    if unsafe { libc::mknod(c_path.as_ptr(), node_mode as libc::mode_t, dev) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_xattr(path: &Path, name: &str, value: &[u8]) -> std::io::Result<()> {
    let c_path = c_path(path)?;
    let c_name = std::ffi::CString::new(name).map_err(std::io::Error::other)?;
    // SAFETY: all pointers reference live buffers of the given
    // lengths for the duration of the call.
    let rc = unsafe {
        libc::lsetxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            0,
        )
    };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(all(unix, not(target_os = "linux")))]
fn set_xattr(_path: &Path, _name: &str, _value: &[u8]) -> std::io::Result<()> {
    Err(std::io::Error::other("xattrs not supported on this platform"))
}

/// Discards all data and records what an archive would create. Used
/// for listing and for verifying archives without touching the disk.
#[derive(Debug, Default)]
pub struct NullFs {
    pub dirs: usize,
    pub files: usize,
    pub symlinks: usize,
    pub devices: usize,
    pub payload_bytes: u64,
}

impl UntarFilesystem for NullFs {
    fn create_dir(
        &mut self,
        _path: &Path,
        _attrs: &NodeAttrs,
        _opts: &UntarOptions,
    ) -> Result<(), ArchiveError> {
        self.dirs += 1;
        Ok(())
    }

    fn create_file(
        &mut self,
        _path: &Path,
        _attrs: &NodeAttrs,
        size: u64,
        data: &mut dyn Read,
        _opts: &UntarOptions,
    ) -> Result<(), ArchiveError> {
        let copied = std::io::copy(data, &mut std::io::sink())?;
        if copied != size {
            return Err(ArchiveError::InvalidArchive(format!(
                "payload truncated at {copied} of {size} bytes"
            )));
        }
        self.files += 1;
        self.payload_bytes += size;
        Ok(())
    }

    fn create_symlink(
        &mut self,
        _path: &Path,
        _attrs: &NodeAttrs,
        _target: &str,
        _opts: &UntarOptions,
    ) -> Result<(), ArchiveError> {
        self.symlinks += 1;
        Ok(())
    }

    fn create_device(
        &mut self,
        _path: &Path,
        _attrs: &NodeAttrs,
        _major: u64,
        _minor: u64,
        _opts: &UntarOptions,
    ) -> Result<(), ArchiveError> {
        self.devices += 1;
        Ok(())
    }
}
