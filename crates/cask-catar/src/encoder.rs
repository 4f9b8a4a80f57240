//! Serialize a directory tree into an archive stream.

use std::io::{Read, Write};
use std::path::Path;

use crate::error::ArchiveError;
use crate::format::{
    DEVICE_MAGIC, ENTRY_MAGIC, ENTRY_SIZE, FILENAME_MAGIC, GOODBYE_ITEM_SIZE, GOODBYE_MAGIC,
    GOODBYE_TAIL_MARKER, GoodbyeItem, HEADER_SIZE, NodeAttrs, PAYLOAD_MAGIC, SYMLINK_MAGIC,
    XATTR_MAGIC, arrange_bst, default_feature_flags, goodbye_hash, mode,
};

/// Archive the tree rooted at `root` (a directory) into `dst`.
///
/// Children are emitted in byte-wise sorted name order, so the same
/// tree always produces the same stream. Returns the number of bytes
/// written.
pub fn tar<W: Write>(dst: W, root: &Path) -> Result<u64, ArchiveError> {
    let mut encoder = Encoder {
        w: CountingWriter { inner: dst, pos: 0 },
        feature_flags: default_feature_flags(),
    };
    let meta = std::fs::metadata(root)?;
    if !meta.is_dir() {
        return Err(ArchiveError::InvalidArchive(format!(
            "{} is not a directory",
            root.display()
        )));
    }
    let attrs = node_attrs(root, &meta)?;
    encoder.encode_dir(root, &attrs)?;
    encoder.w.inner.flush()?;
    Ok(encoder.w.pos)
}

struct CountingWriter<W> {
    inner: W,
    pos: u64,
}

impl<W: Write> CountingWriter<W> {
    fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn write_u64(&mut self, v: u64) -> std::io::Result<()> {
        self.write_all(&v.to_le_bytes())
    }
}

struct Encoder<W> {
    w: CountingWriter<W>,
    feature_flags: u64,
}

impl<W: Write> Encoder<W> {
    fn write_header(&mut self, size: u64, magic: u64) -> std::io::Result<()> {
        self.w.write_u64(size)?;
        self.w.write_u64(magic)
    }

    fn write_entry(&mut self, attrs: &NodeAttrs) -> std::io::Result<()> {
        self.write_header(ENTRY_SIZE, ENTRY_MAGIC)?;
        self.w.write_u64(self.feature_flags)?;
        self.w.write_u64(attrs.mode)?;
        self.w.write_u64(0)?; // chattr/FAT flags, none recorded
        self.w.write_u64(attrs.uid)?;
        self.w.write_u64(attrs.gid)?;
        self.w.write_u64(attrs.mtime_nsec)
    }

    fn write_xattrs(&mut self, attrs: &NodeAttrs) -> std::io::Result<()> {
        // BTreeMap iteration gives the required key order.
        for (name, value) in &attrs.xattrs {
            let size = HEADER_SIZE + name.len() as u64 + 1 + value.len() as u64;
            self.write_header(size, XATTR_MAGIC)?;
            self.w.write_all(name.as_bytes())?;
            self.w.write_all(&[0])?;
            self.w.write_all(value)?;
        }
        Ok(())
    }

    fn write_filename(&mut self, name: &str) -> std::io::Result<()> {
        self.write_header(HEADER_SIZE + name.len() as u64 + 1, FILENAME_MAGIC)?;
        self.w.write_all(name.as_bytes())?;
        self.w.write_all(&[0])
    }

    fn write_payload(&mut self, path: &Path, len: u64) -> Result<(), ArchiveError> {
        self.write_header(HEADER_SIZE + len, PAYLOAD_MAGIC)?;
        let mut file = std::fs::File::open(path)?.take(len);
        let copied = copy_counted(&mut file, &mut self.w)?;
        if copied != len {
            return Err(ArchiveError::InvalidArchive(format!(
                "{} shrank while being archived",
                path.display()
            )));
        }
        Ok(())
    }

    fn encode_dir(&mut self, path: &Path, attrs: &NodeAttrs) -> Result<(), ArchiveError> {
        let dir_start = self.w.pos;
        self.write_entry(attrs)?;
        self.write_xattrs(attrs)?;

        let mut names: Vec<String> = Vec::new();
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(name) => {
                    return Err(ArchiveError::InvalidArchive(format!(
                        "non-unicode file name {name:?} in {}",
                        path.display()
                    )));
                }
            }
        }
        names.sort_unstable();

        let mut spans = Vec::with_capacity(names.len());
        for name in &names {
            let start = self.w.pos;
            self.write_filename(name)?;
            self.encode_node(&path.join(name))?;
            spans.push((start, self.w.pos, goodbye_hash(name)));
        }

        let goodbye_start = self.w.pos;
        let items = arrange_bst(
            spans
                .into_iter()
                .map(|(start, end, hash)| GoodbyeItem {
                    offset: goodbye_start - start,
                    size: end - start,
                    hash,
                })
                .collect(),
        );
        let size = HEADER_SIZE + (items.len() as u64 + 1) * GOODBYE_ITEM_SIZE;
        self.write_header(size, GOODBYE_MAGIC)?;
        for item in &items {
            self.w.write_u64(item.offset)?;
            self.w.write_u64(item.size)?;
            self.w.write_u64(item.hash)?;
        }
        // Tail item pointing back over the whole directory encoding.
        self.w.write_u64(goodbye_start - dir_start)?;
        self.w.write_u64(size)?;
        self.w.write_u64(GOODBYE_TAIL_MARKER)?;
        Ok(())
    }

    fn encode_node(&mut self, path: &Path) -> Result<(), ArchiveError> {
        let meta = std::fs::symlink_metadata(path)?;
        let attrs = node_attrs(path, &meta)?;

        match attrs.file_type() {
            mode::DIRECTORY => self.encode_dir(path, &attrs),
            mode::FILE => {
                self.write_entry(&attrs)?;
                self.write_xattrs(&attrs)?;
                self.write_payload(path, meta.len())
            }
            mode::SYMLINK => {
                let target = std::fs::read_link(path)?;
                let target = target.to_str().ok_or_else(|| {
                    ArchiveError::InvalidArchive(format!(
                        "non-unicode symlink target at {}",
                        path.display()
                    ))
                })?;
                self.write_entry(&attrs)?;
                self.write_xattrs(&attrs)?;
                self.write_header(HEADER_SIZE + target.len() as u64 + 1, SYMLINK_MAGIC)?;
                self.w.write_all(target.as_bytes())?;
                self.w.write_all(&[0])?;
                Ok(())
            }
            mode::BLOCK_DEVICE | mode::CHAR_DEVICE => {
                let (major, minor) = device_numbers(&meta);
                self.write_entry(&attrs)?;
                self.write_xattrs(&attrs)?;
                self.write_header(HEADER_SIZE + 16, DEVICE_MAGIC)?;
                self.w.write_u64(major)?;
                self.w.write_u64(minor)?;
                Ok(())
            }
            // FIFOs and sockets are fully described by their entry.
            mode::FIFO | mode::SOCKET => {
                self.write_entry(&attrs)?;
                self.write_xattrs(&attrs)?;
                Ok(())
            }
            other => Err(ArchiveError::InvalidArchive(format!(
                "unrepresentable file type {other:o} at {}",
                path.display()
            ))),
        }
    }
}

fn copy_counted<R: std::io::Read, W: Write>(
    src: &mut R,
    dst: &mut CountingWriter<W>,
) -> std::io::Result<u64> {
    let mut buf = vec![0u8; 64 * 1024];
    let mut copied = 0u64;
    loop {
        let n = src.read(&mut buf)?;
        if n == 0 {
            return Ok(copied);
        }
        dst.write_all(&buf[..n])?;
        copied += n as u64;
    }
}

/// Read a node's attributes from real filesystem metadata.
#[cfg(unix)]
fn node_attrs(path: &Path, meta: &std::fs::Metadata) -> Result<NodeAttrs, ArchiveError> {
    use std::os::unix::fs::MetadataExt;

    let mtime_nsec =
        (meta.mtime().max(0) as u64) * 1_000_000_000 + u64::from(meta.mtime_nsec().max(0) as u32);
    Ok(NodeAttrs {
        mode: u64::from(meta.mode()) & (mode::FMT | mode::PERMISSIONS),
        uid: u64::from(meta.uid()),
        gid: u64::from(meta.gid()),
        mtime_nsec,
        xattrs: read_xattrs(path)?,
    })
}

/// Non-Unix platforms have no uid/gid or permission bits to read;
/// those attributes are archived as empty rather than invented.
#[cfg(not(unix))]
fn node_attrs(path: &Path, meta: &std::fs::Metadata) -> Result<NodeAttrs, ArchiveError> {
    use std::time::UNIX_EPOCH;

    let file_type = if meta.is_dir() {
        mode::DIRECTORY
    } else if meta.file_type().is_symlink() {
        mode::SYMLINK
    } else {
        mode::FILE
    };
    let writable = if meta.permissions().readonly() { 0o555 } else { 0o755 };
    let mtime_nsec = meta
        .modified()?
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    tracing::debug!(path = %path.display(), "no ownership metadata on this platform");
    Ok(NodeAttrs {
        mode: file_type | writable,
        uid: 0,
        gid: 0,
        mtime_nsec,
        xattrs: Default::default(),
    })
}

#[cfg(target_os = "linux")]
fn device_numbers(meta: &std::fs::Metadata) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    let rdev = meta.rdev();
    let major = ((rdev >> 32) & 0xffff_f000) | ((rdev >> 8) & 0xfff);
    let minor = ((rdev >> 12) & 0xffff_ff00) | (rdev & 0xff);
    (major, minor)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn device_numbers(meta: &std::fs::Metadata) -> (u64, u64) {
    use std::os::unix::fs::MetadataExt;
    let rdev = meta.rdev();
    ((rdev >> 8) & 0xff, rdev & 0xff)
}

#[cfg(not(unix))]
fn device_numbers(_meta: &std::fs::Metadata) -> (u64, u64) {
    (0, 0)
}

/// Read a node's extended attributes without following symlinks.
/// Filesystems without xattr support yield an empty map.
#[cfg(target_os = "linux")]
fn read_xattrs(
    path: &Path,
) -> Result<std::collections::BTreeMap<String, Vec<u8>>, ArchiveError> {
    use std::collections::BTreeMap;
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    let mut attrs = BTreeMap::new();
    // SAFETY: c_path is a valid NUL-terminated string for the whole
    // call; a null buffer with size 0 asks for the required size.
    let len = unsafe { libc::llistxattr(c_path.as_ptr(), std::ptr::null_mut(), 0) };
    if len < 0 {
        let err = std::io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::ENOTSUP | libc::EPERM) => Ok(attrs),
            _ => Err(err.into()),
        };
    }
    if len == 0 {
        return Ok(attrs);
    }

    let mut names = vec![0u8; len as usize];
    // SAFETY: the buffer is exactly the size the kernel just reported
    // and lives for the duration of the call.
    let len =
        unsafe { libc::llistxattr(c_path.as_ptr(), names.as_mut_ptr().cast(), names.len()) };
    if len < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    names.truncate(len as usize);

    for name in names.split(|&b| b == 0).filter(|n| !n.is_empty()) {
        let c_name = CString::new(name).map_err(std::io::Error::other)?;
        // SAFETY: same contract as llistxattr above, per attribute.
        let value_len =
            unsafe { libc::lgetxattr(c_path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0) };
        if value_len < 0 {
            continue; // attribute vanished between list and get
        }
        let mut value = vec![0u8; value_len as usize];
        // SAFETY: buffer sized from the preceding query.
        let value_len = unsafe {
            libc::lgetxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                value.as_mut_ptr().cast(),
                value.len(),
            )
        };
        if value_len < 0 {
            continue;
        }
        value.truncate(value_len as usize);
        let name = String::from_utf8_lossy(name).into_owned();
        attrs.insert(name, value);
    }
    Ok(attrs)
}

#[cfg(not(target_os = "linux"))]
fn read_xattrs(
    _path: &Path,
) -> Result<std::collections::BTreeMap<String, Vec<u8>>, ArchiveError> {
    Ok(Default::default())
}
