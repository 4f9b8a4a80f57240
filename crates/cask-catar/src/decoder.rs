//! Stream an archive back into filesystem operations.

use std::io::Read;
use std::path::Path;

use crate::error::ArchiveError;
use crate::format::{
    DEVICE_MAGIC, ENTRY_MAGIC, ENTRY_SIZE, FILENAME_MAGIC, GOODBYE_ITEM_SIZE, GOODBYE_MAGIC,
    GOODBYE_TAIL_MARKER, HEADER_SIZE, NodeAttrs, PAYLOAD_MAGIC, SYMLINK_MAGIC, XATTR_MAGIC,
    check_feature_flags, mode,
};

/// How faithfully unarchived nodes reproduce the recorded metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct UntarOptions {
    /// Don't restore uid/gid; nodes belong to the extracting user.
    pub no_same_owner: bool,
    /// Don't restore permission bits; the process umask applies.
    pub no_same_permissions: bool,
}

/// The operations a decode target must provide.
///
/// The decoder drives one of these with every node it encounters, in
/// depth-first archive order; parents are created before their
/// children.
pub trait UntarFilesystem {
    /// Create a directory.
    fn create_dir(
        &mut self,
        path: &Path,
        attrs: &NodeAttrs,
        opts: &UntarOptions,
    ) -> Result<(), ArchiveError>;

    /// Create a regular file from `size` bytes of `data`.
    fn create_file(
        &mut self,
        path: &Path,
        attrs: &NodeAttrs,
        size: u64,
        data: &mut dyn Read,
        opts: &UntarOptions,
    ) -> Result<(), ArchiveError>;

    /// Create a symlink pointing at `target`.
    fn create_symlink(
        &mut self,
        path: &Path,
        attrs: &NodeAttrs,
        target: &str,
        opts: &UntarOptions,
    ) -> Result<(), ArchiveError>;

    /// Create a device node, FIFO, or socket (the file-type bits of
    /// the attrs' mode distinguish them; FIFOs and sockets carry zero
    /// major/minor).
    fn create_device(
        &mut self,
        path: &Path,
        attrs: &NodeAttrs,
        major: u64,
        minor: u64,
        opts: &UntarOptions,
    ) -> Result<(), ArchiveError>;
}

/// Decode the archive in `src`, materializing it under `root` through
/// `fs`.
pub fn untar<R: Read>(
    src: R,
    root: &Path,
    fs: &mut dyn UntarFilesystem,
    opts: &UntarOptions,
) -> Result<(), ArchiveError> {
    let mut decoder = Decoder {
        r: src,
        peeked: None,
    };
    let attrs = decoder.read_entry()?;
    let attrs = decoder.read_xattrs(attrs)?;
    if attrs.file_type() != mode::DIRECTORY {
        return Err(ArchiveError::InvalidArchive(
            "archive root is not a directory".to_string(),
        ));
    }
    decoder.decode_dir(fs, root, attrs, opts)?;
    decoder.expect_eof()
}

struct Decoder<R> {
    r: R,
    /// One element header of lookahead, needed to find the end of
    /// optional element runs (xattrs).
    peeked: Option<(u64, u64)>,
}

impl<R: Read> Decoder<R> {
    fn read_u64(&mut self) -> Result<u64, ArchiveError> {
        let mut buf = [0u8; 8];
        self.r.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_header(&mut self) -> Result<(u64, u64), ArchiveError> {
        if let Some(header) = self.peeked.take() {
            return Ok(header);
        }
        let size = self.read_u64()?;
        let magic = self.read_u64()?;
        if size < HEADER_SIZE {
            return Err(ArchiveError::InvalidArchive(format!(
                "element size {size} below header size"
            )));
        }
        Ok((size, magic))
    }

    fn peek_header(&mut self) -> Result<(u64, u64), ArchiveError> {
        if self.peeked.is_none() {
            self.peeked = Some(self.read_header()?);
        }
        Ok(self.peeked.expect("just set"))
    }

    fn read_body(&mut self, len: u64) -> Result<Vec<u8>, ArchiveError> {
        // Names, targets, and xattrs are small; a huge length here is
        // a corrupt or hostile stream, not a reason to allocate.
        const MAX_INLINE_BODY: u64 = 16 * 1024 * 1024;
        if len > MAX_INLINE_BODY {
            return Err(ArchiveError::InvalidArchive(format!(
                "element body of {len} bytes exceeds the {MAX_INLINE_BODY} limit"
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.r.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// A NUL-terminated string body.
    fn read_string(&mut self, len: u64) -> Result<String, ArchiveError> {
        let mut body = self.read_body(len)?;
        if body.pop() != Some(0) {
            return Err(ArchiveError::InvalidArchive(
                "string not NUL-terminated".to_string(),
            ));
        }
        if body.contains(&0) {
            return Err(ArchiveError::InvalidArchive(
                "embedded NUL in string".to_string(),
            ));
        }
        String::from_utf8(body)
            .map_err(|e| ArchiveError::InvalidArchive(format!("invalid string: {e}")))
    }

    fn read_entry(&mut self) -> Result<NodeAttrs, ArchiveError> {
        let (size, magic) = self.read_header()?;
        if magic != ENTRY_MAGIC || size != ENTRY_SIZE {
            return Err(ArchiveError::InvalidArchive(format!(
                "expected entry element, got type {magic:#018x} size {size}"
            )));
        }
        let feature_flags = self.read_u64()?;
        check_feature_flags(feature_flags)?;
        let node_mode = self.read_u64()?;
        let _fs_flags = self.read_u64()?;
        let uid = self.read_u64()?;
        let gid = self.read_u64()?;
        let mtime_nsec = self.read_u64()?;
        Ok(NodeAttrs {
            mode: node_mode,
            uid,
            gid,
            mtime_nsec,
            xattrs: Default::default(),
        })
    }

    /// Consume the xattr elements following an entry, sorted by key in
    /// valid archives.
    fn read_xattrs(&mut self, mut attrs: NodeAttrs) -> Result<NodeAttrs, ArchiveError> {
        loop {
            let (size, magic) = self.peek_header()?;
            if magic != XATTR_MAGIC {
                return Ok(attrs);
            }
            self.peeked = None;
            let body = self.read_body(size - HEADER_SIZE)?;
            let split = body.iter().position(|&b| b == 0).ok_or_else(|| {
                ArchiveError::InvalidArchive("xattr without name terminator".to_string())
            })?;
            let name = String::from_utf8(body[..split].to_vec())
                .map_err(|e| ArchiveError::InvalidArchive(format!("invalid xattr name: {e}")))?;
            attrs.xattrs.insert(name, body[split + 1..].to_vec());
        }
    }

    fn decode_dir(
        &mut self,
        fs: &mut dyn UntarFilesystem,
        path: &Path,
        attrs: NodeAttrs,
        opts: &UntarOptions,
    ) -> Result<(), ArchiveError> {
        fs.create_dir(path, &attrs, opts)?;

        let mut children = 0u64;
        loop {
            let (size, magic) = self.read_header()?;
            match magic {
                FILENAME_MAGIC => {
                    let name = self.read_string(size - HEADER_SIZE)?;
                    validate_name(&name)?;
                    self.decode_child(fs, &path.join(&name), opts)?;
                    children += 1;
                }
                GOODBYE_MAGIC => return self.read_goodbye(size, children),
                other => {
                    return Err(ArchiveError::InvalidArchive(format!(
                        "unexpected element {other:#018x} in directory"
                    )));
                }
            }
        }
    }

    fn decode_child(
        &mut self,
        fs: &mut dyn UntarFilesystem,
        path: &Path,
        opts: &UntarOptions,
    ) -> Result<(), ArchiveError> {
        let attrs = self.read_entry()?;
        let attrs = self.read_xattrs(attrs)?;

        match attrs.file_type() {
            mode::DIRECTORY => self.decode_dir(fs, path, attrs, opts),
            mode::FILE => {
                let (size, magic) = self.read_header()?;
                if magic != PAYLOAD_MAGIC {
                    return Err(ArchiveError::InvalidArchive(format!(
                        "expected payload element, got {magic:#018x}"
                    )));
                }
                let len = size - HEADER_SIZE;
                let mut data = (&mut self.r).take(len);
                fs.create_file(path, &attrs, len, &mut data, opts)?;
                // The target may not have consumed everything.
                std::io::copy(&mut data, &mut std::io::sink())?;
                Ok(())
            }
            mode::SYMLINK => {
                let (size, magic) = self.read_header()?;
                if magic != SYMLINK_MAGIC {
                    return Err(ArchiveError::InvalidArchive(format!(
                        "expected symlink element, got {magic:#018x}"
                    )));
                }
                let target = self.read_string(size - HEADER_SIZE)?;
                fs.create_symlink(path, &attrs, &target, opts)
            }
            mode::BLOCK_DEVICE | mode::CHAR_DEVICE => {
                let (size, magic) = self.read_header()?;
                if magic != DEVICE_MAGIC || size != HEADER_SIZE + 16 {
                    return Err(ArchiveError::InvalidArchive(format!(
                        "expected device element, got {magic:#018x} size {size}"
                    )));
                }
                let major = self.read_u64()?;
                let minor = self.read_u64()?;
                fs.create_device(path, &attrs, major, minor, opts)
            }
            mode::FIFO | mode::SOCKET => fs.create_device(path, &attrs, 0, 0, opts),
            other => Err(ArchiveError::InvalidArchive(format!(
                "unknown file type {other:o}"
            ))),
        }
    }

    /// Validate the Goodbye element closing a directory: the item
    /// count must match the children decoded in stream order, and the
    /// final item must be the tail marker.
    fn read_goodbye(&mut self, size: u64, children: u64) -> Result<(), ArchiveError> {
        let body = size - HEADER_SIZE;
        if body % GOODBYE_ITEM_SIZE != 0 {
            return Err(ArchiveError::InvalidArchive(format!(
                "goodbye body size {body} not a multiple of {GOODBYE_ITEM_SIZE}"
            )));
        }
        let items = body / GOODBYE_ITEM_SIZE;
        if items != children + 1 {
            return Err(ArchiveError::InvalidArchive(format!(
                "goodbye lists {} entries, directory has {children}",
                items.saturating_sub(1)
            )));
        }
        let mut tail_hash = 0;
        for _ in 0..items {
            let _offset = self.read_u64()?;
            let _item_size = self.read_u64()?;
            tail_hash = self.read_u64()?;
        }
        if tail_hash != GOODBYE_TAIL_MARKER {
            return Err(ArchiveError::InvalidArchive(format!(
                "bad goodbye tail marker {tail_hash:#018x}"
            )));
        }
        Ok(())
    }

    fn expect_eof(&mut self) -> Result<(), ArchiveError> {
        let mut buf = [0u8; 1];
        match self.r.read(&mut buf)? {
            0 => Ok(()),
            _ => Err(ArchiveError::InvalidArchive(
                "trailing data after archive".to_string(),
            )),
        }
    }
}

fn validate_name(name: &str) -> Result<(), ArchiveError> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(ArchiveError::InvalidArchive(format!(
            "illegal file name {name:?}"
        )));
    }
    Ok(())
}
