//! The catar element framing.
//!
//! An archive is a stream of little-endian elements
//! `{size: u64, type: u64, body}` where `size` includes the 16-byte
//! header. A directory serializes as its Entry, each child as a
//! Filename element followed by the child's own encoding, and finally
//! a Goodbye element: an array of `{offset, size, hash}` items laid
//! out as a complete binary search tree over the SipHash of each
//! child's name, closed by a tail marker item. The BST gives decoders
//! O(log n) name lookup without scanning the directory.

use std::collections::BTreeMap;
use std::hash::Hasher;

use siphasher::sip::SipHasher24;

use crate::error::ArchiveError;

/// Magic for the node attributes element.
pub const ENTRY_MAGIC: u64 = 0x1396_fabc_ea5b_bb51;
/// Magic for an extended attribute element.
pub const XATTR_MAGIC: u64 = 0xb815_7091_f80b_c486;
/// Magic for a child name element.
pub const FILENAME_MAGIC: u64 = 0x6dbb_6ebc_b316_1f0b;
/// Magic for regular file contents.
pub const PAYLOAD_MAGIC: u64 = 0x8b9e_1d93_d6dc_ffc9;
/// Magic for a symlink target element.
pub const SYMLINK_MAGIC: u64 = 0x664a_6fb6_830e_0d6c;
/// Magic for a device node element.
pub const DEVICE_MAGIC: u64 = 0xac3d_ace3_69df_e643;
/// Magic for the directory-closing Goodbye element.
pub const GOODBYE_MAGIC: u64 = 0xdfd3_5c5e_8327_c403;
/// Hash value marking the final Goodbye item.
pub const GOODBYE_TAIL_MARKER: u64 = 0x5744_6fa5_3370_2943;

/// Fixed key for the SipHash-2-4 over child names in Goodbye items.
pub const GOODBYE_HASH_KEY: [u8; 16] = [
    0x85, 0x74, 0x44, 0x2b, 0x0f, 0x1d, 0x84, 0xb3, 0x27, 0x36, 0xed, 0x30, 0xd1, 0xc2, 0x2e,
    0xc1,
];

/// Size of an element header (`size` + `type`).
pub const HEADER_SIZE: u64 = 16;
/// Size of a complete Entry element.
pub const ENTRY_SIZE: u64 = 64;
/// Size of one Goodbye item.
pub const GOODBYE_ITEM_SIZE: u64 = 24;

/// File-type bits of an entry mode, POSIX layout.
pub mod mode {
    /// Mask selecting the file-type bits.
    pub const FMT: u64 = 0o170000;
    pub const SOCKET: u64 = 0o140000;
    pub const SYMLINK: u64 = 0o120000;
    pub const FILE: u64 = 0o100000;
    pub const BLOCK_DEVICE: u64 = 0o060000;
    pub const DIRECTORY: u64 = 0o040000;
    pub const CHAR_DEVICE: u64 = 0o020000;
    pub const FIFO: u64 = 0o010000;
    /// Mask selecting the permission bits.
    pub const PERMISSIONS: u64 = 0o7777;
}

/// Default feature flags for archives written by this implementation.
pub fn default_feature_flags() -> u64 {
    use cask_cas::index::flags;
    flags::WITH_32BIT_UIDS
        | flags::WITH_NSEC_TIME
        | flags::WITH_PERMISSIONS
        | flags::WITH_SYMLINKS
        | flags::WITH_DEVICE_NODES
        | flags::WITH_FIFOS
        | flags::WITH_SOCKETS
        | flags::WITH_XATTRS
        | cask_cas::index::digest_flag()
}

/// Validate the feature flags of an incoming archive.
pub fn check_feature_flags(flags: u64) -> Result<(), ArchiveError> {
    let unknown = flags & !cask_cas::index::flags::SUPPORTED;
    if unknown != 0 {
        return Err(ArchiveError::UnsupportedFormat { flags: unknown });
    }
    Ok(())
}

/// SipHash-2-4 of a child name under the fixed Goodbye key.
pub fn goodbye_hash(name: &str) -> u64 {
    let mut hasher = SipHasher24::new_with_key(&GOODBYE_HASH_KEY);
    hasher.write(name.as_bytes());
    hasher.finish()
}

/// Attributes common to every archived node.
///
/// `mode` carries both the file-type bits and the permissions; the
/// mtime is nanoseconds since the epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeAttrs {
    pub mode: u64,
    pub uid: u64,
    pub gid: u64,
    pub mtime_nsec: u64,
    /// Extended attributes, sorted by key.
    pub xattrs: BTreeMap<String, Vec<u8>>,
}

impl NodeAttrs {
    /// The file-type bits of the mode.
    pub fn file_type(&self) -> u64 {
        self.mode & mode::FMT
    }

    /// The permission bits of the mode.
    pub fn permissions(&self) -> u64 {
        self.mode & mode::PERMISSIONS
    }
}

/// One back-reference in a Goodbye element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GoodbyeItem {
    /// Distance from the Goodbye element start back to the child's
    /// Filename element.
    pub offset: u64,
    /// Byte size of the child's complete encoding.
    pub size: u64,
    /// SipHash of the child's name (or the tail marker).
    pub hash: u64,
}

/// Arrange items sorted by hash into complete-BST array order, where
/// node `i` has children `2i+1` and `2i+2`.
pub fn arrange_bst(mut items: Vec<GoodbyeItem>) -> Vec<GoodbyeItem> {
    items.sort_unstable_by_key(|item| item.hash);
    let mut out = vec![
        GoodbyeItem {
            offset: 0,
            size: 0,
            hash: 0
        };
        items.len()
    ];
    let mut next = 0;
    fill_in_order(&items, &mut out, 0, &mut next);
    out
}

fn fill_in_order(sorted: &[GoodbyeItem], out: &mut [GoodbyeItem], node: usize, next: &mut usize) {
    if node >= out.len() {
        return;
    }
    fill_in_order(sorted, out, 2 * node + 1, next);
    out[node] = sorted[*next];
    *next += 1;
    fill_in_order(sorted, out, 2 * node + 2, next);
}

/// Search a BST-ordered Goodbye array for a name.
pub fn bst_find(items: &[GoodbyeItem], name: &str) -> Option<GoodbyeItem> {
    let hash = goodbye_hash(name);
    let mut node = 0;
    while node < items.len() {
        let item = items[node];
        node = match hash.cmp(&item.hash) {
            std::cmp::Ordering::Equal => return Some(item),
            std::cmp::Ordering::Less => 2 * node + 1,
            std::cmp::Ordering::Greater => 2 * node + 2,
        };
    }
    None
}
