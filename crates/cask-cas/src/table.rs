//! The buzhash substitution table.
//!
//! The rolling hash maps every input byte through a fixed table of 256
//! random 32-bit values. The table here is derived deterministically
//! from SHA-512 output of a fixed seed, which keeps chunk boundaries
//! stable across builds and platforms. Boundary compatibility with an
//! external chunker requires using that chunker's table verbatim;
//! swapping the contents of [`buzhash_table`] is the only change
//! needed for that.

use std::sync::OnceLock;

use sha2::{Digest, Sha512};

const TABLE_SEED: &str = "cask buzhash table v1";

static TABLE: OnceLock<[u32; 256]> = OnceLock::new();

/// The 256-entry substitution table used by the rolling hash.
pub(crate) fn buzhash_table() -> &'static [u32; 256] {
    TABLE.get_or_init(|| {
        let mut table = [0u32; 256];
        // Each SHA-512 block yields 16 little-endian u32 values.
        for block in 0..16 {
            let digest = Sha512::digest(format!("{TABLE_SEED} {block}"));
            for i in 0..16 {
                let off = i * 4;
                table[block * 16 + i] = u32::from_le_bytes([
                    digest[off],
                    digest[off + 1],
                    digest[off + 2],
                    digest[off + 3],
                ]);
            }
        }
        table
    })
}
