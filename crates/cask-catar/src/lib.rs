//! The catar filesystem-archive codec.
//!
//! A catar stream is a self-describing, deterministic serialization of
//! a directory tree: typed, length-prefixed elements for node
//! attributes, names, file payloads, symlinks, and devices, with each
//! directory closed by a Goodbye element — a binary search tree over
//! name hashes enabling random-access lookup. [`tar`] encodes a tree,
//! [`untar`] streams one back out through an [`UntarFilesystem`]
//! implementation ([`LocalFs`] for the disk, [`NullFs`] for
//! statistics).
//!
//! Archives are typically chunked like any other blob; the resulting
//! index then describes the whole tree.

mod decoder;
mod encoder;
mod error;
pub mod format;
mod fs;

pub use decoder::{UntarFilesystem, UntarOptions, untar};
pub use encoder::tar;
pub use error::ArchiveError;
pub use format::NodeAttrs;
pub use fs::{LocalFs, NullFs};
