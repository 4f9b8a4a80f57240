//! Chunk store contracts, backends, and composition.
//!
//! Stores are described by capability traits ([`Store`],
//! [`WriteStore`], [`PruneStore`], [`IndexStore`],
//! [`IndexWriteStore`]) and composed by layering: a [`StoreRouter`]
//! queries ordered backends, a [`FailoverGroup`] provides redundancy
//! between equivalent ones, and a [`Cache`] puts a writable store in
//! front of a slow primary. Backends in-tree: [`LocalStore`],
//! [`MemoryStore`], and HTTP(S) via [`HttpStore`]; other remote
//! backends plug in through [`ObjectTransport`].

mod cache;
mod error;
mod failover;
mod http;
mod local;
pub mod location;
mod memory;
mod remote;
mod router;
mod traits;

pub use cache::Cache;
pub use error::StoreError;
pub use failover::FailoverGroup;
pub use http::{HttpIndexStore, HttpStore, HttpTransport, new_http_store};
pub use local::{
    COMPRESSED_CHUNK_EXT, LocalIndexStore, LocalStore, UNCOMPRESSED_CHUNK_EXT, VerifyResults,
};
pub use memory::MemoryStore;
pub use remote::{ObjectTransport, RemoteStore};
pub use router::StoreRouter;
pub use traits::{IndexStore, IndexWriteStore, PruneStore, Store, WriteStore};
