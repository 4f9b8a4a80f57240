//! The chunk-and-store and reassembly pipelines.
//!
//! [`make`] runs the chunker over an input and persists every new
//! chunk into a write store, emitting the blob's [`Index`]. [`assemble`]
//! reverses it: chunks are fetched concurrently from a composed store,
//! with byte ranges cloned from [`Seed`]s — prior files, or the output
//! file itself — wherever the index allows. [`copy`] replicates chunk
//! sets between stores.
//!
//! [`Index`]: cask_cas::Index

mod assemble;
mod copy;
mod error;
mod fileio;
mod make;
mod seed;
mod self_seed;

pub use assemble::{AssembleStats, assemble, extract, file_seeds};
pub use copy::copy;
pub use error::EngineError;
pub use make::{MakeOptions, make, make_file};
pub use seed::{FileSeed, Seed, SeedSegment};
pub use self_seed::SelfSeed;

#[cfg(test)]
mod tests;
