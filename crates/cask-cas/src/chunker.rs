//! Content-defined chunking with a rolling buzhash.
//!
//! The chunker scans a byte stream with a 32-bit buzhash over a
//! 48-byte window and cuts a chunk at the first position past `min`
//! where the hash satisfies the boundary predicate, forcing a cut at
//! `max` when no boundary is found. Because boundaries depend only on
//! the bytes inside the window, inserting or deleting data shifts the
//! chunk sequence locally instead of re-cutting the whole stream.
//!
//! **Parameters must never change for a given store**, otherwise the
//! same data produces different chunk boundaries and deduplication
//! breaks.

use std::io::Read;

use bytes::Bytes;

use crate::table::buzhash_table;

/// Width of the rolling hash window in bytes.
pub const CHUNKER_WINDOW_SIZE: usize = 48;

/// Derive the boundary discriminator from the average chunk size.
///
/// This is the empirically corrected mapping used by the casync
/// format; a plain `avg` discriminator would skew the mean chunk size
/// because cut opportunities below `min` are discarded.
pub fn discriminator_from_avg(avg: u64) -> u32 {
    (avg as f64 / (-1.42888852e-7 * avg as f64 + 1.33237515)) as u32
}

/// Streaming content-defined chunker.
///
/// Reads lazily from the underlying reader and yields `(start, data)`
/// pairs, buffering at most `max + window` bytes. The final chunk is
/// whatever remains and may be shorter than `min`.
pub struct Chunker<R> {
    reader: R,
    min: usize,
    avg: usize,
    max: usize,
    discriminator: u32,
    buf: Vec<u8>,
    start: u64,
    eof: bool,
}

impl<R: Read> Chunker<R> {
    /// Create a chunker over `reader` with the given size bounds.
    ///
    /// # Panics
    ///
    /// Panics unless `window <= min <= avg <= max`.
    pub fn new(reader: R, min: usize, avg: usize, max: usize) -> Self {
        assert!(
            min >= CHUNKER_WINDOW_SIZE,
            "min chunk size must be >= the {CHUNKER_WINDOW_SIZE}-byte hash window (got {min})"
        );
        assert!(min <= avg && avg <= max, "need min <= avg <= max");
        Self {
            reader,
            min,
            avg,
            max,
            discriminator: discriminator_from_avg(avg as u64),
            buf: Vec::with_capacity(max),
            start: 0,
            eof: false,
        }
    }

    /// Minimum chunk size.
    pub fn min(&self) -> usize {
        self.min
    }

    /// Average (target) chunk size.
    pub fn avg(&self) -> usize {
        self.avg
    }

    /// Maximum chunk size.
    pub fn max(&self) -> usize {
        self.max
    }

    /// Produce the next chunk, or `None` at the end of the stream.
    pub fn next_chunk(&mut self) -> std::io::Result<Option<(u64, Bytes)>> {
        self.fill()?;

        if self.buf.is_empty() {
            return Ok(None);
        }
        // Everything below min (or a short tail at EOF) is emitted as-is.
        if self.buf.len() <= self.min {
            return Ok(Some(self.take(self.buf.len())));
        }

        let len = self.find_boundary();
        Ok(Some(self.take(len)))
    }

    /// Top up the buffer to `max` bytes or EOF.
    fn fill(&mut self) -> std::io::Result<()> {
        while !self.eof && self.buf.len() < self.max {
            let old = self.buf.len();
            self.buf.resize(self.max, 0);
            match self.reader.read(&mut self.buf[old..]) {
                Ok(0) => {
                    self.buf.truncate(old);
                    self.eof = true;
                }
                Ok(n) => self.buf.truncate(old + n),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {
                    self.buf.truncate(old);
                }
                Err(e) => {
                    self.buf.truncate(old);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Scan the buffer for the next cut point.
    ///
    /// The hash window is primed so that it ends exactly at position
    /// `min`; the bytes before that are never hashed since no cut can
    /// land there anyway.
    fn find_boundary(&self) -> usize {
        let table = buzhash_table();
        let end = self.buf.len().min(self.max);

        let mut hash: u32 = 0;
        for &b in &self.buf[self.min - CHUNKER_WINDOW_SIZE..self.min] {
            hash = hash.rotate_left(1) ^ table[b as usize];
        }

        let mut len = self.min;
        loop {
            if hash % self.discriminator == self.discriminator - 1 {
                return len;
            }
            if len >= end {
                return end;
            }
            // Slide the window one byte: drop buf[len-48], add buf[len].
            let out = self.buf[len - CHUNKER_WINDOW_SIZE] as usize;
            let inb = self.buf[len] as usize;
            hash = hash.rotate_left(1)
                ^ table[out].rotate_left((CHUNKER_WINDOW_SIZE % 32) as u32)
                ^ table[inb];
            len += 1;
        }
    }

    /// Split off the first `len` buffered bytes as a chunk.
    fn take(&mut self, len: usize) -> (u64, Bytes) {
        let data: Vec<u8> = self.buf.drain(..len).collect();
        let start = self.start;
        self.start += len as u64;
        (start, Bytes::from(data))
    }
}

impl<R: Read> Iterator for Chunker<R> {
    type Item = std::io::Result<(u64, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_chunk().transpose()
    }
}
