//! Segmented, offset-addressed commit log.
//!
//! A [`Log`] is an ordered list of [`segment::Segment`]s. Each segment pairs an
//! append-only [`store::Store`] of length-prefixed records with a memory-mapped
//! [`index::Index`] from relative offset to store position. Segments are named
//! after their base offset (`<base>.store`, `<base>.index`).

mod commit_log;
pub mod index;
pub mod record;
pub mod segment;
pub mod store;

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};

pub use commit_log::{Log, LogReader};
pub use record::Record;

pub const DEFAULT_MAX_STORE_BYTES: u64 = 1024;
pub const DEFAULT_MAX_INDEX_BYTES: u64 = 1024;

/// Segment limits and the offset a fresh log starts at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    pub max_store_bytes: u64,
    pub max_index_bytes: u64,
    pub initial_offset: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_store_bytes: DEFAULT_MAX_STORE_BYTES,
            max_index_bytes: DEFAULT_MAX_INDEX_BYTES,
            initial_offset: 0,
        }
    }
}

impl LogConfig {
    /// Replaces zero limits with the defaults. The index always has room for
    /// at least one entry.
    pub fn normalized(mut self) -> Self {
        if self.max_store_bytes == 0 {
            self.max_store_bytes = DEFAULT_MAX_STORE_BYTES;
        }
        if self.max_index_bytes == 0 {
            self.max_index_bytes = DEFAULT_MAX_INDEX_BYTES;
        }
        self.max_index_bytes = self.max_index_bytes.max(index::ENTRY_WIDTH);
        self
    }
}
