//! Epoch-durable write-ahead log engine for mixed NVDIMM/SSD storage.
//!
//! Client threads append log bytes tagged with a monotonically advancing
//! epoch; once an epoch is reported durable, every byte tagged with it
//! (or any earlier epoch) survives crashes. Data moves through a
//! pipeline: per-writer ring buffers, a flusher thread copying into
//! memory-mapped NVDIMM segments, an fsyncer thread sealing full
//! segments onto disk, and a page-indexed metadata store mapping each
//! epoch to its byte range. Cursors read ranges back from either tier.

pub mod circular;
pub mod config;
pub mod control;
pub mod cursor;
pub mod epoch;
pub mod error;
mod flusher;
mod fsyncer;
pub mod layout;
pub mod mds;
pub mod mmap;
pub mod pmem;
mod segment;
pub mod state;
mod wal;
pub mod writer;

pub use config::{Config, InitMode};
pub use cursor::LogCursor;
pub use epoch::{Epoch, INVALID_EPOCH};
pub use error::{Error, Result};
pub use mds::EpochMetadata;
pub use wal::Wal;
pub use writer::WriterHandle;

/// On-media format version; bumped whenever the NV or disk layout
/// changes incompatibly.
pub fn version() -> u32 {
    control::FORMAT_VERSION
}
