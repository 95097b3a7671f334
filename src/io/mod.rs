//! # I/O Subsystem
//!
//! Everything between the pipeline and the disk lives here:
//!
//! - [`file_set`]: per-`(FileId, bucket)` scratch streams, optionally
//!   opened for direct I/O, plus the [`RawFile`] seam test doubles plug
//!   into.
//! - [`queue`]: the bounded command ring and its single dispatch thread —
//!   the sole owner of file handles and the heap's release side.
//! - [`bits`]: MSB-first bit stream cursors shared by every packed format.
//! - [`bit_bucket`]: per-bucket bit-packed submission with sub-byte carry
//!   (the F1 write path).
//! - [`stream`]: block-aligned multi-bucket regions submitted as one
//!   `WriteBuckets` batch with sub-block tail carry (the Fx write path).
//!
//! ## Ordering Model
//!
//! Producers stage commands and `commit()`; the dispatch thread executes
//! them strictly in order. Buffer lifetimes follow the command stream: a
//! buffer lent by the work heap is referenced by address in one or more
//! commands and reclaimed when its `ReleaseBuffer` command — enqueued
//! last — executes.

pub mod bit_bucket;
pub mod bits;
pub mod file_set;
pub mod queue;
pub mod stream;

pub use bit_bucket::BitBucketWriter;
pub use bits::{bits_to_bytes, round_up_to, BitPacker, BitReader, BitWriter};
pub use file_set::{open_file_sets, FileId, FileSet, FileStream, RawFile, SeekOrigin};
pub use queue::{Command, DiskQueue, Fence};
pub use stream::StreamWriter;
