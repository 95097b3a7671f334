//! # Harrow Configuration Constants
//!
//! This module centralizes all configuration constants, grouping
//! interdependent values together and documenting their relationships.
//! Constants that depend on each other are co-located to prevent mismatch
//! bugs.
//!
//! ## Dependency Graph
//!
//! ```text
//! K_EXTRA_BITS (6)
//!       │
//!       ├─> y width per table = k + K_EXTRA_BITS (k for the final table)
//!       │
//!       └─> MIN_BUCKET_COUNT / MAX_BUCKET_COUNT
//!             The bucket index is the top log2(B) bits of y, so log2(B)
//!             must never exceed the y width of any table. With
//!             MIN_PLOT_K = 12 and MAX_BUCKET_COUNT = 1024 (10 bits) this
//!             holds for every table including the final k-bit one.
//!
//! CIPHER_BLOCK_BITS (512)
//!       │
//!       └─> F1 entries per cipher block = CIPHER_BLOCK_BITS / k
//!             The generator addresses the keystream by block index, so
//!             the block width is part of the on-disk determinism contract.
//!
//! COMMAND_QUEUE_CAPACITY (256)
//!       │
//!       └─> DISPATCH_BATCH_SIZE (must be <=)
//!             The dispatcher drains up to one batch per wakeup. A batch
//!             larger than the ring would never fill and the drain loop
//!             would stall producers for no benefit.
//! ```
//!
//! ## Critical Invariants
//!
//! These invariants are enforced by compile-time assertions:
//!
//! 1. `DISPATCH_BATCH_SIZE <= COMMAND_QUEUE_CAPACITY`
//! 2. `MAX_PLOT_K <= 32` (meta components are carried as `u64` pairs of at
//!    most `2k` bits each)
//! 3. `MAX_BUCKET_COUNT` is a power of two no wider than `MIN_PLOT_K` bits
//!
//! ## Usage
//!
//! Import constants from this module rather than defining them locally:
//!
//! ```ignore
//! use crate::config::{K_EXTRA_BITS, COMMAND_QUEUE_CAPACITY};
//! ```

// ============================================================================
// PLOT FORMAT CONSTANTS
// These define the fundamental entry layout and are part of the scratch-file
// format; changing them invalidates any plot in progress
// ============================================================================

/// Extra bits appended to each k-bit y value for finer bucketing.
/// Every table except the last sorts on `k + K_EXTRA_BITS` wide keys.
pub const K_EXTRA_BITS: u32 = 6;

/// Width of one stream-cipher block in bits (ChaCha8, 64-byte blocks).
/// F1 extracts `CIPHER_BLOCK_BITS / k` candidate y values per block.
pub const CIPHER_BLOCK_BITS: u32 = 512;

/// Width of one stream-cipher block in bytes.
pub const CIPHER_BLOCK_BYTES: usize = (CIPHER_BLOCK_BITS / 8) as usize;

/// Length of a plot identity in bytes. The F1 cipher key is derived from it.
pub const PLOT_ID_LEN: usize = 32;

/// Smallest supported plot size exponent.
/// Small plots are only useful for testing; k = 12 keeps every test table
/// in the kilobyte range while exercising all bit-packing paths.
pub const MIN_PLOT_K: u32 = 12;

/// Largest supported plot size exponent.
/// Meta values are carried as pairs of u64 components of at most 2k bits
/// each, which caps k at 32.
pub const MAX_PLOT_K: u32 = 32;

const _: () = assert!(MAX_PLOT_K <= 32, "meta components must fit in u64");

// ============================================================================
// BUCKET LIMITS
// Every per-bucket array in the pipeline is sized by these
// ============================================================================

/// Minimum number of buckets. Must be a power of two.
pub const MIN_BUCKET_COUNT: u32 = 8;

/// Maximum number of buckets. Must be a power of two.
/// log2(MAX_BUCKET_COUNT) may not exceed MIN_PLOT_K, or the final table's
/// k-bit y values could not carry a bucket index.
pub const MAX_BUCKET_COUNT: u32 = 1024;

const _: () = assert!(MIN_BUCKET_COUNT.is_power_of_two());
const _: () = assert!(MAX_BUCKET_COUNT.is_power_of_two());
const _: () = assert!(
    MAX_BUCKET_COUNT.ilog2() <= MIN_PLOT_K,
    "bucket index must fit in the final table's k-bit y"
);

// ============================================================================
// COMMAND QUEUE CONFIGURATION
// These control how far the producer may run ahead of the dispatcher
// ============================================================================

/// Capacity of the I/O command ring. When full, producers block until the
/// dispatcher drains a batch.
pub const COMMAND_QUEUE_CAPACITY: usize = 256;

/// Maximum number of commands the dispatcher drains per wakeup.
pub const DISPATCH_BATCH_SIZE: usize = 64;

const _: () = assert!(
    DISPATCH_BATCH_SIZE <= COMMAND_QUEUE_CAPACITY,
    "a dispatch batch larger than the ring can never fill"
);

// ============================================================================
// WORK HEAP CONFIGURATION
// Scratch arena sizing for I/O buffers
// ============================================================================

/// Default work arena size as a percentage of available system RAM, used
/// when the caller does not size the arena explicitly.
pub const DEFAULT_ARENA_PERCENT: usize = 25;

/// Minimum work arena size in bytes. The pipeline needs room for at least
/// two rounds of bucket buffers to overlap compute with I/O.
pub const MIN_ARENA_FLOOR: usize = 4 * 1024 * 1024;

/// Fallback block size when the platform cannot report one (and the unit
/// of alignment for buffered I/O paths).
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

// ============================================================================
// WORKER LIMITS
// ============================================================================

/// Maximum number of pipeline worker threads.
pub const MAX_WORKER_THREADS: u32 = 256;
