//! # Work Heap Management
//!
//! This module provides the scratch memory arena backing all pipeline I/O
//! buffers. The plotter reserves one large block-aligned region up front and
//! lends sub-buffers out of it, so steady-state plotting performs no heap
//! allocation at all.
//!
//! ## Architecture
//!
//! The arena is shared between exactly two roles:
//!
//! ```text
//! +----------------------------------------------------------+
//! |                     Work Arena                            |
//! |   (one contiguous, block-aligned reservation)             |
//! +----------------------------------------------------------+
//!      ^                                          |
//!      | alloc() / complete_pending_releases()    | release()
//!      |   (producer thread)                      v (dispatch thread)
//! +-----------+                            +--------------+
//! | pipeline  | --- buffers via commands ->| I/O dispatcher|
//! +-----------+                            +--------------+
//! ```
//!
//! The producer allocates and fills buffers, then threads their addresses
//! through I/O commands. The dispatch thread is the only caller of
//! [`WorkHeap::release`], which it invokes when it executes the matching
//! `ReleaseBuffer` command — after every command that reads the buffer has
//! already run.
//!
//! ## Enforcement Model
//!
//! Allocation blocks rather than fails: when the arena has no fitting free
//! span, `alloc` waits for the dispatcher to release buffers. Back-pressure
//! for the whole pipeline falls out of this — total outstanding I/O bytes
//! are bounded by the arena size.

mod heap;

pub use heap::{HeapStats, WorkBuffer, WorkHeap};
