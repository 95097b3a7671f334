//! # Harrow - Bucketed Disk Plotting Pipeline
//!
//! Harrow builds the scratch tables of a proof-of-space plot by streaming
//! hundreds of gibibytes through a bucketed external-sort pipeline. This
//! implementation prioritizes:
//!
//! - **One writer, one ordering**: a single dispatch thread owns every
//!   file handle; the command stream is the authoritative order of all
//!   disk effects
//! - **Zero steady-state allocation**: all I/O buffers come from one
//!   pre-reserved, block-aligned work arena
//! - **Direct I/O throughout**: every write length and file offset is a
//!   device-block multiple when `O_DIRECT` is on
//!
//! ## Quick Start
//!
//! ```ignore
//! use harrow::{PlotConfig, Plotter};
//!
//! let plotter = Plotter::create(PlotConfig {
//!     plot_id,
//!     k: 32,
//!     bucket_count: 64,
//!     thread_count: 8,
//!     arena_size: 0, // auto-size from system memory
//!     use_direct_io: true,
//!     work_dir: "/mnt/scratch/plot1".into(),
//! })?;
//!
//! let t1 = plotter.run_f1()?;
//! // ... sort + match each bucket (external), then per table:
//! let stage = plotter.fx_stage(TableId::Table1);
//! for bucket in inputs {
//!     stage.run_bucket(&bucket)?;
//! }
//! let t2 = stage.finish();
//! ```
//!
//! ## Architecture
//!
//! Data flows one way per table:
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │        Plotter (stage orchestration)     │
//! ├─────────────────────────────────────────┤
//! │  F1 generator      │  Fx evaluator +    │
//! │  (ChaCha8 stream)  │  bucket distributor│
//! ├────────────────────┴────────────────────┤
//! │  Worker team: count → prefix sum →      │
//! │  scatter into bit-packed bucket regions │
//! ├─────────────────────────────────────────┤
//! │  BitBucketWriter / StreamWriter         │
//! │  (carry-preserving bucketed output)     │
//! ├─────────────────────────────────────────┤
//! │  Command queue → dispatch thread        │
//! ├─────────────────────────────────────────┤
//! │  Scratch files  │  Work arena (heap)    │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Scratch Layout
//!
//! Each logical stream owns one file per bucket under the work directory:
//!
//! ```text
//! work_dir/
//! ├── y0_0.tmp ... y0_63.tmp        # y stream, even tables
//! ├── y1_0.tmp ... y1_63.tmp        # y stream, odd tables
//! ├── meta_a0_*.tmp / meta_a1_*.tmp # first meta component
//! ├── meta_b0_*.tmp / meta_b1_*.tmp # second meta component
//! └── x_*.tmp                       # stage-1 x stream (sorter's input)
//! ```
//!
//! Files are raw bit-packed entry streams with no header; the in-memory
//! [`pipeline::StreamManifest`] records what each extent holds.
//!
//! ## Module Overview
//!
//! - [`config`]: centralized constants with dependency documentation
//! - [`memory`]: the bounded block-aligned work arena
//! - [`io`]: file sets, the command queue and dispatch thread, bit-packed
//!   writers
//! - [`pipeline`]: table shapes, worker coordination, F1 and Fx stages
//! - [`plotter`]: validated configuration and stage orchestration

pub mod config;
pub mod io;
pub mod memory;
pub mod pipeline;
pub mod plotter;

pub use io::{DiskQueue, Fence, FileId};
pub use pipeline::{FxInput, FxOutput, FxStage, Pair, StreamManifest, TableId};
pub use plotter::{PlotConfig, Plotter};
