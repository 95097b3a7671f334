//! # Plotter Orchestration
//!
//! The public entry point: validates a [`PlotConfig`], owns the command
//! queue and work arena, and drives the pipeline stages. The plotter
//! itself holds no file handles — everything on disk is reached through
//! the queue's dispatch thread.
//!
//! A full plot alternates generation and matching per table; matching is
//! outside this crate, so the plotter exposes the two stage drivers
//! individually: [`Plotter::run_f1`] seeds table 1, and
//! [`Plotter::fx_stage`] builds the evaluator/distributor for any
//! subsequent table, fed with the caller's matched pairs.

use std::path::PathBuf;

use eyre::{ensure, Result};
use sysinfo::System;
use tracing::info;

use crate::config::{
    DEFAULT_ARENA_PERCENT, MAX_BUCKET_COUNT, MAX_PLOT_K, MAX_WORKER_THREADS, MIN_ARENA_FLOOR,
    MIN_BUCKET_COUNT, MIN_PLOT_K, PLOT_ID_LEN,
};
use crate::io::bits::bits_to_bytes;
use crate::io::file_set::{FileStream, RawFile};
use crate::io::{open_file_sets, DiskQueue};
use crate::pipeline::manifest::{read_bucket, read_entries, StreamManifest};
use crate::pipeline::tables::{f1_entry_bits, StageShape, TableId};
use crate::pipeline::{F1Config, F1Generator, FxStage};

/// Input configuration for one plot.
#[derive(Debug, Clone)]
pub struct PlotConfig {
    pub plot_id: [u8; PLOT_ID_LEN],
    /// Plot size exponent; table 1 holds `2^k` entries.
    pub k: u32,
    /// Number of buckets, a power of two.
    pub bucket_count: u32,
    /// Pipeline worker threads.
    pub thread_count: u32,
    /// Work arena bytes. Zero selects an automatic size from available
    /// system memory.
    pub arena_size: usize,
    pub use_direct_io: bool,
    pub work_dir: PathBuf,
}

impl PlotConfig {
    /// Sizes the arena from available system memory, mirroring how the
    /// rest of the machine is left alone: a fixed percentage with a hard
    /// floor.
    pub fn auto_arena_size() -> usize {
        let mut sys = System::new();
        sys.refresh_memory();
        let available = sys.available_memory() as usize;
        (available * DEFAULT_ARENA_PERCENT / 100).max(MIN_ARENA_FLOOR)
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            (MIN_PLOT_K..=MAX_PLOT_K).contains(&self.k),
            "plot size k = {} is outside the supported range {}..={}",
            self.k,
            MIN_PLOT_K,
            MAX_PLOT_K
        );
        ensure!(
            self.bucket_count.is_power_of_two()
                && (MIN_BUCKET_COUNT..=MAX_BUCKET_COUNT).contains(&self.bucket_count),
            "bucket count {} must be a power of two in {}..={}",
            self.bucket_count,
            MIN_BUCKET_COUNT,
            MAX_BUCKET_COUNT
        );
        ensure!(
            self.bucket_count.ilog2() <= self.k,
            "bucket count {} needs more than the {} y bits available",
            self.bucket_count,
            self.k
        );
        ensure!(
            (1..=MAX_WORKER_THREADS).contains(&self.thread_count),
            "thread count {} must be in 1..={}",
            self.thread_count,
            MAX_WORKER_THREADS
        );
        Ok(())
    }

    /// Bytes one F1 round needs in flight: the bit-packed round itself
    /// plus per-bucket block rounding.
    fn f1_round_bytes(&self, block_size: usize) -> usize {
        let entries_per_round = (1u64 << self.k).div_ceil(self.bucket_count as u64);
        let round_bits = entries_per_round * f1_entry_bits(self.k) as u64;
        bits_to_bytes(round_bits) + self.bucket_count as usize * block_size
    }
}

/// Owns the queue, heap, and configuration of one plot in progress.
#[derive(Debug)]
pub struct Plotter<F: RawFile = FileStream> {
    cfg: PlotConfig,
    queue: DiskQueue<F>,
}

impl Plotter<FileStream> {
    /// Validates the configuration, opens the scratch files, and starts
    /// the I/O dispatcher.
    pub fn create(cfg: PlotConfig) -> Result<Self> {
        cfg.validate()?;
        let (sets, block_size) =
            open_file_sets(&cfg.work_dir, cfg.bucket_count, cfg.use_direct_io)?;

        let mut cfg = cfg;
        if cfg.arena_size == 0 {
            cfg.arena_size = PlotConfig::auto_arena_size();
        }
        // The pipeline overlaps one round's compute with the previous
        // round's writes, so the arena must hold two rounds.
        let required = (2 * cfg.f1_round_bytes(block_size)).max(MIN_ARENA_FLOOR);
        ensure!(
            cfg.arena_size >= required,
            "work arena of {} bytes is insufficient: k = {} at {} buckets needs at least {}",
            cfg.arena_size,
            cfg.k,
            cfg.bucket_count,
            required
        );

        let queue = DiskQueue::with_file_sets(sets, cfg.arena_size, cfg.use_direct_io)?;
        info!(
            k = cfg.k,
            buckets = cfg.bucket_count,
            threads = cfg.thread_count,
            arena = cfg.arena_size,
            direct_io = cfg.use_direct_io,
            "plotter ready"
        );
        Ok(Self { cfg, queue })
    }
}

impl<F: RawFile + 'static> Plotter<F> {
    /// Builds a plotter over an existing queue. Used by tests to drive
    /// the full pipeline against in-memory file backends.
    pub fn from_parts(cfg: PlotConfig, queue: DiskQueue<F>) -> Result<Self> {
        cfg.validate()?;
        ensure!(
            queue.bucket_count() == cfg.bucket_count,
            "queue has {} buckets, config expects {}",
            queue.bucket_count(),
            cfg.bucket_count
        );
        Ok(Self { cfg, queue })
    }

    pub fn config(&self) -> &PlotConfig {
        &self.cfg
    }

    pub fn queue(&self) -> &DiskQueue<F> {
        &self.queue
    }

    /// Runs F1, producing table 1's bucketed `(y || x)` stream in `y0`.
    pub fn run_f1(&self) -> Result<StreamManifest> {
        info!(k = self.cfg.k, "generating f1");
        let generator = F1Generator::new(
            F1Config {
                k: self.cfg.k,
                bucket_count: self.cfg.bucket_count,
                thread_count: self.cfg.thread_count,
                plot_id: self.cfg.plot_id,
            },
            &self.queue,
        );
        let manifest = generator.run();

        let produced = manifest.total_entries();
        ensure!(
            produced == 1u64 << self.cfg.k,
            "f1 produced {} entries, expected 2^{}",
            produced,
            self.cfg.k
        );
        info!(entries = produced, "f1 complete");
        Ok(manifest)
    }

    /// Builds the Fx stage consuming `source` table entries, with a chunk
    /// size fitted to the work arena.
    pub fn fx_stage(&self, source: TableId) -> FxStage<'_, F> {
        let chunk_entries = self.fx_chunk_entries(StageShape::new(source, self.cfg.k));
        FxStage::new(
            &self.queue,
            source,
            self.cfg.k,
            self.cfg.thread_count,
            chunk_entries,
        )
    }

    /// Reads one bucket's payload bytes back through the queue.
    pub fn read_bucket(
        &self,
        manifest: &StreamManifest,
        bucket: u32,
    ) -> Result<(Vec<u8>, u64)> {
        read_bucket(&self.queue, manifest, bucket)
    }

    /// Decodes one bucket's entries as `field_widths` bit fields each,
    /// flattened in entry order.
    pub fn read_entries(
        &self,
        manifest: &StreamManifest,
        bucket: u32,
        field_widths: &[u32],
    ) -> Result<Vec<u64>> {
        read_entries(&self.queue, manifest, bucket, field_widths)
    }

    /// Entries per Fx chunk such that all output streams of one chunk
    /// take roughly a quarter of the arena, leaving room to overlap with
    /// in-flight writes.
    fn fx_chunk_entries(&self, shape: StageShape) -> usize {
        let record_bits =
            (shape.y_out_bits + shape.out_a_bits + shape.out_b_bits) as usize;
        let streams = 1
            + usize::from(shape.out_a_bits > 0)
            + usize::from(shape.out_b_bits > 0);
        let overhead = streams * self.cfg.bucket_count as usize * self.queue.block_size();

        let budget = (self.cfg.arena_size / 4).saturating_sub(overhead).max(1 << 16);
        (budget * 8 / record_bits.max(1)).clamp(1 << 10, 1 << 22)
    }
}
