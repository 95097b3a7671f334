//! # F1 Generation
//!
//! Seeds the pipeline: expands the plot identity into table 1's bucketed
//! `(y, x)` entries. A ChaCha8 keystream over the derived key is treated
//! as a sequence of k-bit candidate y values addressed by x; each worker
//! generates the keystream blocks covering its x range, classifies each
//! candidate into a destination bucket by its top bits, and the team
//! scatters and bit-packs the round through the [`BitBucketWriter`].
//!
//! Generation proceeds in `B` rounds of `ceil(2^k / B)` consecutive x
//! values so one round's buffers fit the work arena regardless of k.
//! Worker x ranges are not cipher-block aligned; a worker entering
//! mid-block consumes the keystream at the matching intra-block offset,
//! which keeps the produced entry set identical for every thread count.

use parking_lot::Mutex;
use rand_chacha::rand_core::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::config::{CIPHER_BLOCK_BITS, CIPHER_BLOCK_BYTES, K_EXTRA_BITS, PLOT_ID_LEN};
use crate::io::bits::bits_at;
use crate::io::file_set::{FileId, RawFile};
use crate::io::queue::{DiskQueue, Fence};
use crate::io::BitBucketWriter;
use crate::pipeline::job::{run_jobs, CountBoard, SharedSlice};
use crate::pipeline::manifest::{StreamLayout, StreamManifest};
use crate::pipeline::tables::f1_entry_bits;

/// Derives the F1 cipher key: `0x01 || plot_id[0..31]`.
pub fn f1_key(plot_id: &[u8; PLOT_ID_LEN]) -> [u8; 32] {
    let mut key = [0u8; 32];
    key[0] = 0x01;
    key[1..].copy_from_slice(&plot_id[..PLOT_ID_LEN - 1]);
    key
}

pub struct F1Config {
    pub k: u32,
    pub bucket_count: u32,
    pub thread_count: u32,
    pub plot_id: [u8; PLOT_ID_LEN],
}

/// Parallel F1 generator writing packed `(y || x)` records to the `y0`
/// file set.
pub struct F1Generator<'a, F: RawFile> {
    cfg: F1Config,
    queue: &'a DiskQueue<F>,
}

impl<'a, F: RawFile + 'static> F1Generator<'a, F> {
    pub fn new(cfg: F1Config, queue: &'a DiskQueue<F>) -> Self {
        debug_assert_eq!(cfg.bucket_count, queue.bucket_count());
        Self { cfg, queue }
    }

    /// Generates all `2^k` entries and returns the write manifest for the
    /// produced `y0` stream.
    pub fn run(&self) -> StreamManifest {
        let k = self.cfg.k;
        let buckets = self.cfg.bucket_count as usize;
        let team = self.cfg.thread_count as usize;

        let y_bits = k + K_EXTRA_BITS;
        let entry_bits = f1_entry_bits(k) as u64;
        let entries_per_block = (CIPHER_BLOCK_BITS / k) as u64;
        let total_entries = 1u64 << k;
        let entries_per_round = total_entries.div_ceil(self.cfg.bucket_count as u64);
        let bucket_shift = k - self.cfg.bucket_count.ilog2();
        let x_shift = k - K_EXTRA_BITS;
        let y_mask = (1u64 << y_bits) - 1;

        let key = f1_key(&self.cfg.plot_id);
        let writer = BitBucketWriter::new(self.queue, FileId::Y0);
        let manifest = Mutex::new(StreamManifest::new(
            FileId::Y0,
            self.cfg.bucket_count,
            StreamLayout::PaddedExtents,
        ));

        // Round-sized scatter arrays shared by the team; the prefix sum
        // hands each worker disjoint windows into them.
        let mut y_storage = vec![0u64; entries_per_round as usize];
        let mut x_storage = vec![0u64; entries_per_round as usize];
        let mut board_storage = vec![0u64; team * buckets];
        let ys = SharedSlice::new(&mut y_storage);
        let xs = SharedSlice::new(&mut x_storage);
        let board = CountBoard::new(&mut board_storage, team, buckets);

        run_jobs(team, |ctx| {
            let mut cipher = ChaCha8Rng::from_seed(key);
            let mut blocks: Vec<u8> = Vec::new();
            let mut counts = vec![0u64; buckets];

            let mut remaining = total_entries;
            let mut next_x = 0u64;

            for round in 0..self.cfg.bucket_count {
                let round_entries = entries_per_round.min(remaining);
                let per_worker = round_entries / team as u64;
                let my_start = next_x + per_worker * ctx.id as u64;
                let my_count = if ctx.id == team - 1 {
                    round_entries - per_worker * (team as u64 - 1)
                } else {
                    per_worker
                };

                // Generate the keystream blocks covering [my_start,
                // my_start + my_count). The range may begin mid-block.
                let first_block = my_start / entries_per_block;
                let block_offset = (my_start % entries_per_block) as usize;
                let block_count =
                    (block_offset as u64 + my_count).div_ceil(entries_per_block) as usize;
                blocks.clear();
                blocks.resize(block_count * CIPHER_BLOCK_BYTES, 0);
                if my_count > 0 {
                    cipher.set_word_pos(first_block as u128 * 16);
                    cipher.fill_bytes(&mut blocks);
                }

                let candidate = |i: usize| -> u64 {
                    let entry = block_offset + i;
                    let bit = (entry as u64 / entries_per_block) * CIPHER_BLOCK_BITS as u64
                        + (entry as u64 % entries_per_block) * k as u64;
                    bits_at(&blocks, bit as usize, k)
                };

                counts.fill(0);
                for i in 0..my_count as usize {
                    counts[(candidate(i) >> bucket_shift) as usize] += 1;
                }
                board.publish(ctx.id, &counts);
                ctx.sync();

                let windows = board.windows(ctx.id);
                if ctx.is_control() {
                    let bits: Vec<u64> =
                        windows.totals.iter().map(|&c| c * entry_bits).collect();
                    writer.begin(&bits);
                }
                ctx.sync();

                // Scatter into the shared round arrays at this worker's
                // per-bucket windows.
                let mut cursors = windows.starts.clone();
                for i in 0..my_count as usize {
                    let x = my_start + i as u64;
                    let y_raw = candidate(i);
                    let bucket = (y_raw >> bucket_shift) as usize;
                    let y = ((y_raw << K_EXTRA_BITS) | (x >> x_shift)) & y_mask;

                    let dst = cursors[bucket] as usize;
                    cursors[bucket] += 1;
                    // SAFETY: prefix-sum windows are disjoint across
                    // workers.
                    unsafe {
                        ys.write(dst, y);
                        xs.write(dst, x);
                    }
                }
                ctx.sync();

                // Bit-pack this worker's slice of every bucket.
                for bucket in 0..buckets {
                    let count = counts[bucket];
                    if count == 0 {
                        continue;
                    }
                    let mut cursor = writer
                        .writer_for(bucket as u32, windows.local_start(bucket) * entry_bits);
                    let base = windows.starts[bucket] as usize;
                    for i in 0..count as usize {
                        // SAFETY: scatter finished behind the barrier.
                        let (y, x) = unsafe { (ys.get(base + i), xs.get(base + i)) };
                        cursor.write(y, y_bits);
                        cursor.write(x, k);
                    }
                }
                ctx.sync();

                if ctx.is_control() {
                    let bytes = writer.submit();
                    manifest.lock().record_round(&windows.totals, &bytes);
                    self.queue.complete_pending_releases();
                    debug!(round, "f1 round submitted");
                }

                remaining -= round_entries;
                next_x += round_entries;
            }
        });

        let bytes = writer.submit_leftovers();
        manifest
            .lock()
            .record_round(&vec![0; buckets], &bytes);

        let fence = Fence::new();
        self.queue.add_fence(&fence);
        self.queue.commit();
        fence.wait();

        manifest.into_inner()
    }
}
