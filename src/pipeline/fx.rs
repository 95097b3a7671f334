//! # Fx Evaluation and Bucket Distribution
//!
//! Consumes one table's sorted bucket stream plus its matched pairs and
//! produces the next table's bucketed streams. For every pair the stage
//! packs `(y || metaL || metaR)` into a big-endian bit field, hashes it
//! with Blake3, and derives the output entry:
//!
//! - `y'` — the hash's top `k + K_EXTRA_BITS` bits (top `k` for the final
//!   table);
//! - meta — either the concatenation of the input metas (early tables) or
//!   a bit slice of the hash starting right after the y field (later
//!   tables);
//! - destination bucket — the top `log2(B)` bits of `y'`.
//!
//! Workers process disjoint pair ranges in chunks: evaluate into shared
//! scratch, count per destination bucket, run the cooperative prefix sum,
//! then scatter bit-packed records straight into the chunk regions of the
//! per-stream [`StreamWriter`]s. The last chunk's entry count is the exact
//! division remainder, so chunk boundaries never change the output.

use eyre::{ensure, Result};
use parking_lot::Mutex;
use tracing::debug;

use crate::io::bits::{bits_at, bits_to_bytes, BitPacker};
use crate::io::file_set::{FileId, RawFile, SeekOrigin};
use crate::io::queue::{DiskQueue, Fence};
use crate::io::stream::{ChunkView, StreamWriter};
use crate::pipeline::job::{run_jobs, CountBoard, SharedSlice};
use crate::pipeline::manifest::{StreamLayout, StreamManifest};
use crate::pipeline::tables::{StageShape, TableId};

/// A matched pair within a sorted bucket: the right entry sits
/// `right_delta` positions after the left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pair {
    pub left: u32,
    pub right_delta: u16,
}

impl Pair {
    pub fn right(&self) -> u32 {
        self.left + self.right_delta as u32
    }
}

/// One input bucket's sorted streams and its pairs.
pub struct FxInput<'a> {
    pub bucket: u32,
    /// Full-width y values (top `log2 B` bits equal `bucket`).
    pub ys: &'a [u64],
    /// First meta component per entry; `2^k`-scaled widths per the stage
    /// shape. Empty when the stage carries no A component.
    pub meta_a: &'a [u64],
    /// Second meta component per entry; empty when unused.
    pub meta_b: &'a [u64],
    pub pairs: &'a [Pair],
}

/// Manifests of the streams a finished stage produced.
pub struct FxOutput {
    pub y: StreamManifest,
    pub meta_a: Option<StreamManifest>,
    pub meta_b: Option<StreamManifest>,
}

#[derive(Clone)]
struct ViewSet {
    y: ChunkView,
    meta_a: Option<ChunkView>,
    meta_b: Option<ChunkView>,
}

/// One Fx stage: evaluator plus bucket distributor for a single source
/// table, fed one input bucket at a time.
pub struct FxStage<'a, F: RawFile> {
    shape: StageShape,
    bucket_count: u32,
    thread_count: u32,
    chunk_entries: usize,
    queue: &'a DiskQueue<F>,
    y_writer: StreamWriter<'a, F>,
    meta_a_writer: Option<StreamWriter<'a, F>>,
    meta_b_writer: Option<StreamWriter<'a, F>>,
    y_manifest: Mutex<StreamManifest>,
    meta_a_manifest: Mutex<Option<StreamManifest>>,
    meta_b_manifest: Mutex<Option<StreamManifest>>,
}

impl<'a, F: RawFile + 'static> FxStage<'a, F> {
    /// Builds the stage consuming `source` table entries. Output streams
    /// land in the file sets of the destination table's parity.
    pub fn new(
        queue: &'a DiskQueue<F>,
        source: TableId,
        k: u32,
        thread_count: u32,
        chunk_entries: usize,
    ) -> Self {
        assert!(chunk_entries > 0);
        let shape = StageShape::new(source, k);
        let dest = source.next().expect("the final table is not an Fx source");
        let parity = dest.index();
        let bucket_count = queue.bucket_count();

        let y_writer = StreamWriter::new(queue, FileId::y(parity), shape.y_out_bits);
        let meta_a_writer = (shape.out_a_bits > 0)
            .then(|| StreamWriter::new(queue, FileId::meta_a(parity), shape.out_a_bits));
        let meta_b_writer = (shape.out_b_bits > 0)
            .then(|| StreamWriter::new(queue, FileId::meta_b(parity), shape.out_b_bits));

        // The parity ping-pong reuses file sets across tables; rewind the
        // output streams before the first write lands.
        queue.seek_bucket(FileId::y(parity), 0, SeekOrigin::Start);
        if shape.out_a_bits > 0 {
            queue.seek_bucket(FileId::meta_a(parity), 0, SeekOrigin::Start);
        }
        if shape.out_b_bits > 0 {
            queue.seek_bucket(FileId::meta_b(parity), 0, SeekOrigin::Start);
        }
        queue.commit();

        Self {
            shape,
            bucket_count,
            thread_count,
            chunk_entries,
            queue,
            y_manifest: Mutex::new(StreamManifest::new(
                FileId::y(parity),
                bucket_count,
                StreamLayout::Contiguous,
            )),
            meta_a_manifest: Mutex::new(meta_a_writer.as_ref().map(|w| {
                StreamManifest::new(w.file_id(), bucket_count, StreamLayout::Contiguous)
            })),
            meta_b_manifest: Mutex::new(meta_b_writer.as_ref().map(|w| {
                StreamManifest::new(w.file_id(), bucket_count, StreamLayout::Contiguous)
            })),
            y_writer,
            meta_a_writer,
            meta_b_writer,
        }
    }

    pub fn shape(&self) -> StageShape {
        self.shape
    }

    /// Evaluates one input bucket's pairs and streams the derived entries
    /// to their destination buckets.
    pub fn run_bucket(&self, input: &FxInput<'_>) -> Result<()> {
        let shape = self.shape;
        ensure!(
            shape.in_a_bits == 0 || input.meta_a.len() == input.ys.len(),
            "meta A stream has {} entries, y stream has {}",
            input.meta_a.len(),
            input.ys.len()
        );
        ensure!(
            shape.in_b_bits == 0 || input.meta_b.len() == input.ys.len(),
            "meta B stream has {} entries, y stream has {}",
            input.meta_b.len(),
            input.ys.len()
        );
        for pair in input.pairs {
            ensure!(
                (pair.right() as usize) < input.ys.len(),
                "pair ({}, +{}) reaches past the bucket's {} entries",
                pair.left,
                pair.right_delta,
                input.ys.len()
            );
        }
        if input.pairs.is_empty() {
            return Ok(());
        }

        let team = self.thread_count as usize;
        let buckets = self.bucket_count as usize;
        let total = input.pairs.len();
        let chunk_cap = self.chunk_entries.min(total);
        let chunk_count = total.div_ceil(self.chunk_entries);

        // Chunk-local scratch shared by the team.
        let mut y_scratch = vec![0u64; chunk_cap];
        let mut a_scratch = vec![0u64; chunk_cap];
        let mut b_scratch = vec![0u64; chunk_cap];
        let mut bucket_scratch = vec![0u16; chunk_cap];
        let mut board_storage = vec![0u64; team * buckets];

        let y_tmp = SharedSlice::new(&mut y_scratch);
        let a_tmp = SharedSlice::new(&mut a_scratch);
        let b_tmp = SharedSlice::new(&mut b_scratch);
        let bucket_tmp = SharedSlice::new(&mut bucket_scratch);
        let board = CountBoard::new(&mut board_storage, team, buckets);

        let views: Mutex<Option<ViewSet>> = Mutex::new(None);

        run_jobs(team, |ctx| {
            let mut counts = vec![0u64; buckets];

            for chunk in 0..chunk_count {
                let chunk_start = chunk * self.chunk_entries;
                // The trailing chunk gets the exact remainder.
                let chunk_len = self.chunk_entries.min(total - chunk_start);

                let per_worker = chunk_len / team;
                let extra = chunk_len % team;
                let my_count = per_worker + usize::from(ctx.id < extra);
                let my_offset = per_worker * ctx.id + ctx.id.min(extra);

                counts.fill(0);
                for i in 0..my_count {
                    let local = my_offset + i;
                    let pair = input.pairs[chunk_start + local];
                    let (y, bucket, meta_a, meta_b) = self.evaluate(input, pair);
                    counts[bucket as usize] += 1;
                    // SAFETY: workers fill disjoint chunk-local ranges.
                    unsafe {
                        y_tmp.write(local, y);
                        a_tmp.write(local, meta_a);
                        b_tmp.write(local, meta_b);
                        bucket_tmp.write(local, bucket as u16);
                    }
                }
                board.publish(ctx.id, &counts);
                ctx.sync();

                let windows = board.windows(ctx.id);
                if ctx.is_control() {
                    let (y_view, y_groups) = self.y_writer.begin_chunk(&windows.totals);
                    self.y_manifest
                        .lock()
                        .record_round(&windows.totals, &y_groups);

                    let meta_a = self.meta_a_writer.as_ref().map(|writer| {
                        let (view, groups) = writer.begin_chunk(&windows.totals);
                        if let Some(manifest) = self.meta_a_manifest.lock().as_mut() {
                            manifest.record_round(&windows.totals, &groups);
                        }
                        view
                    });
                    let meta_b = self.meta_b_writer.as_ref().map(|writer| {
                        let (view, groups) = writer.begin_chunk(&windows.totals);
                        if let Some(manifest) = self.meta_b_manifest.lock().as_mut() {
                            manifest.record_round(&windows.totals, &groups);
                        }
                        view
                    });

                    *views.lock() = Some(ViewSet { y: y_view, meta_a, meta_b });
                }
                ctx.sync();

                let set = views.lock().clone().expect("chunk views published");
                let mut cursors: Vec<u64> =
                    (0..buckets).map(|b| windows.local_start(b)).collect();
                for i in 0..my_count {
                    let local = my_offset + i;
                    // SAFETY: the barrier ordered these reads after the
                    // evaluation writes; destinations are disjoint.
                    let (y, meta_a, meta_b, bucket) = unsafe {
                        (
                            y_tmp.get(local),
                            a_tmp.get(local),
                            b_tmp.get(local),
                            bucket_tmp.get(local) as usize,
                        )
                    };
                    let dst = cursors[bucket];
                    cursors[bucket] += 1;

                    set.y.writer_at(bucket as u32, dst).write(y, shape.y_out_bits);
                    if let Some(view) = &set.meta_a {
                        view.writer_at(bucket as u32, dst).write(meta_a, shape.out_a_bits);
                    }
                    if let Some(view) = &set.meta_b {
                        view.writer_at(bucket as u32, dst).write(meta_b, shape.out_b_bits);
                    }
                }
                ctx.sync();

                if ctx.is_control() {
                    *views.lock() = None;
                    self.y_writer.submit_chunk();
                    if let Some(writer) = &self.meta_a_writer {
                        writer.submit_chunk();
                    }
                    if let Some(writer) = &self.meta_b_writer {
                        writer.submit_chunk();
                    }
                    self.queue.complete_pending_releases();
                    debug!(bucket = input.bucket, chunk, entries = chunk_len, "fx chunk submitted");
                }
                ctx.sync();
            }
        });

        Ok(())
    }

    /// Flushes carried tails, waits for all writes to land, and returns
    /// the produced stream manifests.
    pub fn finish(self) -> FxOutput {
        self.y_writer.finish();
        if let Some(writer) = &self.meta_a_writer {
            writer.finish();
        }
        if let Some(writer) = &self.meta_b_writer {
            writer.finish();
        }

        let fence = Fence::new();
        self.queue.add_fence(&fence);
        self.queue.commit();
        fence.wait();

        FxOutput {
            y: self.y_manifest.into_inner(),
            meta_a: self.meta_a_manifest.into_inner(),
            meta_b: self.meta_b_manifest.into_inner(),
        }
    }

    /// Hashes one pair and derives `(y', bucket, metaA', metaB')`.
    fn evaluate(&self, input: &FxInput<'_>, pair: Pair) -> (u64, u32, u64, u64) {
        let shape = self.shape;
        let left = pair.left as usize;
        let right = pair.right() as usize;

        let y = input.ys[left];
        debug_assert_eq!(
            y >> (shape.y_in_bits - self.bucket_count.ilog2()),
            input.bucket as u64,
            "input y does not belong to this bucket"
        );

        let mut buf = [0u8; 80];
        let mut packer = BitPacker::new(&mut buf);
        packer.put(y, shape.y_in_bits);
        if shape.in_a_bits > 0 {
            packer.put(input.meta_a[left], shape.in_a_bits);
        }
        if shape.in_b_bits > 0 {
            packer.put(input.meta_b[left], shape.in_b_bits);
        }
        if shape.in_a_bits > 0 {
            packer.put(input.meta_a[right], shape.in_a_bits);
        }
        if shape.in_b_bits > 0 {
            packer.put(input.meta_b[right], shape.in_b_bits);
        }
        let len = packer.byte_len();
        debug_assert_eq!(len, bits_to_bytes(shape.hash_input_bits() as u64));

        let hash = blake3::hash(&buf[..len]);
        let hash = hash.as_bytes();

        let y_out = bits_at(hash, 0, shape.y_out_bits);
        let bucket = (y_out >> (shape.y_out_bits - self.bucket_count.ilog2())) as u32;

        let k = shape.k;
        let (meta_a, meta_b) = match (shape.out_multiplier, shape.in_multiplier) {
            // Early tables concatenate the input metas.
            (2, 1) => ((input.meta_a[left] << k) | input.meta_a[right], 0),
            (4, 2) => (input.meta_a[left], input.meta_a[right]),
            // The final table carries no meta.
            (0, _) => (0, 0),
            // Later tables slice the hash right after the y field.
            (out, _) => {
                let a = bits_at(hash, shape.y_in_bits as usize, 2 * k);
                let b = if out > 2 {
                    bits_at(hash, (shape.y_in_bits + 2 * k) as usize, (out - 2) * k)
                } else {
                    0
                };
                (a, b)
            }
        };

        (y_out, bucket, meta_a, meta_b)
    }
}
