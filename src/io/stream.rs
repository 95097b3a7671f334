//! # Bucketed Stream Writer
//!
//! The Fx write path: each chunk of evaluated entries is scattered into
//! one work-heap region holding all buckets — every bucket sub-region
//! starting at a block-aligned offset — and submitted as a single
//! `WriteBuckets` command.
//!
//! A chunk's entries for one bucket form a *group*: `count * entry_bits`
//! bits zero-padded to a whole byte. Groups are self-contained, so a
//! reader decodes each one independently and chunk boundaries never split
//! an entry across a bit carry.
//!
//! The dispatcher writes only the block-floor of each submitted size
//! under direct I/O and advances the source cursor to the next block
//! boundary; the sub-block byte tail is this writer's responsibility. It
//! is copied out before submission and replayed as the prefix of the
//! bucket's next chunk region, keeping every bucket file a contiguous
//! byte stream. [`StreamWriter::finish`] flushes the final tails through
//! `WriteFile`, which zero-pads the trailing block. In buffered mode the
//! dispatcher writes everything and no tail ever arises.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::io::bits::{bits_to_bytes, round_up_to, BitWriter};
use crate::io::file_set::{FileId, RawFile};
use crate::io::queue::DiskQueue;
use crate::memory::WorkBuffer;

#[derive(Debug, Clone, Copy)]
struct Region {
    /// Byte offset of the region within the chunk buffer.
    byte_base: usize,
    /// Carried tail bytes replayed at the region start.
    tail_len: usize,
    /// Tail plus this chunk's group, in bytes.
    data_bytes: usize,
    /// This chunk's group alone, in bytes.
    group_bytes: usize,
}

struct Chunk {
    buf: WorkBuffer,
    regions: Arc<Vec<Region>>,
}

struct State {
    /// Sub-block byte tails carried per bucket. Always empty in buffered
    /// mode.
    tails: Vec<Vec<u8>>,
    chunk: Option<Chunk>,
}

/// Scatter view into the current chunk, cheap to clone into workers.
#[derive(Clone)]
pub struct ChunkView {
    base: usize,
    cap_bits: u64,
    entry_bits: u32,
    regions: Arc<Vec<Region>>,
}

impl ChunkView {
    /// A cursor positioned at `entry_index` within `bucket`'s group.
    pub fn writer_at(&self, bucket: u32, entry_index: u64) -> BitWriter {
        let region = &self.regions[bucket as usize];
        let bit = (region.byte_base + region.tail_len) as u64 * 8
            + entry_index * self.entry_bits as u64;
        debug_assert!(
            bit + self.entry_bits as u64 <= (region.byte_base + region.data_bytes) as u64 * 8
        );
        // SAFETY: the chunk buffer was zeroed in `begin_chunk`, is
        // block-aligned, and scatter destinations are disjoint by the
        // prefix-sum windows.
        unsafe { BitWriter::from_raw(self.base as *mut u8, bit, self.cap_bits) }
    }
}

/// Chunk-at-a-time bucketed writer over `WriteBuckets` commands.
pub struct StreamWriter<'a, F: RawFile> {
    queue: &'a DiskQueue<F>,
    file_id: FileId,
    entry_bits: u32,
    state: Mutex<State>,
}

impl<'a, F: RawFile + 'static> StreamWriter<'a, F> {
    pub fn new(queue: &'a DiskQueue<F>, file_id: FileId, entry_bits: u32) -> Self {
        let tails = (0..queue.bucket_count()).map(|_| Vec::new()).collect();
        Self {
            queue,
            file_id,
            entry_bits,
            state: Mutex::new(State { tails, chunk: None }),
        }
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn entry_bits(&self) -> u32 {
        self.entry_bits
    }

    /// Bucket regions start at multiples of this within the chunk buffer.
    fn region_align(&self) -> usize {
        if self.queue.use_direct_io() {
            self.queue.block_size()
        } else {
            1
        }
    }

    /// Lays out and lends the chunk buffer for `counts[b]` entries per
    /// bucket, replaying carried tails at each region start. Returns a
    /// scatter view for the workers. Also reports each bucket's group
    /// size in bytes.
    pub fn begin_chunk(&self, counts: &[u64]) -> (ChunkView, Vec<usize>) {
        let align = self.region_align();
        let mut state = self.state.lock();
        assert_eq!(counts.len(), state.tails.len());
        debug_assert!(state.chunk.is_none(), "previous chunk was never submitted");

        let mut regions = Vec::with_capacity(counts.len());
        let mut group_sizes = Vec::with_capacity(counts.len());
        let mut total_bytes = 0usize;
        for (tail, &count) in state.tails.iter().zip(counts) {
            let group_bytes = bits_to_bytes(count * self.entry_bits as u64);
            regions.push(Region {
                byte_base: total_bytes,
                tail_len: tail.len(),
                data_bytes: tail.len() + group_bytes,
                group_bytes,
            });
            group_sizes.push(group_bytes);
            total_bytes += round_up_to(tail.len() + group_bytes, align);
        }

        let buf = self.queue.get_buffer(total_bytes.max(1));
        // SAFETY: freshly allocated and exclusive until the view is handed
        // out.
        let slice = unsafe { buf.as_mut_slice() };
        slice.fill(0);
        for (region, tail) in regions.iter().zip(&state.tails) {
            slice[region.byte_base..region.byte_base + tail.len()].copy_from_slice(tail);
        }

        let regions = Arc::new(regions);
        let view = ChunkView {
            base: buf.addr(),
            cap_bits: buf.len() as u64 * 8,
            entry_bits: self.entry_bits,
            regions: Arc::clone(&regions),
        };
        state.chunk = Some(Chunk { buf, regions });
        (view, group_sizes)
    }

    /// Extracts the new sub-block tails, submits the bucket sizes as one
    /// `WriteBuckets` batch, releases the buffer, and commits.
    pub fn submit_chunk(&self) {
        let block = self.queue.block_size();
        let direct = self.queue.use_direct_io();
        let mut state = self.state.lock();
        let chunk = state.chunk.take().expect("submit_chunk without begin_chunk");

        // SAFETY: workers passed their barrier; the control thread is the
        // only accessor now.
        let slice = unsafe { chunk.buf.as_mut_slice() };

        let mut sizes = Vec::with_capacity(chunk.regions.len());
        for (region, tail) in chunk.regions.iter().zip(state.tails.iter_mut()) {
            // The dispatcher writes the block-floor of this size; the
            // remainder becomes the next chunk's prefix.
            let written = if direct {
                region.data_bytes / block * block
            } else {
                region.data_bytes
            };
            tail.clear();
            tail.extend_from_slice(
                &slice[region.byte_base + written..region.byte_base + region.data_bytes],
            );
            sizes.push(region.data_bytes as u32);
        }

        self.queue
            .write_buckets(self.file_id, chunk.buf.addr(), &sizes);
        self.queue.release_buffer(chunk.buf.addr());
        self.queue.commit();
    }

    /// Final flush: each bucket's remaining tail goes out through
    /// `WriteFile`; the dispatcher zero-pads the trailing block. Only the
    /// direct-I/O path ever has tails to flush.
    pub fn finish(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.chunk.is_none(), "unsubmitted chunk at finish");

        for (bucket, tail) in state.tails.iter_mut().enumerate() {
            if tail.is_empty() {
                continue;
            }
            let buf = self.queue.get_buffer(tail.len());
            // SAFETY: freshly allocated, exclusive.
            let slice = unsafe { buf.as_mut_slice() };
            slice.fill(0);
            slice[..tail.len()].copy_from_slice(tail);

            self.queue
                .write_file(self.file_id, bucket as u32, buf.addr(), tail.len());
            self.queue.release_buffer(buf.addr());
            tail.clear();

            // Publish in slices so wide bucket counts cannot fill the
            // command ring within one uncommitted batch.
            if (bucket + 1) % 64 == 0 {
                self.queue.commit();
            }
        }
        drop(state);

        self.queue.commit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::bits::{BitPacker, BitReader};
    use crate::io::testing::mem_queue;
    use crate::io::Fence;

    const ENTRY_BITS: u32 = 10;

    /// Writes the given chunks and returns each bucket's raw file bytes
    /// plus the per-chunk group sizes.
    fn run_chunks(
        use_direct_io: bool,
        block: usize,
        chunks: &[&[&[u64]]],
    ) -> (Vec<Vec<u8>>, Vec<Vec<usize>>) {
        let bucket_count = chunks[0].len() as u32;
        let (queue, data) = mem_queue(bucket_count, block, use_direct_io);
        let writer = StreamWriter::new(&queue, FileId::Y1, ENTRY_BITS);

        let mut groups = Vec::new();
        for chunk in chunks {
            let counts: Vec<u64> = chunk.iter().map(|b| b.len() as u64).collect();
            let (view, group_sizes) = writer.begin_chunk(&counts);
            for (bucket, values) in chunk.iter().enumerate() {
                for (i, &value) in values.iter().enumerate() {
                    view.writer_at(bucket as u32, i as u64).write(value, ENTRY_BITS);
                }
            }
            writer.submit_chunk();
            groups.push(group_sizes);
        }
        writer.finish();

        let fence = Fence::new();
        queue.add_fence(&fence);
        queue.commit();
        fence.wait();

        let files = data[FileId::Y1.index()]
            .iter()
            .map(|handle| handle.lock().clone())
            .collect();
        (files, groups)
    }

    /// Each chunk's group packed independently and byte-padded.
    fn reference_stream(chunks: &[&[&[u64]]], bucket: usize) -> Vec<u8> {
        let mut stream = Vec::new();
        for chunk in chunks {
            let mut buf = vec![0u8; 256];
            let mut packer = BitPacker::new(&mut buf);
            for &value in chunk[bucket] {
                packer.put(value, ENTRY_BITS);
            }
            let len = packer.byte_len();
            stream.extend_from_slice(&buf[..len]);
        }
        stream
    }

    fn decode_groups(files: &[Vec<u8>], groups: &[Vec<usize>], bucket: usize) -> Vec<u64> {
        let mut values = Vec::new();
        let mut offset = 0usize;
        for chunk_groups in groups {
            let group = &files[bucket][offset..offset + chunk_groups[bucket]];
            let mut reader = BitReader::new(group);
            while reader.remaining_bits() >= ENTRY_BITS as usize {
                values.push(reader.read(ENTRY_BITS));
            }
            offset += chunk_groups[bucket];
        }
        values
    }

    #[test]
    fn buffered_chunks_land_as_contiguous_groups() {
        let chunks: &[&[&[u64]]] = &[
            &[&[1, 2, 3], &[100, 200, 300, 400, 500]],
            &[&[4, 5, 6, 7], &[600, 700]],
            &[&[8], &[800, 900, 1000]],
        ];
        let (files, groups) = run_chunks(false, 16, chunks);

        for bucket in 0..2 {
            let reference = reference_stream(chunks, bucket);
            assert_eq!(files[bucket], reference, "bucket {}", bucket);

            let expected: Vec<u64> =
                chunks.iter().flat_map(|c| c[bucket].iter().copied()).collect();
            assert_eq!(decode_groups(&files, &groups, bucket), expected);
        }
    }

    #[test]
    fn direct_chunks_carry_sub_block_tails_across_submissions() {
        const BLOCK: usize = 16;
        let chunks: &[&[&[u64]]] = &[
            // 20 entries = 200 bits = 25 bytes: one block written, a
            // 9-byte tail carried into the next chunk's region.
            &[&[7u64; 20][..], &[9u64; 3][..]][..],
            &[&[1u64; 30][..], &[2u64; 40][..]][..],
        ];
        let (files, groups) = run_chunks(true, BLOCK, chunks);

        for bucket in 0..2 {
            let reference = reference_stream(chunks, bucket);

            // The file is the contiguous byte stream, zero-padded to a
            // whole block by the final flush.
            assert_eq!(files[bucket].len() % BLOCK, 0);
            assert!(files[bucket].len() >= reference.len());
            assert_eq!(&files[bucket][..reference.len()], &reference[..]);
            assert!(files[bucket][reference.len()..].iter().all(|&b| b == 0));

            let expected: Vec<u64> =
                chunks.iter().flat_map(|c| c[bucket].iter().copied()).collect();
            assert_eq!(decode_groups(&files, &groups, bucket), expected);
        }
    }

    #[test]
    fn empty_buckets_produce_empty_groups() {
        let chunks: &[&[&[u64]]] = &[&[&[], &[5, 6]], &[&[9], &[]]];
        let (files, groups) = run_chunks(false, 16, chunks);

        assert_eq!(groups[0][0], 0);
        assert_eq!(groups[1][1], 0);
        assert_eq!(decode_groups(&files, &groups, 0), vec![9]);
        assert_eq!(decode_groups(&files, &groups, 1), vec![5, 6]);
    }
}
