//! # Bit Bucket Writer
//!
//! Accumulates bit-packed entries into one work-heap buffer per bucket and
//! submits them through `WriteFile` commands. Because entry widths are not
//! byte multiples, each submit keeps the trailing partial byte as carry and
//! replays it as the prefix of the bucket's next buffer, so the
//! concatenation of all submitted bytes per bucket is exactly the bucket's
//! bit stream — zero-padded only by the very last flush.
//!
//! Worker threads obtain [`BitWriter`] cursors into the current round's
//! buffers via [`BitBucketWriter::writer_for`] and fill disjoint bit
//! ranges; `begin`/`submit` are driven by the job's control thread between
//! barriers.

use parking_lot::Mutex;

use crate::io::bits::{bits_to_bytes, round_up_to, BitWriter};
use crate::io::file_set::{FileId, RawFile};
use crate::io::queue::DiskQueue;
use crate::memory::WorkBuffer;

struct Bucket {
    buf: Option<WorkBuffer>,
    /// Carry prefix plus the bits declared for the current round.
    total_bits: u64,
    /// Bits of carry, always < 8.
    carry_bits: u32,
    /// Carry bits in the high positions of one byte, low bits zero.
    carry_byte: u8,
}

/// Per-bucket bit-packed output through the command queue.
pub struct BitBucketWriter<'a, F: RawFile> {
    queue: &'a DiskQueue<F>,
    file_id: FileId,
    state: Mutex<Vec<Bucket>>,
}

impl<'a, F: RawFile + 'static> BitBucketWriter<'a, F> {
    pub fn new(queue: &'a DiskQueue<F>, file_id: FileId) -> Self {
        let buckets = (0..queue.bucket_count())
            .map(|_| Bucket { buf: None, total_bits: 0, carry_bits: 0, carry_byte: 0 })
            .collect();
        Self { queue, file_id, state: Mutex::new(buckets) }
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    /// Lends a zeroed, block-rounded buffer per bucket, sized for that
    /// bucket's declared bit count plus retained carry. May block on the
    /// work heap until previous rounds' buffers are released.
    pub fn begin(&self, bits: &[u64]) {
        let mut buckets = self.state.lock();
        assert_eq!(bits.len(), buckets.len());

        for (bucket, &round_bits) in buckets.iter_mut().zip(bits) {
            debug_assert!(bucket.buf.is_none(), "previous round was never submitted");
            let total = bucket.carry_bits as u64 + round_bits;
            bucket.total_bits = total;
            if total == 0 {
                continue;
            }

            let size = round_up_to(bits_to_bytes(total), self.queue.block_size());
            let buf = self.queue.get_buffer(size);
            // SAFETY: freshly allocated and exclusive until workers are
            // handed writers after this call returns.
            let slice = unsafe { buf.as_mut_slice() };
            slice.fill(0);
            slice[0] = bucket.carry_byte;
            bucket.buf = Some(buf);
        }
    }

    /// A scatter cursor for `bucket`, positioned `bit_offset` bits past
    /// the start of the current round's data. Carry bits are accounted for
    /// internally.
    pub fn writer_for(&self, bucket: u32, bit_offset: u64) -> BitWriter {
        let buckets = self.state.lock();
        let state = &buckets[bucket as usize];
        let buf = state
            .buf
            .as_ref()
            .expect("writer_for called outside a begin/submit round");
        // SAFETY: the buffer was zeroed in `begin`, is block-aligned, and
        // callers cover disjoint bit ranges per the prefix-sum windows.
        unsafe {
            BitWriter::from_raw(
                buf.as_mut_ptr(),
                state.carry_bits as u64 + bit_offset,
                buf.len() as u64 * 8,
            )
        }
    }

    /// Writes each bucket's whole bytes, retains the trailing partial byte
    /// as carry, releases the buffers, and commits the batch. Returns the
    /// submitted byte count per bucket.
    pub fn submit(&self) -> Vec<usize> {
        let mut buckets = self.state.lock();
        let mut written = Vec::with_capacity(buckets.len());

        for (index, bucket) in buckets.iter_mut().enumerate() {
            let Some(buf) = bucket.buf.take() else {
                written.push(0);
                continue;
            };

            let data_bytes = (bucket.total_bits / 8) as usize;
            let rem = (bucket.total_bits % 8) as u32;

            // SAFETY: workers are past their barrier; the control thread
            // is the only accessor during submit.
            let slice = unsafe { buf.as_mut_slice() };
            bucket.carry_bits = rem;
            bucket.carry_byte = if rem > 0 { slice[data_bytes] } else { 0 };
            bucket.total_bits = 0;

            if data_bytes > 0 {
                self.queue
                    .write_file(self.file_id, index as u32, buf.addr(), data_bytes);
            }
            self.queue.release_buffer(buf.addr());
            written.push(data_bytes);

            // Publish in slices so wide bucket counts cannot fill the
            // command ring within one uncommitted batch.
            if (index + 1) % 64 == 0 {
                self.queue.commit();
            }
        }
        drop(buckets);

        self.queue.commit();
        written
    }

    /// Final flush: writes each bucket's remaining carry bits padded with
    /// zeros to the next byte boundary. Returns the byte count per bucket.
    pub fn submit_leftovers(&self) -> Vec<usize> {
        let mut buckets = self.state.lock();
        let mut written = Vec::with_capacity(buckets.len());

        for (index, bucket) in buckets.iter_mut().enumerate() {
            debug_assert!(bucket.buf.is_none(), "unsubmitted round at leftover flush");
            if bucket.carry_bits == 0 {
                written.push(0);
                continue;
            }

            let buf = self.queue.get_buffer(1);
            // SAFETY: freshly allocated, exclusive.
            let slice = unsafe { buf.as_mut_slice() };
            slice.fill(0);
            slice[0] = bucket.carry_byte;

            self.queue.write_file(self.file_id, index as u32, buf.addr(), 1);
            self.queue.release_buffer(buf.addr());
            bucket.carry_bits = 0;
            bucket.carry_byte = 0;
            written.push(1);

            if (index + 1) % 64 == 0 {
                self.queue.commit();
            }
        }
        drop(buckets);

        self.queue.commit();
        written
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::bits::BitPacker;
    use crate::io::testing::mem_queue;
    use crate::io::Fence;

    #[test]
    fn carry_preserves_one_contiguous_bit_stream() {
        const ENTRY_BITS: u32 = 10;
        let (queue, data) = mem_queue(2, 64, false);
        let writer = BitBucketWriter::new(&queue, FileId::Y0);

        // Rounds deliberately end off byte boundaries: 3 entries = 30
        // bits (6 carry bits), then 5 entries = 56 total (no carry), then
        // 1 entry (2 carry bits at flush time).
        let rounds: &[&[u64]] = &[&[11, 987, 5], &[64, 128, 256, 512, 1000], &[77]];

        let mut reference = vec![0u8; 64];
        let mut packer = BitPacker::new(&mut reference);

        for round in rounds {
            writer.begin(&[round.len() as u64 * ENTRY_BITS as u64, 0]);
            let mut cursor = writer.writer_for(0, 0);
            for &value in *round {
                cursor.write(value, ENTRY_BITS);
                packer.put(value, ENTRY_BITS);
            }
            writer.submit();
        }
        writer.submit_leftovers();

        let fence = Fence::new();
        queue.add_fence(&fence);
        queue.commit();
        fence.wait();

        let file = data[FileId::Y0.index()][0].lock();
        let expected_len = packer.byte_len();
        assert_eq!(file.len(), expected_len);
        assert_eq!(&file[..], &reference[..expected_len]);
    }

    #[test]
    fn submit_reports_written_bytes_per_bucket() {
        const ENTRY_BITS: u32 = 12;
        let (queue, _data) = mem_queue(3, 64, false);
        let writer = BitBucketWriter::new(&queue, FileId::MetaA1);

        writer.begin(&[2 * ENTRY_BITS as u64, 0, 5 * ENTRY_BITS as u64]);
        let mut w0 = writer.writer_for(0, 0);
        w0.write(1, ENTRY_BITS);
        w0.write(2, ENTRY_BITS);
        let mut w2 = writer.writer_for(2, 0);
        for v in 0..5 {
            w2.write(v, ENTRY_BITS);
        }

        // 24 bits -> 3 bytes, 0 bits -> nothing, 60 bits -> 7 bytes + 4
        // carry bits.
        assert_eq!(writer.submit(), vec![3, 0, 7]);
        assert_eq!(writer.submit_leftovers(), vec![0, 0, 1]);
    }

    #[test]
    fn empty_buckets_are_skipped_entirely() {
        let (queue, data) = mem_queue(2, 64, false);
        let writer = BitBucketWriter::new(&queue, FileId::MetaB0);

        writer.begin(&[0, 0]);
        assert_eq!(writer.submit(), vec![0, 0]);
        assert_eq!(writer.submit_leftovers(), vec![0, 0]);

        let fence = Fence::new();
        queue.add_fence(&fence);
        queue.commit();
        fence.wait();

        assert!(data[FileId::MetaB0.index()][0].lock().is_empty());
        assert!(data[FileId::MetaB0.index()][1].lock().is_empty());
    }
}
