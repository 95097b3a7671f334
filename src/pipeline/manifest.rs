//! # Stream Manifests
//!
//! Scratch files carry no headers, so the plotter keeps an in-memory log
//! of what it wrote: per `(stream, bucket)`, the sequence of extents —
//! entry count and payload byte length per submit. The manifest is what
//! lets a reader recover entry streams from raw bucket files.
//!
//! Two extent layouts exist, matching the two write paths:
//!
//! - [`StreamLayout::PaddedExtents`] (the `BitBucketWriter` path): each
//!   extent occupies the file rounded up to a whole block under direct
//!   I/O, but sub-byte carry makes the concatenated payload bytes one
//!   continuous bit stream.
//! - [`StreamLayout::Contiguous`] (the `StreamWriter` path): payload
//!   bytes are contiguous on disk with only the file tail block-padded;
//!   each extent is a self-contained group, bit-padded to its own byte
//!   boundary.

use eyre::Result;

use crate::io::bits::{round_up_to, BitReader};
use crate::io::file_set::{FileId, RawFile, SeekOrigin};
use crate::io::queue::{DiskQueue, Fence};

/// How a stream's extents map onto file bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamLayout {
    /// Every extent starts on its own block boundary; payload concatenates
    /// into one continuous bit stream.
    PaddedExtents,
    /// Payload bytes are contiguous; every extent is an independently
    /// decodable byte-padded group.
    Contiguous,
}

/// One submitted write: `entries` entries packed into `data_bytes` payload
/// bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub entries: u64,
    pub data_bytes: u64,
}

/// Write history of a single bucket file.
#[derive(Debug, Clone, Default)]
pub struct BucketLog {
    pub extents: Vec<Extent>,
}

impl BucketLog {
    pub fn entries(&self) -> u64 {
        self.extents.iter().map(|e| e.entries).sum()
    }

    pub fn data_bytes(&self) -> u64 {
        self.extents.iter().map(|e| e.data_bytes).sum()
    }

    /// File bytes the extents occupy, given the layout and block rounding
    /// in effect.
    pub fn file_bytes(&self, layout: StreamLayout, use_direct_io: bool, block: usize) -> u64 {
        if !use_direct_io {
            return self.data_bytes();
        }
        match layout {
            StreamLayout::PaddedExtents => self
                .extents
                .iter()
                .map(|e| round_up_to(e.data_bytes as usize, block) as u64)
                .sum(),
            StreamLayout::Contiguous => {
                round_up_to(self.data_bytes() as usize, block) as u64
            }
        }
    }
}

/// Write history of one logical stream across all buckets.
#[derive(Debug, Clone)]
pub struct StreamManifest {
    pub file_id: FileId,
    pub layout: StreamLayout,
    buckets: Vec<BucketLog>,
}

impl StreamManifest {
    pub fn new(file_id: FileId, bucket_count: u32, layout: StreamLayout) -> Self {
        Self {
            file_id,
            layout,
            buckets: (0..bucket_count).map(|_| BucketLog::default()).collect(),
        }
    }

    pub fn bucket(&self, bucket: u32) -> &BucketLog {
        &self.buckets[bucket as usize]
    }

    pub fn bucket_count(&self) -> u32 {
        self.buckets.len() as u32
    }

    pub fn record(&mut self, bucket: u32, entries: u64, data_bytes: u64) {
        if entries == 0 && data_bytes == 0 {
            return;
        }
        self.buckets[bucket as usize]
            .extents
            .push(Extent { entries, data_bytes });
    }

    /// Records one submit round across all buckets.
    pub fn record_round(&mut self, entries: &[u64], data_bytes: &[usize]) {
        debug_assert_eq!(entries.len(), self.buckets.len());
        debug_assert_eq!(data_bytes.len(), self.buckets.len());
        for bucket in 0..self.buckets.len() {
            self.record(bucket as u32, entries[bucket], data_bytes[bucket] as u64);
        }
    }

    /// Total entries across every bucket.
    pub fn total_entries(&self) -> u64 {
        self.buckets.iter().map(|b| b.entries()).sum()
    }

    pub fn bucket_entries(&self) -> Vec<u64> {
        self.buckets.iter().map(|b| b.entries()).collect()
    }
}

/// Reads one bucket file back through the command queue and strips block
/// padding, returning the bucket's payload bytes and its entry count.
pub fn read_bucket<F: RawFile + 'static>(
    queue: &DiskQueue<F>,
    manifest: &StreamManifest,
    bucket: u32,
) -> Result<(Vec<u8>, u64)> {
    let log = manifest.bucket(bucket);
    let entries = log.entries();
    let file_bytes =
        log.file_bytes(manifest.layout, queue.use_direct_io(), queue.block_size()) as usize;
    if file_bytes == 0 {
        return Ok((Vec::new(), entries));
    }

    let buf = queue.get_buffer(file_bytes);
    queue.seek_file(manifest.file_id, bucket, 0, SeekOrigin::Start);
    queue.read_file(manifest.file_id, bucket, buf.addr(), file_bytes);
    let fence = Fence::new();
    queue.add_fence(&fence);
    queue.commit();
    fence.wait();

    // SAFETY: the fence ordered us after the read; nothing else holds the
    // buffer.
    let raw = unsafe { buf.as_mut_slice() };

    let payload = match manifest.layout {
        StreamLayout::Contiguous => raw[..log.data_bytes() as usize].to_vec(),
        StreamLayout::PaddedExtents => {
            let mut payload = Vec::with_capacity(log.data_bytes() as usize);
            let mut offset = 0usize;
            for extent in &log.extents {
                payload.extend_from_slice(&raw[offset..offset + extent.data_bytes as usize]);
                offset += if queue.use_direct_io() {
                    round_up_to(extent.data_bytes as usize, queue.block_size())
                } else {
                    extent.data_bytes as usize
                };
            }
            payload
        }
    };

    queue.release_buffer(buf.addr());
    queue.commit();
    Ok((payload, entries))
}

/// Decodes one bucket's entries, each a sequence of `field_widths` bit
/// fields. Returns the fields flattened in entry order.
pub fn read_entries<F: RawFile + 'static>(
    queue: &DiskQueue<F>,
    manifest: &StreamManifest,
    bucket: u32,
    field_widths: &[u32],
) -> Result<Vec<u64>> {
    let (payload, entries) = read_bucket(queue, manifest, bucket)?;
    let mut fields = Vec::with_capacity(entries as usize * field_widths.len());

    match manifest.layout {
        // One continuous bit stream across all extents.
        StreamLayout::PaddedExtents => {
            let mut reader = BitReader::new(&payload);
            for _ in 0..entries {
                for &width in field_widths {
                    fields.push(reader.read(width));
                }
            }
        }
        // Each extent is a byte-padded group decoded on its own.
        StreamLayout::Contiguous => {
            let log = manifest.bucket(bucket);
            let mut offset = 0usize;
            for extent in &log.extents {
                let group = &payload[offset..offset + extent.data_bytes as usize];
                let mut reader = BitReader::new(group);
                for _ in 0..extent.entries {
                    for &width in field_widths {
                        fields.push(reader.read(width));
                    }
                }
                offset += extent.data_bytes as usize;
            }
        }
    }

    Ok(fields)
}
