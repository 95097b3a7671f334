//! # Disk Command Queue
//!
//! This module implements the single-writer I/O engine for the plotting
//! pipeline. All file and heap-release effects flow through one bounded
//! command ring drained by a dedicated dispatch thread; that thread's
//! execution order is the authoritative ordering for everything that
//! touches disk.
//!
//! ## Design Overview
//!
//! ```text
//! producer ──stage──► [ staged | ready ] ──drain──► dispatch thread
//!             commit()           ▲  │                    │
//!                                │  └── consumed ◄───────┤
//!                                └────── ready ──────────┘
//! ```
//!
//! 1. The producer stages commands; when the ring is full it parks until
//!    the dispatcher signals `consumed`.
//! 2. `commit()` publishes everything staged since the last commit and
//!    wakes the dispatcher via `ready`.
//! 3. The dispatcher drains up to [`DISPATCH_BATCH_SIZE`] commands into a
//!    local batch, signals `consumed`, then executes the batch in order.
//!
//! Commands are never executed concurrently. Per-file sequential order
//! holds trivially because a single thread runs all of them.
//!
//! ## Direct I/O
//!
//! Under direct I/O every transfer must be a block multiple from an
//! aligned buffer. `WriteBuckets` writes only the block-floor of each
//! bucket and leaves the sub-block tail to the caller; `WriteFile` writes
//! the floor directly and the tail through a zero-padded bounce block;
//! `ReadFile` rounds the read up to the next block (work-heap buffers are
//! always oversized to a block boundary).
//!
//! ## Failure Model
//!
//! Any I/O error is fatal: the dispatcher logs a report naming the
//! `<stream>.<bucket>` file and the OS error, then terminates the process
//! with the underlying error code. Scratch I/O failure is presumed
//! non-transient, and a partial plot has no value worth a recovery
//! state-space.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::collections::VecDeque;
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use eyre::{ensure, Result, WrapErr};
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;
use tracing::{debug, error, warn};

use crate::config::{COMMAND_QUEUE_CAPACITY, DISPATCH_BATCH_SIZE};
use crate::io::bits::round_up_to;
use crate::io::file_set::{FileId, FileSet, FileStream, RawFile, SeekOrigin};
use crate::io::open_file_sets;
use crate::memory::{HeapStats, WorkBuffer, WorkHeap};

/// One-shot completion signal committed into the command stream.
///
/// The dispatcher fires it when the fence command executes, which by FIFO
/// order is after every command committed before the fence. `wait` consumes
/// the signal so a fence can be reused across rounds.
#[derive(Default)]
#[derive(Debug)]
pub struct Fence {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl Fence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        drop(signaled);
        self.condvar.notify_all();
    }

    /// Blocks until signaled, then resets.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.condvar.wait(&mut signaled);
        }
        *signaled = false;
    }

    pub fn is_signaled(&self) -> bool {
        *self.signaled.lock()
    }
}

/// Per-bucket byte lengths for a `WriteBuckets` command.
pub type BucketSizes = SmallVec<[u32; 64]>;

/// An I/O command record. Buffer references are raw arena addresses; the
/// work heap keeps the memory alive until the matching `ReleaseBuffer`
/// executes, which the producer enqueues after the last consuming command.
#[derive(Debug)]
pub enum Command {
    /// Write `sizes[b]` bytes to each bucket file of `file_id`, reading
    /// consecutive block-aligned regions starting at `addr`.
    WriteBuckets {
        file_id: FileId,
        addr: usize,
        sizes: BucketSizes,
    },
    WriteFile {
        file_id: FileId,
        bucket: u32,
        addr: usize,
        size: usize,
    },
    ReadFile {
        file_id: FileId,
        bucket: u32,
        addr: usize,
        size: usize,
    },
    SeekFile {
        file_id: FileId,
        bucket: u32,
        offset: i64,
        origin: SeekOrigin,
    },
    /// Seek every bucket file of the set.
    SeekBucket {
        file_id: FileId,
        offset: i64,
        origin: SeekOrigin,
    },
    ReleaseBuffer {
        addr: usize,
    },
    MemoryFence {
        signal: Arc<Fence>,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::WriteBuckets { .. } => "WriteBuckets",
            Command::WriteFile { .. } => "WriteFile",
            Command::ReadFile { .. } => "ReadFile",
            Command::SeekFile { .. } => "SeekFile",
            Command::SeekBucket { .. } => "SeekBucket",
            Command::ReleaseBuffer { .. } => "ReleaseBuffer",
            Command::MemoryFence { .. } => "MemoryFence",
        }
    }
}

#[derive(Debug)]
struct RingState {
    staged: VecDeque<Command>,
    ready: VecDeque<Command>,
    shutdown: bool,
}

#[derive(Debug)]
struct QueueShared {
    state: Mutex<RingState>,
    ready_signal: Condvar,
    consumed_signal: Condvar,
}

/// Disk-backed command queue with a scratch heap and one dispatch thread.
///
/// The producer side (`&self` methods) is meant for a single coordinator
/// thread: stage commands, `commit()`, and use fences to observe
/// completion. The dispatch thread exclusively owns all file handles and
/// the release side of the heap.
#[derive(Debug)]
pub struct DiskQueue<F: RawFile = FileStream> {
    shared: Arc<QueueShared>,
    heap: Arc<WorkHeap>,
    block_size: usize,
    use_direct_io: bool,
    bucket_count: u32,
    dispatcher: Option<JoinHandle<()>>,
    // fn() -> F keeps the queue Sync regardless of the backend type; the
    // files themselves live on the dispatch thread.
    _backend: std::marker::PhantomData<fn() -> F>,
}

impl DiskQueue<FileStream> {
    /// Opens all scratch file sets under `work_dir` and starts the
    /// dispatch thread.
    pub fn create(
        work_dir: &std::path::Path,
        bucket_count: u32,
        arena_size: usize,
        use_direct_io: bool,
    ) -> Result<Self> {
        let (sets, _) = open_file_sets(work_dir, bucket_count, use_direct_io)?;
        Self::with_file_sets(sets, arena_size, use_direct_io)
    }
}

impl<F: RawFile + 'static> DiskQueue<F> {
    /// Builds a queue over caller-provided file sets. This is the seam
    /// integration tests use to observe I/O with recording backends.
    pub fn with_file_sets(
        sets: Vec<FileSet<F>>,
        arena_size: usize,
        use_direct_io: bool,
    ) -> Result<Self> {
        ensure!(!sets.is_empty(), "at least one file set is required");
        let bucket_count = sets[0].files.len();
        ensure!(bucket_count > 0, "file sets must contain bucket files");

        let block_size = sets[0].files[0].block_size();
        ensure!(
            block_size.is_power_of_two(),
            "block size {} is not a power of two",
            block_size
        );
        for (index, set) in sets.iter().enumerate() {
            ensure!(
                set.id.index() == index,
                "file set '{}' is out of order at slot {}",
                set.name(),
                index
            );
            ensure!(
                set.files.len() == bucket_count,
                "file set '{}' has {} buckets, expected {}",
                set.name(),
                set.files.len(),
                bucket_count
            );
            for (bucket, file) in set.files.iter().enumerate() {
                ensure!(
                    file.block_size() == block_size,
                    "scratch files have differing block sizes: '{}.{}' reports {}, expected {}",
                    set.name(),
                    bucket,
                    file.block_size(),
                    block_size
                );
            }
        }

        let heap = Arc::new(
            WorkHeap::new(arena_size, block_size)
                .wrap_err("failed to reserve the work arena")?,
        );

        let shared = Arc::new(QueueShared {
            state: Mutex::new(RingState {
                staged: VecDeque::with_capacity(COMMAND_QUEUE_CAPACITY),
                ready: VecDeque::with_capacity(COMMAND_QUEUE_CAPACITY),
                shutdown: false,
            }),
            ready_signal: Condvar::new(),
            consumed_signal: Condvar::new(),
        });

        let mut dispatcher = Dispatcher {
            sets,
            heap: Arc::clone(&heap),
            block_size,
            use_direct_io,
            bounce: BounceBlock::new(block_size)?,
        };
        let shared_for_thread = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("harrow-io".into())
            .spawn(move || dispatcher.run(&shared_for_thread))
            .wrap_err("failed to spawn the I/O dispatch thread")?;

        Ok(Self {
            shared,
            heap,
            block_size,
            use_direct_io,
            bucket_count: bucket_count as u32,
            dispatcher: Some(handle),
            _backend: std::marker::PhantomData,
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn use_direct_io(&self) -> bool {
        self.use_direct_io
    }

    pub fn bucket_count(&self) -> u32 {
        self.bucket_count
    }

    /// Lends a block-aligned buffer from the work arena, blocking until
    /// pending releases free enough space.
    pub fn get_buffer(&self, size: usize) -> WorkBuffer {
        self.heap.alloc(size, self.block_size)
    }

    /// Folds dispatcher-side buffer releases into the allocatable pool.
    pub fn complete_pending_releases(&self) {
        self.heap.complete_pending_releases();
    }

    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    pub fn write_buckets(&self, file_id: FileId, addr: usize, sizes: &[u32]) {
        self.stage(Command::WriteBuckets {
            file_id,
            addr,
            sizes: SmallVec::from_slice(sizes),
        });
    }

    pub fn write_file(&self, file_id: FileId, bucket: u32, addr: usize, size: usize) {
        self.stage(Command::WriteFile { file_id, bucket, addr, size });
    }

    pub fn read_file(&self, file_id: FileId, bucket: u32, addr: usize, size: usize) {
        self.stage(Command::ReadFile { file_id, bucket, addr, size });
    }

    pub fn seek_file(&self, file_id: FileId, bucket: u32, offset: i64, origin: SeekOrigin) {
        self.stage(Command::SeekFile { file_id, bucket, offset, origin });
    }

    pub fn seek_bucket(&self, file_id: FileId, offset: i64, origin: SeekOrigin) {
        self.stage(Command::SeekBucket { file_id, offset, origin });
    }

    pub fn release_buffer(&self, addr: usize) {
        self.stage(Command::ReleaseBuffer { addr });
    }

    pub fn add_fence(&self, fence: &Arc<Fence>) {
        self.stage(Command::MemoryFence { signal: Arc::clone(fence) });
    }

    /// Publishes all commands staged since the last commit and wakes the
    /// dispatcher.
    pub fn commit(&self) {
        let mut state = self.shared.state.lock();
        let staged = std::mem::take(&mut state.staged);
        state.ready.extend(staged);
        drop(state);
        self.shared.ready_signal.notify_one();
    }

    fn stage(&self, command: Command) {
        let mut state = self.shared.state.lock();
        let mut waited: Option<Instant> = None;
        while state.staged.len() + state.ready.len() >= COMMAND_QUEUE_CAPACITY {
            if waited.is_none() {
                warn!("command ring full; waiting for the dispatcher");
                waited = Some(Instant::now());
            }
            self.shared.consumed_signal.wait(&mut state);
        }
        if let Some(start) = waited {
            debug!(
                wait_secs = start.elapsed().as_secs_f64(),
                "command slot became available"
            );
        }
        state.staged.push_back(command);
    }
}

impl<F: RawFile> Drop for DiskQueue<F> {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
        }
        self.shared.ready_signal.notify_one();
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
    }
}

/// A single block-aligned block used to zero-pad direct-I/O write tails.
struct BounceBlock {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the block is owned and only touched by the dispatch thread.
unsafe impl Send for BounceBlock {}

impl BounceBlock {
    fn new(block_size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(block_size, block_size)?;
        // SAFETY: block sizes are validated non-zero powers of two.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr)
            .ok_or_else(|| eyre::eyre!("failed to allocate the bounce block"))?;
        Ok(Self { ptr, layout })
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the allocation is layout.size() bytes and exclusively
        // owned through &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for BounceBlock {
    fn drop(&mut self) {
        // SAFETY: allocated with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// The dispatch-side state: file sets, the heap's release half, and the
/// bounce block for direct-I/O tails.
struct Dispatcher<F: RawFile> {
    sets: Vec<FileSet<F>>,
    heap: Arc<WorkHeap>,
    block_size: usize,
    use_direct_io: bool,
    bounce: BounceBlock,
}

impl<F: RawFile> Dispatcher<F> {
    fn run(&mut self, shared: &QueueShared) {
        let mut batch: Vec<Command> = Vec::with_capacity(DISPATCH_BATCH_SIZE);
        loop {
            {
                let mut state = shared.state.lock();
                while state.ready.is_empty() && !state.shutdown {
                    shared.ready_signal.wait(&mut state);
                }
                if state.ready.is_empty() {
                    return;
                }
                let take = state.ready.len().min(DISPATCH_BATCH_SIZE);
                batch.extend(state.ready.drain(..take));
            }
            shared.consumed_signal.notify_all();

            for command in batch.drain(..) {
                debug!(command = command.name(), "executing");
                if let Err(err) = self.execute(&command) {
                    let code = os_error_code(&err);
                    error!("fatal scratch I/O failure: {err:#}");
                    std::process::exit(code);
                }
            }
        }
    }

    fn execute(&mut self, command: &Command) -> Result<()> {
        match *command {
            Command::WriteBuckets { file_id, addr, ref sizes } => {
                self.write_buckets(file_id, addr, sizes)
            }
            Command::WriteFile { file_id, bucket, addr, size } => {
                // SAFETY: the heap keeps the buffer at `addr` alive until
                // its ReleaseBuffer command executes, which the producer
                // ordered after this write.
                let data = unsafe { std::slice::from_raw_parts(addr as *const u8, size) };
                self.write_to_file(file_id, bucket, data)
            }
            Command::ReadFile { file_id, bucket, addr, size } => {
                let read_size = if self.use_direct_io {
                    round_up_to(size, self.block_size)
                } else {
                    size
                };
                // SAFETY: read buffers are heap-lent and block-rounded, so
                // `read_size` bytes are valid; aliveness as above.
                let buf =
                    unsafe { std::slice::from_raw_parts_mut(addr as *mut u8, read_size) };
                let set = &mut self.sets[file_id.index()];
                read_exact(&mut set.files[bucket as usize], buf).wrap_err_with(|| {
                    format!("failed to read from '{}.{}'", file_id.name(), bucket)
                })
            }
            Command::SeekFile { file_id, bucket, offset, origin } => {
                let set = &mut self.sets[file_id.index()];
                set.files[bucket as usize]
                    .seek(origin.to_seek_from(offset))
                    .wrap_err_with(|| {
                        format!("failed to seek '{}.{}'", file_id.name(), bucket)
                    })?;
                Ok(())
            }
            Command::SeekBucket { file_id, offset, origin } => {
                let set = &mut self.sets[file_id.index()];
                for (bucket, file) in set.files.iter_mut().enumerate() {
                    file.seek(origin.to_seek_from(offset)).wrap_err_with(|| {
                        format!("failed to seek '{}.{}'", file_id.name(), bucket)
                    })?;
                }
                Ok(())
            }
            Command::ReleaseBuffer { addr } => {
                self.heap.release(addr);
                Ok(())
            }
            Command::MemoryFence { ref signal } => {
                signal.signal();
                Ok(())
            }
        }
    }

    fn write_buckets(&mut self, file_id: FileId, addr: usize, sizes: &[u32]) -> Result<()> {
        debug_assert_eq!(sizes.len(), self.sets[file_id.index()].files.len());

        let block = self.block_size;
        let mut cursor = addr;
        for (bucket, &size) in sizes.iter().enumerate() {
            let size = size as usize;
            // Only write up to the block-aligned boundary; the caller owns
            // any sub-block remainder and re-submits it later.
            let write_size = if self.use_direct_io { size / block * block } else { size };

            // SAFETY: the source region is one heap buffer laid out by the
            // caller with each bucket starting block-aligned; aliveness is
            // guaranteed until the buffer's ReleaseBuffer executes.
            let data =
                unsafe { std::slice::from_raw_parts(cursor as *const u8, write_size) };
            self.write_to_file(file_id, bucket as u32, data)?;

            // Each bucket region starts at the next block boundary.
            cursor += if self.use_direct_io {
                round_up_to(size, block)
            } else {
                size
            };
        }
        Ok(())
    }

    fn write_to_file(&mut self, file_id: FileId, bucket: u32, data: &[u8]) -> Result<()> {
        let Self { sets, bounce, block_size, use_direct_io, .. } = self;
        let file = &mut sets[file_id.index()].files[bucket as usize];
        let context =
            || format!("failed to write to '{}.{}'", file_id.name(), bucket);

        if !*use_direct_io {
            return write_all(file, data).wrap_err_with(context);
        }

        let block = *block_size;
        let floor = data.len() / block * block;
        write_all(file, &data[..floor]).wrap_err_with(context)?;

        let remainder = data.len() - floor;
        if remainder > 0 {
            // The tail goes out as one full block: remainder bytes, then
            // zeros. Readers skip the padding via the extent manifest.
            let pad = bounce.as_mut_slice();
            pad[..remainder].copy_from_slice(&data[floor..]);
            pad[remainder..].fill(0);
            write_all(file, pad).wrap_err_with(context)?;
        }
        Ok(())
    }
}

fn write_all<F: RawFile>(file: &mut F, mut data: &[u8]) -> std::io::Result<()> {
    while !data.is_empty() {
        match file.write(data) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "file refused remaining bytes",
                ))
            }
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn read_exact<F: RawFile>(file: &mut F, mut buf: &mut [u8]) -> std::io::Result<()> {
    while !buf.is_empty() {
        match file.read(buf) {
            Ok(0) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "file ended before the requested length",
                ))
            }
            Ok(n) => buf = &mut buf[n..],
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn os_error_code(err: &eyre::Report) -> i32 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<std::io::Error>())
        .and_then(|io| io.raw_os_error())
        .unwrap_or(1)
}
