//! # Scratch File Streams
//!
//! One logical stream exists per `(FileId, bucket)` pair, backed by a plain
//! file named `<name>_<bucket>.tmp` under the work directory. Files are
//! opened once at queue construction and stay open until shutdown; the
//! dispatch thread is their only user after that.
//!
//! ## Direct I/O
//!
//! With direct I/O enabled the files are opened with `O_DIRECT`, which
//! obligates every transfer to be a multiple of the device block size from
//! a block-aligned buffer. The block size is taken from file metadata; all
//! files of a plot must agree on it or initialization fails, since one
//! work-heap alignment serves every stream.
//!
//! ## Test Seam
//!
//! The dispatcher is written against the [`RawFile`] trait rather than
//! concrete files, so tests can substitute recording or fault-injecting
//! backends.

use std::fs::OpenOptions;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};

#[cfg(not(unix))]
use crate::config::DEFAULT_BLOCK_SIZE;

/// Logical stream name. The `0`/`1` suffix pairs are double-buffered: a
/// stage reads one generation while writing the next, alternating with
/// table parity to avoid read-after-write hazards on the same files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileId {
    Y0,
    Y1,
    MetaA0,
    MetaA1,
    MetaB0,
    MetaB1,
    X,
}

impl FileId {
    pub const COUNT: usize = 7;

    pub const ALL: [FileId; Self::COUNT] = [
        FileId::Y0,
        FileId::Y1,
        FileId::MetaA0,
        FileId::MetaA1,
        FileId::MetaB0,
        FileId::MetaB1,
        FileId::X,
    ];

    /// Base file name for this stream.
    pub fn name(self) -> &'static str {
        match self {
            FileId::Y0 => "y0",
            FileId::Y1 => "y1",
            FileId::MetaA0 => "meta_a0",
            FileId::MetaA1 => "meta_a1",
            FileId::MetaB0 => "meta_b0",
            FileId::MetaB1 => "meta_b1",
            FileId::X => "x",
        }
    }

    pub fn index(self) -> usize {
        match self {
            FileId::Y0 => 0,
            FileId::Y1 => 1,
            FileId::MetaA0 => 2,
            FileId::MetaA1 => 3,
            FileId::MetaB0 => 4,
            FileId::MetaB1 => 5,
            FileId::X => 6,
        }
    }

    /// y stream for the given table parity (table index modulo 2).
    pub fn y(parity: u32) -> FileId {
        if parity & 1 == 0 { FileId::Y0 } else { FileId::Y1 }
    }

    pub fn meta_a(parity: u32) -> FileId {
        if parity & 1 == 0 { FileId::MetaA0 } else { FileId::MetaA1 }
    }

    pub fn meta_b(parity: u32) -> FileId {
        if parity & 1 == 0 { FileId::MetaB0 } else { FileId::MetaB1 }
    }
}

/// Where a seek offset is measured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    Start,
    Current,
    End,
}

impl SeekOrigin {
    pub fn to_seek_from(self, offset: i64) -> SeekFrom {
        match self {
            SeekOrigin::Start => SeekFrom::Start(offset as u64),
            SeekOrigin::Current => SeekFrom::Current(offset),
            SeekOrigin::End => SeekFrom::End(offset),
        }
    }
}

/// Minimal file backend the dispatcher drives.
///
/// Implemented by [`FileStream`] for real scratch files; tests provide
/// recording doubles.
pub trait RawFile: Send {
    /// Writes from `buf`, returning the number of bytes accepted.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Reads into `buf`, returning the number of bytes produced.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Moves the stream cursor.
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64>;

    /// Device block size governing direct-I/O alignment.
    fn block_size(&self) -> usize;
}

/// A real scratch file, optionally opened for direct I/O.
#[derive(Debug)]
pub struct FileStream {
    file: std::fs::File,
    block_size: usize,
}

impl FileStream {
    pub fn create(path: &Path, use_direct_io: bool) -> Result<Self> {
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true).truncate(true);

        #[cfg(target_os = "linux")]
        if use_direct_io {
            use std::os::unix::fs::OpenOptionsExt;
            opts.custom_flags(libc::O_DIRECT);
        }
        #[cfg(not(target_os = "linux"))]
        let _ = use_direct_io;

        let file = opts
            .open(path)
            .wrap_err_with(|| format!("failed to open scratch file '{}'", path.display()))?;

        let block_size = Self::probe_block_size(&file, path)?;

        Ok(Self { file, block_size })
    }

    #[cfg(unix)]
    fn probe_block_size(file: &std::fs::File, path: &Path) -> Result<usize> {
        use std::os::unix::fs::MetadataExt;
        let meta = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat scratch file '{}'", path.display()))?;
        let block_size = meta.blksize() as usize;
        ensure!(
            block_size >= 2,
            "invalid block size {} reported for '{}'",
            block_size,
            path.display()
        );
        Ok(block_size)
    }

    #[cfg(not(unix))]
    fn probe_block_size(_file: &std::fs::File, _path: &Path) -> Result<usize> {
        Ok(DEFAULT_BLOCK_SIZE)
    }
}

impl RawFile for FileStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }

    fn block_size(&self) -> usize {
        self.block_size
    }
}

/// All bucket files of one logical stream.
#[derive(Debug)]
pub struct FileSet<F> {
    pub id: FileId,
    pub files: Vec<F>,
}

impl<F: RawFile> FileSet<F> {
    pub fn new(id: FileId, files: Vec<F>) -> Self {
        Self { id, files }
    }

    pub fn name(&self) -> &'static str {
        self.id.name()
    }

    pub fn bucket_count(&self) -> usize {
        self.files.len()
    }
}

/// Opens every stream's bucket files under `work_dir` and validates that
/// they agree on one block size.
pub fn open_file_sets(
    work_dir: &Path,
    bucket_count: u32,
    use_direct_io: bool,
) -> Result<(Vec<FileSet<FileStream>>, usize)> {
    std::fs::create_dir_all(work_dir).wrap_err_with(|| {
        format!("failed to create work directory '{}'", work_dir.display())
    })?;

    let mut sets = Vec::with_capacity(FileId::COUNT);
    let mut block_size = None;

    for id in FileId::ALL {
        let mut files = Vec::with_capacity(bucket_count as usize);
        for bucket in 0..bucket_count {
            let path = work_dir.join(format!("{}_{}.tmp", id.name(), bucket));
            let file = FileStream::create(&path, use_direct_io)?;

            match block_size {
                None => block_size = Some(file.block_size()),
                Some(expected) => ensure!(
                    file.block_size() == expected,
                    "scratch files have differing block sizes: '{}' reports {}, expected {}",
                    path.display(),
                    file.block_size(),
                    expected
                ),
            }
            files.push(file);
        }
        sets.push(FileSet::new(id, files));
    }

    let block_size = block_size.expect("at least one file set is always opened");
    ensure!(
        block_size.is_power_of_two(),
        "device block size {} is not a power of two",
        block_size
    );

    Ok((sets, block_size))
}
