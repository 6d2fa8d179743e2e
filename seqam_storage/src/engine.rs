//! Block storage managers: the trait upper layers use plus in-memory and
//! file-backed implementations.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::{BlockNumber, BufferTag, ForkNumber, Lsn, RelFileLocator, PAGE_SIZE};

/// Result type alias for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Storage layer errors.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Block beyond the end of the fork.
    #[error("could not read block {} in file \"{}{}\": read only {} blocks", .0.block, .0.locator, .0.fork.suffix(), .1)]
    NoSuchBlock(BufferTag, BlockNumber),
    /// Fork file missing.
    #[error("could not open file \"{}{}\": no such relation fork", .0, .1.suffix())]
    NoSuchFork(RelFileLocator, ForkNumber),
    /// Fork file already present.
    #[error("relation fork \"{}{}\" already exists", .0, .1.suffix())]
    ForkExists(RelFileLocator, ForkNumber),
    /// Stored page checksum does not match contents.
    #[error("page verification failed, calculated checksum {computed} but expected {stored} ({tag})")]
    ChecksumMismatch {
        /// Block that failed.
        tag: BufferTag,
        /// Checksum of the contents.
        computed: u16,
        /// Checksum in the header.
        stored: u16,
    },
    /// Page layout problem.
    #[error("invalid page: {0}")]
    InvalidPage(String),
    /// Item does not fit.
    #[error("not enough free space on page: need {needed}, have {free}")]
    PageFull {
        /// Bytes requested.
        needed: usize,
        /// Bytes available.
        free: usize,
    },
    /// Tuple bytes cannot be parsed.
    #[error("invalid tuple: {0}")]
    InvalidTuple(String),
    /// WAL stream cannot be parsed.
    #[error("invalid WAL record at {lsn}: {reason}")]
    CorruptWal {
        /// Start of the broken record.
        lsn: Lsn,
        /// What is wrong.
        reason: String,
    },
    /// Every buffer is pinned.
    #[error("no unpinned buffers available (pool of {0})")]
    NoUnpinnedBuffers(usize),
    /// IO error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Block-level storage manager: one file per relation fork.
pub trait StorageEngine: Send + Sync {
    /// Create an empty fork. Fails if it exists, unless `is_redo`.
    fn create_fork(&self, locator: RelFileLocator, fork: ForkNumber, is_redo: bool) -> Result<()>;

    /// Whether the fork exists.
    fn fork_exists(&self, locator: RelFileLocator, fork: ForkNumber) -> bool;

    /// Number of blocks in the fork.
    fn nblocks(&self, locator: RelFileLocator, fork: ForkNumber) -> Result<BlockNumber>;

    /// Append `block`, which must equal the current block count.
    fn extend(&self, tag: BufferTag, buf: &[u8; PAGE_SIZE]) -> Result<()>;

    /// Read a block into the provided buffer.
    fn read_block(&self, tag: BufferTag, buf: &mut [u8; PAGE_SIZE]) -> Result<()>;

    /// Overwrite an existing block.
    fn write_block(&self, tag: BufferTag, buf: &[u8; PAGE_SIZE]) -> Result<()>;

    /// Remove one fork. Missing forks are ignored.
    fn unlink_fork(&self, locator: RelFileLocator, fork: ForkNumber) -> Result<()>;

    /// Force the fork to durable storage.
    fn sync(&self, locator: RelFileLocator, fork: ForkNumber) -> Result<()>;

    /// Remove every fork of a relation.
    fn unlink(&self, locator: RelFileLocator) -> Result<()> {
        self.unlink_fork(locator, ForkNumber::Main)?;
        self.unlink_fork(locator, ForkNumber::Init)
    }

    /// Replace `dst` fork with a copy of `src` fork, block by block.
    fn copy_fork(&self, locator: RelFileLocator, src: ForkNumber, dst: ForkNumber) -> Result<()> {
        let nblocks = self.nblocks(locator, src)?;
        self.unlink_fork(locator, dst)?;
        self.create_fork(locator, dst, false)?;
        let mut buf = [0u8; PAGE_SIZE];
        for block in 0..nblocks {
            self.read_block(BufferTag::new(locator, src, block), &mut buf)?;
            self.extend(BufferTag::new(locator, dst, block), &buf)?;
        }
        self.sync(locator, dst)
    }
}

type ForkKey = (RelFileLocator, ForkNumber);

/// In-memory storage. Clones share contents, so a clone handed to a new
/// engine sees exactly the blocks written before a simulated crash.
#[derive(Default, Clone)]
pub struct MemStorage {
    forks: Arc<Mutex<HashMap<ForkKey, Vec<Box<[u8; PAGE_SIZE]>>>>>,
}

impl MemStorage {
    /// Empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of forks currently present.
    pub fn fork_count(&self) -> usize {
        self.forks.lock().len()
    }

    /// Independent copy of the current contents, as left on disk at this
    /// moment.
    pub fn snapshot(&self) -> Self {
        Self {
            forks: Arc::new(Mutex::new(self.forks.lock().clone())),
        }
    }
}

impl StorageEngine for MemStorage {
    fn create_fork(&self, locator: RelFileLocator, fork: ForkNumber, is_redo: bool) -> Result<()> {
        let mut forks = self.forks.lock();
        if forks.contains_key(&(locator, fork)) {
            if is_redo {
                return Ok(());
            }
            return Err(StorageError::ForkExists(locator, fork));
        }
        forks.insert((locator, fork), Vec::new());
        Ok(())
    }

    fn fork_exists(&self, locator: RelFileLocator, fork: ForkNumber) -> bool {
        self.forks.lock().contains_key(&(locator, fork))
    }

    fn nblocks(&self, locator: RelFileLocator, fork: ForkNumber) -> Result<BlockNumber> {
        self.forks
            .lock()
            .get(&(locator, fork))
            .map(|blocks| blocks.len() as BlockNumber)
            .ok_or(StorageError::NoSuchFork(locator, fork))
    }

    fn extend(&self, tag: BufferTag, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut forks = self.forks.lock();
        let blocks = forks
            .get_mut(&(tag.locator, tag.fork))
            .ok_or(StorageError::NoSuchFork(tag.locator, tag.fork))?;
        if tag.block as usize != blocks.len() {
            return Err(StorageError::InvalidPage(format!(
                "cannot extend {} at block {}, fork has {} blocks",
                tag.locator,
                tag.block,
                blocks.len()
            )));
        }
        blocks.push(Box::new(*buf));
        Ok(())
    }

    fn read_block(&self, tag: BufferTag, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        let forks = self.forks.lock();
        let blocks = forks
            .get(&(tag.locator, tag.fork))
            .ok_or(StorageError::NoSuchFork(tag.locator, tag.fork))?;
        let page = blocks
            .get(tag.block as usize)
            .ok_or(StorageError::NoSuchBlock(tag, blocks.len() as BlockNumber))?;
        buf.copy_from_slice(&page[..]);
        Ok(())
    }

    fn write_block(&self, tag: BufferTag, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut forks = self.forks.lock();
        let blocks = forks
            .get_mut(&(tag.locator, tag.fork))
            .ok_or(StorageError::NoSuchFork(tag.locator, tag.fork))?;
        let nblocks = blocks.len() as BlockNumber;
        let page = blocks
            .get_mut(tag.block as usize)
            .ok_or(StorageError::NoSuchBlock(tag, nblocks))?;
        page.copy_from_slice(buf);
        Ok(())
    }

    fn unlink_fork(&self, locator: RelFileLocator, fork: ForkNumber) -> Result<()> {
        self.forks.lock().remove(&(locator, fork));
        Ok(())
    }

    fn sync(&self, _locator: RelFileLocator, _fork: ForkNumber) -> Result<()> {
        Ok(())
    }
}

/// File-backed storage rooted at a data directory:
/// `<root>/base/<db>/<relnumber>[_init]`.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    handles: Mutex<HashMap<ForkKey, File>>,
}

impl FileStorage {
    /// Open (creating if needed) a storage directory.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("base"))?;
        Ok(Self {
            root,
            handles: Mutex::new(HashMap::new()),
        })
    }

    fn path(&self, locator: RelFileLocator, fork: ForkNumber) -> PathBuf {
        self.root
            .join("base")
            .join(locator.db_oid.to_string())
            .join(format!("{}{}", locator.rel_number, fork.suffix()))
    }

    fn with_file<T>(
        &self,
        locator: RelFileLocator,
        fork: ForkNumber,
        f: impl FnOnce(&mut File) -> Result<T>,
    ) -> Result<T> {
        let mut handles = self.handles.lock();
        if !handles.contains_key(&(locator, fork)) {
            let path = self.path(locator, fork);
            if !path.exists() {
                return Err(StorageError::NoSuchFork(locator, fork));
            }
            let file = OpenOptions::new().read(true).write(true).open(path)?;
            handles.insert((locator, fork), file);
        }
        match handles.get_mut(&(locator, fork)) {
            Some(file) => f(file),
            None => Err(StorageError::NoSuchFork(locator, fork)),
        }
    }
}

impl StorageEngine for FileStorage {
    fn create_fork(&self, locator: RelFileLocator, fork: ForkNumber, is_redo: bool) -> Result<()> {
        let path = self.path(locator, fork);
        if path.exists() {
            if is_redo {
                return Ok(());
            }
            return Err(StorageError::ForkExists(locator, fork));
        }
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        self.handles.lock().insert((locator, fork), file);
        Ok(())
    }

    fn fork_exists(&self, locator: RelFileLocator, fork: ForkNumber) -> bool {
        self.path(locator, fork).exists()
    }

    fn nblocks(&self, locator: RelFileLocator, fork: ForkNumber) -> Result<BlockNumber> {
        self.with_file(locator, fork, |file| {
            Ok((file.metadata()?.len() / PAGE_SIZE as u64) as BlockNumber)
        })
    }

    fn extend(&self, tag: BufferTag, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        self.with_file(tag.locator, tag.fork, |file| {
            let nblocks = file.metadata()?.len() / PAGE_SIZE as u64;
            if tag.block as u64 != nblocks {
                return Err(StorageError::InvalidPage(format!(
                    "cannot extend {} at block {}, fork has {} blocks",
                    tag.locator, tag.block, nblocks
                )));
            }
            file.seek(SeekFrom::Start(nblocks * PAGE_SIZE as u64))?;
            file.write_all(buf)?;
            Ok(())
        })
    }

    fn read_block(&self, tag: BufferTag, buf: &mut [u8; PAGE_SIZE]) -> Result<()> {
        self.with_file(tag.locator, tag.fork, |file| {
            let nblocks = (file.metadata()?.len() / PAGE_SIZE as u64) as BlockNumber;
            if tag.block >= nblocks {
                return Err(StorageError::NoSuchBlock(tag, nblocks));
            }
            file.seek(SeekFrom::Start(tag.block as u64 * PAGE_SIZE as u64))?;
            file.read_exact(buf)?;
            Ok(())
        })
    }

    fn write_block(&self, tag: BufferTag, buf: &[u8; PAGE_SIZE]) -> Result<()> {
        self.with_file(tag.locator, tag.fork, |file| {
            let nblocks = (file.metadata()?.len() / PAGE_SIZE as u64) as BlockNumber;
            if tag.block >= nblocks {
                return Err(StorageError::NoSuchBlock(tag, nblocks));
            }
            file.seek(SeekFrom::Start(tag.block as u64 * PAGE_SIZE as u64))?;
            file.write_all(buf)?;
            Ok(())
        })
    }

    fn unlink_fork(&self, locator: RelFileLocator, fork: ForkNumber) -> Result<()> {
        self.handles.lock().remove(&(locator, fork));
        match fs::remove_file(self.path(locator, fork)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn sync(&self, locator: RelFileLocator, fork: ForkNumber) -> Result<()> {
        self.with_file(locator, fork, |file| Ok(file.sync_data()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn locator() -> RelFileLocator {
        RelFileLocator {
            spc_oid: 1663,
            db_oid: 5,
            rel_number: 16384,
        }
    }

    fn exercise(storage: &dyn StorageEngine) {
        let loc = locator();
        assert!(!storage.fork_exists(loc, ForkNumber::Main));
        storage.create_fork(loc, ForkNumber::Main, false).unwrap();
        assert!(matches!(
            storage.create_fork(loc, ForkNumber::Main, false),
            Err(StorageError::ForkExists(..))
        ));
        storage.create_fork(loc, ForkNumber::Main, true).unwrap();

        let tag = BufferTag::new(loc, ForkNumber::Main, 0);
        let data = [7u8; PAGE_SIZE];
        storage.extend(tag, &data).unwrap();
        assert_eq!(storage.nblocks(loc, ForkNumber::Main).unwrap(), 1);
        assert!(storage
            .extend(BufferTag::new(loc, ForkNumber::Main, 5), &data)
            .is_err());

        let mut read_buf = [0u8; PAGE_SIZE];
        storage.read_block(tag, &mut read_buf).unwrap();
        assert_eq!(data, read_buf);

        storage.write_block(tag, &[9u8; PAGE_SIZE]).unwrap();
        storage.read_block(tag, &mut read_buf).unwrap();
        assert_eq!(read_buf[100], 9);
        assert!(matches!(
            storage.read_block(BufferTag::new(loc, ForkNumber::Main, 1), &mut read_buf),
            Err(StorageError::NoSuchBlock(..))
        ));

        storage.copy_fork(loc, ForkNumber::Main, ForkNumber::Init).unwrap();
        storage
            .read_block(BufferTag::new(loc, ForkNumber::Init, 0), &mut read_buf)
            .unwrap();
        assert_eq!(read_buf[0], 9);

        storage.unlink(loc).unwrap();
        assert!(!storage.fork_exists(loc, ForkNumber::Main));
        assert!(!storage.fork_exists(loc, ForkNumber::Init));
    }

    #[test]
    fn mem_storage_rw() {
        exercise(&MemStorage::new());
    }

    #[test]
    fn mem_storage_clones_share_blocks() {
        let a = MemStorage::new();
        let b = a.clone();
        a.create_fork(locator(), ForkNumber::Main, false).unwrap();
        assert!(b.fork_exists(locator(), ForkNumber::Main));
        assert_eq!(b.fork_count(), 1);
    }

    #[test]
    fn mem_storage_snapshot_is_detached() {
        let a = MemStorage::new();
        a.create_fork(locator(), ForkNumber::Main, false).unwrap();
        let b = a.snapshot();
        a.unlink(locator()).unwrap();
        assert_eq!(a.fork_count(), 0);
        assert!(b.fork_exists(locator(), ForkNumber::Main));
    }

    #[test]
    fn file_storage_rw() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        exercise(&storage);
    }

    #[test]
    fn file_storage_reopens_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let tag = BufferTag::new(locator(), ForkNumber::Main, 0);
        {
            let storage = FileStorage::open(dir.path()).unwrap();
            storage.create_fork(tag.locator, tag.fork, false).unwrap();
            storage.extend(tag, &[3u8; PAGE_SIZE]).unwrap();
            storage.sync(tag.locator, tag.fork).unwrap();
        }
        let storage = FileStorage::open(dir.path()).unwrap();
        let mut buf = [0u8; PAGE_SIZE];
        storage.read_block(tag, &mut buf).unwrap();
        assert_eq!(buf[PAGE_SIZE - 1], 3);
    }
}
