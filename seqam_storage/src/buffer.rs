//! Shared buffer pool with 2Q replacement. Buffers are pinned while a
//! handle exists and carry an exclusive content lock handed out as an
//! owned guard.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{lock_api::ArcMutexGuard, Mutex, RawMutex};

use crate::engine::StorageEngine;
use crate::page::Page;
use crate::wal::{in_critical_section, WalWriter};
use crate::{BlockNumber, BufferTag, ForkNumber, RelFileLocator, Result, StorageError, PAGE_SIZE};

struct FrameContent {
    page: Page,
    dirty: bool,
}

/// In-memory buffer frame containing a page.
struct BufferFrame {
    tag: BufferTag,
    pin_count: AtomicU32,
    content: Arc<Mutex<FrameContent>>,
}

impl BufferFrame {
    fn new(tag: BufferTag, page: Page) -> Self {
        Self {
            tag,
            pin_count: AtomicU32::new(0),
            content: Arc::new(Mutex::new(FrameContent { page, dirty: false })),
        }
    }

    fn pin(self: &Arc<Self>) -> Buffer {
        self.pin_count.fetch_add(1, Ordering::AcqRel);
        Buffer {
            frame: Arc::clone(self),
        }
    }

    fn is_pinned(&self) -> bool {
        self.pin_count.load(Ordering::Acquire) > 0
    }
}

/// Pinned buffer. The page cannot be evicted while this handle lives.
pub struct Buffer {
    frame: Arc<BufferFrame>,
}

impl Buffer {
    /// Block identity.
    pub fn tag(&self) -> BufferTag {
        self.frame.tag
    }

    /// Block number inside its fork.
    pub fn block_number(&self) -> BlockNumber {
        self.frame.tag.block
    }

    /// Take the exclusive content lock, blocking until it is free.
    pub fn lock_exclusive(self) -> LockedBuffer {
        let guard = self.frame.content.lock_arc();
        LockedBuffer {
            guard,
            buffer: self,
        }
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.frame.pin_count.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Pinned and exclusively locked buffer. Dropping it unlocks, then unpins.
pub struct LockedBuffer {
    guard: ArcMutexGuard<RawMutex, FrameContent>,
    buffer: Buffer,
}

impl LockedBuffer {
    /// Block identity.
    pub fn tag(&self) -> BufferTag {
        self.buffer.tag()
    }

    /// Block number inside its fork.
    pub fn block_number(&self) -> BlockNumber {
        self.buffer.block_number()
    }

    /// Page contents.
    pub fn page(&self) -> &Page {
        &self.guard.page
    }

    /// Mutable page contents. Callers must mark the buffer dirty.
    pub fn page_mut(&mut self) -> &mut Page {
        &mut self.guard.page
    }

    /// Record that the page must be written back.
    pub fn mark_dirty(&mut self) {
        self.guard.dirty = true;
    }

    /// Record a change that is safe to lose, such as a hint bit.
    pub fn mark_dirty_hint(&mut self) {
        self.guard.dirty = true;
    }

    /// Whether the page differs from storage.
    pub fn is_dirty(&self) -> bool {
        self.guard.dirty
    }
}

struct PoolInner {
    /// Main buffer list (Am) – LRU.
    am: VecDeque<BufferTag>,
    /// Recent-in list (A1in) – FIFO.
    a1_in: VecDeque<BufferTag>,
    /// Recent-out ghost list (A1out) – stores tags only.
    a1_out: VecDeque<BufferTag>,
    /// Mapping from tag to frame.
    frames: HashMap<BufferTag, Arc<BufferFrame>>,
}

impl PoolInner {
    /// Touch a tag when it is accessed.
    fn touch(&mut self, tag: BufferTag) {
        if let Some(pos) = self.am.iter().position(|&t| t == tag) {
            // Move to front (MRU)
            self.am.remove(pos);
            self.am.push_front(tag);
        } else if let Some(pos) = self.a1_in.iter().position(|&t| t == tag) {
            // Promote to Am
            self.a1_in.remove(pos);
            self.am.push_front(tag);
        }
    }

    fn forget(&mut self, tag: BufferTag) {
        self.am.retain(|&t| t != tag);
        self.a1_in.retain(|&t| t != tag);
        self.a1_out.retain(|&t| t != tag);
        self.frames.remove(&tag);
    }
}

/// Adaptive 2Q buffer pool over a storage manager.
pub struct BufferPool {
    storage: Arc<dyn StorageEngine>,
    wal: Option<Arc<WalWriter>>,
    /// Maximum number of pages in the cache.
    capacity: usize,
    inner: Mutex<PoolInner>,
}

impl BufferPool {
    /// Create a new buffer pool with given capacity (in pages).
    pub fn new(storage: Arc<dyn StorageEngine>, capacity: usize) -> Self {
        Self {
            storage,
            wal: None,
            capacity: capacity.max(1),
            inner: Mutex::new(PoolInner {
                am: VecDeque::new(),
                a1_in: VecDeque::new(),
                a1_out: VecDeque::new(),
                frames: HashMap::new(),
            }),
        }
    }

    /// Enforce WAL-before-data: dirty pages are written only after the WAL
    /// covering their LSN is durable.
    pub fn with_wal(mut self, wal: Arc<WalWriter>) -> Self {
        self.wal = Some(wal);
        self
    }

    /// Underlying storage manager.
    pub fn storage(&self) -> &Arc<dyn StorageEngine> {
        &self.storage
    }

    /// Pin a block, reading it from storage on a miss.
    pub fn read_buffer(&self, tag: BufferTag) -> Result<Buffer> {
        debug_assert!(!in_critical_section(), "buffer read inside critical section");
        let mut inner = self.inner.lock();
        if let Some(frame) = inner.frames.get(&tag).cloned() {
            // Hit in buffer – update lists.
            inner.touch(tag);
            return Ok(frame.pin());
        }

        // Miss – need to allocate.
        let mut page = Page::new_zeroed();
        self.storage.read_block(tag, page.as_bytes_mut())?;
        if let Err((computed, stored)) = page.verify_checksum() {
            return Err(StorageError::ChecksumMismatch {
                tag,
                computed,
                stored,
            });
        }
        self.ensure_capacity(&mut inner)?;
        Ok(self.install(&mut inner, tag, page))
    }

    /// Add a zeroed block at the end of a fork and pin it.
    pub fn extend(&self, locator: RelFileLocator, fork: ForkNumber) -> Result<Buffer> {
        debug_assert!(!in_critical_section(), "relation extended inside critical section");
        let mut inner = self.inner.lock();
        let block = self.storage.nblocks(locator, fork)?;
        let tag = BufferTag::new(locator, fork, block);
        self.ensure_capacity(&mut inner)?;
        self.storage.extend(tag, &[0u8; PAGE_SIZE])?;
        Ok(self.install(&mut inner, tag, Page::new_zeroed()))
    }

    /// Pin `tag`, creating the fork and extending it as needed. Used by redo,
    /// where storage may lag behind the WAL.
    pub fn read_buffer_extended(&self, tag: BufferTag) -> Result<Buffer> {
        self.storage.create_fork(tag.locator, tag.fork, true)?;
        loop {
            let nblocks = self.storage.nblocks(tag.locator, tag.fork)?;
            if nblocks > tag.block {
                return self.read_buffer(tag);
            }
            drop(self.extend(tag.locator, tag.fork)?);
        }
    }

    fn install(&self, inner: &mut PoolInner, tag: BufferTag, page: Page) -> Buffer {
        let frame = Arc::new(BufferFrame::new(tag, page));
        inner.frames.insert(tag, Arc::clone(&frame));
        if let Some(pos) = inner.a1_out.iter().position(|&t| t == tag) {
            // Seen recently – goes straight to the hot list.
            inner.a1_out.remove(pos);
            inner.am.push_front(tag);
        } else {
            inner.a1_in.push_front(tag);
        }
        frame.pin()
    }

    /// Ensure there is space for a new page by evicting if necessary.
    fn ensure_capacity(&self, inner: &mut PoolInner) -> Result<()> {
        if inner.frames.len() < self.capacity {
            return Ok(());
        }
        // Eviction policy based on 2Q: oldest of A1in first, then LRU of Am.
        let candidates = inner
            .a1_in
            .iter()
            .rev()
            .map(|&t| (t, true))
            .chain(inner.am.iter().rev().map(|&t| (t, false)))
            .collect::<Vec<_>>();
        for (tag, recent) in candidates {
            let Some(frame) = inner.frames.get(&tag).cloned() else {
                continue;
            };
            if frame.is_pinned() {
                continue;
            }
            let Some(mut content) = frame.content.try_lock() else {
                continue;
            };
            if content.dirty {
                self.write_back(tag, &mut content)?;
            }
            drop(content);
            inner.forget(tag);
            if recent {
                inner.a1_out.push_front(tag);
                let ghost_limit = (self.capacity / 2).max(1);
                inner.a1_out.truncate(ghost_limit);
            }
            return Ok(());
        }
        Err(StorageError::NoUnpinnedBuffers(self.capacity))
    }

    fn write_back(&self, tag: BufferTag, content: &mut FrameContent) -> Result<()> {
        if let Some(wal) = &self.wal {
            wal.flush(content.page.lsn())?;
        }
        content.page.set_checksum();
        self.storage.write_block(tag, content.page.as_bytes())?;
        content.dirty = false;
        Ok(())
    }

    fn frames_matching(&self, pred: impl Fn(&BufferTag) -> bool) -> Vec<Arc<BufferFrame>> {
        self.inner
            .lock()
            .frames
            .values()
            .filter(|f| pred(&f.tag))
            .cloned()
            .collect()
    }

    /// Write back every dirty page of a relation.
    pub fn flush_relation(&self, locator: RelFileLocator) -> Result<()> {
        for frame in self.frames_matching(|t| t.locator == locator) {
            let mut content = frame.content.lock();
            if content.dirty {
                self.write_back(frame.tag, &mut content)?;
            }
        }
        Ok(())
    }

    /// Write back every dirty page (checkpoint).
    pub fn flush_all(&self) -> Result<usize> {
        let mut written = 0;
        for frame in self.frames_matching(|_| true) {
            let mut content = frame.content.lock();
            if content.dirty {
                self.write_back(frame.tag, &mut content)?;
                written += 1;
            }
        }
        Ok(written)
    }

    /// Forget every cached page of a relation without writing it.
    pub fn drop_relation_buffers(&self, locator: RelFileLocator) {
        let mut inner = self.inner.lock();
        let tags: Vec<_> = inner
            .frames
            .keys()
            .filter(|t| t.locator == locator)
            .copied()
            .collect();
        for tag in tags {
            inner.forget(tag);
        }
    }

    /// Whether `tag` is resident.
    pub fn is_cached(&self, tag: BufferTag) -> bool {
        self.inner.lock().frames.contains_key(&tag)
    }

    /// Number of resident pages.
    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    /// Whether no page is resident.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
