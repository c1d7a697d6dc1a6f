//! Durable pool: a memory-mapped heap with a fixed root object.
//!
//! The pool is a single mapping laid out as
//!
//! ```text
//! 0      64                    64 + size_of::<RootObject>()
//! +------+---------------------+--------------------------------------+
//! |header| root (shard heads)  | bump-allocated objects (64B aligned) |
//! +------+---------------------+--------------------------------------+
//! ```
//!
//! Objects are never freed. Everything stored in the pool is addressed by a
//! [`DurableRef`] (an offset from the mapping base), never by a raw pointer,
//! so a pool can be remapped at a different address after a restart.
//!
//! Durability is explicit: a writer stores into the mapping and then calls
//! [`DurablePool::persist`] on the bytes it changed. How far `persist` pushes
//! the data is chosen by [`FlushMode`]. A failed flush, like exhaustion in the
//! middle of an index operation, cannot be rolled back and aborts the process.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::marker::PhantomData;
use std::mem::{align_of, size_of};
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering, fence};

use memmap2::MmapMut;

use crate::config::{FlushMode, PoolConfig};
use crate::constants::{CACHE_LINE, HEAD_COUNT, LAYOUT_VERSION};
use crate::error::PoolError;
use crate::ordering::{CAS_FAILURE, CAS_SUCCESS, READ_ORD, RELAXED, WRITE_ORD};
use crate::tracing_helpers::{debug_log, error_log};

/// Header magic: "PHASTIDX".
const POOL_MAGIC: u64 = u64::from_le_bytes(*b"PHASTIDX");

/// Offset of the root object.
pub const ROOT_OFFSET: u64 = size_of::<PoolHeader>() as u64;

/// Offset of the first allocation.
pub const HEAP_START: u64 = align_up(ROOT_OFFSET + size_of::<RootObject>() as u64, CACHE_LINE as u64);

/// Smallest pool accepted by [`DurablePool::open_or_create`].
pub const MIN_POOL_SIZE: u64 = 1 << 16;

const fn align_up(n: u64, align: u64) -> u64 {
    (n + align - 1) & !(align - 1)
}

// ============================================================================
//  Layout
// ============================================================================

/// First cache line of the pool.
#[repr(C, align(64))]
struct PoolHeader {
    magic: AtomicU64,
    layout: AtomicU32,
    initialized: AtomicU32,
    capacity: AtomicU64,
    cursor: AtomicU64,
}

/// Fixed root object: per-shard offset of the first leaf group.
#[repr(C, align(64))]
pub struct RootObject {
    heads: [AtomicU64; HEAD_COUNT],
}

impl RootObject {
    /// Offset of the first leaf group of `shard`, 0 if unset.
    #[inline]
    #[must_use]
    pub fn head(&self, shard: usize) -> u64 {
        self.heads[shard].load(READ_ORD)
    }

    /// Record the first leaf group of `shard`. Caller persists.
    #[inline]
    pub fn set_head(&self, shard: usize, offset: u64) {
        self.heads[shard].store(offset, WRITE_ORD);
    }

    /// The slot for `shard`, for persisting.
    #[inline]
    #[must_use]
    pub fn head_slot(&self, shard: usize) -> &AtomicU64 {
        &self.heads[shard]
    }
}

/// Types that may live in the pool.
///
/// # Safety
///
/// The all-zero bit pattern must be a valid value, the type must not own heap
/// memory or hold pointers, and every field mutated after allocation must be
/// an atomic (the pool only ever hands out shared references).
pub unsafe trait Durable: Sized {}

// SAFETY: atomics only, zero is a valid value.
unsafe impl Durable for RootObject {}

// ============================================================================
//  DurableRef
// ============================================================================

/// Typed offset of an object inside a [`DurablePool`].
pub struct DurableRef<T> {
    offset: NonZeroU64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> DurableRef<T> {
    /// Wrap a raw offset. Returns `None` for the null offset.
    #[inline]
    #[must_use]
    pub const fn from_offset(offset: u64) -> Option<Self> {
        match NonZeroU64::new(offset) {
            Some(offset) => Some(Self {
                offset,
                _marker: PhantomData,
            }),
            None => None,
        }
    }

    /// Raw offset from the pool base.
    #[inline]
    #[must_use]
    pub const fn offset(self) -> u64 {
        self.offset.get()
    }
}

impl<T> Clone for DurableRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DurableRef<T> {}

impl<T> PartialEq for DurableRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}

impl<T> Eq for DurableRef<T> {}

impl<T> fmt::Debug for DurableRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DurableRef({:#x})", self.offset)
    }
}

// ============================================================================
//  DurablePool
// ============================================================================

/// A mapped pool of durable memory.
pub struct DurablePool {
    map: MmapMut,
    /// Base of `map`, taken once so shared references never go through `&mut`.
    base: *mut u8,
    len: u64,
    flush: FlushMode,
    path: Option<PathBuf>,
}

// SAFETY: `base` points into `map`, which lives as long as the pool. All
// mutation through it goes to `Durable` objects made of atomics.
unsafe impl Send for DurablePool {}
unsafe impl Sync for DurablePool {}

impl fmt::Debug for DurablePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurablePool")
            .field("path", &self.path)
            .field("len", &self.len)
            .field("used", &self.used())
            .field("flush", &self.flush)
            .finish_non_exhaustive()
    }
}

impl DurablePool {
    /// Open the pool described by `config`.
    ///
    /// # Errors
    ///
    /// See [`open_or_create`](Self::open_or_create) and [`anonymous`](Self::anonymous).
    pub fn from_config(config: &PoolConfig) -> Result<Self, PoolError> {
        match &config.path {
            Some(path) => Self::open_or_create(path, config.size, config.flush),
            None => Self::anonymous(config.size),
        }
    }

    /// Open the pool file at `path`, creating and zero-filling it with
    /// `size` bytes if it does not exist or is empty.
    ///
    /// # Errors
    ///
    /// - [`PoolError::Io`] if the file cannot be opened, sized or mapped.
    /// - [`PoolError::TooSmall`] if a new pool would be below [`MIN_POOL_SIZE`].
    /// - [`PoolError::BadMagic`], [`PoolError::LayoutMismatch`] or
    ///   [`PoolError::SizeMismatch`] if an existing file fails validation.
    pub fn open_or_create(path: &Path, size: u64, flush: FlushMode) -> Result<Self, PoolError> {
        let file: File = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let existing_len: u64 = file.metadata()?.len();

        if existing_len == 0 {
            if size < MIN_POOL_SIZE {
                return Err(PoolError::TooSmall {
                    size,
                    min: MIN_POOL_SIZE,
                });
            }
            file.set_len(size)?;
            // SAFETY: the file is owned by this process for the pool's lifetime.
            let map: MmapMut = unsafe { MmapMut::map_mut(&file)? };
            let pool = Self::from_map(map, flush, Some(path.to_path_buf()));
            pool.format(size);
            debug_log!(path = %path.display(), size, "created pool");
            return Ok(pool);
        }

        if existing_len < MIN_POOL_SIZE {
            return Err(PoolError::BadMagic {
                path: path.to_path_buf(),
            });
        }

        // SAFETY: as above.
        let map: MmapMut = unsafe { MmapMut::map_mut(&file)? };
        let pool = Self::from_map(map, flush, Some(path.to_path_buf()));
        pool.validate(path, existing_len)?;
        debug_log!(
            path = %path.display(),
            size = existing_len,
            used = pool.used(),
            initialized = pool.is_initialized(),
            "opened pool"
        );
        Ok(pool)
    }

    /// Anonymous pool of `size` bytes. Contents vanish with the pool, so
    /// flushes reduce to fences.
    ///
    /// # Errors
    ///
    /// [`PoolError::TooSmall`] below [`MIN_POOL_SIZE`], [`PoolError::Io`] if
    /// the mapping fails.
    pub fn anonymous(size: u64) -> Result<Self, PoolError> {
        if size < MIN_POOL_SIZE {
            return Err(PoolError::TooSmall {
                size,
                min: MIN_POOL_SIZE,
            });
        }
        let len = usize::try_from(size).map_err(|_| PoolError::TooSmall {
            size,
            min: MIN_POOL_SIZE,
        })?;
        let map: MmapMut = MmapMut::map_anon(len)?;
        let pool = Self::from_map(map, FlushMode::Fence, None);
        pool.format(size);
        Ok(pool)
    }

    fn from_map(mut map: MmapMut, flush: FlushMode, path: Option<PathBuf>) -> Self {
        let base: *mut u8 = map.as_mut_ptr();
        let len = map.len() as u64;
        Self {
            map,
            base,
            len,
            flush,
            path,
        }
    }

    fn format(&self, size: u64) {
        let header = self.header();
        header.layout.store(LAYOUT_VERSION, RELAXED);
        header.initialized.store(0, RELAXED);
        header.capacity.store(size, RELAXED);
        header.cursor.store(HEAP_START, RELAXED);
        // Magic goes last so a torn format is never mistaken for a pool.
        self.persist(header);
        header.magic.store(POOL_MAGIC, WRITE_ORD);
        self.persist(header);
    }

    fn validate(&self, path: &Path, file_len: u64) -> Result<(), PoolError> {
        let header = self.header();
        if header.magic.load(READ_ORD) != POOL_MAGIC {
            return Err(PoolError::BadMagic {
                path: path.to_path_buf(),
            });
        }
        let found = header.layout.load(READ_ORD);
        if found != LAYOUT_VERSION {
            return Err(PoolError::LayoutMismatch {
                expected: LAYOUT_VERSION,
                found,
            });
        }
        let capacity = header.capacity.load(READ_ORD);
        if capacity != file_len {
            return Err(PoolError::SizeMismatch {
                header: capacity,
                actual: file_len,
            });
        }
        let cursor = header.cursor.load(READ_ORD);
        if !(HEAP_START..=capacity).contains(&cursor) {
            return Err(PoolError::OutOfBounds { offset: cursor });
        }
        Ok(())
    }

    #[inline(always)]
    fn header(&self) -> &PoolHeader {
        // SAFETY: the mapping is at least MIN_POOL_SIZE bytes, page aligned,
        // and the header is made of atomics.
        unsafe { &*self.base.cast::<PoolHeader>() }
    }

    /// The root object.
    #[inline(always)]
    #[must_use]
    pub fn root(&self) -> &RootObject {
        // SAFETY: ROOT_OFFSET is inside the mapping and 64-byte aligned.
        unsafe { &*self.base.add(ROOT_OFFSET as usize).cast::<RootObject>() }
    }

    /// Whether an index finished `create` on this pool.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.header().initialized.load(READ_ORD) != 0
    }

    /// Mark the pool as holding a complete index and persist the flag.
    pub fn mark_initialized(&self) {
        let header = self.header();
        header.initialized.store(1, WRITE_ORD);
        self.persist(&header.initialized);
    }

    /// Backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Mapping length in bytes.
    #[must_use]
    pub const fn capacity(&self) -> u64 {
        self.len
    }

    /// Bytes handed out so far, header and root included.
    #[must_use]
    pub fn used(&self) -> u64 {
        self.header().cursor.load(READ_ORD)
    }

    /// Flush policy in effect.
    #[must_use]
    pub const fn flush_mode(&self) -> FlushMode {
        self.flush
    }

    // ========================================================================
    //  Allocation
    // ========================================================================

    /// Allocate a zeroed `T` and return its offset.
    ///
    /// The allocation cursor is persisted before the object is zeroed, so a
    /// crash never hands the same bytes out twice.
    ///
    /// # Errors
    ///
    /// [`PoolError::Exhausted`] if the pool has no room left.
    pub fn allocate_zeroed<T: Durable>(&self) -> Result<DurableRef<T>, PoolError> {
        let align = align_of::<T>().max(CACHE_LINE) as u64;
        let size = size_of::<T>() as u64;
        let header = self.header();

        let mut cursor = header.cursor.load(READ_ORD);
        let start = loop {
            let start = align_up(cursor, align);
            let end = start + size;
            if end > self.len {
                return Err(PoolError::Exhausted {
                    requested: end - cursor,
                    remaining: self.len.saturating_sub(cursor),
                });
            }
            match header
                .cursor
                .compare_exchange_weak(cursor, end, CAS_SUCCESS, CAS_FAILURE)
            {
                Ok(_) => break start,
                Err(current) => cursor = current,
            }
        };
        self.persist(&header.cursor);

        // SAFETY: [start, start + size) is inside the mapping and was just
        // reserved by the CAS above, so no other thread touches it.
        unsafe {
            std::ptr::write_bytes(self.base.add(start as usize), 0, size as usize);
        }

        // `start` is nonzero: it is at least HEAP_START.
        DurableRef::from_offset(start).ok_or(PoolError::OutOfBounds { offset: start })
    }

    /// Resolve a reference handed out by this pool.
    #[inline(always)]
    #[must_use]
    pub fn get<T: Durable>(&self, r: DurableRef<T>) -> &T {
        debug_assert!(
            r.offset() >= HEAP_START && r.offset() + size_of::<T>() as u64 <= self.len,
            "durable ref {r:?} outside pool"
        );
        // SAFETY: references come from `allocate_zeroed` on this pool or from
        // `try_get`, both of which bounds- and alignment-check the offset.
        unsafe { &*self.base.add(r.offset() as usize).cast::<T>() }
    }

    /// Resolve an untrusted offset read back from media.
    ///
    /// # Errors
    ///
    /// [`PoolError::OutOfBounds`] if the object does not lie inside the
    /// allocated heap, [`PoolError::Misaligned`] if the offset is misaligned.
    pub fn try_get<T: Durable>(&self, offset: u64) -> Result<(DurableRef<T>, &T), PoolError> {
        let align = align_of::<T>();
        let end = offset.checked_add(size_of::<T>() as u64);
        if offset < HEAP_START || end.is_none_or(|end| end > self.used()) {
            return Err(PoolError::OutOfBounds { offset });
        }
        if offset % align as u64 != 0 {
            return Err(PoolError::Misaligned { offset, align });
        }
        let r = DurableRef::from_offset(offset).ok_or(PoolError::OutOfBounds { offset })?;
        Ok((r, self.get(r)))
    }

    // ========================================================================
    //  Persistence
    // ========================================================================

    /// Make `value` durable.
    #[inline]
    pub fn persist<U>(&self, value: &U) {
        self.persist_range(std::ptr::from_ref(value).cast::<u8>(), size_of::<U>());
    }

    /// Make `len` bytes starting at `ptr` durable. `ptr` must point into the pool.
    pub fn persist_range(&self, ptr: *const u8, len: usize) {
        let offset = (ptr as usize).wrapping_sub(self.base as usize);
        debug_assert!(offset as u64 + len as u64 <= self.len, "persist outside pool");

        let result = match self.flush {
            FlushMode::Sync => self.map.flush_range(offset, len),
            FlushMode::Async => self.map.flush_async_range(offset, len),
            FlushMode::Fence => Ok(()),
        };
        fence(Ordering::SeqCst);

        if let Err(err) = result {
            fatal(&err);
        }
    }

    /// Flush the whole mapping synchronously.
    ///
    /// # Errors
    ///
    /// [`PoolError::Io`] if `msync` fails.
    pub fn sync_all(&self) -> Result<(), PoolError> {
        if self.path.is_some() {
            self.map.flush()?;
        }
        fence(Ordering::SeqCst);
        Ok(())
    }
}

/// Log and abort. Used where a durable update cannot be rolled back.
#[cold]
#[allow(unused_variables, reason = "only read by error_log")]
pub(crate) fn fatal(err: &dyn fmt::Display) -> ! {
    error_log!(error = %err, "unrecoverable pool failure");
    std::process::abort()
}
