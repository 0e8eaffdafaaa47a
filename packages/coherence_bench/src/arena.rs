use std::any::type_name;
use std::fmt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI32, Ordering};

use tracing::{debug, warn};

use crate::pal::{Bindings, BindingsFacade};
use crate::{Error, Result};

/// Number of elements in every shared buffer.
pub const BUFFER_LEN: usize = 32;

/// The value every element is initialized to by [`SharedArena::allocate()`].
///
/// This is the integer you get by filling each byte of an `i32` with `0x01`. It is nonzero, so a
/// freshly allocated buffer is never mistaken for an empty one.
pub const SENTINEL_FILL: i32 = 0x0101_0101;

/// The value of the first element that marks a buffer as empty (not ready for use).
pub const EMPTY_VALUE: i32 = 0;

type Cells = [AtomicI32; BUFFER_LEN];

const MAPPING_LEN: usize = size_of::<Cells>();

/// Owns the memory mapping that backs a [`SharedBuffer`].
///
/// The mapping is anonymous and shared, so it is visible to every thread of the process and also
/// to any child process created with `fork()` after allocation, without copy-on-write divergence.
/// The mapping is released when the arena is dropped.
pub struct SharedArena {
    region: NonNull<Cells>,
    bindings: BindingsFacade,
}

impl SharedArena {
    /// Maps a new shared buffer and fills every element with [`SENTINEL_FILL`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] if the operating system refuses to create the mapping.
    pub fn allocate() -> Result<Self> {
        Self::allocate_with_fill(SENTINEL_FILL)
    }

    /// Maps a new shared buffer and fills every element with `fill`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Allocation`] if the operating system refuses to create the mapping.
    pub fn allocate_with_fill(fill: i32) -> Result<Self> {
        Self::allocate_core(fill, BindingsFacade::target())
    }

    pub(crate) fn allocate_core(fill: i32, bindings: BindingsFacade) -> Result<Self> {
        let addr = bindings
            .mmap_shared_anonymous(MAPPING_LEN)
            .map_err(|source| Error::Allocation { source })?;

        let arena = Self {
            region: addr.cast(),
            bindings,
        };

        arena.buffer().fill(fill);

        debug!(len = BUFFER_LEN, fill, "shared buffer allocated");

        Ok(arena)
    }

    /// Returns a handle to the shared buffer.
    ///
    /// Handles are cheap to copy. Every copy, in this process or in a child forked after the
    /// allocation, refers to the same memory.
    #[must_use]
    pub fn buffer(&self) -> SharedBuffer<'_> {
        // SAFETY: The mapping is page-aligned, at least MAPPING_LEN bytes long and was zero-filled
        // by the kernel, which is a valid bit pattern for atomic integers. The borrow of `self`
        // keeps the mapping alive for as long as the reference exists.
        let cells = unsafe { self.region.as_ref() };

        SharedBuffer { cells }
    }
}

impl Drop for SharedArena {
    #[cfg_attr(test, mutants::skip)] // Impractical to test that memory stops being mapped.
    fn drop(&mut self) {
        // SAFETY: The region came from mmap_shared_anonymous() with the same length and no
        // SharedBuffer can outlive the arena, so nothing references the memory anymore.
        let result = unsafe { self.bindings.munmap(self.region.cast(), MAPPING_LEN) };

        if let Err(error) = result {
            warn!(%error, "failed to unmap shared buffer");
        }
    }
}

impl fmt::Debug for SharedArena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("buffer", &self.buffer())
            .finish_non_exhaustive()
    }
}

/// A handle to a fixed-length integer buffer in memory shared by all execution units.
///
/// Writes through any copy of the handle are visible through every other copy, including copies
/// held by a forked child process. Elements are individually atomic words but the buffer offers
/// no read-modify-write atomicity: two units that each load an element, compute a new value and
/// store it may lose one of the updates. Whether that can happen depends entirely on whether the
/// units coordinate through a [`CriticalSection`][crate::CriticalSection].
#[derive(Clone, Copy)]
pub struct SharedBuffer<'a> {
    cells: &'a Cells,
}

impl<'a> SharedBuffer<'a> {
    /// Number of elements in the buffer. Always [`BUFFER_LEN`].
    #[must_use]
    pub const fn len(self) -> usize {
        BUFFER_LEN
    }

    /// Whether the buffer is marked as empty, meaning its first element holds [`EMPTY_VALUE`].
    #[must_use]
    pub fn is_empty(self) -> bool {
        self.cells[0].load(Ordering::Relaxed) == EMPTY_VALUE
    }

    /// Reads the element at `index`, or `None` if the index is out of bounds.
    #[must_use]
    pub fn get(self, index: usize) -> Option<i32> {
        self.cells
            .get(index)
            .map(|cell| cell.load(Ordering::Relaxed))
    }

    /// Overwrites the element at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn set(self, index: usize, value: i32) {
        self.cells
            .get(index)
            .expect("index must be less than BUFFER_LEN")
            .store(value, Ordering::Relaxed);
    }

    /// Overwrites every element with `value`.
    pub fn fill(self, value: i32) {
        for cell in self.cells {
            cell.store(value, Ordering::Relaxed);
        }
    }

    /// Copies the current contents of the buffer.
    ///
    /// If other units are writing concurrently, the copy may mix values from different moments.
    #[must_use]
    pub fn snapshot(self) -> [i32; BUFFER_LEN] {
        self.cells.each_ref().map(|cell| cell.load(Ordering::Relaxed))
    }

    pub(crate) fn cells(self) -> &'a Cells {
        self.cells
    }
}

impl fmt::Debug for SharedBuffer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.snapshot()).finish()
    }
}
