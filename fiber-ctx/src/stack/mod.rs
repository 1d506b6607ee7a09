//! Stack memory for fibers.
//!
//! A fiber runs on a [stack block] that it obtains from a [stack provider]
//! when it is initialized, and gives back when it is cleared.
//! There are two kinds of provider:
//!
//!  - [`ProtectedStack`] maps a fresh block with a guard page
//!    for every fiber, and unmaps it afterwards.
//!  - [`PooledStack`] hands out one block that was mapped earlier,
//!    and never unmaps it. A [`StackPool`] keeps such blocks around
//!    so that successive fibers can reuse them.
//!
//! [stack block]: `StackBlock`
//! [stack provider]: `StackProvider`

pub use self::{pool::*, pooled::*, protected::*};

use {
    crate::switch::STACK_ALIGN,
    serde::{Deserialize, Serialize},
    std::{io, ptr::NonNull, sync::OnceLock},
    thiserror::Error,
};

mod pool;
mod pooled;
mod protected;

/// Smallest stack size a provider hands out.
///
/// A task that panics unwinds on its fiber's stack, and the panic hook
/// and the unwinder together need tens of kilobytes there.
/// Stacks of 16 KiB overflow into the guard page while unwinding.
pub const MIN_STACK_SIZE: usize = 64 * 1024;

/// Stack size used when none is configured.
pub const DEFAULT_STACK_SIZE: usize = 64 * 1024;

/// Region of memory usable as a call stack.
///
/// A stack block is only a description of the region; it does not own it.
/// The region is owned by the provider that produced the block.
/// Stacks grow downwards, from [`top`] towards [`bottom`].
///
/// [`top`]: `Self::top`
/// [`bottom`]: `Self::bottom`
#[allow(clippy::len_without_is_empty)]
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct StackBlock
{
    bottom: NonNull<u8>,
    len: usize,
}

// SAFETY: A stack block is just an address and a length.
unsafe impl Send for StackBlock { }
unsafe impl Sync for StackBlock { }

/// Source of stack blocks.
///
/// # Safety
///
/// Every block returned by [`allocate`] must be readable and writable
/// and must be at least [`MIN_STACK_SIZE`] bytes large.
/// It must stay so until it is passed to [`deallocate`] or,
/// if the provider never frees it, until the provider is dropped.
/// It must not be in use by anything else in the meantime,
/// in particular not by a fiber using a different provider.
///
/// [`allocate`]: `Self::allocate`
/// [`deallocate`]: `Self::deallocate`
pub unsafe trait StackProvider
{
    /// Obtain a stack block.
    fn allocate(&mut self) -> Result<StackBlock, AllocationError>;

    /// Give back a block obtained from [`allocate`][`Self::allocate`].
    fn deallocate(&mut self, block: StackBlock);
}

/// Returned when no stack memory is available.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum AllocationError
{
    #[error("Cannot determine page size: {0}")]
    PageSize(#[source] io::Error),

    /// The configured size overflows once rounded and guarded.
    #[error("Cannot allocate a stack of {0} bytes")]
    TooLarge(usize),

    #[error("Cannot map stack memory: {0}")]
    Map(#[source] io::Error),

    #[error("Cannot protect stack guard pages: {0}")]
    Protect(#[source] io::Error),

    /// Every block of the pool is leased.
    #[error("All {capacity} stacks of the pool are in use")]
    PoolExhausted{capacity: usize},
}

/// How to size stacks.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct StackPolicy
{
    /// Usable size of each stack in bytes.
    ///
    /// This is rounded up to a whole number of pages,
    /// and raised to [`MIN_STACK_SIZE`] if smaller.
    pub size: usize,

    /// Number of inaccessible pages below each stack.
    pub guard_pages: usize,
}

impl StackBlock
{
    /// Describe the region of `len` bytes starting at `bottom`.
    ///
    /// # Safety
    ///
    /// The region must be a single allocation, `bottom + len`
    /// must be aligned to 16 bytes, and `len` must be at least
    /// [`MIN_STACK_SIZE`].
    pub unsafe fn from_raw_parts(bottom: NonNull<u8>, len: usize) -> Self
    {
        debug_assert!(len >= MIN_STACK_SIZE);
        debug_assert!((bottom.as_ptr() as usize + len) % STACK_ALIGN == 0);
        Self{bottom, len}
    }

    /// Lowest address of the region.
    pub fn bottom(&self) -> NonNull<u8>
    {
        self.bottom
    }

    /// Address just past the highest byte of the region.
    pub fn top(&self) -> NonNull<u8>
    {
        // SAFETY: One past the end of an allocation is never null.
        unsafe { NonNull::new_unchecked(self.bottom.as_ptr().add(self.len)) }
    }

    /// Size of the region in bytes.
    pub fn len(&self) -> usize
    {
        self.len
    }
}

impl StackPolicy
{
    /// Usable stack size after rounding to whole pages.
    pub fn stack_size(&self, page_size: usize)
        -> Result<usize, AllocationError>
    {
        self.size.max(MIN_STACK_SIZE)
            .checked_next_multiple_of(page_size)
            .ok_or(AllocationError::TooLarge(self.size))
    }

    /// Size of the guard region in bytes.
    pub fn guard_size(&self, page_size: usize)
        -> Result<usize, AllocationError>
    {
        self.guard_pages.checked_mul(page_size)
            .ok_or(AllocationError::TooLarge(self.size))
    }
}

impl Default for StackPolicy
{
    fn default() -> Self
    {
        Self{size: DEFAULT_STACK_SIZE, guard_pages: 1}
    }
}

/// The page size of the system.
///
/// It is queried once and cached for the remainder of the process.
pub fn page_size() -> Result<usize, AllocationError>
{
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();

    if let Some(&page_size) = PAGE_SIZE.get() {
        return Ok(page_size);
    }

    let page_size = os_ext::sysconf(os_ext::_SC_PAGESIZE)
        .map_err(AllocationError::PageSize)?
        .and_then(|page_size| usize::try_from(page_size).ok())
        .filter(|page_size| page_size.is_power_of_two())
        .ok_or_else(|| {
            let err = io::Error::other("Page size is not a power of two");
            AllocationError::PageSize(err)
        })?;

    Ok(*PAGE_SIZE.get_or_init(|| page_size))
}
