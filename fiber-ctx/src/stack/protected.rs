use {
    super::{AllocationError, StackBlock, StackPolicy, StackProvider, page_size},
    os_ext::{MAP_PRIVATE, MAP_STACK, PROT_NONE, PROT_READ, PROT_WRITE},
    std::ptr::NonNull,
    tracing::{error, trace},
};

/// Stack provider that maps a fresh block for every fiber.
///
/// Each block is preceded by guard pages,
/// so that a stack overflow faults instead of corrupting memory.
/// Mapping and protecting memory takes several system calls,
/// which makes this provider comparatively expensive.
#[derive(Clone, Debug, Default)]
pub struct ProtectedStack
{
    policy: StackPolicy,
}

impl ProtectedStack
{
    /// Create a provider that sizes stacks according to `policy`.
    pub fn new(policy: StackPolicy) -> Self
    {
        Self{policy}
    }

    /// The policy this provider sizes stacks with.
    pub fn policy(&self) -> &StackPolicy
    {
        &self.policy
    }

    /// Map a fresh block.
    ///
    /// Unlike [`StackProvider::allocate`] this needs no exclusive access.
    pub fn map(&self) -> Result<StackBlock, AllocationError>
    {
        let page_size = page_size()?;
        let stack_size = self.policy.stack_size(page_size)?;
        let guard_size = self.policy.guard_size(page_size)?;
        let map_size = stack_size.checked_add(guard_size)
            .ok_or(AllocationError::TooLarge(self.policy.size))?;

        let mapping = os_ext::mmap_anonymous(
            map_size,
            PROT_READ | PROT_WRITE,
            MAP_PRIVATE | MAP_STACK,
        ).map_err(AllocationError::Map)?;

        if guard_size != 0 {
            // SAFETY: The mapping is fresh and not used by anything yet.
            let protected = unsafe {
                os_ext::mprotect(mapping, guard_size, PROT_NONE)
            };
            if let Err(err) = protected {
                // SAFETY: The mapping is fresh and not used by anything yet.
                if let Err(err) = unsafe { os_ext::munmap(mapping, map_size) } {
                    error!(%err, ?mapping, "Cannot unmap stack");
                }
                return Err(AllocationError::Protect(err));
            }
        }

        // SAFETY: The guard region lies within the mapping.
        let bottom = unsafe {
            NonNull::new_unchecked(mapping.as_ptr().add(guard_size))
        };

        trace!(?bottom, stack_size, guard_size, "Mapped stack");

        // SAFETY: Mappings are page-aligned and sizes are whole pages.
        Ok(unsafe { StackBlock::from_raw_parts(bottom, stack_size) })
    }

    /// Unmap a block produced by [`map`][`Self::map`].
    ///
    /// # Safety
    ///
    /// The block must have been produced by a provider with the same policy,
    /// must not be in use anymore, and must not be unmapped twice.
    pub unsafe fn unmap(&self, block: StackBlock)
    {
        // map succeeded with this policy, so this cannot fail now.
        let guard_size = page_size()
            .and_then(|page_size| self.policy.guard_size(page_size))
            .expect("Guard size was computed when mapping");

        let mapping = NonNull::new_unchecked(
            block.bottom().as_ptr().sub(guard_size),
        );

        match os_ext::munmap(mapping, block.len() + guard_size) {
            Ok(()) => trace!(bottom = ?block.bottom(), "Unmapped stack"),
            Err(err) => error!(%err, bottom = ?block.bottom(),
                               "Cannot unmap stack"),
        }
    }
}

// SAFETY: Every block is a fresh mapping until it is deallocated.
unsafe impl StackProvider for ProtectedStack
{
    fn allocate(&mut self) -> Result<StackBlock, AllocationError>
    {
        self.map()
    }

    fn deallocate(&mut self, block: StackBlock)
    {
        // SAFETY: The block came from allocate and is no longer used.
        unsafe { self.unmap(block) }
    }
}
