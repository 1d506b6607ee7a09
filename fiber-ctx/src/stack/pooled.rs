use super::{AllocationError, StackBlock, StackProvider};

/// Stack provider that hands out one previously allocated block.
///
/// Every call to [`allocate`] returns the same block,
/// and [`deallocate`] does nothing; the block is never freed by this type.
/// Keeping track of which blocks are free is up to whoever
/// creates these providers, such as a [`StackPool`].
///
/// A reused block contains whatever its previous fiber left on it.
///
/// [`allocate`]: `StackProvider::allocate`
/// [`deallocate`]: `StackProvider::deallocate`
/// [`StackPool`]: `super::StackPool`
#[derive(Debug)]
pub struct PooledStack
{
    block: StackBlock,
}

impl PooledStack
{
    /// Create a provider for `block`.
    ///
    /// # Safety
    ///
    /// The block must be readable and writable for as long as
    /// the provider exists, and must not be used by anything else meanwhile.
    /// Its size must satisfy the contract of [`StackProvider`].
    pub unsafe fn new(block: StackBlock) -> Self
    {
        Self{block}
    }

    /// The block this provider hands out.
    pub fn block(&self) -> StackBlock
    {
        self.block
    }
}

// SAFETY: Exclusive use of the block is a precondition of PooledStack::new.
unsafe impl StackProvider for PooledStack
{
    fn allocate(&mut self) -> Result<StackBlock, AllocationError>
    {
        Ok(self.block)
    }

    fn deallocate(&mut self, block: StackBlock)
    {
        debug_assert_eq!(block, self.block, "Block from another provider");
    }
}
