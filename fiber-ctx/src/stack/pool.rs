use {
    super::{
        AllocationError,
        PooledStack,
        ProtectedStack,
        StackBlock,
        StackPolicy,
        StackProvider,
    },
    serde::{Deserialize, Serialize},
    std::sync::{Arc, Mutex, MutexGuard, PoisonError},
    tracing::{debug, trace},
};

/// Stack pool configuration.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(default)]
pub struct PoolConfig
{
    /// Maximum number of blocks the pool maps.
    pub capacity: usize,

    /// How to size and protect the blocks.
    pub stack: StackPolicy,
}

/// Pool of reusable stack blocks.
///
/// Blocks are mapped on demand, up to the configured capacity.
/// A block is handed out as a [`PoolLease`], which is a [stack provider]
/// for exactly that block. Dropping the lease returns the block to the pool.
/// Returned blocks are handed out again most-recently-returned first,
/// as their memory is the most likely to still be cached.
///
/// Blocks are unmapped when the pool and all its leases are gone,
/// or earlier with [`trim`].
///
/// [stack provider]: `StackProvider`
/// [`trim`]: `Self::trim`
#[derive(Clone, Debug)]
pub struct StackPool
{
    shared: Arc<Shared>,
}

/// Exclusive use of one block of a [`StackPool`].
#[derive(Debug)]
pub struct PoolLease
{
    shared: Arc<Shared>,
    stack: PooledStack,
}

#[derive(Debug)]
struct Shared
{
    capacity: usize,
    provider: ProtectedStack,
    state: Mutex<State>,
}

#[derive(Debug, Default)]
struct State
{
    /// Blocks that are not leased.
    free: Vec<StackBlock>,

    /// Number of blocks mapped or being mapped.
    ///
    /// Leased blocks are those counted here but not in `free`.
    allocated: usize,
}

impl StackPool
{
    /// Create an empty pool.
    pub fn new(config: PoolConfig) -> Self
    {
        debug!(capacity = config.capacity, stack_size = config.stack.size,
               "Created stack pool");
        let shared = Shared{
            capacity: config.capacity,
            provider: ProtectedStack::new(config.stack),
            state: Mutex::new(State::default()),
        };
        Self{shared: Arc::new(shared)}
    }

    /// Create an empty pool with default stacks.
    pub fn with_capacity(capacity: usize) -> Self
    {
        Self::new(PoolConfig{capacity, ..PoolConfig::default()})
    }

    /// Maximum number of blocks the pool maps.
    pub fn capacity(&self) -> usize
    {
        self.shared.capacity
    }

    /// Number of blocks currently mapped.
    pub fn allocated_count(&self) -> usize
    {
        self.shared.lock().allocated
    }

    /// Number of mapped blocks that are not leased.
    pub fn free_count(&self) -> usize
    {
        self.shared.lock().free.len()
    }

    /// Lease a block.
    ///
    /// Reuses a free block if there is one, otherwise maps a new one.
    /// Fails with [`AllocationError::PoolExhausted`]
    /// if all blocks are leased and the pool is at capacity.
    pub fn acquire(&self) -> Result<PoolLease, AllocationError>
    {
        let free = self.shared.lock().free.pop();
        let block = match free {
            Some(block) => block,
            None        => self.shared.map_new()?,
        };

        trace!(bottom = ?block.bottom(), "Leased pooled stack");

        // SAFETY: The block is not free, so the lease has exclusive use.
        // The shared state keeps it mapped for as long as the lease exists.
        let stack = unsafe { PooledStack::new(block) };
        Ok(PoolLease{shared: self.shared.clone(), stack})
    }

    /// Map free blocks until at least `count` blocks are free.
    ///
    /// Stops early at capacity. Returns the number of blocks mapped.
    pub fn prefill(&self, count: usize) -> Result<usize, AllocationError>
    {
        let mut mapped = 0;
        while self.free_count() < count {
            let block = match self.shared.map_new() {
                Ok(block) => block,
                Err(AllocationError::PoolExhausted{..}) => break,
                Err(err) => return Err(err),
            };
            self.shared.lock().free.push(block);
            mapped += 1;
        }
        Ok(mapped)
    }

    /// Unmap all free blocks.
    ///
    /// Returns the number of blocks unmapped.
    pub fn trim(&self) -> usize
    {
        let free = {
            let mut state = self.shared.lock();
            let free = std::mem::take(&mut state.free);
            state.allocated -= free.len();
            free
        };

        for &block in &free {
            // SAFETY: Free blocks are not in use.
            unsafe { self.shared.provider.unmap(block) };
        }

        debug!(count = free.len(), "Trimmed stack pool");
        free.len()
    }
}

impl Shared
{
    fn lock(&self) -> MutexGuard<'_, State>
    {
        // The state is consistent between statements.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Map a block that counts towards the capacity.
    fn map_new(&self) -> Result<StackBlock, AllocationError>
    {
        {
            let mut state = self.lock();
            if state.allocated >= self.capacity {
                return Err(AllocationError::PoolExhausted{
                    capacity: self.capacity,
                });
            }
            state.allocated += 1;
        }

        // Map without holding the lock; mapping takes system calls.
        self.provider.map().map_err(|err| {
            self.lock().allocated -= 1;
            err
        })
    }

    fn release(&self, block: StackBlock)
    {
        trace!(bottom = ?block.bottom(), "Returned pooled stack");
        self.lock().free.push(block);
    }
}

impl Drop for Shared
{
    fn drop(&mut self)
    {
        let state = self.state.get_mut()
            .unwrap_or_else(PoisonError::into_inner);

        // Leases keep the shared state alive, so every block is free now.
        debug_assert_eq!(state.free.len(), state.allocated);

        for &block in &state.free {
            // SAFETY: Free blocks are not in use.
            unsafe { self.provider.unmap(block) };
        }

        debug!(count = state.free.len(), "Tore down stack pool");
    }
}

impl Default for PoolConfig
{
    fn default() -> Self
    {
        Self{capacity: 64, stack: StackPolicy::default()}
    }
}

impl PoolLease
{
    /// The leased block.
    pub fn block(&self) -> StackBlock
    {
        self.stack.block()
    }
}

// SAFETY: PooledStack upholds the contract; the pool keeps the block mapped.
unsafe impl StackProvider for PoolLease
{
    fn allocate(&mut self) -> Result<StackBlock, AllocationError>
    {
        self.stack.allocate()
    }

    fn deallocate(&mut self, block: StackBlock)
    {
        self.stack.deallocate(block)
    }
}

impl Drop for PoolLease
{
    fn drop(&mut self)
    {
        self.shared.release(self.stack.block());
    }
}
