use strata_api::StrataResult;
use strata_base::{Serial, SerialSource};

pub const QUERY_POOL_SIZE: u32 = 64;
pub const SEMAPHORE_POOL_SIZE: u32 = 64;

#[derive(Copy, Clone, Debug)]
pub struct RecyclingPoolConfig {
    /// Entries per native pool
    pub pool_size: u32,
    /// Exceeding this is treated as a leak of outstanding entries
    pub max_pool_count: usize,
}

impl Default for RecyclingPoolConfig {
    fn default() -> Self {
        RecyclingPoolConfig {
            pool_size: QUERY_POOL_SIZE,
            max_pool_count: 99999,
        }
    }
}

/// Identifies one entry handed out by a [`RecyclingPool`]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolEntry {
    pub pool_index: usize,
    pub entry_index: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub freed_count: u32,
    /// Serial that was current when the most recent entry of the pool was freed
    pub serial: Serial,
}

/// Hands out entries from fixed-size native pools (query pools, groups of semaphores). Entries are
/// allocated linearly from the current pool. When it runs out, a pool whose every entry has been
/// freed and whose last free has completed on the GPU is recycled whole. Otherwise a new pool is
/// created.
///
/// Individual entries are never reused on their own, freeing only counts towards recycling the
/// pool that contains them.
pub struct RecyclingPool<P> {
    config: RecyclingPoolConfig,
    pools: Vec<P>,
    pool_stats: Vec<PoolStats>,
    current_pool: usize,
    current_free_entry: u32,
}

impl<P> RecyclingPool<P> {
    pub fn new(config: RecyclingPoolConfig) -> Self {
        assert!(config.pool_size > 0);
        RecyclingPool {
            config,
            pools: Vec::default(),
            pool_stats: Vec::default(),
            current_pool: 0,
            current_free_entry: 0,
        }
    }

    pub fn config(&self) -> &RecyclingPoolConfig {
        &self.config
    }

    pub fn pool_size(&self) -> u32 {
        self.config.pool_size
    }

    pub fn pools(&self) -> &[P] {
        &self.pools
    }

    pub fn pool(
        &self,
        pool_index: usize,
    ) -> &P {
        &self.pools[pool_index]
    }

    pub fn pool_stats(
        &self,
        pool_index: usize,
    ) -> PoolStats {
        self.pool_stats[pool_index]
    }

    pub fn current_pool_index(&self) -> usize {
        self.current_pool
    }

    fn is_current_pool_exhausted(&self) -> bool {
        self.pools.is_empty() || self.current_free_entry >= self.config.pool_size
    }

    /// Returns the next entry. `create_pool` is only called if no existing pool can be recycled.
    pub fn allocate_entry<F>(
        &mut self,
        serials: &dyn SerialSource,
        create_pool: F,
    ) -> StrataResult<PoolEntry>
    where
        F: FnOnce() -> StrataResult<P>,
    {
        if self.is_current_pool_exhausted() && !self.find_free_entry_pool(serials) {
            let pool = create_pool()?;
            self.allocate_new_entry_pool(pool);
        }

        let entry = PoolEntry {
            pool_index: self.current_pool,
            entry_index: self.current_free_entry,
        };
        self.current_free_entry += 1;
        Ok(entry)
    }

    /// Makes the first fully freed, GPU-complete pool current again. Returns false if there is none.
    pub fn find_free_entry_pool(
        &mut self,
        serials: &dyn SerialSource,
    ) -> bool {
        let pool_size = self.config.pool_size;
        let recyclable = self.pool_stats.iter().position(|stats| {
            stats.freed_count == pool_size && !serials.is_serial_in_use(stats.serial)
        });

        match recyclable {
            Some(pool_index) => {
                log::trace!("Recycling pool {}", pool_index);
                self.current_pool = pool_index;
                self.current_free_entry = 0;
                self.pool_stats[pool_index].freed_count = 0;
                true
            }
            None => false,
        }
    }

    /// Appends a freshly created pool and makes it current. Returns its index.
    pub fn allocate_new_entry_pool(
        &mut self,
        pool: P,
    ) -> usize {
        assert!(
            self.pools.len() < self.config.max_pool_count,
            "Exceeded {} pools, entries are probably not being freed",
            self.config.max_pool_count
        );

        self.pools.push(pool);
        self.pool_stats.push(PoolStats::default());

        self.current_pool = self.pools.len() - 1;
        self.current_free_entry = 0;

        log::debug!(
            "Allocated pool {} of {} entries",
            self.current_pool,
            self.config.pool_size
        );

        self.current_pool
    }

    /// Records the current serial against the pool so it is not recycled until that work completes
    pub fn on_entry_freed(
        &mut self,
        serials: &dyn SerialSource,
        pool_index: usize,
    ) {
        assert!(pool_index < self.pool_stats.len());
        let stats = &mut self.pool_stats[pool_index];
        assert!(
            stats.freed_count < self.config.pool_size,
            "Freed more entries than pool {} holds",
            pool_index
        );

        stats.serial = serials.current_serial();
        stats.freed_count += 1;
    }

    /// Removes every pool so the caller can destroy them. The allocator starts over empty.
    pub fn take_pools(&mut self) -> Vec<P> {
        self.pool_stats.clear();
        self.current_pool = 0;
        self.current_free_entry = 0;
        std::mem::take(&mut self.pools)
    }
}
