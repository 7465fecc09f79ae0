use crate::{RecyclingPool, RecyclingPoolConfig};
use ash::vk;
use strata_api::{DeviceContext, StrataResult};
use strata_base::SerialSource;

/// Semaphores created in groups of `pool_size`. A group is recycled once all of its semaphores have
/// been freed and the GPU has moved past the last free.
pub struct DynamicSemaphorePool {
    pool: RecyclingPool<Vec<vk::Semaphore>>,
}

impl DynamicSemaphorePool {
    /// Creates the first group of semaphores up front
    pub fn new(
        device: &dyn DeviceContext,
        config: RecyclingPoolConfig,
    ) -> StrataResult<Self> {
        let mut pool = RecyclingPool::new(config);
        let semaphores = Self::create_semaphores(device, config.pool_size)?;
        pool.allocate_new_entry_pool(semaphores);

        Ok(DynamicSemaphorePool { pool })
    }

    fn create_semaphores(
        device: &dyn DeviceContext,
        count: u32,
    ) -> StrataResult<Vec<vk::Semaphore>> {
        let mut semaphores = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match device.create_semaphore() {
                Ok(semaphore) => semaphores.push(semaphore),
                Err(e) => {
                    log::error!("Failed to create semaphore: {}", e);
                    for semaphore in semaphores {
                        device.destroy_semaphore(semaphore);
                    }
                    return Err(e);
                }
            }
        }

        Ok(semaphores)
    }

    pub fn pool_count(&self) -> usize {
        self.pool.pools().len()
    }

    pub fn allocate_semaphore(
        &mut self,
        device: &dyn DeviceContext,
        serials: &dyn SerialSource,
    ) -> StrataResult<SemaphoreHelper> {
        let pool_size = self.pool.pool_size();
        let entry = self.pool.allocate_entry(serials, || {
            Self::create_semaphores(device, pool_size)
        })?;

        Ok(SemaphoreHelper {
            pool_index: entry.pool_index,
            semaphore: self.pool.pool(entry.pool_index)[entry.entry_index as usize],
        })
    }

    /// Does nothing if the helper holds no semaphore
    pub fn free_semaphore(
        &mut self,
        serials: &dyn SerialSource,
        semaphore: &mut SemaphoreHelper,
    ) {
        if semaphore.valid() {
            self.pool
                .on_entry_freed(serials, semaphore.pool_index);
            *semaphore = SemaphoreHelper::default();
        }
    }

    /// The device must be idle
    pub fn destroy(
        &mut self,
        device: &dyn DeviceContext,
    ) {
        for semaphores in self.pool.take_pools() {
            for semaphore in semaphores {
                device.destroy_semaphore(semaphore);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct SemaphoreHelper {
    pool_index: usize,
    semaphore: vk::Semaphore,
}

impl SemaphoreHelper {
    pub fn valid(&self) -> bool {
        self.semaphore != vk::Semaphore::null()
    }

    pub fn semaphore(&self) -> vk::Semaphore {
        self.semaphore
    }

    pub fn pool_index(&self) -> usize {
        self.pool_index
    }
}
