use ash::vk;
use std::cell::RefCell;
use std::rc::Rc;
use strata_api::{DeviceContext, GarbageObject, ResourceContext, StrataResult};
use strata_base::{ResourceUse, Serial, SerialSource};

pub const DEFAULT_DESCRIPTOR_POOL_MAX_SETS: u32 = 128;

#[derive(Copy, Clone, Debug)]
pub struct DescriptorPoolConfig {
    pub max_sets_per_pool: u32,
    /// Exceeding this is treated as a leak of bindings
    pub max_pool_count: usize,
}

impl Default for DescriptorPoolConfig {
    fn default() -> Self {
        DescriptorPoolConfig {
            max_sets_per_pool: DEFAULT_DESCRIPTOR_POOL_MAX_SETS,
            max_pool_count: 99999,
        }
    }
}

/// One native descriptor pool plus the bookkeeping needed to decide when it can be reset
#[derive(Debug, Default)]
pub struct DescriptorPoolHelper {
    descriptor_pool: vk::DescriptorPool,
    max_sets: u32,
    free_descriptor_sets: u32,
    serial: Serial,
}

impl DescriptorPoolHelper {
    pub fn valid(&self) -> bool {
        self.descriptor_pool != vk::DescriptorPool::null()
    }

    pub fn descriptor_pool(&self) -> vk::DescriptorPool {
        self.descriptor_pool
    }

    pub fn free_descriptor_set_count(&self) -> u32 {
        self.free_descriptor_sets
    }

    pub fn has_capacity(
        &self,
        descriptor_set_count: u32,
    ) -> bool {
        self.free_descriptor_sets >= descriptor_set_count
    }

    /// Prepares the pool for `max_sets` allocations. An existing pool of the same size is reset,
    /// otherwise a new native pool is created.
    fn init(
        &mut self,
        device: &dyn DeviceContext,
        pool_sizes: &[vk::DescriptorPoolSize],
        max_sets: u32,
    ) -> StrataResult<()> {
        if self.valid() && self.max_sets == max_sets {
            return self.reset(device);
        }

        if self.valid() {
            self.destroy(device);
        }

        self.descriptor_pool = device.create_descriptor_pool(max_sets, pool_sizes)?;
        log::trace!(
            "Created descriptor pool {:?} for {} sets",
            self.descriptor_pool,
            max_sets
        );
        self.max_sets = max_sets;
        self.free_descriptor_sets = max_sets;
        Ok(())
    }

    /// Frees every set allocated from the pool. The caller must know none of them are in use.
    pub fn reset(
        &mut self,
        device: &dyn DeviceContext,
    ) -> StrataResult<()> {
        device.reset_descriptor_pool(self.descriptor_pool)?;
        self.free_descriptor_sets = self.max_sets;
        Ok(())
    }

    pub fn allocate_sets(
        &mut self,
        device: &dyn DeviceContext,
        layouts: &[vk::DescriptorSetLayout],
    ) -> StrataResult<Vec<vk::DescriptorSet>> {
        let descriptor_set_count = layouts.len() as u32;
        assert!(self.has_capacity(descriptor_set_count));
        self.free_descriptor_sets -= descriptor_set_count;

        device.allocate_descriptor_sets(self.descriptor_pool, layouts)
    }

    /// Last serial known to reference sets from this pool
    pub fn serial(&self) -> Serial {
        self.serial
    }

    pub fn update_serial(
        &mut self,
        serial: Serial,
    ) {
        self.serial = self.serial.max(serial);
    }

    pub fn destroy(
        &mut self,
        device: &dyn DeviceContext,
    ) {
        if self.valid() {
            device.destroy_descriptor_pool(self.descriptor_pool);
            self.descriptor_pool = vk::DescriptorPool::null();
        }
        self.free_descriptor_sets = 0;
    }

    /// Destroys the pool once its serial has completed
    pub fn release(
        &mut self,
        ctx: &mut ResourceContext,
    ) {
        if self.valid() {
            let resource_use = ResourceUse::new();
            resource_use.update_serial(self.serial);
            ctx.collect_garbage(
                &resource_use,
                vec![GarbageObject::DescriptorPool(self.descriptor_pool)],
            );
            self.descriptor_pool = vk::DescriptorPool::null();
        }
        self.free_descriptor_sets = 0;
    }
}

type SharedDescriptorPool = Rc<RefCell<DescriptorPoolHelper>>;

/// A caller-held reference to the pool its descriptor sets came from. A bound pool is never reset,
/// even if its serial has completed.
#[derive(Default)]
pub struct DescriptorPoolBinding {
    pool: Option<SharedDescriptorPool>,
}

impl DescriptorPoolBinding {
    pub fn valid(&self) -> bool {
        self.pool.is_some()
    }

    /// Drops the reference without touching the pool's serial
    pub fn reset(&mut self) {
        self.pool = None;
    }

    pub fn pool(&self) -> Option<vk::DescriptorPool> {
        self.pool
            .as_ref()
            .map(|pool| pool.borrow().descriptor_pool())
    }

    fn set(
        &mut self,
        pool: &SharedDescriptorPool,
    ) {
        self.pool = Some(pool.clone());
    }
}

pub struct DescriptorSetAllocation {
    pub descriptor_sets: Vec<vk::DescriptorSet>,
    /// True if the allocation had to move to a pool other than the current one
    pub new_pool_allocated: bool,
}

/// Pool of descriptor pools, all created with the same per-set sizes. Allocation continues from the
/// binding's pool while it has room. Otherwise it moves to the current pool, and once that is full,
/// to the first pool that is unbound and finished on the GPU, or to a brand new one.
pub struct DescriptorPoolManager {
    config: DescriptorPoolConfig,
    set_sizes: Vec<vk::DescriptorPoolSize>,
    pool_sizes: Vec<vk::DescriptorPoolSize>,
    descriptor_pools: Vec<SharedDescriptorPool>,
    current_pool_index: usize,
}

impl DescriptorPoolManager {
    /// `set_sizes` gives the descriptor counts a single set needs. The first pool is created
    /// immediately.
    pub fn new(
        device: &dyn DeviceContext,
        config: DescriptorPoolConfig,
        set_sizes: &[vk::DescriptorPoolSize],
    ) -> StrataResult<Self> {
        let mut manager = DescriptorPoolManager {
            config,
            set_sizes: set_sizes.to_vec(),
            pool_sizes: Vec::default(),
            descriptor_pools: Vec::default(),
            current_pool_index: 0,
        };

        manager.update_pool_sizes();

        let mut pool = DescriptorPoolHelper::default();
        pool.init(device, &manager.pool_sizes, config.max_sets_per_pool)?;
        manager
            .descriptor_pools
            .push(Rc::new(RefCell::new(pool)));

        Ok(manager)
    }

    fn update_pool_sizes(&mut self) {
        let max_sets = self.config.max_sets_per_pool;
        self.pool_sizes = self
            .set_sizes
            .iter()
            .map(|set_size| vk::DescriptorPoolSize {
                ty: set_size.ty,
                descriptor_count: set_size.descriptor_count * max_sets,
            })
            .collect();
    }

    pub fn config(&self) -> &DescriptorPoolConfig {
        &self.config
    }

    pub fn pool_count(&self) -> usize {
        self.descriptor_pools.len()
    }

    pub fn current_pool_index(&self) -> usize {
        self.current_pool_index
    }

    fn is_referenced(pool: &SharedDescriptorPool) -> bool {
        Rc::strong_count(pool) > 1
    }

    pub fn allocate_sets_and_get_info(
        &mut self,
        device: &dyn DeviceContext,
        serials: &dyn SerialSource,
        layouts: &[vk::DescriptorSetLayout],
        binding: &mut DescriptorPoolBinding,
    ) -> StrataResult<DescriptorSetAllocation> {
        let descriptor_set_count = layouts.len() as u32;
        let mut new_pool_allocated = false;

        let bound_pool = binding
            .pool
            .as_ref()
            .filter(|pool| pool.borrow().has_capacity(descriptor_set_count))
            .cloned();

        let pool = match bound_pool {
            Some(pool) => pool,
            None => {
                if !self.descriptor_pools[self.current_pool_index]
                    .borrow()
                    .has_capacity(descriptor_set_count)
                {
                    self.allocate_new_pool(device, serials)?;
                    new_pool_allocated = true;
                }

                // Sets from the old pool may still be referenced by recorded commands. The serial
                // is only consulted when looking for a pool to reuse, so this is the only place it
                // needs to move.
                if let Some(old_pool) = &binding.pool {
                    old_pool
                        .borrow_mut()
                        .update_serial(serials.current_serial());
                }

                let current_pool = &self.descriptor_pools[self.current_pool_index];
                binding.set(current_pool);
                current_pool.clone()
            }
        };

        let descriptor_sets = pool.borrow_mut().allocate_sets(device, layouts)?;

        Ok(DescriptorSetAllocation {
            descriptor_sets,
            new_pool_allocated,
        })
    }

    /// Makes the first unbound, GPU-complete pool current after resetting it, or appends a new pool
    #[profiling::function]
    pub fn allocate_new_pool(
        &mut self,
        device: &dyn DeviceContext,
        serials: &dyn SerialSource,
    ) -> StrataResult<()> {
        let reusable = self.descriptor_pools.iter().position(|pool| {
            !Self::is_referenced(pool) && !serials.is_serial_in_use(pool.borrow().serial())
        });

        match reusable {
            Some(pool_index) => {
                log::debug!("Reusing descriptor pool {}", pool_index);
                self.current_pool_index = pool_index;
            }
            None => {
                assert!(
                    self.descriptor_pools.len() < self.config.max_pool_count,
                    "Exceeded {} descriptor pools, bindings are probably leaking",
                    self.config.max_pool_count
                );

                self.descriptor_pools
                    .push(Rc::new(RefCell::new(DescriptorPoolHelper::default())));
                self.current_pool_index = self.descriptor_pools.len() - 1;
                log::debug!(
                    "Allocating descriptor pool {}",
                    self.current_pool_index
                );
            }
        }

        self.descriptor_pools[self.current_pool_index]
            .borrow_mut()
            .init(device, &self.pool_sizes, self.config.max_sets_per_pool)
    }

    /// Takes effect for pools created or recycled from now on
    pub fn set_max_sets_per_pool_for_testing(
        &mut self,
        max_sets_per_pool: u32,
    ) {
        self.config.max_sets_per_pool = max_sets_per_pool;
        self.update_pool_sizes();
    }

    /// The device must be idle and no binding may refer to any pool
    pub fn destroy(
        &mut self,
        device: &dyn DeviceContext,
    ) {
        for pool in self.descriptor_pools.drain(..) {
            assert!(!Self::is_referenced(&pool), "Destroyed a bound descriptor pool");
            pool.borrow_mut().destroy(device);
        }
        self.current_pool_index = 0;
    }

    /// Hands every pool to the garbage collector. No binding may refer to any pool.
    pub fn release(
        &mut self,
        ctx: &mut ResourceContext,
    ) {
        for pool in self.descriptor_pools.drain(..) {
            assert!(!Self::is_referenced(&pool), "Released a bound descriptor pool");
            pool.borrow_mut().release(ctx);
        }
        self.current_pool_index = 0;
    }
}
