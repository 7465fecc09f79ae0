//! A device that never talks to a GPU. Objects are handed out as fresh handles, host-visible memory
//! is backed by a `Vec<u8>`, and every command is recorded so callers can inspect the exact barrier
//! sequence a helper produced.

use crate::{
    CommandRecorder, DeviceContext, DeviceMemory, ExternalMemoryImport, ImageDef, StrataError,
    StrataResult,
};
use ash::vk;
use ash::vk::Handle;
use fnv::{FnvHashMap, FnvHashSet};
use std::sync::{Mutex, MutexGuard};

#[derive(Clone, Debug)]
pub struct HeadlessDeviceConfig {
    pub non_coherent_atom_size: vk::DeviceSize,
    /// Whether host-visible memory is also reported as host-coherent
    pub host_coherent: bool,
    pub queue_family_index: u32,
}

impl Default for HeadlessDeviceConfig {
    fn default() -> Self {
        HeadlessDeviceConfig {
            non_coherent_atom_size: 16,
            host_coherent: true,
            queue_family_index: 0,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MappedRange {
    pub memory: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

struct HeadlessMemory {
    data: Vec<u8>,
    property_flags: vk::MemoryPropertyFlags,
    mapped: bool,
    import: Option<ExternalMemoryImport>,
}

struct HeadlessDescriptorPool {
    max_sets: u32,
    allocated_sets: u32,
}

#[derive(Default)]
struct HeadlessDeviceState {
    next_handle: u64,
    buffers: FnvHashMap<vk::Buffer, vk::DeviceSize>,
    images: FnvHashMap<vk::Image, ImageDef>,
    memory: FnvHashMap<vk::DeviceMemory, HeadlessMemory>,
    descriptor_pools: FnvHashMap<vk::DescriptorPool, HeadlessDescriptorPool>,
    query_pools: FnvHashSet<vk::QueryPool>,
    semaphores: FnvHashSet<vk::Semaphore>,

    created_buffer_count: usize,
    created_image_count: usize,
    created_descriptor_pool_count: usize,
    created_query_pool_count: usize,
    created_semaphore_count: usize,

    flushed_ranges: Vec<MappedRange>,
    invalidated_ranges: Vec<MappedRange>,
    fail_next_allocation: bool,
}

impl HeadlessDeviceState {
    fn allocate_handle(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn allocate_memory(
        &mut self,
        size: vk::DeviceSize,
        required_flags: vk::MemoryPropertyFlags,
        host_coherent: bool,
    ) -> StrataResult<DeviceMemory> {
        if self.fail_next_allocation {
            self.fail_next_allocation = false;
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY.into());
        }

        let mut property_flags = required_flags;
        if host_coherent && required_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            property_flags |= vk::MemoryPropertyFlags::HOST_COHERENT;
        }

        let memory = vk::DeviceMemory::from_raw(self.allocate_handle());
        self.memory.insert(
            memory,
            HeadlessMemory {
                data: vec![0; size as usize],
                property_flags,
                mapped: false,
                import: None,
            },
        );

        Ok(DeviceMemory {
            memory,
            size,
            property_flags,
        })
    }
}

pub struct DeviceContextHeadless {
    config: HeadlessDeviceConfig,
    state: Mutex<HeadlessDeviceState>,
}

impl DeviceContextHeadless {
    pub fn new(config: HeadlessDeviceConfig) -> Self {
        DeviceContextHeadless {
            config,
            state: Mutex::new(Default::default()),
        }
    }

    fn state(&self) -> MutexGuard<HeadlessDeviceState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// The next buffer or image memory allocation fails with `ERROR_OUT_OF_DEVICE_MEMORY`
    pub fn fail_next_allocation(&self) {
        self.state().fail_next_allocation = true;
    }

    pub fn live_buffer_count(&self) -> usize {
        self.state().buffers.len()
    }

    pub fn live_image_count(&self) -> usize {
        self.state().images.len()
    }

    pub fn live_memory_count(&self) -> usize {
        self.state().memory.len()
    }

    pub fn live_descriptor_pool_count(&self) -> usize {
        self.state().descriptor_pools.len()
    }

    pub fn live_query_pool_count(&self) -> usize {
        self.state().query_pools.len()
    }

    pub fn live_semaphore_count(&self) -> usize {
        self.state().semaphores.len()
    }

    pub fn live_object_count(&self) -> usize {
        let state = self.state();
        state.buffers.len()
            + state.images.len()
            + state.memory.len()
            + state.descriptor_pools.len()
            + state.query_pools.len()
            + state.semaphores.len()
    }

    pub fn created_buffer_count(&self) -> usize {
        self.state().created_buffer_count
    }

    pub fn created_image_count(&self) -> usize {
        self.state().created_image_count
    }

    pub fn created_descriptor_pool_count(&self) -> usize {
        self.state().created_descriptor_pool_count
    }

    pub fn created_query_pool_count(&self) -> usize {
        self.state().created_query_pool_count
    }

    pub fn created_semaphore_count(&self) -> usize {
        self.state().created_semaphore_count
    }

    pub fn buffer_size(
        &self,
        buffer: vk::Buffer,
    ) -> Option<vk::DeviceSize> {
        self.state().buffers.get(&buffer).copied()
    }

    pub fn is_memory_mapped(
        &self,
        memory: vk::DeviceMemory,
    ) -> bool {
        self.state()
            .memory
            .get(&memory)
            .map(|memory| memory.mapped)
            .unwrap_or(false)
    }

    pub fn memory_contents(
        &self,
        memory: vk::DeviceMemory,
    ) -> Vec<u8> {
        self.state()
            .memory
            .get(&memory)
            .map(|memory| memory.data.clone())
            .unwrap_or_default()
    }

    /// Simulates the GPU writing into host-visible memory
    pub fn write_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: usize,
        data: &[u8],
    ) {
        let mut state = self.state();
        match state.memory.get_mut(&memory) {
            Some(memory) => memory.data[offset..offset + data.len()].copy_from_slice(data),
            None => panic!("wrote to unknown memory {:?}", memory),
        }
    }

    /// How the image was created, if it is still alive
    pub fn image_def(
        &self,
        image: vk::Image,
    ) -> Option<ImageDef> {
        self.state().images.get(&image).cloned()
    }

    /// The external handle the memory was imported from, if any
    pub fn memory_import(
        &self,
        memory: vk::DeviceMemory,
    ) -> Option<ExternalMemoryImport> {
        self.state()
            .memory
            .get(&memory)
            .and_then(|memory| memory.import)
    }

    pub fn flushed_ranges(&self) -> Vec<MappedRange> {
        self.state().flushed_ranges.clone()
    }

    pub fn invalidated_ranges(&self) -> Vec<MappedRange> {
        self.state().invalidated_ranges.clone()
    }
}

impl DeviceContext for DeviceContextHeadless {
    fn queue_family_index(&self) -> u32 {
        self.config.queue_family_index
    }

    fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.config.non_coherent_atom_size
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        _usage: vk::BufferUsageFlags,
    ) -> StrataResult<vk::Buffer> {
        let mut state = self.state();
        let buffer = vk::Buffer::from_raw(state.allocate_handle());
        state.buffers.insert(buffer, size);
        state.created_buffer_count += 1;
        Ok(buffer)
    }

    fn destroy_buffer(
        &self,
        buffer: vk::Buffer,
    ) {
        let removed = self.state().buffers.remove(&buffer);
        assert!(removed.is_some(), "destroyed unknown buffer {:?}", buffer);
    }

    fn allocate_buffer_memory(
        &self,
        buffer: vk::Buffer,
        required_flags: vk::MemoryPropertyFlags,
    ) -> StrataResult<DeviceMemory> {
        let mut state = self.state();
        let size = *state
            .buffers
            .get(&buffer)
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;
        state.allocate_memory(size, required_flags, self.config.host_coherent)
    }

    fn create_image(
        &self,
        image_def: &ImageDef,
    ) -> StrataResult<vk::Image> {
        let mut state = self.state();
        let image = vk::Image::from_raw(state.allocate_handle());
        state.images.insert(image, image_def.clone());
        state.created_image_count += 1;
        Ok(image)
    }

    fn destroy_image(
        &self,
        image: vk::Image,
    ) {
        let removed = self.state().images.remove(&image);
        assert!(removed.is_some(), "destroyed unknown image {:?}", image);
    }

    fn allocate_image_memory(
        &self,
        image: vk::Image,
        required_flags: vk::MemoryPropertyFlags,
    ) -> StrataResult<DeviceMemory> {
        let mut state = self.state();
        if !state.images.contains_key(&image) {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED.into());
        }
        // Image contents are never read back from the headless device
        state.allocate_memory(0, required_flags, self.config.host_coherent)
    }

    fn allocate_image_memory_with_requirements(
        &self,
        image: vk::Image,
        memory_requirements: &vk::MemoryRequirements,
        required_flags: vk::MemoryPropertyFlags,
        import: Option<ExternalMemoryImport>,
    ) -> StrataResult<DeviceMemory> {
        let mut state = self.state();
        if !state.images.contains_key(&image) {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED.into());
        }
        // Any memory type is acceptable as long as one is allowed
        if memory_requirements.memory_type_bits == 0 {
            return Err(StrataError::NoSuitableMemoryType {
                memory_type_bits: 0,
                required_flags,
            });
        }

        let device_memory = state.allocate_memory(0, required_flags, self.config.host_coherent)?;
        if let Some(memory) = state.memory.get_mut(&device_memory.memory) {
            memory.import = import;
        }
        Ok(DeviceMemory {
            size: memory_requirements.size,
            ..device_memory
        })
    }

    fn free_memory(
        &self,
        memory: vk::DeviceMemory,
    ) {
        let removed = self.state().memory.remove(&memory);
        assert!(removed.is_some(), "freed unknown memory {:?}", memory);
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        _size: vk::DeviceSize,
    ) -> StrataResult<*mut u8> {
        let mut state = self.state();
        let memory = state
            .memory
            .get_mut(&memory)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        if memory.mapped
            || !memory
                .property_flags
                .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
        {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED.into());
        }

        memory.mapped = true;
        Ok(unsafe { memory.data.as_mut_ptr().add(offset as usize) })
    }

    fn unmap_memory(
        &self,
        memory: vk::DeviceMemory,
    ) {
        let mut state = self.state();
        let was_mapped = state
            .memory
            .get_mut(&memory)
            .map(|memory| std::mem::replace(&mut memory.mapped, false));
        assert_eq!(was_mapped, Some(true), "unmapped memory that is not mapped");
    }

    fn flush_mapped_memory_range(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> StrataResult<()> {
        let mut state = self.state();
        assert!(
            state.memory.get(&memory).map(|m| m.mapped).unwrap_or(false),
            "flushed memory that is not mapped"
        );
        state.flushed_ranges.push(MappedRange {
            memory,
            offset,
            size,
        });
        Ok(())
    }

    fn invalidate_mapped_memory_range(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> StrataResult<()> {
        let mut state = self.state();
        assert!(
            state.memory.get(&memory).map(|m| m.mapped).unwrap_or(false),
            "invalidated memory that is not mapped"
        );
        state.invalidated_ranges.push(MappedRange {
            memory,
            offset,
            size,
        });
        Ok(())
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        _pool_sizes: &[vk::DescriptorPoolSize],
    ) -> StrataResult<vk::DescriptorPool> {
        let mut state = self.state();
        let pool = vk::DescriptorPool::from_raw(state.allocate_handle());
        state.descriptor_pools.insert(
            pool,
            HeadlessDescriptorPool {
                max_sets,
                allocated_sets: 0,
            },
        );
        state.created_descriptor_pool_count += 1;
        Ok(pool)
    }

    fn reset_descriptor_pool(
        &self,
        pool: vk::DescriptorPool,
    ) -> StrataResult<()> {
        let mut state = self.state();
        let pool = state
            .descriptor_pools
            .get_mut(&pool)
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;
        pool.allocated_sets = 0;
        Ok(())
    }

    fn destroy_descriptor_pool(
        &self,
        pool: vk::DescriptorPool,
    ) {
        let removed = self.state().descriptor_pools.remove(&pool);
        assert!(removed.is_some(), "destroyed unknown descriptor pool {:?}", pool);
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> StrataResult<Vec<vk::DescriptorSet>> {
        let mut state = self.state();
        let pool_state = state
            .descriptor_pools
            .get_mut(&pool)
            .ok_or(vk::Result::ERROR_INITIALIZATION_FAILED)?;
        if pool_state.allocated_sets + layouts.len() as u32 > pool_state.max_sets {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY.into());
        }
        pool_state.allocated_sets += layouts.len() as u32;

        Ok(layouts
            .iter()
            .map(|_| vk::DescriptorSet::from_raw(state.allocate_handle()))
            .collect())
    }

    fn create_query_pool(
        &self,
        _query_type: vk::QueryType,
        _query_count: u32,
    ) -> StrataResult<vk::QueryPool> {
        let mut state = self.state();
        let pool = vk::QueryPool::from_raw(state.allocate_handle());
        state.query_pools.insert(pool);
        state.created_query_pool_count += 1;
        Ok(pool)
    }

    fn destroy_query_pool(
        &self,
        pool: vk::QueryPool,
    ) {
        let removed = self.state().query_pools.remove(&pool);
        assert!(removed, "destroyed unknown query pool {:?}", pool);
    }

    fn get_query_result(
        &self,
        pool: vk::QueryPool,
        _query: u32,
        _wait: bool,
    ) -> StrataResult<Option<u64>> {
        if self.state().query_pools.contains(&pool) {
            Ok(Some(0))
        } else {
            Err(vk::Result::ERROR_DEVICE_LOST.into())
        }
    }

    fn create_semaphore(&self) -> StrataResult<vk::Semaphore> {
        let mut state = self.state();
        let semaphore = vk::Semaphore::from_raw(state.allocate_handle());
        state.semaphores.insert(semaphore);
        state.created_semaphore_count += 1;
        Ok(semaphore)
    }

    fn destroy_semaphore(
        &self,
        semaphore: vk::Semaphore,
    ) {
        let removed = self.state().semaphores.remove(&semaphore);
        assert!(removed, "destroyed unknown semaphore {:?}", semaphore);
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct MemoryBarrierRecord {
    pub src_access_mask: vk::AccessFlags,
    pub dst_access_mask: vk::AccessFlags,
}

#[derive(Copy, Clone, Debug)]
pub struct BufferBarrierRecord {
    pub buffer: vk::Buffer,
    pub src_access_mask: vk::AccessFlags,
    pub dst_access_mask: vk::AccessFlags,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
}

#[derive(Copy, Clone, Debug)]
pub struct ImageBarrierRecord {
    pub image: vk::Image,
    pub src_access_mask: vk::AccessFlags,
    pub dst_access_mask: vk::AccessFlags,
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_queue_family_index: u32,
    pub dst_queue_family_index: u32,
    pub subresource_range: vk::ImageSubresourceRange,
}

#[derive(Clone, Debug)]
pub enum RecordedCommand {
    PipelineBarrier {
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        memory_barriers: Vec<MemoryBarrierRecord>,
        buffer_barriers: Vec<BufferBarrierRecord>,
        image_barriers: Vec<ImageBarrierRecord>,
    },
    CopyBuffer {
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: Vec<vk::BufferCopy>,
    },
    CopyBufferToImage {
        src_buffer: vk::Buffer,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: Vec<vk::BufferImageCopy>,
    },
    CopyImageToBuffer {
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_buffer: vk::Buffer,
        regions: Vec<vk::BufferImageCopy>,
    },
    CopyImage {
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: Vec<vk::ImageCopy>,
    },
    BlitImage {
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: Vec<vk::ImageBlit>,
        filter: vk::Filter,
    },
    ResolveImage {
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: Vec<vk::ImageResolve>,
    },
    ClearColorImage {
        image: vk::Image,
        image_layout: vk::ImageLayout,
        color: [f32; 4],
        ranges: Vec<vk::ImageSubresourceRange>,
    },
    ClearDepthStencilImage {
        image: vk::Image,
        image_layout: vk::ImageLayout,
        depth: f32,
        stencil: u32,
        ranges: Vec<vk::ImageSubresourceRange>,
    },
    ResetQueryPool {
        query_pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
    },
    BeginQuery {
        query_pool: vk::QueryPool,
        query: u32,
    },
    EndQuery {
        query_pool: vk::QueryPool,
        query: u32,
    },
    WriteTimestamp {
        pipeline_stage: vk::PipelineStageFlags,
        query_pool: vk::QueryPool,
        query: u32,
    },
    Finish,
}

impl RecordedCommand {
    pub fn is_barrier(&self) -> bool {
        matches!(self, RecordedCommand::PipelineBarrier { .. })
    }

    /// A pipeline barrier that carries no memory, buffer or image barriers
    pub fn is_execution_barrier(&self) -> bool {
        match self {
            RecordedCommand::PipelineBarrier {
                memory_barriers,
                buffer_barriers,
                image_barriers,
                ..
            } => memory_barriers.is_empty() && buffer_barriers.is_empty() && image_barriers.is_empty(),
            _ => false,
        }
    }

    pub fn image_barriers(&self) -> &[ImageBarrierRecord] {
        match self {
            RecordedCommand::PipelineBarrier { image_barriers, .. } => image_barriers,
            _ => &[],
        }
    }

    pub fn memory_barriers(&self) -> &[MemoryBarrierRecord] {
        match self {
            RecordedCommand::PipelineBarrier {
                memory_barriers, ..
            } => memory_barriers,
            _ => &[],
        }
    }
}

/// Records commands instead of executing them
#[derive(Default)]
pub struct HeadlessCommandBuffer {
    commands: Vec<RecordedCommand>,
}

impl HeadlessCommandBuffer {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn commands(&self) -> &[RecordedCommand] {
        &self.commands
    }

    pub fn take_commands(&mut self) -> Vec<RecordedCommand> {
        std::mem::take(&mut self.commands)
    }

    pub fn clear(&mut self) {
        self.commands.clear();
    }

    pub fn barrier_count(&self) -> usize {
        self.commands
            .iter()
            .filter(|command| command.is_barrier())
            .count()
    }
}

impl CommandRecorder for HeadlessCommandBuffer {
    fn pipeline_barrier(
        &mut self,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        memory_barriers: &[vk::MemoryBarrier],
        buffer_memory_barriers: &[vk::BufferMemoryBarrier],
        image_memory_barriers: &[vk::ImageMemoryBarrier],
    ) {
        self.commands.push(RecordedCommand::PipelineBarrier {
            src_stage_mask,
            dst_stage_mask,
            memory_barriers: memory_barriers
                .iter()
                .map(|barrier| MemoryBarrierRecord {
                    src_access_mask: barrier.src_access_mask,
                    dst_access_mask: barrier.dst_access_mask,
                })
                .collect(),
            buffer_barriers: buffer_memory_barriers
                .iter()
                .map(|barrier| BufferBarrierRecord {
                    buffer: barrier.buffer,
                    src_access_mask: barrier.src_access_mask,
                    dst_access_mask: barrier.dst_access_mask,
                    offset: barrier.offset,
                    size: barrier.size,
                })
                .collect(),
            image_barriers: image_memory_barriers
                .iter()
                .map(|barrier| ImageBarrierRecord {
                    image: barrier.image,
                    src_access_mask: barrier.src_access_mask,
                    dst_access_mask: barrier.dst_access_mask,
                    old_layout: barrier.old_layout,
                    new_layout: barrier.new_layout,
                    src_queue_family_index: barrier.src_queue_family_index,
                    dst_queue_family_index: barrier.dst_queue_family_index,
                    subresource_range: barrier.subresource_range,
                })
                .collect(),
        });
    }

    fn copy_buffer(
        &mut self,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.commands.push(RecordedCommand::CopyBuffer {
            src_buffer,
            dst_buffer,
            regions: regions.to_vec(),
        });
    }

    fn copy_buffer_to_image(
        &mut self,
        src_buffer: vk::Buffer,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        self.commands.push(RecordedCommand::CopyBufferToImage {
            src_buffer,
            dst_image,
            dst_image_layout,
            regions: regions.to_vec(),
        });
    }

    fn copy_image_to_buffer(
        &mut self,
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        self.commands.push(RecordedCommand::CopyImageToBuffer {
            src_image,
            src_image_layout,
            dst_buffer,
            regions: regions.to_vec(),
        });
    }

    fn copy_image(
        &mut self,
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        self.commands.push(RecordedCommand::CopyImage {
            src_image,
            src_image_layout,
            dst_image,
            dst_image_layout,
            regions: regions.to_vec(),
        });
    }

    fn blit_image(
        &mut self,
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    ) {
        self.commands.push(RecordedCommand::BlitImage {
            src_image,
            src_image_layout,
            dst_image,
            dst_image_layout,
            regions: regions.to_vec(),
            filter,
        });
    }

    fn resolve_image(
        &mut self,
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: &[vk::ImageResolve],
    ) {
        self.commands.push(RecordedCommand::ResolveImage {
            src_image,
            src_image_layout,
            dst_image,
            dst_image_layout,
            regions: regions.to_vec(),
        });
    }

    fn clear_color_image(
        &mut self,
        image: vk::Image,
        image_layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        self.commands.push(RecordedCommand::ClearColorImage {
            image,
            image_layout,
            // Any bit pattern is a valid f32, so reading the union this way is always sound
            color: unsafe { color.float32 },
            ranges: ranges.to_vec(),
        });
    }

    fn clear_depth_stencil_image(
        &mut self,
        image: vk::Image,
        image_layout: vk::ImageLayout,
        depth_stencil: &vk::ClearDepthStencilValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        self.commands.push(RecordedCommand::ClearDepthStencilImage {
            image,
            image_layout,
            depth: depth_stencil.depth,
            stencil: depth_stencil.stencil,
            ranges: ranges.to_vec(),
        });
    }

    fn reset_query_pool(
        &mut self,
        query_pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
    ) {
        self.commands.push(RecordedCommand::ResetQueryPool {
            query_pool,
            first_query,
            query_count,
        });
    }

    fn begin_query(
        &mut self,
        query_pool: vk::QueryPool,
        query: u32,
        _flags: vk::QueryControlFlags,
    ) {
        self.commands
            .push(RecordedCommand::BeginQuery { query_pool, query });
    }

    fn end_query(
        &mut self,
        query_pool: vk::QueryPool,
        query: u32,
    ) {
        self.commands
            .push(RecordedCommand::EndQuery { query_pool, query });
    }

    fn write_timestamp(
        &mut self,
        pipeline_stage: vk::PipelineStageFlags,
        query_pool: vk::QueryPool,
        query: u32,
    ) {
        self.commands.push(RecordedCommand::WriteTimestamp {
            pipeline_stage,
            query_pool,
            query,
        });
    }

    fn finish(&mut self) -> StrataResult<()> {
        self.commands.push(RecordedCommand::Finish);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_visible_memory_is_mappable() {
        let device = DeviceContextHeadless::new(HeadlessDeviceConfig {
            host_coherent: false,
            ..Default::default()
        });
        let buffer = device
            .create_buffer(64, vk::BufferUsageFlags::TRANSFER_SRC)
            .unwrap();
        let memory = device
            .allocate_buffer_memory(buffer, vk::MemoryPropertyFlags::HOST_VISIBLE)
            .unwrap();
        assert_eq!(memory.size, 64);
        assert!(memory.is_host_visible());
        assert!(!memory.is_host_coherent());

        let ptr = device.map_memory(memory.memory, 0, 64).unwrap();
        unsafe { *ptr.add(3) = 9 };
        assert!(device.map_memory(memory.memory, 0, 64).is_err());
        device.unmap_memory(memory.memory);
        assert_eq!(device.memory_contents(memory.memory)[3], 9);

        device.free_memory(memory.memory);
        device.destroy_buffer(buffer);
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn test_device_local_memory_is_not_mappable() {
        let device = DeviceContextHeadless::new(HeadlessDeviceConfig::default());
        let buffer = device
            .create_buffer(64, vk::BufferUsageFlags::TRANSFER_DST)
            .unwrap();
        let memory = device
            .allocate_buffer_memory(buffer, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .unwrap();
        assert!(device.map_memory(memory.memory, 0, 64).is_err());
    }

    #[test]
    fn test_allocation_failure_injection() {
        let device = DeviceContextHeadless::new(HeadlessDeviceConfig::default());
        let buffer = device
            .create_buffer(64, vk::BufferUsageFlags::TRANSFER_DST)
            .unwrap();
        device.fail_next_allocation();
        let result = device.allocate_buffer_memory(buffer, vk::MemoryPropertyFlags::DEVICE_LOCAL);
        assert_eq!(
            result.unwrap_err().vk_result(),
            Some(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        );
        assert!(device
            .allocate_buffer_memory(buffer, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .is_ok());
    }

    #[test]
    fn test_descriptor_pool_capacity() {
        let device = DeviceContextHeadless::new(HeadlessDeviceConfig::default());
        let pool = device.create_descriptor_pool(2, &[]).unwrap();
        let layout = vk::DescriptorSetLayout::null();
        assert_eq!(
            device
                .allocate_descriptor_sets(pool, &[layout, layout])
                .unwrap()
                .len(),
            2
        );
        assert!(device.allocate_descriptor_sets(pool, &[layout]).is_err());
        device.reset_descriptor_pool(pool).unwrap();
        assert!(device.allocate_descriptor_sets(pool, &[layout]).is_ok());
    }

    #[test]
    fn test_execution_barrier_is_recorded_without_barriers() {
        let mut command_buffer = HeadlessCommandBuffer::new();
        command_buffer.execution_barrier(vk::PipelineStageFlags::TRANSFER);
        command_buffer.memory_barrier(
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::TRANSFER_WRITE,
        );

        let commands = command_buffer.commands();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].is_execution_barrier());
        assert!(!commands[1].is_execution_barrier());
        assert_eq!(
            commands[1].memory_barriers(),
            &[MemoryBarrierRecord {
                src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
                dst_access_mask: vk::AccessFlags::TRANSFER_WRITE,
            }]
        );
    }
}
