use super::find_memory_type_index;
use crate::{
    DeviceContext, DeviceMemory, ExternalMemoryImport, ImageDef, StrataError, StrataResult,
};
use ash::vk;

/// Creates native objects on an `ash::Device`. The device itself is owned by the caller and must
/// outlive this context.
pub struct DeviceContextVulkan {
    device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    non_coherent_atom_size: vk::DeviceSize,
    queue_family_index: u32,
}

impl DeviceContextVulkan {
    pub fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue_family_index: u32,
    ) -> Self {
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        log::debug!(
            "Device context created for queue family {}, non-coherent atom size {}",
            queue_family_index,
            properties.limits.non_coherent_atom_size
        );

        DeviceContextVulkan {
            device,
            memory_properties,
            non_coherent_atom_size: properties.limits.non_coherent_atom_size,
            queue_family_index,
        }
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    fn allocate_memory(
        &self,
        memory_requirements: &vk::MemoryRequirements,
        required_flags: vk::MemoryPropertyFlags,
        import: Option<ExternalMemoryImport>,
    ) -> StrataResult<DeviceMemory> {
        let memory_type_index = match find_memory_type_index(
            memory_requirements,
            &self.memory_properties,
            required_flags,
        ) {
            Some(memory_type_index) => memory_type_index,
            None => {
                return Err(StrataError::NoSuitableMemoryType {
                    memory_type_bits: memory_requirements.memory_type_bits,
                    required_flags,
                })
            }
        };

        let mut import_fd_info;
        let mut allocate_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(memory_requirements.size)
            .memory_type_index(memory_type_index);
        if let Some(ExternalMemoryImport::Fd { handle_type, fd }) = import {
            import_fd_info = vk::ImportMemoryFdInfoKHR::builder()
                .handle_type(handle_type)
                .fd(fd);
            allocate_info = allocate_info.push_next(&mut import_fd_info);
        }

        let memory = unsafe { self.device.allocate_memory(&allocate_info, None)? };

        Ok(DeviceMemory {
            memory,
            size: memory_requirements.size,
            property_flags: self.memory_properties.memory_types[memory_type_index as usize]
                .property_flags,
        })
    }
}

impl DeviceContext for DeviceContextVulkan {
    fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }

    fn non_coherent_atom_size(&self) -> vk::DeviceSize {
        self.non_coherent_atom_size
    }

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> StrataResult<vk::Buffer> {
        let buffer_create_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        Ok(unsafe { self.device.create_buffer(&buffer_create_info, None)? })
    }

    fn destroy_buffer(
        &self,
        buffer: vk::Buffer,
    ) {
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn allocate_buffer_memory(
        &self,
        buffer: vk::Buffer,
        required_flags: vk::MemoryPropertyFlags,
    ) -> StrataResult<DeviceMemory> {
        let memory_requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let device_memory = self.allocate_memory(&memory_requirements, required_flags, None)?;

        if let Err(e) = unsafe {
            self.device
                .bind_buffer_memory(buffer, device_memory.memory, 0)
        } {
            self.free_memory(device_memory.memory);
            return Err(e.into());
        }

        Ok(device_memory)
    }

    fn create_image(
        &self,
        image_def: &ImageDef,
    ) -> StrataResult<vk::Image> {
        let mut external_memory_info = vk::ExternalMemoryImageCreateInfo::builder()
            .handle_types(image_def.external_memory_handle_types);
        let mut image_create_info = vk::ImageCreateInfo::builder()
            .image_type(image_def.image_type)
            .format(image_def.format)
            .extent(image_def.extent)
            .mip_levels(image_def.mip_levels)
            .array_layers(image_def.array_layers)
            .samples(image_def.samples)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(image_def.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(image_def.initial_layout)
            .flags(image_def.flags);
        if !image_def.external_memory_handle_types.is_empty() {
            image_create_info = image_create_info.push_next(&mut external_memory_info);
        }

        Ok(unsafe { self.device.create_image(&image_create_info, None)? })
    }

    fn destroy_image(
        &self,
        image: vk::Image,
    ) {
        unsafe { self.device.destroy_image(image, None) };
    }

    fn allocate_image_memory(
        &self,
        image: vk::Image,
        required_flags: vk::MemoryPropertyFlags,
    ) -> StrataResult<DeviceMemory> {
        let memory_requirements = unsafe { self.device.get_image_memory_requirements(image) };
        self.allocate_image_memory_with_requirements(
            image,
            &memory_requirements,
            required_flags,
            None,
        )
    }

    fn allocate_image_memory_with_requirements(
        &self,
        image: vk::Image,
        memory_requirements: &vk::MemoryRequirements,
        required_flags: vk::MemoryPropertyFlags,
        import: Option<ExternalMemoryImport>,
    ) -> StrataResult<DeviceMemory> {
        let device_memory = self.allocate_memory(memory_requirements, required_flags, import)?;

        if let Err(e) = unsafe { self.device.bind_image_memory(image, device_memory.memory, 0) } {
            self.free_memory(device_memory.memory);
            return Err(e.into());
        }

        Ok(device_memory)
    }

    fn free_memory(
        &self,
        memory: vk::DeviceMemory,
    ) {
        unsafe { self.device.free_memory(memory, None) };
    }

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> StrataResult<*mut u8> {
        let ptr = unsafe {
            self.device
                .map_memory(memory, offset, size, vk::MemoryMapFlags::empty())?
        };
        Ok(ptr as *mut u8)
    }

    fn unmap_memory(
        &self,
        memory: vk::DeviceMemory,
    ) {
        unsafe { self.device.unmap_memory(memory) };
    }

    fn flush_mapped_memory_range(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> StrataResult<()> {
        let range = vk::MappedMemoryRange::builder()
            .memory(memory)
            .offset(offset)
            .size(size)
            .build();

        unsafe { self.device.flush_mapped_memory_ranges(&[range])? };
        Ok(())
    }

    fn invalidate_mapped_memory_range(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> StrataResult<()> {
        let range = vk::MappedMemoryRange::builder()
            .memory(memory)
            .offset(offset)
            .size(size)
            .build();

        unsafe { self.device.invalidate_mapped_memory_ranges(&[range])? };
        Ok(())
    }

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> StrataResult<vk::DescriptorPool> {
        let pool_create_info = vk::DescriptorPoolCreateInfo::builder()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes);

        Ok(unsafe {
            self.device
                .create_descriptor_pool(&pool_create_info, None)?
        })
    }

    fn reset_descriptor_pool(
        &self,
        pool: vk::DescriptorPool,
    ) -> StrataResult<()> {
        unsafe {
            self.device
                .reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())?
        };
        Ok(())
    }

    fn destroy_descriptor_pool(
        &self,
        pool: vk::DescriptorPool,
    ) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> StrataResult<Vec<vk::DescriptorSet>> {
        let allocate_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(layouts);

        Ok(unsafe { self.device.allocate_descriptor_sets(&allocate_info)? })
    }

    fn create_query_pool(
        &self,
        query_type: vk::QueryType,
        query_count: u32,
    ) -> StrataResult<vk::QueryPool> {
        let query_pool_create_info = vk::QueryPoolCreateInfo::builder()
            .query_type(query_type)
            .query_count(query_count);

        Ok(unsafe {
            self.device
                .create_query_pool(&query_pool_create_info, None)?
        })
    }

    fn destroy_query_pool(
        &self,
        pool: vk::QueryPool,
    ) {
        unsafe { self.device.destroy_query_pool(pool, None) };
    }

    fn get_query_result(
        &self,
        pool: vk::QueryPool,
        query: u32,
        wait: bool,
    ) -> StrataResult<Option<u64>> {
        let mut flags = vk::QueryResultFlags::TYPE_64;
        if wait {
            flags |= vk::QueryResultFlags::WAIT;
        }

        let mut result = [0u64; 1];
        match unsafe {
            self.device
                .get_query_pool_results(pool, query, 1, &mut result, flags)
        } {
            Ok(()) => Ok(Some(result[0])),
            Err(vk::Result::NOT_READY) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn create_semaphore(&self) -> StrataResult<vk::Semaphore> {
        let semaphore_create_info = vk::SemaphoreCreateInfo::builder();
        Ok(unsafe {
            self.device
                .create_semaphore(&semaphore_create_info, None)?
        })
    }

    fn destroy_semaphore(
        &self,
        semaphore: vk::Semaphore,
    ) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }
}
