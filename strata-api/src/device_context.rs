use crate::StrataResult;
use ash::vk;

/// A block of device memory bound to a single buffer or image
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceMemory {
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    /// Actual flags of the memory type that was picked. May be a superset of what was requested.
    pub property_flags: vk::MemoryPropertyFlags,
}

impl DeviceMemory {
    pub fn is_host_visible(&self) -> bool {
        self.property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    pub fn is_host_coherent(&self) -> bool {
        self.property_flags
            .contains(vk::MemoryPropertyFlags::HOST_COHERENT)
    }
}

/// Everything needed to create a native image
#[derive(Clone, Debug)]
pub struct ImageDef {
    pub image_type: vk::ImageType,
    pub format: vk::Format,
    pub extent: vk::Extent3D,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub samples: vk::SampleCountFlags,
    pub usage: vk::ImageUsageFlags,
    pub flags: vk::ImageCreateFlags,
    pub initial_layout: vk::ImageLayout,
    /// Non-empty if the image's memory will be imported from another API or process
    pub external_memory_handle_types: vk::ExternalMemoryHandleTypeFlags,
}

/// Memory handed over by another API or process
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExternalMemoryImport {
    /// A POSIX file descriptor. The driver takes ownership of it if the import succeeds.
    Fd {
        handle_type: vk::ExternalMemoryHandleTypeFlags,
        fd: i32,
    },
}

/// The device and memory allocator the resource helpers create native objects through. Methods that
/// can fail at the driver level return the driver's error unchanged.
pub trait DeviceContext {
    fn queue_family_index(&self) -> u32;

    fn non_coherent_atom_size(&self) -> vk::DeviceSize;

    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
    ) -> StrataResult<vk::Buffer>;

    fn destroy_buffer(
        &self,
        buffer: vk::Buffer,
    );

    /// Allocates memory satisfying `required_flags` and binds it to the buffer
    fn allocate_buffer_memory(
        &self,
        buffer: vk::Buffer,
        required_flags: vk::MemoryPropertyFlags,
    ) -> StrataResult<DeviceMemory>;

    fn create_image(
        &self,
        image_def: &ImageDef,
    ) -> StrataResult<vk::Image>;

    fn destroy_image(
        &self,
        image: vk::Image,
    );

    /// Allocates memory satisfying `required_flags` and binds it to the image
    fn allocate_image_memory(
        &self,
        image: vk::Image,
        required_flags: vk::MemoryPropertyFlags,
    ) -> StrataResult<DeviceMemory>;

    /// Like `allocate_image_memory`, but with requirements supplied by the caller and optionally
    /// backed by imported memory
    fn allocate_image_memory_with_requirements(
        &self,
        image: vk::Image,
        memory_requirements: &vk::MemoryRequirements,
        required_flags: vk::MemoryPropertyFlags,
        import: Option<ExternalMemoryImport>,
    ) -> StrataResult<DeviceMemory>;

    fn free_memory(
        &self,
        memory: vk::DeviceMemory,
    );

    fn map_memory(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> StrataResult<*mut u8>;

    fn unmap_memory(
        &self,
        memory: vk::DeviceMemory,
    );

    fn flush_mapped_memory_range(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> StrataResult<()>;

    fn invalidate_mapped_memory_range(
        &self,
        memory: vk::DeviceMemory,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> StrataResult<()>;

    fn create_descriptor_pool(
        &self,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> StrataResult<vk::DescriptorPool>;

    fn reset_descriptor_pool(
        &self,
        pool: vk::DescriptorPool,
    ) -> StrataResult<()>;

    fn destroy_descriptor_pool(
        &self,
        pool: vk::DescriptorPool,
    );

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> StrataResult<Vec<vk::DescriptorSet>>;

    fn create_query_pool(
        &self,
        query_type: vk::QueryType,
        query_count: u32,
    ) -> StrataResult<vk::QueryPool>;

    fn destroy_query_pool(
        &self,
        pool: vk::QueryPool,
    );

    /// Returns `None` if the result is not available yet and `wait` is false
    fn get_query_result(
        &self,
        pool: vk::QueryPool,
        query: u32,
        wait: bool,
    ) -> StrataResult<Option<u64>>;

    fn create_semaphore(&self) -> StrataResult<vk::Semaphore>;

    fn destroy_semaphore(
        &self,
        semaphore: vk::Semaphore,
    );
}
