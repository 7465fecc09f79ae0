use crate::{
    CommandRecorder, DeviceContext, DeviceMemory, GarbageObject, ResourceContext, StrataError,
    StrataResult,
};
use ash::vk;
use std::ptr::NonNull;
use strata_base::memory;
use strata_base::{ResourceUse, SerialSource};

/// Owns a native buffer and its memory, and remembers the last accesses made to it so the next
/// access can be preceded by the right barrier.
///
/// Must be released (deferred until the GPU is done) or destroyed (immediately) before dropping.
pub struct BufferHelper {
    buffer: vk::Buffer,
    memory: DeviceMemory,
    size: vk::DeviceSize,
    mapped_memory: Option<NonNull<u8>>,
    current_read_access: vk::AccessFlags,
    current_write_access: vk::AccessFlags,
    resource_use: ResourceUse,
}

impl BufferHelper {
    pub fn new(
        device: &dyn DeviceContext,
        usage: vk::BufferUsageFlags,
        size: vk::DeviceSize,
        memory_property_flags: vk::MemoryPropertyFlags,
    ) -> StrataResult<Self> {
        let buffer = device.create_buffer(size, usage)?;
        let memory = match device.allocate_buffer_memory(buffer, memory_property_flags) {
            Ok(memory) => memory,
            Err(e) => {
                log::error!(
                    "Failed to allocate {} bytes of {:?} memory for buffer: {}",
                    size,
                    memory_property_flags,
                    e
                );
                device.destroy_buffer(buffer);
                return Err(e);
            }
        };

        log::trace!(
            "Buffer {:?} created with size {} in {:?} memory",
            buffer,
            size,
            memory.property_flags
        );

        Ok(BufferHelper {
            buffer,
            memory,
            size,
            mapped_memory: None,
            current_read_access: vk::AccessFlags::empty(),
            current_write_access: vk::AccessFlags::empty(),
            resource_use: ResourceUse::new(),
        })
    }

    pub fn valid(&self) -> bool {
        self.buffer != vk::Buffer::null()
    }

    pub fn vk_buffer(&self) -> vk::Buffer {
        self.buffer
    }

    pub fn device_memory(&self) -> &DeviceMemory {
        &self.memory
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn memory_property_flags(&self) -> vk::MemoryPropertyFlags {
        self.memory.property_flags
    }

    pub fn is_host_visible(&self) -> bool {
        self.memory.is_host_visible()
    }

    pub fn is_host_coherent(&self) -> bool {
        self.memory.is_host_coherent()
    }

    pub fn resource_use(&self) -> &ResourceUse {
        &self.resource_use
    }

    pub fn current_read_access(&self) -> vk::AccessFlags {
        self.current_read_access
    }

    pub fn current_write_access(&self) -> vk::AccessFlags {
        self.current_write_access
    }

    /// Marks the buffer as referenced by the commands currently being recorded
    pub fn use_in_recording(
        &self,
        serials: &dyn SerialSource,
    ) {
        self.resource_use.use_in_recording(serials);
    }

    pub fn is_in_use(
        &self,
        serials: &dyn SerialSource,
    ) -> bool {
        self.resource_use.is_in_use(serials)
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped_memory.is_some()
    }

    pub fn mapped_memory(&self) -> Option<*mut u8> {
        self.mapped_memory.map(|ptr| ptr.as_ptr())
    }

    /// Maps the whole buffer if it isn't mapped already
    pub fn map(
        &mut self,
        device: &dyn DeviceContext,
    ) -> StrataResult<*mut u8> {
        if let Some(ptr) = self.mapped_memory {
            return Ok(ptr.as_ptr());
        }

        let ptr = device.map_memory(self.memory.memory, 0, self.size)?;
        let ptr = NonNull::new(ptr).ok_or(StrataError::MemoryNotMapped)?;
        self.mapped_memory = Some(ptr);
        Ok(ptr.as_ptr())
    }

    pub fn unmap(
        &mut self,
        device: &dyn DeviceContext,
    ) {
        assert!(
            self.mapped_memory.is_some(),
            "unmap called on a buffer that is not mapped"
        );
        device.unmap_memory(self.memory.memory);
        self.mapped_memory = None;
    }

    /// Makes host writes in the range visible to the device. Only does work for non-coherent memory.
    pub fn flush(
        &self,
        device: &dyn DeviceContext,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> StrataResult<()> {
        if self.is_host_visible() && !self.is_host_coherent() {
            device.flush_mapped_memory_range(self.memory.memory, offset, size)?;
        }
        Ok(())
    }

    /// Makes device writes in the range visible to the host. Only does work for non-coherent memory.
    pub fn invalidate(
        &self,
        device: &dyn DeviceContext,
        offset: vk::DeviceSize,
        size: vk::DeviceSize,
    ) -> StrataResult<()> {
        if self.is_host_visible() && !self.is_host_coherent() {
            device.invalidate_mapped_memory_range(self.memory.memory, offset, size)?;
        }
        self.resource_use.clear_cpu_read_dirty();
        Ok(())
    }

    /// Copies `data` into the buffer at `offset` and flushes the written range
    pub fn write_host_visible<T: Copy>(
        &mut self,
        device: &dyn DeviceContext,
        data: &[T],
        offset: vk::DeviceSize,
    ) -> StrataResult<()> {
        assert!(self.is_host_visible());
        let data_size_in_bytes = memory::slice_size_in_bytes(data) as vk::DeviceSize;
        assert!(offset + data_size_in_bytes <= self.size);

        let ptr = self.map(device)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr() as *const u8,
                ptr.add(offset as usize),
                data_size_in_bytes as usize,
            );
        }

        self.flush(device, offset, data_size_in_bytes)
    }

    /// Records the accesses of an upcoming write. Returns the (src, dst) access masks of the barrier
    /// that must precede it, if any.
    pub fn needs_on_write_barrier(
        &mut self,
        read_access: vk::AccessFlags,
        write_access: vk::AccessFlags,
    ) -> Option<(vk::AccessFlags, vk::AccessFlags)> {
        let needs_barrier =
            !self.current_read_access.is_empty() || !self.current_write_access.is_empty();
        let barrier = if needs_barrier {
            Some((self.current_write_access, read_access | write_access))
        } else {
            None
        };

        self.current_read_access = read_access;
        self.current_write_access = write_access;
        barrier
    }

    /// Inserts whatever barrier an upcoming write needs. A global memory barrier keeps things simple.
    pub fn on_write_access(
        &mut self,
        recorder: &mut dyn CommandRecorder,
        read_access: vk::AccessFlags,
        write_access: vk::AccessFlags,
    ) {
        if let Some((src_access_mask, dst_access_mask)) =
            self.needs_on_write_barrier(read_access, write_access)
        {
            recorder.memory_barrier(
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                src_access_mask,
                dst_access_mask,
            );
        }

        if self.is_host_visible() && write_access != vk::AccessFlags::HOST_WRITE {
            self.resource_use.set_cpu_read_dirty();
        }
    }

    /// Inserts a barrier if a read follows a write it hasn't been made visible to yet
    pub fn on_read_access(
        &mut self,
        recorder: &mut dyn CommandRecorder,
        read_access: vk::AccessFlags,
    ) {
        if !self.current_write_access.is_empty() && !self.current_read_access.contains(read_access)
        {
            recorder.memory_barrier(
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::ALL_COMMANDS,
                self.current_write_access,
                read_access,
            );
        }
        self.current_read_access |= read_access;
    }

    /// Copies from another buffer into this one. `src_access` is the pending access on the source
    /// buffer that must finish before the transfer reads it.
    pub fn copy_from_buffer(
        &mut self,
        recorder: &mut dyn CommandRecorder,
        src_buffer: vk::Buffer,
        src_access: vk::AccessFlags,
        region: &vk::BufferCopy,
    ) {
        let src_access_mask = self.current_read_access | self.current_write_access | src_access;
        if !src_access_mask.is_empty() {
            recorder.memory_barrier(
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::PipelineStageFlags::TRANSFER,
                src_access_mask,
                vk::AccessFlags::TRANSFER_WRITE,
            );
        }

        self.current_write_access = vk::AccessFlags::TRANSFER_WRITE;
        self.current_read_access = vk::AccessFlags::empty();

        recorder.copy_buffer(src_buffer, self.buffer, std::slice::from_ref(region));
    }

    /// Hands the buffer and its memory to the garbage collector. They are destroyed once every
    /// recorded use has finished.
    pub fn release(
        &mut self,
        ctx: &mut ResourceContext,
    ) {
        if !self.valid() {
            return;
        }

        if self.is_mapped() {
            self.unmap(ctx.device());
        }

        let resource_use = std::mem::take(&mut self.resource_use);
        ctx.collect_garbage(
            &resource_use,
            vec![
                GarbageObject::Buffer(self.buffer),
                GarbageObject::DeviceMemory(self.memory.memory),
            ],
        );
        self.reset_to_invalid();
    }

    /// Destroys immediately. The caller guarantees the GPU no longer uses the buffer.
    pub fn destroy(
        &mut self,
        device: &dyn DeviceContext,
    ) {
        if !self.valid() {
            return;
        }

        if self.is_mapped() {
            self.unmap(device);
        }

        log::trace!("Destroying buffer {:?}", self.buffer);
        device.destroy_buffer(self.buffer);
        device.free_memory(self.memory.memory);
        self.reset_to_invalid();
    }

    fn reset_to_invalid(&mut self) {
        self.buffer = vk::Buffer::null();
        self.memory = DeviceMemory::default();
        self.size = 0;
        self.current_read_access = vk::AccessFlags::empty();
        self.current_write_access = vk::AccessFlags::empty();
    }
}
