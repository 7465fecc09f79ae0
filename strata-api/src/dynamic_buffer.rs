use crate::{BufferHelper, DeviceContext, ResourceContext, StrataResult};
use ash::vk;
use std::collections::VecDeque;
use strata_base::memory;

/// Result of a [`DynamicBuffer::allocate`] call
#[derive(Copy, Clone, Debug)]
pub struct DynamicAllocation {
    /// Host pointer to the start of the allocation. `None` unless the buffer is host-visible. Only
    /// valid until the next allocation that reports `new_buffer_allocated`.
    pub ptr: Option<*mut u8>,
    pub buffer: vk::Buffer,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    /// The allocation landed in a different buffer than the previous one
    pub new_buffer_allocated: bool,
}

impl DynamicAllocation {
    /// # Safety
    ///
    /// No other allocation pointer may be used to write the same range while the slice is alive,
    /// and the owning buffer must not have rotated since this allocation was made.
    pub unsafe fn as_mut_slice<'a>(&self) -> Option<&'a mut [u8]> {
        self.ptr
            .map(|ptr| std::slice::from_raw_parts_mut(ptr, self.size as usize))
    }
}

/// Bump allocator over a chain of native buffers. When the current buffer can't fit an allocation
/// it is retired to the in-flight list and replaced by a recycled or freshly created buffer.
/// In-flight buffers return to the free list on `release_in_flight_buffers` and are reused once the
/// GPU has finished with them.
#[derive(Default)]
pub struct DynamicBuffer {
    usage: vk::BufferUsageFlags,
    host_visible: bool,
    initial_size: vk::DeviceSize,
    buffer: Option<BufferHelper>,
    next_allocation_offset: vk::DeviceSize,
    last_flush_or_invalidate_offset: vk::DeviceSize,
    size: vk::DeviceSize,
    alignment: vk::DeviceSize,
    in_flight_buffers: Vec<BufferHelper>,
    buffer_free_list: VecDeque<BufferHelper>,
}

impl DynamicBuffer {
    pub fn new(
        device: &dyn DeviceContext,
        usage: vk::BufferUsageFlags,
        alignment: vk::DeviceSize,
        initial_size: vk::DeviceSize,
        host_visible: bool,
    ) -> StrataResult<Self> {
        let mut dynamic_buffer = DynamicBuffer::default();
        dynamic_buffer.init(device, usage, alignment, initial_size, host_visible)?;
        Ok(dynamic_buffer)
    }

    /// Creates the first buffer of `initial_size` bytes right away, so allocations that fit in it
    /// never report a new buffer
    pub fn init(
        &mut self,
        device: &dyn DeviceContext,
        usage: vk::BufferUsageFlags,
        alignment: vk::DeviceSize,
        initial_size: vk::DeviceSize,
        host_visible: bool,
    ) -> StrataResult<()> {
        assert!(self.buffer.is_none(), "DynamicBuffer initialized twice");
        self.usage = usage;
        self.host_visible = host_visible;
        self.initial_size = initial_size;
        self.update_alignment(device, alignment);

        self.size = initial_size;
        if initial_size > 0 {
            self.buffer = Some(self.create_buffer(device)?);
        }
        Ok(())
    }

    pub fn valid(&self) -> bool {
        self.alignment != 0
    }

    pub fn alignment(&self) -> vk::DeviceSize {
        self.alignment
    }

    /// Size of buffers the next rotation will use
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    pub fn next_allocation_offset(&self) -> vk::DeviceSize {
        self.next_allocation_offset
    }

    pub fn current_buffer(&self) -> Option<&BufferHelper> {
        self.buffer.as_ref()
    }

    pub fn in_flight_buffer_count(&self) -> usize {
        self.in_flight_buffers.len()
    }

    pub fn free_buffer_count(&self) -> usize {
        self.buffer_free_list.len()
    }

    /// Merges `alignment` with the device's non-coherent atom size so flushed ranges always start on
    /// an atom boundary
    pub fn update_alignment(
        &mut self,
        device: &dyn DeviceContext,
        alignment: vk::DeviceSize,
    ) {
        assert!(alignment > 0);
        let atom_size = device.non_coherent_atom_size().max(1);
        let alignment = memory::least_common_multiple_u64(alignment, atom_size);

        if alignment != self.alignment {
            self.next_allocation_offset =
                memory::round_size_up_to_alignment_u64(self.next_allocation_offset, alignment);
        }

        self.alignment = alignment;
    }

    pub fn allocate(
        &mut self,
        ctx: &mut ResourceContext,
        size_in_bytes: usize,
    ) -> StrataResult<DynamicAllocation> {
        assert!(self.valid(), "DynamicBuffer used before init");
        let size_to_allocate =
            memory::round_size_up_to_alignment_u64(size_in_bytes as u64, self.alignment);

        let fits_in_current_buffer = self.buffer.is_some()
            && self
                .next_allocation_offset
                .checked_add(size_to_allocate)
                .map(|end| end <= self.size)
                .unwrap_or(false);

        let mut new_buffer_allocated = false;
        if !fits_in_current_buffer {
            self.rotate_buffer(ctx, size_to_allocate)?;
            new_buffer_allocated = true;
        }

        let offset = self.next_allocation_offset;
        self.next_allocation_offset += size_to_allocate;
        debug_assert!(self.next_allocation_offset <= self.size);

        let host_visible = self.host_visible;
        let buffer = match self.buffer.as_mut() {
            Some(buffer) => buffer,
            None => return Err("DynamicBuffer has no current buffer after rotation".into()),
        };

        let ptr = if host_visible {
            let base = buffer.map(ctx.device())?;
            Some(unsafe { base.add(offset as usize) })
        } else {
            None
        };

        Ok(DynamicAllocation {
            ptr,
            buffer: buffer.vk_buffer(),
            offset,
            size: size_to_allocate,
            new_buffer_allocated,
        })
    }

    fn rotate_buffer(
        &mut self,
        ctx: &mut ResourceContext,
        size_to_allocate: vk::DeviceSize,
    ) -> StrataResult<()> {
        if self.buffer.is_some() {
            self.flush(ctx.device())?;
            if let Some(mut buffer) = self.buffer.take() {
                if buffer.is_mapped() {
                    buffer.unmap(ctx.device());
                }
                self.in_flight_buffers.push(buffer);
            }
        }

        if size_to_allocate > self.size {
            self.size = self.initial_size.max(size_to_allocate);
            log::debug!(
                "DynamicBuffer growing to {} bytes, releasing {} undersized free buffers",
                self.size,
                self.buffer_free_list.len()
            );

            // Everything in the free list is now too small
            for mut buffer in self.buffer_free_list.drain(..) {
                buffer.release(ctx);
            }
        }

        let reuse_front = self
            .buffer_free_list
            .front()
            .map(|buffer| !buffer.is_in_use(ctx.serials()))
            .unwrap_or(false);

        let buffer = match self.buffer_free_list.pop_front() {
            Some(buffer) if reuse_front => buffer,
            front => {
                if let Some(buffer) = front {
                    self.buffer_free_list.push_front(buffer);
                }
                self.create_buffer(ctx.device())?
            }
        };
        // A buffer from before a shrink may be larger, allocations stay bounded by `self.size`
        debug_assert!(buffer.size() >= self.size);

        self.buffer = Some(buffer);
        self.next_allocation_offset = 0;
        self.last_flush_or_invalidate_offset = 0;
        Ok(())
    }

    fn create_buffer(
        &self,
        device: &dyn DeviceContext,
    ) -> StrataResult<BufferHelper> {
        let memory_property_flags = if self.host_visible {
            vk::MemoryPropertyFlags::HOST_VISIBLE
        } else {
            vk::MemoryPropertyFlags::DEVICE_LOCAL
        };

        log::debug!("DynamicBuffer allocating a new {} byte buffer", self.size);
        BufferHelper::new(device, self.usage, self.size, memory_property_flags)
    }

    /// Makes host writes since the last flush visible to the device
    pub fn flush(
        &mut self,
        device: &dyn DeviceContext,
    ) -> StrataResult<()> {
        if self.host_visible && self.next_allocation_offset > self.last_flush_or_invalidate_offset {
            if let Some(buffer) = &self.buffer {
                buffer.flush(
                    device,
                    self.last_flush_or_invalidate_offset,
                    self.next_allocation_offset - self.last_flush_or_invalidate_offset,
                )?;
            }
            self.last_flush_or_invalidate_offset = self.next_allocation_offset;
        }
        Ok(())
    }

    /// Makes device writes since the last invalidate visible to the host
    pub fn invalidate(
        &mut self,
        device: &dyn DeviceContext,
    ) -> StrataResult<()> {
        if self.host_visible && self.next_allocation_offset > self.last_flush_or_invalidate_offset {
            if let Some(buffer) = &self.buffer {
                buffer.invalidate(
                    device,
                    self.last_flush_or_invalidate_offset,
                    self.next_allocation_offset - self.last_flush_or_invalidate_offset,
                )?;
            }
            self.last_flush_or_invalidate_offset = self.next_allocation_offset;
        }
        Ok(())
    }

    /// Call once the work that used in-flight buffers has been submitted. Buffers that are still
    /// big enough wait on the free list until the GPU is done with them, the rest are released.
    pub fn release_in_flight_buffers(
        &mut self,
        ctx: &mut ResourceContext,
    ) {
        for mut buffer in self.in_flight_buffers.drain(..) {
            if buffer.size() < self.size {
                buffer.release(ctx);
            } else {
                self.buffer_free_list.push_back(buffer);
            }
        }
    }

    /// Releases every buffer to the garbage collector and forgets allocation state
    pub fn release(
        &mut self,
        ctx: &mut ResourceContext,
    ) {
        self.reset();

        for mut buffer in self.in_flight_buffers.drain(..) {
            buffer.release(ctx);
        }
        for mut buffer in self.buffer_free_list.drain(..) {
            buffer.release(ctx);
        }
        if let Some(mut buffer) = self.buffer.take() {
            buffer.release(ctx);
        }
    }

    /// Destroys every buffer immediately. The caller guarantees the GPU is idle.
    pub fn destroy(
        &mut self,
        device: &dyn DeviceContext,
    ) {
        self.reset();

        for mut buffer in self.in_flight_buffers.drain(..) {
            buffer.destroy(device);
        }
        for mut buffer in self.buffer_free_list.drain(..) {
            buffer.destroy(device);
        }
        if let Some(mut buffer) = self.buffer.take() {
            buffer.destroy(device);
        }
    }

    pub fn reset(&mut self) {
        self.size = 0;
        self.next_allocation_offset = 0;
        self.last_flush_or_invalidate_offset = 0;
    }

    /// Forces the next allocation to start a new buffer of at least `min_size` bytes
    pub fn set_minimum_size_for_testing(
        &mut self,
        min_size: vk::DeviceSize,
    ) {
        self.initial_size = min_size;
        self.size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{DeviceContextHeadless, HeadlessDeviceConfig};
    use crate::GarbageCollector;
    use strata_base::{QueueSerialTracker, SerialSource};

    fn setup() -> (DeviceContextHeadless, QueueSerialTracker, GarbageCollector) {
        setup_with_config(HeadlessDeviceConfig::default())
    }

    fn setup_with_config(
        config: HeadlessDeviceConfig
    ) -> (DeviceContextHeadless, QueueSerialTracker, GarbageCollector) {
        let _ = env_logger::builder().is_test(true).try_init();
        (
            DeviceContextHeadless::new(config),
            QueueSerialTracker::new(),
            GarbageCollector::new(),
        )
    }

    fn host_visible_dynamic_buffer(
        device: &DeviceContextHeadless,
        alignment: vk::DeviceSize,
        initial_size: vk::DeviceSize,
    ) -> DynamicBuffer {
        DynamicBuffer::new(
            device,
            vk::BufferUsageFlags::TRANSFER_SRC,
            alignment,
            initial_size,
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_allocations_share_buffer() {
        let (device, tracker, mut garbage) = setup();
        let mut ctx = ResourceContext::new(&device, &tracker, &mut garbage);
        let mut dynamic_buffer = host_visible_dynamic_buffer(&device, 16, 1024);
        assert_eq!(device.created_buffer_count(), 1);

        let first = dynamic_buffer.allocate(&mut ctx, 100).unwrap();
        assert!(!first.new_buffer_allocated);
        assert_eq!(first.offset, 0);
        assert_eq!(first.size, 112);
        assert!(first.ptr.is_some());

        let second = dynamic_buffer.allocate(&mut ctx, 100).unwrap();
        assert!(!second.new_buffer_allocated);
        assert_eq!(second.offset, 112);
        assert_eq!(second.buffer, first.buffer);
        assert_eq!(device.created_buffer_count(), 1);
        assert_eq!(device.buffer_size(first.buffer), Some(1024));

        let third = dynamic_buffer.allocate(&mut ctx, 1).unwrap();
        assert_eq!(third.offset, 224);

        dynamic_buffer.destroy(&device);
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn test_oversized_allocation_grows_buffer() {
        let (device, tracker, mut garbage) = setup();
        let mut ctx = ResourceContext::new(&device, &tracker, &mut garbage);
        let mut dynamic_buffer = DynamicBuffer::new(
            &device,
            vk::BufferUsageFlags::TRANSFER_SRC,
            16,
            1024,
            false,
        )
        .unwrap();

        let allocation = dynamic_buffer.allocate(&mut ctx, 2048).unwrap();
        assert!(allocation.new_buffer_allocated);
        assert_eq!(allocation.offset, 0);
        assert!(allocation.ptr.is_none());
        assert_eq!(dynamic_buffer.size(), 2048);
        assert_eq!(device.buffer_size(allocation.buffer), Some(2048));
        assert_eq!(dynamic_buffer.in_flight_buffer_count(), 1);

        dynamic_buffer.destroy(&device);
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn test_exact_fit_stays_in_buffer() {
        let (device, tracker, mut garbage) = setup();
        let mut ctx = ResourceContext::new(&device, &tracker, &mut garbage);
        let mut dynamic_buffer = host_visible_dynamic_buffer(&device, 16, 256);

        let first = dynamic_buffer.allocate(&mut ctx, 128).unwrap();
        let second = dynamic_buffer.allocate(&mut ctx, 128).unwrap();
        assert!(!second.new_buffer_allocated);
        assert_eq!(second.buffer, first.buffer);

        let third = dynamic_buffer.allocate(&mut ctx, 16).unwrap();
        assert!(third.new_buffer_allocated);
        assert_ne!(third.buffer, first.buffer);
        assert_eq!(third.offset, 0);
        assert_eq!(dynamic_buffer.in_flight_buffer_count(), 1);

        dynamic_buffer.destroy(&device);
    }

    #[test]
    fn test_offsets_increase_without_overlap() {
        let (device, tracker, mut garbage) = setup();
        let mut ctx = ResourceContext::new(&device, &tracker, &mut garbage);
        let mut dynamic_buffer = host_visible_dynamic_buffer(&device, 64, 4096);

        let mut previous_end = 0;
        for size in [1usize, 63, 64, 65, 200, 7, 128] {
            let allocation = dynamic_buffer.allocate(&mut ctx, size).unwrap();
            assert_eq!(allocation.offset % 64, 0);
            assert!(allocation.offset >= previous_end);
            assert!(allocation.size >= size as u64);
            previous_end = allocation.offset + allocation.size;
        }
        assert_eq!(device.created_buffer_count(), 1);

        dynamic_buffer.destroy(&device);
    }

    #[test]
    fn test_retired_buffer_reused_after_serial_completes() {
        let (device, tracker, mut garbage) = setup();
        let mut ctx = ResourceContext::new(&device, &tracker, &mut garbage);
        let mut dynamic_buffer = host_visible_dynamic_buffer(&device, 16, 256);

        let first = dynamic_buffer.allocate(&mut ctx, 256).unwrap();
        if let Some(buffer) = dynamic_buffer.current_buffer() {
            buffer.use_in_recording(&tracker);
        }

        // Rotate away from the first buffer and hand it back to the free list
        let second = dynamic_buffer.allocate(&mut ctx, 256).unwrap();
        assert!(second.new_buffer_allocated);
        dynamic_buffer.release_in_flight_buffers(&mut ctx);
        assert_eq!(dynamic_buffer.free_buffer_count(), 1);

        // Still in use by the GPU, so rotating again creates a third buffer
        let third = dynamic_buffer.allocate(&mut ctx, 256).unwrap();
        assert_ne!(third.buffer, first.buffer);
        assert_eq!(device.created_buffer_count(), 3);
        dynamic_buffer.release_in_flight_buffers(&mut ctx);
        assert_eq!(dynamic_buffer.free_buffer_count(), 2);

        let serial = tracker.submit();
        tracker.complete(serial);
        assert!(!tracker.is_serial_in_use(serial));

        let fourth = dynamic_buffer.allocate(&mut ctx, 256).unwrap();
        assert!(fourth.new_buffer_allocated);
        assert_eq!(fourth.buffer, first.buffer);
        assert_eq!(device.created_buffer_count(), 3);

        dynamic_buffer.destroy(&device);
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn test_larger_free_buffer_reused_after_shrink() {
        let (device, tracker, mut garbage) = setup();
        let mut ctx = ResourceContext::new(&device, &tracker, &mut garbage);
        let mut dynamic_buffer = host_visible_dynamic_buffer(&device, 16, 1024);

        let first = dynamic_buffer.allocate(&mut ctx, 16).unwrap();
        dynamic_buffer.set_minimum_size_for_testing(256);

        let second = dynamic_buffer.allocate(&mut ctx, 16).unwrap();
        assert!(second.new_buffer_allocated);
        assert_eq!(device.buffer_size(second.buffer), Some(256));
        assert_eq!(dynamic_buffer.size(), 256);

        // The 1024 byte buffer is still big enough to be kept
        dynamic_buffer.release_in_flight_buffers(&mut ctx);
        assert_eq!(dynamic_buffer.free_buffer_count(), 1);

        let third = dynamic_buffer.allocate(&mut ctx, 256).unwrap();
        assert!(third.new_buffer_allocated);
        assert_eq!(third.buffer, first.buffer);
        assert_eq!(third.offset, 0);
        assert_eq!(device.created_buffer_count(), 2);

        // Allocations stay bounded by the shrunk size
        let fourth = dynamic_buffer.allocate(&mut ctx, 16).unwrap();
        assert!(fourth.new_buffer_allocated);
        assert_ne!(fourth.buffer, first.buffer);

        dynamic_buffer.destroy(&device);
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn test_growth_releases_undersized_buffers() {
        let (device, tracker, mut garbage) = setup();
        {
            let mut ctx = ResourceContext::new(&device, &tracker, &mut garbage);
            let mut dynamic_buffer = host_visible_dynamic_buffer(&device, 16, 256);

            dynamic_buffer.allocate(&mut ctx, 256).unwrap();
            dynamic_buffer.allocate(&mut ctx, 256).unwrap();
            dynamic_buffer.release_in_flight_buffers(&mut ctx);
            assert_eq!(dynamic_buffer.free_buffer_count(), 1);

            // Growing makes the free 256 byte buffer useless
            let big = dynamic_buffer.allocate(&mut ctx, 1024).unwrap();
            assert_eq!(device.buffer_size(big.buffer), Some(1024));
            assert_eq!(dynamic_buffer.free_buffer_count(), 0);

            // The retired 256 byte buffer is undersized too
            dynamic_buffer.release_in_flight_buffers(&mut ctx);
            assert_eq!(dynamic_buffer.free_buffer_count(), 0);

            dynamic_buffer.release(&mut ctx);
            assert!(dynamic_buffer.current_buffer().is_none());
        }

        // Three buffers, each with its memory
        assert_eq!(garbage.pending_object_count(), 6);
        assert_eq!(garbage.cleanup(&device, &tracker), 6);
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn test_flush_covers_unflushed_range() {
        let (device, tracker, mut garbage) = setup_with_config(HeadlessDeviceConfig {
            host_coherent: false,
            non_coherent_atom_size: 64,
            ..Default::default()
        });
        let mut ctx = ResourceContext::new(&device, &tracker, &mut garbage);
        let mut dynamic_buffer = host_visible_dynamic_buffer(&device, 16, 1024);
        assert_eq!(dynamic_buffer.alignment(), 64);

        dynamic_buffer.allocate(&mut ctx, 10).unwrap();
        dynamic_buffer.allocate(&mut ctx, 70).unwrap();
        dynamic_buffer.flush(&device).unwrap();
        // Nothing new to flush
        dynamic_buffer.flush(&device).unwrap();

        dynamic_buffer.allocate(&mut ctx, 64).unwrap();
        dynamic_buffer.flush(&device).unwrap();

        let flushed = device.flushed_ranges();
        assert_eq!(flushed.len(), 2);
        assert_eq!((flushed[0].offset, flushed[0].size), (0, 192));
        assert_eq!((flushed[1].offset, flushed[1].size), (192, 64));

        dynamic_buffer.destroy(&device);
    }

    #[test]
    fn test_rotation_flushes_and_unmaps() {
        let (device, tracker, mut garbage) = setup_with_config(HeadlessDeviceConfig {
            host_coherent: false,
            ..Default::default()
        });
        let mut ctx = ResourceContext::new(&device, &tracker, &mut garbage);
        let mut dynamic_buffer = host_visible_dynamic_buffer(&device, 16, 128);

        let first = dynamic_buffer.allocate(&mut ctx, 96).unwrap();
        let first_memory = dynamic_buffer
            .current_buffer()
            .map(|buffer| buffer.device_memory().memory)
            .unwrap();
        dynamic_buffer.allocate(&mut ctx, 96).unwrap();

        assert!(!device.is_memory_mapped(first_memory));
        let flushed = device.flushed_ranges();
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].memory, first_memory);
        assert_eq!(flushed[0].size, first.size);

        dynamic_buffer.destroy(&device);
    }

    #[test]
    fn test_update_alignment() {
        let (device, _tracker, _garbage) = setup();
        let mut dynamic_buffer = host_visible_dynamic_buffer(&device, 4, 1024);
        assert_eq!(dynamic_buffer.alignment(), 16);

        // Three-component texel sizes are not powers of two
        dynamic_buffer.update_alignment(&device, 12);
        assert_eq!(dynamic_buffer.alignment(), 48);

        dynamic_buffer.destroy(&device);
    }

    #[test]
    fn test_allocation_failure_is_surfaced() {
        let (device, tracker, mut garbage) = setup();

        device.fail_next_allocation();
        assert!(DynamicBuffer::new(
            &device,
            vk::BufferUsageFlags::TRANSFER_SRC,
            16,
            1024,
            true
        )
        .is_err());

        let mut ctx = ResourceContext::new(&device, &tracker, &mut garbage);
        let mut dynamic_buffer = host_visible_dynamic_buffer(&device, 16, 1024);
        device.fail_next_allocation();
        let result = dynamic_buffer.allocate(&mut ctx, 2048);
        assert_eq!(
            result.unwrap_err().vk_result(),
            Some(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY)
        );
        assert!(dynamic_buffer.current_buffer().is_none());
        // The failed buffer was destroyed, the retired one is waiting in flight
        assert_eq!(device.live_buffer_count(), 1);

        let allocation = dynamic_buffer.allocate(&mut ctx, 2048).unwrap();
        assert!(allocation.new_buffer_allocated);
        dynamic_buffer.destroy(&device);
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn test_allocation_pointer_writes_land_in_buffer() {
        let (device, tracker, mut garbage) = setup();
        let mut ctx = ResourceContext::new(&device, &tracker, &mut garbage);
        let mut dynamic_buffer = host_visible_dynamic_buffer(&device, 16, 256);

        dynamic_buffer.allocate(&mut ctx, 16).unwrap();
        let allocation = dynamic_buffer.allocate(&mut ctx, 4).unwrap();
        let data = unsafe { allocation.as_mut_slice() }.unwrap();
        data[..4].copy_from_slice(&[1, 2, 3, 4]);

        let memory = dynamic_buffer
            .current_buffer()
            .map(|buffer| buffer.device_memory().memory)
            .unwrap();
        assert_eq!(&device.memory_contents(memory)[16..20], &[1, 2, 3, 4]);

        dynamic_buffer.destroy(&device);
    }
}
