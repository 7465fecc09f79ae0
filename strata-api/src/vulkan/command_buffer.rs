use crate::{CommandRecorder, StrataResult};
use ash::vk;

/// Records into a primary command buffer that is already in the recording state. `finish` submits
/// it to `queue`, waits for the queue to go idle and begins recording again.
pub struct CommandBufferVulkan {
    device: ash::Device,
    command_buffer: vk::CommandBuffer,
    queue: vk::Queue,
}

impl CommandBufferVulkan {
    pub fn new(
        device: ash::Device,
        command_buffer: vk::CommandBuffer,
        queue: vk::Queue,
    ) -> Self {
        CommandBufferVulkan {
            device,
            command_buffer,
            queue,
        }
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }
}

impl CommandRecorder for CommandBufferVulkan {
    fn pipeline_barrier(
        &mut self,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        memory_barriers: &[vk::MemoryBarrier],
        buffer_memory_barriers: &[vk::BufferMemoryBarrier],
        image_memory_barriers: &[vk::ImageMemoryBarrier],
    ) {
        unsafe {
            self.device.cmd_pipeline_barrier(
                self.command_buffer,
                src_stage_mask,
                dst_stage_mask,
                vk::DependencyFlags::empty(),
                memory_barriers,
                buffer_memory_barriers,
                image_memory_barriers,
            );
        }
    }

    fn copy_buffer(
        &mut self,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe {
            self.device
                .cmd_copy_buffer(self.command_buffer, src_buffer, dst_buffer, regions);
        }
    }

    fn copy_buffer_to_image(
        &mut self,
        src_buffer: vk::Buffer,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device.cmd_copy_buffer_to_image(
                self.command_buffer,
                src_buffer,
                dst_image,
                dst_image_layout,
                regions,
            );
        }
    }

    fn copy_image_to_buffer(
        &mut self,
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    ) {
        unsafe {
            self.device.cmd_copy_image_to_buffer(
                self.command_buffer,
                src_image,
                src_image_layout,
                dst_buffer,
                regions,
            );
        }
    }

    fn copy_image(
        &mut self,
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    ) {
        unsafe {
            self.device.cmd_copy_image(
                self.command_buffer,
                src_image,
                src_image_layout,
                dst_image,
                dst_image_layout,
                regions,
            );
        }
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
        unsafe {
            self.device.cmd_blit_image(
                self.command_buffer,
                src_image,
                src_image_layout,
                dst_image,
                dst_image_layout,
                regions,
                filter,
            );
        }
    }

    fn resolve_image(
        &mut self,
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: &[vk::ImageResolve],
    ) {
        unsafe {
            self.device.cmd_resolve_image(
                self.command_buffer,
                src_image,
                src_image_layout,
                dst_image,
                dst_image_layout,
                regions,
            );
        }
    }

    fn clear_color_image(
        &mut self,
        image: vk::Image,
        image_layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        unsafe {
            self.device
                .cmd_clear_color_image(self.command_buffer, image, image_layout, color, ranges);
        }
    }

    fn clear_depth_stencil_image(
        &mut self,
        image: vk::Image,
        image_layout: vk::ImageLayout,
        depth_stencil: &vk::ClearDepthStencilValue,
        ranges: &[vk::ImageSubresourceRange],
    ) {
        unsafe {
            self.device.cmd_clear_depth_stencil_image(
                self.command_buffer,
                image,
                image_layout,
                depth_stencil,
                ranges,
            );
        }
    }

    fn reset_query_pool(
        &mut self,
        query_pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
    ) {
        unsafe {
            self.device.cmd_reset_query_pool(
                self.command_buffer,
                query_pool,
                first_query,
                query_count,
            );
        }
    }

    fn begin_query(
        &mut self,
        query_pool: vk::QueryPool,
        query: u32,
        flags: vk::QueryControlFlags,
    ) {
        unsafe {
            self.device
                .cmd_begin_query(self.command_buffer, query_pool, query, flags);
        }
    }

    fn end_query(
        &mut self,
        query_pool: vk::QueryPool,
        query: u32,
    ) {
        unsafe {
            self.device
                .cmd_end_query(self.command_buffer, query_pool, query);
        }
    }

    fn write_timestamp(
        &mut self,
        pipeline_stage: vk::PipelineStageFlags,
        query_pool: vk::QueryPool,
        query: u32,
    ) {
        unsafe {
            self.device
                .cmd_write_timestamp(self.command_buffer, pipeline_stage, query_pool, query);
        }
    }

    fn finish(&mut self) -> StrataResult<()> {
        log::trace!("Submitting command buffer {:?} and waiting for idle", self.command_buffer);

        let command_buffers = [self.command_buffer];
        let submit_info = vk::SubmitInfo::builder()
            .command_buffers(&command_buffers)
            .build();

        unsafe {
            self.device.end_command_buffer(self.command_buffer)?;
            self.device
                .queue_submit(self.queue, &[submit_info], vk::Fence::null())?;
            self.device.queue_wait_idle(self.queue)?;

            self.device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())?;

            let begin_info = vk::CommandBufferBeginInfo::builder()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            self.device
                .begin_command_buffer(self.command_buffer, &begin_info)?;
        }

        Ok(())
    }
}
