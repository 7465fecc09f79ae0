use crate::StrataResult;
use ash::vk;

/// An open command buffer owned by whoever drives submission. Resource helpers append barriers and
/// transfer commands to it but never begin, submit or reset it, except for `finish` on the readback
/// path.
pub trait CommandRecorder {
    fn pipeline_barrier(
        &mut self,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        memory_barriers: &[vk::MemoryBarrier],
        buffer_memory_barriers: &[vk::BufferMemoryBarrier],
        image_memory_barriers: &[vk::ImageMemoryBarrier],
    );

    /// Orders execution of `stage_mask` work without making any memory available or visible
    fn execution_barrier(
        &mut self,
        stage_mask: vk::PipelineStageFlags,
    ) {
        self.pipeline_barrier(stage_mask, stage_mask, &[], &[], &[]);
    }

    fn memory_barrier(
        &mut self,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        src_access_mask: vk::AccessFlags,
        dst_access_mask: vk::AccessFlags,
    ) {
        let barrier = vk::MemoryBarrier::builder()
            .src_access_mask(src_access_mask)
            .dst_access_mask(dst_access_mask)
            .build();

        self.pipeline_barrier(src_stage_mask, dst_stage_mask, &[barrier], &[], &[]);
    }

    fn image_barrier(
        &mut self,
        src_stage_mask: vk::PipelineStageFlags,
        dst_stage_mask: vk::PipelineStageFlags,
        image_memory_barrier: &vk::ImageMemoryBarrier,
    ) {
        self.pipeline_barrier(
            src_stage_mask,
            dst_stage_mask,
            &[],
            &[],
            std::slice::from_ref(image_memory_barrier),
        );
    }

    fn copy_buffer(
        &mut self,
        src_buffer: vk::Buffer,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferCopy],
    );

    fn copy_buffer_to_image(
        &mut self,
        src_buffer: vk::Buffer,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: &[vk::BufferImageCopy],
    );

    fn copy_image_to_buffer(
        &mut self,
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_buffer: vk::Buffer,
        regions: &[vk::BufferImageCopy],
    );

    fn copy_image(
        &mut self,
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: &[vk::ImageCopy],
    );

    fn blit_image(
        &mut self,
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: &[vk::ImageBlit],
        filter: vk::Filter,
    );

    fn resolve_image(
        &mut self,
        src_image: vk::Image,
        src_image_layout: vk::ImageLayout,
        dst_image: vk::Image,
        dst_image_layout: vk::ImageLayout,
        regions: &[vk::ImageResolve],
    );

    fn clear_color_image(
        &mut self,
        image: vk::Image,
        image_layout: vk::ImageLayout,
        color: &vk::ClearColorValue,
        ranges: &[vk::ImageSubresourceRange],
    );

    fn clear_depth_stencil_image(
        &mut self,
        image: vk::Image,
        image_layout: vk::ImageLayout,
        depth_stencil: &vk::ClearDepthStencilValue,
        ranges: &[vk::ImageSubresourceRange],
    );

    fn reset_query_pool(
        &mut self,
        query_pool: vk::QueryPool,
        first_query: u32,
        query_count: u32,
    );

    fn begin_query(
        &mut self,
        query_pool: vk::QueryPool,
        query: u32,
        flags: vk::QueryControlFlags,
    );

    fn end_query(
        &mut self,
        query_pool: vk::QueryPool,
        query: u32,
    );

    fn write_timestamp(
        &mut self,
        pipeline_stage: vk::PipelineStageFlags,
        query_pool: vk::QueryPool,
        query: u32,
    );

    /// Submits everything recorded so far and blocks until the GPU has executed it. Recording can
    /// continue afterwards.
    fn finish(&mut self) -> StrataResult<()>;
}
