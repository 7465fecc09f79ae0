use ash::vk;

/// Every layout an image managed by `ImageHelper` can be in. Each maps to exactly one
/// [`ImageMemoryBarrierData`] record, and all image barriers are built from those records.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    Undefined,
    ExternalPreInitialized,
    TransferSrc,
    TransferDst,
    ComputeShaderReadOnly,
    ComputeShaderWrite,
    AllGraphicsShadersReadOnly,
    AllGraphicsShadersWrite,
    ColorAttachment,
    DepthStencilAttachment,
    Present,
}

impl Default for ImageLayout {
    fn default() -> Self {
        ImageLayout::Undefined
    }
}

/// Stage and access masks for entering (`dst_*`) and leaving (`src_*`) a layout
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageMemoryBarrierData {
    pub layout: vk::ImageLayout,
    /// Stages that must wait before the image is used in this layout
    pub dst_stage_mask: vk::PipelineStageFlags,
    /// Stages that last touched the image while it was in this layout
    pub src_stage_mask: vk::PipelineStageFlags,
    /// Accesses that must see prior writes when transitioning into this layout
    pub dst_access_mask: vk::AccessFlags,
    /// Writes that must be made available when transitioning out of this layout
    pub src_access_mask: vk::AccessFlags,
    /// Writes in this layout may race with the next write in the same layout
    pub same_layout_transition_requires_barrier: bool,
}

impl ImageLayout {
    pub const ALL: [ImageLayout; 11] = [
        ImageLayout::Undefined,
        ImageLayout::ExternalPreInitialized,
        ImageLayout::TransferSrc,
        ImageLayout::TransferDst,
        ImageLayout::ComputeShaderReadOnly,
        ImageLayout::ComputeShaderWrite,
        ImageLayout::AllGraphicsShadersReadOnly,
        ImageLayout::AllGraphicsShadersWrite,
        ImageLayout::ColorAttachment,
        ImageLayout::DepthStencilAttachment,
        ImageLayout::Present,
    ];

    pub fn vk_layout(self) -> vk::ImageLayout {
        self.barrier_data().layout
    }

    pub fn barrier_data(self) -> ImageMemoryBarrierData {
        match self {
            ImageLayout::Undefined => ImageMemoryBarrierData {
                layout: vk::ImageLayout::UNDEFINED,
                dst_stage_mask: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                src_stage_mask: vk::PipelineStageFlags::TOP_OF_PIPE,
                // Transition to: we don't expect to transition into Undefined.
                dst_access_mask: vk::AccessFlags::empty(),
                // Transition from: there's no data in the image to care about.
                src_access_mask: vk::AccessFlags::empty(),
                same_layout_transition_requires_barrier: false,
            },
            ImageLayout::ExternalPreInitialized => ImageMemoryBarrierData {
                layout: vk::ImageLayout::PREINITIALIZED,
                dst_stage_mask: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                src_stage_mask: vk::PipelineStageFlags::HOST
                    | vk::PipelineStageFlags::ALL_COMMANDS,
                dst_access_mask: vk::AccessFlags::empty(),
                // The host may have written anything before handing the image over
                src_access_mask: vk::AccessFlags::MEMORY_WRITE,
                same_layout_transition_requires_barrier: false,
            },
            ImageLayout::TransferSrc => ImageMemoryBarrierData {
                layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst_stage_mask: vk::PipelineStageFlags::TRANSFER,
                src_stage_mask: vk::PipelineStageFlags::TRANSFER,
                dst_access_mask: vk::AccessFlags::TRANSFER_READ,
                // Transition from: RAR and WAR don't need memory barrier.
                src_access_mask: vk::AccessFlags::empty(),
                same_layout_transition_requires_barrier: false,
            },
            ImageLayout::TransferDst => ImageMemoryBarrierData {
                layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                dst_stage_mask: vk::PipelineStageFlags::TRANSFER,
                src_stage_mask: vk::PipelineStageFlags::TRANSFER,
                // Transition to: all writes must happen after barrier.
                dst_access_mask: vk::AccessFlags::TRANSFER_WRITE,
                // Transition from: all writes must finish before barrier.
                src_access_mask: vk::AccessFlags::TRANSFER_WRITE,
                same_layout_transition_requires_barrier: true,
            },
            ImageLayout::ComputeShaderReadOnly => ImageMemoryBarrierData {
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                dst_stage_mask: vk::PipelineStageFlags::COMPUTE_SHADER,
                src_stage_mask: vk::PipelineStageFlags::COMPUTE_SHADER,
                dst_access_mask: vk::AccessFlags::SHADER_READ,
                src_access_mask: vk::AccessFlags::empty(),
                same_layout_transition_requires_barrier: false,
            },
            ImageLayout::ComputeShaderWrite => ImageMemoryBarrierData {
                layout: vk::ImageLayout::GENERAL,
                dst_stage_mask: vk::PipelineStageFlags::COMPUTE_SHADER,
                src_stage_mask: vk::PipelineStageFlags::COMPUTE_SHADER,
                dst_access_mask: vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                src_access_mask: vk::AccessFlags::SHADER_WRITE,
                same_layout_transition_requires_barrier: true,
            },
            ImageLayout::AllGraphicsShadersReadOnly => ImageMemoryBarrierData {
                layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                dst_stage_mask: vk::PipelineStageFlags::ALL_GRAPHICS,
                src_stage_mask: vk::PipelineStageFlags::ALL_GRAPHICS,
                dst_access_mask: vk::AccessFlags::SHADER_READ,
                src_access_mask: vk::AccessFlags::empty(),
                same_layout_transition_requires_barrier: false,
            },
            ImageLayout::AllGraphicsShadersWrite => ImageMemoryBarrierData {
                layout: vk::ImageLayout::GENERAL,
                dst_stage_mask: vk::PipelineStageFlags::ALL_GRAPHICS,
                src_stage_mask: vk::PipelineStageFlags::ALL_GRAPHICS,
                dst_access_mask: vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
                src_access_mask: vk::AccessFlags::SHADER_WRITE,
                same_layout_transition_requires_barrier: true,
            },
            ImageLayout::ColorAttachment => ImageMemoryBarrierData {
                layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_READ
                    | vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
                same_layout_transition_requires_barrier: true,
            },
            ImageLayout::DepthStencilAttachment => ImageMemoryBarrierData {
                layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                dst_stage_mask: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                src_stage_mask: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
                dst_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                src_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
                same_layout_transition_requires_barrier: true,
            },
            ImageLayout::Present => ImageMemoryBarrierData {
                layout: vk::ImageLayout::PRESENT_SRC_KHR,
                dst_stage_mask: vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                src_stage_mask: vk::PipelineStageFlags::TOP_OF_PIPE,
                // Transition to: vkQueuePresentKHR automatically performs the appropriate memory barriers
                dst_access_mask: vk::AccessFlags::empty(),
                src_access_mask: vk::AccessFlags::empty(),
                same_layout_transition_requires_barrier: false,
            },
        }
    }
}
