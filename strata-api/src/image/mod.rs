mod readback;
pub use readback::{
    get_read_pixels_params, pack_pixels, ImageReadbackBuffer, PackPixelsParams, PixelPackState,
};

mod staging;
pub use staging::{ImageIndex, SubresourceUpdate};

use crate::{
    CommandRecorder, DeviceContext, DeviceMemory, DynamicBuffer, ExternalMemoryImport, Format,
    GarbageObject, ImageDef, ImageLayout, ResourceContext, StrataResult,
};
use ash::vk;
use std::collections::VecDeque;
use strata_base::{ResourceUse, SerialSource};

/// Initial size of the per-image buffer pixel uploads are staged through
pub const STAGING_BUFFER_SIZE: vk::DeviceSize = 16 * 1024;

pub const DEFAULT_CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 0.0];

/// Channels the intended format lacks read back as opaque black
pub const EMULATED_CHANNELS_CLEAR_COLOR: [f32; 4] = [0.0, 0.0, 0.0, 1.0];

pub const DEFAULT_CLEAR_DEPTH_STENCIL: vk::ClearDepthStencilValue = vk::ClearDepthStencilValue {
    depth: 1.0,
    stencil: 0,
};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum TextureType {
    Texture2D,
    Texture2DArray,
    Texture2DMultisample,
    Texture3D,
    CubeMap,
}

impl TextureType {
    pub fn image_type(self) -> vk::ImageType {
        match self {
            TextureType::Texture3D => vk::ImageType::TYPE_3D,
            _ => vk::ImageType::TYPE_2D,
        }
    }

    pub fn create_flags(self) -> vk::ImageCreateFlags {
        match self {
            TextureType::CubeMap => vk::ImageCreateFlags::CUBE_COMPATIBLE,
            _ => vk::ImageCreateFlags::empty(),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil(f32, u32),
}

impl ClearValue {
    pub fn default_for_format(format: &Format) -> Self {
        if format.has_depth_or_stencil() {
            ClearValue::DepthStencil(
                DEFAULT_CLEAR_DEPTH_STENCIL.depth,
                DEFAULT_CLEAR_DEPTH_STENCIL.stencil,
            )
        } else {
            ClearValue::Color(DEFAULT_CLEAR_COLOR)
        }
    }
}

/// Parameters for [`ImageHelper::new`]
#[derive(Clone, Debug)]
pub struct ImageInitInfo {
    pub texture_type: TextureType,
    pub extents: vk::Extent3D,
    pub format: Format,
    pub samples: u32,
    pub usage: vk::ImageUsageFlags,
    /// Texture level that maps to level 0 of the image
    pub base_level: u32,
    pub mip_levels: u32,
    pub layer_count: u32,
    /// Must be `Undefined` or `ExternalPreInitialized`
    pub initial_layout: ImageLayout,
}

impl ImageInitInfo {
    pub fn texture_2d(
        format: Format,
        width: u32,
        height: u32,
        mip_levels: u32,
    ) -> Self {
        ImageInitInfo {
            texture_type: TextureType::Texture2D,
            extents: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
            format,
            samples: 1,
            usage: vk::ImageUsageFlags::TRANSFER_SRC
                | vk::ImageUsageFlags::TRANSFER_DST
                | vk::ImageUsageFlags::SAMPLED,
            base_level: 0,
            mip_levels,
            layer_count: 1,
            initial_layout: ImageLayout::Undefined,
        }
    }
}

/// Owns (or borrows) a native image and tracks its layout and queue family ownership. Every layout
/// transition goes through the [`ImageLayout`] barrier table. Uploads are staged into a queue of
/// [`SubresourceUpdate`]s and recorded in one go by `flush_staged_updates`.
///
/// Must be released (deferred until the GPU is done) or destroyed (immediately) before dropping.
pub struct ImageHelper {
    image: vk::Image,
    device_memory: Option<DeviceMemory>,
    owns_image: bool,

    texture_type: TextureType,
    extents: vk::Extent3D,
    format: Format,
    samples: u32,

    current_layout: ImageLayout,
    current_queue_family_index: u32,

    base_level: u32,
    max_level: u32,
    level_count: u32,
    layer_count: u32,

    staging_buffer: DynamicBuffer,
    subresource_updates: VecDeque<SubresourceUpdate>,
    resource_use: ResourceUse,
}

impl ImageHelper {
    pub fn new(
        device: &dyn DeviceContext,
        info: &ImageInitInfo,
    ) -> StrataResult<Self> {
        Self::new_external(device, info, vk::ExternalMemoryHandleTypeFlags::empty())
    }

    /// Creates an image whose memory can be imported with the given handle types. Bind it with
    /// [`init_external_memory`](Self::init_external_memory).
    pub fn new_external(
        device: &dyn DeviceContext,
        info: &ImageInitInfo,
        external_memory_handle_types: vk::ExternalMemoryHandleTypeFlags,
    ) -> StrataResult<Self> {
        assert!(info.mip_levels > 0 && info.layer_count > 0);
        assert!(
            info.initial_layout == ImageLayout::Undefined
                || info.initial_layout == ImageLayout::ExternalPreInitialized,
            "images can only be created in an undefined or preinitialized layout"
        );
        match info.texture_type {
            TextureType::CubeMap => assert_eq!(info.layer_count % 6, 0),
            TextureType::Texture3D => assert_eq!(info.layer_count, 1),
            _ => {}
        }

        let mut extents = info.extents;
        if info.texture_type != TextureType::Texture3D {
            extents.depth = 1;
        }

        let image = device.create_image(&ImageDef {
            image_type: info.texture_type.image_type(),
            format: info.format.actual_format,
            extent: extents,
            mip_levels: info.mip_levels,
            array_layers: info.layer_count,
            samples: vk::SampleCountFlags::from_raw(info.samples),
            usage: info.usage,
            flags: info.texture_type.create_flags(),
            initial_layout: info.initial_layout.vk_layout(),
            external_memory_handle_types,
        })?;

        log::trace!(
            "Image {:?} created: {:?} {:?} {}x{}x{}, {} levels, {} layers",
            image,
            info.texture_type,
            info.format.actual_format,
            extents.width,
            extents.height,
            extents.depth,
            info.mip_levels,
            info.layer_count
        );

        Ok(ImageHelper {
            image,
            device_memory: None,
            owns_image: true,
            texture_type: info.texture_type,
            extents,
            format: info.format.clone(),
            samples: info.samples,
            current_layout: info.initial_layout,
            current_queue_family_index: device.queue_family_index(),
            base_level: info.base_level,
            max_level: info.base_level + info.mip_levels - 1,
            level_count: info.mip_levels,
            layer_count: info.layer_count,
            staging_buffer: DynamicBuffer::default(),
            subresource_updates: VecDeque::default(),
            resource_use: ResourceUse::new(),
        })
    }

    /// Allocates and binds memory for the image. The image is owned by the device's queue family
    /// afterwards.
    pub fn init_memory(
        &mut self,
        device: &dyn DeviceContext,
        memory_property_flags: vk::MemoryPropertyFlags,
    ) -> StrataResult<()> {
        assert!(self.valid() && self.device_memory.is_none());
        self.device_memory = Some(device.allocate_image_memory(self.image, memory_property_flags)?);
        self.current_queue_family_index = device.queue_family_index();
        Ok(())
    }

    /// Binds memory using requirements the exporter reported, optionally importing it. The image
    /// starts out owned by `current_queue_family_index`, usually `vk::QUEUE_FAMILY_EXTERNAL`, and
    /// is acquired with [`change_layout_and_queue`](Self::change_layout_and_queue).
    pub fn init_external_memory(
        &mut self,
        device: &dyn DeviceContext,
        memory_requirements: &vk::MemoryRequirements,
        memory_property_flags: vk::MemoryPropertyFlags,
        import: Option<ExternalMemoryImport>,
        current_queue_family_index: u32,
    ) -> StrataResult<()> {
        assert!(self.valid() && self.device_memory.is_none());
        self.device_memory = Some(device.allocate_image_memory_with_requirements(
            self.image,
            memory_requirements,
            memory_property_flags,
            import,
        )?);
        self.current_queue_family_index = current_queue_family_index;
        Ok(())
    }

    /// Wraps an image owned elsewhere, like a swapchain image. It is never destroyed by this
    /// helper.
    pub fn init_2d_weak_reference(
        image: vk::Image,
        extents: vk::Extent2D,
        format: Format,
        samples: u32,
    ) -> Self {
        ImageHelper {
            image,
            device_memory: None,
            owns_image: false,
            texture_type: TextureType::Texture2D,
            extents: vk::Extent3D {
                width: extents.width,
                height: extents.height,
                depth: 1,
            },
            format,
            samples,
            current_layout: ImageLayout::Undefined,
            current_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
            base_level: 0,
            max_level: 0,
            level_count: 1,
            layer_count: 1,
            staging_buffer: DynamicBuffer::default(),
            subresource_updates: VecDeque::default(),
            resource_use: ResourceUse::new(),
        }
    }

    /// A single level, device local image that is only ever copied to and from
    pub fn init_2d_staging(
        device: &dyn DeviceContext,
        extents: vk::Extent2D,
        format: Format,
        usage: vk::ImageUsageFlags,
        layer_count: u32,
    ) -> StrataResult<Self> {
        let mut image = ImageHelper::new(
            device,
            &ImageInitInfo {
                texture_type: if layer_count > 1 {
                    TextureType::Texture2DArray
                } else {
                    TextureType::Texture2D
                },
                extents: vk::Extent3D {
                    width: extents.width,
                    height: extents.height,
                    depth: 1,
                },
                format,
                samples: 1,
                usage: usage | vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::TRANSFER_DST,
                base_level: 0,
                mip_levels: 1,
                layer_count,
                initial_layout: ImageLayout::Undefined,
            },
        )?;

        if let Err(e) = image.init_memory(device, vk::MemoryPropertyFlags::DEVICE_LOCAL) {
            image.destroy(device);
            return Err(e);
        }

        Ok(image)
    }

    /// Sets up the buffer staged pixel data is written to. Staging calls do this lazily with
    /// [`STAGING_BUFFER_SIZE`] if it hasn't been done yet.
    pub fn init_staging_buffer(
        &mut self,
        device: &dyn DeviceContext,
        usage: vk::BufferUsageFlags,
        initial_size: vk::DeviceSize,
    ) -> StrataResult<()> {
        let alignment = self.format.image_copy_buffer_alignment();
        self.staging_buffer
            .init(device, usage, alignment, initial_size, true)
    }

    fn ensure_staging_buffer(
        &mut self,
        device: &dyn DeviceContext,
    ) -> StrataResult<()> {
        if !self.staging_buffer.valid() {
            self.init_staging_buffer(
                device,
                vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
                STAGING_BUFFER_SIZE,
            )?;
        }
        Ok(())
    }

    pub fn valid(&self) -> bool {
        self.image != vk::Image::null()
    }

    pub fn vk_image(&self) -> vk::Image {
        self.image
    }

    pub fn device_memory(&self) -> Option<&DeviceMemory> {
        self.device_memory.as_ref()
    }

    pub fn texture_type(&self) -> TextureType {
        self.texture_type
    }

    pub fn extents(&self) -> vk::Extent3D {
        self.extents
    }

    /// Extents of an image level, never smaller than one texel
    pub fn level_extents(
        &self,
        level: u32,
    ) -> vk::Extent3D {
        vk::Extent3D {
            width: (self.extents.width >> level).max(1),
            height: (self.extents.height >> level).max(1),
            depth: (self.extents.depth >> level).max(1),
        }
    }

    pub fn format(&self) -> &Format {
        &self.format
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    pub fn aspect_flags(&self) -> vk::ImageAspectFlags {
        self.format.aspect_flags()
    }

    pub fn current_layout(&self) -> ImageLayout {
        self.current_layout
    }

    pub fn current_queue_family_index(&self) -> u32 {
        self.current_queue_family_index
    }

    pub fn base_level(&self) -> u32 {
        self.base_level
    }

    pub fn max_level(&self) -> u32 {
        self.max_level
    }

    pub fn level_count(&self) -> u32 {
        self.level_count
    }

    pub fn layer_count(&self) -> u32 {
        self.layer_count
    }

    /// Re-bases the texture levels this image holds. Staged updates keep their texture level and
    /// are shifted when flushed.
    pub fn set_base_and_max_levels(
        &mut self,
        base_level: u32,
        max_level: u32,
    ) {
        assert!(max_level >= base_level);
        self.base_level = base_level;
        self.max_level = max_level;
    }

    pub fn resource_use(&self) -> &ResourceUse {
        &self.resource_use
    }

    pub fn staging_buffer(&self) -> &DynamicBuffer {
        &self.staging_buffer
    }

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

    pub fn is_layout_change_necessary(
        &self,
        new_layout: ImageLayout,
    ) -> bool {
        self.current_layout != new_layout
            || new_layout
                .barrier_data()
                .same_layout_transition_requires_barrier
    }

    pub fn is_queue_change_necessary(
        &self,
        new_queue_family_index: u32,
    ) -> bool {
        self.current_queue_family_index != new_queue_family_index
    }

    pub fn change_layout(
        &mut self,
        aspect_mask: vk::ImageAspectFlags,
        new_layout: ImageLayout,
        recorder: &mut dyn CommandRecorder,
    ) {
        if !self.is_layout_change_necessary(new_layout) {
            return;
        }

        let queue_family_index = self.current_queue_family_index;
        self.force_change_layout_and_queue(aspect_mask, new_layout, queue_family_index, recorder);
    }

    /// Transfers ownership to another queue family, changing layout on the way
    pub fn change_layout_and_queue(
        &mut self,
        aspect_mask: vk::ImageAspectFlags,
        new_layout: ImageLayout,
        new_queue_family_index: u32,
        recorder: &mut dyn CommandRecorder,
    ) {
        assert!(self.is_queue_change_necessary(new_queue_family_index));
        self.force_change_layout_and_queue(aspect_mask, new_layout, new_queue_family_index, recorder);
    }

    fn force_change_layout_and_queue(
        &mut self,
        aspect_mask: vk::ImageAspectFlags,
        new_layout: ImageLayout,
        new_queue_family_index: u32,
        recorder: &mut dyn CommandRecorder,
    ) {
        let transition_from = self.current_layout.barrier_data();
        let transition_to = new_layout.barrier_data();

        let same_layout_and_queue = self.current_layout == new_layout
            && self.current_queue_family_index == new_queue_family_index;

        // Back to back transfer writes race unless the first is made available to the second, so
        // TransferDst always takes the full image barrier
        if same_layout_and_queue && new_layout != ImageLayout::TransferDst {
            assert_eq!(transition_from.src_stage_mask, transition_to.dst_stage_mask);
            recorder.execution_barrier(transition_from.src_stage_mask);
        } else {
            let image_memory_barrier = vk::ImageMemoryBarrier::builder()
                .src_access_mask(transition_from.src_access_mask)
                .dst_access_mask(transition_to.dst_access_mask)
                .old_layout(transition_from.layout)
                .new_layout(transition_to.layout)
                .src_queue_family_index(self.current_queue_family_index)
                .dst_queue_family_index(new_queue_family_index)
                .image(self.image)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask,
                    base_mip_level: 0,
                    level_count: self.level_count,
                    base_array_layer: 0,
                    layer_count: self.layer_count,
                })
                .build();

            recorder.image_barrier(
                transition_from.src_stage_mask,
                transition_to.dst_stage_mask,
                &image_memory_barrier,
            );
        }

        self.current_layout = new_layout;
        self.current_queue_family_index = new_queue_family_index;
    }

    #[allow(clippy::too_many_arguments)]
    pub fn clear_color(
        &self,
        color: [f32; 4],
        base_mip_level: u32,
        level_count: u32,
        base_array_layer: u32,
        layer_count: u32,
        recorder: &mut dyn CommandRecorder,
    ) {
        assert!(self.valid());
        assert_eq!(self.current_layout, ImageLayout::TransferDst);

        let range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level,
            level_count,
            base_array_layer,
            layer_count,
        };

        recorder.clear_color_image(
            self.image,
            self.current_layout.vk_layout(),
            &vk::ClearColorValue { float32: color },
            &[range],
        );
    }

    #[allow(clippy::too_many_arguments)]
    pub fn clear_depth_stencil(
        &self,
        clear_aspect_flags: vk::ImageAspectFlags,
        depth_stencil: vk::ClearDepthStencilValue,
        base_mip_level: u32,
        level_count: u32,
        base_array_layer: u32,
        layer_count: u32,
        recorder: &mut dyn CommandRecorder,
    ) {
        assert!(self.valid());
        assert_eq!(self.current_layout, ImageLayout::TransferDst);

        let range = vk::ImageSubresourceRange {
            aspect_mask: clear_aspect_flags,
            base_mip_level,
            level_count,
            base_array_layer,
            layer_count,
        };

        recorder.clear_depth_stencil_image(
            self.image,
            self.current_layout.vk_layout(),
            &depth_stencil,
            &[range],
        );
    }

    /// Clears one level. Depth/stencil formats clear every aspect they have.
    pub fn clear(
        &self,
        value: &ClearValue,
        mip_level: u32,
        base_array_layer: u32,
        layer_count: u32,
        recorder: &mut dyn CommandRecorder,
    ) {
        match *value {
            ClearValue::DepthStencil(depth, stencil) => {
                assert!(self.format.has_depth_or_stencil());
                self.clear_depth_stencil(
                    self.format.aspect_flags(),
                    vk::ClearDepthStencilValue { depth, stencil },
                    mip_level,
                    1,
                    base_array_layer,
                    layer_count,
                    recorder,
                );
            }
            ClearValue::Color(color) => {
                assert!(!self.format.has_depth_or_stencil());
                self.clear_color(color, mip_level, 1, base_array_layer, layer_count, recorder);
            }
        }
    }

    /// Copies a region between two images, moving them to `TransferSrc` and `TransferDst` first
    #[allow(clippy::too_many_arguments)]
    pub fn copy(
        src_image: &mut ImageHelper,
        dst_image: &mut ImageHelper,
        src_offset: vk::Offset3D,
        dst_offset: vk::Offset3D,
        copy_size: vk::Extent3D,
        src_subresource: vk::ImageSubresourceLayers,
        dst_subresource: vk::ImageSubresourceLayers,
        recorder: &mut dyn CommandRecorder,
    ) {
        assert!(src_image.valid() && dst_image.valid());

        src_image.change_layout(src_subresource.aspect_mask, ImageLayout::TransferSrc, recorder);
        dst_image.change_layout(dst_subresource.aspect_mask, ImageLayout::TransferDst, recorder);

        let region = vk::ImageCopy {
            src_subresource,
            src_offset,
            dst_subresource,
            dst_offset,
            extent: copy_size,
        };

        recorder.copy_image(
            src_image.image,
            src_image.current_layout.vk_layout(),
            dst_image.image,
            dst_image.current_layout.vk_layout(),
            &[region],
        );
    }

    /// Fills levels 1..=max_level by repeatedly blitting the previous level. Every level ends up
    /// in `TransferSrc`.
    #[profiling::function]
    pub fn generate_mipmaps_with_blit(
        &mut self,
        max_level: u32,
        recorder: &mut dyn CommandRecorder,
    ) {
        assert!(max_level < self.level_count);
        self.change_layout(vk::ImageAspectFlags::COLOR, ImageLayout::TransferDst, recorder);

        let transition_from = ImageLayout::TransferDst.barrier_data();
        let transition_to = ImageLayout::TransferSrc.barrier_data();

        let level_to_transfer_src = |level: u32| {
            vk::ImageMemoryBarrier::builder()
                .src_access_mask(transition_from.src_access_mask)
                .dst_access_mask(transition_to.dst_access_mask)
                .old_layout(transition_from.layout)
                .new_layout(transition_to.layout)
                .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                .image(self.image)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: level,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: self.layer_count,
                })
                .build()
        };

        let filter = if self.format.is_linear_filterable() {
            vk::Filter::LINEAR
        } else {
            vk::Filter::NEAREST
        };

        let mut mip_width = self.extents.width as i32;
        let mut mip_height = self.extents.height as i32;
        let mut mip_depth = self.extents.depth as i32;

        for level in 1..=max_level {
            let next_mip_width = (mip_width >> 1).max(1);
            let next_mip_height = (mip_height >> 1).max(1);
            let next_mip_depth = (mip_depth >> 1).max(1);

            recorder.image_barrier(
                transition_from.src_stage_mask,
                transition_to.dst_stage_mask,
                &level_to_transfer_src(level - 1),
            );

            let blit = vk::ImageBlit {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: level - 1,
                    base_array_layer: 0,
                    layer_count: self.layer_count,
                },
                src_offsets: [
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: mip_width,
                        y: mip_height,
                        z: mip_depth,
                    },
                ],
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: level,
                    base_array_layer: 0,
                    layer_count: self.layer_count,
                },
                dst_offsets: [
                    vk::Offset3D { x: 0, y: 0, z: 0 },
                    vk::Offset3D {
                        x: next_mip_width,
                        y: next_mip_height,
                        z: next_mip_depth,
                    },
                ],
            };

            recorder.blit_image(
                self.image,
                transition_to.layout,
                self.image,
                transition_from.layout,
                &[blit],
                filter,
            );

            mip_width = next_mip_width;
            mip_height = next_mip_height;
            mip_depth = next_mip_depth;
        }

        // The last level was only written to
        recorder.image_barrier(
            transition_from.src_stage_mask,
            transition_to.dst_stage_mask,
            &level_to_transfer_src(max_level),
        );

        // Tracked as a whole, so levels past max_level are assumed to follow along
        self.current_layout = ImageLayout::TransferSrc;
    }

    /// Resolves this multisampled image into `dst_image`
    pub fn resolve(
        &mut self,
        dst_image: &mut ImageHelper,
        region: &vk::ImageResolve,
        recorder: &mut dyn CommandRecorder,
    ) {
        assert!(self.samples > 1);
        self.change_layout(region.src_subresource.aspect_mask, ImageLayout::TransferSrc, recorder);
        dst_image.change_layout(region.dst_subresource.aspect_mask, ImageLayout::TransferDst, recorder);

        recorder.resolve_image(
            self.image,
            self.current_layout.vk_layout(),
            dst_image.image,
            dst_image.current_layout.vk_layout(),
            std::slice::from_ref(region),
        );
    }

    /// Hands the image and its memory to the garbage collector. Weak references are forgotten
    /// without being destroyed.
    pub fn release_image(
        &mut self,
        ctx: &mut ResourceContext,
    ) {
        if self.owns_image && self.valid() {
            let mut garbage = vec![GarbageObject::Image(self.image)];
            if let Some(device_memory) = self.device_memory.take() {
                garbage.push(GarbageObject::DeviceMemory(device_memory.memory));
            }

            let resource_use = std::mem::take(&mut self.resource_use);
            ctx.collect_garbage(&resource_use, garbage);
        }

        self.reset_image_state();
    }

    /// Drops staged updates that were never flushed and releases the staging buffer
    pub fn release_staging_buffer(
        &mut self,
        ctx: &mut ResourceContext,
    ) {
        for update in self.subresource_updates.drain(..) {
            update.release(ctx);
        }
        self.staging_buffer.release(ctx);
    }

    /// Destroys the image, its memory, the staging buffer and any staged updates immediately. The
    /// caller guarantees the GPU is idle.
    pub fn destroy(
        &mut self,
        device: &dyn DeviceContext,
    ) {
        if self.owns_image && self.valid() {
            log::trace!("Destroying image {:?}", self.image);
            device.destroy_image(self.image);
        }
        if let Some(device_memory) = self.device_memory.take() {
            device.free_memory(device_memory.memory);
        }

        for update in self.subresource_updates.drain(..) {
            update.destroy(device);
        }
        self.staging_buffer.destroy(device);
        self.reset_image_state();
    }

    fn reset_image_state(&mut self) {
        self.image = vk::Image::null();
        self.device_memory = None;
        self.current_layout = ImageLayout::Undefined;
        self.level_count = 0;
        self.layer_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headless::{
        DeviceContextHeadless, HeadlessCommandBuffer, HeadlessDeviceConfig, RecordedCommand,
    };
    use crate::{FormatTable, GarbageCollector, StrataError};
    use strata_base::QueueSerialTracker;

    pub(super) fn setup() -> (DeviceContextHeadless, QueueSerialTracker, GarbageCollector) {
        let _ = env_logger::builder().is_test(true).try_init();
        (
            DeviceContextHeadless::new(HeadlessDeviceConfig::default()),
            QueueSerialTracker::new(),
            GarbageCollector::new(),
        )
    }

    pub(super) fn format(intended_format: vk::Format) -> Format {
        FormatTable::with_common_formats()
            .get(intended_format)
            .cloned()
            .unwrap()
    }

    pub(super) fn rgba8_image(
        device: &DeviceContextHeadless,
        width: u32,
        height: u32,
        mip_levels: u32,
    ) -> ImageHelper {
        let info = ImageInitInfo::texture_2d(
            format(vk::Format::R8G8B8A8_UNORM),
            width,
            height,
            mip_levels,
        );
        let mut image = ImageHelper::new(device, &info).unwrap();
        image
            .init_memory(device, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .unwrap();
        image
    }

    #[test]
    fn test_layout_change_necessary() {
        let (device, _tracker, _garbage) = setup();
        let mut image = rgba8_image(&device, 4, 4, 1);
        let mut recorder = HeadlessCommandBuffer::new();

        for layout in ImageLayout::ALL.iter().copied() {
            if layout == ImageLayout::Undefined {
                continue;
            }
            image.change_layout(vk::ImageAspectFlags::COLOR, layout, &mut recorder);
            assert_eq!(image.current_layout(), layout);
            assert_eq!(
                image.is_layout_change_necessary(layout),
                layout.barrier_data().same_layout_transition_requires_barrier,
                "{:?}",
                layout
            );
        }

        assert!(!image.is_layout_change_necessary(ImageLayout::Present));
        assert!(image.is_layout_change_necessary(ImageLayout::TransferSrc));
        image.destroy(&device);
    }

    #[test]
    fn test_transfer_src_to_color_attachment() {
        let (device, _tracker, _garbage) = setup();
        let mut image = rgba8_image(&device, 4, 4, 3);
        let mut recorder = HeadlessCommandBuffer::new();

        image.change_layout(vk::ImageAspectFlags::COLOR, ImageLayout::TransferSrc, &mut recorder);
        recorder.clear();

        image.change_layout(
            vk::ImageAspectFlags::COLOR,
            ImageLayout::ColorAttachment,
            &mut recorder,
        );
        assert_eq!(image.current_layout(), ImageLayout::ColorAttachment);

        let commands = recorder.commands();
        assert_eq!(commands.len(), 1);
        let barriers = commands[0].image_barriers();
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].src_access_mask, vk::AccessFlags::empty());
        assert_eq!(
            barriers[0].dst_access_mask,
            vk::AccessFlags::COLOR_ATTACHMENT_READ | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
        );
        assert_eq!(barriers[0].old_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(
            barriers[0].new_layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(barriers[0].subresource_range.level_count, 3);
        assert_eq!(barriers[0].subresource_range.layer_count, 1);

        match &commands[0] {
            RecordedCommand::PipelineBarrier {
                src_stage_mask,
                dst_stage_mask,
                ..
            } => {
                assert_eq!(*src_stage_mask, vk::PipelineStageFlags::TRANSFER);
                assert_eq!(
                    *dst_stage_mask,
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                );
            }
            command => panic!("expected a barrier, got {:?}", command),
        }

        image.destroy(&device);
    }

    #[test]
    fn test_same_layout_barriers() {
        let (device, _tracker, _garbage) = setup();
        let mut image = rgba8_image(&device, 4, 4, 1);
        let mut recorder = HeadlessCommandBuffer::new();

        image.change_layout(vk::ImageAspectFlags::COLOR, ImageLayout::TransferSrc, &mut recorder);
        recorder.clear();

        // Read-only layouts never need a barrier to stay where they are
        image.change_layout(vk::ImageAspectFlags::COLOR, ImageLayout::TransferSrc, &mut recorder);
        assert!(recorder.commands().is_empty());

        image.change_layout(vk::ImageAspectFlags::COLOR, ImageLayout::TransferDst, &mut recorder);
        recorder.clear();
        image.change_layout(vk::ImageAspectFlags::COLOR, ImageLayout::TransferDst, &mut recorder);
        assert_eq!(recorder.commands().len(), 1);
        let barriers = recorder.commands()[0].image_barriers();
        assert_eq!(barriers.len(), 1);
        assert_eq!(barriers[0].src_access_mask, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(barriers[0].dst_access_mask, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(barriers[0].old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(barriers[0].new_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
        assert_eq!(barriers[0].subresource_range.level_count, 1);
        assert_eq!(barriers[0].subresource_range.layer_count, 1);
        assert!(recorder.commands()[0].memory_barriers().is_empty());

        image.change_layout(
            vk::ImageAspectFlags::COLOR,
            ImageLayout::ComputeShaderWrite,
            &mut recorder,
        );
        recorder.clear();
        image.change_layout(
            vk::ImageAspectFlags::COLOR,
            ImageLayout::ComputeShaderWrite,
            &mut recorder,
        );
        assert_eq!(recorder.commands().len(), 1);
        assert!(recorder.commands()[0].is_execution_barrier());
        assert_eq!(image.current_layout(), ImageLayout::ComputeShaderWrite);

        image.destroy(&device);
    }

    #[test]
    fn test_queue_family_transfer() {
        let (device, _tracker, _garbage) = setup();
        let mut image = rgba8_image(&device, 4, 4, 1);
        let mut recorder = HeadlessCommandBuffer::new();

        assert!(!image.is_queue_change_necessary(0));
        assert!(image.is_queue_change_necessary(2));
        image.change_layout_and_queue(
            vk::ImageAspectFlags::COLOR,
            ImageLayout::AllGraphicsShadersReadOnly,
            2,
            &mut recorder,
        );

        let barriers = recorder.commands()[0].image_barriers();
        assert_eq!(barriers[0].src_queue_family_index, 0);
        assert_eq!(barriers[0].dst_queue_family_index, 2);
        assert_eq!(image.current_queue_family_index(), 2);

        image.destroy(&device);
    }

    #[test]
    #[should_panic]
    fn test_clear_requires_transfer_dst() {
        let (device, _tracker, _garbage) = setup();
        let image = rgba8_image(&device, 4, 4, 1);
        let mut recorder = HeadlessCommandBuffer::new();
        image.clear(&ClearValue::Color(DEFAULT_CLEAR_COLOR), 0, 0, 1, &mut recorder);
    }

    #[test]
    fn test_clear_depth_stencil_covers_both_aspects() {
        let (device, _tracker, _garbage) = setup();
        let info = ImageInitInfo::texture_2d(format(vk::Format::D24_UNORM_S8_UINT), 8, 8, 1);
        let mut image = ImageHelper::new(&device, &info).unwrap();
        let mut recorder = HeadlessCommandBuffer::new();

        image.change_layout(image.aspect_flags(), ImageLayout::TransferDst, &mut recorder);
        image.clear(
            &ClearValue::default_for_format(image.format()),
            0,
            0,
            1,
            &mut recorder,
        );

        match recorder.commands().last() {
            Some(RecordedCommand::ClearDepthStencilImage {
                depth,
                stencil,
                ranges,
                ..
            }) => {
                assert_eq!(*depth, 1.0);
                assert_eq!(*stencil, 0);
                assert_eq!(
                    ranges[0].aspect_mask,
                    vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
                );
            }
            command => panic!("expected a depth/stencil clear, got {:?}", command),
        }

        image.destroy(&device);
    }

    #[test]
    fn test_copy_transitions_both_images() {
        let (device, _tracker, _garbage) = setup();
        let mut src = rgba8_image(&device, 4, 4, 1);
        let mut dst = rgba8_image(&device, 4, 4, 1);
        let mut recorder = HeadlessCommandBuffer::new();

        let subresource = vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        };
        ImageHelper::copy(
            &mut src,
            &mut dst,
            vk::Offset3D::default(),
            vk::Offset3D { x: 1, y: 1, z: 0 },
            vk::Extent3D {
                width: 2,
                height: 2,
                depth: 1,
            },
            subresource,
            subresource,
            &mut recorder,
        );

        assert_eq!(src.current_layout(), ImageLayout::TransferSrc);
        assert_eq!(dst.current_layout(), ImageLayout::TransferDst);
        assert_eq!(recorder.barrier_count(), 2);
        match recorder.commands().last() {
            Some(RecordedCommand::CopyImage {
                src_image_layout,
                dst_image_layout,
                regions,
                ..
            }) => {
                assert_eq!(*src_image_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
                assert_eq!(*dst_image_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
                assert_eq!(regions[0].dst_offset.x, 1);
            }
            command => panic!("expected an image copy, got {:?}", command),
        }

        src.destroy(&device);
        dst.destroy(&device);
    }

    #[test]
    fn test_generate_mipmaps_with_blit() {
        let (device, _tracker, _garbage) = setup();
        let mut image = rgba8_image(&device, 16, 4, 5);
        let mut recorder = HeadlessCommandBuffer::new();

        image.generate_mipmaps_with_blit(4, &mut recorder);
        assert_eq!(image.current_layout(), ImageLayout::TransferSrc);

        let blits: Vec<_> = recorder
            .commands()
            .iter()
            .filter_map(|command| match command {
                RecordedCommand::BlitImage {
                    regions, filter, ..
                } => Some((regions[0], *filter)),
                _ => None,
            })
            .collect();
        assert_eq!(blits.len(), 4);
        assert!(blits
            .iter()
            .all(|(_, filter)| *filter == vk::Filter::LINEAR));
        assert_eq!(blits[0].0.dst_offsets[1].x, 8);
        assert_eq!(blits[0].0.dst_offsets[1].y, 2);
        assert_eq!(blits[3].0.src_offsets[1].x, 2);
        assert_eq!(blits[3].0.dst_offsets[1].x, 1);
        assert_eq!(blits[3].0.dst_offsets[1].y, 1);

        // One transition into TransferDst, then one per source level plus the last level
        let level_barriers: Vec<_> = recorder
            .commands()
            .iter()
            .flat_map(|command| command.image_barriers().iter())
            .filter(|barrier| barrier.subresource_range.level_count == 1)
            .collect();
        assert_eq!(level_barriers.len(), 5);
        for (level, barrier) in level_barriers.iter().enumerate() {
            assert_eq!(barrier.subresource_range.base_mip_level, level as u32);
            assert_eq!(barrier.old_layout, vk::ImageLayout::TRANSFER_DST_OPTIMAL);
            assert_eq!(barrier.new_layout, vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
            assert_eq!(barrier.src_access_mask, vk::AccessFlags::TRANSFER_WRITE);
            assert_eq!(barrier.dst_access_mask, vk::AccessFlags::TRANSFER_READ);
        }

        image.destroy(&device);
    }

    #[test]
    fn test_weak_reference_is_not_destroyed() {
        let (device, tracker, mut garbage) = setup();
        let external = rgba8_image(&device, 4, 4, 1);

        let mut weak = ImageHelper::init_2d_weak_reference(
            external.vk_image(),
            vk::Extent2D {
                width: 4,
                height: 4,
            },
            format(vk::Format::R8G8B8A8_UNORM),
            1,
        );
        {
            let mut ctx = ResourceContext::new(&device, &tracker, &mut garbage);
            weak.release_image(&mut ctx);
        }
        assert!(!weak.valid());
        assert!(garbage.is_empty());
        assert_eq!(device.live_image_count(), 1);

        let mut external = external;
        external.destroy(&device);
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn test_release_image_waits_for_gpu() {
        let (device, tracker, mut garbage) = setup();
        let mut image = rgba8_image(&device, 4, 4, 1);
        image.use_in_recording(&tracker);
        {
            let mut ctx = ResourceContext::new(&device, &tracker, &mut garbage);
            image.release_image(&mut ctx);
            image.release_staging_buffer(&mut ctx);
        }

        assert_eq!(garbage.cleanup(&device, &tracker), 0);
        assert_eq!(device.live_image_count(), 1);

        let serial = tracker.submit();
        tracker.complete(serial);
        assert_eq!(garbage.cleanup(&device, &tracker), 2);
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn test_init_2d_staging() {
        let (device, _tracker, _garbage) = setup();
        let mut image = ImageHelper::init_2d_staging(
            &device,
            vk::Extent2D {
                width: 8,
                height: 8,
            },
            format(vk::Format::R8G8B8A8_UNORM),
            vk::ImageUsageFlags::empty(),
            1,
        )
        .unwrap();
        assert!(image.device_memory().is_some());
        assert_eq!(image.level_count(), 1);

        image.destroy(&device);
        assert_eq!(device.live_object_count(), 0);

        device.fail_next_allocation();
        assert!(ImageHelper::init_2d_staging(
            &device,
            vk::Extent2D {
                width: 8,
                height: 8,
            },
            format(vk::Format::R8G8B8A8_UNORM),
            vk::ImageUsageFlags::empty(),
            1,
        )
        .is_err());
        assert_eq!(device.live_object_count(), 0);
    }

    fn external_image(device: &DeviceContextHeadless) -> ImageHelper {
        let info = ImageInitInfo {
            initial_layout: ImageLayout::ExternalPreInitialized,
            ..ImageInitInfo::texture_2d(format(vk::Format::R8G8B8A8_UNORM), 16, 16, 1)
        };
        ImageHelper::new_external(
            device,
            &info,
            vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD,
        )
        .unwrap()
    }

    #[test]
    fn test_external_image_is_acquired_from_external_queue() {
        let (device, _tracker, _garbage) = setup();
        let mut image = external_image(&device);

        let image_def = device.image_def(image.vk_image()).unwrap();
        assert_eq!(
            image_def.external_memory_handle_types,
            vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD
        );
        assert_eq!(image_def.initial_layout, vk::ImageLayout::PREINITIALIZED);
        assert_eq!(image.current_layout(), ImageLayout::ExternalPreInitialized);

        let import = ExternalMemoryImport::Fd {
            handle_type: vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD,
            fd: 7,
        };
        image
            .init_external_memory(
                &device,
                &vk::MemoryRequirements {
                    size: 4096,
                    alignment: 256,
                    memory_type_bits: 0b10,
                },
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                Some(import),
                vk::QUEUE_FAMILY_EXTERNAL,
            )
            .unwrap();

        let device_memory = *image.device_memory().unwrap();
        assert_eq!(device_memory.size, 4096);
        assert_eq!(device.memory_import(device_memory.memory), Some(import));
        assert_eq!(image.current_queue_family_index(), vk::QUEUE_FAMILY_EXTERNAL);

        let mut recorder = HeadlessCommandBuffer::new();
        assert!(image.is_queue_change_necessary(0));
        image.change_layout_and_queue(
            vk::ImageAspectFlags::COLOR,
            ImageLayout::AllGraphicsShadersReadOnly,
            0,
            &mut recorder,
        );
        let barriers = recorder.commands()[0].image_barriers();
        assert_eq!(barriers[0].old_layout, vk::ImageLayout::PREINITIALIZED);
        assert_eq!(barriers[0].src_access_mask, vk::AccessFlags::MEMORY_WRITE);
        assert_eq!(barriers[0].src_queue_family_index, vk::QUEUE_FAMILY_EXTERNAL);
        assert_eq!(barriers[0].dst_queue_family_index, 0);
        assert_eq!(image.current_queue_family_index(), 0);

        image.destroy(&device);
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn test_external_memory_without_memory_types_fails() {
        let (device, _tracker, _garbage) = setup();
        let mut image = external_image(&device);

        let result = image.init_external_memory(
            &device,
            &vk::MemoryRequirements {
                size: 4096,
                alignment: 256,
                memory_type_bits: 0,
            },
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            None,
            vk::QUEUE_FAMILY_EXTERNAL,
        );
        assert_eq!(
            result.unwrap_err(),
            StrataError::NoSuitableMemoryType {
                memory_type_bits: 0,
                required_flags: vk::MemoryPropertyFlags::DEVICE_LOCAL,
            }
        );
        assert!(image.device_memory().is_none());
        // Ownership only changes once memory is bound
        assert_eq!(image.current_queue_family_index(), 0);

        image.destroy(&device);
        assert_eq!(device.live_object_count(), 0);
    }
}
