use super::{ClearValue, ImageHelper, TextureType, EMULATED_CHANNELS_CLEAR_COLOR};
use crate::{
    BufferHelper, CommandRecorder, DeviceContext, ImageLayout, ResourceContext, StrataError,
    StrataResult,
};
use ash::vk;
use std::collections::VecDeque;
use std::ops::Range;
use strata_base::{memory, ResourceUse};

// Uploads to more subresources than this always get a barrier in front of them
const MAX_PARALLEL_SUBRESOURCE_UPLOADS: u32 = 64;

/// Addresses one texture level and a range of its layers
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ImageIndex {
    pub level_index: u32,
    pub layer_index: Option<u32>,
    pub layer_count: u32,
}

impl ImageIndex {
    /// Layer count meaning "every layer of the image"
    pub const ENTIRE_LEVEL: u32 = u32::MAX;

    pub fn make_2d(level_index: u32) -> Self {
        ImageIndex {
            level_index,
            layer_index: None,
            layer_count: 1,
        }
    }

    pub fn make_layer(
        level_index: u32,
        layer_index: u32,
    ) -> Self {
        ImageIndex {
            level_index,
            layer_index: Some(layer_index),
            layer_count: 1,
        }
    }

    pub fn make_layers(
        level_index: u32,
        layer_index: u32,
        layer_count: u32,
    ) -> Self {
        ImageIndex {
            level_index,
            layer_index: Some(layer_index),
            layer_count,
        }
    }

    pub fn make_entire_level(level_index: u32) -> Self {
        ImageIndex {
            level_index,
            layer_index: None,
            layer_count: Self::ENTIRE_LEVEL,
        }
    }

    pub fn base_layer(&self) -> u32 {
        self.layer_index.unwrap_or(0)
    }

    fn resolve_layer_count(
        &self,
        image_layer_count: u32,
    ) -> u32 {
        if self.layer_count == Self::ENTIRE_LEVEL {
            image_layer_count
        } else {
            self.layer_count
        }
    }
}

/// A change to an image that is recorded the next time its subresource is flushed. Levels are
/// texture levels until the update is applied.
pub enum SubresourceUpdate {
    Clear {
        value: ClearValue,
        level_index: u32,
        layer_index: u32,
        /// May be [`ImageIndex::ENTIRE_LEVEL`]
        layer_count: u32,
    },
    Buffer {
        buffer: vk::Buffer,
        /// Shared with the buffer so it isn't reused before the copy executes
        buffer_use: ResourceUse,
        copy_region: vk::BufferImageCopy,
    },
    Image {
        /// Owned by the update and released once it has been applied or dropped
        image: Box<ImageHelper>,
        copy_region: vk::ImageCopy,
    },
}

impl SubresourceUpdate {
    pub fn level_index(&self) -> u32 {
        match self {
            SubresourceUpdate::Clear { level_index, .. } => *level_index,
            SubresourceUpdate::Buffer { copy_region, .. } => copy_region.image_subresource.mip_level,
            SubresourceUpdate::Image { copy_region, .. } => copy_region.dst_subresource.mip_level,
        }
    }

    pub fn base_layer(&self) -> u32 {
        match self {
            SubresourceUpdate::Clear { layer_index, .. } => *layer_index,
            SubresourceUpdate::Buffer { copy_region, .. } => {
                copy_region.image_subresource.base_array_layer
            }
            SubresourceUpdate::Image { copy_region, .. } => {
                copy_region.dst_subresource.base_array_layer
            }
        }
    }

    fn layer_count(
        &self,
        image_layer_count: u32,
    ) -> u32 {
        match self {
            SubresourceUpdate::Clear { layer_count, .. } => {
                if *layer_count == ImageIndex::ENTIRE_LEVEL {
                    image_layer_count
                } else {
                    *layer_count
                }
            }
            SubresourceUpdate::Buffer { copy_region, .. } => copy_region.image_subresource.layer_count,
            SubresourceUpdate::Image { copy_region, .. } => copy_region.dst_subresource.layer_count,
        }
    }

    pub fn is_update_to_layer_level(
        &self,
        layer_index: u32,
        level_index: u32,
    ) -> bool {
        self.level_index() == level_index && self.base_layer() == layer_index
    }

    /// True if the update writes `layer_index` of the level, anywhere in its layer range
    pub fn covers_layer_level(
        &self,
        layer_index: u32,
        level_index: u32,
        image_layer_count: u32,
    ) -> bool {
        let base_layer = self.base_layer();
        self.level_index() == level_index
            && layer_index >= base_layer
            && layer_index - base_layer < self.layer_count(image_layer_count)
    }

    fn shift_level(
        &mut self,
        base_level: u32,
    ) {
        match self {
            SubresourceUpdate::Clear { level_index, .. } => *level_index -= base_level,
            SubresourceUpdate::Buffer { copy_region, .. } => {
                copy_region.image_subresource.mip_level -= base_level
            }
            SubresourceUpdate::Image { copy_region, .. } => {
                copy_region.dst_subresource.mip_level -= base_level
            }
        }
    }

    pub(super) fn release(
        self,
        ctx: &mut ResourceContext,
    ) {
        if let SubresourceUpdate::Image { mut image, .. } = self {
            image.release_image(ctx);
            image.release_staging_buffer(ctx);
        }
    }

    pub(super) fn destroy(
        self,
        device: &dyn DeviceContext,
    ) {
        if let SubresourceUpdate::Image { mut image, .. } = self {
            image.destroy(device);
        }
    }
}

impl ImageHelper {
    /// Converts `pixels` with the format's load function into the staging buffer and queues a copy
    /// into the image. Combined depth/stencil data is split into one copy per aspect.
    ///
    /// For 2D array textures `offset.z` and `extents.depth` select the layers.
    #[allow(clippy::too_many_arguments)]
    pub fn stage_subresource_update(
        &mut self,
        ctx: &mut ResourceContext,
        index: &ImageIndex,
        extents: vk::Extent3D,
        offset: vk::Offset3D,
        pixels: &[u8],
        input_row_pitch: usize,
        input_depth_pitch: usize,
    ) -> StrataResult<()> {
        self.ensure_staging_buffer(ctx.device())?;

        let format = &self.format;
        let (load_width, load_height) = (
            format.blocks_wide(extents.width),
            format.blocks_high(extents.height),
        );
        let output_row_pitch = format.compute_row_pitch(extents.width);
        let output_depth_pitch = format.compute_depth_pitch(extents.width, extents.height);
        let (buffer_row_length, buffer_image_height) = if format.is_block_compressed() {
            (
                memory::round_size_up_to_alignment_u32(extents.width, format.block_width),
                memory::round_size_up_to_alignment_u32(extents.height, format.block_height),
            )
        } else {
            (extents.width, extents.height)
        };

        let required_input = input_depth_pitch * (extents.depth.max(1) as usize - 1)
            + input_row_pitch * (load_height.max(1) as usize - 1)
            + 1;
        if pixels.len() < required_input {
            return Err(StrataError::InsufficientData {
                required: required_input,
                provided: pixels.len(),
            });
        }

        let stencil_load_function = if format.has_depth() && format.has_stencil() {
            format.stencil_load_function
        } else {
            None
        };

        let depth_size = output_depth_pitch * extents.depth as usize;
        let stencil_size = if stencil_load_function.is_some() {
            extents.width as usize * extents.height as usize * extents.depth as usize
        } else {
            0
        };

        let (copy_offset, copy_extent, base_array_layer, layer_count) =
            if self.texture_type == TextureType::Texture2DArray {
                (
                    vk::Offset3D { z: 0, ..offset },
                    vk::Extent3D {
                        depth: 1,
                        ..extents
                    },
                    offset.z as u32,
                    extents.depth,
                )
            } else {
                (
                    offset,
                    extents,
                    index.base_layer(),
                    index.resolve_layer_count(self.layer_count),
                )
            };

        let allocation = self
            .staging_buffer
            .allocate(ctx, depth_size + stencil_size)?;
        let data = unsafe { allocation.as_mut_slice() }.ok_or(StrataError::MemoryNotMapped)?;

        (format.load_function)(
            load_width,
            load_height,
            extents.depth,
            pixels,
            input_row_pitch,
            input_depth_pitch,
            &mut data[..depth_size],
            output_row_pitch,
            output_depth_pitch,
        );

        let aspect_mask = if stencil_load_function.is_some() {
            vk::ImageAspectFlags::DEPTH
        } else {
            format.aspect_flags()
        };

        let mut copy_region = vk::BufferImageCopy {
            buffer_offset: allocation.offset,
            buffer_row_length,
            buffer_image_height,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask,
                mip_level: index.level_index,
                base_array_layer,
                layer_count,
            },
            image_offset: copy_offset,
            image_extent: copy_extent,
        };

        if let Some(stencil_load_function) = stencil_load_function {
            let stencil_row_pitch = extents.width as usize;
            stencil_load_function(
                extents.width,
                extents.height,
                extents.depth,
                pixels,
                input_row_pitch,
                input_depth_pitch,
                &mut data[depth_size..depth_size + stencil_size],
                stencil_row_pitch,
                stencil_row_pitch * extents.height as usize,
            );
        }

        let buffer_use = self.current_staging_buffer_use()?;
        self.subresource_updates.push_back(SubresourceUpdate::Buffer {
            buffer: allocation.buffer,
            buffer_use: buffer_use.share(),
            copy_region,
        });

        if stencil_load_function.is_some() {
            copy_region.buffer_offset += depth_size as vk::DeviceSize;
            copy_region.image_subresource.aspect_mask = vk::ImageAspectFlags::STENCIL;
            self.subresource_updates.push_back(SubresourceUpdate::Buffer {
                buffer: allocation.buffer,
                buffer_use,
                copy_region,
            });
        }

        Ok(())
    }

    /// Queues a tightly packed copy and returns the staging memory for the caller to fill before
    /// the next flush
    pub fn stage_subresource_update_and_get_data(
        &mut self,
        ctx: &mut ResourceContext,
        allocation_size: usize,
        index: &ImageIndex,
        extents: vk::Extent3D,
        offset: vk::Offset3D,
    ) -> StrataResult<&mut [u8]> {
        self.ensure_staging_buffer(ctx.device())?;

        let allocation = self.staging_buffer.allocate(ctx, allocation_size)?;
        let buffer_use = self.current_staging_buffer_use()?;

        let copy_region = vk::BufferImageCopy {
            buffer_offset: allocation.offset,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: self.format.aspect_flags(),
                mip_level: index.level_index,
                base_array_layer: index.base_layer(),
                layer_count: index.resolve_layer_count(self.layer_count),
            },
            image_offset: offset,
            image_extent: extents,
        };
        self.subresource_updates.push_back(SubresourceUpdate::Buffer {
            buffer: allocation.buffer,
            buffer_use,
            copy_region,
        });

        let data = unsafe { allocation.as_mut_slice() }.ok_or(StrataError::MemoryNotMapped)?;
        Ok(&mut data[..allocation_size])
    }

    /// Queues a copy out of a buffer the caller filled. The buffer is kept alive until the copy
    /// executes.
    pub fn stage_subresource_update_from_buffer(
        &mut self,
        buffer: &BufferHelper,
        copy_region: vk::BufferImageCopy,
    ) {
        self.subresource_updates.push_back(SubresourceUpdate::Buffer {
            buffer: buffer.vk_buffer(),
            buffer_use: buffer.resource_use().share(),
            copy_region,
        });
    }

    /// Queues a copy out of a temporary image, which the update takes ownership of
    pub fn stage_subresource_update_from_image(
        &mut self,
        image: ImageHelper,
        index: &ImageIndex,
        dst_offset: vk::Offset3D,
        extents: vk::Extent3D,
    ) {
        let aspect_mask = image.aspect_flags();
        let layer_count = index.resolve_layer_count(self.layer_count);

        let copy_region = vk::ImageCopy {
            src_subresource: vk::ImageSubresourceLayers {
                aspect_mask,
                mip_level: 0,
                base_array_layer: 0,
                layer_count,
            },
            src_offset: vk::Offset3D::default(),
            dst_subresource: vk::ImageSubresourceLayers {
                aspect_mask,
                mip_level: index.level_index,
                base_array_layer: index.base_layer(),
                layer_count,
            },
            dst_offset,
            extent: extents,
        };

        self.subresource_updates.push_back(SubresourceUpdate::Image {
            image: Box::new(image),
            copy_region,
        });
    }

    /// Clears are applied before anything else staged for the image
    pub fn stage_subresource_clear(
        &mut self,
        index: &ImageIndex,
        value: ClearValue,
    ) {
        self.subresource_updates.push_front(SubresourceUpdate::Clear {
            value,
            level_index: index.level_index,
            layer_index: index.base_layer(),
            layer_count: index.layer_count,
        });
    }

    /// Initializes the subresource to zero (or to depth 1.0 and stencil 0)
    pub fn stage_robust_resource_clear(
        &mut self,
        index: &ImageIndex,
    ) {
        let value = ClearValue::default_for_format(&self.format);
        self.stage_subresource_clear(index, value);
    }

    /// Like [`stage_robust_resource_clear`](Self::stage_robust_resource_clear), but emulated alpha
    /// reads back as one
    pub fn stage_emulated_clear(
        &mut self,
        index: &ImageIndex,
    ) {
        let value = if self.format.has_depth_or_stencil() {
            ClearValue::default_for_format(&self.format)
        } else {
            ClearValue::Color(EMULATED_CHANNELS_CLEAR_COLOR)
        };
        self.stage_subresource_clear(index, value);
    }

    /// Channels the actual format has but the intended one doesn't must hold their default value.
    /// Skipped when robust resource init already clears everything.
    pub fn stage_clear_if_emulated_format(
        &mut self,
        robust_resource_init: bool,
    ) {
        if !self.format.has_emulated_channels() || robust_resource_init {
            return;
        }

        for level in 0..self.level_count {
            let index = ImageIndex::make_layers(self.base_level + level, 0, self.layer_count);
            self.stage_emulated_clear(&index);
        }
    }

    /// Drops every update staged for the level and layer, releasing any temporary images
    pub fn remove_staged_updates(
        &mut self,
        ctx: &mut ResourceContext,
        level_index: u32,
        layer_index: u32,
    ) {
        let updates = std::mem::take(&mut self.subresource_updates);
        for update in updates {
            if update.is_update_to_layer_level(layer_index, level_index) {
                update.release(ctx);
            } else {
                self.subresource_updates.push_back(update);
            }
        }
    }

    pub fn is_update_staged(
        &self,
        level_index: u32,
        layer_index: u32,
    ) -> bool {
        let image_layer_count = self.layer_count;
        self.subresource_updates
            .iter()
            .any(|update| update.covers_layer_level(layer_index, level_index, image_layer_count))
    }

    pub fn has_staged_updates(&self) -> bool {
        !self.subresource_updates.is_empty()
    }

    pub fn staged_update_count(&self) -> usize {
        self.subresource_updates.len()
    }

    /// Records every staged update that touches `levels` (image levels, relative to the base level)
    /// and `layers`. Other updates stay queued in order.
    #[profiling::function]
    pub fn flush_staged_updates(
        &mut self,
        ctx: &mut ResourceContext,
        recorder: &mut dyn CommandRecorder,
        levels: Range<u32>,
        layers: Range<u32>,
    ) -> StrataResult<()> {
        if self.subresource_updates.is_empty() {
            return Ok(());
        }

        self.staging_buffer.flush(ctx.device())?;

        let aspect_flags = self.format.aspect_flags();
        self.change_layout(aspect_flags, ImageLayout::TransferDst, recorder);
        self.use_in_recording(ctx.serials());

        let level_start = levels.start + self.base_level;
        let level_end = levels.end + self.base_level;
        let current_serial = ctx.current_serial();

        // One bit per (level, layer) written so far, hashed into 64 buckets. A collision means the
        // next write may overlap an earlier one and has to wait for it.
        let mut subresource_uploads_in_progress: u64 = 0;
        let mut updates_to_keep = VecDeque::new();

        let updates = std::mem::take(&mut self.subresource_updates);
        for mut update in updates {
            let update_level = update.level_index();
            let update_base_layer = update.base_layer();
            let update_layer_count = update.layer_count(self.layer_count);

            let level_outside_range = update_level < level_start
                || update_level >= level_end
                || update_level > self.max_level;
            let layers_outside_range = update_base_layer + update_layer_count <= layers.start
                || update_base_layer >= layers.end;

            if level_outside_range || layers_outside_range {
                updates_to_keep.push_back(update);
                continue;
            }

            if self.base_level > 0 {
                update.shift_level(self.base_level);
            }
            let image_level = update.level_index();

            if update_layer_count >= MAX_PARALLEL_SUBRESOURCE_UPLOADS {
                self.change_layout(aspect_flags, ImageLayout::TransferDst, recorder);
                subresource_uploads_in_progress = u64::MAX;
            } else {
                let subresource_hash_range = (1u64 << update_layer_count) - 1;
                let subresource_hash_offset = ((image_level as u64 * self.layer_count as u64
                    + update_base_layer as u64)
                    % MAX_PARALLEL_SUBRESOURCE_UPLOADS as u64)
                    as u32;
                let subresource_hash = subresource_hash_range.rotate_left(subresource_hash_offset);

                if subresource_uploads_in_progress & subresource_hash != 0 {
                    self.change_layout(aspect_flags, ImageLayout::TransferDst, recorder);
                    subresource_uploads_in_progress = 0;
                }
                subresource_uploads_in_progress |= subresource_hash;
            }

            match &mut update {
                SubresourceUpdate::Clear { value, .. } => {
                    self.clear(
                        value,
                        image_level,
                        update_base_layer,
                        update_layer_count,
                        recorder,
                    );
                }
                SubresourceUpdate::Buffer {
                    buffer,
                    buffer_use,
                    copy_region,
                } => {
                    buffer_use.update_serial(current_serial);
                    recorder.copy_buffer_to_image(
                        *buffer,
                        self.image,
                        self.current_layout.vk_layout(),
                        std::slice::from_ref(copy_region),
                    );
                }
                SubresourceUpdate::Image { image, copy_region } => {
                    image.change_layout(
                        copy_region.src_subresource.aspect_mask,
                        ImageLayout::TransferSrc,
                        recorder,
                    );
                    image.use_in_recording(ctx.serials());
                    recorder.copy_image(
                        image.image,
                        image.current_layout.vk_layout(),
                        self.image,
                        self.current_layout.vk_layout(),
                        std::slice::from_ref(copy_region),
                    );
                }
            }

            update.release(ctx);
        }

        log::trace!(
            "Image {:?} flushed staged updates, {} left for other subresources",
            self.image,
            updates_to_keep.len()
        );

        self.subresource_updates = updates_to_keep;
        if self.subresource_updates.is_empty() {
            self.staging_buffer.release_in_flight_buffers(ctx);
        }

        Ok(())
    }

    pub fn flush_all_staged_updates(
        &mut self,
        ctx: &mut ResourceContext,
        recorder: &mut dyn CommandRecorder,
    ) -> StrataResult<()> {
        let levels = 0..self.level_count;
        let layers = 0..self.layer_count;
        self.flush_staged_updates(ctx, recorder, levels, layers)
    }

    fn current_staging_buffer_use(&self) -> StrataResult<ResourceUse> {
        let buffer = self
            .staging_buffer
            .current_buffer()
            .ok_or("Staging buffer has no current buffer")?;
        Ok(buffer.resource_use().share())
    }
}
