use super::{ImageHelper, STAGING_BUFFER_SIZE};
use crate::{
    CommandRecorder, DynamicBuffer, ImageLayout, ResourceContext, StrataError, StrataResult,
};
use ash::vk;
use strata_base::memory;

/// Where [`ImageHelper::copy_image_data_to_buffer`] put the image data. Valid to read once the
/// recorded copy has executed.
#[derive(Clone, Debug)]
pub struct ImageReadbackBuffer {
    pub buffer: vk::Buffer,
    /// One offset per copied aspect. Combined depth/stencil formats get depth first, then stencil.
    pub buffer_offsets: Vec<vk::DeviceSize>,
    pub ptr: Option<*mut u8>,
    pub size: vk::DeviceSize,
}

/// How `read_pixels` lays rows out in the caller's memory
#[derive(Copy, Clone, Debug, Default)]
pub struct PackPixelsParams {
    /// Bytes from the start of one output row to the next. Zero means tightly packed.
    pub output_row_pitch: usize,
    pub output_offset: usize,
    /// Write the last row first, for callers with a bottom-up origin
    pub reverse_row_order: bool,
}

/// Client-side storage rules for pixels read into caller memory
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PixelPackState {
    /// Every output row starts on a multiple of this many bytes. Must be a power of two.
    pub alignment: usize,
    /// Pixels per output row. Zero means the width of the area being read.
    pub row_length: u32,
    pub skip_rows: u32,
    pub skip_pixels: u32,
    pub reverse_row_order: bool,
}

impl Default for PixelPackState {
    fn default() -> Self {
        PixelPackState {
            alignment: 4,
            row_length: 0,
            skip_rows: 0,
            skip_pixels: 0,
            reverse_row_order: false,
        }
    }
}

/// Works out where reading `clipped_area` (a part of `area`) lands in memory laid out by
/// `pack_state`. Returns the pack params and the byte offset of the first texel written.
pub fn get_read_pixels_params(
    pack_state: &PixelPackState,
    pixel_bytes: usize,
    area: vk::Rect2D,
    clipped_area: vk::Rect2D,
) -> StrataResult<(PackPixelsParams, usize)> {
    assert!(pack_state.alignment.is_power_of_two());
    assert!(clipped_area.offset.x >= area.offset.x && clipped_area.offset.y >= area.offset.y);

    let overflow = || StrataError::from("Pixel pack parameters overflow");

    let row_pixels = if pack_state.row_length > 0 {
        pack_state.row_length
    } else {
        area.extent.width
    } as usize;
    let alignment_mask = pack_state.alignment - 1;
    let output_row_pitch = row_pixels
        .checked_mul(pixel_bytes)
        .and_then(|row_bytes| row_bytes.checked_add(alignment_mask))
        .ok_or_else(overflow)?
        & !alignment_mask;

    let skip_rows =
        pack_state.skip_rows as usize + (clipped_area.offset.y - area.offset.y) as usize;
    let skip_pixels =
        pack_state.skip_pixels as usize + (clipped_area.offset.x - area.offset.x) as usize;
    let skip_bytes = skip_rows
        .checked_mul(output_row_pitch)
        .and_then(|row_skip| {
            skip_pixels
                .checked_mul(pixel_bytes)
                .and_then(|pixel_skip| row_skip.checked_add(pixel_skip))
        })
        .ok_or_else(overflow)?;

    let pack_params = PackPixelsParams {
        output_row_pitch,
        output_offset: 0,
        reverse_row_order: pack_state.reverse_row_order,
    };
    Ok((pack_params, skip_bytes))
}

/// Copies tightly packed rows from `source` into `output` according to `params`
pub fn pack_pixels(
    params: &PackPixelsParams,
    pixel_bytes: usize,
    width: usize,
    height: usize,
    source: &[u8],
    output: &mut [u8],
) -> StrataResult<()> {
    let row_bytes = width * pixel_bytes;
    if row_bytes == 0 || height == 0 {
        return Ok(());
    }

    let output_row_pitch = if params.output_row_pitch == 0 {
        row_bytes
    } else {
        params.output_row_pitch
    };
    if output_row_pitch < row_bytes {
        return Err(format!(
            "Output row pitch {} is smaller than a row of {} bytes",
            output_row_pitch, row_bytes
        )
        .into());
    }

    let required_output = params.output_offset + output_row_pitch * (height - 1) + row_bytes;
    if output.len() < required_output {
        return Err(StrataError::InsufficientData {
            required: required_output,
            provided: output.len(),
        });
    }
    if source.len() < row_bytes * height {
        return Err(StrataError::InsufficientData {
            required: row_bytes * height,
            provided: source.len(),
        });
    }

    for (y, source_row) in source.chunks_exact(row_bytes).take(height).enumerate() {
        let output_y = if params.reverse_row_order {
            height - 1 - y
        } else {
            y
        };
        let begin = params.output_offset + output_y * output_row_pitch;
        output[begin..begin + row_bytes].copy_from_slice(source_row);
    }

    Ok(())
}

impl ImageHelper {
    /// Records a copy of a region of one level into the image's staging buffer, one region per
    /// aspect. The caller reads the data back after the work has finished.
    #[profiling::function]
    #[allow(clippy::too_many_arguments)]
    pub fn copy_image_data_to_buffer(
        &mut self,
        ctx: &mut ResourceContext,
        recorder: &mut dyn CommandRecorder,
        source_level: u32,
        base_layer: u32,
        layer_count: u32,
        source_offset: vk::Offset3D,
        source_extent: vk::Extent3D,
    ) -> StrataResult<ImageReadbackBuffer> {
        self.ensure_staging_buffer(ctx.device())?;

        let aspect_flags = self.format.aspect_flags();
        self.change_layout(aspect_flags, ImageLayout::TransferSrc, recorder);

        let copy_aspects = if self.format.has_depth() && self.format.has_stencil() {
            vec![vk::ImageAspectFlags::DEPTH, vk::ImageAspectFlags::STENCIL]
        } else {
            vec![aspect_flags]
        };

        let texel_count = source_extent.width as vk::DeviceSize
            * source_extent.height as vk::DeviceSize
            * source_extent.depth as vk::DeviceSize
            * layer_count as vk::DeviceSize;

        // Buffer offsets of image copies must be multiples of 4
        let mut buffer_size = 0;
        let mut relative_offsets = Vec::with_capacity(copy_aspects.len());
        for aspect in &copy_aspects {
            let offset = memory::round_size_up_to_alignment_u64(buffer_size, 4);
            relative_offsets.push(offset);
            buffer_size =
                offset + texel_count * self.format.readback_pixel_bytes(*aspect) as vk::DeviceSize;
        }

        let allocation = self.staging_buffer.allocate(ctx, buffer_size as usize)?;
        let buffer_offsets: Vec<_> = relative_offsets
            .iter()
            .map(|offset| allocation.offset + offset)
            .collect();

        let regions: Vec<_> = copy_aspects
            .iter()
            .zip(&buffer_offsets)
            .map(|(aspect, buffer_offset)| vk::BufferImageCopy {
                buffer_offset: *buffer_offset,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: *aspect,
                    mip_level: source_level,
                    base_array_layer: base_layer,
                    layer_count,
                },
                image_offset: source_offset,
                image_extent: source_extent,
            })
            .collect();

        self.use_in_recording(ctx.serials());
        if let Some(buffer) = self.staging_buffer.current_buffer() {
            buffer.use_in_recording(ctx.serials());
        }

        recorder.copy_image_to_buffer(
            self.image,
            self.current_layout.vk_layout(),
            allocation.buffer,
            &regions,
        );

        Ok(ImageReadbackBuffer {
            buffer: allocation.buffer,
            buffer_offsets,
            ptr: allocation.ptr,
            size: allocation.size,
        })
    }

    /// Reads one aspect of an area of a level back to the host. Multisampled images are resolved
    /// into a temporary image first.
    ///
    /// Blocks until the GPU has executed everything recorded so far.
    #[profiling::function]
    #[allow(clippy::too_many_arguments)]
    pub fn read_pixels(
        &mut self,
        ctx: &mut ResourceContext,
        recorder: &mut dyn CommandRecorder,
        staging_buffer: &mut DynamicBuffer,
        area: vk::Rect2D,
        pack_params: &PackPixelsParams,
        copy_aspect_flags: vk::ImageAspectFlags,
        level: u32,
        layer: u32,
        output: &mut [u8],
    ) -> StrataResult<()> {
        let pixel_bytes = self.format.readback_pixel_bytes(copy_aspect_flags);
        let width = area.extent.width;
        let height = area.extent.height;

        let mut resolved_image = if self.samples > 1 {
            let mut resolved_image = ImageHelper::init_2d_staging(
                ctx.device(),
                area.extent,
                self.format.clone(),
                vk::ImageUsageFlags::empty(),
                1,
            )?;

            let resolve_region = vk::ImageResolve {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: copy_aspect_flags,
                    mip_level: level,
                    base_array_layer: layer,
                    layer_count: 1,
                },
                src_offset: vk::Offset3D {
                    x: area.offset.x,
                    y: area.offset.y,
                    z: 0,
                },
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: copy_aspect_flags,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                dst_offset: vk::Offset3D::default(),
                extent: vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                },
            };

            self.resolve(&mut resolved_image, &resolve_region, recorder);
            Some(resolved_image)
        } else {
            self.change_layout(copy_aspect_flags, ImageLayout::TransferSrc, recorder);
            None
        };

        let (src_image, src_image_layout, src_offset, src_level, src_layer) =
            match &mut resolved_image {
                Some(resolved_image) => {
                    resolved_image.change_layout(
                        copy_aspect_flags,
                        ImageLayout::TransferSrc,
                        recorder,
                    );
                    (
                        resolved_image.image,
                        resolved_image.current_layout.vk_layout(),
                        vk::Offset3D::default(),
                        0,
                        0,
                    )
                }
                None => (
                    self.image,
                    self.current_layout.vk_layout(),
                    vk::Offset3D {
                        x: area.offset.x,
                        y: area.offset.y,
                        z: 0,
                    },
                    level,
                    layer,
                ),
            };

        let readback_size = width as usize * height as usize * pixel_bytes as usize;
        let allocation = staging_buffer.allocate(ctx, readback_size)?;

        let region = vk::BufferImageCopy {
            buffer_offset: allocation.offset,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: copy_aspect_flags,
                mip_level: src_level,
                base_array_layer: src_layer,
                layer_count: 1,
            },
            image_offset: src_offset,
            image_extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
        };
        recorder.copy_image_to_buffer(src_image, src_image_layout, allocation.buffer, &[region]);
        self.use_in_recording(ctx.serials());

        let finish_result = recorder.finish();
        // Nothing references the resolve target once the queue is idle
        if let Some(mut resolved_image) = resolved_image {
            resolved_image.destroy(ctx.device());
        }
        finish_result?;

        // Only valid after the finish
        staging_buffer.invalidate(ctx.device())?;

        let source = unsafe { allocation.as_mut_slice() }.ok_or(StrataError::MemoryNotMapped)?;
        pack_pixels(
            pack_params,
            pixel_bytes as usize,
            width as usize,
            height as usize,
            &source[..readback_size],
            output,
        )
    }

    /// Reads a whole level and layer of a color image into `output`, laid out by `pack_state`.
    /// Goes through a temporary staging buffer that is released afterwards.
    pub fn read_pixels_for_get_image(
        &mut self,
        ctx: &mut ResourceContext,
        recorder: &mut dyn CommandRecorder,
        pack_state: &PixelPackState,
        level: u32,
        layer: u32,
        output: &mut [u8],
    ) -> StrataResult<()> {
        // TODO: depth and stencil readback needs a per-aspect pack format
        if self.format.has_depth_or_stencil() {
            return Err(StrataError::UnsupportedFormat(self.format.intended_format));
        }

        let extents = self.level_extents(level);
        let area = vk::Rect2D {
            offset: vk::Offset2D::default(),
            extent: vk::Extent2D {
                width: extents.width,
                height: extents.height,
            },
        };
        let pixel_bytes = self
            .format
            .readback_pixel_bytes(vk::ImageAspectFlags::COLOR) as usize;
        let (pack_params, skip_bytes) =
            get_read_pixels_params(pack_state, pixel_bytes, area, area)?;

        let provided = output.len();
        let output = output
            .get_mut(skip_bytes..)
            .ok_or(StrataError::InsufficientData {
                required: skip_bytes,
                provided,
            })?;

        let mut staging_buffer = DynamicBuffer::new(
            ctx.device(),
            vk::BufferUsageFlags::TRANSFER_DST,
            1,
            STAGING_BUFFER_SIZE,
            true,
        )?;
        let result = self.read_pixels(
            ctx,
            recorder,
            &mut staging_buffer,
            area,
            &pack_params,
            vk::ImageAspectFlags::COLOR,
            level,
            layer,
            output,
        );
        staging_buffer.release(ctx);
        result
    }
}
