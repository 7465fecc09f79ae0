use ash::vk;
use fnv::FnvHashMap;
use strata_base::memory;

bitflags::bitflags! {
    /// Properties of a format that change how it is staged, cleared or filtered
    #[derive(Default)]
    pub struct FormatFlags: u32 {
        const DEPTH = 1<<0;
        const STENCIL = 1<<1;
        /// Texels are stored in `block_width` x `block_height` blocks of `pixel_bytes`
        const BLOCK_COMPRESSED = 1<<2;
        /// The actual format has channels the intended format lacks. They must be cleared to their
        /// default before the image is used.
        const EMULATED_CHANNELS = 1<<3;
        const LINEAR_FILTERABLE = 1<<4;
    }
}

/// Converts rows of source data into the layout the actual format expects in a staging buffer.
/// For block-compressed formats `width` and `height` are counted in blocks.
pub type LoadImageFn = fn(
    width: u32,
    height: u32,
    depth: u32,
    input: &[u8],
    input_row_pitch: usize,
    input_depth_pitch: usize,
    output: &mut [u8],
    output_row_pitch: usize,
    output_depth_pitch: usize,
);

/// A format as requested by the user (`intended_format`) together with the native format backing it
/// and how to get data into it.
#[derive(Clone)]
pub struct Format {
    pub intended_format: vk::Format,
    pub actual_format: vk::Format,
    /// Bytes per texel (or per block) in a buffer copy. For combined depth/stencil formats this
    /// covers the depth aspect only.
    pub pixel_bytes: u32,
    pub block_width: u32,
    pub block_height: u32,
    pub flags: FormatFlags,
    pub load_function: LoadImageFn,
    /// Extracts the stencil aspect from combined depth/stencil source data
    pub stencil_load_function: Option<LoadImageFn>,
}

impl std::fmt::Debug for Format {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("Format")
            .field("intended_format", &self.intended_format)
            .field("actual_format", &self.actual_format)
            .field("pixel_bytes", &self.pixel_bytes)
            .field("block_width", &self.block_width)
            .field("block_height", &self.block_height)
            .field("flags", &self.flags)
            .finish()
    }
}

impl Format {
    pub fn color(
        format: vk::Format,
        pixel_bytes: u32,
        flags: FormatFlags,
    ) -> Self {
        Format {
            intended_format: format,
            actual_format: format,
            pixel_bytes,
            block_width: 1,
            block_height: 1,
            flags,
            load_function: load_to_native,
            stencil_load_function: None,
        }
    }

    pub fn block_compressed(
        format: vk::Format,
        block_bytes: u32,
        block_width: u32,
        block_height: u32,
    ) -> Self {
        Format {
            intended_format: format,
            actual_format: format,
            pixel_bytes: block_bytes,
            block_width,
            block_height,
            flags: FormatFlags::BLOCK_COMPRESSED | FormatFlags::LINEAR_FILTERABLE,
            load_function: load_to_native,
            stencil_load_function: None,
        }
    }

    pub fn emulated(
        intended_format: vk::Format,
        actual_format: vk::Format,
        pixel_bytes: u32,
        flags: FormatFlags,
        load_function: LoadImageFn,
    ) -> Self {
        Format {
            intended_format,
            actual_format,
            pixel_bytes,
            block_width: 1,
            block_height: 1,
            flags: flags | FormatFlags::EMULATED_CHANNELS,
            load_function,
            stencil_load_function: None,
        }
    }

    pub fn depth_stencil(
        format: vk::Format,
        depth_bytes: u32,
        flags: FormatFlags,
        load_function: LoadImageFn,
        stencil_load_function: Option<LoadImageFn>,
    ) -> Self {
        debug_assert!(flags.intersects(FormatFlags::DEPTH | FormatFlags::STENCIL));
        Format {
            intended_format: format,
            actual_format: format,
            pixel_bytes: depth_bytes,
            block_width: 1,
            block_height: 1,
            flags,
            load_function,
            stencil_load_function,
        }
    }

    pub fn has_depth(&self) -> bool {
        self.flags.contains(FormatFlags::DEPTH)
    }

    pub fn has_stencil(&self) -> bool {
        self.flags.contains(FormatFlags::STENCIL)
    }

    pub fn has_depth_or_stencil(&self) -> bool {
        self.flags
            .intersects(FormatFlags::DEPTH | FormatFlags::STENCIL)
    }

    pub fn is_block_compressed(&self) -> bool {
        self.flags.contains(FormatFlags::BLOCK_COMPRESSED)
    }

    pub fn has_emulated_channels(&self) -> bool {
        self.flags.contains(FormatFlags::EMULATED_CHANNELS)
    }

    pub fn is_linear_filterable(&self) -> bool {
        self.flags.contains(FormatFlags::LINEAR_FILTERABLE)
    }

    pub fn aspect_flags(&self) -> vk::ImageAspectFlags {
        let mut aspect_flags = vk::ImageAspectFlags::empty();
        if self.has_depth() {
            aspect_flags |= vk::ImageAspectFlags::DEPTH;
        }
        if self.has_stencil() {
            aspect_flags |= vk::ImageAspectFlags::STENCIL;
        }
        if aspect_flags.is_empty() {
            aspect_flags = vk::ImageAspectFlags::COLOR;
        }
        aspect_flags
    }

    /// Buffer offsets used with buffer/image copies must be a multiple of 4 and of the texel or
    /// block size
    pub fn image_copy_buffer_alignment(&self) -> vk::DeviceSize {
        memory::least_common_multiple_u64(self.pixel_bytes as u64, 4)
    }

    pub fn blocks_wide(
        &self,
        width: u32,
    ) -> u32 {
        (width + self.block_width - 1) / self.block_width
    }

    pub fn blocks_high(
        &self,
        height: u32,
    ) -> u32 {
        (height + self.block_height - 1) / self.block_height
    }

    /// Tightly packed bytes per row of texels (or row of blocks) in a staging buffer
    pub fn compute_row_pitch(
        &self,
        width: u32,
    ) -> usize {
        self.blocks_wide(width) as usize * self.pixel_bytes as usize
    }

    pub fn compute_depth_pitch(
        &self,
        width: u32,
        height: u32,
    ) -> usize {
        self.compute_row_pitch(width) * self.blocks_high(height) as usize
    }

    /// Bytes per texel when copying a single aspect of this format out to a buffer
    pub fn readback_pixel_bytes(
        &self,
        aspect: vk::ImageAspectFlags,
    ) -> u32 {
        if aspect == vk::ImageAspectFlags::STENCIL {
            1
        } else {
            self.pixel_bytes
        }
    }
}

/// Looks up how to store and upload each supported format
#[derive(Clone, Debug, Default)]
pub struct FormatTable {
    formats: FnvHashMap<vk::Format, Format>,
}

impl FormatTable {
    pub fn new() -> Self {
        Default::default()
    }

    /// Formats that every desktop and mobile driver we care about supports, plus RGB8 which is
    /// emulated with an alpha channel
    pub fn with_common_formats() -> Self {
        let mut table = FormatTable::new();
        let filterable = FormatFlags::LINEAR_FILTERABLE;

        table.insert(Format::color(vk::Format::R8G8B8A8_UNORM, 4, filterable));
        table.insert(Format::color(vk::Format::R8G8B8A8_SRGB, 4, filterable));
        table.insert(Format::color(vk::Format::B8G8R8A8_UNORM, 4, filterable));
        table.insert(Format::color(vk::Format::R8_UNORM, 1, filterable));
        table.insert(Format::color(vk::Format::R16G16B16A16_SFLOAT, 8, filterable));
        table.insert(Format::color(vk::Format::R16G16B16_SFLOAT, 6, filterable));
        table.insert(Format::color(
            vk::Format::R32G32B32A32_SFLOAT,
            16,
            FormatFlags::empty(),
        ));
        table.insert(Format::emulated(
            vk::Format::R8G8B8_UNORM,
            vk::Format::R8G8B8A8_UNORM,
            4,
            filterable,
            load_rgb8_to_rgba8,
        ));

        table.insert(Format::depth_stencil(
            vk::Format::D16_UNORM,
            2,
            FormatFlags::DEPTH,
            load_to_native,
            None,
        ));
        table.insert(Format::depth_stencil(
            vk::Format::D32_SFLOAT,
            4,
            FormatFlags::DEPTH,
            load_to_native,
            None,
        ));
        table.insert(Format::depth_stencil(
            vk::Format::D24_UNORM_S8_UINT,
            4,
            FormatFlags::DEPTH | FormatFlags::STENCIL,
            load_d24s8_to_d24x8,
            Some(load_x24s8_to_s8),
        ));
        table.insert(Format::depth_stencil(
            vk::Format::D32_SFLOAT_S8_UINT,
            4,
            FormatFlags::DEPTH | FormatFlags::STENCIL,
            load_d32fs8x24_to_d32f,
            Some(load_x32s8x24_to_s8),
        ));
        table.insert(Format::depth_stencil(
            vk::Format::S8_UINT,
            1,
            FormatFlags::STENCIL,
            load_to_native,
            None,
        ));

        table.insert(Format::block_compressed(
            vk::Format::BC1_RGBA_UNORM_BLOCK,
            8,
            4,
            4,
        ));
        table.insert(Format::block_compressed(vk::Format::BC3_UNORM_BLOCK, 16, 4, 4));
        table.insert(Format::block_compressed(
            vk::Format::ETC2_R8G8B8A8_UNORM_BLOCK,
            16,
            4,
            4,
        ));

        table
    }

    /// Returns the previous entry for the intended format, if any
    pub fn insert(
        &mut self,
        format: Format,
    ) -> Option<Format> {
        self.formats.insert(format.intended_format, format)
    }

    pub fn get(
        &self,
        intended_format: vk::Format,
    ) -> Option<&Format> {
        self.formats.get(&intended_format)
    }

    pub fn len(&self) -> usize {
        self.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }
}

fn for_each_row<F: FnMut(&[u8], &mut [u8])>(
    height: u32,
    depth: u32,
    input: &[u8],
    input_row_pitch: usize,
    input_depth_pitch: usize,
    output: &mut [u8],
    output_row_pitch: usize,
    output_depth_pitch: usize,
    mut f: F,
) {
    for z in 0..depth as usize {
        for y in 0..height as usize {
            let src_begin = z * input_depth_pitch + y * input_row_pitch;
            let dst_begin = z * output_depth_pitch + y * output_row_pitch;
            f(
                &input[src_begin..],
                &mut output[dst_begin..dst_begin + output_row_pitch],
            );
        }
    }
}

/// Copies rows unchanged. Each output row receives `output_row_pitch` bytes.
pub fn load_to_native(
    _width: u32,
    height: u32,
    depth: u32,
    input: &[u8],
    input_row_pitch: usize,
    input_depth_pitch: usize,
    output: &mut [u8],
    output_row_pitch: usize,
    output_depth_pitch: usize,
) {
    for_each_row(
        height,
        depth,
        input,
        input_row_pitch,
        input_depth_pitch,
        output,
        output_row_pitch,
        output_depth_pitch,
        |src, dst| {
            let len = dst.len();
            dst.copy_from_slice(&src[..len]);
        },
    );
}

/// Fills the missing alpha channel with 1.0
pub fn load_rgb8_to_rgba8(
    width: u32,
    height: u32,
    depth: u32,
    input: &[u8],
    input_row_pitch: usize,
    input_depth_pitch: usize,
    output: &mut [u8],
    output_row_pitch: usize,
    output_depth_pitch: usize,
) {
    for_each_row(
        height,
        depth,
        input,
        input_row_pitch,
        input_depth_pitch,
        output,
        output_row_pitch,
        output_depth_pitch,
        |src, dst| {
            for x in 0..width as usize {
                dst[x * 4..x * 4 + 3].copy_from_slice(&src[x * 3..x * 3 + 3]);
                dst[x * 4 + 3] = 0xFF;
            }
        },
    );
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Source texels pack depth in the upper 24 bits and stencil in the lower 8. The depth aspect of a
/// buffer copy expects depth in the lower 24 bits.
pub fn load_d24s8_to_d24x8(
    width: u32,
    height: u32,
    depth: u32,
    input: &[u8],
    input_row_pitch: usize,
    input_depth_pitch: usize,
    output: &mut [u8],
    output_row_pitch: usize,
    output_depth_pitch: usize,
) {
    for_each_row(
        height,
        depth,
        input,
        input_row_pitch,
        input_depth_pitch,
        output,
        output_row_pitch,
        output_depth_pitch,
        |src, dst| {
            for x in 0..width as usize {
                let texel = read_u32(&src[x * 4..]);
                dst[x * 4..x * 4 + 4].copy_from_slice(&(texel >> 8).to_le_bytes());
            }
        },
    );
}

pub fn load_x24s8_to_s8(
    width: u32,
    height: u32,
    depth: u32,
    input: &[u8],
    input_row_pitch: usize,
    input_depth_pitch: usize,
    output: &mut [u8],
    output_row_pitch: usize,
    output_depth_pitch: usize,
) {
    for_each_row(
        height,
        depth,
        input,
        input_row_pitch,
        input_depth_pitch,
        output,
        output_row_pitch,
        output_depth_pitch,
        |src, dst| {
            for x in 0..width as usize {
                dst[x] = (read_u32(&src[x * 4..]) & 0xFF) as u8;
            }
        },
    );
}

/// Source texels are a 32-bit float depth followed by a 32-bit word holding stencil in its low byte
pub fn load_d32fs8x24_to_d32f(
    width: u32,
    height: u32,
    depth: u32,
    input: &[u8],
    input_row_pitch: usize,
    input_depth_pitch: usize,
    output: &mut [u8],
    output_row_pitch: usize,
    output_depth_pitch: usize,
) {
    for_each_row(
        height,
        depth,
        input,
        input_row_pitch,
        input_depth_pitch,
        output,
        output_row_pitch,
        output_depth_pitch,
        |src, dst| {
            for x in 0..width as usize {
                dst[x * 4..x * 4 + 4].copy_from_slice(&src[x * 8..x * 8 + 4]);
            }
        },
    );
}

pub fn load_x32s8x24_to_s8(
    width: u32,
    height: u32,
    depth: u32,
    input: &[u8],
    input_row_pitch: usize,
    input_depth_pitch: usize,
    output: &mut [u8],
    output_row_pitch: usize,
    output_depth_pitch: usize,
) {
    for_each_row(
        height,
        depth,
        input,
        input_row_pitch,
        input_depth_pitch,
        output,
        output_row_pitch,
        output_depth_pitch,
        |src, dst| {
            for x in 0..width as usize {
                dst[x] = src[x * 8 + 4];
            }
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_formats() {
        let table = FormatTable::with_common_formats();
        assert!(!table.is_empty());

        let rgba8 = table.get(vk::Format::R8G8B8A8_UNORM).unwrap();
        assert_eq!(rgba8.aspect_flags(), vk::ImageAspectFlags::COLOR);
        assert_eq!(rgba8.image_copy_buffer_alignment(), 4);
        assert!(!rgba8.has_emulated_channels());

        let rgb8 = table.get(vk::Format::R8G8B8_UNORM).unwrap();
        assert_eq!(rgb8.actual_format, vk::Format::R8G8B8A8_UNORM);
        assert!(rgb8.has_emulated_channels());

        let d24s8 = table.get(vk::Format::D24_UNORM_S8_UINT).unwrap();
        assert_eq!(
            d24s8.aspect_flags(),
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
        assert_eq!(d24s8.readback_pixel_bytes(vk::ImageAspectFlags::STENCIL), 1);
        assert_eq!(d24s8.readback_pixel_bytes(vk::ImageAspectFlags::DEPTH), 4);

        assert!(table.get(vk::Format::R64_SFLOAT).is_none());
    }

    #[test]
    fn test_three_component_alignment() {
        let table = FormatTable::with_common_formats();
        let rgb16f = table.get(vk::Format::R16G16B16_SFLOAT).unwrap();
        assert_eq!(rgb16f.image_copy_buffer_alignment(), 12);
    }

    #[test]
    fn test_block_pitches() {
        let table = FormatTable::with_common_formats();
        let bc1 = table.get(vk::Format::BC1_RGBA_UNORM_BLOCK).unwrap();
        assert!(bc1.is_block_compressed());
        // 10x6 texels -> 3x2 blocks of 8 bytes
        assert_eq!(bc1.compute_row_pitch(10), 24);
        assert_eq!(bc1.compute_depth_pitch(10, 6), 48);
        assert_eq!(bc1.image_copy_buffer_alignment(), 8);
    }

    #[test]
    fn test_load_rgb8_to_rgba8() {
        // 2x2 image with a padded input row pitch of 8
        let input = [1, 2, 3, 4, 5, 6, 0, 0, 7, 8, 9, 10, 11, 12, 0, 0];
        let mut output = [0u8; 16];
        load_rgb8_to_rgba8(2, 2, 1, &input, 8, 16, &mut output, 8, 16);
        assert_eq!(
            output,
            [1, 2, 3, 255, 4, 5, 6, 255, 7, 8, 9, 255, 10, 11, 12, 255]
        );
    }

    #[test]
    fn test_load_to_native_drops_row_padding() {
        let input = [1, 2, 9, 9, 3, 4, 9, 9];
        let mut output = [0u8; 4];
        load_to_native(2, 2, 1, &input, 4, 8, &mut output, 2, 4);
        assert_eq!(output, [1, 2, 3, 4]);
    }

    #[test]
    fn test_depth_stencil_split() {
        let depth_value: u32 = 0x00AB_CDEF;
        let stencil_value: u32 = 0x42;
        let texel = (depth_value << 8) | stencil_value;
        let input = texel.to_le_bytes();

        let mut depth_output = [0u8; 4];
        load_d24s8_to_d24x8(1, 1, 1, &input, 4, 4, &mut depth_output, 4, 4);
        assert_eq!(u32::from_le_bytes(depth_output), depth_value);

        let mut stencil_output = [0u8; 1];
        load_x24s8_to_s8(1, 1, 1, &input, 4, 4, &mut stencil_output, 1, 1);
        assert_eq!(stencil_output[0], 0x42);
    }

    #[test]
    fn test_d32f_s8_split() {
        let mut input = [0u8; 8];
        input[0..4].copy_from_slice(&1.0f32.to_le_bytes());
        input[4] = 7;

        let mut depth_output = [0u8; 4];
        load_d32fs8x24_to_d32f(1, 1, 1, &input, 8, 8, &mut depth_output, 4, 4);
        assert_eq!(f32::from_le_bytes(depth_output), 1.0);

        let mut stencil_output = [0u8; 1];
        load_x32s8x24_to_s8(1, 1, 1, &input, 8, 8, &mut stencil_output, 1, 1);
        assert_eq!(stencil_output[0], 7);
    }
}
