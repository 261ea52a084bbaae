//! Implementation limits and backend alignment rules.

/// Maximum number of color attachments a framebuffer can carry.
pub const MAX_DRAW_BUFFERS: usize = 8;

/// Maximum number of vertex attributes (and vertex buffer slots).
pub const MAX_VERTEX_ATTRIBS: usize = 16;

/// Number of texture units visible to a program.
pub const MAX_TEXTURE_UNITS: usize = 16;

/// Buffer sizes are rounded up to this.
pub const BUFFER_SIZE_ALIGNMENT: u64 = 4;

/// Buffer-to-buffer copies must use offsets and sizes aligned to this.
pub const COPY_BUFFER_ALIGNMENT: u64 = 4;

/// Map offsets must be aligned to this.
pub const MAP_OFFSET_ALIGNMENT: u64 = 8;

/// Map sizes must be aligned to this.
pub const MAP_SIZE_ALIGNMENT: u64 = 4;

/// `bytes_per_row` of a buffer/texture copy must be a multiple of this.
pub const TEXTURE_ROW_ALIGNMENT: u32 = 256;

/// Uniform structs are padded to this.
pub const UNIFORM_STRUCT_ALIGNMENT: u64 = 16;

pub const MIN_LOD: f32 = 0.0;
pub const MAX_LOD: f32 = 32.0;

#[inline]
#[must_use]
pub const fn round_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

#[inline]
#[must_use]
pub const fn round_down(value: u64, alignment: u64) -> u64 {
    value / alignment * alignment
}

#[inline]
#[must_use]
pub const fn round_up_u32(value: u32, alignment: u32) -> u32 {
    value.div_ceil(alignment) * alignment
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        assert_eq!(round_up(0, 4), 0);
        assert_eq!(round_up(1, 4), 4);
        assert_eq!(round_up(8, 4), 8);
        assert_eq!(round_down(15, 8), 8);
        assert_eq!(round_up_u32(257, TEXTURE_ROW_ALIGNMENT), 512);
    }
}
