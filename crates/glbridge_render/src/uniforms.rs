//! Uniform data the translation layer owns.
//!
//! - [`DriverUniforms`]: per-draw values the shaders need but the frontend
//!   never sets directly (depth range, flip, render area). Bound as group 2.
//! - [`DefaultUniformBlock`]: CPU copy of a program stage's loose uniforms,
//!   uploaded when dirty and bound as group 0.

use glbridge_core::types::Rect;

/// Bind group indices used by every program.
pub const DEFAULT_UNIFORMS_GROUP: u32 = 0;
pub const TEXTURES_GROUP: u32 = 1;
pub const DRIVER_UNIFORMS_GROUP: u32 = 2;

pub const MISC_ALPHA_TO_COVERAGE: u32 = 1 << 0;
pub const MISC_CLIP_UPPER_LEFT: u32 = 1 << 1;

/// GPU-side driver uniforms (48 bytes).
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct DriverUniforms {
    pub depth_range: [f32; 2],
    /// `x | y << 16`, `width | height << 16`.
    pub render_area: [u32; 2],
    pub flip_xy: [f32; 2],
    pub neg_flip_xy: [f32; 2],
    pub misc: u32,
    pub _pad: [u32; 3],
}

const _: () = assert!(std::mem::size_of::<DriverUniforms>() == 48);

impl DriverUniforms {
    #[must_use]
    pub fn new(
        depth_range: (f32, f32),
        render_area: Rect,
        flip_y: bool,
        alpha_to_coverage: bool,
        clip_upper_left: bool,
    ) -> Self {
        let flip = if flip_y { -1.0 } else { 1.0 };
        let mut misc = 0;
        if alpha_to_coverage {
            misc |= MISC_ALPHA_TO_COVERAGE;
        }
        if clip_upper_left {
            misc |= MISC_CLIP_UPPER_LEFT;
        }
        Self {
            depth_range: [depth_range.0, depth_range.1],
            render_area: [
                pack_u16_pair(render_area.x, render_area.y),
                pack_u16_pair(render_area.width, render_area.height),
            ],
            flip_xy: [1.0, flip],
            neg_flip_xy: [1.0, -flip],
            misc,
            _pad: [0; 3],
        }
    }

    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

#[inline]
fn pack_u16_pair(low: i32, high: i32) -> u32 {
    let low = low.clamp(0, 0xFFFF) as u32;
    let high = high.clamp(0, 0xFFFF) as u32;
    low | (high << 16)
}

/// Loose uniforms of one shader stage.
#[derive(Debug, Clone, Default)]
pub struct DefaultUniformBlock {
    data: Vec<u8>,
    dirty: bool,
}

impl DefaultUniformBlock {
    #[must_use]
    pub fn new(size: usize) -> Self {
        Self { data: vec![0; size], dirty: size > 0 }
    }

    /// Writes `bytes` at `offset`. Marks the block dirty only on a change.
    pub fn write(&mut self, offset: usize, bytes: &[u8]) -> bool {
        let Some(dst) = self.data.get_mut(offset..offset + bytes.len()) else {
            return false;
        };
        if dst != bytes {
            dst.copy_from_slice(bytes);
            self.dirty = true;
        }
        true
    }

    #[inline]
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[inline]
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    #[inline]
    pub fn clear_dirty(&mut self) {
        self.dirty = false;
    }

    #[inline]
    pub fn mark_dirty(&mut self) {
        self.dirty = !self.data.is_empty();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_area_is_packed() {
        let u = DriverUniforms::new((0.0, 1.0), Rect::new(2, 3, 640, 480), true, false, false);
        assert_eq!(u.render_area, [2 | (3 << 16), 640 | (480 << 16)]);
        assert_eq!(u.flip_xy, [1.0, -1.0]);
        assert_eq!(u.neg_flip_xy, [1.0, 1.0]);
        assert_eq!(u.as_bytes().len(), 48);
    }

    #[test]
    fn unchanged_writes_stay_clean() {
        let mut block = DefaultUniformBlock::new(16);
        block.clear_dirty();
        assert!(block.write(0, &[0, 0, 0, 0]));
        assert!(!block.is_dirty());
        assert!(block.write(4, &1.0f32.to_le_bytes()));
        assert!(block.is_dirty());
        assert!(!block.write(14, &[0; 4]));
    }
}
