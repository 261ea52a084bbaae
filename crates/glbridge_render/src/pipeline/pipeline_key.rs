//! Pipeline cache keys.
//!
//! `wgpu` descriptor types (`ColorTargetState`, `DepthStencilState`, …) do not
//! implement `Hash` / `Eq`. This module defines *mirror* types holding the
//! fields relevant for pipeline identity, with the correct trait impls.
//!
//! Two key families are provided:
//!
//! - [`PipelineDescriptor`]: the mutable draw pipeline state. The
//!   synchronizer edits it in place; a snapshot is the cache key.
//! - [`ClearPipelineKey`]: the clear-with-draw utility pipelines.

use std::hash::{Hash, Hasher};

use glbridge_core::constants::{MAX_DRAW_BUFFERS, MAX_VERTEX_ATTRIBS};
use glbridge_core::types::{IndexType, PrimitiveMode};
use smallvec::SmallVec;

use crate::backend::VertexBufferLayoutDesc;
use crate::conversions;

// ─── Hashable Mirror Types ────────────────────────────────────────────────────

/// Hashable mirror of `wgpu::BlendComponent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendComponentKey {
    pub src_factor: wgpu::BlendFactor,
    pub dst_factor: wgpu::BlendFactor,
    pub operation: wgpu::BlendOperation,
}

impl BlendComponentKey {
    pub const REPLACE: Self = Self {
        src_factor: wgpu::BlendFactor::One,
        dst_factor: wgpu::BlendFactor::Zero,
        operation: wgpu::BlendOperation::Add,
    };

    #[must_use]
    pub fn to_wgpu(self) -> wgpu::BlendComponent {
        wgpu::BlendComponent {
            src_factor: self.src_factor,
            dst_factor: self.dst_factor,
            operation: self.operation,
        }
    }
}

/// Hashable mirror of `wgpu::BlendState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendStateKey {
    pub color: BlendComponentKey,
    pub alpha: BlendComponentKey,
}

impl BlendStateKey {
    pub const REPLACE: Self =
        Self { color: BlendComponentKey::REPLACE, alpha: BlendComponentKey::REPLACE };

    #[must_use]
    pub fn to_wgpu(self) -> wgpu::BlendState {
        wgpu::BlendState { color: self.color.to_wgpu(), alpha: self.alpha.to_wgpu() }
    }
}

/// Hashable mirror of `wgpu::StencilFaceState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilFaceKey {
    pub compare: wgpu::CompareFunction,
    pub fail_op: wgpu::StencilOperation,
    pub depth_fail_op: wgpu::StencilOperation,
    pub pass_op: wgpu::StencilOperation,
}

impl StencilFaceKey {
    pub const IGNORE: Self = Self {
        compare: wgpu::CompareFunction::Always,
        fail_op: wgpu::StencilOperation::Keep,
        depth_fail_op: wgpu::StencilOperation::Keep,
        pass_op: wgpu::StencilOperation::Keep,
    };

    #[must_use]
    pub fn to_wgpu(self) -> wgpu::StencilFaceState {
        wgpu::StencilFaceState {
            compare: self.compare,
            fail_op: self.fail_op,
            depth_fail_op: self.depth_fail_op,
            pass_op: self.pass_op,
        }
    }
}

/// Hashable mirror of `wgpu::StencilState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilStateKey {
    pub front: StencilFaceKey,
    pub back: StencilFaceKey,
    pub read_mask: u32,
    pub write_mask: u32,
}

/// Hashable mirror of `wgpu::DepthBiasState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DepthBiasKey {
    pub constant: i32,
    pub slope_scale_bits: u32,
    pub clamp_bits: u32,
}

impl From<wgpu::DepthBiasState> for DepthBiasKey {
    fn from(b: wgpu::DepthBiasState) -> Self {
        Self {
            constant: b.constant,
            slope_scale_bits: b.slope_scale.to_bits(),
            clamp_bits: b.clamp.to_bits(),
        }
    }
}

/// Hashable mirror of `wgpu::DepthStencilState`, minus the format, which
/// follows the bound framebuffer and lives on the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DepthStencilKey {
    pub depth_write_enabled: bool,
    pub depth_compare: wgpu::CompareFunction,
    pub stencil: StencilStateKey,
    pub bias: DepthBiasKey,
}

impl Default for DepthStencilKey {
    fn default() -> Self {
        Self {
            depth_write_enabled: true,
            depth_compare: wgpu::CompareFunction::Always,
            stencil: StencilStateKey {
                front: StencilFaceKey::IGNORE,
                back: StencilFaceKey::IGNORE,
                read_mask: 0xFF,
                write_mask: 0xFF,
            },
            bias: DepthBiasKey::default(),
        }
    }
}

/// Hashable mirror of `wgpu::ColorTargetState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorTargetKey {
    pub format: wgpu::TextureFormat,
    pub blend: Option<BlendStateKey>,
    pub write_mask: u32, // wgpu::ColorWrites bits
}

// ─── Draw Pipeline Descriptor ─────────────────────────────────────────────────

/// One vertex attribute, bound from its own vertex buffer at offset 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttributeKey {
    pub format: wgpu::VertexFormat,
    pub stride: u32,
    pub step_mode: wgpu::VertexStepMode,
}

/// Per draw buffer color state. Blend and write mask are kept even while
/// the slot has no attachment so rebinding a framebuffer restores them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorTargetSlot {
    pub format: Option<wgpu::TextureFormat>,
    pub blend_enabled: bool,
    pub blend: BlendStateKey,
    pub write_mask: u32,
}

impl Default for ColorTargetSlot {
    fn default() -> Self {
        Self {
            format: None,
            blend_enabled: false,
            blend: BlendStateKey::REPLACE,
            write_mask: wgpu::ColorWrites::ALL.bits(),
        }
    }
}

impl ColorTargetSlot {
    #[must_use]
    pub fn key(&self) -> Option<ColorTargetKey> {
        self.format.map(|format| ColorTargetKey {
            format,
            blend: self.blend_enabled.then_some(self.blend),
            write_mask: self.write_mask,
        })
    }
}

/// The full pipeline-affecting state of a draw.
///
/// Setters return whether anything changed so the caller can invalidate
/// the bound pipeline only on a real difference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineDescriptor {
    pub topology: wgpu::PrimitiveTopology,
    pub strip_index_format: Option<wgpu::IndexFormat>,
    pub front_face: wgpu::FrontFace,
    pub cull_mode: Option<wgpu::Face>,
    pub vertex_attributes: [Option<VertexAttributeKey>; MAX_VERTEX_ATTRIBS],
    pub color_targets: [ColorTargetSlot; MAX_DRAW_BUFFERS],
    pub depth_stencil_format: Option<wgpu::TextureFormat>,
    pub depth_stencil: DepthStencilKey,
}

impl Default for PipelineDescriptor {
    fn default() -> Self {
        Self {
            topology: wgpu::PrimitiveTopology::TriangleList,
            strip_index_format: None,
            front_face: wgpu::FrontFace::Ccw,
            cull_mode: None,
            vertex_attributes: [None; MAX_VERTEX_ATTRIBS],
            color_targets: [ColorTargetSlot::default(); MAX_DRAW_BUFFERS],
            depth_stencil_format: None,
            depth_stencil: DepthStencilKey::default(),
        }
    }
}

/// Stores `value` in `slot`, reporting whether it differed.
#[inline]
fn update<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        return false;
    }
    *slot = value;
    true
}

impl PipelineDescriptor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ── Primitive state ──────────────────────────────────────────────────────

    /// `index_type` is the type actually bound for this draw (after
    /// emulation), or `None` for array draws.
    pub fn set_primitive_mode(&mut self, mode: PrimitiveMode, index_type: Option<IndexType>) -> bool {
        let topology = conversions::primitive_topology(mode);
        let strip_index_format = match (topology, index_type) {
            (wgpu::PrimitiveTopology::LineStrip | wgpu::PrimitiveTopology::TriangleStrip, Some(ty)) => {
                Some(conversions::index_format(ty))
            }
            _ => None,
        };
        let topology_changed = update(&mut self.topology, topology);
        update(&mut self.strip_index_format, strip_index_format) || topology_changed
    }

    pub fn set_cull_mode(&mut self, cull_mode: Option<wgpu::Face>) -> bool {
        update(&mut self.cull_mode, cull_mode)
    }

    pub fn set_front_face(&mut self, front_face: wgpu::FrontFace) -> bool {
        update(&mut self.front_face, front_face)
    }

    // ── Vertex input ─────────────────────────────────────────────────────────

    pub fn set_vertex_attribute(&mut self, location: usize, attribute: Option<VertexAttributeKey>) -> bool {
        update(&mut self.vertex_attributes[location], attribute)
    }

    /// Vertex buffer slot that feeds shader `location`. Enabled attributes
    /// are packed into consecutive buffer slots in location order.
    #[must_use]
    pub fn vertex_buffer_slot(&self, location: usize) -> Option<u32> {
        self.vertex_attributes[location]?;
        let slot = self.vertex_attributes[..location].iter().filter(|a| a.is_some()).count();
        u32::try_from(slot).ok()
    }

    #[must_use]
    pub fn vertex_buffer_layouts(&self) -> SmallVec<[VertexBufferLayoutDesc; 8]> {
        self.vertex_attributes
            .iter()
            .enumerate()
            .filter_map(|(location, attribute)| {
                let attribute = attribute.as_ref()?;
                Some(VertexBufferLayoutDesc {
                    array_stride: u64::from(attribute.stride),
                    step_mode: attribute.step_mode,
                    attributes: smallvec::smallvec![wgpu::VertexAttribute {
                        format: attribute.format,
                        offset: 0,
                        shader_location: location as u32,
                    }],
                })
            })
            .collect()
    }

    // ── Color targets ────────────────────────────────────────────────────────

    pub fn set_color_attachment_format(&mut self, index: usize, format: Option<wgpu::TextureFormat>) -> bool {
        update(&mut self.color_targets[index].format, format)
    }

    pub fn set_blend_enabled(&mut self, index: usize, enabled: bool) -> bool {
        update(&mut self.color_targets[index].blend_enabled, enabled)
    }

    pub fn set_blend(&mut self, index: usize, blend: BlendStateKey) -> bool {
        update(&mut self.color_targets[index].blend, blend)
    }

    pub fn set_color_write_mask(&mut self, index: usize, mask: wgpu::ColorWrites) -> bool {
        update(&mut self.color_targets[index].write_mask, mask.bits())
    }

    /// Targets up to the last attached one; gaps become `None`.
    #[must_use]
    pub fn color_target_states(&self) -> SmallVec<[Option<wgpu::ColorTargetState>; MAX_DRAW_BUFFERS]> {
        let count = self
            .color_targets
            .iter()
            .rposition(|t| t.format.is_some())
            .map_or(0, |last| last + 1);
        self.color_targets[..count]
            .iter()
            .map(|slot| {
                slot.key().map(|key| wgpu::ColorTargetState {
                    format: key.format,
                    blend: key.blend.map(BlendStateKey::to_wgpu),
                    write_mask: wgpu::ColorWrites::from_bits_truncate(key.write_mask),
                })
            })
            .collect()
    }

    // ── Depth / stencil ──────────────────────────────────────────────────────

    pub fn set_depth_stencil_attachment_format(&mut self, format: Option<wgpu::TextureFormat>) -> bool {
        update(&mut self.depth_stencil_format, format)
    }

    pub fn set_depth_write_enabled(&mut self, enabled: bool) -> bool {
        update(&mut self.depth_stencil.depth_write_enabled, enabled)
    }

    pub fn set_depth_compare(&mut self, compare: wgpu::CompareFunction) -> bool {
        update(&mut self.depth_stencil.depth_compare, compare)
    }

    pub fn set_stencil_front(&mut self, face: StencilFaceKey) -> bool {
        update(&mut self.depth_stencil.stencil.front, face)
    }

    pub fn set_stencil_back(&mut self, face: StencilFaceKey) -> bool {
        update(&mut self.depth_stencil.stencil.back, face)
    }

    pub fn set_stencil_read_mask(&mut self, mask: u32) -> bool {
        update(&mut self.depth_stencil.stencil.read_mask, mask)
    }

    pub fn set_stencil_write_mask(&mut self, mask: u32) -> bool {
        update(&mut self.depth_stencil.stencil.write_mask, mask)
    }

    pub fn set_depth_bias(&mut self, bias: DepthBiasKey) -> bool {
        update(&mut self.depth_stencil.bias, bias)
    }

    #[must_use]
    pub fn depth_stencil_state(&self) -> Option<wgpu::DepthStencilState> {
        let format = self.depth_stencil_format?;
        let ds = &self.depth_stencil;
        let has_depth = format.has_depth_aspect();
        let has_stencil = format.has_stencil_aspect();
        let stencil = if has_stencil {
            wgpu::StencilState {
                front: ds.stencil.front.to_wgpu(),
                back: ds.stencil.back.to_wgpu(),
                read_mask: ds.stencil.read_mask,
                write_mask: ds.stencil.write_mask,
            }
        } else {
            wgpu::StencilState::default()
        };
        Some(wgpu::DepthStencilState {
            format,
            depth_write_enabled: Some(has_depth && ds.depth_write_enabled),
            depth_compare: Some(if has_depth { ds.depth_compare } else { wgpu::CompareFunction::Always }),
            stencil,
            bias: wgpu::DepthBiasState {
                constant: ds.bias.constant,
                slope_scale: f32::from_bits(ds.bias.slope_scale_bits),
                clamp: f32::from_bits(ds.bias.clamp_bits),
            },
        })
    }

    #[must_use]
    pub fn primitive_state(&self) -> wgpu::PrimitiveState {
        wgpu::PrimitiveState {
            topology: self.topology,
            strip_index_format: self.strip_index_format,
            front_face: self.front_face,
            cull_mode: self.cull_mode,
            ..Default::default()
        }
    }
}

// ─── Clear Pipeline Key ───────────────────────────────────────────────────────

/// Cache key for clear-with-draw pipelines.
///
/// The pipeline draws a full-screen strip without vertex buffers, so the key
/// only carries the target formats, their write masks, and whether each
/// target's intended format lacks alpha (forcing alpha to 1).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClearPipelineKey {
    /// xxh3-128 hash of the WGSL source.
    pub shader_hash: u128,
    pub color_formats: SmallVec<[Option<wgpu::TextureFormat>; 4]>,
    pub write_masks: SmallVec<[u32; 4]>,
    pub force_opaque: SmallVec<[bool; 4]>,
    pub depth_stencil_format: Option<wgpu::TextureFormat>,
}

// ─── Convenience helpers ──────────────────────────────────────────────────────

/// Compute a `u64` hash of any `Hash`-able value using `FxBuildHasher`.
#[inline]
pub fn fx_hash_key<K: Hash>(key: &K) -> u64 {
    let mut hasher = rustc_hash::FxHasher::default();
    key.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setters_report_changes() {
        let mut desc = PipelineDescriptor::new();
        assert!(!desc.set_cull_mode(None));
        assert!(desc.set_cull_mode(Some(wgpu::Face::Back)));
        assert!(!desc.set_cull_mode(Some(wgpu::Face::Back)));
        assert!(desc.set_color_write_mask(0, wgpu::ColorWrites::RED));
        assert!(!desc.set_color_write_mask(0, wgpu::ColorWrites::RED));
    }

    #[test]
    fn strip_index_format_follows_index_type() {
        let mut desc = PipelineDescriptor::new();
        desc.set_primitive_mode(PrimitiveMode::TriangleStrip, Some(IndexType::U32));
        assert_eq!(desc.strip_index_format, Some(wgpu::IndexFormat::Uint32));
        desc.set_primitive_mode(PrimitiveMode::TriangleStrip, None);
        assert_eq!(desc.strip_index_format, None);
        desc.set_primitive_mode(PrimitiveMode::Triangles, Some(IndexType::U16));
        assert_eq!(desc.strip_index_format, None);
    }

    #[test]
    fn vertex_buffers_are_packed_in_location_order() {
        let mut desc = PipelineDescriptor::new();
        let attr = VertexAttributeKey {
            format: wgpu::VertexFormat::Float32x3,
            stride: 12,
            step_mode: wgpu::VertexStepMode::Vertex,
        };
        desc.set_vertex_attribute(1, Some(attr));
        desc.set_vertex_attribute(4, Some(attr));
        let layouts = desc.vertex_buffer_layouts();
        assert_eq!(layouts.len(), 2);
        assert_eq!(layouts[1].attributes[0].shader_location, 4);
        assert_eq!(desc.vertex_buffer_slot(4), Some(1));
        assert_eq!(desc.vertex_buffer_slot(2), None);
    }

    #[test]
    fn color_targets_stop_at_last_attachment() {
        let mut desc = PipelineDescriptor::new();
        assert!(desc.color_target_states().is_empty());
        desc.set_color_attachment_format(2, Some(wgpu::TextureFormat::Rgba8Unorm));
        let targets = desc.color_target_states();
        assert_eq!(targets.len(), 3);
        assert!(targets[0].is_none());
        assert_eq!(targets[2].as_ref().map(|t| t.blend), Some(None));
    }

    #[test]
    fn stencil_is_dropped_for_depth_only_formats() {
        let mut desc = PipelineDescriptor::new();
        desc.set_stencil_write_mask(0x0F);
        desc.set_depth_stencil_attachment_format(Some(wgpu::TextureFormat::Depth32Float));
        let state = desc.depth_stencil_state().unwrap();
        assert_eq!(state.stencil.write_mask, 0);
    }

    #[test]
    fn equal_descriptors_hash_equal() {
        let mut a = PipelineDescriptor::new();
        let mut b = PipelineDescriptor::new();
        a.set_front_face(wgpu::FrontFace::Cw);
        b.set_front_face(wgpu::FrontFace::Cw);
        assert_eq!(a, b);
        assert_eq!(fx_hash_key(&a), fx_hash_key(&b));
    }
}
