//! Vertex array objects.
//!
//! A [`VertexArray`] records where each attribute's data lives (client
//! memory or a buffer object), its client-side format and divisor, and the
//! element buffer. Before a draw the context asks it to [`prepare`] the
//! active attributes: attributes the backend can read directly are bound
//! in place, everything else is packed into per-attribute streamed buffers
//! through one [`StreamingBatch`].
//!
//! Streamed data stays resident. An attribute is restreamed only when its
//! pointer changed since the last upload or the draw needs vertices outside
//! the resident range.
//!
//! [`prepare`]: VertexArray::prepare

use std::ops::Range;
use std::sync::Arc;

use glam::Vec4;
use glbridge_core::constants::{COPY_BUFFER_ALIGNMENT, MAX_VERTEX_ATTRIBS, round_up};
use glbridge_core::state::BufferHandle;
use glbridge_core::types::{VertexAttribFormat, VertexAttribType};
use glbridge_core::{BridgeError, Result, SlotMask};
use slotmap::SlotMap;

use crate::backend::{Backend, BufferId};
use crate::buffer::Buffer;
use crate::buffer_helper::BufferHelper;
use crate::pipeline::VertexAttributeKey;
use crate::render_pass::RenderPassManager;
use crate::streaming::{StreamingBatch, pack_vertex_data};

// ─── Format conversion ─────────────────────────────────────────────────────

/// How client vertex data reaches the backend format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexConversion {
    /// Bytes are used as they are.
    None,
    /// A 3-component 8/16-bit format padded with a fourth component.
    PadTo4 { component_size: u32, pad: u32 },
    /// Integer or fixed-point data converted to 32-bit floats.
    ToFloat { normalized: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexFormatInfo {
    pub format: wgpu::VertexFormat,
    pub conversion: VertexConversion,
}

impl VertexFormatInfo {
    /// Bytes per element in the backend format.
    #[inline]
    #[must_use]
    pub fn dst_size(&self) -> u32 {
        self.format.size() as u32
    }

    /// Packed stride; backend strides are multiples of 4.
    #[inline]
    #[must_use]
    pub fn dst_stride(&self) -> u32 {
        round_up(self.format.size(), COPY_BUFFER_ALIGNMENT) as u32
    }
}

pub fn vertex_format_info(format: VertexAttribFormat) -> Result<VertexFormatInfo> {
    use VertexAttribType as T;
    use wgpu::VertexFormat as F;

    if !(1..=4).contains(&format.components) {
        return Err(BridgeError::InvalidOperation(format!(
            "vertex attributes have 1 to 4 components, got {}",
            format.components
        )));
    }
    let n = format.components as usize - 1;
    let native = |formats: [F; 4]| VertexFormatInfo { format: formats[n], conversion: VertexConversion::None };
    // Three-component 8/16-bit formats do not exist; widen to four.
    let padded = |formats: [F; 4], component_size: u32, pad: u32| {
        if format.components == 3 {
            VertexFormatInfo { format: formats[3], conversion: VertexConversion::PadTo4 { component_size, pad } }
        } else {
            native(formats)
        }
    };
    let to_float = |normalized: bool| VertexFormatInfo {
        format: [F::Float32, F::Float32x2, F::Float32x3, F::Float32x4][n],
        conversion: VertexConversion::ToFloat { normalized },
    };

    let info = match (format.ty, format.normalized, format.pure_integer) {
        (T::Float, ..) => native([F::Float32, F::Float32x2, F::Float32x3, F::Float32x4]),
        (T::HalfFloat, ..) => padded([F::Float16, F::Float16x2, F::Float16x4, F::Float16x4], 2, 0x3C00),
        (T::Fixed, ..) => to_float(false),

        (T::Byte, _, true) => padded([F::Sint8, F::Sint8x2, F::Sint8x4, F::Sint8x4], 1, 1),
        (T::UnsignedByte, _, true) => padded([F::Uint8, F::Uint8x2, F::Uint8x4, F::Uint8x4], 1, 1),
        (T::Short, _, true) => padded([F::Sint16, F::Sint16x2, F::Sint16x4, F::Sint16x4], 2, 1),
        (T::UnsignedShort, _, true) => padded([F::Uint16, F::Uint16x2, F::Uint16x4, F::Uint16x4], 2, 1),
        (T::Int, _, true) => native([F::Sint32, F::Sint32x2, F::Sint32x3, F::Sint32x4]),
        (T::UnsignedInt, _, true) => native([F::Uint32, F::Uint32x2, F::Uint32x3, F::Uint32x4]),

        (T::Byte, true, false) => padded([F::Snorm8, F::Snorm8x2, F::Snorm8x4, F::Snorm8x4], 1, 0x7F),
        (T::UnsignedByte, true, false) => padded([F::Unorm8, F::Unorm8x2, F::Unorm8x4, F::Unorm8x4], 1, 0xFF),
        (T::Short, true, false) => padded([F::Snorm16, F::Snorm16x2, F::Snorm16x4, F::Snorm16x4], 2, 0x7FFF),
        (T::UnsignedShort, true, false) => {
            padded([F::Unorm16, F::Unorm16x2, F::Unorm16x4, F::Unorm16x4], 2, 0xFFFF)
        }
        (T::Int | T::UnsignedInt, true, false) => to_float(true),

        // Non-normalized integers read as floats ("scaled").
        (T::Byte | T::UnsignedByte | T::Short | T::UnsignedShort | T::Int | T::UnsignedInt, false, false) => {
            to_float(false)
        }
    };
    Ok(info)
}

/// Converts one element from client layout to backend layout.
pub fn convert_vertex(format: VertexAttribFormat, info: &VertexFormatInfo, src: &[u8], dst: &mut [u8]) {
    let src_size = format.size() as usize;
    match info.conversion {
        VertexConversion::None => dst[..src_size].copy_from_slice(&src[..src_size]),
        VertexConversion::PadTo4 { component_size, pad } => {
            dst[..src_size].copy_from_slice(&src[..src_size]);
            let pad_bytes = pad.to_le_bytes();
            dst[src_size..src_size + component_size as usize].copy_from_slice(&pad_bytes[..component_size as usize]);
        }
        VertexConversion::ToFloat { normalized } => {
            let component = format.ty.size() as usize;
            for c in 0..format.components as usize {
                let bytes = &src[c * component..(c + 1) * component];
                let value = component_to_f32(format.ty, bytes, normalized);
                dst[c * 4..c * 4 + 4].copy_from_slice(&value.to_le_bytes());
            }
        }
    }
}

fn component_to_f32(ty: VertexAttribType, bytes: &[u8], normalized: bool) -> f32 {
    let (value, max) = match ty {
        VertexAttribType::Byte => (f64::from(bytes[0] as i8), f64::from(i8::MAX)),
        VertexAttribType::UnsignedByte => (f64::from(bytes[0]), f64::from(u8::MAX)),
        VertexAttribType::Short => (f64::from(i16::from_le_bytes([bytes[0], bytes[1]])), f64::from(i16::MAX)),
        VertexAttribType::UnsignedShort => {
            (f64::from(u16::from_le_bytes([bytes[0], bytes[1]])), f64::from(u16::MAX))
        }
        VertexAttribType::Int => (
            f64::from(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            f64::from(i32::MAX),
        ),
        VertexAttribType::UnsignedInt => (
            f64::from(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            f64::from(u32::MAX),
        ),
        VertexAttribType::Fixed => {
            let fixed = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            return (f64::from(fixed) / 65536.0) as f32;
        }
        VertexAttribType::HalfFloat | VertexAttribType::Float => {
            unreachable!("float attributes are never converted to float")
        }
    };
    if normalized { (value / max).max(-1.0) as f32 } else { value as f32 }
}

// ─── Attribute state ───────────────────────────────────────────────────────

/// Where an attribute's data comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum AttribSource {
    /// Client memory, captured when the pointer is set.
    Client(Arc<[u8]>),
    Buffer(BufferHandle),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VertexAttribute {
    pub enabled: bool,
    pub format: VertexAttribFormat,
    /// Byte stride; 0 means tightly packed.
    pub stride: u32,
    /// Byte offset into the source.
    pub offset: u64,
    pub source: Option<AttribSource>,
    pub divisor: u32,
}

impl Default for VertexAttribute {
    fn default() -> Self {
        Self {
            enabled: false,
            format: VertexAttribFormat::float(4),
            stride: 0,
            offset: 0,
            source: None,
            divisor: 0,
        }
    }
}

impl VertexAttribute {
    #[inline]
    #[must_use]
    pub fn effective_stride(&self) -> u32 {
        if self.stride == 0 { self.format.size() } else { self.stride }
    }

    fn step_mode(&self) -> wgpu::VertexStepMode {
        if self.divisor == 0 { wgpu::VertexStepMode::Vertex } else { wgpu::VertexStepMode::Instance }
    }
}

/// Backend binding of one attribute location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexBinding {
    pub buffer: BufferId,
    pub offset: u64,
    pub key: VertexAttributeKey,
}

/// Vertices a draw touches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawVertexRange {
    pub vertices: Range<u32>,
    pub instance_count: u32,
}

impl DrawVertexRange {
    fn for_attribute(&self, attribute: &VertexAttribute) -> Range<u32> {
        if attribute.divisor == 0 {
            self.vertices.clone()
        } else {
            0..self.instance_count.div_ceil(attribute.divisor)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Resident {
    Vertices { start: u32, end: u32 },
    Generic(Vec4),
}

#[derive(Debug, Default)]
struct StreamedAttribute {
    helper: BufferHelper,
    resident: Option<Resident>,
}

// ─── VertexArray ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct VertexArray {
    attributes: [VertexAttribute; MAX_VERTEX_ATTRIBS],
    element_buffer: Option<BufferHandle>,
    /// Attributes edited since their data was last streamed.
    dirty_attributes: SlotMask,
    streamed: [StreamedAttribute; MAX_VERTEX_ATTRIBS],
    bindings: [Option<VertexBinding>; MAX_VERTEX_ATTRIBS],
    streamed_indices: BufferHelper,
}

impl Default for VertexArray {
    fn default() -> Self {
        Self {
            attributes: std::array::from_fn(|_| VertexAttribute::default()),
            element_buffer: None,
            dirty_attributes: SlotMask::first(MAX_VERTEX_ATTRIBS),
            streamed: std::array::from_fn(|_| StreamedAttribute::default()),
            bindings: [None; MAX_VERTEX_ATTRIBS],
            streamed_indices: BufferHelper::new(),
        }
    }
}

impl VertexArray {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    // ─── Frontend edits ────────────────────────────────────────────────────

    pub fn set_attribute_pointer(
        &mut self,
        location: usize,
        format: VertexAttribFormat,
        stride: u32,
        offset: u64,
        source: Option<AttribSource>,
    ) -> Result<()> {
        let attribute = self.attribute_mut(location)?;
        attribute.format = format;
        attribute.stride = stride;
        attribute.offset = offset;
        attribute.source = source;
        self.dirty_attributes.set(location);
        Ok(())
    }

    pub fn set_attribute_enabled(&mut self, location: usize, enabled: bool) -> Result<()> {
        let attribute = self.attribute_mut(location)?;
        if attribute.enabled != enabled {
            attribute.enabled = enabled;
            self.dirty_attributes.set(location);
        }
        Ok(())
    }

    pub fn set_attribute_divisor(&mut self, location: usize, divisor: u32) -> Result<()> {
        let attribute = self.attribute_mut(location)?;
        if attribute.divisor != divisor {
            attribute.divisor = divisor;
            self.dirty_attributes.set(location);
        }
        Ok(())
    }

    pub fn bind_element_buffer(&mut self, buffer: Option<BufferHandle>) {
        self.element_buffer = buffer;
    }

    #[inline]
    #[must_use]
    pub fn element_buffer(&self) -> Option<BufferHandle> {
        self.element_buffer
    }

    #[must_use]
    pub fn attribute(&self, location: usize) -> Option<&VertexAttribute> {
        self.attributes.get(location)
    }

    fn attribute_mut(&mut self, location: usize) -> Result<&mut VertexAttribute> {
        self.attributes
            .get_mut(location)
            .ok_or_else(|| BridgeError::InvalidOperation(format!("vertex attribute {location} out of range")))
    }

    /// Whether `buffer` backs any attribute or the element buffer.
    #[must_use]
    pub fn references(&self, buffer: BufferHandle) -> bool {
        self.element_buffer == Some(buffer)
            || self
                .attributes
                .iter()
                .any(|a| a.source == Some(AttribSource::Buffer(buffer)))
    }

    /// Forces `buffer`-backed attributes to be rebound or restreamed.
    pub fn mark_buffer_dirty(&mut self, buffer: BufferHandle) {
        for (location, attribute) in self.attributes.iter().enumerate() {
            if attribute.source == Some(AttribSource::Buffer(buffer)) {
                self.dirty_attributes.set(location);
            }
        }
    }

    #[inline]
    #[must_use]
    pub fn binding(&self, location: usize) -> Option<VertexBinding> {
        self.bindings.get(location).copied().flatten()
    }

    #[inline]
    pub fn streamed_indices_mut(&mut self) -> &mut BufferHelper {
        &mut self.streamed_indices
    }

    // ─── Draw preparation ──────────────────────────────────────────────────

    /// Whether a draw with these active attributes needs the vertex range.
    #[must_use]
    pub fn needs_vertex_range(&self, active: SlotMask, buffers: &SlotMap<BufferHandle, Buffer>) -> bool {
        active.iter().any(|location| {
            let attribute = &self.attributes[location];
            attribute.enabled && attribute.divisor == 0 && self.needs_streaming(attribute, buffers)
        })
    }

    fn needs_streaming(&self, attribute: &VertexAttribute, buffers: &SlotMap<BufferHandle, Buffer>) -> bool {
        match &attribute.source {
            Some(AttribSource::Buffer(handle)) => {
                let Ok(info) = vertex_format_info(attribute.format) else {
                    return true;
                };
                let aligned = u64::from(attribute.effective_stride()) % COPY_BUFFER_ALIGNMENT == 0
                    && attribute.offset % COPY_BUFFER_ALIGNMENT == 0;
                info.conversion != VertexConversion::None
                    || !aligned
                    || buffers.get(*handle).and_then(Buffer::backing).is_none()
            }
            _ => true,
        }
    }

    /// Resolves the binding of every active attribute, packing whatever the
    /// backend cannot read in place into `batch`. Returns the locations
    /// whose binding changed.
    pub fn prepare<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        buffers: &SlotMap<BufferHandle, Buffer>,
        active: SlotMask,
        generic_values: &[Vec4; MAX_VERTEX_ATTRIBS],
        range: &DrawVertexRange,
        batch: &mut StreamingBatch,
    ) -> Result<SlotMask> {
        let mut changed = SlotMask::default();
        for location in 0..MAX_VERTEX_ATTRIBS {
            let binding = if active.test(location) {
                Some(self.prepare_attribute(passes, buffers, location, generic_values[location], range, batch)?)
            } else {
                None
            };
            if self.bindings[location] != binding {
                self.bindings[location] = binding;
                changed.set(location);
            }
        }
        Ok(changed)
    }

    fn prepare_attribute<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        buffers: &SlotMap<BufferHandle, Buffer>,
        location: usize,
        generic: Vec4,
        range: &DrawVertexRange,
        batch: &mut StreamingBatch,
    ) -> Result<VertexBinding> {
        let attribute = self.attributes[location].clone();
        let was_dirty = self.dirty_attributes.test(location);
        self.dirty_attributes.reset(location);
        if was_dirty {
            self.streamed[location].resident = None;
        }

        if !attribute.enabled {
            return self.stream_generic(passes, location, generic, batch);
        }

        let info = vertex_format_info(attribute.format)?;
        if !self.needs_streaming(&attribute, buffers) {
            let Some(AttribSource::Buffer(handle)) = attribute.source else {
                return Err(BridgeError::InternalConsistency("in-place attribute without a buffer".to_string()));
            };
            let buffer = buffers
                .get(handle)
                .and_then(Buffer::backing)
                .ok_or_else(|| BridgeError::InvalidOperation(format!("attribute {location} buffer has no storage")))?;
            return Ok(VertexBinding {
                buffer,
                offset: attribute.offset,
                key: VertexAttributeKey {
                    format: info.format,
                    stride: attribute.effective_stride(),
                    step_mode: attribute.step_mode(),
                },
            });
        }

        let vertices = range.for_attribute(&attribute);
        let key = VertexAttributeKey {
            format: info.format,
            stride: info.dst_stride(),
            step_mode: attribute.step_mode(),
        };
        let streamed = &mut self.streamed[location];
        if let (Some(Resident::Vertices { start, end }), Some(buffer)) = (streamed.resident, streamed.helper.buffer())
            && start <= vertices.start
            && vertices.end <= end
        {
            return Ok(VertexBinding { buffer, offset: 0, key });
        }

        let src_stride = attribute.effective_stride() as usize;
        let count = (vertices.end - vertices.start) as usize;
        let src_offset = attribute.offset as usize + vertices.start as usize * src_stride;
        let src_len = if count == 0 { 0 } else { (count - 1) * src_stride + attribute.format.size() as usize };
        let (source, base): (Arc<[u8]>, usize) = match &attribute.source {
            Some(AttribSource::Client(data)) => (data.clone(), src_offset),
            Some(AttribSource::Buffer(handle)) => {
                let buffer = buffers
                    .get(*handle)
                    .ok_or_else(|| BridgeError::InvalidOperation(format!("attribute {location} buffer was deleted")))?;
                // Only the touched window comes back.
                (buffer.read(passes, src_offset as u64, src_len as u64)?.into(), 0)
            }
            None => {
                return Err(BridgeError::InvalidOperation(format!(
                    "attribute {location} is enabled without a pointer"
                )));
            }
        };
        if source.len() < base + src_len {
            return Err(BridgeError::InvalidOperation(format!(
                "attribute {location} reads past the end of its client data"
            )));
        }

        let dst_stride = info.dst_stride() as u64;
        let needed = u64::from(vertices.end) * dst_stride;
        let streamed = &mut self.streamed[location];
        if streamed.helper.size() < needed.max(dst_stride) {
            streamed.helper.init_buffer(
                passes,
                needed.max(dst_stride),
                wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST,
                false,
            )?;
        }
        let buffer = streamed
            .helper
            .buffer()
            .ok_or_else(|| BridgeError::InternalConsistency("streamed attribute has no buffer".to_string()))?;

        if count > 0 {
            let dst = batch.stage(buffer, u64::from(vertices.start) * dst_stride, count as u64 * dst_stride);
            pack_vertex_data(&source[base..], src_stride, count, attribute.format, &info, dst)?;
        }
        streamed.resident = Some(Resident::Vertices { start: vertices.start, end: vertices.end });
        Ok(VertexBinding { buffer, offset: 0, key })
    }

    /// A disabled attribute reads the current generic value for every vertex.
    fn stream_generic<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        location: usize,
        value: Vec4,
        batch: &mut StreamingBatch,
    ) -> Result<VertexBinding> {
        let key = VertexAttributeKey {
            format: wgpu::VertexFormat::Float32x4,
            stride: 0,
            step_mode: wgpu::VertexStepMode::Vertex,
        };
        let streamed = &mut self.streamed[location];
        if streamed.resident == Some(Resident::Generic(value))
            && let Some(buffer) = streamed.helper.buffer()
        {
            return Ok(VertexBinding { buffer, offset: 0, key });
        }
        if streamed.helper.size() < 16 {
            streamed.helper.init_buffer(passes, 16, wgpu::BufferUsages::VERTEX | wgpu::BufferUsages::COPY_DST, false)?;
        }
        let buffer = streamed
            .helper
            .buffer()
            .ok_or_else(|| BridgeError::InternalConsistency("generic attribute has no buffer".to_string()))?;
        batch.stage(buffer, 0, 16).copy_from_slice(bytemuck::bytes_of(&value.to_array()));
        streamed.resident = Some(Resident::Generic(value));
        Ok(VertexBinding { buffer, offset: 0, key })
    }

    pub fn destroy<B: Backend>(&mut self, passes: &mut RenderPassManager<B>) {
        for streamed in &mut self.streamed {
            streamed.helper.release(passes);
            streamed.resident = None;
        }
        self.streamed_indices.release(passes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::RecordingBackend;

    fn format(ty: VertexAttribType, components: u8, normalized: bool, pure_integer: bool) -> VertexAttribFormat {
        VertexAttribFormat { ty, components, normalized, pure_integer }
    }

    #[test]
    fn three_component_bytes_are_padded() {
        let f = format(VertexAttribType::UnsignedByte, 3, true, false);
        let info = vertex_format_info(f).unwrap();
        assert_eq!(info.format, wgpu::VertexFormat::Unorm8x4);
        let mut dst = [0u8; 4];
        convert_vertex(f, &info, &[10, 20, 30], &mut dst);
        assert_eq!(dst, [10, 20, 30, 0xFF]);
    }

    #[test]
    fn fixed_point_becomes_float() {
        let f = format(VertexAttribType::Fixed, 1, false, false);
        let info = vertex_format_info(f).unwrap();
        assert_eq!(info.format, wgpu::VertexFormat::Float32);
        let mut dst = [0u8; 4];
        convert_vertex(f, &info, &(3 << 15i32).to_le_bytes(), &mut dst);
        assert_eq!(f32::from_le_bytes(dst), 1.5);
    }

    #[test]
    fn normalized_signed_clamps_to_minus_one() {
        let f = format(VertexAttribType::Int, 1, true, false);
        let info = vertex_format_info(f).unwrap();
        let mut dst = [0u8; 4];
        convert_vertex(f, &info, &i32::MIN.to_le_bytes(), &mut dst);
        assert_eq!(f32::from_le_bytes(dst), -1.0);
    }

    #[test]
    fn client_data_stays_resident() {
        let mut passes = RenderPassManager::new(RecordingBackend::new());
        let buffers = SlotMap::with_key();
        let mut vao = VertexArray::new();
        let data: Arc<[u8]> = vec![0u8; 8 * 10].into();
        vao.set_attribute_pointer(0, VertexAttribFormat::float(2), 0, 0, Some(AttribSource::Client(data)))
            .unwrap();
        vao.set_attribute_enabled(0, true).unwrap();
        let generic = [Vec4::W; MAX_VERTEX_ATTRIBS];
        let active = SlotMask::first(1);

        let mut batch = StreamingBatch::new();
        let range = DrawVertexRange { vertices: 0..10, instance_count: 1 };
        let changed = vao.prepare(&mut passes, &buffers, active, &generic, &range, &mut batch).unwrap();
        assert!(changed.test(0));
        assert_eq!(batch.len(), 1);

        let mut batch = StreamingBatch::new();
        let range = DrawVertexRange { vertices: 2..6, instance_count: 1 };
        let changed = vao.prepare(&mut passes, &buffers, active, &generic, &range, &mut batch).unwrap();
        assert!(changed.none());
        assert!(batch.is_empty());
    }
}
