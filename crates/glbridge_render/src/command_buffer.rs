//! Per-pass command stream.
//!
//! Commands are appended in dirty-bit resolution order while a pass is open
//! and replayed into the backend pass when it closes. The buffer also tracks
//! what has been bound in this pass so redundant binds are dropped.

use glam::Vec4;

use crate::backend::{BindGroupId, BufferId, RenderPipelineId};

/// Bind groups used by programs: default uniforms, samplers/textures, driver uniforms.
pub const MAX_BIND_GROUPS: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScissorRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    SetPipeline(RenderPipelineId),
    SetViewport(Viewport),
    SetScissor(ScissorRect),
    SetBlendConstant(Vec4),
    SetStencilReference(u32),
    SetVertexBuffer { slot: u32, buffer: BufferId, offset: u64, size: Option<u64> },
    SetIndexBuffer { buffer: BufferId, format: wgpu::IndexFormat, offset: u64 },
    SetBindGroup { index: u32, group: BindGroupId },
    Draw { vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32 },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    },
}

impl Command {
    #[inline]
    #[must_use]
    pub fn is_draw(&self) -> bool {
        matches!(self, Self::Draw { .. } | Self::DrawIndexed { .. })
    }
}

/// Append-only command list for one render pass with redundant-bind tracking.
#[derive(Debug, Default)]
pub struct CommandBuffer {
    commands: Vec<Command>,
    current_pipeline: Option<RenderPipelineId>,
    current_bind_groups: [Option<BindGroupId>; MAX_BIND_GROUPS],
    current_vertex_buffers: [Option<(BufferId, u64)>; glbridge_core::constants::MAX_VERTEX_ATTRIBS],
    current_index_buffer: Option<(BufferId, wgpu::IndexFormat, u64)>,
    viewport: Option<Viewport>,
    scissor: Option<ScissorRect>,
    blend_constant: Option<Vec4>,
    stencil_reference: Option<u32>,
}

impl CommandBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn into_commands(self) -> Vec<Command> {
        self.commands
    }

    // ─── Pass-scoped dynamic state queries ─────────────────────────────────

    /// A viewport command was recorded in this pass; the pass default no longer holds.
    #[inline]
    #[must_use]
    pub fn has_set_viewport_command(&self) -> bool {
        self.viewport.is_some()
    }

    #[inline]
    #[must_use]
    pub fn has_set_scissor_command(&self) -> bool {
        self.scissor.is_some()
    }

    #[inline]
    #[must_use]
    pub fn has_set_blend_constant_command(&self) -> bool {
        self.blend_constant.is_some()
    }

    // ─── Recording ─────────────────────────────────────────────────────────

    pub fn set_pipeline(&mut self, pipeline: RenderPipelineId) {
        if self.current_pipeline != Some(pipeline) {
            self.commands.push(Command::SetPipeline(pipeline));
            self.current_pipeline = Some(pipeline);
        }
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        if self.viewport != Some(viewport) {
            self.commands.push(Command::SetViewport(viewport));
            self.viewport = Some(viewport);
        }
    }

    pub fn set_scissor_rect(&mut self, scissor: ScissorRect) {
        if self.scissor != Some(scissor) {
            self.commands.push(Command::SetScissor(scissor));
            self.scissor = Some(scissor);
        }
    }

    pub fn set_blend_constant(&mut self, color: Vec4) {
        if self.blend_constant != Some(color) {
            self.commands.push(Command::SetBlendConstant(color));
            self.blend_constant = Some(color);
        }
    }

    pub fn set_stencil_reference(&mut self, reference: u32) {
        if self.stencil_reference != Some(reference) {
            self.commands.push(Command::SetStencilReference(reference));
            self.stencil_reference = Some(reference);
        }
    }

    pub fn set_vertex_buffer(&mut self, slot: u32, buffer: BufferId, offset: u64, size: Option<u64>) {
        let index = slot as usize;
        if self.current_vertex_buffers[index] != Some((buffer, offset)) {
            self.commands.push(Command::SetVertexBuffer { slot, buffer, offset, size });
            self.current_vertex_buffers[index] = Some((buffer, offset));
        }
    }

    pub fn set_index_buffer(&mut self, buffer: BufferId, format: wgpu::IndexFormat, offset: u64) {
        if self.current_index_buffer != Some((buffer, format, offset)) {
            self.commands.push(Command::SetIndexBuffer { buffer, format, offset });
            self.current_index_buffer = Some((buffer, format, offset));
        }
    }

    pub fn set_bind_group(&mut self, index: u32, group: BindGroupId) {
        let slot = index as usize;
        if self.current_bind_groups[slot] != Some(group) {
            self.commands.push(Command::SetBindGroup { index, group });
            self.current_bind_groups[slot] = Some(group);
        }
    }

    pub fn draw(&mut self, vertex_count: u32, instance_count: u32, first_vertex: u32, first_instance: u32) {
        self.commands.push(Command::Draw { vertex_count, instance_count, first_vertex, first_instance });
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) {
        self.commands.push(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            base_vertex,
            first_instance,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    #[test]
    fn redundant_binds_are_dropped() {
        let mut pipelines: SlotMap<RenderPipelineId, ()> = SlotMap::with_key();
        let mut groups: SlotMap<BindGroupId, ()> = SlotMap::with_key();
        let p = pipelines.insert(());
        let g = groups.insert(());

        let mut cb = CommandBuffer::new();
        cb.set_pipeline(p);
        cb.set_pipeline(p);
        cb.set_bind_group(0, g);
        cb.set_bind_group(0, g);
        cb.set_bind_group(1, g);
        assert_eq!(cb.commands().len(), 3);
    }

    #[test]
    fn dynamic_state_flags_follow_first_emission() {
        let mut cb = CommandBuffer::new();
        assert!(!cb.has_set_scissor_command());
        let rect = ScissorRect { x: 0, y: 0, width: 10, height: 10 };
        cb.set_scissor_rect(rect);
        cb.set_scissor_rect(rect);
        assert!(cb.has_set_scissor_command());
        assert_eq!(cb.commands().len(), 1);
        assert!(!cb.has_set_viewport_command());
    }

    #[test]
    fn vertex_buffer_rebinds_on_offset_change() {
        let mut buffers: SlotMap<BufferId, ()> = SlotMap::with_key();
        let b = buffers.insert(());
        let mut cb = CommandBuffer::new();
        cb.set_vertex_buffer(0, b, 0, None);
        cb.set_vertex_buffer(0, b, 0, None);
        cb.set_vertex_buffer(0, b, 16, None);
        assert_eq!(cb.commands().len(), 2);
    }
}
