//! Backend strategy interface.
//!
//! A [`Context`](crate::context::Context) is generic over one [`Backend`],
//! chosen at creation time. The trait is the complete set of device
//! operations the translation layer needs: object creation, copy recording,
//! render pass recording and queue submission.
//!
//! Objects are named by `slotmap` keys so the core never holds backend
//! handles directly. Descriptor payloads reuse `wgpu`'s plain-data types
//! (formats, usages, primitive and blend state), which carry no device.
//!
//! Two implementations ship with the crate:
//!
//! - [`WgpuBackend`](wgpu_backend::WgpuBackend): the real device
//! - [`RecordingBackend`](recording::RecordingBackend): a GPU-less log with
//!   a software memory model, used by tests

pub mod recording;
pub mod wgpu_backend;

use glbridge_core::Result;
use glbridge_core::types::Extents;
use slotmap::new_key_type;
use smallvec::SmallVec;

use crate::command_buffer::Command;
use crate::render_pass::RenderPassDescriptor;
use crate::sampler::SamplerKey;

new_key_type! {
    pub struct BufferId;
    pub struct TextureId;
    pub struct TextureViewId;
    pub struct SamplerId;
    pub struct BindGroupLayoutId;
    pub struct PipelineLayoutId;
    pub struct BindGroupId;
    pub struct ShaderModuleId;
    pub struct RenderPipelineId;
}

// ─── Descriptors ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct BufferDescriptor<'a> {
    pub label: Option<&'a str>,
    pub size: u64,
    pub usage: wgpu::BufferUsages,
    pub mapped_at_creation: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TextureDescriptor<'a> {
    pub label: Option<&'a str>,
    pub size: Extents,
    pub mip_level_count: u32,
    pub format: wgpu::TextureFormat,
    pub usage: wgpu::TextureUsages,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct TextureViewDescriptor {
    pub base_mip_level: u32,
    pub mip_level_count: Option<u32>,
    pub base_array_layer: u32,
    pub array_layer_count: Option<u32>,
    pub dimension: Option<wgpu::TextureViewDimension>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindingResource {
    Buffer { buffer: BufferId, offset: u64, size: Option<u64> },
    Sampler(SamplerId),
    TextureView(TextureViewId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BindGroupEntry {
    pub binding: u32,
    pub resource: BindingResource,
}

/// Owned mirror of `wgpu::VertexBufferLayout`.
#[derive(Debug, Clone, PartialEq)]
pub struct VertexBufferLayoutDesc {
    pub array_stride: u64,
    pub step_mode: wgpu::VertexStepMode,
    pub attributes: SmallVec<[wgpu::VertexAttribute; 1]>,
}

#[derive(Debug, Clone, Copy)]
pub struct ShaderStageRef<'a> {
    pub module: ShaderModuleId,
    pub entry_point: &'a str,
}

/// Everything needed to build one render pipeline.
#[derive(Debug, Clone)]
pub struct RenderPipelineBuild<'a> {
    pub label: Option<&'a str>,
    pub layout: PipelineLayoutId,
    pub vertex: ShaderStageRef<'a>,
    pub fragment: Option<ShaderStageRef<'a>>,
    pub vertex_buffers: &'a [VertexBufferLayoutDesc],
    pub primitive: wgpu::PrimitiveState,
    pub color_targets: &'a [Option<wgpu::ColorTargetState>],
    pub depth_stencil: Option<wgpu::DepthStencilState>,
    pub multisample: wgpu::MultisampleState,
}

/// A buffer side of a texel copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TexelCopyBuffer {
    pub buffer: BufferId,
    pub offset: u64,
    pub bytes_per_row: u32,
    pub rows_per_image: u32,
}

/// A texture side of a texel copy. `origin[2]` is the array layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TexelCopyTexture {
    pub texture: TextureId,
    pub mip_level: u32,
    pub origin: [u32; 3],
    pub aspect: wgpu::TextureAspect,
}

// ─── The strategy interface ────────────────────────────────────────────────

pub trait Backend {
    /// Short identifier used in log lines.
    fn name(&self) -> &'static str;

    // Buffers

    fn create_buffer(&mut self, desc: &BufferDescriptor<'_>) -> Result<BufferId>;
    /// Writes into a buffer created with `mapped_at_creation`.
    fn write_mapped(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()>;
    fn unmap_buffer(&mut self, buffer: BufferId) -> Result<()>;
    /// Queue-ordered write into an unmapped buffer.
    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()>;
    /// Maps a `MAP_READ` buffer and blocks until its contents are available.
    /// All work writing the buffer must already be submitted.
    fn read_buffer(&mut self, buffer: BufferId, offset: u64, size: u64) -> Result<Vec<u8>>;
    fn release_buffer(&mut self, buffer: BufferId);

    // Textures & samplers

    fn create_texture(&mut self, desc: &TextureDescriptor<'_>) -> Result<TextureId>;
    fn create_texture_view(
        &mut self,
        texture: TextureId,
        desc: &TextureViewDescriptor,
    ) -> Result<TextureViewId>;
    fn release_texture_view(&mut self, view: TextureViewId);
    fn release_texture(&mut self, texture: TextureId);
    fn create_sampler(&mut self, desc: &SamplerKey) -> Result<SamplerId>;

    // Layouts, bind groups, pipelines

    fn create_bind_group_layout(
        &mut self,
        label: Option<&str>,
        entries: &[wgpu::BindGroupLayoutEntry],
    ) -> Result<BindGroupLayoutId>;
    fn create_pipeline_layout(
        &mut self,
        label: Option<&str>,
        layouts: &[BindGroupLayoutId],
    ) -> Result<PipelineLayoutId>;
    fn create_bind_group(
        &mut self,
        label: Option<&str>,
        layout: BindGroupLayoutId,
        entries: &[BindGroupEntry],
    ) -> Result<BindGroupId>;
    fn release_bind_group(&mut self, group: BindGroupId);
    fn create_shader_module(&mut self, label: Option<&str>, wgsl: &str) -> Result<ShaderModuleId>;
    fn create_render_pipeline(&mut self, desc: &RenderPipelineBuild<'_>) -> Result<RenderPipelineId>;

    // Recording

    /// Records one complete render pass: begin with `desc`, replay
    /// `commands` in order, end.
    fn record_render_pass(&mut self, desc: &RenderPassDescriptor, commands: &[Command]) -> Result<()>;
    fn copy_buffer_to_buffer(
        &mut self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    ) -> Result<()>;
    fn copy_buffer_to_texture(
        &mut self,
        src: &TexelCopyBuffer,
        dst: &TexelCopyTexture,
        size: Extents,
    ) -> Result<()>;
    fn copy_texture_to_buffer(
        &mut self,
        src: &TexelCopyTexture,
        dst: &TexelCopyBuffer,
        size: Extents,
    ) -> Result<()>;
    fn copy_texture_to_texture(
        &mut self,
        src: &TexelCopyTexture,
        dst: &TexelCopyTexture,
        size: Extents,
    ) -> Result<()>;

    // Queue

    /// Submits everything recorded so far. A no-op when nothing was recorded.
    fn submit(&mut self) -> Result<()>;
    /// Blocks until all submitted work has completed on the device.
    fn wait_for_submitted_work(&mut self) -> Result<()>;
    /// Presents `source` as the current frame, if the backend has a surface.
    fn present(&mut self, source: TextureId) -> Result<()>;
}
