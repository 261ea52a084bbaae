//! The translation context.
//!
//! [`Context`] owns the frontend [`GraphicsState`], every resource wrapper
//! and the render-pass manager. Draw, clear and read entry points all follow
//! the same shape:
//!
//! 1. `sync_state` translates frontend change bits into pipeline descriptor
//!    edits and backend [`DirtyBits`];
//! 2. work that must land outside a pass (vertex streaming, texture uploads,
//!    index read-back) is done while the pass is still closed;
//! 3. the backend bits are resolved lowest first through a table of
//!    handlers, one per bit;
//! 4. the command is recorded into the open pass.
//!
//! A failing call leaves every bit it took dirty again, so the next call
//! redoes the work instead of trusting half-applied state.

use std::borrow::Cow;

use glam::Vec4;
use glbridge_core::constants::{MAX_DRAW_BUFFERS, MAX_TEXTURE_UNITS, MAX_VERTEX_ATTRIBS, round_up};
use glbridge_core::types::{ClearMask, Extents, ImageFormat, IndexType, PrimitiveMode, Rect, VertexAttribFormat};
use glbridge_core::{
    BridgeError, BufferHandle, ContextSettings, DirtyBits, DirtyBitsIter, FramebufferHandle, GraphicsState,
    ProgramHandle, Result, SamplerHandle, SlotMask, StateDirtyBits, TextureHandle, VertexArrayHandle,
};
use slotmap::SlotMap;
use smallvec::SmallVec;

use crate::backend::{
    Backend, BindGroupEntry, BindGroupId, BindGroupLayoutId, BindingResource, BufferId, RenderPipelineId,
    TextureViewId,
};
use crate::bind_group::{BindGroupCache, EvictedResource};
use crate::buffer::Buffer;
use crate::buffer_helper::BufferHelper;
use crate::command_buffer::{CommandBuffer, ScissorRect, Viewport};
use crate::conversions;
use crate::framebuffer::{ClearRequest, Framebuffer};
use crate::image::{PixelUnpackState, copy_image};
use crate::pipeline::{BlendComponentKey, BlendStateKey, DepthBiasKey, PipelineDescriptor, StencilFaceKey};
use crate::program::{ProgramDesc, ProgramExecutable, ShaderStage};
use crate::render_pass::{ClosureReason, Garbage, RenderPassManager};
use crate::sampler::{SamplerCache, SamplerState};
use crate::streaming::{
    StreamedIndices, StreamingBatch, index_range, line_loop_from_indices, line_loop_indices, widen_u8_indices,
};
use crate::texture::Texture;
use crate::uniforms::{DEFAULT_UNIFORMS_GROUP, DRIVER_UNIFORMS_GROUP, DriverUniforms, TEXTURES_GROUP};
use crate::utils::ClearUtils;
use crate::vertex_array::{AttribSource, DrawVertexRange, VertexArray};

/// Where `draw_elements` finds its indices.
#[derive(Debug, Clone, Copy)]
pub enum IndexSource<'a> {
    /// Client memory.
    Client(&'a [u8]),
    /// Byte offset into the bound element buffer.
    Offset(u64),
}

/// Per-draw facts the dirty-bit handlers need.
#[derive(Debug, Clone, Copy)]
struct DrawCall {
    indexed: bool,
}

/// Outcome of one dirty-bit handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolution {
    Done,
    /// Left dirty on purpose; resolved by a later call that needs it.
    Deferred,
}

type DirtyBitHandler<B> = fn(&mut Context<B>, &mut DirtyBitsIter, DrawCall) -> Result<Resolution>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexBinding {
    buffer: BufferId,
    format: wgpu::IndexFormat,
    offset: u64,
}

/// Index data for one draw, before it is bound.
enum IndexData {
    Resident(IndexBinding),
    Streamed(StreamedIndices),
}

fn unknown_handle(kind: &str) -> BridgeError {
    BridgeError::InvalidOperation(format!("unknown {kind} handle"))
}

fn release_bind_groups_for_views<B: Backend>(
    passes: &mut RenderPassManager<B>,
    bind_groups: &mut BindGroupCache,
    views: Vec<TextureViewId>,
) {
    for view in views {
        for group in bind_groups.evict(EvictedResource::TextureView(view)) {
            passes.defer_release(Garbage::BindGroup(group));
        }
    }
}

fn release_bind_groups_for_buffer<B: Backend>(
    passes: &mut RenderPassManager<B>,
    bind_groups: &mut BindGroupCache,
    buffer: BufferId,
) {
    for group in bind_groups.evict(EvictedResource::Buffer(buffer)) {
        passes.defer_release(Garbage::BindGroup(group));
    }
}

pub struct Context<B: Backend> {
    settings: ContextSettings,
    state: GraphicsState,
    passes: RenderPassManager<B>,

    buffers: SlotMap<BufferHandle, Buffer>,
    textures: SlotMap<TextureHandle, Texture>,
    samplers: SlotMap<SamplerHandle, SamplerState>,
    framebuffers: SlotMap<FramebufferHandle, Framebuffer>,
    vertex_arrays: SlotMap<VertexArrayHandle, VertexArray>,
    programs: SlotMap<ProgramHandle, ProgramExecutable>,
    default_framebuffer: FramebufferHandle,
    default_vertex_array: VertexArrayHandle,

    bind_groups: BindGroupCache,
    sampler_cache: SamplerCache,
    clear_utils: ClearUtils,

    pipeline_desc: PipelineDescriptor,
    current_pipeline: Option<RenderPipelineId>,
    index_binding: Option<IndexBinding>,
    generic_attributes: [Vec4; MAX_VERTEX_ATTRIBS],
    /// Texture and view bound to each sampler of the current program.
    sampled: SmallVec<[(TextureHandle, TextureViewId); 8]>,

    driver_uniforms_layout: BindGroupLayoutId,
    driver_uniforms: Option<DriverUniforms>,
    driver_uniform_buffer: BufferHelper,
    driver_uniform_group: Option<BindGroupId>,
}

impl<B: Backend> Context<B> {
    /// Handlers indexed by [`DirtyBits::index`].
    const DIRTY_BIT_HANDLERS: [DirtyBitHandler<B>; DirtyBits::COUNT] = [
        Self::handle_render_pipeline_desc,
        Self::handle_render_pass,
        Self::handle_render_pipeline_binding,
        Self::handle_viewport,
        Self::handle_scissor,
        Self::handle_blend_constant,
        Self::handle_vertex_buffers,
        Self::handle_index_buffer,
        Self::handle_driver_uniforms,
        Self::handle_bind_groups,
    ];

    pub fn new(backend: B, settings: ContextSettings) -> Result<Self> {
        let mut passes = RenderPassManager::new(backend);
        log::info!(
            "Creating context on {} backend, default framebuffer {}x{} {:?}",
            passes.backend().name(),
            settings.default_framebuffer_size[0],
            settings.default_framebuffer_size[1],
            settings.default_framebuffer_format
        );

        let mut framebuffers = SlotMap::with_key();
        let default_framebuffer = framebuffers.insert(Framebuffer::new_default(&mut passes, &settings)?);
        let mut vertex_arrays = SlotMap::with_key();
        let default_vertex_array = vertex_arrays.insert(VertexArray::new());

        let driver_uniforms_layout = passes.backend_mut().create_bind_group_layout(
            Some("driver uniforms"),
            &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::VERTEX | wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        )?;
        let clear_utils = ClearUtils::new(passes.backend_mut())?;
        let state = GraphicsState::new(default_framebuffer, settings.default_framebuffer_extents().rect());
        passes.mark_dirty(DirtyBits::all());

        Ok(Self {
            settings,
            state,
            passes,
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            samplers: SlotMap::with_key(),
            framebuffers,
            vertex_arrays,
            programs: SlotMap::with_key(),
            default_framebuffer,
            default_vertex_array,
            bind_groups: BindGroupCache::new(),
            sampler_cache: SamplerCache::new(),
            clear_utils,
            pipeline_desc: PipelineDescriptor::new(),
            current_pipeline: None,
            index_binding: None,
            generic_attributes: [Vec4::new(0.0, 0.0, 0.0, 1.0); MAX_VERTEX_ATTRIBS],
            sampled: SmallVec::new(),
            driver_uniforms_layout,
            driver_uniforms: None,
            driver_uniform_buffer: BufferHelper::new(),
            driver_uniform_group: None,
        })
    }

    // ─── Accessors ─────────────────────────────────────────────────────────

    #[inline]
    #[must_use]
    pub fn settings(&self) -> &ContextSettings {
        &self.settings
    }

    #[inline]
    #[must_use]
    pub fn state(&self) -> &GraphicsState {
        &self.state
    }

    /// Frontend state. Setters only mark change bits; nothing reaches the
    /// backend until the next draw, clear or read.
    #[inline]
    pub fn state_mut(&mut self) -> &mut GraphicsState {
        &mut self.state
    }

    #[inline]
    #[must_use]
    pub fn backend(&self) -> &B {
        self.passes.backend()
    }

    #[inline]
    #[must_use]
    pub fn render_passes(&self) -> &RenderPassManager<B> {
        &self.passes
    }

    #[inline]
    pub fn render_passes_mut(&mut self) -> &mut RenderPassManager<B> {
        &mut self.passes
    }

    /// Backend bits still waiting for a draw.
    #[inline]
    #[must_use]
    pub fn dirty_bits(&self) -> DirtyBits {
        self.passes.dirty_bits()
    }

    #[inline]
    #[must_use]
    pub fn pipeline_descriptor(&self) -> &PipelineDescriptor {
        &self.pipeline_desc
    }

    /// Commands recorded into the open pass so far.
    #[inline]
    #[must_use]
    pub fn current_commands(&self) -> Option<&CommandBuffer> {
        self.passes.current_commands()
    }

    #[inline]
    #[must_use]
    pub fn default_framebuffer(&self) -> FramebufferHandle {
        self.default_framebuffer
    }

    #[must_use]
    pub fn program(&self, program: ProgramHandle) -> Option<&ProgramExecutable> {
        self.programs.get(program)
    }

    #[must_use]
    pub fn texture(&self, texture: TextureHandle) -> Option<&Texture> {
        self.textures.get(texture)
    }

    #[must_use]
    pub fn framebuffer(&self, framebuffer: FramebufferHandle) -> Option<&Framebuffer> {
        self.framebuffers.get(framebuffer)
    }

    #[inline]
    #[must_use]
    pub fn bind_group_count(&self) -> usize {
        self.bind_groups.len()
    }

    #[inline]
    #[must_use]
    pub fn clear_pipeline_count(&self) -> usize {
        self.clear_utils.pipeline_count()
    }

    // ─── Buffers ───────────────────────────────────────────────────────────

    pub fn create_buffer(&mut self) -> BufferHandle {
        self.buffers.insert(Buffer::new())
    }

    /// (Re)specifies a buffer's whole data store.
    pub fn buffer_data(&mut self, handle: BufferHandle, size: u64, data: Option<&[u8]>) -> Result<()> {
        let buffer = self.buffers.get_mut(handle).ok_or_else(|| unknown_handle("buffer"))?;
        let old = buffer.backing();
        if size > self.settings.max_buffer_size {
            return Err(BridgeError::InvalidOperation(format!(
                "buffer size {size} exceeds the maximum {}",
                self.settings.max_buffer_size
            )));
        }
        let reallocated = buffer.buffer_data(&mut self.passes, size, data)?;
        if reallocated && let Some(old) = old {
            release_bind_groups_for_buffer(&mut self.passes, &mut self.bind_groups, old);
        }
        self.on_buffer_contents_changed(handle);
        Ok(())
    }

    pub fn buffer_sub_data(&mut self, handle: BufferHandle, offset: u64, data: &[u8]) -> Result<()> {
        let buffer = self.buffers.get_mut(handle).ok_or_else(|| unknown_handle("buffer"))?;
        buffer.buffer_sub_data(&mut self.passes, offset, data)?;
        self.on_buffer_contents_changed(handle);
        Ok(())
    }

    /// Reads a buffer range back to the host.
    pub fn get_buffer_sub_data(&mut self, handle: BufferHandle, offset: u64, size: u64) -> Result<Vec<u8>> {
        let buffer = self.buffers.get(handle).ok_or_else(|| unknown_handle("buffer"))?;
        buffer.read(&mut self.passes, offset, size)
    }

    pub fn delete_buffer(&mut self, handle: BufferHandle) {
        let Some(mut buffer) = self.buffers.remove(handle) else {
            return;
        };
        if let Some(backing) = buffer.backing() {
            release_bind_groups_for_buffer(&mut self.passes, &mut self.bind_groups, backing);
        }
        buffer.destroy(&mut self.passes);
        self.on_buffer_contents_changed(handle);
    }

    /// Streamed copies of `buffer` are stale and in-place bindings may point
    /// at a released backing buffer.
    fn on_buffer_contents_changed(&mut self, handle: BufferHandle) {
        let current = self.current_vertex_array_handle();
        for (va_handle, vertex_array) in &mut self.vertex_arrays {
            if vertex_array.references(handle) {
                vertex_array.mark_buffer_dirty(handle);
                if va_handle == current {
                    self.passes.mark_dirty(DirtyBits::VERTEX_BUFFERS | DirtyBits::INDEX_BUFFER);
                }
            }
        }
    }

    // ─── Textures & samplers ───────────────────────────────────────────────

    pub fn create_texture(&mut self) -> TextureHandle {
        self.textures.insert(Texture::new())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn tex_image_2d(
        &mut self,
        handle: TextureHandle,
        level: u32,
        format: ImageFormat,
        width: u32,
        height: u32,
        data: Option<&[u8]>,
        unpack: PixelUnpackState,
    ) -> Result<()> {
        let texture = self.textures.get_mut(handle).ok_or_else(|| unknown_handle("texture"))?;
        let dropped = texture.tex_image_2d(&mut self.passes, level, format, width, height, data, unpack)?;
        self.on_texture_changed(handle, dropped)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn tex_sub_image_2d(
        &mut self,
        handle: TextureHandle,
        level: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        format: ImageFormat,
        data: &[u8],
        unpack: PixelUnpackState,
    ) -> Result<()> {
        let texture = self.textures.get_mut(handle).ok_or_else(|| unknown_handle("texture"))?;
        texture.tex_sub_image_2d(&mut self.passes, level, x, y, width, height, format, data, unpack)?;
        self.on_texture_changed(handle, false)
    }

    pub fn set_texture_levels(&mut self, handle: TextureHandle, base_level: u32, max_level: u32) -> Result<()> {
        let texture = self.textures.get_mut(handle).ok_or_else(|| unknown_handle("texture"))?;
        let dropped = texture.set_texture_levels(&mut self.passes, base_level, max_level)?;
        self.on_texture_changed(handle, dropped)
    }

    pub fn set_texture_sampler_state(&mut self, handle: TextureHandle, state: SamplerState) -> Result<()> {
        let texture = self.textures.get_mut(handle).ok_or_else(|| unknown_handle("texture"))?;
        texture.set_sampler_state(state);
        if self.state.units_bound_to(handle).next().is_some() {
            self.passes.mark_dirty(DirtyBits::BIND_GROUPS);
        }
        Ok(())
    }

    pub fn delete_texture(&mut self, handle: TextureHandle) -> Result<()> {
        let Some(mut texture) = self.textures.remove(handle) else {
            return Ok(());
        };
        texture.destroy(&mut self.passes);
        let views = texture.take_released_views();
        release_bind_groups_for_views(&mut self.passes, &mut self.bind_groups, views);

        let units: SmallVec<[usize; 4]> = self.state.units_bound_to(handle).collect();
        for unit in units {
            self.state.bind_texture(unit, None);
        }
        self.sampled.retain(|(texture, _)| *texture != handle);
        let draw_framebuffer = self.state.draw_framebuffer();
        for (fb_handle, framebuffer) in &mut self.framebuffers {
            if framebuffer.references(handle) {
                framebuffer.detach_texture(handle);
                if fb_handle == draw_framebuffer {
                    self.passes.end_pass(ClosureReason::FramebufferInternalChange)?;
                    self.state.mark_dirty(StateDirtyBits::DRAW_FRAMEBUFFER_BINDING);
                }
            }
        }
        Ok(())
    }

    /// Drops bind groups over released views and closes a pass that
    /// renders into the texture, so its next use sees the new contents.
    fn on_texture_changed(&mut self, handle: TextureHandle, storage_dropped: bool) -> Result<()> {
        if let Some(texture) = self.textures.get_mut(handle) {
            let views = texture.take_released_views();
            release_bind_groups_for_views(&mut self.passes, &mut self.bind_groups, views);
        }
        if storage_dropped && self.state.units_bound_to(handle).next().is_some() {
            self.passes.mark_dirty(DirtyBits::BIND_GROUPS);
        }
        let draw_framebuffer = self.state.draw_framebuffer();
        if self.framebuffers.get(draw_framebuffer).is_some_and(|fb| fb.references(handle)) {
            self.passes.end_pass(ClosureReason::FramebufferInternalChange)?;
            // Attachment formats may have changed with the definition.
            self.state.mark_dirty(StateDirtyBits::DRAW_FRAMEBUFFER_BINDING);
        }
        Ok(())
    }

    pub fn create_sampler(&mut self, state: SamplerState) -> SamplerHandle {
        self.samplers.insert(state)
    }

    pub fn set_sampler_state(&mut self, handle: SamplerHandle, state: SamplerState) -> Result<()> {
        let sampler = self.samplers.get_mut(handle).ok_or_else(|| unknown_handle("sampler"))?;
        *sampler = state;
        self.passes.mark_dirty(DirtyBits::BIND_GROUPS);
        Ok(())
    }

    pub fn delete_sampler(&mut self, handle: SamplerHandle) {
        if self.samplers.remove(handle).is_none() {
            return;
        }
        for unit in 0..MAX_TEXTURE_UNITS {
            if self.state.sampler(unit) == Some(handle) {
                self.state.bind_sampler(unit, None);
            }
        }
    }

    // ─── Framebuffers ──────────────────────────────────────────────────────

    pub fn create_framebuffer(&mut self) -> FramebufferHandle {
        self.framebuffers.insert(Framebuffer::new())
    }

    /// Attaches `level` of `texture` as color attachment `index`, or
    /// detaches it.
    pub fn framebuffer_texture(
        &mut self,
        handle: FramebufferHandle,
        index: usize,
        target: Option<(TextureHandle, u32)>,
    ) -> Result<()> {
        if handle == self.default_framebuffer {
            return Err(BridgeError::InvalidOperation("the default framebuffer has fixed attachments".to_string()));
        }
        if index >= self.settings.color_attachment_count() {
            return Err(BridgeError::InvalidOperation(format!("color attachment {index} out of range")));
        }
        if let Some((texture, _)) = target
            && !self.textures.contains_key(texture)
        {
            return Err(unknown_handle("texture"));
        }
        let framebuffer = self.framebuffers.get_mut(handle).ok_or_else(|| unknown_handle("framebuffer"))?;
        framebuffer.attach_color(index, target.map(|(texture, level)| (texture, level, 0)))?;
        self.on_framebuffer_changed(handle)
    }

    pub fn framebuffer_depth_stencil(
        &mut self,
        handle: FramebufferHandle,
        target: Option<(TextureHandle, u32)>,
    ) -> Result<()> {
        if handle == self.default_framebuffer {
            return Err(BridgeError::InvalidOperation("the default framebuffer has fixed attachments".to_string()));
        }
        if let Some((texture, _)) = target
            && !self.textures.contains_key(texture)
        {
            return Err(unknown_handle("texture"));
        }
        let framebuffer = self.framebuffers.get_mut(handle).ok_or_else(|| unknown_handle("framebuffer"))?;
        framebuffer.attach_depth_stencil(target.map(|(texture, level)| (texture, level, 0)));
        self.on_framebuffer_changed(handle)
    }

    fn on_framebuffer_changed(&mut self, handle: FramebufferHandle) -> Result<()> {
        if handle == self.state.draw_framebuffer() {
            self.passes.end_pass(ClosureReason::FramebufferInternalChange)?;
            self.state.mark_dirty(StateDirtyBits::DRAW_FRAMEBUFFER_BINDING);
        }
        Ok(())
    }

    pub fn delete_framebuffer(&mut self, handle: FramebufferHandle) -> Result<()> {
        if handle == self.default_framebuffer {
            return Err(BridgeError::InvalidOperation("the default framebuffer cannot be deleted".to_string()));
        }
        let Some(mut framebuffer) = self.framebuffers.remove(handle) else {
            return Ok(());
        };
        if self.state.draw_framebuffer() == handle {
            self.passes.end_pass(ClosureReason::FramebufferBindingChange)?;
            self.state.bind_draw_framebuffer(self.default_framebuffer);
        }
        if self.state.read_framebuffer() == handle {
            self.state.bind_read_framebuffer(self.default_framebuffer);
        }
        framebuffer.destroy(&mut self.passes);
        Ok(())
    }

    // ─── Vertex arrays ─────────────────────────────────────────────────────

    pub fn create_vertex_array(&mut self) -> VertexArrayHandle {
        self.vertex_arrays.insert(VertexArray::new())
    }

    pub fn delete_vertex_array(&mut self, handle: VertexArrayHandle) {
        if handle == self.default_vertex_array {
            return;
        }
        let Some(mut vertex_array) = self.vertex_arrays.remove(handle) else {
            return;
        };
        if self.state.vertex_array() == Some(handle) {
            self.state.bind_vertex_array(None);
        }
        vertex_array.destroy(&mut self.passes);
    }

    fn current_vertex_array_handle(&self) -> VertexArrayHandle {
        self.state.vertex_array().unwrap_or(self.default_vertex_array)
    }

    fn current_vertex_array_mut(&mut self) -> Result<&mut VertexArray> {
        let handle = self.current_vertex_array_handle();
        self.vertex_arrays.get_mut(handle).ok_or_else(|| unknown_handle("vertex array"))
    }

    fn check_attribute_location(&self, location: usize) -> Result<()> {
        if location >= self.settings.vertex_attribute_count() {
            return Err(BridgeError::InvalidOperation(format!("vertex attribute {location} out of range")));
        }
        Ok(())
    }

    /// Points attribute `location` of the bound vertex array at `source`.
    pub fn vertex_attrib_pointer(
        &mut self,
        location: usize,
        format: VertexAttribFormat,
        stride: u32,
        offset: u64,
        source: AttribSource,
    ) -> Result<()> {
        self.check_attribute_location(location)?;
        if let AttribSource::Buffer(buffer) = &source
            && !self.buffers.contains_key(*buffer)
        {
            return Err(unknown_handle("buffer"));
        }
        self.current_vertex_array_mut()?
            .set_attribute_pointer(location, format, stride, offset, Some(source))?;
        self.passes.mark_dirty(DirtyBits::VERTEX_BUFFERS);
        Ok(())
    }

    pub fn enable_vertex_attrib_array(&mut self, location: usize, enabled: bool) -> Result<()> {
        self.check_attribute_location(location)?;
        self.current_vertex_array_mut()?.set_attribute_enabled(location, enabled)?;
        self.passes.mark_dirty(DirtyBits::VERTEX_BUFFERS);
        Ok(())
    }

    pub fn vertex_attrib_divisor(&mut self, location: usize, divisor: u32) -> Result<()> {
        self.check_attribute_location(location)?;
        self.current_vertex_array_mut()?.set_attribute_divisor(location, divisor)?;
        self.passes.mark_dirty(DirtyBits::VERTEX_BUFFERS);
        Ok(())
    }

    /// Value read by `location` while its array is disabled.
    pub fn vertex_attrib_4f(&mut self, location: usize, value: Vec4) -> Result<()> {
        self.check_attribute_location(location)?;
        self.generic_attributes[location] = value;
        Ok(())
    }

    pub fn bind_element_buffer(&mut self, buffer: Option<BufferHandle>) -> Result<()> {
        if let Some(buffer) = buffer
            && !self.buffers.contains_key(buffer)
        {
            return Err(unknown_handle("buffer"));
        }
        self.current_vertex_array_mut()?.bind_element_buffer(buffer);
        self.passes.mark_dirty(DirtyBits::INDEX_BUFFER);
        Ok(())
    }

    // ─── Programs ──────────────────────────────────────────────────────────

    pub fn create_program(&mut self, desc: &ProgramDesc) -> Result<ProgramHandle> {
        if desc.active_attributes.iter().any(|location| location >= self.settings.vertex_attribute_count()) {
            return Err(BridgeError::InvalidOperation("program reads an out-of-range vertex attribute".to_string()));
        }
        if desc.samplers.iter().any(|s| s.unit as usize >= MAX_TEXTURE_UNITS) {
            return Err(BridgeError::InvalidOperation("program samples an out-of-range texture unit".to_string()));
        }
        let executable = ProgramExecutable::link(
            self.passes.backend_mut(),
            desc,
            self.driver_uniforms_layout,
            u64::from(self.settings.min_uniform_buffer_offset_alignment),
        )?;
        Ok(self.programs.insert(executable))
    }

    /// Writes loose uniform bytes of `stage` at `offset`.
    pub fn set_uniform(&mut self, handle: ProgramHandle, stage: ShaderStage, offset: usize, bytes: &[u8]) -> Result<()> {
        let program = self.programs.get_mut(handle).ok_or_else(|| unknown_handle("program"))?;
        if !program.set_uniform(stage, offset, bytes) {
            return Err(BridgeError::InvalidOperation(format!(
                "uniform write of {} bytes at {offset} is outside the {stage:?} block",
                bytes.len()
            )));
        }
        if self.state.program() == Some(handle) {
            self.passes.mark_dirty(DirtyBits::BIND_GROUPS);
        }
        Ok(())
    }

    pub fn delete_program(&mut self, handle: ProgramHandle) {
        let Some(mut program) = self.programs.remove(handle) else {
            return;
        };
        if self.state.program() == Some(handle) {
            self.state.use_program(None);
            self.current_pipeline = None;
        }
        program.destroy(&mut self.passes, &mut self.bind_groups);
    }

    fn current_program(&self) -> Result<ProgramHandle> {
        let handle = self
            .state
            .program()
            .ok_or_else(|| BridgeError::InvalidOperation("draw without a program".to_string()))?;
        if !self.programs.contains_key(handle) {
            return Err(BridgeError::InternalConsistency("bound program was deleted".to_string()));
        }
        Ok(handle)
    }

    // ─── Frontend state translation ────────────────────────────────────────

    /// Restores every bit taken during `f` when it fails.
    fn with_rollback<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let frontend = self.state.dirty_bits();
        let backend = self.passes.dirty_bits();
        let result = f(self);
        if result.is_err() {
            self.state.mark_dirty(frontend);
            self.passes.mark_dirty(backend);
        }
        result
    }

    fn draw_framebuffer_geometry(&self) -> Result<(Rect, bool)> {
        let framebuffer = self
            .framebuffers
            .get(self.state.draw_framebuffer())
            .ok_or_else(|| BridgeError::InternalConsistency("bound draw framebuffer was deleted".to_string()))?;
        Ok((framebuffer.render_area(&self.textures), framebuffer.flip_y()))
    }

    /// Translates frontend change bits into descriptor edits and backend
    /// dirty bits. Bits are handled lowest first; a bit may raise later
    /// ones.
    fn sync_state(&mut self) -> Result<()> {
        let mut pending = self.state.take_dirty_bits().bits();
        let mut backend = DirtyBits::empty();
        let mut desc_changed = false;

        while pending != 0 {
            let low = pending & pending.wrapping_neg();
            pending &= !low;
            let bit = StateDirtyBits::from_bits_retain(low);
            match bit {
                StateDirtyBits::DRAW_FRAMEBUFFER_BINDING => {
                    self.passes.end_pass(ClosureReason::FramebufferBindingChange)?;
                    desc_changed |= self.sync_attachment_formats()?;
                    backend |= DirtyBits::RENDER_PASS | DirtyBits::DRIVER_UNIFORMS;
                    // Winding follows the framebuffer's orientation.
                    pending |= StateDirtyBits::FRONT_FACE.bits();
                }
                StateDirtyBits::READ_FRAMEBUFFER_BINDING
                | StateDirtyBits::PRIMITIVE_RESTART_ENABLED
                | StateDirtyBits::CLEAR_COLOR
                | StateDirtyBits::CLEAR_DEPTH
                | StateDirtyBits::CLEAR_STENCIL => {}
                StateDirtyBits::SCISSOR_TEST_ENABLED | StateDirtyBits::SCISSOR => backend |= DirtyBits::SCISSOR,
                StateDirtyBits::VIEWPORT => backend |= DirtyBits::VIEWPORT,
                StateDirtyBits::DEPTH_RANGE => backend |= DirtyBits::VIEWPORT | DirtyBits::DRIVER_UNIFORMS,
                StateDirtyBits::BLEND_ENABLED | StateDirtyBits::BLEND_FUNCS | StateDirtyBits::BLEND_EQUATIONS => {
                    desc_changed |= self.sync_blend()?;
                }
                StateDirtyBits::BLEND_COLOR => backend |= DirtyBits::BLEND_CONSTANT,
                StateDirtyBits::COLOR_MASK => {
                    for index in 0..MAX_DRAW_BUFFERS {
                        let mask = conversions::color_write_mask(self.state.blend_target(index).color_mask);
                        desc_changed |= self.pipeline_desc.set_color_write_mask(index, mask);
                    }
                }
                StateDirtyBits::SAMPLE_ALPHA_TO_COVERAGE_ENABLED | StateDirtyBits::CLIP_CONTROL => {
                    backend |= DirtyBits::DRIVER_UNIFORMS;
                }
                StateDirtyBits::DEPTH_TEST_ENABLED => {
                    pending |= (StateDirtyBits::DEPTH_FUNC | StateDirtyBits::DEPTH_MASK).bits();
                }
                StateDirtyBits::DEPTH_FUNC => {
                    let compare = conversions::compare_function(self.state.depth_func(), self.state.is_depth_test_enabled());
                    desc_changed |= self.pipeline_desc.set_depth_compare(compare);
                }
                StateDirtyBits::DEPTH_MASK => {
                    let write = self.state.is_depth_test_enabled() && self.state.depth_mask();
                    desc_changed |= self.pipeline_desc.set_depth_write_enabled(write);
                }
                StateDirtyBits::STENCIL_TEST_ENABLED => {
                    pending |= (StateDirtyBits::STENCIL_FUNCS_FRONT
                        | StateDirtyBits::STENCIL_FUNCS_BACK
                        | StateDirtyBits::STENCIL_OPS_FRONT
                        | StateDirtyBits::STENCIL_OPS_BACK)
                        .bits();
                }
                StateDirtyBits::STENCIL_FUNCS_FRONT
                | StateDirtyBits::STENCIL_FUNCS_BACK
                | StateDirtyBits::STENCIL_OPS_FRONT
                | StateDirtyBits::STENCIL_OPS_BACK
                | StateDirtyBits::STENCIL_WRITEMASK_FRONT
                | StateDirtyBits::STENCIL_WRITEMASK_BACK => {
                    desc_changed |= self.sync_stencil();
                    if bit == StateDirtyBits::STENCIL_FUNCS_FRONT {
                        // The reference value is dynamic pass state.
                        backend |= DirtyBits::RENDER_PIPELINE_BINDING;
                    }
                }
                StateDirtyBits::CULL_FACE_ENABLED | StateDirtyBits::CULL_FACE => {
                    let cull = conversions::cull_mode(self.state.is_cull_face_enabled(), self.state.cull_face())?;
                    desc_changed |= self.pipeline_desc.set_cull_mode(cull);
                }
                StateDirtyBits::FRONT_FACE => {
                    let (_, flip_y) = self.draw_framebuffer_geometry()?;
                    let mut face = conversions::front_face(self.state.front_face());
                    if !flip_y {
                        // Clip-space y is negated for these framebuffers, which mirrors the winding.
                        face = match face {
                            wgpu::FrontFace::Ccw => wgpu::FrontFace::Cw,
                            wgpu::FrontFace::Cw => wgpu::FrontFace::Ccw,
                        };
                    }
                    desc_changed |= self.pipeline_desc.set_front_face(face);
                }
                StateDirtyBits::POLYGON_OFFSET_FILL_ENABLED | StateDirtyBits::POLYGON_OFFSET => {
                    let bias = if self.state.is_polygon_offset_fill_enabled() {
                        let [factor, units] = self.state.polygon_offset();
                        DepthBiasKey { constant: units as i32, slope_scale_bits: factor.to_bits(), clamp_bits: 0 }
                    } else {
                        DepthBiasKey::default()
                    };
                    desc_changed |= self.pipeline_desc.set_depth_bias(bias);
                }
                StateDirtyBits::VERTEX_ARRAY_BINDING => {
                    backend |= DirtyBits::VERTEX_BUFFERS | DirtyBits::INDEX_BUFFER;
                }
                StateDirtyBits::PROGRAM_BINDING | StateDirtyBits::PROGRAM_EXECUTABLE => {
                    // Each executable has its own pipeline cache.
                    self.current_pipeline = None;
                    backend |= DirtyBits::RENDER_PIPELINE_DESC | DirtyBits::VERTEX_BUFFERS;
                    pending |= StateDirtyBits::TEXTURE_BINDINGS.bits();
                }
                StateDirtyBits::SAMPLER_BINDINGS | StateDirtyBits::TEXTURE_BINDINGS => {
                    backend |= DirtyBits::BIND_GROUPS;
                }
                StateDirtyBits::LOGIC_OP_ENABLED => {
                    if self.state.is_logic_op_enabled() {
                        return Err(BridgeError::Unimplemented("logic operations"));
                    }
                }
                _ => {
                    return Err(BridgeError::InternalConsistency(format!(
                        "unknown state dirty bit {low:#x}"
                    )));
                }
            }
        }

        if desc_changed {
            backend |= DirtyBits::RENDER_PIPELINE_DESC;
        }
        self.passes.mark_dirty(backend);
        Ok(())
    }

    fn sync_attachment_formats(&mut self) -> Result<bool> {
        let framebuffer = self
            .framebuffers
            .get(self.state.draw_framebuffer())
            .ok_or_else(|| BridgeError::InternalConsistency("bound draw framebuffer was deleted".to_string()))?;
        let formats = framebuffer.color_formats(&self.textures);
        let depth_stencil = framebuffer.depth_stencil_format(&self.textures).map(conversions::texture_format);
        let mut changed = false;
        for (index, format) in formats.into_iter().enumerate() {
            changed |= self.pipeline_desc.set_color_attachment_format(index, format);
        }
        changed |= self.pipeline_desc.set_depth_stencil_attachment_format(depth_stencil);
        Ok(changed)
    }

    fn sync_blend(&mut self) -> Result<bool> {
        let mut changed = false;
        for index in 0..MAX_DRAW_BUFFERS {
            let target = *self.state.blend_target(index);
            changed |= self.pipeline_desc.set_blend_enabled(index, target.enabled);
            if !target.enabled {
                continue;
            }
            let blend = BlendStateKey {
                color: BlendComponentKey {
                    src_factor: conversions::blend_factor(target.src_color)?,
                    dst_factor: conversions::blend_factor(target.dst_color)?,
                    operation: conversions::blend_operation(target.equation_color)?,
                },
                alpha: BlendComponentKey {
                    src_factor: conversions::blend_factor(target.src_alpha)?,
                    dst_factor: conversions::blend_factor(target.dst_alpha)?,
                    operation: conversions::blend_operation(target.equation_alpha)?,
                },
            };
            changed |= self.pipeline_desc.set_blend(index, blend);
        }
        Ok(changed)
    }

    fn sync_stencil(&mut self) -> bool {
        let enabled = self.state.is_stencil_test_enabled();
        let face_key = |face: &glbridge_core::state::StencilFaceState| {
            if !enabled {
                return StencilFaceKey::IGNORE;
            }
            StencilFaceKey {
                compare: conversions::compare_function(face.func, true),
                fail_op: conversions::stencil_operation(face.fail),
                depth_fail_op: conversions::stencil_operation(face.depth_fail),
                pass_op: conversions::stencil_operation(face.pass),
            }
        };
        let front = face_key(self.state.stencil_front());
        let back = face_key(self.state.stencil_back());
        let read_mask = self.state.stencil_front().value_mask & 0xFF;
        let write_mask = self.state.stencil_front().write_mask & 0xFF;

        let mut changed = self.pipeline_desc.set_stencil_front(front);
        changed |= self.pipeline_desc.set_stencil_back(back);
        changed |= self.pipeline_desc.set_stencil_read_mask(read_mask);
        changed |= self.pipeline_desc.set_stencil_write_mask(write_mask);
        changed
    }

    // ─── Dirty-bit resolution ──────────────────────────────────────────────

    /// Resolves the backend dirty bits lowest first.
    ///
    /// Bits a handler raises after itself join this walk. Bits at or before
    /// the current one (a pass closed by a handler) and deferred bits stay
    /// dirty for the next call.
    fn resolve_dirty_bits(&mut self, draw: DrawCall) -> Result<()> {
        let snapshot = self.passes.take_dirty_bits();
        let mut iter = DirtyBitsIter::new(snapshot);
        let mut carried = DirtyBits::empty();

        while let Some(bit) = iter.next() {
            log::trace!("Resolving dirty bit {}", bit.name());
            let outcome = match Self::DIRTY_BIT_HANDLERS.get(bit.index()) {
                Some(handler) => handler(self, &mut iter, draw),
                None => Err(BridgeError::InternalConsistency(format!(
                    "unknown dirty bit {:#x}",
                    bit.bits()
                ))),
            };
            let raised = self.passes.take_dirty_bits();
            match outcome {
                Ok(Resolution::Done) => {}
                Ok(Resolution::Deferred) => carried |= bit,
                Err(err) => {
                    self.passes.mark_dirty(snapshot | iter.remaining() | raised | carried | bit);
                    return Err(err);
                }
            }
            let later = raised & DirtyBits::after(bit);
            carried |= raised - later;
            iter.set_later_bits(later)?;
        }

        self.passes.mark_dirty(carried);
        Ok(())
    }

    fn handle_render_pipeline_desc(&mut self, iter: &mut DirtyBitsIter, _draw: DrawCall) -> Result<Resolution> {
        let handle = self.current_program()?;
        let program = self.programs.get_mut(handle).ok_or_else(|| unknown_handle("program"))?;
        let pipeline = program.get_pipeline(self.passes.backend_mut(), &self.pipeline_desc)?;
        if self.current_pipeline != Some(pipeline) {
            self.current_pipeline = Some(pipeline);
            iter.set_later_bits(DirtyBits::RENDER_PIPELINE_BINDING)?;
        }
        Ok(Resolution::Done)
    }

    fn handle_render_pass(&mut self, _iter: &mut DirtyBitsIter, _draw: DrawCall) -> Result<Resolution> {
        // Anything that makes an open pass stale closes it.
        if self.passes.has_active_pass() {
            return Ok(Resolution::Done);
        }
        let framebuffer = self
            .framebuffers
            .get_mut(self.state.draw_framebuffer())
            .ok_or_else(|| BridgeError::InternalConsistency("bound draw framebuffer was deleted".to_string()))?;
        framebuffer.start_render_pass(&mut self.passes, &mut self.textures)?;
        Ok(Resolution::Done)
    }

    fn handle_render_pipeline_binding(&mut self, _iter: &mut DirtyBitsIter, _draw: DrawCall) -> Result<Resolution> {
        let pipeline = self
            .current_pipeline
            .ok_or_else(|| BridgeError::InternalConsistency("pipeline binding without a pipeline".to_string()))?;
        let reference = self.state.stencil_front().reference.clamp(0, 0xFF) as u32;
        let commands = self.passes.command_buffer()?;
        commands.set_pipeline(pipeline);
        commands.set_stencil_reference(reference);
        Ok(Resolution::Done)
    }

    fn handle_viewport(&mut self, _iter: &mut DirtyBitsIter, _draw: DrawCall) -> Result<Resolution> {
        let (render_area, flip_y) = self.draw_framebuffer_geometry()?;
        let rect = Framebuffer::flip_rect(flip_y, self.state.viewport(), render_area);
        let [near, far] = self.state.depth_range();
        let viewport = Viewport {
            x: rect.x as f32,
            y: rect.y as f32,
            width: rect.width as f32,
            height: rect.height as f32,
            min_depth: near.min(far).clamp(0.0, 1.0),
            max_depth: near.max(far).clamp(0.0, 1.0),
        };
        let pass_default = Viewport {
            x: 0.0,
            y: 0.0,
            width: render_area.width as f32,
            height: render_area.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let commands = self.passes.command_buffer()?;
        if viewport == pass_default && !commands.has_set_viewport_command() {
            return Ok(Resolution::Done);
        }
        commands.set_viewport(viewport);
        Ok(Resolution::Done)
    }

    fn handle_scissor(&mut self, _iter: &mut DirtyBitsIter, _draw: DrawCall) -> Result<Resolution> {
        let (render_area, flip_y) = self.draw_framebuffer_geometry()?;
        let area = if self.state.is_scissor_test_enabled() {
            self.state.scissor().clip(&render_area).unwrap_or_default()
        } else {
            render_area
        };
        let rect = Framebuffer::flip_rect(flip_y, area, render_area);
        let scissor = if area.is_empty() {
            ScissorRect { x: 0, y: 0, width: 0, height: 0 }
        } else {
            ScissorRect {
                x: rect.x.max(0) as u32,
                y: rect.y.max(0) as u32,
                width: rect.width as u32,
                height: rect.height as u32,
            }
        };
        let commands = self.passes.command_buffer()?;
        if area == render_area && !commands.has_set_scissor_command() {
            return Ok(Resolution::Done);
        }
        commands.set_scissor_rect(scissor);
        Ok(Resolution::Done)
    }

    fn handle_blend_constant(&mut self, _iter: &mut DirtyBitsIter, _draw: DrawCall) -> Result<Resolution> {
        let color = self.state.blend_color();
        let commands = self.passes.command_buffer()?;
        if color == Vec4::ZERO && !commands.has_set_blend_constant_command() {
            return Ok(Resolution::Done);
        }
        commands.set_blend_constant(color);
        Ok(Resolution::Done)
    }

    fn handle_vertex_buffers(&mut self, _iter: &mut DirtyBitsIter, _draw: DrawCall) -> Result<Resolution> {
        let handle = self.current_program()?;
        let active = self.programs.get(handle).map(ProgramExecutable::active_attributes).unwrap_or_default();
        let vertex_array = self
            .vertex_arrays
            .get(self.current_vertex_array_handle())
            .ok_or_else(|| BridgeError::InternalConsistency("bound vertex array was deleted".to_string()))?;
        let commands = self.passes.command_buffer()?;
        for location in (0..MAX_VERTEX_ATTRIBS).filter(|&l| active.test(l)) {
            let (Some(slot), Some(binding)) =
                (self.pipeline_desc.vertex_buffer_slot(location), vertex_array.binding(location))
            else {
                return Err(BridgeError::InternalConsistency(format!(
                    "active attribute {location} has no vertex buffer"
                )));
            };
            commands.set_vertex_buffer(slot, binding.buffer, binding.offset, None);
        }
        Ok(Resolution::Done)
    }

    fn handle_index_buffer(&mut self, _iter: &mut DirtyBitsIter, draw: DrawCall) -> Result<Resolution> {
        if !draw.indexed {
            return Ok(Resolution::Deferred);
        }
        let binding = self
            .index_binding
            .ok_or_else(|| BridgeError::InternalConsistency("indexed draw without index data".to_string()))?;
        self.passes
            .command_buffer()?
            .set_index_buffer(binding.buffer, binding.format, binding.offset);
        Ok(Resolution::Done)
    }

    fn handle_driver_uniforms(&mut self, _iter: &mut DirtyBitsIter, _draw: DrawCall) -> Result<Resolution> {
        let (render_area, flip_y) = self.draw_framebuffer_geometry()?;
        let [near, far] = self.state.depth_range();
        // Images that store GL row 0 first render with clip-space y negated.
        let uniforms = DriverUniforms::new(
            (near, far),
            render_area,
            !flip_y,
            self.state.is_sample_alpha_to_coverage_enabled(),
            self.state.is_clip_control_upper_left(),
        );

        let group = match self.driver_uniform_group {
            Some(group) if self.driver_uniforms == Some(uniforms) => group,
            _ => {
                if let Some(old) = self.driver_uniform_buffer.buffer() {
                    release_bind_groups_for_buffer(&mut self.passes, &mut self.bind_groups, old);
                }
                let buffer = self.driver_uniform_buffer.init_with_data(
                    &mut self.passes,
                    wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                    uniforms.as_bytes(),
                )?;
                let group = self.bind_groups.get_or_create(
                    self.passes.backend_mut(),
                    Some("driver uniforms"),
                    self.driver_uniforms_layout,
                    &[BindGroupEntry {
                        binding: 0,
                        resource: BindingResource::Buffer { buffer, offset: 0, size: None },
                    }],
                )?;
                self.driver_uniforms = Some(uniforms);
                self.driver_uniform_group = Some(group);
                group
            }
        };
        self.passes.command_buffer()?.set_bind_group(DRIVER_UNIFORMS_GROUP, group);
        Ok(Resolution::Done)
    }

    fn handle_bind_groups(&mut self, _iter: &mut DirtyBitsIter, _draw: DrawCall) -> Result<Resolution> {
        let handle = self.current_program()?;
        let program = self.programs.get_mut(handle).ok_or_else(|| unknown_handle("program"))?;
        let uniforms = program.update_default_uniforms(&mut self.passes, &mut self.bind_groups)?;

        let mut entries: SmallVec<[BindGroupEntry; 8]> = SmallVec::new();
        for (index, binding) in program.samplers().iter().enumerate() {
            let &(texture, view) = self
                .sampled
                .get(index)
                .ok_or(BridgeError::Unimplemented("sampling an incomplete texture"))?;
            let unit = binding.unit as usize;
            let state = match self.state.sampler(unit) {
                Some(sampler) => self.samplers.get(sampler).ok_or_else(|| unknown_handle("sampler"))?,
                None => self.textures.get(texture).ok_or_else(|| unknown_handle("texture"))?.sampler_state(),
            };
            let sampler = self.sampler_cache.get_or_create(self.passes.backend_mut(), &state.to_key())?;
            let index = index as u32;
            entries.push(BindGroupEntry { binding: 2 * index, resource: BindingResource::Sampler(sampler) });
            entries.push(BindGroupEntry { binding: 2 * index + 1, resource: BindingResource::TextureView(view) });
        }
        let textures = self.bind_groups.get_or_create(
            self.passes.backend_mut(),
            Some("textures"),
            program.textures_layout(),
            &entries,
        )?;

        let commands = self.passes.command_buffer()?;
        commands.set_bind_group(DEFAULT_UNIFORMS_GROUP, uniforms);
        commands.set_bind_group(TEXTURES_GROUP, textures);
        Ok(Resolution::Done)
    }

    // ─── Draw preparation ──────────────────────────────────────────────────

    /// Allocates and flushes every texture the program samples. Runs while
    /// no pass needs to stay open.
    fn prepare_textures(&mut self, handle: ProgramHandle) -> Result<()> {
        let program = self.programs.get(handle).ok_or_else(|| unknown_handle("program"))?;
        let mut sampled: SmallVec<[(TextureHandle, TextureViewId); 8]> = SmallVec::new();
        for binding in program.samplers() {
            let texture_handle = self
                .state
                .texture(binding.unit as usize)
                .ok_or(BridgeError::Unimplemented("sampling an unbound texture unit"))?;
            let texture = self.textures.get_mut(texture_handle).ok_or_else(|| unknown_handle("texture"))?;
            let view = texture
                .prepare_for_sampling(&mut self.passes)?
                .ok_or(BridgeError::Unimplemented("sampling an incomplete texture"))?;
            let released = texture.take_released_views();
            release_bind_groups_for_views(&mut self.passes, &mut self.bind_groups, released);
            sampled.push((texture_handle, view));
        }
        if sampled != self.sampled {
            self.sampled = sampled;
            self.passes.mark_dirty(DirtyBits::BIND_GROUPS);
        }
        Ok(())
    }

    /// Streams vertices and indices, binds the resulting layout into the
    /// pipeline descriptor and records which backend bits changed.
    fn prepare_vertex_input(
        &mut self,
        program: ProgramHandle,
        range: &DrawVertexRange,
        indices: Option<IndexData>,
    ) -> Result<()> {
        let active = self
            .programs
            .get(program)
            .map(ProgramExecutable::active_attributes)
            .ok_or_else(|| unknown_handle("program"))?;
        let va_handle = self.current_vertex_array_handle();
        let vertex_array = self
            .vertex_arrays
            .get_mut(va_handle)
            .ok_or_else(|| BridgeError::InternalConsistency("bound vertex array was deleted".to_string()))?;

        let mut batch = StreamingBatch::new();
        let changed = vertex_array.prepare(
            &mut self.passes,
            &self.buffers,
            active,
            &self.generic_attributes,
            range,
            &mut batch,
        )?;

        let index_binding = match indices {
            None => None,
            Some(IndexData::Resident(binding)) => Some(binding),
            Some(IndexData::Streamed(streamed)) => {
                let size = round_up(streamed.bytes.len() as u64, 4);
                let helper = vertex_array.streamed_indices_mut();
                let buffer = match helper.buffer() {
                    Some(buffer) if helper.size() >= size => buffer,
                    _ => helper.init_buffer(
                        &mut self.passes,
                        size,
                        wgpu::BufferUsages::INDEX | wgpu::BufferUsages::COPY_DST,
                        false,
                    )?,
                };
                batch.stage(buffer, 0, streamed.bytes.len() as u64).copy_from_slice(&streamed.bytes);
                Some(IndexBinding { buffer, format: conversions::index_format(streamed.ty), offset: 0 })
            }
        };
        batch.submit(&mut self.passes, self.settings.max_buffer_size)?;

        let mut backend = DirtyBits::empty();
        if changed.any() {
            backend |= DirtyBits::VERTEX_BUFFERS;
        }
        for location in 0..MAX_VERTEX_ATTRIBS {
            let key = if active.test(location) {
                vertex_array.binding(location).map(|binding| binding.key)
            } else {
                None
            };
            if self.pipeline_desc.set_vertex_attribute(location, key) {
                // Buffer slots are packed by location.
                backend |= DirtyBits::RENDER_PIPELINE_DESC | DirtyBits::VERTEX_BUFFERS;
            }
        }
        if index_binding.is_some() && index_binding != self.index_binding {
            self.index_binding = index_binding;
            backend |= DirtyBits::INDEX_BUFFER;
        }
        self.passes.mark_dirty(backend);
        Ok(())
    }

    fn set_primitive_mode(&mut self, mode: PrimitiveMode, index_type: Option<IndexType>) {
        if self.pipeline_desc.set_primitive_mode(mode, index_type) {
            self.passes.mark_dirty(DirtyBits::RENDER_PIPELINE_DESC);
        }
    }

    // ─── Draws ─────────────────────────────────────────────────────────────

    /// Draws `count` array vertices starting at `first`.
    pub fn draw_arrays(&mut self, mode: PrimitiveMode, first: u32, count: u32, instance_count: u32) -> Result<()> {
        if mode == PrimitiveMode::TriangleFan {
            return Err(BridgeError::Unimplemented("triangle fan array draws"));
        }
        if count == 0 || instance_count == 0 {
            return Ok(());
        }
        let end = first
            .checked_add(count)
            .ok_or_else(|| BridgeError::InvalidOperation("vertex range overflows".to_string()))?;

        self.with_rollback(|ctx| {
            let program = ctx.current_program()?;
            ctx.sync_state()?;
            let range = DrawVertexRange { vertices: first..end, instance_count };

            if mode == PrimitiveMode::LineLoop {
                let indices = line_loop_indices(first, count);
                let (ty, index_count) = (indices.ty, indices.count);
                ctx.prepare_vertex_input(program, &range, Some(IndexData::Streamed(indices)))?;
                ctx.prepare_textures(program)?;
                ctx.set_primitive_mode(PrimitiveMode::LineStrip, Some(ty));
                ctx.resolve_dirty_bits(DrawCall { indexed: true })?;
                ctx.passes.command_buffer()?.draw_indexed(index_count, instance_count, 0, 0, 0);
                return Ok(());
            }

            ctx.prepare_vertex_input(program, &range, None)?;
            ctx.prepare_textures(program)?;
            ctx.set_primitive_mode(mode, None);
            ctx.resolve_dirty_bits(DrawCall { indexed: false })?;
            ctx.passes.command_buffer()?.draw(count, instance_count, first, 0);
            Ok(())
        })
    }

    /// Draws `count` indices of type `ty`, adding `base_vertex` to each.
    pub fn draw_elements(
        &mut self,
        mode: PrimitiveMode,
        count: u32,
        ty: IndexType,
        source: IndexSource<'_>,
        instance_count: u32,
        base_vertex: i32,
    ) -> Result<()> {
        if mode == PrimitiveMode::TriangleFan {
            return Err(BridgeError::Unimplemented("triangle fan element draws"));
        }
        if count == 0 || instance_count == 0 {
            return Ok(());
        }
        self.with_rollback(|ctx| {
            let program = ctx.current_program()?;
            ctx.sync_state()?;
            ctx.draw_elements_synced(program, mode, count, ty, source, instance_count, base_vertex)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn draw_elements_synced(
        &mut self,
        program: ProgramHandle,
        mode: PrimitiveMode,
        count: u32,
        ty: IndexType,
        source: IndexSource<'_>,
        instance_count: u32,
        base_vertex: i32,
    ) -> Result<()> {
        let byte_len = u64::from(count) * ty.size() as u64;
        let primitive_restart = self.state.is_primitive_restart_enabled();
        let active = self
            .programs
            .get(program)
            .map(ProgramExecutable::active_attributes)
            .ok_or_else(|| unknown_handle("program"))?;
        let vertex_array = self
            .vertex_arrays
            .get(self.current_vertex_array_handle())
            .ok_or_else(|| BridgeError::InternalConsistency("bound vertex array was deleted".to_string()))?;
        let needs_range = vertex_array.needs_vertex_range(active, &self.buffers);

        // Indices the backend can read in place from the element buffer.
        let resident = match source {
            IndexSource::Offset(offset) => {
                let handle = vertex_array
                    .element_buffer()
                    .ok_or_else(|| BridgeError::InvalidOperation("indexed draw without an element buffer".to_string()))?;
                let buffer = self.buffers.get(handle).ok_or_else(|| unknown_handle("buffer"))?;
                let end = offset
                    .checked_add(byte_len)
                    .ok_or_else(|| BridgeError::InvalidOperation(format!("index range at {offset} overflows")))?;
                if end > buffer.size() {
                    return Err(BridgeError::InvalidOperation(format!(
                        "index range {offset}..{end} exceeds the element buffer"
                    )));
                }
                let backing = buffer
                    .backing()
                    .ok_or_else(|| BridgeError::InvalidOperation("element buffer has no data store".to_string()))?;
                let in_place = ty != IndexType::U8
                    && mode != PrimitiveMode::LineLoop
                    && offset % ty.size() as u64 == 0;
                Some((handle, offset, in_place.then_some(backing)))
            }
            IndexSource::Client(_) => None,
        };

        let needs_bytes = needs_range || !matches!(resident, Some((_, _, Some(_))));
        let bytes: Cow<'_, [u8]> = match (source, resident) {
            (IndexSource::Client(bytes), _) => {
                if (bytes.len() as u64) < byte_len {
                    return Err(BridgeError::InvalidOperation("client index data is too short".to_string()));
                }
                Cow::Borrowed(bytes)
            }
            (IndexSource::Offset(_), Some((handle, offset, _))) if needs_bytes => {
                let buffer = self.buffers.get(handle).ok_or_else(|| unknown_handle("buffer"))?;
                Cow::Owned(buffer.read(&mut self.passes, offset, byte_len)?)
            }
            _ => Cow::Borrowed(&[]),
        };

        let vertices = if needs_range {
            let Some((low, high)) = index_range(ty, &bytes, count as usize, primitive_restart) else {
                // Only restart indices; nothing is drawn.
                return Ok(());
            };
            let shift = |v: u32| (i64::from(v) + i64::from(base_vertex)).clamp(0, i64::from(u32::MAX)) as u32;
            shift(low)..shift(high)
        } else {
            0..0
        };
        let range = DrawVertexRange { vertices, instance_count };

        let indices = if mode == PrimitiveMode::LineLoop {
            IndexData::Streamed(line_loop_from_indices(ty, &bytes, count as usize))
        } else if ty == IndexType::U8 {
            IndexData::Streamed(widen_u8_indices(&bytes, count as usize, primitive_restart))
        } else if let Some((_, offset, Some(buffer))) = resident {
            IndexData::Resident(IndexBinding { buffer, format: conversions::index_format(ty), offset })
        } else {
            IndexData::Streamed(StreamedIndices { ty, bytes: bytes[..byte_len as usize].to_vec(), count })
        };
        let (bound_type, index_count) = match &indices {
            IndexData::Streamed(streamed) => (streamed.ty, streamed.count),
            IndexData::Resident(_) => (ty, count),
        };

        self.prepare_vertex_input(program, &range, Some(indices))?;
        self.prepare_textures(program)?;
        let mode = if mode == PrimitiveMode::LineLoop { PrimitiveMode::LineStrip } else { mode };
        self.set_primitive_mode(mode, Some(bound_type));
        self.resolve_dirty_bits(DrawCall { indexed: true })?;
        self.passes
            .command_buffer()?
            .draw_indexed(index_count, instance_count, 0, base_vertex, 0);
        Ok(())
    }

    pub fn draw_arrays_indirect(&mut self, _mode: PrimitiveMode, _offset: u64) -> Result<()> {
        Err(BridgeError::Unimplemented("indirect draws"))
    }

    pub fn multi_draw_arrays(&mut self, _mode: PrimitiveMode, _firsts: &[u32], _counts: &[u32]) -> Result<()> {
        Err(BridgeError::Unimplemented("multi-draw"))
    }

    // ─── Clears, reads & copies ────────────────────────────────────────────

    /// Clears the buffers in `mask` of the draw framebuffer, honoring the
    /// color masks and the scissor test.
    pub fn clear(&mut self, mask: ClearMask) -> Result<()> {
        self.with_rollback(|ctx| {
            ctx.sync_state()?;
            let request = ClearRequest {
                mask,
                color: ctx.state.clear_color(),
                depth: ctx.state.clear_depth().clamp(0.0, 1.0),
                stencil: (ctx.state.clear_stencil() & 0xFF) as u32,
                color_masks: std::array::from_fn(|i| ctx.state.blend_target(i).color_mask),
                depth_write: ctx.state.depth_mask(),
                stencil_write_mask: ctx.state.stencil_front().write_mask & 0xFF,
                scissor: ctx.state.is_scissor_test_enabled().then(|| ctx.state.scissor()),
            };
            let framebuffer = ctx
                .framebuffers
                .get_mut(ctx.state.draw_framebuffer())
                .ok_or_else(|| BridgeError::InternalConsistency("bound draw framebuffer was deleted".to_string()))?;
            if let Some(drawn) = framebuffer.clear(&mut ctx.passes, &mut ctx.textures, &request)? {
                ctx.clear_utils
                    .clear_with_draw(&mut ctx.passes, &mut ctx.bind_groups, framebuffer, &mut ctx.textures, &drawn)?;
            }
            Ok(())
        })
    }

    /// Reads `area` of the read framebuffer's first color attachment, rows
    /// bottom-up. `format` must be the attachment's storage format.
    pub fn read_pixels(&mut self, area: Rect, format: ImageFormat) -> Result<Vec<u8>> {
        self.with_rollback(|ctx| {
            ctx.sync_state()?;
            let framebuffer = ctx
                .framebuffers
                .get_mut(ctx.state.read_framebuffer())
                .ok_or_else(|| BridgeError::InternalConsistency("bound read framebuffer was deleted".to_string()))?;
            let stored = framebuffer
                .color_image(&ctx.textures, 0)
                .map(|(image, _, _)| image.intended_format().actual())
                .ok_or_else(|| BridgeError::InvalidOperation("read framebuffer has no color attachment".to_string()))?;
            if stored != format.actual() {
                return Err(BridgeError::Unimplemented("read-back with format conversion"));
            }
            framebuffer.read_pixels(&mut ctx.passes, &mut ctx.textures, 0, area)
        })
    }

    /// Copies `src` of the read framebuffer to `dst` of the draw
    /// framebuffer. Only unscaled, unflipped, unscissored color copies
    /// between matching formats are supported.
    pub fn blit_framebuffer(&mut self, src: Rect, dst: Rect, mask: ClearMask) -> Result<()> {
        if mask != ClearMask::COLOR {
            return Err(BridgeError::Unimplemented("depth/stencil blits"));
        }
        if src.width != dst.width || src.height != dst.height {
            return Err(BridgeError::Unimplemented("scaled blits"));
        }
        if self.state.is_scissor_test_enabled() {
            return Err(BridgeError::Unimplemented("scissored blits"));
        }
        let (read, draw) = (self.state.read_framebuffer(), self.state.draw_framebuffer());
        if read == draw {
            return Err(BridgeError::Unimplemented("blits within one framebuffer"));
        }

        self.with_rollback(|ctx| {
            ctx.sync_state()?;
            for handle in [read, draw] {
                ctx.framebuffers
                    .get_mut(handle)
                    .ok_or_else(|| unknown_handle("framebuffer"))?
                    .flush_color(&mut ctx.passes, &mut ctx.textures, 0)?;
            }
            let read_fb = ctx.framebuffers.get(read).ok_or_else(|| unknown_handle("framebuffer"))?;
            let draw_fb = ctx.framebuffers.get(draw).ok_or_else(|| unknown_handle("framebuffer"))?;
            if read_fb.flip_y() != draw_fb.flip_y() {
                return Err(BridgeError::Unimplemented("flipped blits"));
            }
            let src_bounds = read_fb.render_area(&ctx.textures);
            let dst_bounds = draw_fb.render_area(&ctx.textures);
            let src_area = Framebuffer::flip_rect(read_fb.flip_y(), src, src_bounds);
            let dst_area = Framebuffer::flip_rect(draw_fb.flip_y(), dst, dst_bounds);
            if src_area.clip(&src_bounds) != Some(src_area) || dst_area.clip(&dst_bounds) != Some(dst_area) {
                return Err(BridgeError::InvalidOperation("blit rectangle outside the framebuffer".to_string()));
            }
            let (src_image, src_level, src_layer) = read_fb
                .color_image(&ctx.textures, 0)
                .ok_or_else(|| BridgeError::InvalidOperation("read framebuffer has no color attachment".to_string()))?;
            let (dst_image, dst_level, dst_layer) = draw_fb
                .color_image(&ctx.textures, 0)
                .ok_or_else(|| BridgeError::InvalidOperation("draw framebuffer has no color attachment".to_string()))?;
            if src_image.intended_format() != dst_image.intended_format() {
                return Err(BridgeError::Unimplemented("format-converting blits"));
            }
            copy_image(
                &mut ctx.passes,
                src_image,
                src_level,
                [src_area.x as u32, src_area.y as u32, src_layer],
                dst_image,
                dst_level,
                [dst_area.x as u32, dst_area.y as u32, dst_layer],
                Extents::new(src_area.width as u32, src_area.height as u32, 1),
            )
        })
    }

    // ─── Submission ────────────────────────────────────────────────────────

    /// Closes the pass and submits. Never waits for the device.
    pub fn flush(&mut self) -> Result<()> {
        self.passes.flush(ClosureReason::Flush)
    }

    /// Submits everything; waits for completion when configured to.
    pub fn finish(&mut self) -> Result<()> {
        self.passes.finish(self.settings.wait_for_gpu_on_finish)
    }

    /// Submits the frame and presents the default framebuffer.
    pub fn swap_buffers(&mut self) -> Result<()> {
        let framebuffer = self
            .framebuffers
            .get_mut(self.default_framebuffer)
            .ok_or_else(|| BridgeError::InternalConsistency("default framebuffer is missing".to_string()))?;
        let texture = framebuffer.present_texture(&mut self.passes, &mut self.textures)?;
        self.passes.flush(ClosureReason::SwapBuffers)?;
        self.passes.backend_mut().present(texture)
    }

    /// Releases every backend object the context owns.
    pub fn destroy(&mut self) -> Result<()> {
        self.passes.end_pass(ClosureReason::Finish)?;
        for (_, mut program) in self.programs.drain() {
            program.destroy(&mut self.passes, &mut self.bind_groups);
        }
        for (_, mut vertex_array) in self.vertex_arrays.drain() {
            vertex_array.destroy(&mut self.passes);
        }
        for (_, mut framebuffer) in self.framebuffers.drain() {
            framebuffer.destroy(&mut self.passes);
        }
        for (_, mut texture) in self.textures.drain() {
            texture.destroy(&mut self.passes);
        }
        for (_, mut buffer) in self.buffers.drain() {
            buffer.destroy(&mut self.passes);
        }
        self.clear_utils.destroy(&mut self.passes, &mut self.bind_groups);
        self.driver_uniform_buffer.release(&mut self.passes);
        self.passes.finish(self.settings.wait_for_gpu_on_finish)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::RecordingBackend;

    fn context() -> Context<RecordingBackend> {
        let _ = env_logger::builder().is_test(true).try_init();
        let settings = ContextSettings { default_framebuffer_size: [8, 8], ..ContextSettings::default() };
        Context::new(RecordingBackend::new(), settings).unwrap()
    }

    fn program(ctx: &mut Context<RecordingBackend>) -> ProgramHandle {
        let desc = ProgramDesc {
            vertex_wgsl: "@vertex fn vs_main() -> @builtin(position) vec4<f32> { return vec4<f32>(); }".to_string(),
            ..ProgramDesc::default()
        };
        let program = ctx.create_program(&desc).unwrap();
        ctx.state_mut().use_program(Some(program));
        program
    }

    #[test]
    fn draw_without_program_is_rejected() {
        let mut ctx = context();
        let err = ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidOperation(_)));
    }

    #[test]
    fn index_bit_survives_array_draws() {
        let mut ctx = context();
        program(&mut ctx);
        ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap();
        assert_eq!(ctx.dirty_bits(), DirtyBits::INDEX_BUFFER);
        assert!(ctx.render_passes().has_active_pass());
    }

    #[test]
    fn unknown_backend_bit_is_an_internal_error() {
        let mut ctx = context();
        program(&mut ctx);
        ctx.render_passes_mut().mark_dirty(DirtyBits::from_bits_retain(1 << 20));
        let err = ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap_err();
        assert!(err.is_internal());
        assert!(ctx.dirty_bits().contains(DirtyBits::RENDER_PASS));
    }

    #[test]
    fn unknown_state_bit_is_an_internal_error() {
        let mut ctx = context();
        program(&mut ctx);
        ctx.state_mut().mark_dirty(StateDirtyBits::from_bits_retain(1 << 60));
        let err = ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap_err();
        assert!(err.is_internal());
        assert_ne!(ctx.state().dirty_bits().bits() & (1 << 60), 0);
    }

    #[test]
    fn depth_test_enable_reevaluates_compare() {
        let mut ctx = context();
        program(&mut ctx);
        ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap();
        assert_eq!(ctx.pipeline_descriptor().depth_stencil.depth_compare, wgpu::CompareFunction::Always);
        ctx.state_mut().set_depth_test(true);
        ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap();
        assert_eq!(ctx.pipeline_descriptor().depth_stencil.depth_compare, wgpu::CompareFunction::Less);
    }

    #[test]
    fn logic_op_is_unimplemented() {
        let mut ctx = context();
        program(&mut ctx);
        ctx.state_mut().set_logic_op_enabled(true);
        let err = ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap_err();
        assert!(err.is_unimplemented());
    }
}
