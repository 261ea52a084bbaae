//! A GPU-less backend.
//!
//! [`RecordingBackend`] logs every device call as a [`BackendEvent`] and
//! keeps a software copy of buffer and texture memory, so copies, clears
//! and read-backs return real bytes. Draws are logged but not rasterized.
//!
//! The log is shared: grab a [`RecordingLog`] with
//! [`RecordingBackend::handle`] before moving the backend into a context.

use std::sync::Arc;

use glbridge_core::types::Extents;
use glbridge_core::{BridgeError, ResourceKind, Result};
use glam::Vec4;
use parking_lot::Mutex;
use slotmap::SlotMap;

use super::{
    Backend, BindGroupEntry, BindGroupId, BindGroupLayoutId, BufferDescriptor, BufferId, PipelineLayoutId,
    RenderPipelineBuild, RenderPipelineId, SamplerId, ShaderModuleId, TexelCopyBuffer, TexelCopyTexture,
    TextureDescriptor, TextureId, TextureViewDescriptor, TextureViewId,
};
use crate::command_buffer::Command;
use crate::render_pass::{LoadOp, RenderPassDescriptor};
use crate::sampler::SamplerKey;

#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    CreateBuffer { id: BufferId, label: Option<String>, size: u64, usage: wgpu::BufferUsages },
    WriteBuffer { buffer: BufferId, offset: u64, size: u64 },
    ReadBuffer { buffer: BufferId, offset: u64, size: u64 },
    CreateTexture { id: TextureId, label: Option<String>, size: Extents, mip_level_count: u32, format: wgpu::TextureFormat },
    CreateTextureView { id: TextureViewId, texture: TextureId },
    CreateSampler(SamplerId),
    CreateBindGroupLayout(BindGroupLayoutId),
    CreatePipelineLayout(PipelineLayoutId),
    CreateBindGroup { id: BindGroupId, layout: BindGroupLayoutId, entries: Vec<BindGroupEntry> },
    CreateShaderModule(ShaderModuleId),
    CreateRenderPipeline(RenderPipelineId),
    RenderPass { desc: RenderPassDescriptor, commands: Vec<Command> },
    CopyBufferToBuffer { src: BufferId, src_offset: u64, dst: BufferId, dst_offset: u64, size: u64 },
    CopyBufferToTexture { src: TexelCopyBuffer, dst: TexelCopyTexture, size: Extents },
    CopyTextureToBuffer { src: TexelCopyTexture, dst: TexelCopyBuffer, size: Extents },
    CopyTextureToTexture { src: TexelCopyTexture, dst: TexelCopyTexture, size: Extents },
    Submit,
    WaitIdle,
    Present(TextureId),
    ReleaseBuffer(BufferId),
    ReleaseTexture(TextureId),
    ReleaseTextureView(TextureViewId),
    ReleaseBindGroup(BindGroupId),
}

#[derive(Debug, Default)]
struct LogState {
    events: Vec<BackendEvent>,
    failing_pipeline_builds: u32,
}

/// Shared handle to a [`RecordingBackend`]'s event log.
#[derive(Debug, Clone, Default)]
pub struct RecordingLog {
    inner: Arc<Mutex<LogState>>,
}

impl RecordingLog {
    fn push(&self, event: BackendEvent) {
        self.inner.lock().events.push(event);
    }

    /// Number of events matching `pred`.
    pub fn count(&self, pred: impl Fn(&BackendEvent) -> bool) -> usize {
        self.inner.lock().events.iter().filter(|e| pred(e)).count()
    }

    #[must_use]
    pub fn events(&self) -> Vec<BackendEvent> {
        self.inner.lock().events.clone()
    }

    pub fn take_events(&self) -> Vec<BackendEvent> {
        std::mem::take(&mut self.inner.lock().events)
    }

    /// Every recorded render pass, oldest first.
    #[must_use]
    pub fn render_passes(&self) -> Vec<(RenderPassDescriptor, Vec<Command>)> {
        self.inner
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                BackendEvent::RenderPass { desc, commands } => Some((desc.clone(), commands.clone())),
                _ => None,
            })
            .collect()
    }

    /// Makes the next `count` render pipeline builds fail.
    pub fn fail_next_pipeline_builds(&self, count: u32) {
        self.inner.lock().failing_pipeline_builds = count;
    }

    fn take_pipeline_failure(&self) -> bool {
        let mut state = self.inner.lock();
        if state.failing_pipeline_builds == 0 {
            return false;
        }
        state.failing_pipeline_builds -= 1;
        true
    }
}

// ─── Software memory ───────────────────────────────────────────────────────

#[derive(Debug)]
struct SoftBuffer {
    data: Vec<u8>,
    mapped: bool,
}

#[derive(Debug)]
struct SoftTexture {
    size: Extents,
    format: wgpu::TextureFormat,
    /// One allocation per mip level, layers stacked.
    levels: Vec<Vec<u8>>,
}

impl SoftTexture {
    fn texel_bytes(&self) -> usize {
        self.format.block_copy_size(None).unwrap_or(4) as usize
    }

    fn level_extents(&self, level: u32) -> Extents {
        self.size.level(level)
    }

    /// Byte offset of texel (x, y, layer) in `level`.
    fn texel_offset(&self, level: u32, x: u32, y: u32, layer: u32) -> usize {
        let extents = self.level_extents(level);
        ((layer as usize * extents.height as usize + y as usize) * extents.width as usize + x as usize)
            * self.texel_bytes()
    }

    fn check_region(&self, level: u32, origin: [u32; 3], size: Extents) -> Result<()> {
        let extents = self.level_extents(level);
        let fits = (level as usize) < self.levels.len()
            && origin[0] + size.width <= extents.width
            && origin[1] + size.height <= extents.height
            && origin[2] + size.depth_or_layers <= extents.depth_or_layers;
        if fits {
            Ok(())
        } else {
            Err(BridgeError::InvalidOperation(format!(
                "copy region {origin:?} + {size:?} exceeds level {level} of {:?}",
                self.size
            )))
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SoftView {
    texture: TextureId,
    desc: TextureViewDescriptor,
}

/// Encodes one clear color texel; `None` for formats the software model
/// does not write.
fn encode_color(format: wgpu::TextureFormat, color: Vec4) -> Option<Vec<u8>> {
    let unorm = |c: f32| (c.clamp(0.0, 1.0) * 255.0).round() as u8;
    let bytes = match format {
        wgpu::TextureFormat::Rgba8Unorm | wgpu::TextureFormat::Rgba8UnormSrgb => {
            vec![unorm(color.x), unorm(color.y), unorm(color.z), unorm(color.w)]
        }
        wgpu::TextureFormat::Bgra8Unorm | wgpu::TextureFormat::Bgra8UnormSrgb => {
            vec![unorm(color.z), unorm(color.y), unorm(color.x), unorm(color.w)]
        }
        wgpu::TextureFormat::R8Unorm => vec![unorm(color.x)],
        wgpu::TextureFormat::Rg8Unorm => vec![unorm(color.x), unorm(color.y)],
        wgpu::TextureFormat::R32Float => color.x.to_le_bytes().to_vec(),
        wgpu::TextureFormat::Rgba32Float => color.to_array().iter().flat_map(|c| c.to_le_bytes()).collect(),
        _ => return None,
    };
    Some(bytes)
}

#[derive(Debug, Default)]
pub struct RecordingBackend {
    log: RecordingLog,
    buffers: SlotMap<BufferId, SoftBuffer>,
    textures: SlotMap<TextureId, SoftTexture>,
    views: SlotMap<TextureViewId, SoftView>,
    samplers: SlotMap<SamplerId, SamplerKey>,
    bind_group_layouts: SlotMap<BindGroupLayoutId, ()>,
    pipeline_layouts: SlotMap<PipelineLayoutId, ()>,
    bind_groups: SlotMap<BindGroupId, BindGroupLayoutId>,
    shader_modules: SlotMap<ShaderModuleId, ()>,
    pipelines: SlotMap<RenderPipelineId, ()>,
}

impl RecordingBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle to the shared event log.
    #[must_use]
    pub fn handle(&self) -> RecordingLog {
        self.log.clone()
    }

    /// Current contents of `buffer`.
    #[must_use]
    pub fn buffer_contents(&self, buffer: BufferId) -> Option<&[u8]> {
        self.buffers.get(buffer).map(|b| b.data.as_slice())
    }

    /// Live buffer count; released buffers are gone.
    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    #[must_use]
    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    fn buffer(&self, id: BufferId) -> Result<&SoftBuffer> {
        self.buffers
            .get(id)
            .ok_or_else(|| BridgeError::InternalConsistency(format!("use of released buffer {id:?}")))
    }

    fn buffer_mut(&mut self, id: BufferId) -> Result<&mut SoftBuffer> {
        self.buffers
            .get_mut(id)
            .ok_or_else(|| BridgeError::InternalConsistency(format!("use of released buffer {id:?}")))
    }

    fn texture(&self, id: TextureId) -> Result<&SoftTexture> {
        self.textures
            .get(id)
            .ok_or_else(|| BridgeError::InternalConsistency(format!("use of released texture {id:?}")))
    }

    fn texture_mut(&mut self, id: TextureId) -> Result<&mut SoftTexture> {
        self.textures
            .get_mut(id)
            .ok_or_else(|| BridgeError::InternalConsistency(format!("use of released texture {id:?}")))
    }

    fn write_bytes(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        let target = self.buffer_mut(buffer)?;
        let end = offset as usize + data.len();
        if end > target.data.len() {
            return Err(BridgeError::InvalidOperation(format!(
                "write of {} bytes at {offset} overruns buffer of {}",
                data.len(),
                target.data.len()
            )));
        }
        target.data[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    /// Fills every texel of the view's subresources with `texel`.
    fn fill_view(&mut self, view: TextureViewId, texel: &[u8]) -> Result<()> {
        let SoftView { texture, desc } = *self
            .views
            .get(view)
            .ok_or_else(|| BridgeError::InternalConsistency(format!("use of released view {view:?}")))?;
        let target = self.texture_mut(texture)?;
        if texel.len() != target.texel_bytes() {
            return Ok(());
        }
        let level_count = desc.mip_level_count.unwrap_or(target.levels.len() as u32 - desc.base_mip_level);
        for level in desc.base_mip_level..desc.base_mip_level + level_count {
            let extents = target.level_extents(level);
            let layers = desc.array_layer_count.unwrap_or(extents.depth_or_layers - desc.base_array_layer);
            let start = target.texel_offset(level, 0, 0, desc.base_array_layer);
            let len = (layers * extents.width * extents.height) as usize * texel.len();
            if let Some(bytes) = target.levels.get_mut(level as usize) {
                for chunk in bytes[start..start + len].chunks_exact_mut(texel.len()) {
                    chunk.copy_from_slice(texel);
                }
            }
        }
        Ok(())
    }
}

impl Backend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    // ─── Buffers ───────────────────────────────────────────────────────────

    fn create_buffer(&mut self, desc: &BufferDescriptor<'_>) -> Result<BufferId> {
        let id = self.buffers.insert(SoftBuffer {
            data: vec![0; desc.size as usize],
            mapped: desc.mapped_at_creation,
        });
        self.log.push(BackendEvent::CreateBuffer {
            id,
            label: desc.label.map(str::to_string),
            size: desc.size,
            usage: desc.usage,
        });
        Ok(id)
    }

    fn write_mapped(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        if !self.buffer(buffer)?.mapped {
            return Err(BridgeError::InternalConsistency(format!("buffer {buffer:?} is not mapped")));
        }
        self.write_bytes(buffer, offset, data)
    }

    fn unmap_buffer(&mut self, buffer: BufferId) -> Result<()> {
        self.buffer_mut(buffer)?.mapped = false;
        Ok(())
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        self.write_bytes(buffer, offset, data)?;
        self.log.push(BackendEvent::WriteBuffer { buffer, offset, size: data.len() as u64 });
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferId, offset: u64, size: u64) -> Result<Vec<u8>> {
        let source = self.buffer(buffer)?;
        let end = (offset + size) as usize;
        let bytes = source
            .data
            .get(offset as usize..end)
            .ok_or_else(|| BridgeError::MapFailed(format!("range {offset}..{end} outside buffer {buffer:?}")))?
            .to_vec();
        self.log.push(BackendEvent::ReadBuffer { buffer, offset, size });
        Ok(bytes)
    }

    fn release_buffer(&mut self, buffer: BufferId) {
        self.buffers.remove(buffer);
        self.log.push(BackendEvent::ReleaseBuffer(buffer));
    }

    // ─── Textures & samplers ───────────────────────────────────────────────

    fn create_texture(&mut self, desc: &TextureDescriptor<'_>) -> Result<TextureId> {
        let mut texture = SoftTexture { size: desc.size, format: desc.format, levels: Vec::new() };
        let texel = texture.texel_bytes();
        texture.levels = (0..desc.mip_level_count)
            .map(|level| {
                let e = desc.size.level(level);
                vec![0u8; (e.width * e.height * e.depth_or_layers) as usize * texel]
            })
            .collect();
        let id = self.textures.insert(texture);
        self.log.push(BackendEvent::CreateTexture {
            id,
            label: desc.label.map(str::to_string),
            size: desc.size,
            mip_level_count: desc.mip_level_count,
            format: desc.format,
        });
        Ok(id)
    }

    fn create_texture_view(&mut self, texture: TextureId, desc: &TextureViewDescriptor) -> Result<TextureViewId> {
        self.texture(texture)?;
        let id = self.views.insert(SoftView { texture, desc: *desc });
        self.log.push(BackendEvent::CreateTextureView { id, texture });
        Ok(id)
    }

    fn release_texture_view(&mut self, view: TextureViewId) {
        self.views.remove(view);
        self.log.push(BackendEvent::ReleaseTextureView(view));
    }

    fn release_texture(&mut self, texture: TextureId) {
        self.textures.remove(texture);
        self.log.push(BackendEvent::ReleaseTexture(texture));
    }

    fn create_sampler(&mut self, desc: &SamplerKey) -> Result<SamplerId> {
        let id = self.samplers.insert(*desc);
        self.log.push(BackendEvent::CreateSampler(id));
        Ok(id)
    }

    // ─── Layouts, bind groups, pipelines ───────────────────────────────────

    fn create_bind_group_layout(
        &mut self,
        _label: Option<&str>,
        _entries: &[wgpu::BindGroupLayoutEntry],
    ) -> Result<BindGroupLayoutId> {
        let id = self.bind_group_layouts.insert(());
        self.log.push(BackendEvent::CreateBindGroupLayout(id));
        Ok(id)
    }

    fn create_pipeline_layout(
        &mut self,
        _label: Option<&str>,
        layouts: &[BindGroupLayoutId],
    ) -> Result<PipelineLayoutId> {
        if let Some(missing) = layouts.iter().find(|l| !self.bind_group_layouts.contains_key(**l)) {
            return Err(BridgeError::resource_build(
                ResourceKind::PipelineLayout,
                format!("unknown bind group layout {missing:?}"),
            ));
        }
        let id = self.pipeline_layouts.insert(());
        self.log.push(BackendEvent::CreatePipelineLayout(id));
        Ok(id)
    }

    fn create_bind_group(
        &mut self,
        _label: Option<&str>,
        layout: BindGroupLayoutId,
        entries: &[BindGroupEntry],
    ) -> Result<BindGroupId> {
        if !self.bind_group_layouts.contains_key(layout) {
            return Err(BridgeError::resource_build(ResourceKind::BindGroup, "unknown layout"));
        }
        let id = self.bind_groups.insert(layout);
        self.log.push(BackendEvent::CreateBindGroup { id, layout, entries: entries.to_vec() });
        Ok(id)
    }

    fn release_bind_group(&mut self, group: BindGroupId) {
        self.bind_groups.remove(group);
        self.log.push(BackendEvent::ReleaseBindGroup(group));
    }

    fn create_shader_module(&mut self, _label: Option<&str>, _wgsl: &str) -> Result<ShaderModuleId> {
        let id = self.shader_modules.insert(());
        self.log.push(BackendEvent::CreateShaderModule(id));
        Ok(id)
    }

    fn create_render_pipeline(&mut self, desc: &RenderPipelineBuild<'_>) -> Result<RenderPipelineId> {
        if self.log.take_pipeline_failure() {
            return Err(BridgeError::resource_build(ResourceKind::RenderPipeline, "injected failure"));
        }
        if !self.pipeline_layouts.contains_key(desc.layout) {
            return Err(BridgeError::resource_build(ResourceKind::RenderPipeline, "unknown pipeline layout"));
        }
        let id = self.pipelines.insert(());
        self.log.push(BackendEvent::CreateRenderPipeline(id));
        Ok(id)
    }

    // ─── Recording ─────────────────────────────────────────────────────────

    fn record_render_pass(&mut self, desc: &RenderPassDescriptor, commands: &[Command]) -> Result<()> {
        for attachment in desc.color_attachments.iter().flatten() {
            if attachment.load_op != LoadOp::Clear {
                continue;
            }
            let texture = self
                .views
                .get(attachment.view)
                .map(|v| v.texture)
                .ok_or_else(|| BridgeError::InternalConsistency("pass over a released view".to_string()))?;
            let format = self.texture(texture)?.format;
            if let Some(texel) = encode_color(format, attachment.clear_value) {
                self.fill_view(attachment.view, &texel)?;
            }
        }
        if let Some(ds) = &desc.depth_stencil_attachment
            && ds.depth_load_op == LoadOp::Clear
        {
            let texture = self
                .views
                .get(ds.view)
                .map(|v| v.texture)
                .ok_or_else(|| BridgeError::InternalConsistency("pass over a released view".to_string()))?;
            if self.texture(texture)?.format == wgpu::TextureFormat::Depth32Float {
                self.fill_view(ds.view, &ds.depth_clear_value.to_le_bytes())?;
            }
        }
        self.log.push(BackendEvent::RenderPass { desc: desc.clone(), commands: commands.to_vec() });
        Ok(())
    }

    fn copy_buffer_to_buffer(
        &mut self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        let bytes = self
            .buffer(src)?
            .data
            .get(src_offset as usize..(src_offset + size) as usize)
            .ok_or_else(|| BridgeError::InvalidOperation(format!("copy source range overruns {src:?}")))?
            .to_vec();
        self.write_bytes(dst, dst_offset, &bytes)?;
        self.log.push(BackendEvent::CopyBufferToBuffer { src, src_offset, dst, dst_offset, size });
        Ok(())
    }

    fn copy_buffer_to_texture(&mut self, src: &TexelCopyBuffer, dst: &TexelCopyTexture, size: Extents) -> Result<()> {
        let texture = self.texture(dst.texture)?;
        texture.check_region(dst.mip_level, dst.origin, size)?;
        let texel = texture.texel_bytes();
        let row_bytes = size.width as usize * texel;
        let mut rows = Vec::new();
        {
            let source = &self.buffer(src.buffer)?.data;
            for z in 0..size.depth_or_layers {
                for row in 0..size.height {
                    let offset = src.offset as usize
                        + ((z * src.rows_per_image.max(size.height) + row) * src.bytes_per_row) as usize;
                    let bytes = source
                        .get(offset..offset + row_bytes)
                        .ok_or_else(|| BridgeError::InvalidOperation("texel copy overruns its buffer".to_string()))?;
                    rows.push((z, row, bytes.to_vec()));
                }
            }
        }
        let texture = self.texture_mut(dst.texture)?;
        for (z, row, bytes) in rows {
            let offset = texture.texel_offset(dst.mip_level, dst.origin[0], dst.origin[1] + row, dst.origin[2] + z);
            texture.levels[dst.mip_level as usize][offset..offset + row_bytes].copy_from_slice(&bytes);
        }
        self.log.push(BackendEvent::CopyBufferToTexture { src: *src, dst: *dst, size });
        Ok(())
    }

    fn copy_texture_to_buffer(&mut self, src: &TexelCopyTexture, dst: &TexelCopyBuffer, size: Extents) -> Result<()> {
        let texture = self.texture(src.texture)?;
        texture.check_region(src.mip_level, src.origin, size)?;
        let row_bytes = size.width as usize * texture.texel_bytes();
        let mut rows = Vec::new();
        for z in 0..size.depth_or_layers {
            for row in 0..size.height {
                let offset = texture.texel_offset(src.mip_level, src.origin[0], src.origin[1] + row, src.origin[2] + z);
                let bytes = texture.levels[src.mip_level as usize][offset..offset + row_bytes].to_vec();
                let dst_offset = dst.offset + u64::from((z * dst.rows_per_image.max(size.height) + row) * dst.bytes_per_row);
                rows.push((dst_offset, bytes));
            }
        }
        for (offset, bytes) in rows {
            self.write_bytes(dst.buffer, offset, &bytes)?;
        }
        self.log.push(BackendEvent::CopyTextureToBuffer { src: *src, dst: *dst, size });
        Ok(())
    }

    fn copy_texture_to_texture(
        &mut self,
        src: &TexelCopyTexture,
        dst: &TexelCopyTexture,
        size: Extents,
    ) -> Result<()> {
        let source = self.texture(src.texture)?;
        source.check_region(src.mip_level, src.origin, size)?;
        let row_bytes = size.width as usize * source.texel_bytes();
        let mut rows = Vec::new();
        for z in 0..size.depth_or_layers {
            for row in 0..size.height {
                let offset = source.texel_offset(src.mip_level, src.origin[0], src.origin[1] + row, src.origin[2] + z);
                rows.push((z, row, source.levels[src.mip_level as usize][offset..offset + row_bytes].to_vec()));
            }
        }
        let target = self.texture_mut(dst.texture)?;
        target.check_region(dst.mip_level, dst.origin, size)?;
        if target.texel_bytes() * size.width as usize != row_bytes {
            return Err(BridgeError::InvalidOperation("texture copy between different texel sizes".to_string()));
        }
        for (z, row, bytes) in rows {
            let offset = target.texel_offset(dst.mip_level, dst.origin[0], dst.origin[1] + row, dst.origin[2] + z);
            target.levels[dst.mip_level as usize][offset..offset + row_bytes].copy_from_slice(&bytes);
        }
        self.log.push(BackendEvent::CopyTextureToTexture { src: *src, dst: *dst, size });
        Ok(())
    }

    // ─── Queue ─────────────────────────────────────────────────────────────

    fn submit(&mut self) -> Result<()> {
        self.log.push(BackendEvent::Submit);
        Ok(())
    }

    fn wait_for_submitted_work(&mut self) -> Result<()> {
        self.log.push(BackendEvent::WaitIdle);
        Ok(())
    }

    fn present(&mut self, source: TextureId) -> Result<()> {
        self.texture(source)?;
        self.log.push(BackendEvent::Present(source));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texture(backend: &mut RecordingBackend, size: u32) -> TextureId {
        backend
            .create_texture(&TextureDescriptor {
                label: None,
                size: Extents::new(size, size, 1),
                mip_level_count: 1,
                format: wgpu::TextureFormat::Rgba8Unorm,
                usage: wgpu::TextureUsages::COPY_DST | wgpu::TextureUsages::COPY_SRC,
            })
            .unwrap()
    }

    #[test]
    fn texel_copies_honor_row_pitch() {
        let mut backend = RecordingBackend::new();
        let tex = texture(&mut backend, 2);
        let src = backend
            .create_buffer(&BufferDescriptor {
                label: None,
                size: 512,
                usage: wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: true,
            })
            .unwrap();
        backend.write_mapped(src, 0, &[1; 8]).unwrap();
        backend.write_mapped(src, 256, &[2; 8]).unwrap();
        backend.unmap_buffer(src).unwrap();
        let copy_src = TexelCopyBuffer { buffer: src, offset: 0, bytes_per_row: 256, rows_per_image: 2 };
        let copy_tex = TexelCopyTexture {
            texture: tex,
            mip_level: 0,
            origin: [0, 0, 0],
            aspect: wgpu::TextureAspect::All,
        };
        backend.copy_buffer_to_texture(&copy_src, &copy_tex, Extents::new(2, 2, 1)).unwrap();

        let dst = backend
            .create_buffer(&BufferDescriptor {
                label: None,
                size: 16,
                usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
            .unwrap();
        let tight = TexelCopyBuffer { buffer: dst, offset: 0, bytes_per_row: 8, rows_per_image: 2 };
        backend.copy_texture_to_buffer(&copy_tex, &tight, Extents::new(2, 2, 1)).unwrap();
        let bytes = backend.read_buffer(dst, 0, 16).unwrap();
        assert_eq!(&bytes[..8], &[1; 8]);
        assert_eq!(&bytes[8..], &[2; 8]);
    }

    #[test]
    fn writes_to_unmapped_buffers_are_rejected() {
        let mut backend = RecordingBackend::new();
        let buffer = backend
            .create_buffer(&BufferDescriptor {
                label: None,
                size: 4,
                usage: wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
            .unwrap();
        assert!(backend.write_mapped(buffer, 0, &[0; 4]).unwrap_err().is_internal());
    }

    #[test]
    fn released_objects_are_gone() {
        let mut backend = RecordingBackend::new();
        let log = backend.handle();
        let tex = texture(&mut backend, 1);
        backend.release_texture(tex);
        assert_eq!(backend.live_textures(), 0);
        assert!(backend.present(tex).is_err());
        assert_eq!(log.count(|e| matches!(e, BackendEvent::ReleaseTexture(_))), 1);
    }
}
