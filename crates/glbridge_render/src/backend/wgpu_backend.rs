//! `wgpu` device backend.
//!
//! [`WgpuBackend`] maps backend ids onto live `wgpu` objects and records
//! into one lazily created command encoder. Render passes arrive complete
//! (descriptor plus command list) and are replayed into a `wgpu::RenderPass`
//! in a single borrow scope.
//!
//! Read-back and idle waits deliver their completions through `flume`
//! channels while the device is polled.

use std::num::NonZeroU64;

use glbridge_core::settings::ContextSettings;
use glbridge_core::types::Extents;
use glbridge_core::{BridgeError, ResourceKind, Result};
use glam::Vec4;
use slotmap::{Key, SlotMap};
use smallvec::SmallVec;

use super::{
    Backend, BindGroupEntry, BindGroupId, BindGroupLayoutId, BindingResource, BufferDescriptor, BufferId,
    PipelineLayoutId, RenderPipelineBuild, RenderPipelineId, SamplerId, ShaderModuleId, TexelCopyBuffer,
    TexelCopyTexture, TextureDescriptor, TextureId, TextureViewDescriptor, TextureViewId,
};
use crate::command_buffer::Command;
use crate::render_pass::{LoadOp, RenderPassDescriptor, StoreOp};
use crate::sampler::SamplerKey;

struct ViewEntry {
    view: wgpu::TextureView,
    format: wgpu::TextureFormat,
}

struct SurfaceState {
    surface: wgpu::Surface<'static>,
    config: wgpu::SurfaceConfiguration,
}

/// A [`Backend`] over a real `wgpu` device.
pub struct WgpuBackend {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    adapter_info: wgpu::AdapterInfo,
    surface: Option<SurfaceState>,

    buffers: SlotMap<BufferId, wgpu::Buffer>,
    textures: SlotMap<TextureId, wgpu::Texture>,
    views: SlotMap<TextureViewId, ViewEntry>,
    samplers: SlotMap<SamplerId, wgpu::Sampler>,
    bind_group_layouts: SlotMap<BindGroupLayoutId, wgpu::BindGroupLayout>,
    pipeline_layouts: SlotMap<PipelineLayoutId, wgpu::PipelineLayout>,
    bind_groups: SlotMap<BindGroupId, wgpu::BindGroup>,
    shader_modules: SlotMap<ShaderModuleId, wgpu::ShaderModule>,
    pipelines: SlotMap<RenderPipelineId, wgpu::RenderPipeline>,

    encoder: Option<wgpu::CommandEncoder>,
}

impl WgpuBackend {
    /// Creates a backend with no presentation surface.
    pub async fn new_headless(settings: &ContextSettings) -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = request_adapter(&instance, settings, None).await?;
        let (device, queue) = request_device(&adapter).await?;
        Ok(Self::from_parts(device, queue, adapter.get_info(), None))
    }

    /// Blocking variant of [`Self::new_headless`].
    pub fn new_headless_blocking(settings: &ContextSettings) -> Result<Self> {
        pollster::block_on(Self::new_headless(settings))
    }

    /// Creates a backend presenting into `window`.
    ///
    /// The surface is sized to the default framebuffer and configured with
    /// `COPY_DST` so frames can be copied in at swap time.
    pub async fn with_window(
        window: impl Into<wgpu::SurfaceTarget<'static>>,
        settings: &ContextSettings,
    ) -> Result<Self> {
        let instance = wgpu::Instance::default();
        let surface = instance
            .create_surface(window)
            .map_err(|e| BridgeError::Surface(e.to_string()))?;
        let adapter = request_adapter(&instance, settings, Some(&surface)).await?;
        let (device, queue) = request_device(&adapter).await?;

        let extents = settings.default_framebuffer_extents();
        let mut config = surface
            .get_default_config(&adapter, extents.width, extents.height)
            .ok_or_else(|| BridgeError::Surface("Surface not supported by adapter".to_string()))?;
        config.format = crate::conversions::texture_format(settings.default_framebuffer_format.actual());
        config.usage = wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_DST;
        surface.configure(&device, &config);

        Ok(Self::from_parts(device, queue, adapter.get_info(), Some(SurfaceState { surface, config })))
    }

    fn from_parts(
        device: wgpu::Device,
        queue: wgpu::Queue,
        adapter_info: wgpu::AdapterInfo,
        surface: Option<SurfaceState>,
    ) -> Self {
        log::info!(
            "glbridge: using adapter '{}' ({:?}, {:?})",
            adapter_info.name,
            adapter_info.backend,
            adapter_info.device_type
        );
        Self {
            device,
            queue,
            adapter_info,
            surface,
            buffers: SlotMap::with_key(),
            textures: SlotMap::with_key(),
            views: SlotMap::with_key(),
            samplers: SlotMap::with_key(),
            bind_group_layouts: SlotMap::with_key(),
            pipeline_layouts: SlotMap::with_key(),
            bind_groups: SlotMap::with_key(),
            shader_modules: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            encoder: None,
        }
    }

    #[must_use]
    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    /// Reconfigures the presentation surface. Zero sizes are ignored.
    pub fn resize_surface(&mut self, width: u32, height: u32) {
        if let Some(state) = &mut self.surface
            && width > 0
            && height > 0
        {
            state.config.width = width;
            state.config.height = height;
            state.surface.configure(&self.device, &state.config);
        }
    }

    /// Returns the live `wgpu` texture behind `id`.
    #[must_use]
    pub fn wgpu_texture(&self, id: TextureId) -> Option<&wgpu::Texture> {
        self.textures.get(id)
    }

    fn take_encoder(&mut self) -> wgpu::CommandEncoder {
        self.encoder.take().unwrap_or_else(|| {
            self.device.create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("glbridge") })
        })
    }
}

// ─── Bring-up helpers ──────────────────────────────────────────────────────

fn power_preference(name: &str) -> wgpu::PowerPreference {
    match name.to_ascii_lowercase().as_str() {
        "low" | "low-power" | "lowpower" => wgpu::PowerPreference::LowPower,
        "none" => wgpu::PowerPreference::None,
        _ => wgpu::PowerPreference::HighPerformance,
    }
}

async fn request_adapter(
    instance: &wgpu::Instance,
    settings: &ContextSettings,
    surface: Option<&wgpu::Surface<'_>>,
) -> Result<wgpu::Adapter> {
    let adapter = instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: power_preference(&settings.power_preference),
            compatible_surface: surface,
            force_fallback_adapter: false,
        })
        .await
        .map_err(|e| BridgeError::AdapterRequestFailed(e.to_string()))?;

    if let Some(filter) = settings.backends.as_deref() {
        let allowed = wgpu::Backends::from_comma_list(filter);
        let backend = adapter.get_info().backend;
        if !allowed.contains(wgpu::Backends::from(backend)) {
            return Err(BridgeError::AdapterRequestFailed(format!(
                "adapter backend {backend:?} is not in the allowed set '{filter}'"
            )));
        }
    }
    Ok(adapter)
}

async fn request_device(adapter: &wgpu::Adapter) -> Result<(wgpu::Device, wgpu::Queue)> {
    adapter
        .request_device(&wgpu::DeviceDescriptor {
            label: Some("glbridge"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::downlevel_defaults().using_resolution(adapter.limits()),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        })
        .await
        .map_err(|e| BridgeError::DeviceCreateFailed(e.to_string()))
}

// ─── Conversions ───────────────────────────────────────────────────────────

fn lookup<'a, K: Key, V>(map: &'a SlotMap<K, V>, id: K, kind: ResourceKind) -> Result<&'a V> {
    map.get(id)
        .ok_or_else(|| BridgeError::InternalConsistency(format!("unknown {kind} {id:?}")))
}

fn color(value: Vec4) -> wgpu::Color {
    wgpu::Color {
        r: f64::from(value.x),
        g: f64::from(value.y),
        b: f64::from(value.z),
        a: f64::from(value.w),
    }
}

fn operations<V>(load: LoadOp, store: StoreOp, clear: V) -> wgpu::Operations<V> {
    wgpu::Operations {
        load: match load {
            LoadOp::Load => wgpu::LoadOp::Load,
            LoadOp::Clear => wgpu::LoadOp::Clear(clear),
        },
        store: match store {
            StoreOp::Store => wgpu::StoreOp::Store,
            StoreOp::Discard => wgpu::StoreOp::Discard,
        },
    }
}

fn extent(size: Extents) -> wgpu::Extent3d {
    wgpu::Extent3d {
        width: size.width,
        height: size.height,
        depth_or_array_layers: size.depth_or_layers,
    }
}

fn buffer_info<'a>(buffers: &'a SlotMap<BufferId, wgpu::Buffer>, copy: &TexelCopyBuffer) -> Result<wgpu::TexelCopyBufferInfo<'a>> {
    Ok(wgpu::TexelCopyBufferInfo {
        buffer: lookup(buffers, copy.buffer, ResourceKind::Buffer)?,
        layout: wgpu::TexelCopyBufferLayout {
            offset: copy.offset,
            bytes_per_row: Some(copy.bytes_per_row),
            rows_per_image: Some(copy.rows_per_image),
        },
    })
}

fn texture_info<'a>(
    textures: &'a SlotMap<TextureId, wgpu::Texture>,
    copy: &TexelCopyTexture,
) -> Result<wgpu::TexelCopyTextureInfo<'a>> {
    Ok(wgpu::TexelCopyTextureInfo {
        texture: lookup(textures, copy.texture, ResourceKind::Texture)?,
        mip_level: copy.mip_level,
        origin: wgpu::Origin3d { x: copy.origin[0], y: copy.origin[1], z: copy.origin[2] },
        aspect: copy.aspect,
    })
}

impl Backend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    // ─── Buffers ───────────────────────────────────────────────────────────

    fn create_buffer(&mut self, desc: &BufferDescriptor<'_>) -> Result<BufferId> {
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: desc.label,
            size: desc.size,
            usage: desc.usage,
            mapped_at_creation: desc.mapped_at_creation,
        });
        Ok(self.buffers.insert(buffer))
    }

    fn write_mapped(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        let buffer = lookup(&self.buffers, buffer, ResourceKind::Buffer)?;
        if buffer.map_state() != wgpu::MapState::Mapped {
            return Err(BridgeError::InternalConsistency("write into an unmapped buffer".to_string()));
        }
        let end = offset + data.len() as u64;
        buffer.slice(offset..end).get_mapped_range_mut().copy_from_slice(data);
        Ok(())
    }

    fn unmap_buffer(&mut self, buffer: BufferId) -> Result<()> {
        lookup(&self.buffers, buffer, ResourceKind::Buffer)?.unmap();
        Ok(())
    }

    fn write_buffer(&mut self, buffer: BufferId, offset: u64, data: &[u8]) -> Result<()> {
        let buffer = lookup(&self.buffers, buffer, ResourceKind::Buffer)?;
        self.queue.write_buffer(buffer, offset, data);
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferId, offset: u64, size: u64) -> Result<Vec<u8>> {
        let buffer = lookup(&self.buffers, buffer, ResourceKind::Buffer)?;
        let slice = buffer.slice(offset..offset + size);

        let (tx, rx) = flume::bounded(1);
        slice.map_async(wgpu::MapMode::Read, move |res| {
            let _ = tx.send(res);
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| BridgeError::WaitFailed(e.to_string()))?;
        rx.recv()
            .map_err(|_| BridgeError::MapFailed("map_async callback dropped".to_string()))?
            .map_err(|e| BridgeError::MapFailed(e.to_string()))?;

        let bytes = slice.get_mapped_range().to_vec();
        buffer.unmap();
        Ok(bytes)
    }

    fn release_buffer(&mut self, buffer: BufferId) {
        if let Some(buffer) = self.buffers.remove(buffer) {
            buffer.destroy();
        }
    }

    // ─── Textures & samplers ───────────────────────────────────────────────

    fn create_texture(&mut self, desc: &TextureDescriptor<'_>) -> Result<TextureId> {
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label,
            size: extent(desc.size),
            mip_level_count: desc.mip_level_count,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: desc.format,
            usage: desc.usage,
            view_formats: &[],
        });
        Ok(self.textures.insert(texture))
    }

    fn create_texture_view(&mut self, texture: TextureId, desc: &TextureViewDescriptor) -> Result<TextureViewId> {
        let texture = lookup(&self.textures, texture, ResourceKind::Texture)?;
        let view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: None,
            dimension: desc.dimension,
            base_mip_level: desc.base_mip_level,
            mip_level_count: desc.mip_level_count,
            base_array_layer: desc.base_array_layer,
            array_layer_count: desc.array_layer_count,
            ..Default::default()
        });
        Ok(self.views.insert(ViewEntry { view, format: texture.format() }))
    }

    fn release_texture_view(&mut self, view: TextureViewId) {
        self.views.remove(view);
    }

    fn release_texture(&mut self, texture: TextureId) {
        if let Some(texture) = self.textures.remove(texture) {
            texture.destroy();
        }
    }

    fn create_sampler(&mut self, desc: &SamplerKey) -> Result<SamplerId> {
        let sampler = self.device.create_sampler(&desc.to_wgpu(None));
        Ok(self.samplers.insert(sampler))
    }

    // ─── Layouts, bind groups, pipelines ───────────────────────────────────

    fn create_bind_group_layout(
        &mut self,
        label: Option<&str>,
        entries: &[wgpu::BindGroupLayoutEntry],
    ) -> Result<BindGroupLayoutId> {
        let layout = self.device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor { label, entries });
        Ok(self.bind_group_layouts.insert(layout))
    }

    fn create_pipeline_layout(
        &mut self,
        label: Option<&str>,
        layouts: &[BindGroupLayoutId],
    ) -> Result<PipelineLayoutId> {
        let layouts = layouts
            .iter()
            .map(|id| {
                self.bind_group_layouts
                    .get(*id)
                    .map(Some)
                    .ok_or_else(|| BridgeError::resource_build(ResourceKind::PipelineLayout, format!("unknown layout {id:?}")))
            })
            .collect::<Result<SmallVec<[Option<&wgpu::BindGroupLayout>; 4]>>>()?;
        let layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label,
            bind_group_layouts: &layouts,
            immediate_size: 0,
        });
        Ok(self.pipeline_layouts.insert(layout))
    }

    fn create_bind_group(
        &mut self,
        label: Option<&str>,
        layout: BindGroupLayoutId,
        entries: &[BindGroupEntry],
    ) -> Result<BindGroupId> {
        let layout = self
            .bind_group_layouts
            .get(layout)
            .ok_or_else(|| BridgeError::resource_build(ResourceKind::BindGroup, format!("unknown layout {layout:?}")))?;

        let mut wgpu_entries = SmallVec::<[wgpu::BindGroupEntry<'_>; 8]>::new();
        for entry in entries {
            let missing = || BridgeError::resource_build(ResourceKind::BindGroup, format!("stale resource in {entry:?}"));
            let resource = match entry.resource {
                BindingResource::Buffer { buffer, offset, size } => {
                    wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                        buffer: self.buffers.get(buffer).ok_or_else(missing)?,
                        offset,
                        size: size.and_then(NonZeroU64::new),
                    })
                }
                BindingResource::Sampler(sampler) => {
                    wgpu::BindingResource::Sampler(self.samplers.get(sampler).ok_or_else(missing)?)
                }
                BindingResource::TextureView(view) => {
                    wgpu::BindingResource::TextureView(&self.views.get(view).ok_or_else(missing)?.view)
                }
            };
            wgpu_entries.push(wgpu::BindGroupEntry { binding: entry.binding, resource });
        }

        let group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label,
            layout,
            entries: &wgpu_entries,
        });
        Ok(self.bind_groups.insert(group))
    }

    fn release_bind_group(&mut self, group: BindGroupId) {
        self.bind_groups.remove(group);
    }

    fn create_shader_module(&mut self, label: Option<&str>, wgsl: &str) -> Result<ShaderModuleId> {
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label,
            source: wgpu::ShaderSource::Wgsl(std::borrow::Cow::Borrowed(wgsl)),
        });
        Ok(self.shader_modules.insert(module))
    }

    fn create_render_pipeline(&mut self, desc: &RenderPipelineBuild<'_>) -> Result<RenderPipelineId> {
        let build_error = |what: &str| BridgeError::resource_build(ResourceKind::RenderPipeline, what.to_string());

        let layout = self.pipeline_layouts.get(desc.layout).ok_or_else(|| build_error("unknown pipeline layout"))?;
        let vertex_module =
            self.shader_modules.get(desc.vertex.module).ok_or_else(|| build_error("unknown vertex module"))?;
        let fragment_module = match &desc.fragment {
            Some(stage) => {
                Some(self.shader_modules.get(stage.module).ok_or_else(|| build_error("unknown fragment module"))?)
            }
            None => None,
        };

        let vertex_buffers: SmallVec<[wgpu::VertexBufferLayout<'_>; 8]> = desc
            .vertex_buffers
            .iter()
            .map(|layout| wgpu::VertexBufferLayout {
                array_stride: layout.array_stride,
                step_mode: layout.step_mode,
                attributes: &layout.attributes,
            })
            .collect();

        let fragment = match (desc.fragment.as_ref(), fragment_module) {
            (Some(stage), Some(module)) => Some(wgpu::FragmentState {
                module,
                entry_point: Some(stage.entry_point),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                targets: desc.color_targets,
            }),
            _ => None,
        };

        let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: desc.label,
            layout: Some(layout),
            vertex: wgpu::VertexState {
                module: vertex_module,
                entry_point: Some(desc.vertex.entry_point),
                buffers: &vertex_buffers,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            },
            primitive: desc.primitive,
            depth_stencil: desc.depth_stencil.clone(),
            multisample: desc.multisample,
            fragment,
            multiview_mask: None,
            cache: None,
        });
        Ok(self.pipelines.insert(pipeline))
    }

    // ─── Recording ─────────────────────────────────────────────────────────

    fn record_render_pass(&mut self, desc: &RenderPassDescriptor, commands: &[Command]) -> Result<()> {
        let mut encoder = self.take_encoder();
        let result = self.replay_pass(&mut encoder, desc, commands);
        self.encoder = Some(encoder);
        result
    }

    fn copy_buffer_to_buffer(
        &mut self,
        src: BufferId,
        src_offset: u64,
        dst: BufferId,
        dst_offset: u64,
        size: u64,
    ) -> Result<()> {
        let mut encoder = self.take_encoder();
        let result = (|| {
            let src = lookup(&self.buffers, src, ResourceKind::Buffer)?;
            let dst = lookup(&self.buffers, dst, ResourceKind::Buffer)?;
            encoder.copy_buffer_to_buffer(src, src_offset, dst, dst_offset, size);
            Ok(())
        })();
        self.encoder = Some(encoder);
        result
    }

    fn copy_buffer_to_texture(&mut self, src: &TexelCopyBuffer, dst: &TexelCopyTexture, size: Extents) -> Result<()> {
        let mut encoder = self.take_encoder();
        let result = (|| {
            encoder.copy_buffer_to_texture(
                buffer_info(&self.buffers, src)?,
                texture_info(&self.textures, dst)?,
                extent(size),
            );
            Ok(())
        })();
        self.encoder = Some(encoder);
        result
    }

    fn copy_texture_to_buffer(&mut self, src: &TexelCopyTexture, dst: &TexelCopyBuffer, size: Extents) -> Result<()> {
        let mut encoder = self.take_encoder();
        let result = (|| {
            encoder.copy_texture_to_buffer(
                texture_info(&self.textures, src)?,
                buffer_info(&self.buffers, dst)?,
                extent(size),
            );
            Ok(())
        })();
        self.encoder = Some(encoder);
        result
    }

    fn copy_texture_to_texture(
        &mut self,
        src: &TexelCopyTexture,
        dst: &TexelCopyTexture,
        size: Extents,
    ) -> Result<()> {
        let mut encoder = self.take_encoder();
        let result = (|| {
            encoder.copy_texture_to_texture(
                texture_info(&self.textures, src)?,
                texture_info(&self.textures, dst)?,
                extent(size),
            );
            Ok(())
        })();
        self.encoder = Some(encoder);
        result
    }

    // ─── Queue ─────────────────────────────────────────────────────────────

    fn submit(&mut self) -> Result<()> {
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
        Ok(())
    }

    fn wait_for_submitted_work(&mut self) -> Result<()> {
        let (tx, rx) = flume::bounded(1);
        self.queue.on_submitted_work_done(move || {
            let _ = tx.send(());
        });
        self.device
            .poll(wgpu::PollType::wait_indefinitely())
            .map_err(|e| BridgeError::WaitFailed(e.to_string()))?;
        rx.try_recv()
            .map_err(|_| BridgeError::WaitFailed("submitted work did not complete".to_string()))
    }

    fn present(&mut self, source: TextureId) -> Result<()> {
        let Some(state) = &self.surface else {
            log::trace!("glbridge: present without a surface is a no-op");
            return Ok(());
        };

        let output = match state.surface.get_current_texture() {
            wgpu::CurrentSurfaceTexture::Success(output) | wgpu::CurrentSurfaceTexture::Suboptimal(output) => output,
            wgpu::CurrentSurfaceTexture::Lost | wgpu::CurrentSurfaceTexture::Outdated => {
                log::warn!("glbridge: surface lost, reconfiguring");
                state.surface.configure(&self.device, &state.config);
                return Ok(());
            }
            e => return Err(BridgeError::Surface(format!("{e:?}"))),
        };

        let source = lookup(&self.textures, source, ResourceKind::Texture)?;
        if source.format() != output.texture.format() {
            log::warn!(
                "glbridge: cannot present {:?} into a {:?} surface",
                source.format(),
                output.texture.format()
            );
            output.present();
            return Ok(());
        }

        let size = wgpu::Extent3d {
            width: source.width().min(output.texture.width()),
            height: source.height().min(output.texture.height()),
            depth_or_array_layers: 1,
        };
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("glbridge present") });
        encoder.copy_texture_to_texture(source.as_image_copy(), output.texture.as_image_copy(), size);
        self.queue.submit(std::iter::once(encoder.finish()));
        output.present();
        Ok(())
    }
}

impl WgpuBackend {
    fn replay_pass(
        &self,
        encoder: &mut wgpu::CommandEncoder,
        desc: &RenderPassDescriptor,
        commands: &[Command],
    ) -> Result<()> {
        let color_attachments = desc
            .color_attachments
            .iter()
            .map(|slot| {
                slot.as_ref()
                    .map(|a| -> Result<_> {
                        Ok(wgpu::RenderPassColorAttachment {
                            view: &lookup(&self.views, a.view, ResourceKind::TextureView)?.view,
                            depth_slice: a.depth_slice,
                            resolve_target: None,
                            ops: operations(a.load_op, a.store_op, color(a.clear_value)),
                        })
                    })
                    .transpose()
            })
            .collect::<Result<SmallVec<[Option<wgpu::RenderPassColorAttachment<'_>>; 8]>>>()?;

        let depth_stencil_attachment = match &desc.depth_stencil_attachment {
            Some(ds) => {
                let entry = lookup(&self.views, ds.view, ResourceKind::TextureView)?;
                let depth_ops = (entry.format.has_depth_aspect() && !ds.depth_read_only)
                    .then(|| operations(ds.depth_load_op, ds.depth_store_op, ds.depth_clear_value));
                let stencil_ops = (entry.format.has_stencil_aspect() && !ds.stencil_read_only)
                    .then(|| operations(ds.stencil_load_op, ds.stencil_store_op, ds.stencil_clear_value));
                Some(wgpu::RenderPassDepthStencilAttachment { view: &entry.view, depth_ops, stencil_ops })
            }
            None => None,
        };

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("glbridge pass"),
            color_attachments: &color_attachments,
            depth_stencil_attachment,
            timestamp_writes: None,
            occlusion_query_set: None,
            multiview_mask: None,
        });

        for command in commands {
            match *command {
                Command::SetPipeline(id) => {
                    pass.set_pipeline(lookup(&self.pipelines, id, ResourceKind::RenderPipeline)?);
                }
                Command::SetViewport(v) => {
                    pass.set_viewport(v.x, v.y, v.width, v.height, v.min_depth, v.max_depth);
                }
                Command::SetScissor(s) => pass.set_scissor_rect(s.x, s.y, s.width, s.height),
                Command::SetBlendConstant(c) => pass.set_blend_constant(color(c)),
                Command::SetStencilReference(r) => pass.set_stencil_reference(r),
                Command::SetVertexBuffer { slot, buffer, offset, size } => {
                    let buffer = lookup(&self.buffers, buffer, ResourceKind::Buffer)?;
                    let slice = match size {
                        Some(size) => buffer.slice(offset..offset + size),
                        None => buffer.slice(offset..),
                    };
                    pass.set_vertex_buffer(slot, slice);
                }
                Command::SetIndexBuffer { buffer, format, offset } => {
                    let buffer = lookup(&self.buffers, buffer, ResourceKind::Buffer)?;
                    pass.set_index_buffer(buffer.slice(offset..), format);
                }
                Command::SetBindGroup { index, group } => {
                    pass.set_bind_group(index, lookup(&self.bind_groups, group, ResourceKind::BindGroup)?, &[]);
                }
                Command::Draw { vertex_count, instance_count, first_vertex, first_instance } => {
                    pass.draw(
                        first_vertex..first_vertex + vertex_count,
                        first_instance..first_instance + instance_count,
                    );
                }
                Command::DrawIndexed { index_count, instance_count, first_index, base_vertex, first_instance } => {
                    pass.draw_indexed(
                        first_index..first_index + index_count,
                        base_vertex,
                        first_instance..first_instance + instance_count,
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_preference_names() {
        assert_eq!(power_preference("low"), wgpu::PowerPreference::LowPower);
        assert_eq!(power_preference("none"), wgpu::PowerPreference::None);
        assert_eq!(power_preference("HIGH"), wgpu::PowerPreference::HighPerformance);
    }

    #[test]
    fn clear_ops_carry_their_value() {
        let ops = operations(LoadOp::Clear, StoreOp::Discard, 0.5f32);
        assert_eq!(ops.load, wgpu::LoadOp::Clear(0.5));
        assert_eq!(ops.store, wgpu::StoreOp::Discard);
    }
}
