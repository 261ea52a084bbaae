//! Utility draws.
//!
//! [`ClearUtils`] clears color attachments by drawing: a full-screen
//! triangle with the clear color in a uniform, limited by the scissor rect
//! and the per-target write masks. Used for clears a load op cannot
//! express.

use std::fmt::Write as _;

use glam::Vec4;
use glbridge_core::constants::MAX_DRAW_BUFFERS;
use glbridge_core::state::TextureHandle;
use glbridge_core::types::{ImageFormat, Rect};
use glbridge_core::Result;
use rustc_hash::FxHashMap;
use slotmap::SlotMap;
use smallvec::SmallVec;
use xxhash_rust::xxh3::xxh3_128;

use crate::backend::{
    Backend, BindGroupEntry, BindGroupId, BindGroupLayoutId, BindingResource, PipelineLayoutId,
    RenderPipelineBuild, RenderPipelineId, ShaderModuleId, ShaderStageRef,
};
use crate::bind_group::{BindGroupCache, EvictedResource};
use crate::buffer_helper::BufferHelper;
use crate::command_buffer::{ScissorRect, Viewport};
use crate::conversions;
use crate::framebuffer::{DrawnClear, Framebuffer};
use crate::pipeline::ClearPipelineKey;
use crate::render_pass::{ClosureReason, Garbage, RenderPassManager};
use crate::texture::Texture;

/// WGSL for a clear of `targets` color outputs. `force_opaque[i]` writes
/// alpha 1 to target `i`.
fn clear_shader_source(targets: usize, force_opaque: &[bool]) -> String {
    let mut wgsl = String::from(
        "struct ClearParams {\n    color: vec4<f32>,\n}\n\
         @group(0) @binding(0) var<uniform> params: ClearParams;\n\n\
         @vertex\n\
         fn vs_main(@builtin(vertex_index) i: u32) -> @builtin(position) vec4<f32> {\n    \
         let x = f32((i << 1u) & 2u) * 2.0 - 1.0;\n    \
         let y = f32(i & 2u) * 2.0 - 1.0;\n    \
         return vec4<f32>(x, y, 0.0, 1.0);\n}\n\n\
         struct ClearOutput {\n",
    );
    for i in 0..targets {
        let _ = writeln!(wgsl, "    @location({i}) c{i}: vec4<f32>,");
    }
    wgsl.push_str("}\n\n@fragment\nfn fs_main() -> ClearOutput {\n    var out: ClearOutput;\n");
    for i in 0..targets {
        if force_opaque.get(i).copied().unwrap_or(false) {
            let _ = writeln!(wgsl, "    out.c{i} = vec4<f32>(params.color.rgb, 1.0);");
        } else {
            let _ = writeln!(wgsl, "    out.c{i} = params.color;");
        }
    }
    wgsl.push_str("    return out;\n}\n");
    wgsl
}

pub struct ClearUtils {
    layout: BindGroupLayoutId,
    pipeline_layout: PipelineLayoutId,
    modules: FxHashMap<u128, ShaderModuleId>,
    pipelines: FxHashMap<ClearPipelineKey, RenderPipelineId>,
    color_buffer: BufferHelper,
    color: Option<Vec4>,
}

impl ClearUtils {
    pub fn new<B: Backend>(backend: &mut B) -> Result<Self> {
        let layout = backend.create_bind_group_layout(
            Some("clear params"),
            &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Uniform,
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        )?;
        let pipeline_layout = backend.create_pipeline_layout(Some("clear"), &[layout])?;
        Ok(Self {
            layout,
            pipeline_layout,
            modules: FxHashMap::default(),
            pipelines: FxHashMap::default(),
            color_buffer: BufferHelper::new(),
            color: None,
        })
    }

    /// Number of clear pipelines built so far.
    #[must_use]
    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }

    fn pipeline<B: Backend>(
        &mut self,
        backend: &mut B,
        color_formats: &[Option<wgpu::TextureFormat>; MAX_DRAW_BUFFERS],
        intended_formats: &[Option<ImageFormat>; MAX_DRAW_BUFFERS],
        clear: &DrawnClear,
        depth_stencil_format: Option<wgpu::TextureFormat>,
    ) -> Result<RenderPipelineId> {
        let targets = color_formats.iter().rposition(Option::is_some).map_or(0, |last| last + 1);
        let force_opaque: SmallVec<[bool; 4]> = intended_formats[..targets]
            .iter()
            .map(|f| f.is_some_and(|f| f != f.actual() && !f.has_alpha()))
            .collect();
        let write_masks: SmallVec<[u32; 4]> = clear.color_masks[..targets]
            .iter()
            .map(|mask| mask.map_or(0, |m| conversions::color_write_mask(m).bits()))
            .collect();
        let source = clear_shader_source(targets, &force_opaque);
        let shader_hash = xxh3_128(source.as_bytes());
        let key = ClearPipelineKey {
            shader_hash,
            color_formats: color_formats[..targets].iter().copied().collect(),
            write_masks,
            force_opaque,
            depth_stencil_format,
        };
        if let Some(&pipeline) = self.pipelines.get(&key) {
            return Ok(pipeline);
        }

        let module = match self.modules.get(&shader_hash) {
            Some(&module) => module,
            None => {
                let module = backend.create_shader_module(Some("clear"), &source)?;
                self.modules.insert(shader_hash, module);
                module
            }
        };
        let color_targets: SmallVec<[Option<wgpu::ColorTargetState>; MAX_DRAW_BUFFERS]> = key
            .color_formats
            .iter()
            .zip(&key.write_masks)
            .map(|(format, &mask)| {
                format.map(|format| wgpu::ColorTargetState {
                    format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::from_bits_truncate(mask),
                })
            })
            .collect();
        let depth_stencil = depth_stencil_format.map(|format| wgpu::DepthStencilState {
            format,
            depth_write_enabled: Some(false),
            depth_compare: Some(wgpu::CompareFunction::Always),
            stencil: wgpu::StencilState::default(),
            bias: wgpu::DepthBiasState::default(),
        });
        let pipeline = backend.create_render_pipeline(&RenderPipelineBuild {
            label: Some("clear"),
            layout: self.pipeline_layout,
            vertex: ShaderStageRef { module, entry_point: "vs_main" },
            fragment: Some(ShaderStageRef { module, entry_point: "fs_main" }),
            vertex_buffers: &[],
            primitive: wgpu::PrimitiveState::default(),
            color_targets: &color_targets,
            depth_stencil,
            multisample: wgpu::MultisampleState::default(),
        })?;
        log::debug!("Built clear pipeline {pipeline:?} for {targets} target(s)");
        self.pipelines.insert(key, pipeline);
        Ok(pipeline)
    }

    fn color_bind_group<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        bind_groups: &mut BindGroupCache,
        color: Vec4,
    ) -> Result<BindGroupId> {
        if self.color != Some(color) || !self.color_buffer.valid() {
            if let Some(buffer) = self.color_buffer.buffer() {
                for group in bind_groups.evict(EvictedResource::Buffer(buffer)) {
                    passes.defer_release(Garbage::BindGroup(group));
                }
            }
            self.color_buffer.init_with_data(
                passes,
                wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                bytemuck::bytes_of(&color.to_array()),
            )?;
            self.color = Some(color);
        }
        let buffer = self.color_buffer.buffer().ok_or_else(|| {
            glbridge_core::BridgeError::InternalConsistency("clear color buffer missing".to_string())
        })?;
        bind_groups.get_or_create(
            passes.backend_mut(),
            Some("clear params"),
            self.layout,
            &[BindGroupEntry {
                binding: 0,
                resource: BindingResource::Buffer { buffer, offset: 0, size: Some(16) },
            }],
        )
    }

    /// Draws `clear` into `framebuffer`. The pass is left open; every
    /// backend bit a new pass raises is dirty afterwards.
    pub fn clear_with_draw<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        bind_groups: &mut BindGroupCache,
        framebuffer: &mut Framebuffer,
        textures: &mut SlotMap<TextureHandle, Texture>,
        clear: &DrawnClear,
    ) -> Result<()> {
        let color_formats = framebuffer.color_formats(textures);
        let intended_formats = framebuffer.intended_color_formats(textures);
        let depth_stencil_format = framebuffer.depth_stencil_format(textures).map(conversions::texture_format);
        let render_area = framebuffer.render_area(textures);

        let pipeline = self.pipeline(
            passes.backend_mut(),
            &color_formats,
            &intended_formats,
            clear,
            depth_stencil_format,
        )?;
        // The uniform upload has to land before the pass that reads it.
        let group = self.color_bind_group(passes, bind_groups, clear.color)?;

        passes.end_pass(ClosureReason::ClearWithDraw)?;
        framebuffer.start_render_pass(passes, textures)?;
        let area = Framebuffer::flip_rect(framebuffer.flip_y(), clear.area, render_area);
        let commands = passes.command_buffer()?;
        commands.set_pipeline(pipeline);
        commands.set_bind_group(0, group);
        commands.set_viewport(Viewport {
            x: 0.0,
            y: 0.0,
            width: render_area.width as f32,
            height: render_area.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        });
        commands.set_scissor_rect(scissor_rect(area));
        commands.draw(3, 1, 0, 0);
        Ok(())
    }

    pub fn destroy<B: Backend>(&mut self, passes: &mut RenderPassManager<B>, bind_groups: &mut BindGroupCache) {
        for group in bind_groups.evict_layout(self.layout) {
            passes.defer_release(Garbage::BindGroup(group));
        }
        self.color_buffer.release(passes);
        self.color = None;
    }
}

fn scissor_rect(area: Rect) -> ScissorRect {
    ScissorRect {
        x: area.x.max(0) as u32,
        y: area.y.max(0) as u32,
        width: area.width.max(0) as u32,
        height: area.height.max(0) as u32,
    }
}

#[cfg(test)]
mod tests {
    use glbridge_core::types::{ClearMask, ColorMask};
    use glbridge_core::ContextSettings;

    use super::*;
    use crate::backend::recording::{BackendEvent, RecordingBackend};
    use crate::command_buffer::Command;
    use crate::framebuffer::ClearRequest;

    #[test]
    fn opaque_targets_force_alpha() {
        let source = clear_shader_source(2, &[false, true]);
        assert!(source.contains("out.c0 = params.color;"));
        assert!(source.contains("out.c1 = vec4<f32>(params.color.rgb, 1.0);"));
    }

    #[test]
    fn scissored_clear_draws_once_and_caches_pipeline() {
        let backend = RecordingBackend::new();
        let log = backend.handle();
        let mut passes = RenderPassManager::new(backend);
        let mut textures = SlotMap::with_key();
        let mut groups = BindGroupCache::new();
        let settings = ContextSettings { default_framebuffer_size: [8, 8], ..ContextSettings::default() };
        let mut fb = Framebuffer::new_default(&mut passes, &settings).unwrap();
        let mut utils = ClearUtils::new(passes.backend_mut()).unwrap();

        let request = ClearRequest {
            mask: ClearMask::COLOR,
            color: Vec4::ONE,
            depth: 1.0,
            stencil: 0,
            color_masks: [ColorMask::ALL; MAX_DRAW_BUFFERS],
            depth_write: true,
            stencil_write_mask: 0xFF,
            scissor: Some(Rect::new(0, 0, 2, 2)),
        };
        for _ in 0..2 {
            let drawn = fb.clear(&mut passes, &mut textures, &request).unwrap().unwrap();
            utils
                .clear_with_draw(&mut passes, &mut groups, &mut fb, &mut textures, &drawn)
                .unwrap();
        }
        let commands = passes.current_commands().unwrap().commands();
        assert!(commands.contains(&Command::SetScissor(ScissorRect { x: 0, y: 6, width: 2, height: 2 })));
        assert_eq!(utils.pipeline_count(), 1);
        passes.end_pass(ClosureReason::Flush).unwrap();
        assert_eq!(log.count(|e| matches!(e, BackendEvent::CreateRenderPipeline(_))), 1);
    }
}
