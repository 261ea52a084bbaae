//! Linked program executables.
//!
//! The shader compiler and linker are external; they hand over a
//! [`ProgramDesc`] with final WGSL, default uniform block sizes and the
//! sampler table. Linking here builds the fixed binding layout every
//! program shares:
//!
//! | group | bindings                                              |
//! |-------|-------------------------------------------------------|
//! | 0     | 0: vertex default uniforms, 1: fragment default uniforms |
//! | 1     | `2i`: sampler `i`, `2i + 1`: texture `i`               |
//! | 2     | 0: driver uniforms                                    |
//!
//! Each executable owns its pipeline cache; the stages and layout never
//! change after linking.

use glbridge_core::constants::round_up;
use glbridge_core::{Result, SlotMask};
use smallvec::SmallVec;
use xxhash_rust::xxh3::xxh3_128;

use crate::backend::{
    Backend, BindGroupEntry, BindGroupId, BindGroupLayoutId, BindingResource, PipelineLayoutId,
    RenderPipelineId, ShaderModuleId, ShaderStageRef,
};
use crate::bind_group::{BindGroupCache, EvictedResource};
use crate::buffer_helper::BufferHelper;
use crate::pipeline::{PipelineCache, PipelineDescriptor, PipelineStages};
use crate::render_pass::{Garbage, RenderPassManager};
use crate::uniforms::DefaultUniformBlock;

/// Shader stage owning a default uniform block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderStage {
    Vertex = 0,
    Fragment = 1,
}

/// One combined texture/sampler slot of a program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerBinding {
    /// Texture unit the frontend binds this slot to.
    pub unit: u32,
    pub sample_type: wgpu::TextureSampleType,
    pub view_dimension: wgpu::TextureViewDimension,
}

impl SamplerBinding {
    #[must_use]
    pub fn float_2d(unit: u32) -> Self {
        Self {
            unit,
            sample_type: wgpu::TextureSampleType::Float { filterable: true },
            view_dimension: wgpu::TextureViewDimension::D2,
        }
    }

    fn sampler_binding_type(&self) -> wgpu::SamplerBindingType {
        match self.sample_type {
            wgpu::TextureSampleType::Depth => wgpu::SamplerBindingType::Comparison,
            wgpu::TextureSampleType::Float { filterable: true } => wgpu::SamplerBindingType::Filtering,
            _ => wgpu::SamplerBindingType::NonFiltering,
        }
    }
}

/// Linker output consumed by [`ProgramExecutable::link`].
#[derive(Debug, Clone)]
pub struct ProgramDesc {
    pub label: Option<String>,
    pub vertex_wgsl: String,
    pub vertex_entry: String,
    pub fragment_wgsl: Option<String>,
    pub fragment_entry: String,
    /// Byte sizes of the vertex and fragment default uniform blocks.
    pub default_uniform_sizes: [u32; 2],
    pub samplers: Vec<SamplerBinding>,
    /// Vertex attribute locations the vertex stage reads.
    pub active_attributes: SlotMask,
}

impl Default for ProgramDesc {
    fn default() -> Self {
        Self {
            label: None,
            vertex_wgsl: String::new(),
            vertex_entry: "vs_main".to_string(),
            fragment_wgsl: None,
            fragment_entry: "fs_main".to_string(),
            default_uniform_sizes: [0, 0],
            samplers: Vec::new(),
            active_attributes: SlotMask::default(),
        }
    }
}

pub struct ProgramExecutable {
    label: Option<String>,
    shader_hash: u128,
    vertex_module: ShaderModuleId,
    vertex_entry: String,
    fragment_module: Option<ShaderModuleId>,
    fragment_entry: String,
    samplers: Vec<SamplerBinding>,
    active_attributes: SlotMask,

    default_uniforms: [DefaultUniformBlock; 2],
    default_uniform_offsets: [u64; 2],
    default_uniform_buffer: BufferHelper,
    default_uniform_bind_group: Option<BindGroupId>,

    default_uniforms_layout: BindGroupLayoutId,
    textures_layout: BindGroupLayoutId,
    pipeline_layout: PipelineLayoutId,
    pipelines: PipelineCache,
}

impl ProgramExecutable {
    /// Builds shader modules and layouts. `driver_uniforms_layout` is the
    /// context-wide group 2 layout.
    pub fn link<B: Backend>(
        backend: &mut B,
        desc: &ProgramDesc,
        driver_uniforms_layout: BindGroupLayoutId,
        uniform_offset_alignment: u64,
    ) -> Result<Self> {
        let label = desc.label.as_deref();
        let mut source_hash_input = desc.vertex_wgsl.clone();
        if let Some(fragment) = &desc.fragment_wgsl {
            source_hash_input.push_str(fragment);
        }
        let shader_hash = xxh3_128(source_hash_input.as_bytes());

        let vertex_module = backend.create_shader_module(label, &desc.vertex_wgsl)?;
        let fragment_module = match &desc.fragment_wgsl {
            Some(wgsl) if *wgsl == desc.vertex_wgsl => Some(vertex_module),
            Some(wgsl) => Some(backend.create_shader_module(label, wgsl)?),
            None => None,
        };

        let uniform_entries: SmallVec<[wgpu::BindGroupLayoutEntry; 2]> = [
            (0, wgpu::ShaderStages::VERTEX, desc.default_uniform_sizes[0]),
            (1, wgpu::ShaderStages::FRAGMENT, desc.default_uniform_sizes[1]),
        ]
        .into_iter()
        .filter(|&(_, _, size)| size > 0)
        .map(|(binding, visibility, _)| wgpu::BindGroupLayoutEntry {
            binding,
            visibility,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        })
        .collect();
        let default_uniforms_layout = backend.create_bind_group_layout(label, &uniform_entries)?;

        let mut texture_entries = Vec::with_capacity(desc.samplers.len() * 2);
        for (i, sampler) in desc.samplers.iter().enumerate() {
            let i = i as u32;
            texture_entries.push(wgpu::BindGroupLayoutEntry {
                binding: 2 * i,
                visibility: wgpu::ShaderStages::FRAGMENT | wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Sampler(sampler.sampler_binding_type()),
                count: None,
            });
            texture_entries.push(wgpu::BindGroupLayoutEntry {
                binding: 2 * i + 1,
                visibility: wgpu::ShaderStages::FRAGMENT | wgpu::ShaderStages::VERTEX,
                ty: wgpu::BindingType::Texture {
                    sample_type: sampler.sample_type,
                    view_dimension: sampler.view_dimension,
                    multisampled: false,
                },
                count: None,
            });
        }
        let textures_layout = backend.create_bind_group_layout(label, &texture_entries)?;

        let pipeline_layout = backend.create_pipeline_layout(
            label,
            &[default_uniforms_layout, textures_layout, driver_uniforms_layout],
        )?;

        let vertex_size = u64::from(desc.default_uniform_sizes[0]);
        let fragment_offset = if vertex_size == 0 { 0 } else { round_up(vertex_size, uniform_offset_alignment) };

        log::debug!("Linked program {:?} ({shader_hash:032x})", desc.label);
        Ok(Self {
            label: desc.label.clone(),
            shader_hash,
            vertex_module,
            vertex_entry: desc.vertex_entry.clone(),
            fragment_module,
            fragment_entry: desc.fragment_entry.clone(),
            samplers: desc.samplers.clone(),
            active_attributes: desc.active_attributes,
            default_uniforms: [
                DefaultUniformBlock::new(desc.default_uniform_sizes[0] as usize),
                DefaultUniformBlock::new(desc.default_uniform_sizes[1] as usize),
            ],
            default_uniform_offsets: [0, fragment_offset],
            default_uniform_buffer: BufferHelper::new(),
            default_uniform_bind_group: None,
            default_uniforms_layout,
            textures_layout,
            pipeline_layout,
            pipelines: PipelineCache::new(),
        })
    }

    #[inline]
    #[must_use]
    pub fn shader_hash(&self) -> u128 {
        self.shader_hash
    }

    #[inline]
    #[must_use]
    pub fn samplers(&self) -> &[SamplerBinding] {
        &self.samplers
    }

    #[inline]
    #[must_use]
    pub fn active_attributes(&self) -> SlotMask {
        self.active_attributes
    }

    #[inline]
    #[must_use]
    pub fn textures_layout(&self) -> BindGroupLayoutId {
        self.textures_layout
    }

    #[inline]
    #[must_use]
    pub fn pipeline_cache(&self) -> &PipelineCache {
        &self.pipelines
    }

    /// Looks up (or builds) the pipeline for `desc`.
    pub fn get_pipeline<B: Backend>(
        &mut self,
        backend: &mut B,
        desc: &PipelineDescriptor,
    ) -> Result<RenderPipelineId> {
        let stages = PipelineStages {
            label: self.label.as_deref(),
            layout: self.pipeline_layout,
            vertex: ShaderStageRef { module: self.vertex_module, entry_point: &self.vertex_entry },
            fragment: self
                .fragment_module
                .map(|module| ShaderStageRef { module, entry_point: &self.fragment_entry }),
        };
        self.pipelines.get_or_create(backend, &stages, desc)
    }

    // ─── Default uniforms ──────────────────────────────────────────────────

    /// Writes loose uniform bytes. Returns false if out of range.
    pub fn set_uniform(&mut self, stage: ShaderStage, offset: usize, bytes: &[u8]) -> bool {
        self.default_uniforms[stage as usize].write(offset, bytes)
    }

    #[must_use]
    pub fn has_dirty_default_uniforms(&self) -> bool {
        self.default_uniforms.iter().any(DefaultUniformBlock::is_dirty)
    }

    /// Uploads dirty default uniforms into a fresh buffer and returns the
    /// group 0 bind group.
    pub fn update_default_uniforms<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        bind_groups: &mut BindGroupCache,
    ) -> Result<BindGroupId> {
        if let Some(group) = self.default_uniform_bind_group
            && !self.has_dirty_default_uniforms()
        {
            return Ok(group);
        }

        let mut entries: SmallVec<[BindGroupEntry; 2]> = SmallVec::new();
        let total = self.default_uniform_offsets[1] + self.default_uniforms[1].size() as u64;
        if total > 0 {
            let mut data = vec![0u8; total as usize];
            for (stage, block) in self.default_uniforms.iter().enumerate() {
                let offset = self.default_uniform_offsets[stage] as usize;
                data[offset..offset + block.size()].copy_from_slice(block.bytes());
            }
            self.release_default_uniform_buffer(passes, bind_groups);
            let buffer = self.default_uniform_buffer.init_with_data(
                passes,
                wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                &data,
            )?;
            for (stage, block) in self.default_uniforms.iter().enumerate() {
                if block.size() == 0 {
                    continue;
                }
                entries.push(BindGroupEntry {
                    binding: stage as u32,
                    resource: BindingResource::Buffer {
                        buffer,
                        offset: self.default_uniform_offsets[stage],
                        size: Some(block.size() as u64),
                    },
                });
            }
        }

        let group = bind_groups.get_or_create(
            passes.backend_mut(),
            Some("default uniforms"),
            self.default_uniforms_layout,
            &entries,
        )?;
        for block in &mut self.default_uniforms {
            block.clear_dirty();
        }
        self.default_uniform_bind_group = Some(group);
        Ok(group)
    }

    fn release_default_uniform_buffer<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        bind_groups: &mut BindGroupCache,
    ) {
        if let Some(buffer) = self.default_uniform_buffer.buffer() {
            for group in bind_groups.evict(EvictedResource::Buffer(buffer)) {
                passes.defer_release(Garbage::BindGroup(group));
            }
        }
        self.default_uniform_buffer.release(passes);
        self.default_uniform_bind_group = None;
    }

    pub fn destroy<B: Backend>(&mut self, passes: &mut RenderPassManager<B>, bind_groups: &mut BindGroupCache) {
        self.release_default_uniform_buffer(passes, bind_groups);
        for layout in [self.default_uniforms_layout, self.textures_layout] {
            for group in bind_groups.evict_layout(layout) {
                passes.defer_release(Garbage::BindGroup(group));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::{BackendEvent, RecordingBackend};

    fn link(passes: &mut RenderPassManager<RecordingBackend>, desc: &ProgramDesc) -> ProgramExecutable {
        let driver = passes.backend_mut().create_bind_group_layout(None, &[]).unwrap();
        ProgramExecutable::link(passes.backend_mut(), desc, driver, 256).unwrap()
    }

    #[test]
    fn fragment_uniforms_start_aligned() {
        let mut passes = RenderPassManager::new(RecordingBackend::new());
        let program = link(
            &mut passes,
            &ProgramDesc { default_uniform_sizes: [20, 16], ..ProgramDesc::default() },
        );
        assert_eq!(program.default_uniform_offsets, [0, 256]);
    }

    #[test]
    fn clean_uniforms_reuse_bind_group() {
        let backend = RecordingBackend::new();
        let log = backend.handle();
        let mut passes = RenderPassManager::new(backend);
        let mut groups = BindGroupCache::new();
        let mut program = link(
            &mut passes,
            &ProgramDesc { default_uniform_sizes: [16, 0], ..ProgramDesc::default() },
        );
        let first = program.update_default_uniforms(&mut passes, &mut groups).unwrap();
        let again = program.update_default_uniforms(&mut passes, &mut groups).unwrap();
        assert_eq!(first, again);

        assert!(program.set_uniform(ShaderStage::Vertex, 0, &2.0f32.to_le_bytes()));
        let updated = program.update_default_uniforms(&mut passes, &mut groups).unwrap();
        assert_ne!(first, updated);
        assert_eq!(log.count(|e| matches!(e, BackendEvent::ReleaseBuffer(_))), 1);
        assert_eq!(groups.len(), 1);
    }
}
