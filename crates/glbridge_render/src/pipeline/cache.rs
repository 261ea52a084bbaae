//! Render pipeline cache.
//!
//! Owned by one program executable: the shader stages and pipeline layout
//! are fixed for its lifetime, so the [`PipelineDescriptor`] alone
//! identifies a pipeline. Lookups are structural (`Eq` on the whole
//! descriptor), never by hash alone.
//!
//! Entries are never invalidated. A build failure is returned to the caller
//! and nothing is inserted, so a later call with the same descriptor tries
//! again rather than observing a poisoned entry.

use glbridge_core::Result;
use rustc_hash::FxHashMap;

use crate::backend::{Backend, PipelineLayoutId, RenderPipelineBuild, RenderPipelineId, ShaderStageRef};
use crate::pipeline::pipeline_key::{PipelineDescriptor, fx_hash_key};

/// Program-side inputs shared by every pipeline in one cache.
#[derive(Debug, Clone, Copy)]
pub struct PipelineStages<'a> {
    pub label: Option<&'a str>,
    pub layout: PipelineLayoutId,
    pub vertex: ShaderStageRef<'a>,
    pub fragment: Option<ShaderStageRef<'a>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineCacheStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Default)]
pub struct PipelineCache {
    pipelines: FxHashMap<PipelineDescriptor, RenderPipelineId>,
    stats: PipelineCacheStats,
}

impl PipelineCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pipeline for `desc`, building it on a miss.
    pub fn get_or_create<B: Backend>(
        &mut self,
        backend: &mut B,
        stages: &PipelineStages<'_>,
        desc: &PipelineDescriptor,
    ) -> Result<RenderPipelineId> {
        if let Some(&id) = self.pipelines.get(desc) {
            self.stats.hits += 1;
            return Ok(id);
        }

        let vertex_buffers = desc.vertex_buffer_layouts();
        let color_targets = desc.color_target_states();
        let id = backend.create_render_pipeline(&RenderPipelineBuild {
            label: stages.label,
            layout: stages.layout,
            vertex: stages.vertex,
            fragment: stages.fragment,
            vertex_buffers: &vertex_buffers,
            primitive: desc.primitive_state(),
            color_targets: &color_targets,
            depth_stencil: desc.depth_stencil_state(),
            multisample: wgpu::MultisampleState::default(),
        })?;

        self.stats.misses += 1;
        log::debug!(
            "Pipeline cache miss {:016x} ({} cached) -> {id:?}",
            fx_hash_key(desc),
            self.pipelines.len() + 1
        );
        self.pipelines.insert(desc.clone(), id);
        Ok(id)
    }

    #[inline]
    #[must_use]
    pub fn get(&self, desc: &PipelineDescriptor) -> Option<RenderPipelineId> {
        self.pipelines.get(desc).copied()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn stats(&self) -> PipelineCacheStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::{BackendEvent, RecordingBackend};

    fn stages(backend: &mut RecordingBackend) -> (PipelineLayoutId, crate::backend::ShaderModuleId) {
        let layout = backend.create_pipeline_layout(None, &[]).unwrap();
        let module = backend.create_shader_module(None, "").unwrap();
        (layout, module)
    }

    #[test]
    fn equal_descriptors_share_a_pipeline() {
        let mut backend = RecordingBackend::new();
        let log = backend.handle();
        let (layout, module) = stages(&mut backend);
        let stages = PipelineStages {
            label: None,
            layout,
            vertex: ShaderStageRef { module, entry_point: "vs_main" },
            fragment: Some(ShaderStageRef { module, entry_point: "fs_main" }),
        };
        let mut cache = PipelineCache::new();

        let a = PipelineDescriptor::new();
        let b = PipelineDescriptor::new();
        let mut c = PipelineDescriptor::new();
        c.set_front_face(wgpu::FrontFace::Cw);

        let id_a = cache.get_or_create(&mut backend, &stages, &a).unwrap();
        let id_b = cache.get_or_create(&mut backend, &stages, &b).unwrap();
        let id_c = cache.get_or_create(&mut backend, &stages, &c).unwrap();

        assert_eq!(id_a, id_b);
        assert_ne!(id_a, id_c);
        assert_eq!(cache.stats(), PipelineCacheStats { hits: 1, misses: 2 });
        assert_eq!(log.count(|e| matches!(e, BackendEvent::CreateRenderPipeline(_))), 2);
    }

    #[test]
    fn failed_builds_are_not_cached() {
        let mut backend = RecordingBackend::new();
        let log = backend.handle();
        let (layout, module) = stages(&mut backend);
        let stages = PipelineStages {
            label: None,
            layout,
            vertex: ShaderStageRef { module, entry_point: "vs_main" },
            fragment: None,
        };
        let mut cache = PipelineCache::new();
        log.fail_next_pipeline_builds(1);

        let desc = PipelineDescriptor::new();
        assert!(cache.get_or_create(&mut backend, &stages, &desc).is_err());
        assert!(cache.is_empty());
        assert!(cache.get_or_create(&mut backend, &stages, &desc).is_ok());
        assert_eq!(cache.len(), 1);
    }
}
