//! Bind group cache.
//!
//! A bind group is identified by its layout plus the exact resources in
//! every slot. When any member resource is reallocated its id changes, the
//! key changes with it, and the next lookup builds a fresh group. Groups
//! whose members were released are evicted with [`BindGroupCache::evict`]
//! and handed back to the caller for deferred release.

use glbridge_core::Result;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::backend::{
    Backend, BindGroupEntry, BindGroupId, BindGroupLayoutId, BindingResource, BufferId, TextureViewId,
};

/// Structural identity of a bind group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindGroupKey {
    pub layout: BindGroupLayoutId,
    pub entries: SmallVec<[BindGroupEntry; 8]>,
}

impl BindGroupKey {
    #[must_use]
    pub fn new(layout: BindGroupLayoutId, entries: &[BindGroupEntry]) -> Self {
        Self { layout, entries: SmallVec::from_slice(entries) }
    }

    #[must_use]
    pub fn references(&self, resource: EvictedResource) -> bool {
        self.entries.iter().any(|entry| match (entry.resource, resource) {
            (BindingResource::Buffer { buffer, .. }, EvictedResource::Buffer(id)) => buffer == id,
            (BindingResource::TextureView(view), EvictedResource::TextureView(id)) => view == id,
            _ => false,
        })
    }
}

/// A resource that is going away and must not stay referenced by a cached group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictedResource {
    Buffer(BufferId),
    TextureView(TextureViewId),
}

#[derive(Debug, Default)]
pub struct BindGroupCache {
    groups: FxHashMap<BindGroupKey, BindGroupId>,
}

impl BindGroupCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create<B: Backend>(
        &mut self,
        backend: &mut B,
        label: Option<&str>,
        layout: BindGroupLayoutId,
        entries: &[BindGroupEntry],
    ) -> Result<BindGroupId> {
        let key = BindGroupKey::new(layout, entries);
        if let Some(&id) = self.groups.get(&key) {
            return Ok(id);
        }
        let id = backend.create_bind_group(label, layout, entries)?;
        log::trace!("Created bind group {id:?} ({} entries)", entries.len());
        self.groups.insert(key, id);
        Ok(id)
    }

    /// Removes every group referencing `resource` and returns them.
    pub fn evict(&mut self, resource: EvictedResource) -> Vec<BindGroupId> {
        let mut evicted = Vec::new();
        self.groups.retain(|key, id| {
            if key.references(resource) {
                evicted.push(*id);
                false
            } else {
                true
            }
        });
        if !evicted.is_empty() {
            log::debug!("Evicted {} bind group(s) referencing {resource:?}", evicted.len());
        }
        evicted
    }

    /// Drops every group built against `layout`.
    pub fn evict_layout(&mut self, layout: BindGroupLayoutId) -> Vec<BindGroupId> {
        let mut evicted = Vec::new();
        self.groups.retain(|key, id| {
            if key.layout == layout {
                evicted.push(*id);
                false
            } else {
                true
            }
        });
        evicted
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BufferDescriptor;
    use crate::backend::recording::RecordingBackend;

    fn uniform_buffer(backend: &mut RecordingBackend) -> BufferId {
        backend
            .create_buffer(&BufferDescriptor {
                label: None,
                size: 64,
                usage: wgpu::BufferUsages::UNIFORM,
                mapped_at_creation: false,
            })
            .unwrap()
    }

    #[test]
    fn identical_entries_reuse_group() {
        let mut backend = RecordingBackend::new();
        let layout = backend.create_bind_group_layout(None, &[]).unwrap();
        let buffer = uniform_buffer(&mut backend);
        let entries = [BindGroupEntry {
            binding: 0,
            resource: BindingResource::Buffer { buffer, offset: 0, size: None },
        }];
        let mut cache = BindGroupCache::new();
        let a = cache.get_or_create(&mut backend, None, layout, &entries).unwrap();
        let b = cache.get_or_create(&mut backend, None, layout, &entries).unwrap();
        assert_eq!(a, b);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn eviction_drops_only_referencing_groups() {
        let mut backend = RecordingBackend::new();
        let layout = backend.create_bind_group_layout(None, &[]).unwrap();
        let first = uniform_buffer(&mut backend);
        let second = uniform_buffer(&mut backend);
        let mut cache = BindGroupCache::new();
        for buffer in [first, second] {
            let entries = [BindGroupEntry {
                binding: 0,
                resource: BindingResource::Buffer { buffer, offset: 0, size: None },
            }];
            cache.get_or_create(&mut backend, None, layout, &entries).unwrap();
        }
        assert_eq!(cache.evict(EvictedResource::Buffer(first)).len(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.evict_layout(layout).len(), 1);
        assert!(cache.is_empty());
    }
}
