//! Sampler state and the sampler cache.
//!
//! GL sampler parameters are translated into a hashable [`SamplerKey`];
//! identical keys share one backend sampler (flyweight).

use glbridge_core::Result;
use glbridge_core::constants::{MAX_LOD, MIN_LOD};
use glbridge_core::types::CompareFunc;
use rustc_hash::FxHashMap;

use crate::backend::{Backend, SamplerId};
use crate::conversions;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MinFilter {
    Nearest,
    Linear,
    NearestMipmapNearest,
    LinearMipmapNearest,
    #[default]
    NearestMipmapLinear,
    LinearMipmapLinear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MagFilter {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum WrapMode {
    #[default]
    Repeat,
    ClampToEdge,
    MirroredRepeat,
}

/// GL-side sampler parameters, owned by a texture or a sampler object.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerState {
    pub min_filter: MinFilter,
    pub mag_filter: MagFilter,
    pub wrap_s: WrapMode,
    pub wrap_t: WrapMode,
    pub wrap_r: WrapMode,
    pub min_lod: f32,
    pub max_lod: f32,
    /// Depth comparison; `Some` makes this a shadow sampler.
    pub compare: Option<CompareFunc>,
    pub max_anisotropy: u16,
}

impl Default for SamplerState {
    fn default() -> Self {
        Self {
            min_filter: MinFilter::default(),
            mag_filter: MagFilter::default(),
            wrap_s: WrapMode::default(),
            wrap_t: WrapMode::default(),
            wrap_r: WrapMode::default(),
            min_lod: -1000.0,
            max_lod: 1000.0,
            compare: None,
            max_anisotropy: 1,
        }
    }
}

impl SamplerState {
    /// Filter state that samples a single level without mipmapping.
    #[must_use]
    pub fn nearest_clamped() -> Self {
        Self {
            min_filter: MinFilter::Nearest,
            mag_filter: MagFilter::Nearest,
            wrap_s: WrapMode::ClampToEdge,
            wrap_t: WrapMode::ClampToEdge,
            wrap_r: WrapMode::ClampToEdge,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn to_key(&self) -> SamplerKey {
        let (min_filter, mipmap_filter) = conversions::min_filter(self.min_filter);
        SamplerKey {
            address_mode_u: conversions::address_mode(self.wrap_s),
            address_mode_v: conversions::address_mode(self.wrap_t),
            address_mode_w: conversions::address_mode(self.wrap_r),
            mag_filter: conversions::mag_filter(self.mag_filter),
            min_filter,
            mipmap_filter,
            lod_min_clamp_bits: self.min_lod.clamp(MIN_LOD, MAX_LOD).to_bits(),
            lod_max_clamp_bits: self.max_lod.clamp(MIN_LOD, MAX_LOD).to_bits(),
            compare: self.compare.map(|f| conversions::compare_function(f, true)),
            anisotropy_clamp: self.max_anisotropy.max(1),
        }
    }
}

/// Hashable mirror of `wgpu::SamplerDescriptor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerKey {
    pub address_mode_u: wgpu::AddressMode,
    pub address_mode_v: wgpu::AddressMode,
    pub address_mode_w: wgpu::AddressMode,
    pub mag_filter: wgpu::FilterMode,
    pub min_filter: wgpu::FilterMode,
    pub mipmap_filter: wgpu::MipmapFilterMode,
    pub lod_min_clamp_bits: u32,
    pub lod_max_clamp_bits: u32,
    pub compare: Option<wgpu::CompareFunction>,
    pub anisotropy_clamp: u16,
}

impl SamplerKey {
    #[must_use]
    pub fn to_wgpu<'a>(&self, label: Option<&'a str>) -> wgpu::SamplerDescriptor<'a> {
        wgpu::SamplerDescriptor {
            label,
            address_mode_u: self.address_mode_u,
            address_mode_v: self.address_mode_v,
            address_mode_w: self.address_mode_w,
            mag_filter: self.mag_filter,
            min_filter: self.min_filter,
            mipmap_filter: self.mipmap_filter,
            lod_min_clamp: f32::from_bits(self.lod_min_clamp_bits),
            lod_max_clamp: f32::from_bits(self.lod_max_clamp_bits),
            compare: self.compare,
            anisotropy_clamp: self.anisotropy_clamp,
            border_color: None,
        }
    }
}

/// Sampler flyweight cache, one per context.
#[derive(Debug, Default)]
pub struct SamplerCache {
    samplers: FxHashMap<SamplerKey, SamplerId>,
}

impl SamplerCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create<B: Backend>(&mut self, backend: &mut B, key: &SamplerKey) -> Result<SamplerId> {
        if let Some(&id) = self.samplers.get(key) {
            return Ok(id);
        }
        let id = backend.create_sampler(key)?;
        log::debug!("Created sampler {id:?} for {key:?}");
        self.samplers.insert(*key, id);
        Ok(id)
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.samplers.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samplers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::RecordingBackend;

    #[test]
    fn identical_states_share_a_sampler() {
        let mut backend = RecordingBackend::new();
        let mut cache = SamplerCache::new();
        let a = cache.get_or_create(&mut backend, &SamplerState::default().to_key()).unwrap();
        let b = cache.get_or_create(&mut backend, &SamplerState::default().to_key()).unwrap();
        let c = cache
            .get_or_create(&mut backend, &SamplerState::nearest_clamped().to_key())
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn lod_is_clamped_to_backend_range() {
        let key = SamplerState::default().to_key();
        assert_eq!(f32::from_bits(key.lod_min_clamp_bits), MIN_LOD);
        assert_eq!(f32::from_bits(key.lod_max_clamp_bits), MAX_LOD);
    }
}
