//! Frontend texture objects.
//!
//! A [`Texture`] remembers every mip level the frontend defined and owns one
//! [`ImageHelper`]. Storage is allocated lazily from the base level and the
//! consecutive levels consistent with it; defining a level the current
//! storage cannot hold snapshots the other levels as staged copies and
//! drops the storage, to be rebuilt on next use.

use glbridge_core::types::{Extents, ImageFormat};
use glbridge_core::{BridgeError, Result};

use crate::backend::{Backend, TextureViewId};
use crate::image::{ImageDesc, ImageHelper, PixelUnpackState};
use crate::render_pass::RenderPassManager;
use crate::sampler::SamplerState;

const TEXTURE_USAGE: wgpu::TextureUsages = wgpu::TextureUsages::TEXTURE_BINDING
    .union(wgpu::TextureUsages::COPY_DST)
    .union(wgpu::TextureUsages::COPY_SRC)
    .union(wgpu::TextureUsages::RENDER_ATTACHMENT);

/// Largest level index accepted by `set_texture_levels`.
const MAX_LEVEL: u32 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelDef {
    pub extents: Extents,
    pub format: ImageFormat,
}

#[derive(Debug)]
pub struct Texture {
    image: ImageHelper,
    levels: Vec<Option<LevelDef>>,
    sampler_state: SamplerState,
    base_level: u32,
    max_level: u32,
    /// Views dropped with the last storage, for bind group eviction.
    released_views: Vec<TextureViewId>,
}

impl Default for Texture {
    fn default() -> Self {
        Self {
            image: ImageHelper::new(),
            levels: Vec::new(),
            sampler_state: SamplerState::default(),
            base_level: 0,
            max_level: MAX_LEVEL,
            released_views: Vec::new(),
        }
    }
}

impl Texture {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn image(&self) -> &ImageHelper {
        &self.image
    }

    #[inline]
    pub fn image_mut(&mut self) -> &mut ImageHelper {
        &mut self.image
    }

    #[must_use]
    pub fn level_def(&self, level: u32) -> Option<LevelDef> {
        self.levels.get(level as usize).copied().flatten()
    }

    #[inline]
    #[must_use]
    pub fn sampler_state(&self) -> &SamplerState {
        &self.sampler_state
    }

    pub fn set_sampler_state(&mut self, state: SamplerState) {
        self.sampler_state = state;
    }

    #[inline]
    #[must_use]
    pub fn base_level(&self) -> u32 {
        self.base_level
    }

    /// Defines (or redefines) one level, optionally with its contents.
    /// Returns `true` when the backend storage was dropped.
    #[allow(clippy::too_many_arguments)]
    pub fn tex_image_2d<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        level: u32,
        format: ImageFormat,
        width: u32,
        height: u32,
        data: Option<&[u8]>,
        unpack: PixelUnpackState,
    ) -> Result<bool> {
        if level > MAX_LEVEL {
            return Err(BridgeError::InvalidOperation(format!("mip level {level} out of range")));
        }
        // Anything queued for the old definition must never win a flush.
        self.image.remove_staged_updates(passes, level);

        let def = LevelDef { extents: Extents::new(width, height, 1), format };
        if self.levels.len() <= level as usize {
            self.levels.resize(level as usize + 1, None);
        }
        self.levels[level as usize] = Some(def);

        let fits = self.image.valid()
            && self.image.is_level_allocated(level)
            && self.image.level_size(level) == def.extents
            && self.image.intended_format() == format;
        let reallocated = if fits {
            false
        } else {
            self.release_storage(passes, Some(level))?;
            true
        };

        if let Some(data) = data {
            self.image.stage_texture_upload(
                passes.backend_mut(),
                level,
                0,
                [0, 0],
                def.extents,
                format,
                unpack,
                data,
            )?;
        }
        Ok(reallocated)
    }

    /// Updates a region of a defined level.
    #[allow(clippy::too_many_arguments)]
    pub fn tex_sub_image_2d<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        level: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        format: ImageFormat,
        data: &[u8],
        unpack: PixelUnpackState,
    ) -> Result<()> {
        let def = self
            .level_def(level)
            .ok_or_else(|| BridgeError::InvalidOperation(format!("level {level} is not defined")))?;
        if def.format != format {
            return Err(BridgeError::InvalidOperation(format!(
                "sub-image format {format:?} does not match level format {:?}",
                def.format
            )));
        }
        let right = x.checked_add(width);
        let bottom = y.checked_add(height);
        if right.is_none_or(|r| r > def.extents.width) || bottom.is_none_or(|b| b > def.extents.height) {
            return Err(BridgeError::InvalidOperation(format!(
                "sub-image {x},{y} {width}x{height} exceeds level {level} size {}x{}",
                def.extents.width, def.extents.height
            )));
        }
        self.image.stage_texture_upload(
            passes.backend_mut(),
            level,
            0,
            [x, y],
            Extents::new(width, height, 1),
            format,
            unpack,
            data,
        )
    }

    /// Changes the sampled level range. Returns `true` when the storage was
    /// dropped because it no longer matches.
    pub fn set_texture_levels<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        base_level: u32,
        max_level: u32,
    ) -> Result<bool> {
        if base_level > max_level || max_level > MAX_LEVEL {
            return Err(BridgeError::InvalidOperation(format!(
                "invalid level range {base_level}..={max_level}"
            )));
        }
        self.base_level = base_level;
        self.max_level = max_level;
        if !self.image.valid() {
            return Ok(false);
        }
        let wanted = self.consistent_levels();
        let current = (self.image.first_allocated_level(), self.image.level_count());
        if wanted.map(|(_, desc)| (desc.first_level, desc.level_count)) == Some(current) {
            return Ok(false);
        }
        self.release_storage(passes, None)?;
        Ok(true)
    }

    /// Base level definition plus the consecutive levels matching it.
    fn consistent_levels(&self) -> Option<(LevelDef, ImageDesc)> {
        let base = self.level_def(self.base_level)?;
        let mut level_count = 1;
        while self.base_level + level_count <= self.max_level {
            let level = self.base_level + level_count;
            let expected = LevelDef { extents: base.extents.level(level_count), format: base.format };
            if self.level_def(level) != Some(expected) {
                break;
            }
            level_count += 1;
        }
        Some((
            base,
            ImageDesc {
                extents: base.extents,
                format: base.format,
                first_level: self.base_level,
                level_count,
                usage: TEXTURE_USAGE,
            },
        ))
    }

    fn release_storage<B: Backend>(&mut self, passes: &mut RenderPassManager<B>, skip_level: Option<u32>) -> Result<()> {
        if !self.image.valid() {
            return Ok(());
        }
        self.image.stage_self_as_updates(passes, skip_level)?;
        self.released_views.extend(self.image.views());
        self.image.release_image(passes);
        Ok(())
    }

    /// Allocates storage if needed. Returns `false` when the texture is
    /// incomplete (no base level).
    pub fn ensure_image<B: Backend>(&mut self, passes: &mut RenderPassManager<B>) -> Result<bool> {
        if self.image.valid() {
            return Ok(true);
        }
        let Some((_, desc)) = self.consistent_levels() else {
            return Ok(false);
        };
        log::debug!(
            "Allocating texture storage {}x{} {:?}, levels {}..{}",
            desc.extents.width,
            desc.extents.height,
            desc.format,
            desc.first_level,
            desc.first_level + desc.level_count
        );
        self.image.init(passes, &desc)?;
        Ok(true)
    }

    /// Makes the texture ready to sample: storage allocated and every staged
    /// update applied. `None` when the texture is incomplete.
    pub fn prepare_for_sampling<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
    ) -> Result<Option<TextureViewId>> {
        if !self.ensure_image(passes)? {
            return Ok(None);
        }
        self.image.flush_all_staged_updates(passes)?;
        self.image.create_full_texture_view(passes.backend_mut()).map(Some)
    }

    /// Views released since the last call.
    pub fn take_released_views(&mut self) -> Vec<TextureViewId> {
        std::mem::take(&mut self.released_views)
    }

    pub fn destroy<B: Backend>(&mut self, passes: &mut RenderPassManager<B>) {
        self.released_views.extend(self.image.views());
        self.image.destroy(passes);
        self.levels.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::{BackendEvent, RecordingBackend};

    fn rgba(size: u32) -> Vec<u8> {
        vec![0x7F; (size * size * 4) as usize]
    }

    #[test]
    fn full_chain_allocates_once() {
        let backend = RecordingBackend::new();
        let log = backend.handle();
        let mut passes = RenderPassManager::new(backend);
        let mut texture = Texture::new();
        let unpack = PixelUnpackState::default();
        for (level, size) in [(0, 4), (1, 2), (2, 1)] {
            texture
                .tex_image_2d(&mut passes, level, ImageFormat::Rgba8Unorm, size, size, Some(&rgba(size)), unpack)
                .unwrap();
        }
        assert!(texture.prepare_for_sampling(&mut passes).unwrap().is_some());
        assert_eq!(texture.image().level_count(), 3);
        assert_eq!(log.count(|e| matches!(e, BackendEvent::CreateTexture { .. })), 1);
        assert_eq!(log.count(|e| matches!(e, BackendEvent::CopyBufferToTexture { .. })), 3);
    }

    #[test]
    fn incomplete_texture_has_no_view() {
        let mut passes = RenderPassManager::new(RecordingBackend::new());
        let mut texture = Texture::new();
        texture
            .tex_image_2d(&mut passes, 1, ImageFormat::Rgba8Unorm, 2, 2, None, PixelUnpackState::default())
            .unwrap();
        assert!(texture.prepare_for_sampling(&mut passes).unwrap().is_none());
    }

    #[test]
    fn redefining_base_drops_storage_and_keeps_other_levels() {
        let backend = RecordingBackend::new();
        let log = backend.handle();
        let mut passes = RenderPassManager::new(backend);
        let mut texture = Texture::new();
        let unpack = PixelUnpackState::default();
        texture
            .tex_image_2d(&mut passes, 0, ImageFormat::Rgba8Unorm, 2, 2, Some(&rgba(2)), unpack)
            .unwrap();
        texture
            .tex_image_2d(&mut passes, 1, ImageFormat::Rgba8Unorm, 1, 1, Some(&rgba(1)), unpack)
            .unwrap();
        texture.prepare_for_sampling(&mut passes).unwrap();

        let reallocated = texture
            .tex_image_2d(&mut passes, 0, ImageFormat::Rgba8Unorm, 2, 2, None, unpack)
            .unwrap();
        assert!(!reallocated);
        assert!(texture.image().staged_updates(0).is_empty());

        let reallocated = texture
            .tex_image_2d(&mut passes, 0, ImageFormat::Rgba16Float, 2, 2, None, unpack)
            .unwrap();
        assert!(reallocated);
        assert!(!texture.image().valid());
        assert!(!texture.take_released_views().is_empty());
        // Level 1 no longer matches the base format, so only level 0 is allocated.
        texture.prepare_for_sampling(&mut passes).unwrap();
        assert_eq!(texture.image().level_count(), 1);
        assert_eq!(log.count(|e| matches!(e, BackendEvent::CreateTexture { .. })), 2);
    }

    #[test]
    fn sub_image_outside_level_is_rejected() {
        let mut passes = RenderPassManager::new(RecordingBackend::new());
        let mut texture = Texture::new();
        let unpack = PixelUnpackState::default();
        texture
            .tex_image_2d(&mut passes, 0, ImageFormat::Rgba8Unorm, 2, 2, None, unpack)
            .unwrap();
        let err = texture
            .tex_sub_image_2d(&mut passes, 0, 1, 1, 2, 2, ImageFormat::Rgba8Unorm, &rgba(2), unpack)
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidOperation(_)));
    }
}
