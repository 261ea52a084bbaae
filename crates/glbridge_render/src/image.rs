//! Image storage and the subresource staging queue.
//!
//! Uploads and clears against an image are queued per mip level and only
//! reach the backend when the image is consumed (sampled, rendered to, read
//! or copied). Queued updates for one level apply in staging order.
//!
//! ```text
//!   stage_texture_upload ─┐
//!   stage_clear ──────────┼──▶ updates[level] ──flush──▶ copy / clear pass
//!   remove_staged_updates ┘        (dropped if the level is not allocated)
//! ```

use std::ops::Range;

use glbridge_core::constants::{COPY_BUFFER_ALIGNMENT, TEXTURE_ROW_ALIGNMENT, round_up, round_up_u32};
use glbridge_core::types::{ClearMask, Extents, ImageFormat, Rect};
use glbridge_core::{BridgeError, Result};
use rustc_hash::FxHashMap;
use smallvec::smallvec;

use crate::backend::{
    Backend, BufferDescriptor, BufferId, TexelCopyBuffer, TexelCopyTexture, TextureDescriptor,
    TextureId, TextureViewDescriptor, TextureViewId,
};
use crate::clear_values::{ClearValues, ClearValuesArray, DEPTH_INDEX, STENCIL_INDEX};
use crate::conversions;
use crate::render_pass::{
    ClosureReason, Garbage, RenderPassDescriptor, RenderPassManager, clear_color_attachment,
    clear_depth_stencil_attachment,
};

// ─── Staged updates ────────────────────────────────────────────────────────

/// One pending operation on a mip level.
#[derive(Debug, Clone, PartialEq)]
pub enum SubresourceUpdate {
    Clear {
        layer_index: u32,
        layer_count: u32,
        aspects: ClearMask,
        values: ClearValues,
    },
    DataCopy {
        layer_index: u32,
        layer_count: u32,
        buffer: BufferId,
        bytes_per_row: u32,
        rows_per_image: u32,
        origin: [u32; 2],
        extent: Extents,
    },
}

impl SubresourceUpdate {
    #[must_use]
    pub fn layers(&self) -> Range<u32> {
        match *self {
            Self::Clear { layer_index, layer_count, .. }
            | Self::DataCopy { layer_index, layer_count, .. } => layer_index..layer_index + layer_count,
        }
    }

    #[must_use]
    pub fn overlaps_layers(&self, layers: &Range<u32>) -> bool {
        let own = self.layers();
        own.start < layers.end && layers.start < own.end
    }

    #[must_use]
    pub fn staging_buffer(&self) -> Option<BufferId> {
        match *self {
            Self::DataCopy { buffer, .. } => Some(buffer),
            Self::Clear { .. } => None,
        }
    }
}

/// GL pixel unpack parameters for uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelUnpackState {
    /// Row length in pixels; 0 means the upload width.
    pub row_length: u32,
    pub alignment: u32,
}

impl Default for PixelUnpackState {
    fn default() -> Self {
        Self { row_length: 0, alignment: 4 }
    }
}

/// Bytes per row, rounded up to `alignment`.
fn pitch(texels: u64, bytes_per_texel: u64, alignment: u64) -> Result<u64> {
    texels
        .checked_mul(bytes_per_texel)
        .and_then(|bytes| bytes.div_ceil(alignment).checked_mul(alignment))
        .ok_or_else(|| BridgeError::InvalidOperation(format!("row of {texels} texels overflows")))
}

fn upload_overflow(extent: Extents) -> BridgeError {
    BridgeError::InvalidOperation(format!(
        "upload of {}x{}x{} overflows",
        extent.width, extent.height, extent.depth_or_layers
    ))
}

/// Converts client rows into backend rows. RGB8 gains an opaque alpha.
#[allow(clippy::too_many_arguments)]
fn load_image_data(
    format: ImageFormat,
    extent: Extents,
    src: &[u8],
    src_row_pitch: usize,
    src_image_pitch: usize,
    dst: &mut [u8],
    dst_row_pitch: usize,
    dst_image_pitch: usize,
) {
    let src_row_bytes = extent.width as usize * format.pixel_bytes() as usize;
    let dst_row_bytes = extent.width as usize * format.actual().pixel_bytes() as usize;
    for z in 0..extent.depth_or_layers as usize {
        for y in 0..extent.height as usize {
            let s = &src[z * src_image_pitch + y * src_row_pitch..][..src_row_bytes];
            let d = &mut dst[z * dst_image_pitch + y * dst_row_pitch..][..dst_row_bytes];
            if format == ImageFormat::Rgb8Unorm {
                for (pixel, out) in s.chunks_exact(3).zip(d.chunks_exact_mut(4)) {
                    out[..3].copy_from_slice(pixel);
                    out[3] = 0xFF;
                }
            } else {
                d.copy_from_slice(s);
            }
        }
    }
}

// ─── ImageHelper ───────────────────────────────────────────────────────────

/// Parameters for allocating backend storage.
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    /// Size of `first_level`.
    pub extents: Extents,
    pub format: ImageFormat,
    pub first_level: u32,
    pub level_count: u32,
    pub usage: wgpu::TextureUsages,
}

#[derive(Debug)]
pub struct ImageHelper {
    texture: Option<TextureId>,
    intended_format: ImageFormat,
    actual_format: wgpu::TextureFormat,
    extents: Extents,
    first_allocated_level: u32,
    level_count: u32,
    usage: wgpu::TextureUsages,
    /// Indexed by frontend mip level.
    updates: Vec<Vec<SubresourceUpdate>>,
    full_view: Option<TextureViewId>,
    level_views: FxHashMap<(u32, u32), TextureViewId>,
}

impl Default for ImageHelper {
    fn default() -> Self {
        Self {
            texture: None,
            intended_format: ImageFormat::default(),
            actual_format: conversions::texture_format(ImageFormat::default()),
            extents: Extents::default(),
            first_allocated_level: 0,
            level_count: 0,
            usage: wgpu::TextureUsages::empty(),
            updates: Vec::new(),
            full_view: None,
            level_views: FxHashMap::default(),
        }
    }
}

impl ImageHelper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates backend storage. An existing allocation is released first;
    /// staged updates are kept.
    pub fn init<B: Backend>(&mut self, passes: &mut RenderPassManager<B>, desc: &ImageDesc) -> Result<()> {
        self.release_image(passes);
        let actual_format = conversions::texture_format(desc.format);
        let texture = passes.backend_mut().create_texture(&TextureDescriptor {
            label: None,
            size: desc.extents,
            mip_level_count: desc.level_count.max(1),
            format: actual_format,
            usage: desc.usage,
        })?;
        log::debug!(
            "Allocated image {texture:?}: {}x{}x{} {:?} levels {}..{}",
            desc.extents.width,
            desc.extents.height,
            desc.extents.depth_or_layers,
            desc.format,
            desc.first_level,
            desc.first_level + desc.level_count.max(1)
        );
        self.texture = Some(texture);
        self.intended_format = desc.format;
        self.actual_format = actual_format;
        self.extents = desc.extents;
        self.first_allocated_level = desc.first_level;
        self.level_count = desc.level_count.max(1);
        self.usage = desc.usage;
        Ok(())
    }

    // ─── Accessors ─────────────────────────────────────────────────────────

    #[inline]
    #[must_use]
    pub fn valid(&self) -> bool {
        self.texture.is_some()
    }

    #[inline]
    #[must_use]
    pub fn texture(&self) -> Option<TextureId> {
        self.texture
    }

    #[inline]
    #[must_use]
    pub fn intended_format(&self) -> ImageFormat {
        self.intended_format
    }

    #[inline]
    #[must_use]
    pub fn actual_format(&self) -> wgpu::TextureFormat {
        self.actual_format
    }

    #[inline]
    #[must_use]
    pub fn extents(&self) -> Extents {
        self.extents
    }

    #[inline]
    #[must_use]
    pub fn first_allocated_level(&self) -> u32 {
        self.first_allocated_level
    }

    #[inline]
    #[must_use]
    pub fn level_count(&self) -> u32 {
        self.level_count
    }

    #[inline]
    #[must_use]
    pub fn usage(&self) -> wgpu::TextureUsages {
        self.usage
    }

    #[must_use]
    pub fn is_level_allocated(&self, level: u32) -> bool {
        self.valid()
            && level >= self.first_allocated_level
            && level < self.first_allocated_level + self.level_count
    }

    /// Size of frontend mip `level`, halving per level and clamped to 1.
    #[must_use]
    pub fn level_size(&self, level: u32) -> Extents {
        self.extents.level(level.saturating_sub(self.first_allocated_level))
    }

    fn backend_level(&self, level: u32) -> u32 {
        level - self.first_allocated_level
    }

    fn require(&self) -> Result<TextureId> {
        self.texture
            .ok_or_else(|| BridgeError::InternalConsistency("image has no backend storage".to_string()))
    }

    // ─── Staging ───────────────────────────────────────────────────────────

    fn queue_mut(&mut self, level: u32) -> &mut Vec<SubresourceUpdate> {
        let index = level as usize;
        if self.updates.len() <= index {
            self.updates.resize_with(index + 1, Vec::new);
        }
        &mut self.updates[index]
    }

    /// Copies client pixels into a fresh staging buffer and queues the
    /// buffer → image copy for `level`.
    #[allow(clippy::too_many_arguments)]
    pub fn stage_texture_upload<B: Backend>(
        &mut self,
        backend: &mut B,
        level: u32,
        layer_index: u32,
        origin: [u32; 2],
        extent: Extents,
        format: ImageFormat,
        unpack: PixelUnpackState,
        data: &[u8],
    ) -> Result<()> {
        if !format.is_color() {
            return Err(BridgeError::Unimplemented("depth/stencil texture uploads"));
        }
        if extent.width == 0 || extent.height == 0 || extent.depth_or_layers == 0 {
            return Ok(());
        }
        let src_bpp = u64::from(format.pixel_bytes());
        let dst_bpp = u64::from(format.actual().pixel_bytes());
        let row_length = if unpack.row_length == 0 { extent.width } else { unpack.row_length };
        let src_row_pitch = pitch(u64::from(row_length), src_bpp, u64::from(unpack.alignment.max(1)))?;
        let src_image_pitch = src_row_pitch
            .checked_mul(u64::from(extent.height))
            .ok_or_else(|| upload_overflow(extent))?;
        let required = src_image_pitch
            .checked_mul(u64::from(extent.depth_or_layers - 1))
            .and_then(|layers| layers.checked_add(src_row_pitch.checked_mul(u64::from(extent.height - 1))?))
            .and_then(|rows| rows.checked_add(u64::from(extent.width).checked_mul(src_bpp)?))
            .ok_or_else(|| upload_overflow(extent))?;
        if (data.len() as u64) < required {
            return Err(BridgeError::InvalidOperation(format!(
                "upload needs {required} bytes, {} provided",
                data.len()
            )));
        }
        let src_row_pitch = src_row_pitch as usize;
        let src_image_pitch = src_image_pitch as usize;

        let dst_row_pitch = pitch(u64::from(extent.width), dst_bpp, u64::from(TEXTURE_ROW_ALIGNMENT))?;
        let dst_row_pitch = u32::try_from(dst_row_pitch).map_err(|_| upload_overflow(extent))?;
        let dst_image_pitch = u64::from(dst_row_pitch) * u64::from(extent.height);
        let size = dst_image_pitch
            .checked_mul(u64::from(extent.depth_or_layers))
            .ok_or_else(|| upload_overflow(extent))? as usize;
        let dst_image_pitch = dst_image_pitch as usize;
        let mut staging = vec![0u8; size];
        load_image_data(
            format,
            extent,
            data,
            src_row_pitch,
            src_image_pitch,
            &mut staging,
            dst_row_pitch as usize,
            dst_image_pitch,
        );

        let buffer = backend.create_buffer(&BufferDescriptor {
            label: Some("texture upload staging"),
            size: round_up(size as u64, COPY_BUFFER_ALIGNMENT),
            usage: wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: true,
        })?;
        backend.write_mapped(buffer, 0, &staging)?;
        backend.unmap_buffer(buffer)?;

        self.queue_mut(level).push(SubresourceUpdate::DataCopy {
            layer_index,
            layer_count: extent.depth_or_layers,
            buffer,
            bytes_per_row: dst_row_pitch,
            rows_per_image: extent.height,
            origin,
            extent,
        });
        Ok(())
    }

    /// Queues a full clear of `aspects` on one level.
    pub fn stage_clear(
        &mut self,
        level: u32,
        layer_index: u32,
        layer_count: u32,
        aspects: ClearMask,
        mut values: ClearValues,
    ) {
        if self.intended_format != self.intended_format.actual() && !self.intended_format.has_alpha() {
            values.color.w = 1.0;
        }
        self.queue_mut(level).push(SubresourceUpdate::Clear { layer_index, layer_count, aspects, values });
    }

    /// Discards everything queued for `level`. Must run before restaging a
    /// redefined level.
    pub fn remove_staged_updates<B: Backend>(&mut self, passes: &mut RenderPassManager<B>, level: u32) {
        let Some(queue) = self.updates.get_mut(level as usize) else {
            return;
        };
        for update in queue.drain(..) {
            if let Some(buffer) = update.staging_buffer() {
                passes.defer_release(Garbage::Buffer(buffer));
            }
        }
    }

    /// Discards updates for `level` touching the given layers.
    pub fn remove_single_subresource_staged_updates<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        level: u32,
        layer_index: u32,
        layer_count: u32,
    ) {
        let Some(queue) = self.updates.get_mut(level as usize) else {
            return;
        };
        let layers = layer_index..layer_index + layer_count;
        queue.retain(|update| {
            if !update.overlaps_layers(&layers) {
                return true;
            }
            if let Some(buffer) = update.staging_buffer() {
                passes.defer_release(Garbage::Buffer(buffer));
            }
            false
        });
    }

    #[must_use]
    pub fn has_staged_updates(&self) -> bool {
        self.updates.iter().any(|q| !q.is_empty())
    }

    #[must_use]
    pub fn staged_updates(&self, level: u32) -> &[SubresourceUpdate] {
        self.updates.get(level as usize).map_or(&[], Vec::as_slice)
    }

    /// Snapshots the allocated levels (except `skip_level`) into staged
    /// copies so the storage can be reallocated without losing contents.
    pub fn stage_self_as_updates<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        skip_level: Option<u32>,
    ) -> Result<()> {
        let Some(texture) = self.texture else {
            return Ok(());
        };
        if !self.intended_format.is_color() {
            log::warn!("Contents of depth/stencil image {texture:?} are lost on reallocation");
            return Ok(());
        }
        let bpp = self.intended_format.actual().pixel_bytes();
        let first = self.first_allocated_level;
        for level in first..first + self.level_count {
            if Some(level) == skip_level {
                continue;
            }
            let size = self.level_size(level);
            let bytes_per_row = round_up_u32(size.width * bpp, TEXTURE_ROW_ALIGNMENT);
            let buffer_size = u64::from(bytes_per_row) * u64::from(size.height) * u64::from(size.depth_or_layers);
            passes.end_pass(ClosureReason::CopyImage)?;
            let buffer = passes.backend_mut().create_buffer(&BufferDescriptor {
                label: Some("image self-copy"),
                size: buffer_size,
                usage: wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })?;
            passes.backend_mut().copy_texture_to_buffer(
                &TexelCopyTexture {
                    texture,
                    mip_level: level - first,
                    origin: [0, 0, 0],
                    aspect: wgpu::TextureAspect::All,
                },
                &TexelCopyBuffer { buffer, offset: 0, bytes_per_row, rows_per_image: size.height },
                size,
            )?;
            self.queue_mut(level).insert(
                0,
                SubresourceUpdate::DataCopy {
                    layer_index: 0,
                    layer_count: size.depth_or_layers,
                    buffer,
                    bytes_per_row,
                    rows_per_image: size.height,
                    origin: [0, 0],
                    extent: size,
                },
            );
        }
        Ok(())
    }

    // ─── Flushing ──────────────────────────────────────────────────────────

    /// Applies every queued update for allocated levels and drops the rest.
    /// Returns the number of updates applied.
    pub fn flush_all_staged_updates<B: Backend>(&mut self, passes: &mut RenderPassManager<B>) -> Result<usize> {
        let mut applied = 0;
        for level in 0..self.updates.len() as u32 {
            applied += self.flush_level(passes, level, None, None)?;
        }
        Ok(applied)
    }

    /// Applies queued updates for one (level, layer). With `deferred`, a lone
    /// full clear is stored there instead, to become the next pass's load op.
    pub fn flush_single_subresource_staged_updates<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        level: u32,
        layer: u32,
        deferred: Option<(&mut ClearValuesArray, usize)>,
    ) -> Result<usize> {
        self.flush_level(passes, level, Some(layer), deferred)
    }

    fn flush_level<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        level: u32,
        layer: Option<u32>,
        deferred: Option<(&mut ClearValuesArray, usize)>,
    ) -> Result<usize> {
        let allocated = self.is_level_allocated(level);
        let all_aspects = self.aspect_mask();
        let layer_total = self.extents.depth_or_layers;
        let Some(queue) = self.updates.get_mut(level as usize) else {
            return Ok(0);
        };
        if queue.is_empty() {
            return Ok(0);
        }
        if !allocated {
            log::debug!("Dropping {} staged update(s) for unallocated level {level}", queue.len());
            for update in queue.drain(..) {
                if let Some(buffer) = update.staging_buffer() {
                    passes.defer_release(Garbage::Buffer(buffer));
                }
            }
            return Ok(0);
        }

        let mut pending = Vec::new();
        match layer {
            None => pending.append(queue),
            Some(layer) => {
                let layers = layer..layer + 1;
                let (hit, kept): (Vec<_>, Vec<_>) =
                    queue.drain(..).partition(|update| update.overlaps_layers(&layers));
                *queue = kept;
                pending = hit;
            }
        }
        if pending.is_empty() {
            return Ok(0);
        }

        // A full clear overwrites whatever was queued before it.
        if let Some(last_clear) = pending.iter().rposition(|update| {
            matches!(update, SubresourceUpdate::Clear { aspects, layer_index: 0, layer_count, .. }
                if aspects.contains(all_aspects) && *layer_count >= layer_total)
        }) {
            for update in pending.drain(..last_clear) {
                if let Some(buffer) = update.staging_buffer() {
                    passes.defer_release(Garbage::Buffer(buffer));
                }
            }
        }

        if let (Some((clears, index)), [SubresourceUpdate::Clear { aspects, values, .. }]) =
            (deferred, pending.as_slice())
        {
            if aspects.contains(ClearMask::COLOR) {
                clears.store(index, *values);
            }
            if aspects.contains(ClearMask::DEPTH) {
                clears.store(DEPTH_INDEX, *values);
            }
            if aspects.contains(ClearMask::STENCIL) {
                clears.store(STENCIL_INDEX, *values);
            }
            return Ok(1);
        }

        let texture = self.require()?;
        passes.end_pass(ClosureReason::CopyBufferToTexture)?;
        let applied = pending.len();
        for update in pending {
            match update {
                SubresourceUpdate::DataCopy {
                    layer_index,
                    buffer,
                    bytes_per_row,
                    rows_per_image,
                    origin,
                    extent,
                    ..
                } => {
                    passes.backend_mut().copy_buffer_to_texture(
                        &TexelCopyBuffer { buffer, offset: 0, bytes_per_row, rows_per_image },
                        &TexelCopyTexture {
                            texture,
                            mip_level: self.backend_level(level),
                            origin: [origin[0], origin[1], layer_index],
                            aspect: wgpu::TextureAspect::All,
                        },
                        extent,
                    )?;
                    passes.defer_release(Garbage::Buffer(buffer));
                }
                SubresourceUpdate::Clear { layer_index, layer_count, aspects, values } => {
                    for layer in layer_index..layer_index + layer_count {
                        self.clear_with_pass(passes, level, layer, aspects, &values)?;
                    }
                }
            }
        }
        Ok(applied)
    }

    fn aspect_mask(&self) -> ClearMask {
        let mut mask = ClearMask::empty();
        mask.set(ClearMask::COLOR, self.intended_format.is_color());
        mask.set(ClearMask::DEPTH, self.intended_format.has_depth());
        mask.set(ClearMask::STENCIL, self.intended_format.has_stencil());
        mask
    }

    /// Materializes a clear with a pass that only loads-with-clear.
    fn clear_with_pass<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        level: u32,
        layer: u32,
        aspects: ClearMask,
        values: &ClearValues,
    ) -> Result<()> {
        let view = self.texture_view_single_level(passes.backend_mut(), level, layer)?;
        let desc = if aspects.contains(ClearMask::COLOR) {
            RenderPassDescriptor {
                color_attachments: smallvec![Some(clear_color_attachment(values.color, values.depth_slice, view))],
                depth_stencil_attachment: None,
            }
        } else {
            RenderPassDescriptor {
                color_attachments: smallvec![],
                depth_stencil_attachment: Some(clear_depth_stencil_attachment(
                    values.depth,
                    values.stencil,
                    view,
                    aspects.contains(ClearMask::DEPTH),
                    aspects.contains(ClearMask::STENCIL),
                )),
            }
        };
        passes.start_pass(desc)?;
        passes.end_pass(ClosureReason::CopyBufferToTexture)
    }

    // ─── Views ─────────────────────────────────────────────────────────────

    pub fn create_full_texture_view<B: Backend>(&mut self, backend: &mut B) -> Result<TextureViewId> {
        if let Some(view) = self.full_view {
            return Ok(view);
        }
        let texture = self.require()?;
        let dimension = if self.extents.depth_or_layers > 1 {
            wgpu::TextureViewDimension::D2Array
        } else {
            wgpu::TextureViewDimension::D2
        };
        let view = backend.create_texture_view(
            texture,
            &TextureViewDescriptor { dimension: Some(dimension), ..Default::default() },
        )?;
        self.full_view = Some(view);
        Ok(view)
    }

    /// A 2D view of one (level, layer), as used for render targets.
    pub fn texture_view_single_level<B: Backend>(
        &mut self,
        backend: &mut B,
        level: u32,
        layer: u32,
    ) -> Result<TextureViewId> {
        if let Some(&view) = self.level_views.get(&(level, layer)) {
            return Ok(view);
        }
        let texture = self.require()?;
        if !self.is_level_allocated(level) {
            return Err(BridgeError::InvalidOperation(format!("level {level} is not allocated")));
        }
        let view = backend.create_texture_view(
            texture,
            &TextureViewDescriptor {
                base_mip_level: self.backend_level(level),
                mip_level_count: Some(1),
                base_array_layer: layer,
                array_layer_count: Some(1),
                dimension: Some(wgpu::TextureViewDimension::D2),
            },
        )?;
        self.level_views.insert((level, layer), view);
        Ok(view)
    }

    // ─── Read-back & copies ────────────────────────────────────────────────

    /// Reads `area` (texture space) of one level back, tightly packed in the
    /// actual format. `reverse_rows` returns the rows bottom-up.
    pub fn read_pixels<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        level: u32,
        layer: u32,
        area: Rect,
        reverse_rows: bool,
    ) -> Result<Vec<u8>> {
        let texture = self.require()?;
        if area.is_empty() {
            return Ok(Vec::new());
        }
        let (x, y) = (u32::try_from(area.x), u32::try_from(area.y));
        let (Ok(x), Ok(y)) = (x, y) else {
            return Err(BridgeError::InvalidOperation(format!("read area {area:?} is out of bounds")));
        };
        let width = area.width as u32;
        let height = area.height as u32;
        let bpp = self.intended_format.actual().pixel_bytes();
        let row_bytes = (width * bpp) as usize;
        let bytes_per_row = round_up_u32(width * bpp, TEXTURE_ROW_ALIGNMENT);
        let size = u64::from(bytes_per_row) * u64::from(height);

        passes.end_pass(ClosureReason::ReadPixels)?;
        let staging = passes.backend_mut().create_buffer(&BufferDescriptor {
            label: Some("read pixels"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })?;
        passes.backend_mut().copy_texture_to_buffer(
            &TexelCopyTexture {
                texture,
                mip_level: self.backend_level(level),
                origin: [x, y, layer],
                aspect: wgpu::TextureAspect::All,
            },
            &TexelCopyBuffer { buffer: staging, offset: 0, bytes_per_row, rows_per_image: height },
            Extents::new(width, height, 1),
        )?;
        passes.flush(ClosureReason::ReadPixels)?;
        let bytes = passes.backend_mut().read_buffer(staging, 0, size);
        passes.defer_release(Garbage::Buffer(staging));
        let bytes = bytes?;

        let mut pixels = Vec::with_capacity(row_bytes * height as usize);
        for row in 0..height as usize {
            let src_row = if reverse_rows { height as usize - 1 - row } else { row };
            pixels.extend_from_slice(&bytes[src_row * bytes_per_row as usize..][..row_bytes]);
        }
        Ok(pixels)
    }

    // ─── Release ───────────────────────────────────────────────────────────

    /// Releases backend storage and views; staged updates survive.
    pub fn release_image<B: Backend>(&mut self, passes: &mut RenderPassManager<B>) {
        if let Some(view) = self.full_view.take() {
            passes.defer_release(Garbage::TextureView(view));
        }
        for (_, view) in self.level_views.drain() {
            passes.defer_release(Garbage::TextureView(view));
        }
        if let Some(texture) = self.texture.take() {
            passes.defer_release(Garbage::Texture(texture));
        }
        self.level_count = 0;
    }

    pub fn release_staged_updates<B: Backend>(&mut self, passes: &mut RenderPassManager<B>) {
        for queue in &mut self.updates {
            for update in queue.drain(..) {
                if let Some(buffer) = update.staging_buffer() {
                    passes.defer_release(Garbage::Buffer(buffer));
                }
            }
        }
    }

    /// Views created so far, for eviction from bind group caches.
    pub fn views(&self) -> impl Iterator<Item = TextureViewId> + '_ {
        self.full_view.iter().copied().chain(self.level_views.values().copied())
    }

    pub fn destroy<B: Backend>(&mut self, passes: &mut RenderPassManager<B>) {
        self.release_staged_updates(passes);
        self.release_image(passes);
    }
}

/// Copies a region between two images; both must be flushed.
#[allow(clippy::too_many_arguments)]
pub fn copy_image<B: Backend>(
    passes: &mut RenderPassManager<B>,
    src: &ImageHelper,
    src_level: u32,
    src_origin: [u32; 3],
    dst: &ImageHelper,
    dst_level: u32,
    dst_origin: [u32; 3],
    extent: Extents,
) -> Result<()> {
    let src_texture = src.require()?;
    let dst_texture = dst.require()?;
    passes.end_pass(ClosureReason::CopyImage)?;
    passes.backend_mut().copy_texture_to_texture(
        &TexelCopyTexture {
            texture: src_texture,
            mip_level: src.backend_level(src_level),
            origin: src_origin,
            aspect: wgpu::TextureAspect::All,
        },
        &TexelCopyTexture {
            texture: dst_texture,
            mip_level: dst.backend_level(dst_level),
            origin: dst_origin,
            aspect: wgpu::TextureAspect::All,
        },
        extent,
    )
}

#[cfg(test)]
mod tests {
    use glam::Vec4;

    use super::*;
    use crate::backend::recording::{BackendEvent, RecordingBackend};

    fn rgba_image(passes: &mut RenderPassManager<RecordingBackend>, size: u32, levels: u32) -> ImageHelper {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut image = ImageHelper::new();
        image
            .init(
                passes,
                &ImageDesc {
                    extents: Extents::new(size, size, 1),
                    format: ImageFormat::Rgba8Unorm,
                    first_level: 0,
                    level_count: levels,
                    usage: wgpu::TextureUsages::COPY_DST
                        | wgpu::TextureUsages::COPY_SRC
                        | wgpu::TextureUsages::RENDER_ATTACHMENT,
                },
            )
            .unwrap();
        image
    }

    #[test]
    fn rgb_rows_gain_opaque_alpha() {
        let src = [1u8, 2, 3, 4, 5, 6, 0, 0];
        let mut dst = [0u8; 8];
        load_image_data(ImageFormat::Rgb8Unorm, Extents::new(2, 1, 1), &src, 8, 8, &mut dst, 8, 8);
        assert_eq!(dst, [1, 2, 3, 255, 4, 5, 6, 255]);
    }

    #[test]
    fn level_sizes_clamp_to_one() {
        let mut passes = RenderPassManager::new(RecordingBackend::new());
        let image = rgba_image(&mut passes, 8, 4);
        assert_eq!(image.level_size(2), Extents::new(2, 2, 1));
        assert_eq!(image.level_size(3), Extents::new(1, 1, 1));
        assert!(!image.is_level_allocated(4));
    }

    #[test]
    fn upload_flushes_as_one_copy_and_reads_back() {
        let backend = RecordingBackend::new();
        let log = backend.handle();
        let mut passes = RenderPassManager::new(backend);
        let mut image = rgba_image(&mut passes, 2, 1);
        let pixels: Vec<u8> = (0u8..16).collect();
        image
            .stage_texture_upload(
                passes.backend_mut(),
                0,
                0,
                [0, 0],
                Extents::new(2, 2, 1),
                ImageFormat::Rgba8Unorm,
                PixelUnpackState::default(),
                &pixels,
            )
            .unwrap();
        assert_eq!(log.count(|e| matches!(e, BackendEvent::CopyBufferToTexture { .. })), 0);
        assert_eq!(image.flush_all_staged_updates(&mut passes).unwrap(), 1);
        assert_eq!(image.flush_all_staged_updates(&mut passes).unwrap(), 0);
        assert_eq!(log.count(|e| matches!(e, BackendEvent::CopyBufferToTexture { .. })), 1);

        let read = image.read_pixels(&mut passes, 0, 0, Rect::new(0, 0, 2, 2), false).unwrap();
        assert_eq!(read, pixels);
        let flipped = image.read_pixels(&mut passes, 0, 0, Rect::new(0, 0, 2, 2), true).unwrap();
        assert_eq!(&flipped[..8], &pixels[8..]);
    }

    #[test]
    fn oversized_row_length_is_rejected() {
        let backend = RecordingBackend::new();
        let log = backend.handle();
        let mut passes = RenderPassManager::new(backend);
        let mut image = rgba_image(&mut passes, 2, 1);
        log.take_events();
        let unpack = PixelUnpackState { row_length: u32::MAX, alignment: 4 };
        let err = image
            .stage_texture_upload(
                passes.backend_mut(),
                0,
                0,
                [0, 0],
                Extents::new(2, 2, 1),
                ImageFormat::Rgba8Unorm,
                unpack,
                &[0; 16],
            )
            .unwrap_err();
        assert!(matches!(err, BridgeError::InvalidOperation(_)));
        assert!(!image.has_staged_updates());
        assert!(log.take_events().is_empty());
    }

    #[test]
    fn removed_level_applies_nothing() {
        let mut passes = RenderPassManager::new(RecordingBackend::new());
        let mut image = rgba_image(&mut passes, 4, 2);
        image.stage_clear(0, 0, 1, ClearMask::COLOR, ClearValues::color(Vec4::ONE));
        image.stage_clear(1, 0, 1, ClearMask::COLOR, ClearValues::color(Vec4::ONE));
        image.remove_staged_updates(&mut passes, 0);
        assert!(image.staged_updates(0).is_empty());
        assert_eq!(image.flush_all_staged_updates(&mut passes).unwrap(), 1);
    }

    #[test]
    fn unallocated_levels_are_dropped() {
        let mut passes = RenderPassManager::new(RecordingBackend::new());
        let mut image = rgba_image(&mut passes, 4, 1);
        image.stage_clear(3, 0, 1, ClearMask::COLOR, ClearValues::color(Vec4::ONE));
        assert_eq!(image.flush_all_staged_updates(&mut passes).unwrap(), 0);
        assert!(!image.has_staged_updates());
    }

    #[test]
    fn lone_clear_moves_into_deferred_set() {
        let backend = RecordingBackend::new();
        let log = backend.handle();
        let mut passes = RenderPassManager::new(backend);
        let mut image = rgba_image(&mut passes, 4, 1);
        image.stage_clear(0, 0, 1, ClearMask::COLOR, ClearValues::color(Vec4::new(1.0, 0.0, 0.0, 1.0)));
        image.stage_clear(0, 0, 1, ClearMask::COLOR, ClearValues::color(Vec4::new(0.0, 1.0, 0.0, 1.0)));
        let mut clears = ClearValuesArray::new();
        image
            .flush_single_subresource_staged_updates(&mut passes, 0, 0, Some((&mut clears, 0)))
            .unwrap();
        assert_eq!(clears.len(), 1);
        assert_eq!(clears.get(0).unwrap().color, Vec4::new(0.0, 1.0, 0.0, 1.0));
        assert_eq!(log.count(|e| matches!(e, BackendEvent::RenderPass { .. })), 0);
    }

    #[test]
    fn rgb_clears_force_alpha() {
        let mut passes = RenderPassManager::new(RecordingBackend::new());
        let mut image = ImageHelper::new();
        image
            .init(
                &mut passes,
                &ImageDesc {
                    extents: Extents::new(1, 1, 1),
                    format: ImageFormat::Rgb8Unorm,
                    first_level: 0,
                    level_count: 1,
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
                },
            )
            .unwrap();
        image.stage_clear(0, 0, 1, ClearMask::COLOR, ClearValues::color(Vec4::new(0.0, 0.0, 1.0, 0.0)));
        image.flush_all_staged_updates(&mut passes).unwrap();
        let read = image.read_pixels(&mut passes, 0, 0, Rect::new(0, 0, 1, 1), false).unwrap();
        assert_eq!(read, vec![0, 0, 255, 255]);
    }
}
