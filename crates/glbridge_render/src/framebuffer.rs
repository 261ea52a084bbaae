//! Framebuffers and deferred clears.
//!
//! A [`Framebuffer`] is a set of attachments: images it owns (the default
//! framebuffer) or levels of frontend textures. Full clears never touch the
//! backend directly. They are staged on the attachment images and become
//! the load ops of the next render pass over them, so a clear followed by a
//! draw costs one pass. Masked or scissored color clears are drawn.

use glam::Vec4;
use glbridge_core::constants::MAX_DRAW_BUFFERS;
use glbridge_core::state::TextureHandle;
use glbridge_core::types::{ClearMask, ColorMask, Extents, ImageFormat, Rect};
use glbridge_core::{BridgeError, ContextSettings, Result};
use slotmap::SlotMap;
use smallvec::SmallVec;

use crate::backend::{Backend, TextureId};
use crate::clear_values::{ClearValues, ClearValuesArray, DEPTH_INDEX, STENCIL_INDEX};
use crate::conversions;
use crate::image::{ImageDesc, ImageHelper};
use crate::render_pass::{
    ClosureReason, ColorAttachment, DepthStencilAttachment, LoadOp, RenderPassDescriptor,
    RenderPassManager, StoreOp,
};
use crate::texture::Texture;

/// One framebuffer attachment point.
#[derive(Debug)]
pub enum Attachment {
    Owned(ImageHelper),
    Texture { texture: TextureHandle, level: u32, layer: u32 },
}

/// What a `clear` call asks for, already filtered by the frontend masks.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearRequest {
    pub mask: ClearMask,
    pub color: Vec4,
    pub depth: f32,
    pub stencil: u32,
    pub color_masks: [ColorMask; MAX_DRAW_BUFFERS],
    pub depth_write: bool,
    pub stencil_write_mask: u32,
    /// Scissor rectangle when the scissor test is on.
    pub scissor: Option<Rect>,
}

/// A color clear that has to be drawn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DrawnClear {
    pub color: Vec4,
    pub color_masks: [Option<ColorMask>; MAX_DRAW_BUFFERS],
    pub area: Rect,
}

fn attachment_image<'a>(
    attachment: &'a mut Attachment,
    textures: &'a mut SlotMap<TextureHandle, Texture>,
) -> Result<(&'a mut ImageHelper, u32, u32)> {
    match attachment {
        Attachment::Owned(image) => Ok((image, 0, 0)),
        Attachment::Texture { texture, level, layer } => {
            let texture = textures
                .get_mut(*texture)
                .ok_or_else(|| BridgeError::InvalidOperation("attached texture was deleted".to_string()))?;
            Ok((texture.image_mut(), *level, *layer))
        }
    }
}

/// Allocates the attachment's storage when it is a texture level.
fn ensure_attachment<B: Backend>(
    attachment: &Attachment,
    passes: &mut RenderPassManager<B>,
    textures: &mut SlotMap<TextureHandle, Texture>,
) -> Result<()> {
    if let Attachment::Texture { texture, level, .. } = attachment {
        let texture = textures
            .get_mut(*texture)
            .ok_or_else(|| BridgeError::InvalidOperation("attached texture was deleted".to_string()))?;
        if !texture.ensure_image(passes)? || !texture.image().is_level_allocated(*level) {
            return Err(BridgeError::InvalidOperation(format!(
                "framebuffer attachment level {level} is incomplete"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct Framebuffer {
    color: [Option<Attachment>; MAX_DRAW_BUFFERS],
    depth_stencil: Option<Attachment>,
    flip_y: bool,
}

impl Framebuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The window-system framebuffer described by `settings`.
    pub fn new_default<B: Backend>(passes: &mut RenderPassManager<B>, settings: &ContextSettings) -> Result<Self> {
        let extents = settings.default_framebuffer_extents();
        let mut color = ImageHelper::new();
        color.init(
            passes,
            &ImageDesc {
                extents,
                format: settings.default_framebuffer_format,
                first_level: 0,
                level_count: 1,
                usage: wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::COPY_SRC
                    | wgpu::TextureUsages::COPY_DST
                    | wgpu::TextureUsages::TEXTURE_BINDING,
            },
        )?;
        let mut framebuffer = Self { flip_y: settings.flip_default_framebuffer, ..Self::default() };
        framebuffer.color[0] = Some(Attachment::Owned(color));

        if settings.default_depth_stencil {
            let mut depth_stencil = ImageHelper::new();
            depth_stencil.init(
                passes,
                &ImageDesc {
                    extents,
                    format: ImageFormat::Depth24PlusStencil8,
                    first_level: 0,
                    level_count: 1,
                    usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
                },
            )?;
            framebuffer.depth_stencil = Some(Attachment::Owned(depth_stencil));
        }
        Ok(framebuffer)
    }

    #[inline]
    #[must_use]
    pub fn flip_y(&self) -> bool {
        self.flip_y
    }

    /// Converts a GL rectangle (origin bottom-left) into image rows.
    /// Flipped framebuffers store the top row first.
    #[must_use]
    pub fn flip_rect(flip_y: bool, rect: Rect, render_area: Rect) -> Rect {
        if flip_y {
            Rect::new(rect.x, render_area.height - rect.y - rect.height, rect.width, rect.height)
        } else {
            rect
        }
    }

    pub fn attach_color(&mut self, index: usize, target: Option<(TextureHandle, u32, u32)>) -> Result<()> {
        let slot = self
            .color
            .get_mut(index)
            .ok_or_else(|| BridgeError::InvalidOperation(format!("color attachment {index} out of range")))?;
        *slot = target.map(|(texture, level, layer)| Attachment::Texture { texture, level, layer });
        Ok(())
    }

    pub fn attach_depth_stencil(&mut self, target: Option<(TextureHandle, u32, u32)>) {
        self.depth_stencil = target.map(|(texture, level, layer)| Attachment::Texture { texture, level, layer });
    }

    /// Whether `texture` is attached anywhere.
    #[must_use]
    pub fn references(&self, texture: TextureHandle) -> bool {
        self.color
            .iter()
            .chain(std::iter::once(&self.depth_stencil))
            .flatten()
            .any(|a| matches!(a, Attachment::Texture { texture: t, .. } if *t == texture))
    }

    /// Drops every attachment of `texture`.
    pub fn detach_texture(&mut self, texture: TextureHandle) {
        for slot in self.color.iter_mut().chain(std::iter::once(&mut self.depth_stencil)) {
            if matches!(slot, Some(Attachment::Texture { texture: t, .. }) if *t == texture) {
                *slot = None;
            }
        }
    }

    fn attachment_info(
        attachment: &Attachment,
        textures: &SlotMap<TextureHandle, Texture>,
    ) -> Option<(Extents, ImageFormat)> {
        match attachment {
            Attachment::Owned(image) => Some((image.extents(), image.intended_format())),
            Attachment::Texture { texture, level, .. } => {
                let def = textures.get(*texture)?.level_def(*level)?;
                Some((def.extents, def.format))
            }
        }
    }

    /// Size of the first attachment.
    #[must_use]
    pub fn extents(&self, textures: &SlotMap<TextureHandle, Texture>) -> Option<Extents> {
        self.color
            .iter()
            .chain(std::iter::once(&self.depth_stencil))
            .flatten()
            .find_map(|a| Self::attachment_info(a, textures))
            .map(|(extents, _)| extents)
    }

    #[must_use]
    pub fn render_area(&self, textures: &SlotMap<TextureHandle, Texture>) -> Rect {
        self.extents(textures).map_or(Rect::default(), |e| e.rect())
    }

    #[must_use]
    pub fn color_formats(
        &self,
        textures: &SlotMap<TextureHandle, Texture>,
    ) -> [Option<wgpu::TextureFormat>; MAX_DRAW_BUFFERS] {
        std::array::from_fn(|i| {
            self.color[i]
                .as_ref()
                .and_then(|a| Self::attachment_info(a, textures))
                .map(|(_, format)| conversions::texture_format(format))
        })
    }

    /// Frontend formats of the color attachments.
    #[must_use]
    pub fn intended_color_formats(
        &self,
        textures: &SlotMap<TextureHandle, Texture>,
    ) -> [Option<ImageFormat>; MAX_DRAW_BUFFERS] {
        std::array::from_fn(|i| {
            self.color[i]
                .as_ref()
                .and_then(|a| Self::attachment_info(a, textures))
                .map(|(_, format)| format)
        })
    }

    #[must_use]
    pub fn depth_stencil_format(&self, textures: &SlotMap<TextureHandle, Texture>) -> Option<ImageFormat> {
        self.depth_stencil
            .as_ref()
            .and_then(|a| Self::attachment_info(a, textures))
            .map(|(_, format)| format)
    }

    // ─── Render passes ─────────────────────────────────────────────────────

    /// Opens a pass over every attachment. Staged updates are applied first,
    /// except a lone full clear, which becomes the attachment's load op.
    pub fn start_render_pass<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        textures: &mut SlotMap<TextureHandle, Texture>,
    ) -> Result<()> {
        let mut clears = ClearValuesArray::new();
        let mut color_attachments: SmallVec<[Option<ColorAttachment>; 4]> = SmallVec::new();
        let last = self.color.iter().rposition(Option::is_some).map_or(0, |last| last + 1);
        for index in 0..last {
            let Some(attachment) = self.color[index].as_mut() else {
                color_attachments.push(None);
                continue;
            };
            ensure_attachment(attachment, passes, textures)?;
            let (image, level, layer) = attachment_image(attachment, textures)?;
            image.flush_single_subresource_staged_updates(passes, level, layer, Some((&mut clears, index)))?;
            let view = image.texture_view_single_level(passes.backend_mut(), level, layer)?;
            let cleared = clears.get(index).copied();
            color_attachments.push(Some(ColorAttachment {
                view,
                depth_slice: None,
                load_op: if cleared.is_some() { LoadOp::Clear } else { LoadOp::Load },
                store_op: StoreOp::Store,
                clear_value: cleared.map_or(Vec4::ZERO, |c| c.color),
            }));
        }

        let depth_stencil_attachment = match self.depth_stencil.as_mut() {
            Some(attachment) => {
                ensure_attachment(attachment, passes, textures)?;
                let (image, level, layer) = attachment_image(attachment, textures)?;
                image.flush_single_subresource_staged_updates(passes, level, layer, Some((&mut clears, 0)))?;
                let view = image.texture_view_single_level(passes.backend_mut(), level, layer)?;
                let format = image.intended_format();
                Some(DepthStencilAttachment {
                    view,
                    depth_load_op: if clears.has_depth() { LoadOp::Clear } else { LoadOp::Load },
                    depth_store_op: StoreOp::Store,
                    depth_clear_value: clears.depth_value(),
                    depth_read_only: !format.has_depth(),
                    stencil_load_op: if clears.has_stencil() { LoadOp::Clear } else { LoadOp::Load },
                    stencil_store_op: StoreOp::Store,
                    stencil_clear_value: clears.stencil_value(),
                    stencil_read_only: !format.has_stencil(),
                })
            }
            None => None,
        };

        passes.start_pass(RenderPassDescriptor { color_attachments, depth_stencil_attachment })
    }

    // ─── Clears ────────────────────────────────────────────────────────────

    /// Applies the full parts of `request` as deferred clears and returns
    /// the color clear that must be drawn, if any.
    pub fn clear<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        textures: &mut SlotMap<TextureHandle, Texture>,
        request: &ClearRequest,
    ) -> Result<Option<DrawnClear>> {
        let render_area = self.render_area(textures);
        let area = match request.scissor {
            Some(scissor) => match scissor.clip(&render_area) {
                Some(area) => area,
                None => return Ok(None),
            },
            None => render_area,
        };
        let scissored = !area.encloses(&render_area);

        let ds_format = self.depth_stencil_format(textures);
        let clear_depth = request.mask.contains(ClearMask::DEPTH)
            && request.depth_write
            && ds_format.is_some_and(ImageFormat::has_depth);
        let stencil_mask = request.stencil_write_mask & 0xFF;
        let clear_stencil = request.mask.contains(ClearMask::STENCIL)
            && stencil_mask != 0
            && ds_format.is_some_and(ImageFormat::has_stencil);
        if (clear_depth || clear_stencil) && scissored {
            return Err(BridgeError::Unimplemented("scissored depth/stencil clear"));
        }
        if clear_stencil && stencil_mask != 0xFF {
            return Err(BridgeError::Unimplemented("masked stencil clear"));
        }

        let mut full = ClearValuesArray::new();
        let mut drawn = [None; MAX_DRAW_BUFFERS];
        if request.mask.contains(ClearMask::COLOR) {
            for (index, slot) in self.color.iter().enumerate() {
                let mask = request.color_masks[index];
                if slot.is_none() || mask == ColorMask::NONE {
                    continue;
                }
                if mask.is_all() && !scissored {
                    full.store(index, ClearValues::color(request.color));
                } else {
                    drawn[index] = Some(mask);
                }
            }
        }
        let ds_values = ClearValues::depth_stencil(request.depth, request.stencil);
        if clear_depth {
            full.store(DEPTH_INDEX, ds_values);
        }
        if clear_stencil {
            full.store(STENCIL_INDEX, ds_values);
        }

        if !full.is_empty() {
            if passes.has_active_pass() && !passes.active_pass_has_draws() {
                self.patch_open_pass(passes, &full);
            } else {
                passes.end_pass(ClosureReason::NewRenderPass)?;
                self.stage_clears(passes, textures, &full)?;
            }
        }

        Ok(drawn.iter().any(Option::is_some).then_some(DrawnClear {
            color: request.color,
            color_masks: drawn,
            area,
        }))
    }

    /// Folds clears into the open pass's load ops. Only valid before the
    /// pass records a draw.
    fn patch_open_pass<B: Backend>(&self, passes: &mut RenderPassManager<B>, clears: &ClearValuesArray) {
        let Some(desc) = passes.active_descriptor_mut() else {
            return;
        };
        for index in clears.color_mask().iter() {
            if let Some(Some(attachment)) = desc.color_attachments.get_mut(index)
                && let Some(values) = clears.get(index)
            {
                attachment.load_op = LoadOp::Clear;
                attachment.clear_value = values.color;
            }
        }
        if let Some(attachment) = desc.depth_stencil_attachment.as_mut() {
            if clears.has_depth() {
                attachment.depth_load_op = LoadOp::Clear;
                attachment.depth_clear_value = clears.depth_value();
            }
            if clears.has_stencil() {
                attachment.stencil_load_op = LoadOp::Clear;
                attachment.stencil_clear_value = clears.stencil_value();
            }
        }
    }

    /// Stages clears on the attachment images. A clear covering every
    /// aspect of a subresource replaces whatever was queued for it.
    fn stage_clears<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        textures: &mut SlotMap<TextureHandle, Texture>,
        clears: &ClearValuesArray,
    ) -> Result<()> {
        for index in clears.color_mask().iter() {
            let (Some(attachment), Some(values)) = (self.color[index].as_mut(), clears.get(index)) else {
                continue;
            };
            let values = *values;
            ensure_attachment(attachment, passes, textures)?;
            let (image, level, layer) = attachment_image(attachment, textures)?;
            image.remove_single_subresource_staged_updates(passes, level, layer, 1);
            image.stage_clear(level, layer, 1, ClearMask::COLOR, values);
        }

        if clears.has_depth() || clears.has_stencil() {
            let Some(attachment) = self.depth_stencil.as_mut() else {
                return Ok(());
            };
            ensure_attachment(attachment, passes, textures)?;
            let (image, level, layer) = attachment_image(attachment, textures)?;
            let format = image.intended_format();
            let mut aspects = ClearMask::empty();
            aspects.set(ClearMask::DEPTH, clears.has_depth());
            aspects.set(ClearMask::STENCIL, clears.has_stencil());
            let covers_all = (!format.has_depth() || clears.has_depth()) && (!format.has_stencil() || clears.has_stencil());
            if covers_all {
                image.remove_single_subresource_staged_updates(passes, level, layer, 1);
            }
            image.stage_clear(
                level,
                layer,
                1,
                aspects,
                ClearValues::depth_stencil(clears.depth_value(), clears.stencil_value()),
            );
        }
        Ok(())
    }

    // ─── Read-back & copies ────────────────────────────────────────────────

    /// Applies everything staged on color attachment `index`.
    pub fn flush_color<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        textures: &mut SlotMap<TextureHandle, Texture>,
        index: usize,
    ) -> Result<()> {
        let attachment = self.color_attachment_mut(index)?;
        ensure_attachment(attachment, passes, textures)?;
        let (image, _, _) = attachment_image(attachment, textures)?;
        image.flush_all_staged_updates(passes)?;
        Ok(())
    }

    fn color_attachment_mut(&mut self, index: usize) -> Result<&mut Attachment> {
        self.color
            .get_mut(index)
            .and_then(Option::as_mut)
            .ok_or_else(|| BridgeError::InvalidOperation(format!("no color attachment {index}")))
    }

    /// Reads `area` (framebuffer space) of color attachment `index`, rows
    /// ordered bottom-up.
    pub fn read_pixels<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        textures: &mut SlotMap<TextureHandle, Texture>,
        index: usize,
        area: Rect,
    ) -> Result<Vec<u8>> {
        let render_area = self.render_area(textures);
        let flip_y = self.flip_y;
        self.flush_color(passes, textures, index)?;
        let attachment = self.color_attachment_mut(index)?;
        let (image, level, layer) = attachment_image(attachment, textures)?;
        let area = Self::flip_rect(flip_y, area, render_area);
        if area.clip(&render_area) != Some(area) {
            return Err(BridgeError::InvalidOperation(format!("read area {area:?} exceeds the framebuffer")));
        }
        // GL rows run bottom-up; a flipped image stores the top row first.
        image.read_pixels(passes, level, layer, area, flip_y)
    }

    /// Image, level and layer of color attachment `index`.
    #[must_use]
    pub fn color_image<'a>(
        &'a self,
        textures: &'a SlotMap<TextureHandle, Texture>,
        index: usize,
    ) -> Option<(&'a ImageHelper, u32, u32)> {
        match self.color.get(index)?.as_ref()? {
            Attachment::Owned(image) => Some((image, 0, 0)),
            Attachment::Texture { texture, level, layer } => Some((textures.get(*texture)?.image(), *level, *layer)),
        }
    }

    /// Backend texture to present, with all staged work applied.
    pub fn present_texture<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        textures: &mut SlotMap<TextureHandle, Texture>,
    ) -> Result<TextureId> {
        self.flush_color(passes, textures, 0)?;
        self.color_image(textures, 0)
            .and_then(|(image, _, _)| image.texture())
            .ok_or_else(|| BridgeError::InternalConsistency("default framebuffer has no color image".to_string()))
    }

    pub fn destroy<B: Backend>(&mut self, passes: &mut RenderPassManager<B>) {
        for attachment in self.color.iter_mut().chain(std::iter::once(&mut self.depth_stencil)) {
            if let Some(Attachment::Owned(image)) = attachment {
                image.destroy(passes);
            }
            *attachment = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::{BackendEvent, RecordingBackend};

    fn settings() -> ContextSettings {
        ContextSettings { default_framebuffer_size: [4, 4], ..ContextSettings::default() }
    }

    fn request(mask: ClearMask, color: Vec4) -> ClearRequest {
        ClearRequest {
            mask,
            color,
            depth: 1.0,
            stencil: 0,
            color_masks: [ColorMask::ALL; MAX_DRAW_BUFFERS],
            depth_write: true,
            stencil_write_mask: 0xFF,
            scissor: None,
        }
    }

    #[test]
    fn full_clear_becomes_load_op() {
        let backend = RecordingBackend::new();
        let log = backend.handle();
        let mut passes = RenderPassManager::new(backend);
        let mut textures = SlotMap::with_key();
        let mut fb = Framebuffer::new_default(&mut passes, &settings()).unwrap();

        let drawn = fb
            .clear(&mut passes, &mut textures, &request(ClearMask::COLOR | ClearMask::DEPTH, Vec4::X))
            .unwrap();
        assert!(drawn.is_none());
        fb.start_render_pass(&mut passes, &mut textures).unwrap();
        let desc = passes.active_descriptor().unwrap().clone();
        let color = desc.color_attachments[0].unwrap();
        assert_eq!(color.load_op, LoadOp::Clear);
        assert_eq!(color.clear_value, Vec4::X);
        let ds = desc.depth_stencil_attachment.unwrap();
        assert_eq!(ds.depth_load_op, LoadOp::Clear);
        assert_eq!(ds.stencil_load_op, LoadOp::Load);
        assert_eq!(log.count(|e| matches!(e, BackendEvent::RenderPass { .. })), 0);
    }

    #[test]
    fn clear_patches_pass_without_draws() {
        let mut passes = RenderPassManager::new(RecordingBackend::new());
        let mut textures = SlotMap::with_key();
        let mut fb = Framebuffer::new_default(&mut passes, &settings()).unwrap();
        fb.start_render_pass(&mut passes, &mut textures).unwrap();
        fb.clear(&mut passes, &mut textures, &request(ClearMask::COLOR, Vec4::Y)).unwrap();
        assert!(passes.has_active_pass());
        let color = passes.active_descriptor().unwrap().color_attachments[0].unwrap();
        assert_eq!(color.load_op, LoadOp::Clear);
        assert_eq!(color.clear_value, Vec4::Y);
    }

    #[test]
    fn masked_color_clear_is_drawn() {
        let mut passes = RenderPassManager::new(RecordingBackend::new());
        let mut textures = SlotMap::with_key();
        let mut fb = Framebuffer::new_default(&mut passes, &settings()).unwrap();
        let mut req = request(ClearMask::COLOR, Vec4::ONE);
        req.color_masks[0] = ColorMask { r: true, g: false, b: false, a: false };
        let drawn = fb.clear(&mut passes, &mut textures, &req).unwrap().unwrap();
        assert_eq!(drawn.area, Rect::new(0, 0, 4, 4));
        assert!(drawn.color_masks[0].is_some());
    }

    #[test]
    fn scissored_depth_clear_is_unimplemented() {
        let mut passes = RenderPassManager::new(RecordingBackend::new());
        let mut textures = SlotMap::with_key();
        let mut fb = Framebuffer::new_default(&mut passes, &settings()).unwrap();
        let mut req = request(ClearMask::DEPTH, Vec4::ZERO);
        req.scissor = Some(Rect::new(0, 0, 2, 2));
        let err = fb.clear(&mut passes, &mut textures, &req).unwrap_err();
        assert!(err.is_unimplemented());
    }

    #[test]
    fn read_pixels_sees_clear_color() {
        let mut passes = RenderPassManager::new(RecordingBackend::new());
        let mut textures = SlotMap::with_key();
        let mut fb = Framebuffer::new_default(&mut passes, &settings()).unwrap();
        fb.clear(&mut passes, &mut textures, &request(ClearMask::COLOR, Vec4::new(0.0, 0.0, 1.0, 1.0)))
            .unwrap();
        let pixels = fb.read_pixels(&mut passes, &mut textures, 0, Rect::new(1, 1, 1, 1)).unwrap();
        assert_eq!(pixels, vec![0, 0, 255, 255]);
    }
}
