//! Render-pass lifecycle.
//!
//! [`RenderPassManager`] owns the backend, the single open pass and the
//! backend dirty bits that pass transitions raise:
//!
//! ```text
//!   Closed ──start_pass(desc)──▶ Open ──end_pass(reason)──▶ Closed
//!                                  │
//!                                  └── commands appended in resolution order
//! ```
//!
//! Opening a pass marks [`DirtyBits::NEW_RENDER_PASS`] because backend passes
//! inherit no dynamic state. Closing a pass marks [`DirtyBits::RENDER_PASS`]
//! so the next draw opens a fresh one. `end_pass` on a closed manager only
//! re-marks that bit.

use std::fmt;

use glam::Vec4;
use glbridge_core::{BridgeError, DirtyBits, Result};
use smallvec::SmallVec;

use crate::backend::{Backend, BindGroupId, BufferId, TextureId, TextureViewId};
use crate::command_buffer::CommandBuffer;

// ─── Descriptors ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadOp {
    Load,
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Store,
    Discard,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorAttachment {
    pub view: TextureViewId,
    pub depth_slice: Option<u32>,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub clear_value: Vec4,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthStencilAttachment {
    pub view: TextureViewId,
    pub depth_load_op: LoadOp,
    pub depth_store_op: StoreOp,
    pub depth_clear_value: f32,
    pub depth_read_only: bool,
    pub stencil_load_op: LoadOp,
    pub stencil_store_op: StoreOp,
    pub stencil_clear_value: u32,
    pub stencil_read_only: bool,
}

/// The attachment configuration of one render pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RenderPassDescriptor {
    /// Indexed by draw buffer; gaps match gaps in the pipeline's targets.
    pub color_attachments: SmallVec<[Option<ColorAttachment>; 4]>,
    pub depth_stencil_attachment: Option<DepthStencilAttachment>,
}

impl RenderPassDescriptor {
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.color_attachments.iter().all(Option::is_none) && self.depth_stencil_attachment.is_none()
    }
}

#[must_use]
pub fn clear_color_attachment(
    clear_value: Vec4,
    depth_slice: Option<u32>,
    view: TextureViewId,
) -> ColorAttachment {
    ColorAttachment {
        view,
        depth_slice,
        load_op: LoadOp::Clear,
        store_op: StoreOp::Store,
        clear_value,
    }
}

/// A depth/stencil attachment clearing the aspects flagged in `has_depth` /
/// `has_stencil` and leaving the others read-only.
#[must_use]
pub fn clear_depth_stencil_attachment(
    depth: f32,
    stencil: u32,
    view: TextureViewId,
    has_depth: bool,
    has_stencil: bool,
) -> DepthStencilAttachment {
    DepthStencilAttachment {
        view,
        depth_load_op: if has_depth { LoadOp::Clear } else { LoadOp::Load },
        depth_store_op: StoreOp::Store,
        depth_clear_value: depth,
        depth_read_only: !has_depth,
        stencil_load_op: if has_stencil { LoadOp::Clear } else { LoadOp::Load },
        stencil_store_op: StoreOp::Store,
        stencil_clear_value: stencil,
        stencil_read_only: !has_stencil,
    }
}

/// Why an open pass was closed. Logged on every closure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClosureReason {
    NewRenderPass,
    FramebufferBindingChange,
    FramebufferInternalChange,
    Flush,
    Finish,
    SwapBuffers,
    ReadPixels,
    IndexRangeReadback,
    VertexArrayStreaming,
    CopyBufferToTexture,
    CopyImage,
    ClearWithDraw,
    BufferUpdate,
}

impl fmt::Display for ClosureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Backend objects whose release waits until no open pass can reference them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Garbage {
    Buffer(BufferId),
    BindGroup(BindGroupId),
    TextureView(TextureViewId),
    Texture(TextureId),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub passes_started: u64,
    pub passes_ended: u64,
    pub submits: u64,
}

struct OpenPass {
    desc: RenderPassDescriptor,
    commands: CommandBuffer,
}

// ─── Manager ───────────────────────────────────────────────────────────────

pub struct RenderPassManager<B: Backend> {
    backend: B,
    open: Option<OpenPass>,
    dirty_bits: DirtyBits,
    garbage: Vec<Garbage>,
    stats: PassStats,
}

impl<B: Backend> RenderPassManager<B> {
    #[must_use]
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            open: None,
            dirty_bits: DirtyBits::all(),
            garbage: Vec::new(),
            stats: PassStats::default(),
        }
    }

    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    #[inline]
    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    #[inline]
    #[must_use]
    pub fn has_active_pass(&self) -> bool {
        self.open.is_some()
    }

    #[inline]
    #[must_use]
    pub fn active_descriptor(&self) -> Option<&RenderPassDescriptor> {
        self.open.as_ref().map(|p| &p.desc)
    }

    /// The open pass's attachments. Passes are replayed at `end_pass`, so
    /// load ops edited here still apply as long as nothing was drawn.
    #[inline]
    pub fn active_descriptor_mut(&mut self) -> Option<&mut RenderPassDescriptor> {
        self.open.as_mut().map(|p| &mut p.desc)
    }

    #[must_use]
    pub fn active_pass_has_draws(&self) -> bool {
        self.open
            .as_ref()
            .is_some_and(|p| p.commands.commands().iter().any(|c| c.is_draw()))
    }

    #[inline]
    #[must_use]
    pub fn stats(&self) -> PassStats {
        self.stats
    }

    // ─── Dirty bits ────────────────────────────────────────────────────────

    #[inline]
    #[must_use]
    pub fn dirty_bits(&self) -> DirtyBits {
        self.dirty_bits
    }

    #[inline]
    pub fn mark_dirty(&mut self, bits: DirtyBits) {
        self.dirty_bits |= bits;
    }

    #[inline]
    pub fn take_dirty_bits(&mut self) -> DirtyBits {
        std::mem::take(&mut self.dirty_bits)
    }

    // ─── Lifecycle ─────────────────────────────────────────────────────────

    /// Opens a pass. Only valid while closed.
    pub fn start_pass(&mut self, desc: RenderPassDescriptor) -> Result<()> {
        if self.open.is_some() {
            return Err(BridgeError::InternalConsistency(
                "render pass started while another is open".to_string(),
            ));
        }
        log::trace!(
            "Starting render pass with {} color attachment(s), depth/stencil: {}",
            desc.color_attachments.len(),
            desc.depth_stencil_attachment.is_some()
        );
        self.open = Some(OpenPass { desc, commands: CommandBuffer::new() });
        self.dirty_bits |= DirtyBits::NEW_RENDER_PASS;
        self.stats.passes_started += 1;
        Ok(())
    }

    /// Closes the open pass, recording it into the backend. Idempotent.
    pub fn end_pass(&mut self, reason: ClosureReason) -> Result<()> {
        self.dirty_bits |= DirtyBits::RENDER_PASS;
        let Some(pass) = self.open.take() else {
            return Ok(());
        };
        log::debug!(
            "Ending render pass ({reason}) after {} command(s)",
            pass.commands.commands().len()
        );
        self.stats.passes_ended += 1;
        self.backend.record_render_pass(&pass.desc, pass.commands.commands())?;
        self.collect_garbage();
        Ok(())
    }

    /// Command stream of the open pass.
    pub fn command_buffer(&mut self) -> Result<&mut CommandBuffer> {
        self.open
            .as_mut()
            .map(|p| &mut p.commands)
            .ok_or_else(|| BridgeError::InternalConsistency("no render pass is open".to_string()))
    }

    /// Read-only view of the open pass's commands.
    #[must_use]
    pub fn current_commands(&self) -> Option<&CommandBuffer> {
        self.open.as_ref().map(|p| &p.commands)
    }

    /// Closes the pass and submits everything recorded. Never blocks.
    pub fn flush(&mut self, reason: ClosureReason) -> Result<()> {
        self.end_pass(reason)?;
        self.backend.submit()?;
        self.stats.submits += 1;
        self.collect_garbage();
        Ok(())
    }

    /// Flushes, then optionally blocks on device completion.
    pub fn finish(&mut self, wait_for_gpu: bool) -> Result<()> {
        self.flush(ClosureReason::Finish)?;
        if wait_for_gpu {
            self.backend.wait_for_submitted_work()?;
        }
        Ok(())
    }

    // ─── Deferred release ──────────────────────────────────────────────────

    /// Releases `garbage` once no open pass can reference it.
    pub fn defer_release(&mut self, garbage: Garbage) {
        self.garbage.push(garbage);
        if self.open.is_none() {
            self.collect_garbage();
        }
    }

    fn collect_garbage(&mut self) {
        if self.open.is_some() {
            return;
        }
        for garbage in self.garbage.drain(..) {
            match garbage {
                Garbage::Buffer(id) => self.backend.release_buffer(id),
                Garbage::BindGroup(id) => self.backend.release_bind_group(id),
                Garbage::TextureView(id) => self.backend.release_texture_view(id),
                Garbage::Texture(id) => self.backend.release_texture(id),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::{BackendEvent, RecordingBackend};

    #[test]
    fn only_one_pass_can_be_open() {
        let mut passes = RenderPassManager::new(RecordingBackend::new());
        passes.start_pass(RenderPassDescriptor::default()).unwrap();
        let err = passes.start_pass(RenderPassDescriptor::default()).unwrap_err();
        assert!(err.is_internal());
        assert!(passes.has_active_pass());
    }

    #[test]
    fn end_pass_twice_records_once() {
        let backend = RecordingBackend::new();
        let log = backend.handle();
        let mut passes = RenderPassManager::new(backend);
        passes.start_pass(RenderPassDescriptor::default()).unwrap();
        passes.end_pass(ClosureReason::Flush).unwrap();
        passes.end_pass(ClosureReason::Flush).unwrap();
        assert_eq!(log.count(|e| matches!(e, BackendEvent::RenderPass { .. })), 1);
        assert!(!passes.has_active_pass());
    }

    #[test]
    fn transitions_mark_dirty_bits() {
        let mut passes = RenderPassManager::new(RecordingBackend::new());
        passes.take_dirty_bits();
        passes.start_pass(RenderPassDescriptor::default()).unwrap();
        assert_eq!(passes.take_dirty_bits(), DirtyBits::NEW_RENDER_PASS);
        passes.end_pass(ClosureReason::NewRenderPass).unwrap();
        assert_eq!(passes.take_dirty_bits(), DirtyBits::RENDER_PASS);
    }

    #[test]
    fn garbage_waits_for_pass_end() {
        let mut backend = RecordingBackend::new();
        let log = backend.handle();
        let buffer = backend
            .create_buffer(&crate::backend::BufferDescriptor {
                label: None,
                size: 4,
                usage: wgpu::BufferUsages::VERTEX,
                mapped_at_creation: false,
            })
            .unwrap();
        let mut passes = RenderPassManager::new(backend);
        passes.start_pass(RenderPassDescriptor::default()).unwrap();
        passes.defer_release(Garbage::Buffer(buffer));
        assert_eq!(log.count(|e| matches!(e, BackendEvent::ReleaseBuffer(_))), 0);
        passes.end_pass(ClosureReason::Flush).unwrap();
        assert_eq!(log.count(|e| matches!(e, BackendEvent::ReleaseBuffer(_))), 1);
    }

    #[test]
    fn flush_submits() {
        let backend = RecordingBackend::new();
        let log = backend.handle();
        let mut passes = RenderPassManager::new(backend);
        passes.flush(ClosureReason::Flush).unwrap();
        passes.finish(true).unwrap();
        assert_eq!(log.count(|e| matches!(e, BackendEvent::Submit)), 2);
        assert_eq!(log.count(|e| matches!(e, BackendEvent::WaitIdle)), 1);
    }
}
