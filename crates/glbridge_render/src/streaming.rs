//! Vertex and index streaming.
//!
//! Everything a draw has to upload is gathered into one host-side
//! [`StreamingBatch`]. On submit the batch becomes a single mapped staging
//! buffer plus one buffer-to-buffer copy per destination, recorded after
//! the open pass is closed so the copies land before the draw that needs
//! them.

use glbridge_core::constants::{COPY_BUFFER_ALIGNMENT, round_up};
use glbridge_core::types::{IndexType, VertexAttribFormat};
use glbridge_core::{BridgeError, Result};

use crate::backend::{Backend, BufferDescriptor, BufferId};
use crate::render_pass::{ClosureReason, Garbage, RenderPassManager};
use crate::vertex_array::{VertexConversion, VertexFormatInfo, convert_vertex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StagedCopy {
    src_offset: u64,
    dst: BufferId,
    dst_offset: u64,
    size: u64,
}

#[derive(Debug, Default)]
pub struct StreamingBatch {
    staging: Vec<u8>,
    copies: Vec<StagedCopy>,
}

impl StreamingBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves `size` bytes destined for `dst` at `dst_offset` and returns
    /// them for the caller to fill.
    pub fn stage(&mut self, dst: BufferId, dst_offset: u64, size: u64) -> &mut [u8] {
        let src_offset = self.staging.len() as u64;
        let padded = round_up(size, COPY_BUFFER_ALIGNMENT);
        self.staging.resize((src_offset + padded) as usize, 0);
        self.copies.push(StagedCopy { src_offset, dst, dst_offset, size: padded });
        &mut self.staging[src_offset as usize..(src_offset + size) as usize]
    }

    /// Number of pending copies.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.copies.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.copies.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn staging_size(&self) -> u64 {
        self.staging.len() as u64
    }

    /// Uploads the batch. Fails without touching the backend when the
    /// staging buffer would exceed `max_buffer_size`.
    pub fn submit<B: Backend>(self, passes: &mut RenderPassManager<B>, max_buffer_size: u64) -> Result<()> {
        if self.copies.is_empty() {
            return Ok(());
        }
        let required = self.staging_size();
        if required > max_buffer_size {
            return Err(BridgeError::StagingTooLarge { required, max: max_buffer_size });
        }

        passes.end_pass(ClosureReason::VertexArrayStreaming)?;
        let staging = passes.backend_mut().create_buffer(&BufferDescriptor {
            label: Some("vertex streaming staging"),
            size: required,
            usage: wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: true,
        })?;
        passes.backend_mut().write_mapped(staging, 0, &self.staging)?;
        passes.backend_mut().unmap_buffer(staging)?;
        for copy in &self.copies {
            passes
                .backend_mut()
                .copy_buffer_to_buffer(staging, copy.src_offset, copy.dst, copy.dst_offset, copy.size)?;
        }
        log::trace!("Streamed {required} bytes in {} copies", self.copies.len());
        passes.defer_release(Garbage::Buffer(staging));
        Ok(())
    }
}

/// Packs `count` elements read every `src_stride` bytes into `dst`, one
/// element every `info.dst_stride()` bytes.
pub fn pack_vertex_data(
    src: &[u8],
    src_stride: usize,
    count: usize,
    format: VertexAttribFormat,
    info: &VertexFormatInfo,
    dst: &mut [u8],
) -> Result<()> {
    let dst_stride = info.dst_stride() as usize;
    let element = format.size() as usize;
    if count == 0 {
        return Ok(());
    }
    if src.len() < (count - 1) * src_stride + element || dst.len() < count * dst_stride {
        return Err(BridgeError::InternalConsistency(format!(
            "vertex pack of {count} elements overruns its buffers"
        )));
    }

    if info.conversion == VertexConversion::None && src_stride == dst_stride {
        let len = (count - 1) * dst_stride + element;
        dst[..len].copy_from_slice(&src[..len]);
        return Ok(());
    }
    for i in 0..count {
        let s = &src[i * src_stride..i * src_stride + element];
        let d = &mut dst[i * dst_stride..(i + 1) * dst_stride];
        convert_vertex(format, info, s, d);
    }
    Ok(())
}

// ─── Indices ───────────────────────────────────────────────────────────────

/// Smallest and one-past-largest vertex referenced by `count` indices.
/// The restart index is skipped when primitive restart is enabled.
#[must_use]
pub fn index_range(ty: IndexType, indices: &[u8], count: usize, primitive_restart: bool) -> Option<(u32, u32)> {
    let restart = ty.restart_index();
    let mut range: Option<(u32, u32)> = None;
    for i in 0..count.min(indices.len() / ty.size()) {
        let index = ty.read(indices, i);
        if primitive_restart && index == restart {
            continue;
        }
        range = Some(match range {
            Some((lo, hi)) => (lo.min(index), hi.max(index.saturating_add(1))),
            None => (index, index.saturating_add(1)),
        });
    }
    range
}

/// Index data generated or rewritten on the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamedIndices {
    pub ty: IndexType,
    pub bytes: Vec<u8>,
    pub count: u32,
}

impl StreamedIndices {
    fn from_u32(indices: impl ExactSizeIterator<Item = u32>, wide: bool) -> Self {
        let count = indices.len() as u32;
        let (ty, bytes) = if wide {
            (IndexType::U32, indices.flat_map(u32::to_le_bytes).collect())
        } else {
            (IndexType::U16, indices.flat_map(|i| (i as u16).to_le_bytes()).collect())
        };
        Self { ty, bytes, count }
    }
}

/// Closes `count` array vertices starting at `first` into a loop.
#[must_use]
pub fn line_loop_indices(first: u32, count: u32) -> StreamedIndices {
    let wide = first + count >= u32::from(u16::MAX);
    let indices = (0..count).map(|i| first + i).chain(std::iter::once(first));
    StreamedIndices::from_u32(indices.collect::<Vec<_>>().into_iter(), wide)
}

/// Rewrites an indexed line loop, repeating the first index at the end.
/// Unsigned-byte indices are widened.
#[must_use]
pub fn line_loop_from_indices(ty: IndexType, indices: &[u8], count: usize) -> StreamedIndices {
    let count = count.min(indices.len() / ty.size());
    let mut out: Vec<u32> = (0..count).map(|i| ty.read(indices, i)).collect();
    if let Some(&first) = out.first() {
        out.push(first);
    }
    StreamedIndices::from_u32(out.into_iter(), ty == IndexType::U32)
}

/// Widens unsigned-byte indices to 16 bits; 0xFF restarts become 0xFFFF.
#[must_use]
pub fn widen_u8_indices(indices: &[u8], count: usize, primitive_restart: bool) -> StreamedIndices {
    let restart = IndexType::U8.restart_index() as u8;
    let widened = indices[..count.min(indices.len())].iter().map(|&i| {
        if primitive_restart && i == restart {
            u32::from(u16::MAX)
        } else {
            u32::from(i)
        }
    });
    StreamedIndices::from_u32(widened.collect::<Vec<_>>().into_iter(), false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::{BackendEvent, RecordingBackend};
    use crate::vertex_array::vertex_format_info;

    #[test]
    fn restart_index_is_not_part_of_the_range() {
        let bytes: Vec<u8> = [3u16, 0xFFFF, 7, 5].iter().flat_map(|i| i.to_le_bytes()).collect();
        assert_eq!(index_range(IndexType::U16, &bytes, 4, true), Some((3, 8)));
        assert_eq!(index_range(IndexType::U16, &bytes, 4, false), Some((3, 0x10000)));
    }

    #[test]
    fn line_loop_closes_on_first_vertex() {
        let loop_indices = line_loop_indices(4, 3);
        assert_eq!(loop_indices.ty, IndexType::U16);
        assert_eq!(loop_indices.count, 4);
        assert_eq!(loop_indices.bytes, vec![4, 0, 5, 0, 6, 0, 4, 0]);
        assert_eq!(line_loop_indices(0, 70_000).ty, IndexType::U32);
    }

    #[test]
    fn byte_indices_widen() {
        let widened = widen_u8_indices(&[1, 0xFF, 2], 3, true);
        assert_eq!(widened.bytes, vec![1, 0, 0xFF, 0xFF, 2, 0]);
        let looped = line_loop_from_indices(IndexType::U8, &[9, 8], 2);
        assert_eq!(looped.bytes, vec![9, 0, 8, 0, 9, 0]);
    }

    #[test]
    fn strided_data_is_packed() {
        let format = VertexAttribFormat::float(1);
        let info = vertex_format_info(format).unwrap();
        let src: Vec<u8> = [1.0f32, 9.0, 2.0, 9.0, 3.0].iter().flat_map(|f| f.to_le_bytes()).collect();
        let mut dst = [0u8; 12];
        pack_vertex_data(&src, 8, 3, format, &info, &mut dst).unwrap();
        let packed: Vec<f32> = dst.chunks(4).map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]])).collect();
        assert_eq!(packed, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn one_staging_buffer_per_batch() {
        let mut passes = RenderPassManager::new(RecordingBackend::new());
        let log = passes.backend().handle();
        let a = passes.backend_mut().create_buffer(&BufferDescriptor {
            label: None,
            size: 64,
            usage: wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let a = a.unwrap();
        let mut batch = StreamingBatch::new();
        batch.stage(a, 0, 16).fill(1);
        batch.stage(a, 32, 6).fill(2);
        assert_eq!(batch.staging_size(), 24);
        batch.submit(&mut passes, 1024).unwrap();

        let staging_creates = log.count(|e| {
            matches!(e, BackendEvent::CreateBuffer { label: Some(l), .. } if l == "vertex streaming staging")
        });
        assert_eq!(staging_creates, 1);
        assert_eq!(log.count(|e| matches!(e, BackendEvent::CopyBufferToBuffer { .. })), 2);
    }

    #[test]
    fn oversized_batch_is_rejected() {
        let mut passes = RenderPassManager::new(RecordingBackend::new());
        let mut batch = StreamingBatch::new();
        let dst = passes
            .backend_mut()
            .create_buffer(&BufferDescriptor {
                label: None,
                size: 64,
                usage: wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            })
            .unwrap();
        batch.stage(dst, 0, 64);
        let err = batch.submit(&mut passes, 32).unwrap_err();
        assert!(matches!(err, BridgeError::StagingTooLarge { required: 64, max: 32 }));
    }
}
