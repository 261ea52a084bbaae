//! Backend buffer ownership.
//!
//! [`BufferHelper`] owns one backend buffer, rounds its size to the copy
//! alignment, supports map-at-creation writes and a blocking read-back used
//! for index range scans. Releasing goes through the pass manager so a
//! buffer referenced by the open pass outlives it.

use glbridge_core::constants::{
    BUFFER_SIZE_ALIGNMENT, COPY_BUFFER_ALIGNMENT, MAP_OFFSET_ALIGNMENT, MAP_SIZE_ALIGNMENT, round_down,
    round_up,
};
use glbridge_core::{BridgeError, Result};

use crate::backend::{Backend, BufferDescriptor, BufferId};
use crate::render_pass::{ClosureReason, Garbage, RenderPassManager};

/// Widens `[offset, offset + size)` to a mappable range.
#[must_use]
pub fn aligned_map_range(offset: u64, size: u64) -> (u64, u64) {
    let start = round_down(offset, MAP_OFFSET_ALIGNMENT);
    let size = round_up(offset + size - start, MAP_SIZE_ALIGNMENT);
    (start, size)
}

#[derive(Debug)]
pub struct BufferHelper {
    buffer: Option<BufferId>,
    size: u64,
    requested_size: u64,
    usage: wgpu::BufferUsages,
    mapped: bool,
}

impl Default for BufferHelper {
    fn default() -> Self {
        Self {
            buffer: None,
            size: 0,
            requested_size: 0,
            usage: wgpu::BufferUsages::empty(),
            mapped: false,
        }
    }
}

impl BufferHelper {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn valid(&self) -> bool {
        self.buffer.is_some()
    }

    #[inline]
    #[must_use]
    pub fn buffer(&self) -> Option<BufferId> {
        self.buffer
    }

    /// Allocated size, a multiple of 4.
    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Size the caller asked for before rounding.
    #[inline]
    #[must_use]
    pub fn requested_size(&self) -> u64 {
        self.requested_size
    }

    #[inline]
    #[must_use]
    pub fn usage(&self) -> wgpu::BufferUsages {
        self.usage
    }

    #[inline]
    #[must_use]
    pub fn is_mapped(&self) -> bool {
        self.mapped
    }

    /// (Re)creates the backing buffer. Any previous buffer is released
    /// once no open pass can still reference it.
    pub fn init_buffer<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        size: u64,
        usage: wgpu::BufferUsages,
        mapped_at_creation: bool,
    ) -> Result<BufferId> {
        self.release(passes);
        let allocated = round_up(size.max(1), BUFFER_SIZE_ALIGNMENT);
        let id = passes.backend_mut().create_buffer(&BufferDescriptor {
            label: None,
            size: allocated,
            usage,
            mapped_at_creation,
        })?;
        log::debug!("Allocated buffer {id:?}: {allocated} bytes ({size} requested), {usage:?}");
        self.buffer = Some(id);
        self.size = allocated;
        self.requested_size = size;
        self.usage = usage;
        self.mapped = mapped_at_creation;
        Ok(id)
    }

    /// Creates a buffer holding `data`, written through a creation-time mapping.
    pub fn init_with_data<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        usage: wgpu::BufferUsages,
        data: &[u8],
    ) -> Result<BufferId> {
        let id = self.init_buffer(passes, data.len() as u64, usage, true)?;
        if !data.is_empty() {
            passes.backend_mut().write_mapped(id, 0, data)?;
        }
        self.unmap(passes.backend_mut())?;
        Ok(id)
    }

    pub fn write_mapped<B: Backend>(&mut self, backend: &mut B, offset: u64, data: &[u8]) -> Result<()> {
        let id = self.require()?;
        if !self.mapped {
            return Err(BridgeError::InternalConsistency(format!("buffer {id:?} is not mapped")));
        }
        backend.write_mapped(id, offset, data)
    }

    pub fn unmap<B: Backend>(&mut self, backend: &mut B) -> Result<()> {
        if let Some(id) = self.buffer
            && self.mapped
        {
            backend.unmap_buffer(id)?;
        }
        self.mapped = false;
        Ok(())
    }

    /// Queue-ordered write; the destination range is padded to 4 bytes.
    pub fn write<B: Backend>(&mut self, backend: &mut B, offset: u64, data: &[u8]) -> Result<()> {
        let id = self.require()?;
        if data.len() as u64 % COPY_BUFFER_ALIGNMENT == 0 {
            return backend.write_buffer(id, offset, data);
        }
        let mut padded = data.to_vec();
        padded.resize(round_up(data.len() as u64, COPY_BUFFER_ALIGNMENT) as usize, 0);
        backend.write_buffer(id, offset, &padded)
    }

    /// Reads `size` bytes at `offset` back to the host.
    ///
    /// Copies into a `MAP_READ` staging buffer, submits everything recorded
    /// so far (closing the open pass) and blocks on the mapping.
    pub fn read_back<B: Backend>(
        &self,
        passes: &mut RenderPassManager<B>,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>> {
        let id = self.require()?;
        if size == 0 {
            return Ok(Vec::new());
        }
        let (start, span) = aligned_map_range(offset, size);
        let span = span.min(self.size - start);
        let staging = passes.backend_mut().create_buffer(&BufferDescriptor {
            label: Some("read-back staging"),
            size: round_up(span, BUFFER_SIZE_ALIGNMENT),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        })?;
        let copy_size = round_down(span, COPY_BUFFER_ALIGNMENT);
        passes.end_pass(ClosureReason::IndexRangeReadback)?;
        passes.backend_mut().copy_buffer_to_buffer(id, start, staging, 0, copy_size)?;
        passes.flush(ClosureReason::IndexRangeReadback)?;
        let bytes = passes.backend_mut().read_buffer(staging, 0, copy_size);
        passes.defer_release(Garbage::Buffer(staging));
        let bytes = bytes?;
        let skip = (offset - start) as usize;
        Ok(bytes[skip..skip + size as usize].to_vec())
    }

    pub fn release<B: Backend>(&mut self, passes: &mut RenderPassManager<B>) {
        if let Some(id) = self.buffer.take() {
            passes.defer_release(Garbage::Buffer(id));
        }
        self.size = 0;
        self.requested_size = 0;
        self.mapped = false;
    }

    fn require(&self) -> Result<BufferId> {
        self.buffer
            .ok_or_else(|| BridgeError::InternalConsistency("buffer helper has no buffer".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::RecordingBackend;

    #[test]
    fn map_ranges_are_aligned() {
        assert_eq!(aligned_map_range(0, 6), (0, 8));
        assert_eq!(aligned_map_range(10, 2), (8, 4));
        assert_eq!(aligned_map_range(13, 3), (8, 8));
    }

    #[test]
    fn sizes_round_up_to_four() {
        let mut passes = RenderPassManager::new(RecordingBackend::new());
        let mut helper = BufferHelper::new();
        helper.init_buffer(&mut passes, 6, wgpu::BufferUsages::VERTEX, false).unwrap();
        assert_eq!(helper.size(), 8);
        assert_eq!(helper.requested_size(), 6);
    }

    #[test]
    fn read_back_returns_requested_window() {
        let mut passes = RenderPassManager::new(RecordingBackend::new());
        let mut helper = BufferHelper::new();
        let data: Vec<u8> = (0u8..32).collect();
        helper
            .init_with_data(&mut passes, wgpu::BufferUsages::INDEX | wgpu::BufferUsages::COPY_SRC, &data)
            .unwrap();
        assert!(!helper.is_mapped());
        let bytes = helper.read_back(&mut passes, 10, 6).unwrap();
        assert_eq!(bytes, vec![10, 11, 12, 13, 14, 15]);
    }

    #[test]
    fn unmapped_writes_are_rejected() {
        let mut passes = RenderPassManager::new(RecordingBackend::new());
        let mut helper = BufferHelper::new();
        helper.init_buffer(&mut passes, 4, wgpu::BufferUsages::VERTEX, false).unwrap();
        let err = helper.write_mapped(passes.backend_mut(), 0, &[1, 2, 3, 4]).unwrap_err();
        assert!(err.is_internal());
    }
}
