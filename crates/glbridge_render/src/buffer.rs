//! Frontend buffer objects.
//!
//! A [`Buffer`] wraps one [`BufferHelper`]. Respecifying it with a different
//! size reallocates the backing buffer; the caller is told so it can
//! re-dirty every binding that referenced the old one. Writes into an
//! existing buffer go through a staging copy recorded in command order, so
//! earlier draws in the same submission keep seeing the old contents.

use glbridge_core::constants::{COPY_BUFFER_ALIGNMENT, round_down, round_up};
use glbridge_core::{BridgeError, Result};

use crate::backend::{Backend, BufferDescriptor, BufferId};
use crate::buffer_helper::BufferHelper;
use crate::render_pass::{ClosureReason, Garbage, RenderPassManager};

/// Every frontend buffer can back vertices, indices or copies.
const BUFFER_USAGE: wgpu::BufferUsages = wgpu::BufferUsages::VERTEX
    .union(wgpu::BufferUsages::INDEX)
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

#[derive(Debug, Default)]
pub struct Buffer {
    helper: BufferHelper,
    size: u64,
}

impl Buffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Size the frontend specified.
    #[inline]
    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn backing(&self) -> Option<BufferId> {
        self.helper.buffer()
    }

    #[inline]
    #[must_use]
    pub fn helper(&self) -> &BufferHelper {
        &self.helper
    }

    /// (Re)specifies the whole buffer. Returns `true` when the backing
    /// buffer changed.
    pub fn buffer_data<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        size: u64,
        data: Option<&[u8]>,
    ) -> Result<bool> {
        if let Some(data) = data
            && (data.len() as u64) < size
        {
            return Err(BridgeError::InvalidOperation(format!(
                "buffer data of {} bytes is shorter than the requested {size}",
                data.len()
            )));
        }
        if self.helper.valid() && self.size == size {
            if let Some(data) = data {
                self.buffer_sub_data(passes, 0, &data[..size as usize])?;
            }
            return Ok(false);
        }

        match data {
            Some(data) => {
                let mut padded = data[..size as usize].to_vec();
                padded.resize(round_up(size.max(1), COPY_BUFFER_ALIGNMENT) as usize, 0);
                self.helper.init_with_data(passes, BUFFER_USAGE, &padded)?;
            }
            None => {
                self.helper.init_buffer(passes, size, BUFFER_USAGE, false)?;
            }
        }
        self.size = size;
        Ok(true)
    }

    /// Updates `data.len()` bytes at `offset`.
    ///
    /// The copy range must be 4-byte aligned; unaligned edges are filled
    /// from a read-back of the current contents.
    pub fn buffer_sub_data<B: Backend>(
        &mut self,
        passes: &mut RenderPassManager<B>,
        offset: u64,
        data: &[u8],
    ) -> Result<()> {
        let dst = self
            .helper
            .buffer()
            .ok_or_else(|| BridgeError::InvalidOperation("buffer has no data store".to_string()))?;
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or_else(|| BridgeError::InvalidOperation(format!("sub-data range at {offset} overflows")))?;
        if end > self.size {
            return Err(BridgeError::InvalidOperation(format!(
                "sub-data range {offset}..{end} exceeds buffer size {}",
                self.size
            )));
        }
        if data.is_empty() {
            return Ok(());
        }

        let start = round_down(offset, COPY_BUFFER_ALIGNMENT);
        let aligned_end = round_up(end, COPY_BUFFER_ALIGNMENT).min(self.helper.size());
        let window = if start == offset && aligned_end == end {
            data.to_vec()
        } else {
            let mut window = self.helper.read_back(passes, start, aligned_end - start)?;
            let at = (offset - start) as usize;
            window[at..at + data.len()].copy_from_slice(data);
            window
        };

        let staging = passes.backend_mut().create_buffer(&BufferDescriptor {
            label: Some("buffer update staging"),
            size: window.len() as u64,
            usage: wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: true,
        })?;
        passes.backend_mut().write_mapped(staging, 0, &window)?;
        passes.backend_mut().unmap_buffer(staging)?;
        passes.end_pass(ClosureReason::BufferUpdate)?;
        passes
            .backend_mut()
            .copy_buffer_to_buffer(staging, 0, dst, start, window.len() as u64)?;
        passes.defer_release(Garbage::Buffer(staging));
        Ok(())
    }

    /// Reads `size` bytes at `offset` back to the host.
    pub fn read<B: Backend>(&self, passes: &mut RenderPassManager<B>, offset: u64, size: u64) -> Result<Vec<u8>> {
        if offset + size > self.size {
            return Err(BridgeError::InvalidOperation(format!(
                "read range {offset}..{} exceeds buffer size {}",
                offset + size,
                self.size
            )));
        }
        self.helper.read_back(passes, offset, size)
    }

    pub fn destroy<B: Backend>(&mut self, passes: &mut RenderPassManager<B>) {
        self.helper.release(passes);
        self.size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::recording::RecordingBackend;

    #[test]
    fn same_size_respecification_keeps_backing() {
        let mut passes = RenderPassManager::new(RecordingBackend::new());
        let mut buffer = Buffer::new();
        assert!(buffer.buffer_data(&mut passes, 16, Some(&[0; 16])).unwrap());
        let first = buffer.backing();
        assert!(!buffer.buffer_data(&mut passes, 16, Some(&[1; 16])).unwrap());
        assert_eq!(buffer.backing(), first);
        assert!(buffer.buffer_data(&mut passes, 32, None).unwrap());
        assert_ne!(buffer.backing(), first);
    }

    #[test]
    fn unaligned_sub_data_preserves_neighbours() {
        let mut passes = RenderPassManager::new(RecordingBackend::new());
        let mut buffer = Buffer::new();
        let initial: Vec<u8> = (0u8..12).collect();
        buffer.buffer_data(&mut passes, 12, Some(&initial)).unwrap();
        buffer.buffer_sub_data(&mut passes, 3, &[0xAA, 0xBB]).unwrap();
        let bytes = buffer.read(&mut passes, 0, 12).unwrap();
        assert_eq!(bytes, vec![0, 1, 2, 0xAA, 0xBB, 5, 6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn out_of_range_writes_are_rejected() {
        let mut passes = RenderPassManager::new(RecordingBackend::new());
        let mut buffer = Buffer::new();
        buffer.buffer_data(&mut passes, 8, None).unwrap();
        assert!(buffer.buffer_sub_data(&mut passes, 6, &[0; 4]).is_err());
    }
}
