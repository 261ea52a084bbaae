//! Deferred clear values.
//!
//! A [`ClearValuesArray`] holds at most one pending clear per attachment
//! index. Storing into an occupied index overwrites; clears never accumulate.

use glam::Vec4;
use glbridge_core::SlotMask;
use glbridge_core::constants::MAX_DRAW_BUFFERS;

/// Attachment index used for the depth clear.
pub const DEPTH_INDEX: usize = MAX_DRAW_BUFFERS;
/// Attachment index used for the stencil clear.
pub const STENCIL_INDEX: usize = MAX_DRAW_BUFFERS + 1;
const SLOT_COUNT: usize = MAX_DRAW_BUFFERS + 2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearValues {
    pub color: Vec4,
    /// Slice of a 3D attachment, `None` for 2D.
    pub depth_slice: Option<u32>,
    pub depth: f32,
    pub stencil: u32,
}

impl Default for ClearValues {
    fn default() -> Self {
        Self { color: Vec4::ZERO, depth_slice: None, depth: 1.0, stencil: 0 }
    }
}

impl ClearValues {
    #[must_use]
    pub fn color(color: Vec4) -> Self {
        Self { color, ..Self::default() }
    }

    #[must_use]
    pub fn depth_stencil(depth: f32, stencil: u32) -> Self {
        Self { depth, stencil, ..Self::default() }
    }
}

/// Pending clears keyed by attachment index.
#[derive(Debug, Clone, Default)]
pub struct ClearValuesArray {
    values: [ClearValues; SLOT_COUNT],
    enabled: SlotMask,
}

impl ClearValuesArray {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a pending clear for `index`, replacing any earlier one.
    pub fn store(&mut self, index: usize, values: ClearValues) {
        debug_assert!(index < SLOT_COUNT);
        self.values[index] = values;
        self.enabled.set(index);
    }

    #[inline]
    pub fn reset(&mut self, index: usize) {
        self.enabled.reset(index);
    }

    #[inline]
    pub fn reset_all(&mut self) {
        self.enabled.clear();
    }

    #[inline]
    #[must_use]
    pub fn test(&self, index: usize) -> bool {
        self.enabled.test(index)
    }

    #[inline]
    #[must_use]
    pub fn any(&self) -> bool {
        self.enabled.any()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.enabled.none()
    }

    /// Number of pending clears.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.enabled.count() as usize
    }

    #[inline]
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&ClearValues> {
        self.test(index).then(|| &self.values[index])
    }

    /// Draw buffers with a pending color clear.
    #[inline]
    #[must_use]
    pub fn color_mask(&self) -> SlotMask {
        self.enabled.intersection(SlotMask::first(MAX_DRAW_BUFFERS))
    }

    #[inline]
    #[must_use]
    pub fn has_depth(&self) -> bool {
        self.test(DEPTH_INDEX)
    }

    #[inline]
    #[must_use]
    pub fn has_stencil(&self) -> bool {
        self.test(STENCIL_INDEX)
    }

    #[inline]
    #[must_use]
    pub fn depth_value(&self) -> f32 {
        self.values[DEPTH_INDEX].depth
    }

    #[inline]
    #[must_use]
    pub fn stencil_value(&self) -> u32 {
        self.values[STENCIL_INDEX].stencil
    }

    /// Folds `other`'s pending clears into this set; `other` wins on overlap.
    pub fn merge(&mut self, other: &ClearValuesArray) {
        for index in other.enabled.iter() {
            self.store(index, other.values[index]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_store_overwrites() {
        let mut clears = ClearValuesArray::new();
        clears.store(0, ClearValues::color(Vec4::new(1.0, 0.0, 0.0, 1.0)));
        clears.store(0, ClearValues::color(Vec4::new(0.0, 1.0, 0.0, 1.0)));
        assert_eq!(clears.len(), 1);
        assert_eq!(clears.get(0).unwrap().color, Vec4::new(0.0, 1.0, 0.0, 1.0));
    }

    #[test]
    fn depth_and_stencil_use_reserved_slots() {
        let mut clears = ClearValuesArray::new();
        clears.store(DEPTH_INDEX, ClearValues::depth_stencil(0.5, 0));
        assert!(clears.has_depth());
        assert!(!clears.has_stencil());
        assert!(clears.color_mask().none());
        assert_eq!(clears.depth_value(), 0.5);
    }

    #[test]
    fn reset_clears_single_index() {
        let mut clears = ClearValuesArray::new();
        clears.store(1, ClearValues::default());
        clears.store(2, ClearValues::default());
        clears.reset(1);
        assert!(!clears.test(1));
        assert!(clears.test(2));
        clears.reset_all();
        assert!(clears.is_empty());
    }
}
