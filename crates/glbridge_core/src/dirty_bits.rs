//! Backend dirty bits.
//!
//! [`DirtyBits`] is the ordered set the synchronizer resolves before every
//! draw. Bit position is resolution order: a handler may only raise bits that
//! come after itself, which [`DirtyBitsIter::set_later_bits`] enforces.

use bitflags::bitflags;

use crate::errors::{BridgeError, Result};

bitflags! {
    /// Backend state that must be re-emitted before the next draw.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct DirtyBits: u32 {
        /// The pipeline descriptor changed; look up (or build) a pipeline.
        const RENDER_PIPELINE_DESC    = 1 << 0;
        /// No pass is open, or the open one targets stale attachments.
        const RENDER_PASS             = 1 << 1;
        const RENDER_PIPELINE_BINDING = 1 << 2;
        const VIEWPORT                = 1 << 3;
        const SCISSOR                 = 1 << 4;
        const BLEND_CONSTANT          = 1 << 5;
        /// See the per-slot mask kept alongside.
        const VERTEX_BUFFERS          = 1 << 6;
        const INDEX_BUFFER            = 1 << 7;
        const DRIVER_UNIFORMS         = 1 << 8;
        const BIND_GROUPS             = 1 << 9;
    }
}

impl DirtyBits {
    pub const COUNT: usize = 10;

    /// Dynamic state a freshly opened pass does not inherit.
    pub const NEW_RENDER_PASS: Self = Self::RENDER_PIPELINE_BINDING
        .union(Self::VIEWPORT)
        .union(Self::SCISSOR)
        .union(Self::BLEND_CONSTANT)
        .union(Self::VERTEX_BUFFERS)
        .union(Self::INDEX_BUFFER)
        .union(Self::DRIVER_UNIFORMS)
        .union(Self::BIND_GROUPS);

    /// Position of a single bit, used to index the handler table.
    #[inline]
    #[must_use]
    pub fn index(self) -> usize {
        debug_assert_eq!(self.bits().count_ones(), 1);
        self.bits().trailing_zeros() as usize
    }

    #[inline]
    #[must_use]
    pub fn lowest(self) -> Option<Self> {
        if self.is_empty() {
            return None;
        }
        Some(Self::from_bits_retain(self.bits() & self.bits().wrapping_neg()))
    }

    /// All bits strictly after `bit` in resolution order.
    #[inline]
    #[must_use]
    pub fn after(bit: Self) -> Self {
        let shift = bit.bits().trailing_zeros() + 1;
        let mask = if shift >= 32 { 0 } else { u32::MAX << shift };
        Self::from_bits_retain(mask) & Self::all()
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::RENDER_PIPELINE_DESC => "RENDER_PIPELINE_DESC",
            Self::RENDER_PASS => "RENDER_PASS",
            Self::RENDER_PIPELINE_BINDING => "RENDER_PIPELINE_BINDING",
            Self::VIEWPORT => "VIEWPORT",
            Self::SCISSOR => "SCISSOR",
            Self::BLEND_CONSTANT => "BLEND_CONSTANT",
            Self::VERTEX_BUFFERS => "VERTEX_BUFFERS",
            Self::INDEX_BUFFER => "INDEX_BUFFER",
            Self::DRIVER_UNIFORMS => "DRIVER_UNIFORMS",
            Self::BIND_GROUPS => "BIND_GROUPS",
            _ => "<multiple>",
        }
    }
}

/// Lowest-first iterator that lets the current handler raise later bits.
#[derive(Debug)]
pub struct DirtyBitsIter {
    pending: DirtyBits,
    current: Option<DirtyBits>,
}

impl DirtyBitsIter {
    #[must_use]
    pub fn new(bits: DirtyBits) -> Self {
        Self { pending: bits, current: None }
    }

    /// Adds bits to be resolved later in this pass.
    ///
    /// Raising the current bit or an earlier one would resolve state out of
    /// order and is rejected.
    pub fn set_later_bits(&mut self, bits: DirtyBits) -> Result<()> {
        if let Some(current) = self.current {
            let out_of_order = bits - DirtyBits::after(current);
            if !out_of_order.is_empty() {
                return Err(BridgeError::InternalConsistency(format!(
                    "{} raised out-of-order bits {out_of_order:?}",
                    current.name()
                )));
            }
        }
        self.pending |= bits;
        Ok(())
    }

    /// Bits not yet visited, excluding the current one.
    #[inline]
    #[must_use]
    pub fn remaining(&self) -> DirtyBits {
        self.pending
    }

    #[inline]
    #[must_use]
    pub fn current(&self) -> Option<DirtyBits> {
        self.current
    }
}

impl Iterator for DirtyBitsIter {
    type Item = DirtyBits;

    fn next(&mut self) -> Option<DirtyBits> {
        let bit = self.pending.lowest()?;
        self.pending.remove(bit);
        self.current = Some(bit);
        Some(bit)
    }
}

// ─── Slot masks ────────────────────────────────────────────────────────────

/// A 32-slot bitset for vertex attribute slots and draw buffer indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct SlotMask(u32);

impl SlotMask {
    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// The first `n` slots.
    #[inline]
    #[must_use]
    pub const fn first(n: usize) -> Self {
        if n >= 32 { Self(u32::MAX) } else { Self((1u32 << n) - 1) }
    }

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn set(&mut self, slot: usize) {
        self.0 |= 1 << slot;
    }

    #[inline]
    pub fn set_to(&mut self, slot: usize, value: bool) {
        if value { self.set(slot) } else { self.reset(slot) }
    }

    #[inline]
    pub fn reset(&mut self, slot: usize) {
        self.0 &= !(1 << slot);
    }

    #[inline]
    pub fn clear(&mut self) {
        self.0 = 0;
    }

    #[inline]
    #[must_use]
    pub const fn test(self, slot: usize) -> bool {
        self.0 & (1 << slot) != 0
    }

    #[inline]
    #[must_use]
    pub const fn any(self) -> bool {
        self.0 != 0
    }

    #[inline]
    #[must_use]
    pub const fn none(self) -> bool {
        self.0 == 0
    }

    #[inline]
    #[must_use]
    pub const fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Index of the highest set slot.
    #[inline]
    #[must_use]
    pub const fn last(self) -> Option<usize> {
        if self.0 == 0 { None } else { Some(31 - self.0.leading_zeros() as usize) }
    }

    #[inline]
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[inline]
    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    pub fn iter(self) -> impl Iterator<Item = usize> {
        let mut bits = self.0;
        std::iter::from_fn(move || {
            if bits == 0 {
                return None;
            }
            let slot = bits.trailing_zeros() as usize;
            bits &= bits - 1;
            Some(slot)
        })
    }
}

impl std::ops::BitOrAssign for SlotMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl FromIterator<usize> for SlotMask {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut mask = Self::default();
        for slot in iter {
            mask.set(slot);
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iterates_in_resolution_order() {
        let bits = DirtyBits::BIND_GROUPS | DirtyBits::VIEWPORT | DirtyBits::RENDER_PIPELINE_DESC;
        let order: Vec<_> = DirtyBitsIter::new(bits).collect();
        assert_eq!(
            order,
            vec![DirtyBits::RENDER_PIPELINE_DESC, DirtyBits::VIEWPORT, DirtyBits::BIND_GROUPS]
        );
    }

    #[test]
    fn later_bits_are_visited_in_the_same_pass() {
        let mut iter = DirtyBitsIter::new(DirtyBits::RENDER_PASS);
        assert_eq!(iter.next(), Some(DirtyBits::RENDER_PASS));
        iter.set_later_bits(DirtyBits::NEW_RENDER_PASS).unwrap();
        let rest: Vec<_> = iter.collect();
        assert_eq!(rest.len(), DirtyBits::NEW_RENDER_PASS.bits().count_ones() as usize);
        assert_eq!(rest[0], DirtyBits::RENDER_PIPELINE_BINDING);
    }

    #[test]
    fn raising_an_earlier_bit_is_rejected() {
        let mut iter = DirtyBitsIter::new(DirtyBits::SCISSOR);
        iter.next();
        let err = iter.set_later_bits(DirtyBits::VIEWPORT).unwrap_err();
        assert!(err.is_internal());
        assert!(iter.set_later_bits(DirtyBits::SCISSOR).is_err());
    }

    #[test]
    fn new_render_pass_excludes_desc_and_pass() {
        assert!(!DirtyBits::NEW_RENDER_PASS.contains(DirtyBits::RENDER_PIPELINE_DESC));
        assert!(!DirtyBits::NEW_RENDER_PASS.contains(DirtyBits::RENDER_PASS));
        assert_eq!(DirtyBits::after(DirtyBits::RENDER_PASS), DirtyBits::NEW_RENDER_PASS);
        assert!(DirtyBits::after(DirtyBits::BIND_GROUPS).is_empty());
    }

    #[test]
    fn slot_mask_iteration() {
        let mask: SlotMask = [0usize, 3, 5].into_iter().collect();
        assert_eq!(mask.iter().collect::<Vec<_>>(), vec![0, 3, 5]);
        assert_eq!(mask.last(), Some(5));
        assert_eq!(SlotMask::first(3).bits(), 0b111);
    }
}
