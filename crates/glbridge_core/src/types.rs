//! Frontend value types.
//!
//! These mirror the GL-side enumerations the dispatch layer hands to the
//! context. Conversion to backend enums lives in `glbridge_render`.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

// ─── Primitives & indices ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveMode {
    Points,
    Lines,
    LineLoop,
    LineStrip,
    Triangles,
    TriangleStrip,
    TriangleFan,
}

impl PrimitiveMode {
    /// Strip topologies need a strip index format in the pipeline.
    #[inline]
    #[must_use]
    pub fn is_strip(self) -> bool {
        matches!(self, Self::LineStrip | Self::LineLoop | Self::TriangleStrip)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndexType {
    U8,
    U16,
    U32,
}

impl IndexType {
    #[inline]
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 => 2,
            Self::U32 => 4,
        }
    }

    /// Reads index `i` from a tightly packed slice of this type.
    #[inline]
    #[must_use]
    pub fn read(self, bytes: &[u8], i: usize) -> u32 {
        match self {
            Self::U8 => u32::from(bytes[i]),
            Self::U16 => u32::from(u16::from_le_bytes([bytes[2 * i], bytes[2 * i + 1]])),
            Self::U32 => u32::from_le_bytes([
                bytes[4 * i],
                bytes[4 * i + 1],
                bytes[4 * i + 2],
                bytes[4 * i + 3],
            ]),
        }
    }

    /// Primitive restart index for this type.
    #[inline]
    #[must_use]
    pub const fn restart_index(self) -> u32 {
        match self {
            Self::U8 => 0xFF,
            Self::U16 => 0xFFFF,
            Self::U32 => 0xFFFF_FFFF,
        }
    }
}

// ─── Depth / stencil / blend ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompareFunc {
    Never,
    #[default]
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StencilOp {
    #[default]
    Keep,
    Zero,
    Replace,
    Incr,
    IncrWrap,
    Decr,
    DecrWrap,
    Invert,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    SrcColor,
    OneMinusSrcColor,
    DstColor,
    OneMinusDstColor,
    SrcAlpha,
    OneMinusSrcAlpha,
    DstAlpha,
    OneMinusDstAlpha,
    ConstantColor,
    OneMinusConstantColor,
    ConstantAlpha,
    OneMinusConstantAlpha,
    SrcAlphaSaturate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BlendEquation {
    #[default]
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
    /// Any KHR_blend_equation_advanced mode.
    Advanced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullFaceMode {
    Front,
    #[default]
    Back,
    FrontAndBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FrontFace {
    #[default]
    Ccw,
    Cw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColorMask {
    pub r: bool,
    pub g: bool,
    pub b: bool,
    pub a: bool,
}

impl ColorMask {
    pub const ALL: Self = Self { r: true, g: true, b: true, a: true };
    pub const NONE: Self = Self { r: false, g: false, b: false, a: false };

    #[inline]
    #[must_use]
    pub fn is_all(self) -> bool {
        self == Self::ALL
    }

    /// Packs the mask as RGBA bits (R = bit 0), the layout backend write masks use.
    #[inline]
    #[must_use]
    pub fn bits(self) -> u32 {
        u32::from(self.r) | (u32::from(self.g) << 1) | (u32::from(self.b) << 2) | (u32::from(self.a) << 3)
    }
}

impl Default for ColorMask {
    fn default() -> Self {
        Self::ALL
    }
}

bitflags! {
    /// Buffers targeted by a clear call.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct ClearMask: u32 {
        const COLOR   = 1 << 0;
        const DEPTH   = 1 << 1;
        const STENCIL = 1 << 2;
    }
}

// ─── Geometry ──────────────────────────────────────────────────────────────

/// An integer rectangle in framebuffer coordinates (origin bottom-left).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Rect {
    #[inline]
    #[must_use]
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    #[inline]
    #[must_use]
    pub const fn x1(&self) -> i32 {
        self.x + self.width
    }

    #[inline]
    #[must_use]
    pub const fn y1(&self) -> i32 {
        self.y + self.height
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Intersection of two rectangles, `None` when they do not overlap.
    #[must_use]
    pub fn clip(&self, other: &Rect) -> Option<Rect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.x1().min(other.x1());
        let y1 = self.y1().min(other.y1());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Rect::new(x0, y0, x1 - x0, y1 - y0))
    }

    #[must_use]
    pub fn encloses(&self, other: &Rect) -> bool {
        self.x <= other.x && self.y <= other.y && self.x1() >= other.x1() && self.y1() >= other.y1()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Extents {
    pub width: u32,
    pub height: u32,
    pub depth_or_layers: u32,
}

impl Extents {
    #[inline]
    #[must_use]
    pub const fn new(width: u32, height: u32, depth_or_layers: u32) -> Self {
        Self { width, height, depth_or_layers }
    }

    #[inline]
    #[must_use]
    pub const fn rect(&self) -> Rect {
        Rect::new(0, 0, self.width as i32, self.height as i32)
    }

    /// Size of mip `level`, clamped to 1 in each dimension.
    #[inline]
    #[must_use]
    pub fn level(&self, level: u32) -> Extents {
        Extents {
            width: (self.width >> level).max(1),
            height: (self.height >> level).max(1),
            depth_or_layers: self.depth_or_layers,
        }
    }
}

// ─── Vertex formats ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexAttribType {
    Byte,
    UnsignedByte,
    Short,
    UnsignedShort,
    Int,
    UnsignedInt,
    HalfFloat,
    Float,
    /// 16.16 fixed point, converted to float on upload.
    Fixed,
}

impl VertexAttribType {
    #[inline]
    #[must_use]
    pub const fn size(self) -> u32 {
        match self {
            Self::Byte | Self::UnsignedByte => 1,
            Self::Short | Self::UnsignedShort | Self::HalfFloat => 2,
            Self::Int | Self::UnsignedInt | Self::Float | Self::Fixed => 4,
        }
    }
}

/// The client-side layout of one vertex attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexAttribFormat {
    pub ty: VertexAttribType,
    pub components: u8,
    pub normalized: bool,
    pub pure_integer: bool,
}

impl VertexAttribFormat {
    #[must_use]
    pub const fn float(components: u8) -> Self {
        Self { ty: VertexAttribType::Float, components, normalized: false, pure_integer: false }
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u32 {
        self.ty.size() * self.components as u32
    }
}

// ─── Image formats ─────────────────────────────────────────────────────────

/// The format the frontend asked for. Some formats are stored in a wider
/// actual format (RGB8 lives in RGBA8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ImageFormat {
    #[default]
    Rgba8Unorm,
    Rgb8Unorm,
    Bgra8Unorm,
    R8Unorm,
    Rg8Unorm,
    Rgba16Float,
    Rgba32Float,
    R32Float,
    Depth16Unorm,
    Depth24Plus,
    Depth24PlusStencil8,
    Depth32Float,
    Stencil8,
}

impl ImageFormat {
    /// The format the backend stores this one as.
    #[inline]
    #[must_use]
    pub fn actual(self) -> ImageFormat {
        match self {
            Self::Rgb8Unorm => Self::Rgba8Unorm,
            other => other,
        }
    }

    /// Bytes per pixel in client memory for this (intended) format.
    #[must_use]
    pub const fn pixel_bytes(self) -> u32 {
        match self {
            Self::R8Unorm | Self::Stencil8 => 1,
            Self::Rg8Unorm | Self::Depth16Unorm => 2,
            Self::Rgb8Unorm => 3,
            Self::Rgba8Unorm
            | Self::Bgra8Unorm
            | Self::R32Float
            | Self::Depth24Plus
            | Self::Depth24PlusStencil8
            | Self::Depth32Float => 4,
            Self::Rgba16Float => 8,
            Self::Rgba32Float => 16,
        }
    }

    #[must_use]
    pub const fn has_alpha(self) -> bool {
        matches!(self, Self::Rgba8Unorm | Self::Bgra8Unorm | Self::Rgba16Float | Self::Rgba32Float)
    }

    #[must_use]
    pub const fn has_depth(self) -> bool {
        matches!(
            self,
            Self::Depth16Unorm | Self::Depth24Plus | Self::Depth24PlusStencil8 | Self::Depth32Float
        )
    }

    #[must_use]
    pub const fn has_stencil(self) -> bool {
        matches!(self, Self::Depth24PlusStencil8 | Self::Stencil8)
    }

    #[inline]
    #[must_use]
    pub const fn is_color(self) -> bool {
        !self.has_depth() && !self.has_stencil()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rect_clip_and_enclose() {
        let fb = Rect::new(0, 0, 100, 50);
        assert_eq!(Rect::new(-10, -10, 20, 20).clip(&fb), Some(Rect::new(0, 0, 10, 10)));
        assert_eq!(Rect::new(200, 0, 10, 10).clip(&fb), None);
        assert!(fb.encloses(&Rect::new(10, 10, 5, 5)));
        assert!(!Rect::new(10, 10, 5, 5).encloses(&fb));
    }

    #[test]
    fn level_extents_clamp_to_one() {
        let e = Extents::new(16, 4, 1);
        assert_eq!(e.level(1), Extents::new(8, 2, 1));
        assert_eq!(e.level(3), Extents::new(2, 1, 1));
        assert_eq!(e.level(10), Extents::new(1, 1, 1));
    }

    #[test]
    fn rgb8_is_stored_as_rgba8() {
        assert_eq!(ImageFormat::Rgb8Unorm.actual(), ImageFormat::Rgba8Unorm);
        assert!(!ImageFormat::Rgb8Unorm.has_alpha());
        assert!(ImageFormat::Rgb8Unorm.actual().has_alpha());
    }

    #[test]
    fn index_read_is_little_endian() {
        let bytes = [1u8, 0, 0, 1];
        assert_eq!(IndexType::U16.read(&bytes, 0), 1);
        assert_eq!(IndexType::U16.read(&bytes, 1), 256);
        assert_eq!(IndexType::U8.read(&bytes, 3), 1);
    }

    #[test]
    fn color_mask_bits() {
        assert_eq!(ColorMask::ALL.bits(), 0xF);
        assert_eq!(ColorMask { r: true, g: false, b: false, a: true }.bits(), 0b1001);
    }
}
