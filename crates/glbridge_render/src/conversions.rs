//! GL → wgpu enum conversions.
//!
//! Emulated topologies map onto the closest native one (line loop → line
//! strip, fan → list). Line loops are emulated in the streaming path; fan
//! draws are rejected before a pipeline is built.
//! Values with no WebGPU equivalent surface as `Unimplemented`.

use glbridge_core::types::{
    BlendEquation, BlendFactor, ColorMask, CompareFunc, CullFaceMode, FrontFace, ImageFormat,
    IndexType, PrimitiveMode, StencilOp,
};
use glbridge_core::{BridgeError, Result};

use crate::sampler::{MagFilter, MinFilter, WrapMode};

#[must_use]
pub fn primitive_topology(mode: PrimitiveMode) -> wgpu::PrimitiveTopology {
    match mode {
        PrimitiveMode::Points => wgpu::PrimitiveTopology::PointList,
        PrimitiveMode::Lines => wgpu::PrimitiveTopology::LineList,
        // Emulated with an extra closing index.
        PrimitiveMode::LineLoop | PrimitiveMode::LineStrip => wgpu::PrimitiveTopology::LineStrip,
        PrimitiveMode::Triangles | PrimitiveMode::TriangleFan => wgpu::PrimitiveTopology::TriangleList,
        PrimitiveMode::TriangleStrip => wgpu::PrimitiveTopology::TriangleStrip,
    }
}

/// u8 indices have no backend format and are widened to u16 when streamed.
#[must_use]
pub fn index_format(ty: IndexType) -> wgpu::IndexFormat {
    match ty {
        IndexType::U8 | IndexType::U16 => wgpu::IndexFormat::Uint16,
        IndexType::U32 => wgpu::IndexFormat::Uint32,
    }
}

/// A disabled test always passes.
#[must_use]
pub fn compare_function(func: CompareFunc, test_enabled: bool) -> wgpu::CompareFunction {
    if !test_enabled {
        return wgpu::CompareFunction::Always;
    }
    match func {
        CompareFunc::Never => wgpu::CompareFunction::Never,
        CompareFunc::Less => wgpu::CompareFunction::Less,
        CompareFunc::Equal => wgpu::CompareFunction::Equal,
        CompareFunc::LessEqual => wgpu::CompareFunction::LessEqual,
        CompareFunc::Greater => wgpu::CompareFunction::Greater,
        CompareFunc::NotEqual => wgpu::CompareFunction::NotEqual,
        CompareFunc::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
        CompareFunc::Always => wgpu::CompareFunction::Always,
    }
}

#[must_use]
pub fn stencil_operation(op: StencilOp) -> wgpu::StencilOperation {
    match op {
        StencilOp::Keep => wgpu::StencilOperation::Keep,
        StencilOp::Zero => wgpu::StencilOperation::Zero,
        StencilOp::Replace => wgpu::StencilOperation::Replace,
        StencilOp::Incr => wgpu::StencilOperation::IncrementClamp,
        StencilOp::IncrWrap => wgpu::StencilOperation::IncrementWrap,
        StencilOp::Decr => wgpu::StencilOperation::DecrementClamp,
        StencilOp::DecrWrap => wgpu::StencilOperation::DecrementWrap,
        StencilOp::Invert => wgpu::StencilOperation::Invert,
    }
}

pub fn blend_factor(factor: BlendFactor) -> Result<wgpu::BlendFactor> {
    Ok(match factor {
        BlendFactor::Zero => wgpu::BlendFactor::Zero,
        BlendFactor::One => wgpu::BlendFactor::One,
        BlendFactor::SrcColor => wgpu::BlendFactor::Src,
        BlendFactor::OneMinusSrcColor => wgpu::BlendFactor::OneMinusSrc,
        BlendFactor::DstColor => wgpu::BlendFactor::Dst,
        BlendFactor::OneMinusDstColor => wgpu::BlendFactor::OneMinusDst,
        BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
        BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
        BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
        BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
        BlendFactor::ConstantColor => wgpu::BlendFactor::Constant,
        BlendFactor::OneMinusConstantColor => wgpu::BlendFactor::OneMinusConstant,
        BlendFactor::SrcAlphaSaturate => wgpu::BlendFactor::SrcAlphaSaturated,
        BlendFactor::ConstantAlpha | BlendFactor::OneMinusConstantAlpha => {
            return Err(BridgeError::Unimplemented("constant alpha blend factors"));
        }
    })
}

pub fn blend_operation(equation: BlendEquation) -> Result<wgpu::BlendOperation> {
    Ok(match equation {
        BlendEquation::Add => wgpu::BlendOperation::Add,
        BlendEquation::Subtract => wgpu::BlendOperation::Subtract,
        BlendEquation::ReverseSubtract => wgpu::BlendOperation::ReverseSubtract,
        BlendEquation::Min => wgpu::BlendOperation::Min,
        BlendEquation::Max => wgpu::BlendOperation::Max,
        BlendEquation::Advanced => {
            return Err(BridgeError::Unimplemented("advanced blend equations"));
        }
    })
}

pub fn cull_mode(enabled: bool, mode: CullFaceMode) -> Result<Option<wgpu::Face>> {
    if !enabled {
        return Ok(None);
    }
    match mode {
        CullFaceMode::Front => Ok(Some(wgpu::Face::Front)),
        CullFaceMode::Back => Ok(Some(wgpu::Face::Back)),
        CullFaceMode::FrontAndBack => Err(BridgeError::Unimplemented("culling both faces")),
    }
}

#[must_use]
pub fn front_face(face: FrontFace) -> wgpu::FrontFace {
    match face {
        FrontFace::Ccw => wgpu::FrontFace::Ccw,
        FrontFace::Cw => wgpu::FrontFace::Cw,
    }
}

#[must_use]
pub fn color_write_mask(mask: ColorMask) -> wgpu::ColorWrites {
    let mut writes = wgpu::ColorWrites::empty();
    writes.set(wgpu::ColorWrites::RED, mask.r);
    writes.set(wgpu::ColorWrites::GREEN, mask.g);
    writes.set(wgpu::ColorWrites::BLUE, mask.b);
    writes.set(wgpu::ColorWrites::ALPHA, mask.a);
    writes
}

#[must_use]
pub fn address_mode(wrap: WrapMode) -> wgpu::AddressMode {
    match wrap {
        WrapMode::Repeat => wgpu::AddressMode::Repeat,
        WrapMode::ClampToEdge => wgpu::AddressMode::ClampToEdge,
        WrapMode::MirroredRepeat => wgpu::AddressMode::MirrorRepeat,
    }
}

#[must_use]
pub fn mag_filter(filter: MagFilter) -> wgpu::FilterMode {
    match filter {
        MagFilter::Nearest => wgpu::FilterMode::Nearest,
        MagFilter::Linear => wgpu::FilterMode::Linear,
    }
}

/// Splits a GL minification filter into (min, mipmap) filters.
#[must_use]
pub fn min_filter(filter: MinFilter) -> (wgpu::FilterMode, wgpu::MipmapFilterMode) {
    use wgpu::{FilterMode as F, MipmapFilterMode as M};
    match filter {
        MinFilter::Nearest | MinFilter::NearestMipmapNearest => (F::Nearest, M::Nearest),
        MinFilter::Linear | MinFilter::LinearMipmapNearest => (F::Linear, M::Nearest),
        MinFilter::NearestMipmapLinear => (F::Nearest, M::Linear),
        MinFilter::LinearMipmapLinear => (F::Linear, M::Linear),
    }
}

/// Backend storage format for an (intended) image format.
#[must_use]
pub fn texture_format(format: ImageFormat) -> wgpu::TextureFormat {
    match format.actual() {
        ImageFormat::Rgba8Unorm | ImageFormat::Rgb8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        ImageFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        ImageFormat::R8Unorm => wgpu::TextureFormat::R8Unorm,
        ImageFormat::Rg8Unorm => wgpu::TextureFormat::Rg8Unorm,
        ImageFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        ImageFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
        ImageFormat::R32Float => wgpu::TextureFormat::R32Float,
        ImageFormat::Depth16Unorm => wgpu::TextureFormat::Depth16Unorm,
        ImageFormat::Depth24Plus => wgpu::TextureFormat::Depth24Plus,
        ImageFormat::Depth24PlusStencil8 => wgpu::TextureFormat::Depth24PlusStencil8,
        ImageFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
        ImageFormat::Stencil8 => wgpu::TextureFormat::Stencil8,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_tests_always_pass() {
        assert_eq!(compare_function(CompareFunc::Never, false), wgpu::CompareFunction::Always);
        assert_eq!(compare_function(CompareFunc::Less, true), wgpu::CompareFunction::Less);
    }

    #[test]
    fn emulated_topologies_map_to_native_ones() {
        assert_eq!(primitive_topology(PrimitiveMode::LineLoop), wgpu::PrimitiveTopology::LineStrip);
        assert_eq!(
            primitive_topology(PrimitiveMode::TriangleFan),
            wgpu::PrimitiveTopology::TriangleList
        );
        assert_eq!(index_format(IndexType::U8), wgpu::IndexFormat::Uint16);
    }

    #[test]
    fn unsupported_values_are_unimplemented() {
        assert!(blend_factor(BlendFactor::ConstantAlpha).unwrap_err().is_unimplemented());
        assert!(blend_operation(BlendEquation::Advanced).unwrap_err().is_unimplemented());
        assert!(cull_mode(true, CullFaceMode::FrontAndBack).unwrap_err().is_unimplemented());
        assert_eq!(cull_mode(false, CullFaceMode::FrontAndBack).unwrap(), None);
    }

    #[test]
    fn write_mask_from_color_mask() {
        let mask = ColorMask { r: true, g: false, b: true, a: false };
        assert_eq!(color_write_mask(mask), wgpu::ColorWrites::RED | wgpu::ColorWrites::BLUE);
        assert_eq!(color_write_mask(ColorMask::ALL), wgpu::ColorWrites::ALL);
    }
}
