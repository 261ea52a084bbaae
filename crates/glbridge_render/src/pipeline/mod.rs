//! Pipeline state and caching.
//!
//! - [`pipeline_key`]: hashable descriptors.
//! - [`cache`]: descriptor → backend pipeline lookup, built on miss.

pub mod cache;
pub mod pipeline_key;

pub use cache::{PipelineCache, PipelineStages};
pub use pipeline_key::{
    BlendComponentKey, BlendStateKey, ClearPipelineKey, ColorTargetKey, ColorTargetSlot,
    DepthBiasKey, DepthStencilKey, PipelineDescriptor, StencilFaceKey, StencilStateKey,
    VertexAttributeKey, fx_hash_key,
};
