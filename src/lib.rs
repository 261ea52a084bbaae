//! glbridge: a GL-style immediate-mode state machine on top of WebGPU.
//!
//! The umbrella crate re-exports the two workspace members:
//!
//! - [`core`]: frontend state, dirty bits, value types, settings and errors
//! - [`render`]: the translation context, caches, streaming and backends
//!
//! ```rust,ignore
//! use glbridge::{Context, ContextSettings, RecordingBackend};
//! use glbridge::core::types::ClearMask;
//! use glam::Vec4;
//!
//! let mut ctx = Context::new(RecordingBackend::new(), ContextSettings::default())?;
//! ctx.state_mut().set_clear_color(Vec4::new(0.0, 1.0, 0.0, 1.0));
//! ctx.clear(ClearMask::COLOR)?;
//! ctx.finish()?;
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub use glbridge_core as core;
pub use glbridge_render as render;

pub use glbridge_core::types;
pub use glbridge_core::{
    BridgeError, BufferHandle, ContextSettings, DirtyBits, FramebufferHandle, GraphicsState, ProgramHandle, Result,
    SamplerHandle, StateDirtyBits, TextureHandle, VertexArrayHandle,
};
pub use glbridge_render::{
    AttribSource, Backend, BackendEvent, Context, IndexSource, ProgramDesc, RecordingBackend, RecordingLog,
    SamplerState, ShaderStage, WgpuBackend,
};
pub use glbridge_render::image::PixelUnpackState;

/// Creates a headless context on the best available adapter.
pub fn headless_context(settings: ContextSettings) -> Result<Context<WgpuBackend>> {
    let backend = WgpuBackend::new_headless_blocking(&settings)?;
    log::debug!("glbridge: headless context on '{}'", backend.adapter_info().name);
    Context::new(backend, settings)
}
