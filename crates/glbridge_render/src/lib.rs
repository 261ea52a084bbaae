//! WebGPU translation layer for glbridge.
//!
//! [`Context`] consumes the frontend [`GraphicsState`](glbridge_core::GraphicsState)
//! and turns it into backend objects and commands:
//!
//! - Dirty-bit synchronizer: frontend change bits become ordered backend bits,
//!   resolved lowest-first before each draw
//! - [`render_pass`]: one open pass at a time, with deferred clears merged into
//!   the next pass's load ops
//! - [`pipeline`] and [`bind_group`]: caches keyed by structural descriptor value
//! - [`streaming`]: client-memory vertex and index data copied into batched
//!   staging buffers
//! - [`image`]: texture uploads staged per subresource and flushed on use
//!
//! The device sits behind the [`Backend`](backend::Backend) trait. Tests run
//! against [`RecordingBackend`](backend::recording::RecordingBackend).

pub mod backend;
pub mod bind_group;
pub mod buffer;
pub mod buffer_helper;
pub mod clear_values;
pub mod command_buffer;
pub mod context;
pub mod conversions;
pub mod framebuffer;
pub mod image;
pub mod pipeline;
pub mod program;
pub mod render_pass;
pub mod sampler;
pub mod streaming;
pub mod texture;
pub mod uniforms;
pub mod utils;
pub mod vertex_array;

pub use backend::recording::{BackendEvent, RecordingBackend, RecordingLog};
pub use backend::wgpu_backend::WgpuBackend;
pub use backend::Backend;
pub use command_buffer::Command;
pub use context::{Context, IndexSource};
pub use pipeline::{PipelineCache, PipelineDescriptor};
pub use program::{ProgramDesc, SamplerBinding, ShaderStage};
pub use render_pass::{ClosureReason, RenderPassManager};
pub use sampler::{MagFilter, MinFilter, SamplerState, WrapMode};
pub use vertex_array::AttribSource;
