//! Backend-independent foundations for glbridge.
//!
//! - [`state`]: the frontend [`GraphicsState`](state::GraphicsState) and its change bits
//! - [`dirty_bits`]: the ordered backend dirty set resolved before each draw
//! - [`types`]: GL-side value types
//! - [`settings`]: context configuration
//! - [`errors`]: the error taxonomy shared by every crate

pub mod constants;
pub mod dirty_bits;
pub mod errors;
pub mod settings;
pub mod state;
pub mod types;

pub use dirty_bits::{DirtyBits, DirtyBitsIter, SlotMask};
pub use errors::{BridgeError, ResourceKind, Result};
pub use settings::ContextSettings;
pub use state::{
    BufferHandle, FramebufferHandle, GraphicsState, ProgramHandle, SamplerHandle, StateDirtyBits,
    TextureHandle, VertexArrayHandle,
};
