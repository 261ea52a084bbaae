//! Error Types
//!
//! This module defines the error types used throughout the translation layer.
//!
//! # Overview
//!
//! The main error type [`BridgeError`] covers four families of failure:
//! - Unimplemented paths (emulations that are not supported)
//! - Backend object creation failures, with the call site attached
//! - Internal consistency failures (programming defects)
//! - Waits on the device that time out or fail
//!
//! # Usage
//!
//! All fallible entry points return [`Result<T>`] which is an alias for
//! `std::result::Result<T, BridgeError>`. Nothing on these paths panics.
//!
//! ```rust,ignore
//! use glbridge_core::errors::{BridgeError, Result};
//!
//! fn draw() -> Result<()> {
//!     Err(BridgeError::Unimplemented("multi-draw"))
//! }
//! ```

use std::fmt;
use std::panic::Location;

use thiserror::Error;

/// The kind of backend object whose creation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    Texture,
    TextureView,
    Sampler,
    BindGroupLayout,
    BindGroup,
    PipelineLayout,
    ShaderModule,
    RenderPipeline,
    CommandEncoder,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Buffer => "buffer",
            Self::Texture => "texture",
            Self::TextureView => "texture view",
            Self::Sampler => "sampler",
            Self::BindGroupLayout => "bind group layout",
            Self::BindGroup => "bind group",
            Self::PipelineLayout => "pipeline layout",
            Self::ShaderModule => "shader module",
            Self::RenderPipeline => "render pipeline",
            Self::CommandEncoder => "command encoder",
        };
        f.write_str(name)
    }
}

/// The main error type for glbridge.
///
/// Every draw, clear, read or flush call reports failure through this type.
/// Calls that fail leave the context's dirty state unresolved so the next
/// successful call still emits the pending work.
#[derive(Error, Debug)]
pub enum BridgeError {
    // ========================================================================
    // Unimplemented paths
    // ========================================================================
    /// A requested emulation (primitive topology, indirect draw, multi-draw,
    /// logic op) that has no backend equivalent.
    #[error("Unimplemented: {0}")]
    Unimplemented(&'static str),

    // ========================================================================
    // Resource build failures
    // ========================================================================
    /// The backend refused to create an object.
    #[error("Failed to create {kind} at {location}: {message}")]
    ResourceBuild {
        /// What was being created
        kind: ResourceKind,
        /// Backend-provided detail
        message: String,
        /// Call site that requested the object
        location: &'static Location<'static>,
    },

    /// A single staging allocation exceeded the device's maximum buffer size.
    #[error("Staging allocation of {required} bytes exceeds the maximum buffer size of {max}")]
    StagingTooLarge {
        /// Bytes the batched upload needed
        required: u64,
        /// Backend limit
        max: u64,
    },

    // ========================================================================
    // Internal consistency
    // ========================================================================
    /// An unreachable state was reached: unknown dirty bit, out-of-order bit
    /// raise, nested render pass, stale handle.
    #[error("Internal consistency failure: {0}")]
    InternalConsistency(String),

    /// Caller misuse, e.g. a draw with no program bound or an unknown handle.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    // ========================================================================
    // Resource waits
    // ========================================================================
    /// Waiting for submitted work to complete failed.
    #[error("Wait for device failed: {0}")]
    WaitFailed(String),

    /// Mapping a buffer for read-back failed.
    #[error("Buffer map failed: {0}")]
    MapFailed(String),

    // ========================================================================
    // Backend bring-up
    // ========================================================================
    /// Failed to request a compatible GPU adapter.
    #[error("Failed to request WGPU adapter: {0}")]
    AdapterRequestFailed(String),

    /// Failed to create the GPU device.
    #[error("Failed to create WGPU device: {0}")]
    DeviceCreateFailed(String),

    /// Presentation surface error.
    #[error("Surface error: {0}")]
    Surface(String),
}

impl BridgeError {
    /// Builds a [`BridgeError::ResourceBuild`] tagged with the caller's location.
    #[track_caller]
    pub fn resource_build(kind: ResourceKind, message: impl Into<String>) -> Self {
        Self::ResourceBuild {
            kind,
            message: message.into(),
            location: Location::caller(),
        }
    }

    #[inline]
    #[must_use]
    pub fn is_unimplemented(&self) -> bool {
        matches!(self, Self::Unimplemented(_))
    }

    #[inline]
    #[must_use]
    pub fn is_internal(&self) -> bool {
        matches!(self, Self::InternalConsistency(_))
    }
}

/// Alias for `Result<T, BridgeError>`.
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resource_build_records_call_site() {
        let err = BridgeError::resource_build(ResourceKind::RenderPipeline, "bad format");
        let BridgeError::ResourceBuild { location, .. } = &err else {
            panic!("unexpected variant");
        };
        assert!(location.file().ends_with("errors.rs"));
        assert!(err.to_string().contains("render pipeline"));
        assert!(err.to_string().contains("bad format"));
    }

    #[test]
    fn unimplemented_is_classified() {
        assert!(BridgeError::Unimplemented("fan").is_unimplemented());
        assert!(!BridgeError::WaitFailed("timeout".into()).is_unimplemented());
        assert!(BridgeError::InternalConsistency("bit".into()).is_internal());
    }
}
