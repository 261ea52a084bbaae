//! Context Settings
//!
//! Configuration consumed once at context creation.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use glbridge_core::settings::ContextSettings;
//!
//! let settings = ContextSettings {
//!     default_framebuffer_size: [640, 480],
//!     ..Default::default()
//! };
//! ```
//!
//! Settings are `serde`-serializable; missing fields take their defaults.

use serde::{Deserialize, Serialize};

use crate::constants::{MAX_DRAW_BUFFERS, MAX_VERTEX_ATTRIBS};
use crate::types::{Extents, ImageFormat};

// ---------------------------------------------------------------------------
// ContextSettings
// ---------------------------------------------------------------------------

/// Configuration for a translation context.
///
/// | Field                                 | Default        | Effect                                          |
/// |---------------------------------------|----------------|-------------------------------------------------|
/// | `max_buffer_size`                     | 256 MiB        | Upper bound for one streaming staging buffer    |
/// | `max_vertex_attributes`               | 16             | Vertex attribute / buffer slot count            |
/// | `max_color_attachments`               | 8              | Color attachments per framebuffer               |
/// | `min_uniform_buffer_offset_alignment` | 256            | Per-stage default uniform block offsets         |
/// | `default_framebuffer_size`            | `[1, 1]`       | Size of the window-system framebuffer           |
/// | `default_framebuffer_format`          | `Rgba8Unorm`   | Color format of the window-system framebuffer   |
/// | `default_depth_stencil`               | `true`         | Give the default framebuffer a depth/stencil    |
/// | `flip_default_framebuffer`            | `true`         | Y-flip rendering into the default framebuffer   |
/// | `wait_for_gpu_on_finish`              | `true`         | `finish` blocks on submitted-work completion    |
/// | `power_preference`                    | `"high"`       | Adapter selection hint (wgpu backend)           |
/// | `backends`                            | `None`         | Backend filter such as `"vulkan,metal"`         |
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    pub max_buffer_size: u64,
    pub max_vertex_attributes: u32,
    pub max_color_attachments: u32,
    pub min_uniform_buffer_offset_alignment: u32,

    pub default_framebuffer_size: [u32; 2],
    pub default_framebuffer_format: ImageFormat,
    pub default_depth_stencil: bool,
    pub flip_default_framebuffer: bool,

    /// When `false`, `finish` only waits for the submission to be accepted.
    pub wait_for_gpu_on_finish: bool,

    pub power_preference: String,
    pub backends: Option<String>,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            max_buffer_size: 256 << 20,
            max_vertex_attributes: MAX_VERTEX_ATTRIBS as u32,
            max_color_attachments: MAX_DRAW_BUFFERS as u32,
            min_uniform_buffer_offset_alignment: 256,
            default_framebuffer_size: [1, 1],
            default_framebuffer_format: ImageFormat::Rgba8Unorm,
            default_depth_stencil: true,
            flip_default_framebuffer: true,
            wait_for_gpu_on_finish: true,
            power_preference: "high".to_string(),
            backends: None,
        }
    }
}

impl ContextSettings {
    #[inline]
    #[must_use]
    pub fn default_framebuffer_extents(&self) -> Extents {
        Extents::new(
            self.default_framebuffer_size[0].max(1),
            self.default_framebuffer_size[1].max(1),
            1,
        )
    }

    /// Vertex attribute slots actually usable, clamped to the compiled-in maximum.
    #[inline]
    #[must_use]
    pub fn vertex_attribute_count(&self) -> usize {
        (self.max_vertex_attributes as usize).min(MAX_VERTEX_ATTRIBS)
    }

    /// Color attachments actually usable, clamped to the compiled-in maximum.
    #[inline]
    #[must_use]
    pub fn color_attachment_count(&self) -> usize {
        (self.max_color_attachments as usize).min(MAX_DRAW_BUFFERS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let settings: ContextSettings =
            serde_json::from_str(r#"{ "default_framebuffer_size": [64, 32] }"#).unwrap();
        assert_eq!(settings.default_framebuffer_extents(), Extents::new(64, 32, 1));
        assert_eq!(settings.max_buffer_size, 256 << 20);
        assert!(settings.flip_default_framebuffer);
    }

    #[test]
    fn counts_are_clamped() {
        let settings = ContextSettings { max_vertex_attributes: 64, ..Default::default() };
        assert_eq!(settings.vertex_attribute_count(), MAX_VERTEX_ATTRIBS);
    }
}
