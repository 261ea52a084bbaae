//! Context Behavior Tests
//!
//! Tests for:
//! - Dirty-bit resolution: redundant scissor elision, deferred index binds,
//!   rollback on failure, unknown bits
//! - Render passes: one open pass, deferred clears merged into load ops
//! - Pipeline cache: structural keys, no rebuild on repeated state
//! - Vertex streaming: resident client data is not restreamed
//! - Image staging: redefined levels apply nothing
//! - Primitive emulation: line loops; fans are rejected

use std::sync::Arc;

use glam::Vec4;

use glbridge::core::types::{ClearMask, ImageFormat, IndexType, PrimitiveMode, Rect, VertexAttribFormat};
use glbridge::core::{DirtyBits, SlotMask};
use glbridge::render::command_buffer::Command;
use glbridge::render::render_pass::LoadOp;
use glbridge::{
    AttribSource, BackendEvent, BridgeError, Context, ContextSettings, IndexSource, PixelUnpackState,
    ProgramDesc, ProgramHandle, RecordingBackend, RecordingLog,
};

const VERTEX_WGSL: &str = "@vertex fn vs_main(@location(0) p: vec3<f32>) -> @builtin(position) vec4<f32> { return vec4<f32>(p, 1.0); }";

fn context(size: u32) -> (Context<RecordingBackend>, RecordingLog) {
    let _ = env_logger::builder().is_test(true).try_init();
    let backend = RecordingBackend::new();
    let log = backend.handle();
    let settings = ContextSettings { default_framebuffer_size: [size, size], ..ContextSettings::default() };
    let ctx = Context::new(backend, settings).unwrap();
    log.take_events();
    (ctx, log)
}

fn use_program(ctx: &mut Context<RecordingBackend>, attributes: &[usize]) -> ProgramHandle {
    let mut active_attributes = SlotMask::default();
    for &location in attributes {
        active_attributes.set(location);
    }
    let desc = ProgramDesc {
        vertex_wgsl: VERTEX_WGSL.to_string(),
        active_attributes,
        ..ProgramDesc::default()
    };
    let program = ctx.create_program(&desc).unwrap();
    ctx.state_mut().use_program(Some(program));
    program
}

fn all_commands(log: &RecordingLog) -> Vec<Command> {
    log.render_passes().into_iter().flat_map(|(_, commands)| commands).collect()
}

fn count_pipeline_builds(log: &RecordingLog) -> usize {
    log.count(|e| matches!(e, BackendEvent::CreateRenderPipeline(_)))
}

fn positions(count: usize) -> Vec<u8> {
    let floats: Vec<f32> = (0..count * 3).map(|i| i as f32).collect();
    bytemuck::cast_slice(&floats).to_vec()
}

// ============================================================================
// Settings
// ============================================================================

#[test]
fn settings_load_from_json() {
    let settings: ContextSettings = serde_json::from_str(
        r#"{ "default_framebuffer_size": [32, 16], "flip_default_framebuffer": false }"#,
    )
    .unwrap();
    let backend = RecordingBackend::new();
    let ctx = Context::new(backend, settings).unwrap();
    let framebuffer = ctx.framebuffer(ctx.default_framebuffer()).unwrap();
    assert!(!framebuffer.flip_y());
    assert_eq!(ctx.state().viewport(), Rect::new(0, 0, 32, 16));
}

// ============================================================================
// Dirty-bit resolution
// ============================================================================

#[test]
fn scissor_matching_pass_default_is_not_emitted() {
    let (mut ctx, log) = context(16);
    use_program(&mut ctx, &[]);

    ctx.state_mut().set_scissor_test(true);
    ctx.state_mut().set_scissor(Rect::new(0, 0, 10, 10));
    ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap();
    ctx.flush().unwrap();

    ctx.state_mut().set_scissor(Rect::new(0, 0, 16, 16));
    ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap();
    ctx.flush().unwrap();

    let scissors = all_commands(&log)
        .into_iter()
        .filter(|c| matches!(c, Command::SetScissor(_)))
        .count();
    assert_eq!(scissors, 1);
    assert_eq!(log.render_passes().len(), 2);
}

#[test]
fn scissor_is_flipped_on_the_default_framebuffer() {
    let (mut ctx, log) = context(16);
    use_program(&mut ctx, &[]);
    ctx.state_mut().set_scissor_test(true);
    ctx.state_mut().set_scissor(Rect::new(0, 0, 4, 2));
    ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap();
    ctx.flush().unwrap();

    let scissor = all_commands(&log).into_iter().find_map(|c| match c {
        Command::SetScissor(s) => Some(s),
        _ => None,
    });
    let scissor = scissor.unwrap();
    assert_eq!((scissor.x, scissor.y, scissor.width, scissor.height), (0, 14, 4, 2));
}

#[test]
fn unchanged_viewport_is_emitted_once_per_pass() {
    let (mut ctx, log) = context(16);
    use_program(&mut ctx, &[]);
    ctx.state_mut().set_viewport(Rect::new(0, 0, 8, 8));
    ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap();
    ctx.state_mut().set_viewport(Rect::new(0, 0, 8, 8));
    ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap();
    ctx.flush().unwrap();

    let commands = all_commands(&log);
    assert_eq!(log.render_passes().len(), 1);
    assert_eq!(commands.iter().filter(|c| c.is_draw()).count(), 2);
    assert_eq!(commands.iter().filter(|c| matches!(c, Command::SetViewport(_))).count(), 1);
}

#[test]
fn viewport_back_to_pass_default_is_emitted() {
    let (mut ctx, log) = context(16);
    use_program(&mut ctx, &[]);
    ctx.state_mut().set_viewport(Rect::new(0, 0, 8, 8));
    ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap();
    ctx.state_mut().set_viewport(Rect::new(0, 0, 16, 16));
    ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap();
    ctx.flush().unwrap();

    let viewports: Vec<_> = all_commands(&log)
        .into_iter()
        .filter_map(|c| match c {
            Command::SetViewport(v) => Some(v),
            _ => None,
        })
        .collect();
    assert_eq!(viewports.len(), 2);
    assert_eq!((viewports[1].width, viewports[1].height), (16.0, 16.0));
}

#[test]
fn blend_constant_follows_the_same_minimality() {
    let (mut ctx, log) = context(8);
    use_program(&mut ctx, &[]);
    ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap();
    ctx.state_mut().set_blend_color(Vec4::new(0.5, 0.5, 0.5, 1.0));
    ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap();
    ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap();
    ctx.state_mut().set_blend_color(Vec4::ZERO);
    ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap();
    ctx.flush().unwrap();

    let constants: Vec<_> = all_commands(&log)
        .into_iter()
        .filter_map(|c| match c {
            Command::SetBlendConstant(color) => Some(color),
            _ => None,
        })
        .collect();
    assert_eq!(constants, vec![Vec4::new(0.5, 0.5, 0.5, 1.0), Vec4::ZERO]);
}

#[test]
fn index_bit_waits_for_an_indexed_draw() {
    let (mut ctx, log) = context(8);
    use_program(&mut ctx, &[]);
    ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap();
    assert!(ctx.dirty_bits().contains(DirtyBits::INDEX_BUFFER));

    ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap();
    ctx.flush().unwrap();
    let index_binds = all_commands(&log)
        .into_iter()
        .filter(|c| matches!(c, Command::SetIndexBuffer { .. }))
        .count();
    assert_eq!(index_binds, 0);
}

#[test]
fn failed_draw_keeps_its_bits_for_the_next_call() {
    let (mut ctx, log) = context(8);
    use_program(&mut ctx, &[]);
    log.fail_next_pipeline_builds(1);

    let err = ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap_err();
    assert!(matches!(err, BridgeError::ResourceBuild { .. }));
    assert!(ctx.dirty_bits().contains(DirtyBits::RENDER_PIPELINE_DESC));

    ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap();
    ctx.flush().unwrap();
    let commands = all_commands(&log);
    assert!(matches!(commands.first(), Some(Command::SetPipeline(_))));
    assert_eq!(commands.iter().filter(|c| c.is_draw()).count(), 1);
}

#[test]
fn unknown_dirty_bit_is_an_internal_error() {
    let (mut ctx, _log) = context(8);
    use_program(&mut ctx, &[]);
    ctx.render_passes_mut().mark_dirty(DirtyBits::from_bits_retain(1 << 31));
    let err = ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap_err();
    assert!(err.is_internal());
}

// ============================================================================
// Render passes and deferred clears
// ============================================================================

#[test]
fn later_clear_replaces_pending_clear() {
    let (mut ctx, log) = context(8);
    ctx.state_mut().set_clear_color(Vec4::new(1.0, 0.0, 0.0, 1.0));
    ctx.clear(ClearMask::COLOR).unwrap();
    ctx.state_mut().set_clear_color(Vec4::new(0.0, 1.0, 0.0, 1.0));
    ctx.clear(ClearMask::COLOR).unwrap();
    assert_eq!(log.count(|e| matches!(e, BackendEvent::RenderPass { .. })), 0);

    let pixels = ctx.read_pixels(Rect::new(0, 0, 8, 8), ImageFormat::Rgba8Unorm).unwrap();
    assert_eq!(pixels.len(), 8 * 8 * 4);
    assert!(pixels.chunks_exact(4).all(|p| p == [0, 255, 0, 255]));

    let red_passes = log
        .render_passes()
        .iter()
        .flat_map(|(desc, _)| desc.color_attachments.iter().flatten().copied().collect::<Vec<_>>())
        .filter(|a| a.load_op == LoadOp::Clear && a.clear_value == Vec4::new(1.0, 0.0, 0.0, 1.0))
        .count();
    assert_eq!(red_passes, 0);
}

#[test]
fn clear_before_draw_becomes_the_pass_load_op() {
    let (mut ctx, log) = context(8);
    use_program(&mut ctx, &[]);
    ctx.state_mut().set_clear_color(Vec4::new(0.0, 0.0, 1.0, 1.0));
    ctx.clear(ClearMask::COLOR).unwrap();
    ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap();
    ctx.flush().unwrap();

    let passes = log.render_passes();
    assert_eq!(passes.len(), 1);
    let color = passes[0].0.color_attachments[0].unwrap();
    assert_eq!(color.load_op, LoadOp::Clear);
    assert_eq!(color.clear_value, Vec4::new(0.0, 0.0, 1.0, 1.0));
    assert_eq!(passes[0].1.iter().filter(|c| c.is_draw()).count(), 1);
}

#[test]
fn switching_framebuffers_closes_the_pass() {
    let (mut ctx, log) = context(8);
    use_program(&mut ctx, &[]);

    let texture = ctx.create_texture();
    ctx.tex_image_2d(texture, 0, ImageFormat::Rgba8Unorm, 4, 4, None, PixelUnpackState::default())
        .unwrap();
    let fbo = ctx.create_framebuffer();
    ctx.framebuffer_texture(fbo, 0, Some((texture, 0))).unwrap();

    ctx.state_mut().bind_draw_framebuffer(fbo);
    ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap();
    assert!(ctx.render_passes().has_active_pass());
    let default_fbo = ctx.default_framebuffer();
    ctx.state_mut().bind_draw_framebuffer(default_fbo);
    ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap();
    ctx.flush().unwrap();

    let passes = log.render_passes();
    assert_eq!(passes.len(), 2);
    let first = passes[0].0.color_attachments[0].unwrap().view;
    let second = passes[1].0.color_attachments[0].unwrap().view;
    assert_ne!(first, second);
    for (_, commands) in &passes {
        assert_eq!(commands.iter().filter(|c| c.is_draw()).count(), 1);
    }
}

// ============================================================================
// Pipeline cache
// ============================================================================

#[test]
fn repeated_state_reuses_cached_pipelines() {
    let (mut ctx, log) = context(8);
    use_program(&mut ctx, &[]);

    for enabled in [false, true, false, true, false] {
        ctx.state_mut().set_depth_test(enabled);
        ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap();
    }
    ctx.flush().unwrap();

    assert_eq!(count_pipeline_builds(&log), 2);
    let binds = all_commands(&log)
        .into_iter()
        .filter(|c| matches!(c, Command::SetPipeline(_)))
        .count();
    assert_eq!(binds, 5);
}

#[test]
fn unrelated_state_churn_does_not_rebuild() {
    let (mut ctx, log) = context(8);
    use_program(&mut ctx, &[]);
    ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap();

    ctx.state_mut().set_clear_color(Vec4::ONE);
    ctx.state_mut().set_viewport(Rect::new(0, 0, 4, 4));
    ctx.draw_arrays(PrimitiveMode::Triangles, 0, 3, 1).unwrap();

    assert_eq!(count_pipeline_builds(&log), 1);
}

// ============================================================================
// Vertex streaming
// ============================================================================

#[test]
fn resident_client_vertices_are_not_restreamed() {
    let (mut ctx, log) = context(8);
    use_program(&mut ctx, &[0]);

    let data: Arc<[u8]> = positions(300).into();
    ctx.vertex_attrib_pointer(0, VertexAttribFormat::float(3), 0, 0, AttribSource::Client(data))
        .unwrap();
    ctx.enable_vertex_attrib_array(0, true).unwrap();
    ctx.draw_arrays(PrimitiveMode::Triangles, 0, 300, 1).unwrap();
    ctx.flush().unwrap();

    let stream = all_commands(&log)
        .into_iter()
        .find_map(|c| match c {
            Command::SetVertexBuffer { slot: 0, buffer, .. } => Some(buffer),
            _ => None,
        })
        .unwrap();

    let indices: Vec<u8> = bytemuck::cast_slice(&[0u16, 1, 2, 297, 298, 299]).to_vec();
    let element_buffer = ctx.create_buffer();
    ctx.bind_element_buffer(Some(element_buffer)).unwrap();
    ctx.buffer_data(element_buffer, indices.len() as u64, Some(&indices)).unwrap();
    ctx.draw_elements(PrimitiveMode::Triangles, 6, IndexType::U16, IndexSource::Offset(0), 1, 0)
        .unwrap();
    ctx.flush().unwrap();

    let uploads = log.count(|e| matches!(e, BackendEvent::CopyBufferToBuffer { dst, .. } if *dst == stream));
    assert_eq!(uploads, 1);
}

#[test]
fn oversized_stream_is_rejected_before_touching_the_backend() {
    let backend = RecordingBackend::new();
    let log = backend.handle();
    let settings = ContextSettings {
        default_framebuffer_size: [8, 8],
        max_buffer_size: 64,
        ..ContextSettings::default()
    };
    let mut ctx = Context::new(backend, settings).unwrap();
    use_program(&mut ctx, &[0]);
    ctx.vertex_attrib_pointer(0, VertexAttribFormat::float(3), 0, 0, AttribSource::Client(positions(100).into()))
        .unwrap();
    ctx.enable_vertex_attrib_array(0, true).unwrap();
    log.take_events();

    let err = ctx.draw_arrays(PrimitiveMode::Triangles, 0, 100, 1).unwrap_err();
    assert!(matches!(err, BridgeError::StagingTooLarge { .. }));
    assert_eq!(log.count(|e| matches!(e, BackendEvent::CopyBufferToBuffer { .. })), 0);
}

// ============================================================================
// Image staging
// ============================================================================

#[test]
fn redefined_level_applies_no_stale_updates() {
    let (mut ctx, log) = context(8);
    let texture = ctx.create_texture();
    let pixels = vec![0x80u8; 4 * 4 * 4];
    ctx.tex_image_2d(texture, 0, ImageFormat::Rgba8Unorm, 4, 4, Some(&pixels), PixelUnpackState::default())
        .unwrap();
    assert_eq!(ctx.texture(texture).unwrap().image().staged_updates(0).len(), 1);

    ctx.tex_image_2d(texture, 0, ImageFormat::Rgba8Unorm, 4, 4, None, PixelUnpackState::default())
        .unwrap();
    assert!(ctx.texture(texture).unwrap().image().staged_updates(0).is_empty());

    ctx.finish().unwrap();
    assert_eq!(log.count(|e| matches!(e, BackendEvent::CopyBufferToTexture { .. })), 0);
}

// ============================================================================
// Primitive emulation
// ============================================================================

#[test]
fn line_loop_draws_as_closed_strip() {
    let (mut ctx, log) = context(8);
    use_program(&mut ctx, &[]);
    ctx.draw_arrays(PrimitiveMode::LineLoop, 0, 4, 1).unwrap();
    assert_eq!(ctx.pipeline_descriptor().topology, wgpu::PrimitiveTopology::LineStrip);
    ctx.flush().unwrap();

    let draw = all_commands(&log).into_iter().find(Command::is_draw).unwrap();
    assert!(matches!(draw, Command::DrawIndexed { index_count: 5, .. }));
}

#[test]
fn triangle_fans_are_unimplemented() {
    let (mut ctx, log) = context(8);
    use_program(&mut ctx, &[]);
    let err = ctx.draw_arrays(PrimitiveMode::TriangleFan, 0, 4, 1).unwrap_err();
    assert!(err.is_unimplemented());

    let err = ctx
        .draw_elements(PrimitiveMode::TriangleFan, 3, IndexType::U16, IndexSource::Client(&[0, 0, 1, 0, 2, 0]), 1, 0)
        .unwrap_err();
    assert!(err.is_unimplemented());

    ctx.flush().unwrap();
    assert_eq!(log.count(|e| matches!(e, BackendEvent::RenderPass { .. })), 0);
    assert!(all_commands(&log).iter().all(|c| !c.is_draw()));
}

#[test]
fn indirect_and_multi_draws_are_unimplemented() {
    let (mut ctx, _log) = context(8);
    use_program(&mut ctx, &[]);
    assert!(ctx.draw_arrays_indirect(PrimitiveMode::Triangles, 0).unwrap_err().is_unimplemented());
    assert!(ctx
        .multi_draw_arrays(PrimitiveMode::Triangles, &[0], &[3])
        .unwrap_err()
        .is_unimplemented());
}

// ============================================================================
// Caller-supplied ranges
// ============================================================================

#[test]
fn overflowing_buffer_range_is_an_error() {
    let (mut ctx, _log) = context(8);
    let buffer = ctx.create_buffer();
    ctx.buffer_data(buffer, 16, None).unwrap();
    let err = ctx.buffer_sub_data(buffer, u64::MAX, &[1]).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidOperation(_)));
    let err = ctx.buffer_sub_data(buffer, 14, &[1, 2, 3]).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidOperation(_)));
}

#[test]
fn overflowing_sub_image_is_an_error() {
    let (mut ctx, _log) = context(8);
    let texture = ctx.create_texture();
    ctx.tex_image_2d(texture, 0, ImageFormat::Rgba8Unorm, 4, 4, None, PixelUnpackState::default())
        .unwrap();
    let err = ctx
        .tex_sub_image_2d(texture, 0, u32::MAX, 0, 2, 1, ImageFormat::Rgba8Unorm, &[0; 8], PixelUnpackState::default())
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidOperation(_)));
    assert!(ctx.texture(texture).unwrap().image().staged_updates(0).is_empty());
}

#[test]
fn overflowing_index_offset_is_an_error() {
    let (mut ctx, log) = context(8);
    use_program(&mut ctx, &[]);
    let element_buffer = ctx.create_buffer();
    ctx.bind_element_buffer(Some(element_buffer)).unwrap();
    ctx.buffer_data(element_buffer, 8, None).unwrap();
    let err = ctx
        .draw_elements(PrimitiveMode::Triangles, 3, IndexType::U16, IndexSource::Offset(u64::MAX - 1), 1, 0)
        .unwrap_err();
    assert!(matches!(err, BridgeError::InvalidOperation(_)));

    ctx.flush().unwrap();
    assert!(all_commands(&log).iter().all(|c| !c.is_draw()));
}

// ============================================================================
// Presentation
// ============================================================================

#[test]
fn swap_submits_and_presents_the_default_color_image() {
    let (mut ctx, log) = context(8);
    ctx.clear(ClearMask::COLOR).unwrap();
    ctx.swap_buffers().unwrap();

    let events = log.events();
    let submit = events.iter().position(|e| matches!(e, BackendEvent::Submit)).unwrap();
    let present = events.iter().position(|e| matches!(e, BackendEvent::Present(_))).unwrap();
    assert!(submit < present);
}
