//! Frontend graphics state.
//!
//! [`GraphicsState`] is the mutable attribute set the dispatch layer edits
//! between draws. Every setter compares against the current value and, on a
//! change, marks the matching [`StateDirtyBits`] flag. No backend work happens
//! here; the context translates the accumulated bits right before the next
//! draw, clear or read.

use bitflags::bitflags;
use glam::Vec4;
use slotmap::new_key_type;

use crate::constants::{MAX_DRAW_BUFFERS, MAX_TEXTURE_UNITS};
use crate::types::{
    BlendEquation, BlendFactor, ColorMask, CompareFunc, CullFaceMode, FrontFace, Rect, StencilOp,
};

new_key_type! {
    pub struct BufferHandle;
    pub struct TextureHandle;
    pub struct SamplerHandle;
    pub struct FramebufferHandle;
    pub struct VertexArrayHandle;
    pub struct ProgramHandle;
}

bitflags! {
    /// Frontend attributes changed since the last synchronization.
    ///
    /// Bit order matters: a bit may re-raise bits after itself while being
    /// translated (enabling a test re-evaluates its comparison function).
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct StateDirtyBits: u64 {
        const DRAW_FRAMEBUFFER_BINDING         = 1 << 0;
        const READ_FRAMEBUFFER_BINDING         = 1 << 1;
        const SCISSOR_TEST_ENABLED             = 1 << 2;
        const SCISSOR                          = 1 << 3;
        const VIEWPORT                         = 1 << 4;
        const DEPTH_RANGE                      = 1 << 5;
        const BLEND_ENABLED                    = 1 << 6;
        const BLEND_COLOR                      = 1 << 7;
        const BLEND_FUNCS                      = 1 << 8;
        const BLEND_EQUATIONS                  = 1 << 9;
        const COLOR_MASK                       = 1 << 10;
        const SAMPLE_ALPHA_TO_COVERAGE_ENABLED = 1 << 11;
        const DEPTH_TEST_ENABLED               = 1 << 12;
        const DEPTH_FUNC                       = 1 << 13;
        const DEPTH_MASK                       = 1 << 14;
        const STENCIL_TEST_ENABLED             = 1 << 15;
        const STENCIL_FUNCS_FRONT              = 1 << 16;
        const STENCIL_FUNCS_BACK               = 1 << 17;
        const STENCIL_OPS_FRONT                = 1 << 18;
        const STENCIL_OPS_BACK                 = 1 << 19;
        const STENCIL_WRITEMASK_FRONT          = 1 << 20;
        const STENCIL_WRITEMASK_BACK           = 1 << 21;
        const CULL_FACE_ENABLED                = 1 << 22;
        const CULL_FACE                        = 1 << 23;
        const FRONT_FACE                       = 1 << 24;
        const POLYGON_OFFSET_FILL_ENABLED      = 1 << 25;
        const POLYGON_OFFSET                   = 1 << 26;
        const PRIMITIVE_RESTART_ENABLED        = 1 << 27;
        const CLEAR_COLOR                      = 1 << 28;
        const CLEAR_DEPTH                      = 1 << 29;
        const CLEAR_STENCIL                    = 1 << 30;
        const VERTEX_ARRAY_BINDING             = 1 << 31;
        const PROGRAM_BINDING                  = 1 << 32;
        const PROGRAM_EXECUTABLE               = 1 << 33;
        const SAMPLER_BINDINGS                 = 1 << 34;
        const TEXTURE_BINDINGS                 = 1 << 35;
        const CLIP_CONTROL                     = 1 << 36;
        const LOGIC_OP_ENABLED                 = 1 << 37;
    }
}

/// Per-draw-buffer blend configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendTargetState {
    pub enabled: bool,
    pub src_color: BlendFactor,
    pub dst_color: BlendFactor,
    pub src_alpha: BlendFactor,
    pub dst_alpha: BlendFactor,
    pub equation_color: BlendEquation,
    pub equation_alpha: BlendEquation,
    pub color_mask: ColorMask,
}

impl Default for BlendTargetState {
    fn default() -> Self {
        Self {
            enabled: false,
            src_color: BlendFactor::One,
            dst_color: BlendFactor::Zero,
            src_alpha: BlendFactor::One,
            dst_alpha: BlendFactor::Zero,
            equation_color: BlendEquation::Add,
            equation_alpha: BlendEquation::Add,
            color_mask: ColorMask::ALL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StencilFaceState {
    pub func: CompareFunc,
    pub reference: i32,
    pub value_mask: u32,
    pub fail: StencilOp,
    pub depth_fail: StencilOp,
    pub pass: StencilOp,
    pub write_mask: u32,
}

impl Default for StencilFaceState {
    fn default() -> Self {
        Self {
            func: CompareFunc::Always,
            reference: 0,
            value_mask: u32::MAX,
            fail: StencilOp::Keep,
            depth_fail: StencilOp::Keep,
            pass: StencilOp::Keep,
            write_mask: u32::MAX,
        }
    }
}

/// The frontend's mutable attribute set.
#[derive(Debug, Clone)]
pub struct GraphicsState {
    viewport: Rect,
    depth_range: [f32; 2],
    scissor_test: bool,
    scissor: Rect,

    blend: [BlendTargetState; MAX_DRAW_BUFFERS],
    blend_color: Vec4,
    sample_alpha_to_coverage: bool,

    depth_test: bool,
    depth_func: CompareFunc,
    depth_mask: bool,

    stencil_test: bool,
    stencil_front: StencilFaceState,
    stencil_back: StencilFaceState,

    cull_face_enabled: bool,
    cull_face: CullFaceMode,
    front_face: FrontFace,
    polygon_offset_fill: bool,
    polygon_offset: [f32; 2],
    primitive_restart: bool,

    clear_color: Vec4,
    clear_depth: f32,
    clear_stencil: i32,

    draw_framebuffer: FramebufferHandle,
    read_framebuffer: FramebufferHandle,
    vertex_array: Option<VertexArrayHandle>,
    program: Option<ProgramHandle>,
    textures: [Option<TextureHandle>; MAX_TEXTURE_UNITS],
    samplers: [Option<SamplerHandle>; MAX_TEXTURE_UNITS],

    clip_control_upper_left: bool,
    logic_op_enabled: bool,

    dirty: StateDirtyBits,
}

#[inline]
fn update<T: PartialEq>(
    field: &mut T,
    value: T,
    dirty: &mut StateDirtyBits,
    bit: StateDirtyBits,
) -> bool {
    if *field == value {
        return false;
    }
    *field = value;
    dirty.insert(bit);
    true
}

impl GraphicsState {
    /// Fresh state with every attribute at its default and everything dirty,
    /// bound to `default_framebuffer` for both draw and read.
    #[must_use]
    pub fn new(default_framebuffer: FramebufferHandle, framebuffer_area: Rect) -> Self {
        Self {
            viewport: framebuffer_area,
            depth_range: [0.0, 1.0],
            scissor_test: false,
            scissor: framebuffer_area,
            blend: [BlendTargetState::default(); MAX_DRAW_BUFFERS],
            blend_color: Vec4::ZERO,
            sample_alpha_to_coverage: false,
            depth_test: false,
            depth_func: CompareFunc::Less,
            depth_mask: true,
            stencil_test: false,
            stencil_front: StencilFaceState::default(),
            stencil_back: StencilFaceState::default(),
            cull_face_enabled: false,
            cull_face: CullFaceMode::Back,
            front_face: FrontFace::Ccw,
            polygon_offset_fill: false,
            polygon_offset: [0.0, 0.0],
            primitive_restart: false,
            clear_color: Vec4::ZERO,
            clear_depth: 1.0,
            clear_stencil: 0,
            draw_framebuffer: default_framebuffer,
            read_framebuffer: default_framebuffer,
            vertex_array: None,
            program: None,
            textures: [None; MAX_TEXTURE_UNITS],
            samplers: [None; MAX_TEXTURE_UNITS],
            clip_control_upper_left: false,
            logic_op_enabled: false,
            dirty: StateDirtyBits::all(),
        }
    }

    // ------------------------------------------------------------------------
    // Dirty tracking
    // ------------------------------------------------------------------------

    #[inline]
    #[must_use]
    pub fn dirty_bits(&self) -> StateDirtyBits {
        self.dirty
    }

    /// Marks bits dirty without changing any attribute, e.g. when a bound
    /// resource was reallocated behind the frontend's back.
    #[inline]
    pub fn mark_dirty(&mut self, bits: StateDirtyBits) {
        self.dirty |= bits;
    }

    #[inline]
    pub fn take_dirty_bits(&mut self) -> StateDirtyBits {
        std::mem::take(&mut self.dirty)
    }

    // ------------------------------------------------------------------------
    // Viewport / scissor
    // ------------------------------------------------------------------------

    pub fn set_viewport(&mut self, viewport: Rect) {
        update(&mut self.viewport, viewport, &mut self.dirty, StateDirtyBits::VIEWPORT);
    }

    pub fn set_depth_range(&mut self, near: f32, far: f32) {
        update(&mut self.depth_range, [near, far], &mut self.dirty, StateDirtyBits::DEPTH_RANGE);
    }

    pub fn set_scissor_test(&mut self, enabled: bool) {
        update(&mut self.scissor_test, enabled, &mut self.dirty, StateDirtyBits::SCISSOR_TEST_ENABLED);
    }

    pub fn set_scissor(&mut self, scissor: Rect) {
        update(&mut self.scissor, scissor, &mut self.dirty, StateDirtyBits::SCISSOR);
    }

    // ------------------------------------------------------------------------
    // Blend
    // ------------------------------------------------------------------------

    pub fn set_blend_enabled(&mut self, enabled: bool) {
        for i in 0..MAX_DRAW_BUFFERS {
            self.set_blend_enabled_indexed(i, enabled);
        }
    }

    pub fn set_blend_enabled_indexed(&mut self, draw_buffer: usize, enabled: bool) {
        update(
            &mut self.blend[draw_buffer].enabled,
            enabled,
            &mut self.dirty,
            StateDirtyBits::BLEND_ENABLED,
        );
    }

    pub fn set_blend_func(&mut self, src: BlendFactor, dst: BlendFactor) {
        self.set_blend_func_separate(src, dst, src, dst);
    }

    pub fn set_blend_func_separate(
        &mut self,
        src_color: BlendFactor,
        dst_color: BlendFactor,
        src_alpha: BlendFactor,
        dst_alpha: BlendFactor,
    ) {
        for target in &mut self.blend {
            let funcs = (src_color, dst_color, src_alpha, dst_alpha);
            let current = (target.src_color, target.dst_color, target.src_alpha, target.dst_alpha);
            if current != funcs {
                target.src_color = src_color;
                target.dst_color = dst_color;
                target.src_alpha = src_alpha;
                target.dst_alpha = dst_alpha;
                self.dirty.insert(StateDirtyBits::BLEND_FUNCS);
            }
        }
    }

    pub fn set_blend_equation(&mut self, equation: BlendEquation) {
        self.set_blend_equation_separate(equation, equation);
    }

    pub fn set_blend_equation_separate(&mut self, color: BlendEquation, alpha: BlendEquation) {
        for target in &mut self.blend {
            if (target.equation_color, target.equation_alpha) != (color, alpha) {
                target.equation_color = color;
                target.equation_alpha = alpha;
                self.dirty.insert(StateDirtyBits::BLEND_EQUATIONS);
            }
        }
    }

    pub fn set_blend_color(&mut self, color: Vec4) {
        update(&mut self.blend_color, color, &mut self.dirty, StateDirtyBits::BLEND_COLOR);
    }

    pub fn set_color_mask(&mut self, mask: ColorMask) {
        for i in 0..MAX_DRAW_BUFFERS {
            self.set_color_mask_indexed(i, mask);
        }
    }

    pub fn set_color_mask_indexed(&mut self, draw_buffer: usize, mask: ColorMask) {
        update(
            &mut self.blend[draw_buffer].color_mask,
            mask,
            &mut self.dirty,
            StateDirtyBits::COLOR_MASK,
        );
    }

    pub fn set_sample_alpha_to_coverage(&mut self, enabled: bool) {
        update(
            &mut self.sample_alpha_to_coverage,
            enabled,
            &mut self.dirty,
            StateDirtyBits::SAMPLE_ALPHA_TO_COVERAGE_ENABLED,
        );
    }

    pub fn set_logic_op_enabled(&mut self, enabled: bool) {
        update(&mut self.logic_op_enabled, enabled, &mut self.dirty, StateDirtyBits::LOGIC_OP_ENABLED);
    }

    // ------------------------------------------------------------------------
    // Depth / stencil
    // ------------------------------------------------------------------------

    pub fn set_depth_test(&mut self, enabled: bool) {
        update(&mut self.depth_test, enabled, &mut self.dirty, StateDirtyBits::DEPTH_TEST_ENABLED);
    }

    pub fn set_depth_func(&mut self, func: CompareFunc) {
        update(&mut self.depth_func, func, &mut self.dirty, StateDirtyBits::DEPTH_FUNC);
    }

    pub fn set_depth_mask(&mut self, write: bool) {
        update(&mut self.depth_mask, write, &mut self.dirty, StateDirtyBits::DEPTH_MASK);
    }

    pub fn set_stencil_test(&mut self, enabled: bool) {
        update(&mut self.stencil_test, enabled, &mut self.dirty, StateDirtyBits::STENCIL_TEST_ENABLED);
    }

    pub fn set_stencil_func_separate(
        &mut self,
        face: CullFaceMode,
        func: CompareFunc,
        reference: i32,
        value_mask: u32,
    ) {
        let apply = |s: &mut StencilFaceState| {
            let changed = (s.func, s.reference, s.value_mask) != (func, reference, value_mask);
            s.func = func;
            s.reference = reference;
            s.value_mask = value_mask;
            changed
        };
        if face != CullFaceMode::Back && apply(&mut self.stencil_front) {
            self.dirty.insert(StateDirtyBits::STENCIL_FUNCS_FRONT);
        }
        if face != CullFaceMode::Front && apply(&mut self.stencil_back) {
            self.dirty.insert(StateDirtyBits::STENCIL_FUNCS_BACK);
        }
    }

    pub fn set_stencil_op_separate(
        &mut self,
        face: CullFaceMode,
        fail: StencilOp,
        depth_fail: StencilOp,
        pass: StencilOp,
    ) {
        let apply = |s: &mut StencilFaceState| {
            let changed = (s.fail, s.depth_fail, s.pass) != (fail, depth_fail, pass);
            s.fail = fail;
            s.depth_fail = depth_fail;
            s.pass = pass;
            changed
        };
        if face != CullFaceMode::Back && apply(&mut self.stencil_front) {
            self.dirty.insert(StateDirtyBits::STENCIL_OPS_FRONT);
        }
        if face != CullFaceMode::Front && apply(&mut self.stencil_back) {
            self.dirty.insert(StateDirtyBits::STENCIL_OPS_BACK);
        }
    }

    pub fn set_stencil_write_mask_separate(&mut self, face: CullFaceMode, mask: u32) {
        if face != CullFaceMode::Back {
            update(
                &mut self.stencil_front.write_mask,
                mask,
                &mut self.dirty,
                StateDirtyBits::STENCIL_WRITEMASK_FRONT,
            );
        }
        if face != CullFaceMode::Front {
            update(
                &mut self.stencil_back.write_mask,
                mask,
                &mut self.dirty,
                StateDirtyBits::STENCIL_WRITEMASK_BACK,
            );
        }
    }

    // ------------------------------------------------------------------------
    // Rasterizer
    // ------------------------------------------------------------------------

    pub fn set_cull_face_enabled(&mut self, enabled: bool) {
        update(&mut self.cull_face_enabled, enabled, &mut self.dirty, StateDirtyBits::CULL_FACE_ENABLED);
    }

    pub fn set_cull_face(&mut self, mode: CullFaceMode) {
        update(&mut self.cull_face, mode, &mut self.dirty, StateDirtyBits::CULL_FACE);
    }

    pub fn set_front_face(&mut self, front_face: FrontFace) {
        update(&mut self.front_face, front_face, &mut self.dirty, StateDirtyBits::FRONT_FACE);
    }

    pub fn set_polygon_offset_fill(&mut self, enabled: bool) {
        update(
            &mut self.polygon_offset_fill,
            enabled,
            &mut self.dirty,
            StateDirtyBits::POLYGON_OFFSET_FILL_ENABLED,
        );
    }

    pub fn set_polygon_offset(&mut self, factor: f32, units: f32) {
        update(&mut self.polygon_offset, [factor, units], &mut self.dirty, StateDirtyBits::POLYGON_OFFSET);
    }

    pub fn set_primitive_restart(&mut self, enabled: bool) {
        update(
            &mut self.primitive_restart,
            enabled,
            &mut self.dirty,
            StateDirtyBits::PRIMITIVE_RESTART_ENABLED,
        );
    }

    pub fn set_clip_control_upper_left(&mut self, upper_left: bool) {
        update(&mut self.clip_control_upper_left, upper_left, &mut self.dirty, StateDirtyBits::CLIP_CONTROL);
    }

    // ------------------------------------------------------------------------
    // Clear values
    // ------------------------------------------------------------------------

    pub fn set_clear_color(&mut self, color: Vec4) {
        update(&mut self.clear_color, color, &mut self.dirty, StateDirtyBits::CLEAR_COLOR);
    }

    pub fn set_clear_depth(&mut self, depth: f32) {
        update(&mut self.clear_depth, depth, &mut self.dirty, StateDirtyBits::CLEAR_DEPTH);
    }

    pub fn set_clear_stencil(&mut self, stencil: i32) {
        update(&mut self.clear_stencil, stencil, &mut self.dirty, StateDirtyBits::CLEAR_STENCIL);
    }

    // ------------------------------------------------------------------------
    // Bindings
    // ------------------------------------------------------------------------

    pub fn bind_draw_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        update(
            &mut self.draw_framebuffer,
            framebuffer,
            &mut self.dirty,
            StateDirtyBits::DRAW_FRAMEBUFFER_BINDING,
        );
    }

    pub fn bind_read_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        update(
            &mut self.read_framebuffer,
            framebuffer,
            &mut self.dirty,
            StateDirtyBits::READ_FRAMEBUFFER_BINDING,
        );
    }

    pub fn bind_vertex_array(&mut self, vertex_array: Option<VertexArrayHandle>) {
        update(&mut self.vertex_array, vertex_array, &mut self.dirty, StateDirtyBits::VERTEX_ARRAY_BINDING);
    }

    pub fn use_program(&mut self, program: Option<ProgramHandle>) {
        update(&mut self.program, program, &mut self.dirty, StateDirtyBits::PROGRAM_BINDING);
    }

    pub fn bind_texture(&mut self, unit: usize, texture: Option<TextureHandle>) {
        update(&mut self.textures[unit], texture, &mut self.dirty, StateDirtyBits::TEXTURE_BINDINGS);
    }

    pub fn bind_sampler(&mut self, unit: usize, sampler: Option<SamplerHandle>) {
        update(&mut self.samplers[unit], sampler, &mut self.dirty, StateDirtyBits::SAMPLER_BINDINGS);
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    #[inline]
    #[must_use]
    pub fn viewport(&self) -> Rect {
        self.viewport
    }

    #[inline]
    #[must_use]
    pub fn depth_range(&self) -> [f32; 2] {
        self.depth_range
    }

    #[inline]
    #[must_use]
    pub fn is_scissor_test_enabled(&self) -> bool {
        self.scissor_test
    }

    #[inline]
    #[must_use]
    pub fn scissor(&self) -> Rect {
        self.scissor
    }

    #[inline]
    #[must_use]
    pub fn blend_target(&self, draw_buffer: usize) -> &BlendTargetState {
        &self.blend[draw_buffer]
    }

    #[inline]
    #[must_use]
    pub fn blend_color(&self) -> Vec4 {
        self.blend_color
    }

    #[inline]
    #[must_use]
    pub fn is_sample_alpha_to_coverage_enabled(&self) -> bool {
        self.sample_alpha_to_coverage
    }

    #[inline]
    #[must_use]
    pub fn is_logic_op_enabled(&self) -> bool {
        self.logic_op_enabled
    }

    #[inline]
    #[must_use]
    pub fn is_depth_test_enabled(&self) -> bool {
        self.depth_test
    }

    #[inline]
    #[must_use]
    pub fn depth_func(&self) -> CompareFunc {
        self.depth_func
    }

    #[inline]
    #[must_use]
    pub fn depth_mask(&self) -> bool {
        self.depth_mask
    }

    #[inline]
    #[must_use]
    pub fn is_stencil_test_enabled(&self) -> bool {
        self.stencil_test
    }

    #[inline]
    #[must_use]
    pub fn stencil_front(&self) -> &StencilFaceState {
        &self.stencil_front
    }

    #[inline]
    #[must_use]
    pub fn stencil_back(&self) -> &StencilFaceState {
        &self.stencil_back
    }

    #[inline]
    #[must_use]
    pub fn is_cull_face_enabled(&self) -> bool {
        self.cull_face_enabled
    }

    #[inline]
    #[must_use]
    pub fn cull_face(&self) -> CullFaceMode {
        self.cull_face
    }

    #[inline]
    #[must_use]
    pub fn front_face(&self) -> FrontFace {
        self.front_face
    }

    #[inline]
    #[must_use]
    pub fn is_polygon_offset_fill_enabled(&self) -> bool {
        self.polygon_offset_fill
    }

    #[inline]
    #[must_use]
    pub fn polygon_offset(&self) -> [f32; 2] {
        self.polygon_offset
    }

    #[inline]
    #[must_use]
    pub fn is_primitive_restart_enabled(&self) -> bool {
        self.primitive_restart
    }

    #[inline]
    #[must_use]
    pub fn is_clip_control_upper_left(&self) -> bool {
        self.clip_control_upper_left
    }

    #[inline]
    #[must_use]
    pub fn clear_color(&self) -> Vec4 {
        self.clear_color
    }

    #[inline]
    #[must_use]
    pub fn clear_depth(&self) -> f32 {
        self.clear_depth
    }

    #[inline]
    #[must_use]
    pub fn clear_stencil(&self) -> i32 {
        self.clear_stencil
    }

    #[inline]
    #[must_use]
    pub fn draw_framebuffer(&self) -> FramebufferHandle {
        self.draw_framebuffer
    }

    #[inline]
    #[must_use]
    pub fn read_framebuffer(&self) -> FramebufferHandle {
        self.read_framebuffer
    }

    #[inline]
    #[must_use]
    pub fn vertex_array(&self) -> Option<VertexArrayHandle> {
        self.vertex_array
    }

    #[inline]
    #[must_use]
    pub fn program(&self) -> Option<ProgramHandle> {
        self.program
    }

    #[inline]
    #[must_use]
    pub fn texture(&self, unit: usize) -> Option<TextureHandle> {
        self.textures.get(unit).copied().flatten()
    }

    #[inline]
    #[must_use]
    pub fn sampler(&self, unit: usize) -> Option<SamplerHandle> {
        self.samplers.get(unit).copied().flatten()
    }

    /// Units whose texture binding is `texture`.
    pub fn units_bound_to(&self, texture: TextureHandle) -> impl Iterator<Item = usize> + '_ {
        self.textures
            .iter()
            .enumerate()
            .filter_map(move |(unit, bound)| (*bound == Some(texture)).then_some(unit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use slotmap::SlotMap;

    fn fresh() -> GraphicsState {
        let mut fbs: SlotMap<FramebufferHandle, ()> = SlotMap::with_key();
        let mut state = GraphicsState::new(fbs.insert(()), Rect::new(0, 0, 64, 64));
        state.take_dirty_bits();
        state
    }

    #[test]
    fn new_state_is_fully_dirty() {
        let mut fbs: SlotMap<FramebufferHandle, ()> = SlotMap::with_key();
        let state = GraphicsState::new(fbs.insert(()), Rect::new(0, 0, 4, 4));
        assert_eq!(state.dirty_bits(), StateDirtyBits::all());
    }

    #[test]
    fn unchanged_values_do_not_mark() {
        let mut state = fresh();
        state.set_viewport(Rect::new(0, 0, 64, 64));
        state.set_depth_func(CompareFunc::Less);
        state.set_blend_func(BlendFactor::One, BlendFactor::Zero);
        assert!(state.dirty_bits().is_empty());
    }

    #[test]
    fn changes_mark_their_bit() {
        let mut state = fresh();
        state.set_scissor(Rect::new(0, 0, 10, 10));
        state.set_blend_color(Vec4::ONE);
        assert_eq!(state.take_dirty_bits(), StateDirtyBits::SCISSOR | StateDirtyBits::BLEND_COLOR);
        assert!(state.dirty_bits().is_empty());
    }

    #[test]
    fn stencil_faces_are_tracked_separately() {
        let mut state = fresh();
        state.set_stencil_func_separate(CullFaceMode::Back, CompareFunc::Equal, 1, 0xFF);
        assert_eq!(state.dirty_bits(), StateDirtyBits::STENCIL_FUNCS_BACK);
        state.set_stencil_op_separate(
            CullFaceMode::FrontAndBack,
            StencilOp::Keep,
            StencilOp::Keep,
            StencilOp::Replace,
        );
        assert!(state.dirty_bits().contains(StateDirtyBits::STENCIL_OPS_FRONT | StateDirtyBits::STENCIL_OPS_BACK));
        assert_eq!(state.stencil_back().pass, StencilOp::Replace);
    }

    #[test]
    fn enable_bits_precede_the_bits_they_raise() {
        assert!(StateDirtyBits::DEPTH_TEST_ENABLED.bits() < StateDirtyBits::DEPTH_FUNC.bits());
        assert!(StateDirtyBits::STENCIL_TEST_ENABLED.bits() < StateDirtyBits::STENCIL_FUNCS_FRONT.bits());
        assert!(StateDirtyBits::PROGRAM_BINDING.bits() < StateDirtyBits::TEXTURE_BINDINGS.bits());
    }
}
