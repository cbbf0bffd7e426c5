//! Method dispatch for the 3D engine class.
//!
//! The command stream is a sequence of (subchannel, method, parameter)
//! triples. SET_OBJECT binds an engine class to a subchannel; everything
//! else routes to the class bound there. Only the 3D class is modeled,
//! and within it only the registers the render pipeline consumes; all
//! other methods are logged and discarded.

use crate::backend::{ClearParams, HostBackend, Topology};
use crate::batch::DrawBatch;
use crate::error::KelvinError;
use crate::guest_memory::{DmaTable, GuestMemory};
use crate::regs::{self, ColorMask, RegisterBank};
use crate::shader_cache::ShaderCache;
use crate::stats::ProcessorStats;
use crate::surface::{self, SurfaceKind, SurfaceTracker};
use crate::texture_cache::TextureCache;
use crate::vertex_cache::VertexCache;

pub const KELVIN_CLASS: u32 = 0x97;

/// Non-3D classes the dispatcher recognizes but does not model. Methods
/// for them are dropped silently instead of tripping the unhandled
/// counter.
pub const NULL_CLASS: u32 = 0x19;
pub const CONTEXT_SURFACES_2D_CLASS: u32 = 0x62;
pub const IMAGE_BLIT_CLASS: u32 = 0x9f;

pub const SET_OBJECT: u32 = 0x0000;
pub const NO_OPERATION: u32 = 0x0100;
pub const WAIT_FOR_IDLE: u32 = 0x0110;
pub const SET_CONTEXT_DMA_COLOR: u32 = 0x0194;
pub const SET_CONTEXT_DMA_ZETA: u32 = 0x0198;
pub const SET_SURFACE_CLIP_HORIZONTAL: u32 = 0x0200;
pub const SET_SURFACE_CLIP_VERTICAL: u32 = 0x0204;
pub const SET_SURFACE_FORMAT: u32 = 0x0208;
pub const SET_SURFACE_PITCH: u32 = 0x020c;
pub const SET_SURFACE_COLOR_OFFSET: u32 = 0x0210;
pub const SET_SURFACE_ZETA_OFFSET: u32 = 0x0214;
pub const SET_DEPTH_TEST_ENABLE: u32 = 0x030c;
pub const SET_STENCIL_TEST_ENABLE: u32 = 0x032c;
pub const SET_COLOR_MASK: u32 = 0x0358;
pub const SET_DEPTH_MASK: u32 = 0x035c;
pub const SET_BEGIN_END: u32 = 0x17fc;
pub const ARRAY_ELEMENT16: u32 = 0x1800;
pub const ARRAY_ELEMENT32: u32 = 0x1808;
pub const DRAW_ARRAYS: u32 = 0x1810;
pub const INLINE_ARRAY: u32 = 0x1818;
pub const SET_VERTEX_DATA2F_M: u32 = 0x1880;
pub const SET_VERTEX_DATA4F_M: u32 = 0x1a00;
pub const SET_TEXTURE_OFFSET: u32 = 0x1b00;
pub const SET_TEXTURE_FORMAT: u32 = 0x1b04;
pub const SET_TEXTURE_CONTROL0: u32 = 0x1b0c;
pub const SET_TEXTURE_CONTROL1: u32 = 0x1b10;
pub const SET_TEXTURE_IMAGE_RECT: u32 = 0x1b1c;
pub const SET_ZSTENCIL_CLEAR_VALUE: u32 = 0x1d8c;
pub const SET_COLOR_CLEAR_VALUE: u32 = 0x1d90;
pub const CLEAR_SURFACE: u32 = 0x1d94;
pub const SET_CLEAR_RECT_HORIZONTAL: u32 = 0x1d98;
pub const SET_CLEAR_RECT_VERTICAL: u32 = 0x1d9c;

/// 64 bytes of methods per texture slot.
const TEXTURE_SLOT_STRIDE: u32 = 0x40;

pub const CLEAR_SURFACE_Z: u32 = 1 << 0;
pub const CLEAR_SURFACE_STENCIL: u32 = 1 << 1;
pub const CLEAR_SURFACE_R: u32 = 1 << 4;
pub const CLEAR_SURFACE_G: u32 = 1 << 5;
pub const CLEAR_SURFACE_B: u32 = 1 << 6;
pub const CLEAR_SURFACE_A: u32 = 1 << 7;
pub const CLEAR_SURFACE_COLOR: u32 =
    CLEAR_SURFACE_R | CLEAR_SURFACE_G | CLEAR_SURFACE_B | CLEAR_SURFACE_A;

/// Words per vertex in the interleaved inline array. Only position
/// (x, y, z, w) interleave is modeled.
const INLINE_ARRAY_STRIDE_WORDS: u32 = 4;

/// Does a raw command word encode a header for `method`? Subchannel bits
/// are ignored, matching the lookahead match the squash uses.
fn is_method_header(word: u32, method: u32) -> bool {
    (word & 0x31fff) == method
}

/// The complete graphics engine state driven by the method stream.
pub struct GraphicsEngine {
    pub regs: RegisterBank,
    pub dma: DmaTable,
    pub surfaces: SurfaceTracker,
    pub textures: TextureCache,
    pub shaders: ShaderCache,
    pub vertices: VertexCache,
    pub batch: DrawBatch,
    pub stats: ProcessorStats,

    /// Collapse BEGIN,DRAW_ARRAYS,END repetitions into one batch.
    pub squash_repeated_draws: bool,

    current_topology: Topology,
}

impl GraphicsEngine {
    pub fn new(
        surface_age_limit: u64,
        texture_cache_capacity: usize,
        shader_cache_capacity: usize,
        vertex_cache_capacity: usize,
    ) -> Self {
        GraphicsEngine {
            regs: RegisterBank::default(),
            dma: DmaTable::default(),
            surfaces: SurfaceTracker::new(surface_age_limit),
            textures: TextureCache::new(texture_cache_capacity),
            shaders: ShaderCache::new(shader_cache_capacity),
            vertices: VertexCache::new(vertex_cache_capacity),
            batch: DrawBatch::new(),
            stats: ProcessorStats::default(),
            squash_repeated_draws: true,
            current_topology: Topology::Triangles,
        }
    }

    /// Execute one method. `lookahead` is the raw command words following
    /// this method's parameter; the return value is how many of those were
    /// consumed beyond the method itself (only the draw squash does this).
    pub fn dispatch(
        &mut self,
        subchannel: usize,
        method: u32,
        parameter: u32,
        vram: &mut dyn GuestMemory,
        backend: &mut dyn HostBackend,
        lookahead: &[u32],
    ) -> Result<usize, KelvinError> {
        self.stats.methods_dispatched += 1;

        if method == SET_OBJECT {
            self.regs.subchannel_class[subchannel] = parameter;
            return Ok(0);
        }

        let class = self.regs.subchannel_class[subchannel];
        if class != KELVIN_CLASS {
            match class {
                NULL_CLASS | CONTEXT_SURFACES_2D_CLASS | IMAGE_BLIT_CLASS => {
                    tracing::debug!(subchannel, class, method, parameter, "non-3d class method");
                }
                _ => {
                    tracing::warn!(subchannel, class, method, parameter, "method for unknown class");
                    self.stats.methods_unhandled += 1;
                }
            }
            return Ok(0);
        }

        match method {
            NO_OPERATION | WAIT_FOR_IDLE => {}

            SET_CONTEXT_DMA_COLOR => self.regs.dma_color = parameter,
            SET_CONTEXT_DMA_ZETA => self.regs.dma_zeta = parameter,

            SET_SURFACE_CLIP_HORIZONTAL => {
                self.regs.surface_shape.clip_x = parameter & 0xffff;
                self.regs.surface_shape.clip_width = parameter >> 16;
            }
            SET_SURFACE_CLIP_VERTICAL => {
                self.regs.surface_shape.clip_y = parameter & 0xffff;
                self.regs.surface_shape.clip_height = parameter >> 16;
            }
            SET_SURFACE_FORMAT => {
                let shape = &mut self.regs.surface_shape;
                shape.color_format = parameter & 0xf;
                shape.zeta_format = (parameter >> 4) & 0xf;
                shape.swizzle = (parameter >> 8) & 0xf == 2;
                shape.anti_aliasing = (parameter >> 12) & 0xf;
                shape.log_width = (parameter >> 16) & 0xff;
                shape.log_height = (parameter >> 24) & 0xff;
            }
            SET_SURFACE_PITCH => {
                self.regs.surface_color.pitch = parameter & 0xffff;
                self.regs.surface_zeta.pitch = parameter >> 16;
                self.regs.surface_color.buffer_dirty = true;
                self.regs.surface_zeta.buffer_dirty = true;
            }
            SET_SURFACE_COLOR_OFFSET => {
                self.regs.surface_color.offset = parameter;
                self.regs.surface_color.buffer_dirty = true;
            }
            SET_SURFACE_ZETA_OFFSET => {
                self.regs.surface_zeta.offset = parameter;
                self.regs.surface_zeta.buffer_dirty = true;
            }

            SET_COLOR_MASK => {
                // Remember that the outgoing mask allowed writes before it
                // is replaced; pending downloads depend on it.
                self.regs.surface_color.write_enabled_cache |= self.regs.color_write_enabled();
                let mut mask = ColorMask::empty();
                mask.set(ColorMask::BLUE, parameter & 0x0000_0001 != 0);
                mask.set(ColorMask::GREEN, parameter & 0x0000_0100 != 0);
                mask.set(ColorMask::RED, parameter & 0x0001_0000 != 0);
                mask.set(ColorMask::ALPHA, parameter & 0x0100_0000 != 0);
                self.regs.color_mask = mask;
            }
            SET_DEPTH_TEST_ENABLE => {
                self.regs.surface_zeta.write_enabled_cache |= self.regs.zeta_write_enabled();
                self.regs.depth_test = parameter != 0;
            }
            SET_STENCIL_TEST_ENABLE => {
                self.regs.surface_zeta.write_enabled_cache |= self.regs.zeta_write_enabled();
                self.regs.stencil_test = parameter != 0;
            }
            SET_DEPTH_MASK => {
                self.regs.surface_zeta.write_enabled_cache |= self.regs.zeta_write_enabled();
                self.regs.depth_write = parameter != 0;
            }

            SET_BEGIN_END => self.begin_end(parameter, vram, backend)?,

            ARRAY_ELEMENT16 => {
                self.check_within_begin_end();
                self.expand_draw_arrays(backend)?;
                self.batch.add_element16(parameter);
            }
            ARRAY_ELEMENT32 => {
                self.check_within_begin_end();
                self.expand_draw_arrays(backend)?;
                self.batch.add_element32(parameter);
            }
            DRAW_ARRAYS => {
                self.check_within_begin_end();
                let start = parameter & 0x00ff_ffff;
                let count = (parameter >> 24) + 1;
                self.batch.add_draw_arrays(start, count);

                if self.squash_repeated_draws
                    && lookahead.len() >= 5
                    && self.batch.can_squash_another_range()
                    && is_method_header(lookahead[0], SET_BEGIN_END)
                    && lookahead[1] == regs::PRIM_END
                    && is_method_header(lookahead[2], SET_BEGIN_END)
                    && Some(lookahead[3]) == self.regs.primitive_mode
                    && is_method_header(lookahead[4], DRAW_ARRAYS)
                {
                    // Skip the END,BEGIN pair; the next DRAW_ARRAYS lands
                    // in this batch as a disconnected range.
                    self.batch.draw_arrays_prevent_connect = true;
                    self.stats.squashed_draw_triples += 1;
                    return Ok(4);
                }
            }
            INLINE_ARRAY => {
                self.check_within_begin_end();
                self.batch.add_inline_array_word(parameter);
            }

            m if (SET_VERTEX_DATA2F_M..SET_VERTEX_DATA2F_M + 0x80).contains(&m) => {
                let idx = ((m - SET_VERTEX_DATA2F_M) / 4) as usize;
                let (attr, part) = (idx / 2, idx % 2);
                self.batch.set_attr_component(attr, part, f32::from_bits(parameter));
                self.batch.set_attr_component(attr, 2, 0.0);
                self.batch.set_attr_component(attr, 3, 1.0);
                if attr == 0 && part == 1 {
                    self.batch.finish_inline_vertex();
                }
            }
            m if (SET_VERTEX_DATA4F_M..SET_VERTEX_DATA4F_M + 0x100).contains(&m) => {
                let idx = ((m - SET_VERTEX_DATA4F_M) / 4) as usize;
                let (attr, part) = (idx / 4, idx % 4);
                self.batch.set_attr_component(attr, part, f32::from_bits(parameter));
                if attr == 0 && part == 3 {
                    self.batch.finish_inline_vertex();
                }
            }

            m if (SET_TEXTURE_OFFSET
                ..SET_TEXTURE_OFFSET + TEXTURE_SLOT_STRIDE * regs::NUM_TEXTURE_SLOTS as u32)
                .contains(&m) =>
            {
                self.texture_method(m, parameter);
            }

            SET_ZSTENCIL_CLEAR_VALUE => self.regs.zstencil_clear_value = parameter,
            SET_COLOR_CLEAR_VALUE => self.regs.color_clear_value = parameter,
            CLEAR_SURFACE => self.clear_surface(parameter, vram, backend)?,
            SET_CLEAR_RECT_HORIZONTAL | SET_CLEAR_RECT_VERTICAL => {
                self.regs.write_raw(method, parameter);
            }

            _ => {
                tracing::warn!(subchannel, method, parameter, "unhandled method");
                self.stats.methods_unhandled += 1;
            }
        }
        Ok(0)
    }

    fn check_within_begin_end(&self) {
        if self.regs.primitive_mode.is_none() {
            tracing::warn!("vertex data sent outside of begin/end block");
        }
    }

    fn begin_end(
        &mut self,
        parameter: u32,
        vram: &mut dyn GuestMemory,
        backend: &mut dyn HostBackend,
    ) -> Result<(), KelvinError> {
        if parameter == regs::PRIM_END {
            if self.regs.primitive_mode.is_none() {
                tracing::warn!("end without begin");
                self.batch.reset();
                return Ok(());
            }
            self.stats.begin_ends += 1;
            self.draw_end(backend)?;
            self.batch.reset();
            self.regs.primitive_mode = None;
        } else {
            if self.regs.primitive_mode.is_some() {
                tracing::warn!(parameter, "begin without end");
                return Ok(());
            }
            let topology = match regs::topology_for_primitive(parameter) {
                Some(t) => t,
                None => {
                    tracing::warn!(parameter, "invalid primitive code");
                    return Ok(());
                }
            };
            self.regs.primitive_mode = Some(parameter);
            self.current_topology = topology;
            self.batch.reset();
            self.draw_begin(parameter, vram, backend)?;
        }
        Ok(())
    }

    fn draw_begin(
        &mut self,
        primitive: u32,
        vram: &mut dyn GuestMemory,
        backend: &mut dyn HostBackend,
    ) -> Result<(), KelvinError> {
        let zeta_write = self.regs.depth_test || self.regs.stencil_test;
        let is_nop_draw = !(self.regs.color_write_enabled() || zeta_write);

        self.surfaces.update(
            &mut self.regs,
            vram,
            &self.dma,
            backend,
            &mut self.stats,
            true,
            true,
            zeta_write,
            true,
        )?;

        if is_nop_draw {
            return Ok(());
        }

        self.textures
            .bind_textures(&mut self.regs, vram, &mut self.surfaces, backend, &mut self.stats)?;
        self.shaders
            .bind(&self.regs, primitive, backend, &mut self.stats)?;
        Ok(())
    }

    fn draw_end(&mut self, backend: &mut dyn HostBackend) -> Result<(), KelvinError> {
        let color_write = self.regs.color_write_enabled();
        let zeta_write = self.regs.depth_test || self.regs.stencil_test;
        if !(color_write || zeta_write) {
            return Ok(());
        }

        if self.batch.is_empty() {
            self.stats.empty_begin_ends += 1;
        }
        self.flush_batch(backend)?;

        self.surfaces.stamp_draw(&self.regs);
        self.surfaces
            .mark_draw_dirty(&mut self.regs, color_write, zeta_write);
        Ok(())
    }

    fn flush_batch(&mut self, backend: &mut dyn HostBackend) -> Result<(), KelvinError> {
        self.batch.flush(
            self.current_topology,
            INLINE_ARRAY_STRIDE_WORDS,
            &mut self.vertices,
            backend,
            &mut self.stats,
        )?;
        Ok(())
    }

    /// Convert pending implicit ranges into explicit elements so a
    /// following ARRAY_ELEMENT continues the same primitive. Earlier
    /// squashed ranges are drawn first; the last range is re-emitted as
    /// elements.
    fn expand_draw_arrays(&mut self, backend: &mut dyn HostBackend) -> Result<(), KelvinError> {
        let (start, count) = match self.batch.last_draw_arrays_range() {
            Some(range) => range,
            None => return Ok(()),
        };
        if self.batch.draw_arrays_len() > 1 {
            self.flush_batch(backend)?;
        }
        self.batch.append_elements_range(start, count);
        self.batch.clear_draw_arrays();
        Ok(())
    }

    fn texture_method(&mut self, method: u32, parameter: u32) {
        let rel = method - SET_TEXTURE_OFFSET;
        let slot = (rel / TEXTURE_SLOT_STRIDE) as usize;
        match SET_TEXTURE_OFFSET + rel % TEXTURE_SLOT_STRIDE {
            SET_TEXTURE_OFFSET => self.regs.textures[slot].offset = parameter,
            SET_TEXTURE_FORMAT => {
                let t = &mut self.regs.textures[slot];
                t.color_format = (parameter >> 8) & 0x7f;
                t.log_width = (parameter >> 20) & 0xf;
                t.log_height = (parameter >> 24) & 0xf;
            }
            SET_TEXTURE_CONTROL0 => {
                self.regs.textures[slot].enabled = parameter & 0x4000_0000 != 0;
            }
            SET_TEXTURE_CONTROL1 => self.regs.textures[slot].pitch = parameter >> 16,
            _ => self.regs.write_raw(method, parameter),
        }
        self.regs.textures[slot].dirty = true;
    }

    fn clear_surface(
        &mut self,
        parameter: u32,
        vram: &mut dyn GuestMemory,
        backend: &mut dyn HostBackend,
    ) -> Result<(), KelvinError> {
        self.regs.clearing = true;

        let write_color = parameter & CLEAR_SURFACE_COLOR != 0;
        let write_zeta = parameter & (CLEAR_SURFACE_Z | CLEAR_SURFACE_STENCIL) != 0;

        let rect_x = self.regs.read_raw(SET_CLEAR_RECT_HORIZONTAL);
        let rect_y = self.regs.read_raw(SET_CLEAR_RECT_VERTICAL);
        let (xmin, xmax) = (rect_x & 0xffff, rect_x >> 16);
        let (ymin, ymax) = (rect_y & 0xffff, rect_y >> 16);
        let (width, height) = surface::shape_dimensions(&self.regs.surface_shape);
        let full_clear =
            xmin == 0 && ymin == 0 && (xmax + 1) >= width && (ymax + 1) >= height;

        tracing::debug!(parameter, xmin, ymin, xmax, ymax, full_clear, "clear surface");

        // A full clear overwrites the whole target, so seeding the fresh
        // host image from guest memory would be wasted work.
        self.surfaces.update(
            &mut self.regs,
            vram,
            &self.dma,
            backend,
            &mut self.stats,
            true,
            write_color,
            write_zeta,
            !full_clear,
        )?;

        if write_color {
            if let Some(binding) = self.surfaces.binding(SurfaceKind::Color) {
                backend.clear_image(
                    binding.image,
                    ClearParams {
                        color: Some(self.regs.color_clear_value),
                        depth_stencil: None,
                    },
                )?;
            }
        }
        if write_zeta {
            if let Some(binding) = self.surfaces.binding(SurfaceKind::Zeta) {
                backend.clear_image(
                    binding.image,
                    ClearParams {
                        color: None,
                        depth_stencil: Some(self.regs.zstencil_clear_value),
                    },
                )?;
            }
        }

        self.surfaces
            .mark_draw_dirty(&mut self.regs, write_color, write_zeta);
        self.surfaces
            .notify_cleared(full_clear, write_color, write_zeta);

        self.regs.clearing = false;
        Ok(())
    }

    /// Write every draw-dirty surface back to guest memory.
    pub fn download_dirty(
        &mut self,
        vram: &mut dyn GuestMemory,
        backend: &mut dyn HostBackend,
    ) -> Result<(), KelvinError> {
        self.surfaces
            .download_dirty_surfaces(vram, backend, &mut self.stats)
    }

    /// Drop all host resources. Surfaces are not synced back; the guest is
    /// expected to reinitialize after a flush.
    pub fn flush_all(
        &mut self,
        vram: &mut dyn GuestMemory,
        backend: &mut dyn HostBackend,
    ) -> Result<(), KelvinError> {
        self.surfaces
            .flush(&mut self.regs, vram, backend, &mut self.stats)?;
        self.textures.reset(backend);
        self.shaders.flush(backend);
        self.vertices.flush(backend);
        self.batch.reset();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DrawCall, RecordingBackend};
    use crate::guest_memory::{DmaObject, Vram};
    use pretty_assertions::assert_eq;

    const COLOR_BASE: u32 = 0x1000;
    const WIDTH: u32 = 16;
    const HEIGHT: u32 = 4;
    const PITCH: u32 = 0x40;

    struct Fixture {
        engine: GraphicsEngine,
        vram: Vram,
        backend: RecordingBackend,
    }

    impl Fixture {
        fn new() -> Self {
            let mut engine = GraphicsEngine::new(5, 16, 16, 16);
            engine.dma.insert(
                0x9,
                DmaObject {
                    address: 0,
                    limit: 0xf_ffff,
                },
            );
            let mut f = Fixture {
                engine,
                vram: Vram::new(0x10_0000),
                backend: RecordingBackend::new(),
            };
            f.m(SET_OBJECT, KELVIN_CLASS);
            f.m(SET_CONTEXT_DMA_COLOR, 0x9);
            // R5G6B5 color, no zeta, pitched.
            f.m(SET_SURFACE_FORMAT, (1 << 8) | regs::SURFACE_COLOR_R5G6B5);
            f.m(SET_SURFACE_CLIP_HORIZONTAL, WIDTH << 16);
            f.m(SET_SURFACE_CLIP_VERTICAL, HEIGHT << 16);
            f.m(SET_SURFACE_PITCH, PITCH);
            f.m(SET_SURFACE_COLOR_OFFSET, COLOR_BASE);
            f
        }

        fn m(&mut self, method: u32, parameter: u32) {
            self.dispatch(method, parameter, &[]);
        }

        fn dispatch(&mut self, method: u32, parameter: u32, lookahead: &[u32]) -> usize {
            self.engine
                .dispatch(0, method, parameter, &mut self.vram, &mut self.backend, lookahead)
                .unwrap()
        }
    }

    fn draw_arrays_param(start: u32, count: u32) -> u32 {
        ((count - 1) << 24) | start
    }

    #[test]
    fn begin_draw_arrays_end_emits_one_multidraw() {
        let mut f = Fixture::new();
        f.m(SET_BEGIN_END, 5);
        f.m(DRAW_ARRAYS, draw_arrays_param(0, 3));
        f.m(DRAW_ARRAYS, draw_arrays_param(3, 3));
        f.m(SET_BEGIN_END, regs::PRIM_END);

        assert_eq!(
            f.backend.draws,
            vec![DrawCall::MultiArrays {
                topology: Topology::Triangles,
                ranges: vec![(0, 6)],
            }]
        );
        assert_eq!(f.engine.stats.begin_ends, 1);
        assert!(f.engine.regs.surface_color.draw_dirty);
    }

    #[test]
    fn squash_consumes_end_begin_and_splits_ranges() {
        let mut f = Fixture::new();
        f.m(SET_BEGIN_END, 6);
        // Raw words for END, BEGIN(6), DRAW_ARRAYS as the stream ahead.
        let lookahead = [
            (1 << 18) | SET_BEGIN_END,
            regs::PRIM_END,
            (1 << 18) | SET_BEGIN_END,
            6,
            (1 << 18) | DRAW_ARRAYS,
        ];
        let consumed = f.dispatch(DRAW_ARRAYS, draw_arrays_param(0, 4), &lookahead);
        assert_eq!(consumed, 4);
        assert_eq!(f.engine.stats.squashed_draw_triples, 1);

        // The squashed stream continues with the second DRAW_ARRAYS.
        f.m(DRAW_ARRAYS, draw_arrays_param(4, 4));
        f.m(SET_BEGIN_END, regs::PRIM_END);

        // Contiguous but intentionally not merged.
        assert_eq!(
            f.backend.draws,
            vec![DrawCall::MultiArrays {
                topology: Topology::TriangleStrip,
                ranges: vec![(0, 4), (4, 4)],
            }]
        );
    }

    #[test]
    fn squash_respects_primitive_mode_mismatch() {
        let mut f = Fixture::new();
        f.m(SET_BEGIN_END, 6);
        let lookahead = [
            (1 << 18) | SET_BEGIN_END,
            regs::PRIM_END,
            (1 << 18) | SET_BEGIN_END,
            5, // different primitive
            (1 << 18) | DRAW_ARRAYS,
        ];
        let consumed = f.dispatch(DRAW_ARRAYS, draw_arrays_param(0, 4), &lookahead);
        assert_eq!(consumed, 0);
        assert_eq!(f.engine.stats.squashed_draw_triples, 0);
        f.m(SET_BEGIN_END, regs::PRIM_END);
    }

    #[test]
    fn squash_disabled_by_config() {
        let mut f = Fixture::new();
        f.engine.squash_repeated_draws = false;
        f.m(SET_BEGIN_END, 6);
        let lookahead = [
            (1 << 18) | SET_BEGIN_END,
            regs::PRIM_END,
            (1 << 18) | SET_BEGIN_END,
            6,
            (1 << 18) | DRAW_ARRAYS,
        ];
        let consumed = f.dispatch(DRAW_ARRAYS, draw_arrays_param(0, 4), &lookahead);
        assert_eq!(consumed, 0);
        f.m(SET_BEGIN_END, regs::PRIM_END);
    }

    #[test]
    fn elements_after_range_expand_it() {
        let mut f = Fixture::new();
        f.m(SET_BEGIN_END, 4);
        f.m(DRAW_ARRAYS, draw_arrays_param(2, 3));
        f.m(ARRAY_ELEMENT16, 0x0006_0005);
        f.m(SET_BEGIN_END, regs::PRIM_END);

        assert_eq!(f.backend.draws.len(), 1);
        match &f.backend.draws[0] {
            DrawCall::Elements { buffer, count, .. } => {
                assert_eq!(*count, 5);
                assert_eq!(f.backend.buffer_data(*buffer).unwrap(), &[2, 3, 4, 5, 6]);
            }
            other => panic!("expected elements, got {other:?}"),
        }
    }

    #[test]
    fn immediate_vertices_flush_as_inline_buffer() {
        let mut f = Fixture::new();
        f.m(SET_BEGIN_END, 5);
        for i in 0..3u32 {
            f.m(SET_VERTEX_DATA2F_M, (i as f32).to_bits());
            f.m(SET_VERTEX_DATA2F_M + 4, 1.0f32.to_bits());
        }
        f.m(SET_BEGIN_END, regs::PRIM_END);

        assert_eq!(
            f.backend.draws,
            vec![DrawCall::InlineBuffer {
                topology: Topology::Triangles,
                vertex_count: 3,
            }]
        );
    }

    #[test]
    fn masked_out_draw_is_a_nop() {
        let mut f = Fixture::new();
        f.m(SET_COLOR_MASK, 0);
        f.m(SET_BEGIN_END, 5);
        f.m(DRAW_ARRAYS, draw_arrays_param(0, 3));
        f.m(SET_BEGIN_END, regs::PRIM_END);

        assert!(f.backend.draws.is_empty());
        assert!(!f.engine.regs.surface_color.draw_dirty);
        assert_eq!(f.engine.surfaces.surface_count(), 0);
    }

    #[test]
    fn end_without_begin_is_discarded() {
        let mut f = Fixture::new();
        f.m(SET_BEGIN_END, regs::PRIM_END);
        assert!(f.backend.draws.is_empty());
        assert_eq!(f.engine.stats.begin_ends, 0);
    }

    #[test]
    fn empty_begin_end_counts_but_draws_nothing() {
        let mut f = Fixture::new();
        f.m(SET_BEGIN_END, 5);
        f.m(SET_BEGIN_END, regs::PRIM_END);
        assert!(f.backend.draws.is_empty());
        assert_eq!(f.engine.stats.empty_begin_ends, 1);
        // The begin/end still counts as a draw boundary for the surface.
        assert!(f.engine.regs.surface_color.draw_dirty);
    }

    #[test]
    fn full_clear_records_clear_and_relaxed_state() {
        let mut f = Fixture::new();
        f.m(SET_COLOR_CLEAR_VALUE, 0xf800_f800);
        f.m(SET_CLEAR_RECT_HORIZONTAL, (WIDTH - 1) << 16);
        f.m(SET_CLEAR_RECT_VERTICAL, (HEIGHT - 1) << 16);
        f.m(CLEAR_SURFACE, CLEAR_SURFACE_COLOR);

        assert_eq!(f.backend.clears.len(), 1);
        assert_eq!(f.backend.clears[0].1.color, Some(0xf800_f800));
        let binding = f.engine.surfaces.binding(SurfaceKind::Color).unwrap();
        assert!(binding.cleared);
        assert!(!f.engine.regs.clearing);
        // Full clear clobbers everything, so the create skipped seeding.
        assert_eq!(f.engine.stats.surface_uploads, 0);
    }

    #[test]
    fn partial_clear_seeds_and_stays_uncleared() {
        let mut f = Fixture::new();
        f.m(SET_CLEAR_RECT_HORIZONTAL, (WIDTH / 2 - 1) << 16);
        f.m(SET_CLEAR_RECT_VERTICAL, (HEIGHT - 1) << 16);
        f.m(CLEAR_SURFACE, CLEAR_SURFACE_COLOR);

        let binding = f.engine.surfaces.binding(SurfaceKind::Color).unwrap();
        assert!(!binding.cleared);
        assert_eq!(f.engine.stats.surface_uploads, 1);
    }

    #[test]
    fn texture_methods_decode_slot_and_mark_dirty() {
        let mut f = Fixture::new();
        let base = SET_TEXTURE_OFFSET + TEXTURE_SLOT_STRIDE * 2;
        f.m(base, 0x2000);
        f.m(base + 4, (0x11 << 8) | (3 << 20) | (3 << 24));
        f.m(base + 0x0c, 0x4000_0000);
        f.m(base + 0x10, 0x0010_0000);

        let slot = &f.engine.regs.textures[2];
        assert_eq!(slot.offset, 0x2000);
        assert_eq!(slot.color_format, 0x11);
        assert_eq!(slot.width(), 8);
        assert_eq!(slot.height(), 8);
        assert!(slot.enabled);
        assert_eq!(slot.pitch, 0x10);
        assert!(slot.dirty);
        assert!(!f.engine.regs.textures[0].dirty);
    }

    #[test]
    fn methods_for_unbound_class_are_discarded() {
        let mut f = Fixture::new();
        let before = f.engine.stats.methods_unhandled;
        f.engine
            .dispatch(3, SET_BEGIN_END, 5, &mut f.vram, &mut f.backend, &[])
            .unwrap();
        assert_eq!(f.engine.stats.methods_unhandled, before + 1);
        assert!(f.engine.regs.primitive_mode.is_none());
    }
}
