//! Emulated register file for the 3D engine.
//!
//! The hardware exposes a flat word-addressed register bank; handlers here
//! write strongly-typed named fields instead, and a raw word path is kept
//! only for the few untyped registers the dispatch boundary still touches.

use std::collections::HashMap;

use crate::backend::Topology;

bitflags::bitflags! {
    /// Per-channel color write enables from the CONTROL_0 register.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ColorMask: u32 {
        const ALPHA = 1 << 0;
        const RED   = 1 << 1;
        const GREEN = 1 << 2;
        const BLUE  = 1 << 3;
    }
}

/// Surface color format codes as written by SET_SURFACE_FORMAT.
pub const SURFACE_COLOR_X1R5G5B5: u32 = 0x01;
pub const SURFACE_COLOR_R5G6B5: u32 = 0x03;
pub const SURFACE_COLOR_X8R8G8B8: u32 = 0x04;
pub const SURFACE_COLOR_A8R8G8B8: u32 = 0x08;

pub const SURFACE_ZETA_Z16: u32 = 0x01;
pub const SURFACE_ZETA_Z24S8: u32 = 0x02;

/// Primitive codes carried by SET_BEGIN_END. Zero ends the primitive.
pub const PRIM_END: u32 = 0;
pub const PRIM_POLYGON: u32 = 10;

pub fn topology_for_primitive(code: u32) -> Option<Topology> {
    Some(match code {
        1 => Topology::Points,
        2 => Topology::Lines,
        3 => Topology::LineLoop,
        4 => Topology::LineStrip,
        5 => Topology::Triangles,
        6 => Topology::TriangleStrip,
        7 => Topology::TriangleFan,
        8 => Topology::Quads,
        9 => Topology::QuadStrip,
        PRIM_POLYGON => Topology::Polygon,
        _ => return None,
    })
}

/// Everything SET_SURFACE_FORMAT/CLIP define about the current render
/// target shape. Compared wholesale to detect retargeting.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SurfaceShape {
    pub color_format: u32,
    pub zeta_format: u32,
    pub z_format_float: bool,
    pub swizzle: bool,
    pub anti_aliasing: u32,
    pub log_width: u32,
    pub log_height: u32,
    pub clip_x: u32,
    pub clip_y: u32,
    pub clip_width: u32,
    pub clip_height: u32,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TextureSlot {
    pub enabled: bool,
    pub offset: u32,
    pub color_format: u32,
    pub log_width: u32,
    pub log_height: u32,
    pub pitch: u32,
    /// Set whenever any register affecting this slot changes; cleared when
    /// the slot is rebound. Lets an unchanged slot skip the cache entirely.
    pub dirty: bool,
}

impl TextureSlot {
    pub fn width(&self) -> u32 {
        1 << self.log_width
    }

    pub fn height(&self) -> u32 {
        1 << self.log_height
    }
}

pub const NUM_TEXTURE_SLOTS: usize = 4;
pub const NUM_SUBCHANNELS: usize = 8;

/// Per-target bookkeeping mirrored from the hardware Surface state:
/// whether the bound host buffer needs recreation and whether draws have
/// written through it since the last download.
#[derive(Clone, Copy, Debug, Default)]
pub struct SurfaceRegs {
    pub offset: u32,
    pub pitch: u32,
    pub buffer_dirty: bool,
    pub draw_dirty: bool,
    pub write_enabled_cache: bool,
}

pub struct RegisterBank {
    /// Object class bound to each subchannel by SET_OBJECT.
    pub subchannel_class: [u32; NUM_SUBCHANNELS],

    /// Current primitive code between BEGIN and END; `None` outside.
    pub primitive_mode: Option<u32>,

    pub surface_shape: SurfaceShape,
    pub last_surface_shape: SurfaceShape,
    pub surface_color: SurfaceRegs,
    pub surface_zeta: SurfaceRegs,
    pub dma_color: u32,
    pub dma_zeta: u32,

    pub color_mask: ColorMask,
    pub depth_test: bool,
    pub stencil_test: bool,
    pub depth_write: bool,

    /// True while a CLEAR_SURFACE is being processed; relaxes surface
    /// compatibility and write-enable checks the way hardware clears do.
    pub clearing: bool,
    pub color_clear_value: u32,
    pub zstencil_clear_value: u32,

    pub textures: [TextureSlot; NUM_TEXTURE_SLOTS],

    /// Raw word-addressed spillover for registers without a typed field.
    /// Only the dispatch boundary reads or writes this.
    raw: HashMap<u32, u32>,
}

impl Default for RegisterBank {
    fn default() -> Self {
        RegisterBank {
            subchannel_class: [0; NUM_SUBCHANNELS],
            primitive_mode: None,
            surface_shape: SurfaceShape::default(),
            last_surface_shape: SurfaceShape::default(),
            surface_color: SurfaceRegs::default(),
            surface_zeta: SurfaceRegs::default(),
            dma_color: 0,
            dma_zeta: 0,
            color_mask: ColorMask::all(),
            depth_test: false,
            stencil_test: false,
            depth_write: true,
            clearing: false,
            color_clear_value: 0,
            zstencil_clear_value: 0,
            textures: [TextureSlot::default(); NUM_TEXTURE_SLOTS],
            raw: HashMap::new(),
        }
    }
}

impl RegisterBank {
    pub fn color_write_enabled(&self) -> bool {
        !self.color_mask.is_empty()
    }

    pub fn zeta_write_enabled(&self) -> bool {
        (self.depth_test && self.depth_write) || self.stencil_test
    }

    /// Has the target shape changed since the last surface update?
    pub fn framebuffer_dirty(&self) -> bool {
        self.surface_shape != self.last_surface_shape
    }

    pub fn read_raw(&self, addr: u32) -> u32 {
        self.raw.get(&addr).copied().unwrap_or(0)
    }

    pub fn write_raw(&mut self, addr: u32, value: u32) {
        self.raw.insert(addr, value);
    }
}
