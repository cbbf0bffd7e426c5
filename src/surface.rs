//! Render-target coherence tracking.
//!
//! Live render targets are materialized as host images bound to guest
//! address ranges. Each binding carries two independent dirty directions:
//! `draw_dirty` (host rendered into, guest copy stale) and `upload_pending`
//! (guest wrote the range, host copy stale). Guest accesses to a live range
//! are observed through VRAM access hooks; a read of a draw-dirty surface
//! forces a download before the access is allowed to complete, so renders
//! are never lost to a read-modify-write from the CPU side.
//!
//! A surface with no draw touching it for [`SURFACE_AGE_LIMIT`] frames is
//! downloaded (if dirty) and destroyed.

use crate::backend::{HostBackend, HostFormat, ImageDesc, ImageHandle};
use crate::error::KelvinError;
use crate::guest_memory::{AccessHookId, DirtyDomain, DmaTable, GuestMemory};
use crate::regs::{self, RegisterBank, SurfaceShape};
use crate::stats::ProcessorStats;

pub const SURFACE_AGE_LIMIT: u64 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceKind {
    Color,
    Zeta,
}

/// Host format for a surface color format code.
pub fn surface_color_format(code: u32) -> Option<HostFormat> {
    Some(match code {
        regs::SURFACE_COLOR_X1R5G5B5 => HostFormat::A1Rgb5,
        regs::SURFACE_COLOR_R5G6B5 => HostFormat::Rgb565,
        regs::SURFACE_COLOR_X8R8G8B8 | regs::SURFACE_COLOR_A8R8G8B8 => HostFormat::Rgba8,
        _ => return None,
    })
}

pub fn surface_zeta_format(code: u32) -> Option<HostFormat> {
    Some(match code {
        regs::SURFACE_ZETA_Z16 => HostFormat::Depth16,
        regs::SURFACE_ZETA_Z24S8 => HostFormat::Depth24Stencil8,
        _ => return None,
    })
}

/// Pixel dimensions implied by the current target shape. Swizzled targets
/// are sized by their log2 extents; pitched targets by the clip rect.
pub fn shape_dimensions(shape: &SurfaceShape) -> (u32, u32) {
    if shape.swizzle {
        (1 << shape.log_width, 1 << shape.log_height)
    } else {
        // Clip-rect derived; include the origin so offset targets fit.
        (
            shape.clip_width + shape.clip_x,
            shape.clip_height + shape.clip_y,
        )
    }
}

/// One materialized render target.
#[derive(Clone, Debug)]
pub struct SurfaceBinding {
    pub vram_addr: u64,
    pub size: u64,
    pub pitch: u32,
    pub width: u32,
    pub height: u32,
    pub kind: SurfaceKind,
    pub host_format: HostFormat,
    pub format_code: u32,
    pub swizzle: bool,
    pub shape: SurfaceShape,

    /// Host image has been rendered into since the guest copy was last
    /// refreshed.
    pub draw_dirty: bool,
    /// Guest memory has been written since the host image was last seeded.
    pub upload_pending: bool,
    /// A guest access observed the surface while draw-dirty; the processor
    /// must download at its next opportunity.
    pub download_pending: bool,
    /// The whole surface was last written by a full clear. Relaxes the
    /// swizzle-migration compatibility check and lets invalidation skip a
    /// redundant download.
    pub cleared: bool,

    pub frame_time: u64,
    pub draw_time: u64,

    pub image: ImageHandle,
    hook: AccessHookId,
}

impl SurfaceBinding {
    fn overlaps_range(&self, start: u64, len: u64) -> bool {
        start < self.vram_addr + self.size && self.vram_addr < start + len
    }

    /// Can a texture fetch with this shape be served by blitting the
    /// surface instead of a guest-memory round trip?
    pub fn can_texture_from(
        &self,
        format: HostFormat,
        width: u32,
        height: u32,
        pitch: u32,
        swizzle: bool,
    ) -> bool {
        self.kind == SurfaceKind::Color
            && (self.swizzle || self.pitch == pitch)
            && self.width == width
            && self.height == height
            && self.swizzle == swizzle
            && self.host_format == format
    }

    fn image_desc(&self) -> ImageDesc {
        ImageDesc {
            width: self.width,
            height: self.height,
            format: self.host_format,
        }
    }
}

// Same attachment kind, same host format, same pitch; strict additionally
// pins the dimensions, non-strict accepts a larger existing surface.
fn check_compatibility(existing: &SurfaceBinding, wanted: &SurfaceBinding, strict: bool) -> bool {
    let format_compatible = existing.kind == wanted.kind
        && existing.host_format == wanted.host_format
        && existing.pitch == wanted.pitch;
    if !format_compatible {
        return false;
    }
    if strict {
        existing.width == wanted.width && existing.height == wanted.height
    } else {
        existing.width >= wanted.width && existing.height >= wanted.height
    }
}

pub struct SurfaceTracker {
    surfaces: Vec<SurfaceBinding>,
    color_bound: Option<u64>,
    zeta_bound: Option<u64>,

    /// Bumped once per displayed frame by the processor.
    pub frame_time: u64,
    /// Bumped once per surface update pass; orders draws against texture
    /// fetches for the surface-as-texture path.
    pub draw_time: u64,

    age_limit: u64,
}

impl SurfaceTracker {
    pub fn new(age_limit: u64) -> Self {
        SurfaceTracker {
            surfaces: Vec::new(),
            color_bound: None,
            zeta_bound: None,
            frame_time: 0,
            draw_time: 0,
            age_limit,
        }
    }

    fn index_of(&self, addr: u64) -> Option<usize> {
        self.surfaces.iter().position(|s| s.vram_addr == addr)
    }

    pub fn get(&self, addr: u64) -> Option<&SurfaceBinding> {
        self.surfaces.iter().find(|s| s.vram_addr == addr)
    }

    /// Surface whose range contains `addr`, if any.
    pub fn get_within(&self, addr: u64) -> Option<&SurfaceBinding> {
        self.surfaces
            .iter()
            .find(|s| addr >= s.vram_addr && addr < s.vram_addr + s.size)
    }

    pub fn surface_count(&self) -> usize {
        self.surfaces.len()
    }

    fn bound_addr(&self, kind: SurfaceKind) -> Option<u64> {
        match kind {
            SurfaceKind::Color => self.color_bound,
            SurfaceKind::Zeta => self.zeta_bound,
        }
    }

    pub fn binding(&self, kind: SurfaceKind) -> Option<&SurfaceBinding> {
        let addr = self.bound_addr(kind)?;
        self.get(addr)
    }

    fn binding_mut(&mut self, kind: SurfaceKind) -> Option<&mut SurfaceBinding> {
        let addr = self.bound_addr(kind)?;
        let idx = self.index_of(addr)?;
        Some(&mut self.surfaces[idx])
    }

    fn bind(&mut self, kind: SurfaceKind, addr: u64) {
        match kind {
            SurfaceKind::Color => self.color_bound = Some(addr),
            SurfaceKind::Zeta => self.zeta_bound = Some(addr),
        }
    }

    pub fn unbind(&mut self, kind: SurfaceKind) {
        match kind {
            SurfaceKind::Color => self.color_bound = None,
            SurfaceKind::Zeta => self.zeta_bound = None,
        }
    }

    /// Build the binding a draw targeting `kind` under the current register
    /// state would need. Returns `None` (with a log) for a surface format
    /// the host table does not cover; the draw is then discarded upstream.
    fn populate_entry(
        &self,
        regs: &RegisterBank,
        dma: &DmaTable,
        kind: SurfaceKind,
        sized: Option<(u32, u32)>,
    ) -> Option<SurfaceBinding> {
        let shape = &regs.surface_shape;

        let (sregs, dma_handle, host_format, format_code) = match kind {
            SurfaceKind::Color => {
                let fmt = match surface_color_format(shape.color_format) {
                    Some(f) => f,
                    None => {
                        tracing::warn!(format = shape.color_format, "unsupported color surface format");
                        return None;
                    }
                };
                (&regs.surface_color, regs.dma_color, fmt, shape.color_format)
            }
            SurfaceKind::Zeta => {
                let fmt = match surface_zeta_format(shape.zeta_format) {
                    Some(f) => f,
                    None => {
                        tracing::warn!(format = shape.zeta_format, "unsupported zeta surface format");
                        return None;
                    }
                };
                (&regs.surface_zeta, regs.dma_zeta, fmt, shape.zeta_format)
            }
        };

        let (width, height) = match sized {
            Some(dims) => dims,
            None => {
                // Zeta follows the color binding's dimensions when one exists.
                if kind == SurfaceKind::Zeta {
                    if let Some(cb) = self.binding(SurfaceKind::Color) {
                        (cb.width, cb.height)
                    } else {
                        shape_dimensions(shape)
                    }
                } else {
                    shape_dimensions(shape)
                }
            }
        };

        let dma_obj = dma.resolve(dma_handle);
        let bpp = host_format.bytes_per_pixel();
        let pitch = sregs.pitch;
        assert!(
            pitch % bpp == 0,
            "surface pitch {pitch} not a multiple of pixel size {bpp}"
        );
        let size = u64::from(height) * u64::from(pitch.max(width * bpp));
        let vram_addr = dma_obj.address + u64::from(sregs.offset);
        assert!(
            u64::from(sregs.offset) + size <= dma_obj.limit + 1,
            "surface exceeds dma window: offset={:#x} size={:#x} limit={:#x}",
            sregs.offset,
            size,
            dma_obj.limit
        );

        Some(SurfaceBinding {
            vram_addr,
            size,
            pitch,
            width,
            height,
            kind,
            host_format,
            format_code,
            swizzle: shape.swizzle,
            shape: *shape,
            draw_dirty: false,
            upload_pending: true,
            download_pending: false,
            cleared: false,
            frame_time: self.frame_time,
            draw_time: self.draw_time,
            image: ImageHandle(0),
            hook: AccessHookId::INVALID,
        })
    }

    /// Synchronize one attachment with the register state: retarget/create
    /// on the upload direction, download on the read direction.
    #[allow(clippy::too_many_arguments)]
    fn update_surface_part(
        &mut self,
        regs: &mut RegisterBank,
        vram: &mut dyn GuestMemory,
        dma: &DmaTable,
        backend: &mut dyn HostBackend,
        stats: &mut ProcessorStats,
        upload: bool,
        kind: SurfaceKind,
    ) -> Result<(), KelvinError> {
        let entry = match self.populate_entry(regs, dma, kind, None) {
            Some(e) => e,
            None => return Ok(()),
        };

        let mem_dirty = vram.test_and_clear_dirty(entry.vram_addr, entry.size, DirtyDomain::Generic);
        let buffer_dirty = match kind {
            SurfaceKind::Color => regs.surface_color.buffer_dirty,
            SurfaceKind::Zeta => regs.surface_zeta.buffer_dirty,
        };

        if upload && (buffer_dirty || mem_dirty) {
            self.unbind(kind);

            // A color and zeta target at the same offset is not supported;
            // drop the other binding rather than aliasing one image.
            let other = match kind {
                SurfaceKind::Color => SurfaceKind::Zeta,
                SurfaceKind::Zeta => SurfaceKind::Color,
            };
            if self.bound_addr(other) == Some(entry.vram_addr) {
                tracing::warn!(addr = entry.vram_addr, "same color & zeta surface offset");
                self.unbind(other);
            }

            let mut create = true;
            if let Some(found_idx) = self.index_of(entry.vram_addr) {
                let found = &self.surfaces[found_idx];
                let mut compatible = check_compatibility(found, &entry, false);

                if found.swizzle != entry.swizzle {
                    // Swizzle migration is only safe when the content is
                    // about to be (or already was) fully clobbered by a
                    // clear, and only with a strict size match.
                    compatible &= (regs.clearing || found.cleared)
                        && check_compatibility(found, &entry, true);
                    if compatible {
                        tracing::debug!(
                            addr = entry.vram_addr,
                            to_swizzled = entry.swizzle,
                            "surface layout migration"
                        );
                    }
                }

                // Reusing a larger color target must not run it into the
                // zeta window.
                if compatible && kind == SurfaceKind::Color
                    && !check_compatibility(found, &entry, true)
                    && regs.surface_shape.zeta_format != 0
                {
                    if let Some(zeta_entry) = self.populate_entry(
                        regs,
                        dma,
                        SurfaceKind::Zeta,
                        Some((found.width, found.height)),
                    ) {
                        let color_end = found.vram_addr + found.size;
                        let zeta_end = zeta_entry.vram_addr + zeta_entry.size;
                        compatible &=
                            found.vram_addr >= zeta_end || zeta_entry.vram_addr >= color_end;
                    }
                }

                // Zeta must match the bound color dimensions exactly.
                if compatible && kind == SurfaceKind::Zeta {
                    if let Some(cb) = self.binding(SurfaceKind::Color) {
                        compatible &= found.width == cb.width && found.height == cb.height;
                    }
                }

                if compatible {
                    self.surfaces[found_idx].upload_pending |= mem_dirty;
                    if kind == SurfaceKind::Color {
                        // Zeta must be revalidated against the reused dims.
                        regs.surface_zeta.buffer_dirty = true;
                    }
                    stats.surface_hits += 1;
                    tracing::trace!(addr = entry.vram_addr, ?kind, "surface hit");
                    self.bind(kind, entry.vram_addr);
                    create = false;
                } else {
                    let found_addr = self.surfaces[found_idx].vram_addr;
                    tracing::debug!(addr = found_addr, "incompatible surface retarget");
                    // A fully cleared surface of the same format has nothing
                    // worth preserving; skip the redundant sync.
                    let skip_sync = {
                        let found = &self.surfaces[found_idx];
                        found.cleared
                            && found.kind == entry.kind
                            && found.host_format == entry.host_format
                    };
                    if !skip_sync {
                        self.download_if_dirty(found_addr, vram, backend, stats)?;
                    }
                    self.invalidate(found_addr, vram, backend, stats)?;
                }
            }

            if create {
                let mut entry = entry.clone();
                self.invalidate_overlapping(&entry, vram, backend, stats)?;
                entry.image = backend.create_image(entry.image_desc())?;
                entry.hook = vram.install_hook(entry.vram_addr, entry.size);
                stats.surface_creates += 1;
                tracing::debug!(
                    addr = entry.vram_addr,
                    ?kind,
                    width = entry.width,
                    height = entry.height,
                    pitch = entry.pitch,
                    "surface create"
                );
                if kind == SurfaceKind::Color {
                    if let Some(zb) = self.binding(SurfaceKind::Zeta) {
                        if zb.width != entry.width || zb.height != entry.height {
                            regs.surface_zeta.buffer_dirty = true;
                        }
                    }
                }
                self.bind(kind, entry.vram_addr);
                self.surfaces.push(entry);
            }

            match kind {
                SurfaceKind::Color => regs.surface_color.buffer_dirty = false,
                SurfaceKind::Zeta => regs.surface_zeta.buffer_dirty = false,
            }
        }

        let draw_dirty = match kind {
            SurfaceKind::Color => regs.surface_color.draw_dirty,
            SurfaceKind::Zeta => regs.surface_zeta.draw_dirty,
        };
        if !upload && draw_dirty {
            if let Some(addr) = self.bound_addr(kind) {
                self.download(addr, vram, backend, stats, true)?;
            }
            let sregs = match kind {
                SurfaceKind::Color => &mut regs.surface_color,
                SurfaceKind::Zeta => &mut regs.surface_zeta,
            };
            sregs.write_enabled_cache = false;
            sregs.draw_dirty = false;
        }

        Ok(())
    }

    /// Bring both attachments in line with the register state. `upload`
    /// selects the direction: toward the host before a draw/clear, toward
    /// guest memory for a readback. `seed_from_guest` is false only for a
    /// full-surface clear, where seeding a buffer that is about to be
    /// clobbered would be wasted work.
    #[allow(clippy::too_many_arguments)]
    pub fn update(
        &mut self,
        regs: &mut RegisterBank,
        vram: &mut dyn GuestMemory,
        dma: &DmaTable,
        backend: &mut dyn HostBackend,
        stats: &mut ProcessorStats,
        upload: bool,
        color_write: bool,
        zeta_write: bool,
        seed_from_guest: bool,
    ) -> Result<(), KelvinError> {
        let color_write = color_write && (regs.clearing || regs.color_write_enabled());
        let zeta_write = zeta_write && (regs.clearing || regs.zeta_write_enabled());

        if upload {
            if regs.framebuffer_dirty() {
                regs.last_surface_shape = regs.surface_shape;
                regs.surface_color.buffer_dirty = true;
                regs.surface_zeta.buffer_dirty = true;
            }

            if regs.surface_color.buffer_dirty {
                self.unbind(SurfaceKind::Color);
            }
            if color_write {
                self.update_surface_part(regs, vram, dma, backend, stats, true, SurfaceKind::Color)?;
            }
            if regs.surface_zeta.buffer_dirty {
                self.unbind(SurfaceKind::Zeta);
            }
            if zeta_write {
                self.update_surface_part(regs, vram, dma, backend, stats, true, SurfaceKind::Zeta)?;
            }
        } else {
            if (color_write || regs.surface_color.write_enabled_cache)
                && regs.surface_color.draw_dirty
            {
                self.update_surface_part(regs, vram, dma, backend, stats, false, SurfaceKind::Color)?;
            }
            if (zeta_write || regs.surface_zeta.write_enabled_cache)
                && regs.surface_zeta.draw_dirty
            {
                self.update_surface_part(regs, vram, dma, backend, stats, false, SurfaceKind::Zeta)?;
            }
        }

        if upload {
            self.draw_time += 1;
        }

        let frame_time = self.frame_time;
        let draw_time = self.draw_time;
        let swizzle = regs.surface_shape.swizzle;
        for kind in [SurfaceKind::Color, SurfaceKind::Zeta] {
            if let Some(addr) = self.bound_addr(kind) {
                if upload {
                    if seed_from_guest {
                        self.upload_data(addr, vram, backend, stats, false)?;
                    } else if let Some(b) = self.binding_mut(kind) {
                        b.upload_pending = false;
                    }
                }
                if let Some(b) = self.binding_mut(kind) {
                    b.frame_time = frame_time;
                    if upload {
                        b.draw_time = draw_time;
                        b.swizzle = swizzle;
                    }
                }
            }
        }

        if let (Some(cb), Some(zb)) = (
            self.binding(SurfaceKind::Color),
            self.binding(SurfaceKind::Zeta),
        ) {
            assert!(
                cb.width == zb.width && cb.height == zb.height,
                "color/zeta dimension mismatch: {}x{} vs {}x{}",
                cb.width,
                cb.height,
                zb.width,
                zb.height
            );
        }

        self.evict_old(vram, backend, stats)?;
        Ok(())
    }

    /// Advance the draw clock and stamp the attachments the finished draw
    /// was allowed to write. The stamps order surface content against
    /// texture fetches of the same memory.
    pub fn stamp_draw(&mut self, regs: &RegisterBank) {
        self.draw_time += 1;
        let draw_time = self.draw_time;
        if regs.color_write_enabled() {
            if let Some(b) = self.binding_mut(SurfaceKind::Color) {
                b.draw_time = draw_time;
            }
        }
        if regs.zeta_write_enabled() {
            if let Some(b) = self.binding_mut(SurfaceKind::Zeta) {
                b.draw_time = draw_time;
            }
        }
    }

    /// Record that the current draw/clear wrote through the enabled masks.
    pub fn mark_draw_dirty(&mut self, regs: &mut RegisterBank, color: bool, zeta: bool) {
        let color = color && regs.color_write_enabled();
        let zeta = zeta && regs.zeta_write_enabled();
        regs.surface_color.draw_dirty |= color;
        regs.surface_color.write_enabled_cache |= color;
        regs.surface_zeta.draw_dirty |= zeta;
        regs.surface_zeta.write_enabled_cache |= zeta;

        let frame_time = self.frame_time;
        if let Some(b) = self.binding_mut(SurfaceKind::Color) {
            b.draw_dirty |= color;
            b.frame_time = frame_time;
            b.cleared = false;
        }
        if let Some(b) = self.binding_mut(SurfaceKind::Zeta) {
            b.draw_dirty |= zeta;
            b.frame_time = frame_time;
            b.cleared = false;
        }
    }

    /// Record the coverage of a clear that just executed. A full-surface
    /// clear leaves the binding in the relaxed `cleared` state.
    pub fn notify_cleared(&mut self, full_clear: bool, write_color: bool, write_zeta: bool) {
        if let Some(b) = self.binding_mut(SurfaceKind::Color) {
            b.cleared = full_clear && write_color;
        }
        if let Some(b) = self.binding_mut(SurfaceKind::Zeta) {
            b.cleared = full_clear && write_zeta;
        }
    }

    /// Guest access intercept. Marks the coherence flags on every surface
    /// overlapping the access and reports whether the caller must wait for
    /// the processor to finish pending downloads before touching memory
    /// (read-before-write ordering).
    pub fn on_guest_access(&mut self, addr: u64, len: u64, write: bool) -> bool {
        let mut wait_for_downloads = false;
        for surface in &mut self.surfaces {
            if !surface.overlaps_range(addr, len) {
                continue;
            }
            tracing::trace!(
                surface = surface.vram_addr,
                offset = addr - surface.vram_addr,
                write,
                "cpu access on live surface"
            );
            if surface.draw_dirty {
                surface.download_pending = true;
                wait_for_downloads = true;
            }
            if write {
                surface.upload_pending = true;
            }
        }
        wait_for_downloads
    }

    /// Copy host image content back into guest memory.
    fn download(
        &mut self,
        addr: u64,
        vram: &mut dyn GuestMemory,
        backend: &mut dyn HostBackend,
        stats: &mut ProcessorStats,
        force: bool,
    ) -> Result<(), KelvinError> {
        let idx = match self.index_of(addr) {
            Some(i) => i,
            None => return Ok(()),
        };
        let surface = &mut self.surfaces[idx];
        if !(surface.download_pending || force) || surface.width == 0 || surface.height == 0 {
            return Ok(());
        }

        tracing::debug!(
            addr = surface.vram_addr,
            kind = ?surface.kind,
            width = surface.width,
            height = surface.height,
            "surface download"
        );

        let desc = surface.image_desc();
        let mut pixels = vec![0u8; desc.byte_len()];
        backend.readback_image(surface.image, &mut pixels)?;

        let row_len = (surface.width * surface.host_format.bytes_per_pixel()) as usize;
        for y in 0..surface.height as u64 {
            let row_addr = surface.vram_addr + y * u64::from(surface.pitch);
            let src = &pixels[y as usize * row_len..][..row_len];
            vram.slice_mut(row_addr, row_len)?.copy_from_slice(src);
        }
        // Textures sourced from this range must redecode, but this is not a
        // guest write and must not re-trigger upload_pending.
        vram.set_dirty_domain(
            surface.vram_addr,
            u64::from(surface.pitch) * u64::from(surface.height),
            DirtyDomain::Texture,
        );

        surface.download_pending = false;
        surface.draw_dirty = false;
        stats.surface_downloads += 1;
        Ok(())
    }

    pub fn download_if_dirty(
        &mut self,
        addr: u64,
        vram: &mut dyn GuestMemory,
        backend: &mut dyn HostBackend,
        stats: &mut ProcessorStats,
    ) -> Result<(), KelvinError> {
        if self.get(addr).is_some_and(|s| s.draw_dirty) {
            self.download(addr, vram, backend, stats, true)?;
        }
        Ok(())
    }

    /// Service all downloads requested by guest-access intercepts.
    pub fn process_pending_downloads(
        &mut self,
        vram: &mut dyn GuestMemory,
        backend: &mut dyn HostBackend,
        stats: &mut ProcessorStats,
    ) -> Result<(), KelvinError> {
        let addrs: Vec<u64> = self.surfaces.iter().map(|s| s.vram_addr).collect();
        for addr in addrs {
            self.download(addr, vram, backend, stats, false)?;
        }
        Ok(())
    }

    /// Force every draw-dirty surface back into guest memory.
    pub fn download_dirty_surfaces(
        &mut self,
        vram: &mut dyn GuestMemory,
        backend: &mut dyn HostBackend,
        stats: &mut ProcessorStats,
    ) -> Result<(), KelvinError> {
        let addrs: Vec<u64> = self.surfaces.iter().map(|s| s.vram_addr).collect();
        for addr in addrs {
            self.download_if_dirty(addr, vram, backend, stats)?;
        }
        Ok(())
    }

    /// Seed the host image from guest memory.
    fn upload_data(
        &mut self,
        addr: u64,
        vram: &mut dyn GuestMemory,
        backend: &mut dyn HostBackend,
        stats: &mut ProcessorStats,
        force: bool,
    ) -> Result<(), KelvinError> {
        let idx = match self.index_of(addr) {
            Some(i) => i,
            None => return Ok(()),
        };
        let draw_time = self.draw_time;
        let surface = &mut self.surfaces[idx];
        if !(surface.upload_pending || force) {
            return Ok(());
        }
        surface.upload_pending = false;
        surface.draw_time = draw_time;
        if surface.width == 0 || surface.height == 0 {
            return Ok(());
        }

        tracing::debug!(
            addr = surface.vram_addr,
            kind = ?surface.kind,
            width = surface.width,
            height = surface.height,
            "surface upload"
        );

        let row_len = (surface.width * surface.host_format.bytes_per_pixel()) as usize;
        let mut pixels = vec![0u8; surface.height as usize * row_len];
        for y in 0..surface.height as u64 {
            let row_addr = surface.vram_addr + y * u64::from(surface.pitch);
            let dst = &mut pixels[y as usize * row_len..][..row_len];
            dst.copy_from_slice(vram.slice(row_addr, row_len)?);
        }
        backend.upload_image(surface.image, &pixels)?;
        stats.surface_uploads += 1;
        Ok(())
    }

    /// Seed the host image for `addr` if a guest write is pending. Used by
    /// the surface-as-texture path before blitting from the surface.
    pub fn upload_if_pending(
        &mut self,
        addr: u64,
        vram: &mut dyn GuestMemory,
        backend: &mut dyn HostBackend,
        stats: &mut ProcessorStats,
    ) -> Result<(), KelvinError> {
        self.upload_data(addr, vram, backend, stats, false)
    }

    /// Write back every draw-dirty surface overlapping `[start, start+len)`
    /// so a guest-memory consumer (texture decode) sees current content.
    pub fn download_dirty_in_range(
        &mut self,
        start: u64,
        len: u64,
        vram: &mut dyn GuestMemory,
        backend: &mut dyn HostBackend,
        stats: &mut ProcessorStats,
    ) -> Result<(), KelvinError> {
        let addrs: Vec<u64> = self
            .surfaces
            .iter()
            .filter(|s| s.overlaps_range(start, len))
            .map(|s| s.vram_addr)
            .collect();
        for addr in addrs {
            self.download_if_dirty(addr, vram, backend, stats)?;
        }
        Ok(())
    }

    /// Destroy one surface and its access hook. Dirty content is dropped;
    /// callers wanting it preserved go through [`Self::download_if_dirty`]
    /// first.
    pub fn invalidate(
        &mut self,
        addr: u64,
        vram: &mut dyn GuestMemory,
        backend: &mut dyn HostBackend,
        stats: &mut ProcessorStats,
    ) -> Result<(), KelvinError> {
        let idx = match self.index_of(addr) {
            Some(i) => i,
            None => return Ok(()),
        };
        if self.color_bound == Some(addr) {
            self.unbind(SurfaceKind::Color);
        }
        if self.zeta_bound == Some(addr) {
            self.unbind(SurfaceKind::Zeta);
        }
        let surface = self.surfaces.swap_remove(idx);
        tracing::debug!(addr = surface.vram_addr, "surface invalidated");
        vram.remove_hook(surface.hook);
        backend.destroy_image(surface.image)?;
        stats.surface_invalidations += 1;
        Ok(())
    }

    fn invalidate_overlapping(
        &mut self,
        entry: &SurfaceBinding,
        vram: &mut dyn GuestMemory,
        backend: &mut dyn HostBackend,
        stats: &mut ProcessorStats,
    ) -> Result<(), KelvinError> {
        let overlapping: Vec<u64> = self
            .surfaces
            .iter()
            .filter(|s| s.overlaps_range(entry.vram_addr, entry.size))
            .map(|s| s.vram_addr)
            .collect();
        for addr in overlapping {
            tracing::debug!(addr, "evicting overlapping surface");
            self.download_if_dirty(addr, vram, backend, stats)?;
            self.invalidate(addr, vram, backend, stats)?;
        }
        Ok(())
    }

    fn evict_old(
        &mut self,
        vram: &mut dyn GuestMemory,
        backend: &mut dyn HostBackend,
        stats: &mut ProcessorStats,
    ) -> Result<(), KelvinError> {
        let stale: Vec<u64> = self
            .surfaces
            .iter()
            .filter(|s| self.frame_time - s.frame_time >= self.age_limit)
            .map(|s| s.vram_addr)
            .collect();
        for addr in stale {
            tracing::debug!(addr, "evicting stale surface");
            self.download_if_dirty(addr, vram, backend, stats)?;
            self.invalidate(addr, vram, backend, stats)?;
            stats.surface_evictions_stale += 1;
        }
        Ok(())
    }

    /// Drop every surface without syncing back to guest memory. Used on
    /// full flush/reset, where the guest is expected to reinitialize.
    pub fn flush(
        &mut self,
        regs: &mut RegisterBank,
        vram: &mut dyn GuestMemory,
        backend: &mut dyn HostBackend,
        stats: &mut ProcessorStats,
    ) -> Result<(), KelvinError> {
        regs.surface_color.draw_dirty = false;
        regs.surface_zeta.draw_dirty = false;
        regs.last_surface_shape = SurfaceShape::default();
        self.unbind(SurfaceKind::Color);
        self.unbind(SurfaceKind::Zeta);
        let addrs: Vec<u64> = self.surfaces.iter().map(|s| s.vram_addr).collect();
        for addr in addrs {
            self.invalidate(addr, vram, backend, stats)?;
        }
        Ok(())
    }

    /// Serve a texture fetch by blitting a live surface into the texture's
    /// host image, skipping the guest-memory round trip.
    pub fn render_to_texture(
        &mut self,
        addr: u64,
        dst: ImageHandle,
        backend: &mut dyn HostBackend,
        stats: &mut ProcessorStats,
    ) -> Result<(), KelvinError> {
        let surface = match self.index_of(addr) {
            Some(i) => &self.surfaces[i],
            None => return Ok(()),
        };
        backend.blit_image(surface.image, dst)?;
        stats.surface_to_texture_blits += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;
    use crate::guest_memory::{DmaObject, Vram};
    use crate::regs::ColorMask;
    use pretty_assertions::assert_eq;

    struct Fixture {
        tracker: SurfaceTracker,
        regs: RegisterBank,
        vram: Vram,
        dma: DmaTable,
        backend: RecordingBackend,
        stats: ProcessorStats,
    }

    const DMA_COLOR_HANDLE: u32 = 0x9;
    const DMA_ZETA_HANDLE: u32 = 0xa;

    // 16x4 RGB565 color target at 0x1000, pitch 0x40 (2x the row), so the
    // surface covers [0x1000, 0x1100).
    fn fixture() -> Fixture {
        let mut regs = RegisterBank::default();
        regs.surface_shape.color_format = regs::SURFACE_COLOR_R5G6B5;
        regs.surface_shape.clip_width = 16;
        regs.surface_shape.clip_height = 4;
        regs.surface_color.offset = 0x1000;
        regs.surface_color.pitch = 0x40;
        regs.surface_color.buffer_dirty = true;
        regs.dma_color = DMA_COLOR_HANDLE;
        regs.dma_zeta = DMA_ZETA_HANDLE;

        let mut dma = DmaTable::default();
        dma.insert(
            DMA_COLOR_HANDLE,
            DmaObject {
                address: 0,
                limit: 0xf_ffff,
            },
        );
        dma.insert(
            DMA_ZETA_HANDLE,
            DmaObject {
                address: 0,
                limit: 0xf_ffff,
            },
        );

        Fixture {
            tracker: SurfaceTracker::new(SURFACE_AGE_LIMIT),
            regs,
            vram: Vram::new(0x10_0000),
            dma,
            backend: RecordingBackend::new(),
            stats: ProcessorStats::default(),
        }
    }

    impl Fixture {
        fn update(&mut self, upload: bool, color: bool, zeta: bool) {
            self.tracker
                .update(
                    &mut self.regs,
                    &mut self.vram,
                    &self.dma,
                    &mut self.backend,
                    &mut self.stats,
                    upload,
                    color,
                    zeta,
                    true,
                )
                .unwrap();
        }
    }

    #[test]
    fn first_draw_creates_and_seeds_from_guest() {
        let mut f = fixture();
        // Distinctive first row in guest memory.
        f.vram.write(0x1000, &[0xab; 32]).unwrap();
        f.update(true, true, false);

        assert_eq!(f.stats.surface_creates, 1);
        assert_eq!(f.stats.surface_uploads, 1);
        let binding = f.tracker.binding(SurfaceKind::Color).unwrap();
        assert_eq!(binding.vram_addr, 0x1000);
        assert_eq!(binding.size, 4 * 0x40);
        let data = f.backend.image_data(binding.image).unwrap();
        assert_eq!(&data[..32], &[0xab; 32]);
    }

    #[test]
    fn second_update_hits_without_reupload() {
        let mut f = fixture();
        f.update(true, true, false);
        assert_eq!(f.stats.surface_creates, 1);

        f.regs.surface_color.buffer_dirty = true;
        f.update(true, true, false);
        assert_eq!(f.stats.surface_creates, 1);
        assert_eq!(f.stats.surface_hits, 1);
        assert_eq!(f.stats.surface_uploads, 1);
    }

    #[test]
    fn draw_dirty_download_round_trips_host_content() {
        let mut f = fixture();
        f.update(true, true, false);
        f.tracker.mark_draw_dirty(&mut f.regs, true, false);

        // Render into the host image behind the guest's back.
        let image = f.tracker.binding(SurfaceKind::Color).unwrap().image;
        use crate::backend::HostBackend;
        f.backend.upload_image(image, &[0x5a; 128]).unwrap();

        f.update(false, true, false);
        assert_eq!(f.stats.surface_downloads, 1);
        assert!(!f.tracker.binding(SurfaceKind::Color).unwrap().draw_dirty);
        // Rows land at pitch stride in guest memory.
        assert_eq!(f.vram.slice(0x1000, 32).unwrap(), &[0x5a; 32]);
        assert_eq!(f.vram.slice(0x1040, 32).unwrap(), &[0x5a; 32]);
    }

    #[test]
    fn guest_read_of_dirty_surface_forces_download_first() {
        let mut f = fixture();
        f.update(true, true, false);
        f.tracker.mark_draw_dirty(&mut f.regs, true, false);

        // Guest write lands at 0x1080, inside the surface.
        assert!(!f.vram.hooks_hit(0x1080, 4).is_empty());
        let must_wait = f.tracker.on_guest_access(0x1080, 4, true);
        assert!(must_wait);

        let binding = f.tracker.binding(SurfaceKind::Color).unwrap();
        assert!(binding.download_pending);
        assert!(binding.upload_pending);

        // Processor services the download before the guest write proceeds,
        // so host renders are not lost under the incoming bytes.
        f.tracker
            .process_pending_downloads(&mut f.vram, &mut f.backend, &mut f.stats)
            .unwrap();
        assert_eq!(f.stats.surface_downloads, 1);
        let binding = f.tracker.binding(SurfaceKind::Color).unwrap();
        assert!(!binding.download_pending);
        assert!(!binding.draw_dirty);
        assert!(binding.upload_pending);
    }

    #[test]
    fn clean_surface_access_needs_no_wait() {
        let mut f = fixture();
        f.update(true, true, false);
        assert!(!f.tracker.on_guest_access(0x1080, 4, false));
        assert!(!f.tracker.binding(SurfaceKind::Color).unwrap().download_pending);
    }

    #[test]
    fn overlapping_create_invalidates_and_preserves_content() {
        let mut f = fixture();
        f.update(true, true, false);
        f.tracker.mark_draw_dirty(&mut f.regs, true, false);

        // Retarget to an overlapping range with a different pitch; the old
        // surface must be downloaded then destroyed.
        f.regs.surface_color.offset = 0x1080;
        f.regs.surface_color.pitch = 0x20;
        f.regs.surface_color.buffer_dirty = true;
        f.update(true, true, false);

        assert_eq!(f.tracker.surface_count(), 1);
        assert_eq!(f.stats.surface_downloads, 1);
        assert_eq!(f.stats.surface_invalidations, 1);
        assert_eq!(f.stats.surface_creates, 2);
        assert_eq!(
            f.tracker.binding(SurfaceKind::Color).unwrap().vram_addr,
            0x1080
        );
        // Old host image destroyed, hook removed.
        assert_eq!(f.backend.live_images(), 1);
        assert!(f.vram.hooks_hit(0x1000, 4).is_empty());
    }

    #[test]
    fn incompatible_retarget_at_same_address_replaces_binding() {
        let mut f = fixture();
        f.update(true, true, false);

        f.regs.surface_color.pitch = 0x80;
        f.regs.surface_color.buffer_dirty = true;
        f.update(true, true, false);

        assert_eq!(f.stats.surface_invalidations, 1);
        assert_eq!(f.stats.surface_creates, 2);
        assert_eq!(f.tracker.binding(SurfaceKind::Color).unwrap().pitch, 0x80);
    }

    #[test]
    fn cleared_surface_skips_sync_on_replacement() {
        let mut f = fixture();
        f.update(true, true, false);
        f.tracker.mark_draw_dirty(&mut f.regs, true, false);
        f.tracker.notify_cleared(true, true, false);

        // Same format, different dimensions: incompatible in-place, but the
        // surface was fully cleared so there is nothing to preserve.
        f.regs.surface_shape.clip_width = 8;
        f.regs.surface_shape.clip_height = 8;
        f.update(true, true, false);

        assert_eq!(f.stats.surface_invalidations, 1);
        assert_eq!(f.stats.surface_downloads, 0);
    }

    #[test]
    fn full_clear_skips_guest_seed() {
        let mut f = fixture();
        f.regs.clearing = true;
        f.tracker
            .update(
                &mut f.regs,
                &mut f.vram,
                &f.dma,
                &mut f.backend,
                &mut f.stats,
                true,
                true,
                false,
                false,
            )
            .unwrap();
        f.regs.clearing = false;

        assert_eq!(f.stats.surface_creates, 1);
        assert_eq!(f.stats.surface_uploads, 0);
        assert!(!f.tracker.binding(SurfaceKind::Color).unwrap().upload_pending);
    }

    #[test]
    fn stale_surfaces_are_evicted_after_age_limit() {
        let mut f = fixture();
        f.update(true, true, false);
        assert_eq!(f.tracker.surface_count(), 1);

        f.tracker.frame_time += SURFACE_AGE_LIMIT;
        // Another update pass on a different target triggers the scan.
        f.regs.surface_color.offset = 0x8000;
        f.regs.surface_color.buffer_dirty = true;
        f.update(true, true, false);

        assert_eq!(f.stats.surface_evictions_stale, 1);
        assert_eq!(f.tracker.surface_count(), 1);
        assert_eq!(
            f.tracker.binding(SurfaceKind::Color).unwrap().vram_addr,
            0x8000
        );
    }

    #[test]
    fn draw_dirty_respects_write_enable_masks() {
        let mut f = fixture();
        f.update(true, true, false);

        f.regs.color_mask = ColorMask::empty();
        f.tracker.mark_draw_dirty(&mut f.regs, true, true);
        assert!(!f.tracker.binding(SurfaceKind::Color).unwrap().draw_dirty);
        assert!(!f.regs.surface_color.draw_dirty);

        f.regs.color_mask = ColorMask::all();
        f.tracker.mark_draw_dirty(&mut f.regs, true, false);
        assert!(f.tracker.binding(SurfaceKind::Color).unwrap().draw_dirty);
    }

    #[test]
    fn flush_drops_everything_without_download() {
        let mut f = fixture();
        f.update(true, true, false);
        f.tracker.mark_draw_dirty(&mut f.regs, true, false);

        f.tracker
            .flush(&mut f.regs, &mut f.vram, &mut f.backend, &mut f.stats)
            .unwrap();

        assert_eq!(f.tracker.surface_count(), 0);
        assert_eq!(f.stats.surface_downloads, 0);
        assert_eq!(f.backend.live_images(), 0);
        assert!(f.tracker.binding(SurfaceKind::Color).is_none());
        // Shape cache reset forces recreation on the next draw.
        assert!(f.regs.framebuffer_dirty() || f.regs.surface_shape == SurfaceShape::default());
    }

    #[test]
    fn surface_as_texture_compatibility() {
        let mut f = fixture();
        f.update(true, true, false);
        let binding = f.tracker.binding(SurfaceKind::Color).unwrap();
        assert!(binding.can_texture_from(HostFormat::Rgb565, 16, 4, 0x40, false));
        assert!(!binding.can_texture_from(HostFormat::Rgb565, 16, 4, 0x20, false));
        assert!(!binding.can_texture_from(HostFormat::Rgba8, 16, 4, 0x40, false));
        assert!(!binding.can_texture_from(HostFormat::Rgb565, 8, 4, 0x40, false));
    }
}
