//! Texture binding cache.
//!
//! Textures are cached by shape plus source range through the shared LRU
//! engine. Content revalidation is deliberately lazy: a guest write near a
//! cached texture only sets an out-of-band `possibly_dirty` flag, and the
//! actual data is rehashed on the next lookup for that key. The host image
//! is rebuilt only when the hash really changed, so a texture atlas that is
//! written once and sampled every frame costs one hash, not one upload.
//!
//! When the fetch range is a live render target and the formats agree, the
//! texture is produced by blitting the surface image directly, skipping the
//! guest-memory round trip entirely.

use crate::backend::{HostBackend, HostFormat, ImageDesc, ImageHandle};
use crate::error::KelvinError;
use crate::guest_memory::{DirtyDomain, GuestMemory};
use crate::hash::content_hash;
use crate::lru::{CachePolicy, Lru, NodeHandle};
use crate::regs::{RegisterBank, NUM_TEXTURE_SLOTS};
use crate::stats::ProcessorStats;
use crate::surface::SurfaceTracker;

/// Texture color format codes, linear (`LU_IMAGE`) and swizzled (`SZ`)
/// variants. Only the formats the host table covers; everything else is
/// logged and the slot is skipped.
pub const TEX_SZ_R5G6B5: u32 = 0x05;
pub const TEX_SZ_A8R8G8B8: u32 = 0x06;
pub const TEX_LU_IMAGE_A1R5G5B5: u32 = 0x10;
pub const TEX_LU_IMAGE_R5G6B5: u32 = 0x11;
pub const TEX_LU_IMAGE_A8R8G8B8: u32 = 0x12;
pub const TEX_LU_IMAGE_X8R8G8B8: u32 = 0x1e;

/// Host format and layout for a texture format code.
pub fn texture_format_info(code: u32) -> Option<(HostFormat, bool)> {
    Some(match code {
        TEX_SZ_R5G6B5 => (HostFormat::Rgb565, true),
        TEX_SZ_A8R8G8B8 => (HostFormat::Rgba8, true),
        TEX_LU_IMAGE_A1R5G5B5 => (HostFormat::A1Rgb5, false),
        TEX_LU_IMAGE_R5G6B5 => (HostFormat::Rgb565, false),
        TEX_LU_IMAGE_A8R8G8B8 | TEX_LU_IMAGE_X8R8G8B8 => (HostFormat::Rgba8, false),
        _ => return None,
    })
}

/// Full cache key: shape and source ranges. Two fetches differing in any
/// field get distinct host images.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TextureKey {
    pub format_code: u32,
    pub width: u32,
    pub height: u32,
    pub pitch: u32,
    pub swizzle: bool,
    pub vram_offset: u64,
    pub length: u64,
    pub palette_offset: u64,
    pub palette_length: u64,
}

impl TextureKey {
    pub fn hash(&self) -> u64 {
        let mut bytes = Vec::with_capacity(64);
        for word in [self.format_code, self.width, self.height, self.pitch] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        bytes.push(self.swizzle as u8);
        for addr in [
            self.vram_offset,
            self.length,
            self.palette_offset,
            self.palette_length,
        ] {
            bytes.extend_from_slice(&addr.to_le_bytes());
        }
        content_hash(&bytes)
    }

    fn overlaps(&self, start: u64, len: u64) -> bool {
        let end = start + len;
        let tex_overlap = start < self.vram_offset + self.length && self.vram_offset < end;
        let pal_overlap = self.palette_length > 0
            && start < self.palette_offset + self.palette_length
            && self.palette_offset < end;
        tex_overlap || pal_overlap
    }
}

/// The constructed host resource for one cache entry.
#[derive(Debug)]
pub struct TextureBinding {
    pub image: ImageHandle,
    pub data_hash: u64,
    /// Draw pass the content was last blitted from, for the
    /// surface-as-texture path.
    pub draw_time: u64,
}

#[derive(Default)]
pub struct TextureCacheEntry {
    pub key: TextureKey,
    pub binding: Option<TextureBinding>,
    pub possibly_dirty: bool,
    /// Slots currently bound to this entry. Nonzero pins the node.
    pub refcnt: u32,
}

/// Lifecycle policy: lookup itself never builds the image (the bind flow
/// decides whether a rebuild is needed after hashing), so `construct` only
/// stamps the key.
struct TexturePolicy<'a> {
    backend: &'a mut dyn HostBackend,
}

impl CachePolicy<TextureCacheEntry> for TexturePolicy<'_> {
    type Key = TextureKey;

    fn matches(&self, payload: &TextureCacheEntry, key: &TextureKey) -> bool {
        payload.key == *key
    }

    fn construct(&mut self, payload: &mut TextureCacheEntry, key: &TextureKey) {
        payload.key = *key;
        payload.binding = None;
        payload.possibly_dirty = false;
        payload.refcnt = 0;
    }

    fn destroy(&mut self, payload: &mut TextureCacheEntry) {
        if let Some(binding) = payload.binding.take() {
            // Best effort; an unknown handle here is a bug upstream.
            if let Err(err) = self.backend.destroy_image(binding.image) {
                tracing::warn!(%err, "texture image destroy failed");
            }
        }
        payload.possibly_dirty = false;
    }

    fn can_evict(&self, payload: &TextureCacheEntry) -> bool {
        payload.refcnt == 0
    }
}

pub struct TextureCache {
    cache: Lru<TextureCacheEntry>,
    slot_binding: [Option<NodeHandle>; NUM_TEXTURE_SLOTS],
}

impl TextureCache {
    pub fn new(capacity: usize) -> Self {
        TextureCache {
            cache: Lru::new(capacity),
            slot_binding: [None; NUM_TEXTURE_SLOTS],
        }
    }

    pub fn slot_image(&self, slot: usize) -> Option<ImageHandle> {
        let handle = self.slot_binding[slot]?;
        self.cache.get(handle).binding.as_ref().map(|b| b.image)
    }

    /// Out-of-band invalidation: flag every cached texture whose source
    /// range overlaps `[addr, addr+len)` for revalidation at next lookup.
    pub fn mark_possibly_dirty(&mut self, addr: u64, len: u64) {
        self.cache.visit_active_mut(|entry| {
            if entry.binding.is_some() && !entry.possibly_dirty && entry.key.overlaps(addr, len) {
                entry.possibly_dirty = true;
            }
        });
    }

    /// Texture-domain dirty page check for a source range; a hit also
    /// propagates to every overlapping cached texture.
    fn check_possibly_dirty(&mut self, vram: &mut dyn GuestMemory, key: &TextureKey) -> bool {
        let mut possibly_dirty = false;
        if vram.test_and_clear_dirty(key.vram_offset, key.length, DirtyDomain::Texture) {
            possibly_dirty = true;
            self.mark_possibly_dirty(key.vram_offset, key.length);
        }
        if key.palette_length > 0
            && vram.test_and_clear_dirty(key.palette_offset, key.palette_length, DirtyDomain::Texture)
        {
            possibly_dirty = true;
            self.mark_possibly_dirty(key.palette_offset, key.palette_length);
        }
        possibly_dirty
    }

    fn rebind_slot(&mut self, slot: usize, handle: Option<NodeHandle>) {
        if self.slot_binding[slot] == handle {
            return;
        }
        if let Some(old) = self.slot_binding[slot] {
            let entry = self.cache.get_mut(old);
            debug_assert!(entry.refcnt > 0);
            entry.refcnt -= 1;
        }
        if let Some(new) = handle {
            self.cache.get_mut(new).refcnt += 1;
        }
        self.slot_binding[slot] = handle;
    }

    /// Resolve every enabled texture slot to a host image, reusing cached
    /// content wherever the coherence checks allow.
    pub fn bind_textures(
        &mut self,
        regs: &mut RegisterBank,
        vram: &mut dyn GuestMemory,
        surfaces: &mut SurfaceTracker,
        backend: &mut dyn HostBackend,
        stats: &mut ProcessorStats,
    ) -> Result<(), KelvinError> {
        for i in 0..NUM_TEXTURE_SLOTS {
            let slot = regs.textures[i];
            if !slot.enabled {
                self.rebind_slot(i, None);
                continue;
            }

            let (host_format, swizzle) = match texture_format_info(slot.color_format) {
                Some(info) => info,
                None => {
                    tracing::warn!(
                        slot = i,
                        format = slot.color_format,
                        "unsupported texture format"
                    );
                    self.rebind_slot(i, None);
                    continue;
                }
            };
            let bpp = host_format.bytes_per_pixel();
            let length = if swizzle {
                u64::from(slot.width()) * u64::from(slot.height()) * u64::from(bpp)
            } else {
                u64::from(slot.pitch) * u64::from(slot.height())
            };
            let key = TextureKey {
                format_code: slot.color_format,
                width: slot.width(),
                height: slot.height(),
                pitch: slot.pitch,
                swizzle,
                vram_offset: u64::from(slot.offset),
                length,
                palette_offset: 0,
                palette_length: 0,
            };

            let surface_draw_time = surfaces.get(key.vram_offset).map(|s| s.draw_time);
            let mut possibly_dirty = false;
            let mut possibly_dirty_checked = false;

            // Unchanged slot fast path: skip the cache walk when the slot
            // registers are untouched and the backing memory is clean.
            if !slot.dirty {
                if let Some(handle) = self.slot_binding[i] {
                    let bound = self.cache.get(handle);
                    let reusable = match surface_draw_time {
                        Some(draw_time) => bound
                            .binding
                            .as_ref()
                            .is_some_and(|b| b.draw_time == draw_time),
                        None => {
                            possibly_dirty = self.check_possibly_dirty(vram, &key);
                            possibly_dirty_checked = true;
                            !possibly_dirty
                        }
                    };
                    if reusable {
                        stats.texture_reuses += 1;
                        continue;
                    }
                }
            }

            // Render-target sourced fetch?
            let surf_to_tex = surfaces
                .get(key.vram_offset)
                .is_some_and(|s| s.can_texture_from(host_format, key.width, key.height, key.pitch, swizzle));
            if surf_to_tex {
                surfaces.upload_if_pending(key.vram_offset, vram, backend, stats)?;
            } else {
                // The decode reads guest memory; write back any dirty
                // surfaces the fetch range may index.
                surfaces.download_dirty_in_range(key.vram_offset, key.length, vram, backend, stats)?;
            }

            let mut policy = TexturePolicy { backend };
            let (handle, _) = self.cache.lookup(key.hash(), &key, &mut policy);

            possibly_dirty |= {
                let entry = self.cache.get(handle);
                entry.binding.is_none() || entry.possibly_dirty
            };
            if !surf_to_tex && !possibly_dirty_checked {
                possibly_dirty |= self.check_possibly_dirty(vram, &key);
            }

            let mut data_hash = 0;
            if !surf_to_tex && possibly_dirty {
                data_hash = content_hash(vram.slice(key.vram_offset, key.length as usize)?);
            }

            let entry = self.cache.get_mut(handle);
            let must_destroy = entry
                .binding
                .as_ref()
                .is_some_and(|b| possibly_dirty && b.data_hash != data_hash);
            if must_destroy {
                let binding = entry.binding.take().unwrap();
                backend.destroy_image(binding.image)?;
            }

            if self.cache.get(handle).binding.is_none() {
                // Surface-sourced content lives host-side only; the guest
                // copy may be stale, so the image starts empty and is
                // filled by the blit below.
                let image = if surf_to_tex {
                    backend.create_image(ImageDesc {
                        width: key.width,
                        height: key.height,
                        format: host_format,
                    })?
                } else {
                    stats.texture_uploads += 1;
                    upload_texture_image(&key, host_format, vram, backend)?
                };
                self.cache.get_mut(handle).binding = Some(TextureBinding {
                    image,
                    data_hash,
                    draw_time: 0,
                });
            } else {
                stats.texture_reuses += 1;
            }
            self.cache.get_mut(handle).possibly_dirty = false;

            if surf_to_tex {
                let draw_time = surface_draw_time.unwrap_or(0);
                let entry = self.cache.get_mut(handle);
                let binding = entry.binding.as_mut().unwrap();
                if binding.draw_time < draw_time {
                    let image = binding.image;
                    surfaces.render_to_texture(key.vram_offset, image, backend, stats)?;
                    self.cache.get_mut(handle).binding.as_mut().unwrap().draw_time = draw_time;
                }
            }

            self.rebind_slot(i, Some(handle));
            regs.textures[i].dirty = false;
        }
        Ok(())
    }

    /// Drop all unbound entries; bound slots keep their images.
    pub fn flush(&mut self, backend: &mut dyn HostBackend) {
        let mut policy = TexturePolicy { backend };
        self.cache.flush(&mut policy);
    }

    /// Release every slot binding, then drop the whole cache.
    pub fn reset(&mut self, backend: &mut dyn HostBackend) {
        for i in 0..NUM_TEXTURE_SLOTS {
            self.rebind_slot(i, None);
        }
        self.flush(backend);
    }
}

/// Copy texture content out of guest memory into a fresh host image.
/// Linear layouts are de-pitched row by row; swizzled content is copied
/// as-is (deswizzle is the sampler's concern in the recording backend).
fn upload_texture_image(
    key: &TextureKey,
    host_format: HostFormat,
    vram: &mut dyn GuestMemory,
    backend: &mut dyn HostBackend,
) -> Result<ImageHandle, KelvinError> {
    let desc = ImageDesc {
        width: key.width,
        height: key.height,
        format: host_format,
    };
    let image = backend.create_image(desc)?;

    let row_len = (key.width * host_format.bytes_per_pixel()) as usize;
    let mut pixels = vec![0u8; desc.byte_len()];
    if key.swizzle {
        pixels.copy_from_slice(vram.slice(key.vram_offset, desc.byte_len())?);
    } else {
        for y in 0..key.height as u64 {
            let row_addr = key.vram_offset + y * u64::from(key.pitch);
            pixels[y as usize * row_len..][..row_len]
                .copy_from_slice(vram.slice(row_addr, row_len)?);
        }
    }
    backend.upload_image(image, &pixels)?;
    Ok(image)
}
