//! Shader program cache.
//!
//! Programs are keyed by a digest of every register that feeds shader
//! generation. A miss compiles and links through the backend; hits reuse
//! the linked program, so state thrash between a handful of configurations
//! settles into pure cache hits.

use crate::backend::{HostBackend, ProgramHandle, Topology};
use crate::error::KelvinError;
use crate::hash::word_hash;
use crate::lru::{CachePolicy, Lru, LookupOutcome, NodeHandle};
use crate::regs::RegisterBank;
use crate::stats::ProcessorStats;

/// Everything that selects a distinct program. The digest is the cache
/// key; collisions fall back to comparing the state itself.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ShaderState {
    pub primitive: u32,
    pub color_mask: u32,
    pub depth_test: bool,
    pub stencil_test: bool,
    pub texture_enabled: [bool; crate::regs::NUM_TEXTURE_SLOTS],
}

impl ShaderState {
    pub fn from_regs(regs: &RegisterBank, primitive: u32) -> Self {
        let mut texture_enabled = [false; crate::regs::NUM_TEXTURE_SLOTS];
        for (i, slot) in regs.textures.iter().enumerate() {
            texture_enabled[i] = slot.enabled;
        }
        ShaderState {
            primitive,
            color_mask: regs.color_mask.bits(),
            depth_test: regs.depth_test,
            stencil_test: regs.stencil_test,
            texture_enabled,
        }
    }

    pub fn digest(&self) -> u64 {
        let mut words = vec![self.primitive, self.color_mask];
        words.push(u32::from(self.depth_test) | u32::from(self.stencil_test) << 1);
        let mut tex_bits = 0u32;
        for (i, &e) in self.texture_enabled.iter().enumerate() {
            tex_bits |= u32::from(e) << i;
        }
        words.push(tex_bits);
        word_hash(&words)
    }
}

#[derive(Default)]
pub struct ShaderCacheEntry {
    pub state: ShaderState,
    pub program: Option<ProgramHandle>,
    /// Topology the program was generated for; bound alongside the program
    /// so a flush after a state change draws with the right mode.
    pub topology: Option<Topology>,
}

struct ShaderPolicy<'a> {
    backend: &'a mut dyn HostBackend,
    compile_error: Option<KelvinError>,
    compiles: u64,
}

impl CachePolicy<ShaderCacheEntry> for ShaderPolicy<'_> {
    type Key = ShaderState;

    fn matches(&self, payload: &ShaderCacheEntry, key: &ShaderState) -> bool {
        payload.program.is_some() && payload.state == *key
    }

    fn construct(&mut self, payload: &mut ShaderCacheEntry, key: &ShaderState) {
        payload.state = *key;
        payload.topology = crate::regs::topology_for_primitive(key.primitive);
        match self.backend.compile_program(key.digest()) {
            Ok(program) => payload.program = Some(program),
            Err(err) => {
                payload.program = None;
                self.compile_error = Some(err.into());
            }
        }
        self.compiles += 1;
    }

    fn destroy(&mut self, payload: &mut ShaderCacheEntry) {
        if let Some(program) = payload.program.take() {
            if let Err(err) = self.backend.destroy_program(program) {
                tracing::warn!(%err, "program destroy failed");
            }
        }
        payload.topology = None;
    }
}

pub struct ShaderCache {
    cache: Lru<ShaderCacheEntry>,
}

impl ShaderCache {
    pub fn new(capacity: usize) -> Self {
        ShaderCache {
            cache: Lru::new(capacity),
        }
    }

    /// Program and topology for the current register state, compiling on
    /// first sight.
    pub fn bind(
        &mut self,
        regs: &RegisterBank,
        primitive: u32,
        backend: &mut dyn HostBackend,
        stats: &mut ProcessorStats,
    ) -> Result<(ProgramHandle, Option<Topology>), KelvinError> {
        let state = ShaderState::from_regs(regs, primitive);
        let mut policy = ShaderPolicy {
            backend,
            compile_error: None,
            compiles: 0,
        };
        let (handle, outcome) = self.cache.lookup(state.digest(), &state, &mut policy);
        if let Some(err) = policy.compile_error.take() {
            // A node with no program can never be hit again; free its slot
            // instead of letting it sit in the active list.
            self.cache.remove(handle, &mut policy);
            return Err(err);
        }
        stats.shader_compiles += policy.compiles;
        if outcome == LookupOutcome::Hit {
            tracing::trace!(digest = state.digest(), "shader cache hit");
        }
        let entry = self.cache.get(handle);
        Ok((entry.program.unwrap(), entry.topology))
    }

    pub fn get(&self, handle: NodeHandle) -> &ShaderCacheEntry {
        self.cache.get(handle)
    }

    pub fn flush(&mut self, backend: &mut dyn HostBackend) {
        let mut policy = ShaderPolicy {
            backend,
            compile_error: None,
            compiles: 0,
        };
        self.cache.flush(&mut policy);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RecordingBackend;
    use pretty_assertions::assert_eq;

    #[test]
    fn same_state_compiles_once() {
        let mut cache = ShaderCache::new(4);
        let mut backend = RecordingBackend::new();
        let mut stats = ProcessorStats::default();
        let regs = RegisterBank::default();

        let (p1, topo) = cache.bind(&regs, 5, &mut backend, &mut stats).unwrap();
        let (p2, _) = cache.bind(&regs, 5, &mut backend, &mut stats).unwrap();
        assert_eq!(p1, p2);
        assert_eq!(stats.shader_compiles, 1);
        assert_eq!(topo, Some(Topology::Triangles));
    }

    #[test]
    fn state_change_selects_a_new_program() {
        let mut cache = ShaderCache::new(4);
        let mut backend = RecordingBackend::new();
        let mut stats = ProcessorStats::default();
        let mut regs = RegisterBank::default();

        let (p1, _) = cache.bind(&regs, 5, &mut backend, &mut stats).unwrap();
        regs.depth_test = true;
        let (p2, _) = cache.bind(&regs, 5, &mut backend, &mut stats).unwrap();
        assert_ne!(p1, p2);

        // Back to the original state: hit, no third compile.
        regs.depth_test = false;
        let (p3, _) = cache.bind(&regs, 5, &mut backend, &mut stats).unwrap();
        assert_eq!(p1, p3);
        assert_eq!(stats.shader_compiles, 2);
    }

    #[test]
    fn failed_compile_frees_its_slot() {
        use crate::backend::{
            BackendError, BufferHandle, ClearParams, DrawCall, ImageDesc, ImageHandle,
        };

        // Delegates everything except program compilation, which fails.
        struct BrokenCompiler(RecordingBackend);
        impl HostBackend for BrokenCompiler {
            fn create_image(&mut self, desc: ImageDesc) -> Result<ImageHandle, BackendError> {
                self.0.create_image(desc)
            }
            fn destroy_image(&mut self, image: ImageHandle) -> Result<(), BackendError> {
                self.0.destroy_image(image)
            }
            fn upload_image(&mut self, image: ImageHandle, data: &[u8]) -> Result<(), BackendError> {
                self.0.upload_image(image, data)
            }
            fn readback_image(
                &mut self,
                image: ImageHandle,
                out: &mut [u8],
            ) -> Result<(), BackendError> {
                self.0.readback_image(image, out)
            }
            fn blit_image(&mut self, src: ImageHandle, dst: ImageHandle) -> Result<(), BackendError> {
                self.0.blit_image(src, dst)
            }
            fn clear_image(
                &mut self,
                image: ImageHandle,
                params: ClearParams,
            ) -> Result<(), BackendError> {
                self.0.clear_image(image, params)
            }
            fn create_index_buffer(&mut self, indices: &[u32]) -> Result<BufferHandle, BackendError> {
                self.0.create_index_buffer(indices)
            }
            fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<(), BackendError> {
                self.0.destroy_buffer(buffer)
            }
            fn compile_program(&mut self, _state_digest: u64) -> Result<ProgramHandle, BackendError> {
                Err(BackendError::Other("link failed".into()))
            }
            fn destroy_program(&mut self, program: ProgramHandle) -> Result<(), BackendError> {
                self.0.destroy_program(program)
            }
            fn draw(&mut self, call: DrawCall) -> Result<(), BackendError> {
                self.0.draw(call)
            }
            fn fence(&mut self) -> Result<(), BackendError> {
                self.0.fence()
            }
        }

        let mut cache = ShaderCache::new(1);
        let mut stats = ProcessorStats::default();
        let regs = RegisterBank::default();

        let mut broken = BrokenCompiler(RecordingBackend::new());
        assert!(cache.bind(&regs, 5, &mut broken, &mut stats).is_err());
        assert_eq!(broken.0.live_programs(), 0);
        assert_eq!(cache.cache.active_len(), 0);

        // The slot is free again: the retry compiles without evicting.
        let mut backend = RecordingBackend::new();
        cache.bind(&regs, 5, &mut backend, &mut stats).unwrap();
        assert_eq!(cache.cache.stats().evictions, 0);
        assert_eq!(backend.live_programs(), 1);
    }

    #[test]
    fn eviction_releases_the_program() {
        let mut cache = ShaderCache::new(1);
        let mut backend = RecordingBackend::new();
        let mut stats = ProcessorStats::default();
        let regs = RegisterBank::default();

        cache.bind(&regs, 1, &mut backend, &mut stats).unwrap();
        cache.bind(&regs, 2, &mut backend, &mut stats).unwrap();
        assert_eq!(backend.live_programs(), 1);
        assert_eq!(stats.shader_compiles, 2);
    }
}
