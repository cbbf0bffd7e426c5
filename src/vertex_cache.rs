//! Vertex-index buffer cache.
//!
//! Accumulated inline element lists are content-hashed and cached, so a
//! guest that submits the same index list every frame costs one upload
//! total. The cache hash *is* the content hash; the key carries only the
//! list geometry (count, stride) and exists to break hash collisions.
//!
//! Nodes recycled off the free list carry no buffer yet; the `initialized`
//! latch makes the caller upload exactly once per constructed node.

use crate::backend::{BufferHandle, HostBackend};
use crate::error::KelvinError;
use crate::hash::word_hash;
use crate::lru::{CachePolicy, Lru};
use crate::stats::ProcessorStats;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VertexKey {
    pub count: u32,
    pub stride: u32,
}

#[derive(Default)]
pub struct VertexCacheEntry {
    pub key: VertexKey,
    pub buffer: Option<BufferHandle>,
    pub initialized: bool,
}

struct VertexPolicy<'a> {
    backend: &'a mut dyn HostBackend,
}

impl CachePolicy<VertexCacheEntry> for VertexPolicy<'_> {
    type Key = VertexKey;

    fn matches(&self, payload: &VertexCacheEntry, key: &VertexKey) -> bool {
        payload.key == *key
    }

    fn construct(&mut self, payload: &mut VertexCacheEntry, key: &VertexKey) {
        payload.key = *key;
        payload.initialized = false;
    }

    fn destroy(&mut self, payload: &mut VertexCacheEntry) {
        if let Some(buffer) = payload.buffer.take() {
            if let Err(err) = self.backend.destroy_buffer(buffer) {
                tracing::warn!(%err, "index buffer destroy failed");
            }
        }
        payload.initialized = false;
    }
}

pub struct VertexCache {
    cache: Lru<VertexCacheEntry>,
}

impl VertexCache {
    pub fn new(capacity: usize) -> Self {
        VertexCache {
            cache: Lru::new(capacity),
        }
    }

    /// Host index buffer for `elements`, uploading only when this exact
    /// content has not been seen recently.
    pub fn bind_elements(
        &mut self,
        elements: &[u32],
        backend: &mut dyn HostBackend,
        stats: &mut ProcessorStats,
    ) -> Result<BufferHandle, KelvinError> {
        let key = VertexKey {
            count: elements.len() as u32,
            stride: 4,
        };
        let hash = word_hash(elements);

        let mut policy = VertexPolicy { backend };
        let (handle, _) = self.cache.lookup(hash, &key, &mut policy);

        let entry = self.cache.get_mut(handle);
        if !entry.initialized {
            entry.buffer = Some(backend.create_index_buffer(elements)?);
            entry.initialized = true;
            stats.index_buffer_uploads += 1;
        } else {
            stats.index_buffer_reuses += 1;
        }
        Ok(entry.buffer.unwrap())
    }

    pub fn flush(&mut self, backend: &mut dyn HostBackend) {
        let mut policy = VertexPolicy { backend };
        self.cache.flush(&mut policy);
    }
}
