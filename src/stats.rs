//! Profiling counters for the command processor.
//!
//! Updated under the graphics lock, so plain integers suffice; a copy of
//! the whole struct is the snapshot.

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessorStats {
    pub methods_dispatched: u64,
    pub methods_unhandled: u64,

    pub begin_ends: u64,
    pub draw_arrays_batches: u64,
    pub inline_element_batches: u64,
    pub inline_buffer_batches: u64,
    pub inline_array_batches: u64,
    pub empty_begin_ends: u64,
    pub squashed_draw_triples: u64,

    pub surface_creates: u64,
    pub surface_hits: u64,
    pub surface_invalidations: u64,
    pub surface_uploads: u64,
    pub surface_downloads: u64,
    pub surface_evictions_stale: u64,

    pub texture_uploads: u64,
    pub texture_reuses: u64,
    pub surface_to_texture_blits: u64,

    pub shader_compiles: u64,
    pub index_buffer_uploads: u64,
    pub index_buffer_reuses: u64,
}

impl ProcessorStats {
    pub fn snapshot(&self) -> ProcessorStats {
        *self
    }
}
