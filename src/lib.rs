//! `kelvin-gpu` emulates the command-processing front end of an early
//! fixed-function GPU.
//!
//! The pipeline, front to back:
//! - Pushbuffer decoding: a DMA command stream chased with GET/PUT
//!   pointers, with jump/call/return control words and a fault latch
//!   (see [`pushbuffer::Pushbuffer`]).
//! - Method dispatch and draw batching: BEGIN/END bracketed vertex
//!   accumulation with draw-call squashing (see
//!   [`methods::GraphicsEngine`] and [`batch::DrawBatch`]).
//! - Render-target coherence: host-side surfaces kept consistent with
//!   guest VRAM through access intercepts and dirty tracking (see
//!   [`surface::SurfaceTracker`]).
//! - Bounded LRU caching of textures, shader programs, and index
//!   buffers over a preallocated node pool (see [`lru::Lru`]).
//!
//! [`processor::Processor`] ties these together behind a worker thread
//! that owns the host backend; [`backend::HostBackend`] abstracts the
//! actual rendering API, with [`backend::RecordingBackend`] as the
//! in-memory implementation used by tests.

mod hash;

pub mod backend;
pub mod batch;
pub mod error;
pub mod guest_memory;
pub mod lru;
pub mod methods;
pub mod processor;
pub mod pushbuffer;
pub mod regs;
pub mod shader_cache;
pub mod stats;
pub mod surface;
pub mod texture_cache;
pub mod vertex_cache;

pub use backend::{HostBackend, RecordingBackend};
pub use error::KelvinError;
pub use guest_memory::{GuestMemory, Vram};
pub use methods::GraphicsEngine;
pub use processor::{Processor, ProcessorConfig};
pub use pushbuffer::{Pushbuffer, PushbufferFault};
pub use stats::ProcessorStats;
