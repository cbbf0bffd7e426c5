//! Command processor front end.
//!
//! The engine state lives behind one mutex and is driven by a worker
//! thread that owns the host backend. The guest-facing side (MMIO-style
//! reads/writes and pushbuffer kicks) runs on the caller's thread: it
//! mutates VRAM and coherence flags under the lock, queues work over a
//! channel, and for the few operations that must observe completed GPU
//! work it blocks on a oneshot handshake with the worker.

use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use futures_intrusive::channel::shared::{oneshot_channel, OneshotSender};

use crate::backend::HostBackend;
use crate::error::KelvinError;
use crate::guest_memory::{GuestMemory, Vram};
use crate::methods::GraphicsEngine;
use crate::pushbuffer::{Pushbuffer, PushbufferFault};
use crate::stats::ProcessorStats;
use crate::surface::SURFACE_AGE_LIMIT;

#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    pub vram_size: usize,
    pub pushbuffer_start: u64,
    pub surface_age_limit: u64,
    pub texture_cache_capacity: usize,
    pub shader_cache_capacity: usize,
    pub vertex_cache_capacity: usize,
    pub squash_repeated_draws: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        ProcessorConfig {
            vram_size: 0x100_0000,
            pushbuffer_start: 0x8_0000,
            surface_age_limit: SURFACE_AGE_LIMIT,
            texture_cache_capacity: 256,
            shader_cache_capacity: 64,
            vertex_cache_capacity: 64,
            squash_repeated_draws: true,
        }
    }
}

/// Everything the worker and the guest-facing side share.
pub struct GpuState {
    pub engine: GraphicsEngine,
    pub vram: Box<dyn GuestMemory + Send>,
    pub pushbuffer: Pushbuffer,
}

enum Request {
    /// Chase the pushbuffer PUT pointer.
    Kick,
    /// Service downloads requested by guest-access intercepts.
    ProcessDownloads(OneshotSender<()>),
    /// Write every draw-dirty surface back to guest memory.
    DownloadDirty(OneshotSender<()>),
    /// Drop all host resources without syncing back.
    Flush(OneshotSender<()>),
    /// Frame boundary: advance the frame clock and fence the backend.
    EndFrame(OneshotSender<()>),
    /// Queue drain barrier.
    Sync(OneshotSender<()>),
    Stop,
}

pub struct Processor<B: HostBackend + Send + 'static> {
    shared: Arc<Mutex<GpuState>>,
    tx: mpsc::Sender<Request>,
    worker: Option<thread::JoinHandle<B>>,
}

impl<B: HostBackend + Send + 'static> Processor<B> {
    pub fn new(config: ProcessorConfig, backend: B) -> Self {
        let vram = Box::new(Vram::new(config.vram_size));
        Self::with_memory(config, backend, vram)
    }

    /// Build a processor over the integrator's memory system instead of the
    /// flat built-in VRAM. `config.vram_size` is ignored; the memory decides
    /// its own extent.
    pub fn with_memory(
        config: ProcessorConfig,
        backend: B,
        memory: Box<dyn GuestMemory + Send>,
    ) -> Self {
        let mut engine = GraphicsEngine::new(
            config.surface_age_limit,
            config.texture_cache_capacity,
            config.shader_cache_capacity,
            config.vertex_cache_capacity,
        );
        engine.squash_repeated_draws = config.squash_repeated_draws;

        let shared = Arc::new(Mutex::new(GpuState {
            engine,
            vram: memory,
            pushbuffer: Pushbuffer::new(config.pushbuffer_start),
        }));

        let (tx, rx) = mpsc::channel();
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("kelvin-gpu".into())
            .spawn(move || worker_loop(worker_shared, rx, backend))
            .expect("spawn gpu worker");

        Processor {
            shared,
            tx,
            worker: Some(worker),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GpuState> {
        self.shared.lock().expect("gpu state poisoned")
    }

    fn roundtrip(&self, make: impl FnOnce(OneshotSender<()>) -> Request) {
        let (done_tx, done_rx) = oneshot_channel();
        if self.tx.send(make(done_tx)).is_err() {
            return;
        }
        pollster::block_on(done_rx.receive());
    }

    /// Run `f` against the locked state. Intended for setup (DMA objects,
    /// register poking) and inspection in tests.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut GpuState) -> R) -> R {
        f(&mut self.lock())
    }

    /// Guest write to VRAM. If the range overlaps a live surface the
    /// coherence flags are updated first, and a surface whose host content
    /// is newer is downloaded before the write lands (read-before-write).
    pub fn cpu_write(&self, addr: u64, data: &[u8]) -> Result<(), KelvinError> {
        let need_wait = {
            let mut state = self.lock();
            if state.vram.hooks_hit(addr, data.len() as u64).is_empty() {
                false
            } else {
                state
                    .engine
                    .surfaces
                    .on_guest_access(addr, data.len() as u64, true)
            }
        };
        if need_wait {
            self.roundtrip(Request::ProcessDownloads);
        }
        self.lock().vram.write(addr, data)?;
        Ok(())
    }

    /// Guest read from VRAM, downloading any overlapping draw-dirty surface
    /// first so rendered content is visible.
    pub fn cpu_read(&self, addr: u64, dst: &mut [u8]) -> Result<(), KelvinError> {
        let need_wait = {
            let mut state = self.lock();
            if state.vram.hooks_hit(addr, dst.len() as u64).is_empty() {
                false
            } else {
                state
                    .engine
                    .surfaces
                    .on_guest_access(addr, dst.len() as u64, false)
            }
        };
        if need_wait {
            self.roundtrip(Request::ProcessDownloads);
        }
        self.lock().vram.read(addr, dst)?;
        Ok(())
    }

    /// Advance the pushbuffer PUT pointer and wake the worker.
    pub fn kick(&self, put: u64) {
        self.lock().pushbuffer.set_put(put);
        let _ = self.tx.send(Request::Kick);
    }

    /// Block until all previously queued work has been executed.
    pub fn sync(&self) {
        self.roundtrip(Request::Sync);
    }

    /// Force every draw-dirty surface back into guest memory.
    pub fn download_dirty(&self) {
        self.roundtrip(Request::DownloadDirty);
    }

    /// Drop all host resources. Guest memory is not updated.
    pub fn flush(&self) {
        self.roundtrip(Request::Flush);
    }

    /// Frame boundary: lets stale-surface eviction age out targets no draw
    /// has touched for the configured number of frames.
    pub fn end_frame(&self) {
        self.roundtrip(Request::EndFrame);
    }

    pub fn stats(&self) -> ProcessorStats {
        self.lock().engine.stats.snapshot()
    }

    pub fn pushbuffer_fault(&self) -> Option<PushbufferFault> {
        self.lock().pushbuffer.fault()
    }

    /// Stop the worker and recover the backend for inspection.
    pub fn shutdown(mut self) -> B {
        let _ = self.tx.send(Request::Stop);
        let worker = self.worker.take().expect("worker already taken");
        worker.join().expect("gpu worker panicked")
    }
}

impl<B: HostBackend + Send + 'static> Drop for Processor<B> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = self.tx.send(Request::Stop);
            let _ = worker.join();
        }
    }
}

fn worker_loop<B: HostBackend + Send>(
    shared: Arc<Mutex<GpuState>>,
    rx: mpsc::Receiver<Request>,
    mut backend: B,
) -> B {
    while let Ok(request) = rx.recv() {
        let mut state = shared.lock().expect("gpu state poisoned");
        let GpuState {
            engine,
            vram,
            pushbuffer,
        } = &mut *state;

        match request {
            Request::Kick => {
                // Faults latch into the pushbuffer; the guest sees them via
                // the fault register, not as a processor crash.
                if let Err(err) = pushbuffer.run(engine, &mut **vram, &mut backend) {
                    tracing::error!(%err, "command stream stopped");
                }
            }
            Request::ProcessDownloads(done) => {
                if let Err(err) =
                    engine
                        .surfaces
                        .process_pending_downloads(&mut **vram, &mut backend, &mut engine.stats)
                {
                    tracing::error!(%err, "pending download failed");
                }
                let _ = done.send(());
            }
            Request::DownloadDirty(done) => {
                if let Err(err) = engine.download_dirty(&mut **vram, &mut backend) {
                    tracing::error!(%err, "surface download failed");
                }
                let _ = done.send(());
            }
            Request::Flush(done) => {
                if let Err(err) = engine.flush_all(&mut **vram, &mut backend) {
                    tracing::error!(%err, "flush failed");
                }
                let _ = done.send(());
            }
            Request::EndFrame(done) => {
                engine.surfaces.frame_time += 1;
                if let Err(err) = backend.fence() {
                    tracing::error!(%err, "fence failed");
                }
                let _ = done.send(());
            }
            Request::Sync(done) => {
                let _ = done.send(());
            }
            Request::Stop => break,
        }
    }
    backend
}
