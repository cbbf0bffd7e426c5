//! Host graphics backend seam.
//!
//! Everything the command processor needs from the native graphics API is
//! behind [`HostBackend`]: resource create/destroy, draw submission, blits,
//! readbacks, and a completion fence. The trait is deliberately dumb; all
//! caching, coherence, and batching policy lives above it.
//!
//! [`RecordingBackend`] is the deterministic in-memory implementation used
//! by the test suite: images and buffers are byte vectors, draws are
//! recorded, readback returns exactly what was uploaded.

use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ImageHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ProgramHandle(pub u64);

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("unknown resource handle {0:#x}")]
    UnknownHandle(u64),
    #[error("readback size mismatch: image is {image} bytes, caller gave {given}")]
    ReadbackSize { image: usize, given: usize },
    #[error("backend error: {0}")]
    Other(String),
}

/// Host pixel format for surface/texture images. Only the formats the
/// register model maps to; the full hardware table is a collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum HostFormat {
    Rgba8,
    Rgb565,
    A1Rgb5,
    Depth16,
    Depth24Stencil8,
}

impl HostFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            HostFormat::Rgba8 | HostFormat::Depth24Stencil8 => 4,
            HostFormat::Rgb565 | HostFormat::A1Rgb5 | HostFormat::Depth16 => 2,
        }
    }

    pub fn is_depth(self) -> bool {
        matches!(self, HostFormat::Depth16 | HostFormat::Depth24Stencil8)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub format: HostFormat,
}

impl ImageDesc {
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel() as usize
    }
}

/// Primitive topology as the host API sees it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topology {
    Points,
    Lines,
    LineLoop,
    LineStrip,
    Triangles,
    TriangleStrip,
    TriangleFan,
    Quads,
    QuadStrip,
    Polygon,
}

/// One host draw call; exactly one is emitted per batch flush.
#[derive(Clone, Debug, PartialEq)]
pub enum DrawCall {
    /// Multi-draw over pre-merged (start, count) ranges.
    MultiArrays {
        topology: Topology,
        ranges: Vec<(u32, u32)>,
    },
    /// Indexed draw over a cached 32-bit index buffer.
    Elements {
        topology: Topology,
        buffer: BufferHandle,
        count: u32,
    },
    /// Draw over a fully materialized inline per-attribute vertex buffer.
    InlineBuffer {
        topology: Topology,
        vertex_count: u32,
    },
    /// Draw over an inline interleaved array.
    InlineArray {
        topology: Topology,
        vertex_count: u32,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClearParams {
    pub color: Option<u32>,
    pub depth_stencil: Option<u32>,
}

pub trait HostBackend {
    fn create_image(&mut self, desc: ImageDesc) -> Result<ImageHandle, BackendError>;
    fn destroy_image(&mut self, image: ImageHandle) -> Result<(), BackendError>;
    fn upload_image(&mut self, image: ImageHandle, data: &[u8]) -> Result<(), BackendError>;
    fn readback_image(&mut self, image: ImageHandle, out: &mut [u8]) -> Result<(), BackendError>;
    /// Full-image copy, used by the surface-as-texture fast path.
    fn blit_image(&mut self, src: ImageHandle, dst: ImageHandle) -> Result<(), BackendError>;
    fn clear_image(&mut self, image: ImageHandle, params: ClearParams)
        -> Result<(), BackendError>;

    fn create_index_buffer(&mut self, indices: &[u32]) -> Result<BufferHandle, BackendError>;
    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<(), BackendError>;

    fn compile_program(&mut self, state_digest: u64) -> Result<ProgramHandle, BackendError>;
    fn destroy_program(&mut self, program: ProgramHandle) -> Result<(), BackendError>;

    fn draw(&mut self, call: DrawCall) -> Result<(), BackendError>;

    /// Block until all previously submitted work has completed. Used by the
    /// synchronous cross-thread handoffs before reporting completion.
    fn fence(&mut self) -> Result<(), BackendError>;
}

/// In-memory backend for tests and headless runs.
#[derive(Default)]
pub struct RecordingBackend {
    next_handle: u64,
    images: HashMap<u64, (ImageDesc, Vec<u8>)>,
    buffers: HashMap<u64, Vec<u32>>,
    programs: HashMap<u64, u64>,
    pub draws: Vec<DrawCall>,
    pub clears: Vec<(ImageHandle, ClearParams)>,
    pub fences: u64,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    pub fn image_data(&self, image: ImageHandle) -> Option<&[u8]> {
        self.images.get(&image.0).map(|(_, d)| d.as_slice())
    }

    pub fn buffer_data(&self, buffer: BufferHandle) -> Option<&[u32]> {
        self.buffers.get(&buffer.0).map(|b| b.as_slice())
    }

    pub fn live_images(&self) -> usize {
        self.images.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }
}

impl HostBackend for RecordingBackend {
    fn create_image(&mut self, desc: ImageDesc) -> Result<ImageHandle, BackendError> {
        let id = self.alloc();
        self.images.insert(id, (desc, vec![0u8; desc.byte_len()]));
        Ok(ImageHandle(id))
    }

    fn destroy_image(&mut self, image: ImageHandle) -> Result<(), BackendError> {
        self.images
            .remove(&image.0)
            .map(|_| ())
            .ok_or(BackendError::UnknownHandle(image.0))
    }

    fn upload_image(&mut self, image: ImageHandle, data: &[u8]) -> Result<(), BackendError> {
        let (_, store) = self
            .images
            .get_mut(&image.0)
            .ok_or(BackendError::UnknownHandle(image.0))?;
        let n = data.len().min(store.len());
        store[..n].copy_from_slice(&data[..n]);
        Ok(())
    }

    fn readback_image(&mut self, image: ImageHandle, out: &mut [u8]) -> Result<(), BackendError> {
        let (_, store) = self
            .images
            .get(&image.0)
            .ok_or(BackendError::UnknownHandle(image.0))?;
        if out.len() != store.len() {
            return Err(BackendError::ReadbackSize {
                image: store.len(),
                given: out.len(),
            });
        }
        out.copy_from_slice(store);
        Ok(())
    }

    fn blit_image(&mut self, src: ImageHandle, dst: ImageHandle) -> Result<(), BackendError> {
        let data = self
            .images
            .get(&src.0)
            .ok_or(BackendError::UnknownHandle(src.0))?
            .1
            .clone();
        let (_, store) = self
            .images
            .get_mut(&dst.0)
            .ok_or(BackendError::UnknownHandle(dst.0))?;
        let n = data.len().min(store.len());
        store[..n].copy_from_slice(&data[..n]);
        Ok(())
    }

    fn clear_image(
        &mut self,
        image: ImageHandle,
        params: ClearParams,
    ) -> Result<(), BackendError> {
        let (desc, store) = self
            .images
            .get_mut(&image.0)
            .ok_or(BackendError::UnknownHandle(image.0))?;
        let value = params.color.or(params.depth_stencil).unwrap_or(0);
        let bpp = desc.format.bytes_per_pixel() as usize;
        for px in store.chunks_mut(bpp) {
            px.copy_from_slice(&value.to_le_bytes()[..px.len()]);
        }
        self.clears.push((image, params));
        Ok(())
    }

    fn create_index_buffer(&mut self, indices: &[u32]) -> Result<BufferHandle, BackendError> {
        let id = self.alloc();
        self.buffers.insert(id, indices.to_vec());
        Ok(BufferHandle(id))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) -> Result<(), BackendError> {
        self.buffers
            .remove(&buffer.0)
            .map(|_| ())
            .ok_or(BackendError::UnknownHandle(buffer.0))
    }

    fn compile_program(&mut self, state_digest: u64) -> Result<ProgramHandle, BackendError> {
        let id = self.alloc();
        self.programs.insert(id, state_digest);
        Ok(ProgramHandle(id))
    }

    fn destroy_program(&mut self, program: ProgramHandle) -> Result<(), BackendError> {
        self.programs
            .remove(&program.0)
            .map(|_| ())
            .ok_or(BackendError::UnknownHandle(program.0))
    }

    fn draw(&mut self, call: DrawCall) -> Result<(), BackendError> {
        self.draws.push(call);
        Ok(())
    }

    fn fence(&mut self) -> Result<(), BackendError> {
        self.fences += 1;
        Ok(())
    }
}
