//! Draw-call accumulation between BEGIN and END.
//!
//! Vertex data arrives in four mutually exclusive forms: implicit
//! (start, count) ranges, explicit 16/32-bit element indices, immediate
//! per-attribute values, and an interleaved inline array. Everything
//! accumulated between one BEGIN/END pair flushes as exactly one host draw
//! call. Mixing forms mid-primitive converts the accumulated ranges into
//! explicit elements so submission order is preserved.

use crate::backend::{DrawCall, HostBackend, Topology};
use crate::error::KelvinError;
use crate::stats::ProcessorStats;
use crate::vertex_cache::VertexCache;

/// Upper bound on accumulated elements/words per batch.
pub const MAX_BATCH_LENGTH: usize = 0x2_0000;
/// Upper bound on squashed (start, count) ranges per batch.
pub const MAX_DRAW_ARRAYS_RANGES: usize = 1250;

pub const NUM_VERTEX_ATTRIBUTES: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchKind {
    Empty,
    DrawArrays,
    InlineElements,
    InlineBuffer,
    InlineArray,
}

#[derive(Default)]
pub struct DrawBatch {
    draw_arrays: Vec<(u32, u32)>,
    /// Stops the contiguity merge for the next accumulated range. Set when
    /// ranges from squashed separate primitives land in one batch.
    pub draw_arrays_prevent_connect: bool,

    inline_elements: Vec<u32>,

    /// Immediate-mode values, one list per attribute. Attribute 0 closing
    /// a vertex appends to every populated list.
    attr_values: [[f32; 4]; NUM_VERTEX_ATTRIBUTES],
    attr_buffers: Vec<Vec<[f32; 4]>>,
    inline_buffer_len: u32,

    inline_array: Vec<u32>,
}

impl DrawBatch {
    pub fn new() -> Self {
        DrawBatch {
            attr_buffers: vec![Vec::new(); NUM_VERTEX_ATTRIBUTES],
            ..Default::default()
        }
    }

    pub fn kind(&self) -> BatchKind {
        if !self.draw_arrays.is_empty() {
            BatchKind::DrawArrays
        } else if !self.inline_elements.is_empty() {
            BatchKind::InlineElements
        } else if self.inline_buffer_len > 0 {
            BatchKind::InlineBuffer
        } else if !self.inline_array.is_empty() {
            BatchKind::InlineArray
        } else {
            BatchKind::Empty
        }
    }

    pub fn is_empty(&self) -> bool {
        self.kind() == BatchKind::Empty
    }

    pub fn draw_arrays_len(&self) -> usize {
        self.draw_arrays.len()
    }

    pub fn inline_elements_len(&self) -> usize {
        self.inline_elements.len()
    }

    pub fn can_squash_another_range(&self) -> bool {
        self.inline_elements.is_empty() && self.draw_arrays.len() < MAX_DRAW_ARRAYS_RANGES - 1
    }

    pub fn reset(&mut self) {
        self.draw_arrays.clear();
        self.draw_arrays_prevent_connect = false;
        self.inline_elements.clear();
        for buf in &mut self.attr_buffers {
            buf.clear();
        }
        self.inline_buffer_len = 0;
        self.inline_array.clear();
    }

    /// Accumulate one (start, count) range. Contiguous ranges merge unless
    /// the connect guard is set, so strip topologies squashed from separate
    /// primitives are not fused.
    pub fn add_draw_arrays(&mut self, start: u32, count: u32) {
        // An open element list absorbs the range as explicit indices.
        if !self.inline_elements.is_empty() {
            assert!(!self.draw_arrays_prevent_connect);
            self.append_elements_range(start, count);
            return;
        }

        assert!(self.draw_arrays.len() < MAX_DRAW_ARRAYS_RANGES);
        if !self.draw_arrays_prevent_connect {
            if let Some(last) = self.draw_arrays.last_mut() {
                if start == last.0 + last.1 {
                    last.1 += count;
                    return;
                }
            }
        }
        self.draw_arrays.push((start, count));
        self.draw_arrays_prevent_connect = false;
    }

    pub fn last_draw_arrays_range(&self) -> Option<(u32, u32)> {
        self.draw_arrays.last().copied()
    }

    pub fn clear_draw_arrays(&mut self) {
        self.draw_arrays.clear();
        self.draw_arrays_prevent_connect = false;
    }

    /// Append `count` consecutive indices starting at `start` to the
    /// element list. Used when converting an implicit range into explicit
    /// elements so following elements connect to the same primitive.
    pub fn append_elements_range(&mut self, start: u32, count: u32) {
        assert!((self.inline_elements.len() + count as usize) < MAX_BATCH_LENGTH);
        for i in 0..count {
            self.inline_elements.push(start + i);
        }
    }

    pub fn add_element16(&mut self, parameter: u32) {
        assert!(self.inline_elements.len() + 2 <= MAX_BATCH_LENGTH);
        self.inline_elements.push(parameter & 0xffff);
        self.inline_elements.push(parameter >> 16);
    }

    pub fn add_element32(&mut self, parameter: u32) {
        assert!(self.inline_elements.len() < MAX_BATCH_LENGTH);
        self.inline_elements.push(parameter);
    }

    pub fn add_inline_array_word(&mut self, parameter: u32) {
        assert!(self.inline_array.len() < MAX_BATCH_LENGTH);
        self.inline_array.push(parameter);
    }

    /// Store one component of an immediate-mode attribute value. Attribute
    /// 0 is positional; completing it closes the vertex.
    pub fn set_attr_component(&mut self, attr: usize, part: usize, value: f32) {
        self.attr_values[attr][part] = value;
    }

    pub fn set_attr_value(&mut self, attr: usize, value: [f32; 4]) {
        self.attr_values[attr] = value;
    }

    /// Close the current immediate-mode vertex: snapshot every attribute
    /// that has been touched this batch.
    pub fn finish_inline_vertex(&mut self) {
        for (attr, buf) in self.attr_buffers.iter_mut().enumerate() {
            // A list is live once it has an entry or this is attribute 0.
            if attr == 0 || !buf.is_empty() {
                buf.push(self.attr_values[attr]);
            }
        }
        self.inline_buffer_len += 1;
    }

    pub fn inline_buffer_len(&self) -> u32 {
        self.inline_buffer_len
    }

    /// Emit the accumulated batch as exactly one host draw call. The four
    /// forms are mutually exclusive by construction; an empty batch emits
    /// nothing.
    pub fn flush(
        &mut self,
        topology: Topology,
        vertex_stride_words: u32,
        vertex_cache: &mut VertexCache,
        backend: &mut dyn HostBackend,
        stats: &mut ProcessorStats,
    ) -> Result<Option<DrawCall>, KelvinError> {
        let call = match self.kind() {
            BatchKind::Empty => None,
            BatchKind::DrawArrays => {
                assert!(self.inline_elements.is_empty());
                assert_eq!(self.inline_buffer_len, 0);
                assert!(self.inline_array.is_empty());
                stats.draw_arrays_batches += 1;
                Some(DrawCall::MultiArrays {
                    topology,
                    ranges: self.draw_arrays.clone(),
                })
            }
            BatchKind::InlineElements => {
                assert_eq!(self.inline_buffer_len, 0);
                assert!(self.inline_array.is_empty());
                stats.inline_element_batches += 1;
                let buffer = vertex_cache.bind_elements(&self.inline_elements, backend, stats)?;
                Some(DrawCall::Elements {
                    topology,
                    buffer,
                    count: self.inline_elements.len() as u32,
                })
            }
            BatchKind::InlineBuffer => {
                assert!(self.inline_array.is_empty());
                stats.inline_buffer_batches += 1;
                Some(DrawCall::InlineBuffer {
                    topology,
                    vertex_count: self.inline_buffer_len,
                })
            }
            BatchKind::InlineArray => {
                stats.inline_array_batches += 1;
                let stride = vertex_stride_words.max(1);
                Some(DrawCall::InlineArray {
                    topology,
                    vertex_count: self.inline_array.len() as u32 / stride,
                })
            }
        };

        if let Some(call) = call.clone() {
            backend.draw(call)?;
        }
        self.reset();
        Ok(call)
    }
}
