//! Pooled vertex and index space handed out during prepare.
//!
//! Ops write into CPU staging blocks; each block is copied to its backend
//! buffer once, when the prepare phase ends.

use bytemuck::Pod;
use tracing::{debug, warn};

use crate::{error::AllocError, render_pass::Gpu};

/// What a pooled buffer holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    /// Vertex or instance data.
    Vertex,
    /// 16-bit indices.
    Index,
}

/// Backend handle of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferId(pub u32);

#[derive(Debug)]
struct Block {
    buffer: BufferId,
    capacity: usize,
    staging: Vec<u8>,
    uploaded: usize,
}

/// A region handed out by [`BufferPool::make_space`].
pub(crate) struct Space<'a> {
    pub(crate) buffer: BufferId,
    pub(crate) offset: usize,
    pub(crate) bytes: &'a mut [u8],
}

/// Sub-allocates element-aligned space from blocks of at least
/// `min_block_size` bytes.
#[derive(Debug)]
pub(crate) struct BufferPool {
    kind: BufferKind,
    min_block_size: usize,
    blocks: Vec<Block>,
}

impl BufferPool {
    pub(crate) fn new(kind: BufferKind, min_block_size: usize) -> Self {
        Self {
            kind,
            min_block_size,
            blocks: Vec::new(),
        }
    }

    /// Reserves `count` elements of `element_size` bytes.
    ///
    /// The returned offset is a multiple of `element_size`, so it converts to
    /// a whole base vertex or base index.
    pub(crate) fn make_space(
        &mut self,
        gpu: &mut dyn Gpu,
        element_size: usize,
        count: usize,
    ) -> Result<Space<'_>, AllocError> {
        let invalid = AllocError::InvalidRequest {
            kind: self.kind,
            element_size,
            count,
        };
        if element_size == 0 || count == 0 {
            return Err(invalid);
        }
        let size = element_size.checked_mul(count).ok_or(invalid)?;

        let fits = self.blocks.last().is_some_and(|block| {
            let used = block.staging.len();
            let pad = (element_size - used % element_size) % element_size;
            used + pad + size <= block.capacity
        });
        if !fits {
            let capacity = size.max(self.min_block_size);
            let Some(buffer) = gpu.create_buffer(self.kind, capacity) else {
                warn!("Failed to create {:?} block of {} bytes", self.kind, capacity);
                return Err(AllocError::BufferCreation {
                    kind: self.kind,
                    size: capacity,
                });
            };
            debug!("New {:?} block {:?} of {} bytes", self.kind, buffer, capacity);
            self.blocks.push(Block {
                buffer,
                capacity,
                staging: Vec::with_capacity(capacity),
                uploaded: 0,
            });
        }

        let Some(block) = self.blocks.last_mut() else {
            return Err(AllocError::BufferCreation {
                kind: self.kind,
                size,
            });
        };
        let used = block.staging.len();
        let offset = used.next_multiple_of(element_size);
        block.staging.resize(offset + size, 0);
        Ok(Space {
            buffer: block.buffer,
            offset,
            bytes: &mut block.staging[offset..],
        })
    }

    /// Copies every staged byte not yet uploaded to its backend buffer.
    pub(crate) fn unmap(&mut self, gpu: &mut dyn Gpu) {
        for block in &mut self.blocks {
            if block.uploaded < block.staging.len() {
                gpu.write_buffer(
                    block.buffer,
                    block.uploaded,
                    &block.staging[block.uploaded..],
                );
                block.uploaded = block.staging.len();
            }
        }
    }

    /// Releases every block.
    pub(crate) fn reset(&mut self) {
        self.blocks.clear();
    }

    #[cfg(test)]
    pub(crate) fn block_count(&self) -> usize {
        self.blocks.len()
    }
}

/// Writable vertex space returned by
/// [`FlushState::make_vertex_space`](crate::FlushState::make_vertex_space).
pub struct VertexSpace<'a> {
    /// Buffer the vertices live in.
    pub buffer: BufferId,
    /// Index of the first vertex within the buffer.
    pub base_vertex: u32,
    bytes: &'a mut [u8],
}

impl<'a> VertexSpace<'a> {
    pub(crate) fn new(buffer: BufferId, base_vertex: u32, bytes: &'a mut [u8]) -> Self {
        Self {
            buffer,
            base_vertex,
            bytes,
        }
    }

    /// The raw bytes.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut *self.bytes
    }

    /// Copies `vertices` to the start of the space.
    ///
    /// Writing more than was reserved is a bug in the op; release builds
    /// truncate to the reservation.
    pub fn write<T: Pod>(&mut self, vertices: &[T]) {
        copy_into(self.bytes, bytemuck::cast_slice(vertices));
    }
}

/// Writable index space returned by
/// [`FlushState::make_index_space`](crate::FlushState::make_index_space).
pub struct IndexSpace<'a> {
    /// Buffer the indices live in.
    pub buffer: BufferId,
    /// Index of the first index within the buffer.
    pub base_index: u32,
    bytes: &'a mut [u8],
}

impl<'a> IndexSpace<'a> {
    pub(crate) fn new(buffer: BufferId, base_index: u32, bytes: &'a mut [u8]) -> Self {
        Self {
            buffer,
            base_index,
            bytes,
        }
    }

    /// Copies `indices` to the start of the space.
    ///
    /// Writing more than was reserved is a bug in the op; release builds
    /// truncate to the reservation.
    pub fn write(&mut self, indices: &[u16]) {
        copy_into(self.bytes, bytemuck::cast_slice(indices));
    }
}

fn copy_into(dst: &mut [u8], src: &[u8]) {
    debug_assert!(
        src.len() <= dst.len(),
        "wrote {} bytes into a {} byte reservation",
        src.len(),
        dst.len()
    );
    if src.len() > dst.len() {
        warn!(
            written = src.len(),
            reserved = dst.len(),
            "Write exceeds reserved space, truncating"
        );
    }
    let len = dst.len().min(src.len());
    dst[..len].copy_from_slice(&src[..len]);
}
