// Geometry registry
//
// Vertex and index data for every uploaded geometry lives in two shared
// device-local buffers. Each geometry owns one byte range in each and is
// addressed through a generational handle.

use ash::vk;
use std::sync::Arc;

use super::buffer::{BufferKind, RenderBuffer};
use super::gpu::GpuDevice;
use crate::error::{Error, Result};
use crate::slot::{Handle, SlotTable};

/// Index element size; indices are always 32-bit.
const INDEX_SIZE: u32 = std::mem::size_of::<u32>() as u32;
const RANGE_ALIGNMENT: u64 = 4;

/// A byte range in one of the shared buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryRange {
    pub offset: u64,
    pub element_count: u32,
    pub element_size: u32,
}

impl GeometryRange {
    pub fn size(&self) -> u64 {
        self.element_count as u64 * self.element_size as u64
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub vertices: GeometryRange,
    pub indices: Option<GeometryRange>,
}

pub type GeometryHandle = Handle<Geometry>;

pub struct GeometryRegistry<D: GpuDevice> {
    table: SlotTable<Geometry>,
    vertex_buffer: RenderBuffer<D>,
    index_buffer: RenderBuffer<D>,
}

impl<D: GpuDevice> GeometryRegistry<D> {
    pub fn new(device: Arc<D>, vertex_bytes: u64, index_bytes: u64, capacity: usize) -> Result<Self> {
        let vertex_buffer = RenderBuffer::new(device.clone(), BufferKind::Vertex, vertex_bytes, true)?;
        let index_buffer = RenderBuffer::new(device, BufferKind::Index, index_bytes, true)?;
        Ok(Self {
            table: SlotTable::with_capacity(capacity),
            vertex_buffer,
            index_buffer,
        })
    }

    pub fn get(&self, handle: GeometryHandle) -> Option<&Geometry> {
        self.table.get(handle)
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn vertex_buffer(&self) -> &RenderBuffer<D> {
        &self.vertex_buffer
    }

    pub fn index_buffer(&self) -> &RenderBuffer<D> {
        &self.index_buffer
    }

    pub fn iter(&self) -> impl Iterator<Item = (GeometryHandle, &Geometry)> {
        self.table.iter()
    }

    /// Uploads a new geometry. `vertices` holds `vertex_size`-byte elements.
    pub fn create(&mut self, vertex_size: u32, vertices: &[u8], indices: &[u32]) -> Result<GeometryHandle> {
        let geometry = self.upload(vertex_size, vertices, indices)?;
        match self.table.insert(geometry) {
            Ok(handle) => {
                log::debug!(
                    "Created geometry {:?}: {} vertices, {} indices",
                    handle,
                    geometry.vertices.element_count,
                    indices.len()
                );
                Ok(handle)
            }
            Err(geometry) => {
                self.release_ranges(&geometry);
                Err(Error::Exhausted("geometry table"))
            }
        }
    }

    /// Re-uploads into an existing slot. The old ranges are freed only once
    /// the new data is loaded; on failure the slot keeps its old data.
    pub fn update(
        &mut self,
        handle: GeometryHandle,
        vertex_size: u32,
        vertices: &[u8],
        indices: &[u32],
    ) -> Result<GeometryHandle> {
        let old = *self
            .table
            .get(handle)
            .ok_or_else(|| Error::InvalidHandle(format!("geometry {:?}", handle)))?;

        let fresh = self.upload(vertex_size, vertices, indices)?;
        self.release_ranges(&old);

        let new_handle = self
            .table
            .bump(handle)
            .ok_or_else(|| Error::InvalidHandle(format!("geometry {:?}", handle)))?;
        if let Some(slot) = self.table.get_mut(new_handle) {
            *slot = fresh;
        }
        log::debug!("Re-uploaded geometry {:?} -> {:?}", handle, new_handle);
        Ok(new_handle)
    }

    /// Frees the geometry's ranges. Unknown or stale handles are ignored with a warning.
    pub fn destroy(&mut self, handle: GeometryHandle) -> bool {
        match self.table.remove(handle) {
            Some(geometry) => {
                self.release_ranges(&geometry);
                log::debug!("Destroyed geometry {:?}", handle);
                true
            }
            None => {
                log::warn!("destroy_geometry called with stale handle {:?}", handle);
                false
            }
        }
    }

    /// Records the draw for `handle`. Unknown or stale handles are a warning and a no-op.
    pub fn draw(&mut self, cmd: vk::CommandBuffer, handle: GeometryHandle) -> Result<()> {
        let Some(geometry) = self.table.get(handle).copied() else {
            log::warn!("draw_geometry called with stale handle {:?}", handle);
            return Ok(());
        };

        let indexed = geometry.indices.is_some();
        self.vertex_buffer.draw(
            cmd,
            geometry.vertices.offset,
            geometry.vertices.element_count,
            indexed,
        )?;
        if let Some(indices) = geometry.indices {
            self.index_buffer
                .draw(cmd, indices.offset, indices.element_count, false)?;
        }
        Ok(())
    }

    fn upload(&mut self, vertex_size: u32, vertices: &[u8], indices: &[u32]) -> Result<Geometry> {
        if vertex_size == 0 || vertices.is_empty() || vertices.len() % vertex_size as usize != 0 {
            return Err(Error::Buffer(format!(
                "vertex data of {} bytes is not a whole number of {}-byte vertices",
                vertices.len(),
                vertex_size
            )));
        }

        let vertex_range = GeometryRange {
            offset: self
                .vertex_buffer
                .allocate(vertices.len() as u64, RANGE_ALIGNMENT)?,
            element_count: (vertices.len() / vertex_size as usize) as u32,
            element_size: vertex_size,
        };
        if let Err(e) = self.vertex_buffer.load_range(vertex_range.offset, vertices) {
            self.free_range(BufferKind::Vertex, &vertex_range);
            return Err(e);
        }

        let index_range = if indices.is_empty() {
            None
        } else {
            let bytes: &[u8] = bytemuck::cast_slice(indices);
            let offset = match self.index_buffer.allocate(bytes.len() as u64, RANGE_ALIGNMENT) {
                Ok(offset) => offset,
                Err(e) => {
                    self.free_range(BufferKind::Vertex, &vertex_range);
                    return Err(e);
                }
            };
            let range = GeometryRange {
                offset,
                element_count: indices.len() as u32,
                element_size: INDEX_SIZE,
            };
            if let Err(e) = self.index_buffer.load_range(offset, bytes) {
                self.free_range(BufferKind::Vertex, &vertex_range);
                self.free_range(BufferKind::Index, &range);
                return Err(e);
            }
            Some(range)
        };

        Ok(Geometry {
            vertices: vertex_range,
            indices: index_range,
        })
    }

    fn release_ranges(&mut self, geometry: &Geometry) {
        self.free_range(BufferKind::Vertex, &geometry.vertices);
        if let Some(indices) = &geometry.indices {
            self.free_range(BufferKind::Index, indices);
        }
    }

    fn free_range(&mut self, kind: BufferKind, range: &GeometryRange) {
        let buffer = match kind {
            BufferKind::Index => &mut self.index_buffer,
            _ => &mut self.vertex_buffer,
        };
        if let Err(e) = buffer.free(range.offset, range.size()) {
            log::error!("Failed to free {:?} range {:?}: {}", kind, range, e);
        }
    }
}
