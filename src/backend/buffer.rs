// Render buffers
//
// GPU buffers for vertex, index, uniform, staging, readback and storage use.
// Large shared buffers carry a byte-range freelist so many small uploads
// (geometry ranges, uniform regions) can live in one allocation.

use ash::vk;
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

use super::command::CommandBuffer;
use super::gpu::{GpuDevice, QueueRole};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    Vertex,
    Index,
    Uniform,
    Staging,
    Read,
    Storage,
}

impl BufferKind {
    pub fn usage(self) -> vk::BufferUsageFlags {
        let transfer = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
        match self {
            BufferKind::Vertex => vk::BufferUsageFlags::VERTEX_BUFFER | transfer,
            BufferKind::Index => vk::BufferUsageFlags::INDEX_BUFFER | transfer,
            BufferKind::Uniform => vk::BufferUsageFlags::UNIFORM_BUFFER | transfer,
            BufferKind::Staging => vk::BufferUsageFlags::TRANSFER_SRC,
            BufferKind::Read => vk::BufferUsageFlags::TRANSFER_DST,
            BufferKind::Storage => vk::BufferUsageFlags::STORAGE_BUFFER | transfer,
        }
    }

    /// Allocator placement. `CpuToGpu` picks device-local host-visible memory when it exists.
    pub fn memory_location(self) -> MemoryLocation {
        match self {
            BufferKind::Vertex | BufferKind::Index | BufferKind::Storage => MemoryLocation::GpuOnly,
            BufferKind::Uniform | BufferKind::Staging => MemoryLocation::CpuToGpu,
            BufferKind::Read => MemoryLocation::GpuToCpu,
        }
    }

    /// Whether the CPU can write or read the memory directly.
    pub fn host_visible(self) -> bool {
        matches!(
            self,
            BufferKind::Uniform | BufferKind::Staging | BufferKind::Read
        )
    }
}

/// First-fit allocator over a byte range. Free blocks stay sorted and coalesced.
#[derive(Debug, Clone)]
pub struct FreeList {
    total: u64,
    blocks: Vec<(u64, u64)>,
}

impl FreeList {
    pub fn new(total: u64) -> Self {
        Self {
            total,
            blocks: if total > 0 { vec![(0, total)] } else { Vec::new() },
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    pub fn free_space(&self) -> u64 {
        self.blocks.iter().map(|&(_, size)| size).sum()
    }

    /// Returns the offset of a `size`-byte range starting on a multiple of `align`.
    pub fn allocate(&mut self, size: u64, align: u64) -> Option<u64> {
        if size == 0 {
            return None;
        }
        let align = align.max(1);
        for i in 0..self.blocks.len() {
            let (offset, block_size) = self.blocks[i];
            let start = offset.div_ceil(align) * align;
            let padding = start - offset;
            if block_size < padding + size {
                continue;
            }

            let tail = block_size - padding - size;
            let mut replacement = Vec::with_capacity(2);
            if padding > 0 {
                replacement.push((offset, padding));
            }
            if tail > 0 {
                replacement.push((start + size, tail));
            }
            self.blocks.splice(i..=i, replacement);
            return Some(start);
        }
        None
    }

    pub fn free(&mut self, offset: u64, size: u64) -> Result<()> {
        if size == 0 || offset + size > self.total {
            return Err(Error::Buffer(format!(
                "range {}+{} outside of {} bytes",
                offset, size, self.total
            )));
        }
        let pos = self.blocks.partition_point(|&(start, _)| start < offset);
        let overlaps_prev = pos > 0 && {
            let (start, len) = self.blocks[pos - 1];
            start + len > offset
        };
        let overlaps_next = pos < self.blocks.len() && offset + size > self.blocks[pos].0;
        if overlaps_prev || overlaps_next {
            return Err(Error::Buffer(format!(
                "range {}+{} is already free",
                offset, size
            )));
        }

        self.blocks.insert(pos, (offset, size));
        // Merge with the following block, then with the preceding one
        if pos + 1 < self.blocks.len() && offset + size == self.blocks[pos + 1].0 {
            self.blocks[pos].1 += self.blocks[pos + 1].1;
            self.blocks.remove(pos + 1);
        }
        if pos > 0 {
            let (start, len) = self.blocks[pos - 1];
            if start + len == offset {
                self.blocks[pos - 1].1 += self.blocks[pos].1;
                self.blocks.remove(pos);
            }
        }
        Ok(())
    }

    /// Extends the managed range; the new tail becomes free.
    pub fn grow(&mut self, new_total: u64) {
        if new_total <= self.total {
            return;
        }
        let added = new_total - self.total;
        match self.blocks.last_mut() {
            Some((start, len)) if *start + *len == self.total => *len += added,
            _ => self.blocks.push((self.total, added)),
        }
        self.total = new_total;
    }
}

/// Records a buffer-to-buffer copy into a single-use command buffer and waits for it.
pub fn copy_buffer<D: GpuDevice>(
    device: &Arc<D>,
    src: &D::Buffer,
    src_offset: u64,
    dst: &D::Buffer,
    dst_offset: u64,
    size: u64,
) -> Result<()> {
    let cmd = CommandBuffer::allocate_and_begin_single_use(device.clone())?;
    device.cmd_copy_buffer(
        cmd.handle(),
        src,
        dst,
        vk::BufferCopy {
            src_offset,
            dst_offset,
            size,
        },
    );
    cmd.end_single_use(QueueRole::Graphics)
}

pub struct RenderBuffer<D: GpuDevice> {
    kind: BufferKind,
    size: u64,
    buffer: D::Buffer,
    freelist: Option<FreeList>,
    bound_offset: Option<u64>,
    device: Arc<D>,
}

impl<D: GpuDevice> RenderBuffer<D> {
    pub fn new(device: Arc<D>, kind: BufferKind, size: u64, use_freelist: bool) -> Result<Self> {
        if size == 0 {
            return Err(Error::Buffer(format!("{:?} buffer needs a non-zero size", kind)));
        }
        let buffer = device.create_buffer(kind, size)?;
        log::debug!("Created {:?} buffer: {} bytes", kind, size);
        Ok(Self {
            kind,
            size,
            buffer,
            freelist: use_freelist.then(|| FreeList::new(size)),
            bound_offset: None,
            device,
        })
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn raw(&self) -> &D::Buffer {
        &self.buffer
    }

    pub fn bound_offset(&self) -> Option<u64> {
        self.bound_offset
    }

    pub fn free_space(&self) -> Option<u64> {
        self.freelist.as_ref().map(FreeList::free_space)
    }

    fn check_range(&self, offset: u64, size: u64) -> Result<()> {
        if offset.checked_add(size).map_or(true, |end| end > self.size) {
            return Err(Error::Buffer(format!(
                "range {}+{} exceeds {:?} buffer of {} bytes",
                offset, size, self.kind, self.size
            )));
        }
        Ok(())
    }

    /// Binds a vertex or index buffer at `offset` on `cmd`.
    pub fn bind(&mut self, cmd: vk::CommandBuffer, offset: u64) -> Result<()> {
        match self.kind {
            BufferKind::Vertex => self.device.cmd_bind_vertex_buffer(cmd, &self.buffer, offset),
            BufferKind::Index => self.device.cmd_bind_index_buffer(cmd, &self.buffer, offset),
            other => {
                return Err(Error::Buffer(format!("{:?} buffers cannot be bound for drawing", other)))
            }
        }
        self.bound_offset = Some(offset);
        Ok(())
    }

    pub fn unbind(&mut self) {
        self.bound_offset = None;
    }

    /// Maps `offset..offset+size` for host access. Dropping the guard unmaps and flushes.
    pub fn map(&self, offset: u64, size: u64) -> Result<MappedRange<'_, D>> {
        if !self.device.is_host_visible(&self.buffer) {
            return Err(Error::Buffer(format!("{:?} buffer is not host visible", self.kind)));
        }
        self.check_range(offset, size)?;
        Ok(MappedRange {
            buffer: self,
            offset,
            size,
            flushed: false,
        })
    }

    pub fn flush(&self, offset: u64, size: u64) -> Result<()> {
        self.check_range(offset, size)?;
        self.device.flush_buffer(&self.buffer, offset, size)
    }

    /// Reads back into `out`, through a transient readback buffer when needed.
    pub fn read(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let size = out.len() as u64;
        self.check_range(offset, size)?;
        if self.device.is_host_visible(&self.buffer) {
            return self.device.read_buffer(&self.buffer, offset, out);
        }

        let readback = RenderBuffer::new(self.device.clone(), BufferKind::Read, size, false)?;
        copy_buffer(&self.device, &self.buffer, offset, &readback.buffer, 0, size)?;
        self.device.read_buffer(&readback.buffer, 0, out)
    }

    /// Grows the buffer, keeping its contents. Shrinking is rejected.
    pub fn resize(&mut self, new_size: u64) -> Result<()> {
        if new_size <= self.size {
            return Err(Error::Buffer(format!(
                "cannot resize {:?} buffer from {} to {} bytes",
                self.kind, self.size, new_size
            )));
        }

        let mut replacement = self.device.create_buffer(self.kind, new_size)?;
        if let Err(e) = copy_buffer(&self.device, &self.buffer, 0, &replacement, 0, self.size) {
            self.device.destroy_buffer(&mut replacement);
            return Err(e);
        }

        let mut old = std::mem::replace(&mut self.buffer, replacement);
        self.device.destroy_buffer(&mut old);
        if let Some(freelist) = self.freelist.as_mut() {
            freelist.grow(new_size);
        }
        log::debug!("Resized {:?} buffer: {} -> {} bytes", self.kind, self.size, new_size);
        self.size = new_size;
        self.bound_offset = None;
        Ok(())
    }

    /// Reserves `size` bytes from the freelist.
    pub fn allocate(&mut self, size: u64, align: u64) -> Result<u64> {
        let kind = self.kind;
        let freelist = self
            .freelist
            .as_mut()
            .ok_or_else(|| Error::Buffer(format!("{:?} buffer has no freelist", kind)))?;
        freelist.allocate(size, align).ok_or_else(|| {
            log::warn!("{:?} buffer has no room for {} bytes", kind, size);
            Error::Exhausted("render buffer space")
        })
    }

    pub fn free(&mut self, offset: u64, size: u64) -> Result<()> {
        match self.freelist.as_mut() {
            Some(freelist) => freelist.free(offset, size),
            None => Err(Error::Buffer(format!("{:?} buffer has no freelist", self.kind))),
        }
    }

    /// Uploads `data` at `offset`, staging it first when the memory is device-only.
    pub fn load_range(&self, offset: u64, data: &[u8]) -> Result<()> {
        let size = data.len() as u64;
        self.check_range(offset, size)?;
        if size == 0 {
            return Ok(());
        }
        if self.device.is_host_visible(&self.buffer) {
            self.device.write_buffer(&self.buffer, offset, data)?;
            return self.device.flush_buffer(&self.buffer, offset, size);
        }

        let staging = RenderBuffer::new(self.device.clone(), BufferKind::Staging, size, false)?;
        staging.load_range(0, data)?;
        copy_buffer(&self.device, &staging.buffer, 0, &self.buffer, offset, size)
    }

    /// Copies `size` bytes from this buffer into `dst`.
    pub fn copy_range(&self, src_offset: u64, dst: &RenderBuffer<D>, dst_offset: u64, size: u64) -> Result<()> {
        self.check_range(src_offset, size)?;
        dst.check_range(dst_offset, size)?;
        copy_buffer(&self.device, &self.buffer, src_offset, &dst.buffer, dst_offset, size)
    }

    /// Binds at `offset` and, unless `bind_only`, draws `element_count` elements.
    pub fn draw(
        &mut self,
        cmd: vk::CommandBuffer,
        offset: u64,
        element_count: u32,
        bind_only: bool,
    ) -> Result<()> {
        self.bind(cmd, offset)?;
        if bind_only {
            return Ok(());
        }
        match self.kind {
            BufferKind::Vertex => self.device.cmd_draw(cmd, element_count),
            _ => self.device.cmd_draw_indexed(cmd, element_count),
        }
        Ok(())
    }
}

impl<D: GpuDevice> Drop for RenderBuffer<D> {
    fn drop(&mut self) {
        self.device.destroy_buffer(&mut self.buffer);
    }
}

/// Host access to part of a mapped buffer.
pub struct MappedRange<'a, D: GpuDevice> {
    buffer: &'a RenderBuffer<D>,
    offset: u64,
    size: u64,
    flushed: bool,
}

impl<'a, D: GpuDevice> MappedRange<'a, D> {
    pub fn len(&self) -> u64 {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Writes at `at`, relative to the start of the mapping.
    pub fn write(&mut self, at: u64, data: &[u8]) -> Result<()> {
        if at + data.len() as u64 > self.size {
            return Err(Error::Buffer(format!(
                "write of {} bytes at {} exceeds mapping of {} bytes",
                data.len(),
                at,
                self.size
            )));
        }
        self.flushed = false;
        let device = &self.buffer.device;
        device.write_buffer(&self.buffer.buffer, self.offset + at, data)
    }

    pub fn read(&self, at: u64, out: &mut [u8]) -> Result<()> {
        if at + out.len() as u64 > self.size {
            return Err(Error::Buffer("read exceeds mapping".to_string()));
        }
        self.buffer
            .device
            .read_buffer(&self.buffer.buffer, self.offset + at, out)
    }

    /// Flushes and releases the mapping.
    pub fn unmap(mut self) -> Result<()> {
        self.flushed = true;
        self.buffer.flush(self.offset, self.size)
    }
}

impl<'a, D: GpuDevice> Drop for MappedRange<'a, D> {
    fn drop(&mut self) {
        if !self.flushed {
            if let Err(e) = self.buffer.flush(self.offset, self.size) {
                log::error!("Failed to flush mapped range on unmap: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fit_and_coalescing() {
        let mut list = FreeList::new(100);
        let a = list.allocate(30, 1).unwrap();
        let b = list.allocate(30, 1).unwrap();
        let c = list.allocate(30, 1).unwrap();
        assert_eq!((a, b, c), (0, 30, 60));
        assert_eq!(list.free_space(), 10);

        list.free(b, 30).unwrap();
        // 30-byte hole is reused before the 10-byte tail
        assert_eq!(list.allocate(20, 1), Some(30));
        list.free(30, 20).unwrap();
        list.free(a, 30).unwrap();
        list.free(c, 30).unwrap();
        assert_eq!(list.free_space(), 100);
        assert_eq!(list.allocate(100, 1), Some(0));
    }

    #[test]
    fn alignment_leaves_padding_free() {
        let mut list = FreeList::new(1024);
        assert_eq!(list.allocate(10, 1), Some(0));
        assert_eq!(list.allocate(64, 256), Some(256));
        // The padding between 10 and 256 is still usable
        assert_eq!(list.allocate(100, 4), Some(12));
    }

    #[test]
    fn double_free_and_out_of_range_are_rejected() {
        let mut list = FreeList::new(64);
        let offset = list.allocate(16, 1).unwrap();
        list.free(offset, 16).unwrap();
        assert!(list.free(offset, 16).is_err());
        assert!(list.free(60, 8).is_err());
        assert_eq!(list.allocate(65, 1), None);
    }

    #[test]
    fn grow_extends_tail() {
        let mut list = FreeList::new(32);
        list.allocate(32, 1).unwrap();
        list.grow(64);
        assert_eq!(list.allocate(32, 1), Some(32));
        assert_eq!(list.total(), 64);
    }

    #[test]
    fn kinds_map_to_memory() {
        assert_eq!(BufferKind::Vertex.memory_location(), MemoryLocation::GpuOnly);
        assert_eq!(BufferKind::Read.memory_location(), MemoryLocation::GpuToCpu);
        assert!(BufferKind::Uniform.host_visible());
        assert!(!BufferKind::Index.host_visible());
        assert!(BufferKind::Index.usage().contains(vk::BufferUsageFlags::INDEX_BUFFER));
    }
}
