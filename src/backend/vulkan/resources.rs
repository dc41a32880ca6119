// Vulkan buffer and image payloads

use ash::vk;
use gpu_allocator::vulkan::Allocation;

use crate::backend::buffer::BufferKind;
use crate::backend::gpu::ImageDesc;

/// A buffer with its allocator-owned memory. `allocation` is `None` once destroyed.
pub struct VulkanBuffer {
    pub(super) handle: vk::Buffer,
    pub(super) allocation: Option<Allocation>,
    pub(super) kind: BufferKind,
    pub(super) size: u64,
}

impl VulkanBuffer {
    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Mapped host pointer range `[offset, offset + len)`, if the memory is mapped and the range fits.
    pub(super) fn mapped_range(&self, offset: u64, len: usize) -> Option<*mut u8> {
        let allocation = self.allocation.as_ref()?;
        let base = allocation.mapped_ptr()?;
        let end = offset.checked_add(len as u64)?;
        if end > self.size {
            return None;
        }
        // SAFETY: `end <= size` keeps the pointer inside the mapping
        Some(unsafe { base.as_ptr().cast::<u8>().add(offset as usize) })
    }
}

/// A 2D image, its default view and its memory.
pub struct VulkanImage {
    pub(super) handle: vk::Image,
    pub(super) view: vk::ImageView,
    pub(super) allocation: Option<Allocation>,
    pub(super) desc: ImageDesc,
}

impl VulkanImage {
    pub fn handle(&self) -> vk::Image {
        self.handle
    }

    pub fn desc(&self) -> &ImageDesc {
        &self.desc
    }
}
