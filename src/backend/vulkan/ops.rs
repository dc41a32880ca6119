// GpuDevice for VulkanDevice
//
// Each native call takes the lock pool mutex of its object category; queue
// operations take only their family's mutex. Locks are never nested.

use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::io::Cursor;

use super::resources::{VulkanBuffer, VulkanImage};
use super::{pipeline, VulkanDevice};
use crate::backend::buffer::BufferKind;
use crate::backend::gpu::{
    AcquireOutcome, DescriptorWrite, DeviceInfo, GpuDevice, ImageDesc, LayoutBinding, PipelineDesc,
    PresentOutcome, QueueRole, RenderPassDesc, SamplerDesc, Submission, SurfaceSupport, SwapchainDesc,
};
use crate::error::{vk_err, Error, Result};
use crate::lock_pool::LockGroup;

/// Descriptor infos gathered before the write structs that point at them.
struct PendingWrite {
    set: vk::DescriptorSet,
    binding: u32,
    descriptor_type: vk::DescriptorType,
    buffers: Vec<vk::DescriptorBufferInfo>,
    images: Vec<vk::DescriptorImageInfo>,
}

/// Access masks and stages for the layout transitions textures go through.
fn transition_masks(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Option<(vk::AccessFlags, vk::AccessFlags, vk::PipelineStageFlags, vk::PipelineStageFlags)> {
    use vk::ImageLayout as L;
    match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => Some((
            vk::AccessFlags::empty(),
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
        )),
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => Some((
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        )),
        (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_DST_OPTIMAL) => Some((
            vk::AccessFlags::SHADER_READ,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::PipelineStageFlags::TRANSFER,
        )),
        (L::UNDEFINED, L::SHADER_READ_ONLY_OPTIMAL) => Some((
            vk::AccessFlags::empty(),
            vk::AccessFlags::SHADER_READ,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
        )),
        _ => None,
    }
}

impl GpuDevice for VulkanDevice {
    type Buffer = VulkanBuffer;
    type Image = VulkanImage;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn wait_idle(&self) -> Result<()> {
        // Waiting on the device synchronizes with every queue
        self.locks
            .with(LockGroup::Device, || {
                self.locks
                    .with_all_queues(|| unsafe { self.device.device_wait_idle() })
            })
            .map_err(vk_err("vkDeviceWaitIdle"))
    }

    // --- Swapchain -----------------------------------------------------------

    fn surface_support(&self) -> Result<SurfaceSupport> {
        self.locks.with(LockGroup::Swapchain, || unsafe {
            let capabilities = self
                .surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)
                .map_err(vk_err("vkGetPhysicalDeviceSurfaceCapabilitiesKHR"))?;
            let formats = self
                .surface_loader
                .get_physical_device_surface_formats(self.physical_device, self.surface)
                .map_err(vk_err("vkGetPhysicalDeviceSurfaceFormatsKHR"))?;
            let present_modes = self
                .surface_loader
                .get_physical_device_surface_present_modes(self.physical_device, self.surface)
                .map_err(vk_err("vkGetPhysicalDeviceSurfacePresentModesKHR"))?;
            Ok(SurfaceSupport {
                capabilities,
                formats,
                present_modes,
            })
        })
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<(vk::SwapchainKHR, Vec<vk::Image>)> {
        let families = self.info.queue_families;
        let indices = [families.graphics, families.present];

        let mut info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.surface)
            .min_image_count(desc.image_count)
            .image_format(desc.format.format)
            .image_color_space(desc.format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(desc.transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(vk::SwapchainKHR::null());
        info = if families.graphics != families.present {
            info.image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&indices)
        } else {
            info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        self.locks.with(LockGroup::Swapchain, || unsafe {
            let swapchain = self
                .swapchain_loader
                .create_swapchain(&info, None)
                .map_err(vk_err("vkCreateSwapchainKHR"))?;
            match self.swapchain_loader.get_swapchain_images(swapchain) {
                Ok(images) => Ok((swapchain, images)),
                Err(code) => {
                    self.swapchain_loader.destroy_swapchain(swapchain, None);
                    Err(Error::vulkan("vkGetSwapchainImagesKHR", code))
                }
            }
        })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.locks.with(LockGroup::Swapchain, || unsafe {
            self.swapchain_loader.destroy_swapchain(swapchain, None)
        });
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<AcquireOutcome> {
        let result = self.locks.with(LockGroup::Swapchain, || unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout_ns, semaphore, fence)
        });
        match result {
            Ok((index, suboptimal)) => Ok(AcquireOutcome::Acquired { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(code) => Err(Error::vulkan("vkAcquireNextImageKHR", code)),
        }
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        let wait_semaphores = [wait];
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = self.locks.with_queue(self.info.queue_families.present, || unsafe {
            self.swapchain_loader.queue_present(self.present_queue, &info)
        })?;
        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) | Err(vk::Result::SUBOPTIMAL_KHR) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(code) => Err(Error::vulkan("vkQueuePresentKHR", code)),
        }
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        self.locks
            .with(LockGroup::Image, || unsafe { self.device.create_image_view(&info, None) })
            .map_err(vk_err("vkCreateImageView"))
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.locks
            .with(LockGroup::Image, || unsafe { self.device.destroy_image_view(view, None) });
    }

    // --- Synchronization -----------------------------------------------------

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        self.locks
            .with(LockGroup::Synchronization, || unsafe { self.device.create_fence(&info, None) })
            .map_err(vk_err("vkCreateFence"))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.locks
            .with(LockGroup::Synchronization, || unsafe { self.device.destroy_fence(fence, None) });
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool> {
        // Waiting needs no external synchronization and may block for long
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(code) => Err(Error::vulkan("vkWaitForFences", code)),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        self.locks
            .with(LockGroup::Synchronization, || unsafe { self.device.reset_fences(&[fence]) })
            .map_err(vk_err("vkResetFences"))
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::builder();
        self.locks
            .with(LockGroup::Synchronization, || unsafe { self.device.create_semaphore(&info, None) })
            .map_err(vk_err("vkCreateSemaphore"))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.locks.with(LockGroup::Synchronization, || unsafe {
            self.device.destroy_semaphore(semaphore, None)
        });
    }

    // --- Command buffers and queues -------------------------------------------

    fn allocate_command_buffer(&self, primary: bool) -> Result<vk::CommandBuffer> {
        let level = if primary {
            vk::CommandBufferLevel::PRIMARY
        } else {
            vk::CommandBufferLevel::SECONDARY
        };
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(level)
            .command_buffer_count(1);
        let buffers = self
            .locks
            .with(LockGroup::CommandBuffer, || unsafe { self.device.allocate_command_buffers(&info) })
            .map_err(vk_err("vkAllocateCommandBuffers"))?;
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| Error::InvalidState("command buffer allocation returned nothing".to_string()))
    }

    fn free_command_buffer(&self, cmd: vk::CommandBuffer) {
        self.locks.with(LockGroup::CommandBuffer, || unsafe {
            self.device.free_command_buffers(self.command_pool, &[cmd])
        });
    }

    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, flags: vk::CommandBufferUsageFlags) -> Result<()> {
        let info = vk::CommandBufferBeginInfo::builder().flags(flags);
        self.locks
            .with(LockGroup::CommandBuffer, || unsafe { self.device.begin_command_buffer(cmd, &info) })
            .map_err(vk_err("vkBeginCommandBuffer"))
    }

    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.locks
            .with(LockGroup::CommandBuffer, || unsafe { self.device.end_command_buffer(cmd) })
            .map_err(vk_err("vkEndCommandBuffer"))
    }

    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.locks
            .with(LockGroup::CommandBuffer, || unsafe {
                self.device
                    .reset_command_buffer(cmd, vk::CommandBufferResetFlags::empty())
            })
            .map_err(vk_err("vkResetCommandBuffer"))
    }

    fn queue_submit(&self, queue: QueueRole, submission: &Submission) -> Result<()> {
        let wait_semaphores: Vec<vk::Semaphore> = submission.wait.iter().map(|(s, _)| *s).collect();
        let wait_stages: Vec<vk::PipelineStageFlags> = submission.wait.iter().map(|(_, st)| *st).collect();
        let signal_semaphores: Vec<vk::Semaphore> = submission.signal.into_iter().collect();
        let command_buffers = [submission.command_buffer];
        let info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .build();
        let fence = submission.fence.unwrap_or_else(vk::Fence::null);

        let family = self.info.queue_families.family(queue);
        let handle = self.queue(queue);
        self.locks
            .with_queue(family, || unsafe { self.device.queue_submit(handle, &[info], fence) })?
            .map_err(vk_err("vkQueueSubmit"))
    }

    fn queue_wait_idle(&self, queue: QueueRole) -> Result<()> {
        let family = self.info.queue_families.family(queue);
        let handle = self.queue(queue);
        self.locks
            .with_queue(family, || unsafe { self.device.queue_wait_idle(handle) })?
            .map_err(vk_err("vkQueueWaitIdle"))
    }

    // --- Recording -----------------------------------------------------------

    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewport: vk::Viewport) {
        self.locks.with(LockGroup::CommandBuffer, || unsafe {
            self.device.cmd_set_viewport(cmd, 0, &[viewport])
        });
    }

    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissor: vk::Rect2D) {
        self.locks.with(LockGroup::CommandBuffer, || unsafe {
            self.device.cmd_set_scissor(cmd, 0, &[scissor])
        });
    }

    fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    ) {
        let info = vk::RenderPassBeginInfo::builder()
            .render_pass(pass)
            .framebuffer(framebuffer)
            .render_area(area)
            .clear_values(clear_values);
        self.locks.with(LockGroup::CommandBuffer, || unsafe {
            self.device
                .cmd_begin_render_pass(cmd, &info, vk::SubpassContents::INLINE)
        });
    }

    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer) {
        self.locks
            .with(LockGroup::CommandBuffer, || unsafe { self.device.cmd_end_render_pass(cmd) });
    }

    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline) {
        self.locks.with(LockGroup::CommandBuffer, || unsafe {
            self.device
                .cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, pipeline)
        });
    }

    fn cmd_bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        set_index: u32,
        set: vk::DescriptorSet,
    ) {
        self.locks.with(LockGroup::CommandBuffer, || unsafe {
            self.device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                set_index,
                &[set],
                &[],
            )
        });
    }

    fn cmd_push_constants(&self, cmd: vk::CommandBuffer, layout: vk::PipelineLayout, offset: u32, data: &[u8]) {
        self.locks.with(LockGroup::CommandBuffer, || unsafe {
            self.device.cmd_push_constants(
                cmd,
                layout,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                offset,
                data,
            )
        });
    }

    fn cmd_bind_vertex_buffer(&self, cmd: vk::CommandBuffer, buffer: &VulkanBuffer, offset: u64) {
        self.locks.with(LockGroup::CommandBuffer, || unsafe {
            self.device
                .cmd_bind_vertex_buffers(cmd, 0, &[buffer.handle], &[offset])
        });
    }

    fn cmd_bind_index_buffer(&self, cmd: vk::CommandBuffer, buffer: &VulkanBuffer, offset: u64) {
        self.locks.with(LockGroup::CommandBuffer, || unsafe {
            self.device
                .cmd_bind_index_buffer(cmd, buffer.handle, offset, vk::IndexType::UINT32)
        });
    }

    fn cmd_draw(&self, cmd: vk::CommandBuffer, vertex_count: u32) {
        self.locks.with(LockGroup::CommandBuffer, || unsafe {
            self.device.cmd_draw(cmd, vertex_count, 1, 0, 0)
        });
    }

    fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, index_count: u32) {
        self.locks.with(LockGroup::CommandBuffer, || unsafe {
            self.device.cmd_draw_indexed(cmd, index_count, 1, 0, 0, 0)
        });
    }

    fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: &VulkanBuffer, dst: &VulkanBuffer, region: vk::BufferCopy) {
        self.locks.with(LockGroup::CommandBuffer, || unsafe {
            self.device
                .cmd_copy_buffer(cmd, src.handle, dst.handle, &[region])
        });
    }

    fn cmd_transition_image(
        &self,
        cmd: vk::CommandBuffer,
        image: &VulkanImage,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) -> Result<()> {
        let (src_access, dst_access, src_stage, dst_stage) = transition_masks(old, new)
            .ok_or_else(|| Error::InvalidState(format!("unsupported layout transition {:?} -> {:?}", old, new)))?;

        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old)
            .new_layout(new)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image.handle)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: image.desc.aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            })
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .build();

        self.locks.with(LockGroup::CommandBuffer, || unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            )
        });
        Ok(())
    }

    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: &VulkanBuffer,
        dst: &VulkanImage,
        width: u32,
        height: u32,
    ) {
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: 0,
            buffer_image_height: 0,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            },
            image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
            image_extent: vk::Extent3D {
                width,
                height,
                depth: 1,
            },
        };
        self.locks.with(LockGroup::CommandBuffer, || unsafe {
            self.device.cmd_copy_buffer_to_image(
                cmd,
                src.handle,
                dst.handle,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            )
        });
    }

    // --- Buffers -------------------------------------------------------------

    fn create_buffer(&self, kind: BufferKind, size: u64) -> Result<VulkanBuffer> {
        let info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(kind.usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let handle = self
            .locks
            .with(LockGroup::Buffer, || unsafe { self.device.create_buffer(&info, None) })
            .map_err(vk_err("vkCreateBuffer"))?;
        let requirements = unsafe { self.device.get_buffer_memory_requirements(handle) };

        let name = format!("{:?} buffer", kind);
        let allocation = self.locks.with(LockGroup::Memory, || {
            self.allocator.lock().allocate(&AllocationCreateDesc {
                name: &name,
                requirements,
                location: kind.memory_location(),
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                self.locks
                    .with(LockGroup::Buffer, || unsafe { self.device.destroy_buffer(handle, None) });
                return Err(e.into());
            }
        };

        let bound = self.locks.with(LockGroup::Buffer, || unsafe {
            self.device
                .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
        });
        if let Err(code) = bound {
            self.locks.with(LockGroup::Memory, || self.allocator.lock().free(allocation))?;
            self.locks
                .with(LockGroup::Buffer, || unsafe { self.device.destroy_buffer(handle, None) });
            return Err(Error::vulkan("vkBindBufferMemory", code));
        }

        log::debug!("Created {:?} buffer of {} bytes", kind, size);
        Ok(VulkanBuffer {
            handle,
            allocation: Some(allocation),
            kind,
            size,
        })
    }

    fn destroy_buffer(&self, buffer: &mut VulkanBuffer) {
        if let Some(allocation) = buffer.allocation.take() {
            if let Err(e) = self.locks.with(LockGroup::Memory, || self.allocator.lock().free(allocation)) {
                log::warn!("Failed to free buffer memory: {}", e);
            }
        }
        if buffer.handle != vk::Buffer::null() {
            let handle = buffer.handle;
            self.locks
                .with(LockGroup::Buffer, || unsafe { self.device.destroy_buffer(handle, None) });
            buffer.handle = vk::Buffer::null();
        }
    }

    fn is_host_visible(&self, buffer: &VulkanBuffer) -> bool {
        buffer
            .allocation
            .as_ref()
            .is_some_and(|allocation| allocation.mapped_ptr().is_some())
    }

    fn write_buffer(&self, buffer: &VulkanBuffer, offset: u64, data: &[u8]) -> Result<()> {
        let dst = buffer.mapped_range(offset, data.len()).ok_or_else(|| {
            Error::Buffer(format!(
                "write of {} bytes at {} outside mapped {:?} buffer",
                data.len(),
                offset,
                buffer.kind
            ))
        })?;
        // SAFETY: `mapped_range` checked the destination lies inside the mapping
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len()) };
        Ok(())
    }

    fn read_buffer(&self, buffer: &VulkanBuffer, offset: u64, out: &mut [u8]) -> Result<()> {
        let src = buffer.mapped_range(offset, out.len()).ok_or_else(|| {
            Error::Buffer(format!(
                "read of {} bytes at {} outside mapped {:?} buffer",
                out.len(),
                offset,
                buffer.kind
            ))
        })?;
        // SAFETY: as above
        unsafe { std::ptr::copy_nonoverlapping(src as *const u8, out.as_mut_ptr(), out.len()) };
        Ok(())
    }

    fn flush_buffer(&self, buffer: &VulkanBuffer, offset: u64, size: u64) -> Result<()> {
        let Some(allocation) = buffer.allocation.as_ref() else {
            return Err(Error::Buffer("flush of a destroyed buffer".to_string()));
        };
        if offset.saturating_add(size) > buffer.size {
            return Err(Error::Buffer(format!(
                "flush range {}+{} exceeds buffer size {}",
                offset, size, buffer.size
            )));
        }
        // Ranges must be aligned to the non-coherent atom size
        let atom = self.properties.limits.non_coherent_atom_size.max(1);
        let start = (allocation.offset() + offset) / atom * atom;
        let memory = unsafe { allocation.memory() };
        let range = vk::MappedMemoryRange::builder()
            .memory(memory)
            .offset(start)
            .size(vk::WHOLE_SIZE)
            .build();
        self.locks
            .with(LockGroup::Memory, || unsafe { self.device.flush_mapped_memory_ranges(&[range]) })
            .map_err(vk_err("vkFlushMappedMemoryRanges"))
    }

    // --- Images and samplers --------------------------------------------------

    fn create_image(&self, desc: &ImageDesc) -> Result<VulkanImage> {
        let info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let handle = self
            .locks
            .with(LockGroup::Image, || unsafe { self.device.create_image(&info, None) })
            .map_err(vk_err("vkCreateImage"))?;
        let requirements = unsafe { self.device.get_image_memory_requirements(handle) };

        let allocation = self.locks.with(LockGroup::Memory, || {
            self.allocator.lock().allocate(&AllocationCreateDesc {
                name: "image",
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
        });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                self.locks
                    .with(LockGroup::Image, || unsafe { self.device.destroy_image(handle, None) });
                return Err(e.into());
            }
        };

        let mut image = VulkanImage {
            handle,
            view: vk::ImageView::null(),
            allocation: Some(allocation),
            desc: *desc,
        };

        let bound = self.locks.with(LockGroup::Image, || unsafe {
            let allocation = image.allocation.as_ref().map(|a| (a.memory(), a.offset()));
            match allocation {
                Some((memory, offset)) => self.device.bind_image_memory(handle, memory, offset),
                None => Ok(()),
            }
        });
        let view = match bound {
            Ok(()) => self.create_image_view(handle, desc.format, desc.aspect),
            Err(code) => Err(Error::vulkan("vkBindImageMemory", code)),
        };
        match view {
            Ok(view) => {
                image.view = view;
                Ok(image)
            }
            Err(e) => {
                self.destroy_image(&mut image);
                Err(e)
            }
        }
    }

    fn destroy_image(&self, image: &mut VulkanImage) {
        if image.view != vk::ImageView::null() {
            self.destroy_image_view(image.view);
            image.view = vk::ImageView::null();
        }
        if let Some(allocation) = image.allocation.take() {
            if let Err(e) = self.locks.with(LockGroup::Memory, || self.allocator.lock().free(allocation)) {
                log::warn!("Failed to free image memory: {}", e);
            }
        }
        if image.handle != vk::Image::null() {
            let handle = image.handle;
            self.locks
                .with(LockGroup::Image, || unsafe { self.device.destroy_image(handle, None) });
            image.handle = vk::Image::null();
        }
    }

    fn image_view(&self, image: &VulkanImage) -> vk::ImageView {
        image.view
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler> {
        let info = vk::SamplerCreateInfo::builder()
            .mag_filter(desc.mag_filter)
            .min_filter(desc.min_filter)
            .address_mode_u(desc.address_u)
            .address_mode_v(desc.address_v)
            .address_mode_w(desc.address_w)
            .anisotropy_enable(desc.max_anisotropy.is_some())
            .max_anisotropy(desc.max_anisotropy.unwrap_or(1.0))
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .compare_op(vk::CompareOp::ALWAYS)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .mip_lod_bias(0.0)
            .min_lod(0.0)
            .max_lod(0.0);
        self.locks
            .with(LockGroup::Sampler, || unsafe { self.device.create_sampler(&info, None) })
            .map_err(vk_err("vkCreateSampler"))
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.locks
            .with(LockGroup::Sampler, || unsafe { self.device.destroy_sampler(sampler, None) });
    }

    // --- Passes, pipelines, descriptors ---------------------------------------

    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<vk::RenderPass> {
        self.locks
            .with(LockGroup::RenderPass, || pipeline::create_render_pass(&self.device, desc))
    }

    fn destroy_render_pass(&self, pass: vk::RenderPass) {
        self.locks
            .with(LockGroup::RenderPass, || unsafe { self.device.destroy_render_pass(pass, None) });
    }

    fn create_framebuffer(
        &self,
        pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        self.locks.with(LockGroup::RenderPass, || {
            pipeline::create_framebuffer(&self.device, pass, attachments, extent)
        })
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.locks.with(LockGroup::RenderPass, || unsafe {
            self.device.destroy_framebuffer(framebuffer, None)
        });
    }

    fn create_shader_module(&self, code: &[u8]) -> Result<vk::ShaderModule> {
        let words = ash::util::read_spv(&mut Cursor::new(code))
            .map_err(|e| Error::Shader(format!("invalid SPIR-V: {}", e)))?;
        let info = vk::ShaderModuleCreateInfo::builder().code(&words);
        self.locks
            .with(LockGroup::Shader, || unsafe { self.device.create_shader_module(&info, None) })
            .map_err(vk_err("vkCreateShaderModule"))
    }

    fn destroy_shader_module(&self, module: vk::ShaderModule) {
        self.locks.with(LockGroup::Shader, || unsafe {
            self.device.destroy_shader_module(module, None)
        });
    }

    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> Result<vk::DescriptorSetLayout> {
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.count)
                    .stage_flags(b.stages)
                    .build()
            })
            .collect();
        let info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        self.locks
            .with(LockGroup::Descriptor, || unsafe {
                self.device.create_descriptor_set_layout(&info, None)
            })
            .map_err(vk_err("vkCreateDescriptorSetLayout"))
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.locks.with(LockGroup::Descriptor, || unsafe {
            self.device.destroy_descriptor_set_layout(layout, None)
        });
    }

    fn create_descriptor_pool(&self, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> Result<vk::DescriptorPool> {
        let info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .pool_sizes(sizes)
            .max_sets(max_sets);
        self.locks
            .with(LockGroup::Descriptor, || unsafe { self.device.create_descriptor_pool(&info, None) })
            .map_err(vk_err("vkCreateDescriptorPool"))
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.locks.with(LockGroup::Descriptor, || unsafe {
            self.device.destroy_descriptor_pool(pool, None)
        });
    }

    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>> {
        let info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(layouts);
        self.locks
            .with(LockGroup::Descriptor, || unsafe { self.device.allocate_descriptor_sets(&info) })
            .map_err(vk_err("vkAllocateDescriptorSets"))
    }

    fn free_descriptor_sets(&self, pool: vk::DescriptorPool, sets: &[vk::DescriptorSet]) -> Result<()> {
        self.locks
            .with(LockGroup::Descriptor, || unsafe { self.device.free_descriptor_sets(pool, sets) })
            .map_err(vk_err("vkFreeDescriptorSets"))
    }

    fn update_descriptor_sets(&self, writes: &[DescriptorWrite<'_, VulkanBuffer>]) {
        let pending: Vec<PendingWrite> = writes
            .iter()
            .map(|write| match write {
                DescriptorWrite::UniformBuffer {
                    set,
                    binding,
                    buffer,
                    offset,
                    range,
                } => PendingWrite {
                    set: *set,
                    binding: *binding,
                    descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                    buffers: vec![vk::DescriptorBufferInfo {
                        buffer: buffer.handle,
                        offset: *offset,
                        range: *range,
                    }],
                    images: Vec::new(),
                },
                DescriptorWrite::ImageSamplers { set, binding, images } => PendingWrite {
                    set: *set,
                    binding: *binding,
                    descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    buffers: Vec::new(),
                    images: images
                        .iter()
                        .map(|&(image_view, sampler)| vk::DescriptorImageInfo {
                            sampler,
                            image_view,
                            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                        })
                        .collect(),
                },
            })
            .filter(|p| !p.buffers.is_empty() || !p.images.is_empty())
            .collect();

        let vk_writes: Vec<vk::WriteDescriptorSet> = pending
            .iter()
            .map(|p| {
                let write = vk::WriteDescriptorSet::builder()
                    .dst_set(p.set)
                    .dst_binding(p.binding)
                    .dst_array_element(0)
                    .descriptor_type(p.descriptor_type);
                if p.buffers.is_empty() {
                    write.image_info(&p.images).build()
                } else {
                    write.buffer_info(&p.buffers).build()
                }
            })
            .collect();

        if vk_writes.is_empty() {
            return;
        }
        self.locks.with(LockGroup::Descriptor, || unsafe {
            self.device.update_descriptor_sets(&vk_writes, &[])
        });
    }

    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout> {
        let info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(set_layouts)
            .push_constant_ranges(push_constants);
        self.locks
            .with(LockGroup::Pipeline, || unsafe { self.device.create_pipeline_layout(&info, None) })
            .map_err(vk_err("vkCreatePipelineLayout"))
    }

    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout) {
        self.locks.with(LockGroup::Pipeline, || unsafe {
            self.device.destroy_pipeline_layout(layout, None)
        });
    }

    fn create_graphics_pipeline(&self, desc: &PipelineDesc) -> Result<vk::Pipeline> {
        self.locks
            .with(LockGroup::Pipeline, || pipeline::create_graphics_pipeline(&self.device, desc))
    }

    fn destroy_pipeline(&self, pipeline: vk::Pipeline) {
        self.locks
            .with(LockGroup::Pipeline, || unsafe { self.device.destroy_pipeline(pipeline, None) });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn texture_transitions_are_known() {
        use vk::ImageLayout as L;
        assert!(transition_masks(L::UNDEFINED, L::TRANSFER_DST_OPTIMAL).is_some());
        assert!(transition_masks(L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL).is_some());
        assert!(transition_masks(L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_DST_OPTIMAL).is_some());
        assert!(transition_masks(L::PRESENT_SRC_KHR, L::GENERAL).is_none());
    }

    #[test]
    fn shader_stage_reads_follow_uploads() {
        let (src, dst, src_stage, dst_stage) = transition_masks(
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        )
        .unwrap();
        assert_eq!(src, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(dst, vk::AccessFlags::SHADER_READ);
        assert_eq!(src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
    }
}
