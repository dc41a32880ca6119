// GPU device seam
//
// Everything the frame loop, the resource registry and the shader subsystem
// need from the native API goes through `GpuDevice`. Plain objects travel as
// ash handle types; objects that own memory (buffers, images) are associated
// types so each implementation keeps its own payload.
//
// Descriptor structs here carry no raw pointers, so callers can store them
// and stay `Send`.

use ash::vk;

use super::buffer::BufferKind;
use crate::error::Result;

/// Which device queue an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueRole {
    Graphics,
    Present,
    Transfer,
}

/// Queue family indices chosen at device selection. Present and transfer may alias graphics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
    pub transfer: u32,
    pub compute: Option<u32>,
}

impl QueueFamilies {
    pub fn family(&self, role: QueueRole) -> u32 {
        match role {
            QueueRole::Graphics => self.graphics,
            QueueRole::Present => self.present,
            QueueRole::Transfer => self.transfer,
        }
    }

    /// Distinct family indices, in role order.
    pub fn unique(&self) -> Vec<u32> {
        let mut families = vec![self.graphics];
        for family in [self.present, self.transfer] {
            if !families.contains(&family) {
                families.push(family);
            }
        }
        families
    }
}

/// Properties cached when the device is created.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub queue_families: QueueFamilies,
    pub depth_format: vk::Format,
    pub depth_channel_count: u8,
    pub min_uniform_buffer_offset_alignment: u64,
    pub max_push_constants_size: u32,
    pub max_sampler_anisotropy: f32,
    pub supports_device_local_host_visible: bool,
}

/// Surface capabilities re-queried before every swapchain build.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Negotiated swapchain parameters.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    pub image_count: u32,
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub transform: vk::SurfaceTransformFlagsKHR,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// One command buffer submission.
#[derive(Debug, Clone, Copy)]
pub struct Submission {
    pub command_buffer: vk::CommandBuffer,
    pub wait: Option<(vk::Semaphore, vk::PipelineStageFlags)>,
    pub signal: Option<vk::Semaphore>,
    pub fence: Option<vk::Fence>,
}

#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
    pub aspect: vk::ImageAspectFlags,
}

#[derive(Debug, Clone, Copy)]
pub struct SamplerDesc {
    pub min_filter: vk::Filter,
    pub mag_filter: vk::Filter,
    pub address_u: vk::SamplerAddressMode,
    pub address_v: vk::SamplerAddressMode,
    pub address_w: vk::SamplerAddressMode,
    pub max_anisotropy: Option<f32>,
}

/// Attachments and single-subpass layout of a render pass.
#[derive(Debug, Clone)]
pub struct RenderPassDesc {
    pub attachments: Vec<vk::AttachmentDescription>,
    /// Indices into `attachments` used as colour outputs.
    pub colour_refs: Vec<u32>,
    pub depth_ref: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

/// A descriptor update. Buffers are borrowed in the device's own payload type.
pub enum DescriptorWrite<'a, B> {
    UniformBuffer {
        set: vk::DescriptorSet,
        binding: u32,
        buffer: &'a B,
        offset: u64,
        range: u64,
    },
    ImageSamplers {
        set: vk::DescriptorSet,
        binding: u32,
        images: Vec<(vk::ImageView, vk::Sampler)>,
    },
}

#[derive(Debug, Clone)]
pub struct PipelineDesc {
    pub render_pass: vk::RenderPass,
    pub layout: vk::PipelineLayout,
    pub stages: Vec<(vk::ShaderStageFlags, vk::ShaderModule)>,
    pub vertex_stride: u32,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
    pub cull_mode: vk::CullModeFlags,
    pub polygon_mode: vk::PolygonMode,
    pub depth_test: bool,
    pub depth_write: bool,
    pub colour_attachment_count: u32,
}

/// Native operations used by the backend.
///
/// Implementations must be safe to share between threads; the Vulkan device
/// serializes every call through its lock pool.
pub trait GpuDevice: Send + Sync + 'static {
    type Buffer: Send + Sync;
    type Image: Send + Sync;

    fn info(&self) -> &DeviceInfo;
    fn wait_idle(&self) -> Result<()>;

    // --- Swapchain -----------------------------------------------------------
    fn surface_support(&self) -> Result<SurfaceSupport>;
    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<(vk::SwapchainKHR, Vec<vk::Image>)>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> Result<AcquireOutcome>;
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<PresentOutcome>;
    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);

    // --- Synchronization -----------------------------------------------------
    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    /// `Ok(false)` when the timeout expired before the fence signaled.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<bool>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;
    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    // --- Command buffers and queues -------------------------------------------
    fn allocate_command_buffer(&self, primary: bool) -> Result<vk::CommandBuffer>;
    fn free_command_buffer(&self, cmd: vk::CommandBuffer);
    fn begin_command_buffer(&self, cmd: vk::CommandBuffer, flags: vk::CommandBufferUsageFlags) -> Result<()>;
    fn end_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn reset_command_buffer(&self, cmd: vk::CommandBuffer) -> Result<()>;
    fn queue_submit(&self, queue: QueueRole, submission: &Submission) -> Result<()>;
    fn queue_wait_idle(&self, queue: QueueRole) -> Result<()>;

    // --- Recording -----------------------------------------------------------
    fn cmd_set_viewport(&self, cmd: vk::CommandBuffer, viewport: vk::Viewport);
    fn cmd_set_scissor(&self, cmd: vk::CommandBuffer, scissor: vk::Rect2D);
    fn cmd_begin_render_pass(
        &self,
        cmd: vk::CommandBuffer,
        pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        area: vk::Rect2D,
        clear_values: &[vk::ClearValue],
    );
    fn cmd_end_render_pass(&self, cmd: vk::CommandBuffer);
    fn cmd_bind_pipeline(&self, cmd: vk::CommandBuffer, pipeline: vk::Pipeline);
    fn cmd_bind_descriptor_set(
        &self,
        cmd: vk::CommandBuffer,
        layout: vk::PipelineLayout,
        set_index: u32,
        set: vk::DescriptorSet,
    );
    fn cmd_push_constants(&self, cmd: vk::CommandBuffer, layout: vk::PipelineLayout, offset: u32, data: &[u8]);
    fn cmd_bind_vertex_buffer(&self, cmd: vk::CommandBuffer, buffer: &Self::Buffer, offset: u64);
    fn cmd_bind_index_buffer(&self, cmd: vk::CommandBuffer, buffer: &Self::Buffer, offset: u64);
    fn cmd_draw(&self, cmd: vk::CommandBuffer, vertex_count: u32);
    fn cmd_draw_indexed(&self, cmd: vk::CommandBuffer, index_count: u32);
    fn cmd_copy_buffer(&self, cmd: vk::CommandBuffer, src: &Self::Buffer, dst: &Self::Buffer, region: vk::BufferCopy);
    fn cmd_transition_image(
        &self,
        cmd: vk::CommandBuffer,
        image: &Self::Image,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) -> Result<()>;
    fn cmd_copy_buffer_to_image(
        &self,
        cmd: vk::CommandBuffer,
        src: &Self::Buffer,
        dst: &Self::Image,
        width: u32,
        height: u32,
    );

    // --- Buffers -------------------------------------------------------------
    fn create_buffer(&self, kind: BufferKind, size: u64) -> Result<Self::Buffer>;
    fn destroy_buffer(&self, buffer: &mut Self::Buffer);
    fn is_host_visible(&self, buffer: &Self::Buffer) -> bool;
    fn write_buffer(&self, buffer: &Self::Buffer, offset: u64, data: &[u8]) -> Result<()>;
    fn read_buffer(&self, buffer: &Self::Buffer, offset: u64, out: &mut [u8]) -> Result<()>;
    fn flush_buffer(&self, buffer: &Self::Buffer, offset: u64, size: u64) -> Result<()>;

    // --- Images and samplers --------------------------------------------------
    fn create_image(&self, desc: &ImageDesc) -> Result<Self::Image>;
    fn destroy_image(&self, image: &mut Self::Image);
    fn image_view(&self, image: &Self::Image) -> vk::ImageView;
    fn create_sampler(&self, desc: &SamplerDesc) -> Result<vk::Sampler>;
    fn destroy_sampler(&self, sampler: vk::Sampler);

    // --- Passes, pipelines, descriptors ---------------------------------------
    fn create_render_pass(&self, desc: &RenderPassDesc) -> Result<vk::RenderPass>;
    fn destroy_render_pass(&self, pass: vk::RenderPass);
    fn create_framebuffer(
        &self,
        pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);
    fn create_shader_module(&self, code: &[u8]) -> Result<vk::ShaderModule>;
    fn destroy_shader_module(&self, module: vk::ShaderModule);
    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> Result<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(&self, sizes: &[vk::DescriptorPoolSize], max_sets: u32) -> Result<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_sets(
        &self,
        pool: vk::DescriptorPool,
        layouts: &[vk::DescriptorSetLayout],
    ) -> Result<Vec<vk::DescriptorSet>>;
    fn free_descriptor_sets(&self, pool: vk::DescriptorPool, sets: &[vk::DescriptorSet]) -> Result<()>;
    fn update_descriptor_sets(&self, writes: &[DescriptorWrite<'_, Self::Buffer>]);
    fn create_pipeline_layout(
        &self,
        set_layouts: &[vk::DescriptorSetLayout],
        push_constants: &[vk::PushConstantRange],
    ) -> Result<vk::PipelineLayout>;
    fn destroy_pipeline_layout(&self, layout: vk::PipelineLayout);
    fn create_graphics_pipeline(&self, desc: &PipelineDesc) -> Result<vk::Pipeline>;
    fn destroy_pipeline(&self, pipeline: vk::Pipeline);
}
