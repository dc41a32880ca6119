// Backend module - frame lifecycle and device resources
//
// Design: everything native goes through the `GpuDevice` seam, so the same
// frame loop and registries drive Vulkan or the headless test device.
// Resources are owned by registries and addressed through generational handles.

pub mod buffer;
pub mod command;
pub mod frame;
pub mod geometry;
pub mod gpu;
pub mod headless;
pub mod renderpass;
pub mod shader;
pub mod swapchain;
pub mod sync;
pub mod texture;
pub mod vulkan;

pub use buffer::{BufferKind, FreeList, MappedRange, RenderBuffer};
pub use command::{BeginFlags, CommandBuffer, CommandBufferState};
pub use frame::{FrameStatus, ResizeHandle};
pub use geometry::{Geometry, GeometryHandle, GeometryRange};
pub use gpu::{DeviceInfo, GpuDevice, QueueFamilies, QueueRole};
pub use headless::HeadlessDevice;
pub use renderpass::{RenderPassConfig, RenderPassHandle};
pub use shader::{InstanceId, Shader, ShaderConfig, ShaderScope, UniformValue};
pub use swapchain::Swapchain;
pub use sync::{Fence, FrameSync};
pub use texture::{Texture, TextureHandle, TextureMap};
pub use vulkan::{RawWindowSurface, SurfaceProvider, VulkanDevice};

use ash::vk;
use bytemuck::Pod;
use std::collections::HashMap;
use std::sync::Arc;

use self::geometry::GeometryRegistry;
use self::renderpass::{RenderPass, RenderPassRegistry, TargetSources};
use self::shader::ShaderLimits;
use self::texture::TextureRegistry;
use crate::config::{AttachmentConflictPolicy, Config};
use crate::context::BackendContext;
use crate::error::{Error, Result};
use crate::slot::{Handle, SlotTable};

/// Shaders one backend can hold at once.
pub const MAX_SHADERS: usize = 128;

/// Tag type for shader ids.
pub enum ShaderSlot {}

pub type ShaderId = Handle<ShaderSlot>;

/// The rendering backend.
///
/// Owns the swapchain, per-frame synchronization, one command buffer per swap
/// image and every registry. Fields drop top to bottom, so resources go
/// before the objects they were created from.
pub struct Backend<D: GpuDevice> {
    shaders: SlotTable<Shader<D>>,
    shader_names: HashMap<String, ShaderId>,
    render_passes: RenderPassRegistry<D>,
    textures: TextureRegistry<D>,
    geometries: GeometryRegistry<D>,
    command_buffers: Vec<CommandBuffer<D>>,
    sync: FrameSync<D>,
    swapchain: Swapchain<D>,

    current_frame: usize,
    frame_number: u64,
    image_index: u32,
    frame_active: bool,
    last_generation: u64,
    delta_time: f32,
    fence_timeout_ns: u64,

    resize: ResizeHandle,
    shader_limits: ShaderLimits,
    max_shader_instances: usize,
    attachment_policy: AttachmentConflictPolicy,
    context: BackendContext,
    device: Arc<D>,
}

impl<D: GpuDevice> Backend<D> {
    /// Builds the swapchain, frame sync, command buffers and the shared
    /// geometry buffers for a `width` x `height` framebuffer.
    pub fn new(device: Arc<D>, config: &Config, context: BackendContext, width: u32, height: u32) -> Result<Self> {
        log::info!("Initializing backend on '{}' ({}x{})", device.info().name, width, height);

        // Step 1: Swapchain
        let swapchain = Swapchain::new(device.clone(), width, height, config.get_present_mode())?;

        // Step 2: Per-frame sync objects
        let frames = config.graphics.max_frames_in_flight;
        let sync = FrameSync::new(device.clone(), frames, swapchain.image_count())?;

        // Step 3: One command buffer per swap image
        let command_buffers = (0..swapchain.image_count())
            .map(|_| CommandBuffer::allocate(device.clone(), true))
            .collect::<Result<Vec<_>>>()?;

        // Step 4: Shared geometry buffers
        let limits = &config.limits;
        let geometries = GeometryRegistry::new(
            device.clone(),
            limits.vertex_buffer_bytes,
            limits.index_buffer_bytes,
            limits.max_geometries,
        )?;

        // Step 5: Texture registry with its default texture
        let anisotropy = config
            .device
            .sampler_anisotropy
            .then(|| device.info().max_sampler_anisotropy);
        let textures = TextureRegistry::new(device.clone(), anisotropy)?;

        log::info!(
            "Backend ready: {} frames in flight, {} swap images",
            frames,
            swapchain.image_count()
        );

        Ok(Self {
            shaders: SlotTable::with_capacity(MAX_SHADERS),
            shader_names: HashMap::new(),
            render_passes: RenderPassRegistry::new(),
            textures,
            geometries,
            command_buffers,
            sync,
            swapchain,
            current_frame: 0,
            frame_number: 0,
            image_index: 0,
            frame_active: false,
            last_generation: 0,
            delta_time: 0.0,
            fence_timeout_ns: config.fence_timeout_ns(),
            resize: ResizeHandle::new(width, height),
            shader_limits: ShaderLimits {
                max_global_textures: limits.max_global_textures,
                max_instance_textures: limits.max_instance_textures,
                max_uniforms: limits.max_uniforms,
            },
            max_shader_instances: limits.max_shader_instances,
            attachment_policy: config.render_pass.attachment_conflict,
            context,
            device,
        })
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }

    pub fn swapchain(&self) -> &Swapchain<D> {
        &self.swapchain
    }

    pub fn frame_sync(&self) -> &FrameSync<D> {
        &self.sync
    }

    // --- Render passes -------------------------------------------------------

    /// Creates a render pass. Passes whose attachments all come from the
    /// window get their targets straight away.
    pub fn create_render_pass(&mut self, config: RenderPassConfig) -> Result<RenderPassHandle> {
        if self.render_passes.find(&config.name).is_some() {
            return Err(Error::RenderPassConfig(format!(
                "render pass '{}' already exists",
                config.name
            )));
        }
        let pass = RenderPass::new(
            self.device.clone(),
            config,
            self.swapchain.format().format,
            self.attachment_policy,
        )?;
        let handle = self.render_passes.insert(pass)?;
        self.regenerate_window_targets()?;
        Ok(handle)
    }

    /// Rebuilds a pass's targets. `offscreen[i]` lists the textures backing
    /// target `i`'s view-sourced attachments, in attachment order.
    pub fn regenerate_render_targets(&mut self, pass: RenderPassHandle, offscreen: &[Vec<TextureHandle>]) -> Result<()> {
        self.device.wait_idle()?;

        let mut views = Vec::with_capacity(offscreen.len());
        let mut extent = self.swapchain.extent();
        for (target, textures) in offscreen.iter().enumerate() {
            let mut target_views = Vec::with_capacity(textures.len());
            for &handle in textures {
                let texture = self.textures.get(handle).ok_or_else(|| {
                    Error::InvalidHandle(format!("texture {:?} for target {}", handle, target))
                })?;
                if target == 0 && target_views.is_empty() {
                    extent = vk::Extent2D {
                        width: texture.width(),
                        height: texture.height(),
                    };
                }
                target_views.push(texture.view());
            }
            views.push(target_views);
        }

        let render_pass = self
            .render_passes
            .get_mut(pass)
            .ok_or_else(|| Error::InvalidHandle(format!("render pass {:?}", pass)))?;
        if render_pass.config().uses_default_source() {
            extent = self.swapchain.extent();
        }
        render_pass.regenerate_targets(&TargetSources {
            swapchain_views: self.swapchain.image_views(),
            depth_view: self.swapchain.depth_view(),
            offscreen: &views,
            extent,
        })
    }

    pub fn destroy_render_pass(&mut self, pass: RenderPassHandle) -> Result<()> {
        self.device.wait_idle()?;
        match self.render_passes.remove(pass) {
            Some(removed) => {
                log::debug!("Destroyed render pass '{}'", removed.config().name);
                Ok(())
            }
            None => Err(Error::InvalidHandle(format!("render pass {:?}", pass))),
        }
    }

    pub fn render_pass(&self, name: &str) -> Option<RenderPassHandle> {
        self.render_passes.find(name)
    }

    pub fn render_pass_ref(&self, pass: RenderPassHandle) -> Option<&RenderPass<D>> {
        self.render_passes.get(pass)
    }

    /// Number of swap images, i.e. window render targets.
    pub fn window_attachment_count(&self) -> usize {
        self.swapchain.image_count()
    }

    /// Swap image acquired by the current (or last) frame.
    pub fn window_image_index(&self) -> u32 {
        self.image_index
    }

    pub fn window_attachment(&self, index: usize) -> Option<vk::ImageView> {
        self.swapchain.image_views().get(index).copied()
    }

    pub fn depth_format(&self) -> vk::Format {
        self.device.info().depth_format
    }

    // --- Textures ------------------------------------------------------------

    pub fn create_texture(
        &mut self,
        width: u32,
        height: u32,
        channels: u8,
        pixels: &[u8],
        has_transparency: bool,
    ) -> Result<TextureHandle> {
        let texture = Texture::new(self.device.clone(), width, height, channels, pixels, has_transparency)?;
        self.textures.insert(texture)
    }

    pub fn create_writeable_texture(
        &mut self,
        width: u32,
        height: u32,
        channels: u8,
        has_transparency: bool,
    ) -> Result<TextureHandle> {
        let texture = Texture::new_writeable(self.device.clone(), width, height, channels, has_transparency)?;
        self.textures.insert(texture)
    }

    /// Replaces a texture's pixels. The handle stays valid; descriptor sets
    /// sampling the texture are rewritten on their next update.
    pub fn write_texture(&mut self, handle: TextureHandle, pixels: &[u8]) -> Result<()> {
        self.device.wait_idle()?;
        self.textures.get_mut(handle)?.write(pixels)
    }

    pub fn resize_texture(&mut self, handle: TextureHandle, width: u32, height: u32) -> Result<()> {
        self.device.wait_idle()?;
        self.textures.get_mut(handle)?.resize(width, height)
    }

    pub fn destroy_texture(&mut self, handle: TextureHandle) -> Result<()> {
        self.device.wait_idle()?;
        self.textures.remove(handle)
    }

    pub fn texture(&self, handle: TextureHandle) -> Option<&Texture<D>> {
        self.textures.get(handle)
    }

    pub fn default_texture(&self) -> TextureHandle {
        self.textures.default_texture()
    }

    pub fn acquire_texture_map_resources(&self, map: &mut TextureMap) -> Result<()> {
        self.textures.acquire_map_resources(map)
    }

    pub fn release_texture_map_resources(&self, map: &mut TextureMap) {
        self.textures.release_map_resources(map)
    }

    // --- Geometry ------------------------------------------------------------

    /// Uploads vertices (any `Pod` vertex type) and optional indices.
    pub fn create_geometry<V: Pod>(&mut self, vertices: &[V], indices: &[u32]) -> Result<GeometryHandle> {
        self.geometries.create(
            std::mem::size_of::<V>() as u32,
            bytemuck::cast_slice(vertices),
            indices,
        )
    }

    /// Re-uploads into an existing slot; the returned handle carries the new generation.
    pub fn update_geometry<V: Pod>(
        &mut self,
        handle: GeometryHandle,
        vertices: &[V],
        indices: &[u32],
    ) -> Result<GeometryHandle> {
        self.device.wait_idle()?;
        self.geometries.update(
            handle,
            std::mem::size_of::<V>() as u32,
            bytemuck::cast_slice(vertices),
            indices,
        )
    }

    /// `Ok(false)` for an unknown or stale handle.
    pub fn destroy_geometry(&mut self, handle: GeometryHandle) -> Result<bool> {
        self.device.wait_idle()?;
        Ok(self.geometries.destroy(handle))
    }

    pub fn geometry(&self, handle: GeometryHandle) -> Option<&Geometry> {
        self.geometries.get(handle)
    }

    /// Records a draw into the current frame. Stale handles are skipped with a warning.
    pub fn draw_geometry(&mut self, handle: GeometryHandle) -> Result<()> {
        let cmd = self.require_frame_cmd()?;
        self.geometries.draw(cmd, handle)
    }

    // --- Shaders -------------------------------------------------------------

    /// Plans a shader against the render pass its config names.
    pub fn create_shader(&mut self, config: ShaderConfig) -> Result<ShaderId> {
        if self.shader_names.contains_key(&config.name) {
            return Err(Error::Shader(format!("shader '{}' already exists", config.name)));
        }
        let pass = self
            .render_passes
            .find(&config.render_pass)
            .and_then(|handle| self.render_passes.get(handle))
            .ok_or_else(|| {
                Error::Shader(format!(
                    "shader '{}' references unknown render pass '{}'",
                    config.name, config.render_pass
                ))
            })?;

        let name = config.name.clone();
        let shader = Shader::new(
            self.device.clone(),
            config,
            pass.handle(),
            &self.shader_limits,
            self.max_shader_instances,
        )?;
        let id: ShaderId = self
            .shaders
            .insert(shader)
            .map_err(|_| Error::Exhausted("shader table"))?
            .cast();
        self.shader_names.insert(name, id);
        Ok(id)
    }

    /// Loads bytecode through the asset loader and creates the pipeline.
    pub fn initialize_shader(&mut self, id: ShaderId) -> Result<()> {
        let assets = self.context.assets.clone();
        self.shader_mut(id)?.initialize(&*assets)
    }

    pub fn destroy_shader(&mut self, id: ShaderId) -> Result<()> {
        self.device.wait_idle()?;
        let shader = self
            .shaders
            .remove(id.cast())
            .ok_or_else(|| Error::InvalidHandle(format!("shader {:?}", id)))?;
        self.shader_names.remove(shader.name());
        Ok(())
    }

    pub fn shader_id(&self, name: &str) -> Option<ShaderId> {
        self.shader_names.get(name).copied()
    }

    pub fn shader(&self, id: ShaderId) -> Option<&Shader<D>> {
        self.shaders.get(id.cast())
    }

    pub fn uniform_index(&self, id: ShaderId, name: &str) -> Option<u16> {
        self.shader(id).and_then(|shader| shader.uniform_index(name))
    }

    pub fn use_shader(&mut self, id: ShaderId) -> Result<()> {
        let cmd = self.require_frame_cmd()?;
        self.shader_ref(id)?.use_shader(cmd)
    }

    pub fn bind_globals(&mut self, id: ShaderId) -> Result<()> {
        let frame = self.current_frame;
        self.shader_mut(id)?.bind_globals(frame);
        Ok(())
    }

    pub fn apply_globals(&mut self, id: ShaderId) -> Result<()> {
        let cmd = self.require_frame_cmd()?;
        let frame = self.current_frame;
        let shader = self
            .shaders
            .get_mut(id.cast())
            .ok_or_else(|| Error::InvalidHandle(format!("shader {:?}", id)))?;
        shader.apply_globals(cmd, frame, &self.textures)
    }

    pub fn bind_instance(&mut self, id: ShaderId, instance: InstanceId) -> Result<()> {
        self.shader_mut(id)?.bind_instance(instance)
    }

    pub fn apply_instance(&mut self, id: ShaderId, needs_update: bool) -> Result<()> {
        let cmd = self.require_frame_cmd()?;
        let frame = self.current_frame;
        let shader = self
            .shaders
            .get_mut(id.cast())
            .ok_or_else(|| Error::InvalidHandle(format!("shader {:?}", id)))?;
        shader.apply_instance(cmd, frame, &self.textures, needs_update)
    }

    pub fn acquire_instance_resources(&mut self, id: ShaderId, maps: &[&TextureMap]) -> Result<InstanceId> {
        self.shader_mut(id)?.acquire_instance(maps)
    }

    /// Waits for the device to go idle before freeing the instance.
    pub fn release_instance_resources(&mut self, id: ShaderId, instance: InstanceId) -> Result<()> {
        self.shader_mut(id)?.release_instance(instance)
    }

    /// Writes a uniform. Local uniforms need a frame in progress.
    pub fn set_uniform(&mut self, id: ShaderId, index: u16, value: UniformValue<'_>) -> Result<()> {
        let cmd = self.current_command_buffer();
        self.shader_mut(id)?.set_uniform(cmd, index, value)
    }

    fn shader_ref(&self, id: ShaderId) -> Result<&Shader<D>> {
        self.shaders
            .get(id.cast())
            .ok_or_else(|| Error::InvalidHandle(format!("shader {:?}", id)))
    }

    fn shader_mut(&mut self, id: ShaderId) -> Result<&mut Shader<D>> {
        self.shaders
            .get_mut(id.cast())
            .ok_or_else(|| Error::InvalidHandle(format!("shader {:?}", id)))
    }

    fn require_frame_cmd(&self) -> Result<vk::CommandBuffer> {
        self.current_command_buffer()
            .ok_or_else(|| Error::InvalidState("no frame is being recorded".to_string()))
    }
}

impl<D: GpuDevice> Drop for Backend<D> {
    fn drop(&mut self) {
        log::info!("Shutting down backend after {} frames", self.frame_number);
        if let Err(e) = self.device.wait_idle() {
            log::error!("wait_idle failed during shutdown: {}", e);
        }
        // Fields drop in declaration order from here
    }
}
