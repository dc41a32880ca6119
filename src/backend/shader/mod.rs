// Shaders, pipelines and descriptor state
//
// A shader is planned from its config first (pure layout work), then
// initialized: modules, descriptor pool and layouts, pipeline layout,
// pipeline and one uniform buffer holding every frame's global region and
// every instance's region.
//
// Descriptor sets are rewritten lazily: each set remembers which buffer
// and textures it was last written with, per frame slot.

pub mod config;
pub mod layout;

pub use config::{AttributeConfig, CullMode, ShaderConfig, ShaderScope, ShaderStage, StageConfig, UniformConfig, UniformType};
pub use layout::{align_up, ShaderLayout, ShaderLimits, UniformLayout};

use ash::vk;
use std::sync::Arc;

use self::layout::SetPlan;
use super::buffer::{BufferKind, RenderBuffer};
use super::gpu::{DescriptorWrite, GpuDevice, PipelineDesc};
use super::texture::{TextureHandle, TextureMap, TextureRegistry};
use crate::context::{AssetKind, AssetLoader};
use crate::error::{Error, Result};
use crate::slot::{Handle, SlotTable};

/// Descriptor sets kept per scope; covers the largest frames-in-flight setting.
pub const DESCRIPTOR_SET_COUNT: usize = 3;

const POOL_UNIFORM_BUFFERS: u32 = 1024;
const POOL_IMAGE_SAMPLERS: u32 = 4096;
const POOL_MAX_SETS: u32 = 1024;

/// Tag type for shader instance ids.
pub enum InstanceSlot {}

pub type InstanceId = Handle<InstanceSlot>;

/// A value for `set_uniform`.
#[derive(Clone, Copy)]
pub enum UniformValue<'a> {
    Data(&'a [u8]),
    Texture(&'a TextureMap),
}

/// What a descriptor was last written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BindingState {
    /// Slot index and generation of the texture handle; the buffer offset for UBOs.
    id: (u32, u32),
    /// Content generation of the texture.
    generation: u32,
    sampler: vk::Sampler,
}

struct DescriptorState {
    set: vk::DescriptorSet,
    /// UBO descriptor first when present, then one entry per texture slot.
    bindings: Vec<Option<BindingState>>,
}

impl DescriptorState {
    fn new(set: vk::DescriptorSet, plan: &SetPlan, texture_count: usize) -> Self {
        let ubo = usize::from(plan.ubo_binding.is_some());
        Self {
            set,
            bindings: vec![None; ubo + texture_count],
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct BoundTexture {
    texture: Option<TextureHandle>,
    sampler: vk::Sampler,
}

impl From<&TextureMap> for BoundTexture {
    fn from(map: &TextureMap) -> Self {
        Self {
            texture: map.texture,
            sampler: map.sampler(),
        }
    }
}

struct InstanceState {
    ubo_offset: Option<u64>,
    sets: Vec<DescriptorState>,
    textures: Vec<BoundTexture>,
}

/// Writes whatever part of `state` is out of date.
fn update_set<D: GpuDevice>(
    device: &D,
    plan: &SetPlan,
    state: &mut DescriptorState,
    ubo: Option<(&D::Buffer, u64, u64)>,
    bound: &[BoundTexture],
    textures: &TextureRegistry<D>,
) -> Result<()> {
    let mut writes = Vec::with_capacity(2);
    let mut next = 0;

    if let (Some(binding), Some((buffer, offset, range))) = (plan.ubo_binding, ubo) {
        let current = BindingState {
            id: ((offset >> 32) as u32, offset as u32),
            generation: 0,
            sampler: vk::Sampler::null(),
        };
        if state.bindings[0] != Some(current) {
            writes.push(DescriptorWrite::UniformBuffer {
                set: state.set,
                binding,
                buffer,
                offset,
                range,
            });
            state.bindings[0] = Some(current);
        }
        next = 1;
    }

    if let Some(binding) = plan.sampler_binding {
        let mut changed = false;
        let mut images = Vec::with_capacity(bound.len());
        for (slot, entry) in bound.iter().enumerate() {
            let (handle, texture) = textures.resolve(entry.texture)?;
            let sampler = if entry.sampler == vk::Sampler::null() {
                textures.default_sampler()
            } else {
                entry.sampler
            };
            let current = BindingState {
                id: (handle.index(), handle.generation()),
                generation: texture.generation(),
                sampler,
            };
            if state.bindings[next + slot] != Some(current) {
                state.bindings[next + slot] = Some(current);
                changed = true;
            }
            images.push((texture.view(), sampler));
        }
        if changed {
            writes.push(DescriptorWrite::ImageSamplers {
                set: state.set,
                binding,
                images,
            });
        }
    }

    if !writes.is_empty() {
        device.update_descriptor_sets(&writes);
    }
    Ok(())
}

pub struct Shader<D: GpuDevice> {
    config: ShaderConfig,
    layout: ShaderLayout,
    set_plans: Vec<SetPlan>,
    render_pass: vk::RenderPass,
    max_instances: usize,
    min_ubo_alignment: u64,
    initialized: bool,

    modules: Vec<(vk::ShaderStageFlags, vk::ShaderModule)>,
    descriptor_pool: vk::DescriptorPool,
    set_layouts: Vec<vk::DescriptorSetLayout>,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    uniform_buffer: Option<RenderBuffer<D>>,

    global_offsets: Vec<u64>,
    global_sets: Vec<DescriptorState>,
    global_textures: Vec<BoundTexture>,
    instances: SlotTable<InstanceState>,

    bound_global_offset: u64,
    bound_instance: Option<InstanceId>,
    device: Arc<D>,
}

impl<D: GpuDevice> Shader<D> {
    /// Plans the shader's layout. No native objects are created yet.
    pub fn new(
        device: Arc<D>,
        config: ShaderConfig,
        render_pass: vk::RenderPass,
        limits: &ShaderLimits,
        max_instances: usize,
    ) -> Result<Self> {
        let min_ubo_alignment = device.info().min_uniform_buffer_offset_alignment;
        let layout = ShaderLayout::plan(&config, min_ubo_alignment, limits)?;
        let set_plans = layout.set_plans();
        log::debug!(
            "Planned shader '{}': {} uniforms, global stride {}, instance stride {}",
            config.name,
            layout.uniforms.len(),
            layout.global_ubo_stride,
            layout.ubo_stride
        );

        Ok(Self {
            config,
            layout,
            set_plans,
            render_pass,
            max_instances,
            min_ubo_alignment,
            initialized: false,
            modules: Vec::new(),
            descriptor_pool: vk::DescriptorPool::null(),
            set_layouts: Vec::new(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            uniform_buffer: None,
            global_offsets: vec![0; DESCRIPTOR_SET_COUNT],
            global_sets: Vec::new(),
            global_textures: Vec::new(),
            instances: SlotTable::with_capacity(max_instances),
            bound_global_offset: 0,
            bound_instance: None,
            device,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ShaderConfig {
        &self.config
    }

    pub fn layout(&self) -> &ShaderLayout {
        &self.layout
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn pipeline(&self) -> vk::Pipeline {
        self.pipeline
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    pub fn uniform_index(&self, name: &str) -> Option<u16> {
        self.layout.uniform_index(name)
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    /// Byte offset of an instance's region in the uniform buffer.
    pub fn instance_offset(&self, id: InstanceId) -> Option<u64> {
        self.instances.get(id.cast()).and_then(|i| i.ubo_offset)
    }

    /// Byte offset of frame `frame`'s global region.
    pub fn global_offset(&self, frame: usize) -> u64 {
        self.global_offsets[frame % DESCRIPTOR_SET_COUNT]
    }

    fn set_index(&self, scope: ShaderScope) -> Option<usize> {
        self.set_plans.iter().position(|plan| plan.scope == scope)
    }

    fn require_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(Error::InvalidState(format!("shader '{}' is not initialized", self.config.name)))
        }
    }

    /// Creates every native object the shader needs.
    ///
    /// On failure everything created so far is destroyed again, so the
    /// shader may be initialized once more.
    pub fn initialize(&mut self, assets: &dyn AssetLoader) -> Result<()> {
        if self.initialized {
            return Err(Error::InvalidState(format!(
                "shader '{}' is already initialized",
                self.config.name
            )));
        }

        if let Err(e) = self.create_objects(assets) {
            log::error!("Failed to initialize shader '{}': {}", self.config.name, e);
            self.release_objects();
            return Err(e);
        }
        self.initialized = true;
        log::info!("Initialized shader '{}'", self.config.name);
        Ok(())
    }

    fn create_objects(&mut self, assets: &dyn AssetLoader) -> Result<()> {
        // Step 1: Shader modules; bytecode goes back to the loader straight away
        for stage in &self.config.stages {
            let asset = assets.load_asset(&stage.file, AssetKind::ShaderBytecode)?;
            let module = self.device.create_shader_module(&asset.bytes);
            assets.unload_asset(asset);
            self.modules.push((stage.stage.flags(), module?));
        }

        // Step 2: Descriptor pool and set layouts
        self.descriptor_pool = self.device.create_descriptor_pool(
            &[
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: POOL_UNIFORM_BUFFERS,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                    descriptor_count: POOL_IMAGE_SAMPLERS,
                },
            ],
            POOL_MAX_SETS,
        )?;
        for plan in &self.set_plans {
            let layout = self.device.create_descriptor_set_layout(&plan.bindings)?;
            self.set_layouts.push(layout);
        }

        // Step 3: Pipeline layout and pipeline
        let push_constants: Vec<_> = self.layout.push_constant_range().into_iter().collect();
        self.pipeline_layout = self
            .device
            .create_pipeline_layout(&self.set_layouts, &push_constants)?;
        self.pipeline = self.device.create_graphics_pipeline(&PipelineDesc {
            render_pass: self.render_pass,
            layout: self.pipeline_layout,
            stages: self.modules.clone(),
            vertex_stride: self.layout.attribute_stride,
            attributes: self.layout.attributes.clone(),
            cull_mode: self.config.cull_mode.flags(),
            polygon_mode: if self.config.wireframe {
                vk::PolygonMode::LINE
            } else {
                vk::PolygonMode::FILL
            },
            depth_test: self.config.depth_test,
            depth_write: self.config.depth_write,
            colour_attachment_count: 1,
        })?;

        // Step 4: Uniform buffer, global regions first
        let buffer_size = self.layout.global_ubo_stride * DESCRIPTOR_SET_COUNT as u64
            + self.layout.ubo_stride * self.max_instances as u64;
        if buffer_size > 0 {
            let mut buffer = RenderBuffer::new(self.device.clone(), BufferKind::Uniform, buffer_size, true)?;
            if self.layout.global_ubo_stride > 0 {
                for offset in self.global_offsets.iter_mut() {
                    *offset = buffer.allocate(self.layout.global_ubo_stride, self.min_ubo_alignment)?;
                }
            }
            self.uniform_buffer = Some(buffer);
        }

        // Step 5: Global descriptor sets, one per frame slot
        if let Some(index) = self.set_index(ShaderScope::Global) {
            let layouts = [self.set_layouts[index]; DESCRIPTOR_SET_COUNT];
            let sets = self
                .device
                .allocate_descriptor_sets(self.descriptor_pool, &layouts)?;
            let plan = &self.set_plans[index];
            self.global_sets = sets
                .into_iter()
                .map(|set| DescriptorState::new(set, plan, self.layout.global_texture_count))
                .collect();
        }
        self.global_textures = vec![
            BoundTexture {
                texture: None,
                sampler: vk::Sampler::null(),
            };
            self.layout.global_texture_count
        ];
        Ok(())
    }

    /// Destroys every native object and returns to the planned state.
    fn release_objects(&mut self) {
        let device = &self.device;
        self.uniform_buffer = None;
        if self.pipeline != vk::Pipeline::null() {
            device.destroy_pipeline(self.pipeline);
            self.pipeline = vk::Pipeline::null();
        }
        if self.pipeline_layout != vk::PipelineLayout::null() {
            device.destroy_pipeline_layout(self.pipeline_layout);
            self.pipeline_layout = vk::PipelineLayout::null();
        }
        for layout in self.set_layouts.drain(..) {
            device.destroy_descriptor_set_layout(layout);
        }
        // Destroying the pool frees every set allocated from it
        if self.descriptor_pool != vk::DescriptorPool::null() {
            device.destroy_descriptor_pool(self.descriptor_pool);
            self.descriptor_pool = vk::DescriptorPool::null();
        }
        for (_, module) in self.modules.drain(..) {
            device.destroy_shader_module(module);
        }
        self.global_sets.clear();
        self.global_textures.clear();
        self.global_offsets.iter_mut().for_each(|offset| *offset = 0);
        self.initialized = false;
    }

    /// Binds the pipeline.
    pub fn use_shader(&self, cmd: vk::CommandBuffer) -> Result<()> {
        self.require_initialized()?;
        self.device.cmd_bind_pipeline(cmd, self.pipeline);
        Ok(())
    }

    /// Selects frame `frame`'s global region for subsequent global writes.
    pub fn bind_globals(&mut self, frame: usize) {
        self.bound_global_offset = self.global_offset(frame);
        self.bound_instance = None;
    }

    pub fn apply_globals(&mut self, cmd: vk::CommandBuffer, frame: usize, textures: &TextureRegistry<D>) -> Result<()> {
        self.require_initialized()?;
        let Some(set_index) = self.set_index(ShaderScope::Global) else {
            return Ok(());
        };
        let offset = self.global_offset(frame);
        let ubo = self
            .uniform_buffer
            .as_ref()
            .map(|buffer| (buffer.raw(), offset, self.layout.global_ubo_size));
        let state = &mut self.global_sets[frame % DESCRIPTOR_SET_COUNT];
        update_set(
            &*self.device,
            &self.set_plans[set_index],
            state,
            ubo,
            &self.global_textures,
            textures,
        )?;
        self.device
            .cmd_bind_descriptor_set(cmd, self.pipeline_layout, set_index as u32, state.set);
        Ok(())
    }

    pub fn bind_instance(&mut self, id: InstanceId) -> Result<()> {
        if !self.instances.contains(id.cast()) {
            return Err(Error::InvalidHandle(format!("shader instance {:?}", id)));
        }
        self.bound_instance = Some(id);
        Ok(())
    }

    /// Binds the bound instance's set, writing descriptors first when `needs_update`.
    pub fn apply_instance(
        &mut self,
        cmd: vk::CommandBuffer,
        frame: usize,
        textures: &TextureRegistry<D>,
        needs_update: bool,
    ) -> Result<()> {
        self.require_initialized()?;
        let Some(set_index) = self.set_index(ShaderScope::Instance) else {
            return Ok(());
        };
        let id = self
            .bound_instance
            .ok_or_else(|| Error::InvalidState("no shader instance is bound".to_string()))?;
        let instance = self
            .instances
            .get_mut(id.cast())
            .ok_or_else(|| Error::InvalidHandle(format!("shader instance {:?}", id)))?;
        let state = &mut instance.sets[frame % DESCRIPTOR_SET_COUNT];

        if needs_update {
            let ubo = match (self.uniform_buffer.as_ref(), instance.ubo_offset) {
                (Some(buffer), Some(offset)) => Some((buffer.raw(), offset, self.layout.ubo_size)),
                _ => None,
            };
            update_set(
                &*self.device,
                &self.set_plans[set_index],
                state,
                ubo,
                &instance.textures,
                textures,
            )?;
        }
        self.device
            .cmd_bind_descriptor_set(cmd, self.pipeline_layout, set_index as u32, state.set);
        Ok(())
    }

    /// Reserves a uniform region and descriptor sets for a new instance.
    pub fn acquire_instance(&mut self, maps: &[&TextureMap]) -> Result<InstanceId> {
        self.require_initialized()?;
        if maps.len() != self.layout.instance_texture_count {
            return Err(Error::Shader(format!(
                "shader '{}' expects {} instance textures, got {}",
                self.config.name,
                self.layout.instance_texture_count,
                maps.len()
            )));
        }
        if self.instances.len() >= self.max_instances {
            return Err(Error::Exhausted("shader instance table"));
        }

        let ubo_offset = match (self.uniform_buffer.as_mut(), self.layout.ubo_stride) {
            (Some(buffer), stride) if stride > 0 => Some(buffer.allocate(stride, self.min_ubo_alignment)?),
            _ => None,
        };

        let sets = match self.set_index(ShaderScope::Instance) {
            Some(index) => {
                let layouts = [self.set_layouts[index]; DESCRIPTOR_SET_COUNT];
                match self
                    .device
                    .allocate_descriptor_sets(self.descriptor_pool, &layouts)
                {
                    Ok(sets) => {
                        let plan = &self.set_plans[index];
                        sets.into_iter()
                            .map(|set| DescriptorState::new(set, plan, self.layout.instance_texture_count))
                            .collect()
                    }
                    Err(e) => {
                        self.free_instance_region(ubo_offset);
                        return Err(e);
                    }
                }
            }
            None => Vec::new(),
        };

        let state = InstanceState {
            ubo_offset,
            sets,
            textures: maps.iter().map(|&map| BoundTexture::from(map)).collect(),
        };
        match self.instances.insert(state) {
            Ok(handle) => {
                log::debug!(
                    "Acquired instance {:?} of shader '{}' at offset {:?}",
                    handle,
                    self.config.name,
                    ubo_offset
                );
                Ok(handle.cast())
            }
            Err(state) => {
                self.free_instance_sets(&state);
                self.free_instance_region(state.ubo_offset);
                Err(Error::Exhausted("shader instance table"))
            }
        }
    }

    /// Waits for the device to go idle, then frees the instance's sets and region.
    pub fn release_instance(&mut self, id: InstanceId) -> Result<()> {
        if !self.instances.contains(id.cast()) {
            return Err(Error::InvalidHandle(format!("shader instance {:?}", id)));
        }
        // Sets may still be referenced by in-flight command buffers
        self.device.wait_idle()?;

        if let Some(state) = self.instances.remove(id.cast()) {
            self.free_instance_sets(&state);
            self.free_instance_region(state.ubo_offset);
        }
        if self.bound_instance == Some(id) {
            self.bound_instance = None;
        }
        log::debug!("Released instance {:?} of shader '{}'", id, self.config.name);
        Ok(())
    }

    fn free_instance_sets(&self, state: &InstanceState) {
        if state.sets.is_empty() {
            return;
        }
        let sets: Vec<_> = state.sets.iter().map(|s| s.set).collect();
        if let Err(e) = self.device.free_descriptor_sets(self.descriptor_pool, &sets) {
            log::error!("Failed to free descriptor sets of shader '{}': {}", self.config.name, e);
        }
    }

    fn free_instance_region(&mut self, offset: Option<u64>) {
        if let (Some(buffer), Some(offset)) = (self.uniform_buffer.as_mut(), offset) {
            if let Err(e) = buffer.free(offset, self.layout.ubo_stride) {
                log::error!("Failed to free uniform region at {}: {}", offset, e);
            }
        }
    }

    /// Writes one uniform. Local uniforms are pushed into `cmd`.
    pub fn set_uniform(&mut self, cmd: Option<vk::CommandBuffer>, index: u16, value: UniformValue<'_>) -> Result<()> {
        self.require_initialized()?;
        let uniform = self
            .layout
            .uniform(index)
            .ok_or_else(|| Error::Uniform(format!("shader '{}' has no uniform {}", self.config.name, index)))?
            .clone();

        match (uniform.is_sampler(), value) {
            (true, UniformValue::Texture(map)) => {
                let bound = BoundTexture::from(map);
                let location = uniform.location as usize;
                match uniform.scope {
                    ShaderScope::Global => self.global_textures[location] = bound,
                    _ => {
                        let instance = self.bound_instance_mut()?;
                        instance.textures[location] = bound;
                    }
                }
                Ok(())
            }
            (false, UniformValue::Data(bytes)) => {
                if bytes.len() as u64 != uniform.size {
                    return Err(Error::Uniform(format!(
                        "uniform '{}' is {} bytes, got {}",
                        uniform.name,
                        uniform.size,
                        bytes.len()
                    )));
                }
                match uniform.scope {
                    ShaderScope::Local => {
                        let cmd = cmd.ok_or_else(|| {
                            Error::InvalidState(format!(
                                "local uniform '{}' needs a recording frame",
                                uniform.name
                            ))
                        })?;
                        let mut padded = bytes.to_vec();
                        padded.resize(align_up(bytes.len() as u64, 4) as usize, 0);
                        self.device
                            .cmd_push_constants(cmd, self.pipeline_layout, uniform.offset as u32, &padded);
                        Ok(())
                    }
                    ShaderScope::Global => {
                        let offset = self.bound_global_offset + uniform.offset;
                        self.write_uniform_buffer(offset, bytes)
                    }
                    ShaderScope::Instance => {
                        let base = self
                            .bound_instance_mut()?
                            .ubo_offset
                            .ok_or_else(|| Error::Uniform("instance has no uniform region".to_string()))?;
                        self.write_uniform_buffer(base + uniform.offset, bytes)
                    }
                }
            }
            (true, UniformValue::Data(_)) => Err(Error::Uniform(format!(
                "uniform '{}' is a sampler and needs a texture map",
                uniform.name
            ))),
            (false, UniformValue::Texture(_)) => Err(Error::Uniform(format!(
                "uniform '{}' is not a sampler",
                uniform.name
            ))),
        }
    }

    fn bound_instance_mut(&mut self) -> Result<&mut InstanceState> {
        let id = self
            .bound_instance
            .ok_or_else(|| Error::InvalidState("no shader instance is bound".to_string()))?;
        self.instances
            .get_mut(id.cast())
            .ok_or_else(|| Error::InvalidHandle(format!("shader instance {:?}", id)))
    }

    fn write_uniform_buffer(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let buffer = self
            .uniform_buffer
            .as_ref()
            .ok_or_else(|| Error::Uniform(format!("shader '{}' has no uniform buffer", self.config.name)))?;
        buffer.load_range(offset, bytes)
    }

    /// Reads back uniform buffer bytes, e.g. to check what a frame will see.
    pub fn read_uniform_buffer(&self, offset: u64, out: &mut [u8]) -> Result<()> {
        let buffer = self
            .uniform_buffer
            .as_ref()
            .ok_or_else(|| Error::Uniform(format!("shader '{}' has no uniform buffer", self.config.name)))?;
        buffer.read(offset, out)
    }
}

impl<D: GpuDevice> Drop for Shader<D> {
    fn drop(&mut self) {
        self.release_objects();
        log::debug!("Destroyed shader '{}'", self.config.name);
    }
}
