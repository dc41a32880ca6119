// Shader layout planning
//
// Turns a `ShaderConfig` into uniform offsets, push-constant ranges, UBO
// strides, descriptor set layouts and vertex attribute descriptions.
// Pure data: nothing here touches the device.

use ash::vk;
use std::collections::HashMap;

use super::config::{ShaderConfig, ShaderScope, UniformType};
use crate::backend::gpu::LayoutBinding;
use crate::error::{Error, Result};

pub const MAX_ATTRIBUTES: usize = 16;
pub const MAX_STAGES: usize = 8;
pub const MAX_PUSH_CONSTANT_RANGES: usize = 32;
/// Guaranteed minimum push-constant block size.
pub const PUSH_CONSTANT_BLOCK_SIZE: u64 = 128;

/// Per-shader capacity limits.
#[derive(Debug, Clone, Copy)]
pub struct ShaderLimits {
    pub max_global_textures: usize,
    pub max_instance_textures: usize,
    pub max_uniforms: usize,
}

impl Default for ShaderLimits {
    fn default() -> Self {
        Self {
            max_global_textures: 31,
            max_instance_textures: 31,
            max_uniforms: 128,
        }
    }
}

/// Rounds `value` up to the next multiple of `alignment`.
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    value.div_ceil(alignment) * alignment
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Range {
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniformLayout {
    pub name: String,
    pub index: u16,
    pub scope: ShaderScope,
    pub kind: UniformType,
    /// Byte offset within the scope's UBO region or push-constant block.
    pub offset: u64,
    pub size: u64,
    /// Texture slot for samplers, push-constant range for locals.
    pub location: u16,
}

impl UniformLayout {
    pub fn is_sampler(&self) -> bool {
        self.kind == UniformType::Sampler
    }
}

/// Bindings of one descriptor set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetPlan {
    pub scope: ShaderScope,
    pub bindings: Vec<LayoutBinding>,
    pub ubo_binding: Option<u32>,
    pub sampler_binding: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct ShaderLayout {
    pub uniforms: Vec<UniformLayout>,
    lookup: HashMap<String, u16>,
    pub attribute_stride: u32,
    pub attributes: Vec<vk::VertexInputAttributeDescription>,
    pub global_ubo_size: u64,
    pub global_ubo_stride: u64,
    pub ubo_size: u64,
    pub ubo_stride: u64,
    pub push_constant_ranges: Vec<Range>,
    pub push_constant_size: u64,
    pub global_texture_count: usize,
    pub instance_texture_count: usize,
    pub stages: vk::ShaderStageFlags,
}

impl ShaderLayout {
    pub fn plan(config: &ShaderConfig, min_ubo_alignment: u64, limits: &ShaderLimits) -> Result<Self> {
        if config.stages.is_empty() || config.stages.len() > MAX_STAGES {
            return Err(Error::Shader(format!(
                "shader '{}' needs 1 to {} stages, has {}",
                config.name,
                MAX_STAGES,
                config.stages.len()
            )));
        }
        if config.attributes.len() > MAX_ATTRIBUTES {
            return Err(Error::Shader(format!(
                "shader '{}' declares {} attributes, limit is {}",
                config.name,
                config.attributes.len(),
                MAX_ATTRIBUTES
            )));
        }
        if config.uniforms.len() > limits.max_uniforms {
            return Err(Error::Shader(format!(
                "shader '{}' declares {} uniforms, limit is {}",
                config.name,
                config.uniforms.len(),
                limits.max_uniforms
            )));
        }

        let stages = config
            .stages
            .iter()
            .fold(vk::ShaderStageFlags::empty(), |acc, s| acc | s.stage.flags());

        // Interleaved attributes in declaration order
        let mut attributes = Vec::with_capacity(config.attributes.len());
        let mut attribute_stride = 0;
        for (location, attribute) in config.attributes.iter().enumerate() {
            attributes.push(vk::VertexInputAttributeDescription {
                location: location as u32,
                binding: 0,
                format: attribute.kind.format(),
                offset: attribute_stride,
            });
            attribute_stride += attribute.kind.size();
        }

        let mut layout = Self {
            uniforms: Vec::with_capacity(config.uniforms.len()),
            lookup: HashMap::new(),
            attribute_stride,
            attributes,
            global_ubo_size: 0,
            global_ubo_stride: 0,
            ubo_size: 0,
            ubo_stride: 0,
            push_constant_ranges: Vec::new(),
            push_constant_size: 0,
            global_texture_count: 0,
            instance_texture_count: 0,
            stages,
        };

        for uniform in &config.uniforms {
            layout.add_uniform(&config.name, uniform.name.clone(), uniform.scope, uniform.kind, uniform.size, limits)?;
        }

        layout.global_ubo_stride = align_up(layout.global_ubo_size, min_ubo_alignment);
        layout.ubo_stride = align_up(layout.ubo_size, min_ubo_alignment);
        Ok(layout)
    }

    fn add_uniform(
        &mut self,
        shader: &str,
        name: String,
        scope: ShaderScope,
        kind: UniformType,
        declared_size: Option<u32>,
        limits: &ShaderLimits,
    ) -> Result<()> {
        if self.lookup.contains_key(&name) {
            return Err(Error::Shader(format!("shader '{}' declares uniform '{}' twice", shader, name)));
        }
        let index = self.uniforms.len() as u16;

        let (offset, size, location) = if kind == UniformType::Sampler {
            let (count, max) = match scope {
                ShaderScope::Global => (&mut self.global_texture_count, limits.max_global_textures),
                ShaderScope::Instance => (&mut self.instance_texture_count, limits.max_instance_textures),
                ShaderScope::Local => {
                    return Err(Error::Shader(format!(
                        "shader '{}': sampler '{}' cannot use local scope",
                        shader, name
                    )))
                }
            };
            if *count >= max {
                return Err(Error::Shader(format!(
                    "shader '{}': too many {:?} samplers (limit {})",
                    shader, scope, max
                )));
            }
            let location = *count as u16;
            *count += 1;
            (0, 0, location)
        } else {
            let size = kind.size().or(declared_size).filter(|&s| s > 0).ok_or_else(|| {
                Error::Shader(format!("shader '{}': uniform '{}' needs a size", shader, name))
            })? as u64;

            match scope {
                ShaderScope::Global => {
                    let offset = self.global_ubo_size;
                    self.global_ubo_size += size;
                    (offset, size, index)
                }
                ShaderScope::Instance => {
                    let offset = self.ubo_size;
                    self.ubo_size += size;
                    (offset, size, index)
                }
                ShaderScope::Local => {
                    if self.push_constant_ranges.len() >= MAX_PUSH_CONSTANT_RANGES {
                        return Err(Error::Shader(format!(
                            "shader '{}': too many push constant ranges",
                            shader
                        )));
                    }
                    let range = Range {
                        offset: align_up(self.push_constant_size, 4),
                        size: align_up(size, 4),
                    };
                    if range.offset + range.size > PUSH_CONSTANT_BLOCK_SIZE {
                        return Err(Error::Shader(format!(
                            "shader '{}': local uniforms exceed {} bytes of push constants",
                            shader, PUSH_CONSTANT_BLOCK_SIZE
                        )));
                    }
                    let location = self.push_constant_ranges.len() as u16;
                    self.push_constant_ranges.push(range);
                    self.push_constant_size = range.offset + range.size;
                    (range.offset, size, location)
                }
            }
        };

        self.lookup.insert(name.clone(), index);
        self.uniforms.push(UniformLayout {
            name,
            index,
            scope,
            kind,
            offset,
            size,
            location,
        });
        Ok(())
    }

    pub fn uniform_index(&self, name: &str) -> Option<u16> {
        self.lookup.get(name).copied()
    }

    pub fn uniform(&self, index: u16) -> Option<&UniformLayout> {
        self.uniforms.get(index as usize)
    }

    fn set_plan(&self, scope: ShaderScope, ubo_size: u64, texture_count: usize) -> Option<SetPlan> {
        if ubo_size == 0 && texture_count == 0 {
            return None;
        }
        let mut plan = SetPlan {
            scope,
            bindings: Vec::with_capacity(2),
            ubo_binding: None,
            sampler_binding: None,
        };
        if ubo_size > 0 {
            plan.ubo_binding = Some(0);
            plan.bindings.push(LayoutBinding {
                binding: 0,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                count: 1,
                stages: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            });
        }
        if texture_count > 0 {
            let binding = plan.bindings.len() as u32;
            plan.sampler_binding = Some(binding);
            plan.bindings.push(LayoutBinding {
                binding,
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                count: texture_count as u32,
                stages: vk::ShaderStageFlags::FRAGMENT,
            });
        }
        Some(plan)
    }

    /// Descriptor sets in set-index order; empty scopes get no set.
    pub fn set_plans(&self) -> Vec<SetPlan> {
        [
            self.set_plan(ShaderScope::Global, self.global_ubo_size, self.global_texture_count),
            self.set_plan(ShaderScope::Instance, self.ubo_size, self.instance_texture_count),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    pub fn push_constant_range(&self) -> Option<vk::PushConstantRange> {
        (self.push_constant_size > 0).then(|| vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            offset: 0,
            size: self.push_constant_size as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::shader::config::{ShaderConfig, StageConfig, ShaderStage, UniformConfig};

    fn config(uniforms: Vec<UniformConfig>) -> ShaderConfig {
        ShaderConfig {
            name: "test".to_string(),
            render_pass: "world".to_string(),
            stages: vec![StageConfig {
                stage: ShaderStage::Vertex,
                file: "a.spv".to_string(),
            }],
            attributes: Vec::new(),
            uniforms,
            cull_mode: Default::default(),
            depth_test: true,
            depth_write: true,
            wireframe: false,
        }
    }

    fn uniform(name: &str, scope: ShaderScope, kind: UniformType, size: Option<u32>) -> UniformConfig {
        UniformConfig {
            name: name.to_string(),
            scope,
            kind,
            size,
        }
    }

    #[test]
    fn stride_rounds_to_alignment() {
        let layout = ShaderLayout::plan(
            &config(vec![uniform("data", ShaderScope::Instance, UniformType::Custom, Some(64))]),
            256,
            &ShaderLimits::default(),
        )
        .unwrap();
        assert_eq!(layout.ubo_size, 64);
        assert_eq!(layout.ubo_stride, 256);
        assert_eq!(align_up(257, 256), 512);
        assert_eq!(align_up(0, 256), 0);
    }

    #[test]
    fn uniforms_pack_per_scope() {
        let layout = ShaderLayout::plan(
            &config(vec![
                uniform("projection", ShaderScope::Global, UniformType::Mat4, None),
                uniform("view", ShaderScope::Global, UniformType::Mat4, None),
                uniform("diffuse", ShaderScope::Instance, UniformType::Vec4, None),
                uniform("diffuse_texture", ShaderScope::Instance, UniformType::Sampler, None),
                uniform("flag", ShaderScope::Local, UniformType::Custom, Some(3)),
                uniform("model", ShaderScope::Local, UniformType::Mat4, None),
            ]),
            256,
            &ShaderLimits::default(),
        )
        .unwrap();

        let view = layout.uniform(layout.uniform_index("view").unwrap()).unwrap();
        assert_eq!(view.offset, 64);
        assert_eq!(layout.global_ubo_stride, 256);

        let model = layout.uniform(layout.uniform_index("model").unwrap()).unwrap();
        assert_eq!((model.offset, model.size, model.location), (4, 64, 1));
        assert_eq!(layout.push_constant_size, 68);

        let plans = layout.set_plans();
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].ubo_binding, Some(0));
        assert_eq!(plans[0].sampler_binding, None);
        assert_eq!(plans[1].sampler_binding, Some(1));
        assert_eq!(plans[1].bindings[1].count, 1);
    }

    #[test]
    fn sampler_only_set_binds_at_zero() {
        let layout = ShaderLayout::plan(
            &config(vec![uniform("atlas", ShaderScope::Global, UniformType::Sampler, None)]),
            64,
            &ShaderLimits::default(),
        )
        .unwrap();
        let plans = layout.set_plans();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].sampler_binding, Some(0));
        assert_eq!(plans[0].bindings[0].descriptor_type, vk::DescriptorType::COMBINED_IMAGE_SAMPLER);
    }

    #[test]
    fn local_sampler_is_rejected() {
        let result = ShaderLayout::plan(
            &config(vec![uniform("tex", ShaderScope::Local, UniformType::Sampler, None)]),
            256,
            &ShaderLimits::default(),
        );
        assert!(matches!(result, Err(Error::Shader(_))));
    }

    #[test]
    fn push_constant_block_is_bounded() {
        let result = ShaderLayout::plan(
            &config(vec![
                uniform("a", ShaderScope::Local, UniformType::Mat4, None),
                uniform("b", ShaderScope::Local, UniformType::Mat4, None),
                uniform("c", ShaderScope::Local, UniformType::Float32, None),
            ]),
            256,
            &ShaderLimits::default(),
        );
        assert!(matches!(result, Err(Error::Shader(_))));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let result = ShaderLayout::plan(
            &config(vec![
                uniform("a", ShaderScope::Global, UniformType::Vec4, None),
                uniform("a", ShaderScope::Instance, UniformType::Vec4, None),
            ]),
            256,
            &ShaderLimits::default(),
        );
        assert!(result.is_err());
    }
}
