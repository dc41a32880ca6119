// Shader configuration
//
// Declarative description of a shader: its stages, vertex attributes and
// uniforms. Usually loaded from a TOML document next to the SPIR-V files.

use ash::vk;
use serde::Deserialize;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShaderStage {
    Vertex,
    Geometry,
    Fragment,
    Compute,
}

impl ShaderStage {
    pub fn flags(self) -> vk::ShaderStageFlags {
        match self {
            ShaderStage::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderStage::Geometry => vk::ShaderStageFlags::GEOMETRY,
            ShaderStage::Fragment => vk::ShaderStageFlags::FRAGMENT,
            ShaderStage::Compute => vk::ShaderStageFlags::COMPUTE,
        }
    }
}

/// How often a uniform changes and where it is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShaderScope {
    /// Once per frame, descriptor set 0.
    Global,
    /// Per material instance, descriptor set 1.
    Instance,
    /// Per draw, via push constants.
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttributeType {
    Float32,
    Vec2,
    Vec3,
    Vec4,
    Int32,
    Uint32,
}

impl AttributeType {
    pub fn size(self) -> u32 {
        match self {
            AttributeType::Float32 | AttributeType::Int32 | AttributeType::Uint32 => 4,
            AttributeType::Vec2 => 8,
            AttributeType::Vec3 => 12,
            AttributeType::Vec4 => 16,
        }
    }

    pub fn format(self) -> vk::Format {
        match self {
            AttributeType::Float32 => vk::Format::R32_SFLOAT,
            AttributeType::Vec2 => vk::Format::R32G32_SFLOAT,
            AttributeType::Vec3 => vk::Format::R32G32B32_SFLOAT,
            AttributeType::Vec4 => vk::Format::R32G32B32A32_SFLOAT,
            AttributeType::Int32 => vk::Format::R32_SINT,
            AttributeType::Uint32 => vk::Format::R32_UINT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UniformType {
    Float32,
    Vec2,
    Vec3,
    Vec4,
    Int32,
    Uint32,
    Mat4,
    Sampler,
    /// Raw bytes; the size comes from the config.
    Custom,
}

impl UniformType {
    /// Byte size, or `None` for samplers and custom types.
    pub fn size(self) -> Option<u32> {
        match self {
            UniformType::Float32 | UniformType::Int32 | UniformType::Uint32 => Some(4),
            UniformType::Vec2 => Some(8),
            UniformType::Vec3 => Some(12),
            UniformType::Vec4 => Some(16),
            UniformType::Mat4 => Some(64),
            UniformType::Sampler | UniformType::Custom => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StageConfig {
    pub stage: ShaderStage,
    /// Path handed to the asset loader.
    pub file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttributeConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AttributeType,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UniformConfig {
    pub name: String,
    pub scope: ShaderScope,
    #[serde(rename = "type")]
    pub kind: UniformType,
    /// Required for `custom` uniforms, ignored otherwise.
    #[serde(default)]
    pub size: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CullMode {
    None,
    Front,
    #[default]
    Back,
    FrontAndBack,
}

impl CullMode {
    pub fn flags(self) -> vk::CullModeFlags {
        match self {
            CullMode::None => vk::CullModeFlags::NONE,
            CullMode::Front => vk::CullModeFlags::FRONT,
            CullMode::Back => vk::CullModeFlags::BACK,
            CullMode::FrontAndBack => vk::CullModeFlags::FRONT_AND_BACK,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShaderConfig {
    pub name: String,
    /// Name of the render pass the pipeline is built against.
    pub render_pass: String,
    pub stages: Vec<StageConfig>,
    #[serde(default)]
    pub attributes: Vec<AttributeConfig>,
    #[serde(default)]
    pub uniforms: Vec<UniformConfig>,
    #[serde(default)]
    pub cull_mode: CullMode,
    #[serde(default = "default_true")]
    pub depth_test: bool,
    #[serde(default = "default_true")]
    pub depth_write: bool,
    #[serde(default)]
    pub wireframe: bool,
}

impl ShaderConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Shader(format!("failed to parse shader config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_builtin_world_config() {
        let config = ShaderConfig::from_toml_str(
            r#"
            name = "builtin.world"
            render_pass = "world"
            cull_mode = "none"

            [[stages]]
            stage = "vertex"
            file = "shaders/builtin.world.vert.spv"

            [[stages]]
            stage = "fragment"
            file = "shaders/builtin.world.frag.spv"

            [[attributes]]
            name = "in_position"
            type = "vec3"

            [[uniforms]]
            name = "projection"
            scope = "global"
            type = "mat4"

            [[uniforms]]
            name = "tint"
            scope = "instance"
            type = "custom"
            size = 12
            "#,
        )
        .unwrap();

        assert_eq!(config.stages.len(), 2);
        assert_eq!(config.stages[1].stage.flags(), vk::ShaderStageFlags::FRAGMENT);
        assert_eq!(config.attributes[0].kind.size(), 12);
        assert_eq!(config.uniforms[1].size, Some(12));
        assert_eq!(config.cull_mode, CullMode::None);
        assert!(config.depth_test);
    }

    #[test]
    fn unknown_scope_is_an_error() {
        let err = ShaderConfig::from_toml_str(
            r#"
            name = "bad"
            render_pass = "world"
            stages = []
            [[uniforms]]
            name = "x"
            scope = "sometimes"
            type = "float32"
            "#,
        );
        assert!(matches!(err, Err(Error::Shader(_))));
    }
}
