// =============================================================================
// CONFIGURATION - backend limits, device requirements and frame pacing
// =============================================================================
//
// Every section has defaults, so a missing config.toml (or a missing table
// inside it) is never an error. Values are checked once by `validate`.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub device: DeviceConfig,
    pub limits: LimitsConfig,
    pub render_pass: RenderPassPolicyConfig,
    pub debug: DebugConfig,
}

/// Window settings (used by the demo binary)
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "ferrous-frame".to_string(),
            width: 800,
            height: 600,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// Preferred present mode. FIFO is used when the surface lacks it.
    pub present_mode: String,
    pub max_frames_in_flight: usize,
    /// Bound on frame fence waits. `None` blocks until signaled.
    pub fence_timeout_ms: Option<u64>,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            max_frames_in_flight: 2,
            fence_timeout_ms: None,
        }
    }
}

/// Physical device requirements
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub discrete_gpu_only: bool,
    pub require_transfer_queue: bool,
    pub sampler_anisotropy: bool,
    /// Device extensions required in addition to the swapchain extension.
    pub extensions: Vec<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            discrete_gpu_only: false,
            require_transfer_queue: true,
            sampler_anisotropy: true,
            extensions: Vec::new(),
        }
    }
}

/// Sizes of shared buffers and fixed-capacity tables
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub vertex_buffer_bytes: u64,
    pub index_buffer_bytes: u64,
    pub max_geometries: usize,
    pub max_shader_instances: usize,
    pub max_global_textures: usize,
    pub max_instance_textures: usize,
    pub max_uniforms: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            vertex_buffer_bytes: 64 * 1024 * 1024,
            index_buffer_bytes: 16 * 1024 * 1024,
            max_geometries: 4096,
            max_shader_instances: 1024,
            max_global_textures: 31,
            max_instance_textures: 31,
            max_uniforms: 128,
        }
    }
}

/// What to do when an attachment asks to load and clear at the same time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentConflictPolicy {
    /// Warn and clear.
    #[default]
    PreferClear,
    /// Warn and load.
    PreferLoad,
    /// Fail render pass creation.
    Reject,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RenderPassPolicyConfig {
    pub attachment_conflict: AttachmentConflictPolicy,
}

/// Debug settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "ferrous_frame.log".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let frames = self.graphics.max_frames_in_flight;
        if !(2..=3).contains(&frames) {
            anyhow::bail!("graphics.max_frames_in_flight must be 2 or 3, got {}", frames);
        }
        if self.limits.vertex_buffer_bytes == 0 || self.limits.index_buffer_bytes == 0 {
            anyhow::bail!("limits: shared vertex and index buffers need a non-zero size");
        }
        if self.limits.max_geometries == 0 || self.limits.max_shader_instances == 0 {
            anyhow::bail!("limits: table capacities must be non-zero");
        }
        Ok(())
    }

    /// Get the preferred present mode as Vulkan enum
    pub fn get_present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to MAILBOX",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::MAILBOX
            }
        }
    }

    /// Fence timeout in nanoseconds; `u64::MAX` waits forever.
    pub fn fence_timeout_ns(&self) -> u64 {
        self.graphics
            .fence_timeout_ms
            .map(|ms| ms.saturating_mul(1_000_000))
            .unwrap_or(u64::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.graphics.max_frames_in_flight, 2);
        assert_eq!(config.get_present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.fence_timeout_ns(), u64::MAX);
        assert_eq!(
            config.render_pass.attachment_conflict,
            AttachmentConflictPolicy::PreferClear
        );
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [graphics]
            present_mode = "fifo"
            fence_timeout_ms = 250

            [render_pass]
            attachment_conflict = "reject"
            "#,
        )
        .unwrap();

        assert_eq!(config.get_present_mode(), vk::PresentModeKHR::FIFO);
        assert_eq!(config.fence_timeout_ns(), 250_000_000);
        assert_eq!(config.render_pass.attachment_conflict, AttachmentConflictPolicy::Reject);
        assert_eq!(config.limits.max_geometries, 4096);
        assert_eq!(config.window.width, 800);
    }

    #[test]
    fn frames_in_flight_is_bounded() {
        let err = Config::from_toml_str("[graphics]\nmax_frames_in_flight = 5\n").unwrap_err();
        assert!(err.to_string().contains("max_frames_in_flight"));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load_from_path("definitely/not/here.toml").unwrap();
        assert_eq!(config.limits.max_shader_instances, 1024);
    }
}
