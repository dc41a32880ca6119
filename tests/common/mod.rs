// Shared setup for the headless integration tests

#![allow(dead_code)]

use std::sync::Arc;

use ferrous_frame::backend::renderpass::RenderPassConfig;
use ferrous_frame::backend::ShaderConfig;
use ferrous_frame::{Backend, BackendContext, Config, EventQueue, FrameStatus, HeadlessDevice, MemoryAssetLoader};

pub const WIDTH: u32 = 800;
pub const HEIGHT: u32 = 600;
pub const DT: f32 = 1.0 / 60.0;

pub const WORLD_PASS: &str = r#"
    name = "world"
    clear_colour = [0.0, 0.0, 0.2, 1.0]

    [clear_flags]
    colour = true
    depth = true

    [targets]
    attachments = [
        { kind = "colour", source = "default", present_after = true },
        { kind = "depth", source = "default" },
    ]
"#;

pub const WORLD_SHADER: &str = r#"
    name = "builtin.world"
    render_pass = "world"

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
    name = "view"
    scope = "global"
    type = "mat4"

    [[uniforms]]
    name = "diffuse_colour"
    scope = "instance"
    type = "vec4"

    [[uniforms]]
    name = "model"
    scope = "local"
    type = "mat4"
"#;

pub struct Harness {
    pub device: Arc<HeadlessDevice>,
    pub events: Arc<EventQueue>,
    pub assets: Arc<MemoryAssetLoader>,
    pub backend: Backend<HeadlessDevice>,
}

/// Defaults with shared buffers small enough for a test process.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.limits.vertex_buffer_bytes = 64 * 1024;
    config.limits.index_buffer_bytes = 16 * 1024;
    config.limits.max_geometries = 64;
    config.limits.max_shader_instances = 16;
    config
}

pub fn harness() -> Harness {
    harness_with(HeadlessDevice::new(), test_config())
}

pub fn harness_with(device: HeadlessDevice, config: Config) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();

    let device = Arc::new(device);
    let events = Arc::new(EventQueue::new());
    let assets = Arc::new(MemoryAssetLoader::new());
    // Headless modules only check for whole 32-bit words
    assets.insert("shaders/builtin.world.vert.spv", vec![0x03, 0x02, 0x23, 0x07, 0, 0, 1, 0]);
    assets.insert("shaders/builtin.world.frag.spv", vec![0x03, 0x02, 0x23, 0x07, 0, 0, 1, 0]);

    let context = BackendContext {
        assets: assets.clone(),
        events: events.clone(),
    };
    let backend = Backend::new(device.clone(), &config, context, WIDTH, HEIGHT).expect("backend");
    Harness {
        device,
        events,
        assets,
        backend,
    }
}

pub fn world_pass() -> RenderPassConfig {
    RenderPassConfig::from_toml_str(WORLD_PASS).expect("world pass config")
}

pub fn world_shader() -> ShaderConfig {
    ShaderConfig::from_toml_str(WORLD_SHADER).expect("world shader config")
}

/// Runs one frame with no draws. Returns what `begin_frame` reported.
pub fn run_frame(backend: &mut Backend<HeadlessDevice>) -> FrameStatus {
    let status = backend.begin_frame(DT).expect("begin_frame");
    if status.is_ready() {
        backend.end_frame(DT).expect("end_frame");
    }
    status
}
