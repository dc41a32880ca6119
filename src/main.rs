// =============================================================================
// FERROUS FRAME DEMO - one spinning triangle through the full frame protocol
// =============================================================================
//
// FRAME FLOW:
// 1. begin_frame: wait on the slot fence, acquire a swap image
// 2. Begin the "world" render pass on the acquired image
// 3. Globals (projection, view), instance colour, model push constant
// 4. Draw the triangle from the shared geometry buffers
// 5. end_frame: submit and present, rebuild the swapchain if it went stale
//
// =============================================================================

use anyhow::{Context, Result};
use ferrous_frame::backend::geometry::GeometryHandle;
use ferrous_frame::backend::renderpass::{RenderPassConfig, RenderPassHandle};
use ferrous_frame::backend::{InstanceId, ShaderConfig, UniformValue};
use ferrous_frame::{
    Backend, BackendContext, Config, EventQueue, FileAssetLoader, FrameStatus, LockPool, RawWindowSurface,
    RendererEvent, ShaderId, VulkanDevice,
};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

const WORLD_PASS_CONFIG: &str = "shaders/world.pass.toml";
const WORLD_SHADER_CONFIG: &str = "shaders/builtin.world.toml";

type Mat4 = [[f32; 4]; 4];

const IDENTITY: Mat4 = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct Vertex {
    position: [f32; 3],
}

const TRIANGLE: [Vertex; 3] = [
    Vertex { position: [0.0, -0.6, 0.0] },
    Vertex { position: [0.6, 0.6, 0.0] },
    Vertex { position: [-0.6, 0.6, 0.0] },
];

fn main() -> Result<()> {
    let config = Config::load();

    init_logging(&config);
    log::info!("Starting ferrous-frame demo");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Present mode: {}", config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    Ok(())
}

/// Initialize logging with optional file output for validation errors
fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);
    builder.init();

    if config.debug.log_to_file {
        if let Ok(mut file) = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            let _ = writeln!(file, "=== ferrous-frame log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
    }
}

// =============================================================================
// SCENE
// =============================================================================

/// Everything the demo created through the backend.
struct Scene {
    pass: RenderPassHandle,
    shader: ShaderId,
    instance: InstanceId,
    triangle: GeometryHandle,
    projection: u16,
    view: u16,
    colour: u16,
    model: u16,
}

impl Scene {
    fn create(backend: &mut Backend<VulkanDevice>) -> Result<Self> {
        let pass_toml = std::fs::read_to_string(WORLD_PASS_CONFIG)
            .with_context(|| format!("Failed to read {}", WORLD_PASS_CONFIG))?;
        let pass = backend.create_render_pass(RenderPassConfig::from_toml_str(&pass_toml)?)?;

        let shader_toml = std::fs::read_to_string(WORLD_SHADER_CONFIG)
            .with_context(|| format!("Failed to read {}", WORLD_SHADER_CONFIG))?;
        let shader = backend.create_shader(ShaderConfig::from_toml_str(&shader_toml)?)?;
        backend.initialize_shader(shader)?;
        let instance = backend.acquire_instance_resources(shader, &[])?;

        let uniform = |name: &str| {
            backend
                .uniform_index(shader, name)
                .with_context(|| format!("shader has no uniform '{}'", name))
        };
        let (projection, view, colour, model) = (
            uniform("projection")?,
            uniform("view")?,
            uniform("diffuse_colour")?,
            uniform("model")?,
        );

        let triangle = backend.create_geometry(&TRIANGLE, &[0, 1, 2])?;
        log::info!("Scene ready");

        Ok(Self {
            pass,
            shader,
            instance,
            triangle,
            projection,
            view,
            colour,
            model,
        })
    }

    /// Records the scene into the frame `begin_frame` just started.
    fn record(&self, backend: &mut Backend<VulkanDevice>, elapsed: f32) -> Result<()> {
        let (width, height) = backend.framebuffer_size();
        let aspect = width as f32 / height.max(1) as f32;

        let image = backend.window_image_index() as usize;
        backend.begin_render_pass(self.pass, image)?;
        backend.use_shader(self.shader)?;

        backend.bind_globals(self.shader)?;
        backend.set_uniform(self.shader, self.projection, mat4(&scale(1.0 / aspect, 1.0)))?;
        backend.set_uniform(self.shader, self.view, mat4(&IDENTITY))?;
        backend.apply_globals(self.shader)?;

        let colour: [f32; 4] = [0.9, 0.4 + 0.3 * elapsed.sin().abs(), 0.2, 1.0];
        backend.bind_instance(self.shader, self.instance)?;
        backend.set_uniform(self.shader, self.colour, UniformValue::Data(bytemuck::bytes_of(&colour)))?;
        backend.apply_instance(self.shader, true)?;

        backend.set_uniform(self.shader, self.model, mat4(&rotation_z(elapsed)))?;
        backend.draw_geometry(self.triangle)?;

        backend.end_render_pass()?;
        Ok(())
    }
}

fn mat4(m: &Mat4) -> UniformValue<'_> {
    UniformValue::Data(bytemuck::bytes_of(m))
}

fn scale(x: f32, y: f32) -> Mat4 {
    let mut m = IDENTITY;
    m[0][0] = x;
    m[1][1] = y;
    m
}

fn rotation_z(angle: f32) -> Mat4 {
    let (s, c) = angle.sin_cos();
    let mut m = IDENTITY;
    m[0][0] = c;
    m[0][1] = s;
    m[1][0] = -s;
    m[1][1] = c;
    m
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the backend (and the device it keeps alive)
/// goes before the window its surface was created from.
struct App {
    config: Config,
    scene: Option<Scene>,
    backend: Option<Backend<VulkanDevice>>,
    events: Arc<EventQueue>,
    window: Option<Arc<Window>>,

    started: Instant,
    frame_count: u32,
    last_fps_update: Instant,
    last_frame_time: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            config,
            scene: None,
            backend: None,
            events: Arc::new(EventQueue::new()),
            window: None,
            started: now,
            frame_count: 0,
            last_fps_update: now,
            last_frame_time: now,
        }
    }

    /// Creates the device, the backend and the demo scene for `window`.
    fn init_renderer(&mut self, window: &Window) -> Result<()> {
        log::info!("Initializing renderer...");

        // Step 1: Device and surface
        let surface = RawWindowSurface::from_window(window);
        let locks = Arc::new(LockPool::new());
        let device = VulkanDevice::new(&self.config.window.title, &self.config, &surface, locks)?;

        // Step 2: Backend
        let size = window.inner_size();
        let context = BackendContext {
            assets: Arc::new(FileAssetLoader::new(".")),
            events: self.events.clone(),
        };
        let mut backend = Backend::new(device, &self.config, context, size.width, size.height)?;

        // Step 3: Scene
        self.scene = Some(Scene::create(&mut backend)?);
        self.backend = Some(backend);

        log::info!("Renderer initialized successfully!");
        Ok(())
    }

    /// Runs one frame. Returns whether anything was presented.
    fn render_frame(&mut self) -> Result<bool> {
        let (Some(backend), Some(scene)) = (self.backend.as_mut(), self.scene.as_ref()) else {
            return Ok(false);
        };

        let now = Instant::now();
        let delta = now.duration_since(self.last_frame_time).as_secs_f32();
        let rendered = match backend.begin_frame(delta)? {
            FrameStatus::Ready => {
                let recorded = scene.record(backend, self.started.elapsed().as_secs_f32());
                // The frame must be closed even when recording failed
                backend.end_frame(delta)?;
                recorded?;
                true
            }
            status => {
                log::debug!("Frame skipped: {:?}", status);
                false
            }
        };

        for event in self.events.drain() {
            match event {
                RendererEvent::DefaultRenderTargetsRefreshRequired { width, height } => {
                    // Window-bound passes were regenerated by the backend
                    log::info!("Render targets refreshed at {}x{}", width, height);
                }
            }
        }
        Ok(rendered)
    }

    /// Counts presented frames and reports the rate once a second.
    fn frame_presented(&mut self) {
        let now = Instant::now();
        let frame_ms = now.duration_since(self.last_frame_time).as_secs_f32() * 1000.0;
        self.last_frame_time = now;
        self.frame_count += 1;

        let window_secs = now.duration_since(self.last_fps_update).as_secs_f32();
        if !self.config.debug.show_fps || window_secs < 1.0 {
            return;
        }
        let fps = self.frame_count as f32 / window_secs;
        let frames = self.backend.as_ref().map_or(0, |b| b.frame_number());
        if let Some(window) = &self.window {
            window.set_title(&format!("{} | {:.0} fps | {:.2} ms", self.config.window.title, fps, frame_ms));
        }
        log::debug!("{:.1} fps over the last second, {} frames total", fps, frames);
        self.frame_count = 0;
        self.last_fps_update = now;
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));
        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::error!("Failed to create window: {:?}", e);
                event_loop.exit();
                return;
            }
        };

        if let Err(e) = self.init_renderer(&window) {
            log::error!("Failed to initialize renderer: {:?}", e);
            event_loop.exit();
            return;
        }
        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: winit::window::WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            // The backend notices the new size on the next begin_frame
            WindowEvent::Resized(size) => {
                if let Some(ref backend) = self.backend {
                    backend.resized(size.width, size.height);
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.frame_presented(),
                Ok(false) => {}
                Err(e) => {
                    log::error!("Render error: {:?}", e);
                    if matches!(
                        e.downcast_ref::<ferrous_frame::Error>(),
                        Some(ferrous_frame::Error::DeviceLost { .. })
                    ) {
                        event_loop.exit();
                    }
                }
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        if key == KeyCode::Escape {
                            log::info!("Escape pressed, exiting");
                            event_loop.exit();
                        }
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        log::info!("Cleaning up renderer...");
        // Scene handles die with the backend; the backend waits for idle itself
        self.scene = None;
        self.backend = None;
        log::info!("Cleanup complete");
    }
}
