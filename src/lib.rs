//! Frame lifecycle and device resource coordination for a Vulkan renderer.
//!
//! [`Backend`] drives the per-frame protocol (acquire, record, submit,
//! present, recreate) and owns the registries for render passes, textures,
//! geometry and shaders. All native work goes through the [`GpuDevice`]
//! seam: [`VulkanDevice`] for real GPUs, [`HeadlessDevice`] for tests.

pub mod backend;
pub mod config;
pub mod context;
pub mod error;
pub mod lock_pool;
pub mod slot;

pub use backend::{
    Backend, FrameStatus, GpuDevice, HeadlessDevice, RawWindowSurface, ResizeHandle, ShaderId, SurfaceProvider,
    VulkanDevice,
};
pub use config::Config;
pub use context::{
    AssetLoader, BackendContext, EventQueue, EventSink, FileAssetLoader, MemoryAssetLoader, RendererEvent,
};
pub use error::{Error, Result};
pub use lock_pool::{LockGroup, LockPool};
pub use slot::Handle;
