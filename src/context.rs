// Context objects handed to the backend by the application
//
// The backend owns no process-wide state. Asset access and event delivery
// are collaborators passed in at construction time.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// What an asset is expected to contain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    /// Compiled SPIR-V.
    ShaderBytecode,
    /// Raw bytes with no interpretation.
    Binary,
}

/// Bytes returned by an [`AssetLoader`].
#[derive(Debug)]
pub struct Asset {
    pub path: String,
    pub kind: AssetKind,
    pub bytes: Vec<u8>,
}

impl Asset {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// Supplies shader bytecode (and other raw data) to the backend.
///
/// The backend hands every asset back through `unload_asset` once it has
/// consumed the bytes.
pub trait AssetLoader: Send + Sync {
    fn load_asset(&self, path: &str, kind: AssetKind) -> Result<Asset>;
    fn unload_asset(&self, asset: Asset);
}

/// Notifications emitted by the backend. Fire and forget.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RendererEvent {
    /// The swapchain was rebuilt; render targets bound to it must be regenerated.
    DefaultRenderTargetsRefreshRequired { width: u32, height: u32 },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: RendererEvent);
}

/// Collaborators passed to [`crate::Backend::new`].
#[derive(Clone)]
pub struct BackendContext {
    pub assets: Arc<dyn AssetLoader>,
    pub events: Arc<dyn EventSink>,
}

/// Loads assets from files below a root directory.
pub struct FileAssetLoader {
    root: PathBuf,
}

impl FileAssetLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl AssetLoader for FileAssetLoader {
    fn load_asset(&self, path: &str, kind: AssetKind) -> Result<Asset> {
        let full = self.root.join(path);
        let bytes = std::fs::read(&full)
            .map_err(|e| Error::Asset(format!("failed to read {}: {}", full.display(), e)))?;
        log::debug!("Loaded asset {} ({} bytes)", full.display(), bytes.len());
        Ok(Asset {
            path: path.to_string(),
            kind,
            bytes,
        })
    }

    fn unload_asset(&self, asset: Asset) {
        log::debug!("Unloaded asset {}", asset.path);
    }
}

/// Serves assets registered in memory, e.g. bytecode embedded with `include_bytes!`.
#[derive(Default)]
pub struct MemoryAssetLoader {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    outstanding: AtomicUsize,
}

impl MemoryAssetLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: impl Into<String>, bytes: Vec<u8>) {
        self.entries.lock().insert(path.into(), bytes);
    }

    /// Assets handed out and not yet unloaded.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }
}

impl AssetLoader for MemoryAssetLoader {
    fn load_asset(&self, path: &str, kind: AssetKind) -> Result<Asset> {
        let bytes = self
            .entries
            .lock()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::Asset(format!("no asset registered at '{}'", path)))?;
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        Ok(Asset {
            path: path.to_string(),
            kind,
            bytes,
        })
    }

    fn unload_asset(&self, _asset: Asset) {
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Buffers events until the application drains them.
#[derive(Default)]
pub struct EventQueue {
    events: Mutex<Vec<RendererEvent>>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<RendererEvent> {
        std::mem::take(&mut *self.events.lock())
    }
}

impl EventSink for EventQueue {
    fn emit(&self, event: RendererEvent) {
        log::debug!("Renderer event: {:?}", event);
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_loader_tracks_outstanding_assets() {
        let loader = MemoryAssetLoader::new();
        loader.insert("shaders/a.spv", vec![1, 2, 3, 4]);

        let asset = loader.load_asset("shaders/a.spv", AssetKind::ShaderBytecode).unwrap();
        assert_eq!(asset.size(), 4);
        assert_eq!(loader.outstanding(), 1);

        loader.unload_asset(asset);
        assert_eq!(loader.outstanding(), 0);
        assert!(loader.load_asset("missing", AssetKind::Binary).is_err());
    }

    #[test]
    fn event_queue_drains_in_order() {
        let queue = EventQueue::new();
        queue.emit(RendererEvent::DefaultRenderTargetsRefreshRequired { width: 1, height: 2 });
        queue.emit(RendererEvent::DefaultRenderTargetsRefreshRequired { width: 3, height: 4 });

        let events = queue.drain();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            RendererEvent::DefaultRenderTargetsRefreshRequired { width: 3, height: 4 }
        );
        assert!(queue.drain().is_empty());
    }
}
