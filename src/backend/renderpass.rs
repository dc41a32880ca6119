// Render passes and render targets
//
// A render pass is built from a declarative config: the attachment list
// decides formats, load/store operations and layouts. Render targets bind
// concrete image views to a pass as framebuffers and are rebuilt whenever
// the swapchain changes.

use ash::vk;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use super::gpu::{GpuDevice, RenderPassDesc};
use crate::config::AttachmentConflictPolicy;
use crate::error::{Error, Result};
use crate::slot::{Handle, SlotTable};

pub const MAX_RENDER_PASSES: usize = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentKind {
    Colour,
    Depth,
    Stencil,
}

/// Where a target's image view comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentSource {
    /// The swapchain image (colour) or its depth attachment.
    Default,
    /// A view supplied by the caller when targets are regenerated.
    View,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadOperation {
    #[default]
    DontCare,
    Load,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreOperation {
    DontCare,
    #[default]
    Store,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AttachmentConfig {
    pub kind: AttachmentKind,
    pub source: AttachmentSource,
    #[serde(default)]
    pub load: LoadOperation,
    #[serde(default)]
    pub store: StoreOperation,
    /// Transition to the present layout when the pass ends.
    #[serde(default)]
    pub present_after: bool,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
#[serde(default)]
pub struct ClearFlags {
    pub colour: bool,
    pub depth: bool,
    pub stencil: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TargetConfig {
    pub attachments: Vec<AttachmentConfig>,
    /// Number of targets when no attachment uses the default source.
    #[serde(default = "default_target_count")]
    pub count: usize,
}

fn default_target_count() -> usize {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct RenderPassConfig {
    pub name: String,
    /// x, y, width, height. A zero width or height covers the whole target.
    #[serde(default)]
    pub render_area: [u32; 4],
    #[serde(default)]
    pub clear_colour: [f32; 4],
    #[serde(default = "default_depth")]
    pub depth: f32,
    #[serde(default)]
    pub stencil: u32,
    #[serde(default)]
    pub clear_flags: ClearFlags,
    pub targets: TargetConfig,
}

fn default_depth() -> f32 {
    1.0
}

impl RenderPassConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::RenderPassConfig(format!("failed to parse render pass config: {}", e)))
    }

    pub fn uses_default_source(&self) -> bool {
        self.targets
            .attachments
            .iter()
            .any(|a| a.source == AttachmentSource::Default)
    }

    /// Every attachment comes from the swapchain, so targets need no outside views.
    pub fn is_window_bound(&self) -> bool {
        !self.targets.attachments.is_empty()
            && self
                .targets
                .attachments
                .iter()
                .all(|a| a.source == AttachmentSource::Default)
    }
}

/// Chooses the load op for an attachment whose clear flag is `clear`.
fn resolve_load_op(
    pass: &str,
    index: usize,
    clear: bool,
    load: LoadOperation,
    policy: AttachmentConflictPolicy,
) -> Result<vk::AttachmentLoadOp> {
    match (clear, load) {
        (true, LoadOperation::Load) => match policy {
            AttachmentConflictPolicy::PreferClear => {
                log::warn!(
                    "Render pass '{}' attachment {} requests both load and clear; clearing",
                    pass,
                    index
                );
                Ok(vk::AttachmentLoadOp::CLEAR)
            }
            AttachmentConflictPolicy::PreferLoad => {
                log::warn!(
                    "Render pass '{}' attachment {} requests both load and clear; loading",
                    pass,
                    index
                );
                Ok(vk::AttachmentLoadOp::LOAD)
            }
            AttachmentConflictPolicy::Reject => Err(Error::RenderPassConfig(format!(
                "render pass '{}' attachment {} requests both load and clear",
                pass, index
            ))),
        },
        (true, LoadOperation::DontCare) => Ok(vk::AttachmentLoadOp::CLEAR),
        (false, LoadOperation::Load) => Ok(vk::AttachmentLoadOp::LOAD),
        (false, LoadOperation::DontCare) => Ok(vk::AttachmentLoadOp::DONT_CARE),
    }
}

fn store_op(store: StoreOperation) -> vk::AttachmentStoreOp {
    match store {
        StoreOperation::Store => vk::AttachmentStoreOp::STORE,
        StoreOperation::DontCare => vk::AttachmentStoreOp::DONT_CARE,
    }
}

/// Derives native attachment descriptions from `config`.
pub fn derive_attachments(
    config: &RenderPassConfig,
    colour_format: vk::Format,
    depth_format: vk::Format,
    policy: AttachmentConflictPolicy,
) -> Result<RenderPassDesc> {
    let mut desc = RenderPassDesc {
        attachments: Vec::with_capacity(config.targets.attachments.len()),
        colour_refs: Vec::new(),
        depth_ref: None,
    };
    let flags = config.clear_flags;

    for (index, attachment) in config.targets.attachments.iter().enumerate() {
        let description = match attachment.kind {
            AttachmentKind::Colour => {
                let load_op = resolve_load_op(&config.name, index, flags.colour, attachment.load, policy)?;
                desc.colour_refs.push(index as u32);
                vk::AttachmentDescription {
                    format: colour_format,
                    samples: vk::SampleCountFlags::TYPE_1,
                    load_op,
                    store_op: store_op(attachment.store),
                    stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
                    stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
                    initial_layout: if load_op == vk::AttachmentLoadOp::LOAD {
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
                    } else {
                        vk::ImageLayout::UNDEFINED
                    },
                    final_layout: if attachment.present_after {
                        vk::ImageLayout::PRESENT_SRC_KHR
                    } else {
                        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
                    },
                    ..Default::default()
                }
            }
            AttachmentKind::Depth | AttachmentKind::Stencil => {
                if desc.depth_ref.is_some() {
                    return Err(Error::RenderPassConfig(format!(
                        "render pass '{}' declares more than one depth/stencil attachment",
                        config.name
                    )));
                }
                let load_op = resolve_load_op(&config.name, index, flags.depth, attachment.load, policy)?;
                let stencil_load_op = if flags.stencil {
                    vk::AttachmentLoadOp::CLEAR
                } else if attachment.load == LoadOperation::Load {
                    vk::AttachmentLoadOp::LOAD
                } else {
                    vk::AttachmentLoadOp::DONT_CARE
                };
                desc.depth_ref = Some(index as u32);
                vk::AttachmentDescription {
                    format: depth_format,
                    samples: vk::SampleCountFlags::TYPE_1,
                    load_op,
                    store_op: store_op(attachment.store),
                    stencil_load_op,
                    stencil_store_op: store_op(attachment.store),
                    initial_layout: if load_op == vk::AttachmentLoadOp::LOAD {
                        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
                    } else {
                        vk::ImageLayout::UNDEFINED
                    },
                    final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                    ..Default::default()
                }
            }
        };
        desc.attachments.push(description);
    }

    Ok(desc)
}

/// Clear values in attachment order.
pub fn clear_values(config: &RenderPassConfig) -> Vec<vk::ClearValue> {
    config
        .targets
        .attachments
        .iter()
        .map(|attachment| match attachment.kind {
            AttachmentKind::Colour => vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: config.clear_colour,
                },
            },
            AttachmentKind::Depth | AttachmentKind::Stencil => vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: config.depth,
                    stencil: config.stencil,
                },
            },
        })
        .collect()
}

/// A framebuffer binding concrete views to a pass.
pub struct RenderTarget<D: GpuDevice> {
    framebuffer: vk::Framebuffer,
    attachments: Vec<vk::ImageView>,
    extent: vk::Extent2D,
    device: Arc<D>,
}

impl<D: GpuDevice> RenderTarget<D> {
    pub fn new(device: Arc<D>, pass: vk::RenderPass, attachments: Vec<vk::ImageView>, extent: vk::Extent2D) -> Result<Self> {
        let framebuffer = device.create_framebuffer(pass, &attachments, extent)?;
        Ok(Self {
            framebuffer,
            attachments,
            extent,
            device,
        })
    }

    pub fn framebuffer(&self) -> vk::Framebuffer {
        self.framebuffer
    }

    pub fn attachments(&self) -> &[vk::ImageView] {
        &self.attachments
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }
}

impl<D: GpuDevice> Drop for RenderTarget<D> {
    fn drop(&mut self) {
        self.device.destroy_framebuffer(self.framebuffer);
    }
}

/// Views a pass's targets are built from.
pub struct TargetSources<'a> {
    pub swapchain_views: &'a [vk::ImageView],
    pub depth_view: Option<vk::ImageView>,
    /// Per target, one view per attachment with a `View` source, in attachment order.
    pub offscreen: &'a [Vec<vk::ImageView>],
    pub extent: vk::Extent2D,
}

pub struct RenderPass<D: GpuDevice> {
    handle: vk::RenderPass,
    config: RenderPassConfig,
    clear_values: Vec<vk::ClearValue>,
    targets: Vec<RenderTarget<D>>,
    device: Arc<D>,
}

impl<D: GpuDevice> RenderPass<D> {
    pub fn new(
        device: Arc<D>,
        config: RenderPassConfig,
        colour_format: vk::Format,
        policy: AttachmentConflictPolicy,
    ) -> Result<Self> {
        let desc = derive_attachments(&config, colour_format, device.info().depth_format, policy)?;
        let handle = device.create_render_pass(&desc)?;
        log::info!(
            "Created render pass '{}' with {} attachments",
            config.name,
            desc.attachments.len()
        );
        Ok(Self {
            handle,
            clear_values: clear_values(&config),
            config,
            targets: Vec::new(),
            device,
        })
    }

    pub fn handle(&self) -> vk::RenderPass {
        self.handle
    }

    pub fn config(&self) -> &RenderPassConfig {
        &self.config
    }

    pub fn clear_values(&self) -> &[vk::ClearValue] {
        &self.clear_values
    }

    pub fn targets(&self) -> &[RenderTarget<D>] {
        &self.targets
    }

    pub fn target(&self, index: usize) -> Option<&RenderTarget<D>> {
        self.targets.get(index)
    }

    /// Render area for `target`, expanding a zero-sized configured area to the target.
    pub fn render_area(&self, target: &RenderTarget<D>) -> vk::Rect2D {
        let [x, y, width, height] = self.config.render_area;
        if width == 0 || height == 0 {
            return vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: target.extent(),
            };
        }
        vk::Rect2D {
            offset: vk::Offset2D {
                x: x as i32,
                y: y as i32,
            },
            extent: vk::Extent2D { width, height },
        }
    }

    /// Destroys the framebuffers; the pass itself stays valid.
    pub fn clear_targets(&mut self) {
        self.targets.clear();
    }

    /// Drops every target and builds new ones from `sources`.
    pub fn regenerate_targets(&mut self, sources: &TargetSources<'_>) -> Result<()> {
        self.targets.clear();

        let count = if self.config.uses_default_source() {
            sources.swapchain_views.len()
        } else {
            self.config.targets.count
        };

        for target_index in 0..count {
            let mut views = Vec::with_capacity(self.config.targets.attachments.len());
            let mut offscreen = sources
                .offscreen
                .get(target_index)
                .map(|v| v.iter())
                .into_iter()
                .flatten();

            for attachment in &self.config.targets.attachments {
                let view = match (attachment.source, attachment.kind) {
                    (AttachmentSource::Default, AttachmentKind::Colour) => {
                        sources.swapchain_views.get(target_index).copied()
                    }
                    (AttachmentSource::Default, _) => sources.depth_view,
                    (AttachmentSource::View, _) => offscreen.next().copied(),
                };
                let view = view.ok_or_else(|| {
                    Error::RenderPassConfig(format!(
                        "render pass '{}' target {} is missing a {:?} attachment view",
                        self.config.name, target_index, attachment.kind
                    ))
                })?;
                views.push(view);
            }

            self.targets.push(RenderTarget::new(
                self.device.clone(),
                self.handle,
                views,
                sources.extent,
            )?);
        }

        log::debug!(
            "Regenerated {} render targets for pass '{}'",
            self.targets.len(),
            self.config.name
        );
        Ok(())
    }
}

impl<D: GpuDevice> Drop for RenderPass<D> {
    fn drop(&mut self) {
        // Framebuffers go before the pass they reference
        self.targets.clear();
        self.device.destroy_render_pass(self.handle);
    }
}

/// Tag type for render pass handles.
pub enum RenderPassSlot {}

pub type RenderPassHandle = Handle<RenderPassSlot>;

/// Render passes by name.
pub struct RenderPassRegistry<D: GpuDevice> {
    table: SlotTable<RenderPass<D>>,
    names: HashMap<String, RenderPassHandle>,
}

impl<D: GpuDevice> RenderPassRegistry<D> {
    pub fn new() -> Self {
        Self {
            table: SlotTable::with_capacity(MAX_RENDER_PASSES),
            names: HashMap::new(),
        }
    }

    pub fn insert(&mut self, pass: RenderPass<D>) -> Result<RenderPassHandle> {
        let name = pass.config.name.clone();
        if self.names.contains_key(&name) {
            return Err(Error::RenderPassConfig(format!("render pass '{}' already exists", name)));
        }
        let handle = self
            .table
            .insert(pass)
            .map_err(|_| Error::Exhausted("render pass table"))?
            .cast();
        self.names.insert(name, handle);
        Ok(handle)
    }

    pub fn find(&self, name: &str) -> Option<RenderPassHandle> {
        self.names.get(name).copied()
    }

    pub fn get(&self, handle: RenderPassHandle) -> Option<&RenderPass<D>> {
        self.table.get(handle.cast())
    }

    pub fn get_mut(&mut self, handle: RenderPassHandle) -> Option<&mut RenderPass<D>> {
        self.table.get_mut(handle.cast())
    }

    pub fn remove(&mut self, handle: RenderPassHandle) -> Option<RenderPass<D>> {
        let pass = self.table.remove(handle.cast())?;
        self.names.remove(&pass.config.name);
        Some(pass)
    }

    pub fn handles(&self) -> Vec<RenderPassHandle> {
        self.table.iter().map(|(handle, _)| handle.cast()).collect()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

impl<D: GpuDevice> Default for RenderPassRegistry<D> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORLD: &str = r#"
        name = "world"
        clear_colour = [0.0, 0.0, 0.2, 1.0]

        [clear_flags]
        colour = true
        depth = true

        [targets]
        attachments = [
            { kind = "colour", source = "default", load = "load", present_after = true },
            { kind = "depth", source = "default" },
        ]
    "#;

    fn derive(policy: AttachmentConflictPolicy) -> Result<RenderPassDesc> {
        let config = RenderPassConfig::from_toml_str(WORLD).unwrap();
        derive_attachments(&config, vk::Format::B8G8R8A8_UNORM, vk::Format::D32_SFLOAT, policy)
    }

    #[test]
    fn conflict_prefers_clear_by_default() {
        let desc = derive(AttachmentConflictPolicy::PreferClear).unwrap();
        let colour = desc.attachments[0];
        assert_eq!(colour.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(colour.initial_layout, vk::ImageLayout::UNDEFINED);
        assert_eq!(colour.final_layout, vk::ImageLayout::PRESENT_SRC_KHR);
        assert_eq!(desc.colour_refs, vec![0]);
        assert_eq!(desc.depth_ref, Some(1));
    }

    #[test]
    fn conflict_can_prefer_load() {
        let desc = derive(AttachmentConflictPolicy::PreferLoad).unwrap();
        let colour = desc.attachments[0];
        assert_eq!(colour.load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(colour.initial_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
    }

    #[test]
    fn conflict_can_be_rejected() {
        assert!(matches!(
            derive(AttachmentConflictPolicy::Reject),
            Err(Error::RenderPassConfig(_))
        ));
    }

    #[test]
    fn depth_and_stencil_ops() {
        let desc = derive(AttachmentConflictPolicy::PreferClear).unwrap();
        let depth = desc.attachments[1];
        assert_eq!(depth.format, vk::Format::D32_SFLOAT);
        assert_eq!(depth.load_op, vk::AttachmentLoadOp::CLEAR);
        assert_eq!(depth.stencil_load_op, vk::AttachmentLoadOp::DONT_CARE);
        assert_eq!(depth.final_layout, vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    }

    #[test]
    fn loaded_colour_without_clear_keeps_contents() {
        let config = RenderPassConfig::from_toml_str(
            r#"
            name = "ui"
            [targets]
            attachments = [{ kind = "colour", source = "default", load = "load" }]
            "#,
        )
        .unwrap();
        let desc = derive_attachments(
            &config,
            vk::Format::B8G8R8A8_UNORM,
            vk::Format::D32_SFLOAT,
            AttachmentConflictPolicy::Reject,
        )
        .unwrap();
        assert_eq!(desc.attachments[0].load_op, vk::AttachmentLoadOp::LOAD);
        assert_eq!(
            desc.attachments[0].final_layout,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(clear_values(&config).len(), 1);
    }
}
