// Frame lifecycle
//
// begin_frame / end_frame and the swapchain recreation they may trigger.
// The loop is single threaded; only resize notifications arrive from other
// threads, through a `ResizeHandle`.

use ash::vk;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::command::{BeginFlags, CommandBuffer, CommandBufferState};
use super::gpu::{AcquireOutcome, GpuDevice, PresentOutcome, QueueRole, Submission};
use super::renderpass::{RenderPassHandle, TargetSources};
use super::Backend;
use crate::context::RendererEvent;
use crate::error::{Error, Result};

/// Result of `begin_frame`. Anything but `Ready` means "skip this frame".
///
/// Swapchain recreation runs inside `begin_frame`/`end_frame` under the
/// backend's `&mut` borrow, so no caller can observe a rebuild in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// Recording has begun; draw, then call `end_frame`.
    Ready,
    /// The swapchain was rebuilt for a new framebuffer size.
    Resized,
    /// The framebuffer has a zero dimension; nothing can be presented.
    Minimized,
    /// Acquire reported the swapchain out of date; it has been rebuilt.
    SwapchainStale,
}

impl FrameStatus {
    pub fn is_ready(self) -> bool {
        self == FrameStatus::Ready
    }
}

struct ResizeState {
    generation: AtomicU64,
    size: Mutex<(u32, u32)>,
}

/// Delivers framebuffer size changes to the backend from any thread.
#[derive(Clone)]
pub struct ResizeHandle {
    state: Arc<ResizeState>,
}

impl ResizeHandle {
    pub(crate) fn new(width: u32, height: u32) -> Self {
        Self {
            state: Arc::new(ResizeState {
                generation: AtomicU64::new(0),
                size: Mutex::new((width, height)),
            }),
        }
    }

    /// Records the new size and bumps the size generation.
    pub fn resized(&self, width: u32, height: u32) {
        *self.state.size.lock() = (width, height);
        self.state.generation.fetch_add(1, Ordering::AcqRel);
        log::debug!("Framebuffer resized to {}x{}", width, height);
    }

    pub fn generation(&self) -> u64 {
        self.state.generation.load(Ordering::Acquire)
    }

    pub fn size(&self) -> (u32, u32) {
        *self.state.size.lock()
    }
}

impl<D: GpuDevice> Backend<D> {
    /// Starts a frame.
    ///
    /// Waits on the current slot's fence (backpressure), acquires a swap image,
    /// waits on whichever fence still owns that image, then resets and begins
    /// the image's command buffer. Resize and staleness are reported through
    /// [`FrameStatus`], never as errors.
    pub fn begin_frame(&mut self, delta_time: f32) -> Result<FrameStatus> {
        if self.frame_active {
            return Err(Error::InvalidState(
                "begin_frame called while a frame is in progress".to_string(),
            ));
        }
        self.delta_time = delta_time;

        let (width, height) = self.resize.size();
        if width == 0 || height == 0 {
            return Ok(FrameStatus::Minimized);
        }

        let generation = self.resize.generation();
        if generation != self.last_generation {
            self.device.wait_idle()?;
            self.recreate_swapchain(width, height, generation)?;
            return Ok(FrameStatus::Resized);
        }

        let slot = self.current_frame;
        let timeout = self.fence_timeout_ns;

        // Step 1: The slot's previous submission must be done
        self.sync.wait_frame(slot, timeout)?;

        // Step 2: Acquire the next swap image
        let acquired = self.swapchain.acquire_next_image(
            timeout,
            self.sync.image_available(slot),
            vk::Fence::null(),
        )?;
        let image_index = match acquired {
            AcquireOutcome::Acquired { index, suboptimal } => {
                if suboptimal {
                    log::debug!("Acquired image {} from a suboptimal swapchain", index);
                }
                index
            }
            AcquireOutcome::OutOfDate => {
                log::info!("Swapchain out of date at acquire, recreating");
                self.recreate_swapchain(width, height, generation)?;
                return Ok(FrameStatus::SwapchainStale);
            }
        };
        self.image_index = image_index;

        // Step 3: The image's command buffer may still belong to an older frame
        if let Err(e) = self.sync.wait_image(image_index as usize, timeout) {
            // The acquire signaled image_available and no submit will consume it
            self.sync.replace_image_available(slot)?;
            return Err(e);
        }

        // Step 4: Reset and begin recording
        let cmd = &mut self.command_buffers[image_index as usize];
        cmd.reset()?;
        cmd.begin(BeginFlags::default())?;

        // Step 5: Dynamic state from the current framebuffer size
        let extent = self.swapchain.extent();
        self.device.cmd_set_viewport(
            cmd.handle(),
            vk::Viewport {
                x: 0.0,
                y: 0.0,
                width: extent.width as f32,
                height: extent.height as f32,
                min_depth: 0.0,
                max_depth: 1.0,
            },
        );
        self.device.cmd_set_scissor(
            cmd.handle(),
            vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
        );

        self.frame_active = true;
        Ok(FrameStatus::Ready)
    }

    /// Ends recording, submits and presents the frame begun by `begin_frame`.
    pub fn end_frame(&mut self, delta_time: f32) -> Result<()> {
        if !self.frame_active {
            return Err(Error::InvalidState("end_frame called without begin_frame".to_string()));
        }
        self.frame_active = false;
        self.delta_time = delta_time;

        let slot = self.current_frame;
        let image = self.image_index as usize;
        let timeout = self.fence_timeout_ns;
        let cmd = &mut self.command_buffers[image];

        if cmd.state() == CommandBufferState::InRenderPass {
            log::warn!("end_frame closed a render pass that was left open");
            cmd.end_render_pass()?;
        }
        cmd.end()?;

        // Already waited in begin_frame; a no-op unless ownership changed since
        self.sync.wait_image(image, timeout)?;
        self.sync.claim_image(image, slot);
        self.sync.reset_frame(slot)?;

        self.device.queue_submit(
            QueueRole::Graphics,
            &Submission {
                command_buffer: cmd.handle(),
                wait: Some((
                    self.sync.image_available(slot),
                    vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                )),
                signal: Some(self.sync.queue_complete(slot)),
                fence: Some(self.sync.fence(slot).handle()),
            },
        )?;
        cmd.mark_submitted()?;

        let outcome = self
            .swapchain
            .present(self.image_index, self.sync.queue_complete(slot))?;

        self.current_frame = (slot + 1) % self.sync.frames_in_flight();
        self.frame_number += 1;

        match outcome {
            PresentOutcome::Presented => Ok(()),
            PresentOutcome::Suboptimal | PresentOutcome::OutOfDate => {
                log::info!("Swapchain {:?} at present, recreating", outcome);
                let (width, height) = self.resize.size();
                if width == 0 || height == 0 {
                    return Ok(());
                }
                let generation = self.resize.generation();
                self.recreate_swapchain(width, height, generation)
            }
        }
    }

    /// Rebuilds the swapchain and everything sized by it.
    ///
    /// `current_frame` keeps counting across the rebuild; the in-flight fences
    /// are untouched, only image ownership is forgotten.
    fn recreate_swapchain(&mut self, width: u32, height: u32, generation: u64) -> Result<()> {
        let result = self.rebuild_swapchain(width, height, generation);
        if let Err(e) = &result {
            log::error!("Swapchain recreation failed: {}", e);
        }
        result
    }

    fn rebuild_swapchain(&mut self, width: u32, height: u32, generation: u64) -> Result<()> {
        self.device.wait_idle()?;

        // Framebuffers reference the old views
        for handle in self.render_passes.handles() {
            if let Some(pass) = self.render_passes.get_mut(handle) {
                if pass.config().uses_default_source() {
                    pass.clear_targets();
                }
            }
        }

        self.swapchain.recreate(width, height)?;
        let image_count = self.swapchain.image_count();
        self.sync.reset_images(image_count);

        self.command_buffers.clear();
        for _ in 0..image_count {
            self.command_buffers
                .push(CommandBuffer::allocate(self.device.clone(), true)?);
        }

        self.regenerate_window_targets()?;
        self.last_generation = generation;

        let extent = self.swapchain.extent();
        self.context
            .events
            .emit(RendererEvent::DefaultRenderTargetsRefreshRequired {
                width: extent.width,
                height: extent.height,
            });
        Ok(())
    }

    /// Rebuilds targets of passes whose attachments all come from the swapchain.
    pub(super) fn regenerate_window_targets(&mut self) -> Result<()> {
        let sources = TargetSources {
            swapchain_views: self.swapchain.image_views(),
            depth_view: self.swapchain.depth_view(),
            offscreen: &[],
            extent: self.swapchain.extent(),
        };
        for handle in self.render_passes.handles() {
            if let Some(pass) = self.render_passes.get_mut(handle) {
                if pass.config().is_window_bound() {
                    pass.regenerate_targets(&sources)?;
                }
            }
        }
        Ok(())
    }

    /// Begins `pass` on target `target_index` in the current frame's command buffer.
    pub fn begin_render_pass(&mut self, pass: RenderPassHandle, target_index: usize) -> Result<()> {
        let cmd = self.frame_command_buffer_index()?;
        let render_pass = self
            .render_passes
            .get(pass)
            .ok_or_else(|| Error::InvalidHandle(format!("render pass {:?}", pass)))?;
        let target = render_pass.target(target_index).ok_or_else(|| {
            Error::InvalidState(format!(
                "render pass '{}' has no target {}",
                render_pass.config().name,
                target_index
            ))
        })?;
        let area = render_pass.render_area(target);
        self.command_buffers[cmd].begin_render_pass(
            render_pass.handle(),
            target.framebuffer(),
            area,
            render_pass.clear_values(),
        )
    }

    pub fn end_render_pass(&mut self) -> Result<()> {
        let cmd = self.frame_command_buffer_index()?;
        self.command_buffers[cmd].end_render_pass()
    }

    fn frame_command_buffer_index(&self) -> Result<usize> {
        if !self.frame_active {
            return Err(Error::InvalidState("no frame is being recorded".to_string()));
        }
        Ok(self.image_index as usize)
    }

    /// Command buffer of the frame being recorded.
    pub fn current_command_buffer(&self) -> Option<vk::CommandBuffer> {
        self.frame_active
            .then(|| self.command_buffers[self.image_index as usize].handle())
    }

    pub fn resized(&self, width: u32, height: u32) {
        self.resize.resized(width, height);
    }

    pub fn resize_handle(&self) -> ResizeHandle {
        self.resize.clone()
    }

    pub fn framebuffer_size(&self) -> (u32, u32) {
        self.resize.size()
    }

    pub fn frame_in_progress(&self) -> bool {
        self.frame_active
    }

    /// Frame slot the next `begin_frame` uses.
    pub fn current_frame(&self) -> usize {
        self.current_frame
    }

    /// Frames presented so far.
    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn delta_time(&self) -> f32 {
        self.delta_time
    }

    pub fn frames_in_flight(&self) -> usize {
        self.sync.frames_in_flight()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resize_handle_bumps_generation() {
        let handle = ResizeHandle::new(800, 600);
        let other = handle.clone();
        assert_eq!(handle.generation(), 0);

        other.resized(1024, 768);
        assert_eq!(handle.generation(), 1);
        assert_eq!(handle.size(), (1024, 768));
    }

    #[test]
    fn only_ready_is_ready() {
        assert!(FrameStatus::Ready.is_ready());
        for status in [
            FrameStatus::Resized,
            FrameStatus::Minimized,
            FrameStatus::SwapchainStale,
        ] {
            assert!(!status.is_ready());
        }
    }
}
